//! Commit signature verification
//!
//! Registered signing keys are OpenSSH public keys; commits signed with git's
//! SSH signing (`SSHSIG` armor) verify against them over the payload the knot
//! ships alongside the signature. Anything else (PGP, unknown armor, no
//! registered key) resolves to unverified.

use ssh_key::{PublicKey, SshSig};

/// Namespace fixed by git's SSH signing.
const GIT_NAMESPACE: &str = "git";

pub fn verify_commit_signature(payload: &str, signature: &str, keys: &[String]) -> bool {
    let sig = match SshSig::from_pem(signature.as_bytes()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    keys.iter().any(|raw| {
        PublicKey::from_openssh(raw)
            .map(|key| key.verify(GIT_NAMESPACE, payload.as_bytes(), &sig).is_ok())
            .unwrap_or(false)
    })
}
