//! Service-to-service auth
//!
//! Knot and spindle RPCs are authorized by short-lived JWTs the user's PDS
//! mints on their behalf: audience-bound to the one service, method-bound to
//! the one lexicon, and expiring within seconds. The appview never signs
//! these itself and never caches them; a token backs exactly one RPC.

use crate::error::{AppError, AppResult};
use crate::services::pds::PdsClient;
use chrono::Utc;

/// Hard ceiling on requested token lifetime.
const MAX_EXP_SECONDS: i64 = 120;

#[derive(Debug, Clone, Copy)]
pub struct ServiceAuthMinter {
    default_exp_seconds: i64,
}

impl Default for ServiceAuthMinter {
    fn default() -> Self {
        Self {
            default_exp_seconds: 60,
        }
    }
}

/// Services are addressed as `did:web:<host>`; a port, when present, is
/// percent-encoded per the did:web method.
pub fn audience_did(host: &str) -> String {
    format!("did:web:{}", host.replace(':', "%3A"))
}

impl ServiceAuthMinter {
    pub async fn mint(
        &self,
        pds: &PdsClient,
        audience_host: &str,
        lexicon_method: &str,
        exp_seconds: Option<i64>,
    ) -> AppResult<String> {
        let exp_seconds = exp_seconds
            .unwrap_or(self.default_exp_seconds)
            .clamp(1, MAX_EXP_SECONDS);
        let aud = audience_did(audience_host);
        let exp = Utc::now().timestamp() + exp_seconds;
        tracing::debug!(aud = %aud, lxm = lexicon_method, "minting service token");
        pds.get_service_auth(&aud, lexicon_method, exp)
            .await
            .map_err(|e| match e {
                AppError::NotAuthenticated => AppError::NotAuthenticated,
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_encodes_ports() {
        assert_eq!(audience_did("knot.example.com"), "did:web:knot.example.com");
        assert_eq!(
            audience_did("knot.example.com:8443"),
            "did:web:knot.example.com%3A8443"
        );
    }
}
