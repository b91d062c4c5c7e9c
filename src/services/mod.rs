//! Services module
//!
//! The session substrate and every outbound client: OAuth flow, DPoP-signed
//! PDS access, service-token minting, knot/spindle RPCs, identity
//! resolution, and the shared cache.

mod cache;
mod crypto;
mod identity;
pub(crate) mod jwt;
mod knot;
pub(crate) mod oauth;
mod pds;
mod service_auth;
mod sessions;
mod ssrf;

pub use cache::Cache;
pub use crypto::{KeyStore, ACTIVE_KID};
pub use identity::{HttpIdentityResolver, IdentityResolver, StaticIdentityResolver};
pub use knot::KnotClient;
pub use oauth::{AuthServerMetadata, CallbackParams, OAuthService, RefreshOutcome};
pub use pds::{GetRecordOutput, PdsClient, PutRecordOutput};
pub use service_auth::{audience_did, ServiceAuthMinter};
pub use sessions::{
    is_session_expired, session_ttl_seconds, SessionLimits, SessionLookup, SessionService,
    SessionStore,
};
pub use ssrf::{validate_remote_host, validate_remote_url};
