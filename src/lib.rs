//! tangled appview
//!
//! The appview tier of the tangled federation: it authenticates browsing
//! users against their PDS with DPoP-bound OAuth sessions, turns their UI
//! actions into coordinated three-party writes (index + PDS record + knot or
//! spindle RPC, with compensation), assembles the repo landing view from
//! parallel remote queries, and keeps a local index converged by consuming
//! every relevant host's event feed.

pub mod config;
pub mod error;
pub mod handlers;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rbac;
pub mod read;
pub mod routes;
pub mod services;
pub mod tid;
pub mod validate;
pub mod write;

pub use config::{AppConfig, AppState};
pub use error::{AppError, AppResult};
