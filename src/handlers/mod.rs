//! Request handlers
//!
//! Thin JSON layers over the session service, write coordinator and read
//! aggregator. Page rendering lives elsewhere; everything here speaks JSON.

pub mod labels;
pub mod oauth;
pub mod repos;
