//! Data types for the appview
//!
//! Sessions and OAuth state, federated record variants, and the wire
//! projections returned by knot and spindle RPCs.

pub mod knot;
pub mod records;
pub mod types;

pub use knot::*;
pub use records::*;
pub use types::*;
