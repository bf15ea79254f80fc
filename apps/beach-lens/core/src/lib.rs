//! Shared primitives for Beach Lens.
//!
//! - [`LinkStore`]: capability-style grants that let an unauthenticated
//!   request reach one stream a bounded number of times.
//! - [`PathSigner`]: HS256 tokens bound to a single request path.

pub mod link;
pub mod signing;

pub use link::{LinkEntry, LinkError, LinkStore, LinkTarget, EPHEMERAL_LINK_TTL_SECS};
pub use signing::{PathSigner, SignatureError, SIGN_QUERY_PARAM};
