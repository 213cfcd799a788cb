//! Wire types shared across Pylon crates.
//!
//! Covers the inbound invocation request read from the host transport, the
//! outbound response envelope, and the callback payload that extension workers
//! post back to the callback endpoint.

pub mod callback;
pub mod extension_kind;
pub mod invocation;
pub mod response;

pub use callback::*;
pub use extension_kind::*;
pub use invocation::*;
pub use response::*;
