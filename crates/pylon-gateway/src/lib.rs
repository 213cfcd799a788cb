//! Loopback callback endpoint through which workers push results to the host.
pub mod callback_endpoint;

pub use callback_endpoint::*;
