//! Extension execution runtime for Pylon.
//!
//! Spawns, supervises, and tears down extension worker processes, multiplexes
//! concurrent invocations through per-invocation channels, and exposes the
//! invalidation hooks that force persistent workers to respawn.
//!
//! ## Invocation flow
//!
//! 1. `DispatchRouter::on_receive` opens an `InvocationChannel` for the request
//! 2. The matching `ExtensionHandler` spawns or reuses a worker and feeds it
//! 3. Workers report results through the callback endpoint, which resolves the
//!    channel with `DispatchRouter::get_channel`
//! 4. The channel delivers exactly one terminal response and unregisters itself

use std::sync::{Mutex, MutexGuard};

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod invalidation;
pub mod router;
pub mod runner_script;
pub mod supervisor;

pub use channel::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use invalidation::*;
pub use router::*;
pub use runner_script::*;
pub use supervisor::*;

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
