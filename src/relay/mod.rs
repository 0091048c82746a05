//! The `relay` module is the forwarding core: the connection registry,
//! subscription tracking and fan-out between the two endpoints.

pub mod engine;
pub mod message;
pub mod peer;
pub mod subscription;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use engine::Relay;

/// The relay as shared by every connection task.
pub type SharedRelay = Arc<Mutex<Relay>>;

pub fn shared() -> SharedRelay {
    Arc::new(Mutex::new(Relay::new()))
}

/// Lock the relay, ignoring poisoning.
pub fn lock(relay: &SharedRelay) -> MutexGuard<'_, Relay> {
    relay.lock().unwrap_or_else(PoisonError::into_inner)
}
