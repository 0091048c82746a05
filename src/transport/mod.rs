//! The `transport` module is responsible for network communication with
//! publishers and subscribers over WebSockets.
//!
//! It defines the binary wire codec for multi-frame messages and implements
//! the two listening endpoints, their accept loops, and per-connection tasks
//! that feed the relay engine.

pub mod message;
pub mod websocket;

pub use websocket::{Endpoints, bind_and_run, run_relay};

#[cfg(test)]
mod tests;
