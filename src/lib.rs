//! # mqrelay
//!
//! `mqrelay` is a standalone publish/subscribe forwarding relay. Publishers
//! connect to the frontend endpoint and send multi-frame messages whose first
//! frame is the topic; subscribers connect to the backend endpoint, register
//! topic prefixes with subscribe/unsubscribe control frames, and receive every
//! message whose topic starts with one of their prefixes. Subscription
//! interest is aggregated and forwarded to publishers so they can skip topics
//! nobody wants.
//!
//! ## Core Modules
//!
//! - `config`: resolves the two endpoint addresses and loads runtime settings.
//! - `relay`: connection registry, subscription reference counts and fan-out.
//! - `transport`: the WebSocket endpoints, wire codec and forwarding loop.
//! - `utils`: error type and logging.

pub mod config;
pub mod relay;
pub mod transport;
pub mod utils;
