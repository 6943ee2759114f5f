//! Garage opener BLE core.
//!
//! Discovers, connects to, and maintains a link with a single known
//! garage-door peripheral, exposing lifecycle events and a "ready to send
//! command" contract to frontends. The library is split into a `domain`
//! layer (pure data and signal-quality logic) and an `infrastructure` layer
//! (the connection state machine and the BLE adapter binding).

pub mod domain;
pub mod infrastructure;
