//! Bluetooth Module
//!
//! BLE discovery, connection, and command delivery for the garage door
//! controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (state machine - scan/connect/recover, emits events)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │ Adapter   │  │  Session   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - trait   │  │ - GATT     │  │ - UUIDs  │
//! │ - btleplug│  │   discovery│  │ - open   │
//! │   binding │  │ - commands │  │   payload│
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Door controller identity and command payloads
//! - [`adapter`] - Platform-neutral adapter trait and event model
//! - [`central`] - Production adapter on btleplug
//! - [`session`] - Per-connection GATT session
//! - [`manager`] - The connection state machine

pub mod adapter;
pub mod central;
pub mod manager;
pub mod protocol;
pub mod session;

// Re-export the main surface for convenience
pub use adapter::{AdapterEvent, BleAdapter};
pub use manager::{AppSignal, ConnectionManager, ManagerConfig, ManagerHandle};
pub use session::{ServiceSession, SessionError};
