//! Adapter seam between the connection state machine and the platform BLE
//! stack.
//!
//! The manager only ever talks to [`BleAdapter`]; completions and unsolicited
//! platform callbacks arrive as [`AdapterEvent`] values on a channel. This
//! keeps the state machine testable with a scripted adapter and collapses the
//! platform's wide delegate surface into the handful of events actually used.

use crate::domain::models::{AdapterState, PeripheralRef};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Everything the platform BLE stack reports back to the state machine.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Adapter power/authorization state changed.
    StateChanged(AdapterState),
    /// An advertisement matching the scan filter was received.
    DeviceDiscovered { peripheral: PeripheralRef, rssi: i16 },
    /// A requested connection completed.
    Connected { peripheral: PeripheralRef },
    /// A requested connection failed.
    ConnectFailed {
        peripheral: PeripheralRef,
        reason: String,
    },
    /// The link to a peripheral dropped (requested or not).
    Disconnected { peripheral: PeripheralRef },
    /// Service discovery completed (or failed, with `error` set).
    ServicesDiscovered {
        peripheral: PeripheralRef,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    /// Characteristic discovery completed (or failed, with `error` set).
    CharacteristicsDiscovered {
        peripheral: PeripheralRef,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    /// A requested RSSI read completed.
    RssiRead { peripheral: PeripheralRef, rssi: i16 },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),
    #[error("characteristic {0} not present on peripheral")]
    CharacteristicNotFound(Uuid),
    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

/// Commands the state machine issues against the platform BLE stack.
///
/// All calls are request-style: they return once the request is handed to
/// the backend, and the outcome arrives later as an [`AdapterEvent`]. An
/// `Err` means the request could not even be issued (stale handle, backend
/// refusal) and is handled by the manager's reset/rescan path.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Snapshot of the adapter power state.
    async fn state(&self) -> AdapterState;

    /// Start scanning, filtered by the given service UUID.
    async fn start_scan(&self, service: Uuid) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    async fn connect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError>;

    async fn disconnect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError>;

    /// Request GATT service discovery scoped to the given service.
    async fn discover_services(
        &self,
        peripheral: &PeripheralRef,
        service: Uuid,
    ) -> Result<(), AdapterError>;

    /// Request characteristic discovery for the given characteristics of a
    /// previously discovered service.
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralRef,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), AdapterError>;

    /// Enable notifications on a characteristic.
    async fn subscribe(
        &self,
        peripheral: &PeripheralRef,
        characteristic: Uuid,
    ) -> Result<(), AdapterError>;

    /// Fire-and-forget write (no response requested from the peripheral).
    async fn write_without_response(
        &self,
        peripheral: &PeripheralRef,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), AdapterError>;

    /// Request an RSSI read; completion arrives as [`AdapterEvent::RssiRead`].
    async fn read_rssi(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError>;

    /// Whether the backend currently reports this peripheral as connected.
    /// A stale handle reads as not connected.
    async fn is_connected(&self, peripheral: &PeripheralRef) -> bool;
}
