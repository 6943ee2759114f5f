//! Per-connection GATT session.
//!
//! Created by the manager once the OS reports a peripheral connected;
//! drives service/characteristic discovery and holds the resulting handles
//! for as long as the connection lasts. Dropped on disconnect or reset —
//! it never outlives its peripheral's connection.

use crate::domain::models::{ManagerEvent, MessageSeverity, PeripheralRef, StatusMessage};
use crate::infrastructure::bluetooth::adapter::{AdapterError, BleAdapter};
use crate::infrastructure::bluetooth::protocol::PeripheralIdentity;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Command attempted before discovery finished or after disconnect.
    #[error("session not ready; no write characteristic bound")]
    NotReady,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub struct ServiceSession {
    adapter: Arc<dyn BleAdapter>,
    peripheral: PeripheralRef,
    identity: PeripheralIdentity,
    events: mpsc::UnboundedSender<ManagerEvent>,
    write_characteristic: Option<Uuid>,
    notify_characteristic: Option<Uuid>,
    ready_announced: bool,
}

impl ServiceSession {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        peripheral: PeripheralRef,
        identity: PeripheralIdentity,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            adapter,
            peripheral,
            identity,
            events,
            write_characteristic: None,
            notify_characteristic: None,
            ready_announced: false,
        }
    }

    pub fn peripheral(&self) -> &PeripheralRef {
        &self.peripheral
    }

    /// Both characteristics discovered and bound.
    pub fn is_ready(&self) -> bool {
        self.write_characteristic.is_some() && self.notify_characteristic.is_some()
    }

    /// Kick off discovery of the single known service.
    pub async fn start_discovering_services(&self) -> Result<(), AdapterError> {
        info!(peripheral = %self.peripheral.id, "starting service discovery");
        self.adapter
            .discover_services(&self.peripheral, self.identity.service)
            .await
    }

    /// Handle a service-discovery completion. On success, requests
    /// characteristic discovery for exactly the write/notify pair. On error
    /// or an empty result, emits a diagnostic and stops — the manager's
    /// disconnect/rescan cycle recovers; this component does not self-retry.
    pub async fn on_services_discovered(&mut self, services: &[Uuid], error: Option<&str>) {
        if let Some(err) = error {
            warn!(peripheral = %self.peripheral.id, error = err, "service discovery failed");
            self.diagnostic(format!("Service discovery failed: {err}"));
            return;
        }
        if services.is_empty() {
            warn!(peripheral = %self.peripheral.id, "service discovery returned no services");
            self.diagnostic("Got no services".to_string());
            return;
        }

        if !services.contains(&self.identity.service) {
            warn!(peripheral = %self.peripheral.id, "expected service not present");
            self.diagnostic("Door service not found on device".to_string());
            return;
        }

        if let Err(err) = self
            .adapter
            .discover_characteristics(
                &self.peripheral,
                self.identity.service,
                &self.identity.characteristic_uuids(),
            )
            .await
        {
            warn!(%err, "characteristic discovery request failed");
            self.diagnostic(format!("Characteristic discovery failed: {err}"));
        }
    }

    /// Handle a characteristic-discovery completion. Matches each returned
    /// characteristic against the two known UUIDs, stores the handle, and
    /// enables notifications on it. An unrecognized characteristic aborts the
    /// batch — unexpected GATT layout. Returns `true` exactly once: when both
    /// handles are in place and the session just became ready.
    pub async fn on_characteristics_discovered(
        &mut self,
        characteristics: &[Uuid],
        error: Option<&str>,
    ) -> bool {
        if let Some(err) = error {
            warn!(peripheral = %self.peripheral.id, error = err, "characteristic discovery failed");
            self.diagnostic(format!("Characteristic discovery failed: {err}"));
            return false;
        }

        for &uuid in characteristics {
            if uuid == self.identity.write_characteristic {
                self.write_characteristic = Some(uuid);
            } else if uuid == self.identity.notify_characteristic {
                self.notify_characteristic = Some(uuid);
            } else {
                warn!(peripheral = %self.peripheral.id, characteristic = %uuid,
                    "unexpected characteristic, aborting discovery batch");
                return false;
            }

            if let Err(err) = self.adapter.subscribe(&self.peripheral, uuid).await {
                warn!(%err, characteristic = %uuid, "failed to enable notifications");
            }
        }

        if self.is_ready() && !self.ready_announced {
            self.ready_announced = true;
            info!(peripheral = %self.peripheral.id, "both characteristics bound, session ready");
            return true;
        }
        false
    }

    /// Write a command payload to the write characteristic, fire-and-forget.
    pub async fn write_command(&self, payload: &[u8]) -> Result<(), SessionError> {
        let characteristic = self.write_characteristic.ok_or(SessionError::NotReady)?;
        if !self.adapter.is_connected(&self.peripheral).await {
            return Err(SessionError::NotReady);
        }
        self.adapter
            .write_without_response(&self.peripheral, characteristic, payload)
            .await?;
        Ok(())
    }

    /// Request an RSSI read if the peripheral is still connected. The
    /// completion is delivered as an adapter event and state-checked again
    /// there, so a disconnect in flight never reports stale signal data.
    pub async fn read_signal_strength(&self) {
        if !self.adapter.is_connected(&self.peripheral).await {
            return;
        }
        if let Err(err) = self.adapter.read_rssi(&self.peripheral).await {
            warn!(%err, "RSSI read request failed");
        }
    }

    fn diagnostic(&self, message: String) {
        let _ = self.events.send(ManagerEvent::Status(StatusMessage::new(
            message,
            MessageSeverity::Warning,
        )));
    }
}
