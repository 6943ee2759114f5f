//! btleplug-backed [`BleAdapter`].
//!
//! Bridges the platform BLE central into the adapter-event contract: an
//! event pump translates `CentralEvent`s, and request methods either spawn
//! their completion (connect, discovery, RSSI reads) or finish inline
//! (subscribe, write). Peripheral objects are cached by id so the core can
//! keep working with plain string references.

use crate::domain::models::{AdapterState, PeripheralRef};
use crate::domain::signal;
use crate::infrastructure::bluetooth::adapter::{AdapterError, AdapterEvent, BleAdapter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

struct CachedPeripheral {
    peripheral: Peripheral,
    name: Option<String>,
}

pub struct CentralAdapter {
    central: Adapter,
    peripherals: Mutex<HashMap<String, CachedPeripheral>>,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl CentralAdapter {
    /// Bind the first available system adapter and start the event pump.
    pub async fn new(events: mpsc::UnboundedSender<AdapterEvent>) -> Result<Arc<Self>> {
        let manager = Manager::new().await.context("create BLE manager")?;
        let central = manager
            .adapters()
            .await
            .context("list BLE adapters")?
            .into_iter()
            .next()
            .context("no bluetooth adapter found")?;

        let adapter = Arc::new(Self {
            central,
            peripherals: Mutex::new(HashMap::new()),
            events,
        });
        adapter.clone().spawn_event_pump().await?;
        Ok(adapter)
    }

    async fn spawn_event_pump(self: Arc<Self>) -> Result<()> {
        let mut stream = self
            .central
            .events()
            .await
            .context("subscribe to adapter events")?;
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                self.dispatch(event).await;
            }
            debug!("adapter event stream ended");
        });
        Ok(())
    }

    async fn dispatch(&self, event: CentralEvent) {
        match event {
            CentralEvent::StateUpdate(state) => {
                self.emit(AdapterEvent::StateChanged(map_state(state)));
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                self.on_device_seen(id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                let peripheral = self.make_ref(&id);
                self.emit(AdapterEvent::Connected { peripheral });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let peripheral = self.make_ref(&id);
                self.emit(AdapterEvent::Disconnected { peripheral });
            }
            _ => {}
        }
    }

    /// Cache the platform peripheral and report the advertisement. A missing
    /// RSSI maps to the 127 sentinel, which the signal filter rejects.
    async fn on_device_seen(&self, id: PeripheralId) {
        let Ok(peripheral) = self.central.peripheral(&id).await else {
            return;
        };
        let properties = peripheral.properties().await.ok().flatten();
        let name = properties.as_ref().and_then(|p| p.local_name.clone());
        let rssi = properties
            .as_ref()
            .and_then(|p| p.rssi)
            .unwrap_or(signal::RSSI_UNAVAILABLE);

        {
            let mut cache = self.peripherals.lock().unwrap();
            cache.insert(
                id.to_string(),
                CachedPeripheral {
                    peripheral,
                    name: name.clone(),
                },
            );
        }

        self.emit(AdapterEvent::DeviceDiscovered {
            peripheral: PeripheralRef::new(id.to_string(), name),
            rssi,
        });
    }

    fn make_ref(&self, id: &PeripheralId) -> PeripheralRef {
        let name = self
            .peripherals
            .lock()
            .unwrap()
            .get(&id.to_string())
            .and_then(|cached| cached.name.clone());
        PeripheralRef::new(id.to_string(), name)
    }

    fn lookup(&self, peripheral: &PeripheralRef) -> Result<Peripheral, AdapterError> {
        self.peripherals
            .lock()
            .unwrap()
            .get(&peripheral.id)
            .map(|cached| cached.peripheral.clone())
            .ok_or_else(|| AdapterError::UnknownPeripheral(peripheral.id.clone()))
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: Uuid,
) -> Result<Characteristic, AdapterError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(AdapterError::CharacteristicNotFound(uuid))
}

fn backend(err: btleplug::Error) -> AdapterError {
    AdapterError::Backend(err.to_string())
}

fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[async_trait]
impl BleAdapter for CentralAdapter {
    async fn state(&self) -> AdapterState {
        match self.central.adapter_state().await {
            Ok(state) => map_state(state),
            Err(err) => {
                warn!(%err, "failed to read adapter state");
                AdapterState::Unknown
            }
        }
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), AdapterError> {
        self.central
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(backend)
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.central.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            // Success surfaces as a DeviceConnected central event.
            if let Err(err) = platform.connect().await {
                let _ = events.send(AdapterEvent::ConnectFailed {
                    peripheral,
                    reason: err.to_string(),
                });
            }
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        platform.disconnect().await.map_err(backend)
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralRef,
        _service: Uuid,
    ) -> Result<(), AdapterError> {
        // The backend discovers the full GATT database; the session filters
        // down to the one service it cares about.
        let platform = self.lookup(peripheral)?;
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            match platform.discover_services().await {
                Ok(()) => {
                    let services: Vec<Uuid> =
                        platform.services().iter().map(|s| s.uuid).collect();
                    let _ = events.send(AdapterEvent::ServicesDiscovered {
                        peripheral,
                        services,
                        error: None,
                    });
                }
                Err(err) => {
                    let _ = events.send(AdapterEvent::ServicesDiscovered {
                        peripheral,
                        services: Vec::new(),
                        error: Some(err.to_string()),
                    });
                }
            }
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralRef,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        let found = match platform.services().into_iter().find(|s| s.uuid == service) {
            Some(svc) => svc
                .characteristics
                .iter()
                .filter(|c| characteristics.contains(&c.uuid))
                .map(|c| c.uuid)
                .collect(),
            None => {
                self.emit(AdapterEvent::CharacteristicsDiscovered {
                    peripheral: peripheral.clone(),
                    characteristics: Vec::new(),
                    error: Some("service not present after discovery".to_string()),
                });
                return Ok(());
            }
        };
        self.emit(AdapterEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            characteristics: found,
            error: None,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralRef,
        characteristic: Uuid,
    ) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        let characteristic = find_characteristic(&platform, characteristic)?;
        platform.subscribe(&characteristic).await.map_err(backend)
    }

    async fn write_without_response(
        &self,
        peripheral: &PeripheralRef,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        let characteristic = find_characteristic(&platform, characteristic)?;
        platform
            .write(&characteristic, payload, WriteType::WithoutResponse)
            .await
            .map_err(backend)
    }

    async fn read_rssi(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
        let platform = self.lookup(peripheral)?;
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            // A missing RSSI is dropped, not forwarded as the sentinel.
            if let Ok(Some(properties)) = platform.properties().await {
                if let Some(rssi) = properties.rssi {
                    let _ = events.send(AdapterEvent::RssiRead { peripheral, rssi });
                }
            }
        });
        Ok(())
    }

    async fn is_connected(&self, peripheral: &PeripheralRef) -> bool {
        match self.lookup(peripheral) {
            Ok(platform) => platform.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
