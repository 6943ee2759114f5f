//! Garage opener BLE protocol
//!
//! UUID constants for the door controller's GATT layout and the open-command
//! payload format.

use anyhow::{Context, Result};
use uuid::Uuid;

/// UART-style service exposed by the door controller.
pub const SERVICE_UUID: &str = "713d0000-503e-4c75-ba94-3148f18d941e";

/// Identifier of the one physical device this app should ever connect to.
/// The scan filters by service UUID, which may match decoys; this is the
/// authoritative match.
pub const DEVICE_IDENTIFIER: &str = "535e0d00-7abe-e6bd-2d0f-97d539053fb0";

/// Characteristic commands are written to (without response).
pub const WRITE_CHAR_UUID: &str = "713d0003-503e-4c75-ba94-3148f18d941e";

/// Characteristic the controller notifies on.
pub const NOTIFY_CHAR_UUID: &str = "713d0002-503e-4c75-ba94-3148f18d941e";

/// Leading byte of the open command. The firmware expects it verbatim;
/// treat as an opaque protocol constant.
pub const OPEN_COMMAND_PREFIX: u8 = b'0';

/// Static identity of the target peripheral: which service to scan for,
/// which device to accept, and which characteristics to bind. Never mutated
/// after load.
#[derive(Debug, Clone)]
pub struct PeripheralIdentity {
    pub service: Uuid,
    pub device_id: String,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
}

impl PeripheralIdentity {
    pub fn new(
        service: &str,
        device_id: &str,
        write_characteristic: &str,
        notify_characteristic: &str,
    ) -> Result<Self> {
        Ok(Self {
            service: Uuid::parse_str(service).context("invalid service UUID")?,
            device_id: device_id.to_string(),
            write_characteristic: Uuid::parse_str(write_characteristic)
                .context("invalid write characteristic UUID")?,
            notify_characteristic: Uuid::parse_str(notify_characteristic)
                .context("invalid notify characteristic UUID")?,
        })
    }

    /// The exact characteristic set discovery should request.
    pub fn characteristic_uuids(&self) -> [Uuid; 2] {
        [self.write_characteristic, self.notify_characteristic]
    }
}

impl Default for PeripheralIdentity {
    fn default() -> Self {
        // The constants above are known-valid UUID literals.
        Self::new(SERVICE_UUID, DEVICE_IDENTIFIER, WRITE_CHAR_UUID, NOTIFY_CHAR_UUID)
            .expect("builtin UUID constants parse")
    }
}

/// Build the open-command payload: ASCII `"0" + password`, written without
/// response to the write characteristic.
pub fn open_command(password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + password.len());
    payload.push(OPEN_COMMAND_PREFIX);
    payload.extend_from_slice(password.as_bytes());
    payload
}
