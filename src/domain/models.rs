//! Shared data model: peripheral references, connection phases, and the
//! events the connection manager emits to frontends.

/// Non-owning reference to a remote BLE peripheral.
///
/// The underlying device object is owned by the BLE adapter; the core only
/// tracks its identifier and advertised name. Operating on a stale reference
/// is a signaled failure, never undefined behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRef {
    /// Adapter-level identifier, compared against the configured device id.
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl PeripheralRef {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Discrete states of the connection state machine.
///
/// The happy path cycles `Scanning → Connecting → DiscoveringServices →
/// Ready → Disconnected → Scanning`. `AdapterOff` is a parking state exited
/// only when the adapter powers back on; `ScanTimedOut` waits for a manual
/// rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected,
    AdapterOff,
    ScanTimedOut,
}

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Human-readable label, matching the status strings the app displays.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Resetting => "Resetting",
            Self::Unsupported => "Unsupported Device",
            Self::Unauthorized => "Unauthorized",
            Self::PoweredOff => "Bluetooth Off",
            Self::PoweredOn => "Powered On",
        }
    }
}

/// Lifecycle events emitted by the connection manager.
///
/// This is the one-way channel to the frontend; ordering matches the order
/// of the manager's internal transitions.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A scan attempt started.
    Scanning,
    /// The target device was discovered with an acceptable signal.
    FoundDevice { peripheral: PeripheralRef, rssi: i16 },
    /// GATT discovery finished; commands can be sent.
    Ready { name: String },
    /// The peripheral disconnected.
    Disconnected { peripheral: PeripheralRef },
    /// The adapter reported powered-off.
    BluetoothOff,
    /// The scan window elapsed without finding the device.
    ScanTimedOut,
    /// A candidate was rejected for weak signal; a backoff rescan follows.
    LowSignal { rssi: i16 },
    /// Periodic signal-strength reading while connected.
    RssiUpdated { rssi: i16 },
    /// Informational adapter state report (unknown/resetting/...).
    AdapterInfo { state: AdapterState },
    /// Diagnostic message with severity, for display or logging.
    Status(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Eventually-consistent view of the manager's state, published on a watch
/// channel for frontends that poll instead of consuming events.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub phase: ConnectionPhase,
    pub peripheral: Option<PeripheralRef>,
    pub last_rssi: Option<i16>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            peripheral: None,
            last_rssi: None,
        }
    }
}
