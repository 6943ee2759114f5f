//! BLE discovery-and-connection manager.
//!
//! A long-running state machine that scans for the one known door
//! peripheral, filters candidates by identity and signal strength, manages
//! connect/disconnect/retry/timeout, and emits lifecycle events. All adapter
//! callbacks, frontend signals, and timer firings are funneled through one
//! input channel and handled on a single task, so `ConnectionState` is never
//! mutated concurrently.

use crate::domain::models::{
    AdapterState, ConnectionPhase, ManagerEvent, MessageSeverity, PeripheralRef, StatusMessage,
    StatusSnapshot,
};
use crate::domain::settings::Settings;
use crate::domain::signal::{self, Signal};
use crate::infrastructure::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::infrastructure::bluetooth::protocol::{self, PeripheralIdentity};
use crate::infrastructure::bluetooth::session::ServiceSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Tunables for the connection policy. Defaults mirror the shipped app;
/// every value can be overridden from settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub identity: PeripheralIdentity,
    /// Candidates below this dBm value are rejected (127 always is).
    pub rssi_reject_threshold: i16,
    /// How long a scan attempt runs before giving up.
    pub scan_timeout: Duration,
    /// Pause before rescanning after a weak-signal rejection.
    pub low_signal_backoff: Duration,
    /// Pause after a disconnect before resetting and rescanning.
    pub disconnect_settle: Duration,
    /// Interval of the signal-strength poll while connected.
    pub rssi_poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            identity: PeripheralIdentity::default(),
            rssi_reject_threshold: signal::DEFAULT_REJECT_THRESHOLD,
            scan_timeout: Duration::from_secs(30),
            low_signal_backoff: Duration::from_secs(1),
            disconnect_settle: Duration::from_secs(2),
            rssi_poll_interval: Duration::from_secs(2),
        }
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            identity: PeripheralIdentity::new(
                &settings.ble_service_uuid,
                &settings.ble_device_id,
                &settings.ble_write_char_uuid,
                &settings.ble_notify_char_uuid,
            )?,
            rssi_reject_threshold: settings.rssi_reject_threshold,
            scan_timeout: Duration::from_secs(settings.scan_timeout_secs),
            low_signal_backoff: Duration::from_millis(settings.low_signal_backoff_ms),
            disconnect_settle: Duration::from_millis(settings.disconnect_settle_ms),
            rssi_poll_interval: Duration::from_millis(settings.rssi_poll_interval_ms),
        })
    }
}

/// Signals pushed in by the frontend / app lifecycle.
#[derive(Debug, Clone)]
pub enum AppSignal {
    EnteredBackground,
    EnteredForeground,
    /// Settings were saved; carries the rebuilt config. Triggers a rescan
    /// with the fresh values unless a connection is live.
    SettingsChanged(Box<ManagerConfig>),
    /// Manual rescan, meaningful after a scan timeout or in idle states.
    RequestRescan,
    /// Send the door-open command through the active session.
    RequestOpen { password: String },
}

/// Purpose-keyed timers. Each key is independently cancellable; a late
/// firing of a cancelled or superseded timer carries a stale generation and
/// is dropped at the input stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    ScanTimeout,
    LowSignalBackoff,
    /// Keyed by peripheral id; never cancelled, self-guarding on fire.
    DisconnectSettle(String),
    RssiPoll,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Timers {
    tx: mpsc::UnboundedSender<Input>,
    slots: HashMap<TimerKey, TimerSlot>,
}

impl Timers {
    fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            tx,
            slots: HashMap::new(),
        }
    }

    /// Arm (or re-arm) the timer for `key`. A previously armed timer for the
    /// same key is superseded.
    fn schedule(&mut self, key: TimerKey, delay: Duration) {
        let slot = self.slots.entry(key.clone()).or_default();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let tx = self.tx.clone();
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer { key, generation });
        }));
    }

    fn cancel(&mut self, key: &TimerKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
            slot.generation += 1;
        }
    }

    /// Validate a firing. Consumes the generation so duplicate deliveries of
    /// the same firing are dropped too.
    fn accepts(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) if slot.generation == generation => {
                slot.handle = None;
                slot.generation += 1;
                true
            }
            _ => false,
        }
    }
}

/// Everything the manager task consumes, serialized on one channel.
#[derive(Debug)]
enum Input {
    Adapter(AdapterEvent),
    Signal(AppSignal),
    Timer { key: TimerKey, generation: u64 },
}

/// The state machine's mutable data, owned exclusively by the manager task.
struct ConnectionState {
    phase: ConnectionPhase,
    active_peripheral: Option<PeripheralRef>,
    session: Option<ServiceSession>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            active_peripheral: None,
            session: None,
        }
    }
}

/// Cloneable handle for pushing inputs into the manager and reading its
/// eventually-consistent status snapshot.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<StatusSnapshot>,
}

impl ManagerHandle {
    pub fn adapter_event(&self, event: AdapterEvent) {
        let _ = self.tx.send(Input::Adapter(event));
    }

    pub fn signal(&self, signal: AppSignal) {
        let _ = self.tx.send(Input::Signal(signal));
    }

    /// Snapshot of the current phase/peripheral/RSSI. Eventually consistent:
    /// reflects the manager's last published transition.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }
}

pub struct ConnectionManager {
    config: ManagerConfig,
    adapter: Arc<dyn BleAdapter>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    state: ConnectionState,
    adapter_state: AdapterState,
    last_rssi: Option<i16>,
    timers: Timers,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        adapter: Arc<dyn BleAdapter>,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> (Self, ManagerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let manager = Self {
            config,
            adapter,
            events,
            status_tx,
            state: ConnectionState::new(),
            adapter_state: AdapterState::Unknown,
            last_rssi: None,
            timers: Timers::new(tx.clone()),
            rx,
        };
        let handle = ManagerHandle {
            tx,
            status: status_rx,
        };
        (manager, handle)
    }

    /// Run the manager until all input senders are dropped. This task is the
    /// single serial context owning all state mutation.
    pub async fn run(mut self) {
        let initial = self.adapter.state().await;
        info!(state = initial.label(), "adapter initial state");
        self.on_adapter_state(initial).await;

        while let Some(input) = self.rx.recv().await {
            self.handle(input).await;
        }
        debug!("connection manager input channel closed, stopping");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Adapter(event) => self.handle_adapter_event(event).await,
            Input::Signal(signal) => self.handle_signal(signal).await,
            Input::Timer { key, generation } => {
                if self.timers.accepts(&key, generation) {
                    self.handle_timer(key).await;
                }
            }
        }
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged(state) => self.on_adapter_state(state).await,
            AdapterEvent::DeviceDiscovered { peripheral, rssi } => {
                self.on_device_discovered(peripheral, rssi).await;
            }
            AdapterEvent::Connected { peripheral } => self.on_connected(peripheral).await,
            AdapterEvent::ConnectFailed { peripheral, reason } => {
                self.on_connect_failed(&peripheral, &reason).await;
            }
            AdapterEvent::Disconnected { peripheral } => self.on_disconnected(peripheral),
            AdapterEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => {
                if !self.is_active_session(&peripheral) {
                    trace!(peripheral = %peripheral.id, "service discovery for stale peripheral");
                    return;
                }
                if let Some(session) = self.state.session.as_mut() {
                    session
                        .on_services_discovered(&services, error.as_deref())
                        .await;
                }
            }
            AdapterEvent::CharacteristicsDiscovered {
                peripheral,
                characteristics,
                error,
            } => {
                if !self.is_active_session(&peripheral) {
                    trace!(peripheral = %peripheral.id, "characteristics for stale peripheral");
                    return;
                }
                let became_ready = match self.state.session.as_mut() {
                    Some(session) => {
                        session
                            .on_characteristics_discovered(&characteristics, error.as_deref())
                            .await
                    }
                    None => false,
                };
                if became_ready {
                    let name = peripheral.display_name().to_string();
                    self.set_phase(ConnectionPhase::Ready);
                    self.emit(ManagerEvent::Ready { name });
                }
            }
            AdapterEvent::RssiRead { peripheral, rssi } => {
                self.on_rssi_read(&peripheral, rssi).await;
            }
        }
    }

    async fn handle_signal(&mut self, signal: AppSignal) {
        match signal {
            AppSignal::EnteredBackground => self.on_entered_background().await,
            AppSignal::EnteredForeground => self.on_entered_foreground().await,
            AppSignal::SettingsChanged(config) => self.on_settings_changed(*config).await,
            AppSignal::RequestRescan => self.start_scanning().await,
            AppSignal::RequestOpen { password } => self.on_request_open(&password).await,
        }
    }

    async fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::ScanTimeout => self.on_scan_timeout().await,
            TimerKey::LowSignalBackoff => self.start_scanning().await,
            TimerKey::DisconnectSettle(peripheral_id) => {
                self.on_disconnect_settled(&peripheral_id).await;
            }
            TimerKey::RssiPoll => self.on_rssi_poll().await,
        }
    }

    /// Begin a scan attempt. Parks in `AdapterOff` when the adapter is
    /// powered off, reports the state for other not-ready adapter states,
    /// and is a no-op when already scanning/connected.
    async fn start_scanning(&mut self) {
        match self.adapter_state {
            AdapterState::PoweredOn => {}
            AdapterState::PoweredOff => {
                debug!("adapter powered off, not scanning");
                self.set_phase(ConnectionPhase::AdapterOff);
                self.emit(ManagerEvent::BluetoothOff);
                return;
            }
            state => {
                debug!(state = state.label(), "adapter not ready, not scanning");
                self.emit(ManagerEvent::AdapterInfo { state });
                return;
            }
        }
        if matches!(
            self.state.phase,
            ConnectionPhase::Scanning
                | ConnectionPhase::Connecting
                | ConnectionPhase::DiscoveringServices
                | ConnectionPhase::Ready
        ) {
            trace!(phase = ?self.state.phase, "already scanning or connected");
            return;
        }

        info!(service = %self.config.identity.service, "starting scan");
        if let Err(err) = self.adapter.start_scan(self.config.identity.service).await {
            warn!(%err, "failed to start scan");
            self.emit_status(format!("Failed to start scan: {err}"), MessageSeverity::Error);
            return;
        }
        self.set_phase(ConnectionPhase::Scanning);
        self.timers
            .schedule(TimerKey::ScanTimeout, self.config.scan_timeout);
        self.emit(ManagerEvent::Scanning);
    }

    /// The scan window elapsed without a usable discovery. Stop scanning and
    /// wait for a manual rescan; never scan forever silently.
    async fn on_scan_timeout(&mut self) {
        if self.adapter_state != AdapterState::PoweredOn {
            self.reset_connection();
            return;
        }
        if self.state.phase != ConnectionPhase::Scanning {
            trace!(phase = ?self.state.phase, "scan timeout fired outside scanning, ignoring");
            return;
        }
        info!("scan timed out");
        if let Err(err) = self.adapter.stop_scan().await {
            warn!(%err, "failed to stop scan after timeout");
        }
        self.set_phase(ConnectionPhase::ScanTimedOut);
        self.emit(ManagerEvent::ScanTimedOut);
    }

    async fn on_device_discovered(&mut self, peripheral: PeripheralRef, rssi: i16) {
        trace!(peripheral = %peripheral.id, rssi, "device discovered");

        // Already satisfied; duplicate discovery events are idempotent.
        if let Some(active) = self.state.active_peripheral.clone() {
            if self.adapter.is_connected(&active).await {
                debug!("active peripheral already connected, ignoring discovery");
                return;
            }
        }

        match signal::classify(rssi, self.config.rssi_reject_threshold) {
            Signal::Reject => self.handle_low_signal(rssi).await,
            Signal::Accept => {
                // The scan filter matches by service UUID, which decoys can
                // advertise; the identifier is the authoritative match.
                if peripheral.id != self.config.identity.device_id {
                    trace!(peripheral = %peripheral.id, "identifier mismatch, ignoring");
                    return;
                }
                if self.state.phase == ConnectionPhase::Connecting {
                    trace!("connect already in flight, ignoring duplicate advertisement");
                    return;
                }

                info!(peripheral = %peripheral.id, rssi, "target device found, connecting");
                self.state.active_peripheral = Some(peripheral.clone());
                self.set_phase(ConnectionPhase::Connecting);
                self.emit(ManagerEvent::FoundDevice {
                    peripheral: peripheral.clone(),
                    rssi,
                });
                if let Err(err) = self.adapter.connect(&peripheral).await {
                    warn!(%err, "connect request failed");
                    self.on_connect_failed(&peripheral, &err.to_string()).await;
                }
            }
        }
    }

    /// Weak-signal policy: stop the scan, drop any half-built state, and try
    /// again after a short backoff instead of hammering a marginal signal.
    async fn handle_low_signal(&mut self, rssi: i16) {
        debug!(rssi, "signal too weak, backing off");
        if let Err(err) = self.adapter.stop_scan().await {
            warn!(%err, "failed to stop scan on low signal");
        }
        self.reset_connection();
        self.set_phase(ConnectionPhase::Idle);
        self.emit(ManagerEvent::LowSignal { rssi });
        self.timers
            .schedule(TimerKey::LowSignalBackoff, self.config.low_signal_backoff);
    }

    async fn on_connected(&mut self, peripheral: PeripheralRef) {
        let matches_active = self
            .state
            .active_peripheral
            .as_ref()
            .is_some_and(|active| active.id == peripheral.id);
        if !matches_active {
            debug!(peripheral = %peripheral.id, "connect callback for stale peripheral, ignoring");
            return;
        }

        info!(peripheral = %peripheral.id, name = peripheral.display_name(), "connected");
        // A late timeout after this point would be spurious.
        self.timers.cancel(&TimerKey::ScanTimeout);
        if let Err(err) = self.adapter.stop_scan().await {
            warn!(%err, "failed to stop residual scan");
        }

        self.set_phase(ConnectionPhase::DiscoveringServices);
        let session = ServiceSession::new(
            self.adapter.clone(),
            peripheral,
            self.config.identity.clone(),
            self.events.clone(),
        );
        if let Err(err) = session.start_discovering_services().await {
            warn!(%err, "service discovery request failed");
            self.emit_status(
                format!("Service discovery failed: {err}"),
                MessageSeverity::Warning,
            );
            self.reset_connection();
            self.set_phase(ConnectionPhase::Disconnected);
            self.start_scanning().await;
            return;
        }
        self.state.session = Some(session);
        self.timers
            .schedule(TimerKey::RssiPoll, self.config.rssi_poll_interval);
    }

    async fn on_connect_failed(&mut self, peripheral: &PeripheralRef, reason: &str) {
        warn!(peripheral = %peripheral.id, reason, "failed to connect");
        self.emit_status(
            format!("Failed to connect: {reason}"),
            MessageSeverity::Warning,
        );
        let matches_active = self
            .state
            .active_peripheral
            .as_ref()
            .is_some_and(|active| active.id == peripheral.id);
        if matches_active {
            self.reset_connection();
            self.set_phase(ConnectionPhase::Disconnected);
            self.start_scanning().await;
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralRef) {
        info!(peripheral = %peripheral.id, "disconnected");
        self.emit(ManagerEvent::Disconnected {
            peripheral: peripheral.clone(),
        });

        let matches_active = self
            .state
            .active_peripheral
            .as_ref()
            .is_some_and(|active| active.id == peripheral.id);
        if matches_active {
            // The session never outlives its peripheral's connection.
            self.state.session = None;
            self.timers.cancel(&TimerKey::RssiPoll);
            self.set_phase(ConnectionPhase::Disconnected);
        }

        // Let any in-flight reconnection settle before deciding to rescan.
        self.timers.schedule(
            TimerKey::DisconnectSettle(peripheral.id),
            self.config.disconnect_settle,
        );
    }

    /// Settle-delay check: only act if nothing superseded the peripheral in
    /// the interim, making late firings safe no-ops.
    async fn on_disconnect_settled(&mut self, peripheral_id: &str) {
        let still_active = self
            .state
            .active_peripheral
            .as_ref()
            .is_some_and(|active| active.id == peripheral_id);
        if !still_active {
            trace!(peripheral = peripheral_id, "settle check: peripheral superseded");
            return;
        }
        self.reset_connection();
        self.set_phase(ConnectionPhase::Disconnected);
        self.start_scanning().await;
    }

    /// Clear session, active peripheral, and the scan timeout timer.
    /// Idempotent; does not touch the phase.
    fn reset_connection(&mut self) {
        self.state.session = None;
        self.state.active_peripheral = None;
        self.last_rssi = None;
        self.timers.cancel(&TimerKey::ScanTimeout);
        self.timers.cancel(&TimerKey::RssiPoll);
        self.publish_snapshot();
    }

    async fn on_adapter_state(&mut self, state: AdapterState) {
        info!(state = state.label(), "adapter state changed");
        self.adapter_state = state;
        match state {
            AdapterState::PoweredOn => self.start_scanning().await,
            AdapterState::PoweredOff => {
                self.reset_connection();
                self.set_phase(ConnectionPhase::AdapterOff);
                self.emit(ManagerEvent::BluetoothOff);
            }
            AdapterState::Unknown
            | AdapterState::Resetting
            | AdapterState::Unsupported
            | AdapterState::Unauthorized => {
                self.emit(ManagerEvent::AdapterInfo { state });
            }
        }
    }

    /// Do not hold a BLE connection while backgrounded; every background
    /// transition forces a future rescan.
    async fn on_entered_background(&mut self) {
        info!("app entered background");
        if let Some(active) = self.state.active_peripheral.clone() {
            if self.adapter.is_connected(&active).await {
                if let Err(err) = self.adapter.disconnect(&active).await {
                    warn!(%err, "disconnect on background failed");
                }
            }
        }
        if self.state.phase == ConnectionPhase::Scanning {
            if let Err(err) = self.adapter.stop_scan().await {
                warn!(%err, "failed to stop scan on background");
            }
        }
        self.reset_connection();
        self.set_phase(ConnectionPhase::Idle);
    }

    async fn on_entered_foreground(&mut self) {
        info!("app entered foreground");
        if self.adapter_state == AdapterState::PoweredOn {
            self.start_scanning().await;
        }
    }

    /// Adopt the new config and rescan, unless a connection is live (the
    /// fresh values then apply from the next scan cycle).
    async fn on_settings_changed(&mut self, config: ManagerConfig) {
        info!("settings changed");
        self.config = config;
        if let Some(active) = self.state.active_peripheral.clone() {
            if self.adapter.is_connected(&active).await {
                return;
            }
        }
        if self.state.phase == ConnectionPhase::Scanning {
            if let Err(err) = self.adapter.stop_scan().await {
                warn!(%err, "failed to stop scan for settings change");
            }
        }
        self.reset_connection();
        self.set_phase(ConnectionPhase::Idle);
        self.start_scanning().await;
    }

    async fn on_request_open(&mut self, password: &str) {
        match (&self.state.session, self.state.phase) {
            (Some(session), ConnectionPhase::Ready) => {
                match session.write_command(&protocol::open_command(password)).await {
                    Ok(()) => {
                        info!("open command sent");
                        self.emit_status("Open command sent", MessageSeverity::Success);
                    }
                    Err(err) => {
                        warn!(%err, "open command failed");
                        self.emit_status(format!("Open failed: {err}"), MessageSeverity::Error);
                    }
                }
            }
            _ => {
                self.emit_status(
                    "Not connected; cannot send open command",
                    MessageSeverity::Warning,
                );
            }
        }
    }

    async fn on_rssi_poll(&mut self) {
        let connected = match &self.state.session {
            Some(session) => self.adapter.is_connected(session.peripheral()).await,
            None => false,
        };
        if !connected {
            return;
        }
        if let Some(session) = &self.state.session {
            session.read_signal_strength().await;
        }
        self.timers
            .schedule(TimerKey::RssiPoll, self.config.rssi_poll_interval);
    }

    async fn on_rssi_read(&mut self, peripheral: &PeripheralRef, rssi: i16) {
        let matches_active = self
            .state
            .active_peripheral
            .as_ref()
            .is_some_and(|active| active.id == peripheral.id);
        // State-checked before emitting, to avoid reporting stale signal data.
        if !matches_active || !self.adapter.is_connected(peripheral).await {
            trace!(peripheral = %peripheral.id, "dropping RSSI for stale peripheral");
            return;
        }
        self.last_rssi = Some(rssi);
        self.publish_snapshot();
        self.emit(ManagerEvent::RssiUpdated { rssi });
    }

    fn is_active_session(&self, peripheral: &PeripheralRef) -> bool {
        self.state
            .session
            .as_ref()
            .is_some_and(|session| session.peripheral().id == peripheral.id)
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.state.phase != phase {
            debug!(from = ?self.state.phase, to = ?phase, "phase transition");
            self.state.phase = phase;
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.status_tx.send_replace(StatusSnapshot {
            phase: self.state.phase,
            peripheral: self.state.active_peripheral.clone(),
            last_rssi: self.last_rssi,
        });
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.emit(ManagerEvent::Status(StatusMessage::new(message, severity)));
    }

    #[cfg(test)]
    fn timer_generation(&self, key: &TimerKey) -> Option<u64> {
        self.timers.slots.get(key).map(|slot| slot.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::adapter::AdapterError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan,
        StopScan,
        Connect(String),
        Disconnect(String),
        DiscoverServices(String),
        DiscoverCharacteristics(String),
        Subscribe(Uuid),
        Write(Uuid, Vec<u8>),
        ReadRssi(String),
    }

    /// Records requests and lets tests script connectivity; completions are
    /// injected by the tests as adapter events.
    struct MockAdapter {
        state: Mutex<AdapterState>,
        connected: Mutex<HashSet<String>>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockAdapter {
        fn new(state: AdapterState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                connected: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set_connected(&self, id: &str, connected: bool) {
            let mut set = self.connected.lock().unwrap();
            if connected {
                set.insert(id.to_string());
            } else {
                set.remove(id);
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl BleAdapter for MockAdapter {
        async fn state(&self) -> AdapterState {
            *self.state.lock().unwrap()
        }

        async fn start_scan(&self, _service: Uuid) -> Result<(), AdapterError> {
            self.record(Call::StartScan);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), AdapterError> {
            self.record(Call::StopScan);
            Ok(())
        }

        async fn connect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
            self.record(Call::Connect(peripheral.id.clone()));
            Ok(())
        }

        async fn disconnect(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
            self.record(Call::Disconnect(peripheral.id.clone()));
            Ok(())
        }

        async fn discover_services(
            &self,
            peripheral: &PeripheralRef,
            _service: Uuid,
        ) -> Result<(), AdapterError> {
            self.record(Call::DiscoverServices(peripheral.id.clone()));
            Ok(())
        }

        async fn discover_characteristics(
            &self,
            peripheral: &PeripheralRef,
            _service: Uuid,
            _characteristics: &[Uuid],
        ) -> Result<(), AdapterError> {
            self.record(Call::DiscoverCharacteristics(peripheral.id.clone()));
            Ok(())
        }

        async fn subscribe(
            &self,
            _peripheral: &PeripheralRef,
            characteristic: Uuid,
        ) -> Result<(), AdapterError> {
            self.record(Call::Subscribe(characteristic));
            Ok(())
        }

        async fn write_without_response(
            &self,
            _peripheral: &PeripheralRef,
            characteristic: Uuid,
            payload: &[u8],
        ) -> Result<(), AdapterError> {
            self.record(Call::Write(characteristic, payload.to_vec()));
            Ok(())
        }

        async fn read_rssi(&self, peripheral: &PeripheralRef) -> Result<(), AdapterError> {
            self.record(Call::ReadRssi(peripheral.id.clone()));
            Ok(())
        }

        async fn is_connected(&self, peripheral: &PeripheralRef) -> bool {
            self.connected.lock().unwrap().contains(&peripheral.id)
        }
    }

    fn target() -> PeripheralRef {
        PeripheralRef::new(protocol::DEVICE_IDENTIFIER, Some("Home".to_string()))
    }

    fn fixture() -> (
        ConnectionManager,
        Arc<MockAdapter>,
        mpsc::UnboundedReceiver<ManagerEvent>,
        ManagerHandle,
    ) {
        let adapter = MockAdapter::new(AdapterState::PoweredOn);
        let (tx, rx) = mpsc::unbounded_channel();
        let (mut manager, handle) =
            ConnectionManager::new(ManagerConfig::default(), adapter.clone(), tx);
        // Tests drive `handle` directly instead of `run`, which is what
        // normally syncs the cached adapter state from the adapter.
        manager.adapter_state = AdapterState::PoweredOn;
        (manager, adapter, rx, handle)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn drive_to_ready(
        manager: &mut ConnectionManager,
        adapter: &MockAdapter,
    ) {
        manager.start_scanning().await;
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;
        adapter.set_connected(&target().id, true);
        manager
            .handle(Input::Adapter(AdapterEvent::Connected {
                peripheral: target(),
            }))
            .await;
        let identity = manager.config.identity.clone();
        manager
            .handle(Input::Adapter(AdapterEvent::ServicesDiscovered {
                peripheral: target(),
                services: vec![identity.service],
                error: None,
            }))
            .await;
        manager
            .handle(Input::Adapter(AdapterEvent::CharacteristicsDiscovered {
                peripheral: target(),
                characteristics: vec![
                    identity.write_characteristic,
                    identity.notify_characteristic,
                ],
                error: None,
            }))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::Ready);
    }

    #[tokio::test]
    async fn identity_gate_blocks_decoys() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        manager.start_scanning().await;

        let decoy = PeripheralRef::new("decoy-id", Some("Decoy".to_string()));
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: decoy,
                rssi: -40,
            }))
            .await;

        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
        assert!(manager.state.active_peripheral.is_none());
        assert_eq!(adapter.count(|c| matches!(c, Call::Connect(_))), 0);
    }

    #[tokio::test]
    async fn single_active_peripheral_while_connected() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        // A second accepted discovery while connected is a no-op.
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -50,
            }))
            .await;

        assert_eq!(adapter.count(|c| matches!(c, Call::Connect(_))), 1);
        assert_eq!(manager.state.phase, ConnectionPhase::Ready);
        assert_eq!(
            manager.state.active_peripheral.as_ref().map(|p| p.id.as_str()),
            Some(protocol::DEVICE_IDENTIFIER)
        );
    }

    #[tokio::test]
    async fn ready_requires_both_characteristics() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;
        adapter.set_connected(&target().id, true);
        manager
            .handle(Input::Adapter(AdapterEvent::Connected {
                peripheral: target(),
            }))
            .await;
        let identity = manager.config.identity.clone();
        manager
            .handle(Input::Adapter(AdapterEvent::ServicesDiscovered {
                peripheral: target(),
                services: vec![identity.service],
                error: None,
            }))
            .await;
        drain(&mut rx);

        // Only the notify characteristic arrives: not ready yet.
        manager
            .handle(Input::Adapter(AdapterEvent::CharacteristicsDiscovered {
                peripheral: target(),
                characteristics: vec![identity.notify_characteristic],
                error: None,
            }))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::DiscoveringServices);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::Ready { .. })));

        // The write characteristic completes the pair.
        manager
            .handle(Input::Adapter(AdapterEvent::CharacteristicsDiscovered {
                peripheral: target(),
                characteristics: vec![identity.write_characteristic],
                error: None,
            }))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::Ready);
        let ready_events = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ManagerEvent::Ready { .. }))
            .count();
        assert_eq!(ready_events, 1);
    }

    #[tokio::test]
    async fn unexpected_characteristic_aborts_batch() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;
        adapter.set_connected(&target().id, true);
        manager
            .handle(Input::Adapter(AdapterEvent::Connected {
                peripheral: target(),
            }))
            .await;
        let identity = manager.config.identity.clone();
        manager
            .handle(Input::Adapter(AdapterEvent::ServicesDiscovered {
                peripheral: target(),
                services: vec![identity.service],
                error: None,
            }))
            .await;
        drain(&mut rx);

        manager
            .handle(Input::Adapter(AdapterEvent::CharacteristicsDiscovered {
                peripheral: target(),
                characteristics: vec![identity.notify_characteristic, Uuid::new_v4()],
                error: None,
            }))
            .await;

        assert_eq!(manager.state.phase, ConnectionPhase::DiscoveringServices);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::Ready { .. })));
    }

    #[tokio::test]
    async fn stale_callbacks_after_reset_are_ignored() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        adapter.set_connected(&target().id, false);
        manager.reset_connection();

        manager
            .handle(Input::Adapter(AdapterEvent::Connected {
                peripheral: target(),
            }))
            .await;
        assert!(manager.state.active_peripheral.is_none());
        assert!(manager.state.session.is_none());

        manager
            .handle(Input::Adapter(AdapterEvent::Disconnected {
                peripheral: target(),
            }))
            .await;
        assert!(manager.state.active_peripheral.is_none());
        assert!(manager.state.session.is_none());
    }

    #[tokio::test]
    async fn scan_timeout_requires_manual_rescan() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 1);

        let generation = manager.timer_generation(&TimerKey::ScanTimeout).unwrap();
        manager
            .handle(Input::Timer {
                key: TimerKey::ScanTimeout,
                generation,
            })
            .await;

        assert_eq!(manager.state.phase, ConnectionPhase::ScanTimedOut);
        assert_eq!(adapter.count(|c| matches!(c, Call::StopScan)), 1);
        let timeouts = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ManagerEvent::ScanTimedOut))
            .count();
        assert_eq!(timeouts, 1);

        // No automatic rescan; only the explicit request restarts.
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 1);
        manager.handle(Input::Signal(AppSignal::RequestRescan)).await;
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 2);
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
    }

    #[tokio::test]
    async fn stale_timer_generation_is_dropped() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        manager.start_scanning().await;

        let generation = manager.timer_generation(&TimerKey::ScanTimeout).unwrap();
        // Connecting cancels the timer; the old generation must not fire.
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;
        adapter.set_connected(&target().id, true);
        manager
            .handle(Input::Adapter(AdapterEvent::Connected {
                peripheral: target(),
            }))
            .await;

        manager
            .handle(Input::Timer {
                key: TimerKey::ScanTimeout,
                generation,
            })
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::DiscoveringServices);
    }

    #[tokio::test]
    async fn background_forces_single_disconnect() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        manager
            .handle(Input::Signal(AppSignal::EnteredBackground))
            .await;

        assert!(manager.state.active_peripheral.is_none());
        assert!(manager.state.session.is_none());
        assert_eq!(adapter.count(|c| matches!(c, Call::Disconnect(_))), 1);
    }

    #[tokio::test]
    async fn low_signal_backs_off_then_rescans() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;

        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -120,
            }))
            .await;

        assert!(manager.state.active_peripheral.is_none());
        assert_eq!(adapter.count(|c| matches!(c, Call::StopScan)), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::LowSignal { rssi: -120 })));

        let generation = manager
            .timer_generation(&TimerKey::LowSignalBackoff)
            .unwrap();
        manager
            .handle(Input::Timer {
                key: TimerKey::LowSignalBackoff,
                generation,
            })
            .await;
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 2);
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
    }

    #[tokio::test]
    async fn rssi_sentinel_is_rejected() {
        let (mut manager, _adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;

        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: signal::RSSI_UNAVAILABLE,
            }))
            .await;

        assert!(manager.state.active_peripheral.is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::LowSignal { .. })));
    }

    #[tokio::test]
    async fn disconnect_settles_then_rescans() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        adapter.set_connected(&target().id, false);
        manager
            .handle(Input::Adapter(AdapterEvent::Disconnected {
                peripheral: target(),
            }))
            .await;

        assert_eq!(manager.state.phase, ConnectionPhase::Disconnected);
        assert!(manager.state.session.is_none());
        // Peripheral stays tracked until the settle check.
        assert!(manager.state.active_peripheral.is_some());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::Disconnected { .. })));

        let key = TimerKey::DisconnectSettle(target().id);
        let generation = manager.timer_generation(&key).unwrap();
        manager
            .handle(Input::Timer { key, generation })
            .await;

        assert!(manager.state.active_peripheral.is_none());
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 2);
    }

    #[tokio::test]
    async fn connect_failure_resets_and_rescans() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::Connecting);
        drain(&mut rx);

        manager
            .handle(Input::Adapter(AdapterEvent::ConnectFailed {
                peripheral: target(),
                reason: "peer refused".to_string(),
            }))
            .await;

        assert!(manager.state.active_peripheral.is_none());
        assert!(manager.state.session.is_none());
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 2);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ManagerEvent::Status(StatusMessage {
                severity: MessageSeverity::Warning,
                ..
            })
        )));
    }

    #[tokio::test]
    async fn connect_failure_for_stale_peripheral_keeps_state() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        manager.start_scanning().await;
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -60,
            }))
            .await;

        let stale = PeripheralRef::new("stale-id", None);
        manager
            .handle(Input::Adapter(AdapterEvent::ConnectFailed {
                peripheral: stale,
                reason: "peer refused".to_string(),
            }))
            .await;

        assert_eq!(manager.state.phase, ConnectionPhase::Connecting);
        assert!(manager.state.active_peripheral.is_some());
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 1);
    }

    #[tokio::test]
    async fn settings_change_restarts_scan_with_new_config() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        manager.start_scanning().await;

        let config = ManagerConfig {
            rssi_reject_threshold: -70,
            ..ManagerConfig::default()
        };
        manager
            .handle(Input::Signal(AppSignal::SettingsChanged(Box::new(config))))
            .await;

        assert_eq!(manager.config.rssi_reject_threshold, -70);
        assert_eq!(adapter.count(|c| matches!(c, Call::StopScan)), 1);
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 2);
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);

        // -80 passed the old threshold; the adopted one rejects it.
        manager
            .handle(Input::Adapter(AdapterEvent::DeviceDiscovered {
                peripheral: target(),
                rssi: -80,
            }))
            .await;
        assert!(manager.state.active_peripheral.is_none());
    }

    #[tokio::test]
    async fn settings_change_while_connected_defers_rescan() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        let config = ManagerConfig {
            rssi_reject_threshold: -70,
            ..ManagerConfig::default()
        };
        manager
            .handle(Input::Signal(AppSignal::SettingsChanged(Box::new(config))))
            .await;

        assert_eq!(manager.config.rssi_reject_threshold, -70);
        assert_eq!(manager.state.phase, ConnectionPhase::Ready);
        assert!(manager.state.session.is_some());
        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 1);
    }

    #[tokio::test]
    async fn rescan_while_adapter_state_unknown_reports_state() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.adapter_state = AdapterState::Unknown;

        manager.handle(Input::Signal(AppSignal::RequestRescan)).await;

        assert_eq!(adapter.count(|c| matches!(c, Call::StartScan)), 0);
        assert_ne!(manager.state.phase, ConnectionPhase::AdapterOff);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ManagerEvent::AdapterInfo {
                state: AdapterState::Unknown
            }
        )));
        assert!(!events.iter().any(|e| matches!(e, ManagerEvent::BluetoothOff)));
    }

    #[tokio::test]
    async fn adapter_off_parks_until_powered_on() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        manager
            .handle(Input::Adapter(AdapterEvent::StateChanged(
                AdapterState::PoweredOff,
            )))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::AdapterOff);
        assert!(manager.state.active_peripheral.is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::BluetoothOff)));

        manager
            .handle(Input::Adapter(AdapterEvent::StateChanged(
                AdapterState::PoweredOn,
            )))
            .await;
        assert_eq!(manager.state.phase, ConnectionPhase::Scanning);
    }

    #[tokio::test]
    async fn open_command_goes_to_write_characteristic() {
        let (mut manager, adapter, _rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;

        manager
            .handle(Input::Signal(AppSignal::RequestOpen {
                password: "hunter2".to_string(),
            }))
            .await;

        let write_char = manager.config.identity.write_characteristic;
        let writes: Vec<_> = adapter
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(uuid, payload) => Some((uuid, payload)),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![(write_char, b"0hunter2".to_vec())]);
    }

    #[tokio::test]
    async fn open_without_session_reports_not_ready() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        manager.start_scanning().await;

        manager
            .handle(Input::Signal(AppSignal::RequestOpen {
                password: "hunter2".to_string(),
            }))
            .await;

        assert_eq!(adapter.count(|c| matches!(c, Call::Write(..))), 0);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ManagerEvent::Status(StatusMessage {
                severity: MessageSeverity::Warning,
                ..
            })
        )));
    }

    #[tokio::test]
    async fn rssi_poll_emits_updates_while_connected() {
        let (mut manager, adapter, mut rx, _handle) = fixture();
        drive_to_ready(&mut manager, &adapter).await;
        drain(&mut rx);

        let generation = manager.timer_generation(&TimerKey::RssiPoll).unwrap();
        manager
            .handle(Input::Timer {
                key: TimerKey::RssiPoll,
                generation,
            })
            .await;
        assert_eq!(adapter.count(|c| matches!(c, Call::ReadRssi(_))), 1);

        manager
            .handle(Input::Adapter(AdapterEvent::RssiRead {
                peripheral: target(),
                rssi: -62,
            }))
            .await;
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ManagerEvent::RssiUpdated { rssi: -62 })));

        // Reading for a peripheral that has since disconnected is dropped.
        adapter.set_connected(&target().id, false);
        manager
            .handle(Input::Adapter(AdapterEvent::RssiRead {
                peripheral: target(),
                rssi: -70,
            }))
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_scan_timeout_with_paused_clock() {
        let adapter = MockAdapter::new(AdapterState::PoweredOn);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (manager, handle) =
            ConnectionManager::new(ManagerConfig::default(), adapter.clone(), tx);
        tokio::spawn(manager.run());

        // The paused clock auto-advances through the 30 s timeout.
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        let mut saw_scanning = false;
        let mut saw_timeout = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ManagerEvent::Scanning => saw_scanning = true,
                ManagerEvent::ScanTimedOut => saw_timeout = true,
                _ => {}
            }
        }
        assert!(saw_scanning);
        assert!(saw_timeout);
        assert_eq!(handle.status().phase, ConnectionPhase::ScanTimedOut);
    }
}
