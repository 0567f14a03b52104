//! Connection Coordinator
//!
//! Merges adapter and link events into one authoritative application state,
//! sequences connect attempts, applies command flow control, and republishes
//! a simplified state for consumers.
//!
//! All state mutation happens inside a single worker task driving a
//! `select!` loop, so transition handling is effectively single-threaded and
//! needs no locking. The adapter and link streams are each in-order but carry
//! no ordering relative to one another; the worker is written to tolerate
//! either arriving first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{query_state, AdapterMonitor};
use crate::error::{CommandError, ConnectError, Fault};
use crate::link::{LinkChannel, Transport};
use crate::models::{
    AdapterState, BtUnavailableReason, CoordinatorEvent, CoordinatorState, Device, LinkState,
};
use crate::protocol::Command;

/// Tunables for connect sequencing and command flow control.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on a single dial.
    pub connect_timeout: Duration,
    /// Window inside which a repeated same-color request is dropped.
    pub color_debounce: Duration,
    /// Extra sends after the first for each animation command. Zero disables
    /// the retry entirely.
    pub animation_retry_attempts: u32,
    /// Backoff before the first animation retry; doubles per attempt.
    pub animation_retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            color_debounce: Duration::from_millis(100),
            animation_retry_attempts: 2,
            animation_retry_backoff: Duration::from_millis(100),
        }
    }
}

enum Request {
    Connect { device: String },
    Disconnect,
    SetColor(u32),
    SetBrightness(u8),
    SetAnimation(String),
}

struct Session {
    requests: mpsc::UnboundedSender<Request>,
    worker: JoinHandle<()>,
}

/// Public face of the connection state machine.
///
/// Create once, `attach()` while a presentation surface is alive, `detach()`
/// when it goes away. State is recomputed by querying the adapter on every
/// attach, never cached across attachments.
pub struct ConnectionCoordinator<A: AdapterMonitor, T: Transport> {
    adapter: Arc<A>,
    link: Arc<LinkChannel<T>>,
    config: CoordinatorConfig,
    state_tx: Arc<watch::Sender<CoordinatorState>>,
    state_rx: watch::Receiver<CoordinatorState>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    animation_epoch: Arc<AtomicU64>,
    session: Mutex<Option<Session>>,
}

impl<A: AdapterMonitor, T: Transport> ConnectionCoordinator<A, T> {
    pub fn new(adapter: Arc<A>, link: Arc<LinkChannel<T>>) -> Self {
        Self::with_config(adapter, link, CoordinatorConfig::default())
    }

    pub fn with_config(
        adapter: Arc<A>,
        link: Arc<LinkChannel<T>>,
        config: CoordinatorConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            adapter,
            link,
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            events_tx,
            animation_epoch: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
        }
    }

    /// Start the worker and subscribe to all three upstream streams. The
    /// initial state is computed here, synchronously, by asking the adapter —
    /// the streams replay nothing, so silence must not be read as a state.
    ///
    /// Must be called from within a tokio runtime. Attaching twice is a no-op.
    pub fn attach(&self) {
        let mut session = self.session.lock().unwrap();
        if session.is_some() {
            debug!("attach ignored, already attached");
            return;
        }

        // Subscribe first, then seed by query: an event landing between the
        // two is buffered for the worker, never lost to the replay-none gap.
        let adapter_rx = self.adapter.observe();
        let link_rx = self.link.events();
        let inbound_rx = self.link.messages();

        let adapter_state = query_state(self.adapter.as_ref());
        let initial = derive_state(adapter_state, &LinkState::Disconnected);
        if *self.state_tx.borrow() != initial {
            let _ = self.state_tx.send(initial.clone());
            let _ = self.events_tx.send(CoordinatorEvent::State(initial));
        }

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            adapter: Arc::clone(&self.adapter),
            link: Arc::clone(&self.link),
            config: self.config.clone(),
            requests_rx,
            adapter_rx,
            link_rx,
            inbound_rx,
            state_tx: Arc::clone(&self.state_tx),
            events_tx: self.events_tx.clone(),
            animation_epoch: Arc::clone(&self.animation_epoch),
            adapter_state,
            link_state: LinkState::Disconnected,
            last_color: None,
            adapter_stream_dead: false,
            link_stream_dead: false,
            inbound_stream_dead: false,
        };
        *session = Some(Session {
            requests,
            worker: tokio::spawn(worker.run()),
        });
        info!("coordinator attached, adapter {adapter_state:?}");
    }

    /// Stop the worker and drop every upstream subscription, then close the
    /// link. Completes only after the worker is gone, so no event can reach a
    /// torn-down presentation layer once this returns.
    pub async fn detach(&self) {
        let session = self.session.lock().unwrap().take();
        let Some(Session { requests, worker }) = session else {
            return;
        };
        drop(requests);
        worker.abort();
        let _ = worker.await;
        let _ = self.link.disconnect();
        // Park the published state without emitting; subscribers are gone.
        self.state_tx.send_replace(CoordinatorState::Idle);
        info!("coordinator detached");
    }

    /// Subscribe to the coordinator's event stream (state changes, inbound
    /// lines, faults — all on one channel).
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    /// Watch handle on the derived state. `borrow()` is always the current
    /// authoritative answer.
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> CoordinatorState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    pub fn is_adapter_enabled(&self) -> bool {
        self.adapter.is_enabled().unwrap_or(false)
    }

    /// Snapshot of the adapter's paired-device registry, for device pickers.
    pub fn paired_devices(&self) -> Vec<Device> {
        self.adapter.paired_devices()
    }

    /// Resolve `device_name` against the paired registry and start a connect
    /// attempt. Outcome arrives on the event stream.
    pub fn connect(&self, device_name: &str) -> Result<(), CommandError> {
        self.send(Request::Connect {
            device: device_name.to_string(),
        })
    }

    /// Orderly disconnect: best-effort Bye, then close. A no-op when already
    /// disconnected.
    pub fn disconnect(&self) -> Result<(), CommandError> {
        self.send(Request::Disconnect)
    }

    /// Set a solid color. Repeated same-color requests inside the debounce
    /// window are dropped; different colors are never coalesced.
    pub fn set_color(&self, rgb: u32) -> Result<(), CommandError> {
        self.ensure_connected()?;
        self.send(Request::SetColor(rgb))
    }

    pub fn set_brightness(&self, value: u8) -> Result<(), CommandError> {
        self.ensure_connected()?;
        self.send(Request::SetBrightness(value))
    }

    /// Start a named animation: one immediate write plus a bounded retry that
    /// a newer animation command cancels.
    pub fn set_animation(&self, name: &str) -> Result<(), CommandError> {
        self.ensure_connected()?;
        self.send(Request::SetAnimation(name.to_string()))
    }

    fn ensure_connected(&self) -> Result<(), CommandError> {
        if !self.is_connected() {
            warn!("command rejected, link is not open");
            return Err(CommandError::InvalidState);
        }
        Ok(())
    }

    fn send(&self, request: Request) -> Result<(), CommandError> {
        let session = self.session.lock().unwrap();
        let Some(session) = session.as_ref() else {
            return Err(CommandError::Detached);
        };
        session
            .requests
            .send(request)
            .map_err(|_| CommandError::Detached)
    }
}

/// Collapse (adapter, link) into the observable coordinator state.
fn derive_state(adapter: AdapterState, link: &LinkState) -> CoordinatorState {
    match adapter {
        AdapterState::NotSupported => {
            CoordinatorState::BtUnavailable(BtUnavailableReason::NotSupported)
        }
        AdapterState::Disabled | AdapterState::Unknown => {
            CoordinatorState::BtUnavailable(BtUnavailableReason::Disabled)
        }
        AdapterState::Enabled => match link {
            LinkState::Connected { device } => CoordinatorState::Connected {
                device: device.clone(),
            },
            LinkState::Connecting => CoordinatorState::Connecting,
            LinkState::Disconnected | LinkState::Error(_) => CoordinatorState::Idle,
        },
    }
}

struct Worker<A: AdapterMonitor, T: Transport> {
    adapter: Arc<A>,
    link: Arc<LinkChannel<T>>,
    config: CoordinatorConfig,
    requests_rx: mpsc::UnboundedReceiver<Request>,
    adapter_rx: broadcast::Receiver<AdapterState>,
    link_rx: broadcast::Receiver<LinkState>,
    inbound_rx: broadcast::Receiver<String>,
    state_tx: Arc<watch::Sender<CoordinatorState>>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    animation_epoch: Arc<AtomicU64>,
    adapter_state: AdapterState,
    link_state: LinkState,
    last_color: Option<(u32, Instant)>,
    adapter_stream_dead: bool,
    link_stream_dead: bool,
    inbound_stream_dead: bool,
}

impl<A: AdapterMonitor, T: Transport> Worker<A, T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests_rx.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break, // detached
                },
                event = self.adapter_rx.recv(), if !self.adapter_stream_dead => {
                    self.on_adapter_recv(event);
                }
                event = self.link_rx.recv(), if !self.link_stream_dead => {
                    self.on_link_recv(event);
                }
                line = self.inbound_rx.recv(), if !self.inbound_stream_dead => {
                    self.on_inbound_recv(line);
                }
            }
        }
    }

    fn on_adapter_recv(&mut self, event: Result<AdapterState, broadcast::error::RecvError>) {
        match event {
            Ok(state) => self.apply_adapter(state),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("adapter stream lagged by {missed}, re-querying");
                let state = query_state(self.adapter.as_ref());
                self.apply_adapter(state);
            }
            Err(broadcast::error::RecvError::Closed) => {
                // The platform stream died; a queried, valid state beats a
                // silently frozen one.
                warn!("adapter stream ended, degrading to queried state");
                self.adapter_stream_dead = true;
                let state = query_state(self.adapter.as_ref());
                self.apply_adapter(state);
            }
        }
    }

    fn on_link_recv(&mut self, event: Result<LinkState, broadcast::error::RecvError>) {
        match event {
            Ok(event) => self.apply_link(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("link stream lagged by {missed}");
                if !self.link.is_open() {
                    self.apply_link(LinkState::Disconnected);
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("link stream ended");
                self.link_stream_dead = true;
                self.apply_link(LinkState::Disconnected);
            }
        }
    }

    fn on_inbound_recv(&mut self, line: Result<String, broadcast::error::RecvError>) {
        match line {
            Ok(line) => {
                debug!("inbound: {line}");
                self.emit(CoordinatorEvent::Inbound(line));
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("inbound stream lagged, {missed} lines dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.inbound_stream_dead = true;
            }
        }
    }

    fn apply_adapter(&mut self, observed: AdapterState) {
        if self.adapter_state == AdapterState::NotSupported {
            return; // terminal for the session
        }
        // The stream never replays the current state; Unknown means "go ask".
        let resolved = match observed {
            AdapterState::Unknown => query_state(self.adapter.as_ref()),
            other => other,
        };
        if resolved == self.adapter_state {
            return; // bursts of identical events collapse to nothing
        }
        info!("adapter {:?} -> {:?}", self.adapter_state, resolved);
        self.adapter_state = resolved;

        if resolved != AdapterState::Enabled
            && matches!(
                self.link_state,
                LinkState::Connected { .. } | LinkState::Connecting
            )
        {
            // The radio went away under an open (or opening) link. Force the
            // socket shut; no Bye, there is nothing left to carry it.
            let _ = self.link.disconnect();
            self.link_state = LinkState::Disconnected;
        }
        self.publish();
    }

    fn apply_link(&mut self, event: LinkState) {
        match event {
            LinkState::Connected { device } => {
                if self.adapter_state != AdapterState::Enabled {
                    // A dial landed after the radio went away. Never surface
                    // it; shut the socket instead.
                    warn!("link came up against an unavailable adapter, closing it");
                    let _ = self.link.disconnect();
                    return;
                }
                info!("connected to {device}");
                self.link_state = LinkState::Connected { device };
                self.link.write(&Command::Hello.encode());
                self.publish();
            }
            LinkState::Disconnected => {
                if matches!(
                    self.link_state,
                    LinkState::Connected { .. } | LinkState::Connecting
                ) {
                    self.link_state = LinkState::Disconnected;
                    self.publish();
                }
                // Redundant terminal events collapse silently.
            }
            LinkState::Error(err) => match &self.link_state {
                LinkState::Connecting => {
                    let fault = err.into_connect_error();
                    warn!("connect failed: {fault}");
                    self.link_state = LinkState::Disconnected;
                    self.emit(CoordinatorEvent::Fault(Fault::Connect(fault)));
                    self.publish();
                }
                LinkState::Connected { .. } => {
                    // Treated like a disconnect; the channel follows up with
                    // its terminal Disconnected event.
                    warn!("link error: {err}");
                    self.emit(CoordinatorEvent::Fault(Fault::Link(err)));
                }
                _ => debug!("link error while idle: {err}"),
            },
            // The channel never emits Connecting; it is coordinator-local.
            LinkState::Connecting => {}
        }
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Connect { device } => self.on_connect(device),
            Request::Disconnect => self.on_disconnect(),
            Request::SetColor(rgb) => self.on_set_color(rgb),
            Request::SetBrightness(value) => self.on_set_brightness(value),
            Request::SetAnimation(name) => self.on_set_animation(name),
        }
    }

    fn on_connect(&mut self, device: String) {
        if !matches!(
            self.link_state,
            LinkState::Disconnected | LinkState::Error(_)
        ) {
            // At most one attempt in flight per coordinator.
            debug!("connect ignored, link is {:?}", self.link_state);
            return;
        }
        if self.adapter_state != AdapterState::Enabled {
            self.emit(CoordinatorEvent::Fault(Fault::Connect(
                ConnectError::NoAdapter,
            )));
            return;
        }
        let address = self
            .adapter
            .paired_devices()
            .into_iter()
            .find(|d| d.name == device)
            .map(|d| d.address);
        let Some(address) = address else {
            self.emit(CoordinatorEvent::Fault(Fault::Connect(
                ConnectError::DeviceNotFound(device),
            )));
            return;
        };

        info!("connecting to {device} at {address}");
        self.link_state = LinkState::Connecting;
        self.publish();

        // The dial blocks for up to the timeout, so it runs on its own task;
        // the result comes back through the link's event stream.
        let link = Arc::clone(&self.link);
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let _ = link.connect(&address, timeout).await;
        });
    }

    fn on_disconnect(&mut self) {
        match self.link_state {
            LinkState::Connected { .. } => {
                self.link.write(&Command::Bye.encode());
                let _ = self.link.disconnect();
                self.link_state = LinkState::Disconnected;
                self.publish();
            }
            LinkState::Connecting => {
                // Operator aborts the attempt. No Bye; nothing is listening.
                let _ = self.link.disconnect();
                self.link_state = LinkState::Disconnected;
                self.publish();
            }
            _ => {
                // Already down; keep the channel's per-call contract anyway.
                let _ = self.link.disconnect();
            }
        }
    }

    fn on_set_color(&mut self, rgb: u32) {
        if !self.writes_allowed("color") {
            return;
        }
        let masked = rgb & 0x00FF_FFFF;
        let now = Instant::now();
        if let Some((last, at)) = self.last_color {
            if last == masked && now.duration_since(at) < self.config.color_debounce {
                debug!("color #{masked:06X} debounced");
                return;
            }
        }
        self.last_color = Some((masked, now));
        self.link.write(&Command::SetColor(rgb).encode());
    }

    fn on_set_brightness(&mut self, value: u8) {
        if !self.writes_allowed("brightness") {
            return;
        }
        self.link.write(&Command::SetBrightness(value).encode());
    }

    fn on_set_animation(&mut self, name: String) {
        if !self.writes_allowed("animation") {
            return;
        }
        let epoch = self.animation_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let line = Command::SetAnimation(name).encode();
        self.link.write(&line);

        if self.config.animation_retry_attempts == 0 {
            return;
        }
        // Resend a few times for the lossy radio link, backing off, and stop
        // as soon as a newer animation supersedes this one or the link drops.
        let link = Arc::clone(&self.link);
        let epochs = Arc::clone(&self.animation_epoch);
        let state_rx = self.state_tx.subscribe();
        let attempts = self.config.animation_retry_attempts;
        let mut backoff = self.config.animation_retry_backoff;
        tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::time::sleep(backoff).await;
                if epochs.load(Ordering::SeqCst) != epoch {
                    return;
                }
                if !state_rx.borrow().is_connected() {
                    return;
                }
                link.write(&line);
                backoff *= 2;
            }
        });
    }

    /// Worker-side write gate. The public API already rejects with
    /// `InvalidState`; this re-check covers requests that were in flight when
    /// the link dropped.
    fn writes_allowed(&self, what: &str) -> bool {
        if matches!(self.link_state, LinkState::Connected { .. }) {
            true
        } else {
            warn!("{what} write dropped, link is not open");
            false
        }
    }

    fn publish(&mut self) {
        let state = derive_state(self.adapter_state, &self.link_state);
        if *self.state_tx.borrow() == state {
            return;
        }
        let _ = self.state_tx.send(state.clone());
        self.emit(CoordinatorEvent::State(state));
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::link::{BoxedStream, DialFuture};
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::{timeout as within, Duration};

    const DEVICE: &str = "Device-A";
    const ADDRESS: &str = "AA:BB:CC:00:11:22";

    struct MockAdapter {
        tx: broadcast::Sender<AdapterState>,
        enabled: AtomicBool,
        supported: AtomicBool,
        devices: Vec<Device>,
    }

    impl MockAdapter {
        fn new(enabled: bool) -> Arc<Self> {
            let (tx, _) = broadcast::channel(16);
            Arc::new(Self {
                tx,
                enabled: AtomicBool::new(enabled),
                supported: AtomicBool::new(true),
                devices: vec![Device {
                    name: DEVICE.into(),
                    address: ADDRESS.into(),
                }],
            })
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn emit(&self, state: AdapterState) {
            let _ = self.tx.send(state);
        }
    }

    impl AdapterMonitor for MockAdapter {
        fn observe(&self) -> broadcast::Receiver<AdapterState> {
            self.tx.subscribe()
        }

        fn is_enabled(&self) -> Result<bool, crate::error::AdapterError> {
            Ok(self.enabled.load(Ordering::SeqCst))
        }

        fn is_supported(&self) -> bool {
            self.supported.load(Ordering::SeqCst)
        }

        fn paired_devices(&self) -> Vec<Device> {
            self.devices.clone()
        }
    }

    enum Dial {
        Accept,
        AcceptAfter(Duration),
        Refuse,
    }

    struct ScriptedTransport {
        dial: Dial,
        peers: UnboundedSender<DuplexStream>,
    }

    impl ScriptedTransport {
        fn new(dial: Dial) -> (Self, UnboundedReceiver<DuplexStream>) {
            let (peers, peers_rx) = unbounded_channel();
            (Self { dial, peers }, peers_rx)
        }
    }

    impl Transport for ScriptedTransport {
        fn open<'a>(&'a self, _address: &'a str, _timeout: Duration) -> DialFuture<'a> {
            Box::pin(async move {
                match self.dial {
                    Dial::Accept => {}
                    Dial::AcceptAfter(delay) => tokio::time::sleep(delay).await,
                    Dial::Refuse => return Err(LinkError::Refused),
                }
                let (near, far) = tokio::io::duplex(1024);
                let _ = self.peers.send(far);
                Ok(Box::new(near) as BoxedStream)
            })
        }
    }

    struct Rig {
        adapter: Arc<MockAdapter>,
        coordinator: ConnectionCoordinator<MockAdapter, ScriptedTransport>,
        events: broadcast::Receiver<CoordinatorEvent>,
        peers: UnboundedReceiver<DuplexStream>,
    }

    fn rig(enabled: bool, dial: Dial) -> Rig {
        let adapter = MockAdapter::new(enabled);
        let (transport, peers) = ScriptedTransport::new(dial);
        let link = Arc::new(LinkChannel::new(transport));
        let config = CoordinatorConfig {
            connect_timeout: Duration::from_secs(5),
            color_debounce: Duration::from_millis(100),
            animation_retry_attempts: 2,
            animation_retry_backoff: Duration::from_millis(50),
        };
        let coordinator =
            ConnectionCoordinator::with_config(Arc::clone(&adapter), link, config);
        coordinator.attach();
        let events = coordinator.subscribe();
        Rig {
            adapter,
            coordinator,
            events,
            peers,
        }
    }

    async fn next_state(events: &mut broadcast::Receiver<CoordinatorEvent>) -> CoordinatorState {
        loop {
            let event = within(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for coordinator event")
                .expect("event stream closed");
            if let CoordinatorEvent::State(state) = event {
                return state;
            }
        }
    }

    async fn next_fault(events: &mut broadcast::Receiver<CoordinatorEvent>) -> Fault {
        loop {
            let event = within(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for coordinator event")
                .expect("event stream closed");
            if let CoordinatorEvent::Fault(fault) = event {
                return fault;
            }
        }
    }

    async fn read_line(peer: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        within(Duration::from_secs(5), peer.read_line(&mut line))
            .await
            .expect("timed out reading peer line")
            .expect("peer read failed");
        line
    }

    /// Attach, connect, consume the Connecting/Connected states and the
    /// Hello write. Starting point for every connected-state test.
    async fn connected_rig() -> (Rig, BufReader<DuplexStream>) {
        let mut rig = rig(true, Dial::Accept);
        rig.coordinator.connect(DEVICE).unwrap();
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Connecting);
        assert_eq!(
            next_state(&mut rig.events).await,
            CoordinatorState::Connected {
                device: ADDRESS.into()
            }
        );
        let mut peer = BufReader::new(rig.peers.recv().await.unwrap());
        assert_eq!(read_line(&mut peer).await, "CONNECTED\r\n");
        (rig, peer)
    }

    #[tokio::test]
    async fn attach_computes_initial_state_by_query() {
        let rig = rig(false, Dial::Accept);
        assert_eq!(
            rig.coordinator.current_state(),
            CoordinatorState::BtUnavailable(BtUnavailableReason::Disabled)
        );
        assert!(!rig.coordinator.is_adapter_enabled());
    }

    #[tokio::test]
    async fn adapter_enabling_moves_to_idle() {
        let mut rig = rig(false, Dial::Accept);
        rig.adapter.set_enabled(true);
        rig.adapter.emit(AdapterState::Enabled);
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn connect_walks_idle_connecting_connected_and_says_hello() {
        let (rig, _peer) = connected_rig().await;
        assert!(rig.coordinator.is_connected());
    }

    #[tokio::test]
    async fn connect_with_unknown_device_faults_and_stays_idle() {
        let mut rig = rig(true, Dial::Accept);
        rig.coordinator.connect("Nobody").unwrap();
        assert_eq!(
            next_fault(&mut rig.events).await,
            Fault::Connect(ConnectError::DeviceNotFound("Nobody".into()))
        );
        assert_eq!(rig.coordinator.current_state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn connect_without_adapter_faults_no_adapter() {
        let mut rig = rig(false, Dial::Accept);
        rig.coordinator.connect(DEVICE).unwrap();
        assert_eq!(
            next_fault(&mut rig.events).await,
            Fault::Connect(ConnectError::NoAdapter)
        );
    }

    #[tokio::test]
    async fn refused_dial_faults_and_returns_to_idle() {
        let mut rig = rig(true, Dial::Refuse);
        rig.coordinator.connect(DEVICE).unwrap();
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Connecting);
        assert_eq!(
            next_fault(&mut rig.events).await,
            Fault::Connect(ConnectError::Refused)
        );
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn adapter_disabled_while_connected_forces_one_disconnect_without_bye() {
        let (mut rig, mut peer) = connected_rig().await;
        let mut link_events = rig.coordinator.link.events();

        rig.adapter.set_enabled(false);
        // A burst of identical events must collapse to one side effect.
        rig.adapter.emit(AdapterState::Disabled);
        rig.adapter.emit(AdapterState::Disabled);
        rig.adapter.emit(AdapterState::Disabled);

        assert_eq!(
            next_state(&mut rig.events).await,
            CoordinatorState::BtUnavailable(BtUnavailableReason::Disabled)
        );

        // Exactly one terminal event from the channel, and no Bye on the wire.
        assert_eq!(
            within(Duration::from_secs(5), link_events.recv()).await.unwrap().unwrap(),
            LinkState::Disconnected
        );
        assert!(within(Duration::from_millis(50), link_events.recv())
            .await
            .is_err());
        let mut leftover = String::new();
        let read = within(Duration::from_secs(5), peer.read_line(&mut leftover)).await;
        assert!(matches!(read, Ok(Ok(0))), "expected clean EOF, got {leftover:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_disabled_during_dial_never_surfaces_connected() {
        let mut rig = rig(true, Dial::AcceptAfter(Duration::from_millis(100)));
        rig.coordinator.connect(DEVICE).unwrap();
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Connecting);

        rig.adapter.set_enabled(false);
        rig.adapter.emit(AdapterState::Disabled);
        assert_eq!(
            next_state(&mut rig.events).await,
            CoordinatorState::BtUnavailable(BtUnavailableReason::Disabled)
        );

        // Let the dial land late; it must be shut down, not surfaced.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!rig.coordinator.is_connected());
        assert!(within(Duration::from_millis(50), rig.events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn operator_disconnect_sends_bye_then_closes() {
        let (mut rig, mut peer) = connected_rig().await;
        rig.coordinator.disconnect().unwrap();
        assert_eq!(read_line(&mut peer).await, "DISCONNECTED\r\n");
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Idle);
        assert!(!rig.coordinator.is_connected());
    }

    #[tokio::test]
    async fn disconnect_when_already_idle_is_clean() {
        let mut rig = rig(true, Dial::Accept);
        rig.coordinator.disconnect().unwrap();
        // No fault, no state change.
        assert!(within(Duration::from_millis(50), rig.events.recv())
            .await
            .is_err());
        assert_eq!(rig.coordinator.current_state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn same_color_inside_window_coalesces_different_color_does_not() {
        let (rig, mut peer) = connected_rig().await;

        rig.coordinator.set_color(0xFF_0000).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_COLOR#FF0000\r\n");

        // Same color again, immediately: dropped. A different color and a
        // brightness write must still go through, in order.
        rig.coordinator.set_color(0xFF_0000).unwrap();
        rig.coordinator.set_color(0x00_FF00).unwrap();
        rig.coordinator.set_brightness(10).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_COLOR#00FF00\r\n");
        assert_eq!(read_line(&mut peer).await, "SET_BRIGHTNESS10\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn same_color_after_window_is_accepted() {
        let (rig, mut peer) = connected_rig().await;

        rig.coordinator.set_color(0x12_3456).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_COLOR#123456\r\n");

        tokio::time::sleep(Duration::from_millis(150)).await;
        rig.coordinator.set_color(0x12_3456).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_COLOR#123456\r\n");
    }

    #[tokio::test]
    async fn alpha_bits_are_masked_for_debounce_and_wire() {
        let (rig, mut peer) = connected_rig().await;
        rig.coordinator.set_color(0xFFAA_BBCC).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_COLOR#AABBCC\r\n");
        // Same 24-bit color under a different alpha still coalesces.
        rig.coordinator.set_color(0x00AA_BBCC).unwrap();
        rig.coordinator.set_brightness(1).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_BRIGHTNESS1\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn animation_retries_until_superseded() {
        let (rig, mut peer) = connected_rig().await;

        rig.coordinator.set_animation("rainbow").unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_ANIMATIONRAINBOW\r\n");

        // Supersede before any retry fires: rainbow's retries must vanish,
        // pulse gets its one write plus two retries.
        rig.coordinator.set_animation("pulse").unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_ANIMATIONPULSE\r\n");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(read_line(&mut peer).await, "SET_ANIMATIONPULSE\r\n");
        assert_eq!(read_line(&mut peer).await, "SET_ANIMATIONPULSE\r\n");

        let mut extra = String::new();
        assert!(within(Duration::from_millis(50), peer.read_line(&mut extra))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn commands_require_an_open_link() {
        let rig = rig(true, Dial::Accept);
        assert_eq!(
            rig.coordinator.set_color(0xFF_0000),
            Err(CommandError::InvalidState)
        );
        assert_eq!(
            rig.coordinator.set_brightness(5),
            Err(CommandError::InvalidState)
        );
        assert_eq!(
            rig.coordinator.set_animation("rainbow"),
            Err(CommandError::InvalidState)
        );
    }

    #[tokio::test]
    async fn commands_require_attachment() {
        let adapter = MockAdapter::new(true);
        let (transport, _peers) = ScriptedTransport::new(Dial::Accept);
        let link = Arc::new(LinkChannel::new(transport));
        let coordinator = ConnectionCoordinator::new(adapter, link);
        assert_eq!(coordinator.connect(DEVICE), Err(CommandError::Detached));
    }

    #[tokio::test]
    async fn inbound_lines_pass_through_unparsed() {
        let (mut rig, mut peer) = connected_rig().await;
        peer.get_mut().write_all(b"BRIGHTNESS:77\r\n").await.unwrap();
        loop {
            let event = within(Duration::from_secs(5), rig.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let CoordinatorEvent::Inbound(line) = event {
                assert_eq!(line, "BRIGHTNESS:77");
                break;
            }
        }
    }

    #[tokio::test]
    async fn peer_death_surfaces_fault_and_returns_to_idle() {
        let (mut rig, peer) = connected_rig().await;
        drop(peer);
        assert!(matches!(
            next_fault(&mut rig.events).await,
            Fault::Link(LinkError::Io(_))
        ));
        assert_eq!(next_state(&mut rig.events).await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn detach_closes_the_link_and_stops_the_worker() {
        let (rig, mut peer) = connected_rig().await;
        rig.coordinator.detach().await;

        let mut leftover = String::new();
        let read = within(Duration::from_secs(5), peer.read_line(&mut leftover)).await;
        assert!(matches!(read, Ok(Ok(0))), "expected EOF after detach");

        assert!(!rig.coordinator.is_connected());
        assert_eq!(rig.coordinator.connect(DEVICE), Err(CommandError::Detached));

        // Reattach recomputes state from a fresh query.
        rig.coordinator.attach();
        assert_eq!(rig.coordinator.current_state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn second_connect_while_connected_is_ignored() {
        let (rig, mut peer) = connected_rig().await;
        rig.coordinator.connect(DEVICE).unwrap();
        // Still connected, no second hello.
        rig.coordinator.set_brightness(3).unwrap();
        assert_eq!(read_line(&mut peer).await, "SET_BRIGHTNESS3\r\n");
        assert!(rig.coordinator.is_connected());
    }
}
