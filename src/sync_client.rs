use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{SyncError, TransportError};
use crate::forwarder::{ForwardOutcome, ReadingForwarder};
use crate::normalize::normalize_value;
use crate::protocol::{AUTO_CONNECT_KEY, DEFAULT_REQUEST_TIMEOUT, LAST_CONNECTED_KEY, SENSOR_READINGS_PATH};
use crate::scheduler::{PollTimer, RetryBudget, SchedulePolicy};
use crate::state::{ConnectionMachine, Trigger};
use crate::store::{bearer_token, user_id_or_default, Credentials, KeyValueStore};
use crate::transport::{DeviceRequest, Endpoints, Fetched, HttpTransport, TransportSelector};
use crate::types::{
    CanonicalReading, ConnectionState, SyncEvent, SyncPayload, SyncStatus, TransportMode, Variant,
    Visibility,
};

// ── SyncClientConfig ──────────────────────────────────────────────────────────

/// Configuration for [`SyncClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncClientConfig {
    /// Device on the local network. Default: `http://192.168.4.1` (the ESP32
    /// soft-AP address).
    pub device_base_url: String,
    /// Backend hosting `/sensor-readings` and the `/esp32` relay.
    /// Default: `http://localhost:8000`.
    pub backend_base_url: String,
    /// Per-request timeout. Default: 5 s.
    pub request_timeout: Duration,
    /// Which poll loop to run. Default: foreground.
    pub variant: Variant,
    /// Route for the first request. Ignored by the background variant, which
    /// is always proxied. Default: direct.
    pub initial_mode: TransportMode,
    /// Capacity of the event channel; events are dropped when it is full.
    /// Default: `256`.
    pub event_capacity: usize,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            device_base_url: "http://192.168.4.1".into(),
            backend_base_url: "http://localhost:8000".into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            variant: Variant::Foreground,
            initial_mode: TransportMode::Direct,
            event_capacity: 256,
        }
    }
}

impl SyncClientConfig {
    /// Defaults overlaid with environment variables:
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `PULSE_DEVICE_URL` | `device_base_url` |
    /// | `PULSE_BACKEND_URL` | `backend_base_url` |
    /// | `PULSE_REQUEST_TIMEOUT_SECS` | `request_timeout` |
    /// | `PULSE_VARIANT` (`foreground`/`background`) | `variant` |
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = env::var("PULSE_DEVICE_URL") {
            config.device_base_url = url;
        }
        if let Ok(url) = env::var("PULSE_BACKEND_URL") {
            config.backend_base_url = url;
        }
        if let Ok(secs) = env::var("PULSE_REQUEST_TIMEOUT_SECS") {
            let secs: f64 = secs
                .trim()
                .parse()
                .with_context(|| format!("PULSE_REQUEST_TIMEOUT_SECS={secs:?} is not a number"))?;
            if !(secs.is_finite() && secs > 0.0) {
                bail!("PULSE_REQUEST_TIMEOUT_SECS must be positive");
            }
            config.request_timeout = Duration::from_secs_f64(secs);
        }
        if let Ok(variant) = env::var("PULSE_VARIANT") {
            config.variant = match variant.trim().to_ascii_lowercase().as_str() {
                "foreground" | "fg" => Variant::Foreground,
                "background" | "bg" => Variant::Background,
                other => bail!("PULSE_VARIANT={other:?}; expected foreground or background"),
            };
        }
        Ok(config)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            device_base: self.device_base_url.clone(),
            backend_base: self.backend_base_url.clone(),
        }
    }
}

// ── Tick plumbing ─────────────────────────────────────────────────────────────

/// Why a running poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The auto-connect flag was cleared outside the client.
    AutoConnectCleared,
    /// The bearer token disappeared from the store.
    MissingCredentials,
}

/// Result of one [`SyncClient::tick`].
#[derive(Debug)]
pub enum TickOutcome {
    /// Polling is not active.
    Idle,
    /// The loop stopped before fetching.
    Stopped(StopReason),
    /// The poll finished after a disconnect or reconnect; its result was
    /// discarded.
    Stale,
    /// The device answered. `forward` is the detached backend delivery; it
    /// resolves to [`ForwardOutcome::WarmingUp`] without a request while
    /// both vital signs are zero.
    Reading {
        reading: CanonicalReading,
        forward: JoinHandle<ForwardOutcome>,
    },
    /// The device could not be reached. `stopped` is set when this failure
    /// exhausted the retry budget.
    Failed { error: TransportError, stopped: bool },
}

/// A poll ready to run off the scheduler task.
pub struct PollRequest {
    selector: TransportSelector,
    mode: TransportMode,
    token: String,
    epoch: u64,
}

impl PollRequest {
    pub async fn run(self) -> Polled {
        let fetched = self
            .selector
            .fetch_raw(self.mode, DeviceRequest::Readings, &self.token)
            .await;
        Polled { fetched, token: self.token, epoch: self.epoch }
    }
}

/// A finished poll, waiting to be applied with [`SyncClient::finish_tick`].
#[derive(Debug)]
pub struct Polled {
    fetched: Fetched,
    token: String,
    epoch: u64,
}

// ── SyncClient ────────────────────────────────────────────────────────────────

/// Device telemetry sync client.
///
/// One instance per session owns the connection state, the transport mode,
/// and the retry budget; nothing else mutates them. A client can be driven
/// directly (`connect`, `tick`, `disconnect`) or handed to
/// [`SyncClient::spawn`], which runs the poll timer on a tokio task and
/// returns a [`SyncHandle`].
///
/// The foreground and background variants are independent instances; they
/// only observe each other through the shared store.
pub struct SyncClient {
    variant: Variant,
    policy: SchedulePolicy,
    selector: TransportSelector,
    forwarder: ReadingForwarder,
    store: Arc<dyn KeyValueStore>,
    machine: ConnectionMachine,
    mode: TransportMode,
    visibility: Visibility,
    budget: RetryBudget,
    polling: bool,
    last_reading: Option<CanonicalReading>,
    last_error: Option<String>,
    events: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Build a client and the receiver for its events.
    pub fn new(
        config: SyncClientConfig,
        http: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let policy = SchedulePolicy::for_variant(config.variant);
        let endpoints = config.endpoints();
        let forwarder = ReadingForwarder::new(http.clone(), endpoints.backend_url(SENSOR_READINGS_PATH));
        let selector = TransportSelector::new(http, endpoints);
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));

        let client = Self {
            variant: config.variant,
            mode: policy.pinned_mode.unwrap_or(config.initial_mode),
            budget: RetryBudget::new(policy.max_consecutive_failures),
            policy,
            selector,
            forwarder,
            store,
            machine: ConnectionMachine::new(),
            visibility: Visibility::Visible,
            polling: false,
            last_reading: None,
            last_error: None,
            events: tx,
        };
        (client, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            variant: self.variant,
            state: self.machine.state(),
            mode: self.mode,
            visibility: self.visibility,
            polling: self.polling,
            last_reading: self.last_reading,
            last_error: self.last_error.clone(),
            consecutive_failures: self.budget.failures(),
        }
    }

    /// Current poll period, or `None` while polling is inactive.
    pub fn poll_period(&self) -> Option<Duration> {
        self.polling.then(|| self.policy.period(self.visibility))
    }

    // ── Public: lifecycle ─────────────────────────────────────────────────────

    /// Explicit user connect (foreground variant only).
    ///
    /// Rejected with [`SyncError::MissingCredentials`] before any request when
    /// the token or user id is missing. Otherwise probes `/connect` (with
    /// the usual direct → proxied fallback) and, on an acknowledging answer,
    /// enters `Connected`, remembers the connection, and starts polling.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        if self.variant == Variant::Background {
            return Err(SyncError::Unsupported(
                "the background loop has no explicit connect; enable auto-connect and start it",
            ));
        }
        let creds = Credentials::load(self.store.as_ref()).ok_or(SyncError::MissingCredentials)?;

        if self.transition(Trigger::ConnectRequested).is_none() {
            debug!("connect: already {}", self.machine.state());
            return Ok(());
        }
        info!("Connecting to device ({}) as user {} …", self.mode, creds.user_id);

        let fetched = self
            .selector
            .fetch_raw(self.mode, DeviceRequest::Connect, &creds.token)
            .await;
        self.commit_mode(fetched.mode);

        let outcome = fetched.result.and_then(|body| {
            if acknowledges(&body) {
                Ok(())
            } else {
                Err(TransportError::ProtocolMismatch(format!(
                    "connect was not acknowledged: {body}"
                )))
            }
        });

        match outcome {
            Ok(()) => {
                self.transition(Trigger::ProbeSucceeded);
                self.clear_error();
                self.store.set_flag(LAST_CONNECTED_KEY, true);
                self.start_polling();
                info!("Connected via {}", self.mode);
                Ok(())
            }
            Err(e) => {
                warn!("Connect failed: {e}");
                self.transition(Trigger::ProbeFailed);
                self.report_error(&e);
                Err(e.into())
            }
        }
    }

    /// Start polling if this variant's persisted gate allows it.
    ///
    /// * Foreground: resumes when the last-known-connected flag is set,
    ///   without a new handshake; the state becomes `Connected` on the first
    ///   successful poll.
    /// * Background: starts when the auto-connect flag is set.
    ///
    /// Returns `Ok(false)` when the gate is closed, and
    /// [`SyncError::MissingCredentials`] when it is open but the session has
    /// no credentials.
    pub fn start(&mut self) -> Result<bool, SyncError> {
        if self.polling {
            return Ok(true);
        }
        let gate = match self.variant {
            Variant::Foreground => LAST_CONNECTED_KEY,
            Variant::Background => AUTO_CONNECT_KEY,
        };
        if !self.store.flag(gate) {
            debug!("start: {gate} not set; staying idle");
            return Ok(false);
        }
        if Credentials::load(self.store.as_ref()).is_none() {
            warn!("start: {gate} is set but credentials are missing");
            return Err(SyncError::MissingCredentials);
        }
        info!("Resuming {:?} polling", self.variant);
        self.start_polling();
        Ok(true)
    }

    /// Explicit user disconnect.
    ///
    /// Idempotent. Stops polling, forgets the remembered connection, and
    /// invalidates any poll still in flight.
    pub fn disconnect(&mut self) {
        self.transition(Trigger::DisconnectRequested);
        if self.variant == Variant::Foreground {
            self.store.set_flag(LAST_CONNECTED_KEY, false);
        }
        self.stop_polling();
        info!("Disconnected");
    }

    /// Record a page visibility change.
    ///
    /// Returns the new poll period when it changed and polling is active;
    /// the scheduler replaces its timer in that case.
    pub fn set_visibility(&mut self, visibility: Visibility) -> Option<Duration> {
        if self.visibility == visibility {
            return None;
        }
        let before = self.poll_period();
        self.visibility = visibility;
        let after = self.poll_period();
        debug!("Visibility now {visibility:?}");
        (after != before).then_some(after).flatten()
    }

    // ── Public: polling ───────────────────────────────────────────────────────

    /// Run one complete poll cycle: fetch, normalize, update state, forward.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.begin_tick() {
            Ok(request) => {
                let polled = request.run().await;
                self.finish_tick(polled)
            }
            Err(outcome) => outcome,
        }
    }

    /// First half of [`SyncClient::tick`]: decide whether to poll and capture
    /// what the request needs. The returned request is `Send + 'static` so
    /// the scheduler can run it while it keeps serving commands.
    pub fn begin_tick(&mut self) -> Result<PollRequest, TickOutcome> {
        if !self.polling {
            return Err(TickOutcome::Idle);
        }
        if self.policy.requires_auto_connect && !self.store.flag(AUTO_CONNECT_KEY) {
            info!("Auto-connect was disabled; stopping background polling");
            self.transition(Trigger::PollingStopped);
            self.stop_polling();
            return Err(TickOutcome::Stopped(StopReason::AutoConnectCleared));
        }
        let Some(token) = bearer_token(self.store.as_ref()) else {
            warn!("Bearer token gone; stopping polling");
            self.transition(Trigger::PollingStopped);
            self.stop_polling();
            return Err(TickOutcome::Stopped(StopReason::MissingCredentials));
        };
        Ok(PollRequest {
            selector: self.selector.clone(),
            mode: self.mode,
            token,
            epoch: self.machine.epoch(),
        })
    }

    /// Second half of [`SyncClient::tick`]: apply a finished poll.
    pub fn finish_tick(&mut self, polled: Polled) -> TickOutcome {
        self.commit_mode(polled.fetched.mode);

        if !self.polling || !self.machine.is_current(polled.epoch) {
            debug!("Discarding stale poll result");
            return TickOutcome::Stale;
        }

        match polled.fetched.result {
            Ok(body) => {
                let reading = normalize_value(&body);
                debug!("Reading: {reading:?}");
                self.transition(Trigger::PollSucceeded);
                self.budget.reset();
                self.last_reading = Some(reading);
                self.emit(SyncEvent::Reading(reading));
                self.clear_error();
                let forward = self.spawn_forward(&reading, polled.token);
                TickOutcome::Reading { reading, forward }
            }
            Err(error) => {
                warn!("Poll failed ({}): {error}", self.mode);
                self.transition(Trigger::PollFailed);
                self.report_error(&error);
                let stopped = self.budget.record_failure();
                if stopped {
                    warn!(
                        "{} consecutive failures; disabling auto-connect",
                        self.budget.failures()
                    );
                    self.store.set_flag(AUTO_CONNECT_KEY, false);
                    self.emit(SyncEvent::AutoConnectDisabled);
                    self.stop_polling();
                }
                TickOutcome::Failed { error, stopped }
            }
        }
    }

    /// Run the client on a tokio task. See [`SyncHandle`].
    pub fn spawn(self) -> SyncHandle {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(rx));
        SyncHandle { commands: tx }
    }

    // ── Private: scheduler task ───────────────────────────────────────────────

    /// Timer-driven loop. At most one poll is in flight; timer firings while
    /// it runs are skipped. Commands are served while a poll is in flight and
    /// the poll's result is applied afterwards only if still current.
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut timer = PollTimer::new();
        let mut in_flight: Option<JoinHandle<Polled>> = None;
        timer.set(self.poll_period());

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
                _ = timer.tick(), if in_flight.is_none() => {
                    if let Ok(request) = self.begin_tick() {
                        in_flight = Some(tokio::spawn(request.run()));
                    }
                }
                joined = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match joined {
                        Ok(polled) => {
                            self.finish_tick(polled);
                        }
                        Err(e) => warn!("Poll task failed: {e}"),
                    }
                }
            }
            timer.set(self.poll_period());
        }

        debug!("Sync client task exiting");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::SetVisibility(visibility, reply) => {
                self.set_visibility(visibility);
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    // ── Private: helpers ──────────────────────────────────────────────────────

    fn transition(&mut self, trigger: Trigger) -> Option<ConnectionState> {
        let changed = self.machine.apply(trigger);
        if let Some(state) = changed {
            info!("State → {state}");
            self.emit(SyncEvent::StateChanged(state));
        }
        changed
    }

    fn commit_mode(&mut self, mode: TransportMode) {
        if self.policy.pinned_mode.is_some() || mode == self.mode {
            return;
        }
        info!("Transport {} → {mode} for the rest of the session", self.mode);
        self.mode = mode;
        self.emit(SyncEvent::TransportChanged(mode));
    }

    fn start_polling(&mut self) {
        self.budget.reset();
        self.polling = true;
    }

    fn stop_polling(&mut self) {
        if self.polling {
            self.polling = false;
            self.emit(SyncEvent::Stopped);
        }
    }

    fn report_error(&mut self, error: &TransportError) {
        if !self.policy.reports_errors {
            return;
        }
        let text = error.to_string();
        self.last_error = Some(text.clone());
        self.emit(SyncEvent::Error(text));
    }

    fn clear_error(&mut self) {
        if self.last_error.take().is_some() {
            self.emit(SyncEvent::ErrorCleared);
        }
    }

    fn spawn_forward(
        &self,
        reading: &CanonicalReading,
        token: String,
    ) -> JoinHandle<ForwardOutcome> {
        let payload = SyncPayload::new(user_id_or_default(self.store.as_ref()), reading);
        let forwarder = self.forwarder.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = forwarder.forward(Some(&token), &payload).await;
            if let ForwardOutcome::Stored(id) = &outcome {
                let _ = events.try_send(SyncEvent::Forwarded(id.clone()));
            }
            outcome
        })
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Event dropped: {e}");
        }
    }
}

/// Whether a `/connect` body acknowledges the handshake.
///
/// Everything that is not empty, zero, or `false` counts, except an object
/// whose `connected`, `ok`, or `success` member is explicitly `false`.
pub fn acknowledges(body: &Value) -> bool {
    match body {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) => true,
        Value::Object(map) => !["connected", "ok", "success"]
            .iter()
            .any(|k| map.get(*k) == Some(&Value::Bool(false))),
    }
}

/// Await the in-flight poll, or never resolve when there is none.
async fn join_in_flight(
    slot: &mut Option<JoinHandle<Polled>>,
) -> Result<Polled, tokio::task::JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

// ── SyncHandle ────────────────────────────────────────────────────────────────

enum Command {
    Connect(oneshot::Sender<Result<(), SyncError>>),
    Start(oneshot::Sender<Result<bool, SyncError>>),
    Disconnect(oneshot::Sender<()>),
    SetVisibility(Visibility, oneshot::Sender<()>),
    Status(oneshot::Sender<SyncStatus>),
    Shutdown,
}

/// Handle to a client running under [`SyncClient::spawn`].
///
/// Cheap to clone. Every method waits until the scheduler task has processed
/// the command. Once the task has exited they return [`SyncError::Closed`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
}

impl SyncHandle {
    /// See [`SyncClient::connect`].
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.request(Command::Connect).await?
    }

    /// See [`SyncClient::start`].
    pub async fn start(&self) -> Result<bool, SyncError> {
        self.request(Command::Start).await?
    }

    /// See [`SyncClient::disconnect`].
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(Command::Disconnect).await
    }

    /// See [`SyncClient::set_visibility`].
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), SyncError> {
        self.request(|reply| Command::SetVisibility(visibility, reply)).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.request(Command::Status).await
    }

    /// Stop the scheduler task. Polls in flight finish but are not applied.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}
