//! Realtime connection lifecycle.
//!
//! Provides:
//! - Connection state machine (connect, reconnect with backoff, cleanup)
//! - Heartbeat and health-check liveness timers
//! - Table-change subscriptions multiplexed over one connection
//! - Observer callbacks for state changes, errors and reconnect attempts
//!
//! ```text
//! disconnected ──► connecting ──► connected
//!                      │              │ error
//!                      ▼              ▼
//!                   failed ◄──── reconnecting ──► connected
//!                      │  (after max attempts: terminal)
//!   any state ──► offline ──(network up)──► reconnecting
//! ```
//!
//! All mutable state sits behind one mutex that is never held across an
//! `.await`. Background work runs as tokio tasks that observe cancellation
//! tokens, so `cleanup()` stops every loop deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ChannelHandle, ChannelId, RealtimeBackend};
use crate::config::ConnectionConfig;
use crate::error::{ErrorKind, TransportError};
use crate::network::NetworkMonitor;
use crate::protocol::{ChangeEvent, ChangeSpec, ChannelMessage, ChannelStatus};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Offline,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to observers registered with `add_callback`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        message: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    ReconnectAttempt {
        attempt: u32,
        delay: Duration,
    },
}

/// Snapshot for status indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub message: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<ErrorKind>,
    /// Offer a manual "Retry" action
    pub can_retry: bool,
    /// Offer "Continue offline": recovery looks unlikely
    pub can_continue_offline: bool,
}

/// Errors returned by [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("device is offline")]
    Offline,
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// `cleanup()` or an offline signal arrived while the attempt was in flight
    #[error("connection attempt was superseded")]
    Superseded,
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Offline => ErrorKind::NetworkError,
            ConnectionError::Transport(e) => e.kind,
            ConnectionError::Superseded => ErrorKind::Unknown,
        }
    }
}

type Observer = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Core {
    state: ConnectionState,
    message: String,
    /// Reconnect attempts since the last successful connect
    attempts: u32,
    online: bool,
    /// A connectivity probe is running
    in_flight: bool,
    /// Bumped by cleanup/offline; stale attempts compare and bail out
    epoch: u64,
    last_error: Option<TransportError>,
}

/// A running background task and the token that stops it.
struct TimerSlot {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<TimerSlot>,
    health_check: Option<TimerSlot>,
    reconnect: Option<TimerSlot>,
}

impl Timers {
    fn replace(slot: &mut Option<TimerSlot>, next: TimerSlot) {
        if let Some(old) = slot.replace(next) {
            old.token.cancel();
        }
    }

    fn cancel(slot: &mut Option<TimerSlot>) {
        if let Some(old) = slot.take() {
            old.token.cancel();
        }
    }

    fn cancel_liveness(&mut self) {
        Self::cancel(&mut self.heartbeat);
        Self::cancel(&mut self.health_check);
    }

    fn cancel_all(&mut self) {
        self.cancel_liveness();
        Self::cancel(&mut self.reconnect);
    }

    fn active(&self) -> usize {
        [&self.heartbeat, &self.health_check, &self.reconnect]
            .iter()
            .filter(|slot| slot.as_ref().is_some_and(|s| !s.token.is_cancelled()))
            .count()
    }
}

struct SubscriptionEntry {
    spec: ChangeSpec,
    callback: ChangeCallback,
    channel: Option<ChannelId>,
    joining: bool,
    /// Stops the message pump of the current channel
    pump: Option<CancellationToken>,
}

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    list: Mutex<Vec<(u64, Observer)>>,
}

struct Inner<B> {
    backend: Arc<B>,
    config: ConnectionConfig,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    observers: Arc<Observers>,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    timers: Mutex<Timers>,
    /// Parent of every background task's token; replaced on cleanup
    root: Mutex<CancellationToken>,
}

/// Handle returned by `add_callback`.
pub struct CallbackHandle {
    id: u64,
    observers: Weak<Observers>,
}

impl CallbackHandle {
    /// Stop receiving events.
    pub fn remove(self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers.list).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Handle to one logical table subscription.
pub struct Subscription<B: RealtimeBackend> {
    name: String,
    inner: Weak<Inner<B>>,
}

impl<B: RealtimeBackend> Subscription<B> {
    /// Generated subscription name (`<table>-changes-<id>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel currently carrying this subscription, if joined.
    pub fn channel(&self) -> Option<ChannelId> {
        let inner = self.inner.upgrade()?;
        let subs = lock(&inner.subscriptions);
        subs.get(&self.name).and_then(|entry| entry.channel)
    }

    /// Whether the subscription is still registered with its manager.
    pub fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| lock(&inner.subscriptions).contains_key(&self.name))
    }

    /// Remove the subscription and leave its channel.
    pub async fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            ConnectionManager { inner }.unsubscribe_named(&self.name).await;
        }
    }
}

/// Owns one logical realtime connection.
///
/// Cloning is cheap and yields another handle to the same connection.
/// Must be used from within a Tokio runtime.
pub struct ConnectionManager<B: RealtimeBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: RealtimeBackend> Clone for ConnectionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: RealtimeBackend> ConnectionManager<B> {
    pub fn new(backend: Arc<B>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    message: "Not connected".to_string(),
                    attempts: 0,
                    online: true,
                    in_flight: false,
                    epoch: 0,
                    last_error: None,
                }),
                state_tx,
                observers: Arc::new(Observers::default()),
                subscriptions: Mutex::new(HashMap::new()),
                timers: Mutex::new(Timers::default()),
                root: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    // ─── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.core).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        let core = lock(&self.inner.core);
        core.in_flight
            || matches!(
                core.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        lock(&self.inner.core).attempts
    }

    pub fn last_error(&self) -> Option<TransportError> {
        lock(&self.inner.core).last_error.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let max_attempts = self.inner.config.max_reconnect_attempts;
        let core = lock(&self.inner.core);
        ConnectionStatus {
            state: core.state,
            message: core.message.clone(),
            attempts: core.attempts,
            max_attempts,
            last_error: core.last_error.as_ref().map(|e| e.kind),
            can_retry: matches!(
                core.state,
                ConnectionState::Failed | ConnectionState::Disconnected
            ),
            can_continue_offline: core.state == ConnectionState::Offline
                || (core.state == ConnectionState::Failed && core.attempts >= max_attempts),
        }
    }

    /// Receiver that always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Number of armed timers (heartbeat, health check, pending reconnect).
    pub fn active_timers(&self) -> usize {
        lock(&self.inner.timers).active()
    }

    /// Register an observer for state changes, errors and reconnect attempts.
    pub fn add_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let observers = &self.inner.observers;
        let id = observers.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&observers.list).push((id, Arc::new(callback)));
        CallbackHandle {
            id,
            observers: Arc::downgrade(observers),
        }
    }

    fn emit(&self, events: Vec<ConnectionEvent>) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Observer> = lock(&self.inner.observers.list)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for event in &events {
            for observer in &observers {
                observer(event);
            }
        }
    }

    fn transition(
        &self,
        core: &mut Core,
        state: ConnectionState,
        message: impl Into<String>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let message = message.into();
        log::debug!("Connection state {} -> {state}: {message}", core.state);
        core.state = state;
        core.message = message.clone();
        self.inner.state_tx.send_replace(state);
        events.push(ConnectionEvent::StateChanged { state, message });
    }

    fn root_token(&self) -> CancellationToken {
        lock(&self.inner.root).clone()
    }

    fn spawn_timer<F, Fut>(&self, task: F) -> TimerSlot
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root_token().child_token();
        let handle = tokio::spawn(task(token.clone()));
        TimerSlot {
            token,
            _handle: handle,
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Establish the connection.
    ///
    /// No-op while connected or while an attempt is already in flight.
    /// Fails immediately with [`ConnectionError::Offline`] when the device
    /// is offline. On failure a reconnect is scheduled automatically.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut events = Vec::new();
        let epoch = {
            let mut core = lock(&self.inner.core);
            if core.in_flight || core.state == ConnectionState::Connected {
                return Ok(());
            }
            if !core.online {
                self.transition(
                    &mut core,
                    ConnectionState::Offline,
                    "You are offline. Changes will sync when the connection is restored.",
                    &mut events,
                );
                None
            } else {
                core.in_flight = true;
                self.transition(
                    &mut core,
                    ConnectionState::Connecting,
                    "Connecting to server...",
                    &mut events,
                );
                Some(core.epoch)
            }
        };
        self.emit(events);

        let Some(epoch) = epoch else {
            return Err(ConnectionError::Offline);
        };
        // A manual connect supersedes a scheduled reconnect
        Timers::cancel(&mut lock(&self.inner.timers).reconnect);
        self.establish(epoch).await
    }

    /// Run the connectivity probe and settle the outcome.
    async fn establish(&self, epoch: u64) -> Result<(), ConnectionError> {
        let timeout = self.inner.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.backend.probe()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "connectivity probe exceeded {}ms",
                timeout.as_millis()
            ))),
        };

        let mut events = Vec::new();
        let outcome = {
            let mut core = lock(&self.inner.core);
            if core.epoch != epoch || !core.in_flight {
                return Err(ConnectionError::Superseded);
            }
            core.in_flight = false;
            match result {
                Ok(()) => {
                    core.attempts = 0;
                    core.last_error = None;
                    self.transition(
                        &mut core,
                        ConnectionState::Connected,
                        "Connected",
                        &mut events,
                    );
                    Ok(())
                }
                Err(err) => {
                    core.last_error = Some(err.clone());
                    events.push(ConnectionEvent::Error {
                        kind: err.kind,
                        message: err.message.clone(),
                    });
                    self.transition(
                        &mut core,
                        ConnectionState::Failed,
                        err.kind.user_message(),
                        &mut events,
                    );
                    Err(err)
                }
            }
        };

        match outcome {
            Ok(()) => {
                log::info!("Realtime connection established");
                self.arm_liveness(epoch);
                self.emit(events);
                self.rejoin_subscriptions().await;
                Ok(())
            }
            Err(err) => {
                log::warn!("Connection attempt failed ({}): {}", err.kind, err.message);
                self.emit(events);
                self.reconnect();
                Err(err.into())
            }
        }
    }

    /// Schedule the next reconnect attempt with exponential backoff.
    ///
    /// No-op while connecting/reconnecting or offline. After
    /// `max_reconnect_attempts` the state becomes terminally `failed` until
    /// `connect()` is called again or the network comes back.
    pub fn reconnect(&self) {
        let mut events = Vec::new();
        let scheduled = {
            let mut core = lock(&self.inner.core);
            if core.in_flight
                || !core.online
                || matches!(
                    core.state,
                    ConnectionState::Connecting
                        | ConnectionState::Reconnecting
                        | ConnectionState::Offline
                )
            {
                log::debug!("Reconnect ignored in state {}", core.state);
                return;
            }
            self.next_attempt(&mut core, &mut events)
        };
        self.emit(events);
        self.arm_reconnect(scheduled);
    }

    /// Bump the attempt counter and move to `reconnecting`, or to terminal
    /// `failed` once the cap is reached. Returns what the timer needs.
    fn next_attempt(
        &self,
        core: &mut Core,
        events: &mut Vec<ConnectionEvent>,
    ) -> Option<(u64, u32, Duration)> {
        let max_attempts = self.inner.config.max_reconnect_attempts;
        if core.attempts >= max_attempts {
            self.transition(
                core,
                ConnectionState::Failed,
                format!(
                    "Unable to connect after {max_attempts} attempts. Check your connection and retry."
                ),
                events,
            );
            return None;
        }
        core.attempts += 1;
        let attempt = core.attempts;
        let delay = self.inner.config.backoff_delay(attempt);
        self.transition(
            core,
            ConnectionState::Reconnecting,
            format!("Reconnecting (attempt {attempt}/{max_attempts})..."),
            events,
        );
        events.push(ConnectionEvent::ReconnectAttempt { attempt, delay });
        Some((core.epoch, attempt, delay))
    }

    fn arm_reconnect(&self, scheduled: Option<(u64, u32, Duration)>) {
        let Some((epoch, attempt, delay)) = scheduled else {
            log::error!(
                "Giving up after {} reconnect attempts",
                self.inner.config.max_reconnect_attempts
            );
            return;
        };
        log::info!("Reconnect attempt {attempt} in {}ms", delay.as_millis());

        let this = self.clone();
        let slot = self.spawn_timer(move |token| async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.run_attempt(epoch).await,
            }
        });
        Timers::replace(&mut lock(&self.inner.timers).reconnect, slot);
    }

    async fn run_attempt(&self, epoch: u64) {
        // Detach our own slot so a follow-up reconnect can arm a fresh one
        lock(&self.inner.timers).reconnect.take();
        {
            let mut core = lock(&self.inner.core);
            if core.epoch != epoch
                || core.in_flight
                || core.state != ConnectionState::Reconnecting
            {
                return;
            }
            core.in_flight = true;
        }
        let _ = self.establish(epoch).await;
    }

    fn arm_liveness(&self, epoch: u64) {
        let heartbeat = {
            let this = self.clone();
            let period = self.inner.config.heartbeat_interval;
            self.spawn_timer(move |token| async move {
                this.liveness_loop(token, period, epoch, LivenessCheck::Heartbeat)
                    .await
            })
        };
        let health_check = {
            let this = self.clone();
            let period = self.inner.config.health_check_interval;
            self.spawn_timer(move |token| async move {
                this.liveness_loop(token, period, epoch, LivenessCheck::Probe)
                    .await
            })
        };
        let mut timers = lock(&self.inner.timers);
        Timers::replace(&mut timers.heartbeat, heartbeat);
        Timers::replace(&mut timers.health_check, health_check);
    }

    async fn liveness_loop(
        &self,
        token: CancellationToken,
        period: Duration,
        epoch: u64,
        check: LivenessCheck,
    ) {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.is_connected() {
                        continue;
                    }
                    let timeout = self.inner.config.connect_timeout;
                    let call = async {
                        match check {
                            LivenessCheck::Heartbeat => self.inner.backend.heartbeat().await,
                            LivenessCheck::Probe => self.inner.backend.probe().await,
                        }
                    };
                    let result = match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::timeout(format!("{} timed out", check.name()))),
                    };
                    if let Err(err) = result {
                        self.liveness_failed(epoch, check, err);
                        break;
                    }
                }
            }
        }
    }

    fn liveness_failed(&self, epoch: u64, check: LivenessCheck, err: TransportError) {
        let mut events = Vec::new();
        {
            let mut core = lock(&self.inner.core);
            if core.epoch != epoch || core.state != ConnectionState::Connected {
                return;
            }
            core.last_error = Some(err.clone());
            events.push(ConnectionEvent::Error {
                kind: err.kind,
                message: err.message.clone(),
            });
            self.transition(
                &mut core,
                ConnectionState::Failed,
                err.kind.user_message(),
                &mut events,
            );
        }
        log::warn!("{} failed: {err}", check.name());
        lock(&self.inner.timers).cancel_liveness();
        let channels = self.detach_all_channels();
        self.release_channels(channels);
        self.emit(events);
        self.reconnect();
    }

    /// React to an OS-level network change.
    ///
    /// Offline: state becomes `offline`, timers stop, channels are torn
    /// down (registrations are kept). Online after `offline`/`failed`: the
    /// attempt counter resets and one reconnect cycle starts.
    pub async fn handle_network_change(&self, online: bool) {
        if online {
            let mut events = Vec::new();
            let scheduled = {
                let mut core = lock(&self.inner.core);
                let was_online = core.online;
                core.online = true;
                let resume = !was_online
                    && !core.in_flight
                    && matches!(
                        core.state,
                        ConnectionState::Offline | ConnectionState::Failed
                    );
                if !resume {
                    return;
                }
                // State leaves `offline` under the same lock that flips `online`
                core.attempts = 0;
                self.next_attempt(&mut core, &mut events)
            };
            log::info!("Network restored, reconnecting");
            self.emit(events);
            self.arm_reconnect(scheduled);
            return;
        }

        let mut events = Vec::new();
        {
            let mut core = lock(&self.inner.core);
            if !core.online && core.state == ConnectionState::Offline {
                return;
            }
            core.online = false;
            core.in_flight = false;
            core.epoch += 1;
            self.transition(
                &mut core,
                ConnectionState::Offline,
                "You are offline. Changes will sync when the connection is restored.",
                &mut events,
            );
        }
        lock(&self.inner.timers).cancel_all();
        self.emit(events);

        log::warn!("Network offline, tearing down realtime channels");
        let channels = self.detach_all_channels();
        for channel in channels {
            self.inner.backend.unsubscribe(channel).await;
        }
        self.inner.backend.disconnect().await;
    }

    /// Forward every change of `monitor` into `handle_network_change`.
    ///
    /// The task ends when every handle of the monitor is dropped.
    pub fn watch_network(&self, monitor: &NetworkMonitor) -> JoinHandle<()> {
        let mut rx = monitor.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            if !initial {
                this.handle_network_change(false).await;
            }
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                this.handle_network_change(online).await;
            }
        })
    }

    /// Release every subscription and timer and force `disconnected`.
    ///
    /// Safe to call repeatedly and from any state.
    pub async fn cleanup(&self) {
        let mut events = Vec::new();
        {
            let mut core = lock(&self.inner.core);
            core.epoch += 1;
            core.in_flight = false;
            core.attempts = 0;
            if core.state != ConnectionState::Disconnected {
                self.transition(
                    &mut core,
                    ConnectionState::Disconnected,
                    "Disconnected",
                    &mut events,
                );
            }
        }
        lock(&self.inner.timers).cancel_all();
        {
            let mut root = lock(&self.inner.root);
            root.cancel();
            *root = CancellationToken::new();
        }

        let entries: Vec<SubscriptionEntry> = {
            let mut subs = lock(&self.inner.subscriptions);
            subs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(pump) = entry.pump {
                pump.cancel();
            }
            if let Some(channel) = entry.channel {
                self.inner.backend.unsubscribe(channel).await;
            }
        }
        self.inner.backend.disconnect().await;
        self.emit(events);
        log::info!("Connection manager cleaned up");
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Watch every row event on `table` in the `public` schema.
    pub async fn subscribe_to_table<F>(
        &self,
        table: &str,
        filter: Option<&str>,
        callback: F,
    ) -> Subscription<B>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let spec = ChangeSpec::new("public", table, filter.map(str::to_string));
        self.subscribe(spec, callback).await
    }

    /// Register a subscription; joined now if connected, otherwise on the
    /// next successful connect.
    pub async fn subscribe<F>(&self, spec: ChangeSpec, callback: F) -> Subscription<B>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-changes-{}", spec.table, &suffix[..8]);
        lock(&self.inner.subscriptions).insert(
            name.clone(),
            SubscriptionEntry {
                spec,
                callback: Arc::new(callback),
                channel: None,
                joining: false,
                pump: None,
            },
        );
        log::debug!("Registered subscription {name}");

        if self.is_connected() {
            self.join(&name).await;
        }
        Subscription {
            name,
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn unsubscribe_named(&self, name: &str) -> bool {
        let entry = lock(&self.inner.subscriptions).remove(name);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(pump) = entry.pump {
            pump.cancel();
        }
        if let Some(channel) = entry.channel {
            self.inner.backend.unsubscribe(channel).await;
        }
        log::debug!("Unsubscribed {name}");
        true
    }

    async fn rejoin_subscriptions(&self) {
        let names: Vec<String> = lock(&self.inner.subscriptions)
            .iter()
            .filter(|(_, entry)| entry.channel.is_none() && !entry.joining)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.join(&name).await;
        }
    }

    async fn join(&self, name: &str) {
        let spec = {
            let mut subs = lock(&self.inner.subscriptions);
            match subs.get_mut(name) {
                Some(entry) if entry.channel.is_none() && !entry.joining => {
                    entry.joining = true;
                    entry.spec.clone()
                }
                _ => return,
            }
        };

        match self.inner.backend.subscribe(name, &spec).await {
            Ok(handle) => {
                let accepted = {
                    let mut subs = lock(&self.inner.subscriptions);
                    match subs.get_mut(name) {
                        Some(entry) if entry.joining => {
                            let token = self.root_token().child_token();
                            entry.joining = false;
                            entry.channel = Some(handle.id);
                            entry.pump = Some(token.clone());
                            Some((entry.callback.clone(), token))
                        }
                        _ => None,
                    }
                };
                match accepted {
                    Some((callback, token)) => {
                        self.spawn_pump(name.to_string(), handle, callback, token)
                    }
                    // Unsubscribed or torn down while the join was in flight
                    None => self.inner.backend.unsubscribe(handle.id).await,
                }
            }
            Err(err) => {
                if let Some(entry) = lock(&self.inner.subscriptions).get_mut(name) {
                    entry.joining = false;
                }
                log::warn!("Failed to join channel for {name}: {err}");
                self.emit(vec![ConnectionEvent::Error {
                    kind: err.kind,
                    message: format!("{name}: {}", err.message),
                }]);
                self.channel_unavailable(name);
            }
        }
    }

    fn spawn_pump(
        &self,
        name: String,
        handle: ChannelHandle,
        callback: ChangeCallback,
        token: CancellationToken,
    ) {
        let this = self.clone();
        let channel = handle.id;
        let mut messages = handle.messages;
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = messages.recv() => message,
                };
                let Some(message) = message else {
                    this.detach_channel(&name, channel);
                    break;
                };
                match message {
                    ChannelMessage::Change(event) => callback(event),
                    ChannelMessage::Status { status, detail } => match status {
                        ChannelStatus::Subscribed => {
                            log::info!("Subscribed to {name}");
                        }
                        ChannelStatus::ChannelError => {
                            let detail = detail.unwrap_or_else(|| "channel error".to_string());
                            log::warn!("Channel error on {name}: {detail}");
                            this.emit(vec![ConnectionEvent::Error {
                                kind: ErrorKind::NetworkError,
                                message: format!("{name}: {detail}"),
                            }]);
                            if this.detach_channel(&name, channel) {
                                this.channel_unavailable(&name);
                            }
                            break;
                        }
                        ChannelStatus::TimedOut => {
                            log::warn!("Subscription {name} timed out");
                            if this.detach_channel(&name, channel) {
                                this.schedule_resubscribe(&name);
                            }
                            break;
                        }
                        ChannelStatus::Closed => {
                            log::debug!("Channel for {name} closed");
                            this.detach_channel(&name, channel);
                            break;
                        }
                    },
                }
            }
        });
    }

    /// A channel went away: recover the connection, or re-join if the
    /// connection itself is fine.
    fn channel_unavailable(&self, name: &str) {
        if self.is_connected() {
            self.schedule_resubscribe(name);
        } else {
            self.reconnect();
        }
    }

    /// One-shot re-join after `resubscribe_delay`, only if still connected
    /// and the subscription has no channel by then.
    fn schedule_resubscribe(&self, name: &str) {
        let this = self.clone();
        let name = name.to_string();
        let delay = self.inner.config.resubscribe_delay;
        let token = self.root_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let unjoined = lock(&this.inner.subscriptions)
                        .get(&name)
                        .is_some_and(|entry| entry.channel.is_none() && !entry.joining);
                    if this.is_connected() && unjoined {
                        log::info!("Resubscribing {name}");
                        this.join(&name).await;
                    }
                }
            }
        });
    }

    /// Forget `channel` if it still belongs to `name`. Returns whether it did.
    fn detach_channel(&self, name: &str, channel: ChannelId) -> bool {
        let released = {
            let mut subs = lock(&self.inner.subscriptions);
            match subs.get_mut(name) {
                Some(entry) if entry.channel == Some(channel) => {
                    entry.channel = None;
                    if let Some(pump) = entry.pump.take() {
                        pump.cancel();
                    }
                    true
                }
                _ => false,
            }
        };
        if released {
            self.release_channels(vec![channel]);
        }
        released
    }

    /// Detach every channel, keeping the registrations for a later re-join.
    fn detach_all_channels(&self) -> Vec<ChannelId> {
        let mut subs = lock(&self.inner.subscriptions);
        subs.values_mut()
            .filter_map(|entry| {
                entry.joining = false;
                if let Some(pump) = entry.pump.take() {
                    pump.cancel();
                }
                entry.channel.take()
            })
            .collect()
    }

    fn release_channels(&self, channels: Vec<ChannelId>) {
        if channels.is_empty() {
            return;
        }
        let backend = self.inner.backend.clone();
        tokio::spawn(async move {
            for channel in channels {
                backend.unsubscribe(channel).await;
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum LivenessCheck {
    Heartbeat,
    Probe,
}

impl LivenessCheck {
    fn name(&self) -> &'static str {
        match self {
            LivenessCheck::Heartbeat => "Heartbeat",
            LivenessCheck::Probe => "Health check",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Backend whose probe outcome is fixed.
    struct StaticBackend {
        healthy: bool,
        probes: AtomicUsize,
    }

    impl StaticBackend {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy,
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RealtimeBackend for StaticBackend {
        async fn probe(&self) -> Result<(), TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                Err(TransportError::unauthorized("HTTP 401"))
            }
        }

        async fn heartbeat(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            name: &str,
            _spec: &ChangeSpec,
        ) -> Result<ChannelHandle, TransportError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(ChannelHandle {
                id: 1,
                topic: name.to_string(),
                messages: rx,
            })
        }

        async fn unsubscribe(&self, _channel: ChannelId) {}

        async fn disconnect(&self) {}
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Offline).unwrap(),
            "\"offline\""
        );
    }

    #[tokio::test]
    async fn test_initial_status() {
        let manager = ConnectionManager::new(StaticBackend::new(true), ConnectionConfig::default());
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.can_retry);
        assert!(!status.can_continue_offline);
        assert_eq!(status.max_attempts, 5);
        assert_eq!(manager.active_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_arms_liveness_timers() {
        let backend = StaticBackend::new(true);
        let manager = ConnectionManager::new(backend.clone(), ConnectionConfig::default());

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.active_timers(), 2);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);

        // Already connected: nothing happens
        manager.connect().await.unwrap();
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);

        // Health check runs the probe again after 60s
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(backend.probes.load(Ordering::SeqCst), 2);

        manager.cleanup().await;
        assert_eq!(manager.active_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_failure_is_classified_and_retried() {
        let manager = ConnectionManager::new(StaticBackend::new(false), ConnectionConfig::default());
        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(manager.last_error().map(|e| e.kind), Some(ErrorKind::Unauthorized));
        // Unauthorized is not special-cased out of the retry loop
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempts(), 1);
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_callback_handle_remove() {
        let manager = ConnectionManager::new(StaticBackend::new(true), ConnectionConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = manager.add_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect().await.unwrap();
        let after_connect = seen.load(Ordering::SeqCst);
        assert_eq!(after_connect, 2); // connecting, connected

        handle.remove();
        manager.cleanup().await;
        assert_eq!(seen.load(Ordering::SeqCst), after_connect);
    }

    #[tokio::test]
    async fn test_offline_connect_short_circuits() {
        let backend = StaticBackend::new(true);
        let manager = ConnectionManager::new(backend.clone(), ConnectionConfig::default());
        manager.handle_network_change(false).await;

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, ConnectionError::Offline);
        assert_eq!(manager.state(), ConnectionState::Offline);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 0);
        assert!(manager.status().can_continue_offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_up_moves_offline_to_reconnecting() {
        let backend = StaticBackend::new(true);
        let manager = ConnectionManager::new(backend.clone(), ConnectionConfig::default());
        manager.handle_network_change(false).await;
        assert_eq!(manager.state(), ConnectionState::Offline);

        manager.handle_network_change(true).await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempts(), 1);
        assert_eq!(manager.active_timers(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);
        manager.cleanup().await;
    }
}
