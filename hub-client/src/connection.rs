//! Connection management: lifecycle state machine, reconnection, heartbeats,
//! and token rotation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{HeaderProvider, HubConnection, HubTransport, Receiver};
use crate::types::{ConnectionState, ConnectionStats, Error, HubConfig, TimingConfig};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BACKOFF_MULTIPLIER: f64 = 1.5;
const HEARTBEAT_METHOD: &str = "ping";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// `min(max, base * 1.5^(attempt - 1))` for 1-based `attempt`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exp);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            base: timing.reconnect_base_delay,
            max: timing.reconnect_max_delay,
            max_attempts: timing.max_reconnect_attempts,
            attempts: 0,
        }
    }

    /// Count one more attempt and return how long to wait before it, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(backoff_delay(self.base, self.max, self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub(crate) struct LifecycleState {
    pub state: ConnectionState,
    pub policy: ReconnectPolicy,
    pub connection: Option<Arc<dyn HubConnection>>,
    /// Bumped on every connect attempt. Failure reports carry the generation
    /// they were observed on so late reports about a replaced connection are
    /// ignored.
    pub generation: u64,
    /// Failure reported while the attempt was still in flight.
    pub pending_failure: Option<String>,
    pub last_error: Option<String>,
    pub exhausted: bool,
    pub closed: bool,
}

impl LifecycleState {
    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::error!(from = %self.state, to = %next, "Refusing illegal state transition");
            return false;
        }
        if self.state != next {
            tracing::info!(from = %self.state, to = %next, "Connection state changed");
        }
        self.state = next;
        true
    }
}

/// State shared between the manager, its loops, and the dispatcher.
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleState>,
    signal_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    heartbeats: AtomicU64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl Lifecycle {
    pub fn new(timing: &TimingConfig, cancel: CancellationToken) -> (Self, mpsc::Receiver<()>) {
        // Capacity 1: any number of failure reports collapse into one wakeup.
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let lifecycle = Self {
            inner: Mutex::new(LifecycleState {
                state: ConnectionState::Disconnected,
                policy: ReconnectPolicy::new(timing),
                connection: None,
                generation: 0,
                pending_failure: None,
                last_error: None,
                exhausted: false,
                closed: false,
            }),
            signal_tx,
            cancel,
            heartbeats: AtomicU64::new(0),
            last_heartbeat: Mutex::new(None),
        };
        (lifecycle, signal_rx)
    }

    pub fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        lock(&self.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The live connection, if Connected.
    pub fn active_connection(&self) -> Option<(u64, Arc<dyn HubConnection>)> {
        let s = self.lock();
        match (&s.state, &s.connection) {
            (ConnectionState::Connected, Some(conn)) => Some((s.generation, conn.clone())),
            _ => None,
        }
    }

    /// Wake the reconnect loop. Never blocks.
    pub fn signal(&self) {
        if self.signal_tx.try_send(()).is_err() {
            tracing::trace!("Reconnect signal already pending");
        }
    }

    /// Report that the connection of `generation` failed.
    ///
    /// Connected moves to Reconnecting and the connection is stopped. An
    /// attempt still in flight is marked so it fails when it completes.
    /// Reports about older generations, or in any other state, are ignored.
    pub fn report_failure(&self, generation: u64, reason: String) {
        let stale = {
            let mut s = self.lock();
            if s.closed || s.generation != generation {
                tracing::debug!(generation, current = s.generation, %reason, "Ignoring stale failure report");
                return;
            }
            match s.state {
                ConnectionState::Connected => {
                    if !s.transition(ConnectionState::Reconnecting) {
                        return;
                    }
                    s.last_error = Some(reason.clone());
                    s.connection.take()
                }
                ConnectionState::Connecting => {
                    s.pending_failure = Some(reason);
                    return;
                }
                _ => return,
            }
        };
        tracing::warn!(generation, %reason, "Connection lost");
        if let Some(conn) = stale {
            conn.stop();
        }
        self.signal();
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_heartbeat) = Some(Utc::now());
        tracing::trace!("Server heartbeat");
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_heartbeat)
    }
}

// ---------------------------------------------------------------------------
// Per-connection receiver
// ---------------------------------------------------------------------------

/// Binds transport callbacks to the connection generation they belong to.
struct ConnectionReceiver {
    generation: u64,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<Dispatcher>,
}

impl Receiver for ConnectionReceiver {
    fn receive(&self, method: &str, args: Vec<Value>) {
        if self.lifecycle.generation() != self.generation {
            tracing::debug!(method, generation = self.generation, "Discarding call from replaced connection");
            return;
        }
        self.dispatcher.dispatch(self.generation, method, args);
    }

    fn closed(&self, reason: Option<String>) {
        self.dispatcher.connection_closed(self.generation, reason);
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

/// Bearer token plus a version bumped on every change. Versions start at 1 so
/// that 0 can mean "not read yet".
struct BearerToken {
    value: String,
    version: u64,
}

pub(crate) struct ConnectionManager {
    url: String,
    timing: TimingConfig,
    token: Arc<Mutex<BearerToken>>,
    transport: Arc<dyn HubTransport>,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<SubscriptionRegistry>,
    loops_started: AtomicBool,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: HubConfig,
        transport: Arc<dyn HubTransport>,
        lifecycle: Arc<Lifecycle>,
        signal_rx: mpsc::Receiver<()>,
        dispatcher: Arc<Dispatcher>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            url: config.url,
            timing: config.timing,
            token: Arc::new(Mutex::new(BearerToken {
                value: config.token,
                version: 1,
            })),
            transport,
            lifecycle,
            dispatcher,
            subscriptions,
            loops_started: AtomicBool::new(false),
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Explicit connect. Clears retry exhaustion before attempting.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut s = self.lifecycle.lock();
            if s.closed {
                return Err(Error::Closed);
            }
            if s.exhausted {
                tracing::info!("Clearing exhausted reconnect budget");
                s.exhausted = false;
                s.policy.reset();
            }
        }
        self.establish().await
    }

    /// One connect attempt. On failure the reconnect loop is signalled and
    /// the error is returned.
    async fn establish(self: &Arc<Self>) -> Result<(), Error> {
        let generation = {
            let mut s = self.lifecycle.lock();
            if s.closed {
                return Err(Error::Closed);
            }
            if matches!(
                s.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                tracing::debug!(state = %s.state, "Connect already in progress");
                return Ok(());
            }
            if !s.transition(ConnectionState::Connecting) {
                return Err(Error::ConnectionClosed);
            }
            s.generation += 1;
            s.pending_failure = None;
            s.generation
        };
        self.start_loops();

        let receiver: Arc<dyn Receiver> = Arc::new(ConnectionReceiver {
            generation,
            lifecycle: self.lifecycle.clone(),
            dispatcher: self.dispatcher.clone(),
        });
        // Token version this attempt presented, 0 until the transport asks.
        let presented = Arc::new(AtomicU64::new(0));
        let token = self.token.clone();
        let seen = presented.clone();
        let headers: HeaderProvider = Arc::new(move || {
            let token = lock(&token);
            seen.store(token.version, Ordering::SeqCst);
            vec![(
                "Authorization".to_string(),
                format!("Bearer {}", token.value),
            )]
        });

        tracing::info!(
            transport = self.transport.name(),
            generation,
            "Connecting to hub"
        );
        let connect_timeout = self.timing.connect_timeout;
        let opened = match tokio::time::timeout(
            connect_timeout,
            self.transport.open(&self.url, headers, receiver),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout(connect_timeout)),
        };

        match opened {
            Ok(conn) => {
                let outcome = {
                    let mut s = self.lifecycle.lock();
                    if s.closed {
                        Err(Error::Closed)
                    } else if let Some(reason) = s.pending_failure.take() {
                        s.transition(ConnectionState::Disconnected);
                        s.last_error = Some(reason);
                        Err(Error::ConnectionClosed)
                    } else if self.presented_stale_token(&presented) {
                        s.transition(ConnectionState::Disconnected);
                        s.last_error = Some("token rotated during connect".to_string());
                        Err(Error::ConnectionClosed)
                    } else {
                        s.transition(ConnectionState::Connected);
                        s.policy.reset();
                        s.connection = Some(conn.clone());
                        s.last_error = None;
                        Ok(())
                    }
                };
                match outcome {
                    Ok(()) => {
                        tracing::info!(generation, "Connected to hub");
                        self.replay_subscriptions(generation, &conn);
                        Ok(())
                    }
                    Err(e) => {
                        conn.stop();
                        if !matches!(e, Error::Closed) {
                            tracing::warn!(generation, "Connection failed during handshake");
                            self.lifecycle.signal();
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => {
                {
                    let mut s = self.lifecycle.lock();
                    if s.closed {
                        return Err(e);
                    }
                    s.transition(ConnectionState::Disconnected);
                    s.last_error = Some(e.to_string());
                }
                tracing::warn!(generation, "Connect failed: {e}");
                self.lifecycle.signal();
                Err(e)
            }
        }
    }

    /// Whether the attempt sent a token that has since been replaced. Called
    /// with the lifecycle lock held, so it orders against `update_token`.
    fn presented_stale_token(&self, presented: &AtomicU64) -> bool {
        let seen = presented.load(Ordering::SeqCst);
        seen != 0 && seen != lock(&self.token).version
    }

    fn replay_subscriptions(&self, generation: u64, conn: &Arc<dyn HubConnection>) {
        if self.subscriptions.is_empty() {
            return;
        }
        self.subscriptions.replay_all(|sub| {
            if self.lifecycle.generation() != generation {
                return Err(Error::ConnectionClosed);
            }
            spawn_invoke(conn.clone(), sub.method.clone(), sub.args.clone());
            Ok(())
        });
    }

    fn start_loops(self: &Arc<Self>) {
        if self.loops_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(signal_rx) = lock(&self.signal_rx).take() else {
            return;
        };
        tokio::spawn(run_reconnect_loop(self.clone(), signal_rx));
        tokio::spawn(run_heartbeat_loop(
            self.lifecycle.clone(),
            self.timing.heartbeat_interval,
            self.timing.ping_timeout,
        ));
        tracing::debug!("Started reconnect and heartbeat loops");
    }

    /// Record the subscription, then send it now if connected.
    pub fn subscribe(&self, method: &str, args: Vec<Value>) -> Result<(), Error> {
        if method.is_empty() {
            return Err(Error::InvalidMethod);
        }
        if self.lifecycle.lock().closed {
            return Err(Error::Closed);
        }
        self.subscriptions.record(method, args.clone());
        match self.lifecycle.active_connection() {
            Some((_, conn)) => spawn_invoke(conn, method.to_string(), args),
            None => tracing::info!(method, "Not connected, subscription deferred until connect"),
        }
        Ok(())
    }

    /// Replace the bearer token. A changed token on a live connection forces
    /// one reconnect so the new token is presented. An attempt in flight is
    /// failed only if it already sent the old token; otherwise the token just
    /// applies to the next connect.
    pub fn update_token(&self, token: String) -> Result<(), Error> {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        if self.lifecycle.lock().closed {
            return Err(Error::Closed);
        }
        {
            let mut current = lock(&self.token);
            if current.value == token {
                tracing::debug!("Token unchanged");
                return Ok(());
            }
            current.value = token;
            current.version += 1;
        }
        tracing::info!("Bearer token updated");

        // The token lock is released before the lifecycle lock is taken;
        // `establish` takes them in the opposite order.
        let generation = {
            let s = self.lifecycle.lock();
            if s.state != ConnectionState::Connected {
                tracing::debug!(state = %s.state, "Token applies at next connect");
                return Ok(());
            }
            s.generation
        };
        self.lifecycle
            .report_failure(generation, "token rotated".to_string());
        Ok(())
    }

    /// Idempotent shutdown.
    pub fn close(&self) {
        let conn = {
            let mut s = self.lifecycle.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.transition(ConnectionState::Disconnected);
            s.connection.take()
        };
        self.lifecycle.cancel.cancel();
        if let Some(conn) = conn {
            conn.stop();
        }
        self.dispatcher.close_channel();
        tracing::info!("Hub client closed");
    }

    pub fn stats(&self) -> ConnectionStats {
        let (status, reconnect_attempts) = {
            let s = self.lifecycle.lock();
            (s.state, s.policy.attempts())
        };
        ConnectionStats {
            status,
            reconnect_attempts,
            subscription_count: self.subscriptions.len(),
            dropped_messages: self.dispatcher.dropped(),
            heartbeats_received: self.lifecycle.heartbeats(),
            last_heartbeat: self.lifecycle.last_heartbeat(),
        }
    }
}

fn spawn_invoke(conn: Arc<dyn HubConnection>, method: String, args: Vec<Value>) {
    tokio::spawn(async move {
        match conn.send(&method, args).await {
            Ok(result) => {
                tracing::info!(method, result = %result.coerce_to_text(), "Subscription acknowledged");
            }
            Err(e) => tracing::warn!(method, "Subscription failed: {e}"),
        }
    });
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn run_reconnect_loop(manager: Arc<ConnectionManager>, mut signals: mpsc::Receiver<()>) {
    let cancel = manager.lifecycle.cancel.clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }

        let (attempt, delay) = {
            let mut s = manager.lifecycle.lock();
            if s.closed {
                break;
            }
            if s.exhausted
                || matches!(
                    s.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            {
                tracing::debug!(state = %s.state, exhausted = s.exhausted, "Ignoring reconnect signal");
                continue;
            }
            match s.policy.next_delay() {
                Some(delay) => (s.policy.attempts(), delay),
                None => {
                    s.exhausted = true;
                    s.transition(ConnectionState::Disconnected);
                    tracing::error!(
                        attempts = s.policy.attempts(),
                        last_error = s.last_error.as_deref().unwrap_or("none"),
                        "Reconnect attempts exhausted, waiting for explicit connect"
                    );
                    continue;
                }
            }
        };

        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        if let Err(e) = manager.establish().await {
            tracing::debug!(attempt, "Reconnect attempt failed: {e}");
        }
    }
    tracing::debug!("Reconnect loop stopped");
}

async fn run_heartbeat_loop(lifecycle: Arc<Lifecycle>, interval: Duration, ping_timeout: Duration) {
    let cancel = lifecycle.cancel.clone();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some((generation, conn)) = lifecycle.active_connection() else {
            continue;
        };
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ping_timeout, conn.send(HEARTBEAT_METHOD, Vec::new())).await {
                Ok(Ok(_)) => tracing::trace!(generation, "Heartbeat ok"),
                Ok(Err(e)) => lifecycle.report_failure(generation, format!("heartbeat failed: {e}")),
                Err(_) => lifecycle.report_failure(
                    generation,
                    format!("heartbeat timed out after {ping_timeout:?}"),
                ),
            }
        });
    }
    tracing::debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    const BASE: Duration = Duration::from_secs(2);
    const MAX: Duration = Duration::from_secs(120);

    #[test]
    fn backoff_grows_by_half() {
        assert_eq!(backoff_delay(BASE, MAX, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(BASE, MAX, 2), Duration::from_secs(3));
        assert_eq!(backoff_delay(BASE, MAX, 3), Duration::from_millis(4500));
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let mut prev = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = backoff_delay(BASE, MAX, attempt);
            assert!(delay >= prev, "attempt {attempt}: {delay:?} < {prev:?}");
            assert!(delay <= MAX);
            prev = delay;
        }
        assert_eq!(prev, MAX);
        assert_eq!(backoff_delay(BASE, MAX, u32::MAX), MAX);
    }

    #[test]
    fn policy_stops_after_max_attempts() {
        let timing = TimingConfig {
            max_reconnect_attempts: 3,
            ..TimingConfig::default()
        };
        let mut policy = ReconnectPolicy::new(&timing);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 3);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }

    struct NoopConnection {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl HubConnection for NoopConnection {
        async fn send(&self, _method: &str, _args: Vec<Value>) -> Result<Value, Error> {
            Ok(Value::Null)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn connected_lifecycle() -> (Lifecycle, mpsc::Receiver<()>, Arc<NoopConnection>) {
        let (lifecycle, rx) = Lifecycle::new(&TimingConfig::default(), CancellationToken::new());
        let conn = Arc::new(NoopConnection {
            stopped: AtomicBool::new(false),
        });
        {
            let mut s = lifecycle.lock();
            s.transition(ConnectionState::Connecting);
            s.generation = 1;
            s.transition(ConnectionState::Connected);
            s.connection = Some(conn.clone());
        }
        (lifecycle, rx, conn)
    }

    #[test]
    fn failure_moves_connected_to_reconnecting() {
        let (lifecycle, mut rx, conn) = connected_lifecycle();
        lifecycle.report_failure(1, "boom".to_string());

        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        assert_eq!(lifecycle.last_error().as_deref(), Some("boom"));
        assert!(conn.stopped.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (lifecycle, mut rx, conn) = connected_lifecycle();
        lifecycle.report_failure(0, "old".to_string());

        assert_eq!(lifecycle.state(), ConnectionState::Connected);
        assert!(!conn.stopped.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn signals_coalesce() {
        let (lifecycle, mut rx) = Lifecycle::new(&TimingConfig::default(), CancellationToken::new());
        lifecycle.signal();
        lifecycle.signal();
        lifecycle.signal();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failure_during_connect_is_deferred() {
        let (lifecycle, _rx) = Lifecycle::new(&TimingConfig::default(), CancellationToken::new());
        {
            let mut s = lifecycle.lock();
            s.transition(ConnectionState::Connecting);
            s.generation = 4;
        }
        lifecycle.report_failure(4, "closed early".to_string());
        let s = lifecycle.lock();
        assert_eq!(s.state, ConnectionState::Connecting);
        assert_eq!(s.pending_failure.as_deref(), Some("closed early"));
    }
}
