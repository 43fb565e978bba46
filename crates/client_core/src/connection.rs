use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use shared::{
    domain::ConnectionState,
    protocol::{EventKind, TransportEvent},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    credentials::Credential,
    error::{ClientError, ClientResult},
    transport::{Backoff, TransportDialer, TransportLink},
};

pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub delay_min: Duration,
    pub delay_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            delay_min: Duration::from_millis(500),
            delay_max: Duration::from_millis(2_000),
        }
    }
}

/// Out-of-band signals that other components must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The server rejected the live credential. No redial follows.
    Unauthorized { generation: u64 },
}

struct ListenerRegistry {
    next_id: AtomicU64,
    // `None` once the owning connection has been torn down.
    entries: Mutex<Option<HashMap<EventKind, Vec<(u64, Listener)>>>>,
}

impl ListenerRegistry {
    fn open() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Some(HashMap::new())),
        }
    }

    fn insert(&self, kind: EventKind, listener: Listener) -> ClientResult<u64> {
        let mut guard = self.entries.lock();
        let entries = guard.as_mut().ok_or(ClientError::TransportClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.entry(kind).or_default().push((id, listener));
        Ok(id)
    }

    fn remove(&self, kind: EventKind, id: u64) -> ClientResult<bool> {
        let mut guard = self.entries.lock();
        let entries = guard.as_mut().ok_or(ClientError::TransportClosed)?;
        let Some(bound) = entries.get_mut(&kind) else {
            return Ok(false);
        };
        let before = bound.len();
        bound.retain(|(bound_id, _)| *bound_id != id);
        Ok(bound.len() != before)
    }

    fn count(&self, kind: EventKind) -> usize {
        self.entries
            .lock()
            .as_ref()
            .and_then(|entries| entries.get(&kind).map(Vec::len))
            .unwrap_or(0)
    }

    fn dispatch(&self, event: &TransportEvent) {
        let listeners: Vec<Listener> = {
            let guard = self.entries.lock();
            match guard.as_ref().and_then(|entries| entries.get(&event.kind())) {
                Some(bound) => bound.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };
        for listener in listeners {
            listener(event);
        }
    }

    fn close(&self) {
        self.entries.lock().take();
    }
}

/// One binding on a connection. Detaching removes exactly this binding and
/// leaves every other listener for the same event in place.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    kind: EventKind,
    generation: u64,
    registry: Weak<ListenerRegistry>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry").finish_non_exhaustive()
    }
}

impl ListenerHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fails with `TransportClosed` when the connection is already gone; the
    /// binding no longer exists in that case either.
    pub fn detach(self) -> ClientResult<()> {
        let registry = self.registry.upgrade().ok_or(ClientError::TransportClosed)?;
        registry.remove(self.kind, self.id).map(|_| ())
    }
}

struct CellInner {
    generation: u64,
    failures: u64,
    last_error: Option<ClientError>,
}

/// The process-wide connection state. Only the generation that currently
/// owns the cell may publish into it.
struct StateCell {
    tx: watch::Sender<ConnectionState>,
    inner: Mutex<CellInner>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            inner: Mutex::new(CellInner {
                generation: 0,
                failures: 0,
                last_error: None,
            }),
        }
    }

    fn begin(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.last_error = None;
        self.tx.send_replace(ConnectionState::Connecting);
        inner.generation
    }

    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        if state == ConnectionState::Failed {
            inner.failures += 1;
        }
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(generation, from = %previous, to = %state, "transport: state changed");
        }
        true
    }

    fn record_error(&self, generation: u64, err: ClientError) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.last_error = Some(err);
        }
    }

    fn end(&self, generation: Option<u64>) {
        let mut inner = self.inner.lock();
        if generation.is_some_and(|g| g != inner.generation) {
            return;
        }
        inner.generation += 1;
        self.tx.send_replace(ConnectionState::Disconnected);
    }

    fn current_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    fn failures(&self) -> u64 {
        self.inner.lock().failures
    }

    fn last_error(&self) -> Option<ClientError> {
        self.inner.lock().last_error.clone()
    }

    fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// A single transport instance: its credential, its listeners, and the task
/// that dials and redials it.
pub struct Connection {
    generation: u64,
    credential: Credential,
    listeners: Arc<ListenerRegistry>,
    cell: Arc<StateCell>,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn uses(&self, credential: &Credential) -> bool {
        &self.credential == credential
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() || self.cell.current_generation() != self.generation {
            return ConnectionState::Disconnected;
        }
        self.cell.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) -> ClientResult<ListenerHandle> {
        let id = self.listeners.insert(kind, Arc::new(listener))?;
        Ok(ListenerHandle {
            id,
            kind,
            generation: self.generation,
            registry: Arc::downgrade(&self.listeners),
        })
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.count(kind)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.listeners.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Owner of the single live transport.
pub struct ConnectionManager {
    dialer: Arc<dyn TransportDialer>,
    endpoint: Url,
    policy: ReconnectPolicy,
    current: Mutex<Option<Arc<Connection>>>,
    cell: Arc<StateCell>,
    signals: broadcast::Sender<ConnectionSignal>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn TransportDialer>, endpoint: Url, policy: ReconnectPolicy) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            dialer,
            endpoint,
            policy,
            current: Mutex::new(None),
            cell: Arc::new(StateCell::new()),
            signals,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.cell.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.cell.tx.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.cell.last_error()
    }

    /// The live connection, if one exists and has not been torn down.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Returns the live connection for `credential`, creating it if needed.
    /// Any other connection is torn down first, so at most one transport
    /// exists at a time.
    pub fn connect(&self, credential: Credential) -> Arc<Connection> {
        let mut current = self.current.lock();
        if let Some(existing) = current.as_ref() {
            if !existing.is_closed() && existing.uses(&credential) && existing.state().is_live() {
                debug!(
                    generation = existing.generation,
                    "transport: connect skipped; already live with this credential"
                );
                return Arc::clone(existing);
            }
        }

        if let Some(previous) = current.take() {
            info!(
                generation = previous.generation,
                "transport: replacing existing connection"
            );
            previous.shutdown();
            self.cell.end(Some(previous.generation));
        }

        let generation = self.cell.begin();
        let connection = Arc::new(Connection {
            generation,
            credential,
            listeners: Arc::new(ListenerRegistry::open()),
            cell: Arc::clone(&self.cell),
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let driver = tokio::spawn(drive(
            Arc::clone(&connection),
            Arc::clone(&self.dialer),
            self.endpoint.clone(),
            self.policy,
            self.signals.clone(),
        ));
        *connection.driver.lock() = Some(driver);
        info!(generation, endpoint = %self.endpoint, "transport: connecting");

        *current = Some(Arc::clone(&connection));
        connection
    }

    /// Redials a failed connection immediately with the same credential.
    pub fn retry(&self) -> Option<Arc<Connection>> {
        let credential = {
            let current = self.current.lock();
            let connection = current.as_ref()?;
            if connection.state() != ConnectionState::Failed {
                return Some(Arc::clone(connection));
            }
            connection.credential.clone()
        };
        self.disconnect();
        Some(self.connect(credential))
    }

    /// Tears down the live connection. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let previous = self.current.lock().take();
        match previous {
            Some(connection) => {
                info!(generation = connection.generation, "transport: disconnecting");
                connection.shutdown();
                self.cell.end(Some(connection.generation));
            }
            None => {
                if self.state() != ConnectionState::Disconnected {
                    self.cell.end(None);
                }
            }
        }
    }

    /// Resolves once Connected; fails on Failed, teardown, or timeout. Holds
    /// nothing beyond its own state receiver, dropped on every exit path.
    pub async fn wait_for_connect(&self, timeout: Duration) -> ClientResult<Arc<Connection>> {
        self.wait_connected(timeout, true).await
    }

    /// Like [`wait_for_connect`](Self::wait_for_connect), but rides out
    /// failed attempts the driver retries on its own. Only teardown, a
    /// rejected credential, or the deadline end the wait early.
    pub async fn wait_until_connected(&self, timeout: Duration) -> ClientResult<Arc<Connection>> {
        self.wait_connected(timeout, false).await
    }

    async fn wait_connected(
        &self,
        timeout: Duration,
        fail_fast: bool,
    ) -> ClientResult<Arc<Connection>> {
        let failures_at_start = self.cell.failures();
        let mut rx = self.watch_state();

        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        if let Some(connection) = self.current() {
                            return Ok(connection);
                        }
                    }
                    ConnectionState::Failed if fail_fast => {
                        return Err(self
                            .last_error()
                            .unwrap_or_else(|| ClientError::Handshake("connect_error".into())));
                    }
                    ConnectionState::Disconnected => {
                        return Err(self.last_error().unwrap_or(ClientError::TransportClosed));
                    }
                    ConnectionState::Failed
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting => {}
                }
                if fail_fast && self.cell.failures() > failures_at_start {
                    return Err(self
                        .last_error()
                        .unwrap_or_else(|| ClientError::Handshake("connect_error".into())));
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::TransportClosed);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

enum LinkEnd {
    Dropped(String),
    Unauthorized(Option<String>),
}

async fn pump(connection: &Connection, link: &mut dyn TransportLink) -> LinkEnd {
    loop {
        match link.recv().await {
            Some(Ok(TransportEvent::Unauthorized { message })) => {
                return LinkEnd::Unauthorized(message)
            }
            Some(Ok(TransportEvent::Disconnect { reason })) => return LinkEnd::Dropped(reason),
            Some(Ok(TransportEvent::Connect { .. })) => {
                debug!(
                    generation = connection.generation,
                    "transport: ignoring repeated connect ack"
                );
            }
            Some(Ok(event)) => connection.listeners.dispatch(&event),
            Some(Err(err)) => return LinkEnd::Dropped(err.to_string()),
            None => return LinkEnd::Dropped("transport close".to_string()),
        }
    }
}

fn finish_unauthorized(
    connection: &Connection,
    message: Option<String>,
    signals: &broadcast::Sender<ConnectionSignal>,
) {
    let generation = connection.generation;
    warn!(generation, "transport: credential rejected by server");
    connection
        .listeners
        .dispatch(&TransportEvent::Unauthorized { message });
    connection
        .cell
        .record_error(generation, ClientError::Unauthorized);
    connection
        .cell
        .publish(generation, ConnectionState::Disconnected);
    connection.closed.store(true, Ordering::Release);
    connection.listeners.close();
    let _ = signals.send(ConnectionSignal::Unauthorized { generation });
}

async fn drive(
    connection: Arc<Connection>,
    dialer: Arc<dyn TransportDialer>,
    endpoint: Url,
    policy: ReconnectPolicy,
    signals: broadcast::Sender<ConnectionSignal>,
) {
    let generation = connection.generation;
    let cell = Arc::clone(&connection.cell);
    let mut backoff = Backoff::new(policy.delay_min, policy.delay_max);
    let mut acknowledged_once = false;

    loop {
        let attempt = backoff.attempts() + 1;
        debug!(generation, attempt, "transport: dialing");
        let dialed = match tokio::time::timeout(
            policy.connect_timeout,
            dialer.dial(&endpoint, &connection.credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout {
                timeout_ms: policy.connect_timeout.as_millis() as u64,
            }),
        };

        match dialed {
            Ok(mut link) => {
                backoff.reset();
                acknowledged_once = true;
                if !cell.publish(generation, ConnectionState::Connected) {
                    link.close().await;
                    return;
                }
                info!(generation, attempt, "transport: connected");
                connection
                    .listeners
                    .dispatch(&TransportEvent::Connect { sid: None });

                match pump(&connection, link.as_mut()).await {
                    LinkEnd::Unauthorized(message) => {
                        link.close().await;
                        finish_unauthorized(&connection, message, &signals);
                        return;
                    }
                    LinkEnd::Dropped(reason) => {
                        link.close().await;
                        if !cell.publish(generation, ConnectionState::Reconnecting) {
                            return;
                        }
                        warn!(generation, reason = %reason, "transport: connection dropped; reconnecting");
                        connection
                            .listeners
                            .dispatch(&TransportEvent::Disconnect { reason });
                    }
                }
            }
            Err(ClientError::Unauthorized) => {
                finish_unauthorized(&connection, None, &signals);
                return;
            }
            Err(err) => {
                cell.record_error(generation, err.clone());
                if !acknowledged_once && !cell.publish(generation, ConnectionState::Failed) {
                    return;
                }
                warn!(generation, attempt, "transport: connect attempt failed: {err}");
                connection
                    .listeners
                    .dispatch(&TransportEvent::ConnectError {
                        message: err.to_string(),
                    });
            }
        }

        tokio::time::sleep(backoff.next_delay()).await;
        if connection.is_closed() {
            return;
        }
        if !acknowledged_once && !cell.publish(generation, ConnectionState::Connecting) {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
