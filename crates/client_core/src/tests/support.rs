//! In-memory transport used by unit tests in place of a WebSocket server.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::protocol::TransportEvent;
use tokio::{net::TcpListener, sync::mpsc};
use url::Url;

use crate::{
    connection::{ConnectionManager, ReconnectPolicy},
    conversation::ConversationStore,
    credentials::{Credential, CredentialSlot},
    error::{ClientError, ClientResult},
    http::ApiClient,
    notice::{Notice, Notices},
    session::SessionManager,
    storage::{KeyValueStore, MemoryStore},
    transport::{TransportDialer, TransportLink},
};

pub(crate) enum DialStep {
    Accept,
    Reject(ClientError),
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedDialer {
    script: Mutex<VecDeque<DialStep>>,
    dials: AtomicUsize,
    links: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    tokens: Mutex<Vec<String>>,
}

impl ScriptedDialer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues the outcome of the next dial; dials accept once the queue is empty.
    pub(crate) fn push(&self, step: DialStep) {
        self.script.lock().push_back(step);
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Delivers an event on the most recently accepted link.
    pub(crate) fn emit(&self, event: TransportEvent) -> bool {
        self.links
            .lock()
            .last()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Simulates the network dropping the most recent link.
    pub(crate) fn drop_link(&self) {
        self.links.lock().pop();
    }
}

struct ScriptedLink {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportDialer for ScriptedDialer {
    async fn dial(
        &self,
        _endpoint: &Url,
        credential: &Credential,
    ) -> ClientResult<Box<dyn TransportLink>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(credential.expose().to_string());
        let step = self.script.lock().pop_front().unwrap_or(DialStep::Accept);
        match step {
            DialStep::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.links.lock().push(tx);
                Ok(Box::new(ScriptedLink { rx }))
            }
            DialStep::Reject(err) => Err(err),
            DialStep::Hang => {
                futures::future::pending::<()>().await;
                unreachable!("pending never resolves")
            }
        }
    }
}

#[async_trait]
impl TransportLink for ScriptedLink {
    async fn recv(&mut self) -> Option<ClientResult<TransportEvent>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

pub(crate) fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        connect_timeout: Duration::from_millis(200),
        delay_min: Duration::from_millis(10),
        delay_max: Duration::from_millis(40),
    }
}

pub(crate) fn test_endpoint() -> Url {
    Url::parse("ws://127.0.0.1:9/chat").expect("endpoint")
}

pub(crate) fn manager_with(dialer: Arc<ScriptedDialer>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(dialer, test_endpoint(), fast_policy()))
}

pub(crate) fn credential(token: &str) -> Credential {
    Credential::new(token).expect("non-empty token")
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}

/// Serves `app` on an ephemeral port and returns its `/api` base URL.
pub(crate) async fn spawn_api(app: axum::Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api")
}

pub(crate) fn identity_json(id: &str, name: &str) -> Value {
    json!({
        "_id": id,
        "fullName": name,
        "email": format!("{id}@example.test"),
        "profilePic": "",
    })
}

pub(crate) fn message_json(id: &str, from: &str, to: &str, text: &str) -> Value {
    json!({
        "_id": id,
        "senderId": from,
        "receiverId": to,
        "text": text,
        "createdAt": "2024-05-01T10:00:00Z",
    })
}

pub(crate) fn drain_notices(rx: &mut tokio::sync::broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut seen = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        seen.push(notice);
    }
    seen
}

/// Every component wired against a test API and the scripted dialer.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub credentials: Arc<CredentialSlot>,
    pub notices: Notices,
    pub api: Arc<ApiClient>,
    pub dialer: Arc<ScriptedDialer>,
    pub connections: Arc<ConnectionManager>,
    pub session: Arc<SessionManager>,
    pub conversations: Arc<ConversationStore>,
}

impl Harness {
    pub(crate) fn new(base_url: &str) -> Self {
        Self::with_store(base_url, Arc::new(MemoryStore::new()))
    }

    pub(crate) fn with_store(base_url: &str, store: Arc<MemoryStore>) -> Self {
        let kv: Arc<dyn KeyValueStore> = store.clone();
        let notices = Notices::new();
        let credentials = Arc::new(CredentialSlot::restore(Arc::clone(&kv)));
        let api = Arc::new(
            ApiClient::new(
                base_url,
                Duration::from_secs(5),
                Arc::clone(&credentials),
                notices.clone(),
            )
            .expect("api client"),
        );
        let dialer = ScriptedDialer::new();
        let connections = manager_with(Arc::clone(&dialer));
        let session = SessionManager::new(
            Arc::clone(&api),
            Arc::clone(&credentials),
            Arc::clone(&connections),
            notices.clone(),
            Duration::from_secs(1),
        );
        let conversations = ConversationStore::new(
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&connections),
            kv,
            notices.clone(),
        );
        Self {
            store,
            credentials,
            notices,
            api,
            dialer,
            connections,
            session,
            conversations,
        }
    }
}
