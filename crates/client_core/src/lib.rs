use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{
    domain::{ConnectionState, UserId},
    protocol::{Identity, LoginRequest, Message, Peer, SendMessageRequest, SignupRequest},
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod config;
pub mod connection;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod http;
pub mod notice;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transport;

pub use config::{load_settings, transport_endpoint, ClientSettings};
pub use connection::{Connection, ConnectionManager, ConnectionSignal, ReconnectPolicy};
pub use conversation::{ConversationEvent, ConversationStore, SelectOutcome};
pub use error::{ClientError, ClientResult};
pub use notice::{Notice, NoticeLevel, Notices};
pub use session::{SessionManager, SessionProgress};

use crate::{
    credentials::CredentialSlot,
    http::ApiClient,
    storage::{FileStore, KeyValueStore},
    transport::{TransportDialer, WsDialer},
};

/// Composition root: one credential slot, one request layer, one transport
/// owner, and the session and conversation state built on them.
pub struct ChatClient {
    settings: ClientSettings,
    notices: Notices,
    connections: Arc<ConnectionManager>,
    session: Arc<SessionManager>,
    conversations: Arc<ConversationStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    /// Production wiring: state on disk, WebSocket transport.
    pub fn new(settings: ClientSettings) -> anyhow::Result<Arc<Self>> {
        let store = FileStore::open(&settings.state_path).with_context(|| {
            format!(
                "failed to open client state at '{}'",
                settings.state_path.display()
            )
        })?;
        Ok(Self::with_dependencies(
            settings,
            Arc::new(store),
            Arc::new(WsDialer),
        )?)
    }

    pub fn with_dependencies(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        dialer: Arc<dyn TransportDialer>,
    ) -> ClientResult<Arc<Self>> {
        let notices = Notices::new();
        let credentials = Arc::new(CredentialSlot::restore(Arc::clone(&store)));
        let api = Arc::new(ApiClient::new(
            settings.api_base_url.clone(),
            settings.request_timeout(),
            Arc::clone(&credentials),
            notices.clone(),
        )?);

        let (delay_min, delay_max) = settings.reconnect_delays();
        let connections = Arc::new(ConnectionManager::new(
            dialer,
            transport_endpoint(&settings)?,
            ReconnectPolicy {
                connect_timeout: settings.connect_timeout(),
                delay_min,
                delay_max,
            },
        ));
        let session = SessionManager::new(
            Arc::clone(&api),
            credentials,
            Arc::clone(&connections),
            notices.clone(),
            settings.connect_timeout(),
        );
        let conversations = ConversationStore::new(
            api,
            Arc::clone(&session),
            Arc::clone(&connections),
            store,
            notices.clone(),
        );

        Ok(Arc::new(Self {
            settings,
            notices,
            connections,
            session,
            conversations,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Starts the background watchers. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.session.watch_signals());
        tasks.push(self.conversations.watch_connection());
        info!(
            api = %self.settings.api_base_url,
            transport = %self.connections.endpoint(),
            "client: started"
        );
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.connections.disconnect();
    }
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn resolve_session(&self) -> Option<Identity>;
    async fn login(&self, email: &str, password: &str) -> ClientResult<Identity>;
    async fn signup(&self, full_name: &str, email: &str, password: &str)
        -> ClientResult<Identity>;
    async fn logout(&self);
    async fn update_profile(&self, avatar_ref: &str) -> ClientResult<Identity>;
    async fn forgot_password(&self, email: &str) -> bool;
    async fn reset_password(&self, token: &str, password: &str) -> bool;
    /// Refreshes the roster, restores the persisted selection, and returns
    /// the roster with presence merged in.
    async fn list_peers(&self, online_only: bool) -> ClientResult<Vec<Peer>>;
    async fn select_peer(&self, peer_id: &UserId) -> ClientResult<SelectOutcome>;
    async fn send_message(&self, text: Option<&str>, image_ref: Option<&str>)
        -> ClientResult<Message>;
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn resolve_session(&self) -> Option<Identity> {
        self.session.resolve_session().await
    }

    async fn login(&self, email: &str, password: &str) -> ClientResult<Identity> {
        self.session
            .login(LoginRequest {
                email: email.trim().to_string(),
                password: password.to_string(),
            })
            .await
    }

    async fn signup(
        &self,
        full_name: &str,
        email: &str,
        password: &str,
    ) -> ClientResult<Identity> {
        self.session
            .signup(SignupRequest {
                email: email.trim().to_string(),
                password: password.to_string(),
                full_name: full_name.trim().to_string(),
            })
            .await
    }

    async fn logout(&self) {
        self.session.logout().await;
    }

    async fn update_profile(&self, avatar_ref: &str) -> ClientResult<Identity> {
        self.session.update_profile(avatar_ref).await
    }

    async fn forgot_password(&self, email: &str) -> bool {
        self.session.forgot_password(email.trim()).await
    }

    async fn reset_password(&self, token: &str, password: &str) -> bool {
        self.session.reset_password(token, password).await
    }

    async fn list_peers(&self, online_only: bool) -> ClientResult<Vec<Peer>> {
        self.conversations.fetch_roster().await?;
        if let Err(err) = self.conversations.restore_selection().await {
            warn!("client: could not restore the previous selection: {err}");
        }
        Ok(self.conversations.roster(online_only))
    }

    async fn select_peer(&self, peer_id: &UserId) -> ClientResult<SelectOutcome> {
        self.conversations.select_peer(peer_id).await
    }

    async fn send_message(
        &self,
        text: Option<&str>,
        image_ref: Option<&str>,
    ) -> ClientResult<Message> {
        self.conversations
            .send_message(SendMessageRequest {
                text: text.map(str::to_string),
                image_ref: image_ref.map(str::to_string),
            })
            .await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
