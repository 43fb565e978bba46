use std::{
    collections::HashSet,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use serde::Deserialize;
use shared::{
    domain::UserId,
    protocol::{
        AuthPayload, EventKind, ForgotPasswordRequest, Identity, IdentityEnvelope, LoginRequest,
        ResetPasswordRequest, SignupRequest, TransportEvent, UpdateProfileRequest,
    },
};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionManager, ConnectionSignal, ListenerHandle},
    credentials::{Credential, CredentialSlot},
    error::{ClientError, ClientResult},
    http::{ApiClient, Intercept},
    notice::Notices,
};

/// In-progress markers for the session flows, for front ends that render
/// spinners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionProgress {
    pub checking_auth: bool,
    pub signing_up: bool,
    pub logging_in: bool,
    pub updating_profile: bool,
    pub sending_reset_email: bool,
    pub resetting_password: bool,
}

type PendingResolution = Shared<BoxFuture<'static, Option<Identity>>>;

#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: Option<String>,
}

/// Resolves and owns "who is signed in". Sole writer of the credential slot
/// and of the identity.
pub struct SessionManager {
    api: Arc<ApiClient>,
    credentials: Arc<CredentialSlot>,
    connections: Arc<ConnectionManager>,
    notices: Notices,
    connect_timeout: Duration,
    identity: watch::Sender<Option<Identity>>,
    online: watch::Sender<HashSet<UserId>>,
    progress: watch::Sender<SessionProgress>,
    pending: Mutex<Option<PendingResolution>>,
    presence: Mutex<Option<ListenerHandle>>,
    teardown: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        api: Arc<ApiClient>,
        credentials: Arc<CredentialSlot>,
        connections: Arc<ConnectionManager>,
        notices: Notices,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (identity, _) = watch::channel(None);
        let (online, _) = watch::channel(HashSet::new());
        let (progress, _) = watch::channel(SessionProgress::default());
        Arc::new(Self {
            api,
            credentials,
            connections,
            notices,
            connect_timeout,
            identity,
            online,
            progress,
            pending: Mutex::new(None),
            presence: Mutex::new(None),
            teardown: Mutex::new(()),
        })
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    pub fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    pub fn online_users(&self) -> HashSet<UserId> {
        self.online.borrow().clone()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.borrow().contains(user_id)
    }

    pub fn watch_online_users(&self) -> watch::Receiver<HashSet<UserId>> {
        self.online.subscribe()
    }

    pub fn progress(&self) -> SessionProgress {
        *self.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<SessionProgress> {
        self.progress.subscribe()
    }

    /// Resolves the current user. Concurrent callers share one in-flight
    /// resolution; the cell is cleared once it settles.
    pub async fn resolve_session(self: &Arc<Self>) -> Option<Identity> {
        let resolution = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(in_flight) => {
                    debug!("session: joining in-flight resolution");
                    in_flight.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let resolution = async move {
                        let resolved = this.run_resolution().await;
                        this.pending.lock().take();
                        resolved
                    }
                    .boxed()
                    .shared();
                    *pending = Some(resolution.clone());
                    resolution
                }
            }
        };
        resolution.await
    }

    async fn run_resolution(self: &Arc<Self>) -> Option<Identity> {
        self.progress.send_modify(|p| p.checking_auth = true);
        let resolved = match self
            .api
            .get::<IdentityEnvelope>("/auth/me", Intercept::Quiet)
            .await
        {
            Ok(envelope) => {
                let identity = envelope.into_identity();
                info!(user = %identity.id, "session: resolved from cookie session");
                self.identity.send_replace(Some(identity.clone()));
                match self.credentials.persisted() {
                    Ok(Some(credential)) => {
                        self.credentials.set(Some(credential.clone()));
                        self.connect_realtime(credential);
                    }
                    Ok(None) => debug!("session: no stored credential; realtime stays offline"),
                    Err(err) => warn!("session: could not read stored credential: {err}"),
                }
                Some(identity)
            }
            Err(err) => {
                debug!("session: cookie identity check failed: {err}");
                self.resolve_with_credential().await
            }
        };
        self.progress.send_modify(|p| p.checking_auth = false);
        resolved
    }

    async fn resolve_with_credential(self: &Arc<Self>) -> Option<Identity> {
        let credential = match self.credentials.persisted() {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("session: no stored credential; signed out");
                self.identity.send_replace(None);
                return None;
            }
            Err(err) => {
                warn!("session: could not read stored credential: {err}");
                self.sign_out_locally();
                return None;
            }
        };

        self.credentials.set(Some(credential.clone()));
        match self
            .api
            .get::<IdentityEnvelope>("/auth/check", Intercept::Quiet)
            .await
        {
            Ok(envelope) => {
                let identity = envelope.into_identity();
                info!(user = %identity.id, "session: resolved from stored credential");
                self.identity.send_replace(Some(identity.clone()));
                self.connect_realtime(credential);
                Some(identity)
            }
            Err(err) if err.is_transient() => {
                // Whatever was already established stays as it is.
                warn!("session: stored credential could not be verified; keeping it: {err}");
                self.identity()
            }
            Err(err) => {
                info!("session: stored credential rejected: {err}");
                self.sign_out_locally();
                None
            }
        }
    }

    pub async fn login(self: &Arc<Self>, request: LoginRequest) -> ClientResult<Identity> {
        self.progress.send_modify(|p| p.logging_in = true);
        let result = self.authenticate("/auth/login", &request).await;
        self.progress.send_modify(|p| p.logging_in = false);
        if result.is_ok() {
            self.notices.success("Logged in!");
        }
        result
    }

    pub async fn signup(self: &Arc<Self>, request: SignupRequest) -> ClientResult<Identity> {
        self.progress.send_modify(|p| p.signing_up = true);
        let result = self.authenticate("/auth/signup", &request).await;
        self.progress.send_modify(|p| p.signing_up = false);
        if result.is_ok() {
            self.notices.success("Account created!");
        }
        result
    }

    async fn authenticate<B>(self: &Arc<Self>, path: &str, body: &B) -> ClientResult<Identity>
    where
        B: serde::Serialize + Sync,
    {
        let payload = self
            .api
            .post::<B, AuthPayload>(path, body, Intercept::Quiet)
            .await
            .inspect_err(|err| self.notices.error(err.user_message()))?;
        let identity = payload.identity.into_identity();

        let Some(credential) = payload.token.and_then(Credential::new) else {
            warn!(user = %identity.id, "session: auth response carried no credential; realtime stays offline");
            self.identity.send_replace(Some(identity.clone()));
            return Ok(identity);
        };

        self.credentials.set(Some(credential.clone()));
        self.identity.send_replace(Some(identity.clone()));
        info!(user = %identity.id, "session: signed in");
        self.connect_realtime(credential);

        match self.connections.wait_until_connected(self.connect_timeout).await {
            Ok(_) => {}
            Err(ClientError::Unauthorized) => {
                self.force_logout("transport rejected a fresh credential");
                return Err(ClientError::Unauthorized);
            }
            Err(err) => {
                warn!("session: realtime not ready after sign-in: {err}");
                self.notices.warning(err.user_message());
            }
        }
        Ok(identity)
    }

    /// Always succeeds locally, whatever the server says.
    pub async fn logout(&self) {
        if let Err(err) = self
            .api
            .post_discarding("/auth/logout", &serde_json::json!({}), Intercept::Quiet)
            .await
        {
            debug!("session: server logout failed; clearing locally anyway: {err}");
        }
        self.sign_out_locally();
        info!("session: logged out");
        self.notices.success("Logged out!");
    }

    /// Local teardown after the credential was rejected. One notice per
    /// expiry: repeated calls after the first find nothing to clear.
    pub fn force_logout(&self, reason: &str) {
        let had_session = {
            let _teardown = self.teardown.lock();
            let had_credential = self.credentials.take().is_some();
            let had_identity = self.identity.borrow().is_some();
            self.sign_out_locally();
            had_credential || had_identity
        };
        if had_session {
            warn!(reason, "session: forced logout");
            self.notices.error(ClientError::Unauthorized.user_message());
        } else {
            debug!(reason, "session: forced logout with no session; nothing to clear");
        }
    }

    pub async fn update_profile(&self, avatar_ref: impl Into<String>) -> ClientResult<Identity> {
        if self.identity.borrow().is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        self.progress.send_modify(|p| p.updating_profile = true);
        let result = self
            .api
            .put::<_, IdentityEnvelope>(
                "/auth/update-profile",
                &UpdateProfileRequest {
                    avatar_ref: avatar_ref.into(),
                },
                Intercept::Global,
            )
            .await
            .map(IdentityEnvelope::into_identity);
        self.progress.send_modify(|p| p.updating_profile = false);

        let identity = result?;
        self.identity.send_replace(Some(identity.clone()));
        self.notices.success("Profile updated!");
        Ok(identity)
    }

    /// Asks the server to mail a reset link. Returns whether it accepted.
    pub async fn forgot_password(&self, email: impl Into<String>) -> bool {
        self.progress.send_modify(|p| p.sending_reset_email = true);
        let result = self
            .api
            .post::<_, Option<StatusBody>>(
                "/auth/forgot-password",
                &ForgotPasswordRequest {
                    email: email.into(),
                },
                Intercept::Global,
            )
            .await;
        self.progress.send_modify(|p| p.sending_reset_email = false);
        self.report_status(result, "Reset link sent. Check your email.")
    }

    pub async fn reset_password(&self, token: &str, password: impl Into<String>) -> bool {
        let token = token.trim();
        if token.is_empty() {
            self.notices.error("Reset link is invalid or expired.");
            return false;
        }
        self.progress.send_modify(|p| p.resetting_password = true);
        let result = self
            .api
            .post::<_, Option<StatusBody>>(
                &format!("/auth/reset-password/{token}"),
                &ResetPasswordRequest {
                    password: password.into(),
                },
                Intercept::Global,
            )
            .await;
        self.progress.send_modify(|p| p.resetting_password = false);
        self.report_status(result, "Password updated. You can log in now.")
    }

    fn report_status(&self, result: ClientResult<Option<StatusBody>>, fallback: &str) -> bool {
        match result {
            Ok(body) => {
                let text = body
                    .and_then(|b| b.message)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| fallback.to_string());
                self.notices.success(text);
                true
            }
            Err(err) => {
                debug!("session: password flow rejected: {err}");
                false
            }
        }
    }

    /// Forces a local logout whenever the transport or any intercepted
    /// request reports the credential as rejected.
    pub fn watch_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let this: Weak<Self> = Arc::downgrade(self);
        let mut signals = self.connections.subscribe_signals();
        let mut expired = self.api.subscribe_expired();
        tokio::spawn(async move {
            loop {
                let reason = tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(ConnectionSignal::Unauthorized { generation }) => {
                            let Some(session) = this.upgrade() else { break };
                            let stale = session
                                .connections
                                .current()
                                .is_some_and(|current| current.generation() != generation);
                            if stale {
                                debug!(generation, "session: ignoring rejection from a replaced connection");
                                continue;
                            }
                            "transport rejected the credential"
                        }
                        Err(RecvError::Lagged(_)) => "transport rejected the credential",
                        Err(RecvError::Closed) => break,
                    },
                    expiry = expired.recv() => match expiry {
                        Ok(()) | Err(RecvError::Lagged(_)) => "request rejected the credential",
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(session) = this.upgrade() else { break };
                session.force_logout(reason);
            }
            debug!("session: signal watcher stopped");
        })
    }

    fn connect_realtime(self: &Arc<Self>, credential: Credential) -> Arc<Connection> {
        let connection = self.connections.connect(credential);
        self.bind_presence(&connection);
        connection
    }

    /// Feeds `getOnlineUsers` into the online set. Bound once per connection.
    fn bind_presence(self: &Arc<Self>, connection: &Arc<Connection>) {
        let mut bound = self.presence.lock();
        if bound
            .as_ref()
            .is_some_and(|handle| handle.generation() == connection.generation())
        {
            return;
        }
        if let Some(previous) = bound.take() {
            if let Err(err) = previous.detach() {
                debug!("session: previous presence listener already gone: {err}");
            }
        }

        let this = Arc::downgrade(self);
        match connection.on(EventKind::GetOnlineUsers, move |event| {
            let (Some(session), TransportEvent::GetOnlineUsers(users)) = (this.upgrade(), event)
            else {
                return;
            };
            debug!(count = users.len(), "session: online users updated");
            session
                .online
                .send_replace(users.iter().cloned().collect());
        }) {
            Ok(handle) => *bound = Some(handle),
            Err(err) => warn!("session: could not bind presence listener: {err}"),
        }
    }

    fn sign_out_locally(&self) {
        self.credentials.clear();
        self.identity.send_replace(None);
        self.online.send_replace(HashSet::new());
        if let Some(handle) = self.presence.lock().take() {
            let _ = handle.detach();
        }
        self.connections.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
