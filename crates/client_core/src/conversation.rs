use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use shared::{
    domain::{ConnectionState, UserId},
    protocol::{ListEnvelope, Message, MessageEnvelope, Peer, SendMessageRequest},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    error::{ClientError, ClientResult},
    http::{ApiClient, Intercept},
    notice::Notices,
    session::SessionManager,
    storage::{KeyValueStore, SELECTION_KEY},
    subscription::{Delivery, FocusOutcome, SubscriptionRouter},
};

/// Changes front ends render from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    RosterLoaded { count: usize },
    SelectionChanged(Option<UserId>),
    MessagesLoaded { peer: UserId, count: usize },
    MessageAppended(Message),
}

/// Result of selecting a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Messages loaded and live delivery installed.
    Live,
    /// Messages loaded; live delivery waits for the transport.
    Offline,
    /// Another selection happened while this one was loading.
    Superseded,
}

#[derive(Debug, Default)]
struct ConversationState {
    roster: Vec<Peer>,
    messages: Vec<Message>,
    active: Option<UserId>,
    roster_loading: bool,
    messages_loading: bool,
    sending: bool,
}

pub struct ConversationStore {
    api: Arc<ApiClient>,
    session: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    store: Arc<dyn KeyValueStore>,
    notices: Notices,
    router: SubscriptionRouter,
    state: Mutex<ConversationState>,
    epoch: AtomicU64,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationStore {
    pub fn new(
        api: Arc<ApiClient>,
        session: Arc<SessionManager>,
        connections: Arc<ConnectionManager>,
        store: Arc<dyn KeyValueStore>,
        notices: Notices,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|this: &Weak<Self>| {
            let inbound = this.clone();
            let router = SubscriptionRouter::new(
                Arc::clone(&connections),
                Arc::new(move |delivery| {
                    if let Some(store) = inbound.upgrade() {
                        store.deliver(delivery);
                    }
                }),
            );
            Self {
                api,
                session,
                connections,
                store,
                notices,
                router,
                state: Mutex::new(ConversationState::default()),
                epoch: AtomicU64::new(0),
                events,
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn active_peer(&self) -> Option<UserId> {
        self.state.lock().active.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn is_roster_loading(&self) -> bool {
        self.state.lock().roster_loading
    }

    pub fn is_messages_loading(&self) -> bool {
        self.state.lock().messages_loading
    }

    pub fn is_sending(&self) -> bool {
        self.state.lock().sending
    }

    /// The last fetched roster with presence merged from the session's
    /// online set.
    pub fn roster(&self, online_only: bool) -> Vec<Peer> {
        let online = self.session.online_users();
        self.state
            .lock()
            .roster
            .iter()
            .map(|peer| Peer {
                is_online: peer.is_online || online.contains(&peer.id),
                ..peer.clone()
            })
            .filter(|peer| !online_only || peer.is_online)
            .collect()
    }

    pub async fn fetch_roster(&self) -> ClientResult<Vec<Peer>> {
        self.state.lock().roster_loading = true;
        let result = self
            .api
            .get::<ListEnvelope<Peer>>("/messages/users", Intercept::Global)
            .await;

        let mut state = self.state.lock();
        state.roster_loading = false;
        let roster = result?.into_vec();
        debug!(count = roster.len(), "conversation: roster loaded");
        state.roster = roster.clone();
        drop(state);

        let _ = self.events.send(ConversationEvent::RosterLoaded {
            count: roster.len(),
        });
        Ok(roster)
    }

    /// Replaces the message list with `peer_id`'s history. The result is
    /// dropped if a different peer is active by the time it arrives.
    pub async fn fetch_messages(&self, peer_id: &UserId) -> ClientResult<Vec<Message>> {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.load_messages(peer_id, epoch).await
    }

    async fn load_messages(&self, peer_id: &UserId, epoch: u64) -> ClientResult<Vec<Message>> {
        self.state.lock().messages_loading = true;
        let result = self
            .api
            .get::<ListEnvelope<Message>>(&format!("/messages/{peer_id}"), Intercept::Global)
            .await;

        let mut state = self.state.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(peer = %peer_id, "conversation: discarding message fetch from an older selection");
            return result.map(ListEnvelope::into_vec);
        }
        state.messages_loading = false;
        if state.active.as_ref().is_some_and(|active| active != peer_id) {
            debug!(peer = %peer_id, "conversation: discarding message fetch for an inactive peer");
            return result.map(ListEnvelope::into_vec);
        }

        let messages: Vec<Message> = result?
            .into_vec()
            .into_iter()
            .filter(|message| {
                let valid = message.has_content();
                if !valid {
                    warn!(message = %message.id, "conversation: dropping message with no content");
                }
                valid
            })
            .collect();
        state.messages = messages.clone();
        drop(state);

        let _ = self.events.send(ConversationEvent::MessagesLoaded {
            peer: peer_id.clone(),
            count: messages.len(),
        });
        Ok(messages)
    }

    /// Switches the active conversation: unfocus, clear, select, fetch,
    /// then focus the new peer if this selection is still current.
    pub async fn select_peer(&self, peer_id: &UserId) -> ClientResult<SelectOutcome> {
        self.router.unfocus();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut state = self.state.lock();
            state.messages.clear();
            state.active = Some(peer_id.clone());
        }
        if let Err(err) = self.store.set(SELECTION_KEY, peer_id.as_str()) {
            warn!(peer = %peer_id, "conversation: could not persist selection: {err}");
        }
        info!(peer = %peer_id, "conversation: peer selected");
        let _ = self
            .events
            .send(ConversationEvent::SelectionChanged(Some(peer_id.clone())));

        let fetched = self.load_messages(peer_id, epoch).await;
        if self.epoch.load(Ordering::Acquire) != epoch {
            return Ok(SelectOutcome::Superseded);
        }

        let outcome = match self.router.focus(peer_id) {
            FocusOutcome::Installed => SelectOutcome::Live,
            FocusOutcome::Offline => SelectOutcome::Offline,
        };
        fetched.map(|_| outcome)
    }

    pub fn clear_selection(&self) {
        self.router.unfocus();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        {
            let mut state = self.state.lock();
            state.messages.clear();
            state.active = None;
            state.messages_loading = false;
        }
        if let Err(err) = self.store.remove(SELECTION_KEY) {
            warn!("conversation: could not clear persisted selection: {err}");
        }
        let _ = self.events.send(ConversationEvent::SelectionChanged(None));
    }

    /// Re-selects the persisted peer when nothing is selected and the peer is
    /// still on the roster.
    pub async fn restore_selection(&self) -> ClientResult<Option<SelectOutcome>> {
        let Some(saved) = self.store.get(SELECTION_KEY)?.map(UserId::new) else {
            return Ok(None);
        };
        let eligible = {
            let state = self.state.lock();
            state.active.is_none() && state.roster.iter().any(|peer| peer.id == saved)
        };
        if !eligible {
            debug!(peer = %saved, "conversation: persisted selection not restorable");
            return Ok(None);
        }
        self.select_peer(&saved).await.map(Some)
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> ClientResult<Message> {
        let text = request.text.filter(|text| !text.trim().is_empty());
        let image_ref = request.image_ref.filter(|image| !image.trim().is_empty());
        if text.is_none() && image_ref.is_none() {
            self.notices.error(ClientError::EmptyMessage.user_message());
            return Err(ClientError::EmptyMessage);
        }
        let Some(peer_id) = self.active_peer() else {
            self.notices.error(ClientError::NoRecipient.user_message());
            return Err(ClientError::NoRecipient);
        };

        self.state.lock().sending = true;
        let result = self
            .api
            .post::<_, MessageEnvelope>(
                &format!("/messages/send/{peer_id}"),
                &SendMessageRequest {
                    text: text.map(|t| t.trim().to_string()),
                    image_ref,
                },
                Intercept::Global,
            )
            .await
            .map(MessageEnvelope::into_message);
        self.state.lock().sending = false;

        let message = result?;
        debug!(peer = %peer_id, message = %message.id, "conversation: message sent");
        self.append(&peer_id, message.clone());
        Ok(message)
    }

    fn deliver(&self, delivery: Delivery) {
        if !delivery.message.has_content() {
            warn!(message = %delivery.message.id, "conversation: dropping inbound message with no content");
            return;
        }
        self.append(&delivery.peer, delivery.message);
    }

    fn append(&self, peer_id: &UserId, message: Message) {
        {
            let mut state = self.state.lock();
            if state.active.as_ref() != Some(peer_id) {
                debug!(peer = %peer_id, "conversation: message for an inactive conversation");
                return;
            }
            if state.messages.iter().any(|known| known.id == message.id) {
                return;
            }
            state.messages.push(message.clone());
        }
        let _ = self.events.send(ConversationEvent::MessageAppended(message));
    }

    fn reset(&self) {
        self.router.unfocus();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *self.state.lock() = ConversationState::default();
        let _ = self.events.send(ConversationEvent::SelectionChanged(None));
    }

    /// Re-focuses the active peer whenever the transport (re)connects and
    /// drops all conversation state when the session ends or the signed-in
    /// user changes.
    pub fn watch_connection(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let mut states = self.connections.watch_state();
        let mut identity = self.session.watch_identity();
        let mut owner = identity.borrow().as_ref().map(|user| user.id.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *states.borrow_and_update() != ConnectionState::Connected {
                            continue;
                        }
                        let Some(store) = this.upgrade() else { break };
                        store.refocus();
                    }
                    changed = identity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let signed_in = identity.borrow_and_update().as_ref().map(|user| user.id.clone());
                        let previous = std::mem::replace(&mut owner, signed_in.clone());
                        if previous.is_none() || previous == signed_in {
                            continue;
                        }
                        let Some(store) = this.upgrade() else { break };
                        match signed_in {
                            Some(user) => debug!(user = %user, "conversation: signed-in user changed; clearing state"),
                            None => debug!("conversation: session ended; clearing state"),
                        }
                        store.reset();
                    }
                }
            }
        })
    }

    fn refocus(&self) {
        let Some(peer_id) = self.active_peer() else {
            return;
        };
        let Some(connection) = self.connections.current() else {
            return;
        };
        if self.router.is_installed_on(&connection) {
            return;
        }
        if self.router.focus(&peer_id) == FocusOutcome::Installed {
            info!(peer = %peer_id, "conversation: live delivery restored");
        }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
