use std::sync::Arc;

use parking_lot::Mutex;
use shared::{
    domain::UserId,
    protocol::{EventKind, Message, TransportEvent},
};
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionManager, ListenerHandle};

/// A message accepted for the focused conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub peer: UserId,
    pub message: Message,
}

pub type DeliverySink = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOutcome {
    Installed,
    /// No connected transport; nothing was installed.
    Offline,
}

struct Installed {
    peer: UserId,
    handle: ListenerHandle,
}

/// Keeps at most one live `newMessage` handler, scoped to the focused peer.
pub struct SubscriptionRouter {
    connections: Arc<ConnectionManager>,
    sink: DeliverySink,
    installed: Mutex<Option<Installed>>,
}

impl SubscriptionRouter {
    pub fn new(connections: Arc<ConnectionManager>, sink: DeliverySink) -> Self {
        Self {
            connections,
            sink,
            installed: Mutex::new(None),
        }
    }

    pub fn focus(&self, peer_id: &UserId) -> FocusOutcome {
        let mut installed = self.installed.lock();
        if let Some(previous) = installed.take() {
            detach_logged(previous);
        }

        let Some(connection) = self
            .connections
            .current()
            .filter(|connection| connection.is_connected())
        else {
            debug!(peer = %peer_id, "router: transport not connected; focus deferred");
            return FocusOutcome::Offline;
        };

        let peer = peer_id.clone();
        let sink = Arc::clone(&self.sink);
        let bound = connection.on(EventKind::NewMessage, move |event| {
            let TransportEvent::NewMessage(message) = event else {
                return;
            };
            if !message.involves(&peer) {
                trace!(peer = %peer, message = %message.id, "router: message for another conversation");
                return;
            }
            sink(Delivery {
                peer: peer.clone(),
                message: message.clone(),
            });
        });

        match bound {
            Ok(handle) => {
                info!(
                    peer = %peer_id,
                    generation = handle.generation(),
                    "router: handler installed"
                );
                *installed = Some(Installed {
                    peer: peer_id.clone(),
                    handle,
                });
                FocusOutcome::Installed
            }
            Err(err) => {
                warn!(peer = %peer_id, "router: could not install handler: {err}");
                FocusOutcome::Offline
            }
        }
    }

    /// Removes the installed handler, if any. Safe to call repeatedly.
    pub fn unfocus(&self) {
        if let Some(previous) = self.installed.lock().take() {
            detach_logged(previous);
        }
    }

    pub fn focused_peer(&self) -> Option<UserId> {
        self.installed
            .lock()
            .as_ref()
            .map(|installed| installed.peer.clone())
    }

    /// Whether the installed handler lives on `connection`.
    pub fn is_installed_on(&self, connection: &Connection) -> bool {
        !connection.is_closed()
            && self
                .installed
                .lock()
                .as_ref()
                .is_some_and(|installed| installed.handle.generation() == connection.generation())
    }
}

fn detach_logged(previous: Installed) {
    let peer = previous.peer;
    match previous.handle.detach() {
        Ok(()) => debug!(peer = %peer, "router: handler removed"),
        Err(err) => debug!(peer = %peer, "router: handler already gone: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
