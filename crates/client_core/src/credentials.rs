use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::ClientResult,
    storage::{KeyValueStore, CREDENTIAL_KEY},
};

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Blank tokens are treated as absent.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let token = token.trim();
        (!token.is_empty()).then(|| Self(token.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Owner of the credential: keeps the request layer's default authorization
/// value and the persisted slot in lockstep.
pub struct CredentialSlot {
    store: Arc<dyn KeyValueStore>,
    header: Mutex<Option<Credential>>,
}

impl CredentialSlot {
    /// Restores the header from the persisted slot, if any.
    pub fn restore(store: Arc<dyn KeyValueStore>) -> Self {
        let header = match store.get(CREDENTIAL_KEY) {
            Ok(value) => value.and_then(Credential::new),
            Err(err) => {
                warn!("credentials: failed to read persisted credential: {err}");
                None
            }
        };
        Self {
            store,
            header: Mutex::new(header),
        }
    }

    /// Replaces (or clears) the credential. Header and slot change under one
    /// lock so readers never see them disagree.
    pub fn set(&self, credential: Option<Credential>) {
        let mut header = self.header.lock();
        let written = match &credential {
            Some(credential) => self.store.set(CREDENTIAL_KEY, credential.expose()),
            None => self.store.remove(CREDENTIAL_KEY),
        };
        if let Err(err) = written {
            warn!(
                present = credential.is_some(),
                "credentials: persistent slot update failed: {err}"
            );
        }
        debug!(present = credential.is_some(), "credentials: updated");
        *header = credential;
    }

    pub fn clear(&self) {
        self.set(None);
    }

    /// Clears the credential and hands back whatever was held, in one step.
    pub fn take(&self) -> Option<Credential> {
        let mut header = self.header.lock();
        if let Err(err) = self.store.remove(CREDENTIAL_KEY) {
            warn!("credentials: persistent slot update failed: {err}");
        }
        let previous = header.take();
        debug!(present = previous.is_some(), "credentials: taken");
        previous
    }

    pub fn current(&self) -> Option<Credential> {
        self.header.lock().clone()
    }

    /// Reads the credential straight from the persisted slot.
    pub fn persisted(&self) -> ClientResult<Option<Credential>> {
        let _guard = self.header.lock();
        Ok(self.store.get(CREDENTIAL_KEY)?.and_then(Credential::new))
    }

    pub fn authorization_header(&self) -> Option<String> {
        self.header.lock().as_ref().map(Credential::bearer)
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
