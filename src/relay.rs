//! Relay facade wiring the store, notifier, producer and sessions.

use crate::auth::{AllowAll, Authenticator, TokenAuthenticator};
use crate::entries::EntryStore;
use crate::error::{RelayError, Result};
use crate::notifier::Notifier;
use crate::producer::Producer;
use crate::session::{ConsumerSession, SessionConfig, SessionHandle, SessionId};
use crate::store::{DurableStore, StoreConfig};
use crate::transport::Transport;
use crate::types::{Entry, DEFAULT_NAMESPACE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Environment variable holding the shared auth token.
pub const AUTH_TOKEN_VAR: &str = "AUTH_TOKEN";

/// Environment variable overriding the store directory.
pub const STORE_PATH_VAR: &str = "COURIER_STORE_PATH";

/// Relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Durable store settings.
    pub store: StoreConfig,

    /// Shared token required from producers and consumers (None = open).
    pub auth_token: Option<String>,

    /// Namespace messages are written under.
    pub namespace: String,

    /// Notifier buffer per session.
    pub session_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            auth_token: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            session_buffer_size: SessionConfig::default().buffer_size,
        }
    }
}

impl RelayConfig {
    /// Read configuration from the process environment.
    ///
    /// `AUTH_TOKEN` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let auth_token = lookup(AUTH_TOKEN_VAR)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RelayError::NotConfigured(format!("${} not set", AUTH_TOKEN_VAR)))?;

        let mut config = Self {
            auth_token: Some(auth_token),
            ..Default::default()
        };
        if let Some(path) = lookup(STORE_PATH_VAR) {
            config.store.path = PathBuf::from(path);
        }
        Ok(config)
    }
}

/// A running relay.
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn EntryStore>,
    notifier: Arc<Notifier>,
    producer: Producer,
    auth: Box<dyn Authenticator>,
    next_session: AtomicU64,
}

impl Relay {
    /// Open (or create) the durable store named by `config` and start a relay on it.
    pub fn open(config: RelayConfig) -> Result<Self> {
        let store = DurableStore::open_or_create(config.store.clone())?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Start a relay on any entry store.
    pub fn with_store(config: RelayConfig, store: Arc<dyn EntryStore>) -> Self {
        let notifier = Arc::new(Notifier::new());
        let producer = Producer::new(config.namespace.clone(), Arc::clone(&store), Arc::clone(&notifier));
        let auth: Box<dyn Authenticator> = match &config.auth_token {
            Some(token) => Box::new(TokenAuthenticator::new(token)),
            None => Box::new(AllowAll),
        };

        Self {
            config,
            store,
            notifier,
            producer,
            auth,
            next_session: AtomicU64::new(1),
        }
    }

    /// Replace the authenticator.
    pub fn with_authenticator(mut self, auth: impl Authenticator + 'static) -> Self {
        self.auth = Box::new(auth);
        self
    }

    /// Producer ingress: authenticate, then enqueue `payload`.
    pub fn publish(&self, credential: Option<&str>, payload: impl Into<Vec<u8>>) -> Result<Entry> {
        self.authorize(credential)?;
        self.producer.publish(payload)
    }

    /// Consumer ingress: authenticate, then start a session on `transport`.
    pub fn connect<T: Transport + 'static>(
        &self,
        credential: Option<&str>,
        transport: T,
    ) -> Result<SessionHandle> {
        self.authorize(credential)?;

        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let config = SessionConfig {
            namespace: self.config.namespace.clone(),
            buffer_size: self.config.session_buffer_size,
        };
        ConsumerSession::spawn(
            id,
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            transport,
        )
    }

    /// Entries nobody has claimed yet, oldest first.
    pub fn pending(&self) -> Result<Vec<Entry>> {
        self.store.list_ordered(&self.config.namespace)
    }

    /// Disconnect every live session.
    pub fn shutdown(&self) {
        self.notifier.shutdown();
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn authorize(&self, credential: Option<&str>) -> Result<()> {
        self.auth.authorize(credential).map_err(|e| {
            debug!("request rejected");
            e
        })
    }
}
