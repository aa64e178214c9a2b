//! Live side of the parlor chat server: credentials, rooms, history,
//! per-connection sessions and the TCP listener.

pub mod client;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod listener;
pub mod message_log;
pub mod rooms;

use std::sync::Arc;

use tracing::error;

use parlor_crypto::{FrameCodec, SharedKey};
use parlor_db::{Database, StoreError};

use crate::credentials::CredentialStore;
use crate::dispatcher::Dispatcher;
use crate::message_log::MessageLog;
use crate::rooms::RoomDirectory;

/// Default number of messages replayed to a joining session.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Everything a session needs, cheap to clone into each connection task.
#[derive(Clone)]
pub struct Gateway {
    pub credentials: CredentialStore,
    pub rooms: RoomDirectory,
    pub log: MessageLog,
    pub dispatcher: Dispatcher,
    pub codec: FrameCodec,
    pub history_limit: u32,
}

impl Gateway {
    pub fn new(db: Arc<Database>, key: &SharedKey) -> Self {
        let codec = FrameCodec::new(key);
        let dispatcher = Dispatcher::new(codec.clone());
        Self {
            credentials: CredentialStore::new(db.clone()),
            rooms: RoomDirectory::new(db.clone(), dispatcher.clone()),
            log: MessageLog::new(db),
            dispatcher,
            codec,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    /// Swap the password hasher, e.g. for cheaper Argon2 parameters.
    pub fn with_password_hasher(mut self, hasher: argon2::Argon2<'static>) -> Self {
        self.credentials = self.credentials.with_hasher(hasher);
        self
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StoreError::Unavailable(e.to_string())
    })?
}
