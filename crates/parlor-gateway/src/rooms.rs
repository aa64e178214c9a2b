use std::sync::Arc;

use tracing::info;

use parlor_db::{Database, StoreError};

use crate::blocking;
use crate::dispatcher::Dispatcher;

/// The room every server has, whether or not it was ever created.
pub const DEFAULT_ROOM: &str = "general";

/// Durable room records plus their live membership sets.
#[derive(Clone)]
pub struct RoomDirectory {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl RoomDirectory {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Persist a new room and set up its (empty) membership. Fails with
    /// `DuplicateRoom` for an existing name, including the default room.
    pub async fn create_room(&self, name: &str, creator: &str) -> Result<(), StoreError> {
        if name == DEFAULT_ROOM {
            return Err(StoreError::DuplicateRoom);
        }

        let db = self.db.clone();
        let room = name.to_string();
        let created_by = creator.to_string();
        blocking(move || {
            let now = chrono::Utc::now().to_rfc3339();
            db.create_room(&room, &created_by, &now)
        })
        .await?;

        // A lenient join may already have made the live room; keep its members.
        self.dispatcher.room(name).await;
        info!("{} created room {}", creator, name);
        Ok(())
    }

    /// Room names: the default room first, then the rest in creation order.
    pub async fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.clone();
        let stored = blocking(move || db.list_rooms()).await?;

        let mut names = vec![DEFAULT_ROOM.to_string()];
        names.extend(stored.into_iter().filter(|name| name != DEFAULT_ROOM));
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_crypto::{FrameCodec, SharedKey};

    fn directory() -> RoomDirectory {
        let codec = FrameCodec::new(&SharedKey::from_bytes([1; 32]));
        RoomDirectory::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Dispatcher::new(codec),
        )
    }

    #[tokio::test]
    async fn default_room_is_listed_on_a_fresh_store() {
        assert_eq!(directory().list_rooms().await.unwrap(), vec!["general"]);
    }

    #[tokio::test]
    async fn default_room_cannot_be_created() {
        let err = directory().create_room("general", "alice").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRoom));
    }

    #[tokio::test]
    async fn created_rooms_follow_default_in_creation_order() {
        let rooms = directory();
        rooms.create_room("zeta", "alice").await.unwrap();
        rooms.create_room("alpha", "bob").await.unwrap();
        assert!(matches!(
            rooms.create_room("zeta", "carol").await,
            Err(StoreError::DuplicateRoom)
        ));
        assert_eq!(
            rooms.list_rooms().await.unwrap(),
            vec!["general", "zeta", "alpha"]
        );
    }

    #[tokio::test]
    async fn creating_a_room_initializes_empty_membership() {
        let rooms = directory();
        rooms.create_room("lobby", "alice").await.unwrap();
        let room = rooms.dispatcher.room("lobby").await;
        assert!(room.lock().await.is_empty());
    }
}
