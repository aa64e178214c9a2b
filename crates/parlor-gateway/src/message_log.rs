use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use parlor_db::models::MessageRow;
use parlor_db::{Database, StoreError};
use parlor_types::{HistoryEntry, MessageKind};

use crate::blocking;

/// Append-only per-room message history.
#[derive(Clone)]
pub struct MessageLog {
    db: Arc<Database>,
}

impl MessageLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durably append one message stamped with `timestamp`.
    pub async fn append(
        &self,
        room: &str,
        username: &str,
        body: String,
        kind: MessageKind,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let room = room.to_string();
        let username = username.to_string();

        blocking(move || {
            let id = db.insert_message(&room, &username, &body, kind.as_str(), &timestamp.to_rfc3339())?;
            trace!("Stored message {} in {}", id, room);
            Ok(())
        })
        .await
    }

    /// At most the `limit` most recent messages of `room`, oldest first.
    pub async fn history(&self, room: &str, limit: u32) -> Result<Vec<HistoryEntry>, StoreError> {
        let db = self.db.clone();
        let room = room.to_string();

        let rows = blocking(move || db.recent_messages(&room, limit)).await?;
        Ok(rows.into_iter().map(history_entry).collect())
    }
}

fn history_entry(row: MessageRow) -> HistoryEntry {
    let kind = MessageKind::parse(&row.kind).unwrap_or_else(|| {
        warn!("Unknown kind '{}' on message {}", row.kind, row.id);
        MessageKind::Text
    });

    HistoryEntry {
        username: row.username,
        body: row.body,
        kind,
        timestamp: parse_timestamp(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message {}", row.created_at, row.id);
            DateTime::default()
        }),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by hand in SQLite carry "YYYY-MM-DD HH:MM:SS" without a zone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .ok()
}
