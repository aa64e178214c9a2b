use rusqlite::{Connection, OptionalExtension};

use crate::Database;
use crate::error::{StoreError, is_constraint_violation};
use crate::models::{MessageRow, UserRow};

impl Database {
    // -- Users --

    /// Insert a user. Fails with `DuplicateUsername` if the name is taken.
    pub fn create_user(
        &self,
        username: &str,
        password_digest: &str,
        email: Option<&str>,
        created_at: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_digest, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, password_digest, email, created_at],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::DuplicateUsername
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    // -- Rooms --

    /// Insert a room. Fails with `DuplicateRoom` if the name is taken.
    pub fn create_room(&self, name: &str, created_by: &str, created_at: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (name, created_by, created_at) VALUES (?1, ?2, ?3)",
                (name, created_by, created_at),
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::DuplicateRoom
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
    }

    /// All room names in creation order.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM rooms ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    // -- Messages --

    /// Append a message, returning its row id.
    pub fn insert_message(
        &self,
        room: &str,
        username: &str,
        body: &str,
        kind: &str,
        created_at: &str,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (room, username, body, kind, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![room, username, body, kind, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The most recent `limit` messages of a room, oldest first.
    pub fn recent_messages(&self, room: &str, limit: u32) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| query_recent_messages(conn, room, limit))
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT username, password_digest, email FROM users WHERE username = ?1",
    )?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                username: row.get(0)?,
                password_digest: row.get(1)?,
                email: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_recent_messages(conn: &Connection, room: &str, limit: u32) -> Result<Vec<MessageRow>, StoreError> {
    // Newest `limit` by append order, then flipped back to chronological
    let mut stmt = conn.prepare(
        "SELECT id, room, username, body, kind, created_at
         FROM messages
         WHERE room = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;

    let mut rows = stmt
        .query_map(rusqlite::params![room, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room: row.get(1)?,
                username: row.get(2)?,
                body: row.get(3)?,
                kind: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.reverse();
    Ok(rows)
}
