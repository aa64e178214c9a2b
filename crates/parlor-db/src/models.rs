//! Database row types for the tables read back in full.
//! Timestamps are RFC 3339 strings as written by the server.

pub struct UserRow {
    pub username: String,
    pub password_digest: String,
    pub email: Option<String>,
}

pub struct MessageRow {
    pub id: i64,
    pub room: String,
    pub username: String,
    pub body: String,
    pub kind: String,
    pub created_at: String,
}
