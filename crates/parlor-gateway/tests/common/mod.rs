#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use argon2::{Algorithm, Argon2, Params, Version};
use tokio::io::DuplexStream;
use tokio::sync::watch;

use parlor_crypto::SharedKey;
use parlor_db::Database;
use parlor_gateway::Gateway;
use parlor_gateway::client::Client;
use parlor_gateway::connection::serve;
use parlor_types::Envelope;

/// Generous: frames of several MiB go through AES-GCM unoptimized in test builds.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(60);

pub fn test_key() -> SharedKey {
    SharedKey::from_bytes([7; 32])
}

/// Gateway over an in-memory store with cheap Argon2 parameters.
pub fn gateway() -> Gateway {
    gateway_over(Arc::new(Database::open_in_memory().unwrap()))
}

pub fn gateway_over(db: Arc<Database>) -> Gateway {
    let params = Params::new(8, 1, 1, None).unwrap();
    Gateway::new(db, &test_key())
        .with_password_hasher(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// A gateway plus the shutdown signal its sessions watch.
pub struct Harness {
    pub gateway: Gateway,
    pub db: Arc<Database>,
    stop_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let db = Arc::new(Database::open_in_memory().unwrap());
        Self {
            gateway: gateway_over(db.clone()),
            db,
            stop_tx,
        }
    }

    /// Make every later statement on `table` fail, as a lost store would.
    pub fn drop_table(&self, table: &str) {
        self.db
            .with_conn(|conn| Ok(conn.execute_batch(&format!("DROP TABLE {}", table))?))
            .unwrap();
    }

    /// Raw server side of a fresh in-memory connection.
    pub fn accept(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            server,
            "duplex".into(),
            self.gateway.clone(),
            self.stop_tx.subscribe(),
        ));
        client
    }

    pub fn connect(&self) -> Client<DuplexStream> {
        Client::new(self.accept(), &test_key())
    }

    /// Connect, register and log in as `name` (password is the name reversed).
    pub async fn logged_in(&self, name: &str) -> Client<DuplexStream> {
        let mut client = self.connect();
        let password: String = name.chars().rev().collect();
        client.register(name, &password, None).await.unwrap().unwrap();
        client.login(name, &password).await.unwrap().unwrap();
        client
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Receive until `pick` matches, failing the test after `RECV_TIMEOUT`.
pub async fn expect<S, T>(client: &mut Client<S>, pick: impl FnMut(Envelope) -> Option<T>) -> T
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    tokio::time::timeout(RECV_TIMEOUT, client.recv_until(pick))
        .await
        .expect("timed out waiting for envelope")
        .unwrap()
}

/// The very next envelope, whatever it is.
pub async fn next<S>(client: &mut Client<S>) -> Envelope
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for envelope")
        .unwrap()
        .expect("connection closed")
}

/// Join `room` and return the `room_joined` reply as (history bodies, users).
pub async fn join<S>(client: &mut Client<S>, room: &str) -> (Vec<String>, Vec<String>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    client.join(room).await.unwrap();
    expect(client, |env| match env {
        Envelope::RoomJoined { history, users, .. } => {
            Some((history.into_iter().map(|h| h.body).collect(), users))
        }
        _ => None,
    })
    .await
}

/// Round-trip a `get_rooms` so every earlier request of this client has
/// been fully processed by the server.
pub async fn sync<S>(client: &mut Client<S>) -> Vec<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    client.send(&Envelope::GetRooms).await.unwrap();
    expect(client, |env| match env {
        Envelope::RoomsList { rooms } => Some(rooms),
        _ => None,
    })
    .await
}
