use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parlor_crypto::{FrameError, MAX_FRAME_SIZE, read_frame, sealed_len, write_frame};
use parlor_db::StoreError;
use parlor_types::{AuthAction, Envelope, HistoryEntry, MessageKind};

use crate::Gateway;
use crate::dispatcher::{FrameSender, Member, SessionId};

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SessionState {
    Unauthenticated,
    Authenticated {
        username: String,
        room: Option<String>,
    },
    Closed,
}

/// Per-connection protocol state. Frames are handled one at a time, so a
/// request's effects are complete before the next one is looked at.
struct Session {
    id: SessionId,
    peer: String,
    gateway: Gateway,
    tx: FrameSender,
    state: SessionState,
}

/// Tune an accepted socket and serve it until it closes or shutdown is
/// signalled.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Gateway,
    shutdown: watch::Receiver<bool>,
) {
    // Keepalive lets the OS notice peers that vanished without a FIN
    {
        let sock_ref = socket2::SockRef::from(&stream);
        if let Err(e) = sock_ref
            .set_nodelay(true)
            .and_then(|_| sock_ref.set_keepalive(true))
        {
            warn!("{}: failed to set socket options: {}", addr, e);
        }
    }

    serve(stream, addr.to_string(), gateway, shutdown).await;
}

/// Run the protocol over any byte stream.
pub async fn serve<S>(stream: S, peer: String, gateway: Gateway, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    // Single writer per connection: direct replies and room broadcasts share
    // this queue, so frames reach the socket whole and in queue order.
    let writer_peer = peer.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("{}: write failed: {}", writer_peer, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });
    let mut writer_done = false;

    let mut session = Session::new(gateway, tx, peer.clone());
    info!("{} connected (session {})", peer, session.id);

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => session.handle_frame(&frame).await,
                    Ok(None) => break,
                    Err(FrameError::TooLarge(len)) => {
                        warn!("{}: frame of {} bytes exceeds limit, closing", peer, len);
                        break;
                    }
                    Err(FrameError::Io(e)) => {
                        debug!("{}: read failed: {}", peer, e);
                        break;
                    }
                },
                _ = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    break;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    session.close().await;
    drop(session);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
        warn!("{}: writer did not drain in time, aborting", peer);
        writer_task.abort();
    }

    info!("{} disconnected", peer);
}

impl Session {
    fn new(gateway: Gateway, tx: FrameSender, peer: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            gateway,
            tx,
            state: SessionState::Unauthenticated,
        }
    }

    fn username(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { username, .. } => Some(username),
            _ => None,
        }
    }

    fn set_room(&mut self, name: String) {
        if let SessionState::Authenticated { room, .. } = &mut self.state {
            *room = Some(name);
        }
    }

    fn current_room(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { room, .. } => room.as_deref(),
            _ => None,
        }
    }

    /// Queue a reply for this connection only.
    fn reply(&self, envelope: &Envelope) {
        if let Some(frame) = self.gateway.dispatcher.encode(envelope) {
            // A closed queue means the writer is gone; the read loop ends soon.
            let _ = self.tx.send(frame);
        }
    }

    fn reply_error(&self, request: &str, error: &str) {
        self.reply(&Envelope::Error {
            request: request.to_string(),
            error: error.to_string(),
        });
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        match self.gateway.codec.decode::<Envelope>(frame) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => warn!("{}: dropping undecodable frame: {}", self.peer, e),
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Auth {
                action: AuthAction::Register,
                username,
                password,
                email,
            } => self.register(&username, &password, email.as_deref()).await,

            Envelope::Auth {
                action: AuthAction::Login,
                username,
                password,
                ..
            } => self.login(username, &password).await,

            other => {
                let Some(username) = self.username().map(str::to_owned) else {
                    debug!("{}: ignoring {} before login", self.peer, other.type_name());
                    return;
                };

                match other {
                    Envelope::GetRooms => self.list_rooms().await,
                    Envelope::CreateRoom { room_name } => self.create_room(&username, room_name).await,
                    Envelope::JoinRoom { room } => self.join_room(&username, room).await,
                    Envelope::Message { body, kind, .. } => self.send_message(&username, body, kind).await,
                    other => debug!(
                        "{} ({}): ignoring server-side envelope {}",
                        username,
                        self.peer,
                        other.type_name()
                    ),
                }
            }
        }
    }

    async fn register(&self, username: &str, password: &str, email: Option<&str>) {
        if username.is_empty() {
            self.reply(&Envelope::RegisterResult {
                success: false,
                error: Some("Username must not be empty".into()),
            });
            return;
        }

        let result = self.gateway.credentials.register(username, password, email).await;
        let response = match result {
            Ok(()) => Envelope::RegisterResult {
                success: true,
                error: None,
            },
            Err(StoreError::DuplicateUsername) => Envelope::RegisterResult {
                success: false,
                error: Some("Username already exists".into()),
            },
            Err(e) => {
                error!("{}: registration of {} failed: {}", self.peer, username, e);
                Envelope::RegisterResult {
                    success: false,
                    error: Some("Registration is unavailable, try again later".into()),
                }
            }
        };
        self.reply(&response);
    }

    async fn login(&mut self, username: String, password: &str) {
        if self.username().is_some() {
            self.reply(&Envelope::AuthResult {
                success: false,
                username: None,
                error: Some("Already logged in".into()),
            });
            return;
        }

        match self.gateway.credentials.authenticate(&username, password).await {
            Ok(true) => {
                info!("{} logged in from {}", username, self.peer);
                self.reply(&Envelope::AuthResult {
                    success: true,
                    username: Some(username.clone()),
                    error: None,
                });
                self.state = SessionState::Authenticated {
                    username,
                    room: None,
                };
            }
            Ok(false) => {
                info!("{}: failed login for {}", self.peer, username);
                self.reply(&Envelope::AuthResult {
                    success: false,
                    username: None,
                    error: Some("Invalid credentials".into()),
                });
            }
            Err(e) => {
                error!("{}: login lookup for {} failed: {}", self.peer, username, e);
                self.reply(&Envelope::AuthResult {
                    success: false,
                    username: None,
                    error: Some("Login is unavailable, try again later".into()),
                });
            }
        }
    }

    async fn list_rooms(&self) {
        match self.gateway.rooms.list_rooms().await {
            Ok(rooms) => self.reply(&Envelope::RoomsList { rooms }),
            Err(e) => {
                error!("{}: listing rooms failed: {}", self.peer, e);
                self.reply_error("get_rooms", "Room list is unavailable");
            }
        }
    }

    async fn create_room(&self, username: &str, room_name: String) {
        if room_name.is_empty() {
            self.reply(&Envelope::RoomCreated {
                success: false,
                room: None,
                error: Some("Room name must not be empty".into()),
            });
            return;
        }

        let response = match self.gateway.rooms.create_room(&room_name, username).await {
            Ok(()) => Envelope::RoomCreated {
                success: true,
                room: Some(room_name),
                error: None,
            },
            Err(StoreError::DuplicateRoom) => Envelope::RoomCreated {
                success: false,
                room: None,
                error: Some("Room already exists".into()),
            },
            Err(e) => {
                error!("{}: creating room {} failed: {}", self.peer, room_name, e);
                Envelope::RoomCreated {
                    success: false,
                    room: None,
                    error: Some("Room creation is unavailable".into()),
                }
            }
        };
        self.reply(&response);
    }

    /// Move this session into `room_name`, creating the live room if needed.
    /// History loads first; only then does the session leave its old room
    /// and enter the new one, with both rooms locked.
    async fn join_room(&mut self, username: &str, room_name: String) {
        if room_name.is_empty() {
            self.reply_error("join_room", "Room name must not be empty");
            return;
        }

        let dispatcher = self.gateway.dispatcher.clone();
        let rejoin = self.current_room() == Some(room_name.as_str());
        let previous_name = self.current_room().filter(|_| !rejoin).map(str::to_owned);

        loop {
            let target = dispatcher.room(&room_name).await;
            let previous = match &previous_name {
                Some(name) => dispatcher.existing_room(name).await,
                None => None,
            };
            let (mut members, mut old_members) = match &previous {
                Some(prev) => {
                    let (members, old) = target.lock_with(prev).await;
                    (members, Some(old))
                }
                None => (target.lock().await, None),
            };

            // Emptied and dropped between lookup and lock
            if members.is_retired() {
                continue;
            }

            // Appends to this room wait on the lock, so the history read here
            // and the live stream that follows neither overlap nor leave a gap.
            let mut history = match self.gateway.log.history(&room_name, self.gateway.history_limit).await {
                Ok(history) => history,
                Err(e) => {
                    error!("{}: loading history of {} failed: {}", self.peer, room_name, e);
                    self.reply_error("join_room", "Room history is unavailable");
                    dispatcher.retire_if_empty(&target, &mut members).await;
                    return;
                }
            };

            if let (Some(prev), Some(old)) = (&previous, old_members.as_mut()) {
                old.remove(self.id);
                let left = Envelope::UserLeft {
                    username: username.to_string(),
                    room: prev.name().to_string(),
                    timestamp: Utc::now(),
                };
                dispatcher.deliver(old, &left, None);
                dispatcher.retire_if_empty(prev, old).await;
                info!("{} left {}", username, prev.name());
            }
            drop(old_members);

            members.insert(
                self.id,
                Member {
                    username: username.to_string(),
                    tx: self.tx.clone(),
                },
            );

            let users = members.usernames();
            let dropped = fit_history(&room_name, &users, &mut history);
            if dropped > 0 {
                warn!(
                    "{}: {} oldest history entries of {} left out to fit one frame",
                    username, dropped, room_name
                );
            }
            self.reply(&Envelope::RoomJoined {
                room: room_name.clone(),
                history,
                users,
            });

            if !rejoin {
                let joined = Envelope::UserJoined {
                    username: username.to_string(),
                    room: room_name.clone(),
                    timestamp: Utc::now(),
                };
                dispatcher.deliver(&mut members, &joined, Some(self.id));
            }
            break;
        }

        info!("{} joined {}", username, room_name);
        self.set_room(room_name);
    }

    async fn leave_room(&self, username: &str, room_name: &str) {
        let left = Envelope::UserLeft {
            username: username.to_string(),
            room: room_name.to_string(),
            timestamp: Utc::now(),
        };
        self.gateway.dispatcher.leave(room_name, self.id, &left).await;
        info!("{} left {}", username, room_name);
    }

    /// Persist then relay a message. Nothing is relayed unless it was stored,
    /// and nothing is stored that could not be relayed.
    async fn send_message(&self, username: &str, body: String, kind: MessageKind) {
        let Some(room_name) = self.current_room() else {
            debug!("{}: message outside any room ignored", username);
            return;
        };

        let dispatcher = &self.gateway.dispatcher;
        let room = dispatcher.room(room_name).await;
        let mut members = room.lock().await;

        // Stamped and appended under the room lock: history order and
        // delivery order are the same.
        let timestamp = Utc::now();
        let message = Envelope::Message {
            username: username.to_string(),
            body: body.clone(),
            kind,
            room: room_name.to_string(),
            timestamp: Some(timestamp),
        };
        let Some(frame) = dispatcher.encode(&message) else {
            drop(members);
            self.reply_error("message", "Message is too large to relay");
            return;
        };

        if let Err(e) = self
            .gateway
            .log
            .append(room_name, username, body, kind, timestamp)
            .await
        {
            drop(members);
            error!("{}: storing message in {} failed: {}", username, room_name, e);
            self.reply_error("message", "Message could not be stored");
            return;
        }

        let delivered = members.send_all(&frame, Some(self.id));
        debug!(
            "{} -> {} ({}, {} recipients)",
            username,
            room_name,
            kind.as_str(),
            delivered
        );
    }

    /// Leave the current room, if any, and stop accepting requests.
    async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Authenticated {
            username,
            room: Some(room),
        } = state
        {
            self.leave_room(&username, &room).await;
        }
    }
}

/// Drop the oldest entries until a `room_joined` carrying the rest fits in
/// one frame. Returns how many were dropped.
fn fit_history(room: &str, users: &[String], history: &mut Vec<HistoryEntry>) -> usize {
    let skeleton = Envelope::RoomJoined {
        room: room.to_string(),
        history: Vec::new(),
        users: users.to_vec(),
    };
    let Ok(base) = serde_json::to_vec(&skeleton).map(|json| json.len()) else {
        return 0;
    };
    let sizes: Vec<usize> = history
        .iter()
        .map(|entry| serde_json::to_vec(entry).map_or(0, |json| json.len()))
        .collect();

    // Entries sit comma-separated inside the skeleton's `[]`
    let mut total = base + sizes.iter().sum::<usize>() + sizes.len().saturating_sub(1);
    let mut dropped = 0;
    while dropped < sizes.len() && sealed_len(total) > MAX_FRAME_SIZE {
        let comma = usize::from(dropped + 1 < sizes.len());
        total -= sizes[dropped] + comma;
        dropped += 1;
    }

    history.drain(..dropped);
    dropped
}
