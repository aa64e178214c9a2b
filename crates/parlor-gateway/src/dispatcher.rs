use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc};
use tracing::{error, trace, warn};
use uuid::Uuid;

use parlor_crypto::{FrameCodec, MAX_FRAME_SIZE};
use parlor_types::Envelope;

pub type SessionId = Uuid;

/// Outbound queue of one connection; its writer task drains it onto the socket.
pub type FrameSender = mpsc::UnboundedSender<Bytes>;

/// A live session as seen by a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub username: String,
    pub tx: FrameSender,
}

/// Membership set of one room, in join order.
#[derive(Debug, Default)]
pub struct Members {
    entries: Vec<(SessionId, Member)>,
    /// Set once the room has been dropped from the index; nobody may join it.
    retired: bool,
}

impl Members {
    /// Add a session, replacing any previous entry for the same id.
    pub fn insert(&mut self, id: SessionId, member: Member) {
        self.entries.retain(|(sid, _)| *sid != id);
        self.entries.push((id, member));
    }

    pub fn remove(&mut self, id: SessionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(sid, _)| *sid != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn usernames(&self) -> Vec<String> {
        self.entries.iter().map(|(_, m)| m.username.clone()).collect()
    }

    /// Queue `frame` for every member except `exclude`. Members whose queue
    /// is closed have lost their connection and are pruned. Returns the
    /// number of members the frame was queued for.
    pub fn send_all(&mut self, frame: &Bytes, exclude: Option<SessionId>) -> usize {
        let mut delivered = 0;
        self.entries.retain(|(sid, member)| {
            if Some(*sid) == exclude {
                return true;
            }
            match member.tx.send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    warn!("Pruning disconnected member {} ({})", member.username, sid);
                    false
                }
            }
        });
        delivered
    }
}

/// One room's live state. The membership lock also serializes the room's
/// message stream: whoever holds it appends and fans out as one step.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: Mutex<Members>,
}

impl Room {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(Members::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().await
    }

    /// Lock two distinct rooms, always in name order so that opposite moves
    /// cannot deadlock. Guards come back as (self, other).
    pub async fn lock_with<'a>(
        &'a self,
        other: &'a Room,
    ) -> (MutexGuard<'a, Members>, MutexGuard<'a, Members>) {
        if self.name < other.name {
            let mine = self.lock().await;
            (mine, other.lock().await)
        } else {
            let theirs = other.lock().await;
            (self.lock().await, theirs)
        }
    }
}

/// In-memory room index and broadcast router.
///
/// Rooms never share a lock: the outer map is only write-locked to add or
/// drop a room, and each room's membership has its own mutex. A room is
/// dropped from the map when its last member leaves and comes back empty
/// on the next lookup.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    codec: FrameCodec,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Dispatcher {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                codec,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get a room's live state, creating an empty one if it is unknown.
    pub async fn room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.inner.rooms.read().await.get(name) {
            return room.clone();
        }

        self.inner
            .rooms
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(name)))
            .clone()
    }

    pub async fn existing_room(&self, name: &str) -> Option<Arc<Room>> {
        self.inner.rooms.read().await.get(name).cloned()
    }

    /// Drop `room` from the index if `members` (its locked membership) is
    /// empty. Later lookups build a fresh room under the same name.
    pub async fn retire_if_empty(&self, room: &Arc<Room>, members: &mut Members) {
        if !members.is_empty() || members.retired {
            return;
        }
        members.retired = true;

        let mut rooms = self.inner.rooms.write().await;
        if rooms.get(room.name()).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room.name());
            trace!("Dropped empty room {}", room.name());
        }
    }

    /// Encode an envelope once for fan-out. Frames over the size limit are
    /// dropped here, since no peer could read them.
    pub fn encode(&self, envelope: &Envelope) -> Option<Bytes> {
        match self.inner.codec.encode(envelope) {
            Ok(frame) if frame.len() > MAX_FRAME_SIZE => {
                warn!(
                    "Dropping {} envelope: {} byte frame exceeds the {} byte limit",
                    envelope.type_name(),
                    frame.len(),
                    MAX_FRAME_SIZE
                );
                None
            }
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.type_name(), e);
                None
            }
        }
    }

    /// Send `envelope` to every member of `members` except `exclude`.
    /// For callers that already hold the room lock.
    pub fn deliver(
        &self,
        members: &mut Members,
        envelope: &Envelope,
        exclude: Option<SessionId>,
    ) -> usize {
        match self.encode(envelope) {
            Some(frame) => members.send_all(&frame, exclude),
            None => 0,
        }
    }

    /// Send `envelope` to every member of `room` except `exclude`.
    pub async fn broadcast(
        &self,
        room: &str,
        envelope: &Envelope,
        exclude: Option<SessionId>,
    ) -> usize {
        let Some(room) = self.existing_room(room).await else {
            return 0;
        };
        let mut members = room.lock().await;
        self.deliver(&mut members, envelope, exclude)
    }

    /// Remove a session from `room` and tell the remaining members with
    /// `notice`, as one step under the room lock. The notice goes out even if
    /// a failed send already pruned the session. Returns whether the session
    /// was still a member.
    pub async fn leave(&self, room: &str, id: SessionId, notice: &Envelope) -> bool {
        let Some(room) = self.existing_room(room).await else {
            return false;
        };
        let mut members = room.lock().await;
        let was_member = members.remove(id);
        self.deliver(&mut members, notice, None);
        self.retire_if_empty(&room, &mut members).await;
        was_member
    }

    /// Usernames currently joined to `room`.
    pub async fn members_of(&self, room: &str) -> Vec<String> {
        match self.existing_room(room).await {
            Some(room) => room.lock().await.usernames(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parlor_crypto::SharedKey;

    fn dispatcher() -> (Dispatcher, FrameCodec) {
        let codec = FrameCodec::new(&SharedKey::from_bytes([9; 32]));
        (Dispatcher::new(codec.clone()), codec)
    }

    fn member(name: &str) -> (Member, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Member {
                username: name.to_string(),
                tx,
            },
            rx,
        )
    }

    fn notice(name: &str) -> Envelope {
        Envelope::UserJoined {
            username: name.into(),
            room: "r".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_sender() {
        let (dispatcher, codec) = dispatcher();
        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        {
            let room = dispatcher.room("r").await;
            let mut members = room.lock().await;
            members.insert(a_id, a);
            members.insert(b_id, b);
        }

        let env = notice("x");
        assert_eq!(dispatcher.broadcast("r", &env, Some(a_id)).await, 1);

        let frame = b_rx.try_recv().unwrap();
        assert_eq!(codec.decode::<Envelope>(&frame).unwrap(), env);
        assert!(b_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_member_is_pruned_without_failing_others() {
        let (dispatcher, _) = dispatcher();
        let (a, mut a_rx) = member("a");
        let (b, b_rx) = member("b");
        let (c, mut c_rx) = member("c");
        {
            let room = dispatcher.room("r").await;
            let mut members = room.lock().await;
            members.insert(Uuid::new_v4(), a);
            members.insert(Uuid::new_v4(), b);
            members.insert(Uuid::new_v4(), c);
        }
        drop(b_rx);

        assert_eq!(dispatcher.broadcast("r", &notice("x"), None).await, 2);
        assert!(a_rx.try_recv().is_ok());
        assert!(c_rx.try_recv().is_ok());
        assert_eq!(dispatcher.members_of("r").await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_is_a_no_op() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.broadcast("nowhere", &notice("x"), None).await, 0);
        assert!(dispatcher.members_of("nowhere").await.is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let (dispatcher, codec) = dispatcher();
        let (a, _a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        let a_id = Uuid::new_v4();
        {
            let room = dispatcher.room("r").await;
            let mut members = room.lock().await;
            members.insert(a_id, a);
            members.insert(Uuid::new_v4(), b);
        }

        let left = Envelope::UserLeft {
            username: "a".into(),
            room: "r".into(),
            timestamp: Utc::now(),
        };
        assert!(dispatcher.leave("r", a_id, &left).await);
        let got: Envelope = codec.decode(&b_rx.try_recv().unwrap()).unwrap();
        assert_eq!(got, left);
        assert_eq!(dispatcher.members_of("r").await, vec!["b"]);

        // Already pruned: still reported, but not as a member
        assert!(!dispatcher.leave("r", a_id, &left).await);
        assert!(b_rx.try_recv().is_ok());
        assert_eq!(dispatcher.members_of("r").await, vec!["b"]);
    }

    #[tokio::test]
    async fn concurrent_room_creation_yields_one_room() {
        let (dispatcher, _) = dispatcher();
        let mut handles = Vec::new();
        for i in 0..32 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let room = dispatcher.room("fresh").await;
                let (m, rx) = member(&format!("u{}", i));
                room.lock().await.insert(Uuid::new_v4(), m);
                rx
            }));
        }
        let mut receivers = Vec::new();
        for h in handles {
            receivers.push(h.await.unwrap());
        }

        let room = dispatcher.room("fresh").await;
        assert_eq!(room.lock().await.len(), 32);
    }

    #[test]
    fn reinserting_a_session_does_not_duplicate_it() {
        let mut members = Members::default();
        let id = Uuid::new_v4();
        let (m1, _rx1) = member("a");
        let (m2, _rx2) = member("a");
        members.insert(id, m1);
        members.insert(id, m2);
        assert_eq!(members.len(), 1);
        assert_eq!(members.usernames(), vec!["a"]);
        assert!(members.remove(id));
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn last_leave_drops_the_room() {
        let (dispatcher, _) = dispatcher();
        let (a, _a_rx) = member("a");
        let a_id = Uuid::new_v4();
        let room = dispatcher.room("scratch").await;
        room.lock().await.insert(a_id, a);

        let left = Envelope::UserLeft {
            username: "a".into(),
            room: "scratch".into(),
            timestamp: Utc::now(),
        };
        assert!(dispatcher.leave("scratch", a_id, &left).await);
        assert!(dispatcher.existing_room("scratch").await.is_none());
        assert!(room.lock().await.is_retired());

        // The name is usable again, as a fresh room
        let again = dispatcher.room("scratch").await;
        assert!(!Arc::ptr_eq(&room, &again));
        assert!(!again.lock().await.is_retired());
    }

    #[tokio::test]
    async fn room_with_members_is_not_dropped() {
        let (dispatcher, _) = dispatcher();
        let room = dispatcher.room("busy").await;
        let (a, _a_rx) = member("a");
        room.lock().await.insert(Uuid::new_v4(), a);

        let mut members = room.lock().await;
        dispatcher.retire_if_empty(&room, &mut members).await;
        assert!(!members.is_retired());
        drop(members);
        assert!(dispatcher.existing_room("busy").await.is_some());
    }

    #[tokio::test]
    async fn opposite_moves_do_not_deadlock() {
        let (dispatcher, _) = dispatcher();
        let one = dispatcher.room("one").await;
        let two = dispatcher.room("two").await;

        let mut tasks = Vec::new();
        for i in 0..64 {
            let (one, two) = (one.clone(), two.clone());
            tasks.push(tokio::spawn(async move {
                let (from, to) = if i % 2 == 0 { (&one, &two) } else { (&two, &one) };
                let (_to, _from) = to.lock_with(from).await;
                tokio::task::yield_now().await;
            }));
        }
        let all = async {
            for t in tasks {
                t.await.unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), all)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn oversized_envelope_is_dropped_not_sent() {
        let (dispatcher, _) = dispatcher();
        let (a, mut a_rx) = member("a");
        dispatcher.room("r").await.lock().await.insert(Uuid::new_v4(), a);

        let huge = Envelope::Message {
            username: "b".into(),
            body: "x".repeat(MAX_FRAME_SIZE),
            kind: parlor_types::MessageKind::File,
            room: "r".into(),
            timestamp: Some(Utc::now()),
        };
        assert!(dispatcher.encode(&huge).is_none());
        assert_eq!(dispatcher.broadcast("r", &huge, None).await, 0);
        assert!(a_rx.try_recv().is_err());

        // The member is still there and still reachable
        assert_eq!(dispatcher.broadcast("r", &notice("x"), None).await, 1);
        assert!(a_rx.try_recv().is_ok());
    }
}
