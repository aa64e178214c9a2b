//! Wire types shared by the parlor server, codec and clients.

pub mod envelope;

pub use envelope::{AuthAction, Envelope, HistoryEntry, MessageKind};
