//! Parlor transport codec.
//!
//! Every envelope is serialized to JSON, sealed with AES-256-GCM under a key
//! shared out-of-band between server and clients, base64-encoded, and sent
//! as one length-prefixed frame.

pub mod codec;
pub mod frame;
pub mod keys;

pub use codec::{CodecError, FrameCodec, sealed_len};
pub use frame::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use keys::{KeyError, SharedKey};
