// src/protocol/mod.rs

//! Worker <-> primary wire protocol: typed messages and stream framing.

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, WireFlags, WireFrame};
pub use message::{
  AddressType, Frame, HandleKey, PrimaryMessage, ReplyPayload, ServerQuery, SockName, WorkerMessage,
  DEFAULT_PROTOCOL_TAG,
};
