// src/protocol/codec.rs

use crate::error::ClusterError;
use crate::protocol::message::Frame;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single encoded frame. Protocol frames are small; anything
/// bigger means a corrupted length prefix.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

bitflags! {
    /// Per-frame flags carried in the first payload byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WireFlags: u8 {
        /// A descriptor is attached to this frame.
        const HAS_HANDLE = 0b01;
    }
}

/// A frame as it travels over a byte stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
  pub frame: Frame,
  pub flags: WireFlags,
}

impl WireFrame {
  pub fn new(frame: Frame, has_handle: bool) -> Self {
    let flags = if has_handle { WireFlags::HAS_HANDLE } else { WireFlags::empty() };
    Self { frame, flags }
  }

  pub fn has_handle(&self) -> bool {
    self.flags.contains(WireFlags::HAS_HANDLE)
  }
}

/// Length-delimited JSON framing: `u32 length | flags | json`.
#[derive(Debug)]
pub struct FrameCodec {
  inner: LengthDelimitedCodec,
}

impl FrameCodec {
  pub fn new() -> Self {
    Self {
      inner: LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec(),
    }
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Encoder<WireFrame> for FrameCodec {
  type Error = ClusterError;

  fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let json = serde_json::to_vec(&item.frame)?;
    let mut payload = BytesMut::with_capacity(1 + json.len());
    payload.put_u8(item.flags.bits());
    payload.extend_from_slice(&json);
    self
      .inner
      .encode(payload.freeze(), dst)
      .map_err(|e| ClusterError::Codec(e.to_string()))
  }
}

impl Decoder for FrameCodec {
  type Item = WireFrame;
  type Error = ClusterError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    let mut payload = match self.inner.decode(src) {
      Ok(Some(payload)) => payload,
      Ok(None) => return Ok(None),
      Err(e) => return Err(ClusterError::Codec(e.to_string())),
    };
    if payload.is_empty() {
      return Err(ClusterError::Codec("empty frame".into()));
    }
    let flags = WireFlags::from_bits_truncate(payload.get_u8());
    let frame: Frame = serde_json::from_slice(&payload)?;
    tracing::trace!(seq = frame.seq, act = ?frame.act, ?flags, "Decoded frame");
    Ok(Some(WireFrame { frame, flags }))
  }
}
