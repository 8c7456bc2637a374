//! Varint32 length-delimited framing with postcard payloads.
//!
//! Each frame is `LEB128(len) ++ payload[len]`, where the length prefix is an
//! unsigned 32-bit value encoded in at most [`MAX_VARINT_LEN`] bytes. The
//! decoder buffers partial frames and only yields complete messages.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::Message;

/// Maximum number of bytes in a varint32 length prefix.
pub const MAX_VARINT_LEN: usize = 5;

/// Default upper bound for a single frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors raised while framing or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	/// The length prefix does not encode a valid 32-bit varint.
	#[error("malformed frame length prefix")]
	MalformedLength,
	/// The announced frame exceeds the configured limit.
	#[error("frame of {len} bytes exceeds limit of {max} bytes")]
	FrameTooLarge {
		/// Announced payload length.
		len: usize,
		/// Configured limit.
		max: usize,
	},
	/// The stream ended in the middle of a frame.
	#[error("stream ended inside a frame ({remaining} bytes buffered)")]
	Truncated {
		/// Bytes left in the buffer at end of stream.
		remaining: usize,
	},
	/// The payload could not be (de)serialized.
	#[error("payload codec error: {0}")]
	Payload(#[from] postcard::Error),
	/// Underlying transport error.
	#[error("{0}")]
	Io(#[from] std::io::Error),
}

/// Outcome of reading a varint prefix from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Varint {
	/// Decoded value and the number of prefix bytes consumed.
	Complete {
		/// Decoded length.
		value: u32,
		/// Prefix bytes consumed.
		len: usize,
	},
	/// More bytes are needed.
	Incomplete,
}

/// Decodes a LEB128 varint32 from the start of `buf` without consuming it.
///
/// # Errors
///
/// Returns [`CodecError::MalformedLength`] when the prefix runs past
/// [`MAX_VARINT_LEN`] bytes or overflows 32 bits.
pub fn decode_varint32(buf: &[u8]) -> Result<Varint, CodecError> {
	let mut value: u64 = 0;
	for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
		value |= u64::from(byte & 0x7f) << (7 * i);
		if byte & 0x80 == 0 {
			let value = u32::try_from(value).map_err(|_| CodecError::MalformedLength)?;
			return Ok(Varint::Complete { value, len: i + 1 });
		}
	}
	if buf.len() >= MAX_VARINT_LEN {
		return Err(CodecError::MalformedLength);
	}
	Ok(Varint::Incomplete)
}

/// Appends `value` as a LEB128 varint.
pub fn encode_varint32(mut value: u32, dst: &mut BytesMut) {
	loop {
		let byte = (value & 0x7f) as u8;
		value >>= 7;
		if value == 0 {
			dst.put_u8(byte);
			return;
		}
		dst.put_u8(byte | 0x80);
	}
}

/// Frame codec for [`Message`]s.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
	max_frame_len: usize,
}

impl Default for MessageCodec {
	fn default() -> Self {
		Self::new()
	}
}

impl MessageCodec {
	/// Creates a codec with [`DEFAULT_MAX_FRAME_LEN`].
	#[must_use]
	pub const fn new() -> Self {
		Self {
			max_frame_len: DEFAULT_MAX_FRAME_LEN,
		}
	}

	/// Creates a codec with a custom frame size limit.
	#[must_use]
	pub const fn with_max_frame_len(max_frame_len: usize) -> Self {
		Self { max_frame_len }
	}
}

impl Decoder for MessageCodec {
	type Item = Message;
	type Error = CodecError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
		let (len, prefix) = match decode_varint32(src)? {
			Varint::Complete { value, len } => (value as usize, len),
			Varint::Incomplete => return Ok(None),
		};
		if len > self.max_frame_len {
			return Err(CodecError::FrameTooLarge {
				len,
				max: self.max_frame_len,
			});
		}

		let frame_len = prefix + len;
		if src.len() < frame_len {
			src.reserve(frame_len - src.len());
			return Ok(None);
		}

		src.advance(prefix);
		let payload = src.split_to(len);
		let msg = postcard::from_bytes(&payload)?;
		Ok(Some(msg))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
		match self.decode(src)? {
			Some(msg) => Ok(Some(msg)),
			None if src.is_empty() => Ok(None),
			None => Err(CodecError::Truncated { remaining: src.len() }),
		}
	}
}

impl Encoder<Message> for MessageCodec {
	type Error = CodecError;

	fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
		let payload = postcard::to_allocvec(&msg)?;
		if payload.len() > self.max_frame_len {
			return Err(CodecError::FrameTooLarge {
				len: payload.len(),
				max: self.max_frame_len,
			});
		}
		let len = u32::try_from(payload.len()).map_err(|_| CodecError::MalformedLength)?;
		dst.reserve(MAX_VARINT_LEN + payload.len());
		encode_varint32(len, dst);
		dst.extend_from_slice(&payload);
		Ok(())
	}
}
