// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Frame types and on-disk frame format.
//!
//! - [`Entry`]: the consumer-facing view of a frame, a sequence number plus
//!   its payload
//! - `FrameHeader`: the fixed-size prefix decoded while reading a segment
//!
//! ## On-Disk Frame Format
//!
//! Frames are stored contiguously in segment files:
//!
//! ```text
//! ┌───────────────┬────────────────┬──────────────────────┬───────────────┐
//! │  Length (4B)  │ Sequence (8B)  │  Payload (variable)  │  CRC32 (4B)   │
//! │ little-endian │ little-endian  │  raw bytes           │ little-endian │
//! └───────────────┴────────────────┴──────────────────────┴───────────────┘
//! ```
//!
//! - **Length**: payload size in bytes
//! - **Sequence**: queue-wide sequence number, strictly increasing
//! - **CRC32**: checksum over length, sequence and payload
//!
//! The length prefix allows sequential scanning; the checksum catches torn
//! writes left behind by an unclean shutdown.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::calculate_frame_crc;

/// A frame handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Sequence number assigned by the writer. Unique for the lifetime of the
    /// queue directory and never reused.
    pub sequence: u64,

    /// The opaque event payload.
    pub payload: Bytes,
}

/// Size of the length prefix.
pub(crate) const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the sequence field.
pub(crate) const FRAME_SEQUENCE_SIZE: usize = 8;

/// Length plus sequence.
pub(crate) const FRAME_HEADER_SIZE: usize = FRAME_LENGTH_SIZE + FRAME_SEQUENCE_SIZE;

/// Size of the trailing CRC32.
pub(crate) const FRAME_CRC_SIZE: usize = 4;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Total on-disk size of a frame with a payload of `payload_len` bytes.
///
/// ```ignore
/// // 4 (length) + 8 (sequence) + 100 (payload) + 4 (crc) = 116
/// assert_eq!(frame_disk_size(100), 116);
/// ```
#[inline]
pub(crate) const fn frame_disk_size(payload_len: usize) -> u64 {
    (FRAME_HEADER_SIZE + payload_len + FRAME_CRC_SIZE) as u64
}

/// Decoded frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub length:   u32,
    pub sequence: u64,
}

impl FrameHeader {
    pub(crate) fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut length = [0u8; FRAME_LENGTH_SIZE];
        let mut sequence = [0u8; FRAME_SEQUENCE_SIZE];
        length.copy_from_slice(&buf[..FRAME_LENGTH_SIZE]);
        sequence.copy_from_slice(&buf[FRAME_LENGTH_SIZE..]);
        Self {
            length:   u32::from_le_bytes(length),
            sequence: u64::from_le_bytes(sequence),
        }
    }

    /// Bytes following the header: payload plus checksum.
    pub(crate) const fn body_size(&self) -> u64 { self.length as u64 + FRAME_CRC_SIZE as u64 }
}

/// Append the encoded frame to `buf`.
///
/// The caller guarantees `payload.len() <= MAX_PAYLOAD_SIZE`.
pub(crate) fn encode_frame(buf: &mut BytesMut, sequence: u64, payload: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    let length = payload.len() as u32;
    let crc = calculate_frame_crc(length, sequence, payload);

    buf.reserve(frame_disk_size(payload.len()) as usize);
    buf.put_u32_le(length);
    buf.put_u64_le(sequence);
    buf.put_slice(payload);
    buf.put_u32_le(crc);
}
