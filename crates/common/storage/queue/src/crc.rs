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

//! CRC32 checksums for frames and checkpoints.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. A frame checksum covers the
//! length and sequence fields as well as the payload, so a torn header is
//! caught the same way as a damaged payload.

use crc32fast::Hasher;

/// Checksum of one frame: length, sequence, then payload.
#[inline]
pub(crate) fn calculate_frame_crc(length: u32, sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[inline]
pub(crate) fn verify_frame_crc(length: u32, sequence: u64, payload: &[u8], expected: u32) -> bool {
    calculate_frame_crc(length, sequence, payload) == expected
}

/// Plain checksum over a byte slice.
#[inline]
pub(crate) fn checksum(data: &[u8]) -> u32 { crc32fast::hash(data) }
