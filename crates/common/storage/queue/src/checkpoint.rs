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

//! Durable record of the write, read and acknowledgment positions.
//!
//! ## Binary Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ magic: [u8; 4]  │ "TCKP"                               │
//! │ version: u32    │ Format version, currently 1          │
//! ├─────────────────┴──────────────────────────────────────┤
//! │ write_pos  (segment u64, offset u64, sequence u64)     │
//! │ read_pos   (segment u64, offset u64, sequence u64)     │
//! │ ack_pos    (segment u64, offset u64, sequence u64)     │
//! ├────────────────────────────────────────────────────────┤
//! │ checksum: u32   │ CRC32 of everything above            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The file is replaced atomically: the new record goes to a scratch file
//! which is fsynced and renamed over the old one, then the directory is
//! fsynced. A reader therefore sees either the old or the new record.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
};

use bytes::{Buf, BufMut, BytesMut};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    Result,
    crc::checksum,
    error::{CorruptStateSnafu, IoSnafu},
    path::{CHECKPOINT_FILE_NAME, CHECKPOINT_TMP_FILE_NAME, sync_dir},
    position::Position,
};

/// Magic bytes identifying a checkpoint file: "TCKP".
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"TCKP";

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const POSITION_SIZE: usize = 24;

/// Encoded size of a checkpoint.
pub const CHECKPOINT_SIZE: usize = 4 + 4 + 3 * POSITION_SIZE + 4;

/// The three persisted positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Where the next frame will be appended.
    pub write_pos: Position,
    /// Where the next delivery will start.
    pub read_pos:  Position,
    /// Everything before this has been acknowledged.
    pub ack_pos:   Position,
}

impl Checkpoint {
    /// `ack_pos <= read_pos <= write_pos`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.ack_pos <= self.read_pos && self.read_pos <= self.write_pos
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(CHECKPOINT_SIZE);
        buf.put_slice(&CHECKPOINT_MAGIC);
        buf.put_u32_le(CHECKPOINT_VERSION);
        for pos in [self.write_pos, self.read_pos, self.ack_pos] {
            buf.put_u64_le(pos.segment);
            buf.put_u64_le(pos.offset);
            buf.put_u64_le(pos.sequence);
        }
        let crc = checksum(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decodes and validates a checkpoint. Every failure is reported as
    /// corrupt state.
    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == CHECKPOINT_SIZE,
            CorruptStateSnafu {
                reason: format!(
                    "checkpoint is {} bytes, expected {CHECKPOINT_SIZE}",
                    data.len()
                ),
            }
        );

        let (body, mut crc) = data.split_at(CHECKPOINT_SIZE - 4);
        let stored = crc.get_u32_le();
        let computed = checksum(body);
        ensure!(
            stored == computed,
            CorruptStateSnafu {
                reason: format!(
                    "checkpoint checksum mismatch: stored={stored:#x}, computed={computed:#x}"
                ),
            }
        );

        let mut body = body;
        ensure!(
            body[..4] == CHECKPOINT_MAGIC,
            CorruptStateSnafu {
                reason: format!("invalid checkpoint magic: {:?}", &body[..4]),
            }
        );
        body.advance(4);

        let version = body.get_u32_le();
        ensure!(
            version == CHECKPOINT_VERSION,
            CorruptStateSnafu {
                reason: format!("unsupported checkpoint version {version}"),
            }
        );

        let mut read_position = || {
            let segment = body.get_u64_le();
            let offset = body.get_u64_le();
            let sequence = body.get_u64_le();
            Position::new(segment, offset, sequence)
        };
        let write_pos = read_position();
        let read_pos = read_position();
        let ack_pos = read_position();

        Ok(Self {
            write_pos,
            read_pos,
            ack_pos,
        })
    }
}

/// The checkpoint file of one queue directory.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointFile {
    dir: PathBuf,
}

impl CheckpointFile {
    pub(crate) fn new<P: Into<PathBuf>>(dir: P) -> Self { Self { dir: dir.into() } }

    pub(crate) fn path(&self) -> PathBuf { self.dir.join(CHECKPOINT_FILE_NAME) }

    /// Reads the last persisted checkpoint. `None` if none was ever written.
    pub(crate) fn load(&self) -> Result<Option<Checkpoint>> {
        let path = self.path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(IoSnafu {
                    context: format!("reading checkpoint {}", path.display()),
                });
            }
        };
        Checkpoint::decode(&data).map(Some)
    }

    /// Atomically replaces the checkpoint.
    pub(crate) fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.dir.join(CHECKPOINT_TMP_FILE_NAME);
        let path = self.path();
        let context = || IoSnafu {
            context: format!("persisting checkpoint {}", path.display()),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|_| context())?;
        file.write_all(&checkpoint.encode())
            .with_context(|_| context())?;
        file.sync_all().with_context(|_| context())?;
        drop(file);

        std::fs::rename(&tmp, &path).with_context(|_| context())?;
        sync_dir(&self.dir)?;

        debug!(
            write = %checkpoint.write_pos,
            read = %checkpoint.read_pos,
            ack = %checkpoint.ack_pos,
            "Checkpoint persisted"
        );
        Ok(())
    }
}
