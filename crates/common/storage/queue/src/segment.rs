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

//! Segment files: allocation, appends, sequential reads, deletion.
//!
//! ## Segment File Format
//!
//! ```text
//! ┌────────────────┬────────────────┬──────────────────┬─────────────────────┐
//! │ magic "TSEG"   │ version (4B)   │ segment id (8B)  │ frames ...          │
//! └────────────────┴────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Frames follow the 16-byte header back to back, see [`crate::frame`].
//! Files only ever grow by whole-frame appends from the writer thread; a torn
//! tail is detected by the frame checksum and treated as the end of the
//! segment.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::{Bytes, BytesMut};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    Result,
    crc::verify_frame_crc,
    error::{CorruptFrameSnafu, IoSnafu, QueueError},
    frame::{Entry, FRAME_CRC_SIZE, FRAME_HEADER_SIZE, FrameHeader, encode_frame, frame_disk_size},
    path::{scan_segment_ids, segment_path, sync_dir},
    position::SegmentId,
};

/// Magic bytes identifying a segment file: "TSEG".
pub const SEGMENT_MAGIC: [u8; 4] = *b"TSEG";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header. The first frame starts here.
pub const SEGMENT_HEADER_SIZE: u64 = 16;

fn encode_segment_header(id: SegmentId) -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&id.to_le_bytes());
    header
}

fn validate_segment_header(header: &[u8; SEGMENT_HEADER_SIZE as usize], id: SegmentId) -> Result<()> {
    let mut version = [0u8; 4];
    let mut stored_id = [0u8; 8];
    version.copy_from_slice(&header[4..8]);
    stored_id.copy_from_slice(&header[8..16]);
    let version = u32::from_le_bytes(version);
    let stored_id = u64::from_le_bytes(stored_id);

    let reason = if header[0..4] != SEGMENT_MAGIC {
        format!("invalid segment magic {:?}", &header[0..4])
    } else if version != SEGMENT_VERSION {
        format!("unsupported segment version {version}")
    } else if stored_id != id {
        format!("header names segment {stored_id}")
    } else {
        return Ok(());
    };

    CorruptFrameSnafu {
        segment: id,
        offset: 0u64,
        reason,
    }
    .fail()
}

/// Owner of the segment files in one queue directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Opens the store, creating the directory when missing.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context(IoSnafu {
            context: format!("creating queue directory {}", dir.display()),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn path(&self, id: SegmentId) -> PathBuf { segment_path(&self.dir, id) }

    /// Creates segment `id` and durably writes its header.
    ///
    /// Fails if the file already exists: segment ids are never reused. A file
    /// whose header could not be written is removed again so the id can be
    /// retried.
    pub fn allocate(&self, id: SegmentId) -> Result<SegmentWriter> {
        let path = self.path(id);
        let context = || IoSnafu {
            context: format!("allocating segment {id}"),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|_| context())?;
        let header = file
            .write_all(&encode_segment_header(id))
            .and_then(|()| file.sync_all());
        if let Err(e) = header {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(e).with_context(|_| context());
        }
        sync_dir(&self.dir)?;

        debug!(segment = id, path = ?path, "Allocated segment");

        Ok(SegmentWriter {
            file,
            id,
            size: SEGMENT_HEADER_SIZE,
            frames: 0,
            buf: BytesMut::new(),
        })
    }

    /// Opens segment `id` for forward-only reads starting at `offset`.
    pub fn open_for_read(&self, id: SegmentId, offset: u64) -> Result<SegmentReader> {
        let context = || IoSnafu {
            context: format!("opening segment {id}"),
        };
        let file = File::open(self.path(id)).with_context(|_| context())?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return CorruptFrameSnafu {
                    segment: id,
                    offset: 0u64,
                    reason: "truncated segment header",
                }
                .fail();
            }
            Err(e) => return Err(e).with_context(|_| context()),
        }
        validate_segment_header(&header, id)?;

        let offset = offset.max(SEGMENT_HEADER_SIZE);
        if offset != SEGMENT_HEADER_SIZE {
            reader
                .seek(SeekFrom::Start(offset))
                .with_context(|_| context())?;
        }

        Ok(SegmentReader { reader, id, offset })
    }

    /// Removes segment `id`. Returns `false` when it was already gone.
    pub fn delete(&self, id: SegmentId) -> Result<bool> {
        match std::fs::remove_file(self.path(id)) {
            Ok(()) => {
                debug!(segment = id, "Deleted segment");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(IoSnafu {
                context: format!("deleting segment {id}"),
            }),
        }
    }

    /// Segment ids present on disk, ascending.
    pub fn list_existing(&self) -> Result<Vec<SegmentId>> { scan_segment_ids(&self.dir) }

    /// Size of segment `id` on disk, header included.
    pub fn file_len(&self, id: SegmentId) -> Result<u64> {
        Ok(std::fs::metadata(self.path(id))
            .context(IoSnafu {
                context: format!("inspecting segment {id}"),
            })?
            .len())
    }

    /// Validates the frames of segment `id` from `from` to the end of the
    /// file.
    ///
    /// Corruption does not fail the scan; it ends it and is reported in
    /// [`SegmentScan::corruption`].
    pub fn scan(&self, id: SegmentId, from: u64) -> Result<SegmentScan> {
        let start = from.max(SEGMENT_HEADER_SIZE);
        let mut scan = SegmentScan {
            id,
            start,
            end: start,
            frames: 0,
            first_sequence: None,
            last_sequence: None,
            corruption: None,
        };

        let len = self.file_len(id)?;
        if len < start {
            scan.corruption = Some(format!(
                "offset {start} is past the end of the file ({len} bytes)"
            ));
            return Ok(scan);
        }

        let mut reader = match self.open_for_read(id, start) {
            Ok(reader) => reader,
            Err(QueueError::CorruptFrame { reason, .. }) => {
                scan.corruption = Some(reason);
                return Ok(scan);
            }
            Err(e) => return Err(e),
        };

        loop {
            match reader.read_frame(len) {
                Ok(Some(entry)) => {
                    if scan.last_sequence.is_some_and(|last| entry.sequence <= last) {
                        scan.corruption = Some(format!(
                            "sequence {} does not follow {}",
                            entry.sequence,
                            scan.last_sequence.unwrap_or_default()
                        ));
                        break;
                    }
                    scan.first_sequence.get_or_insert(entry.sequence);
                    scan.last_sequence = Some(entry.sequence);
                    scan.frames += 1;
                    scan.end = reader.offset();
                }
                Ok(None) => break,
                Err(QueueError::CorruptFrame { reason, .. }) => {
                    scan.corruption = Some(reason);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(scan)
    }
}

/// Append handle for the active segment. Owned by the writer thread.
#[derive(Debug)]
pub struct SegmentWriter {
    file:   File,
    id:     SegmentId,
    /// Bytes of valid data, header included.
    size:   u64,
    frames: u64,
    /// Reused encode buffer so each frame goes out in one write.
    buf:    BytesMut,
}

impl SegmentWriter {
    /// Appends one frame and returns the offset it starts at.
    ///
    /// On error the file may hold a partial frame past [`Self::size`]; the
    /// caller must stop appending to this segment.
    pub fn append_frame(&mut self, sequence: u64, payload: &[u8]) -> Result<u64> {
        self.buf.clear();
        encode_frame(&mut self.buf, sequence, payload);

        self.file.write_all(&self.buf).context(IoSnafu {
            context: format!("appending to segment {}", self.id),
        })?;

        let offset = self.size;
        self.size += self.buf.len() as u64;
        self.frames += 1;
        Ok(offset)
    }

    /// fsync the frames written so far.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().context(IoSnafu {
            context: format!("syncing segment {}", self.id),
        })
    }

    pub const fn id(&self) -> SegmentId { self.id }

    pub const fn size(&self) -> u64 { self.size }

    pub const fn frames(&self) -> u64 { self.frames }

    /// Whether appending `payload_len` bytes keeps the segment within
    /// `max_bytes`. An empty segment accepts any frame.
    pub const fn fits(&self, payload_len: usize, max_bytes: u64) -> bool {
        self.frames == 0 || self.size + frame_disk_size(payload_len) <= max_bytes
    }
}

/// Forward-only cursor over one segment. After an error the cursor must be
/// discarded: the underlying file position is undefined.
#[derive(Debug)]
pub struct SegmentReader {
    reader: BufReader<File>,
    id:     SegmentId,
    offset: u64,
}

impl SegmentReader {
    /// Reads the next frame, never looking past `limit`.
    ///
    /// Returns `Ok(None)` once the cursor sits exactly on `limit`.
    pub fn read_frame(&mut self, limit: u64) -> Result<Option<Entry>> {
        let start = self.offset;
        if start >= limit {
            return Ok(None);
        }
        if start + FRAME_HEADER_SIZE as u64 > limit {
            return self.corrupt(start, "truncated frame header");
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.fill(start, &mut header)?;
        let header = FrameHeader::decode(&header);

        let end = start + FRAME_HEADER_SIZE as u64 + header.body_size();
        if end > limit {
            return self.corrupt(
                start,
                format!("frame length {} runs past the end of data", header.length),
            );
        }

        let mut payload = vec![0u8; header.length as usize];
        self.fill(start, &mut payload)?;
        let mut crc = [0u8; FRAME_CRC_SIZE];
        self.fill(start, &mut crc)?;

        if !verify_frame_crc(header.length, header.sequence, &payload, u32::from_le_bytes(crc)) {
            return self.corrupt(start, "checksum mismatch");
        }

        self.offset = end;
        Ok(Some(Entry {
            sequence: header.sequence,
            payload:  Bytes::from(payload),
        }))
    }

    pub const fn id(&self) -> SegmentId { self.id }

    /// Offset of the next frame.
    pub const fn offset(&self) -> u64 { self.offset }

    fn fill(&mut self, frame_start: u64, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.corrupt(frame_start, "file ends inside frame")
            }
            Err(e) => Err(e).context(IoSnafu {
                context: format!("reading segment {}", self.id),
            }),
        }
    }

    fn corrupt<T>(&self, offset: u64, reason: impl Into<String>) -> Result<T> {
        CorruptFrameSnafu {
            segment: self.id,
            offset,
            reason: reason.into(),
        }
        .fail()
    }
}

/// Outcome of [`SegmentStore::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentScan {
    pub id:             SegmentId,
    /// Offset the scan started at.
    pub start:          u64,
    /// End of the last valid frame.
    pub end:            u64,
    pub frames:         u64,
    pub first_sequence: Option<u64>,
    pub last_sequence:  Option<u64>,
    /// Why the scan stopped before the end of the file, if it did.
    pub corruption:     Option<String>,
}

impl SegmentScan {
    /// Bytes of valid frames covered by the scan.
    pub const fn bytes(&self) -> u64 { self.end - self.start }
}

/// Reader-side bookkeeping for one live segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentInfo {
    pub id:              SegmentId,
    /// End of data the reader may consume.
    pub end:             u64,
    /// No frame will be appended any more.
    pub sealed:          bool,
    /// Offset of the first corrupt frame; nothing past it is readable.
    pub unreadable_from: Option<u64>,
}

impl SegmentInfo {
    pub(crate) const fn active(id: SegmentId) -> Self {
        Self {
            id,
            end: SEGMENT_HEADER_SIZE,
            sealed: false,
            unreadable_from: None,
        }
    }

    pub(crate) const fn sealed(id: SegmentId, end: u64) -> Self {
        Self {
            id,
            end,
            sealed: true,
            unreadable_from: None,
        }
    }
}

/// Ordered set of live segments, oldest first.
#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    segments: VecDeque<SegmentInfo>,
}

impl SegmentTable {
    pub(crate) fn push(&mut self, info: SegmentInfo) {
        debug_assert!(self.segments.back().is_none_or(|last| last.id < info.id));
        self.segments.push_back(info);
    }

    pub(crate) fn get(&self, id: SegmentId) -> Option<&SegmentInfo> {
        let idx = self.segments.binary_search_by_key(&id, |s| s.id).ok()?;
        self.segments.get(idx)
    }

    pub(crate) fn get_mut(&mut self, id: SegmentId) -> Option<&mut SegmentInfo> {
        let idx = self.segments.binary_search_by_key(&id, |s| s.id).ok()?;
        self.segments.get_mut(idx)
    }

    pub(crate) fn front(&self) -> Option<&SegmentInfo> { self.segments.front() }

    pub(crate) fn pop_front(&mut self) -> Option<SegmentInfo> { self.segments.pop_front() }

    pub(crate) fn len(&self) -> usize { self.segments.len() }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SegmentInfo> { self.segments.iter() }
}
