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

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use snafu::ResultExt;

use crate::{Result, error::IoSnafu, position::SegmentId};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Name of the durable checkpoint.
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.dat";

/// Scratch file renamed over the checkpoint.
pub const CHECKPOINT_TMP_FILE_NAME: &str = "checkpoint.tmp";

/// Generates a segment file name: `<id>.seg`.
pub fn segment_file_name(id: SegmentId) -> String { format!("{id}.{SEGMENT_EXTENSION}") }

/// Returns the full path of a segment: `base/<id>.seg`.
pub fn segment_path<P: AsRef<Path>>(base: P, id: SegmentId) -> PathBuf {
    base.as_ref().join(segment_file_name(id))
}

/// Parses the id out of a segment path. `None` for anything that is not a
/// `<decimal>.seg` file.
pub fn parse_segment_id(path: &Path) -> Option<SegmentId> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Lists segment ids in `base`, ascending.
pub fn scan_segment_ids<P: AsRef<Path>>(base: P) -> Result<Vec<SegmentId>> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    let entries = std::fs::read_dir(base).context(IoSnafu {
        context: format!("listing {}", base.display()),
    })?;
    for entry in entries {
        let entry = entry.context(IoSnafu {
            context: format!("listing {}", base.display()),
        })?;
        let path = entry.path();
        if path.is_file()
            && let Some(id) = parse_segment_id(&path)
        {
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

/// Makes a directory entry change (create, rename, unlink) durable.
#[cfg(unix)]
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    File::open(dir)
        .and_then(|f| f.sync_all())
        .context(IoSnafu {
            context: format!("syncing directory {}", dir.display()),
        })
}

#[cfg(not(unix))]
pub fn sync_dir<P: AsRef<Path>>(_dir: P) -> Result<()> { Ok(()) }
