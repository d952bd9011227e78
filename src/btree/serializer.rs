//! Block-granular file serializer: one file per store.
//!
//! The file layout is a magic/version header followed by a sequence of
//! block frames (`id: u32`, size-prefixed payload). Writes go to a
//! temporary sibling file which is fsynced and renamed over the original,
//! so a crash leaves either the old image or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::btree::{BtreeError, BtreeResult};
use crate::protocol::buffer::{read_bytes, read_u32, write_bytes, write_u32};

const MAGIC: &[u8; 8] = b"MEMSHARD";
const VERSION: u32 = 1;

/// The block I/O layer under the cache.
pub struct Serializer {
    path: PathBuf,
}

impl Serializer {
    /// Initializes a fresh, empty store file. Fails if one already exists.
    pub fn create(path: &Path) -> BtreeResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        drop(file);
        let serializer = Serializer {
            path: path.to_path_buf(),
        };
        serializer.store_blocks(&[])?;
        debug!(path = %path.display(), "created store file");
        Ok(())
    }

    /// Opens an existing store file, validating the header.
    pub fn open(path: &Path) -> BtreeResult<Serializer> {
        let serializer = Serializer {
            path: path.to_path_buf(),
        };
        serializer.load_blocks()?;
        Ok(serializer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every block frame in the file.
    pub fn load_blocks(&self) -> BtreeResult<Vec<(u32, Vec<u8>)>> {
        let mut file = File::open(&self.path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut input = raw.as_slice();
        if input.len() < MAGIC.len() || &input[..MAGIC.len()] != MAGIC {
            return Err(BtreeError::Corrupt("bad magic".into()));
        }
        input = &input[MAGIC.len()..];
        let version = read_u32(&mut input)?;
        if version != VERSION {
            return Err(BtreeError::Corrupt(format!(
                "unsupported version {}",
                version
            )));
        }

        let count = read_u32(&mut input)?;
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = read_u32(&mut input)?;
            let payload = read_bytes(&mut input)?;
            blocks.push((id, payload));
        }
        Ok(blocks)
    }

    /// Replaces the file contents with the given block frames.
    pub fn store_blocks(&self, blocks: &[(u32, Vec<u8>)]) -> BtreeResult<()> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        write_u32(&mut out, VERSION);
        write_u32(&mut out, blocks.len() as u32);
        for (id, payload) in blocks {
            write_u32(&mut out, *id);
            write_bytes(&mut out, payload);
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&out)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            blocks = blocks.len(),
            bytes = out.len(),
            "stored block image"
        );
        Ok(())
    }
}
