//! File-per-area backend.
//!
//! Each area is stored as `{id:08}.area` inside the store directory:
//!
//! ```text
//! [content: size bytes]
//! [crc32 of content page 0: u32 LE]
//! [crc32 of content page 1: u32 LE]
//! ...
//! ```
//!
//! Content is checksummed in pages of [`PAGE_SIZE`] bytes (the last page
//! may be short). Whole-area writes go to a temporary file which is
//! renamed over the area file, so a crash mid-write leaves either the old
//! or the new content. Ranged writes patch the touched pages and their
//! checksums in place; a torn ranged write shows up as a checksum
//! mismatch on the next read of that page.

use super::{check_range, AreaId, AreaStore};
use crate::config::Options;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Size of a checksummed content page
pub const PAGE_SIZE: usize = 4096;

/// Size of one page checksum in bytes
const CHECKSUM_SIZE: usize = 4;

/// Area file extension
const AREA_EXTENSION: &str = ".area";

/// Generate the file name of an area
pub fn area_filename(id: AreaId) -> String {
    format!("{:08}{}", id, AREA_EXTENSION)
}

/// Parse an area file name back into its id
pub fn parse_area_filename(filename: &str) -> Option<AreaId> {
    let name = filename.strip_suffix(AREA_EXTENSION)?;
    name.parse().ok().filter(|id: &AreaId| *id >= 0)
}

/// Length on disk of an area of `size` content bytes.
fn file_len(size: usize) -> usize {
    size + size.div_ceil(PAGE_SIZE) * CHECKSUM_SIZE
}

/// Content size of an area file of `len` bytes, if `len` is valid.
fn content_size(len: usize) -> Option<usize> {
    let stride = PAGE_SIZE + CHECKSUM_SIZE;
    match len % stride {
        0 => Some(len / stride * PAGE_SIZE),
        rest if rest > CHECKSUM_SIZE => Some(len / stride * PAGE_SIZE + rest - CHECKSUM_SIZE),
        _ => None,
    }
}

/// Pages overlapping `len > 0` bytes at `offset`.
fn page_span(offset: usize, len: usize) -> Range<usize> {
    offset / PAGE_SIZE..(offset + len).div_ceil(PAGE_SIZE)
}

/// Checksums of `content`, which must start on a page boundary.
fn page_checksums(content: &[u8]) -> Vec<u8> {
    content.chunks(PAGE_SIZE).flat_map(|page| crc32fast::hash(page).to_le_bytes()).collect()
}

fn verify_pages(content: &[u8], stored: &[u8]) -> Result<()> {
    for (page, trailer) in content.chunks(PAGE_SIZE).zip(stored.chunks_exact(CHECKSUM_SIZE)) {
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(page);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
    }
    Ok(())
}

/// Reads and verifies `pages` of an area of `size` bytes.
fn read_pages(file: &mut File, size: usize, pages: &Range<usize>) -> Result<Vec<u8>> {
    let start = pages.start * PAGE_SIZE;
    let end = (pages.end * PAGE_SIZE).min(size);

    let mut content = vec![0u8; end - start];
    file.seek(SeekFrom::Start(start as u64))?;
    file.read_exact(&mut content)?;

    let mut stored = vec![0u8; pages.len() * CHECKSUM_SIZE];
    file.seek(SeekFrom::Start((size + pages.start * CHECKSUM_SIZE) as u64))?;
    file.read_exact(&mut stored)?;

    verify_pages(&content, &stored)?;
    Ok(content)
}

/// Durable area allocator keeping one checksummed file per area.
#[derive(Debug)]
pub struct FileAreaStore {
    /// Store directory
    dir: PathBuf,
    /// Sizes of live areas, by id
    sizes: RwLock<HashMap<AreaId, usize>>,
    /// Next id to hand out
    next_id: AtomicI64,
    /// fsync after every write
    sync_writes: bool,
    /// Serializes writes to area files
    writes: Mutex<()>,
    /// Structural lock handed out by `lock()`
    structure: Mutex<()>,
}

impl FileAreaStore {
    /// Opens (or creates) an area store in `dir`.
    ///
    /// Existing area files are indexed so that ids keep increasing across
    /// restarts.
    pub fn open<P: AsRef<Path>>(dir: P, options: &Options) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();

        if !dir.exists() {
            if options.create_if_missing {
                fs::create_dir_all(&dir)?;
            } else {
                return Err(Error::not_found(format!("Area directory does not exist: {:?}", dir)));
            }
        } else if options.error_if_exists {
            return Err(Error::AlreadyExists(format!("Area directory already exists: {:?}", dir)));
        }

        let mut sizes = HashMap::new();
        let mut max_id = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if filename.ends_with(".tmp") {
                // Leftover of an interrupted write; the area file is intact.
                log::warn!("Removing stale temporary file {:?}", entry.path());
                fs::remove_file(entry.path())?;
                continue;
            }
            if let Some(id) = parse_area_filename(&filename) {
                let len = entry.metadata()?.len() as usize;
                let Some(size) = content_size(len) else {
                    return Err(Error::corruption(format!(
                        "area file {} has invalid length {}",
                        filename, len
                    )));
                };
                sizes.insert(id, size);
                max_id = max_id.max(id);
            }
        }

        log::info!("Opened area store {:?} with {} areas", dir, sizes.len());

        Ok(Self {
            dir,
            sizes: RwLock::new(sizes),
            next_id: AtomicI64::new(max_id + 1),
            sync_writes: options.sync_writes,
            writes: Mutex::new(()),
            structure: Mutex::new(()),
        })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn area_path(&self, id: AreaId) -> PathBuf {
        self.dir.join(area_filename(id))
    }

    fn write_file(&self, id: AreaId, data: &[u8]) -> Result<()> {
        let path = self.area_path(id);
        let tmp_path = self.dir.join(format!("{}.tmp", area_filename(id)));
        let _writing = self.writes.lock();

        let mut file: File =
            OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        file.write_all(data)?;
        file.write_all(&page_checksums(data))?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

impl AreaStore for FileAreaStore {
    fn create_area(&self, size: usize) -> Result<AreaId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let sizes = self.sizes.read();
            assert!(!sizes.contains_key(&id), "area id {} allocated twice", id);
        }
        self.write_file(id, &vec![0u8; size])?;
        self.sizes.write().insert(id, size);
        log::debug!("Created area {} ({} bytes)", id, size);
        Ok(id)
    }

    fn read_area(&self, id: AreaId) -> Result<Bytes> {
        let size = self.area_size(id)?;
        let mut raw = fs::read(self.area_path(id))?;
        if raw.len() != file_len(size) {
            return Err(Error::corruption(format!(
                "area {} has {} bytes on disk, expected {}",
                id,
                raw.len(),
                file_len(size)
            )));
        }

        let (content, trailer) = raw.split_at(size);
        verify_pages(content, trailer)?;
        raw.truncate(size);
        Ok(Bytes::from(raw))
    }

    fn write_area(&self, id: AreaId, data: &[u8]) -> Result<()> {
        let size = self.area_size(id)?;
        if data.len() != size {
            return Err(Error::invalid_argument(format!(
                "area {} is {} bytes, write of {} bytes",
                id,
                size,
                data.len()
            )));
        }
        self.write_file(id, data)
    }

    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> Result<Bytes> {
        let size = self.area_size(id)?;
        check_range(id, size, offset, len)?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let pages = page_span(offset, len);
        let mut file = File::open(self.area_path(id))?;
        let content = read_pages(&mut file, size, &pages)?;
        let from = offset - pages.start * PAGE_SIZE;
        Ok(Bytes::copy_from_slice(&content[from..from + len]))
    }

    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()> {
        let size = self.area_size(id)?;
        check_range(id, size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let _writing = self.writes.lock();
        let pages = page_span(offset, data.len());
        let mut file = OpenOptions::new().read(true).write(true).open(self.area_path(id))?;
        let mut content = read_pages(&mut file, size, &pages)?;
        let from = offset - pages.start * PAGE_SIZE;
        content[from..from + data.len()].copy_from_slice(data);

        file.seek(SeekFrom::Start((pages.start * PAGE_SIZE) as u64))?;
        file.write_all(&content)?;
        file.seek(SeekFrom::Start((size + pages.start * CHECKSUM_SIZE) as u64))?;
        file.write_all(&page_checksums(&content))?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    fn delete_area(&self, id: AreaId) -> Result<()> {
        if self.sizes.write().remove(&id).is_none() {
            return Err(Error::not_found(format!("area {}", id)));
        }
        fs::remove_file(self.area_path(id))?;
        log::debug!("Deleted area {}", id);
        Ok(())
    }

    fn area_size(&self, id: AreaId) -> Result<usize> {
        self.sizes
            .read()
            .get(&id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("area {}", id)))
    }

    fn contains(&self, id: AreaId) -> bool {
        self.sizes.read().contains_key(&id)
    }

    fn area_count(&self) -> usize {
        self.sizes.read().len()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.structure.lock()
    }
}
