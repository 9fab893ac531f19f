//! PageStore: fixed-size pages in one file, with a bounded read cache and a
//! side log that makes each commit atomic.
//!
//! Pages move between three places. While acquired (reference count > 0) or
//! dirty they live in the frame map; once released and clean they move to an
//! LRU cache that may drop them at any time; otherwise they are only on disk.
//! Nothing reaches the store file except through `commit`.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use lru::LruCache;

use crate::config::StoreOptions;
use crate::error::{Result, StorageError};
use crate::header::{self, METADATA_AREAS, METADATA_AREA_SIZE, METADATA_SIZE, PAGE_STORE_AREA};
use crate::wal;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// A page number (0-based). Object addresses carry 24 bits of it.
pub type PageNum = u32;

/// Largest page number an object address can refer to.
pub const MAX_PAGE_NUM: PageNum = 0x00FF_FFFF;

/// Format version stamped into metadata area 0.
pub const PAGE_STORE_VERSION: u32 = 1;

/// A page held in memory because it is acquired or dirty.
struct Frame {
    data: Box<[u8]>,
    refs: u32,
}

pub struct PageStore {
    path: PathBuf,
    log_path: PathBuf,
    file: File,
    options: StoreOptions,
    /// Number of pages, including pages created since the last commit.
    page_count: PageNum,
    /// Acquired and dirty pages.
    frames: HashMap<PageNum, Frame>,
    /// Pages to be written by the next commit.
    dirty: BTreeSet<PageNum>,
    /// Clean, unacquired pages.
    cache: LruCache<PageNum, Box<[u8]>>,
}

impl PageStore {
    /// Open or create a store file, replaying a leftover log first.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log_path = wal::log_path_for(&path);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        wal::recover(&mut file, &log_path)?;

        let len = file.metadata()?.len();
        if len < METADATA_SIZE as u64 {
            file.set_len(METADATA_SIZE as u64)?;
            file.sync_all()?;
        }
        let page_count = pages_in_file(file.metadata()?.len());

        let capacity = NonZeroUsize::new(options.cache_pages).unwrap_or(NonZeroUsize::MIN);
        let mut store = Self {
            path,
            log_path,
            file,
            options,
            page_count,
            frames: HashMap::new(),
            dirty: BTreeSet::new(),
            cache: LruCache::new(capacity),
        };
        header::check_version(&mut store, PAGE_STORE_AREA, PAGE_STORE_VERSION)?;

        info!(
            "opened page store {} ({} pages)",
            store.path.display(),
            store.page_count
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Total number of pages, committed or not.
    pub fn page_count(&self) -> PageNum {
        self.page_count
    }

    /// Number of clean pages currently in the read cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Number of pages currently held by at least one acquisition.
    pub fn acquired_pages(&self) -> usize {
        self.frames.values().filter(|f| f.refs > 0).count()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Create a new zeroed page at the end of the store and acquire it.
    pub fn acquire_new(&mut self) -> Result<PageNum> {
        let page_num = self.page_count;
        if page_num > MAX_PAGE_NUM {
            return Err(StorageError::Capacity(format!(
                "store is full ({} pages)",
                self.page_count
            )));
        }
        self.page_count += 1;
        self.frames.insert(
            page_num,
            Frame {
                data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                refs: 1,
            },
        );
        self.dirty.insert(page_num);
        debug!("created page {page_num}");
        Ok(page_num)
    }

    /// Acquire an existing page, reading it from the cache or the file.
    pub fn acquire(&mut self, page_num: PageNum) -> Result<()> {
        if let Some(frame) = self.frames.get_mut(&page_num) {
            frame.refs += 1;
            return Ok(());
        }
        if page_num >= self.page_count {
            return Err(StorageError::NotFound(format!(
                "page {page_num} out of range (page_count={})",
                self.page_count
            )));
        }

        let data = match self.cache.pop(&page_num) {
            Some(data) => data,
            None => self.read_from_file(page_num)?,
        };
        self.frames.insert(page_num, Frame { data, refs: 1 });
        Ok(())
    }

    /// Drop one acquisition. At zero a clean page moves to the cache; a
    /// dirty one stays in memory until commit or rollback.
    pub fn release(&mut self, page_num: PageNum) {
        let Some(frame) = self.frames.get_mut(&page_num) else {
            warn!("release of page {page_num} which is not acquired");
            return;
        };
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 && !self.dirty.contains(&page_num) {
            if let Some(frame) = self.frames.remove(&page_num) {
                self.cache.put(page_num, frame.data);
            }
        }
    }

    /// Bytes of an acquired page.
    pub fn page(&self, page_num: PageNum) -> Result<&[u8]> {
        self.frames
            .get(&page_num)
            .map(|frame| &frame.data[..])
            .ok_or_else(|| not_acquired(page_num))
    }

    /// Mutable bytes of an acquired page. Marks the page modified.
    pub fn page_mut(&mut self, page_num: PageNum) -> Result<&mut [u8]> {
        let frame = self
            .frames
            .get_mut(&page_num)
            .ok_or_else(|| not_acquired(page_num))?;
        self.dirty.insert(page_num);
        Ok(&mut frame.data[..])
    }

    /// Register an acquired page as part of the next commit.
    pub fn modified(&mut self, page_num: PageNum) -> Result<()> {
        if !self.frames.contains_key(&page_num) {
            return Err(not_acquired(page_num));
        }
        self.dirty.insert(page_num);
        Ok(())
    }

    /// Run `f` over a page for the duration of one acquisition.
    pub fn with_page<R>(&mut self, page_num: PageNum, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.acquire(page_num)?;
        let result = self.frames.get(&page_num).map(|frame| f(&frame.data));
        self.release(page_num);
        result.ok_or_else(|| not_acquired(page_num))
    }

    /// Like [`PageStore::with_page`], but mutable; marks the page modified.
    pub fn with_page_mut<R>(
        &mut self,
        page_num: PageNum,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.acquire(page_num)?;
        self.dirty.insert(page_num);
        let result = self
            .frames
            .get_mut(&page_num)
            .map(|frame| f(&mut frame.data));
        self.release(page_num);
        result.ok_or_else(|| not_acquired(page_num))
    }

    /// Write every dirty page through the log into the store file.
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.stage_log()?;
        let written = self.apply_dirty()?;
        fs::remove_file(&self.log_path)?;

        let committed = std::mem::take(&mut self.dirty);
        for page_num in committed {
            let idle = self.frames.get(&page_num).is_some_and(|f| f.refs == 0);
            if idle {
                if let Some(frame) = self.frames.remove(&page_num) {
                    self.cache.put(page_num, frame.data);
                }
            }
        }
        debug!("committed {written} page(s) to {}", self.path.display());
        Ok(())
    }

    /// Discard every uncommitted change. Pages still acquired are restored
    /// from the file.
    pub fn rollback(&mut self) -> Result<()> {
        let discarded = std::mem::take(&mut self.dirty);
        let count = discarded.len();
        self.page_count = pages_in_file(self.file.metadata()?.len());
        for page_num in discarded {
            let held = self.frames.get(&page_num).is_some_and(|f| f.refs > 0);
            if held {
                let data = self.read_from_file(page_num)?;
                if let Some(frame) = self.frames.get_mut(&page_num) {
                    frame.data = data;
                }
            } else {
                self.frames.remove(&page_num);
            }
        }
        if let Some(highest) = self.frames.keys().max() {
            self.page_count = self.page_count.max(highest + 1);
        }
        debug!("rolled back {count} page(s)");
        Ok(())
    }

    /// Read a metadata area. Bypasses the cache and the log.
    pub fn read_metadata(&mut self, area: usize) -> Result<Vec<u8>> {
        check_area(area)?;
        let mut buf = vec![0u8; METADATA_AREA_SIZE];
        self.file
            .seek(SeekFrom::Start((area * METADATA_AREA_SIZE) as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write a metadata area directly to the file.
    pub fn write_metadata(&mut self, area: usize, data: &[u8]) -> Result<()> {
        check_area(area)?;
        if data.len() > METADATA_AREA_SIZE {
            return Err(StorageError::Capacity(format!(
                "metadata of {} bytes exceeds area size {METADATA_AREA_SIZE}",
                data.len()
            )));
        }
        let mut buf = [0u8; METADATA_AREA_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.file
            .seek(SeekFrom::Start((area * METADATA_AREA_SIZE) as u64))?;
        self.file.write_all(&buf)?;
        if self.options.sync_on_commit {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Close the store. Uncommitted pages are discarded.
    pub fn close(mut self) -> Result<()> {
        if !self.dirty.is_empty() {
            warn!(
                "closing {} with {} uncommitted page(s); discarding them",
                self.path.display(),
                self.dirty.len()
            );
            self.dirty.clear();
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Write the side log for the current dirty set without applying it.
    pub(crate) fn stage_log(&self) -> Result<()> {
        let mut records = Vec::with_capacity(self.dirty.len());
        for page_num in &self.dirty {
            let frame = self.frames.get(page_num).ok_or_else(|| {
                StorageError::Format(format!("dirty page {page_num} is not in memory"))
            })?;
            records.push((*page_num, &frame.data[..]));
        }
        wal::write_log(&self.log_path, &records, self.options.sync_on_commit)
    }

    fn apply_dirty(&mut self) -> Result<usize> {
        let mut written = 0;
        for page_num in &self.dirty {
            let Some(frame) = self.frames.get(page_num) else {
                continue;
            };
            self.file.seek(SeekFrom::Start(wal::page_offset(*page_num)))?;
            self.file.write_all(&frame.data)?;
            written += 1;
        }
        if self.options.sync_on_commit {
            self.file.sync_all()?;
        }
        Ok(written)
    }

    /// Read a page from the file, zero-filling whatever lies past EOF.
    fn read_from_file(&mut self, page_num: PageNum) -> Result<Box<[u8]>> {
        let mut data = vec![0u8; PAGE_SIZE];
        let offset = wal::page_offset(page_num);
        let len = self.file.metadata()?.len();
        if offset < len {
            let available = ((len - offset) as usize).min(PAGE_SIZE);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut data[..available])?;
        }
        Ok(data.into_boxed_slice())
    }
}

fn pages_in_file(len: u64) -> PageNum {
    let paged = len.saturating_sub(METADATA_SIZE as u64);
    paged.div_ceil(PAGE_SIZE as u64) as PageNum
}

fn check_area(area: usize) -> Result<()> {
    if area >= METADATA_AREAS {
        return Err(StorageError::Capacity(format!(
            "metadata area {area} out of range (areas={METADATA_AREAS})"
        )));
    }
    Ok(())
}

fn not_acquired(page_num: PageNum) -> StorageError {
    StorageError::NotFound(format!("page {page_num} is not acquired"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn create_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let pages = PageStore::open(store_path(&dir, "new.db")).unwrap();
        assert_eq!(pages.page_count(), 0);
        assert_eq!(
            fs::metadata(pages.path()).unwrap().len(),
            METADATA_SIZE as u64
        );
    }

    #[test]
    fn allocate_multiple_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = PageStore::open(store_path(&dir, "alloc.db")).unwrap();
        let p0 = pages.acquire_new().unwrap();
        let p1 = pages.acquire_new().unwrap();
        let p2 = pages.acquire_new().unwrap();
        assert_eq!((p0, p1, p2), (0, 1, 2));
        assert_eq!(pages.page_count(), 3);
        assert_eq!(pages.acquired_pages(), 3);
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir, "persist.db");
        {
            let mut pages = PageStore::open(&path).unwrap();
            let pg = pages.acquire_new().unwrap();
            pages.page_mut(pg).unwrap()[0..6].copy_from_slice(b"world!");
            pages.release(pg);
            pages.commit().unwrap();
            pages.close().unwrap();
        }

        let mut pages = PageStore::open(&path).unwrap();
        assert_eq!(pages.page_count(), 1);
        let head = pages.with_page(0, |data| data[0..6].to_vec()).unwrap();
        assert_eq!(head, b"world!");
        assert!(!wal::log_path_for(&path).exists());
    }

    #[test]
    fn store_named_like_a_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir, "data.log");
        {
            let mut pages = PageStore::open(&path).unwrap();
            let pg = pages.acquire_new().unwrap();
            pages.page_mut(pg).unwrap()[0..5].copy_from_slice(b"hello");
            pages.release(pg);
            pages.commit().unwrap();
            pages.close().unwrap();
        }
        assert!(path.exists());

        let mut pages = PageStore::open(&path).unwrap();
        assert_eq!(pages.page_count(), 1);
        let head = pages.with_page(0, |data| data[0..5].to_vec()).unwrap();
        assert_eq!(head, b"hello");
    }

    #[test]
    fn acquire_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = PageStore::open(store_path(&dir, "range.db")).unwrap();
        let err = pages.acquire(99).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(pages.page(0).is_err());
    }

    #[test]
    fn released_clean_pages_land_in_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = PageStore::open(store_path(&dir, "cache.db")).unwrap();
        for _ in 0..3 {
            let pg = pages.acquire_new().unwrap();
            pages.release(pg);
        }
        // Dirty pages are held in memory, not cached.
        assert_eq!(pages.cached_pages(), 0);
        pages.commit().unwrap();
        assert_eq!(pages.cached_pages(), 3);
        assert_eq!(pages.acquired_pages(), 0);
    }

    #[test]
    fn lru_cache_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions::default().with_cache_pages(2);
        let mut pages = PageStore::open_with_options(store_path(&dir, "lru.db"), options).unwrap();
        for n in 0..5u8 {
            let pg = pages.acquire_new().unwrap();
            pages.page_mut(pg).unwrap()[0] = n + 1;
            pages.release(pg);
        }
        pages.commit().unwrap();
        assert_eq!(pages.cached_pages(), 2);

        // Evicted pages come back from the file.
        for n in 0..5u32 {
            let first = pages.with_page(n, |data| data[0]).unwrap();
            assert_eq!(first, n as u8 + 1);
        }
        assert!(pages.cached_pages() <= 2);
    }

    #[test]
    fn rollback_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = PageStore::open(store_path(&dir, "rollback.db")).unwrap();
        let pg = pages.acquire_new().unwrap();
        pages.page_mut(pg).unwrap()[0] = 1;
        pages.release(pg);
        pages.commit().unwrap();

        pages.with_page_mut(pg, |data| data[0] = 2).unwrap();
        let extra = pages.acquire_new().unwrap();
        pages.release(extra);
        assert_eq!(pages.page_count(), 2);

        pages.rollback().unwrap();
        assert_eq!(pages.page_count(), 1);
        assert_eq!(pages.with_page(pg, |data| data[0]).unwrap(), 1);
        assert!(!pages.has_uncommitted_changes());
    }

    #[test]
    fn rollback_restores_held_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = PageStore::open(store_path(&dir, "held.db")).unwrap();
        let pg = pages.acquire_new().unwrap();
        pages.page_mut(pg).unwrap()[0] = 7;
        pages.commit().unwrap();

        pages.page_mut(pg).unwrap()[0] = 8;
        pages.rollback().unwrap();
        assert_eq!(pages.page(pg).unwrap()[0], 7);
        pages.release(pg);
    }

    #[test]
    fn metadata_areas_bypass_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir, "meta.db");
        {
            let mut pages = PageStore::open(&path).unwrap();
            pages.write_metadata(7, b"area seven").unwrap();
            assert!(!pages.has_uncommitted_changes());
        }
        let mut pages = PageStore::open(&path).unwrap();
        let area = pages.read_metadata(7).unwrap();
        assert_eq!(&area[..10], b"area seven");
        assert!(pages.read_metadata(METADATA_AREAS).is_err());
        assert!(pages.write_metadata(1, &[0u8; 65]).is_err());
    }

    #[test]
    fn crash_after_log_is_recovered_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let crashed = store_path(&dir, "crashed.db");
        let clean = store_path(&dir, "clean.db");

        for path in [&crashed, &clean] {
            let mut pages = PageStore::open(path).unwrap();
            let pg = pages.acquire_new().unwrap();
            pages.page_mut(pg).unwrap()[..4].copy_from_slice(b"base");
            pages.release(pg);
            pages.commit().unwrap();
        }

        let update = |pages: &mut PageStore| {
            pages.with_page_mut(0, |data| data[..4].copy_from_slice(b"next")).unwrap();
            let pg = pages.acquire_new().unwrap();
            pages.page_mut(pg).unwrap()[100] = 0xEE;
            pages.release(pg);
        };

        {
            let mut pages = PageStore::open(&crashed).unwrap();
            update(&mut pages);
            pages.stage_log().unwrap();
            // Dropped without applying: the store file still holds "base".
        }
        let log_path = wal::log_path_for(&crashed);
        assert!(log_path.exists());

        // Replaying the same log twice must leave the same bytes.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&crashed).unwrap();
            wal::apply_log(&mut file, &log_path, true).unwrap();
        }
        {
            let mut pages = PageStore::open(&clean).unwrap();
            update(&mut pages);
            pages.commit().unwrap();
        }

        let mut pages = PageStore::open(&crashed).unwrap();
        assert!(!log_path.exists());
        assert_eq!(pages.page_count(), 2);
        assert_eq!(pages.with_page(0, |d| d[..4].to_vec()).unwrap(), b"next");
        drop(pages);

        assert_eq!(fs::read(&crashed).unwrap(), fs::read(&clean).unwrap());
    }
}
