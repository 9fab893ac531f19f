//! Side log used to make page commits atomic.
//!
//! ```text
//! [0..4]   record count: u32 (big-endian), stamped last
//! repeated record count times:
//!   [0..4]  page number: u32 (big-endian)
//!   [4..]   page bytes: [u8; PAGE_SIZE]
//! ```
//!
//! The count is written as zero first and only stamped once every record is
//! on disk, so a log with a zero count never reached its commit point and is
//! discarded. A log with a non-zero count is replayed in full; replaying the
//! same log twice writes the same bytes twice.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{Result, StorageError};
use crate::header::METADATA_SIZE;
use crate::pager::{PageNum, PAGE_SIZE};

/// Size of the record count prefix.
pub(crate) const LOG_HEADER_SIZE: usize = 4;

/// Size of one record: page number plus page bytes.
pub(crate) const LOG_RECORD_SIZE: usize = 4 + PAGE_SIZE;

/// The log shares the store's base name with a `.log` extension. A store
/// that already ends in `.log` gets a second `.log` appended instead.
pub fn log_path_for(store_path: &Path) -> PathBuf {
    if store_path.extension().is_some_and(|ext| ext == "log") {
        let mut name = store_path.as_os_str().to_os_string();
        name.push(".log");
        return PathBuf::from(name);
    }
    store_path.with_extension("log")
}

pub(crate) fn page_offset(page_num: PageNum) -> u64 {
    METADATA_SIZE as u64 + u64::from(page_num) * PAGE_SIZE as u64
}

/// Write `pages` to a fresh log at `log_path` and stamp its record count.
pub(crate) fn write_log(log_path: &Path, pages: &[(PageNum, &[u8])], sync: bool) -> Result<()> {
    let count = u32::try_from(pages.len())
        .map_err(|_| StorageError::Capacity("too many pages in one commit".into()))?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(log_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&0u32.to_be_bytes())?;
    for (page_num, data) in pages {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::Format(format!(
                "page {page_num} has {} bytes, expected {PAGE_SIZE}",
                data.len()
            )));
        }
        writer.write_all(&page_num.to_be_bytes())?;
        writer.write_all(data)?;
    }
    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    if sync {
        file.sync_all()?;
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&count.to_be_bytes())?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Copy every record of the log at `log_path` into `file`.
///
/// Returns the number of pages applied. The log itself is left in place.
pub(crate) fn apply_log(file: &mut File, log_path: &Path, sync: bool) -> Result<usize> {
    let log = File::open(log_path)?;
    let log_len = log.metadata()?.len();
    let mut reader = BufReader::new(log);

    let mut count_buf = [0u8; LOG_HEADER_SIZE];
    match reader.read_exact(&mut count_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_be_bytes(count_buf) as usize;
    let expected_len = (LOG_HEADER_SIZE + count * LOG_RECORD_SIZE) as u64;
    if log_len < expected_len {
        return Err(StorageError::Format(format!(
            "log holds {log_len} bytes but its count needs {expected_len}"
        )));
    }

    let mut page = vec![0u8; PAGE_SIZE];
    for _ in 0..count {
        let mut num_buf = [0u8; 4];
        reader.read_exact(&mut num_buf)?;
        reader.read_exact(&mut page)?;
        let page_num = u32::from_be_bytes(num_buf);
        file.seek(SeekFrom::Start(page_offset(page_num)))?;
        file.write_all(&page)?;
    }
    if sync {
        file.sync_all()?;
    }
    Ok(count)
}

/// Replay and delete a leftover log, if any. Returns the number of pages
/// recovered, or `None` when there was no log.
pub(crate) fn recover(file: &mut File, log_path: &Path) -> Result<Option<usize>> {
    if !log_path.exists() {
        return Ok(None);
    }
    let applied = apply_log(file, log_path, true)?;
    if applied == 0 {
        warn!(
            "discarding incomplete log {} (never reached its commit point)",
            log_path.display()
        );
    } else {
        info!(
            "recovered {applied} page(s) from log {}",
            log_path.display()
        );
    }
    fs::remove_file(log_path)?;
    Ok(Some(applied))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn log_path_replaces_extension() {
        assert_eq!(
            log_path_for(Path::new("/tmp/data.db")),
            PathBuf::from("/tmp/data.log")
        );
        assert_eq!(
            log_path_for(Path::new("/tmp/data")),
            PathBuf::from("/tmp/data.log")
        );
        assert_eq!(
            log_path_for(Path::new("/tmp/data.log")),
            PathBuf::from("/tmp/data.log.log")
        );
    }

    #[test]
    fn written_log_has_count_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("s.log");
        let a = vec![1u8; PAGE_SIZE];
        let b = vec![2u8; PAGE_SIZE];
        write_log(&log_path, &[(3, &a), (7, &b)], false).unwrap();

        let bytes = fs::read(&log_path).unwrap();
        assert_eq!(bytes.len(), LOG_HEADER_SIZE + 2 * LOG_RECORD_SIZE);
        assert_eq!(&bytes[0..4], &2u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_be_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[4 + LOG_RECORD_SIZE..8 + LOG_RECORD_SIZE], &7u32.to_be_bytes());
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("s.db");
        let log_path = log_path_for(&store_path);
        let page = vec![0x5Au8; PAGE_SIZE];
        write_log(&log_path, &[(2, &page)], false).unwrap();

        let mut file = open_rw(&store_path);
        assert_eq!(apply_log(&mut file, &log_path, false).unwrap(), 1);
        let once = fs::read(&store_path).unwrap();
        assert_eq!(apply_log(&mut file, &log_path, false).unwrap(), 1);
        let twice = fs::read(&store_path).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.len() as u64, page_offset(3));
        assert_eq!(once[page_offset(2) as usize], 0x5A);
    }

    #[test]
    fn unstamped_log_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("s.db");
        let log_path = log_path_for(&store_path);
        let mut raw = vec![0u8; LOG_HEADER_SIZE];
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&vec![9u8; PAGE_SIZE]);
        fs::write(&log_path, raw).unwrap();

        let mut file = open_rw(&store_path);
        assert_eq!(recover(&mut file, &log_path).unwrap(), Some(0));
        assert!(!log_path.exists());
        assert_eq!(fs::metadata(&store_path).unwrap().len(), 0);
    }

    #[test]
    fn truncated_stamped_log_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("s.db");
        let log_path = log_path_for(&store_path);
        let mut raw = 2u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&vec![9u8; PAGE_SIZE]);
        fs::write(&log_path, raw).unwrap();

        let mut file = open_rw(&store_path);
        let err = apply_log(&mut file, &log_path, false).unwrap_err();
        assert!(matches!(err, StorageError::Format(_)));
    }

    #[test]
    fn recover_without_log_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("s.db");
        let mut file = open_rw(&store_path);
        assert_eq!(recover(&mut file, &log_path_for(&store_path)).unwrap(), None);
    }
}
