//! Fixed metadata areas stored ahead of the paged region.
//!
//! The first `METADATA_SIZE` bytes of a store file are split into
//! `METADATA_AREAS` areas of `METADATA_AREA_SIZE` bytes each. Areas are
//! read and written directly, never through the page cache or the log.
//! Each layer stamps its own format version into an area of its own.

use crate::error::{Result, StorageError};
use crate::field::{FieldMut, Pointer};
use crate::pager::PageStore;

/// Number of metadata areas.
pub const METADATA_AREAS: usize = 16;

/// Size of one metadata area in bytes.
pub const METADATA_AREA_SIZE: usize = 64;

/// Total size of the metadata region; page 0 starts here.
pub const METADATA_SIZE: usize = METADATA_AREAS * METADATA_AREA_SIZE;

/// Area holding the page-store format version.
pub const PAGE_STORE_AREA: usize = 0;

/// Area holding the object-store format version.
pub const OBJECT_STORE_AREA: usize = 1;

/// Magic bytes at the start of every version stamp.
pub const MAGIC: &[u8; 8] = b"TRELLIS\0";

/// Size of a serialized version stamp.
pub const STAMP_SIZE: usize = 12;

/// The format version recorded by one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub version: u32,
}

impl VersionStamp {
    pub fn new(version: u32) -> Self {
        Self { version }
    }

    /// Serialize into the first `STAMP_SIZE` bytes of an area.
    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= STAMP_SIZE, "buffer too small for version stamp");
        let mut field = FieldMut::new(buf);
        field.clear(0, STAMP_SIZE);
        field.put_bytes(0, MAGIC);
        field.put_u32(8, self.version);
    }

    /// Deserialize from an area. An all-zero area has never been stamped
    /// and yields `Ok(None)`.
    pub fn deserialize(buf: &[u8]) -> Result<Option<Self>> {
        let mut ptr = Pointer::new(buf);
        let magic = ptr.read_bytes(MAGIC.len())?;
        let version = ptr.read_u32()?;
        if version == 0 && magic.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        if magic != MAGIC.as_slice() {
            return Err(StorageError::Format(
                "invalid metadata area (bad magic)".into(),
            ));
        }
        Ok(Some(Self { version }))
    }
}

/// Verify the version stamp in `area`, writing `expected` if the area has
/// never been stamped.
pub fn check_version(pages: &mut PageStore, area: usize, expected: u32) -> Result<()> {
    let mut buf = pages.read_metadata(area)?;
    match VersionStamp::deserialize(&buf)? {
        Some(stamp) if stamp.version == expected => Ok(()),
        Some(stamp) => Err(StorageError::Version {
            area,
            found: stamp.version,
            expected,
        }),
        None => {
            VersionStamp::new(expected).serialize(&mut buf);
            pages.write_metadata(area, &buf)
        }
    }
}
