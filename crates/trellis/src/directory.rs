//! The root record and the two system indexes it points at.
//!
//! The object directory maps an [`ObjectId`] to the address of the object's
//! bytes. The index directory maps index names to anchor addresses. Both are
//! ordinary indexes; their anchors and the open counter live in metadata
//! area 3.

use trellis_storage::field::{Field, FieldMut};
use trellis_storage::object::ADDRESS_SIZE;
use trellis_storage::{Index, ObjectAddress, ObjectStore, PageStore};

use crate::error::{Error, Result};
use crate::object_id::ObjectId;

/// Area holding the indexed-store format version.
pub const INDEXED_STORE_AREA: usize = 2;

/// Area holding the [`RootRecord`].
pub const ROOT_AREA: usize = 3;

pub const INDEXED_STORE_VERSION: u32 = 1;

const OBJECT_DIRECTORY: usize = 0;
const INDEX_DIRECTORY: usize = ADDRESS_SIZE;
const OPEN_COUNTER: usize = 2 * ADDRESS_SIZE;
const ROOT_RECORD_SIZE: usize = OPEN_COUNTER + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRecord {
    pub object_directory: ObjectAddress,
    pub index_directory: ObjectAddress,
    /// Number of times the store has been opened.
    pub open_counter: u32,
}

impl RootRecord {
    /// Read the record, or `None` for a store that was never initialized.
    pub fn read(pages: &mut PageStore) -> Result<Option<Self>> {
        let area = pages.read_metadata(ROOT_AREA)?;
        let field = Field::new(&area);
        let record = Self {
            object_directory: address_at(&field, OBJECT_DIRECTORY),
            index_directory: address_at(&field, INDEX_DIRECTORY),
            open_counter: field.get_u32(OPEN_COUNTER),
        };
        if record.object_directory.is_null() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn write(&self, pages: &mut PageStore) -> Result<()> {
        let mut buf = [0u8; ROOT_RECORD_SIZE];
        let mut field = FieldMut::new(&mut buf);
        field.put_bytes(OBJECT_DIRECTORY, &self.object_directory.to_bytes());
        field.put_bytes(INDEX_DIRECTORY, &self.index_directory.to_bytes());
        field.put_u32(OPEN_COUNTER, self.open_counter);
        pages.write_metadata(ROOT_AREA, &buf)?;
        Ok(())
    }
}

fn address_at(field: &Field<'_>, offset: usize) -> ObjectAddress {
    ObjectAddress::new(field.get_u24(offset), field.get_u8(offset + 3))
}

/// Address of the object stored under `id`.
pub fn lookup_object(
    objects: &mut ObjectStore,
    directory: Index,
    id: ObjectId,
) -> Result<ObjectAddress> {
    match directory.get(objects, &id.to_bytes())? {
        Some(value) => Ok(ObjectAddress::from_bytes(&value)?),
        None => Err(Error::ObjectNotFound(id)),
    }
}

/// Anchor of the index called `name`.
pub fn lookup_index(objects: &mut ObjectStore, directory: Index, name: &str) -> Result<Index> {
    match directory.get(objects, name.as_bytes())? {
        Some(value) => Ok(Index::at(ObjectAddress::from_bytes(&value)?)),
        None => Err(Error::IndexNotFound(name.to_string())),
    }
}

/// Every key of `directory`, in order.
pub fn keys(objects: &mut ObjectStore, directory: Index) -> Result<Vec<Vec<u8>>> {
    let mut cursor = directory.open();
    let mut keys = Vec::new();
    cursor.find_first_entry(objects)?;
    while cursor.is_set() {
        keys.push(cursor.key(objects)?);
        cursor.next(objects)?;
    }
    cursor.close(objects)?;
    Ok(keys)
}
