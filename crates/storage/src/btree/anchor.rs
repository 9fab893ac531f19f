//! The fixed handle of one B+tree.

use std::any::Any;

use crate::error::{Result, StorageError};
use crate::field::{Field, FieldMut};
use crate::object::{ObjectAddress, ObjectRegistry, StoredObject, TypeTag, ADDRESS_SIZE};

pub const INDEX_ANCHOR_TAG: TypeTag = 2;

/// Payload size: root node address followed by the leaf entry count.
pub const ANCHOR_SIZE: usize = ADDRESS_SIZE + 4;

/// Root node address and entry count of an index. The anchor never moves,
/// so its address identifies the index for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexAnchor {
    root: ObjectAddress,
    entries: u32,
}

impl IndexAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ANCHOR_SIZE {
            return Err(StorageError::Format(format!(
                "index anchor must be {ANCHOR_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let field = Field::new(bytes);
        Ok(Self {
            root: ObjectAddress::from_bytes(&bytes[..ADDRESS_SIZE])?,
            entries: field.get_u32(ADDRESS_SIZE),
        })
    }

    pub fn register(registry: &mut ObjectRegistry) -> Result<()> {
        registry.register(INDEX_ANCHOR_TAG, |bytes| {
            Ok(Box::new(IndexAnchor::from_bytes(bytes)?))
        })
    }

    /// Root node, or null for an empty index.
    pub fn root(&self) -> ObjectAddress {
        self.root
    }

    pub fn set_root(&mut self, root: ObjectAddress) {
        self.root = root;
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn set_entries(&mut self, entries: u32) {
        self.entries = entries;
    }
}

impl StoredObject for IndexAnchor {
    fn type_tag(&self) -> TypeTag {
        INDEX_ANCHOR_TAG
    }

    fn encoded_len(&self) -> usize {
        ANCHOR_SIZE
    }

    fn dematerialize(&self, out: &mut [u8]) {
        let mut field = FieldMut::new(out);
        field.put_bytes(0, &self.root.to_bytes());
        field.put_u32(ADDRESS_SIZE, self.entries);
    }

    fn rematerialize(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        *self = match bytes {
            Some(bytes) => IndexAnchor::from_bytes(bytes)?,
            None => IndexAnchor::new(),
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
