//! Stored objects: addresses, headers, the materialization trait and the
//! type registry that maps on-disk type tags to factories.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, StorageError};
use crate::field::{Field, FieldMut};
use crate::pager::{PageNum, MAX_PAGE_NUM};

/// Small integer identifying the concrete type of a stored object.
pub type TypeTag = u16;

/// Tag of [`BinaryObject`].
pub const BINARY_OBJECT_TAG: TypeTag = 1;

/// Size of the header preceding every object payload in a page heap.
pub const OBJECT_HEADER_SIZE: usize = 4;

/// Size of the wire form of an [`ObjectAddress`].
pub const ADDRESS_SIZE: usize = 4;

/// Location of an object: a page and a slot (1..=255) in its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectAddress {
    page: PageNum,
    object: u8,
}

impl ObjectAddress {
    pub const NULL: ObjectAddress = ObjectAddress { page: 0, object: 0 };

    pub fn new(page: PageNum, object: u8) -> Self {
        debug_assert!(page <= MAX_PAGE_NUM, "page {page} does not fit an address");
        Self { page, object }
    }

    pub fn page(&self) -> PageNum {
        self.page
    }

    pub fn object_number(&self) -> u8 {
        self.object
    }

    pub fn is_null(&self) -> bool {
        self.object == 0 && self.page == 0
    }

    /// 3-byte big-endian page number followed by the object number.
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut buf = [0u8; ADDRESS_SIZE];
        let mut field = FieldMut::new(&mut buf);
        field.put_u24(0, self.page);
        field.put_u8(3, self.object);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(StorageError::Format(format!(
                "object address must be {ADDRESS_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let field = Field::new(bytes);
        Ok(Self {
            page: field.get_u24(0),
            object: field.get_u8(3),
        })
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.object)
    }
}

/// Tag and payload length written ahead of each object in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub tag: TypeTag,
    pub length: u16,
}

impl ObjectHeader {
    pub fn read(field: Field<'_>) -> Result<Self> {
        let tag = field.get_u16(0);
        if tag == 0 {
            return Err(StorageError::Format("object header has no type tag".into()));
        }
        Ok(Self {
            tag,
            length: field.get_u16(2),
        })
    }

    pub fn write(&self, mut field: FieldMut<'_>) {
        field.put_u16(0, self.tag);
        field.put_u16(2, self.length);
    }
}

/// A typed record that lives in an object slot.
///
/// Objects are materialized from their payload bytes when acquired and
/// dematerialized back into the page at commit. State that is not part of
/// the payload (such as observer registrations) is ephemeral.
pub trait StoredObject: Any {
    fn type_tag(&self) -> TypeTag;

    /// Length of the payload produced by `dematerialize`.
    fn encoded_len(&self) -> usize;

    /// Write the payload into `out`, which is exactly `encoded_len` bytes.
    fn dematerialize(&self, out: &mut [u8]);

    /// Replace the persistent state after a rollback. `None` means the
    /// object no longer exists on disk.
    fn rematerialize(&mut self, bytes: Option<&[u8]>) -> Result<()>;

    /// A pinned object stays materialized even with no acquisitions and
    /// cannot be removed.
    fn is_pinned(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds a typed object from its payload bytes.
pub type Factory = fn(&[u8]) -> Result<Box<dyn StoredObject>>;

/// Mapping from type tag to factory, injected into the object store.
#[derive(Default)]
pub struct ObjectRegistry {
    factories: HashMap<TypeTag, Factory>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `tag`. Each tag may be registered once.
    pub fn register(&mut self, tag: TypeTag, factory: Factory) -> Result<()> {
        if tag == 0 {
            return Err(StorageError::Format("type tag 0 is reserved".into()));
        }
        if self.factories.insert(tag, factory).is_some() {
            return Err(StorageError::Format(format!(
                "type tag {tag} registered twice"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.factories.contains_key(&tag)
    }

    pub fn materialize(&self, tag: TypeTag, bytes: &[u8]) -> Result<Box<dyn StoredObject>> {
        let factory = self
            .factories
            .get(&tag)
            .ok_or_else(|| StorageError::Format(format!("unknown object type tag {tag}")))?;
        factory(bytes)
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("ObjectRegistry").field("tags", &tags).finish()
    }
}

/// An untyped byte array, copied on materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryObject {
    bytes: Vec<u8>,
}

impl BinaryObject {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn register(registry: &mut ObjectRegistry) -> Result<()> {
        registry.register(BINARY_OBJECT_TAG, |bytes| {
            Ok(Box::new(BinaryObject::new(bytes.to_vec())))
        })
    }
}

impl StoredObject for BinaryObject {
    fn type_tag(&self) -> TypeTag {
        BINARY_OBJECT_TAG
    }

    fn encoded_len(&self) -> usize {
        self.bytes.len()
    }

    fn dematerialize(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.bytes);
    }

    fn rematerialize(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        self.bytes = bytes.map(<[u8]>::to_vec).unwrap_or_default();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
