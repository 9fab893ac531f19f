use std::fmt;

use trellis_storage::field::{Field, FieldMut};
use trellis_storage::StorageError;

/// Size of the wire form of an [`ObjectId`].
pub const OBJECT_ID_SIZE: usize = 8;

/// Stable identifier of a stored object: the open counter of the session
/// that created it and a serial number within that session.
///
/// The wire form is big-endian, so ids sort by creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    open_counter: u32,
    serial: u32,
}

impl ObjectId {
    pub fn new(open_counter: u32, serial: u32) -> Self {
        Self {
            open_counter,
            serial,
        }
    }

    pub fn open_counter(&self) -> u32 {
        self.open_counter
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn to_bytes(&self) -> [u8; OBJECT_ID_SIZE] {
        let mut buf = [0u8; OBJECT_ID_SIZE];
        let mut field = FieldMut::new(&mut buf);
        field.put_u32(0, self.open_counter);
        field.put_u32(4, self.serial);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != OBJECT_ID_SIZE {
            return Err(StorageError::Format(format!(
                "object id must be {OBJECT_ID_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let field = Field::new(bytes);
        Ok(Self::new(field.get_u32(0), field.get_u32(4)))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.open_counter, self.serial)
    }
}
