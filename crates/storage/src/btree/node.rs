//! Index nodes and their in-object layout.
//!
//! ## Node Layout
//!
//! Every node is a fixed `NODE_SIZE` allocation in the object store.
//!
//! ```text
//! [0]       kind: u8           (1 = root, 2 = interior, 3 = leaf)
//! [1..3]    count: u16         number of entries
//! [3..5]    used: u16          heap bytes taken by live entries
//! [5..7]    heap_low: u16      lowest heap offset in use
//! [7..11]   parent: address    parent node, or the anchor for the root
//! [11..15]  prev: address      previous leaf (leaves only)
//! [15..19]  next: address      next leaf (leaves only)
//! [19..]    descriptors: [(offset: u16, key_len: u16, value_len: u16)]
//! ```
//!
//! Key and value bytes are packed together in a heap growing down from the
//! end of the node. Removal clears a block in place; `compact` rewrites the
//! heap in entry order when a new block does not fit below the descriptors.
//!
//! Routing nodes (root and interior) store 4-byte child addresses as values.
//! Leaves keep a registry of the cursors positioned on them and adjust those
//! cursors as entries move.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Result, StorageError};
use crate::field::{Field, FieldMut};
use crate::object::{ObjectAddress, ObjectRegistry, StoredObject, TypeTag, ADDRESS_SIZE};

use super::cursor::CursorState;

pub const INDEX_NODE_TAG: TypeTag = 3;

/// Payload size of every node.
pub const NODE_SIZE: usize = 7168;

pub const MAX_KEY_SIZE: usize = 1024;

/// Largest value a leaf entry may carry.
pub const MAX_VALUE_SIZE: usize = 2048;

const KIND: usize = 0;
const COUNT: usize = 1;
const USED: usize = 3;
const HEAP_LOW: usize = 5;
const PARENT: usize = 7;
const PREV: usize = 11;
const NEXT: usize = 15;
const HEADER_SIZE: usize = 19;
const DESCRIPTOR_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root = 1,
    Interior = 2,
    Leaf = 3,
}

impl NodeKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::Root),
            2 => Ok(NodeKind::Interior),
            3 => Ok(NodeKind::Leaf),
            other => Err(StorageError::Format(format!("unknown index node kind {other}"))),
        }
    }
}

pub type SharedCursor = Rc<RefCell<CursorState>>;

pub struct IndexNode {
    buf: Vec<u8>,
    cursors: Vec<Weak<RefCell<CursorState>>>,
}

impl IndexNode {
    pub fn new(kind: NodeKind, parent: ObjectAddress) -> Self {
        let mut node = Self {
            buf: vec![0u8; NODE_SIZE],
            cursors: Vec::new(),
        };
        let mut field = FieldMut::new(&mut node.buf);
        field.put_u8(KIND, kind as u8);
        field.put_u16(HEAP_LOW, NODE_SIZE as u16);
        node.set_parent(parent);
        node
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NODE_SIZE {
            return Err(StorageError::Format(format!(
                "index node must be {NODE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        NodeKind::from_u8(bytes[KIND])?;
        Ok(Self {
            buf: bytes.to_vec(),
            cursors: Vec::new(),
        })
    }

    pub fn register(registry: &mut ObjectRegistry) -> Result<()> {
        registry.register(INDEX_NODE_TAG, |bytes| {
            Ok(Box::new(IndexNode::from_bytes(bytes)?))
        })
    }

    fn field(&self) -> Field<'_> {
        Field::new(&self.buf)
    }

    fn field_mut(&mut self) -> FieldMut<'_> {
        FieldMut::new(&mut self.buf)
    }

    pub fn kind(&self) -> NodeKind {
        // Validated on construction.
        NodeKind::from_u8(self.buf[KIND]).unwrap_or(NodeKind::Leaf)
    }

    pub fn set_kind(&mut self, kind: NodeKind) {
        self.field_mut().put_u8(KIND, kind as u8);
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == NodeKind::Leaf
    }

    pub fn len(&self) -> usize {
        self.field().get_u16(COUNT) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn used(&self) -> usize {
        self.field().get_u16(USED) as usize
    }

    fn heap_low(&self) -> usize {
        self.field().get_u16(HEAP_LOW) as usize
    }

    fn address_at(&self, offset: usize) -> ObjectAddress {
        let field = self.field();
        ObjectAddress::new(field.get_u24(offset), field.get_u8(offset + 3))
    }

    fn set_address_at(&mut self, offset: usize, addr: ObjectAddress) {
        self.field_mut().put_bytes(offset, &addr.to_bytes());
    }

    /// Parent node, or the anchor when this is the root.
    pub fn parent(&self) -> ObjectAddress {
        self.address_at(PARENT)
    }

    pub fn set_parent(&mut self, parent: ObjectAddress) {
        self.set_address_at(PARENT, parent);
    }

    pub fn prev(&self) -> ObjectAddress {
        self.address_at(PREV)
    }

    pub fn set_prev(&mut self, prev: ObjectAddress) {
        self.set_address_at(PREV, prev);
    }

    pub fn next(&self) -> ObjectAddress {
        self.address_at(NEXT)
    }

    pub fn set_next(&mut self, next: ObjectAddress) {
        self.set_address_at(NEXT, next);
    }

    fn descriptor(&self, i: usize) -> (usize, usize, usize) {
        let field = self.field();
        let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
        (
            field.get_u16(at) as usize,
            field.get_u16(at + 2) as usize,
            field.get_u16(at + 4) as usize,
        )
    }

    fn set_descriptor(&mut self, i: usize, offset: usize, key_len: usize, value_len: usize) {
        let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
        let mut field = self.field_mut();
        field.put_u16(at, offset as u16);
        field.put_u16(at + 2, key_len as u16);
        field.put_u16(at + 4, value_len as u16);
    }

    pub fn key(&self, i: usize) -> &[u8] {
        let (offset, key_len, _) = self.descriptor(i);
        &self.buf[offset..offset + key_len]
    }

    pub fn value(&self, i: usize) -> &[u8] {
        let (offset, key_len, value_len) = self.descriptor(i);
        &self.buf[offset + key_len..offset + key_len + value_len]
    }

    /// Child address stored in routing entry `i`.
    pub fn child(&self, i: usize) -> Result<ObjectAddress> {
        ObjectAddress::from_bytes(self.value(i))
    }

    /// Index of the first entry whose key is `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.partition_point(|k| k < key)
    }

    /// Index of the first entry whose key is `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.partition_point(|k| k <= key)
    }

    fn partition_point(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.key(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Position of the routing entry that points at `child`.
    pub fn child_position(&self, child: ObjectAddress) -> Option<usize> {
        let wire = child.to_bytes();
        (0..self.len()).find(|i| self.value(*i) == wire)
    }

    /// Bytes available for new entries, counting space `compact` reclaims.
    pub fn free_space(&self) -> usize {
        NODE_SIZE - HEADER_SIZE - self.len() * DESCRIPTOR_SIZE - self.used()
    }

    /// Whether an entry of the given sizes fits without a split.
    pub fn has_room(&self, key_len: usize, value_len: usize, max_entries: Option<usize>) -> bool {
        if let Some(max) = max_entries {
            if self.len() >= max.max(2) {
                return false;
            }
        }
        self.free_space() >= key_len + value_len + DESCRIPTOR_SIZE
    }

    fn insert_raw(&mut self, i: usize, key: &[u8], value: &[u8]) {
        let count = self.len();
        debug_assert!(i <= count);
        let len = key.len() + value.len();
        let directory_end = HEADER_SIZE + (count + 1) * DESCRIPTOR_SIZE;
        if self.heap_low() < directory_end + len {
            self.compact();
        }

        let offset = self.heap_low() - len;
        let used = self.used() + len;
        let mut field = self.field_mut();
        field.put_bytes(offset, key);
        field.put_bytes(offset + key.len(), value);
        let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
        field.copy_within(at, at + DESCRIPTOR_SIZE, (count - i) * DESCRIPTOR_SIZE);
        field.put_u16(COUNT, (count + 1) as u16);
        field.put_u16(USED, used as u16);
        field.put_u16(HEAP_LOW, offset as u16);
        self.set_descriptor(i, offset, key.len(), value.len());
    }

    fn remove_raw(&mut self, i: usize) {
        let count = self.len();
        debug_assert!(i < count);
        let (offset, key_len, value_len) = self.descriptor(i);
        let len = key_len + value_len;
        let used = self.used() - len;
        let heap_low = if count == 1 {
            NODE_SIZE
        } else if offset == self.heap_low() {
            offset + len
        } else {
            self.heap_low()
        };

        let mut field = self.field_mut();
        field.clear(offset, len);
        let at = HEADER_SIZE + i * DESCRIPTOR_SIZE;
        field.copy_within(
            at + DESCRIPTOR_SIZE,
            at,
            (count - i - 1) * DESCRIPTOR_SIZE,
        );
        field.clear(HEADER_SIZE + (count - 1) * DESCRIPTOR_SIZE, DESCRIPTOR_SIZE);
        field.put_u16(COUNT, (count - 1) as u16);
        field.put_u16(USED, used as u16);
        field.put_u16(HEAP_LOW, heap_low as u16);
    }

    /// Rewrite the heap so live entries are packed against the end of the
    /// node, in entry order.
    pub fn compact(&mut self) {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..self.len())
            .map(|i| (self.key(i).to_vec(), self.value(i).to_vec()))
            .collect();
        let directory_end = HEADER_SIZE + entries.len() * DESCRIPTOR_SIZE;
        self.field_mut()
            .clear(directory_end, NODE_SIZE - directory_end);

        let mut heap_low = NODE_SIZE;
        for (i, (key, value)) in entries.iter().enumerate() {
            heap_low -= key.len() + value.len();
            let mut field = self.field_mut();
            field.put_bytes(heap_low, key);
            field.put_bytes(heap_low + key.len(), value);
            self.set_descriptor(i, heap_low, key.len(), value.len());
        }
        self.field_mut().put_u16(HEAP_LOW, heap_low as u16);
    }

    /// Replace the key of entry `i`. Returns false when the node lacks room.
    pub fn replace_key(&mut self, i: usize, key: &[u8]) -> bool {
        let (_, key_len, _) = self.descriptor(i);
        if key.len() > key_len && self.free_space() < key.len() - key_len {
            return false;
        }
        let value = self.value(i).to_vec();
        self.remove_raw(i);
        self.insert_raw(i, key, &value);
        true
    }

    /// Replace the value of entry `i`. Returns false when the node lacks room.
    pub fn replace_value(&mut self, i: usize, value: &[u8]) -> bool {
        let (_, _, value_len) = self.descriptor(i);
        if value.len() > value_len && self.free_space() < value.len() - value_len {
            return false;
        }
        let key = self.key(i).to_vec();
        self.remove_raw(i);
        self.insert_raw(i, &key, value);
        true
    }

    /// Insert an entry at `i`, shifting cursors at or after `i`.
    pub fn insert_entry(&mut self, i: usize, key: &[u8], value: &[u8]) {
        self.insert_raw(i, key, value);
        for cursor in self.live_cursors() {
            let mut state = cursor.borrow_mut();
            if state.index >= i {
                state.index += 1;
            }
        }
    }

    /// Remove entry `i`. Cursors after it shift down; cursors on it go stale,
    /// except `remover`, which stays valid on the following entry.
    pub fn remove_entry(&mut self, i: usize, remover: Option<&SharedCursor>) {
        self.remove_raw(i);
        for cursor in self.live_cursors() {
            let is_remover = remover.is_some_and(|r| Rc::ptr_eq(r, &cursor));
            let mut state = cursor.borrow_mut();
            if state.index > i {
                state.index -= 1;
            } else if state.index == i && !is_remover {
                state.stale = true;
            }
        }
    }

    /// Remove the upper half of the entries (by count) and the cursors on
    /// them. Cursors come back with their index in the moved run.
    pub fn take_upper_half(&mut self) -> (Vec<(Vec<u8>, Vec<u8>)>, Vec<(SharedCursor, usize)>) {
        let count = self.len();
        let mid = count / 2;
        let entries = (mid..count)
            .map(|i| (self.key(i).to_vec(), self.value(i).to_vec()))
            .collect();
        for i in (mid..count).rev() {
            self.remove_raw(i);
        }

        let mut moved = Vec::new();
        let mut kept = Vec::new();
        for cursor in self.live_cursors() {
            let index = cursor.borrow().index;
            if index >= mid {
                moved.push((cursor, index - mid));
            } else {
                kept.push(Rc::downgrade(&cursor));
            }
        }
        self.cursors = kept;
        (entries, moved)
    }

    /// Append entries after the last one.
    pub fn append_entries(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) {
        for (key, value) in entries {
            self.insert_raw(self.len(), key, value);
        }
    }

    pub fn register_cursor(&mut self, cursor: &SharedCursor) {
        self.cursors.retain(|c| c.strong_count() > 0);
        self.cursors.push(Rc::downgrade(cursor));
    }

    pub fn deregister_cursor(&mut self, cursor: &SharedCursor) {
        let target = Rc::downgrade(cursor);
        self.cursors
            .retain(|c| c.strong_count() > 0 && !Weak::ptr_eq(c, &target));
    }

    /// Number of live cursors positioned on this node.
    pub fn cursor_count(&self) -> usize {
        self.cursors.iter().filter(|c| c.strong_count() > 0).count()
    }

    /// Detach the cursors whose index ran past the last entry.
    pub fn take_cursors_past_end(&mut self) -> Vec<SharedCursor> {
        let count = self.len();
        let mut past = Vec::new();
        let mut kept = Vec::new();
        for cursor in self.live_cursors() {
            if cursor.borrow().index >= count {
                past.push(cursor);
            } else {
                kept.push(Rc::downgrade(&cursor));
            }
        }
        self.cursors = kept;
        past
    }

    pub fn take_all_cursors(&mut self) -> Vec<SharedCursor> {
        let cursors = self.live_cursors();
        self.cursors.clear();
        cursors
    }

    fn live_cursors(&self) -> Vec<SharedCursor> {
        self.cursors.iter().filter_map(Weak::upgrade).collect()
    }
}

impl StoredObject for IndexNode {
    fn type_tag(&self) -> TypeTag {
        INDEX_NODE_TAG
    }

    fn encoded_len(&self) -> usize {
        NODE_SIZE
    }

    fn dematerialize(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.buf);
    }

    /// Reload after a rollback. Cursors over a leaf whose bytes changed go
    /// stale; cursors whose entry no longer exists are unset.
    fn rematerialize(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        let Some(bytes) = bytes else {
            for cursor in self.take_all_cursors() {
                *cursor.borrow_mut() = CursorState::UNSET;
            }
            return Ok(());
        };
        if bytes == self.buf.as_slice() {
            return Ok(());
        }
        let reloaded = IndexNode::from_bytes(bytes)?;
        self.buf = reloaded.buf;

        let count = self.len();
        let leaf = self.is_leaf();
        let mut kept = Vec::new();
        for cursor in self.live_cursors() {
            let mut state = cursor.borrow_mut();
            if leaf && state.index < count {
                state.stale = true;
                kept.push(Rc::downgrade(&cursor));
            } else {
                *state = CursorState::UNSET;
            }
        }
        self.cursors = kept;
        Ok(())
    }

    fn is_pinned(&self) -> bool {
        self.cursors.iter().any(|c| c.strong_count() > 0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Wire form of a child pointer stored as a routing value.
pub fn child_value(child: ObjectAddress) -> [u8; ADDRESS_SIZE] {
    child.to_bytes()
}
