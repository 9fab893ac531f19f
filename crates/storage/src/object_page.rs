//! Object page layout: a slot directory plus a compactable heap.
//!
//! ## Page Layout
//!
//! ```text
//! [0..2]     used_space: u16       bytes taken by live heap blocks
//! [2..4]     used_entries: u16     number of occupied slots
//! [4..6]     free_offset: u16      start of the free tail of the heap (0 = uninitialized)
//! [6..8]     slot_hint: u16        where the next free-slot search starts
//! [8..520]   directory: [u16; 256] heap offset per slot, 0 = free (slot 0 unused)
//! [520..]    heap of (ObjectHeader, payload) blocks
//! ```
//!
//! Removal clears a block in place; the heap is compacted only when a new
//! block does not fit in the free tail.

use std::ops::Range;

use crate::error::{Result, StorageError};
use crate::field::{Field, FieldMut};
use crate::object::{ObjectHeader, TypeTag, OBJECT_HEADER_SIZE};
use crate::pager::PAGE_SIZE;

const USED_SPACE: usize = 0;
const USED_ENTRIES: usize = 2;
const FREE_OFFSET: usize = 4;
const SLOT_HINT: usize = 6;
const DIRECTORY: usize = 8;

/// Number of directory slots, including the unused slot 0.
pub const SLOTS: usize = 256;

/// Largest usable object number.
pub const MAX_OBJECTS: usize = SLOTS - 1;

/// First byte of the heap.
pub const HEAP_START: usize = DIRECTORY + SLOTS * 2;

/// Largest payload that fits in an empty page.
pub const MAX_OBJECT_SIZE: usize = PAGE_SIZE - HEAP_START - OBJECT_HEADER_SIZE;

pub fn init(page: &mut [u8]) {
    page.fill(0);
    let mut field = FieldMut::new(page);
    field.put_u16(FREE_OFFSET, HEAP_START as u16);
    field.put_u16(SLOT_HINT, 1);
}

pub fn is_initialized(page: &[u8]) -> bool {
    Field::new(page).get_u16(FREE_OFFSET) != 0
}

pub fn used_space(page: &[u8]) -> usize {
    Field::new(page).get_u16(USED_SPACE) as usize
}

pub fn used_entries(page: &[u8]) -> usize {
    Field::new(page).get_u16(USED_ENTRIES) as usize
}

fn free_offset(page: &[u8]) -> usize {
    let offset = Field::new(page).get_u16(FREE_OFFSET) as usize;
    if offset == 0 {
        HEAP_START
    } else {
        offset
    }
}

fn slot_offset(page: &[u8], slot: u8) -> usize {
    Field::new(page).get_u16(DIRECTORY + slot as usize * 2) as usize
}

fn set_slot_offset(page: &mut [u8], slot: u8, offset: usize) {
    FieldMut::new(page).put_u16(DIRECTORY + slot as usize * 2, offset as u16);
}

/// Largest payload that can be inserted into this page right now,
/// counting space reclaimable by compaction.
pub fn free_space(page: &[u8]) -> usize {
    if used_entries(page) >= MAX_OBJECTS {
        return 0;
    }
    (PAGE_SIZE - HEAP_START)
        .saturating_sub(used_space(page))
        .saturating_sub(OBJECT_HEADER_SIZE)
}

/// Header and payload range of the object in `slot`.
pub fn read(page: &[u8], slot: u8) -> Result<(ObjectHeader, Range<usize>)> {
    if slot == 0 {
        return Err(StorageError::NotFound("object number 0 is never used".into()));
    }
    let offset = slot_offset(page, slot);
    if offset == 0 {
        return Err(StorageError::NotFound(format!("object slot {slot} is empty")));
    }
    if offset < HEAP_START || offset + OBJECT_HEADER_SIZE > PAGE_SIZE {
        return Err(StorageError::Format(format!(
            "object slot {slot} points outside the heap ({offset})"
        )));
    }
    let header = ObjectHeader::read(Field::new(page).sub(offset, OBJECT_HEADER_SIZE))?;
    let start = offset + OBJECT_HEADER_SIZE;
    let end = start + header.length as usize;
    if end > PAGE_SIZE {
        return Err(StorageError::Format(format!(
            "object slot {slot} overruns the page ({end} > {PAGE_SIZE})"
        )));
    }
    Ok((header, start..end))
}

/// Place a new object in the page and return its slot.
pub fn insert(page: &mut [u8], tag: TypeTag, payload: &[u8]) -> Result<u8> {
    if !is_initialized(page) {
        init(page);
    }
    if payload.len() > free_space(page) {
        return Err(StorageError::Capacity(format!(
            "object of {} bytes does not fit ({} free)",
            payload.len(),
            free_space(page)
        )));
    }

    let slot = find_free_slot(page)?;
    let needed = OBJECT_HEADER_SIZE + payload.len();
    if PAGE_SIZE - free_offset(page) < needed {
        compact(page);
    }

    let offset = free_offset(page);
    let mut field = FieldMut::new(page);
    ObjectHeader {
        tag,
        length: payload.len() as u16,
    }
    .write(field.sub_mut(offset, OBJECT_HEADER_SIZE));
    field.put_bytes(offset + OBJECT_HEADER_SIZE, payload);

    let used = field.get_u16(USED_SPACE) as usize + needed;
    let entries = field.get_u16(USED_ENTRIES) + 1;
    field.put_u16(USED_SPACE, used as u16);
    field.put_u16(USED_ENTRIES, entries);
    field.put_u16(FREE_OFFSET, (offset + needed) as u16);
    let next_hint = if slot as usize == MAX_OBJECTS { 1 } else { slot as u16 + 1 };
    field.put_u16(SLOT_HINT, next_hint);
    set_slot_offset(page, slot, offset);
    Ok(slot)
}

/// Overwrite an object in place. The payload length must not change.
pub fn update(page: &mut [u8], slot: u8, payload: &[u8]) -> Result<()> {
    let (header, range) = read(page, slot)?;
    if header.length as usize != payload.len() {
        return Err(StorageError::Format(format!(
            "unexpected object size: slot {slot} holds {} bytes, update has {}",
            header.length,
            payload.len()
        )));
    }
    page[range].copy_from_slice(payload);
    Ok(())
}

/// Clear the object in `slot`.
pub fn remove(page: &mut [u8], slot: u8) -> Result<()> {
    let (header, range) = read(page, slot)?;
    let offset = range.start - OBJECT_HEADER_SIZE;
    let block = OBJECT_HEADER_SIZE + header.length as usize;

    let mut field = FieldMut::new(page);
    field.clear(offset, block);
    let used = (field.get_u16(USED_SPACE) as usize).saturating_sub(block);
    let entries = field.get_u16(USED_ENTRIES).saturating_sub(1);
    field.put_u16(USED_SPACE, used as u16);
    field.put_u16(USED_ENTRIES, entries);
    if offset + block == free_offset(page) {
        FieldMut::new(page).put_u16(FREE_OFFSET, offset as u16);
    }
    set_slot_offset(page, slot, 0);
    Ok(())
}

/// Numbers of all occupied slots, ascending.
pub fn occupied_slots(page: &[u8]) -> Vec<u8> {
    (1..=MAX_OBJECTS as u8)
        .filter(|slot| slot_offset(page, *slot) != 0)
        .collect()
}

/// Move every live block to the start of the heap, in heap order.
pub fn compact(page: &mut [u8]) {
    let mut blocks: Vec<(u8, usize, usize)> = occupied_slots(page)
        .into_iter()
        .map(|slot| {
            let offset = slot_offset(page, slot);
            let length = Field::new(page).get_u16(offset + 2) as usize;
            (slot, offset, OBJECT_HEADER_SIZE + length)
        })
        .collect();
    blocks.sort_by_key(|(_, offset, _)| *offset);

    let mut next = HEAP_START;
    for (slot, offset, len) in blocks {
        if offset != next {
            FieldMut::new(page).copy_within(offset, next, len);
            set_slot_offset(page, slot, next);
        }
        next += len;
    }
    FieldMut::new(page).clear(next, PAGE_SIZE - next);
    FieldMut::new(page).put_u16(FREE_OFFSET, next as u16);
}

fn find_free_slot(page: &[u8]) -> Result<u8> {
    let hint = Field::new(page).get_u16(SLOT_HINT) as usize;
    let start = if (1..=MAX_OBJECTS).contains(&hint) { hint } else { 1 };
    (0..MAX_OBJECTS)
        .map(|step| (start - 1 + step) % MAX_OBJECTS + 1)
        .map(|slot| slot as u8)
        .find(|slot| slot_offset(page, *slot) == 0)
        .ok_or_else(|| StorageError::Capacity("object page has no free slot".into()))
}
