//! Space map pages.
//!
//! The first page of every block of `BLOCK_PAGES` pages is a space map: one
//! byte per page of the block giving its free-space class. Class `c`
//! guarantees at least `SPACE_CLASS_BOUNDS[c]` bytes of payload can be
//! inserted into that page, so an allocation of `n` bytes only has to look
//! for a byte no greater than `required_class(n)`. A zeroed map byte is class
//! 0, which is exactly the state of a never-used page.

use crate::object_page::MAX_OBJECT_SIZE;
use crate::pager::{PageNum, PAGE_SIZE};

/// Pages covered by one space map, the map itself included.
pub const BLOCK_PAGES: usize = PAGE_SIZE;

/// Number of free-space classes.
pub const SPACE_CLASSES: usize = 16;

/// Guaranteed free payload bytes per class, strictly decreasing.
pub const SPACE_CLASS_BOUNDS: [usize; SPACE_CLASSES] = [
    MAX_OBJECT_SIZE,
    6912,
    6144,
    5376,
    4608,
    3840,
    3072,
    2304,
    1536,
    1024,
    512,
    256,
    128,
    64,
    32,
    0,
];

pub fn is_space_map_page(page_num: PageNum) -> bool {
    page_num as usize % BLOCK_PAGES == 0
}

/// Space map page responsible for `page_num`.
pub fn space_map_for(page_num: PageNum) -> PageNum {
    page_num - (page_num as usize % BLOCK_PAGES) as PageNum
}

/// Class describing a page with `free` bytes of insertable payload.
pub fn space_class(free: usize) -> u8 {
    SPACE_CLASS_BOUNDS
        .iter()
        .position(|bound| free >= *bound)
        .unwrap_or(SPACE_CLASSES - 1) as u8
}

/// Highest class that still guarantees room for `len` bytes, or `None` when
/// no page can hold it.
pub fn required_class(len: usize) -> Option<u8> {
    SPACE_CLASS_BOUNDS
        .iter()
        .rposition(|bound| *bound >= len)
        .map(|class| class as u8)
}

pub fn get_class(map: &[u8], page_num: PageNum) -> u8 {
    map[page_num as usize % BLOCK_PAGES]
}

pub fn set_class(map: &mut [u8], page_num: PageNum, class: u8) {
    debug_assert!(!is_space_map_page(page_num));
    map[page_num as usize % BLOCK_PAGES] = class;
}

/// First page of the block starting at `map_page` whose class is at most
/// `max_class`, considering only pages below `page_count`.
pub fn find_page(
    map: &[u8],
    map_page: PageNum,
    page_count: PageNum,
    max_class: u8,
) -> Option<PageNum> {
    let limit = (page_count.saturating_sub(map_page) as usize).min(BLOCK_PAGES);
    (1..limit)
        .find(|i| map[*i] <= max_class)
        .map(|i| map_page + i as PageNum)
}
