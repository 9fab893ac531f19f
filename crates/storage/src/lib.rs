//! Storage engine: paged file, object allocator, and B+tree indexes.
//!
//! This crate provides:
//! - A binary view codec over byte ranges (field)
//! - Fixed-size pages in one file with an LRU read cache and a side log for
//!   atomic commit (pager, wal)
//! - Variable-length objects inside pages, located through space maps
//!   (object, object_page, space_map, object_store)
//! - B+tree indexes with mutation-aware cursors (btree)

pub mod btree;
pub mod config;
pub mod error;
pub mod field;
pub mod header;
pub mod object;
pub mod object_page;
pub mod object_store;
pub mod pager;
pub mod space_map;
mod wal;

pub use btree::{Index, IndexCursor};
pub use config::StoreOptions;
pub use error::{ErrorKind, Result, StorageError};
pub use object::{BinaryObject, ObjectAddress, ObjectRegistry, StoredObject, TypeTag};
pub use object_store::{ObjectStore, ObjectView};
pub use pager::{PageNum, PageStore, PAGE_SIZE};
