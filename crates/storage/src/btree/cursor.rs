//! Cursors over the entries of an index.
//!
//! A cursor is either unset or positioned on an entry of a leaf. Its state
//! is shared with that leaf, which shifts the cursor as entries are
//! inserted, removed or moved by a split. A cursor whose entry was removed
//! by someone else becomes stale: reading through it fails until it is moved
//! with `next` or `previous`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Result, StorageError};
use crate::object::ObjectAddress;
use crate::object_store::ObjectStore;

use super::node::{IndexNode, SharedCursor};
use super::{check_value_size, descend, read_node, remove_at, split, write_node, Index, Route};

/// Position of a cursor. An unset cursor has a null leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub leaf: ObjectAddress,
    pub index: usize,
    /// The entry at `index` replaced a removed one the cursor was on.
    pub stale: bool,
}

impl CursorState {
    pub const UNSET: CursorState = CursorState {
        leaf: ObjectAddress::NULL,
        index: 0,
        stale: false,
    };

    pub fn is_set(&self) -> bool {
        !self.leaf.is_null()
    }
}

pub struct IndexCursor {
    index: Index,
    state: SharedCursor,
}

impl IndexCursor {
    pub(super) fn new(index: Index) -> Self {
        Self {
            index,
            state: Rc::new(RefCell::new(CursorState::UNSET)),
        }
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn position(&self) -> CursorState {
        *self.state.borrow()
    }

    pub fn is_set(&self) -> bool {
        self.position().is_set()
    }

    /// True once the cursor has run off either end of the index.
    pub fn is_at_end(&self) -> bool {
        !self.is_set()
    }

    pub fn is_stale(&self) -> bool {
        self.position().stale
    }

    /// Whether the cursor is on the first entry of the index.
    pub fn is_at_beginning(&self, store: &mut ObjectStore) -> Result<bool> {
        let state = self.position();
        if !state.is_set() || state.index != 0 {
            return Ok(false);
        }
        Ok(read_node(store, state.leaf, IndexNode::prev)?.is_null())
    }

    /// Position on the first entry with a key `>= key`. Returns whether such
    /// an entry exists.
    pub fn find(&mut self, store: &mut ObjectStore, key: &[u8]) -> Result<bool> {
        let root = self.index.root(store)?;
        if root.is_null() {
            return self.move_to(store, ObjectAddress::NULL, 0);
        }
        let leaf = descend(store, root, Route::Lower(key))?;
        let (i, len, next) = read_node(store, leaf, |n| (n.lower_bound(key), n.len(), n.next()))?;
        if i < len {
            self.move_to(store, leaf, i)
        } else {
            self.move_to(store, next, 0)
        }
    }

    pub fn find_first_entry(&mut self, store: &mut ObjectStore) -> Result<bool> {
        let root = self.index.root(store)?;
        if root.is_null() {
            return self.move_to(store, ObjectAddress::NULL, 0);
        }
        let leaf = descend(store, root, Route::First)?;
        self.move_to(store, leaf, 0)
    }

    pub fn find_last_entry(&mut self, store: &mut ObjectStore) -> Result<bool> {
        let root = self.index.root(store)?;
        if root.is_null() {
            return self.move_to(store, ObjectAddress::NULL, 0);
        }
        let leaf = descend(store, root, Route::Last)?;
        let len = read_node(store, leaf, IndexNode::len)?;
        self.move_to(store, leaf, len.saturating_sub(1))
    }

    /// Advance to the following entry. A stale cursor only clears its flag,
    /// since it already sits on the entry after the removed one.
    pub fn next(&mut self, store: &mut ObjectStore) -> Result<bool> {
        let state = self.position();
        if !state.is_set() {
            return Ok(false);
        }
        if state.stale {
            self.state.borrow_mut().stale = false;
            return Ok(true);
        }
        let (len, next) = read_node(store, state.leaf, |n| (n.len(), n.next()))?;
        if state.index + 1 < len {
            self.state.borrow_mut().index += 1;
            return Ok(true);
        }
        self.move_to(store, next, 0)
    }

    /// Step back to the preceding entry.
    pub fn previous(&mut self, store: &mut ObjectStore) -> Result<bool> {
        let state = self.position();
        if !state.is_set() {
            return Ok(false);
        }
        if state.index > 0 {
            let mut current = self.state.borrow_mut();
            current.index -= 1;
            current.stale = false;
            return Ok(true);
        }
        let prev = read_node(store, state.leaf, IndexNode::prev)?;
        if prev.is_null() {
            return self.move_to(store, prev, 0);
        }
        let len = read_node(store, prev, IndexNode::len)?;
        self.move_to(store, prev, len.saturating_sub(1))
    }

    pub fn key(&self, store: &mut ObjectStore) -> Result<Vec<u8>> {
        let state = self.current()?;
        read_node(store, state.leaf, |n| n.key(state.index).to_vec())
    }

    pub fn value(&self, store: &mut ObjectStore) -> Result<Vec<u8>> {
        let state = self.current()?;
        read_node(store, state.leaf, |n| n.value(state.index).to_vec())
    }

    /// Whether the cursor is on an entry whose key equals `key`.
    pub fn key_equals(&self, store: &mut ObjectStore, key: &[u8]) -> Result<bool> {
        if !self.is_set() {
            return Ok(false);
        }
        let state = self.current()?;
        read_node(store, state.leaf, |n| n.key(state.index) == key)
    }

    /// Whether the cursor is on an entry whose key starts with `prefix`.
    pub fn key_matches(&self, store: &mut ObjectStore, prefix: &[u8]) -> Result<bool> {
        if !self.is_set() {
            return Ok(false);
        }
        let state = self.current()?;
        read_node(store, state.leaf, |n| n.key(state.index).starts_with(prefix))
    }

    /// Replace the value under the cursor, splitting the leaf if the new
    /// value does not fit.
    pub fn update_value(&mut self, store: &mut ObjectStore, value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        loop {
            // A split may move this cursor to the new sibling.
            let state = self.current()?;
            let fits = read_node(store, state.leaf, |n| {
                let current = n.value(state.index).len();
                value.len() <= current || n.free_space() >= value.len() - current
            })?;
            if fits {
                if !write_node(store, state.leaf, |n| n.replace_value(state.index, value))? {
                    return Err(StorageError::Capacity(format!(
                        "value of {} bytes does not fit in leaf {}",
                        value.len(),
                        state.leaf
                    )));
                }
                return Ok(());
            }
            split(store, self.index, state.leaf)?;
        }
    }

    /// Remove the entry under the cursor. The cursor moves to the following
    /// entry, or becomes unset if there is none.
    pub fn remove(&mut self, store: &mut ObjectStore) -> Result<()> {
        let state = self.current()?;
        remove_at(store, self.index, state.leaf, state.index, Some(&self.state))
    }

    /// Unset the cursor and detach it from its leaf.
    pub fn close(&mut self, store: &mut ObjectStore) -> Result<()> {
        self.move_to(store, ObjectAddress::NULL, 0).map(|_| ())
    }

    fn current(&self) -> Result<CursorState> {
        let state = self.position();
        if !state.is_set() {
            return Err(StorageError::NotFound(
                "cursor is not positioned on an entry".into(),
            ));
        }
        if state.stale {
            return Err(StorageError::Concurrency(format!(
                "entry under the cursor at {}[{}] was removed",
                state.leaf, state.index
            )));
        }
        Ok(state)
    }

    /// Reposition on `leaf`, moving the registration if the leaf changes.
    fn move_to(&mut self, store: &mut ObjectStore, leaf: ObjectAddress, index: usize) -> Result<bool> {
        let current = self.position();
        if current.leaf != leaf {
            if current.is_set() {
                let state = Rc::clone(&self.state);
                store.with_object_ephemeral::<IndexNode, _>(current.leaf, |n| {
                    n.deregister_cursor(&state)
                })?;
            }
            if !leaf.is_null() {
                let state = Rc::clone(&self.state);
                store.with_object_ephemeral::<IndexNode, _>(leaf, |n| n.register_cursor(&state))?;
            }
        }
        *self.state.borrow_mut() = if leaf.is_null() {
            CursorState::UNSET
        } else {
            CursorState {
                leaf,
                index,
                stale: false,
            }
        };
        Ok(!leaf.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{register_types, MAX_VALUE_SIZE};
    use crate::config::StoreOptions;
    use crate::object::ObjectRegistry;
    use crate::pager::PageStore;

    fn open_store(dir: &tempfile::TempDir) -> ObjectStore {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = ObjectRegistry::new();
        register_types(&mut registry).unwrap();
        let options = StoreOptions::default().with_max_node_entries(3);
        let pages = PageStore::open_with_options(dir.path().join("cursor.db"), options).unwrap();
        ObjectStore::open(pages, registry).unwrap()
    }

    fn filled(store: &mut ObjectStore, keys: &[&str]) -> Index {
        let index = Index::create(store).unwrap();
        for key in keys {
            index.insert(store, key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        index
    }

    fn key_str(cursor: &IndexCursor, store: &mut ObjectStore) -> String {
        String::from_utf8(cursor.key(store).unwrap()).unwrap()
    }

    #[test]
    fn forward_and_reverse_scans_mirror_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let keys = ["d", "b", "f", "a", "c", "e", "g", "h"];
        let index = filled(&mut store, &keys);

        let mut cursor = index.open();
        let mut forward = Vec::new();
        cursor.find_first_entry(&mut store).unwrap();
        assert!(cursor.is_at_beginning(&mut store).unwrap());
        while !cursor.is_at_end() {
            forward.push(key_str(&cursor, &mut store));
            cursor.next(&mut store).unwrap();
        }

        let mut backward = Vec::new();
        cursor.find_last_entry(&mut store).unwrap();
        while cursor.is_set() {
            backward.push(key_str(&cursor, &mut store));
            cursor.previous(&mut store).unwrap();
        }
        backward.reverse();

        assert_eq!(forward, ["a", "b", "c", "d", "e", "f", "g", "h"]);
        assert_eq!(forward, backward);
        cursor.close(&mut store).unwrap();
    }

    #[test]
    fn find_lands_on_first_key_not_below_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["b", "d", "f", "h", "j"]);
        let mut cursor = index.open();

        assert!(cursor.find(&mut store, b"e").unwrap());
        assert_eq!(key_str(&cursor, &mut store), "f");
        assert!(!cursor.key_equals(&mut store, b"e").unwrap());
        assert!(cursor.find(&mut store, b"a").unwrap());
        assert!(cursor.is_at_beginning(&mut store).unwrap());
        assert!(!cursor.find(&mut store, b"k").unwrap());
        assert!(cursor.is_at_end());
        assert!(matches!(cursor.key(&mut store), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn cursors_on_one_leaf_survive_a_removal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a", "b", "c"]);

        let mut a = index.open();
        let mut b = index.open();
        a.find(&mut store, b"a").unwrap();
        b.find(&mut store, b"c").unwrap();
        assert_eq!(a.position().leaf, b.position().leaf);

        a.remove(&mut store).unwrap();
        assert_eq!(key_str(&a, &mut store), "b");
        assert_eq!(key_str(&b, &mut store), "c");
        assert_eq!(b.value(&mut store).unwrap(), b"C");
        index.check(&mut store).unwrap();
    }

    #[test]
    fn other_cursors_on_a_removed_entry_go_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a", "b", "c"]);

        let mut remover = index.open();
        let mut watcher = index.open();
        remover.find(&mut store, b"b").unwrap();
        watcher.find(&mut store, b"b").unwrap();
        remover.remove(&mut store).unwrap();

        assert!(watcher.is_stale());
        assert!(matches!(
            watcher.value(&mut store),
            Err(StorageError::Concurrency(_))
        ));
        assert!(watcher.remove(&mut store).is_err());

        // next clears the flag onto the entry that followed "b".
        assert!(watcher.next(&mut store).unwrap());
        assert_eq!(key_str(&watcher, &mut store), "c");

        // previous clears it onto the entry before the removed one.
        index.insert(&mut store, b"b", b"B").unwrap();
        watcher.find(&mut store, b"b").unwrap();
        remover.find(&mut store, b"b").unwrap();
        remover.remove(&mut store).unwrap();
        assert!(watcher.is_stale());
        assert!(watcher.previous(&mut store).unwrap());
        assert_eq!(key_str(&watcher, &mut store), "a");
    }

    #[test]
    fn cursors_follow_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a", "b", "c"]);

        let mut on_c = index.open();
        on_c.find(&mut store, b"c").unwrap();
        let before = on_c.position().leaf;
        index.insert(&mut store, b"bb", b"BB").unwrap();

        assert_ne!(on_c.position().leaf, before);
        assert_eq!(key_str(&on_c, &mut store), "c");
        on_c.previous(&mut store).unwrap();
        assert_eq!(key_str(&on_c, &mut store), "bb");
    }

    #[test]
    fn cursors_move_off_deleted_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a", "b", "c", "d", "e", "f"]);

        let mut cursor = index.open();
        cursor.find(&mut store, b"a").unwrap();
        // Emptying the first leaf carries the cursor into the next one.
        while cursor.key_matches(&mut store, b"a").unwrap()
            || cursor.key_matches(&mut store, b"b").unwrap()
        {
            cursor.remove(&mut store).unwrap();
        }
        assert!(cursor.is_set());
        assert_eq!(key_str(&cursor, &mut store), "c");
        assert!(cursor.is_at_beginning(&mut store).unwrap());

        cursor.find_last_entry(&mut store).unwrap();
        cursor.remove(&mut store).unwrap();
        assert!(cursor.is_at_end());
        index.check(&mut store).unwrap();
    }

    #[test]
    fn update_value_grows_in_place_or_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a"]);

        let mut cursor = index.open();
        cursor.find(&mut store, b"a").unwrap();
        cursor.update_value(&mut store, b"bigger value").unwrap();
        assert_eq!(index.get(&mut store, b"a").unwrap(), Some(b"bigger value".to_vec()));

        let huge = vec![7u8; MAX_VALUE_SIZE];
        for prefix in [b'b', b'c'] {
            index.insert(&mut store, &[prefix; 1000], &huge).unwrap();
        }
        assert_eq!(index.number_of_nodes(&mut store).unwrap(), 2);

        // The leaf is out of bytes: growing "a" splits it into [a] and [b, c].
        cursor.find(&mut store, b"a").unwrap();
        cursor.update_value(&mut store, &huge).unwrap();
        assert_eq!(index.number_of_nodes(&mut store).unwrap(), 3);
        assert_eq!(cursor.value(&mut store).unwrap(), huge);
        index.check(&mut store).unwrap();
    }

    #[test]
    fn rollback_leaves_cursors_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        let index = filled(&mut store, &["a", "b"]);
        store.commit().unwrap();

        let mut cursor = index.open();
        cursor.find(&mut store, b"a").unwrap();
        cursor.update_value(&mut store, b"changed").unwrap();
        store.rollback().unwrap();

        assert!(cursor.is_stale());
        assert!(cursor.next(&mut store).unwrap());
        assert_eq!(cursor.value(&mut store).unwrap(), b"A");
        cursor.close(&mut store).unwrap();
        assert_eq!(store.held_objects(), 0);
    }
}
