//! B+tree indexes over byte-string keys, stored as objects.
//!
//! An index is an [`IndexAnchor`] pointing at a Root node. Routing nodes
//! (Root and Interior) map the lowest key reachable under each child to the
//! child's address; leaves hold the entries and form a doubly linked list.
//! Duplicate keys are allowed and keep their insertion order.
//!
//! Nodes split when an insert finds no room, moving the upper half of their
//! entries to a new right sibling. Removing the last entry of a node deletes
//! it, and the deletion cascades upward through emptied ancestors. Underfull
//! nodes are never merged.
//!
//! All operations take the [`ObjectStore`] explicitly; an [`Index`] is just
//! the address of its anchor.

mod anchor;
mod cursor;
mod node;

pub use anchor::{IndexAnchor, ANCHOR_SIZE, INDEX_ANCHOR_TAG};
pub use cursor::{CursorState, IndexCursor};
pub use node::{IndexNode, NodeKind, INDEX_NODE_TAG, MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_SIZE};

use log::{debug, trace};

use crate::error::{Result, StorageError};
use crate::object::{ObjectAddress, ObjectRegistry, ADDRESS_SIZE};
use crate::object_store::ObjectStore;

use node::{child_value, SharedCursor};

/// Register the index object types with a registry.
pub fn register_types(registry: &mut ObjectRegistry) -> Result<()> {
    IndexAnchor::register(registry)?;
    IndexNode::register(registry)
}

/// Handle of one B+tree, identified by the address of its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    anchor: ObjectAddress,
}

impl Index {
    /// Create an empty index.
    pub fn create(store: &mut ObjectStore) -> Result<Self> {
        let anchor = store.insert_object(&IndexAnchor::new())?;
        debug!("created index {anchor}");
        Ok(Self { anchor })
    }

    /// Handle of an existing index.
    pub fn at(anchor: ObjectAddress) -> Self {
        Self { anchor }
    }

    pub fn anchor(&self) -> ObjectAddress {
        self.anchor
    }

    pub(crate) fn root(&self, store: &mut ObjectStore) -> Result<ObjectAddress> {
        store.with_object::<IndexAnchor, _>(self.anchor, IndexAnchor::root)
    }

    /// Insert an entry after any entries with an equal key.
    pub fn insert(&self, store: &mut ObjectStore, key: &[u8], value: &[u8]) -> Result<()> {
        check_sizes(key, value)?;
        if self.root(store)?.is_null() {
            return self.create_first(store, key, value);
        }

        let max_entries = store.options().max_node_entries;
        loop {
            let root = self.root(store)?;
            let leaf = descend(store, root, Route::Upper(key))?;
            let (room, i) = read_node(store, leaf, |n| {
                (n.has_room(key.len(), value.len(), max_entries), n.upper_bound(key))
            })?;
            if !room {
                split(store, *self, leaf)?;
                continue;
            }

            write_node(store, leaf, |n| n.insert_entry(i, key, value))?;
            self.add_entries(store, 1)?;
            if i == 0 {
                propagate_low_key(store, *self, leaf)?;
            }
            trace!("index {}: inserted into leaf {leaf} at {i}", self.anchor);
            return Ok(());
        }
    }

    /// The first Root always routes to a single Leaf.
    fn create_first(&self, store: &mut ObjectStore, key: &[u8], value: &[u8]) -> Result<()> {
        let mut leaf = IndexNode::new(NodeKind::Leaf, ObjectAddress::NULL);
        leaf.insert_entry(0, key, value);
        let leaf_addr = store.insert_object(&leaf)?;

        let mut root = IndexNode::new(NodeKind::Root, self.anchor);
        root.insert_entry(0, key, &child_value(leaf_addr));
        let root_addr = store.insert_object(&root)?;

        write_node(store, leaf_addr, |n| n.set_parent(root_addr))?;
        store.with_object_mut::<IndexAnchor, _>(self.anchor, |a| {
            a.set_root(root_addr);
            a.set_entries(1);
        })
    }

    /// Value of the first entry with `key`.
    pub fn get(&self, store: &mut ObjectStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.open();
        let found = if cursor.find(store, key)? && cursor.key_equals(store, key)? {
            Some(cursor.value(store)?)
        } else {
            None
        };
        cursor.close(store)?;
        Ok(found)
    }

    /// An unpositioned cursor over this index.
    pub fn open(&self) -> IndexCursor {
        IndexCursor::new(*self)
    }

    /// Remove every entry whose key equals `key`. Returns the number removed.
    pub fn remove_all_equal(&self, store: &mut ObjectStore, key: &[u8]) -> Result<usize> {
        let mut cursor = self.open();
        let mut removed = 0;
        cursor.find(store, key)?;
        while cursor.key_equals(store, key)? {
            cursor.remove(store)?;
            removed += 1;
        }
        cursor.close(store)?;
        Ok(removed)
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn remove_all_matching(&self, store: &mut ObjectStore, prefix: &[u8]) -> Result<usize> {
        let mut cursor = self.open();
        let mut removed = 0;
        cursor.find(store, prefix)?;
        while cursor.key_matches(store, prefix)? {
            cursor.remove(store)?;
            removed += 1;
        }
        cursor.close(store)?;
        Ok(removed)
    }

    /// Remove every entry, leaving an empty index.
    pub fn remove_all(&self, store: &mut ObjectStore) -> Result<usize> {
        let mut cursor = self.open();
        let mut removed = 0;
        cursor.find_first_entry(store)?;
        while cursor.is_set() {
            cursor.remove(store)?;
            removed += 1;
        }
        cursor.close(store)?;
        Ok(removed)
    }

    pub fn number_of_entries(&self, store: &mut ObjectStore) -> Result<usize> {
        store.with_object::<IndexAnchor, _>(self.anchor, |a| a.entries() as usize)
    }

    pub fn number_of_nodes(&self, store: &mut ObjectStore) -> Result<usize> {
        let root = self.root(store)?;
        Ok(collect_nodes(store, root)?.len())
    }

    /// Delete every node and the anchor. Fails while a cursor is open on
    /// any leaf.
    pub fn destroy(self, store: &mut ObjectStore) -> Result<()> {
        let root = self.root(store)?;
        let nodes = collect_nodes(store, root)?;
        if let Some(busy) = nodes.iter().find(|n| store.is_in_use(**n)) {
            return Err(StorageError::Concurrency(format!(
                "index {} still has cursors on node {busy}",
                self.anchor
            )));
        }
        for node in &nodes {
            store.remove_object(*node)?;
        }
        store.remove_object(self.anchor)?;
        debug!("destroyed index {} ({} nodes)", self.anchor, nodes.len());
        Ok(())
    }

    /// Verify the structural invariants of the tree.
    pub fn check(&self, store: &mut ObjectStore) -> Result<()> {
        let (root, entries) =
            store.with_object::<IndexAnchor, _>(self.anchor, |a| (a.root(), a.entries()))?;
        if root.is_null() {
            return if entries == 0 {
                Ok(())
            } else {
                Err(corrupt(format!("empty index {} counts {entries} entries", self.anchor)))
            };
        }

        let (kind, parent) = read_node(store, root, |n| (n.kind(), n.parent()))?;
        if kind != NodeKind::Root || parent != self.anchor {
            return Err(corrupt(format!(
                "root {root} is {kind:?} with parent {parent}"
            )));
        }

        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(addr) = stack.pop() {
            let (is_leaf, keys, children) = read_node(store, addr, |n| {
                let keys: Vec<Vec<u8>> = (0..n.len()).map(|i| n.key(i).to_vec()).collect();
                let children = if n.is_leaf() {
                    Ok(Vec::new())
                } else {
                    (0..n.len()).map(|i| n.child(i)).collect::<Result<Vec<_>>>()
                };
                (n.is_leaf(), keys, children)
            })?;
            let children = children?;
            if keys.is_empty() {
                return Err(corrupt(format!("node {addr} is empty")));
            }
            if keys.windows(2).any(|w| w[0] > w[1]) {
                return Err(corrupt(format!("node {addr} is out of order")));
            }
            if is_leaf {
                leaves.push((addr, keys));
                continue;
            }
            for (child, key) in children.iter().zip(&keys) {
                let (kind, parent, low) =
                    read_node(store, *child, |n| (n.kind(), n.parent(), n.key(0).to_vec()))?;
                if kind == NodeKind::Root || parent != addr {
                    return Err(corrupt(format!(
                        "child {child} of {addr} is {kind:?} with parent {parent}"
                    )));
                }
                if low != *key {
                    return Err(corrupt(format!(
                        "routing key for {child} in {addr} is not its low key"
                    )));
                }
            }
            // Depth first, leftmost child on top of the stack.
            stack.extend(children.iter().rev());
        }

        let mut prev = ObjectAddress::NULL;
        let mut last_key: Option<Vec<u8>> = None;
        let mut total = 0;
        for (i, (leaf, keys)) in leaves.iter().enumerate() {
            let (leaf_prev, leaf_next) = read_node(store, *leaf, |n| (n.prev(), n.next()))?;
            let expected_next = leaves.get(i + 1).map_or(ObjectAddress::NULL, |(l, _)| *l);
            if leaf_prev != prev || leaf_next != expected_next {
                return Err(corrupt(format!("leaf {leaf} is mislinked")));
            }
            if last_key.as_ref().is_some_and(|k| *k > keys[0]) {
                return Err(corrupt(format!("leaf {leaf} starts below its predecessor")));
            }
            last_key = keys.last().cloned();
            total += keys.len();
            prev = *leaf;
        }
        if total != entries as usize {
            return Err(corrupt(format!(
                "index {} counts {entries} entries but holds {total}",
                self.anchor
            )));
        }
        Ok(())
    }

    fn add_entries(&self, store: &mut ObjectStore, delta: i32) -> Result<()> {
        store.with_object_mut::<IndexAnchor, _>(self.anchor, |a| {
            a.set_entries(a.entries().saturating_add_signed(delta));
        })
    }
}

fn check_sizes(key: &[u8], value: &[u8]) -> Result<()> {
    check_key_size(key)?;
    check_value_size(value)
}

/// Fails with `Capacity` when `key` is too long to be stored in any index.
pub fn check_key_size(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(StorageError::Capacity(format!(
            "key of {} bytes exceeds the maximum of {MAX_KEY_SIZE}",
            key.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_value_size(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(StorageError::Capacity(format!(
            "value of {} bytes exceeds the maximum of {MAX_VALUE_SIZE}",
            value.len()
        )));
    }
    Ok(())
}

fn corrupt(message: String) -> StorageError {
    StorageError::Format(message)
}

pub(crate) fn read_node<R>(
    store: &mut ObjectStore,
    addr: ObjectAddress,
    f: impl FnOnce(&IndexNode) -> R,
) -> Result<R> {
    store.with_object::<IndexNode, _>(addr, f)
}

pub(crate) fn write_node<R>(
    store: &mut ObjectStore,
    addr: ObjectAddress,
    f: impl FnOnce(&mut IndexNode) -> R,
) -> Result<R> {
    store.with_object_mut::<IndexNode, _>(addr, f)
}

/// How a descent picks the child at each routing node.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Route<'k> {
    /// Towards the first entry `>= key`.
    Lower(&'k [u8]),
    /// Towards the first entry `> key`.
    Upper(&'k [u8]),
    First,
    Last,
}

/// Walk from `root` to a leaf.
pub(crate) fn descend(
    store: &mut ObjectStore,
    root: ObjectAddress,
    route: Route<'_>,
) -> Result<ObjectAddress> {
    let mut addr = root;
    loop {
        let step = read_node(store, addr, |n| {
            if n.is_leaf() {
                return Ok(None);
            }
            if n.is_empty() {
                return Err(corrupt(format!("routing node {addr} is empty")));
            }
            let i = match route {
                Route::Lower(key) => n.lower_bound(key).saturating_sub(1),
                Route::Upper(key) => n.upper_bound(key).saturating_sub(1),
                Route::First => 0,
                Route::Last => n.len() - 1,
            };
            n.child(i).map(Some)
        })??;
        match step {
            Some(child) => addr = child,
            None => return Ok(addr),
        }
    }
}

/// Every node reachable from `root`, parents before children.
fn collect_nodes(store: &mut ObjectStore, root: ObjectAddress) -> Result<Vec<ObjectAddress>> {
    let mut nodes = Vec::new();
    if root.is_null() {
        return Ok(nodes);
    }
    let mut stack = vec![root];
    while let Some(addr) = stack.pop() {
        nodes.push(addr);
        let children = read_node(store, addr, |n| {
            if n.is_leaf() {
                Ok(Vec::new())
            } else {
                (0..n.len()).map(|i| n.child(i)).collect::<Result<Vec<_>>>()
            }
        })??;
        stack.extend(children);
    }
    Ok(nodes)
}

/// Position `cursors` on `leaf` at the given indexes, or unset them when
/// `leaf` is null. The stale flag is kept.
pub(crate) fn place_cursors(
    store: &mut ObjectStore,
    leaf: ObjectAddress,
    cursors: Vec<(SharedCursor, usize)>,
) -> Result<()> {
    if cursors.is_empty() {
        return Ok(());
    }
    if leaf.is_null() {
        for (cursor, _) in cursors {
            *cursor.borrow_mut() = CursorState::UNSET;
        }
        return Ok(());
    }
    store.with_object_ephemeral::<IndexNode, _>(leaf, |n| {
        for (cursor, index) in &cursors {
            {
                let mut state = cursor.borrow_mut();
                state.leaf = leaf;
                state.index = *index;
            }
            n.register_cursor(cursor);
        }
    })
}

/// Split `node`, which must hold at least two entries.
fn split(store: &mut ObjectStore, index: Index, node: ObjectAddress) -> Result<()> {
    let (kind, count, mut parent, low) = read_node(store, node, |n| {
        let low = if n.is_empty() { Vec::new() } else { n.key(0).to_vec() };
        (n.kind(), n.len(), n.parent(), low)
    })?;
    if count < 2 {
        return Err(StorageError::Capacity(format!(
            "node {node} has {count} entries and cannot split"
        )));
    }

    if kind == NodeKind::Root {
        let mut new_root = IndexNode::new(NodeKind::Root, index.anchor);
        new_root.insert_entry(0, &low, &child_value(node));
        let root_addr = store.insert_object(&new_root)?;
        write_node(store, node, |n| {
            n.set_kind(NodeKind::Interior);
            n.set_parent(root_addr);
        })?;
        store.with_object_mut::<IndexAnchor, _>(index.anchor, |a| a.set_root(root_addr))?;
        debug!("index {}: new root {root_addr} above {node}", index.anchor);
        parent = root_addr;
    }

    let is_leaf = kind == NodeKind::Leaf;
    let (entries, moved, old_next) = write_node(store, node, |n| {
        let (entries, moved) = n.take_upper_half();
        (entries, moved, n.next())
    })?;
    let sibling_low = entries
        .first()
        .map(|(key, _)| key.clone())
        .ok_or_else(|| corrupt(format!("split of {node} moved no entries")))?;

    let mut sibling = IndexNode::new(
        if is_leaf { NodeKind::Leaf } else { NodeKind::Interior },
        parent,
    );
    if is_leaf {
        sibling.set_prev(node);
        sibling.set_next(old_next);
    }
    sibling.append_entries(&entries);
    let sibling_addr = store.insert_object(&sibling)?;

    if is_leaf {
        write_node(store, node, |n| n.set_next(sibling_addr))?;
        if !old_next.is_null() {
            write_node(store, old_next, |n| n.set_prev(sibling_addr))?;
        }
        place_cursors(store, sibling_addr, moved)?;
    } else {
        for (_, value) in &entries {
            let child = ObjectAddress::from_bytes(value)?;
            write_node(store, child, |n| n.set_parent(sibling_addr))?;
        }
    }
    trace!(
        "index {}: split {node}, {} entries moved to {sibling_addr}",
        index.anchor,
        entries.len()
    );

    insert_routing_after(store, index, node, &sibling_low, sibling_addr)
}

/// Add a routing entry for `sibling` right after the one for `node`,
/// splitting the parent first when it is full.
fn insert_routing_after(
    store: &mut ObjectStore,
    index: Index,
    node: ObjectAddress,
    key: &[u8],
    sibling: ObjectAddress,
) -> Result<()> {
    let max_entries = store.options().max_node_entries;
    loop {
        // A parent split may have moved `node`.
        let parent = read_node(store, node, IndexNode::parent)?;
        let (position, room) = read_node(store, parent, |p| {
            p.child_position(node)
                .map(|pos| (pos + 1, p.has_room(key.len(), ADDRESS_SIZE, max_entries)))
        })?
        .ok_or_else(|| corrupt(format!("node {node} is missing from parent {parent}")))?;

        if room {
            write_node(store, parent, |p| {
                p.insert_entry(position, key, &child_value(sibling))
            })?;
            return write_node(store, sibling, |n| n.set_parent(parent));
        }
        split(store, index, parent)?;
    }
}

/// Re-establish the low-key invariant above `node` after its first entry
/// changed.
fn propagate_low_key(store: &mut ObjectStore, index: Index, node: ObjectAddress) -> Result<()> {
    let mut node = node;
    loop {
        let (kind, parent, low) =
            read_node(store, node, |n| (n.kind(), n.parent(), n.key(0).to_vec()))?;
        if kind == NodeKind::Root {
            return Ok(());
        }
        let (position, unchanged) = read_node(store, parent, |p| {
            p.child_position(node).map(|pos| (pos, p.key(pos) == low.as_slice()))
        })?
        .ok_or_else(|| corrupt(format!("node {node} is missing from parent {parent}")))?;
        if unchanged {
            return Ok(());
        }

        if !write_node(store, parent, |p| p.replace_key(position, &low))? {
            split(store, index, parent)?;
            continue;
        }
        if position != 0 {
            return Ok(());
        }
        node = parent;
    }
}

/// Remove entry `i` of `leaf`. `remover` is the cursor doing the removal,
/// which stays valid on the following entry.
pub(crate) fn remove_at(
    store: &mut ObjectStore,
    index: Index,
    leaf: ObjectAddress,
    i: usize,
    remover: Option<&SharedCursor>,
) -> Result<()> {
    let (remaining, past_end, next) = write_node(store, leaf, |n| {
        n.remove_entry(i, remover);
        (n.len(), n.take_cursors_past_end(), n.next())
    })?;
    index.add_entries(store, -1)?;

    if remaining == 0 {
        return delete_node(store, index, leaf, past_end);
    }
    place_cursors(store, next, past_end.into_iter().map(|c| (c, 0)).collect())?;
    if i == 0 {
        propagate_low_key(store, index, leaf)?;
    }
    Ok(())
}

/// Unlink and delete an empty node, then any ancestors it leaves empty.
/// Cursors on a deleted leaf move to the first entry of the next leaf.
fn delete_node(
    store: &mut ObjectStore,
    index: Index,
    node: ObjectAddress,
    mut cursors: Vec<SharedCursor>,
) -> Result<()> {
    let mut node = node;
    loop {
        let (kind, parent, prev, next, leftover) = write_node(store, node, |n| {
            (n.kind(), n.parent(), n.prev(), n.next(), n.take_all_cursors())
        })?;
        cursors.extend(leftover);

        if kind == NodeKind::Leaf {
            if !prev.is_null() {
                write_node(store, prev, |n| n.set_next(next))?;
            }
            if !next.is_null() {
                write_node(store, next, |n| n.set_prev(prev))?;
            }
            let moved = cursors.drain(..).map(|c| (c, 0)).collect();
            place_cursors(store, next, moved)?;
        }
        store.remove_object(node)?;
        trace!("index {}: deleted empty node {node}", index.anchor);

        if kind == NodeKind::Root {
            return store.with_object_mut::<IndexAnchor, _>(index.anchor, |a| {
                a.set_root(ObjectAddress::NULL)
            });
        }

        let (position, remaining) = write_node(store, parent, |p| {
            p.child_position(node).map(|pos| {
                p.remove_entry(pos, None);
                (pos, p.len())
            })
        })?
        .ok_or_else(|| corrupt(format!("node {node} is missing from parent {parent}")))?;

        if remaining == 0 {
            node = parent;
            continue;
        }
        if position == 0 {
            propagate_low_key(store, index, parent)?;
        }
        return Ok(());
    }
}
