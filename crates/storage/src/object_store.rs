//! ObjectStore: variable-length objects allocated inside pages.
//!
//! Typed objects are materialized through the injected [`ObjectRegistry`]
//! when first acquired and stay in the held map while they are acquired,
//! pinned, or modified and not yet committed. Commit dematerializes every
//! modified object into its page before the page store commits.

use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, Range};

use log::{debug, trace, warn};

use crate::config::StoreOptions;
use crate::error::{Result, StorageError};
use crate::header::{self, OBJECT_STORE_AREA};
use crate::object::{ObjectAddress, ObjectRegistry, StoredObject, TypeTag};
use crate::object_page::{self, MAX_OBJECT_SIZE};
use crate::pager::{PageNum, PageStore};
use crate::space_map::{self, BLOCK_PAGES};

/// Format version stamped into metadata area 1.
pub const OBJECT_STORE_VERSION: u32 = 1;

struct Held {
    object: Box<dyn StoredObject>,
    refs: u32,
}

impl Held {
    fn in_use(&self) -> bool {
        self.refs > 0 || self.object.is_pinned()
    }
}

pub struct ObjectStore {
    pages: PageStore,
    registry: ObjectRegistry,
    held: HashMap<ObjectAddress, Held>,
    /// Held objects to dematerialize at the next commit.
    dirty: BTreeSet<ObjectAddress>,
}

/// Payload bytes of an object borrowed straight from its page buffer.
///
/// The page stays acquired until the view is dropped.
pub struct ObjectView<'a> {
    pages: &'a mut PageStore,
    page: PageNum,
    range: Range<usize>,
    tag: TypeTag,
}

impl ObjectView<'_> {
    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }
}

impl Deref for ObjectView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.pages
            .page(self.page)
            .map(|page| &page[self.range.clone()])
            .unwrap_or_default()
    }
}

impl Drop for ObjectView<'_> {
    fn drop(&mut self) {
        self.pages.release(self.page);
    }
}

impl ObjectStore {
    /// Wrap an open page store. Creates the first space map of a new store.
    pub fn open(mut pages: PageStore, registry: ObjectRegistry) -> Result<Self> {
        header::check_version(&mut pages, OBJECT_STORE_AREA, OBJECT_STORE_VERSION)?;
        if pages.page_count() == 0 {
            let map = pages.acquire_new()?;
            pages.release(map);
            debug!("created space map page {map}");
        }
        Ok(Self {
            pages,
            registry,
            held: HashMap::new(),
            dirty: BTreeSet::new(),
        })
    }

    pub fn pages(&self) -> &PageStore {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut PageStore {
        &mut self.pages
    }

    pub fn options(&self) -> &StoreOptions {
        self.pages.options()
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Number of objects currently materialized.
    pub fn held_objects(&self) -> usize {
        self.held.len()
    }

    /// Whether the object is acquired or pinned by an observer.
    pub fn is_in_use(&self, addr: ObjectAddress) -> bool {
        self.held.get(&addr).is_some_and(Held::in_use)
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        !self.dirty.is_empty() || self.pages.has_uncommitted_changes()
    }

    /// Store a typed object and return its address. The object is not held.
    pub fn insert_object(&mut self, object: &dyn StoredObject) -> Result<ObjectAddress> {
        let mut payload = vec![0u8; object.encoded_len()];
        object.dematerialize(&mut payload);
        self.insert_bytes(object.type_tag(), &payload)
    }

    /// Store raw payload bytes under `tag`.
    pub fn insert_bytes(&mut self, tag: TypeTag, payload: &[u8]) -> Result<ObjectAddress> {
        if !self.registry.contains(tag) {
            return Err(StorageError::Format(format!(
                "no factory registered for type tag {tag}"
            )));
        }
        if payload.len() > MAX_OBJECT_SIZE {
            return Err(StorageError::Capacity(format!(
                "object of {} bytes exceeds the maximum of {MAX_OBJECT_SIZE}",
                payload.len()
            )));
        }

        let page_num = self.find_page_with_space(payload.len())?;
        let slot = self
            .pages
            .with_page_mut(page_num, |page| object_page::insert(page, tag, payload))??;
        self.refresh_space_class(page_num)?;

        let addr = ObjectAddress::new(page_num, slot);
        trace!("inserted object {addr} ({} bytes, tag {tag})", payload.len());
        Ok(addr)
    }

    /// Acquire an object, materializing it if it is not already held.
    pub fn acquire_object(&mut self, addr: ObjectAddress) -> Result<()> {
        if let Some(held) = self.held.get_mut(&addr) {
            held.refs += 1;
            return Ok(());
        }
        let object = self.materialize(addr)?;
        self.held.insert(addr, Held { object, refs: 1 });
        Ok(())
    }

    /// Drop one acquisition. An idle, unmodified object is evicted.
    pub fn release_object(&mut self, addr: ObjectAddress) {
        let Some(held) = self.held.get_mut(&addr) else {
            warn!("release of object {addr} which is not held");
            return;
        };
        held.refs = held.refs.saturating_sub(1);
        if !held.in_use() && !self.dirty.contains(&addr) {
            self.held.remove(&addr);
        }
    }

    /// Typed access to a held object.
    pub fn object<T: StoredObject>(&self, addr: ObjectAddress) -> Result<&T> {
        let held = self.held.get(&addr).ok_or_else(|| not_held(addr))?;
        held.object
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| wrong_type(addr, held.object.type_tag()))
    }

    /// Typed mutable access to a held object. Marks it modified.
    pub fn object_mut<T: StoredObject>(&mut self, addr: ObjectAddress) -> Result<&mut T> {
        let held = self.held.get_mut(&addr).ok_or_else(|| not_held(addr))?;
        let tag = held.object.type_tag();
        let object = held
            .object
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| wrong_type(addr, tag))?;
        self.dirty.insert(addr);
        Ok(object)
    }

    /// Register a held object for the next commit.
    pub fn modified(&mut self, addr: ObjectAddress) -> Result<()> {
        if !self.held.contains_key(&addr) {
            return Err(not_held(addr));
        }
        self.dirty.insert(addr);
        Ok(())
    }

    /// Run `f` over a typed object for the duration of one acquisition.
    pub fn with_object<T: StoredObject, R>(
        &mut self,
        addr: ObjectAddress,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        self.acquire_object(addr)?;
        let result = self.object::<T>(addr).map(f);
        self.release_object(addr);
        result
    }

    /// Like [`ObjectStore::with_object`], but mutable; marks the object
    /// modified.
    pub fn with_object_mut<T: StoredObject, R>(
        &mut self,
        addr: ObjectAddress,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        self.acquire_object(addr)?;
        let result = self.object_mut::<T>(addr).map(f);
        self.release_object(addr);
        result
    }

    /// Mutate ephemeral state of an object without marking it modified.
    pub fn with_object_ephemeral<T: StoredObject, R>(
        &mut self,
        addr: ObjectAddress,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        self.acquire_object(addr)?;
        let result = match self.held.get_mut(&addr) {
            Some(held) => {
                let tag = held.object.type_tag();
                held.object
                    .as_any_mut()
                    .downcast_mut::<T>()
                    .map(f)
                    .ok_or_else(|| wrong_type(addr, tag))
            }
            None => Err(not_held(addr)),
        };
        self.release_object(addr);
        result
    }

    /// Owned copy of an object's payload.
    pub fn read_object(&mut self, addr: ObjectAddress) -> Result<Vec<u8>> {
        if let Some(held) = self.held.get(&addr) {
            let mut payload = vec![0u8; held.object.encoded_len()];
            held.object.dematerialize(&mut payload);
            return Ok(payload);
        }
        Ok(self.view(addr)?.to_vec())
    }

    /// Borrow an object's payload from its page without copying.
    pub fn view(&mut self, addr: ObjectAddress) -> Result<ObjectView<'_>> {
        if self.dirty.contains(&addr) {
            self.flush_object(addr)?;
        }
        check_address(addr)?;
        self.pages.acquire(addr.page())?;
        let located = self
            .pages
            .page(addr.page())
            .and_then(|page| object_page::read(page, addr.object_number()));
        match located {
            Ok((header, range)) => Ok(ObjectView {
                pages: &mut self.pages,
                page: addr.page(),
                range,
                tag: header.tag,
            }),
            Err(e) => {
                self.pages.release(addr.page());
                Err(e)
            }
        }
    }

    /// Overwrite an object's payload in place. The length must not change,
    /// and the object must not be held elsewhere.
    pub fn update_bytes(&mut self, addr: ObjectAddress, payload: &[u8]) -> Result<()> {
        self.drop_idle(addr, "overwrite")?;
        check_address(addr)?;
        self.pages.with_page_mut(addr.page(), |page| {
            object_page::update(page, addr.object_number(), payload)
        })?
    }

    /// Delete an object. Fails while the object is acquired or pinned.
    pub fn remove_object(&mut self, addr: ObjectAddress) -> Result<()> {
        self.drop_idle(addr, "remove")?;
        check_address(addr)?;
        self.pages.with_page_mut(addr.page(), |page| {
            object_page::remove(page, addr.object_number())
        })??;
        self.refresh_space_class(addr.page())?;
        trace!("removed object {addr}");
        Ok(())
    }

    /// Evict every held object that is idle and unmodified.
    pub fn evict_idle(&mut self) {
        let dirty = &self.dirty;
        self.held
            .retain(|addr, held| held.in_use() || dirty.contains(addr));
    }

    /// Flush modified objects into their pages and commit the pages.
    pub fn commit(&mut self) -> Result<()> {
        let pending: Vec<ObjectAddress> = self.dirty.iter().copied().collect();
        for addr in &pending {
            self.flush_object(*addr)?;
        }
        self.evict_idle();
        self.pages.commit()?;
        debug!("committed {} object(s)", pending.len());
        Ok(())
    }

    /// Discard uncommitted changes. Objects still in use are reloaded from
    /// their restored pages.
    pub fn rollback(&mut self) -> Result<()> {
        self.dirty.clear();
        self.pages.rollback()?;
        self.evict_idle();

        let survivors: Vec<ObjectAddress> = self.held.keys().copied().collect();
        for addr in survivors {
            let expected = match self.held.get(&addr) {
                Some(held) => held.object.type_tag(),
                None => continue,
            };
            let bytes = self.read_page_payload(addr, expected);
            if let Some(held) = self.held.get_mut(&addr) {
                held.object.rematerialize(bytes.as_deref())?;
            }
        }
        // Rematerializing can drop pins, e.g. a node whose cursors were unset.
        self.evict_idle();
        debug!("rolled back object store");
        Ok(())
    }

    /// Close the store. Uncommitted changes are discarded.
    pub fn close(self) -> Result<()> {
        if !self.dirty.is_empty() {
            warn!(
                "closing with {} uncommitted object(s); discarding them",
                self.dirty.len()
            );
        }
        self.pages.close()
    }

    fn materialize(&mut self, addr: ObjectAddress) -> Result<Box<dyn StoredObject>> {
        check_address(addr)?;
        let registry = &self.registry;
        self.pages.with_page(addr.page(), |page| {
            let (header, range) = object_page::read(page, addr.object_number())?;
            registry.materialize(header.tag, &page[range])
        })?
    }

    /// Write a held object's payload into its page and clear its dirty mark.
    fn flush_object(&mut self, addr: ObjectAddress) -> Result<()> {
        let held = self.held.get(&addr).ok_or_else(|| not_held(addr))?;
        let mut payload = vec![0u8; held.object.encoded_len()];
        held.object.dematerialize(&mut payload);
        self.pages.with_page_mut(addr.page(), |page| {
            object_page::update(page, addr.object_number(), &payload)
        })??;
        self.dirty.remove(&addr);
        Ok(())
    }

    /// Forget an idle held copy before the object is changed on disk.
    fn drop_idle(&mut self, addr: ObjectAddress, action: &str) -> Result<()> {
        if let Some(held) = self.held.get(&addr) {
            if held.in_use() {
                return Err(StorageError::Concurrency(format!(
                    "cannot {action} object {addr} while it is in use"
                )));
            }
            self.held.remove(&addr);
            self.dirty.remove(&addr);
        }
        Ok(())
    }

    fn read_page_payload(&mut self, addr: ObjectAddress, expected: TypeTag) -> Option<Vec<u8>> {
        if addr.page() >= self.pages.page_count() {
            return None;
        }
        self.pages
            .with_page(addr.page(), |page| {
                object_page::read(page, addr.object_number())
                    .ok()
                    .filter(|(header, _)| header.tag == expected)
                    .map(|(_, range)| page[range].to_vec())
            })
            .ok()
            .flatten()
    }

    fn find_page_with_space(&mut self, len: usize) -> Result<PageNum> {
        // A zero-length object still needs a directory slot.
        let max_class = space_map::required_class(len.max(1)).ok_or_else(|| {
            StorageError::Capacity(format!("object of {len} bytes cannot fit in a page"))
        })?;
        let page_count = self.pages.page_count();
        for map_page in (0..page_count).step_by(BLOCK_PAGES) {
            let found = self.pages.with_page(map_page, |map| {
                space_map::find_page(map, map_page, page_count, max_class)
            })?;
            if let Some(page_num) = found {
                return Ok(page_num);
            }
        }

        let mut page_num = self.pages.acquire_new()?;
        if space_map::is_space_map_page(page_num) {
            debug!("created space map page {page_num}");
            self.pages.release(page_num);
            page_num = self.pages.acquire_new()?;
        }
        self.pages.with_page_mut(page_num, object_page::init)?;
        self.pages.release(page_num);
        Ok(page_num)
    }

    fn refresh_space_class(&mut self, page_num: PageNum) -> Result<()> {
        let free = self.pages.with_page(page_num, object_page::free_space)?;
        let class = space_map::space_class(free);
        let map_page = space_map::space_map_for(page_num);
        let current = self
            .pages
            .with_page(map_page, |map| space_map::get_class(map, page_num))?;
        if current != class {
            self.pages
                .with_page_mut(map_page, |map| space_map::set_class(map, page_num, class))?;
        }
        Ok(())
    }
}

fn check_address(addr: ObjectAddress) -> Result<()> {
    if addr.object_number() == 0 || space_map::is_space_map_page(addr.page()) {
        return Err(StorageError::NotFound(format!("no object at address {addr}")));
    }
    Ok(())
}

fn not_held(addr: ObjectAddress) -> StorageError {
    StorageError::NotFound(format!("object {addr} is not acquired"))
}

fn wrong_type(addr: ObjectAddress, tag: TypeTag) -> StorageError {
    StorageError::Format(format!(
        "object {addr} has type tag {tag}, not the requested type"
    ))
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::object::{BinaryObject, BINARY_OBJECT_TAG};

    const COUNTER_TAG: TypeTag = 40;

    /// A fixed-size object with an ephemeral pin flag.
    #[derive(Debug)]
    struct Counter {
        value: u32,
        pinned: bool,
    }

    impl StoredObject for Counter {
        fn type_tag(&self) -> TypeTag {
            COUNTER_TAG
        }

        fn encoded_len(&self) -> usize {
            4
        }

        fn dematerialize(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.value.to_be_bytes());
        }

        fn rematerialize(&mut self, bytes: Option<&[u8]>) -> Result<()> {
            self.value = match bytes {
                Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                None => 0,
            };
            Ok(())
        }

        fn is_pinned(&self) -> bool {
            self.pinned
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn registry() -> ObjectRegistry {
        let mut registry = ObjectRegistry::new();
        BinaryObject::register(&mut registry).unwrap();
        registry
            .register(COUNTER_TAG, |bytes| {
                if bytes.len() != 4 {
                    return Err(StorageError::Format("bad counter".into()));
                }
                Ok(Box::new(Counter {
                    value: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    pinned: false,
                }))
            })
            .unwrap();
        registry
    }

    fn open(dir: &tempfile::TempDir) -> ObjectStore {
        let pages = PageStore::open(dir.path().join("objects.db")).unwrap();
        ObjectStore::open(pages, registry()).unwrap()
    }

    #[test]
    fn insert_and_read_binary_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let a = store.insert_bytes(BINARY_OBJECT_TAG, b"first").unwrap();
        let b = store.insert_bytes(BINARY_OBJECT_TAG, b"second").unwrap();
        assert_eq!(a.page(), 1, "page 0 is the space map");
        assert_eq!(a.page(), b.page());
        assert_ne!(a, b);

        assert_eq!(store.read_object(a).unwrap(), b"first");
        let view = store.view(b).unwrap();
        assert_eq!(&*view, b"second");
        assert_eq!(view.type_tag(), BINARY_OBJECT_TAG);
    }

    #[test]
    fn view_releases_its_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let a = store.insert_bytes(BINARY_OBJECT_TAG, b"x").unwrap();
        {
            let _view = store.view(a).unwrap();
        }
        assert_eq!(store.pages().acquired_pages(), 0);
    }

    #[test]
    fn objects_survive_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = {
            let mut store = open(&dir);
            let addr = store
                .insert_object(&Counter {
                    value: 5,
                    pinned: false,
                })
                .unwrap();
            store.with_object_mut::<Counter, _>(addr, |c| c.value = 6).unwrap();
            store.commit().unwrap();
            store.close().unwrap();
            addr
        };

        let mut store = open(&dir);
        let value = store.with_object::<Counter, _>(addr, |c| c.value).unwrap();
        assert_eq!(value, 6);
        assert_eq!(store.held_objects(), 0);
    }

    #[test]
    fn modified_objects_stay_held_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store
            .insert_object(&Counter {
                value: 1,
                pinned: false,
            })
            .unwrap();
        store.with_object_mut::<Counter, _>(addr, |c| c.value = 2).unwrap();
        assert_eq!(store.held_objects(), 1);
        // Reads of the raw payload see the unflushed value.
        assert_eq!(store.read_object(addr).unwrap(), 2u32.to_be_bytes());
        store.commit().unwrap();
        assert_eq!(store.held_objects(), 0);
    }

    #[test]
    fn acquisitions_are_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store.insert_bytes(BINARY_OBJECT_TAG, b"held").unwrap();
        store.acquire_object(addr).unwrap();
        store.acquire_object(addr).unwrap();
        store.release_object(addr);
        assert!(store.is_in_use(addr));
        let err = store.remove_object(addr).unwrap_err();
        assert!(matches!(err, StorageError::Concurrency(_)));
        assert!(store.update_bytes(addr, b"nope").is_err());

        store.release_object(addr);
        assert!(!store.is_in_use(addr));
        store.remove_object(addr).unwrap();
        assert!(matches!(
            store.read_object(addr),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn pinned_objects_are_not_evicted_or_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store
            .insert_object(&Counter {
                value: 1,
                pinned: false,
            })
            .unwrap();
        store
            .with_object_ephemeral::<Counter, _>(addr, |c| c.pinned = true)
            .unwrap();
        assert_eq!(store.held_objects(), 1);
        assert!(store.dirty.is_empty());
        assert!(matches!(
            store.remove_object(addr),
            Err(StorageError::Concurrency(_))
        ));

        store
            .with_object_ephemeral::<Counter, _>(addr, |c| c.pinned = false)
            .unwrap();
        assert_eq!(store.held_objects(), 0);
    }

    #[test]
    fn wrong_type_access_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store.insert_bytes(BINARY_OBJECT_TAG, b"bytes").unwrap();
        let err = store.with_object::<Counter, _>(addr, |c| c.value).unwrap_err();
        assert!(matches!(err, StorageError::Format(_)));
        assert_eq!(store.held_objects(), 0);
    }

    #[test]
    fn update_in_place_requires_same_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store.insert_bytes(BINARY_OBJECT_TAG, b"abc").unwrap();
        store.update_bytes(addr, b"xyz").unwrap();
        assert_eq!(store.read_object(addr).unwrap(), b"xyz");
        assert!(matches!(
            store.update_bytes(addr, b"longer"),
            Err(StorageError::Format(_))
        ));
    }

    #[test]
    fn oversized_and_unregistered_objects_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let big = vec![0u8; MAX_OBJECT_SIZE + 1];
        assert!(matches!(
            store.insert_bytes(BINARY_OBJECT_TAG, &big),
            Err(StorageError::Capacity(_))
        ));
        assert!(matches!(
            store.insert_bytes(99, b"x"),
            Err(StorageError::Format(_))
        ));
    }

    #[test]
    fn space_map_steers_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let big = vec![1u8; 5000];
        let a = store.insert_bytes(BINARY_OBJECT_TAG, &big).unwrap();
        // Does not fit next to `a`: goes to a new page.
        let b = store.insert_bytes(BINARY_OBJECT_TAG, &big).unwrap();
        assert_ne!(a.page(), b.page());
        // Small objects fill the space left on the first page.
        let c = store.insert_bytes(BINARY_OBJECT_TAG, b"small").unwrap();
        assert_eq!(c.page(), a.page());

        // Freeing `a` makes its page eligible for a large object again.
        store.remove_object(a).unwrap();
        let d = store.insert_bytes(BINARY_OBJECT_TAG, &big).unwrap();
        assert_eq!(d.page(), a.page());
    }

    #[test]
    fn second_block_gets_its_own_space_map() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions::default().with_sync_on_commit(false);
        let pages =
            PageStore::open_with_options(dir.path().join("blocks.db"), options).unwrap();
        let mut store = ObjectStore::open(pages, registry()).unwrap();

        // One object per page until the store reaches into the second block.
        let big = vec![3u8; 5000];
        let mut addrs = Vec::new();
        while (store.pages().page_count() as usize) <= BLOCK_PAGES + 8 {
            addrs.push(store.insert_bytes(BINARY_OBJECT_TAG, &big).unwrap());
        }
        assert!(addrs.iter().all(|a| !space_map::is_space_map_page(a.page())));
        assert!(addrs.iter().all(|a| a.page() as usize != BLOCK_PAGES));
        let last = *addrs.last().unwrap();
        assert!(last.page() as usize > BLOCK_PAGES);

        // Space freed in the second block is found through its map page.
        store.remove_object(last).unwrap();
        let again = store.insert_bytes(BINARY_OBJECT_TAG, &big).unwrap();
        assert_eq!(again.page(), last.page());
        assert_eq!(store.read_object(again).unwrap(), big);
    }

    #[test]
    fn rollback_discards_new_objects_and_reloads_pinned_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let addr = store
            .insert_object(&Counter {
                value: 10,
                pinned: false,
            })
            .unwrap();
        store.commit().unwrap();

        store
            .with_object_ephemeral::<Counter, _>(addr, |c| c.pinned = true)
            .unwrap();
        store.with_object_mut::<Counter, _>(addr, |c| c.value = 11).unwrap();
        let fresh = store.insert_bytes(BINARY_OBJECT_TAG, b"temp").unwrap();

        store.rollback().unwrap();
        assert_eq!(store.with_object::<Counter, _>(addr, |c| c.value).unwrap(), 10);
        assert!(store.read_object(fresh).is_err());
        assert!(!store.has_uncommitted_changes());
    }
}
