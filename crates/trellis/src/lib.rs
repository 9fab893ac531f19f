//! Trellis: a single-file store of byte objects and named B+tree indexes.
//!
//! [`IndexedStore`] ties the storage layers together. Objects are addressed
//! by [`ObjectId`]s that stay valid across sessions; indexes are looked up by
//! name. All changes become durable together at [`IndexedStore::commit`].

pub mod directory;
pub mod error;
pub mod object_id;

use std::path::Path;

use log::{debug, info};
use trellis_storage::field::Field;
use trellis_storage::header;
use trellis_storage::object::BINARY_OBJECT_TAG;
use trellis_storage::{btree, BinaryObject, ObjectRegistry, ObjectStore, ObjectView, PageStore};

pub use error::{Error, Result};
pub use object_id::ObjectId;
pub use trellis_storage::{
    ErrorKind, Index, IndexCursor, ObjectAddress, StorageError, StoreOptions,
};

use directory::{RootRecord, INDEXED_STORE_AREA, INDEXED_STORE_VERSION};

pub struct IndexedStore {
    objects: ObjectStore,
    object_directory: Index,
    index_directory: Index,
    open_counter: u32,
    next_serial: u32,
}

impl IndexedStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open or create a store. Every open bumps the persisted open counter,
    /// so ids created in this session never collide with earlier ones.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let pages = PageStore::open_with_options(path, options)?;
        let mut registry = ObjectRegistry::new();
        BinaryObject::register(&mut registry)?;
        btree::register_types(&mut registry)?;
        let mut objects = ObjectStore::open(pages, registry)?;
        header::check_version(objects.pages_mut(), INDEXED_STORE_AREA, INDEXED_STORE_VERSION)?;

        let mut root = match RootRecord::read(objects.pages_mut())? {
            Some(root) => root,
            None => {
                let object_directory = Index::create(&mut objects)?;
                let index_directory = Index::create(&mut objects)?;
                // The anchors must be durable before the root record names them.
                objects.commit()?;
                debug!("initialized system indexes");
                RootRecord {
                    object_directory: object_directory.anchor(),
                    index_directory: index_directory.anchor(),
                    open_counter: 0,
                }
            }
        };
        root.open_counter = root.open_counter.wrapping_add(1);
        root.write(objects.pages_mut())?;

        info!(
            "opened indexed store {} (open #{})",
            objects.pages().path().display(),
            root.open_counter
        );
        Ok(Self {
            objects,
            object_directory: Index::at(root.object_directory),
            index_directory: Index::at(root.index_directory),
            open_counter: root.open_counter,
            next_serial: 1,
        })
    }

    /// Close the store. Uncommitted changes are discarded.
    pub fn close(self) -> Result<()> {
        self.objects.close()?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.objects.commit()?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.objects.rollback()?;
        Ok(())
    }

    /// The underlying object store, for operating on indexes directly.
    pub fn objects_mut(&mut self) -> &mut ObjectStore {
        &mut self.objects
    }

    pub fn open_counter(&self) -> u32 {
        self.open_counter
    }

    pub fn create_index(&mut self, name: &str) -> Result<Index> {
        btree::check_key_size(name.as_bytes())?;
        if self.index_directory.get(&mut self.objects, name.as_bytes())?.is_some() {
            return Err(Error::IndexExists(name.to_string()));
        }
        let index = Index::create(&mut self.objects)?;
        self.index_directory
            .insert(&mut self.objects, name.as_bytes(), &index.anchor().to_bytes())?;
        debug!("created index {name:?} at {}", index.anchor());
        Ok(index)
    }

    pub fn get_index(&mut self, name: &str) -> Result<Index> {
        directory::lookup_index(&mut self.objects, self.index_directory, name)
    }

    /// Drop an index and every node it owns.
    pub fn remove_index(&mut self, name: &str) -> Result<()> {
        let index = self.get_index(name)?;
        index.destroy(&mut self.objects)?;
        self.index_directory
            .remove_all_equal(&mut self.objects, name.as_bytes())?;
        debug!("removed index {name:?}");
        Ok(())
    }

    /// Names of all indexes, in byte order.
    pub fn index_names(&mut self) -> Result<Vec<String>> {
        directory::keys(&mut self.objects, self.index_directory)?
            .into_iter()
            .map(|key| -> Result<String> {
                let name = Field::new(&key).get_utf8(0, key.len())?;
                Ok(name.to_string())
            })
            .collect()
    }

    pub fn create_object(&mut self, bytes: &[u8]) -> Result<ObjectId> {
        let serial = self.next_serial;
        let next_serial = serial.checked_add(1).ok_or_else(|| {
            StorageError::Capacity(format!(
                "session {} has used up its object serial numbers",
                self.open_counter
            ))
        })?;
        let addr = self.objects.insert_bytes(BINARY_OBJECT_TAG, bytes)?;
        let id = ObjectId::new(self.open_counter, serial);
        self.next_serial = next_serial;
        self.object_directory
            .insert(&mut self.objects, &id.to_bytes(), &addr.to_bytes())?;
        Ok(id)
    }

    /// Owned copy of an object's bytes.
    pub fn get_object(&mut self, id: ObjectId) -> Result<Vec<u8>> {
        let addr = self.lookup(id)?;
        Ok(self.objects.read_object(addr)?)
    }

    /// An object's bytes borrowed from its page.
    pub fn view_object(&mut self, id: ObjectId) -> Result<ObjectView<'_>> {
        let addr = self.lookup(id)?;
        Ok(self.objects.view(addr)?)
    }

    /// Replace an object's bytes. The object moves if its length changes;
    /// its id stays the same.
    pub fn update_object(&mut self, id: ObjectId, bytes: &[u8]) -> Result<()> {
        let addr = self.lookup(id)?;
        let current_len = self.objects.view(addr)?.len();
        if current_len == bytes.len() {
            self.objects.update_bytes(addr, bytes)?;
            return Ok(());
        }

        let moved = self.objects.insert_bytes(BINARY_OBJECT_TAG, bytes)?;
        self.objects.remove_object(addr)?;
        let mut cursor = self.object_directory.open();
        cursor.find(&mut self.objects, &id.to_bytes())?;
        let updated = cursor.update_value(&mut self.objects, &moved.to_bytes());
        cursor.close(&mut self.objects)?;
        updated?;
        debug!("object {id} moved from {addr} to {moved}");
        Ok(())
    }

    pub fn remove_object(&mut self, id: ObjectId) -> Result<()> {
        let addr = self.lookup(id)?;
        self.objects.remove_object(addr)?;
        self.object_directory
            .remove_all_equal(&mut self.objects, &id.to_bytes())?;
        Ok(())
    }

    /// Ids of all stored objects, oldest first.
    pub fn object_ids(&mut self) -> Result<Vec<ObjectId>> {
        directory::keys(&mut self.objects, self.object_directory)?
            .iter()
            .map(|key| -> Result<ObjectId> { Ok(ObjectId::from_bytes(key)?) })
            .collect()
    }

    fn lookup(&mut self, id: ObjectId) -> Result<ObjectAddress> {
        directory::lookup_object(&mut self.objects, self.object_directory, id)
    }
}
