//! Databases and the Process-Wide Registry
//!
//! A database is one numbered namespace: an id, a skiplist, and the
//! reader-writer lock that serializes access to it. The registry maps ids to
//! databases, is built once at startup from the data directory, and after
//! that only grows — SELECT adds namespaces, nothing removes them.
//!
//! ## Concurrency model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Registry                          │
//! │   RwLock<HashMap<id, Arc<Database>>>                     │
//! │        │                                                 │
//! │        ▼                                                 │
//! │   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │   │ Database 0   │  │ Database 1   │  │ Database n   │   │
//! │   │ RwLock<Skip> │  │ RwLock<Skip> │  │ RwLock<Skip> │   │
//! │   └──────────────┘  └──────────────┘  └──────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Read-only commands take a database's shared lock, mutations take the
//! exclusive lock, and the cross-database transfer takes both locks in id
//! order so opposing transfers cannot deadlock.
//!
//! ## Persistence
//!
//! Each database serializes to `data/<id>.db` (the raw skiplist codec).
//! Files are loaded at startup — a file that does not round-trip is fatal —
//! and written once on clean shutdown via write-to-temp, fsync, rename.

use crate::storage::entry::Entry;
use crate::storage::skiplist::Skiplist;
use anyhow::Context;
use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Database ids 0..=PREALLOCATED are always present.
const PREALLOCATED_DATABASES: u64 = 16;

/// File extension for database snapshots.
const DB_SUFFIX: &str = "db";

/// One numbered in-memory namespace.
#[derive(Debug)]
pub struct Database {
    id: u64,
    skiplist: RwLock<Skiplist>,
}

impl Database {
    fn new(id: u64, skiplist: Skiplist) -> Self {
        Self {
            id,
            skiplist: RwLock::new(skiplist),
        }
    }

    /// This database's id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.skiplist.read().unwrap().len()
    }

    /// Whether the database holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a shared snapshot handle to the entry for `key`.
    pub fn find(&self, key: &[u8]) -> Option<Arc<Entry>> {
        self.skiplist.read().unwrap().find(key)
    }

    /// Inserts an entry, replacing any entry under the same key.
    pub fn insert(&self, entry: Entry) {
        self.skiplist.write().unwrap().insert(Arc::new(entry));
    }

    /// Removes one key. Returns whether it was present.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.skiplist.write().unwrap().erase(key)
    }

    /// Removes every listed key under a single write lock.
    ///
    /// # Returns
    ///
    /// The number of keys that were actually present.
    pub fn remove_keys<'a>(&self, keys: impl Iterator<Item = &'a [u8]>) -> u64 {
        let mut skiplist = self.skiplist.write().unwrap();
        keys.filter(|&key| skiplist.erase(key)).count() as u64
    }

    /// Counts the listed keys that are present, under a single read lock.
    /// Duplicates are counted each time they appear.
    pub fn count_keys<'a>(&self, keys: impl Iterator<Item = &'a [u8]>) -> u64 {
        let skiplist = self.skiplist.read().unwrap();
        keys.filter(|&key| skiplist.find(key).is_some()).count() as u64
    }

    /// Renames `key` to `new_key`, overwriting `new_key` if it exists.
    /// The whole operation happens under one write lock.
    ///
    /// # Returns
    ///
    /// `false` if `key` does not exist.
    pub fn rename(&self, key: &[u8], new_key: &[u8]) -> bool {
        let mut skiplist = self.skiplist.write().unwrap();
        let entry = match skiplist.find(key) {
            Some(entry) => entry,
            None => return false,
        };
        skiplist.erase(key);
        skiplist.insert(Arc::new(rekey(&entry, new_key)));
        true
    }

    /// Renames `key` to `new_key` only when `new_key` is absent.
    ///
    /// # Returns
    ///
    /// `true` only if the rename happened; when the destination exists the
    /// database is left untouched.
    pub fn rename_exclusive(&self, key: &[u8], new_key: &[u8]) -> bool {
        let mut skiplist = self.skiplist.write().unwrap();
        let entry = match skiplist.find(key) {
            Some(entry) => entry,
            None => return false,
        };
        if skiplist.find(new_key).is_some() {
            return false;
        }
        skiplist.erase(key);
        skiplist.insert(Arc::new(rekey(&entry, new_key)));
        true
    }

    /// Moves `key` from `source` to `target` atomically.
    ///
    /// Both write locks are taken in database-id order, so concurrent
    /// opposing moves cannot deadlock. The move happens only when the source
    /// holds the key and the target does not.
    pub fn transfer(source: &Database, target: &Database, key: &[u8]) -> bool {
        if source.id == target.id {
            // Same namespace: the key necessarily exists on both sides or
            // neither, so the move can never apply.
            return false;
        }

        let (mut source_guard, mut target_guard) = if source.id < target.id {
            let first = source.skiplist.write().unwrap();
            let second = target.skiplist.write().unwrap();
            (first, second)
        } else {
            let second = target.skiplist.write().unwrap();
            let first = source.skiplist.write().unwrap();
            (first, second)
        };

        let entry = match source_guard.find(key) {
            Some(entry) => entry,
            None => return false,
        };
        if target_guard.find(key).is_some() {
            return false;
        }

        source_guard.erase(key);
        target_guard.insert(entry);
        true
    }

    /// Serializes the full content under the read lock.
    pub fn serialize(&self) -> Vec<u8> {
        self.skiplist.read().unwrap().serialize()
    }
}

/// Clones an entry under a new key; values are cheap reference-counted
/// buffers so this copies no payload bytes.
fn rekey(entry: &Entry, new_key: &[u8]) -> Entry {
    match entry.as_string() {
        Some(value) => Entry::string(Bytes::copy_from_slice(new_key), value.clone()),
        // Reserved kinds cannot be created by any command yet.
        None => Entry::string(Bytes::copy_from_slice(new_key), Bytes::new()),
    }
}

/// The process-wide mapping from database id to database.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    databases: RwLock<HashMap<u64, Arc<Database>>>,
}

impl Registry {
    /// Opens the registry from a data directory.
    ///
    /// Every `<id>.db` file found is loaded, then ids 0..=15 are filled in
    /// empty. A file that fails to decode is a fatal startup error — better
    /// to refuse than to serve half a namespace.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Registry> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create data directory {}", dir.display()))?;

        let mut databases = HashMap::new();
        for dir_entry in
            fs::read_dir(&dir).with_context(|| format!("scan {}", dir.display()))?
        {
            let path = dir_entry?.path();
            let id = match parse_database_id(&path) {
                Some(id) => id,
                None => continue,
            };
            let database = load_database(id, &path)?;
            debug!(id, entries = database.len(), "loaded database file");
            databases.insert(id, Arc::new(database));
        }

        for id in 0..PREALLOCATED_DATABASES {
            databases
                .entry(id)
                .or_insert_with(|| Arc::new(Database::new(id, Skiplist::new())));
        }

        info!(
            databases = databases.len(),
            dir = %dir.display(),
            "registry opened"
        );

        Ok(Registry {
            dir,
            databases: RwLock::new(databases),
        })
    }

    /// Looks up a database by id.
    pub fn get(&self, id: u64) -> Option<Arc<Database>> {
        self.databases.read().unwrap().get(&id).cloned()
    }

    /// Ensures a database exists for `id`, creating it empty on first use.
    pub fn select(&self, id: u64) -> Arc<Database> {
        if let Some(database) = self.get(id) {
            return database;
        }
        let mut databases = self.databases.write().unwrap();
        Arc::clone(
            databases
                .entry(id)
                .or_insert_with(|| Arc::new(Database::new(id, Skiplist::new()))),
        )
    }

    /// Ids currently present, in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.databases.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Writes every database to disk with an atomic replace.
    ///
    /// Each snapshot goes to `<id>.db.tmp`, is fsynced, then renamed over
    /// `<id>.db` so a crash mid-save never corrupts the previous snapshot.
    pub fn save_all(&self) -> anyhow::Result<()> {
        let databases: Vec<Arc<Database>> =
            self.databases.read().unwrap().values().cloned().collect();

        for database in databases {
            let snapshot = database.serialize();
            let path = self.database_path(database.id());
            let tmp = path.with_extension("db.tmp");

            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&snapshot)
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("fsync {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;

            debug!(id = database.id(), bytes = snapshot.len(), "saved database");
        }

        info!(dir = %self.dir.display(), "all databases saved");
        Ok(())
    }

    fn database_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", id, DB_SUFFIX))
    }
}

/// Extracts the database id from a `<id>.db` path, ignoring anything else.
fn parse_database_id(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != DB_SUFFIX {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn load_database(id: u64, path: &Path) -> anyhow::Result<Database> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let skiplist = Skiplist::deserialize(Bytes::from(raw))
        .with_context(|| format!("corrupt database file {}", path.display()))?;
    Ok(Database::new(id, skiplist))
}
