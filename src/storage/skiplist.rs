//! Probabilistic Skiplist
//!
//! The ordered index behind every database: a tower of singly linked lists
//! where each node's height is drawn from a geometric distribution, giving
//! O(log n) expected search, insert, and erase without rebalancing.
//!
//! ```text
//! level 3:  head ──────────────────> [d] ─────────────> None
//! level 2:  head ──────> [b] ──────> [d] ─────────────> None
//! level 1:  head ──────> [b] ──────> [d] ──────> [f] ─> None
//! level 0:  head > [a] > [b] > [c] > [d] > [e] > [f] ─> None
//! ```
//!
//! ## Invariants
//!
//! - keys at every level are strictly ascending (raw byte order)
//! - the bottom level contains every entry
//! - no duplicate keys; inserting an existing key replaces its entry
//!
//! ## Concurrency
//!
//! The list itself is not synchronized. Every instance is owned by one
//! database and reached only through that database's reader-writer lock, so
//! readers hold `&self` and writers hold `&mut self` exclusively. Entries are
//! handed out as `Arc<Entry>` so a read-locked `find` returns a snapshot
//! without copying the value.

use crate::storage::entry::{self, DecodeError, Entry};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::ptr::NonNull;
use std::sync::Arc;

/// Cap on node height. With p = 1/2 this is comfortable far beyond any
/// realistic in-memory entry count.
pub const MAX_LEVEL: usize = 32;

type Link = Option<NonNull<Node>>;

struct Node {
    /// `None` only for the head sentinel.
    entry: Option<Arc<Entry>>,
    /// Forward pointers; `forward.len()` is this node's height.
    forward: Vec<Link>,
}

impl Node {
    fn key(&self) -> &[u8] {
        // The sentinel never sits behind a forward pointer.
        self.entry.as_ref().map(|e| &e.key()[..]).unwrap_or(&[])
    }
}

/// An ordered map from key bytes to shared entries.
pub struct Skiplist {
    head: NonNull<Node>,
    len: usize,
    rng: StdRng,
}

// All access is serialized by the owning database's RwLock: readers only
// follow pointers through &self, writers mutate through &mut self, and no
// interior pointer escapes except as a cloned Arc<Entry>.
unsafe impl Send for Skiplist {}
unsafe impl Sync for Skiplist {}

impl Skiplist {
    /// Creates an empty skiplist with an entropy-seeded level generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates an empty skiplist with a fixed seed, for deterministic tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let head = Box::new(Node {
            entry: None,
            forward: vec![None; MAX_LEVEL],
        });
        Self {
            head: NonNull::from(Box::leak(head)),
            len: 0,
            rng,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Draws a height with P(L >= k) = 2^-k, capped at [`MAX_LEVEL`].
    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Returns a shared handle to the entry for `key`, if present.
    pub fn find(&self, key: &[u8]) -> Option<Arc<Entry>> {
        unsafe {
            let mut node = self.head.as_ptr();
            for level in (0..MAX_LEVEL).rev() {
                while let Some(next) = (&(*node).forward)[level] {
                    match (*next.as_ptr()).key().cmp(key) {
                        Ordering::Less => node = next.as_ptr(),
                        _ => break,
                    }
                }
            }

            let candidate = (&(*node).forward)[0]?;
            let candidate = candidate.as_ptr();
            if (*candidate).key() == key {
                (*candidate).entry.clone()
            } else {
                None
            }
        }
    }

    /// Inserts an entry by its key. An existing entry under the same key is
    /// replaced.
    pub fn insert(&mut self, entry: Arc<Entry>) {
        let key = entry.key().clone();
        unsafe {
            let mut update: [*mut Node; MAX_LEVEL] = [self.head.as_ptr(); MAX_LEVEL];
            let mut node = self.head.as_ptr();
            for level in (0..MAX_LEVEL).rev() {
                while let Some(next) = (&(*node).forward)[level] {
                    match (*next.as_ptr()).key().cmp(&key[..]) {
                        Ordering::Less => node = next.as_ptr(),
                        _ => break,
                    }
                }
                update[level] = node;
            }

            if let Some(next) = (&(*node).forward)[0] {
                let next = next.as_ptr();
                if (*next).key() == &key[..] {
                    (*next).entry = Some(entry);
                    return;
                }
            }

            let height = self.random_level();
            let new = Box::new(Node {
                entry: Some(entry),
                forward: vec![None; height],
            });
            let new = NonNull::from(Box::leak(new));
            for level in 0..height {
                (&mut (*new.as_ptr()).forward)[level] = (&(*update[level]).forward)[level];
                (&mut (*update[level]).forward)[level] = Some(new);
            }
            self.len += 1;
        }
    }

    /// Removes the entry for `key`. Returns whether a key was present.
    pub fn erase(&mut self, key: &[u8]) -> bool {
        unsafe {
            let mut update: [*mut Node; MAX_LEVEL] = [self.head.as_ptr(); MAX_LEVEL];
            let mut node = self.head.as_ptr();
            for level in (0..MAX_LEVEL).rev() {
                while let Some(next) = (&(*node).forward)[level] {
                    match (*next.as_ptr()).key().cmp(key) {
                        Ordering::Less => node = next.as_ptr(),
                        _ => break,
                    }
                }
                update[level] = node;
            }

            let target = match (&(*node).forward)[0] {
                Some(next) if (*next.as_ptr()).key() == key => next,
                _ => return false,
            };

            let height = (*target.as_ptr()).forward.len();
            for level in 0..height {
                if (&(*update[level]).forward)[level] == Some(target) {
                    (&mut (*update[level]).forward)[level] = (&(*target.as_ptr()).forward)[level];
                }
            }

            drop(Box::from_raw(target.as_ptr()));
            self.len -= 1;
            true
        }
    }

    /// Iterates entries in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: unsafe { (&(*self.head.as_ptr()).forward)[0] },
            _list: self,
        }
    }

    /// Serializes the full content: every entry back-to-back in ascending
    /// key order, no outer framing.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in self.iter() {
            entry.serialize_into(&mut buf);
        }
        buf
    }

    /// Rebuilds a skiplist from [`Skiplist::serialize`] output.
    pub fn deserialize(data: Bytes) -> Result<Skiplist, DecodeError> {
        let mut list = Skiplist::new();
        for entry in entry::decode_all(data)? {
            list.insert(Arc::new(entry));
        }
        Ok(list)
    }
}

impl Default for Skiplist {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Skiplist {
    fn drop(&mut self) {
        unsafe {
            let head = Box::from_raw(self.head.as_ptr());
            let mut next = head.forward[0];
            while let Some(node) = next {
                let node = Box::from_raw(node.as_ptr());
                next = node.forward[0];
            }
        }
    }
}

impl std::fmt::Debug for Skiplist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skiplist").field("len", &self.len).finish()
    }
}

/// Ascending iterator over the bottom level.
pub struct Iter<'a> {
    next: Link,
    _list: &'a Skiplist,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Arc<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        unsafe {
            self.next = (&(*node.as_ptr()).forward)[0];
            (*node.as_ptr()).entry.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &Skiplist) -> Vec<Bytes> {
        list.iter().map(|e| e.key().clone()).collect()
    }

    #[test]
    fn test_insert_and_find() {
        let mut list = Skiplist::with_seed(7);
        list.insert(Arc::new(Entry::string("foo", "bar")));

        let found = list.find(b"foo").unwrap();
        assert_eq!(&found.as_string().unwrap()[..], b"bar");
        assert!(list.find(b"missing").is_none());
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut list = Skiplist::with_seed(7);
        list.insert(Arc::new(Entry::string("k", "old")));
        list.insert(Arc::new(Entry::string("k", "new")));

        assert_eq!(list.len(), 1);
        let found = list.find(b"k").unwrap();
        assert_eq!(&found.as_string().unwrap()[..], b"new");
    }

    #[test]
    fn test_erase() {
        let mut list = Skiplist::with_seed(7);
        list.insert(Arc::new(Entry::string("a", "1")));
        list.insert(Arc::new(Entry::string("b", "2")));

        assert!(list.erase(b"a"));
        assert!(!list.erase(b"a"));
        assert!(list.find(b"a").is_none());
        assert_eq!(list.len(), 1);
        assert!(list.find(b"b").is_some());
    }

    #[test]
    fn test_iteration_is_sorted_and_unique() {
        let mut list = Skiplist::with_seed(42);
        for key in ["pear", "apple", "fig", "banana", "apple", "date"] {
            list.insert(Arc::new(Entry::string(key, "v")));
        }

        assert_eq!(
            keys(&list),
            vec![
                Bytes::from("apple"),
                Bytes::from("banana"),
                Bytes::from("date"),
                Bytes::from("fig"),
                Bytes::from("pear"),
            ]
        );
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_byte_order_is_unsigned() {
        let mut list = Skiplist::with_seed(1);
        list.insert(Arc::new(Entry::string(&b"\xff"[..], "hi")));
        list.insert(Arc::new(Entry::string(&b"\x01"[..], "lo")));
        list.insert(Arc::new(Entry::string(&b"a"[..], "mid")));

        assert_eq!(
            keys(&list),
            vec![
                Bytes::from_static(b"\x01"),
                Bytes::from_static(b"a"),
                Bytes::from_static(b"\xff"),
            ]
        );
    }

    #[test]
    fn test_many_keys() {
        let mut list = Skiplist::with_seed(99);
        let mut expected: Vec<String> = (0..500).map(|i| format!("key-{:04}", i)).collect();

        // Insert in a scrambled order.
        let mut scrambled = expected.clone();
        scrambled.reverse();
        scrambled.swap(0, 250);
        for key in &scrambled {
            list.insert(Arc::new(Entry::string(key.clone(), "v")));
        }

        expected.sort();
        let got: Vec<String> = list
            .iter()
            .map(|e| String::from_utf8(e.key().to_vec()).unwrap())
            .collect();
        assert_eq!(got, expected);

        for key in &expected {
            assert!(list.find(key.as_bytes()).is_some());
        }
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut list = Skiplist::with_seed(3);
        list.insert(Arc::new(Entry::string("b", "2")));
        list.insert(Arc::new(Entry::string("a", "1")));
        list.insert(Arc::new(Entry::string("c", "3")));

        let restored = Skiplist::deserialize(Bytes::from(list.serialize())).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(keys(&restored), keys(&list));
        assert_eq!(
            &restored.find(b"b").unwrap().as_string().unwrap()[..],
            b"2"
        );
    }

    #[test]
    fn test_empty_serialize_roundtrip() {
        let list = Skiplist::with_seed(3);
        assert!(list.serialize().is_empty());
        let restored = Skiplist::deserialize(Bytes::new()).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(Skiplist::deserialize(Bytes::from_static(b"\xfe\x00garbage")).is_err());
    }

    #[test]
    fn test_shared_handles_survive_erase() {
        let mut list = Skiplist::with_seed(5);
        list.insert(Arc::new(Entry::string("k", "v")));
        let handle = list.find(b"k").unwrap();
        assert!(list.erase(b"k"));

        // The snapshot stays valid after the node is gone.
        assert_eq!(&handle.as_string().unwrap()[..], b"v");
    }
}
