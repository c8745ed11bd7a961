//! Named string-to-string collections.
//!
//! Every node keeps its own replica of each collection name; the ring keeps
//! the set of names in step (`dbcreate`/`dbdestroy` are broadcast) while the
//! entries themselves live on whichever node accepted the `dbput`.
//!
//! Each collection carries one iteration cursor used by `dbfirst`/`dbnext`,
//! and the database carries one cursor over collection names for
//! `dbfirstdb`/`dbnextdb`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use thiserror::Error;

/// Database errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// No collection with the given name exists on this node.
    #[error("no such database: {name}")]
    NoSuchDatabase {
        /// Requested collection name.
        name: String,
    },

    /// The collection exists but the key does not.
    #[error("key not found: {key}")]
    KeyNotFound {
        /// Requested key.
        key: String,
    },
}

impl DbError {
    fn no_such_database(name: &str) -> Self {
        Self::NoSuchDatabase {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Cursor {
    /// Before the first entry.
    #[default]
    Start,
    /// Positioned on this key.
    At(String),
    /// Past the last entry.
    End,
}

impl Cursor {
    /// Moves to the next key of `map` and returns that entry.
    fn advance<'a, V>(&mut self, map: &'a BTreeMap<String, V>) -> Option<(&'a String, &'a V)> {
        let next = match self {
            Self::Start => map.iter().next(),
            Self::At(key) => map
                .range::<String, _>((Bound::Excluded(&*key), Bound::Unbounded))
                .next(),
            Self::End => None,
        };
        *self = next.map_or(Self::End, |(key, _)| Self::At(key.clone()));
        next
    }
}

#[derive(Debug, Default)]
struct Collection {
    entries: BTreeMap<String, String>,
    cursor: Cursor,
}

#[derive(Debug, Default)]
struct DbInner {
    next_name: u64,
    collections: BTreeMap<String, Collection>,
    name_cursor: Cursor,
}

/// The node-local replica of every collection.
#[derive(Debug, Default)]
pub struct Database {
    inner: Mutex<DbInner>,
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collection with the next free decimal name, starting at
    /// `"0"`.
    pub fn create(&self) -> String {
        let mut inner = self.inner.lock().expect("lock poisoned");
        loop {
            let name = inner.next_name.to_string();
            inner.next_name += 1;
            if !inner.collections.contains_key(&name) {
                inner.collections.insert(name.clone(), Collection::default());
                return name;
            }
        }
    }

    /// Creates `name` if it does not exist. Returns `false` if it already did.
    pub fn create_named(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.collections.contains_key(name) {
            return false;
        }
        inner
            .collections
            .insert(name.to_string(), Collection::default());
        true
    }

    /// Removes a collection and all of its entries.
    pub fn destroy(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .collections
            .remove(name)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .collections
            .contains_key(name)
    }

    /// Inserts or replaces one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchDatabase`] if `name` does not exist here.
    pub fn put(&self, name: &str, key: &str, value: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let collection = inner
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::no_such_database(name))?;
        collection
            .entries
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Looks up one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchDatabase`] or [`DbError::KeyNotFound`].
    pub fn get(&self, name: &str, key: &str) -> Result<String, DbError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let collection = inner
            .collections
            .get(name)
            .ok_or_else(|| DbError::no_such_database(name))?;
        collection
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| DbError::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// Removes one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchDatabase`] or [`DbError::KeyNotFound`].
    pub fn delete(&self, name: &str, key: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let collection = inner
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::no_such_database(name))?;
        collection
            .entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DbError::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// Rewinds the collection's cursor. Returns `false` for an unknown name.
    pub fn reset(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner
            .collections
            .get_mut(name)
            .map(|collection| collection.cursor = Cursor::Start)
            .is_some()
    }

    /// Rewinds and returns the first entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchDatabase`] if `name` does not exist here.
    pub fn first(&self, name: &str) -> Result<Option<(String, String)>, DbError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let collection = inner
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::no_such_database(name))?;
        collection.cursor = Cursor::Start;
        Ok(collection
            .cursor
            .advance(&collection.entries)
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Advances the cursor. A cursor that was never started behaves like
    /// [`Database::first`]; an exhausted one keeps returning `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchDatabase`] if `name` does not exist here.
    pub fn next(&self, name: &str) -> Result<Option<(String, String)>, DbError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let collection = inner
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::no_such_database(name))?;
        Ok(collection
            .cursor
            .advance(&collection.entries)
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Rewinds the name cursor and returns the first collection name.
    pub fn first_db(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let DbInner {
            collections,
            name_cursor,
            ..
        } = &mut *inner;
        *name_cursor = Cursor::Start;
        name_cursor.advance(collections).map(|(k, _)| k.clone())
    }

    /// Advances the name cursor.
    pub fn next_db(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let DbInner {
            collections,
            name_cursor,
            ..
        } = &mut *inner;
        name_cursor.advance(collections).map(|(k, _)| k.clone())
    }

    /// Number of collections on this node.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").collections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Formats one entry the way `dbfirst`/`dbnext` reply with it.
#[must_use]
pub fn format_entry(key: &str, value: &str) -> String {
    format!("key={key} value={value}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_names_count_from_zero_and_skip_taken() {
        let db = Database::new();
        assert_eq!(db.create(), "0");
        assert!(db.create_named("1"));
        assert_eq!(db.create(), "2");
        assert!(!db.create_named("0"));
    }

    #[test]
    fn put_get_delete() {
        let db = Database::new();
        let name = db.create();
        db.put(&name, "k", "v").unwrap();
        assert_eq!(db.get(&name, "k").unwrap(), "v");
        db.put(&name, "k", "w").unwrap();
        assert_eq!(db.get(&name, "k").unwrap(), "w");
        db.delete(&name, "k").unwrap();
        assert!(matches!(db.get(&name, "k"), Err(DbError::KeyNotFound { .. })));
        assert!(matches!(db.delete(&name, "k"), Err(DbError::KeyNotFound { .. })));
    }

    #[test]
    fn unknown_database() {
        let db = Database::new();
        assert!(matches!(db.put("nope", "k", "v"), Err(DbError::NoSuchDatabase { .. })));
        assert!(matches!(db.first("nope"), Err(DbError::NoSuchDatabase { .. })));
        assert!(!db.reset("nope"));
        assert!(!db.destroy("nope"));
    }

    #[test]
    fn cursor_walks_in_key_order() {
        let db = Database::new();
        db.create_named("jobs");
        db.put("jobs", "b", "2").unwrap();
        db.put("jobs", "a", "1").unwrap();
        db.put("jobs", "c", "3").unwrap();

        assert_eq!(db.first("jobs").unwrap(), Some(("a".into(), "1".into())));
        assert_eq!(db.next("jobs").unwrap(), Some(("b".into(), "2".into())));
        assert_eq!(db.next("jobs").unwrap(), Some(("c".into(), "3".into())));
        assert_eq!(db.next("jobs").unwrap(), None);
        assert_eq!(db.next("jobs").unwrap(), None);

        assert!(db.reset("jobs"));
        assert_eq!(db.next("jobs").unwrap(), Some(("a".into(), "1".into())));
    }

    #[test]
    fn cursor_survives_deleting_current_key() {
        let db = Database::new();
        db.create_named("d");
        for key in ["a", "b", "c"] {
            db.put("d", key, key).unwrap();
        }
        assert_eq!(db.first("d").unwrap().unwrap().0, "a");
        db.delete("d", "a").unwrap();
        assert_eq!(db.next("d").unwrap().unwrap().0, "b");
    }

    #[test]
    fn name_cursor() {
        let db = Database::new();
        assert_eq!(db.first_db(), None);
        db.create_named("x");
        db.create_named("y");
        assert_eq!(db.first_db().as_deref(), Some("x"));
        assert_eq!(db.next_db().as_deref(), Some("y"));
        assert_eq!(db.next_db(), None);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn entry_format() {
        assert_eq!(format_entry("k", "v"), "key=k value=v");
    }
}
