//! Type-erased state bag with typed keys.

use crate::errors::StateError;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// A named slot in the [`StateBag`] that always holds a `T`.
///
/// Keys are declared once as constants so that every reader and writer of a
/// slot agrees on its type at compile time.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    /// Declares a new key.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateKey")
            .field("name", &self.name)
            .field("type", &type_name::<T>())
            .finish()
    }
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Per-run key/value store shared by the steps of one pipeline.
///
/// The bag is lent to one step at a time as `&mut StateBag`; concurrent
/// workers never hold it. Once a key is published its type is fixed for the
/// rest of the run, and reads with any other type fail with
/// [`StateError::TypeMismatch`].
#[derive(Default)]
pub struct StateBag {
    entries: HashMap<String, Entry>,
}

impl StateBag {
    /// Creates a new empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a value, replacing any previous value of the same type.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TypeMismatch` if the key already holds another type.
    pub fn put<T>(&mut self, key: &StateKey<T>, value: T) -> Result<(), StateError>
    where
        T: Any + Send + Sync,
    {
        if let Some(existing) = self.entries.get(key.name) {
            if !existing.value.is::<T>() {
                return Err(StateError::TypeMismatch {
                    key: key.name.to_string(),
                    expected: existing.type_name,
                    found: type_name::<T>(),
                });
            }
        }

        self.entries.insert(
            key.name.to_string(),
            Entry {
                value: Box::new(value),
                type_name: type_name::<T>(),
            },
        );
        Ok(())
    }

    /// Reads a value the pipeline contract guarantees is present.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Missing` if absent, `StateError::TypeMismatch` if
    /// the stored value has another type.
    pub fn get<T: Any>(&self, key: &StateKey<T>) -> Result<&T, StateError> {
        self.get_opt(key)?
            .ok_or_else(|| StateError::missing(key.name))
    }

    /// Reads an optional value.
    ///
    /// Absence is `Ok(None)`; a value of the wrong type is still an error.
    pub fn get_opt<T: Any>(&self, key: &StateKey<T>) -> Result<Option<&T>, StateError> {
        match self.entries.get(key.name) {
            None => Ok(None),
            Some(entry) => entry
                .value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or_else(|| mismatch::<T>(key.name, entry)),
        }
    }

    /// Mutably borrows a present value.
    pub fn get_mut<T: Any>(&mut self, key: &StateKey<T>) -> Result<&mut T, StateError> {
        let entry = self
            .entries
            .get_mut(key.name)
            .ok_or_else(|| StateError::missing(key.name))?;
        let found = entry.type_name;
        entry
            .value
            .downcast_mut::<T>()
            .ok_or_else(|| StateError::TypeMismatch {
                key: key.name.to_string(),
                expected: type_name::<T>(),
                found,
            })
    }

    /// Removes and returns a value, if present.
    ///
    /// A value of the wrong type is left in place and reported as an error.
    pub fn take<T: Any>(&mut self, key: &StateKey<T>) -> Result<Option<T>, StateError> {
        match self.entries.get(key.name) {
            None => return Ok(None),
            Some(entry) if !entry.value.is::<T>() => {
                return Err(mismatch::<T>(key.name, entry));
            }
            Some(_) => {}
        }

        Ok(self
            .entries
            .remove(key.name)
            .and_then(|entry| entry.value.downcast::<T>().ok())
            .map(|boxed| *boxed))
    }

    /// Drops whatever value is stored under `name`, returning true if one was.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Checks if a key has been published.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the published key names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn mismatch<T>(key: &str, entry: &Entry) -> StateError {
    StateError::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
        found: entry.type_name,
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in self.keys() {
            if let Some(entry) = self.entries.get(key) {
                map.entry(&key, &entry.type_name);
            }
        }
        map.finish()
    }
}
