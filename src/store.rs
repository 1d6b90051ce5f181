use bytes::Bytes;
use num_traits::CheckedAdd;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq)]
pub enum IncrError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("increment or decrement would overflow")]
    Overflow,
}

/// The Store is responsible for managing key-value pairs. It is designed to be thread-safe,
/// allowing it to be shared and cloned cheaply using reference counting.
///
/// Every operation takes the lock once, so a read-modify-write such as `incr` is never observed
/// half done.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    keys: HashMap<Bytes, Bytes>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        self.read().keys.get(key.as_ref()).cloned()
    }

    pub fn set(&self, key: impl Into<Bytes>, data: Bytes) {
        self.write().keys.insert(key.into(), data);
    }

    /// Removes the given keys and returns how many of them existed.
    pub fn del<I>(&self, keys: I) -> i64
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut state = self.write();
        keys.into_iter()
            .filter(|key| state.keys.remove(key.as_ref()).is_some())
            .count() as i64
    }

    /// Increments the integer stored at `key` by one. A missing key counts as zero.
    pub fn incr(&self, key: impl AsRef<[u8]>) -> Result<i64, IncrError> {
        self.write().incr_by(key.as_ref(), 1)
    }

    pub fn len(&self) -> usize {
        self.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Mutations are single map operations, a poisoned lock still guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn incr_by<T>(&mut self, key: &[u8], increment: T) -> Result<T, IncrError>
    where
        T: FromStr + ToString + CheckedAdd + Default,
    {
        let value = match self.keys.get(key) {
            Some(value) => std::str::from_utf8(value.as_ref())
                .ok()
                .and_then(|s| s.parse::<T>().ok())
                .ok_or(IncrError::NotAnInteger)?,
            None => T::default(),
        };

        let value = value
            .checked_add(&increment)
            .ok_or(IncrError::Overflow)?;
        self.keys
            .insert(Bytes::copy_from_slice(key), Bytes::from(value.to_string()));

        Ok(value)
    }
}
