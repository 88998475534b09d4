// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Persistence of session snapshots, so a node restarting mid-protocol resumes where it stopped
//! instead of stranding its escrowed deposit.

use parking_lot::Mutex;
use thiserror::Error;

use std::collections::HashMap;
use std::error;
use std::sync::Arc;

use crate::session::SessionId;

/// Errors returned by a session store. [`Self::Other`] can carry out errors from external
/// sources.
#[derive(Error, Debug)]
pub enum Error {
    /// The storage backend cannot be reached.
    #[error("Session store unavailable")]
    Unavailable,
    /// Any storage error not part of this list.
    #[error("Store error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new store error of type other with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Consumes the `Error`, returning its inner error (if any).
    ///
    /// If this [`enum@Error`] was constructed via [`new`] then this function will return [`Some`],
    /// otherwise it will return [`None`].
    ///
    /// [`new`]: Error::new
    ///
    pub fn into_inner(self) -> Option<Box<dyn error::Error + Send + Sync>> {
        match self {
            Self::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// Key-value storage of session snapshots, keyed by session identifier.
pub trait SessionStore {
    /// Insert or replace the snapshot of a session.
    fn save(&self, id: SessionId, snapshot: Vec<u8>) -> Result<(), Error>;

    fn load(&self, id: SessionId) -> Result<Option<Vec<u8>>, Error>;

    /// Remove a snapshot, removing an unknown session is not an error.
    fn remove(&self, id: SessionId) -> Result<(), Error>;

    /// Identifiers of every stored session.
    fn list(&self) -> Result<Vec<SessionId>, Error>;
}

impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    fn save(&self, id: SessionId, snapshot: Vec<u8>) -> Result<(), Error> {
        (**self).save(id, snapshot)
    }

    fn load(&self, id: SessionId) -> Result<Option<Vec<u8>>, Error> {
        (**self).load(id)
    }

    fn remove(&self, id: SessionId) -> Result<(), Error> {
        (**self).remove(id)
    }

    fn list(&self) -> Result<Vec<SessionId>, Error> {
        (**self).list()
    }
}

/// Volatile store, for tests and nodes embedding their own persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<SessionId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, id: SessionId, snapshot: Vec<u8>) -> Result<(), Error> {
        self.snapshots.lock().insert(id, snapshot);
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.snapshots.lock().get(&id).cloned())
    }

    fn remove(&self, id: SessionId) -> Result<(), Error> {
        self.snapshots.lock().remove(&id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionId>, Error> {
        let mut ids: Vec<SessionId> = self.snapshots.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_replaces_and_removes() {
        let store = MemoryStore::new();
        let id = SessionId::random();
        assert_eq!(store.load(id).unwrap(), None);
        store.save(id, vec![1]).unwrap();
        store.save(id, vec![2]).unwrap();
        assert_eq!(store.load(id).unwrap(), Some(vec![2]));
        assert_eq!(store.list().unwrap(), vec![id]);
        store.remove(id).unwrap();
        store.remove(id).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn shared_store_sees_the_same_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let other = Arc::clone(&store);
        let id = SessionId::random();
        store.save(id, vec![0xab]).unwrap();
        assert_eq!(SessionStore::load(&other, id).unwrap(), Some(vec![0xab]));
    }
}
