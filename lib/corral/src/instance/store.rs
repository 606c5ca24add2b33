// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory instance storage.
//!
//! Each record sits behind its own mutex so that updates to different
//! instances never contend. [`InstanceStore::try_update`] is the store's
//! conditional update: the closure sees the current record and either
//! returns the changes to make or an error, and the changes are applied only
//! if it succeeds. Installing a task marker through it is therefore a single
//! compare-and-set on the record.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use corral_types::{CellName, HostUuid, InstanceState, InstanceUuid};
use thiserror::Error;

use super::InstanceRecord;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Instance {0} not found")]
    NotFound(InstanceUuid),

    #[error("Instance {0} already exists")]
    Duplicate(InstanceUuid),
}

/// Criteria for [`InstanceStore::list`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct InstanceFilter {
    pub host: Option<HostUuid>,
    pub state: Option<InstanceState>,
    pub cell: Option<CellName>,

    /// Substring match on the instance name.
    pub name: Option<String>,

    /// Only instances that currently hold a task marker.
    pub with_task: bool,

    /// Include records in `DELETED`.
    pub include_deleted: bool,
}

impl InstanceFilter {
    fn matches(&self, record: &InstanceRecord) -> bool {
        if record.state.is_deleted() && !self.include_deleted {
            return false;
        }
        if self.with_task && record.task.is_none() {
            return false;
        }
        self.host.map_or(true, |h| record.host == Some(h))
            && self.state.map_or(true, |s| record.state == s)
            && self
                .cell
                .as_ref()
                .map_or(true, |c| record.cell.as_ref() == Some(c))
            && self
                .name
                .as_ref()
                .map_or(true, |n| record.name.contains(n.as_str()))
    }
}

#[derive(Default)]
pub struct InstanceStore {
    instances: RwLock<BTreeMap<InstanceUuid, Arc<Mutex<InstanceRecord>>>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(
        &self,
        id: InstanceUuid,
    ) -> Result<Arc<Mutex<InstanceRecord>>, StoreError> {
        self.instances
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn insert(&self, record: InstanceRecord) -> Result<(), StoreError> {
        let mut instances = self.instances.write().unwrap();
        if instances.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        instances.insert(record.id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub fn remove(&self, id: InstanceUuid) -> Option<InstanceRecord> {
        let entry = self.instances.write().unwrap().remove(&id)?;
        let record = entry.lock().unwrap().clone();
        Some(record)
    }

    pub fn get(&self, id: InstanceUuid) -> Result<InstanceRecord, StoreError> {
        let entry = self.entry(id)?;
        let record = entry.lock().unwrap().clone();
        Ok(record)
    }

    pub fn list(&self, filter: &InstanceFilter) -> Vec<InstanceRecord> {
        let entries: Vec<_> =
            self.instances.read().unwrap().values().cloned().collect();
        entries
            .into_iter()
            .filter_map(|e| {
                let record = e.lock().unwrap();
                filter.matches(&record).then(|| record.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `f` to a copy of the record and stores the copy only if `f`
    /// succeeds. Returns the updated record alongside `f`'s output.
    pub fn try_update<T, E>(
        &self,
        id: InstanceUuid,
        f: impl FnOnce(&mut InstanceRecord) -> Result<T, E>,
    ) -> Result<(T, InstanceRecord), E>
    where
        E: From<StoreError>,
    {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().unwrap();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        draft.generation += 1;
        draft.updated_at = Utc::now();
        *guard = draft.clone();
        Ok((out, draft))
    }

    /// Unconditionally applies `f` to the record.
    pub fn update(
        &self,
        id: InstanceUuid,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> Result<InstanceRecord, StoreError> {
        self.try_update(id, |r| {
            f(r);
            Ok::<_, StoreError>(())
        })
        .map(|((), record)| record)
    }
}
