//! Optimistic reconciliation between the in-memory collection, the local
//! store and the backend.
//!
//! Every mutation follows the same path: snapshot, apply in memory, write the
//! cache, then (online and with an endpoint) call the backend. A successful
//! call reconciles ids in place. A failed call restores the snapshot, writes
//! it back to the cache and returns a typed error. Reads never fail: the
//! cache is the fallback for any remote error.

use crate::model::{self, Guest, Resource, ResourceKind, RsvpStatus, Todo};
use crate::offline::OfflineSwitch;
use crate::remote::{RemoteError, RemoteStore};
use crate::share::AccessLevel;
use crate::store::LocalStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Who is driving the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    Owner,
    Shared { token: String, level: AccessLevel },
}

impl Access {
    pub fn can_write(&self) -> bool {
        match self {
            Access::Owner => true,
            Access::Shared { level, .. } => level.can_edit(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub offline: OfflineSwitch,
    pub access: Access,
}

impl SyncContext {
    pub fn new(offline: OfflineSwitch, access: Access) -> Self {
        Self { offline, access }
    }

    pub fn owner(offline: OfflineSwitch) -> Self {
        Self::new(offline, Access::Owner)
    }
}

/// Outcome of a user-triggered batch save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Server ids of records that were POSTed.
    pub created: Vec<String>,
    /// Server ids of records that were PUT.
    pub updated: Vec<String>,
    /// Record key and error message of every failed record.
    pub failed: Vec<(String, String)>,
}

impl SaveReport {
    pub fn attempted(&self) -> usize {
        self.created.len() + self.updated.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no {kind} record with id {key}")]
    NotFound { kind: ResourceKind, key: String },
    #[error("shared dashboard is view-only")]
    ReadOnly,
    #[error("offline mode is on; nothing was sent")]
    Offline,
    #[error("{kind} record {key} was changed by someone else; reload before editing")]
    Conflict { kind: ResourceKind, key: String },
    #[error("failed to sync {kind}: {source}")]
    Remote {
        kind: ResourceKind,
        #[source]
        source: RemoteError,
    },
    #[error("{} of {} {kind} records failed to save", .report.failed.len(), .report.attempted())]
    PartialBatch { kind: ResourceKind, report: SaveReport },
    #[error("invalid {kind} record: {source}")]
    Encode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the items of the last `load` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Cache,
    Empty,
}

/// One synchronized collection of records.
pub struct Collection<T: Resource> {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    ctx: SyncContext,
    items: Vec<T>,
}

impl<T: Resource> Collection<T> {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, ctx: SyncContext) -> Self {
        Self {
            store,
            remote,
            ctx,
            items: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        T::KIND
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Look a record up by server id or client id.
    pub fn find(&self, key: &str) -> Option<&T> {
        self.items.iter().find(|r| r.ids().matches(key))
    }

    /// Records that have never reached the backend.
    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter(|r| r.ids().is_local_only())
    }

    fn position(&self, key: &str) -> Result<usize, SyncError> {
        self.items
            .iter()
            .position(|r| r.ids().matches(key))
            .ok_or_else(|| SyncError::NotFound {
                kind: T::KIND,
                key: key.to_string(),
            })
    }

    /// True when mutations should be sent to the backend right now.
    fn remote_enabled(&self) -> bool {
        !self.ctx.offline.is_offline() && T::KIND.endpoint().is_some()
    }

    fn ensure_writable(&self) -> Result<(), SyncError> {
        if self.ctx.access.can_write() {
            Ok(())
        } else {
            warn!(kind = %T::KIND, "write rejected on view-only share");
            Err(SyncError::ReadOnly)
        }
    }

    async fn persist(&self) {
        self.store.set_data(T::KIND.cache_key(), &self.items).await;
    }

    fn encode(&self, record: &T) -> Result<Value, SyncError> {
        model::wire_body(record).map_err(|source| SyncError::Encode {
            kind: T::KIND,
            source,
        })
    }

    fn remote_error(&self, key: &str, err: RemoteError) -> SyncError {
        match err {
            RemoteError::Conflict { .. } => SyncError::Conflict {
                kind: T::KIND,
                key: key.to_string(),
            },
            source => SyncError::Remote {
                kind: T::KIND,
                source,
            },
        }
    }

    /// `local-<ms>`, bumped until unique within this collection.
    fn next_local_id(&self) -> String {
        let mut ms = Utc::now().timestamp_millis();
        loop {
            let candidate = model::local_id(ms);
            if self.find(&candidate).is_none() {
                return candidate;
            }
            ms += 1;
        }
    }

    /// Fold the backend's copy of a record into slot `idx`. The client id is
    /// kept as a secondary identifier when the server does not echo it.
    fn absorb(&mut self, idx: usize, saved: Value) -> T {
        let current = self.items[idx].clone();
        let Value::Object(fields) = saved else {
            return current;
        };
        let merged = serde_json::to_value(&current).map(|mut value| {
            if let Value::Object(target) = &mut value {
                target.extend(fields);
            }
            value
        });
        match merged.and_then(serde_json::from_value::<T>) {
            Ok(mut record) => {
                if record.ids().id.is_none() {
                    record.ids_mut().id = current.ids().id.clone();
                }
                self.items[idx] = record.clone();
                record
            }
            Err(err) => {
                warn!(?err, kind = %T::KIND, "server copy did not decode; keeping local record");
                current
            }
        }
    }

    /// Fill the collection from the local store. Returns whether a cached
    /// value existed.
    pub async fn load_cached(&mut self) -> bool {
        match self.store.get_data::<Vec<T>>(T::KIND.cache_key()).await {
            Some(items) => {
                self.items = items;
                true
            }
            None => {
                self.items.clear();
                false
            }
        }
    }

    /// Replace the collection with the backend's copy and write it to the
    /// cache. Records that only exist locally are kept after the server's.
    #[instrument(skip_all, fields(kind = %T::KIND))]
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        if self.ctx.offline.is_offline() {
            return Err(SyncError::Offline);
        }
        let raw = self
            .remote
            .fetch_all(T::KIND)
            .await
            .map_err(|source| SyncError::Remote {
                kind: T::KIND,
                source,
            })?;

        let mut fresh: Vec<T> = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<T>(value) {
                Ok(record) => fresh.push(record),
                Err(err) => warn!(?err, "skipping undecodable record"),
            }
        }
        let fetched = fresh.len();
        let pending: Vec<T> = self
            .items
            .drain(..)
            .filter(|r| r.ids().is_local_only())
            .collect();
        if !pending.is_empty() {
            debug!(pending = pending.len(), "keeping unsynced local records");
        }
        fresh.extend(pending);
        self.items = fresh;
        self.persist().await;
        debug!(fetched, "refreshed from server");
        Ok(fetched)
    }

    /// Cache first, then the backend when online. Never fails.
    pub async fn load(&mut self) -> LoadSource {
        let cached = self.load_cached().await;
        let fallback = if cached {
            LoadSource::Cache
        } else {
            LoadSource::Empty
        };
        if !self.remote_enabled() {
            return fallback;
        }
        match self.refresh().await {
            Ok(_) => LoadSource::Remote,
            Err(err) => {
                warn!(?err, kind = %T::KIND, "remote read failed; using cached data");
                fallback
            }
        }
    }

    /// Append a record, assigning a local id if it has none, and POST it.
    #[instrument(skip_all, fields(kind = %T::KIND))]
    pub async fn create(&mut self, mut record: T) -> Result<T, SyncError> {
        self.ensure_writable()?;
        let ids = record.ids();
        if ids.id.is_none() && ids.server_id.is_none() {
            record.ids_mut().id = Some(self.next_local_id());
        }
        let key = record.ids().key().unwrap_or_default().to_string();
        let body = if self.remote_enabled() && record.ids().is_local_only() {
            Some(self.encode(&record)?)
        } else {
            None
        };

        let snapshot = self.items.clone();
        self.items.push(record.clone());
        self.persist().await;

        let Some(body) = body else {
            debug!(%key, "created locally");
            return Ok(record);
        };
        match self.remote.create(T::KIND, &body).await {
            Ok(saved) => {
                let idx = self.items.len() - 1;
                let record = self.absorb(idx, saved);
                if record.ids().is_local_only() {
                    warn!(%key, "server response carried no _id; record stays local");
                }
                self.persist().await;
                info!(%key, server_id = ?record.ids().server_id, "created");
                Ok(record)
            }
            Err(err) => {
                warn!(?err, %key, "create failed; reverting");
                self.items = snapshot;
                self.persist().await;
                Err(self.remote_error(&key, err))
            }
        }
    }

    /// Edit a record in place and PUT it. Identity fields cannot be changed
    /// through `edit`.
    #[instrument(skip_all, fields(kind = %T::KIND, key = %key))]
    pub async fn update<F>(&mut self, key: &str, edit: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut T),
    {
        self.ensure_writable()?;
        let idx = self.position(key)?;
        let snapshot = self.items[idx].clone();
        let mut edited = snapshot.clone();
        edit(&mut edited);
        *edited.ids_mut() = snapshot.ids().clone();

        let target = match &snapshot.ids().server_id {
            Some(id) if self.remote_enabled() => Some((id.clone(), self.encode(&edited)?)),
            _ => None,
        };

        self.items[idx] = edited.clone();
        self.persist().await;

        let Some((id, body)) = target else {
            debug!("updated locally");
            return Ok(edited);
        };
        match self
            .remote
            .update(T::KIND, &id, &body, snapshot.ids().updated_at)
            .await
        {
            Ok(saved) => {
                let record = self.absorb(idx, saved);
                self.persist().await;
                debug!("updated");
                Ok(record)
            }
            Err(err) => {
                warn!(?err, "update failed; reverting");
                self.items[idx] = snapshot;
                self.persist().await;
                Err(self.remote_error(&id, err))
            }
        }
    }

    /// Apply a JSON merge patch (camelCase fields) to a record.
    pub async fn patch(&mut self, key: &str, patch: &Value) -> Result<T, SyncError> {
        let idx = self.position(key)?;
        let patched = model::merge_patch(&self.items[idx], patch).map_err(|source| {
            SyncError::Encode {
                kind: T::KIND,
                source,
            }
        })?;
        self.update(key, move |record| *record = patched).await
    }

    /// Remove exactly the record matching `key` and DELETE it remotely.
    #[instrument(skip_all, fields(kind = %T::KIND, key = %key))]
    pub async fn delete(&mut self, key: &str) -> Result<T, SyncError> {
        self.ensure_writable()?;
        let idx = self.position(key)?;
        let snapshot = self.items.clone();
        let removed = self.items.remove(idx);
        self.persist().await;

        let updated_at = removed.ids().updated_at;
        let server_id = removed.ids().server_id.clone();
        let Some(id) = server_id.filter(|_| self.remote_enabled()) else {
            debug!("deleted locally");
            return Ok(removed);
        };
        match self.remote.delete(T::KIND, &id, updated_at).await {
            Ok(()) => {
                debug!("deleted");
                Ok(removed)
            }
            Err(err) if err.is_not_found() => {
                debug!("already gone on server");
                Ok(removed)
            }
            Err(err) => {
                warn!(?err, "delete failed; reverting");
                self.items = snapshot;
                self.persist().await;
                Err(self.remote_error(&id, err))
            }
        }
    }

    /// User-triggered save of the whole collection: PUT records with a server
    /// id, POST the rest. Records that succeed stay committed even when
    /// others fail.
    #[instrument(skip_all, fields(kind = %T::KIND))]
    pub async fn save_all(&mut self) -> Result<SaveReport, SyncError> {
        self.ensure_writable()?;
        self.persist().await;
        if T::KIND.endpoint().is_none() {
            return Ok(SaveReport::default());
        }
        if self.ctx.offline.is_offline() {
            return Err(SyncError::Offline);
        }

        let mut report = SaveReport::default();
        for idx in 0..self.items.len() {
            let record = self.items[idx].clone();
            let key = record.ids().key().unwrap_or_default().to_string();
            let body = match self.encode(&record) {
                Ok(body) => body,
                Err(err) => {
                    report.failed.push((key, err.to_string()));
                    continue;
                }
            };
            let result = match &record.ids().server_id {
                Some(id) => self
                    .remote
                    .update(T::KIND, id, &body, record.ids().updated_at)
                    .await
                    .map(|saved| (false, saved)),
                None => self
                    .remote
                    .create(T::KIND, &body)
                    .await
                    .map(|saved| (true, saved)),
            };
            match result {
                Ok((created, saved)) => {
                    let record = self.absorb(idx, saved);
                    let server_id = record.ids().server_id.clone().unwrap_or(key);
                    if created {
                        report.created.push(server_id);
                    } else {
                        report.updated.push(server_id);
                    }
                }
                Err(err) => {
                    warn!(?err, %key, "record failed to save");
                    report.failed.push((key, err.to_string()));
                }
            }
        }
        self.persist().await;

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            failed = report.failed.len(),
            "saved"
        );
        if report.is_clean() {
            Ok(report)
        } else {
            Err(SyncError::PartialBatch {
                kind: T::KIND,
                report,
            })
        }
    }
}

impl Collection<Todo> {
    pub async fn toggle(&mut self, key: &str) -> Result<Todo, SyncError> {
        self.update(key, |todo| todo.completed = !todo.completed).await
    }
}

impl Collection<Guest> {
    pub async fn set_rsvp(&mut self, key: &str, status: RsvpStatus) -> Result<Guest, SyncError> {
        self.update(key, |guest| guest.rsvp_status = status).await
    }
}
