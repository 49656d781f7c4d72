//! In-memory storage with optional JSON snapshot persistence.
//!
//! All tables sit behind one `RwLock`, so each trait method is atomic with
//! respect to every other. When opened with a snapshot path the store loads
//! the snapshot at startup; [`MemoryStore::spawn_flusher`] writes it back
//! whenever the tables changed and [`MemoryStore::flush`] writes it on
//! shutdown.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::types::{
    EphemeralId, EphemeralKey, EphemeralRecord, Fingerprint, IntermediaryId, TrackedIdentity,
    User,
};
use super::{Storage, StorageError};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Fingerprint, User>,
    identities: HashMap<IntermediaryId, TrackedIdentity>,
    ephemerals: BTreeMap<EphemeralKey, EphemeralRecord>,
    /// Secondary index: ephemeral id → record keys.
    by_ephemeral: HashMap<EphemeralId, BTreeSet<EphemeralKey>>,
}

impl Tables {
    fn insert_ephemeral(&mut self, record: EphemeralRecord) {
        self.by_ephemeral
            .entry(record.ephemeral_id)
            .or_default()
            .insert(record.key());
        self.ephemerals.insert(record.key(), record);
    }

    fn remove_ephemeral(&mut self, key: &EphemeralKey) -> Option<EphemeralRecord> {
        let record = self.ephemerals.remove(key)?;
        if let Some(keys) = self.by_ephemeral.get_mut(&record.ephemeral_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_ephemeral.remove(&record.ephemeral_id);
            }
        }
        Some(record)
    }

    /// Remove an identity and every ephemeral record derived from it.
    fn remove_identity(&mut self, intermediary_id: &IntermediaryId) {
        self.identities.remove(intermediary_id);
        let keys: Vec<EphemeralKey> = self
            .ephemerals
            .keys()
            .filter(|k| &k.intermediary_id == intermediary_id)
            .cloned()
            .collect();
        for key in &keys {
            self.remove_ephemeral(key);
        }
    }

    /// Drop `owner` from an identity, removing the identity if it was the last.
    fn release_identity(&mut self, intermediary_id: &IntermediaryId, owner: &Fingerprint) -> bool {
        let Some(identity) = self.identities.get_mut(intermediary_id) else {
            return false;
        };
        let removed = identity.owners.remove(owner);
        if identity.owners.is_empty() {
            self.remove_identity(intermediary_id);
        }
        removed
    }

    /// Remove a user and release every identity it tracks.
    fn remove_user(&mut self, fingerprint: &Fingerprint) -> bool {
        let removed = self.users.remove(fingerprint).is_some();
        let tracked: Vec<IntermediaryId> = self
            .identities
            .values()
            .filter(|identity| identity.owners.contains(fingerprint))
            .map(|identity| identity.intermediary_id.clone())
            .collect();
        for intermediary_id in &tracked {
            self.release_identity(intermediary_id, fingerprint);
        }
        removed
    }

    fn live_records(&self, ephemeral_id: EphemeralId, now: DateTime<Utc>) -> Vec<EphemeralRecord> {
        self.by_ephemeral
            .get(&ephemeral_id)
            .into_iter()
            .flatten()
            .filter_map(|key| self.ephemerals.get(key))
            .filter(|record| !record.is_expired(now))
            .cloned()
            .collect()
    }
}

/// On-disk form of the tables.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    users: Vec<User>,
    identities: Vec<TrackedIdentity>,
    ephemerals: Vec<EphemeralRecord>,
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            users: snapshot
                .users
                .into_iter()
                .map(|u| (u.fingerprint.clone(), u))
                .collect(),
            identities: snapshot
                .identities
                .into_iter()
                .map(|i| (i.intermediary_id.clone(), i))
                .collect(),
            ..Tables::default()
        };
        for record in snapshot.ephemerals {
            tables.insert_ephemeral(record);
        }
        tables
    }
}

impl From<&Tables> for Snapshot {
    fn from(tables: &Tables) -> Self {
        Self {
            users: tables.users.values().cloned().collect(),
            identities: tables.identities.values().cloned().collect(),
            ephemerals: tables.ephemerals.values().cloned().collect(),
        }
    }
}

/// Storage backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    /// Set by every write lock, cleared when a snapshot is taken.
    dirty: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a snapshot file.
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first [`flush`](Self::flush).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            log::info!(
                "[Storage] Loaded snapshot from {}: {} users, {} identities, {} ephemerals",
                path.display(),
                snapshot.users.len(),
                snapshot.identities.len(),
                snapshot.ephemerals.len()
            );
            Tables::from(snapshot)
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write the snapshot file, if this store has one.
    pub fn flush(&self) -> Result<(), StorageError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        // Writers are excluded while the read guard is held, so clearing
        // the flag here cannot lose a change.
        let content = {
            let tables = self.read()?;
            self.dirty.store(false, Ordering::SeqCst);
            serde_json::to_string_pretty(&Snapshot::from(&*tables))?
        };

        if let Err(e) = write_snapshot(path, &content) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        log::debug!("[Storage] Wrote snapshot to {}", path.display());
        Ok(())
    }

    /// Write the snapshot only if the tables changed since the last write.
    /// Returns whether a snapshot was written.
    pub fn flush_if_dirty(&self) -> Result<bool, StorageError> {
        if self.snapshot_path.is_none() || !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Write changed state every `interval` until `cancel` fires.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("[Storage] Snapshot writer started (every {interval:?})");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.flush_if_dirty() {
                    log::error!("[Storage] Snapshot write failed, will retry: {e}");
                }
            }

            log::info!("[Storage] Snapshot writer stopped");
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_poison| StorageError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        let guard = self.tables.write().map_err(|_poison| StorageError::Poisoned)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(guard)
    }
}

/// Replace `path` with `content` through a 0600 temp file and a rename.
fn write_snapshot(path: &Path, content: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[async_trait]
impl Storage for MemoryStore {
    async fn add_user(&self, user: User) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        if tables.users.contains_key(&user.fingerprint) {
            return Err(StorageError::AlreadyExists(format!(
                "user {}",
                user.fingerprint.short()
            )));
        }
        tables.users.insert(user.fingerprint.clone(), user);
        Ok(())
    }

    async fn upsert_user(&self, user: User) -> Result<(), StorageError> {
        self.write()?.users.insert(user.fingerprint.clone(), user);
        Ok(())
    }

    async fn get_user(&self, fingerprint: &Fingerprint) -> Result<Option<User>, StorageError> {
        Ok(self.read()?.users.get(fingerprint).cloned())
    }

    async fn delete_user(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        Ok(self.write()?.remove_user(fingerprint))
    }

    async fn register_token(&self, user: User) -> Result<Option<String>, StorageError> {
        let previous = self
            .write()?
            .users
            .insert(user.fingerprint.clone(), user)
            .map(|old| old.token);
        Ok(previous)
    }

    async fn unregister_token(
        &self,
        token: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        let owns_token = tables
            .users
            .get(fingerprint)
            .is_some_and(|user| user.token == token);
        Ok(owns_token && tables.remove_user(fingerprint))
    }

    async fn register_tracked_id(
        &self,
        intermediary_id: &IntermediaryId,
        owner: &Fingerprint,
        offset: i64,
        address_space_size: u8,
        at: DateTime<Utc>,
    ) -> Result<TrackedIdentity, StorageError> {
        let mut tables = self.write()?;
        let identity = tables
            .identities
            .entry(intermediary_id.clone())
            .or_insert_with(|| TrackedIdentity {
                intermediary_id: intermediary_id.clone(),
                owners: BTreeSet::new(),
                offset,
                address_space_size,
                registered_at: at,
            });
        identity.owners.insert(owner.clone());
        Ok(identity.clone())
    }

    async fn unregister_tracked_ids(
        &self,
        intermediary_id: &IntermediaryId,
        owner: &Fingerprint,
    ) -> Result<bool, StorageError> {
        Ok(self.write()?.release_identity(intermediary_id, owner))
    }

    async fn get_tracked_identity(
        &self,
        intermediary_id: &IntermediaryId,
    ) -> Result<Option<TrackedIdentity>, StorageError> {
        Ok(self.read()?.identities.get(intermediary_id).cloned())
    }

    async fn add_latest_ephemeral(
        &self,
        record: EphemeralRecord,
    ) -> Result<EphemeralRecord, StorageError> {
        let mut tables = self.write()?;
        if !tables.identities.contains_key(&record.intermediary_id) {
            return Err(StorageError::NotFound(format!(
                "tracked identity {}",
                record.intermediary_id.short()
            )));
        }
        if let Some(existing) = tables.ephemerals.get(&record.key()) {
            return Ok(existing.clone());
        }
        tables.insert_ephemeral(record.clone());
        Ok(record)
    }

    async fn get_ephemeral(
        &self,
        ephemeral_id: EphemeralId,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralRecord>, StorageError> {
        let records = self.read()?.live_records(ephemeral_id, now);
        if records.is_empty() {
            return Err(StorageError::NotFound(format!("ephemeral id {ephemeral_id}")));
        }
        Ok(records)
    }

    async fn get_latest_ephemeral(
        &self,
        intermediary_id: &IntermediaryId,
        now: DateTime<Utc>,
    ) -> Result<Option<EphemeralRecord>, StorageError> {
        Ok(self
            .read()?
            .ephemerals
            .values()
            .filter(|r| &r.intermediary_id == intermediary_id && !r.is_expired(now))
            .max_by_key(|r| r.offset)
            .cloned())
    }

    async fn identities_missing_epoch(
        &self,
        offset: i64,
    ) -> Result<Vec<TrackedIdentity>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .identities
            .values()
            .filter(|identity| {
                !tables.ephemerals.contains_key(&EphemeralKey {
                    intermediary_id: identity.intermediary_id.clone(),
                    offset,
                })
            })
            .cloned()
            .collect())
    }

    async fn expired_ephemerals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralKey>, StorageError> {
        Ok(self
            .read()?
            .ephemerals
            .values()
            .filter(|r| r.is_expired(now))
            .map(EphemeralRecord::key)
            .collect())
    }

    async fn delete_ephemeral(
        &self,
        key: &EphemeralKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        match tables.ephemerals.get(key) {
            Some(record) if record.is_expired(now) => Ok(tables.remove_ephemeral(key).is_some()),
            _ => Ok(false),
        }
    }

    async fn users_for_ephemeral(
        &self,
        ephemeral_id: EphemeralId,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>, StorageError> {
        let tables = self.read()?;
        let owners: BTreeSet<&Fingerprint> = tables
            .live_records(ephemeral_id, now)
            .iter()
            .filter_map(|record| tables.identities.get(&record.intermediary_id))
            .flat_map(|identity| identity.owners.iter())
            .collect();
        Ok(owners
            .into_iter()
            .filter_map(|fp| tables.users.get(fp))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn user(fp: &str, token: &str) -> User {
        User {
            fingerprint: Fingerprint::from(fp),
            token: token.to_string(),
            app_id: "app".to_string(),
            public_key_pem: "pem".to_string(),
            registered_at: at(0),
        }
    }

    fn record(iid: &IntermediaryId, eid: i64, offset: i64, created: i64) -> EphemeralRecord {
        EphemeralRecord {
            intermediary_id: iid.clone(),
            ephemeral_id: EphemeralId(eid),
            offset,
            address_space_size: 16,
            created_at: at(created),
            expires_at: at(created) + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn test_add_user_rejects_duplicate() {
        let store = MemoryStore::new();
        store.add_user(user("k1", "tokA")).await.expect("first insert");
        let err = store.add_user(user("k1", "tokB")).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_register_token_replaces_token() {
        let store = MemoryStore::new();
        assert_eq!(store.register_token(user("k1", "tokA")).await.expect("register"), None);
        assert_eq!(
            store.register_token(user("k1", "tokB")).await.expect("register"),
            Some("tokA".to_string())
        );
        let stored = store.get_user(&Fingerprint::from("k1")).await.expect("get");
        assert_eq!(stored.map(|u| u.token), Some("tokB".to_string()));
        assert_eq!(store.read().expect("lock").users.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_token_requires_matching_token() {
        let store = MemoryStore::new();
        let fp = Fingerprint::from("k1");
        store.register_token(user("k1", "tokB")).await.expect("register");

        assert!(!store.unregister_token("tokA", &fp).await.expect("unregister"));
        assert!(store.get_user(&fp).await.expect("get").is_some());

        assert!(store.unregister_token("tokB", &fp).await.expect("unregister"));
        assert!(!store.unregister_token("tokB", &fp).await.expect("unregister again"));
        assert!(store.get_user(&fp).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_delete_user_releases_identities() {
        let store = MemoryStore::new();
        let iid = IntermediaryId::new(b"abc123".to_vec());
        let k1 = Fingerprint::from("k1");
        let k2 = Fingerprint::from("k2");
        store.upsert_user(user("k1", "t1")).await.expect("upsert");
        store.upsert_user(user("k2", "t2")).await.expect("upsert");
        store.register_tracked_id(&iid, &k1, 5, 16, at(0)).await.expect("track");
        store.register_tracked_id(&iid, &k2, 5, 16, at(0)).await.expect("track");
        store.add_latest_ephemeral(record(&iid, 7, 5, 0)).await.expect("add");

        store.delete_user(&k1).await.expect("delete");
        let identity = store.get_tracked_identity(&iid).await.expect("get").expect("still tracked");
        assert_eq!(identity.owners.len(), 1);

        store.delete_user(&k2).await.expect("delete");
        assert!(store.get_tracked_identity(&iid).await.expect("get").is_none());
        assert!(store.get_ephemeral(EphemeralId(7), at(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_register_tracked_id_keeps_original_size() {
        let store = MemoryStore::new();
        let iid = IntermediaryId::new(b"abc123".to_vec());
        store
            .register_tracked_id(&iid, &Fingerprint::from("k1"), 5, 16, at(0))
            .await
            .expect("track");
        let identity = store
            .register_tracked_id(&iid, &Fingerprint::from("k2"), 9, 20, at(10))
            .await
            .expect("track");
        assert_eq!(identity.offset, 5);
        assert_eq!(identity.address_space_size, 16);
        assert_eq!(identity.owners.len(), 2);
    }

    #[tokio::test]
    async fn test_add_latest_ephemeral_first_writer_wins() {
        let store = MemoryStore::new();
        let iid = IntermediaryId::new(b"abc123".to_vec());
        store
            .register_tracked_id(&iid, &Fingerprint::from("k1"), 5, 16, at(0))
            .await
            .expect("track");

        let first = store.add_latest_ephemeral(record(&iid, 7, 5, 0)).await.expect("add");
        let second = store.add_latest_ephemeral(record(&iid, 7, 5, 60)).await.expect("add");
        assert_eq!(first, second);
        assert_eq!(store.read().expect("lock").ephemerals.len(), 1);
    }

    #[tokio::test]
    async fn test_add_latest_ephemeral_requires_identity() {
        let store = MemoryStore::new();
        let iid = IntermediaryId::new(b"gone".to_vec());
        let err = store.add_latest_ephemeral(record(&iid, 7, 5, 0)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_records_hidden_and_only_expired_deleted() {
        let store = MemoryStore::new();
        let iid = IntermediaryId::new(b"abc123".to_vec());
        store
            .register_tracked_id(&iid, &Fingerprint::from("k1"), 5, 16, at(0))
            .await
            .expect("track");
        store.add_latest_ephemeral(record(&iid, 7, 5, 0)).await.expect("add");
        store.add_latest_ephemeral(record(&iid, 8, 6, 86_400)).await.expect("add");

        let now = at(86_400 + 10);
        assert!(store.get_ephemeral(EphemeralId(7), now).await.is_err());
        assert_eq!(store.get_ephemeral(EphemeralId(8), now).await.expect("live").len(), 1);

        let expired = store.expired_ephemerals(now).await.expect("expired");
        assert_eq!(expired.len(), 1);
        assert!(store.delete_ephemeral(&expired[0], now).await.expect("delete"));

        let live_key = EphemeralKey { intermediary_id: iid.clone(), offset: 6 };
        assert!(!store.delete_ephemeral(&live_key, now).await.expect("delete live"));
        assert_eq!(
            store.get_latest_ephemeral(&iid, now).await.expect("latest").map(|r| r.offset),
            Some(6)
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        let iid = IntermediaryId::new(b"abc123".to_vec());

        {
            let store = MemoryStore::open(&path).expect("open");
            store.upsert_user(user("k1", "tokA")).await.expect("upsert");
            store
                .register_tracked_id(&iid, &Fingerprint::from("k1"), 5, 16, at(0))
                .await
                .expect("track");
            store.add_latest_ephemeral(record(&iid, 7, 5, 0)).await.expect("add");
            store.flush().expect("flush");
        }

        let reopened = MemoryStore::open(&path).expect("reopen");
        let users = reopened
            .users_for_ephemeral(EphemeralId(7), at(1))
            .await
            .expect("resolve");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].token, "tokA");
    }

    #[tokio::test]
    async fn test_flush_if_dirty_skips_unchanged_tables() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = MemoryStore::open(&path).expect("open");

        assert!(!store.flush_if_dirty().expect("clean flush"));
        assert!(!path.exists());

        store.upsert_user(user("k1", "tokA")).await.expect("upsert");
        assert!(store.flush_if_dirty().expect("dirty flush"));
        assert!(path.exists());
        assert!(!store.flush_if_dirty().expect("second flush"));

        // Reads do not mark the store dirty.
        store.get_user(&Fingerprint::from("k1")).await.expect("get");
        assert!(!store.flush_if_dirty().expect("after read"));

        #[cfg(unix)]
        {
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_flusher_persists_without_shutdown_flush() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = Arc::new(MemoryStore::open(&path).expect("open"));

        let cancel = CancellationToken::new();
        let flusher =
            Arc::clone(&store).spawn_flusher(std::time::Duration::from_millis(20), cancel.clone());
        store.upsert_user(user("k1", "tokA")).await.expect("upsert");

        let mut persisted = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if path.exists() {
                let reopened = MemoryStore::open(&path).expect("reopen");
                persisted = reopened.get_user(&Fingerprint::from("k1")).await.expect("get");
                if persisted.is_some() {
                    break;
                }
            }
        }
        // Stop the writer without a final flush, as after a crash.
        flusher.abort();
        let _ = flusher.await;

        assert_eq!(persisted.expect("user persisted").token, "tokA");
    }
}
