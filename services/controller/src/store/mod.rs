//! Typed, versioned object collections.
//!
//! Every write is compare-and-swap on `metadata.resource_version`; readers
//! get clones and never hold a lock across an await point. Changes are fanned
//! out on a broadcast channel that the controller manager turns into queue
//! keys.

mod resources;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleetplane_api::{ObjectKey, Resource};
use fleetplane_id::ResourceVersion;
use fleetplane_reconcile::Clock;
use thiserror::Error;
use tokio::sync::broadcast;

pub use resources::{fleet_index_value, ResourceStore, BY_FLEET, BY_NODE, BY_OWNER};

/// Capacity of each store's change channel. Slow watchers that fall further
/// behind get `Lagged` and must resync.
const WATCH_CAPACITY: usize = 4096;

/// Attempts made by [`Store::mutate`] before giving up on conflicts.
const MUTATE_ATTEMPTS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} was modified: expected version {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A change to one object.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// Created or updated; carries the stored object.
    Applied(T),
    /// Removed; carries the last stored object.
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Secondary index function: the index values an object is filed under.
pub type IndexFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Monotonic resource version source shared by every store.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    fn next(&self) -> ResourceVersion {
        ResourceVersion::new(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Last version handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct State<T> {
    objects: BTreeMap<ObjectKey, T>,
    /// index name -> index value -> keys
    indexes: HashMap<&'static str, HashMap<String, BTreeSet<ObjectKey>>>,
}

struct Inner<T> {
    state: RwLock<State<T>>,
    index_fns: Vec<(&'static str, IndexFn<T>)>,
    versions: Arc<VersionCounter>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<WatchEvent<T>>,
}

/// One kind's collection.
pub struct Store<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> Store<T> {
    pub fn new(
        versions: Arc<VersionCounter>,
        clock: Arc<dyn Clock>,
        index_fns: Vec<(&'static str, IndexFn<T>)>,
    ) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        let indexes = index_fns
            .iter()
            .map(|(name, _)| (*name, HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    objects: BTreeMap::new(),
                    indexes,
                }),
                index_fns,
                versions,
                clock,
                changes,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State<T>> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<T>> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.read().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.read().objects.values().cloned().collect()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<T> {
        self.read()
            .objects
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Objects filed under `value` in the named index. Unknown indexes
    /// yield nothing.
    pub fn list_index(&self, index: &str, value: &str) -> Vec<T> {
        let state = self.read();
        let Some(keys) = state.indexes.get(index).and_then(|idx| idx.get(value)) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| state.objects.get(k).cloned())
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.inner.changes.subscribe()
    }

    /// Store a new object. Assigns uid, creation time, generation and
    /// version; any caller-supplied version is ignored.
    pub fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        if key.name.is_empty() {
            return Err(StoreError::Invalid {
                kind: T::KIND,
                reason: "name is required".to_string(),
            });
        }

        let mut state = self.write();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }

        let meta = obj.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = T::new_uid();
        }
        meta.creation_timestamp = Some(self.inner.clock.now());
        meta.generation = 1;
        meta.resource_version = self.inner.versions.next();

        self.index(&mut state, &key, &obj);
        state.objects.insert(key, obj.clone());
        let _ = self.inner.changes.send(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    /// Replace an object if its version still matches the stored one.
    pub fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let mut state = self.write();
        let Some(current) = state.objects.get(&key) else {
            return Err(StoreError::NotFound { kind: T::KIND, key });
        };

        let expected = obj.meta().resource_version;
        let actual = current.meta().resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key,
                expected,
                actual,
            });
        }

        let spec_changed = current.spec_fingerprint() != obj.spec_fingerprint();
        let (uid, created, generation) = {
            let m = current.meta();
            (m.uid.clone(), m.creation_timestamp, m.generation)
        };

        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.generation = if spec_changed { generation + 1 } else { generation };
        meta.resource_version = self.inner.versions.next();

        self.unindex(&mut state, &key);
        self.index(&mut state, &key, &obj);
        state.objects.insert(key, obj.clone());
        let _ = self.inner.changes.send(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    /// Remove an object, optionally only if it is still at `precondition`.
    pub fn delete(
        &self,
        key: &ObjectKey,
        precondition: Option<ResourceVersion>,
    ) -> Result<T, StoreError> {
        let mut state = self.write();
        let Some(current) = state.objects.get(key) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.clone(),
            });
        };
        if let Some(expected) = precondition {
            let actual = current.meta().resource_version;
            if expected != actual {
                return Err(StoreError::Conflict {
                    kind: T::KIND,
                    key: key.clone(),
                    expected,
                    actual,
                });
            }
        }

        self.unindex(&mut state, key);
        let Some(removed) = state.objects.remove(key) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.clone(),
            });
        };
        let _ = self.inner.changes.send(WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    /// Read-modify-write with conflict retry.
    ///
    /// `f` gets a fresh copy on each attempt and returns whether it changed
    /// anything; nothing is written when it returns `Ok(false)`. Returns the
    /// stored object, or `None` if it does not exist.
    pub fn mutate<E, F>(&self, key: &ObjectKey, mut f: F) -> Result<Option<T>, E>
    where
        E: From<StoreError>,
        F: FnMut(&mut T) -> Result<bool, E>,
    {
        let mut last = None;
        for _ in 0..MUTATE_ATTEMPTS {
            let Some(mut obj) = self.get(key) else {
                return Ok(None);
            };
            if !f(&mut obj)? {
                return Ok(Some(obj));
            }
            match self.update(obj) {
                Ok(stored) => return Ok(Some(stored)),
                Err(e) if e.is_conflict() => last = Some(e),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last
            .unwrap_or(StoreError::Invalid {
                kind: T::KIND,
                reason: "mutation retries exhausted".to_string(),
            })
            .into())
    }

    fn index(&self, state: &mut State<T>, key: &ObjectKey, obj: &T) {
        for (name, f) in &self.inner.index_fns {
            let Some(index) = state.indexes.get_mut(name) else {
                continue;
            };
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&self, state: &mut State<T>, key: &ObjectKey) {
        let Some(current) = state.objects.get(key) else {
            return;
        };
        let values: Vec<(&'static str, Vec<String>)> = self
            .inner
            .index_fns
            .iter()
            .map(|(name, f)| (*name, f(current)))
            .collect();
        for (name, values) in values {
            let Some(index) = state.indexes.get_mut(name) else {
                continue;
            };
            for value in values {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_api::{Fleet, ObjectMeta};
    use fleetplane_reconcile::ManualClock;
    use fleetplane_testing::{fleet, template};

    fn store() -> Store<Fleet> {
        let owner: IndexFn<Fleet> = Arc::new(|f: &Fleet| {
            f.metadata.label("team").map(str::to_string).into_iter().collect()
        });
        Store::new(
            Arc::new(VersionCounter::default()),
            Arc::new(ManualClock::default()),
            vec![("team", owner)],
        )
    }

    #[test]
    fn test_create_assigns_identity() {
        let s = store();
        let created = s.create(fleet("f", 3)).unwrap();
        assert!(created.metadata.uid.starts_with("flt_"));
        assert_eq!(created.metadata.generation, 1);
        assert!(!created.metadata.resource_version.is_none());
        assert!(created.metadata.creation_timestamp.is_some());
        assert!(matches!(
            s.create(fleet("f", 1)),
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_is_compare_and_swap() {
        let s = store();
        let created = s.create(fleet("f", 3)).unwrap();

        let mut a = created.clone();
        a.spec.replicas = 4;
        let stored = s.update(a).unwrap();
        assert_eq!(stored.metadata.generation, 2);

        let mut stale = created;
        stale.spec.replicas = 5;
        let err = s.update(stale).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(s.get(&stored.key()).unwrap().spec.replicas, 4);
    }

    #[test]
    fn test_status_only_write_keeps_generation() {
        let s = store();
        let mut f = s.create(fleet("f", 3)).unwrap();
        f.status.ready_replicas = 3;
        let stored = s.update(f).unwrap();
        assert_eq!(stored.metadata.generation, 1);
    }

    #[test]
    fn test_index_follows_updates() {
        let s = store();
        let mut f = fleet("f", 1);
        f.metadata = ObjectMeta::named("default", "f").with_label("team", "red");
        let mut stored = s.create(f).unwrap();
        assert_eq!(s.list_index("team", "red").len(), 1);

        stored.metadata.labels.insert("team".into(), "blue".into());
        s.update(stored).unwrap();
        assert!(s.list_index("team", "red").is_empty());
        assert_eq!(s.list_index("team", "blue").len(), 1);

        s.delete(&ObjectKey::new("default", "f"), None).unwrap();
        assert!(s.list_index("team", "blue").is_empty());
        assert!(s.list_index("missing", "x").is_empty());
    }

    #[test]
    fn test_delete_precondition() {
        let s = store();
        let created = s.create(fleet("f", 1)).unwrap();
        let key = created.key();
        let stale = created.metadata.resource_version;
        s.mutate::<StoreError, _>(&key, |f| {
            f.spec.replicas = 2;
            Ok(true)
        })
        .unwrap();
        assert!(s.delete(&key, Some(stale)).unwrap_err().is_conflict());
        assert!(s.delete(&key, None).is_ok());
        assert!(s.delete(&key, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_mutate_skips_noop_writes() {
        let s = store();
        let created = s.create(fleet("f", 1)).unwrap();
        let out = s
            .mutate::<StoreError, _>(&created.key(), |_| Ok(false))
            .unwrap()
            .unwrap();
        assert_eq!(out.metadata.resource_version, created.metadata.resource_version);
        assert!(s
            .mutate::<StoreError, _>(&ObjectKey::new("default", "nope"), |_| Ok(true))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_changes_in_order() {
        let s = store();
        let mut rx = s.watch();
        let mut f = fleet("f", 1);
        f.spec.template = template("img:2");
        let created = s.create(f).unwrap();
        s.delete(&created.key(), None).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Applied(_)));
        match rx.recv().await.unwrap() {
            WatchEvent::Deleted(obj) => assert_eq!(obj.metadata.name, "f"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
