//! Kiln in-RAM store: an [`ObjectStore`] with API-server semantics
//! (optimistic concurrency, generateName, cascading delete), plus in-memory
//! event and repository implementations. Backs tests and `kilnctl simulate`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use kiln_core::object::meta;
use kiln_core::{Json, ObjectKey, ObjectStore, StoreError, TypeKey};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::debug;

mod events;
mod repository;

pub use events::MemoryEvents;
pub use repository::MemoryRepository;

/// Store operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Change notification emitted after every successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: ObjectKey,
    pub object: Json,
    pub deleted: bool,
}

#[derive(Default)]
struct State {
    objects: FxHashMap<ObjectKey, Json>,
    rv: u64,
    last_ts: Option<chrono::DateTime<chrono::Utc>>,
    faults: FxHashMap<Op, VecDeque<StoreError>>,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    /// Strictly increasing creation timestamps so revision order is total.
    fn next_ts(&mut self) -> String {
        let mut now = chrono::Utc::now();
        if let Some(last) = self.last_ts {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_ts = Some(now);
        now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }

    fn fault(&mut self, op: Op) -> Result<(), StoreError> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self { state: Mutex::new(State::default()), changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> { self.changes.subscribe() }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn inject(&self, op: Op, err: StoreError, times: usize) {
        if let Ok(mut st) = self.state.lock() {
            let q = st.faults.entry(op).or_default();
            q.extend(std::iter::repeat(err).take(times));
        }
    }

    /// Replace an object's status the way another controller would.
    pub fn set_status(&self, key: &ObjectKey, status: Json) -> Result<Json, StoreError> {
        let mut st = self.lock()?;
        let rv = st.next_rv();
        let obj = st.objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        set_field(obj, "status", status);
        set_meta(obj, "resourceVersion", Json::String(rv));
        let out = obj.clone();
        drop(st);
        self.notify(key.clone(), out.clone(), false);
        Ok(out)
    }

    /// Every stored object, ordered by key.
    pub fn snapshot(&self) -> Vec<Json> {
        let Ok(st) = self.state.lock() else { return Vec::new() };
        let mut all: Vec<(&ObjectKey, &Json)> = st.objects.iter().collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize { self.state.lock().map(|s| s.objects.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn notify(&self, key: ObjectKey, object: Json, deleted: bool) {
        // no receivers is fine
        let _ = self.changes.send(StoreChange { key, object, deleted });
    }
}

fn set_field(obj: &mut Json, field: &str, v: Json) {
    if let Some(m) = obj.as_object_mut() {
        m.insert(field.to_string(), v);
    }
}

fn set_meta(obj: &mut Json, field: &str, v: Json) {
    if let Some(root) = obj.as_object_mut() {
        let m = root.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(m) = m.as_object_mut() {
            m.insert(field.to_string(), v);
        }
    }
}

fn generated_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect()
}

/// Everything except metadata and status; a change here bumps `generation`.
fn spec_of(obj: &Json) -> Json {
    match obj.as_object() {
        Some(m) => Json::Object(m.iter().filter(|(k, _)| *k != "metadata" && *k != "status").map(|(k, v)| (k.clone(), v.clone())).collect()),
        None => Json::Null,
    }
}

fn check_rv(incoming: &Json, current: &Json, key: &ObjectKey) -> Result<(), StoreError> {
    match meta::str_field(incoming, "resourceVersion") {
        Some(rv) if Some(rv) != meta::str_field(current, "resourceVersion") => Err(StoreError::Conflict(format!(
            "{}: the object has been modified; please apply your changes to the latest version and try again",
            key
        ))),
        _ => Ok(()),
    }
}

fn labels_match(obj: &Json, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| meta::label(obj, k) == Some(v.as_str()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::Get)?;
        Ok(st.objects.get(key).cloned())
    }

    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<Json>, StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::List)?;
        let mut out: Vec<(&ObjectKey, &Json)> = st
            .objects
            .iter()
            .filter(|(k, o)| {
                k.api_version == ty.api_version
                    && k.kind == ty.kind
                    && (namespace.is_none() || k.namespace.as_deref() == namespace)
                    && labels_match(o, labels)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out.into_iter().map(|(_, o)| o.clone()).collect())
    }

    async fn create(&self, mut obj: Json) -> Result<Json, StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::Create)?;
        let ty = TypeKey::of(&obj).ok_or_else(|| StoreError::Rejected("object must carry apiVersion and kind".into()))?;
        let name = match (meta::str_field(&obj, "name"), meta::str_field(&obj, "generateName")) {
            (Some(n), _) if !n.is_empty() => n.to_string(),
            (_, Some(g)) if !g.is_empty() => format!("{}{}", g, generated_suffix()),
            _ => return Err(StoreError::Rejected(format!("{}: metadata.name or metadata.generateName is required", ty))),
        };
        let key = ObjectKey::new(&ty, meta::str_field(&obj, "namespace"), name.clone());
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let rv = st.next_rv();
        let ts = st.next_ts();
        set_meta(&mut obj, "name", Json::String(name));
        set_meta(&mut obj, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut obj, "resourceVersion", Json::String(rv));
        set_meta(&mut obj, "creationTimestamp", Json::String(ts));
        set_meta(&mut obj, "generation", Json::from(1));
        if let Some(m) = obj.as_object_mut() {
            m.remove("status");
        }
        st.objects.insert(key.clone(), obj.clone());
        drop(st);
        debug!(object = %key, "memstore: created");
        metrics::counter!("kiln_memstore_writes_total", 1u64);
        self.notify(key, obj.clone(), false);
        Ok(obj)
    }

    async fn update(&self, mut obj: Json) -> Result<Json, StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::Update)?;
        let key = ObjectKey::of(&obj).ok_or_else(|| StoreError::Rejected("object must carry apiVersion, kind and name".into()))?;
        let current = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        check_rv(&obj, &current, &key)?;
        let generation = meta::generation(&current) + i64::from(spec_of(&obj) != spec_of(&current));
        let rv = st.next_rv();
        for f in ["uid", "creationTimestamp"] {
            if let Some(v) = current.get("metadata").and_then(|m| m.get(f)) {
                set_meta(&mut obj, f, v.clone());
            }
        }
        set_meta(&mut obj, "resourceVersion", Json::String(rv));
        set_meta(&mut obj, "generation", Json::from(generation));
        match current.get("status") {
            Some(s) => set_field(&mut obj, "status", s.clone()),
            None => {
                if let Some(m) = obj.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        st.objects.insert(key.clone(), obj.clone());
        drop(st);
        debug!(object = %key, generation, "memstore: updated");
        metrics::counter!("kiln_memstore_writes_total", 1u64);
        self.notify(key, obj.clone(), false);
        Ok(obj)
    }

    async fn update_status(&self, obj: Json) -> Result<Json, StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::UpdateStatus)?;
        let key = ObjectKey::of(&obj).ok_or_else(|| StoreError::Rejected("object must carry apiVersion, kind and name".into()))?;
        let current = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        check_rv(&obj, &current, &key)?;
        let rv = st.next_rv();
        let mut next = current;
        set_field(&mut next, "status", obj.get("status").cloned().unwrap_or(Json::Null));
        set_meta(&mut next, "resourceVersion", Json::String(rv));
        st.objects.insert(key.clone(), next.clone());
        drop(st);
        debug!(object = %key, "memstore: status updated");
        self.notify(key, next.clone(), false);
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut st = self.lock()?;
        st.fault(Op::Delete)?;
        let root = st.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut removed = vec![(key.clone(), root)];
        // cascade through owner references
        let mut i = 0;
        while i < removed.len() {
            let uid = meta::str_field(&removed[i].1, "uid").unwrap_or_default().to_string();
            let dependents: Vec<ObjectKey> =
                st.objects.iter().filter(|(_, o)| !uid.is_empty() && meta::is_owned_by(o, &uid)).map(|(k, _)| k.clone()).collect();
            for k in dependents {
                if let Some(o) = st.objects.remove(&k) {
                    removed.push((k, o));
                }
            }
            i += 1;
        }
        drop(st);
        debug!(object = %key, cascaded = removed.len() - 1, "memstore: deleted");
        for (k, o) in removed {
            self.notify(k, o, true);
        }
        Ok(())
    }
}
