use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use vivaha_sync::db;
use vivaha_sync::model::{Guest, ResourceKind, RsvpStatus, Todo};
use vivaha_sync::offline::OfflineSwitch;
use vivaha_sync::remote::{RemoteError, RemoteStore};
use vivaha_sync::share::{self, AccessLevel, ShareAccess};
use vivaha_sync::split::{ExpenseDraft, Ledger, SplitMode};
use vivaha_sync::store::LocalStore;
use vivaha_sync::sync::{Access, Collection, LoadSource, SyncContext, SyncError};

async fn setup_store() -> LocalStore {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    LocalStore::new(pool, "ana")
}

/// In-memory backend that records every call and can be told to fail.
#[derive(Default)]
struct RecordingRemote {
    records: Mutex<Vec<(ResourceKind, Value)>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, RemoteError)>>,
    clock: Mutex<i64>,
}

impl RecordingRemote {
    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn fail_next(&self, call: &str, err: RemoteError) {
        self.failures.lock().await.push((call.to_string(), err));
    }

    async fn seed(&self, kind: ResourceKind, mut record: Value) {
        record["updatedAt"] = json!(self.stamp().await);
        self.records.lock().await.push((kind, record));
    }

    async fn stored(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.records
            .lock()
            .await
            .iter()
            .find(|(k, r)| *k == kind && r["_id"] == id)
            .map(|(_, r)| r.clone())
    }

    /// Simulate another editor touching a record.
    async fn touch(&self, kind: ResourceKind, id: &str) {
        let stamp = self.stamp().await;
        let mut records = self.records.lock().await;
        if let Some((_, r)) = records.iter_mut().find(|(k, r)| *k == kind && r["_id"] == id) {
            r["updatedAt"] = json!(stamp);
        }
    }

    async fn forget(&self, kind: ResourceKind, id: &str) {
        self.records
            .lock()
            .await
            .retain(|(k, r)| !(*k == kind && r["_id"] == id));
    }

    async fn stamp(&self) -> String {
        let mut clock = self.clock.lock().await;
        *clock += 1;
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        (base + Duration::seconds(*clock)).to_rfc3339()
    }

    async fn enter(&self, call: String) -> Result<(), RemoteError> {
        self.calls.lock().await.push(call.clone());
        let mut failures = self.failures.lock().await;
        match failures.iter().position(|(c, _)| *c == call) {
            Some(idx) => Err(failures.remove(idx).1),
            None => Ok(()),
        }
    }
}

fn version_of(record: &Value) -> Option<DateTime<Utc>> {
    record["updatedAt"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn not_found() -> RemoteError {
    RemoteError::Status {
        status: 404,
        body: "{\"error\":\"Not found\"}".into(),
    }
}

#[async_trait]
impl RemoteStore for RecordingRemote {
    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<Value>, RemoteError> {
        self.enter(format!("GET {kind}")).await?;
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<Value, RemoteError> {
        self.enter(format!("POST {kind}")).await?;
        let count = self.records.lock().await.len() + 1;
        let mut record = body.clone();
        record["_id"] = json!(format!("srv-{count}"));
        record["updatedAt"] = json!(self.stamp().await);
        self.records.lock().await.push((kind, record.clone()));
        Ok(record)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        body: &Value,
        version: Option<DateTime<Utc>>,
    ) -> Result<Value, RemoteError> {
        self.enter(format!("PUT {kind}/{id}")).await?;
        let stamp = self.stamp().await;
        let mut records = self.records.lock().await;
        let (_, record) = records
            .iter_mut()
            .find(|(k, r)| *k == kind && r["_id"] == id)
            .ok_or_else(not_found)?;
        if version.is_some() && version != version_of(record) {
            return Err(RemoteError::Conflict { status: 409 });
        }
        if let (Some(target), Some(fields)) = (record.as_object_mut(), body.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        record["updatedAt"] = json!(stamp);
        Ok(record.clone())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        id: &str,
        _version: Option<DateTime<Utc>>,
    ) -> Result<(), RemoteError> {
        self.enter(format!("DELETE {kind}/{id}")).await?;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|(k, r)| !(*k == kind && r["_id"] == id));
        if records.len() == before {
            return Err(not_found());
        }
        Ok(())
    }

    async fn access_share(&self, token: &str) -> Result<ShareAccess, RemoteError> {
        self.enter(format!("GET share/{token}")).await?;
        Ok(ShareAccess {
            access_level: AccessLevel::Edit,
            couple_name: None,
            user_data: None,
        })
    }
}

struct Harness {
    store: LocalStore,
    remote: Arc<RecordingRemote>,
    offline: OfflineSwitch,
}

impl Harness {
    async fn new() -> Self {
        Self {
            store: setup_store().await,
            remote: Arc::new(RecordingRemote::default()),
            offline: OfflineSwitch::default(),
        }
    }

    fn collection<T: vivaha_sync::model::Resource>(&self) -> Collection<T> {
        Collection::new(
            self.store.clone(),
            self.remote.clone(),
            SyncContext::owner(self.offline.clone()),
        )
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.store.get_data(key).await
    }
}

fn guest(name: &str) -> Guest {
    Guest {
        name: name.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn cached_reads_are_idempotent() {
    let h = Harness::new().await;
    h.offline.set_offline();
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();

    let mut first = h.collection::<Guest>();
    let mut second = h.collection::<Guest>();
    assert!(first.load_cached().await);
    assert!(second.load_cached().await);
    assert_eq!(first.items(), second.items());
    assert_eq!(first.items(), guests.items());
}

#[tokio::test]
async fn create_reconciles_server_id_without_duplicates() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    let created = guests.create(guest("Ana")).await.unwrap();

    assert_eq!(created.ids.server_id.as_deref(), Some("srv-1"));
    assert!(created.ids.id.as_deref().unwrap().starts_with("local-"));
    assert_eq!(guests.items().len(), 1);
    assert_eq!(guests.items()[0], created);
    assert_eq!(guests.pending().count(), 0);

    let cached: Vec<Guest> = h.cached("guests").await.unwrap();
    assert_eq!(cached, vec![created]);
    assert_eq!(h.remote.calls().await, vec!["POST guests"]);

    let stored = h.remote.stored(ResourceKind::Guests, "srv-1").await.unwrap();
    assert!(stored.get("id").is_none(), "local id leaked to server: {stored}");
}

#[tokio::test]
async fn offline_mutations_never_touch_the_network() {
    let h = Harness::new().await;
    h.offline.set_offline();
    let mut todos = h.collection::<Todo>();

    let created = todos
        .create(Todo {
            title: "Book venue".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let key = created.ids.id.clone().unwrap();
    todos.toggle(&key).await.unwrap();

    let cached: Vec<Todo> = h.cached("todos").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert!(cached[0].completed);

    todos.delete(&key).await.unwrap();
    let cached: Vec<Todo> = h.cached("todos").await.unwrap();
    assert!(cached.is_empty());

    assert_eq!(todos.load().await, LoadSource::Cache);
    assert!(h.remote.calls().await.is_empty());
}

#[tokio::test]
async fn read_failure_falls_back_to_cache() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();
    let before = guests.items().to_vec();

    h.remote.fail_next("GET guests", RemoteError::Timeout).await;
    let mut reloaded = h.collection::<Guest>();
    assert_eq!(reloaded.load().await, LoadSource::Cache);
    assert_eq!(reloaded.items(), before.as_slice());

    h.remote
        .fail_next("GET guests", RemoteError::Network("connection refused".into()))
        .await;
    let mut empty = Collection::<Guest>::new(
        h.store.scoped("ben"),
        h.remote.clone(),
        SyncContext::owner(h.offline.clone()),
    );
    assert_eq!(empty.load().await, LoadSource::Empty);
    assert!(empty.items().is_empty());
}

#[tokio::test]
async fn successful_read_overwrites_cache_but_keeps_unsynced_records() {
    let h = Harness::new().await;
    h.offline.set_offline();
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();

    h.remote
        .seed(ResourceKind::Guests, json!({"_id": "g9", "name": "Ben"}))
        .await;
    h.offline.set_online();

    let mut reloaded = h.collection::<Guest>();
    assert_eq!(reloaded.load().await, LoadSource::Remote);
    let names: Vec<&str> = reloaded.items().iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["Ben", "Ana"]);

    let cached: Vec<Guest> = h.cached("guests").await.unwrap();
    assert_eq!(cached.len(), 2);
}

#[tokio::test]
async fn delete_accepts_either_identifier() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    let ana = guests.create(guest("Ana")).await.unwrap();
    let ben = guests.create(guest("Ben")).await.unwrap();

    let removed = guests.delete(ana.ids.id.as_deref().unwrap()).await.unwrap();
    assert_eq!(removed.name, "Ana");
    assert_eq!(guests.items(), &[ben.clone()]);

    guests.delete("srv-2").await.unwrap();
    assert!(guests.items().is_empty());
    assert_eq!(
        h.remote.calls().await,
        vec!["POST guests", "POST guests", "DELETE guests/srv-1", "DELETE guests/srv-2"]
    );
}

#[tokio::test]
async fn offline_add_is_posted_by_save() {
    let h = Harness::new().await;
    h.offline.set_offline();
    let mut guests = h.collection::<Guest>();
    let ana = guests.create(guest("Ana")).await.unwrap();
    let local = ana.ids.id.clone().unwrap();
    assert!(local.starts_with("local-"));
    assert!(ana.ids.server_id.is_none());

    h.offline.set_online();
    let report = guests.save_all().await.unwrap();
    assert_eq!(report.created, vec!["srv-1"]);
    assert!(report.updated.is_empty());
    assert_eq!(h.remote.calls().await, vec!["POST guests"]);

    let saved = guests.find(&local).unwrap();
    assert_eq!(saved.ids.server_id.as_deref(), Some("srv-1"));
    assert_eq!(guests.items().len(), 1);

    // A second save PUTs instead of POSTing again.
    let report = guests.save_all().await.unwrap();
    assert_eq!(report.updated, vec!["srv-1"]);
    assert_eq!(h.remote.calls().await.len(), 2);
}

#[tokio::test]
async fn failed_create_reverts_and_reports() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();

    h.remote
        .fail_next(
            "POST guests",
            RemoteError::Status {
                status: 500,
                body: "{\"error\":\"Failed to create guest\"}".into(),
            },
        )
        .await;
    let err = guests.create(guest("Ben")).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote { kind: ResourceKind::Guests, .. }));

    assert_eq!(guests.items().len(), 1);
    let cached: Vec<Guest> = h.cached("guests").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].name, "Ana");
}

#[tokio::test]
async fn failed_update_restores_snapshot() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();

    h.remote
        .fail_next("PUT guests/srv-1", RemoteError::Timeout)
        .await;
    let err = guests
        .set_rsvp("srv-1", RsvpStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Remote { source: RemoteError::Timeout, .. }));
    assert_eq!(guests.find("srv-1").unwrap().rsvp_status, RsvpStatus::Pending);

    let cached: Vec<Guest> = h.cached("guests").await.unwrap();
    assert_eq!(cached[0].rsvp_status, RsvpStatus::Pending);

    let accepted = guests.set_rsvp("srv-1", RsvpStatus::Accepted).await.unwrap();
    assert_eq!(accepted.rsvp_status, RsvpStatus::Accepted);
    assert_ne!(accepted.ids.updated_at, cached[0].ids.updated_at);
}

#[tokio::test]
async fn stale_version_surfaces_conflict() {
    let h = Harness::new().await;
    let mut todos = h.collection::<Todo>();
    todos
        .create(Todo {
            title: "Order cake".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    h.remote.touch(ResourceKind::Todos, "srv-1").await;
    let err = todos.toggle("srv-1").await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict { kind: ResourceKind::Todos, ref key } if key == "srv-1"));
    assert!(!todos.find("srv-1").unwrap().completed);

    assert_eq!(todos.load().await, LoadSource::Remote);
    assert!(todos.toggle("srv-1").await.unwrap().completed);
}

#[tokio::test]
async fn delete_of_record_already_gone_succeeds() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();
    h.remote.forget(ResourceKind::Guests, "srv-1").await;

    guests.delete("srv-1").await.unwrap();
    assert!(guests.items().is_empty());
}

#[tokio::test]
async fn failed_delete_puts_record_back() {
    let h = Harness::new().await;
    let mut guests = h.collection::<Guest>();
    guests.create(guest("Ana")).await.unwrap();
    guests.create(guest("Ben")).await.unwrap();

    h.remote
        .fail_next("DELETE guests/srv-1", RemoteError::Network("reset".into()))
        .await;
    assert!(guests.delete("srv-1").await.is_err());
    let names: Vec<&str> = guests.items().iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["Ana", "Ben"]);
}

#[tokio::test]
async fn partial_save_keeps_committed_records() {
    let h = Harness::new().await;
    h.offline.set_offline();
    let mut guests = h.collection::<Guest>();
    let ana = guests.create(guest("Ana")).await.unwrap();
    let ben = guests.create(guest("Ben")).await.unwrap();
    h.offline.set_online();

    h.remote.fail_next("POST guests", RemoteError::Timeout).await;
    let report = match guests.save_all().await {
        Err(SyncError::PartialBatch { report, .. }) => report,
        other => panic!("expected partial batch, got {other:?}"),
    };
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ana.ids.id.clone().unwrap());
    assert_eq!(report.created.len(), 1);

    assert!(guests.find(ana.ids.id.as_deref().unwrap()).unwrap().ids.is_local_only());
    assert!(!guests.find(ben.ids.id.as_deref().unwrap()).unwrap().ids.is_local_only());
    let cached: Vec<Guest> = h.cached("guests").await.unwrap();
    assert_eq!(cached.iter().filter(|g| g.ids.server_id.is_some()).count(), 1);
}

#[tokio::test]
async fn view_only_share_never_reaches_backend() {
    let h = Harness::new().await;
    let ctx = SyncContext::new(
        h.offline.clone(),
        Access::Shared {
            token: "f".repeat(64),
            level: AccessLevel::View,
        },
    );
    let mut guests = Collection::<Guest>::new(h.store.scoped("shared:ffffffffffff"), h.remote.clone(), ctx);
    assert!(matches!(guests.create(guest("Ana")).await, Err(SyncError::ReadOnly)));
    assert!(matches!(guests.save_all().await, Err(SyncError::ReadOnly)));
    assert!(h.remote.calls().await.is_empty());

    // Reads are still allowed.
    assert_eq!(guests.load().await, LoadSource::Remote);
}

#[tokio::test]
async fn expenses_stay_local_even_online() {
    let h = Harness::new().await;
    let mut ledger = Ledger::new(
        h.store.clone(),
        h.remote.clone(),
        SyncContext::owner(h.offline.clone()),
    );
    ledger.load().await;
    let ana = ledger.add_person("Ana", None).await.unwrap();
    ledger.add_person("Ben", None).await.unwrap();
    let expense = ledger
        .add_expense(ExpenseDraft {
            category_name: "Venue".into(),
            description: "Deposit".into(),
            total_amount: 1000.0,
            paid_by: ana.id.clone(),
            mode: SplitMode::Equal,
        })
        .await
        .unwrap();
    assert!(expense.ids.is_local_only());
    assert_eq!(ledger.balances().len(), 1);
    assert!(h.remote.calls().await.is_empty());

    let cached: Vec<Value> = h.cached("vivahaSplitExpenses").await.unwrap();
    assert_eq!(cached.len(), 1);
}

#[tokio::test]
async fn shared_dashboard_reuses_cached_access_offline() {
    let h = Harness::new().await;
    let token = "ab".repeat(32);

    let online = share::open_shared(h.remote.as_ref(), &h.store, &h.offline, &token)
        .await
        .unwrap();
    assert_eq!(online.access.access_level, AccessLevel::Edit);
    assert_eq!(h.remote.calls().await, vec![format!("GET share/{token}")]);

    h.offline.set_offline();
    let link = format!("http://localhost:5174/shared/{token}");
    let offline = share::open_shared(h.remote.as_ref(), &h.store, &h.offline, &link)
        .await
        .unwrap();
    assert_eq!(offline.access, online.access);
    assert_eq!(h.remote.calls().await.len(), 1);

    let ctx = SyncContext::new(h.offline.clone(), offline.sync_access());
    let mut guests = Collection::<Guest>::new(h.store.scoped(offline.namespace()), h.remote.clone(), ctx);
    assert_eq!(guests.load().await, LoadSource::Empty);
    guests.create(guest("Ana")).await.unwrap();
    assert_eq!(h.remote.calls().await.len(), 1);
}
