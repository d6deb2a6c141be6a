//! Device-level sync scenarios against an in-process sync service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kura_local::{
    BroadcastBus, Created, EditSession, KvStore, LeaseLocks, LocalBus, LocalRepo, LockError, Locks,
    MemoryKv, RemoteEvent, RemoteHistory, RemoteResult, RepoConfig, RepoError, ServiceRemote,
    SqliteKv,
};
use kura_store::{
    BlockSyncService, GcConfig, MemoryBlockStore, PullResult, ScanResult, SyncConfig, UpdateResult,
};
use kura_types::{Block, BlockId, Document, ErrorCode, JsonDocument, JsonOp, Patch, SessionId};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

type Repo = LocalRepo<JsonDocument>;
type Service = BlockSyncService<JsonDocument>;

/// Route repo logs through the test harness; `RUST_LOG` picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn id(s: &str) -> BlockId {
    BlockId::new(s).unwrap()
}

fn service() -> Service {
    BlockSyncService::new(Arc::new(MemoryBlockStore::new()))
        .with_config(SyncConfig::default().with_gc(GcConfig { enabled: false, ..GcConfig::default() }))
}

/// Every patch the server holds for `id`, in batch order.
async fn remote_patches(service: &Service, id: &BlockId) -> Vec<Patch> {
    service
        .scan(id, false, Some(0), 1_000)
        .await
        .unwrap()
        .batches
        .into_iter()
        .flat_map(|b| b.patches)
        .collect()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn assert_no_overlap(patches: &[Patch], sid: SessionId) {
    let mut ranges: Vec<(u64, u64)> = patches
        .iter()
        .filter(|p| p.sid() == sid)
        .map(|p| (p.time(), p.last_tick()))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 < pair[1].0, "overlapping ticks: {ranges:?}");
    }
}

#[tokio::test]
async fn test_same_device_concurrent_create_converges() {
    init_tracing();
    let svc = service();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn LocalBus> = Arc::new(BroadcastBus::new(64));
    let sid = SessionId::random();
    // two tabs of one device: shared store, locks, bus and session
    let tab = || {
        Repo::new(kv.clone(), ServiceRemote::shared(svc.clone()))
            .with_bus(bus.clone())
            .with_session(sid)
    };
    let (repo_a, repo_b) = (tab(), tab());

    let b = id("hero");
    let schema = json!({"age": 25, "name": "Super Woman"});
    let a = EditSession::open(repo_a.clone(), b.clone());
    let c = EditSession::open(repo_b.clone(), b.clone());
    a.edit(JsonOp::from_object(&schema)).unwrap();
    c.edit(JsonOp::from_object(&schema)).unwrap();

    let (ra, rc) = tokio::join!(a.sync(), c.sync());
    ra.unwrap();
    rc.unwrap();
    repo_a.flush_background().await;
    repo_b.flush_background().await;

    // one patch went in as created, the other was moved after it
    let stored = remote_patches(&svc, &b).await;
    assert_eq!(stored.len(), 2);
    let mut times: Vec<u64> = stored.iter().map(|p| p.time()).collect();
    times.sort();
    assert_eq!(times, vec![0, 2]);
    assert_no_overlap(&stored, sid);
    assert!(repo_a.frontier(&b).unwrap().is_empty());
    assert!(repo_a.dirty_blocks().unwrap().is_empty());

    a.sync().await.unwrap();
    c.sync().await.unwrap();
    assert_eq!(a.view().unwrap(), Some(schema.clone()));
    assert_eq!(c.view().unwrap(), Some(schema.clone()));
    assert_eq!(a.document().observed(sid), Some(3));
    assert_eq!(c.document().observed(sid), Some(3));

    c.edit([JsonOp::set("age", 26)]).unwrap();
    c.sync().await.unwrap();
    repo_b.flush_background().await;
    a.sync().await.unwrap();
    let expected = Some(json!({"age": 26, "name": "Super Woman"}));
    assert_eq!(a.view().unwrap(), expected);
    assert_eq!(svc.view(&b).await.unwrap(), expected);
    assert_no_overlap(&remote_patches(&svc, &b).await, sid);
}

#[tokio::test]
async fn test_offline_edits_reach_remote_after_reconnect() {
    init_tracing();
    let svc = service();
    let repo = Repo::new(Arc::new(MemoryKv::new()), ServiceRemote::shared(svc.clone()));
    let b = id("notes");

    let session = EditSession::open(repo.clone(), b.clone());
    session.edit([JsonOp::set("a", 1)]).unwrap();
    session.sync().await.unwrap();
    repo.flush_background().await;
    assert_eq!(svc.view(&b).await.unwrap(), Some(json!({"a": 1})));
    repo.spawn_sync_loop();

    repo.set_connected(false);
    session.edit([JsonOp::set("b", 2)]).unwrap();
    session.sync().await.unwrap();
    session.edit([JsonOp::set("a", 10)]).unwrap();
    session.sync().await.unwrap();

    // local view moved on, remote still shows the pre-offline state
    assert_eq!(session.view().unwrap(), Some(json!({"a": 10, "b": 2})));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(svc.view(&b).await.unwrap(), Some(json!({"a": 1})));
    assert_eq!(repo.dirty_blocks().unwrap(), vec![b.clone()]);
    assert_eq!(repo.frontier(&b).unwrap().len(), 2);
    let err = repo.push(&b).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Disconnected);

    repo.set_connected(true);
    eventually("remote to converge", || {
        let svc = svc.clone();
        let b = b.clone();
        async move { svc.view(&b).await.unwrap() == Some(json!({"a": 10, "b": 2})) }
    })
    .await;
    eventually("dirty marker to clear", || {
        let repo = repo.clone();
        async move { repo.dirty_blocks().unwrap().is_empty() }
    })
    .await;
    assert!(repo.frontier(&b).unwrap().is_empty());
    assert_eq!(repo.meta(&b).unwrap().unwrap().seq, 1);
    repo.shutdown().await;
}

#[tokio::test]
async fn test_sync_loop_pushes_dirty_blocks_on_start() {
    init_tracing();
    let svc = service();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let config = RepoConfig::default().with_retry_interval(Duration::from_millis(20));
    let repo = Repo::new(kv, ServiceRemote::shared(svc.clone())).with_config(config);
    let b = id("retried");

    repo.set_connected(false);
    let session = EditSession::open(repo.clone(), b.clone());
    session.edit([JsonOp::set("k", "v")]).unwrap();
    session.sync().await.unwrap();
    assert!(!svc.exists(&b).await.unwrap());

    // reconnected before any loop was watching
    repo.set_connected(true);
    assert_eq!(repo.dirty_blocks().unwrap(), vec![b.clone()]);
    repo.spawn_sync_loop();
    eventually("retry loop to push", || {
        let svc = svc.clone();
        let b = b.clone();
        async move { svc.exists(&b).await.unwrap() }
    })
    .await;
    repo.shutdown().await;
}

/// A remote that takes longer than any reasonable deadline to write.
struct SlowRemote {
    inner: ServiceRemote<JsonDocument>,
    delay: Duration,
}

#[async_trait]
impl RemoteHistory for SlowRemote {
    async fn read(&self, id: &BlockId) -> RemoteResult<Block> {
        self.inner.read(id).await
    }

    async fn create(&self, id: &BlockId, patches: Vec<Patch>) -> RemoteResult<Created> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(id, patches).await
    }

    async fn update(
        &self,
        id: &BlockId,
        patches: Vec<Patch>,
        last_known_seq: Option<i64>,
    ) -> RemoteResult<UpdateResult> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(id, patches, last_known_seq).await
    }

    async fn scan_fwd(&self, id: &BlockId, after_seq: i64) -> RemoteResult<PullResult> {
        self.inner.scan_fwd(id, after_seq).await
    }

    async fn scan_bwd(
        &self,
        id: &BlockId,
        before: Option<i64>,
        limit: u64,
        snapshot: bool,
    ) -> RemoteResult<ScanResult> {
        self.inner.scan_bwd(id, before, limit, snapshot).await
    }

    async fn delete(&self, id: &BlockId) -> RemoteResult<()> {
        self.inner.delete(id).await
    }

    fn listen(&self, id: &BlockId) -> BoxStream<'static, RemoteEvent> {
        self.inner.listen(id)
    }
}

#[tokio::test]
async fn test_slow_remote_times_out_and_keeps_frontier() {
    init_tracing();
    let svc = service();
    let remote = Arc::new(SlowRemote {
        inner: ServiceRemote::new(svc.clone()),
        delay: Duration::from_secs(30),
    });
    let config = RepoConfig::default().with_remote_timeout(Duration::from_millis(50));
    let repo = Repo::new(Arc::new(MemoryKv::new()), remote).with_config(config);
    let b = id("slow");

    let session = EditSession::open(repo.clone(), b.clone());
    session.edit([JsonOp::set("x", 1)]).unwrap();
    session.sync().await.unwrap();
    repo.flush_background().await;

    let err = repo.push(&b).await.unwrap_err();
    assert!(matches!(err, RepoError::Timeout(_)));
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(repo.frontier(&b).unwrap().len(), 1);
    assert_eq!(repo.dirty_blocks().unwrap(), vec![b.clone()]);
    assert!(!svc.exists(&b).await.unwrap());
    assert_eq!(session.view().unwrap(), Some(json!({"x": 1})));
}

#[tokio::test]
async fn test_processes_sharing_a_sqlite_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.db");
    let svc = service();
    let sid = SessionId::random();
    // separate handles and buses, as two processes would have
    let process = || {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&path).unwrap());
        Repo::new(kv, ServiceRemote::shared(svc.clone())).with_session(sid)
    };
    let (first, second) = (process(), process());
    let b = id("files/readme");

    let patch = JsonDocument::empty().build_patch(sid, vec![JsonOp::set("text", "hello")]).unwrap();
    let (r1, r2) = tokio::join!(
        first.create(&b, vec![patch.clone()], None),
        second.create(&b, vec![patch.clone()], None),
    );
    let (winner, loser) = match (r1, r2) {
        (Ok(_), Err(RepoError::Exists(_))) => (&first, &second),
        (Err(RepoError::Exists(_)), Ok(_)) => (&second, &first),
        other => panic!("expected exactly one create to win, got {other:?}"),
    };
    let appended = loser.rebase_and_merge(&b, vec![patch], None).await.unwrap();
    assert!(appended.restamped);

    winner.flush_background().await;
    loser.flush_background().await;
    loser.sync_all().await;

    let stored = remote_patches(&svc, &b).await;
    assert_eq!(stored.len(), 2);
    assert_no_overlap(&stored, sid);
    let view: Option<Value> = first.read(&b).await.unwrap().view();
    assert_eq!(view, Some(json!({"text": "hello"})));
    assert_eq!(second.get(&b).unwrap().map(|(d, _)| d.view()), Some(view));
}

#[tokio::test]
async fn test_long_push_keeps_the_sync_lease() {
    init_tracing();
    let svc = service();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let remote = Arc::new(SlowRemote {
        inner: ServiceRemote::new(svc.clone()),
        delay: Duration::from_millis(150),
    });
    let mut config = RepoConfig::default()
        .with_remote_timeout(Duration::from_millis(200))
        .with_max_push_patches(1);
    config.sync_lock_slack_ms = 20;
    let repo = Repo::new(kv.clone(), remote).with_config(config);
    let b = id("long");

    repo.set_connected(false);
    let mut doc = JsonDocument::empty();
    let patches: Vec<Patch> = (0..3)
        .map(|n| {
            let p = doc.build_patch(repo.session(), vec![JsonOp::set("n", n)]).unwrap();
            doc.apply(&p).unwrap();
            p
        })
        .collect();
    repo.create(&b, patches, None).await.unwrap();
    repo.set_connected(true);

    // three round trips of 150ms against a 220ms hold
    let push = tokio::spawn({
        let repo = repo.clone();
        let b = b.clone();
        async move { repo.push(&b).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let other = LeaseLocks::new(kv.clone())
        .acquire(&format!("sync:{b}"), Duration::from_millis(10), Duration::from_secs(1))
        .await;
    assert!(matches!(other, Err(LockError::Timeout(_))), "sync lease was taken mid-push");

    assert_eq!(push.await.unwrap().unwrap(), Some(2));
    assert!(repo.frontier(&b).unwrap().is_empty());
    assert_eq!(svc.view(&b).await.unwrap(), Some(json!({"n": 2})));
}
