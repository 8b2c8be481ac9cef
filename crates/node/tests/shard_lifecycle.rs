//! End-to-end shard lifecycle tests over the in-memory chain.
//!
//! Each test wires real node halves (gateway + provider) with real TCP
//! protocol listeners and tempdir-backed stores, and drives them through
//! the mock chain: create + load, forced update, retry-to-terminate,
//! migration, renewal, permission gating and crash recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Notify;

use sao_chain::{ChainStore, MockChain, OrderStatus, ShardStatus};
use sao_common::cid::{calculate_cid, new_data_id};
use sao_common::config;
use sao_common::did::DidManager;
use sao_common::Error;
use sao_node::index::{self, Datastore};
use sao_node::node::Node;
use sao_node::server;
use sao_node::state::{MigrateState, ShardInfo, ShardState, MAX_RETRIES};
use sao_proto::model::parse_commit;
use sao_proto::patch::{canonicalize, generate_patch};
use sao_proto::proposal::{
    MetadataProposal, Operation, OrderProposal, OrderRenewProposal, OrderStoreProposal,
    Permission, PermissionProposal, QueryProposal, RenewProposal,
};
use sao_proto::shard::{AssignTxType, ShardAssignReq};
use sao_store::{LocalShardStore, ShardStore, StagingArea};

struct TestNode {
    node: Node,
    address: String,
    peer: String,
    staging: Arc<StagingArea>,
    store: Arc<LocalShardStore>,
    shutdown: Arc<Notify>,
    _dir: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

async fn spawn_node(name: &str, chain: &Arc<MockChain>) -> TestNode {
    let dir = TempDir::new().expect("tmpdir");
    spawn_node_in(name, chain, dir).await
}

async fn spawn_node_in(name: &str, chain: &Arc<MockChain>, dir: TempDir) -> TestNode {
    let store = Arc::new(LocalShardStore::new(dir.path().join("store")).expect("store"));
    let staging = Arc::new(StagingArea::new(dir.path().join("staging")).expect("staging"));
    let ds = Datastore::open(dir.path().join("datastore")).expect("datastore");
    let address = format!("sao1{}", name);

    let mut cfg = config::Node::default();
    cfg.http_file_server.path = dir.path().join("http-files").to_string_lossy().to_string();

    let chain_dyn: Arc<dyn ChainStore> = chain.clone();
    let mut node = Node::new(
        address.clone(),
        cfg,
        chain_dyn,
        store.clone() as Arc<dyn ShardStore>,
        staging.clone(),
        ds.clone(),
    );
    let shutdown = Arc::new(Notify::new());
    node.start(shutdown.clone()).expect("start node");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let peer = format!("/ip4/127.0.0.1/tcp/{}", port);
    {
        let storage = node.storage.clone();
        let gateway = node.gateway.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = server::serve(listener, storage, gateway, shutdown).await;
        });
    }

    TestNode { node, address, peer, staging, store, shutdown, _dir: dir }
}

fn signed_store_proposal(
    owner: &DidManager,
    gateway_address: &str,
    content: &[u8],
    data_id: &str,
    alias: &str,
    operation: Operation,
) -> OrderStoreProposal {
    let proposal = OrderProposal {
        owner: owner.did().to_string(),
        provider: gateway_address.to_string(),
        group_id: "app".to_string(),
        duration: 365,
        replica: 1,
        timeout: 60,
        alias: alias.to_string(),
        data_id: data_id.to_string(),
        commit_id: new_data_id(),
        tags: Vec::new(),
        cid: calculate_cid(content),
        rule: String::new(),
        extend_info: String::new(),
        size: content.len() as u64,
        operation,
    };
    let jws_signature = owner.create_jws(&proposal.signing_bytes().expect("signing bytes")).expect("jws");
    OrderStoreProposal { proposal, jws_signature }
}

fn signed_query(owner: &DidManager, gateway_peer: &str, keyword: &str) -> MetadataProposal {
    let proposal = QueryProposal {
        owner: owner.did().to_string(),
        keyword: keyword.to_string(),
        group_id: "app".to_string(),
        keyword_type: 0,
        last_valid_height: 1_000_000,
        gateway: gateway_peer.to_string(),
        commit_id: String::new(),
        version: String::new(),
    };
    let jws_signature = owner.create_jws(&proposal.signing_bytes().expect("signing bytes")).expect("jws");
    MetadataProposal { proposal, jws_signature }
}

async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

// ── scenario 1: create + load ───────────────────────────────────────────

#[tokio::test]
async fn test_create_and_load_end_to_end() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let content = canonicalize(br#""hello""#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "greeting", Operation::Create);
    let cid = proposal.proposal.cid.clone();
    let query = signed_query(&owner, &gw.peer, &data_id);

    let model = gw
        .node
        .model
        .create(&query, &proposal, 0, content.clone())
        .await
        .expect("create model");
    assert_eq!(model.version, "v0");
    assert_eq!(model.data_id, data_id);
    assert_eq!(model.commits.len(), 1);

    // staged copy is gone after the commit settles
    assert!(!gw.staging.is_staged(owner.did(), &cid));
    // the provider persisted the shard bytes
    assert!(provider.store.is_exist(&cid));

    // durable shard record reaches Complete with populated tx coordinates
    let order_id = model.order_id;
    wait_until("provider shard record complete", || {
        matches!(
            provider.node.storage.shard_status(order_id, &cid),
            Ok(ShardInfo { state: ShardState::Complete, .. })
        )
    })
    .await;
    let record = provider.node.storage.shard_status(order_id, &cid).expect("shard record");
    assert!(!record.complete_hash.is_empty());
    assert!(record.tries <= MAX_RETRIES);

    let loaded = gw.node.model.load(&query).await.expect("load model");
    assert_eq!(loaded.content, content);
    assert_eq!(loaded.version, "v0");
}

#[tokio::test]
async fn test_create_single_node_loopback() {
    let chain = Arc::new(MockChain::new());
    let node = spawn_node("solo", &chain).await;
    // one node plays both roles
    chain.register_provider(&node.address, &node.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let content = canonicalize(br#"{"kind":"solo"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &node.address, &content, &data_id, "solo", Operation::Create);
    let query = signed_query(&owner, &node.peer, &data_id);

    let model = node
        .node
        .model
        .create(&query, &proposal, 0, content.clone())
        .await
        .expect("create model");
    assert_eq!(model.version, "v0");
    assert!(node.store.is_exist(&proposal.proposal.cid));

    let loaded = node.node.model.load(&query).await.expect("load model");
    assert_eq!(loaded.content, content);
}

// ── scenario 2: forced update ───────────────────────────────────────────

#[tokio::test]
async fn test_force_update_appends_commit() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let origin = canonicalize(br#"{"name":"m","count":1}"#).expect("origin");
    let data_id = new_data_id();
    let create_proposal =
        signed_store_proposal(&owner, &gw.address, &origin, &data_id, "counted", Operation::Create);
    let query = signed_query(&owner, &gw.peer, &data_id);
    let created = gw
        .node
        .model
        .create(&query, &create_proposal, 0, origin.clone())
        .await
        .expect("create");

    let target = canonicalize(br#"{"name":"m","count":2,"extra":true}"#).expect("target");
    let patch = generate_patch(&origin, &target).expect("patch");
    let update_proposal =
        signed_store_proposal(&owner, &gw.address, &target, &data_id, "counted", Operation::ForceUpdate);

    let updated = gw
        .node
        .model
        .update(&query, &update_proposal, 0, patch)
        .await
        .expect("update");

    assert_eq!(updated.commits.len(), created.commits.len() + 1);
    assert_eq!(updated.commit_id, update_proposal.proposal.commit_id);
    assert_eq!(updated.content, target);
    assert_eq!(updated.version, "v1");

    // commits stay append-only with strictly increasing heights
    let heights: Vec<i64> = updated
        .commits
        .iter()
        .map(|c| parse_commit(c).expect("commit entry").1)
        .collect();
    assert!(heights.windows(2).all(|w| w[0] < w[1]), "heights: {:?}", heights);
    assert_eq!(updated.commits[0], created.commits[0]);

    // the provider holds the new content
    wait_until("updated shard stored", || provider.store.is_exist(&update_proposal.proposal.cid)).await;
    let stored = provider
        .store
        .get(&update_proposal.proposal.cid)
        .expect("get")
        .expect("stored");
    assert_eq!(stored, target);
}

// ── scenario 3: retry to terminate ──────────────────────────────────────

#[tokio::test]
async fn test_cid_mismatch_retries_then_terminates() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    let good = canonicalize(br#""good""#).expect("good");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &good, &data_id, "bad", Operation::Create);
    let cid = proposal.proposal.cid.clone();

    // the gateway's staging area serves bytes that do not hash to the cid
    gw.staging.stage(owner.did(), &cid, br#""evil""#).expect("stage");

    let (order_id, tx_hash) = chain.store_order(&gw.address, &proposal).await.expect("store order");
    let height = chain.get_last_height().await.expect("height");
    let resp = provider
        .node
        .storage
        .handle_shard_assign(ShardAssignReq {
            order_id,
            data_id: data_id.clone(),
            assignee: provider.address.clone(),
            tx_hash,
            height,
            assign_tx_type: AssignTxType::MsgStore,
        })
        .await;
    assert_eq!(resp.code, 0, "{}", resp.message);

    wait_until("shard terminates", || {
        matches!(
            provider.node.storage.shard_status(order_id, &cid),
            Ok(ShardInfo { state: ShardState::Terminate, .. })
        )
    })
    .await;

    let record = provider.node.storage.shard_status(order_id, &cid).expect("record");
    assert_eq!(record.tries, MAX_RETRIES);
    assert!(record.last_err.contains("ipfs cid"), "last_err: {}", record.last_err);
    // no progress was made
    assert!(!provider.store.is_exist(&cid));
    let order = chain.get_order(order_id).await.expect("order");
    assert_eq!(order.shards[&provider.address].status, ShardStatus::Waiting);

    // a terminated shard moves again only through an operator fix: repair
    // the staged bytes, reset, and the worker drives it to completion
    gw.staging.stage(owner.did(), &cid, &good).expect("restage");
    provider.node.storage.shard_fix(order_id, &cid).expect("fix");
    wait_until("fixed shard completes", || {
        matches!(
            provider.node.storage.shard_status(order_id, &cid),
            Ok(ShardInfo { state: ShardState::Complete, .. })
        )
    })
    .await;
    assert!(provider.store.is_exist(&cid));
    let order = chain.get_order(order_id).await.expect("order");
    assert_eq!(order.shards[&provider.address].status, ShardStatus::Completed);
}

// ── scenario 4: migration ───────────────────────────────────────────────

#[tokio::test]
async fn test_migration_moves_shard_and_completes() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let p1 = spawn_node("alpha", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&p1.address, &p1.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let content = canonicalize(br#"{"shard":"migrating"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "mig", Operation::Create);
    let cid = proposal.proposal.cid.clone();
    let query = signed_query(&owner, &gw.peer, &data_id);
    let model = gw
        .node
        .model
        .create(&query, &proposal, 0, content.clone())
        .await
        .expect("create");

    // second provider joins after the order completed
    let p2 = spawn_node("beta", &chain).await;
    chain.register_provider(&p2.address, &p2.peer);

    let (_, results) = p1.node.storage.migrate(vec![data_id.clone()]).await.expect("migrate");
    assert!(results[&data_id].starts_with("SUCCESS"), "{}", results[&data_id]);

    wait_until("migration record completes", || {
        p1.node
            .storage
            .migrate_list()
            .ok()
            .and_then(|infos| infos.into_iter().find(|m| m.data_id == data_id))
            .map(|m| m.state == MigrateState::Complete && !m.complete_tx_hash.is_empty())
            .unwrap_or(false)
    })
    .await;

    // the chain shows the handover and the destination holds the bytes
    let order = chain.get_order(model.order_id).await.expect("order");
    let entry = &order.shards[&p2.address];
    assert_eq!(entry.from, p1.address);
    assert_eq!(entry.status, ShardStatus::Completed);
    assert!(p2.store.is_exist(&cid));
}

// ── scenario 5: renew ───────────────────────────────────────────────────

#[tokio::test]
async fn test_renew_happy_path() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let content = canonicalize(br#"{"lease":"expiring"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "lease", Operation::Create);
    let query = signed_query(&owner, &gw.peer, &data_id);
    gw.node.model.create(&query, &proposal, 0, content.clone()).await.expect("create");

    let renew = RenewProposal {
        owner: owner.did().to_string(),
        duration: 30,
        timeout: 60,
        data_ids: vec![data_id.clone()],
    };
    let jws_signature = owner.create_jws(&renew.signing_bytes().expect("bytes")).expect("jws");
    let renew = OrderRenewProposal { proposal: renew, jws_signature };

    let (_, results) = gw.node.gateway.renew(&renew).await.expect("renew tx");
    let granted: HashMap<String, u64> = results
        .iter()
        .filter_map(|(id, r)| {
            r.strip_prefix("SUCCESS=").and_then(|o| o.parse().ok()).map(|o| (id.clone(), o))
        })
        .collect();
    assert_eq!(granted.len(), 1, "results: {:?}", results);
    let renew_order_id = granted[&data_id];

    gw.node.gateway.renew_models(60, granted).await.expect("renew models");

    // the renewal shard settles without refetching content
    let order = chain.get_order(renew_order_id).await.expect("order");
    assert_eq!(order.status, OrderStatus::Completed);
    wait_until("renew shard record completes", || {
        matches!(
            provider.node.storage.shard_status(renew_order_id, &proposal.proposal.cid),
            Ok(ShardInfo { state: ShardState::Complete, .. })
        )
    })
    .await;
    let record = provider
        .node
        .storage
        .shard_status(renew_order_id, &proposal.proposal.cid)
        .expect("record");
    assert!(record.is_renew());
}

// ── scenario 6: permission gating ───────────────────────────────────────

#[tokio::test]
async fn test_permission_update_gates_load() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    let reader_x = DidManager::generate();
    let reader_y = DidManager::generate();
    chain.register_sid_document(owner.sid_document());
    chain.register_sid_document(reader_x.sid_document());
    chain.register_sid_document(reader_y.sid_document());

    let content = canonicalize(br#"{"visibility":"restricted"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "gated", Operation::Create);
    let query = signed_query(&owner, &gw.peer, &data_id);
    gw.node.model.create(&query, &proposal, 0, content.clone()).await.expect("create");

    // owner grants read to X only
    let permission = Permission {
        owner: owner.did().to_string(),
        data_id: data_id.clone(),
        readonly_dids: vec![reader_x.did().to_string()],
        readwrite_dids: vec![],
    };
    let jws_signature = owner.create_jws(&permission.signing_bytes().expect("bytes")).expect("jws");
    gw.node
        .gateway
        .update_permission(&PermissionProposal { proposal: permission, jws_signature })
        .await
        .expect("update permission");

    let query_y = signed_query(&reader_y, &gw.peer, &data_id);
    let err = gw.node.model.load(&query_y).await.expect_err("Y must be refused");
    assert!(matches!(err, Error::QueryMetadataFailed(_)), "got: {}", err);

    let query_x = signed_query(&reader_x, &gw.peer, &data_id);
    let model = gw.node.model.load(&query_x).await.expect("X may read");
    assert_eq!(model.content, content);
}

// ── stale query rejection ───────────────────────────────────────────────

#[tokio::test]
async fn test_shard_load_rejects_stale_query() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    let provider = spawn_node("provider", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);
    chain.register_provider(&provider.address, &provider.peer);

    let owner = DidManager::generate();
    chain.register_sid_document(owner.sid_document());

    let content = canonicalize(br#"{"q":"stale"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "stale", Operation::Create);
    let cid = proposal.proposal.cid.clone();
    let query = signed_query(&owner, &gw.peer, &data_id);
    gw.node.model.create(&query, &proposal, 0, content).await.expect("create");

    // a query whose validity window is behind the chain head is refused
    let stale = QueryProposal {
        owner: owner.did().to_string(),
        keyword: data_id,
        group_id: "app".to_string(),
        last_valid_height: 1,
        gateway: gw.peer.clone(),
        ..Default::default()
    };
    let jws_signature = owner.create_jws(&stale.signing_bytes().expect("bytes")).expect("jws");
    let stale = MetadataProposal { proposal: stale, jws_signature };

    let resp = provider
        .node
        .storage
        .handle_shard_load(
            sao_proto::shard::ShardLoadReq {
                order_id: 1,
                owner: owner.did().to_string(),
                cid,
                proposal: Some(stale),
                relay_proposal: None,
                request_id: 5,
            },
            Some("127.0.0.1"),
        )
        .await;
    assert_ne!(resp.code, 0);
    assert!(resp.message.contains("LastValidHeight"), "message: {}", resp.message);
    assert_eq!(resp.request_id, 5, "responses echo the request id");
}

// ── crash recovery ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_recovery_replays_only_pending_records() {
    let chain = Arc::new(MockChain::new());
    let gw = spawn_node("gateway", &chain).await;
    chain.register_gateway(&gw.address, &gw.peer);

    // prepare the provider's disk state before the node process starts,
    // as if it crashed between MsgComplete steps
    let dir = TempDir::new().expect("tmpdir");
    let address = "sao1provider".to_string();
    chain.register_provider(&address, "/ip4/127.0.0.1/tcp/1");

    let owner = DidManager::generate();
    let content = canonicalize(br#"{"resume":"me"}"#).expect("content");
    let data_id = new_data_id();
    let proposal = signed_store_proposal(&owner, &gw.address, &content, &data_id, "resume", Operation::Create);
    let cid = proposal.proposal.cid.clone();
    let (order_id, _) = chain.store_order(&gw.address, &proposal).await.expect("store order");

    {
        let store = LocalShardStore::new(dir.path().join("store")).expect("store");
        store.store(&cid, &content).expect("preload shard bytes");
        let ds = Datastore::open(dir.path().join("datastore")).expect("ds");
        let stored = ShardInfo {
            order_id,
            data_id: data_id.clone(),
            cid: cid.clone(),
            owner: owner.did().to_string(),
            gateway: gw.address.clone(),
            order_operation: "1".to_string(),
            shard_operation: "1".to_string(),
            complete_hash: String::new(),
            complete_height: 0,
            size: content.len() as u64,
            tries: 1,
            expire_height: 0,
            state: ShardState::Stored,
            last_err: String::new(),
        };
        index::save_shard(&ds, &stored).expect("save stored record");

        // a terminated record must never be replayed
        let terminated = ShardInfo {
            order_id: 999,
            cid: "ffffffff".to_string(),
            state: ShardState::Terminate,
            tries: MAX_RETRIES,
            last_err: "gave up".to_string(),
            ..stored.clone()
        };
        index::save_shard(&ds, &terminated).expect("save terminated record");
        assert_eq!(index::pending_shards(&ds).expect("pending").len(), 1);
    }

    // restart: the node replays the pending record and finishes the job
    let restarted = spawn_node_in("provider", &chain, dir).await;
    wait_until("replayed shard completes", || {
        matches!(
            restarted.node.storage.shard_status(order_id, &cid),
            Ok(ShardInfo { state: ShardState::Complete, .. })
        )
    })
    .await;

    let order = chain.get_order(order_id).await.expect("order");
    assert_eq!(order.status, OrderStatus::Completed);

    // the terminated record was left untouched
    let terminated = restarted.node.storage.shard_status(999, "ffffffff").expect("terminated");
    assert_eq!(terminated.state, ShardState::Terminate);
    assert_eq!(terminated.tries, MAX_RETRIES);
}
