//! Router fixture over in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cp_authz::{address_of, sign, Framing, SigningKey};
use cp_placement::{FirstFit, Node, Resources, GIB};
use cp_provider::{
    api,
    chain::{MemoryKeystore, MockChainClient},
    cluster::{InMemoryCluster, InMemoryImageBuilder},
    dispatcher::{DispatcherSettings, UbiDispatcher},
    pipeline::{PipelineConfig, RollbackConfig, SpacePipeline},
    proof::{ProofJobConfig, ProofJobRunner},
    reporter::StatusReporter,
    state::{AppState, NodeInfo},
    store::TaskStore,
};
use tokio::net::TcpListener;

pub const NODE_ID: &str = "node-it";

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub cluster: Arc<InMemoryCluster>,
    pub dispatcher: UbiDispatcher,
    pub pipeline: SpacePipeline,
    pub engine: SigningKey,
    pub hub: SigningKey,
    _reporter: StatusReporter,
    _repo: tempfile::TempDir,
    _data: tempfile::TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1/computing{path}", self.base_url)
    }

    /// Engine signature authorizing proof task `id`.
    pub fn task_signature(&self, id: u64) -> String {
        sign(&self.engine, format!("{NODE_ID}{id}").as_bytes(), Framing::Raw).unwrap()
    }

    /// Hub signature authorizing a space job sourced from `uri`.
    pub fn space_signature(&self, uri: &str) -> String {
        sign(&self.hub, format!("{NODE_ID}{uri}").as_bytes(), Framing::PersonalSign).unwrap()
    }
}

pub async fn spawn_app() -> TestApp {
    let repo = tempfile::tempdir().unwrap();
    std::fs::write(
        repo.path().join("fil-c2.env"),
        "FIL_PROOFS_PARAMETER_CACHE=/var/tmp/params\nRUST_GPU_TOOLS_CUSTOM_GPU=\"NVIDIA GeForce RTX 3090:10496\"\n",
    )
    .unwrap();
    let data = tempfile::tempdir().unwrap();

    let engine = SigningKey::from_slice(&[3u8; 32]).unwrap();
    let hub = SigningKey::from_slice(&[9u8; 32]).unwrap();
    let owner = SigningKey::from_slice(&[5u8; 32]).unwrap();

    let cluster = Arc::new(InMemoryCluster::with_nodes(vec![Node::new(
        "worker-1",
        Resources::new(16, 64 * GIB, 500 * GIB),
    )
    .with_label("INTEL", "true")
    .with_accelerator("NVIDIA 3090", 2)]));
    let store = TaskStore::in_memory();

    let dispatcher = UbiDispatcher::new(
        DispatcherSettings {
            node_id: NODE_ID.into(),
            engine_address: address_of(&engine).to_string(),
            callback_url: "http://127.0.0.1:8085/api/v1/computing/cp/docker/receive/ubi".into(),
            repo_path: repo.path().to_path_buf(),
        },
        store.clone(),
        cluster.clone(),
        Arc::new(MockChainClient::new(address_of(&owner))),
        Arc::new(MemoryKeystore::new().with_key(owner)),
        Arc::new(FirstFit),
    );

    let (status, reporter) = StatusReporter::channel(None, 64);
    let pipeline = SpacePipeline::new(
        PipelineConfig {
            node_id: NODE_ID.into(),
            multi_address: "/ip4/10.0.0.1/tcp/8085".into(),
            domain: ".example.org".into(),
            hub_address: address_of(&hub).to_string(),
            verify_sign: true,
            data_dir: data.path().to_path_buf(),
            inference_image: "lagrange/inference:v1".into(),
            rollback: RollbackConfig {
                poll_interval: Duration::from_millis(1),
                max_polls: 3,
            },
        },
        store,
        cluster.clone(),
        Arc::new(InMemoryImageBuilder::new()),
        Arc::new(FirstFit),
        status,
    )
    .unwrap();

    let proofs = ProofJobRunner::new(
        cluster.clone(),
        ProofJobConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        },
    );

    let state = AppState::new(
        NodeInfo {
            node_id: NODE_ID.into(),
            multi_address: "/ip4/10.0.0.1/tcp/8085".into(),
            ubi_task: true,
        },
        cluster.clone(),
        dispatcher.clone(),
        pipeline.clone(),
        proofs,
    );
    let app = api::create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        cluster,
        dispatcher,
        pipeline,
        engine,
        hub,
        _reporter: reporter,
        _repo: repo,
        _data: data,
    }
}
