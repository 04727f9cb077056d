use confluo::cluster::Directory;
use confluo::core::{
  Host, NodeAddress, RpcClient, RpcService, ServiceError,
};
use confluo::mixer::{MixerConfig, MixerError, MixerHandle, MixerPhase};
use confluo::server::{ModelServer, GET_DIFF};
use confluo::testkit::{LocalNet, StaticDirectory, TallyModel, TallyUpdate};
use serde_cbor::Value;
use std::sync::Arc;
use std::time::Duration;

const CLUSTER: &str = "mixer-test";

fn addr(port: u16) -> Arc<NodeAddress> {
  Arc::new(NodeAddress::new(
    Host::DNS("localhost".to_string()),
    port,
    CLUSTER.to_string(),
  ))
}

fn text(s: &str) -> Value {
  Value::Text(s.to_string())
}

fn update_args(updates: Vec<(&str, u64)>) -> Value {
  let items = updates
    .into_iter()
    .map(|(row, hits)| {
      confluo::core::encode(&TallyUpdate {
        row: row.to_string(),
        hits: hits,
      })
      .unwrap()
    })
    .collect();
  Value::Array(vec![text("t"), Value::Array(items)])
}

fn fast() -> MixerConfig {
  MixerConfig {
    interval: Duration::from_millis(25),
    count_threshold: u64::MAX,
  }
}

fn dormant() -> MixerConfig {
  MixerConfig {
    interval: Duration::from_secs(600),
    count_threshold: u64::MAX,
  }
}

fn trace_init() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
  for _ in 0..200 {
    if f() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  panic!("timed out waiting for {}", what);
}

struct Node {
  address: Arc<NodeAddress>,
  server: Arc<ModelServer<TallyModel>>,
}
impl Node {
  fn new(net: &Arc<LocalNet>, port: u16) -> Node {
    let address = addr(port);
    let mut server = ModelServer::new(address.clone(), TallyModel::new(), None);
    server.register_model_surface();
    let server = Arc::new(server);
    net.bind(address.clone(), server.clone());
    Node {
      address: address,
      server: server,
    }
  }

  fn start_mixer(
    &self,
    directory: &Arc<StaticDirectory>,
    net: &Arc<LocalNet>,
    config: MixerConfig,
  ) -> MixerHandle {
    self
      .server
      .start_mixer(
        directory.clone() as Arc<dyn Directory>,
        net.clone() as Arc<dyn RpcClient>,
        config,
      )
      .unwrap()
  }

  async fn rows(&self) -> Vec<Value> {
    let reply = self
      .server
      .handle("get_all_rows", Value::Array(vec![text("t")]))
      .await
      .unwrap();
    match reply {
      Value::Array(rows) => rows,
      v => panic!("unexpected get_all_rows reply: {:?}", v),
    }
  }
}

#[tokio::test]
async fn divergent_nodes_converge_after_one_round() {
  trace_init();
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  let b = Node::new(&net, 8001);
  directory.set_nodes(CLUSTER, vec![a.address.clone(), b.address.clone()]);
  a.server.handle("update", update_args(vec![("x", 3)])).await.unwrap();
  b.server.handle("update", update_args(vec![("y", 5)])).await.unwrap();
  // only a initiates; b just serves the diff endpoints
  let handle_a = a.start_mixer(&directory, &net, fast());
  let _handle_b = b.start_mixer(&directory, &net, dormant());
  wait_until("first completed round", || handle_a.completed_rounds() >= 1)
    .await;
  let expected = vec![text("x"), text("y")];
  assert_eq!(a.rows().await, expected);
  assert_eq!(b.rows().await, expected);
  let diff_a = net.call(&a.address, GET_DIFF, Value::Null).await.unwrap();
  let diff_b = net.call(&b.address, GET_DIFF, Value::Null).await.unwrap();
  assert_eq!(diff_a, diff_b);
}

#[tokio::test]
async fn further_rounds_leave_converged_nodes_unchanged() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  let b = Node::new(&net, 8001);
  directory.set_nodes(CLUSTER, vec![a.address.clone(), b.address.clone()]);
  a.server.handle("update", update_args(vec![("x", 3)])).await.unwrap();
  let handle_a = a.start_mixer(&directory, &net, fast());
  let _handle_b = b.start_mixer(&directory, &net, dormant());
  wait_until("first completed round", || handle_a.completed_rounds() >= 1)
    .await;
  let settled = net.call(&a.address, GET_DIFF, Value::Null).await.unwrap();
  let rounds = handle_a.completed_rounds();
  wait_until("two more rounds", || {
    handle_a.completed_rounds() >= rounds + 2
  })
  .await;
  let diff_a = net.call(&a.address, GET_DIFF, Value::Null).await.unwrap();
  let diff_b = net.call(&b.address, GET_DIFF, Value::Null).await.unwrap();
  assert_eq!(diff_a, settled);
  assert_eq!(diff_b, settled);
}

#[tokio::test]
async fn update_count_trigger_fires_before_the_interval() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  let b = Node::new(&net, 8001);
  directory.set_nodes(CLUSTER, vec![a.address.clone(), b.address.clone()]);
  let config = MixerConfig {
    interval: Duration::from_secs(600),
    count_threshold: 3,
  };
  let handle_a = a.start_mixer(&directory, &net, config);
  let _handle_b = b.start_mixer(&directory, &net, dormant());
  a.server
    .handle("update", update_args(vec![("x", 1), ("y", 1), ("z", 1)]))
    .await
    .unwrap();
  wait_until("count-triggered round", || handle_a.completed_rounds() >= 1)
    .await;
  assert_eq!(b.rows().await, vec![text("x"), text("y"), text("z")]);
}

#[tokio::test]
async fn second_start_fails_and_leaves_the_first_mixer_running() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  let b = Node::new(&net, 8001);
  directory.set_nodes(CLUSTER, vec![a.address.clone(), b.address.clone()]);
  let handle = a.start_mixer(&directory, &net, fast());
  let _handle_b = b.start_mixer(&directory, &net, dormant());
  let again = a.server.start_mixer(
    directory.clone() as Arc<dyn Directory>,
    net.clone() as Arc<dyn RpcClient>,
    fast(),
  );
  match again {
    Err(MixerError::AlreadyStarted) => {}
    Ok(_) => panic!("second start_mixer must fail"),
  }
  assert!(!handle.is_stopped());
  let rounds = handle.completed_rounds();
  wait_until("first mixer still rounds", || {
    handle.completed_rounds() > rounds
  })
  .await;
}

#[tokio::test]
async fn rounds_are_abandoned_while_the_peer_is_down() {
  trace_init();
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  let ghost = addr(8001);
  directory.set_nodes(CLUSTER, vec![a.address.clone(), ghost.clone()]);
  a.server.handle("update", update_args(vec![("x", 2)])).await.unwrap();
  let handle_a = a.start_mixer(&directory, &net, fast());
  tokio::time::sleep(Duration::from_millis(200)).await;
  // every round so far failed at the exchange; nothing completed, no panic
  assert_eq!(handle_a.completed_rounds(), 0);
  assert!(!handle_a.is_stopped());
  // the peer comes up and the next trigger succeeds
  let b = Node::new(&net, 8001);
  let _handle_b = b.start_mixer(&directory, &net, dormant());
  wait_until("recovery round", || handle_a.completed_rounds() >= 1).await;
  assert_eq!(b.rows().await, vec![text("x")]);
}

#[tokio::test]
async fn a_lone_node_idles_without_completing_rounds() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  directory.set_nodes(CLUSTER, vec![a.address.clone()]);
  let handle = a.start_mixer(&directory, &net, fast());
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(handle.completed_rounds(), 0);
  // a peerless round never reaches the exchange
  assert!(matches!(
    handle.phase(),
    MixerPhase::Idle | MixerPhase::Triggered
  ));
}

#[tokio::test]
async fn stop_halts_the_loop() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  directory.set_nodes(CLUSTER, vec![a.address.clone()]);
  let handle = a.start_mixer(&directory, &net, fast());
  assert!(!handle.is_stopped());
  handle.stop();
  wait_until("mixer shutdown", || handle.is_stopped()).await;
}

#[tokio::test]
async fn diff_endpoints_appear_once_the_mixer_runs() {
  let net = LocalNet::new();
  let directory = StaticDirectory::new();
  let a = Node::new(&net, 8000);
  directory.set_nodes(CLUSTER, vec![a.address.clone()]);
  match a.server.handle(GET_DIFF, Value::Null).await {
    Err(ServiceError::UnknownMethod(_)) => {}
    other => panic!("expected UnknownMethod, got {:?}", other),
  }
  let _handle = a.start_mixer(&directory, &net, dormant());
  a.server.handle(GET_DIFF, Value::Null).await.unwrap();
}
