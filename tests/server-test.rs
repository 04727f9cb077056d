use confluo::core::{encode, Host, NodeAddress, RpcService, ServiceError};
use confluo::model::Model;
use confluo::server::{ModelServer, GET_DIFF};
use confluo::testkit::{MemBlobStore, TallyModel, TallyQuery, TallyUpdate};
use serde_cbor::Value;
use std::sync::Arc;

fn addr(port: u16) -> Arc<NodeAddress> {
  Arc::new(NodeAddress::new(
    Host::DNS("localhost".to_string()),
    port,
    "server-test".to_string(),
  ))
}

fn server(port: u16) -> ModelServer<TallyModel> {
  let mut server = ModelServer::new(addr(port), TallyModel::new(), None);
  server.register_model_surface();
  server
}

fn text(s: &str) -> Value {
  Value::Text(s.to_string())
}

fn update_args(updates: Vec<(&str, u64)>) -> Value {
  let items = updates
    .into_iter()
    .map(|(row, hits)| {
      encode(&TallyUpdate {
        row: row.to_string(),
        hits: hits,
      })
      .unwrap()
    })
    .collect();
  Value::Array(vec![text("t"), Value::Array(items)])
}

fn score_args(rows: Vec<&str>) -> Value {
  let queries = rows
    .into_iter()
    .map(|row| {
      encode(&TallyQuery {
        row: row.to_string(),
      })
      .unwrap()
    })
    .collect();
  Value::Array(vec![text("t"), Value::Array(queries)])
}

#[tokio::test]
async fn batch_update_skips_bad_items_and_keeps_the_rest() {
  let server = server(6000);
  let batch =
    vec![("a", 1), ("b", 0), ("c", 3), ("d", 0), ("e", 5)];
  let reply = server.handle("update", update_args(batch)).await.unwrap();
  assert_eq!(reply, Value::Integer(3));
  assert_eq!(server.update_count(), 3);
  let scores = server
    .handle("calc_score", score_args(vec!["a", "c", "e"]))
    .await
    .unwrap();
  let expected = vec![Value::Float(1.0), Value::Float(3.0), Value::Float(5.0)];
  assert_eq!(scores, Value::Array(expected));
  // the items that failed never touched the model
  let rows = server
    .handle("get_all_rows", Value::Array(vec![text("t")]))
    .await
    .unwrap();
  assert_eq!(rows, Value::Array(vec![text("a"), text("c"), text("e")]));
}

#[tokio::test]
async fn analysis_output_shortens_on_failing_queries() {
  let server = server(6001);
  server
    .handle("update", update_args(vec![("known", 2)]))
    .await
    .unwrap();
  let scores = server
    .handle("calc_score", score_args(vec!["known", "missing", "known"]))
    .await
    .unwrap();
  assert_eq!(
    scores,
    Value::Array(vec![Value::Float(2.0), Value::Float(2.0)])
  );
}

#[tokio::test]
async fn updates_are_visible_to_the_next_analysis() {
  let server = server(6002);
  for round in 1..=4u64 {
    server
      .handle("update", update_args(vec![("r", 1)]))
      .await
      .unwrap();
    let scores = server
      .handle("calc_score", score_args(vec!["r"]))
      .await
      .unwrap();
    assert_eq!(scores, Value::Array(vec![Value::Float(round as f64)]));
  }
}

#[tokio::test]
async fn typed_entry_points_mirror_the_rpc_surface() {
  let server = server(6003);
  let items = vec![
    TallyUpdate { row: "x".to_string(), hits: 2 },
    TallyUpdate { row: "x".to_string(), hits: 0 },
  ];
  let applied = server.update(|m, d| m.apply(d), "update", items);
  assert_eq!(applied, 1);
  let queries = vec![TallyQuery { row: "x".to_string() }];
  let scores = server.analysis(|m, q| m.query(q), "calc_score", queries);
  assert_eq!(scores, vec![2.0]);
}

#[tokio::test]
async fn clear_row_reports_whether_a_row_existed() {
  let server = server(6004);
  server
    .handle("update", update_args(vec![("gone", 1)]))
    .await
    .unwrap();
  let args = Value::Array(vec![text("gone")]);
  let reply = server.handle("clear_row", args.clone()).await.unwrap();
  assert_eq!(reply, Value::Bool(true));
  let reply = server.handle("clear_row", args).await.unwrap();
  assert_eq!(reply, Value::Bool(false));
}

#[tokio::test]
async fn config_round_trips_and_reads_fail_before_distribution() {
  let server = server(6005);
  match server.handle("get_config", Value::Array(vec![text("t")])).await {
    Err(ServiceError::Failed(_)) => {}
    other => panic!("expected Failed, got {:?}", other),
  }
  let config = text("window=64");
  let args = Value::Array(vec![text("t"), config.clone()]);
  let reply = server.handle("set_config", args).await.unwrap();
  assert_eq!(reply, Value::Bool(true));
  let reply = server
    .handle("get_config", Value::Array(vec![text("t")]))
    .await
    .unwrap();
  assert_eq!(reply, config);
}

#[tokio::test]
async fn status_row_is_keyed_by_host_port() {
  let server = server(6006);
  server
    .handle("update", update_args(vec![("a", 1), ("b", 1)]))
    .await
    .unwrap();
  let reply = server
    .handle("get_status", Value::Array(vec![text("t")]))
    .await
    .unwrap();
  match reply {
    Value::Map(outer) => {
      let row = outer.get(&text("localhost:6006")).unwrap();
      match row {
        Value::Map(row) => {
          assert_eq!(row.get(&text("update_count")), Some(&text("2")));
          assert_eq!(row.get(&text("rows")), Some(&text("2")));
          assert_eq!(row.get(&text("mixer_running")), Some(&text("false")));
        }
        v => panic!("unexpected status row: {:?}", v),
      }
    }
    v => panic!("unexpected get_status reply: {:?}", v),
  }
}

#[tokio::test]
async fn diff_endpoints_are_hidden_until_the_mixer_starts() {
  let server = server(6007);
  match server.handle(GET_DIFF, Value::Null).await {
    Err(ServiceError::UnknownMethod(m)) => assert_eq!(m, GET_DIFF),
    other => panic!("expected UnknownMethod, got {:?}", other),
  }
}

#[tokio::test]
async fn save_fails_without_a_blob_store() {
  let server = server(6008);
  match server.handle("save", Value::Array(vec![text("snap")])).await {
    Err(ServiceError::Failed(_)) => {}
    other => panic!("expected Failed, got {:?}", other),
  }
}

#[tokio::test]
async fn save_then_load_restores_the_model() {
  let blobs = MemBlobStore::new();
  let mut server = ModelServer::new(
    addr(6009),
    TallyModel::new(),
    Some(blobs.clone() as Arc<dyn confluo::core::BlobStore>),
  );
  server.register_model_surface();
  server
    .handle("update", update_args(vec![("kept", 9)]))
    .await
    .unwrap();
  let reply = server
    .handle("save", Value::Array(vec![text("snap")]))
    .await
    .unwrap();
  assert_eq!(reply, Value::Bool(true));
  assert_eq!(blobs.ids(), vec!["snap/localhost:6009".to_string()]);
  server.handle("clear", Value::Array(vec![text("t")])).await.unwrap();
  let reply = server
    .handle("load", Value::Array(vec![text("snap")]))
    .await
    .unwrap();
  assert_eq!(reply, Value::Bool(true));
  let scores = server
    .handle("calc_score", score_args(vec!["kept"]))
    .await
    .unwrap();
  assert_eq!(scores, Value::Array(vec![Value::Float(9.0)]));
  // loading an id never saved surfaces the store's failure
  match server.handle("load", Value::Array(vec![text("other")])).await {
    Err(ServiceError::Failed(_)) => {}
    other => panic!("expected Failed, got {:?}", other),
  }
}

#[tokio::test]
async fn malformed_batches_are_rejected_up_front() {
  let server = server(6010);
  match server.handle("update", Value::Integer(7)).await {
    Err(ServiceError::BadArgs { method, .. }) => assert_eq!(method, "update"),
    other => panic!("expected BadArgs, got {:?}", other),
  }
  match server.handle("no_such", Value::Null).await {
    Err(ServiceError::UnknownMethod(m)) => assert_eq!(m, "no_such"),
    other => panic!("expected UnknownMethod, got {:?}", other),
  }
}
