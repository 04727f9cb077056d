use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// The location part of a [`NodeAddress`].
#[derive(
  Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub enum Host {
  /// A name to be resolved by the transport.
  DNS(String),
  /// A literal address, no resolution needed.
  IP(IpAddr),
}

/// Identifies one worker process: where to reach it and which logical
/// cluster it serves. Immutable once discovered; the membership set changes
/// over time, individual addresses do not.
///
/// The derive set keeps addresses ordered and hashable, so membership
/// snapshots sort deterministically and ring placement is stable.
#[derive(
  Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub struct NodeAddress {
  /// Where the node's RPC endpoint lives.
  pub host: Host,
  /// The endpoint's port.
  pub port: u16,
  /// The logical cluster name this node serves under.
  pub cluster: String,
}
impl NodeAddress {
  /// A new address in `cluster`.
  pub fn new(host: Host, port: u16, cluster: String) -> NodeAddress {
    NodeAddress {
      host: host,
      port: port,
      cluster: cluster,
    }
  }

  /// The `host:port` form used as a node id in status rows and blob keys.
  pub fn host_port(&self) -> String {
    match &self.host {
      Host::DNS(s) => format!("{}:{}", s, self.port),
      Host::IP(ip) => format!("{}:{}", ip, self.port),
    }
  }
}
impl fmt::Display for NodeAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.cluster, self.host_port())
  }
}

#[test]
fn test_address_ordering() {
  let mk = |port| {
    NodeAddress::new(Host::DNS("localhost".to_string()), port, "a".to_string())
  };
  let mut v = vec![mk(5003), mk(5001), mk(5002)];
  v.sort();
  let ports = v.iter().map(|a| a.port).collect::<Vec<_>>();
  assert_eq!(ports, vec![5001, 5002, 5003]);
  assert_eq!(v[0].host_port(), "localhost:5001");
}
