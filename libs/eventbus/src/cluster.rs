//! Cluster Gateway
//!
//! The bus consults its gateway only when no local consumer accepts a
//! message. Inbound envelopes come back through
//! [`EventBus::on_remote_envelope`], which never forwards again, so a message
//! crosses at most one hop.
//!
//! [`InProcessCluster`] joins several buses in one process and runs every
//! crossing through a [`BodyCodec`], as a wire transport would.

use crate::bus::{EventBus, WeakEventBus};
use crate::codec::BodyCodec;
use crate::error::Result;
use crate::message::{DeliveryMode, Envelope};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outbound path to other nodes
pub trait ClusterGateway: Send + Sync + 'static {
    /// Hand `envelope` to some remote node; false when no node accepts it
    fn try_remote_deliver(&self, envelope: &Envelope) -> bool;
}

/// Single-node default: nothing is remote
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGateway;

impl ClusterGateway for NoopGateway {
    fn try_remote_deliver(&self, _envelope: &Envelope) -> bool {
        false
    }
}

struct ClusterNode {
    node_id: String,
    bus: WeakEventBus,
}

/// Several buses in one process acting as cluster nodes
pub struct InProcessCluster {
    nodes: RwLock<Vec<ClusterNode>>,
    codec: Arc<dyn BodyCodec>,
    cursor: AtomicUsize,
    crossings: AtomicU64,
    codec_failures: AtomicU64,
}

impl fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessCluster")
            .field("nodes", &self.node_ids())
            .field("codec", &self.codec.name())
            .field("crossings", &self.crossings())
            .finish()
    }
}

impl InProcessCluster {
    pub fn new(codec: Arc<dyn BodyCodec>) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(Vec::new()),
            codec,
            cursor: AtomicUsize::new(0),
            crossings: AtomicU64::new(0),
            codec_failures: AtomicU64::new(0),
        })
    }

    /// Add `bus` as a node and install the cluster as its gateway
    pub fn join(self: &Arc<Self>, bus: &EventBus) {
        let node_id = bus.node_id().to_string();
        self.nodes.write().push(ClusterNode {
            node_id: node_id.clone(),
            bus: bus.downgrade(),
        });
        bus.set_cluster_gateway(Arc::new(NodeGateway {
            cluster: Arc::clone(self),
            node_id: node_id.clone(),
        }));
        debug!(node_id = %node_id, "Node joined in-process cluster");
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.read().iter().map(|n| n.node_id.clone()).collect()
    }

    /// Envelopes that crossed between nodes
    pub fn crossings(&self) -> u64 {
        self.crossings.load(Ordering::Relaxed)
    }

    pub fn codec_failures(&self) -> u64 {
        self.codec_failures.load(Ordering::Relaxed)
    }

    /// Candidate nodes other than `origin` with a local consumer of the address
    fn candidates(&self, origin: &str, envelope: &Envelope) -> Vec<EventBus> {
        self.nodes
            .read()
            .iter()
            .filter(|node| node.node_id != origin)
            .filter_map(|node| node.bus.upgrade())
            .filter(|bus| bus.has_local_consumers(envelope.address().as_str()))
            .collect()
    }

    /// Encode and decode the body as a wire crossing would
    fn transcode(&self, envelope: &Envelope) -> Result<Envelope> {
        let frame = self.codec.encode(envelope.body())?;
        let body = self.codec.decode(&frame)?;
        Ok(envelope.clone().with_body(body))
    }

    fn forward(&self, origin: &str, envelope: &Envelope) -> bool {
        let candidates = self.candidates(origin, envelope);
        if candidates.is_empty() {
            trace!(node_id = %origin, address = %envelope.address(), "No remote node has consumers");
            return false;
        }

        let wire = match self.transcode(envelope) {
            Ok(wire) => wire,
            Err(e) => {
                self.codec_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    node_id = %origin,
                    address = %envelope.address(),
                    codec = self.codec.name(),
                    error = %e,
                    "Envelope could not cross to a remote node"
                );
                return false;
            }
        };

        match envelope.mode() {
            DeliveryMode::Publish => {
                for bus in &candidates {
                    bus.on_remote_envelope(wire.clone());
                    self.crossings.fetch_add(1, Ordering::Relaxed);
                }
            }
            DeliveryMode::PointToPoint => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                if let Some(bus) = candidates.get(index) {
                    bus.on_remote_envelope(wire);
                    self.crossings.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }
}

/// Gateway installed on one member node
struct NodeGateway {
    cluster: Arc<InProcessCluster>,
    node_id: String,
}

impl ClusterGateway for NodeGateway {
    fn try_remote_deliver(&self, envelope: &Envelope) -> bool {
        self.cluster.forward(&self.node_id, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BytesCodec;
    use crate::message::{Address, Body};

    #[test]
    fn test_noop_gateway_never_delivers() {
        let envelope = Envelope::point_to_point(Address::new("a").unwrap(), Body::empty());
        assert!(!NoopGateway.try_remote_deliver(&envelope));
    }

    #[test]
    fn test_transcode_runs_codec() {
        let cluster = InProcessCluster::new(Arc::new(BytesCodec));
        let envelope = Envelope::publish(Address::new("a").unwrap(), Body::from(vec![7u8]));

        let wire = cluster.transcode(&envelope).unwrap();
        assert!(wire.body().is::<bytes::Bytes>());
        assert_eq!(wire.mode(), DeliveryMode::Publish);

        let bad = Envelope::publish(Address::new("a").unwrap(), Body::new(1u64));
        assert!(cluster.transcode(&bad).is_err());
    }
}
