//! Cluster membership capability. The ordering engine only needs to know how
//! many replicas exist and how to reach each of them; where that knowledge
//! comes from (static config, discovery, a registry) is up to the
//! implementation handed in at startup.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::utils::OrdercastError;

/// Server replica ID type. Replicas are numbered `0..population`.
pub type ReplicaId = u8;

/// Peer membership capability.
pub trait Membership: fmt::Debug + Send + Sync {
    /// Total number of replicas in the cluster (including myself).
    fn population(&self) -> u8;

    /// Datagram address of given replica, if it is a member.
    fn addr_of(&self, id: ReplicaId) -> Option<SocketAddr>;

    /// Human-readable name of given replica, used in logging.
    fn name_of(&self, id: ReplicaId) -> String {
        format!("node{}", id)
    }
}

/// Fixed membership list set at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMembership {
    /// `(name, address)` of each replica, indexed by replica ID.
    peers: Vec<(String, SocketAddr)>,
}

impl StaticMembership {
    /// Creates a membership from `(name, address)` pairs ordered by ID.
    pub fn new(
        peers: Vec<(String, SocketAddr)>,
    ) -> Result<Self, OrdercastError> {
        if peers.is_empty() || peers.len() > u8::MAX as usize {
            return Err(OrdercastError::msg(format!(
                "invalid membership size {}",
                peers.len()
            )));
        }
        for (i, (_, addr)) in peers.iter().enumerate() {
            if peers[..i].iter().any(|(_, a)| a == addr) {
                return Err(OrdercastError::msg(format!(
                    "duplicate peer address {} given",
                    addr
                )));
            }
        }
        Ok(StaticMembership { peers })
    }

    /// Parses a list of `host:port` strings (replica ID = position), naming
    /// each replica after its host part.
    pub fn parse(addrs: &[String]) -> Result<Self, OrdercastError> {
        let mut peers = Vec::with_capacity(addrs.len());
        for s in addrs {
            let addr = s.to_socket_addrs()?.next().ok_or_else(|| {
                OrdercastError::msg(format!("cannot resolve '{}'", s))
            })?;
            let name = s.rsplit_once(':').map_or(s.as_str(), |(h, _)| h);
            peers.push((format!("{}#{}", name, peers.len()), addr));
        }
        Self::new(peers)
    }
}

impl Membership for StaticMembership {
    fn population(&self) -> u8 {
        self.peers.len() as u8
    }

    fn addr_of(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.peers.get(id as usize).map(|(_, addr)| *addr)
    }

    fn name_of(&self, id: ReplicaId) -> String {
        self.peers
            .get(id as usize)
            .map_or_else(|| format!("node{}", id), |(name, _)| name.clone())
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    #[test]
    fn parse_addrs() -> Result<(), OrdercastError> {
        let membership = StaticMembership::parse(&[
            "127.0.0.1:52700".into(),
            "127.0.0.1:52701".into(),
        ])?;
        assert_eq!(membership.population(), 2);
        assert_eq!(membership.addr_of(1), Some("127.0.0.1:52701".parse()?));
        assert_eq!(membership.addr_of(2), None);
        assert_eq!(membership.name_of(0), "127.0.0.1#0");
        Ok(())
    }

    #[test]
    fn reject_duplicates() {
        assert!(StaticMembership::parse(&[
            "127.0.0.1:52700".into(),
            "127.0.0.1:52700".into(),
        ])
        .is_err());
        assert!(StaticMembership::new(vec![]).is_err());
    }
}
