//! Ordercast: totally-ordered replication of marketplace writes across a
//! fixed group of database replicas, using a rotating sequencer.

#[macro_use]
mod utils;

pub mod server;
pub mod protocols;

pub use utils::{logger_init, OrdercastError, Timer};

pub use server::{
    Applier, Completion, GlobalSeq, MarketStore, OpsType, ReplicaId,
    ReplicationHandle, RequestId, StaticMembership, Table,
};
pub use protocols::{ReplicaConfigRotSeq, RotSeqMsg, RotSeqReplica};
