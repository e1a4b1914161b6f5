//! Ordercast's replication protocols.

mod rotseq;
pub use rotseq::{
    sequencer_of, ReplicaConfigRotSeq, ReqEntry, RotSeqMsg, RotSeqReplica,
    Wanted,
};
