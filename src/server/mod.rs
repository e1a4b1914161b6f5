//! Ordercast's server functionality modules and traits.

mod statemach;
mod membership;
mod transport;
mod localnet;
mod external;

pub use statemach::{
    record_key, validate_payload, Applier, MarketStore, OpsType, Record, Table,
};
pub use membership::{Membership, ReplicaId, StaticMembership};
pub use transport::{GenericTransport, TransportHub, WireCodec};
pub use localnet::{LocalEndpoint, LocalNet, LossFilter};
pub use external::{
    ApiReply, ApiRequest, Completion, GlobalSeq, LocalSeq, ReplicationHandle,
    RequestId, SubmitReq,
};
