//! Write-submission interface exposed to the service layer. Callers hold a
//! cloneable `ReplicationHandle` and never touch protocol state directly;
//! each submission travels over a channel to the replica's event loop, which
//! is the single owner of all ordering state.

use crate::server::{validate_payload, OpsType, Record, ReplicaId};
use crate::utils::OrdercastError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};

/// Globally unique write request ID.
pub type RequestId = String;

/// Per-origin-node send order number.
pub type LocalSeq = u64;

/// Cluster-wide agreed delivery order number.
pub type GlobalSeq = u64;

/// Request sent by a client over the line-JSON API, one per line.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Replicated write. A client retrying after a timeout passes the ID it
    /// got back (or chose) to keep the retry idempotent.
    Write {
        ops: String,
        payload: serde_json::Value,
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Local read; never enters the ordering protocol.
    Read { table: String, key: String },
}

/// Reply sent back to a client over the line-JSON API, one per line.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// The write has been globally ordered and applied on the serving node.
    Written { id: RequestId, global_seq: GlobalSeq },

    /// Result of a read, `None` if the key is absent.
    Record(Option<Record>),

    /// Anything that went wrong, including timeouts.
    Error(String),
}

/// Write submission handed to the replica event loop.
#[derive(Debug)]
pub struct SubmitReq {
    /// Request ID; reusing one is idempotent.
    pub id: RequestId,

    /// Operation to replicate.
    pub ops: OpsType,

    /// Serialized operation arguments.
    pub payload: Bytes,

    /// Completion channel, fired with the assigned global sequence number
    /// once the write has been applied locally.
    pub tx_done: oneshot::Sender<GlobalSeq>,
}

/// Pending completion of a submitted write.
#[derive(Debug)]
pub struct Completion {
    id: RequestId,
    rx_done: oneshot::Receiver<GlobalSeq>,
}

impl Completion {
    /// ID of the request this completion belongs to.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Waits until the write has been globally ordered and applied locally.
    /// Returns `OrdercastError::TimedOut` if that does not happen within
    /// `timeout`; the caller may then resubmit with the same request ID.
    pub async fn wait(
        self,
        timeout: Duration,
    ) -> Result<GlobalSeq, OrdercastError> {
        match time::timeout(timeout, self.rx_done).await {
            Ok(Ok(global_seq)) => Ok(global_seq),
            Ok(Err(_)) => Err(OrdercastError::msg(format!(
                "replica stopped before delivering {}",
                self.id
            ))),
            Err(_) => Err(OrdercastError::TimedOut(self.id)),
        }
    }
}

/// Cloneable handle for originating replicated writes on a replica.
#[derive(Debug, Clone)]
pub struct ReplicationHandle {
    /// ID of the replica this handle submits to.
    me: ReplicaId,

    /// Sender side of the replica's submit channel.
    tx_submit: mpsc::Sender<SubmitReq>,
}

impl ReplicationHandle {
    pub(crate) fn new(me: ReplicaId, tx_submit: mpsc::Sender<SubmitReq>) -> Self {
        ReplicationHandle { me, tx_submit }
    }

    /// Generates a fresh request ID.
    pub fn new_request_id(&self) -> RequestId {
        format!("{}-{:016x}", self.me, rand::random::<u64>())
    }

    /// Originates a replicated write under a fresh request ID. Returns the ID
    /// and a completion to wait on.
    pub async fn submit(
        &self,
        ops: OpsType,
        payload: Bytes,
    ) -> Result<(RequestId, Completion), OrdercastError> {
        let id = self.new_request_id();
        let completion = self.submit_with_id(id.clone(), ops, payload).await?;
        Ok((id, completion))
    }

    /// Originates (or re-originates) a replicated write under given request
    /// ID. Resubmitting an ID this replica already knows never produces a
    /// second delivery.
    pub async fn submit_with_id(
        &self,
        id: RequestId,
        ops: OpsType,
        payload: Bytes,
    ) -> Result<Completion, OrdercastError> {
        validate_payload(ops, &payload)?;

        let (tx_done, rx_done) = oneshot::channel();
        self.tx_submit
            .send(SubmitReq {
                id: id.clone(),
                ops,
                payload,
                tx_done,
            })
            .await?;
        Ok(Completion { id, rx_done })
    }

    /// Originates a write and waits for its completion within `timeout`.
    pub async fn replicate(
        &self,
        ops: OpsType,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(RequestId, GlobalSeq), OrdercastError> {
        let (id, completion) = self.submit(ops, payload).await?;
        let global_seq = completion.wait(timeout).await?;
        Ok((id, global_seq))
    }
}
