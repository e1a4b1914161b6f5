//! Replication protocol: rotating-sequencer total order broadcast.
//!
//! Every replica broadcasts the writes it originates as Requests, stamped
//! with a per-origin local sequence number. Replicas accept Requests from
//! each sender strictly in local sequence order into a to-be-delivered
//! queue. The sequencing turn rotates deterministically with the global
//! counter: the replica whose turn it is stamps its queue head with the next
//! global sequence number and broadcasts a Sequence. Replicas deliver
//! Sequences strictly in global order, applying each operation to local
//! storage. Gaps in either numbering are closed by Retransmit requests.

mod messages;
mod request;
mod ordering;
mod sequencing;
mod delivery;
mod retransmit;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::server::{
    Applier, GenericTransport, GlobalSeq, LocalSeq, Membership, OpsType,
    ReplicaId, ReplicationHandle, RequestId, SubmitReq, TransportHub,
    WireCodec,
};
use crate::utils::{OrdercastError, Timer};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

pub use sequencing::sequencer_of;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigRotSeq {
    /// Interval of the retry tick in millisecs: outstanding retransmit
    /// requests are re-issued and a deferred sequencing turn re-checked.
    pub retry_interval_ms: u64,

    /// Capacity of the write submission channel.
    pub chan_submit_cap: usize,

    /// Capacity of the transport recv channel.
    pub chan_recv_cap: usize,

    /// Maximum encoded message size in bytes.
    pub max_datagram: usize,

    /// Wire encoding name, "json" or "msgpack".
    pub wire_codec: String,

    /// Number of times a failed local apply is retried before the replica
    /// gives up and stops.
    pub apply_max_retries: u32,

    /// Sleep between local apply attempts in millisecs.
    pub apply_backoff_ms: u64,
}

impl Default for ReplicaConfigRotSeq {
    fn default() -> Self {
        ReplicaConfigRotSeq {
            retry_interval_ms: 50,
            chan_submit_cap: 10000,
            chan_recv_cap: 100000,
            max_datagram: 8192,
            wire_codec: "json".into(),
            apply_max_retries: 3,
            apply_backoff_ms: 20,
        }
    }
}

/// A replicated write request as carried on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReqEntry {
    /// Globally unique request ID, stable across all copies.
    pub id: RequestId,

    /// Write operation carried.
    pub ops_type: OpsType,

    /// Serialized operation arguments, opaque to the protocol.
    #[serde(with = "payload_text")]
    pub payload: Bytes,

    /// Replica that originated the write.
    pub request_node: ReplicaId,

    /// Position in the originator's send order.
    pub local_seq: LocalSeq,
}

// Payloads are validated JSON text at submission, so they go on the wire as a
// string rather than as a sequence of byte numbers.
mod payload_text {
    use bytes::Bytes;
    use serde::{ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        payload: &Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(payload)
            .map_err(<S::Error as ser::Error>::custom)?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Bytes, D::Error> {
        String::deserialize(deserializer).map(Bytes::from)
    }
}

/// What a Retransmit message asks for.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub enum Wanted {
    /// The Sequence message carrying this global sequence number.
    Sequence { global_seq: GlobalSeq },

    /// The Request message from this sender at this local sequence number.
    Request {
        request_node: ReplicaId,
        local_seq: LocalSeq,
    },
}

/// Peer-peer message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RotSeqMsg {
    /// A newly originated write.
    Request { req: ReqEntry },

    /// Global order assignment for a write.
    Sequence {
        req: ReqEntry,
        sequence_node: ReplicaId,
        global_seq: GlobalSeq,
    },

    /// Ask for a resend of a missing message.
    Retransmit {
        retransmit_node: ReplicaId,
        wanted: Wanted,
    },

    /// Reserved; logged and dropped on receipt.
    Ack {
        ack_node: ReplicaId,
        global_seq: GlobalSeq,
    },
}

/// RotSeq server replica module.
pub struct RotSeqReplica<T, A> {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Configuration parameters struct.
    config: ReplicaConfigRotSeq,

    /// Peer transport module.
    transport_hub: T,

    /// Local storage apply path.
    applier: A,

    /// Receiver side of the write submission channel.
    rx_submit: mpsc::Receiver<SubmitReq>,

    /// Set once every `ReplicationHandle` has been dropped.
    submit_closed: bool,

    /// Timer driving the periodic retry tick.
    retry_timer: Timer,

    /// Last local sequence number stamped on a Request I originated.
    local_counter: LocalSeq,

    /// Highest global sequence number delivered.
    global_counter: GlobalSeq,

    /// Requests I originated, by `(me, local_seq)`, kept for retransmission.
    sent_reqs: HashMap<(ReplicaId, LocalSeq), ReqEntry>,

    /// Local sequence number of each request ID I originated.
    sent_req_ids: HashMap<RequestId, LocalSeq>,

    /// Sequences I assigned, by global sequence number, kept for
    /// retransmission.
    sent_seqs: HashMap<GlobalSeq, ReqEntry>,

    /// Request IDs already delivered, with the global number they got.
    delivered: HashMap<RequestId, GlobalSeq>,

    /// Requests accepted in per-sender order but not yet delivered, in
    /// arrival order.
    to_deliver: VecDeque<ReqEntry>,

    /// Requests received ahead of their sender's watermark.
    ooo_reqs: HashMap<(ReplicaId, LocalSeq), ReqEntry>,

    /// Sequences received but not yet deliverable, with their assigner.
    ooo_seqs: BTreeMap<GlobalSeq, (ReqEntry, ReplicaId)>,

    /// Outstanding retransmit requests I issued, with their target (`None`
    /// means broadcast).
    retransmits: HashMap<Wanted, Option<ReplicaId>>,

    /// Highest contiguous local sequence number accepted per sender.
    last_buffered: HashMap<ReplicaId, LocalSeq>,

    /// Completion channels of writes originated here and not yet delivered.
    trackers: HashMap<RequestId, oneshot::Sender<GlobalSeq>>,

    /// Whether my sequencing turn is on hold for pending retransmits.
    turn_deferred: bool,
}

// RotSeqReplica construction
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Parses and checks protocol-specific configs.
    pub fn parse_config(
        me: ReplicaId,
        config_str: Option<&str>,
    ) -> Result<ReplicaConfigRotSeq, OrdercastError> {
        let config = parsed_config!(config_str => ReplicaConfigRotSeq;
                                    retry_interval_ms, chan_submit_cap,
                                    chan_recv_cap, max_datagram, wire_codec,
                                    apply_max_retries, apply_backoff_ms)?;
        if config.retry_interval_ms == 0 {
            return logged_err!(
                me;
                "invalid config.retry_interval_ms '{}'",
                config.retry_interval_ms
            );
        }
        if config.chan_submit_cap == 0 || config.chan_recv_cap == 0 {
            return logged_err!(me; "invalid channel capacities in config");
        }
        if WireCodec::parse_name(&config.wire_codec).is_none() {
            return logged_err!(
                me;
                "invalid config.wire_codec '{}'",
                config.wire_codec
            );
        }
        Ok(config)
    }

    /// Creates a replica over given transport and local storage. Returns the
    /// replica and a handle for originating writes on it.
    pub fn new(
        transport_hub: T,
        applier: A,
        config_str: Option<&str>,
    ) -> Result<(Self, ReplicationHandle), OrdercastError> {
        let config = Self::parse_config(transport_hub.me(), config_str)?;
        Self::with_config(transport_hub, applier, config)
    }

    fn with_config(
        transport_hub: T,
        applier: A,
        config: ReplicaConfigRotSeq,
    ) -> Result<(Self, ReplicationHandle), OrdercastError> {
        let id = transport_hub.me();
        let population = transport_hub.population();
        if population == 0 || id >= population {
            return logged_err!(id; "invalid replica ID {} / {}", id, population);
        }

        let (tx_submit, rx_submit) = mpsc::channel(config.chan_submit_cap);
        let handle = ReplicationHandle::new(id, tx_submit);

        let replica = RotSeqReplica {
            id,
            population,
            config,
            transport_hub,
            applier,
            rx_submit,
            submit_closed: false,
            retry_timer: Timer::new(),
            local_counter: 0,
            global_counter: 0,
            sent_reqs: HashMap::new(),
            sent_req_ids: HashMap::new(),
            sent_seqs: HashMap::new(),
            delivered: HashMap::new(),
            to_deliver: VecDeque::new(),
            ooo_reqs: HashMap::new(),
            ooo_seqs: BTreeMap::new(),
            retransmits: HashMap::new(),
            last_buffered: HashMap::new(),
            trackers: HashMap::new(),
            turn_deferred: false,
        };
        Ok((replica, handle))
    }
}

impl<A: Applier> RotSeqReplica<TransportHub<RotSeqMsg>, A> {
    /// Creates a replica communicating over UDP, binding the address that
    /// membership assigns to replica `me`.
    pub async fn new_and_setup(
        me: ReplicaId,
        membership: Arc<dyn Membership>,
        applier: A,
        config_str: Option<&str>,
    ) -> Result<(Self, ReplicationHandle), OrdercastError> {
        let config = Self::parse_config(me, config_str)?;
        let codec = WireCodec::parse_name(&config.wire_codec)
            .ok_or_else(|| OrdercastError::msg("invalid wire_codec"))?;

        let transport_hub = TransportHub::new_and_setup(
            me,
            membership,
            codec,
            config.max_datagram,
            config.chan_recv_cap,
        )
        .await?;

        Self::with_config(transport_hub, applier, config)
    }
}

// RotSeqReplica main event loop
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Main event loop. Returns `Ok(())` on termination signal, or the error
    /// that forced this replica out of the protocol.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), OrdercastError> {
        self.retry_timer
            .restart(Duration::from_millis(self.config.retry_interval_ms))?;
        pf_info!(self.id; "replica running, population {}", self.population);

        loop {
            let result = tokio::select! {
                // write originated by a local caller
                req = self.rx_submit.recv(), if !self.submit_closed => {
                    match req {
                        Some(req) => self.handle_submit(req).await,
                        None => {
                            pf_debug!(self.id; "all replication handles dropped");
                            self.submit_closed = true;
                            Ok(())
                        }
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    let msg = msg?;
                    self.handle_msg(msg).await
                },

                // retry tick
                _ = self.retry_timer.timeout() => {
                    self.retry_timer.kickoff()?;
                    self.handle_retry_tick().await
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "replica caught termination signal");
                    return Ok(());
                }
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    pf_error!(self.id; "leaving the cluster: {}", e);
                    return Err(e);
                }
                pf_error!(self.id; "error handling event: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod rotseq_tests {
    use super::*;
    use crate::server::{LocalEndpoint, LocalNet, MarketStore};

    pub(super) type TestReplica =
        RotSeqReplica<LocalEndpoint<RotSeqMsg>, MarketStore>;

    /// Builds a `population`-sized network and a replica at ID `me` on it.
    /// Returns the replica, its store, the network, and all other endpoints.
    pub(super) fn test_replica(
        me: ReplicaId,
        population: u8,
    ) -> (
        TestReplica,
        MarketStore,
        LocalNet<RotSeqMsg>,
        Vec<LocalEndpoint<RotSeqMsg>>,
    ) {
        let (net, mut eps) = LocalNet::new(population);
        let ep = eps.remove(me as usize);
        let store = MarketStore::new();
        let (replica, _handle) =
            RotSeqReplica::new(ep, store.clone(), None).unwrap();
        (replica, store, net, eps)
    }

    /// A Request entry creating buyer `name` from `sender`.
    pub(super) fn buyer_req(
        sender: ReplicaId,
        local_seq: LocalSeq,
        name: &str,
    ) -> ReqEntry {
        ReqEntry {
            id: format!("{}-{}", sender, local_seq),
            ops_type: OpsType::CreateBuyer,
            payload: Bytes::from(format!("{{\"id\":\"{}\"}}", name)),
            request_node: sender,
            local_seq,
        }
    }

    #[test]
    fn parse_config_checks() {
        assert!(TestReplica::parse_config(0, None).is_ok());
        assert!(TestReplica::parse_config(0, Some("wire_codec = 'msgpack'"))
            .is_ok());
        assert!(
            TestReplica::parse_config(0, Some("wire_codec = 'xml'")).is_err()
        );
        assert!(
            TestReplica::parse_config(0, Some("retry_interval_ms = 0")).is_err()
        );
        assert!(TestReplica::parse_config(0, Some("bogus = 1")).is_err());
    }

    #[test]
    fn wire_format_is_tagged() {
        let msg = RotSeqMsg::Retransmit {
            retransmit_node: 1,
            wanted: Wanted::Sequence { global_seq: 6 },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"Retransmit":{"retransmit_node":1,"wanted":{"Sequence":{"global_seq":6}}}}"#
        );
        for codec in [WireCodec::Json, WireCodec::Msgpack] {
            let seq = RotSeqMsg::Sequence {
                req: buyer_req(2, 3, "b"),
                sequence_node: 0,
                global_seq: 9,
            };
            let bytes = codec.encode(&seq).unwrap();
            assert_eq!(codec.decode::<RotSeqMsg>(&bytes).unwrap(), seq);
        }
    }

    #[test]
    fn payload_carried_as_text() {
        let req = buyer_req(1, 2, "b");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""payload":"{\"id\":\"b\"}""#));

        // a payload near the datagram limit still fits once encoded
        let entry = ReqEntry {
            payload: Bytes::from(format!(
                "{{\"id\":\"b\",\"name\":\"{}\"}}",
                "x".repeat(7000)
            )),
            ..req
        };
        let msg = RotSeqMsg::Request { req: entry };
        for codec in [WireCodec::Json, WireCodec::Msgpack] {
            let bytes = codec.encode(&msg).unwrap();
            assert!(bytes.len() < 8192);
            assert_eq!(codec.decode::<RotSeqMsg>(&bytes).unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn run_stops_on_term() -> Result<(), OrdercastError> {
        let (mut replica, _, _net, _eps) = test_replica(0, 3);
        let (tx_term, rx_term) = watch::channel(false);
        let task = tokio::spawn(async move { replica.run(rx_term).await });
        tx_term.send(true)?;
        assert_eq!(task.await.unwrap(), Ok(()));
        Ok(())
    }
}
