//! Ordercast server peer-to-peer datagram transport module implementation.
//!
//! Delivery is unreliable and unordered: one datagram per message, no acks,
//! no retries. Reliability and ordering are rebuilt by the protocol layer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::{Membership, ReplicaId};
use crate::utils::OrdercastError;

use async_trait::async_trait;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest payload a single UDP datagram can carry.
const MAX_UDP_PAYLOAD: usize = 65507;

/// Message encoding used on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    /// Flat JSON record.
    Json,
    /// MessagePack, for a smaller datagram footprint.
    Msgpack,
}

impl WireCodec {
    /// Parse codec name string into `WireCodec`.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "msgpack" => Some(Self::Msgpack),
            _ => None,
        }
    }

    /// Encodes a message into bytes.
    pub fn encode<Msg: Serialize>(
        &self,
        msg: &Msg,
    ) -> Result<Vec<u8>, OrdercastError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(msg)?),
            Self::Msgpack => Ok(rmp_serde::encode::to_vec(msg)?),
        }
    }

    /// Decodes a message from bytes.
    pub fn decode<Msg: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<Msg, OrdercastError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Msgpack => Ok(rmp_serde::decode::from_slice(bytes)?),
        }
    }
}

/// Peer transport capability the ordering engine sends and receives through.
#[async_trait]
pub trait GenericTransport<Msg>: Send
where
    Msg: fmt::Debug + Send + Sync + 'static,
{
    /// My replica ID.
    fn me(&self) -> ReplicaId;

    /// Cluster size (total number of replicas).
    fn population(&self) -> u8;

    /// Sends a message to one specific peer. No delivery guarantee.
    fn send_msg(
        &mut self,
        msg: &Msg,
        peer: ReplicaId,
    ) -> Result<(), OrdercastError>;

    /// Sends a message to every peer other than myself, with `last` (if
    /// given) receiving it after all others. A send failure to one peer is
    /// logged and skipped; the broadcast continues to the remaining peers.
    fn bcast_msg(
        &mut self,
        msg: &Msg,
        last: Option<ReplicaId>,
    ) -> Result<(), OrdercastError> {
        let me = self.me();
        let last = last.filter(|&l| l != me);
        for peer in (0..self.population())
            .filter(|&p| p != me && Some(p) != last)
            .chain(last)
        {
            if let Err(e) = self.send_msg(msg, peer) {
                pf_warn!(me; "error sending to {}: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Receives the next message from any peer.
    async fn recv_msg(&mut self) -> Result<Msg, OrdercastError>;
}

/// Server peer-to-peer UDP transport module.
pub struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Cluster membership used for resolving peer addresses.
    membership: Arc<dyn Membership>,

    /// Encoding used for datagrams.
    codec: WireCodec,

    /// Maximum encoded message size accepted for sending or receiving.
    max_datagram: usize,

    /// Bound UDP socket, shared with the datagram listener thread.
    socket: Arc<UdpSocket>,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::Receiver<Msg>,

    /// Join handle of the datagram listener thread.
    listener_handle: JoinHandle<()>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Binds my datagram socket at the address membership assigns me and
    /// spawns the datagram listener thread.
    pub async fn new_and_setup(
        me: ReplicaId,
        membership: Arc<dyn Membership>,
        codec: WireCodec,
        max_datagram: usize,
        chan_recv_cap: usize,
    ) -> Result<Self, OrdercastError> {
        if me >= membership.population() {
            return logged_err!(me; "invalid replica ID {} / {}",
                                   me, membership.population());
        }
        if max_datagram == 0 || max_datagram > MAX_UDP_PAYLOAD {
            return logged_err!(me; "invalid max_datagram {}", max_datagram);
        }
        if chan_recv_cap == 0 {
            return logged_err!(me; "invalid chan_recv_cap {}", chan_recv_cap);
        }

        let bind_addr = match membership.addr_of(me) {
            Some(addr) => addr,
            None => return logged_err!(me; "no address for myself"),
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let (tx_recv, rx_recv) = mpsc::channel(chan_recv_cap);
        let listener_handle = tokio::spawn(Self::listener_thread(
            me,
            socket.clone(),
            codec,
            max_datagram,
            tx_recv,
        ));

        pf_info!(me; "transport bound to {} as {} ({:?})",
                     bind_addr, membership.name_of(me), codec);
        Ok(TransportHub {
            me,
            membership,
            codec,
            max_datagram,
            socket,
            rx_recv,
            listener_handle,
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, OrdercastError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl<Msg> GenericTransport<Msg> for TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn me(&self) -> ReplicaId {
        self.me
    }

    fn population(&self) -> u8 {
        self.membership.population()
    }

    fn send_msg(
        &mut self,
        msg: &Msg,
        peer: ReplicaId,
    ) -> Result<(), OrdercastError> {
        let addr = match self.membership.addr_of(peer) {
            Some(addr) => addr,
            None => return logged_err!(self.me; "peer {} not a member", peer),
        };

        let bytes = self.codec.encode(msg)?;
        if bytes.len() > self.max_datagram {
            return logged_err!(self.me; "msg of {} bytes exceeds max_datagram {}",
                                        bytes.len(), self.max_datagram);
        }

        if let Err(e) = self.socket.try_send_to(&bytes, addr) {
            return logged_err!(self.me; "error sending to {}: {}",
                                        self.membership.name_of(peer), e);
        }
        pf_trace!(self.me; "sent to {} msg {:?}", peer, msg);
        Ok(())
    }

    async fn recv_msg(&mut self) -> Result<Msg, OrdercastError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

// TransportHub listener thread implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Datagram listener thread function.
    async fn listener_thread(
        me: ReplicaId,
        socket: Arc<UdpSocket>,
        codec: WireCodec,
        max_datagram: usize,
        tx_recv: mpsc::Sender<Msg>,
    ) {
        pf_debug!(me; "listener thread spawned");

        // one extra byte so that oversized datagrams are detectable
        let mut buf = vec![0u8; max_datagram + 1];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(got) => got,
                Err(e) => {
                    pf_error!(me; "error reading datagram: {}", e);
                    continue;
                }
            };
            if len > max_datagram {
                pf_warn!(me; "dropped oversized datagram from {}", from);
                continue;
            }

            match codec.decode::<Msg>(&buf[..len]) {
                Ok(msg) => {
                    pf_trace!(me; "recv from {} msg {:?}", from, msg);
                    if tx_recv.send(msg).await.is_err() {
                        break; // hub dropped
                    }
                }
                Err(e) => {
                    pf_error!(me; "error decoding datagram from {}: {}", from, e);
                }
            }
        }

        pf_debug!(me; "listener thread exited");
    }
}

impl<Msg> Drop for TransportHub<Msg> {
    fn drop(&mut self) {
        self.listener_handle.abort();
    }
}
