//! In-process network implementing `GenericTransport`, for running a whole
//! cluster inside one process (simulation and tests). Messages can be
//! dropped selectively through a filter to emulate datagram loss and
//! partitions.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::server::{GenericTransport, ReplicaId};
use crate::utils::OrdercastError;

use async_trait::async_trait;

use tokio::sync::mpsc;

/// Loss filter: given `(from, to, msg)`, returns true if the message should
/// be dropped.
pub type LossFilter<Msg> =
    Box<dyn FnMut(ReplicaId, ReplicaId, &Msg) -> bool + Send>;

struct NetInner<Msg> {
    /// Sender side of each replica's inbox, indexed by replica ID.
    inboxes: Vec<mpsc::UnboundedSender<Msg>>,

    /// Current loss filter, if any.
    filter: Option<LossFilter<Msg>>,

    /// Number of messages dropped so far.
    dropped: usize,
}

/// Handle to an in-process network shared by all its endpoints.
pub struct LocalNet<Msg> {
    population: u8,
    inner: Arc<Mutex<NetInner<Msg>>>,
}

impl<Msg> Clone for LocalNet<Msg> {
    fn clone(&self) -> Self {
        LocalNet {
            population: self.population,
            inner: self.inner.clone(),
        }
    }
}

impl<Msg> LocalNet<Msg>
where
    Msg: fmt::Debug + Clone + Send + Sync + 'static,
{
    /// Creates a network of `population` replicas and returns one endpoint
    /// per replica, ordered by replica ID.
    pub fn new(population: u8) -> (Self, Vec<LocalEndpoint<Msg>>) {
        let mut inboxes = Vec::with_capacity(population as usize);
        let mut rxs = Vec::with_capacity(population as usize);
        for _ in 0..population {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.push(tx);
            rxs.push(rx);
        }

        let net = LocalNet {
            population,
            inner: Arc::new(Mutex::new(NetInner {
                inboxes,
                filter: None,
                dropped: 0,
            })),
        };
        let endpoints = rxs
            .into_iter()
            .enumerate()
            .map(|(id, rx)| LocalEndpoint {
                me: id as ReplicaId,
                net: net.clone(),
                rx,
            })
            .collect();
        (net, endpoints)
    }

    fn lock(&self) -> MutexGuard<'_, NetInner<Msg>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installs a loss filter, replacing any previous one.
    pub fn set_filter(
        &self,
        filter: impl FnMut(ReplicaId, ReplicaId, &Msg) -> bool + Send + 'static,
    ) {
        self.lock().filter = Some(Box::new(filter));
    }

    /// Removes the loss filter; all messages get through afterwards.
    pub fn clear_filter(&self) {
        self.lock().filter = None;
    }

    /// Number of messages dropped by filters so far.
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    /// Puts a message directly into a replica's inbox, bypassing the filter.
    pub fn inject(&self, to: ReplicaId, msg: Msg) -> Result<(), OrdercastError> {
        let inner = self.lock();
        match inner.inboxes.get(to as usize) {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| OrdercastError::msg(format!("replica {} gone", to))),
            None => Err(OrdercastError::msg(format!("no replica {}", to))),
        }
    }

    fn route(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        msg: &Msg,
    ) -> Result<(), OrdercastError> {
        let mut inner = self.lock();
        let lost = match inner.filter.as_mut() {
            Some(filter) => filter(from, to, msg),
            None => false,
        };
        if lost {
            inner.dropped += 1;
            pf_trace!(from; "lost msg to {}: {:?}", to, msg);
            return Ok(());
        }
        match inner.inboxes.get(to as usize) {
            Some(tx) => tx
                .send(msg.clone())
                .map_err(|_| OrdercastError::msg(format!("replica {} gone", to))),
            None => Err(OrdercastError::msg(format!("no replica {}", to))),
        }
    }
}

/// One replica's attachment point to a `LocalNet`.
pub struct LocalEndpoint<Msg> {
    me: ReplicaId,
    net: LocalNet<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
}

impl<Msg> LocalEndpoint<Msg> {
    /// Takes an already-arrived message without waiting.
    pub fn try_recv(&mut self) -> Option<Msg> {
        self.rx.try_recv().ok()
    }

    /// Takes all already-arrived messages.
    pub fn drain(&mut self) -> Vec<Msg> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

#[async_trait]
impl<Msg> GenericTransport<Msg> for LocalEndpoint<Msg>
where
    Msg: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn me(&self) -> ReplicaId {
        self.me
    }

    fn population(&self) -> u8 {
        self.net.population
    }

    fn send_msg(
        &mut self,
        msg: &Msg,
        peer: ReplicaId,
    ) -> Result<(), OrdercastError> {
        self.net.route(self.me, peer, msg)
    }

    async fn recv_msg(&mut self) -> Result<Msg, OrdercastError> {
        match self.rx.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!(self.me; "inbox has been closed"),
        }
    }
}
