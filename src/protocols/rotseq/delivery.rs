//! `RotSeq` -- globally ordered delivery and local apply.

use super::*;

use tokio::time;

// RotSeqReplica global-order delivery
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Handler of a Sequence, whether received from a peer or assigned
    /// locally. Stale ones are dropped; others are held until deliverable,
    /// requesting any missing global sequence numbers before it.
    pub(super) fn handle_sequence(
        &mut self,
        req: ReqEntry,
        sequence_node: ReplicaId,
        global_seq: GlobalSeq,
    ) -> Result<(), OrdercastError> {
        if global_seq <= self.global_counter {
            pf_debug!(self.id; "dropped stale Sequence {} (delivered {})",
                               global_seq, self.global_counter);
            return Ok(());
        }
        if sequencer_of(global_seq, self.population) != sequence_node {
            pf_warn!(self.id; "Sequence {} from {} out of turn", global_seq, sequence_node);
        }

        let from = self.global_counter + 1;
        self.ooo_seqs.insert(global_seq, (req, sequence_node));
        if global_seq > from {
            pf_debug!(self.id; "holding Sequence {} (delivered {})",
                               global_seq, self.global_counter);
            self.request_missing_seqs(from, global_seq - 1)?;
        }
        Ok(())
    }

    /// Delivers held Sequences for as long as the next global sequence number
    /// is present and its Request has been accepted in per-sender order.
    pub(super) async fn deliver_ready(&mut self) -> Result<(), OrdercastError> {
        loop {
            let global_seq = self.global_counter + 1;
            let (sender, local_seq) = match self.ooo_seqs.get(&global_seq) {
                Some((req, _)) => (req.request_node, req.local_seq),
                None => return Ok(()),
            };

            let last = self.last_buffered_of(sender);
            if local_seq > last {
                pf_trace!(self.id; "Sequence {} waits for Request {}#{}",
                                   global_seq, sender, local_seq);
                if sender != self.id {
                    self.request_missing_reqs(sender, last + 1, local_seq)?;
                }
                return Ok(());
            }

            if let Some((req, _)) = self.ooo_seqs.remove(&global_seq) {
                self.deliver(req, global_seq).await?;
            }
        }
    }

    /// Delivers one Request at given global sequence number: applies it to
    /// local storage once and fires its completion if originated here.
    async fn deliver(
        &mut self,
        req: ReqEntry,
        global_seq: GlobalSeq,
    ) -> Result<(), OrdercastError> {
        // copies resubmitted elsewhere share the ID; take out this very one
        if let Some(pos) = self.to_deliver.iter().position(|r| {
            r.request_node == req.request_node && r.local_seq == req.local_seq
        }) {
            self.to_deliver.remove(pos);
        }

        if let Some(&earlier) = self.delivered.get(&req.id) {
            pf_debug!(self.id; "skipped duplicate {} at {} (delivered as {})",
                               req.id, global_seq, earlier);
            self.global_counter = global_seq;
            return Ok(());
        }

        self.apply_with_retry(&req).await?;
        self.global_counter = global_seq;
        self.delivered.insert(req.id.clone(), global_seq);
        pf_debug!(self.id; "delivered {} as {}", req.id, global_seq);

        if let Some(tx_done) = self.trackers.remove(&req.id) {
            if tx_done.send(global_seq).is_err() {
                pf_debug!(self.id; "caller of {} gone", req.id);
            }
        }
        Ok(())
    }

    /// Applies a Request to local storage, retrying a bounded number of times.
    /// Exhausting the retries is fatal: this replica can no longer keep its
    /// storage in step with the agreed order.
    async fn apply_with_retry(
        &mut self,
        req: &ReqEntry,
    ) -> Result<(), OrdercastError> {
        let mut attempt = 0;
        loop {
            match self.applier.apply(req.ops_type, &req.payload).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.apply_max_retries => {
                    attempt += 1;
                    pf_warn!(self.id; "apply of {} failed (attempt {}): {}",
                                      req.id, attempt, e);
                    time::sleep(Duration::from_millis(self.config.apply_backoff_ms))
                        .await;
                }
                Err(e) => {
                    pf_error!(self.id; "giving up applying {}: {}", req.id, e);
                    return Err(OrdercastError::ApplyFailed(format!(
                        "{} {}: {}",
                        req.ops_type, req.id, e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod delivery_tests {
    use super::*;
    use crate::protocols::rotseq::rotseq_tests::{buyer_req, test_replica};
    use crate::server::{LocalEndpoint, LocalNet, Table};

    fn seq_msg(req: ReqEntry, global_seq: GlobalSeq) -> RotSeqMsg {
        RotSeqMsg::Sequence {
            req,
            sequence_node: sequencer_of(global_seq, 3),
            global_seq,
        }
    }

    #[tokio::test]
    async fn deliver_in_global_order() -> Result<(), OrdercastError> {
        let (mut replica, store, _net, _eps) = test_replica(0, 3);
        replica.handle_msg(RotSeqMsg::Request { req: buyer_req(1, 1, "a") }).await?;
        replica.handle_msg(RotSeqMsg::Request { req: buyer_req(2, 1, "b") }).await?;

        replica.handle_msg(seq_msg(buyer_req(1, 1, "a"), 2)).await?;
        assert_eq!(replica.global_counter, 0);
        assert!(replica.retransmits.contains_key(&Wanted::Sequence { global_seq: 1 }));

        replica.handle_msg(seq_msg(buyer_req(2, 1, "b"), 1)).await?;
        assert_eq!(replica.global_counter, 2);
        assert_eq!(replica.delivered["2-1"], 1);
        assert_eq!(replica.delivered["1-1"], 2);
        assert!(replica.retransmits.is_empty());
        assert!(replica.to_deliver.is_empty());
        assert_eq!(store.count(Table::Buyers), 2);
        Ok(())
    }

    #[tokio::test]
    async fn gap_requests_each_missing_seq() -> Result<(), OrdercastError> {
        let (mut replica, _, _net, mut eps) = test_replica(0, 3);
        replica.global_counter = 4;
        replica.handle_sequence(buyer_req(1, 1, "a"), 2, 8)?;
        let wanted: Vec<GlobalSeq> = eps[0]
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                RotSeqMsg::Retransmit {
                    wanted: Wanted::Sequence { global_seq },
                    ..
                } => Some(global_seq),
                _ => None,
            })
            .collect();
        assert_eq!(wanted, vec![5, 6, 7]);
        assert_eq!(eps[1].drain().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn gap_closed_in_any_order() -> Result<(), OrdercastError> {
        let (mut replica, _, _net, _eps) = test_replica(0, 3);
        for l in 1..=8 {
            replica.handle_request(buyer_req(1, l, &format!("b{}", l)))?;
        }
        for g in 1..=4 {
            replica.ooo_seqs.insert(g, (buyer_req(1, g, &format!("b{}", g)), 1));
        }
        replica.deliver_ready().await?;
        assert_eq!(replica.global_counter, 4);

        replica.handle_msg(seq_msg(buyer_req(1, 8, "b8"), 8)).await?;
        assert_eq!(replica.global_counter, 4);
        assert_eq!(replica.retransmits.len(), 3);
        replica.handle_msg(seq_msg(buyer_req(1, 7, "b7"), 7)).await?;
        replica.handle_msg(seq_msg(buyer_req(1, 6, "b6"), 6)).await?;
        assert_eq!(replica.global_counter, 4);
        replica.handle_msg(seq_msg(buyer_req(1, 5, "b5"), 5)).await?;

        assert_eq!(replica.global_counter, 8);
        assert!(replica.retransmits.is_empty());
        for g in 5..=8 {
            assert_eq!(replica.delivered[&format!("1-{}", g)], g);
        }
        Ok(())
    }

    #[tokio::test]
    async fn sequence_waits_for_request() -> Result<(), OrdercastError> {
        let (mut replica, store, _net, mut eps) = test_replica(0, 3);
        replica.handle_msg(seq_msg(buyer_req(2, 2, "b"), 1)).await?;
        assert_eq!(replica.global_counter, 0);
        assert!(replica.retransmits.contains_key(&Wanted::Request {
            request_node: 2,
            local_seq: 1
        }));
        assert!(replica.retransmits.contains_key(&Wanted::Request {
            request_node: 2,
            local_seq: 2
        }));
        assert_eq!(eps[1].drain().len(), 2);
        assert!(eps[0].drain().is_empty());

        replica.handle_msg(RotSeqMsg::Request { req: buyer_req(2, 1, "a") }).await?;
        assert_eq!(replica.global_counter, 0);
        replica.handle_msg(RotSeqMsg::Request { req: buyer_req(2, 2, "b") }).await?;
        assert_eq!(replica.global_counter, 1);
        assert_eq!(replica.to_deliver.len(), 1);
        assert_eq!(store.count(Table::Buyers), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_id_applied_once() -> Result<(), OrdercastError> {
        let (mut replica, store, _net, _eps) = test_replica(0, 3);
        let mut dup = buyer_req(2, 2, "a");
        dup.id = "2-1".into();
        replica.handle_msg(RotSeqMsg::Request { req: buyer_req(2, 1, "a") }).await?;
        replica.handle_msg(RotSeqMsg::Request { req: dup.clone() }).await?;
        replica.handle_msg(seq_msg(buyer_req(2, 1, "a"), 1)).await?;
        replica.handle_msg(seq_msg(dup, 2)).await?;
        assert_eq!(replica.global_counter, 2);
        assert_eq!(replica.delivered.len(), 1);
        assert_eq!(store.count(Table::Buyers), 1);
        Ok(())
    }

    #[tokio::test]
    async fn resubmitted_copy_stays_queued() -> Result<(), OrdercastError> {
        // the same write resubmitted on replica 1 after originating on 2
        let (mut replica, store, _net, _eps) = test_replica(0, 3);
        let first = buyer_req(2, 1, "a");
        let mut copy = buyer_req(1, 1, "a");
        copy.id = first.id.clone();
        replica.handle_msg(RotSeqMsg::Request { req: copy.clone() }).await?;
        replica.handle_msg(RotSeqMsg::Request { req: first.clone() }).await?;

        replica.handle_msg(seq_msg(first, 1)).await?;
        assert_eq!(replica.global_counter, 1);
        assert_eq!(replica.to_deliver.len(), 1);
        assert_eq!(replica.to_deliver[0].request_node, 1);

        replica.handle_msg(seq_msg(copy, 2)).await?;
        assert_eq!(replica.global_counter, 2);
        assert!(replica.to_deliver.is_empty());
        assert_eq!(store.count(Table::Buyers), 1);
        Ok(())
    }

    struct FlakyApplier {
        failures: u32,
        applied: u32,
    }

    #[async_trait::async_trait]
    impl Applier for FlakyApplier {
        async fn apply(
            &mut self,
            _ops: OpsType,
            _payload: &[u8],
        ) -> Result<(), OrdercastError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(OrdercastError::msg("disk hiccup"));
            }
            self.applied += 1;
            Ok(())
        }
    }

    fn flaky_replica(
        failures: u32,
    ) -> RotSeqReplica<LocalEndpoint<RotSeqMsg>, FlakyApplier> {
        let (_net, mut eps) = LocalNet::new(1);
        let applier = FlakyApplier {
            failures,
            applied: 0,
        };
        let config = "apply_max_retries = 2\napply_backoff_ms = 1";
        RotSeqReplica::new(eps.remove(0), applier, Some(config))
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn apply_retried() -> Result<(), OrdercastError> {
        let mut replica = flaky_replica(2);
        replica.handle_request(buyer_req(0, 1, "a"))?;
        replica.check_turn().await?;
        assert_eq!(replica.global_counter, 1);
        assert_eq!(replica.applier.applied, 1);
        Ok(())
    }

    #[tokio::test]
    async fn apply_failure_fatal() {
        let mut replica = flaky_replica(3);
        replica.handle_request(buyer_req(0, 1, "a")).unwrap();
        let res = replica.check_turn().await;
        assert!(matches!(res, Err(OrdercastError::ApplyFailed(_))));
        assert!(res.unwrap_err().is_fatal());
        assert_eq!(replica.global_counter, 0);
        assert!(replica.delivered.is_empty());
    }
}
