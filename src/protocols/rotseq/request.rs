//! `RotSeq` -- write origination entrance.

use super::*;

// RotSeqReplica write origination
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Handler of a write submitted through a `ReplicationHandle`.
    pub(super) async fn handle_submit(
        &mut self,
        req: SubmitReq,
    ) -> Result<(), OrdercastError> {
        let SubmitReq {
            id,
            ops,
            payload,
            tx_done,
        } = req;

        // already delivered here: complete right away
        if let Some(&global_seq) = self.delivered.get(&id) {
            pf_debug!(self.id; "resubmitted {} already delivered as {}", id, global_seq);
            if tx_done.send(global_seq).is_err() {
                pf_debug!(self.id; "caller of {} gone", id);
            }
            return Ok(());
        }

        // originated earlier but still in flight: re-arm completion and push
        // the original Request out again
        if let Some(&local_seq) = self.sent_req_ids.get(&id) {
            pf_debug!(self.id; "resubmitted {} still pending as #{}", id, local_seq);
            self.trackers.insert(id, tx_done);
            if let Some(entry) = self.sent_reqs.get(&(self.id, local_seq)) {
                let msg = RotSeqMsg::Request { req: entry.clone() };
                let next = self.next_sequencer();
                self.transport_hub.bcast_msg(&msg, Some(next))?;
            }
            self.deliver_ready().await?;
            return self.check_turn().await;
        }

        self.local_counter += 1;
        let entry = ReqEntry {
            id: id.clone(),
            ops_type: ops,
            payload,
            request_node: self.id,
            local_seq: self.local_counter,
        };
        self.sent_reqs
            .insert((self.id, entry.local_seq), entry.clone());
        self.sent_req_ids.insert(id.clone(), entry.local_seq);
        self.trackers.insert(id, tx_done);
        pf_debug!(self.id; "originating {} as #{}", entry.id, entry.local_seq);

        // peers first, the next sequencer last, then myself
        let next = self.next_sequencer();
        self.transport_hub
            .bcast_msg(&RotSeqMsg::Request { req: entry.clone() }, Some(next))?;
        self.handle_request(entry)?;

        self.deliver_ready().await?;
        self.check_turn().await
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::protocols::rotseq::rotseq_tests::test_replica;
    use crate::server::Table;

    fn submit(
        id: &str,
        name: &str,
    ) -> (SubmitReq, oneshot::Receiver<GlobalSeq>) {
        let (tx_done, rx_done) = oneshot::channel();
        let req = SubmitReq {
            id: id.into(),
            ops: OpsType::CreateSeller,
            payload: Bytes::from(format!("{{\"id\":\"{}\"}}", name)),
            tx_done,
        };
        (req, rx_done)
    }

    #[tokio::test]
    async fn originate_bcasts_request() -> Result<(), OrdercastError> {
        // replica 0 of 3: the sequencer for global seq 1 is replica 1
        let (mut replica, _, _net, mut eps) = test_replica(0, 3);
        let (req, _rx) = submit("r1", "s1");
        replica.handle_submit(req).await?;

        assert_eq!(replica.local_counter, 1);
        assert_eq!(replica.to_deliver.len(), 1);
        assert_eq!(replica.last_buffered.get(&0), Some(&1));
        for ep in eps.iter_mut() {
            match ep.drain().as_slice() {
                [RotSeqMsg::Request { req }] => {
                    assert_eq!(req.id, "r1");
                    assert_eq!(req.request_node, 0);
                    assert_eq!(req.local_seq, 1);
                }
                other => panic!("unexpected msgs {:?}", other),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn originate_on_own_turn() -> Result<(), OrdercastError> {
        // replica 1 of 3 holds the turn for global seq 1
        let (mut replica, store, _net, mut eps) = test_replica(1, 3);
        let (req, rx) = submit("r1", "s1");
        replica.handle_submit(req).await?;

        assert_eq!(rx.await.unwrap(), 1);
        assert_eq!(replica.global_counter, 1);
        assert!(replica.to_deliver.is_empty());
        assert_eq!(store.count(Table::Sellers), 1);
        for ep in eps.iter_mut() {
            let msgs = ep.drain();
            assert!(matches!(msgs[0], RotSeqMsg::Request { .. }));
            assert!(matches!(
                msgs[1],
                RotSeqMsg::Sequence {
                    sequence_node: 1,
                    global_seq: 1,
                    ..
                }
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn resubmit_delivered() -> Result<(), OrdercastError> {
        let (mut replica, store, _net, _eps) = test_replica(1, 3);
        let (req, rx) = submit("r1", "s1");
        replica.handle_submit(req).await?;
        assert_eq!(rx.await.unwrap(), 1);

        let (req, rx) = submit("r1", "s1");
        replica.handle_submit(req).await?;
        assert_eq!(rx.await.unwrap(), 1);
        assert_eq!(replica.local_counter, 1);
        assert_eq!(replica.global_counter, 1);
        assert_eq!(store.count(Table::Sellers), 1);
        Ok(())
    }

    #[tokio::test]
    async fn resubmit_pending() -> Result<(), OrdercastError> {
        let (mut replica, _, _net, mut eps) = test_replica(0, 3);
        let (req, rx_old) = submit("r1", "s1");
        replica.handle_submit(req).await?;
        drop(rx_old);
        eps.iter_mut().for_each(|ep| drop(ep.drain()));

        let (req, _rx) = submit("r1", "s1");
        replica.handle_submit(req).await?;
        assert_eq!(replica.local_counter, 1);
        assert_eq!(replica.to_deliver.len(), 1);
        assert!(replica.trackers.contains_key("r1"));
        for ep in eps.iter_mut() {
            match ep.drain().as_slice() {
                [RotSeqMsg::Request { req }] => assert_eq!(req.local_seq, 1),
                other => panic!("unexpected msgs {:?}", other),
            }
        }
        Ok(())
    }
}
