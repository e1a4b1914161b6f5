//! `RotSeq` -- per-sender Request ordering.

use super::*;

// RotSeqReplica per-sender ordering of Requests
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Highest contiguous local sequence number accepted from `sender`.
    pub(super) fn last_buffered_of(&self, sender: ReplicaId) -> LocalSeq {
        self.last_buffered.get(&sender).copied().unwrap_or(0)
    }

    /// Handler of a Request, whether received from a peer or originated
    /// locally. Requests of each sender are accepted strictly in local
    /// sequence order; early ones are held until the gap before them closes.
    pub(super) fn handle_request(
        &mut self,
        req: ReqEntry,
    ) -> Result<(), OrdercastError> {
        let sender = req.request_node;
        let local_seq = req.local_seq;
        if sender >= self.population {
            return logged_err!(self.id; "Request from unknown sender {}", sender);
        }
        let last = self.last_buffered_of(sender);

        if local_seq <= last {
            pf_debug!(self.id; "dropped stale Request {}#{} (watermark {})",
                               sender, local_seq, last);
        } else if local_seq == last + 1 {
            self.accept_request(req);
            // drain contiguous successors held back earlier
            let mut next = local_seq + 1;
            while let Some(held) = self.ooo_reqs.remove(&(sender, next)) {
                self.accept_request(held);
                next += 1;
            }
        } else {
            pf_debug!(self.id; "holding Request {}#{} (watermark {})",
                               sender, local_seq, last);
            self.ooo_reqs.insert((sender, local_seq), req);
            self.request_missing_reqs(sender, last + 1, local_seq - 1)?;
        }

        Ok(())
    }

    /// Moves a Request into the to-be-delivered queue and advances its
    /// sender's watermark.
    fn accept_request(&mut self, req: ReqEntry) {
        pf_trace!(self.id; "accepted Request {}#{} ({})",
                           req.request_node, req.local_seq, req.id);
        self.last_buffered.insert(req.request_node, req.local_seq);
        self.to_deliver.push_back(req);
    }
}
