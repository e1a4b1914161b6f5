//! `RotSeq` -- rotating sequencer turn.

use super::*;

/// The replica responsible for assigning global sequence number
/// `global_seq` in a cluster of `population` replicas.
pub fn sequencer_of(global_seq: GlobalSeq, population: u8) -> ReplicaId {
    debug_assert!(population > 0);
    (global_seq % population as GlobalSeq) as ReplicaId
}

// RotSeqReplica sequencing turn
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// The replica whose turn it is to assign the next global sequence number.
    pub(super) fn next_sequencer(&self) -> ReplicaId {
        sequencer_of(self.global_counter + 1, self.population)
    }

    /// Takes my sequencing turn(s) if it is my turn and there is something to
    /// sequence. While any retransmit request of mine is outstanding the turn
    /// is deferred; the retry tick checks again later.
    pub(super) async fn check_turn(&mut self) -> Result<(), OrdercastError> {
        loop {
            let global_seq = self.global_counter + 1;
            if self.to_deliver.is_empty()
                || self.next_sequencer() != self.id
                || self.ooo_seqs.contains_key(&global_seq)
            {
                self.turn_deferred = false;
                return Ok(());
            }
            if !self.retransmits.is_empty() {
                if !self.turn_deferred {
                    pf_debug!(self.id; "deferring turn for {}: {} retransmits pending",
                                       global_seq, self.retransmits.len());
                    self.turn_deferred = true;
                }
                return Ok(());
            }
            self.turn_deferred = false;

            let req = match self.to_deliver.front() {
                Some(req) => req.clone(),
                None => return Ok(()),
            };
            pf_debug!(self.id; "sequencing {} ({}#{}) as {}",
                               req.id, req.request_node, req.local_seq, global_seq);
            self.sent_seqs.insert(global_seq, req.clone());
            self.transport_hub.bcast_msg(
                &RotSeqMsg::Sequence {
                    req: req.clone(),
                    sequence_node: self.id,
                    global_seq,
                },
                None,
            )?;

            self.handle_sequence(req, self.id, global_seq)?;
            self.deliver_ready().await?;
            if self.global_counter < global_seq {
                return logged_err!(self.id; "own Sequence {} not delivered", global_seq);
            }
        }
    }
}
