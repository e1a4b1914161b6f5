//! `RotSeq` -- gap recovery through retransmit requests.

use super::*;

// RotSeqReplica retransmission
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Asks `sender` directly for its Requests in `from..=to` that are
    /// neither held nor already asked for.
    pub(super) fn request_missing_reqs(
        &mut self,
        sender: ReplicaId,
        from: LocalSeq,
        to: LocalSeq,
    ) -> Result<(), OrdercastError> {
        if sender == self.id {
            return logged_err!(self.id; "gap in my own Requests {}..={}", from, to);
        }
        for local_seq in from..=to {
            let wanted = Wanted::Request {
                request_node: sender,
                local_seq,
            };
            if self.ooo_reqs.contains_key(&(sender, local_seq))
                || self.retransmits.contains_key(&wanted)
            {
                continue;
            }
            pf_debug!(self.id; "asking {} for Request #{}", sender, local_seq);
            self.retransmits.insert(wanted.clone(), Some(sender));
            let msg = RotSeqMsg::Retransmit {
                retransmit_node: self.id,
                wanted,
            };
            if let Err(e) = self.transport_hub.send_msg(&msg, sender) {
                pf_warn!(self.id; "error asking {} for Request: {}", sender, e);
            }
        }
        Ok(())
    }

    /// Asks all peers for the Sequences in `from..=to` that are neither held
    /// nor already asked for.
    pub(super) fn request_missing_seqs(
        &mut self,
        from: GlobalSeq,
        to: GlobalSeq,
    ) -> Result<(), OrdercastError> {
        for global_seq in from..=to {
            let wanted = Wanted::Sequence { global_seq };
            if self.ooo_seqs.contains_key(&global_seq)
                || self.retransmits.contains_key(&wanted)
            {
                continue;
            }
            pf_debug!(self.id; "asking all for Sequence {}", global_seq);
            self.retransmits.insert(wanted.clone(), None);
            self.transport_hub.bcast_msg(
                &RotSeqMsg::Retransmit {
                    retransmit_node: self.id,
                    wanted,
                },
                None,
            )?;
        }
        Ok(())
    }

    /// Forgets an outstanding retransmit request once it is satisfied.
    pub(super) fn resolve_retransmit(&mut self, wanted: &Wanted) {
        if self.retransmits.remove(wanted).is_some() {
            pf_trace!(self.id; "retransmit of {:?} resolved", wanted);
        }
    }

    /// Handler of a Retransmit request from peer. Only the originator of a
    /// Request, or the assigner of a Sequence, answers; everyone else stays
    /// silent.
    pub(super) fn handle_retransmit(
        &mut self,
        peer: ReplicaId,
        wanted: Wanted,
    ) -> Result<(), OrdercastError> {
        if peer == self.id || peer >= self.population {
            return logged_err!(self.id; "Retransmit from invalid peer {}", peer);
        }

        let reply = match wanted {
            Wanted::Sequence { global_seq } => {
                self.sent_seqs.get(&global_seq).map(|req| RotSeqMsg::Sequence {
                    req: req.clone(),
                    sequence_node: self.id,
                    global_seq,
                })
            }
            Wanted::Request {
                request_node,
                local_seq,
            } if request_node == self.id => self
                .sent_reqs
                .get(&(self.id, local_seq))
                .map(|req| RotSeqMsg::Request { req: req.clone() }),
            Wanted::Request { .. } => None,
        };

        if let Some(msg) = reply {
            pf_debug!(self.id; "resending to {} {:?}", peer, msg.answers());
            self.transport_hub.send_msg(&msg, peer)?;
        }
        Ok(())
    }

    /// Forgets retransmit requests for things that have since been delivered
    /// or accepted through another path.
    fn prune_retransmits(&mut self) {
        let global_counter = self.global_counter;
        let last_buffered = &self.last_buffered;
        self.retransmits.retain(|wanted, _| match wanted {
            Wanted::Sequence { global_seq } => *global_seq > global_counter,
            Wanted::Request {
                request_node,
                local_seq,
            } => {
                *local_seq > last_buffered.get(request_node).copied().unwrap_or(0)
            }
        });
    }

    /// Handler of the periodic retry tick: re-issues every outstanding
    /// retransmit request and re-checks a deferred turn.
    ///
    /// A missing Sequence is otherwise only noticed once a later one shows
    /// up, which never happens if I hold the turn right after it. So while I
    /// have Requests waiting and the next turn is not mine, I also ask for
    /// the next Sequence; its assigner answers if it has assigned it.
    pub(super) async fn handle_retry_tick(
        &mut self,
    ) -> Result<(), OrdercastError> {
        self.prune_retransmits();

        if !self.retransmits.is_empty() {
            pf_trace!(self.id; "re-issuing {} retransmits", self.retransmits.len());
        }
        for (wanted, target) in self.retransmits.iter() {
            let msg = RotSeqMsg::Retransmit {
                retransmit_node: self.id,
                wanted: wanted.clone(),
            };
            match target {
                Some(peer) => {
                    if let Err(e) = self.transport_hub.send_msg(&msg, *peer) {
                        pf_warn!(self.id; "error re-asking {}: {}", peer, e);
                    }
                }
                None => self.transport_hub.bcast_msg(&msg, None)?,
            }
        }

        let next_seq = self.global_counter + 1;
        if !self.to_deliver.is_empty() && self.next_sequencer() != self.id {
            self.request_missing_seqs(next_seq, next_seq)?;
        }

        self.deliver_ready().await?;
        self.check_turn().await
    }
}
