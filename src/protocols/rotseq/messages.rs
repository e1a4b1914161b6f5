//! `RotSeq` -- peer-peer messaging.

use super::*;

impl RotSeqMsg {
    /// The outstanding retransmit request this message satisfies, if any.
    pub fn answers(&self) -> Option<Wanted> {
        match self {
            RotSeqMsg::Request { req } => Some(Wanted::Request {
                request_node: req.request_node,
                local_seq: req.local_seq,
            }),
            RotSeqMsg::Sequence { global_seq, .. } => Some(Wanted::Sequence {
                global_seq: *global_seq,
            }),
            _ => None,
        }
    }
}

// RotSeqReplica peer-peer messages handling
impl<T, A> RotSeqReplica<T, A>
where
    T: GenericTransport<RotSeqMsg>,
    A: Applier,
{
    /// Synthesized handler of receiving message from peer.
    pub(super) async fn handle_msg(
        &mut self,
        msg: RotSeqMsg,
    ) -> Result<(), OrdercastError> {
        if let Some(wanted) = msg.answers() {
            self.resolve_retransmit(&wanted);
        }

        match msg {
            RotSeqMsg::Request { req } => {
                self.handle_request(req)?;
            }
            RotSeqMsg::Sequence {
                req,
                sequence_node,
                global_seq,
            } => {
                self.handle_sequence(req, sequence_node, global_seq)?;
            }
            RotSeqMsg::Retransmit {
                retransmit_node,
                wanted,
            } => {
                self.handle_retransmit(retransmit_node, wanted)?;
            }
            RotSeqMsg::Ack {
                ack_node,
                global_seq,
            } => {
                pf_trace!(self.id; "ignored Ack of {} from {}", global_seq, ack_node);
            }
        }

        self.deliver_ready().await?;
        self.check_turn().await
    }
}
