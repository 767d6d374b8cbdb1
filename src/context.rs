use std::sync::{Arc, RwLock};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::communicator::{Communicator, FragOutcome};
use crate::config::Pt2PtConfig;
use crate::descriptor::pool::{DescriptorHandle, DescriptorPool, Slot};
use crate::descriptor::recv::{RecvDescriptor, RecvFrag};
use crate::descriptor::send::{FragState, QueueMembership, SendDescriptor};
use crate::path::container::PathContainer;
use crate::path::{AckInfo, AckKind, AckRequest};
use crate::queues::SendQueues;
use crate::reliability::{DuplicateCheck, ReliabilityContext};
use crate::{ContextId, Rank};

impl AckRequest {
    pub fn for_frag(frag: &RecvFrag, kind: AckKind) -> AckRequest {
        AckRequest {
            path: frag.path,
            to: frag.src,
            send_token: frag.send_token,
            frag_index: frag.frag_index,
            frag_seq: frag.frag_seq,
            kind,
        }
    }
}

/// State shared between the application-facing API, progress and the paths. Paths receive a
///  reference to it with every call rather than holding on to it.
pub struct ProgressContext {
    pub config: Arc<Pt2PtConfig>,
    pub self_rank: Rank,
    pub send_pool: DescriptorPool<SendDescriptor>,
    pub recv_pool: DescriptorPool<RecvDescriptor>,
    pub queues: SendQueues,
    pub reliability: ReliabilityContext,
    pub paths: PathContainer,
    communicators: RwLock<FxHashMap<ContextId, Arc<Communicator>>>,
}

impl ProgressContext {
    pub fn new(config: Arc<Pt2PtConfig>, self_rank: Rank) -> ProgressContext {
        ProgressContext {
            send_pool: DescriptorPool::new("send", config.send_pool_size),
            recv_pool: DescriptorPool::new("recv", config.recv_pool_size),
            queues: SendQueues::default(),
            reliability: ReliabilityContext::new(&config.reliability),
            paths: PathContainer::default(),
            communicators: Default::default(),
            self_rank,
            config,
        }
    }

    pub fn add_communicator(&self, communicator: Communicator) -> anyhow::Result<Arc<Communicator>> {
        let mut communicators = self.communicators.write().unwrap();
        if communicators.contains_key(&communicator.context_id()) {
            bail!("communicator with context id {} exists already", communicator.context_id());
        }
        let communicator = Arc::new(communicator);
        communicators.insert(communicator.context_id(), communicator.clone());
        Ok(communicator)
    }

    pub fn communicator(&self, context_id: ContextId) -> Option<Arc<Communicator>> {
        self.communicators.read().unwrap()
            .get(&context_id)
            .cloned()
    }

    /// Entry point for every data fragment a path receives: filters duplicates, hands the
    ///  fragment to its communicator and acknowledges it according to the outcome.
    pub async fn deliver_frag(&self, frag: RecvFrag) {
        if frag.dst != self.self_rank {
            warn!("fragment from {} addressed to {} rather than to {} - dropping", frag.src, frag.dst, self.self_rank);
            return;
        }

        match self.reliability.check_duplicate(frag.src, frag.frag_seq) {
            DuplicateCheck::New => {}
            DuplicateCheck::AlreadyDelivered => {
                self.acknowledge_request(AckRequest::for_frag(&frag, AckKind::GoodAck)).await;
                return;
            }
            DuplicateCheck::Held => {
                // its ack waits for the message to match a receive
                self.acknowledge_request(AckRequest::for_frag(&frag, AckKind::Received)).await;
                return;
            }
        }

        let Some(communicator) = self.communicator(frag.context_id) else {
            warn!("fragment for unknown context {} from {} - dropping", frag.context_id, frag.src);
            self.reliability.forget(frag.src, frag.frag_seq);
            return;
        };

        let (src, seq) = (frag.src, frag.frag_seq);
        let ack = AckRequest::for_frag(&frag, AckKind::GoodAck);
        let outcome = communicator.handle_received_frag(frag, self).await;
        trace!("fragment #{} from {}: {:?}", seq, src, outcome);

        match outcome {
            FragOutcome::Delivered | FragOutcome::Buffered => self.acknowledge_request(ack).await,
            FragOutcome::Deferred => {}
            FragOutcome::CopyFailed => self.acknowledge_request(AckRequest { kind: AckKind::Nack, ..ack }).await,
            FragOutcome::Dropped => self.reliability.forget(src, seq),
        }
    }

    pub async fn acknowledge(&self, frag: &RecvFrag, kind: AckKind) {
        self.acknowledge_request(AckRequest::for_frag(frag, kind)).await;
    }

    /// Records the receiver's responsibility for a fragment (or the lack of it, for NACKs) and
    ///  sends the acknowledgement on the path the fragment arrived on
    async fn acknowledge_request(&self, ack: AckRequest) {
        match ack.kind {
            AckKind::GoodAck => self.reliability.mark_delivered(ack.to, ack.frag_seq),
            AckKind::Nack => self.reliability.forget(ack.to, ack.frag_seq),
            AckKind::Received => {}
        }

        let Some(path) = self.paths.get(ack.path) else {
            warn!("fragment #{} arrived on unknown {} - cannot acknowledge", ack.frag_seq, ack.path);
            return;
        };
        if path.do_ack() {
            path.send_ack(&ack, self).await;
        }
    }

    /// Applies an acknowledgement received from the network to the send descriptor it refers to
    pub async fn process_ack(&self, ack: AckInfo) {
        self.reliability.record_peer_in_order(ack.from, ack.received_in_order, ack.delivered_in_order);

        let handle = DescriptorHandle::from_token(ack.send_token);
        let Ok(mut slot) = self.send_pool.lock(handle).await else {
            trace!("ack for released send descriptor {:?} - dropping", handle);
            return;
        };
        let desc = &mut slot.desc;

        if desc.dest != ack.from {
            debug!("ack from {} for a message to {} - dropping", ack.from, desc.dest);
            return;
        }
        let Some(frag) = desc.frags.get_mut(ack.frag_index as usize) else {
            debug!("ack for fragment {} of a message with {} fragments - dropping", ack.frag_index, desc.num_frags);
            return;
        };
        if frag.seq != ack.frag_seq {
            trace!("ack for fragment #{} which is now #{} - dropping", ack.frag_seq, frag.seq);
            return;
        }

        match ack.kind {
            AckKind::GoodAck => {
                if !desc.ack_frag(ack.frag_index as usize) {
                    trace!("duplicate ack for fragment #{}", ack.frag_seq);
                    return;
                }
                if desc.send_done() {
                    self.complete_send(&mut slot);
                }
            }
            AckKind::Nack => {
                if frag.state != FragState::ToAck {
                    return;
                }
                debug!("NACK for fragment #{} to {} - sending it again", ack.frag_seq, ack.from);
                frag.state = FragState::ToSend;
                desc.num_sent -= 1;
                desc.clear_to_send = true;
                if desc.queue == QueueMembership::Unacked {
                    self.queues.move_to(handle, desc, QueueMembership::Incomplete);
                }
            }
            AckKind::Received => {
                if frag.state != FragState::Acked && !frag.held {
                    debug!("fragment #{} is held by {} until its message is matched", ack.frag_seq, ack.from);
                    frag.held = true;
                }
            }
        }
    }

    /// Applies what the destination last reported about the fragments it has in order:
    ///  delivered ones count as acknowledged, received ones as held. Returns `true` if this
    ///  completed the send.
    pub fn apply_peer_in_order(&self, slot: &mut Slot<SendDescriptor>) -> bool {
        let peer = self.reliability.peer_in_order(slot.desc.dest);
        let desc = &mut slot.desc;

        let mut newly_acked = false;
        for index in 0..desc.frags.len() {
            let frag = &mut desc.frags[index];
            if !frag.seq.is_assigned() || frag.state == FragState::Acked {
                continue;
            }
            if frag.seq <= peer.delivered {
                trace!("fragment #{} to {} is delivered in order", frag.seq, desc.dest);
                newly_acked |= desc.ack_frag(index);
            }
            else if frag.seq <= peer.received {
                frag.held = true;
            }
        }

        if newly_acked && desc.send_done() {
            self.complete_send(slot);
            return true;
        }
        false
    }

    /// Finishes a send whose fragments are all acknowledged
    pub fn complete_send(&self, slot: &mut Slot<SendDescriptor>) {
        let handle = slot.handle();
        trace!("send {:?} to {} is acknowledged completely", handle, slot.desc.dest);

        self.queues.remove(handle, &mut slot.desc);
        if !slot.desc.base.message_done {
            slot.desc.base.mark_done();
        }
        if slot.desc.base.free_called {
            self.send_pool.release(slot);
        }
    }

    /// Called when a receive completes: a receive the application released already goes back
    ///  to the pool right away
    pub fn recv_completed(&self, slot: &mut Slot<RecvDescriptor>) {
        if slot.desc.base.free_called {
            self.recv_pool.release(slot);
        }
    }
}
