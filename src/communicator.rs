use std::collections::{BTreeMap, VecDeque};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};
use crate::context::ProgressContext;
use crate::descriptor::pool::{DescriptorHandle, Slot};
use crate::descriptor::recv::{RecvDescriptor, RecvFrag, SourceMatch, TagMatch};
use crate::descriptor::Status;
use crate::error::{ErrorCode, Pt2PtResult};
use crate::path::AckKind;
use crate::{ContextId, Rank, Tag};

/// What happened to an incoming fragment, which determines how it is acknowledged
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FragOutcome {
    /// copied into a matched receive
    Delivered,
    /// no matching receive yet, the fragment is buffered and can be acknowledged
    Buffered,
    /// buffered, but the acknowledgement must wait until a receive matches the message
    ///  (synchronous sends)
    Deferred,
    /// the data is corrupt, the sender must send it again
    CopyFailed,
    Dropped,
}

/// A receive that was posted but not matched yet
#[derive(Debug, Clone)]
struct PostedRecv {
    irecv_seq: u64,
    handle: DescriptorHandle,
    tag: TagMatch,
}

#[derive(Debug)]
struct BufferedFrag {
    frag: RecvFrag,
    ack_deferred: bool,
}

#[derive(Default)]
struct CommunicatorInner {
    /// per destination (local rank), the sequence number of the next message
    next_isend_seq: FxHashMap<u32, u64>,
    next_irecv_seq: u64,
    /// per source, the sequence number of the next message that is allowed to match: messages
    ///  from one source match in the order they were sent
    next_expected_isend: FxHashMap<u32, u64>,

    posted_specific: FxHashMap<u32, VecDeque<PostedRecv>>,
    posted_wild: VecDeque<PostedRecv>,

    /// fragments of messages that are in sequence but not matched yet. Ordered by source so that
    ///  wildcard matching is deterministic
    unexpected: BTreeMap<u32, VecDeque<BufferedFrag>>,
    /// fragments of messages that overtook earlier messages from the same source
    ahead_of_sequence: FxHashMap<u32, BTreeMap<u64, Vec<BufferedFrag>>>,
    /// (source, isend_seq) of messages that are matched, but not complete
    matched: FxHashMap<(u32, u64), DescriptorHandle>,
}

impl CommunicatorInner {
    fn expected(&self, src: u32) -> u64 {
        self.next_expected_isend.get(&src).copied().unwrap_or(1)
    }

    fn advance_expected(&mut self, src: u32) {
        *self.next_expected_isend.entry(src).or_insert(1) += 1;
    }

    /// Removes the posted receive that an incoming message with this source and tag matches.
    ///  Of the first candidates on the specific and the wildcard queue, the one posted earlier wins.
    fn take_posted(&mut self, src: u32, tag: Tag) -> Option<PostedRecv> {
        let specific_pos = self.posted_specific.get(&src)
            .and_then(|q| q.iter().position(|p| p.tag.matches(tag)));
        let wild_pos = self.posted_wild.iter()
            .position(|p| p.tag.matches(tag));

        let specific_seq = specific_pos
            .and_then(|pos| self.posted_specific.get(&src).map(|q| q[pos].irecv_seq));
        let wild_seq = wild_pos.map(|pos| self.posted_wild[pos].irecv_seq);

        match (specific_seq, wild_seq) {
            (Some(s), Some(w)) if w < s => self.posted_wild.remove(wild_pos?),
            (Some(_), _) => self.posted_specific.get_mut(&src)?.remove(specific_pos?),
            (None, Some(_)) => self.posted_wild.remove(wild_pos?),
            (None, None) => None,
        }
    }

    fn find_unexpected(&self, source: SourceMatch, tag: TagMatch) -> Option<(u32, &RecvFrag)> {
        match source {
            SourceMatch::Rank(src) => self.unexpected.get(&src)
                .and_then(|q| q.iter().find(|b| tag.matches(b.frag.tag)))
                .map(|b| (src, &b.frag)),
            SourceMatch::Any => self.unexpected.iter()
                .find_map(|(&src, q)| q.iter()
                    .find(|b| tag.matches(b.frag.tag))
                    .map(|b| (src, &b.frag))),
        }
    }
}

/// Matching state of one communicator: posted receives, and messages that arrived before a
///  receive was posted for them.
///
/// Lock order: the communicator's lock is taken before a receive descriptor's lock, never the
///  other way around.
pub struct Communicator {
    context_id: ContextId,
    local_rank: u32,
    /// local rank -> global rank
    group: Vec<Rank>,
    global_to_local: FxHashMap<Rank, u32>,
    inner: Mutex<CommunicatorInner>,
}

impl Communicator {
    pub fn new(context_id: ContextId, self_rank: Rank, group: Vec<Rank>) -> anyhow::Result<Communicator> {
        let mut global_to_local = FxHashMap::default();
        for (local, &global) in group.iter().enumerate() {
            if global_to_local.insert(global, local as u32).is_some() {
                anyhow::bail!("rank {} appears more than once in the group of communicator {}", global, context_id);
            }
        }
        let Some(&local_rank) = global_to_local.get(&self_rank) else {
            anyhow::bail!("rank {} is not a member of communicator {}", self_rank, context_id);
        };

        Ok(Communicator {
            context_id,
            local_rank,
            group,
            global_to_local,
            inner: Default::default(),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    pub fn size(&self) -> u32 {
        self.group.len() as u32
    }

    pub fn global_of(&self, local: u32) -> Pt2PtResult<Rank> {
        self.group.get(local as usize)
            .copied()
            .ok_or(ErrorCode::BadParam)
    }

    pub fn local_of(&self, global: Rank) -> Option<u32> {
        self.global_to_local.get(&global).copied()
    }

    pub async fn next_isend_seq(&self, dest_local: u32) -> u64 {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_isend_seq.entry(dest_local).or_insert(1);
        let result = *seq;
        *seq += 1;
        result
    }

    /// Finds a home for an incoming fragment: the receive its message is matched to, or one of
    ///  the buffers for messages that are not matched yet.
    pub async fn handle_received_frag(&self, frag: RecvFrag, ctx: &ProgressContext) -> FragOutcome {
        let Some(src) = self.local_of(frag.src) else {
            warn!("fragment from {} which is not a member of communicator {} - dropping", frag.src, self.context_id);
            return FragOutcome::Dropped;
        };

        let mut inner = self.inner.lock().await;
        let expected = inner.expected(src);

        if frag.isend_seq < expected {
            // a later fragment of a message that was sequenced before
            if let Some(&handle) = inner.matched.get(&(src, frag.isend_seq)) {
                return Self::copy_into(&mut inner, src, handle, &frag, ctx).await;
            }
            return Self::buffer(inner.unexpected.entry(src).or_default(), frag);
        }

        if frag.isend_seq > expected {
            trace!("message #{} from {} overtook message #{} - buffering", frag.isend_seq, src, expected);
            let buf = inner.ahead_of_sequence.entry(src).or_default()
                .entry(frag.isend_seq).or_default();
            return Self::buffer(buf, frag);
        }

        if !frag.verify_checksum() {
            // the message keeps its place in sequence until an intact retransmission arrives
            warn!("checksum mismatch for fragment #{} of message #{} from {}", frag.frag_seq, frag.isend_seq, src);
            return FragOutcome::CopyFailed;
        }

        inner.advance_expected(src);
        let outcome = match inner.take_posted(src, frag.tag) {
            Some(posted) => {
                inner.matched.insert((src, frag.isend_seq), posted.handle);
                Self::bind_and_copy(&mut inner, src, posted.handle, &frag, ctx).await
            }
            None => Self::buffer(inner.unexpected.entry(src).or_default(), frag),
        };

        self.drain_ahead_of_sequence(&mut inner, src, ctx).await;
        outcome
    }

    /// Posts a receive, matching it right away against buffered messages if possible.
    pub async fn post_receive(&self, handle: DescriptorHandle, ctx: &ProgressContext) -> Pt2PtResult<()> {
        let mut inner = self.inner.lock().await;
        let mut slot = ctx.recv_pool.lock(handle).await?;

        let irecv_seq = inner.next_irecv_seq;
        inner.next_irecv_seq += 1;
        slot.desc.irecv_seq = irecv_seq;

        let source = slot.desc.source;
        let tag = slot.desc.tag;

        let found = inner.find_unexpected(source, tag)
            .map(|(src, frag)| (src, frag.isend_seq));

        let Some((src, isend_seq)) = found else {
            let posted = PostedRecv { irecv_seq, handle, tag };
            match source {
                SourceMatch::Rank(src) => inner.posted_specific.entry(src).or_default().push_back(posted),
                SourceMatch::Any => inner.posted_wild.push_back(posted),
            }
            trace!("posted receive {:?} for source {:?}, tag {:?}", handle, source, tag);
            return Ok(());
        };

        debug!("receive {:?} matches buffered message #{} from {}", handle, isend_seq, src);
        let frags = {
            let Some(queue) = inner.unexpected.get_mut(&src) else {
                return Ok(());
            };
            let (of_message, others) = std::mem::take(queue)
                .into_iter()
                .partition::<VecDeque<_>, _>(|b| b.frag.isend_seq == isend_seq);
            *queue = others;
            if queue.is_empty() {
                inner.unexpected.remove(&src);
            }
            of_message
        };

        if let Some(first) = frags.front() {
            slot.desc.bind_message(&first.frag, src);
        }
        inner.matched.insert((src, isend_seq), handle);
        for buffered in frags {
            Self::copy_buffered(&mut inner, src, &mut slot, buffered, ctx).await;
        }
        Ok(())
    }

    /// The envelope of the first buffered message that a receive with this source and tag would
    ///  match
    pub async fn probe(&self, source: SourceMatch, tag: TagMatch) -> Option<Status> {
        let inner = self.inner.lock().await;
        inner.find_unexpected(source, tag)
            .map(|(src, frag)| Status {
                tag: frag.tag,
                peer: src,
                error: None,
                matched_size: frag.msg_len,
                persistent: false,
            })
    }

    fn buffer<C: Extend<BufferedFrag>>(buf: &mut C, frag: RecvFrag) -> FragOutcome {
        if !frag.verify_checksum() {
            warn!("checksum mismatch for unexpected fragment #{} from {}", frag.frag_seq, frag.src);
            return FragOutcome::CopyFailed;
        }

        let ack_deferred = frag.is_synchronous();
        buf.extend(Some(BufferedFrag { frag, ack_deferred }));
        if ack_deferred {
            FragOutcome::Deferred
        }
        else {
            FragOutcome::Buffered
        }
    }

    async fn bind_and_copy(inner: &mut CommunicatorInner, src: u32, handle: DescriptorHandle, frag: &RecvFrag, ctx: &ProgressContext) -> FragOutcome {
        match ctx.recv_pool.lock(handle).await {
            Ok(mut slot) => {
                slot.desc.bind_message(frag, src);
                Self::copy_locked(inner, src, &mut slot, frag, ctx)
            }
            Err(_) => {
                error!("posted receive {:?} disappeared while matched", handle);
                inner.matched.remove(&(src, frag.isend_seq));
                FragOutcome::Dropped
            }
        }
    }

    async fn copy_into(inner: &mut CommunicatorInner, src: u32, handle: DescriptorHandle, frag: &RecvFrag, ctx: &ProgressContext) -> FragOutcome {
        match ctx.recv_pool.lock(handle).await {
            Ok(mut slot) => Self::copy_locked(inner, src, &mut slot, frag, ctx),
            Err(_) => {
                debug!("fragment for receive {:?} which is gone - dropping", handle);
                inner.matched.remove(&(src, frag.isend_seq));
                FragOutcome::Dropped
            }
        }
    }

    fn copy_locked(inner: &mut CommunicatorInner, src: u32, slot: &mut Slot<RecvDescriptor>, frag: &RecvFrag, ctx: &ProgressContext) -> FragOutcome {
        match slot.desc.copy_to_app(frag) {
            Err(_) => FragOutcome::CopyFailed,
            Ok(result) => {
                if slot.desc.delivered_to_app(result) {
                    inner.matched.remove(&(src, frag.isend_seq));
                    ctx.recv_completed(slot);
                }
                FragOutcome::Delivered
            }
        }
    }

    /// Copies a fragment that was buffered before, sending its acknowledgement if that was
    ///  deferred until now
    async fn copy_buffered(inner: &mut CommunicatorInner, src: u32, slot: &mut Slot<RecvDescriptor>, buffered: BufferedFrag, ctx: &ProgressContext) {
        match Self::copy_locked(inner, src, slot, &buffered.frag, ctx) {
            FragOutcome::Delivered => {
                if buffered.ack_deferred {
                    ctx.acknowledge(&buffered.frag, AckKind::GoodAck).await;
                }
            }
            outcome => {
                // checksums of buffered fragments are verified when they arrive
                error!("buffered fragment #{} from {} could not be copied: {:?}", buffered.frag.frag_seq, buffered.frag.src, outcome);
            }
        }
    }

    /// Moves messages that were buffered because they overtook an earlier message into
    ///  sequence, as far as there are no more gaps
    async fn drain_ahead_of_sequence(&self, inner: &mut CommunicatorInner, src: u32, ctx: &ProgressContext) {
        loop {
            let expected = inner.expected(src);
            let Some(frags) = inner.ahead_of_sequence.get_mut(&src).and_then(|m| m.remove(&expected)) else {
                break;
            };
            let Some(tag) = frags.first().map(|b| b.frag.tag) else {
                continue;
            };
            inner.advance_expected(src);
            trace!("message #{} from {} is in sequence now", expected, src);

            match inner.take_posted(src, tag) {
                Some(posted) => {
                    let Ok(mut slot) = ctx.recv_pool.lock(posted.handle).await else {
                        error!("posted receive {:?} disappeared while matched", posted.handle);
                        continue;
                    };
                    slot.desc.bind_message(&frags[0].frag, src);
                    inner.matched.insert((src, expected), posted.handle);
                    for buffered in frags {
                        Self::copy_buffered(inner, src, &mut slot, buffered, ctx).await;
                    }
                }
                None => {
                    inner.unexpected.entry(src).or_default().extend(frags);
                }
            }
        }

        if inner.ahead_of_sequence.get(&src).is_some_and(|m| m.is_empty()) {
            inner.ahead_of_sequence.remove(&src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::config::Pt2PtConfig;
    use crate::descriptor::recv::data_checksum;
    use crate::descriptor::send::SendMode;
    use crate::frag_seq::FragSeq;
    use crate::path::PathId;

    fn ctx() -> ProgressContext {
        ProgressContext::new(Arc::new(Pt2PtConfig::for_tests()), 0)
    }

    fn communicator() -> Communicator {
        Communicator::new(1, 0, vec![0, 7, 5]).unwrap()
    }

    fn frag(src: Rank, isend_seq: u64, frag_seq: u64, tag: Tag, mode: SendMode, payload: &[u8]) -> RecvFrag {
        RecvFrag {
            path: PathId(0),
            context_id: 1,
            src,
            dst: 0,
            tag,
            mode,
            send_token: 0,
            frag_index: 0,
            frag_seq: FragSeq::from_raw(frag_seq),
            isend_seq,
            msg_len: payload.len() as u64,
            offset: 0,
            data_crc: data_checksum(payload),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    async fn post(ctx: &ProgressContext, communicator: &Communicator, source: SourceMatch, tag: TagMatch, len: usize) -> DescriptorHandle {
        let handle = {
            let mut slot = ctx.recv_pool.acquire().await.unwrap();
            slot.desc.source = source;
            slot.desc.tag = tag;
            slot.desc.buffer = vec![0; len];
            slot.desc.posted_len = len as u64;
            slot.desc.base.reactivate();
            ctx.recv_pool.attach(&mut slot);
            slot.handle()
        };
        communicator.post_receive(handle, ctx).await.unwrap();
        handle
    }

    #[rstest]
    #[case::duplicate_rank(vec![0, 1, 1])]
    #[case::not_a_member(vec![1, 2])]
    #[case::empty(vec![])]
    fn test_new_rejects(#[case] group: Vec<Rank>) {
        assert!(Communicator::new(1, 0, group).is_err());
    }

    #[test]
    fn test_rank_mapping() {
        let communicator = Communicator::new(1, 5, vec![0, 7, 5]).unwrap();
        assert_eq!(communicator.local_rank(), 2);
        assert_eq!(communicator.size(), 3);
        assert_eq!(communicator.global_of(1), Ok(7));
        assert_eq!(communicator.global_of(3), Err(ErrorCode::BadParam));
        assert_eq!(communicator.local_of(7), Some(1));
        assert_eq!(communicator.local_of(1), None);
    }

    #[tokio::test]
    async fn test_isend_seq_per_destination() {
        let communicator = communicator();
        assert_eq!(communicator.next_isend_seq(1).await, 1);
        assert_eq!(communicator.next_isend_seq(1).await, 2);
        assert_eq!(communicator.next_isend_seq(2).await, 1);
        assert_eq!(communicator.next_isend_seq(1).await, 3);
    }

    #[rstest]
    #[case::standard(SendMode::Standard, FragOutcome::Buffered)]
    #[case::synchronous(SendMode::Synchronous, FragOutcome::Deferred)]
    #[tokio::test]
    async fn test_unexpected(#[case] mode: SendMode, #[case] expected: FragOutcome) {
        let ctx = ctx();
        let communicator = communicator();

        let outcome = communicator.handle_received_frag(frag(7, 1, 1, 3, mode, b"abc"), &ctx).await;
        assert_eq!(outcome, expected);

        let status = communicator.probe(SourceMatch::Any, TagMatch::Any).await.unwrap();
        assert_eq!((status.peer, status.tag, status.matched_size), (1, 3, 3));
    }

    #[tokio::test]
    async fn test_corrupted_unexpected_fragment_is_not_buffered() {
        let ctx = ctx();
        let communicator = communicator();

        let mut corrupted = frag(7, 1, 1, 3, SendMode::Standard, b"abc");
        corrupted.data_crc ^= 1;
        assert_eq!(communicator.handle_received_frag(corrupted, &ctx).await, FragOutcome::CopyFailed);
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await, None);

        // the retransmission is buffered normally
        let outcome = communicator.handle_received_frag(frag(7, 1, 1, 3, SendMode::Standard, b"abc"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Buffered);
        assert!(communicator.probe(SourceMatch::Rank(1), TagMatch::Tag(3)).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupted_fragment_keeps_its_message_in_sequence() {
        let ctx = ctx();
        let communicator = communicator();

        let mut corrupted = frag(7, 1, 1, 10, SendMode::Standard, b"first");
        corrupted.data_crc ^= 1;
        assert_eq!(communicator.handle_received_frag(corrupted, &ctx).await, FragOutcome::CopyFailed);

        // the next message must wait for the retransmission of the first one
        communicator.handle_received_frag(frag(7, 2, 2, 20, SendMode::Standard, b"second"), &ctx).await;
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await, None);

        let outcome = communicator.handle_received_frag(frag(7, 1, 1, 10, SendMode::Standard, b"first"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Buffered);
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await.unwrap().tag, 10);

        let handle = post(&ctx, &communicator, SourceMatch::Any, TagMatch::Any, 8).await;
        let slot = ctx.recv_pool.lock(handle).await.unwrap();
        assert_eq!(&slot.desc.buffer[..5], b"first");
    }

    #[tokio::test]
    async fn test_corrupted_fragment_for_posted_receive_leaves_it_posted() {
        let ctx = ctx();
        let communicator = communicator();
        let handle = post(&ctx, &communicator, SourceMatch::Any, TagMatch::Any, 8).await;

        let mut corrupted = frag(7, 1, 1, 10, SendMode::Standard, b"first");
        corrupted.data_crc ^= 1;
        assert_eq!(communicator.handle_received_frag(corrupted, &ctx).await, FragOutcome::CopyFailed);
        {
            let slot = ctx.recv_pool.lock(handle).await.unwrap();
            assert_eq!(slot.desc.matched_source, None);
        }

        let outcome = communicator.handle_received_frag(frag(7, 1, 1, 10, SendMode::Standard, b"first"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Delivered);
        let slot = ctx.recv_pool.lock(handle).await.unwrap();
        assert_eq!(slot.desc.matched_tag, 10);
        assert_eq!(&slot.desc.buffer[..5], b"first");
    }

    #[tokio::test]
    async fn test_fragment_from_non_member_is_dropped() {
        let ctx = ctx();
        let communicator = communicator();
        let outcome = communicator.handle_received_frag(frag(9, 1, 1, 3, SendMode::Standard, b"abc"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_overtaking_message_waits_for_its_predecessor() {
        let ctx = ctx();
        let communicator = communicator();

        let outcome = communicator.handle_received_frag(frag(7, 2, 2, 20, SendMode::Standard, b"second"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Buffered);
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await, None);

        communicator.handle_received_frag(frag(7, 1, 1, 10, SendMode::Standard, b"first"), &ctx).await;
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await.unwrap().tag, 10);
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Tag(20)).await.unwrap().tag, 20);
    }

    #[tokio::test]
    async fn test_posted_receive_is_matched() {
        let ctx = ctx();
        let communicator = communicator();
        let handle = post(&ctx, &communicator, SourceMatch::Rank(2), TagMatch::Any, 8).await;

        // a different source does not match
        let outcome = communicator.handle_received_frag(frag(7, 1, 1, 3, SendMode::Standard, b"abc"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Buffered);

        let outcome = communicator.handle_received_frag(frag(5, 1, 2, 3, SendMode::Synchronous, b"xyz"), &ctx).await;
        assert_eq!(outcome, FragOutcome::Delivered);

        let slot = ctx.recv_pool.lock(handle).await.unwrap();
        assert!(slot.desc.base.message_done);
        assert_eq!(slot.desc.matched_source, Some(2));
        assert_eq!(&slot.desc.buffer[..3], b"xyz");
    }

    #[tokio::test]
    async fn test_post_matches_buffered_message() {
        let ctx = ctx();
        let communicator = communicator();
        communicator.handle_received_frag(frag(7, 1, 1, 3, SendMode::Standard, b"abc"), &ctx).await;
        communicator.handle_received_frag(frag(7, 2, 2, 4, SendMode::Standard, b"def"), &ctx).await;

        let handle = post(&ctx, &communicator, SourceMatch::Any, TagMatch::Tag(4), 3).await;
        {
            let slot = ctx.recv_pool.lock(handle).await.unwrap();
            assert!(slot.desc.base.message_done);
            assert_eq!(slot.desc.buffer, b"def");
        }

        // the other message is still there
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Any).await.unwrap().tag, 3);
        assert_eq!(communicator.probe(SourceMatch::Any, TagMatch::Tag(4)).await, None);
    }
}
