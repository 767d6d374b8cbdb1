use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use crate::descriptor::{RequestBase, RequestType, Status};
use crate::error::ErrorCode;
use crate::frag_seq::FragSeq;
use crate::path::PathId;
use crate::safe_converter::SafeCast;
use crate::{Rank, Tag};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SendMode {
    #[default]
    Standard = 0,
    /// completes only after the receiver matched the message and acknowledged all of it
    Synchronous = 1,
}

/// The queue a send descriptor is on. Being on the free list is not represented here: a free
///  descriptor is `Free` in its pool slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum QueueMembership {
    #[default]
    Building,
    Incomplete,
    Unacked,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum FragState {
    #[default]
    ToSend,
    ToAck,
    Acked,
}

/// One wire-level chunk of a send. Fragments live in their parent's `frags` vector and are
///  addressed by index, so there are no pointers between fragment and message.
#[derive(Debug, Clone, Default)]
pub struct SendFrag {
    pub index: u32,
    pub offset: u64,
    pub len: u32,
    pub seq: FragSeq,
    pub state: FragState,
    pub time_sent: Option<Instant>,
    pub num_transmits: u32,
    /// the receiver has this fragment, but holds back its acknowledgement until the message
    ///  matches a receive
    pub held: bool,
}

#[derive(Debug)]
pub struct SendDescriptor {
    pub base: RequestBase,
    /// global rank of the destination
    pub dest: Rank,
    /// rank of the destination in the communicator
    pub dest_local: u32,
    pub tag: Tag,
    pub mode: SendMode,
    /// packed application data, copied when the send is started
    pub payload: Bytes,

    pub path: Option<PathId>,
    pub num_frags: u32,
    pub num_sent: u32,
    pub num_acked: u32,
    pub num_frags_allocated: u32,
    /// flow control: cleared while waiting for an acknowledgement that gates further fragments
    pub clear_to_send: bool,
    pub queue: QueueMembership,
    pub isend_seq: u64,
    pub frags: Vec<SendFrag>,
    /// paths that failed for this message and must not be selected again
    pub failed_paths: Vec<PathId>,
    pub error: Option<ErrorCode>,
}

impl Default for SendDescriptor {
    fn default() -> Self {
        SendDescriptor {
            base: RequestBase::new(RequestType::Send),
            dest: 0,
            dest_local: 0,
            tag: 0,
            mode: SendMode::Standard,
            payload: Bytes::new(),
            path: None,
            num_frags: 0,
            num_sent: 0,
            num_acked: 0,
            num_frags_allocated: 0,
            clear_to_send: true,
            queue: QueueMembership::Building,
            isend_seq: 0,
            frags: Vec::new(),
            failed_paths: Vec::new(),
            error: None,
        }
    }
}

impl SendDescriptor {
    pub fn len(&self) -> u64 {
        self.payload.len().safe_cast()
    }

    pub fn is_synchronous(&self) -> bool {
        self.mode == SendMode::Synchronous
    }

    /// all fragments were sent and acknowledged
    pub fn send_done(&self) -> bool {
        self.num_acked >= self.num_frags && self.num_sent >= self.num_frags
    }

    /// Marks a fragment as acknowledged, returning `false` if it was acknowledged before
    pub fn ack_frag(&mut self, index: usize) -> bool {
        let Some(frag) = self.frags.get_mut(index) else {
            return false;
        };
        match frag.state {
            FragState::Acked => return false,
            // the original transmission was acknowledged after a retransmission was queued
            FragState::ToSend => self.num_sent += 1,
            FragState::ToAck => {}
        }
        frag.state = FragState::Acked;
        self.num_acked += 1;
        self.clear_to_send = true;
        true
    }

    pub fn num_outstanding(&self) -> usize {
        self.frags.iter()
            .filter(|f| f.state == FragState::ToAck)
            .count()
    }

    /// Returns every fragment that was sent but not acknowledged to the 'to send' state,
    ///  keeping its sequence number. Returns the number of fragments that were requeued.
    pub fn requeue_unacked(&mut self) -> u32 {
        let mut count = 0;
        for frag in self.frags.iter_mut().filter(|f| f.state == FragState::ToAck) {
            frag.state = FragState::ToSend;
            count += 1;
        }
        self.num_sent -= count;
        count
    }

    /// Forgets all transmission progress so the descriptor can be started again (persistent
    ///  requests). The payload and envelope are kept.
    pub fn reset_transmission(&mut self) {
        self.path = None;
        self.num_frags = 0;
        self.num_sent = 0;
        self.num_acked = 0;
        self.num_frags_allocated = 0;
        self.clear_to_send = true;
        self.queue = QueueMembership::Building;
        self.frags.clear();
        self.failed_paths.clear();
        self.error = None;
    }

    pub fn status(&self) -> Status {
        Status {
            tag: self.tag,
            peer: self.dest_local,
            error: self.error,
            matched_size: self.len(),
            persistent: self.base.persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn desc_with(states: &[FragState]) -> SendDescriptor {
        let mut desc = SendDescriptor::default();
        desc.num_frags = states.len() as u32;
        desc.num_frags_allocated = states.len() as u32;
        for (i, &state) in states.iter().enumerate() {
            desc.frags.push(SendFrag { index: i as u32, state, seq: FragSeq::from_raw(i as u64 + 1), ..Default::default() });
        }
        desc.num_sent = states.iter().filter(|&&s| s != FragState::ToSend).count() as u32;
        desc.num_acked = states.iter().filter(|&&s| s == FragState::Acked).count() as u32;
        desc
    }

    #[rstest]
    #[case::none_sent(vec![FragState::ToSend, FragState::ToSend], 0, 0, false)]
    #[case::sent_not_acked(vec![FragState::ToAck, FragState::ToAck], 2, 0, false)]
    #[case::partially_acked(vec![FragState::Acked, FragState::ToAck], 2, 1, false)]
    #[case::all_acked(vec![FragState::Acked, FragState::Acked], 2, 2, true)]
    fn test_send_done(#[case] states: Vec<FragState>, #[case] sent: u32, #[case] acked: u32, #[case] expected: bool) {
        let desc = desc_with(&states);
        assert_eq!(desc.num_sent, sent);
        assert_eq!(desc.num_acked, acked);
        assert_eq!(desc.send_done(), expected);
    }

    #[rstest]
    #[case::sent(FragState::ToAck, true)]
    #[case::requeued(FragState::ToSend, true)]
    #[case::acked_before(FragState::Acked, false)]
    fn test_ack_frag(#[case] state: FragState, #[case] expected: bool) {
        let mut desc = desc_with(&[FragState::ToAck, FragState::ToAck, state]);
        desc.clear_to_send = false;

        assert_eq!(desc.ack_frag(2), expected);

        assert_eq!(desc.frags[2].state, FragState::Acked);
        assert_eq!(desc.num_sent, 3);
        assert_eq!(desc.num_acked, 1);
        assert_eq!(desc.clear_to_send, expected);
        assert!(!desc.ack_frag(7));
    }

    #[test]
    fn test_requeue_unacked_keeps_sequence_numbers() {
        let mut desc = desc_with(&[FragState::Acked, FragState::ToAck, FragState::ToAck, FragState::ToSend]);
        assert_eq!(desc.num_outstanding(), 2);

        assert_eq!(desc.requeue_unacked(), 2);

        assert_eq!(desc.num_sent, 1);
        assert_eq!(desc.num_acked, 1);
        assert_eq!(desc.num_outstanding(), 0);
        assert_eq!(desc.frags[0].state, FragState::Acked);
        assert_eq!(desc.frags[1].state, FragState::ToSend);
        assert_eq!(desc.frags[1].seq, FragSeq::from_raw(2));
        assert_eq!(desc.frags[2].seq, FragSeq::from_raw(3));
    }

    #[test]
    fn test_reset_transmission() {
        let mut desc = desc_with(&[FragState::Acked, FragState::Acked]);
        desc.payload = Bytes::from_static(b"abc");
        desc.clear_to_send = false;
        desc.reset_transmission();

        assert_eq!(desc.num_frags, 0);
        assert_eq!(desc.num_sent, 0);
        assert!(desc.frags.is_empty());
        assert!(desc.clear_to_send);
        assert_eq!(desc.len(), 3);
    }
}
