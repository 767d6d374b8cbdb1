//! The transport abstraction. A path moves fragments of a message to a destination; several
//!  paths (e.g. one per network interface) can be registered, and a message that cannot make
//!  progress on its path fails over to another one.

pub mod container;
pub mod udp;

use std::fmt::{Display, Formatter};
use std::time::Duration;
use async_trait::async_trait;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use crate::context::ProgressContext;
use crate::descriptor::pool::DescriptorHandle;
use crate::descriptor::send::SendDescriptor;
use crate::error::Pt2PtResult;
use crate::frag_seq::FragSeq;
use crate::Rank;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PathId(pub u16);

impl Display for PathId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "path-{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PathCapabilities: u8 {
        const MULTICAST = 0b0000_0001;
        /// the path takes part in the acknowledgement protocol
        const ACKS      = 0b0000_0010;
    }
}

/// Identifies a per-path fragment list for generic bookkeeping (e.g. in log output)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct QueueId(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SendProgress {
    /// `true` if some fragments still wait to be sent, e.g. because flow control held them back
    pub incomplete: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckKind {
    GoodAck = 1,
    Nack = 2,
    /// the fragment arrived intact, but the receiver holds it back until its message matches a
    ///  receive. The sender keeps the fragment, but stops counting it towards failover.
    Received = 3,
}

/// Everything needed to acknowledge a received fragment
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckRequest {
    pub path: PathId,
    /// the sender of the fragment, i.e. the receiver of the ack
    pub to: Rank,
    pub send_token: u64,
    pub frag_index: u32,
    pub frag_seq: FragSeq,
    pub kind: AckKind,
}

/// An acknowledgement as received from the network
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckInfo {
    pub from: Rank,
    pub send_token: u64,
    pub frag_index: u32,
    pub frag_seq: FragSeq,
    pub kind: AckKind,
    pub received_in_order: FragSeq,
    pub delivered_in_order: FragSeq,
}

/// The contract every transport implements.
///
/// Per message, a path goes through `bind` -> `init` -> (`send` until not incomplete) ->
///  acknowledgements -> done. No operation blocks waiting for a peer, and failures are always
///  reported by return value. `Err(ErrorCode::BadPath)` from `send` or `resend` asks the caller
///  to move the message to a different path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Path: Send + Sync + 'static {
    fn id(&self) -> PathId;

    fn is_active(&self) -> bool;

    fn deactivate(&self);

    fn capabilities(&self) -> PathCapabilities;

    /// pure capability query without side effects
    fn can_reach(&self, dest: Rank) -> bool;

    /// Attaches a message to this path. Fails with `BadPath` if the path is not active.
    fn bind(&self, desc: &mut SendDescriptor) -> Pt2PtResult<()>;

    /// Detaches a message from this path. Fragments that were sent but not acknowledged are
    ///  returned to the 'to send' state so they are sent again on the next path.
    fn unbind(&self, desc: &mut SendDescriptor);

    /// Computes the number of fragments. Idempotent, and safe to call after a rebind.
    fn init(&self, desc: &mut SendDescriptor) -> Pt2PtResult<()>;

    /// Pushes as many fragments to the network as flow control allows
    async fn send(&self, handle: DescriptorHandle, desc: &mut SendDescriptor, ctx: &ProgressContext) -> Pt2PtResult<SendProgress>;

    fn send_done(&self, desc: &SendDescriptor) -> bool;

    /// Drains incoming data and acknowledgements, handing fragments to the communicators
    async fn receive(&self, timeout: Duration, ctx: &ProgressContext) -> Pt2PtResult<()>;

    /// `true` if some fragment of the message is due for retransmission
    fn retransmit_p(&self, desc: &SendDescriptor, now: Instant) -> bool;

    /// Prepares overdue fragments for retransmission. Returns `true` if the message must go back
    ///  to the incomplete queue.
    fn resend(&self, desc: &mut SendDescriptor, now: Instant) -> Pt2PtResult<bool>;

    /// Sends an acknowledgement (or NACK) for a fragment that arrived on this path. For fragments
    ///  of synchronous sends, this happens only once their message matched a receive; until
    ///  then, retransmissions get a `Received` ack.
    async fn send_ack(&self, ack: &AckRequest, ctx: &ProgressContext);

    fn frag_send_queue(&self) -> QueueId;

    fn to_ack_queue(&self) -> QueueId;

    fn do_ack(&self) -> bool {
        self.capabilities().contains(PathCapabilities::ACKS)
    }
}
