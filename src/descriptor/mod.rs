//! Message descriptors: the in-memory record of one send or receive operation, from the
//!  application call that starts it to the release of its request.

pub mod datatype;
pub mod pool;
pub mod send;
pub mod recv;

use crate::descriptor::datatype::Datatype;
use crate::descriptor::pool::DescriptorHandle;
use crate::error::ErrorCode;
use crate::{ContextId, Tag};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum RequestStatus {
    #[default]
    Invalid,
    /// filled in, but not started yet
    Inited,
    Incomplete,
    Complete,
    /// a persistent request between two activations
    Inactive,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestType {
    Send,
    Recv,
}

/// State shared by send and receive descriptors
#[derive(Debug)]
pub struct RequestBase {
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub persistent: bool,
    /// Set once per activation when the operation is finished from the application's point of
    ///  view. It is never reset before the completion is consumed.
    pub message_done: bool,
    /// the application released the request while it was still in flight
    pub free_called: bool,
    pub context_id: ContextId,
    pub datatype: Datatype,
}

impl RequestBase {
    pub fn new(request_type: RequestType) -> RequestBase {
        RequestBase {
            request_type,
            status: RequestStatus::Invalid,
            persistent: false,
            message_done: false,
            free_called: false,
            context_id: 0,
            datatype: Datatype::Contiguous,
        }
    }

    pub fn mark_done(&mut self) {
        self.message_done = true;
        self.status = RequestStatus::Complete;
    }

    /// Prepares a (persistent) request for its next activation
    pub fn reactivate(&mut self) {
        self.message_done = false;
        self.status = RequestStatus::Incomplete;
    }
}

/// Opaque handle to a started operation, as seen by the application
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Request {
    Send(DescriptorHandle),
    Recv(DescriptorHandle),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Status {
    pub tag: Tag,
    /// the peer's rank in the communicator: destination for sends, actual source for receives
    pub peer: u32,
    /// `None` for success; truncation is reported here rather than as a failed call
    pub error: Option<ErrorCode>,
    /// number of bytes of the message, as sent
    pub matched_size: u64,
    pub persistent: bool,
}

impl Status {
    /// the status reported for a persistent request that is not active
    pub fn empty() -> Status {
        Status {
            tag: 0,
            peer: 0,
            error: None,
            matched_size: 0,
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Completion {
    pub status: Status,
    /// the user buffer for receives
    pub data: Option<Vec<u8>>,
}
