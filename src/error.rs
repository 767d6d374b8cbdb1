use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Closed set of outcomes reported by request and path operations.
///
/// The numeric values are stable and can be handed to an outer API layer as plain integers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    /// bad request, communicator, rank, tag or datatype
    BadParam = -1,
    /// the descriptor pool is exhausted and nothing in flight will give a descriptor back
    OutOfResource = -2,
    /// the descriptor pool is exhausted, but progress is expected to recycle a descriptor
    TempOutOfResource = -3,
    /// the transport cannot carry this message (any more) - triggers failover to another path
    BadPath = -4,
    /// a message was received that was shorter than the posted buffer. Reported through
    ///  `Status::error` only
    RecvLessThanPosted = -5,
    /// a message was received that was longer than the posted buffer, the excess was discarded.
    ///  Reported through `Status::error` only
    RecvMoreThanPosted = -6,
    Fatal = -7,
}

impl ErrorCode {
    pub fn is_fatal(&self) -> bool {
        *self == ErrorCode::Fatal
    }

    /// truncation codes describe a completed receive, they do not signal a failed call
    pub fn is_truncation(&self) -> bool {
        matches!(self, ErrorCode::RecvLessThanPosted | ErrorCode::RecvMoreThanPosted)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::BadParam => "BAD_PARAM",
            ErrorCode::OutOfResource => "OUT_OF_RESOURCE",
            ErrorCode::TempOutOfResource => "TEMP_OUT_OF_RESOURCE",
            ErrorCode::BadPath => "BAD_PATH",
            ErrorCode::RecvLessThanPosted => "RECV_LESS_THAN_POSTED",
            ErrorCode::RecvMoreThanPosted => "RECV_MORE_THAN_POSTED",
            ErrorCode::Fatal => "FATAL",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for ErrorCode {}

pub type Pt2PtResult<T> = Result<T, ErrorCode>;
