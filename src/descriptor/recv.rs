use bytes::Bytes;
use crc::Crc;
use tracing::{trace, warn};
use crate::descriptor::send::SendMode;
use crate::descriptor::{RequestBase, RequestType, Status};
use crate::error::ErrorCode;
use crate::frag_seq::FragSeq;
use crate::path::PathId;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::{ContextId, Rank, Tag};

const DATA_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub fn data_checksum(data: &[u8]) -> u32 {
    DATA_CRC.checksum(data)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SourceMatch {
    /// rank in the communicator
    Rank(u32),
    Any,
}

impl SourceMatch {
    pub fn matches(&self, source_local: u32) -> bool {
        match self {
            SourceMatch::Rank(r) => *r == source_local,
            SourceMatch::Any => true,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagMatch {
    Tag(Tag),
    /// any non-negative tag: negative tags are reserved for internal traffic
    Any,
}

impl TagMatch {
    pub fn matches(&self, tag: Tag) -> bool {
        match self {
            TagMatch::Tag(t) => *t == tag,
            TagMatch::Any => tag >= 0,
        }
    }
}

/// An incoming fragment as decoded by a path
#[derive(Debug, Clone)]
pub struct RecvFrag {
    /// the path the fragment arrived on, which is also the path that acknowledges it
    pub path: PathId,
    pub context_id: ContextId,
    pub src: Rank,
    pub dst: Rank,
    pub tag: Tag,
    pub mode: SendMode,
    pub send_token: u64,
    pub frag_index: u32,
    pub frag_seq: FragSeq,
    pub isend_seq: u64,
    pub msg_len: u64,
    pub offset: u64,
    pub data_crc: u32,
    pub payload: Bytes,
}

impl RecvFrag {
    pub fn verify_checksum(&self) -> bool {
        data_checksum(&self.payload) == self.data_crc
    }

    pub fn is_synchronous(&self) -> bool {
        self.mode == SendMode::Synchronous
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CopyError {
    ChecksumMismatch,
}

/// Bytes of a fragment that went to the user buffer and to the bit bucket, respectively
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct CopyResult {
    pub copied: u64,
    pub discarded: u64,
}

#[derive(Debug)]
pub struct RecvDescriptor {
    pub base: RequestBase,
    pub source: SourceMatch,
    pub tag: TagMatch,
    pub buffer: Vec<u8>,
    /// capacity of the user buffer in packed bytes
    pub posted_len: u64,
    pub data_received: u64,
    pub data_in_bit_bucket: u64,
    /// the length of the matched message as sent; `None` until matched
    pub received_message_length: Option<u64>,
    pub matched_source: Option<u32>,
    pub matched_tag: Tag,
    pub isend_seq: u64,
    /// order of posting, for merging the specific-source and wildcard queues at match time
    pub irecv_seq: u64,
    pub error: Option<ErrorCode>,
}

impl Default for RecvDescriptor {
    fn default() -> Self {
        RecvDescriptor {
            base: RequestBase::new(RequestType::Recv),
            source: SourceMatch::Any,
            tag: TagMatch::Any,
            buffer: Vec::new(),
            posted_len: 0,
            data_received: 0,
            data_in_bit_bucket: 0,
            received_message_length: None,
            matched_source: None,
            matched_tag: 0,
            isend_seq: 0,
            irecv_seq: 0,
            error: None,
        }
    }
}

impl RecvDescriptor {
    pub fn is_matched(&self) -> bool {
        self.received_message_length.is_some()
    }

    pub fn bind_message(&mut self, frag: &RecvFrag, source_local: u32) {
        self.received_message_length = Some(frag.msg_len);
        self.matched_source = Some(source_local);
        self.matched_tag = frag.tag;
        self.isend_seq = frag.isend_seq;
    }

    /// Copies a fragment's payload into the user buffer at the fragment's offset. Whatever does
    ///  not fit into the posted buffer goes to the bit bucket.
    ///
    /// A fragment with a bad checksum is rejected without changing any counter.
    pub fn copy_to_app(&mut self, frag: &RecvFrag) -> Result<CopyResult, CopyError> {
        if !frag.verify_checksum() {
            warn!("checksum mismatch for fragment #{} from {} - rejecting", frag.frag_seq, frag.src);
            return Err(CopyError::ChecksumMismatch);
        }

        let len: u64 = frag.payload.len().safe_cast();
        let app_room = self.posted_len.saturating_sub(frag.offset);
        if app_room == 0 {
            return Ok(CopyResult { copied: 0, discarded: len });
        }

        let copied = len.min(app_room);
        let to_copy: usize = copied.prechecked_cast();
        self.base.datatype.unpack_into(&mut self.buffer, frag.offset.prechecked_cast(), &frag.payload[..to_copy]);

        Ok(CopyResult { copied, discarded: len - copied })
    }

    /// Accounts for copied data. Returns `true` if this completed the message.
    pub fn delivered_to_app(&mut self, result: CopyResult) -> bool {
        self.data_received += result.copied;
        self.data_in_bit_bucket += result.discarded;

        let Some(received_len) = self.received_message_length else {
            return false;
        };
        if self.base.message_done || self.data_received + self.data_in_bit_bucket < received_len {
            return false;
        }

        self.error = if received_len > self.posted_len {
            Some(ErrorCode::RecvMoreThanPosted)
        }
        else if received_len < self.posted_len {
            Some(ErrorCode::RecvLessThanPosted)
        }
        else {
            None
        };
        trace!("receive complete: {} bytes received, {} discarded", self.data_received, self.data_in_bit_bucket);
        self.base.mark_done();
        true
    }

    /// Clears the results of a previous activation (persistent requests)
    pub fn reset_reception(&mut self) {
        self.data_received = 0;
        self.data_in_bit_bucket = 0;
        self.received_message_length = None;
        self.matched_source = None;
        self.matched_tag = 0;
        self.isend_seq = 0;
        self.error = None;
    }

    pub fn status(&self) -> Status {
        Status {
            tag: self.matched_tag,
            peer: self.matched_source.unwrap_or_default(),
            error: self.error,
            matched_size: self.received_message_length.unwrap_or_default(),
            persistent: self.base.persistent,
        }
    }
}
