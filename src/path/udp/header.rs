use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::descriptor::send::SendMode;
use crate::frag_seq::FragSeq;
use crate::path::AckKind;
use crate::{ContextId, Rank, Tag};

const HEADER_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// First byte of every datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Data = 1,
    Ack = 2,
}

impl FrameKind {
    pub fn of(datagram: &[u8]) -> anyhow::Result<FrameKind> {
        let Some(&first) = datagram.first() else {
            bail!("empty datagram");
        };
        FrameKind::try_from(first)
            .map_err(|_| anyhow!("unsupported frame kind {}", first))
    }
}

/// Writes the checksum over everything written to `buf` since `start`
fn put_header_crc(buf: &mut BytesMut, start: usize) {
    let crc = HEADER_CRC.checksum(&buf[start..]);
    buf.put_u32(crc);
}

/// Verifies the checksum in the last four bytes of a `len` byte header at the start of `buf`
fn check_header_crc(buf: &[u8], len: usize, kind: FrameKind) -> anyhow::Result<()> {
    if buf.len() < len {
        bail!("{:?} frame too short: {} bytes, header alone is {} bytes", kind, buf.len(), len);
    }
    let crc_offset = len - size_of::<u32>();
    let mut expected: &[u8] = &buf[crc_offset..len];
    if HEADER_CRC.checksum(&buf[..crc_offset]) != expected.get_u32() {
        bail!("{:?} header checksum mismatch", kind);
    }

    let mut b: &[u8] = buf;
    if b.get_u8() != u8::from(kind) {
        bail!("expected a {:?} frame", kind);
    }
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataHeader {
    pub context_id: ContextId,
    pub mode: SendMode,
    pub src: Rank,
    pub dst: Rank,
    /// the sender's descriptor, echoed back in acknowledgements
    pub send_token: u64,
    pub frag_len: u32,
    pub msg_len: u64,
    pub frag_offset: u64,
    pub tag: Tag,
    pub frag_index: u32,
    pub isend_seq: u64,
    pub frag_seq: FragSeq,
    /// checksum of the fragment's payload
    pub data_crc: u32,
}

impl DataHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()          // frame kind
        + size_of::<u32>()       // context id
        + size_of::<u8>()        // message type
        + size_of::<u32>()       // src
        + size_of::<u32>()       // dst
        + size_of::<u64>()       // send token
        + size_of::<u32>()       // fragment length
        + size_of::<u64>()       // message length
        + size_of::<u64>()       // fragment offset
        + size_of::<i32>()       // tag
        + size_of::<u32>()       // fragment index
        + size_of::<u64>()       // isend sequence number
        + size_of::<u64>()       // fragment sequence number
        + size_of::<u32>()       // data checksum
        + size_of::<u32>();      // header checksum

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(FrameKind::Data.into());
        buf.put_u32(self.context_id);
        buf.put_u8(self.mode.into());
        buf.put_u32(self.src);
        buf.put_u32(self.dst);
        buf.put_u64(self.send_token);
        buf.put_u32(self.frag_len);
        buf.put_u64(self.msg_len);
        buf.put_u64(self.frag_offset);
        buf.put_i32(self.tag);
        buf.put_u32(self.frag_index);
        buf.put_u64(self.isend_seq);
        buf.put_u64(self.frag_seq.to_raw());
        buf.put_u32(self.data_crc);
        put_header_crc(buf, start);
    }

    /// Parses the header at the start of a datagram, leaving `buf` at the start of the payload
    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<DataHeader> {
        check_header_crc(*buf, Self::SERIALIZED_LEN, FrameKind::Data)?;

        buf.advance(size_of::<u8>());
        let context_id = buf.get_u32();
        let raw_mode = buf.get_u8();
        let mode = SendMode::try_from(raw_mode)
            .map_err(|_| anyhow!("invalid message type {}", raw_mode))?;

        let result = DataHeader {
            context_id,
            mode,
            src: buf.get_u32(),
            dst: buf.get_u32(),
            send_token: buf.get_u64(),
            frag_len: buf.get_u32(),
            msg_len: buf.get_u64(),
            frag_offset: buf.get_u64(),
            tag: buf.get_i32(),
            frag_index: buf.get_u32(),
            isend_seq: buf.get_u64(),
            frag_seq: FragSeq::from_raw(buf.get_u64()),
            data_crc: buf.get_u32(),
        };
        buf.advance(size_of::<u32>());

        if buf.len() != result.frag_len as usize {
            bail!("fragment length {} does not match payload of {} bytes", result.frag_len, buf.len());
        }
        if !result.frag_seq.is_assigned() {
            bail!("data frame without a sequence number");
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckHeader {
    /// the receiver of the data, i.e. the sender of the ack
    pub src: Rank,
    pub dst: Rank,
    pub send_token: u64,
    pub frag_index: u32,
    pub frag_seq: FragSeq,
    pub received_in_order: FragSeq,
    pub delivered_in_order: FragSeq,
    pub kind: AckKind,
}

impl AckHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()          // frame kind
        + size_of::<u32>()       // src
        + size_of::<u32>()       // dst
        + size_of::<u64>()       // send token
        + size_of::<u32>()       // fragment index
        + size_of::<u64>()       // fragment sequence number
        + size_of::<u64>()       // largest received in order
        + size_of::<u64>()       // largest delivered in order
        + size_of::<u8>()        // ack kind
        + size_of::<u32>();      // header checksum

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(FrameKind::Ack.into());
        buf.put_u32(self.src);
        buf.put_u32(self.dst);
        buf.put_u64(self.send_token);
        buf.put_u32(self.frag_index);
        buf.put_u64(self.frag_seq.to_raw());
        buf.put_u64(self.received_in_order.to_raw());
        buf.put_u64(self.delivered_in_order.to_raw());
        buf.put_u8(self.kind.into());
        put_header_crc(buf, start);
    }

    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<AckHeader> {
        check_header_crc(*buf, Self::SERIALIZED_LEN, FrameKind::Ack)?;

        buf.advance(size_of::<u8>());
        let src = buf.get_u32();
        let dst = buf.get_u32();
        let send_token = buf.get_u64();
        let frag_index = buf.get_u32();
        let frag_seq = FragSeq::from_raw(buf.get_u64());
        let received_in_order = FragSeq::from_raw(buf.get_u64());
        let delivered_in_order = FragSeq::from_raw(buf.get_u64());
        let raw_kind = buf.get_u8();
        let kind = AckKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid ack kind {}", raw_kind))?;
        buf.advance(size_of::<u32>());

        Ok(AckHeader {
            src,
            dst,
            send_token,
            frag_index,
            frag_seq,
            received_in_order,
            delivered_in_order,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn data_header(frag_len: u32) -> DataHeader {
        DataHeader {
            context_id: 7,
            mode: SendMode::Synchronous,
            src: 1,
            dst: 2,
            send_token: 0x1234_5678_9abc_def0,
            frag_len,
            msg_len: 1000,
            frag_offset: 30,
            tag: -5,
            frag_index: 2,
            isend_seq: 11,
            frag_seq: FragSeq::from_raw(99),
            data_crc: 0xdead_beef,
        }
    }

    fn ack_header() -> AckHeader {
        AckHeader {
            src: 2,
            dst: 1,
            send_token: 77,
            frag_index: 3,
            frag_seq: FragSeq::from_raw(42),
            received_in_order: FragSeq::from_raw(40),
            delivered_in_order: FragSeq::from_raw(39),
            kind: AckKind::Nack,
        }
    }

    #[test]
    fn test_serialized_len() {
        assert_eq!(DataHeader::SERIALIZED_LEN, 74);
        assert_eq!(AckHeader::SERIALIZED_LEN, 50);

        let mut buf = BytesMut::new();
        data_header(0).ser(&mut buf);
        assert_eq!(buf.len(), DataHeader::SERIALIZED_LEN);

        let mut buf = BytesMut::new();
        ack_header().ser(&mut buf);
        assert_eq!(buf.len(), AckHeader::SERIALIZED_LEN);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::payload(vec![1, 2, 3, 4, 5])]
    fn test_data_header_ser(#[case] payload: Vec<u8>) {
        let original = data_header(payload.len() as u32);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        buf.put_slice(&payload);

        assert_eq!(FrameKind::of(&buf).unwrap(), FrameKind::Data);

        let mut b: &[u8] = &buf;
        let deser = DataHeader::deser(&mut b).unwrap();
        assert_eq!(deser, original);
        assert_eq!(b, payload.as_slice());
    }

    #[test]
    fn test_ack_header_ser() {
        let original = ack_header();
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        assert_eq!(FrameKind::of(&buf).unwrap(), FrameKind::Ack);

        let mut b: &[u8] = &buf;
        assert_eq!(AckHeader::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::kind(0)]
    #[case::context_id(3)]
    #[case::frag_seq(60)]
    #[case::data_crc(67)]
    #[case::header_crc(72)]
    fn test_data_header_corrupted(#[case] offset: usize) {
        let mut buf = BytesMut::new();
        data_header(0).ser(&mut buf);
        buf[offset] ^= 0x10;

        let mut b: &[u8] = &buf;
        assert!(DataHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_ack_header_corrupted() {
        let mut buf = BytesMut::new();
        ack_header().ser(&mut buf);
        buf[10] ^= 1;

        let mut b: &[u8] = &buf;
        assert!(AckHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::too_short(3, 5)]
    #[case::too_long(3, 1)]
    fn test_data_header_frag_len_mismatch(#[case] declared: u32, #[case] actual: usize) {
        let mut buf = BytesMut::new();
        data_header(declared).ser(&mut buf);
        buf.put_slice(&vec![0; actual]);

        let mut b: &[u8] = &buf;
        assert!(DataHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = BytesMut::new();
        data_header(0).ser(&mut buf);

        let mut b: &[u8] = &buf[..DataHeader::SERIALIZED_LEN - 1];
        assert!(DataHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown(vec![9, 1, 2])]
    fn test_frame_kind_invalid(#[case] datagram: Vec<u8>) {
        assert!(FrameKind::of(&datagram).is_err());
    }

    #[test]
    fn test_ack_header_as_data() {
        let mut buf = BytesMut::new();
        ack_header().ser(&mut buf);
        buf.put_slice(&[0; 30]);

        let mut b: &[u8] = &buf;
        assert!(DataHeader::deser(&mut b).is_err());
    }
}
