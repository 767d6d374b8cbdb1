//! Reliable delivery of fragments over plain UDP datagrams.
//!
//! Every datagram carries exactly one frame, either a data fragment or an acknowledgement.
//!  Both frame kinds start with a one-byte kind tag and end their header with a CRC-32C over
//!  the header's preceding bytes; datagrams failing the check are dropped without a trace on the
//!  wire, i.e. the sender will eventually retransmit. All numbers are in network byte order.
//!
//! ```ascii
//! DATA: kind(1) context_id(4) msg_type(1) src(4) dst(4) send_token(8) frag_len(4) msg_len(8)
//!       frag_offset(8) tag(4) frag_index(4) isend_seq(8) frag_seq(8) data_crc(4) header_crc(4)
//!       payload(frag_len)
//! ACK:  kind(1) src(4) dst(4) send_token(8) frag_index(4) frag_seq(8) received_in_order(8)
//!       delivered_in_order(8) ack_kind(1) header_crc(4)
//! ```

pub mod buffer_pool;
pub mod header;
pub mod socket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::{Pt2PtConfig, UdpPathConfig};
use crate::context::ProgressContext;
use crate::descriptor::pool::DescriptorHandle;
use crate::descriptor::recv::{data_checksum, RecvFrag};
use crate::descriptor::send::{FragState, SendDescriptor, SendFrag};
use crate::error::{ErrorCode, Pt2PtResult};
use crate::path::udp::buffer_pool::DatagramBufferPool;
use crate::path::udp::header::{AckHeader, DataHeader, FrameKind};
use crate::path::udp::socket::DatagramSocket;
use crate::path::{AckInfo, AckRequest, Path, PathCapabilities, PathId, QueueId, SendProgress};
use crate::reliability::RetransmitPolicy;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::Rank;

pub struct UdpPath {
    id: PathId,
    self_rank: Rank,
    config: UdpPathConfig,
    policy: RetransmitPolicy,
    peers: FxHashMap<Rank, SocketAddr>,
    socket: Arc<dyn DatagramSocket>,
    buffer_pool: DatagramBufferPool,
    active: AtomicBool,
    /// destinations for which this path gave up
    unreachable: RwLock<FxHashSet<Rank>>,
}

impl UdpPath {
    pub fn new(id: PathId, self_rank: Rank, config: &Pt2PtConfig, peers: FxHashMap<Rank, SocketAddr>, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<UdpPath> {
        config.udp.validate()?;
        config.reliability.validate()?;

        Ok(UdpPath {
            id,
            self_rank,
            config: config.udp.clone(),
            policy: RetransmitPolicy::new(&config.reliability),
            peers,
            socket,
            buffer_pool: DatagramBufferPool::new(config.udp.max_datagram_len(), config.udp.datagram_buffer_pool_size),
            active: AtomicBool::new(true),
            unreachable: Default::default(),
        })
    }

    /// Binds a UDP socket to this process's own entry in the peer table
    pub async fn bind(id: PathId, self_rank: Rank, config: &Pt2PtConfig, peers: FxHashMap<Rank, SocketAddr>) -> anyhow::Result<UdpPath> {
        let Some(&self_addr) = peers.get(&self_rank) else {
            bail!("peer table has no address for this process (rank {})", self_rank);
        };
        let socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("{} bound to {:?}", id, socket.local_addr()?);
        Self::new(id, self_rank, config, peers, Arc::new(socket))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn mark_unreachable(&self, dest: Rank) {
        warn!("{}: giving up on destination {}", self.id, dest);
        self.unreachable.write().unwrap()
            .insert(dest);
    }

    fn is_overdue(&self, frag: &SendFrag, now: Instant) -> bool {
        frag.state == FragState::ToAck &&
            frag.time_sent.is_some_and(|t| self.policy.deadline(t, frag.num_transmits) <= now)
    }

    /// Splits a message into fragments: the first one carries up to `max_short_payload` bytes,
    ///  every further one up to `max_payload` bytes. An empty message still has one fragment.
    fn fragments(&self, len: u64) -> Pt2PtResult<Vec<SendFrag>> {
        let max_short: u64 = self.config.max_short_payload.safe_cast();
        let max_payload: u64 = self.config.max_payload.safe_cast();

        let num_frags = if len <= max_short {
            1
        }
        else {
            1 + (len - max_short).div_ceil(max_payload)
        };
        let num_frags: u32 = num_frags.try_into()
            .map_err(|_| ErrorCode::BadParam)?;

        Ok((0..num_frags)
            .map(|index| {
                let (offset, capacity) = if index == 0 {
                    (0, max_short)
                }
                else {
                    (max_short + max_payload * (index as u64 - 1), max_payload)
                };
                SendFrag {
                    index,
                    offset,
                    len: capacity.min(len.saturating_sub(offset)).prechecked_cast(),
                    ..Default::default()
                }
            })
            .collect())
    }

    async fn on_datagram(&self, datagram: &[u8], from: SocketAddr, ctx: &ProgressContext) {
        let kind = match FrameKind::of(datagram) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("{}: dropping datagram from {:?}: {}", self.id, from, e);
                return;
            }
        };

        let mut buf = datagram;
        match kind {
            FrameKind::Data => {
                let header = match DataHeader::deser(&mut buf) {
                    Ok(header) => header,
                    Err(e) => {
                        debug!("{}: dropping data frame from {:?}: {}", self.id, from, e);
                        return;
                    }
                };
                trace!("{}: received fragment #{} ({} of message #{}) from {}", self.id, header.frag_seq, header.frag_index, header.isend_seq, header.src);

                ctx.deliver_frag(RecvFrag {
                    path: self.id,
                    context_id: header.context_id,
                    src: header.src,
                    dst: header.dst,
                    tag: header.tag,
                    mode: header.mode,
                    send_token: header.send_token,
                    frag_index: header.frag_index,
                    frag_seq: header.frag_seq,
                    isend_seq: header.isend_seq,
                    msg_len: header.msg_len,
                    offset: header.frag_offset,
                    data_crc: header.data_crc,
                    payload: Bytes::copy_from_slice(buf),
                }).await;
            }
            FrameKind::Ack => {
                let header = match AckHeader::deser(&mut buf) {
                    Ok(header) => header,
                    Err(e) => {
                        debug!("{}: dropping ack frame from {:?}: {}", self.id, from, e);
                        return;
                    }
                };
                if header.dst != self.self_rank {
                    debug!("{}: ack addressed to {} - dropping", self.id, header.dst);
                    return;
                }
                trace!("{}: received {:?} for fragment #{} from {}", self.id, header.kind, header.frag_seq, header.src);

                ctx.process_ack(AckInfo {
                    from: header.src,
                    send_token: header.send_token,
                    frag_index: header.frag_index,
                    frag_seq: header.frag_seq,
                    kind: header.kind,
                    received_in_order: header.received_in_order,
                    delivered_in_order: header.delivered_in_order,
                }).await;
            }
        }
    }
}

#[async_trait]
impl Path for UdpPath {
    fn id(&self) -> PathId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        info!("deactivating {}", self.id);
        self.active.store(false, Ordering::Release);
    }

    fn capabilities(&self) -> PathCapabilities {
        PathCapabilities::ACKS
    }

    fn can_reach(&self, dest: Rank) -> bool {
        self.is_active()
            && self.peers.contains_key(&dest)
            && !self.unreachable.read().unwrap().contains(&dest)
    }

    fn bind(&self, desc: &mut SendDescriptor) -> Pt2PtResult<()> {
        if !self.is_active() {
            return Err(ErrorCode::BadPath);
        }
        desc.path = Some(self.id);
        Ok(())
    }

    fn unbind(&self, desc: &mut SendDescriptor) {
        let requeued = desc.requeue_unacked();
        for frag in desc.frags.iter_mut().filter(|f| f.state == FragState::ToSend) {
            frag.num_transmits = 0;
            frag.time_sent = None;
        }
        desc.clear_to_send = true;
        desc.path = None;
        trace!("{}: unbound message to {}, {} fragments requeued", self.id, desc.dest, requeued);
    }

    fn init(&self, desc: &mut SendDescriptor) -> Pt2PtResult<()> {
        if desc.num_frags_allocated > 0 {
            // fragments keep their boundaries and sequence numbers across paths
            return Ok(());
        }

        desc.frags = self.fragments(desc.len())?;
        desc.num_frags = desc.frags.len().prechecked_cast();
        desc.num_frags_allocated = desc.num_frags;
        desc.num_sent = 0;
        desc.num_acked = 0;
        Ok(())
    }

    async fn send(&self, handle: DescriptorHandle, desc: &mut SendDescriptor, ctx: &ProgressContext) -> Pt2PtResult<SendProgress> {
        if !self.is_active() {
            return Err(ErrorCode::BadPath);
        }
        let Some(&to) = self.peers.get(&desc.dest) else {
            return Err(ErrorCode::BadPath);
        };

        for index in 0..desc.frags.len() {
            if desc.frags[index].state != FragState::ToSend {
                continue;
            }
            if !desc.clear_to_send || desc.num_outstanding() >= self.config.max_outstanding_frags {
                break;
            }

            if !desc.frags[index].seq.is_assigned() {
                desc.frags[index].seq = ctx.reliability.next_frag_seq(desc.dest);
            }
            let frag = &desc.frags[index];
            let offset: usize = frag.offset.prechecked_cast();
            let len: usize = frag.len.safe_cast();
            let payload = &desc.payload[offset..offset + len];

            let header = DataHeader {
                context_id: desc.base.context_id,
                mode: desc.mode,
                src: self.self_rank,
                dst: desc.dest,
                send_token: handle.to_token(),
                frag_len: frag.len,
                msg_len: desc.len(),
                frag_offset: frag.offset,
                tag: desc.tag,
                frag_index: frag.index,
                isend_seq: desc.isend_seq,
                frag_seq: frag.seq,
                data_crc: data_checksum(payload),
            };

            let mut buf = self.buffer_pool.get_from_pool();
            header.ser(&mut buf);
            buf.put_slice(payload);
            let send_result = self.socket.send_datagram(to, &buf).await;
            self.buffer_pool.return_to_pool(buf);

            if let Err(e) = send_result {
                warn!("{}: error sending fragment #{} to {:?}: {}", self.id, header.frag_seq, to, e);
                self.mark_unreachable(desc.dest);
                return Err(ErrorCode::BadPath);
            }
            trace!("{}: sent fragment #{} ({}/{}) of message #{} to {}", self.id, header.frag_seq, header.frag_index + 1, desc.num_frags, desc.isend_seq, desc.dest);

            let frag = &mut desc.frags[index];
            frag.state = FragState::ToAck;
            frag.time_sent = Some(Instant::now());
            frag.num_transmits += 1;
            desc.num_sent += 1;

            // the first fragment of a multi-fragment message is acknowledged before the rest
            //  follows, and synchronous messages go one fragment at a time
            if (index == 0 && desc.num_frags > 1) || desc.is_synchronous() {
                desc.clear_to_send = false;
            }
        }

        Ok(SendProgress {
            incomplete: desc.frags.iter().any(|f| f.state == FragState::ToSend),
        })
    }

    fn send_done(&self, desc: &SendDescriptor) -> bool {
        desc.send_done()
    }

    async fn receive(&self, timeout: Duration, ctx: &ProgressContext) -> Pt2PtResult<()> {
        if !self.is_active() {
            return Ok(());
        }

        let mut buf = self.buffer_pool.get_from_pool();
        buf.resize(self.config.max_datagram_len().max(AckHeader::SERIALIZED_LEN), 0);
        let mut wait = timeout;
        while let Some((len, from)) = self.socket.recv_datagram(&mut buf[..], wait).await {
            // only the first datagram is waited for, after that it is just draining
            wait = Duration::ZERO;
            self.on_datagram(&buf[..len], from, ctx).await;
        }
        self.buffer_pool.return_to_pool(buf);
        Ok(())
    }

    fn retransmit_p(&self, desc: &SendDescriptor, now: Instant) -> bool {
        desc.frags.iter()
            .any(|f| self.is_overdue(f, now))
    }

    fn resend(&self, desc: &mut SendDescriptor, now: Instant) -> Pt2PtResult<bool> {
        let mut requeued = false;
        for index in 0..desc.frags.len() {
            if !self.is_overdue(&desc.frags[index], now) {
                continue;
            }

            let frag = &mut desc.frags[index];
            if frag.held {
                // the receiver has it, so the path works: this only refreshes a possibly lost ack
                trace!("{}: fragment #{} is held by {} - retransmitting", self.id, frag.seq, desc.dest);
            }
            else if self.policy.exceeded(frag.num_transmits) {
                warn!("{}: fragment #{} to {} was sent {} times without acknowledgement", self.id, frag.seq, desc.dest, frag.num_transmits);
                self.mark_unreachable(desc.dest);
                return Err(ErrorCode::BadPath);
            }
            else {
                debug!("{}: fragment #{} to {} timed out - retransmitting", self.id, frag.seq, desc.dest);
            }
            frag.state = FragState::ToSend;
            desc.num_sent -= 1;
            requeued = true;
        }

        if requeued {
            desc.clear_to_send = true;
        }
        Ok(requeued)
    }

    async fn send_ack(&self, ack: &AckRequest, ctx: &ProgressContext) {
        let Some(&to) = self.peers.get(&ack.to) else {
            warn!("{}: no address for {} - cannot acknowledge fragment #{}", self.id, ack.to, ack.frag_seq);
            return;
        };

        let (received_in_order, delivered_in_order) = ctx.reliability.largest_in_order(ack.to);
        let header = AckHeader {
            src: self.self_rank,
            dst: ack.to,
            send_token: ack.send_token,
            frag_index: ack.frag_index,
            frag_seq: ack.frag_seq,
            received_in_order,
            delivered_in_order,
            kind: ack.kind,
        };

        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(&mut buf);
        if let Err(e) = self.socket.send_datagram(to, &buf).await {
            // the sender will retransmit and get another chance at an ack
            debug!("{}: error sending ack to {:?}: {}", self.id, to, e);
        }
        self.buffer_pool.return_to_pool(buf);
        trace!("{}: sent {:?} for fragment #{} to {}", self.id, ack.kind, ack.frag_seq, ack.to);
    }

    fn frag_send_queue(&self) -> QueueId {
        QueueId(2 * self.id.0 as u32)
    }

    fn to_ack_queue(&self) -> QueueId {
        QueueId(2 * self.id.0 as u32 + 1)
    }
}
