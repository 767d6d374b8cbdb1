//! An in-memory datagram network for tests that need real protocol traffic between engines
//!  without depending on the timing of real sockets.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use crate::path::udp::header::FrameKind;
use crate::path::udp::socket::DatagramSocket;

/// What the network does with a datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    Deliver,
    Drop,
    /// flips a bit in the datagram's last byte, i.e. in the payload of a non-empty data frame
    Corrupt,
}

type Filter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> Verdict + Send>;

#[derive(Default)]
struct NetworkState {
    inboxes: FxHashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    filter: Option<Filter>,
    broken_links: FxHashSet<SocketAddr>,
    num_data_sent: usize,
    num_acks_sent: usize,
}

#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Default::default()
    }

    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> LoopbackSocket {
        LoopbackSocket {
            network: self.clone(),
            addr,
        }
    }

    /// The filter sees every datagram as `(from, to, datagram)`
    pub fn set_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &[u8]) -> Verdict + Send + 'static) {
        self.state.lock().unwrap().filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        self.state.lock().unwrap().filter = None;
    }

    /// Sending to this address fails with an I/O error from now on
    pub fn break_link(&self, to: SocketAddr) {
        self.state.lock().unwrap().broken_links.insert(to);
    }

    /// data frames that were handed to the network, including dropped ones
    pub fn num_data_sent(&self) -> usize {
        self.state.lock().unwrap().num_data_sent
    }

    pub fn num_acks_sent(&self) -> usize {
        self.state.lock().unwrap().num_acks_sent
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.broken_links.contains(&to) {
            return Err(std::io::Error::other(format!("link to {:?} is broken", to)));
        }

        match FrameKind::of(datagram) {
            Ok(FrameKind::Data) => state.num_data_sent += 1,
            Ok(FrameKind::Ack) => state.num_acks_sent += 1,
            Err(_) => {}
        }

        let verdict = match &mut state.filter {
            Some(filter) => filter(from, to, datagram),
            None => Verdict::Deliver,
        };

        let mut datagram = datagram.to_vec();
        match verdict {
            Verdict::Drop => return Ok(()),
            Verdict::Corrupt => {
                if let Some(last) = datagram.last_mut() {
                    *last ^= 1;
                }
            }
            Verdict::Deliver => {}
        }

        state.inboxes.entry(to).or_default()
            .push_back((from, datagram));
        Ok(())
    }

    fn try_recv(&self, addr: SocketAddr) -> Option<(SocketAddr, Vec<u8>)> {
        self.state.lock().unwrap()
            .inboxes.get_mut(&addr)
            .and_then(|inbox| inbox.pop_front())
    }
}

pub struct LoopbackSocket {
    network: Arc<LoopbackNetwork>,
    addr: SocketAddr,
}

#[async_trait]
impl DatagramSocket for LoopbackSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        self.network.send(self.addr, to, datagram)
    }

    async fn recv_datagram(&self, buf: &mut [u8], timeout: Duration) -> Option<(usize, SocketAddr)> {
        let mut received = self.network.try_recv(self.addr);
        if received.is_none() && !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
            received = self.network.try_recv(self.addr);
        }

        let (from, datagram) = received?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Some((len, from))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// the address of a rank on a path in tests, distinct for every combination
pub fn test_addr(path: u16, rank: u32) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10_000 + 100 * path + rank as u16))
}

pub fn is_data_frame(datagram: &[u8]) -> bool {
    matches!(FrameKind::of(datagram), Ok(FrameKind::Data))
}
