use std::time::Duration;
use anyhow::bail;
use crate::path::udp::header::DataHeader;

#[derive(Debug, Clone)]
pub struct Pt2PtConfig {
    /// Number of send descriptors that can be in flight at any given time. There is no dynamic
    ///  growth: when all descriptors are taken, `isend_start` fails with one of the
    ///  out-of-resource codes.
    pub send_pool_size: usize,
    /// see `send_pool_size`
    pub recv_pool_size: usize,

    /// Timeout handed to every path's `receive()` by a progress call. Zero means 'poll': drain
    ///  whatever is there, but do not wait for more.
    pub receive_timeout: Duration,

    pub reliability: ReliabilityConfig,
    pub udp: UdpPathConfig,
}

impl Pt2PtConfig {
    /// Payload sizes chosen so that the biggest datagram fits into a full Ethernet frame with
    ///  an IP V4 header and no optional IP headers, i.e. `1500 - 20 - 8 = 1472` bytes
    pub fn default_ipv4() -> Pt2PtConfig {
        Pt2PtConfig {
            send_pool_size: 4096,
            recv_pool_size: 4096,
            receive_timeout: Duration::ZERO,
            reliability: ReliabilityConfig::default_datacenter(),
            udp: UdpPathConfig {
                max_short_payload: 1024,
                max_payload: 1472 - DataHeader::SERIALIZED_LEN,
                max_outstanding_frags: 8,
                datagram_buffer_pool_size: 256,
            },
        }
    }

    /// Tiny fragments and small pools, so that tests exercise fragmentation and exhaustion with
    ///  a handful of bytes
    pub fn for_tests() -> Pt2PtConfig {
        Pt2PtConfig {
            send_pool_size: 16,
            recv_pool_size: 16,
            receive_timeout: Duration::ZERO,
            reliability: ReliabilityConfig {
                retransmit_time: Duration::from_millis(100),
                min_retransmit_scan_interval: Duration::from_millis(10),
                max_backoff_exponent: 15,
                max_transmits_before_failover: 4,
            },
            udp: UdpPathConfig {
                max_short_payload: 10,
                max_payload: 20,
                max_outstanding_frags: 8,
                datagram_buffer_pool_size: 4,
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_pool_size == 0 || self.recv_pool_size == 0 {
            bail!("descriptor pool sizes must be positive");
        }
        self.reliability.validate()?;
        self.udp.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// base interval after which an unacknowledged fragment is sent again. It doubles with every
    ///  transmission of the same fragment, see `max_backoff_exponent`
    pub retransmit_time: Duration,

    /// The retransmit scan walks all unacknowledged messages, so progress does it at most once
    ///  per this interval
    pub min_retransmit_scan_interval: Duration,

    pub max_backoff_exponent: u32,

    /// A fragment that was sent this many times without being acknowledged is taken as evidence
    ///  that the path to its destination is broken, and the message fails over to a different path
    pub max_transmits_before_failover: u32,
}

impl ReliabilityConfig {
    pub fn default_datacenter() -> ReliabilityConfig {
        ReliabilityConfig {
            retransmit_time: Duration::from_secs(5),
            min_retransmit_scan_interval: Duration::from_secs(1),
            max_backoff_exponent: 15,
            max_transmits_before_failover: 8,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_time.is_zero() {
            bail!("retransmit time must be positive");
        }
        if self.max_transmits_before_failover == 0 {
            bail!("max transmits before failover must be at least 1");
        }
        if self.max_backoff_exponent > 31 {
            bail!("max backoff exponent {} would overflow the retransmit interval", self.max_backoff_exponent);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UdpPathConfig {
    /// Messages up to this length are sent 'eagerly' as a single fragment. For longer messages,
    ///  this is the payload of the first fragment, and the remaining fragments are sent only
    ///  after the first one was acknowledged.
    pub max_short_payload: usize,

    /// payload of every fragment after the first
    pub max_payload: usize,

    /// Upper bound for the number of fragments of a single message that are sent but not
    ///  acknowledged yet
    pub max_outstanding_frags: usize,

    /// This is the number of datagram buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub datagram_buffer_pool_size: usize,
}

impl UdpPathConfig {
    const MAX_UDP_PAYLOAD: usize = 65507;

    pub fn max_datagram_len(&self) -> usize {
        DataHeader::SERIALIZED_LEN + self.max_short_payload.max(self.max_payload)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_short_payload == 0 || self.max_payload == 0 {
            bail!("fragment payload sizes must be positive");
        }
        if self.max_datagram_len() > Self::MAX_UDP_PAYLOAD {
            bail!("a datagram of {} bytes does not fit into a UDP packet", self.max_datagram_len());
        }
        if self.max_outstanding_frags == 0 {
            bail!("at least one fragment must be allowed to be outstanding");
        }
        Ok(())
    }
}
