use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::SendError;

/// Static configuration of one sender instance.
pub struct SenderConfig {
    /// Interface address the TCP retransmission listener binds to.
    pub tcp_addr: Ipv4Addr,

    /// TCP retransmission port, or 0 to let the operating system pick one.
    /// [crate::VcmtpSender::tcp_port] reports the bound port either way.
    pub tcp_port: u16,

    /// Multicast group the products are sent to.
    pub mcast_group: SocketAddrV4,

    /// First product index handed out; indices increase from here and are
    /// never reused within a sender lifetime.
    pub init_prodindex: u32,

    /// Default scaling factor from a product's multicast duration to its
    /// retransmission lifetime. Can be overridden per product.
    pub retx_timeout_ratio: f32,

    /// Multicast TTL.
    pub ttl: u32,

    /// Outgoing interface for multicast traffic, if not the system default.
    pub default_if: Option<Ipv4Addr>,
}

impl SenderConfig {
    pub const DEFAULT_RETX_TIMEOUT_RATIO: f32 = 500_000.0;

    pub fn new(tcp_addr: Ipv4Addr, tcp_port: u16, mcast_group: SocketAddrV4) -> SenderConfig {
        SenderConfig {
            tcp_addr,
            tcp_port,
            mcast_group,
            init_prodindex: 0,
            retx_timeout_ratio: Self::DEFAULT_RETX_TIMEOUT_RATIO,
            ttl: 1,
            default_if: None,
        }
    }

    pub fn validate(&self) -> Result<(), SendError> {
        if !self.retx_timeout_ratio.is_finite() || self.retx_timeout_ratio < 0.0 {
            return Err(SendError::InvalidArgument(format!(
                "retransmission timeout ratio must be finite and non-negative, was {}",
                self.retx_timeout_ratio
            )));
        }
        Ok(())
    }
}
