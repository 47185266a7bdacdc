//! Wire framing shared by the multicast and retransmission channels.
//!
//! Every frame starts with the fixed header below; numeric fields are in
//! network byte order, opaque bytes (metadata, data payloads) are copied
//! verbatim, and there is no padding or alignment.
//!
//! ```ascii
//! offset  0: prodindex  u32   product the frame belongs to
//! offset  4: seqnum     u32   byte offset of the payload, 0 for control frames
//! offset  8: payloadlen u16   length of the body following the header
//! offset 10: flags      u16   frame kind tag
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::SendError;

/// Maximum payload of a single data frame, chosen so that header plus
/// payload fit one UDP datagram in a full Ethernet frame without IP-level
/// fragmentation.
pub const VCMTP_DATA_LEN: usize = 1448;

/// Serialized size of [VcmtpHeader].
pub const VCMTP_HEADER_LEN: usize = 12;

/// Fixed prefix of a BOP body: prodsize (u32) plus metasize (u16).
pub const BOP_FIXED_LEN: usize = 6;

/// Maximum per-product metadata size: a complete BOP body must fit into a
/// single data frame.
pub const AVAIL_BOP_LEN: usize = VCMTP_DATA_LEN - BOP_FIXED_LEN;

/// Frame kind tags carried in the `flags` header field.
///
/// The first three travel on the multicast channel; everything else belongs
/// to the per-receiver TCP retransmission channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum FrameKind {
    /// Beginning of product: BOP body plus metadata.
    Bop = 0x0001,
    /// One multicast data block of up to [VCMTP_DATA_LEN] bytes.
    MemData = 0x0002,
    /// End of product, header only.
    Eop = 0x0004,
    /// Receiver requests a byte range (seqnum = offset, payloadlen = span).
    RetxReq = 0x0008,
    /// Request rejected: the product has left the retransmission table.
    RetxRej = 0x0010,
    /// Receiver has fully reassembled the product.
    RetxEnd = 0x0020,
    /// Retransmitted data block.
    RetxData = 0x0040,
    /// Receiver requests the BOP again.
    BopReq = 0x0080,
    /// Retransmitted BOP.
    RetxBop = 0x0100,
    /// Receiver requests the EOP again.
    EopReq = 0x0200,
    /// Retransmitted EOP, header only.
    RetxEop = 0x0400,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VcmtpHeader {
    pub prodindex: u32,
    pub seqnum: u32,
    pub payloadlen: u16,
    pub flags: FrameKind,
}

impl VcmtpHeader {
    /// A header-only control frame: seqnum and payloadlen are zero.
    pub fn control(prodindex: u32, flags: FrameKind) -> VcmtpHeader {
        VcmtpHeader {
            prodindex,
            seqnum: 0,
            payloadlen: 0,
            flags,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.prodindex);
        buf.put_u32(self.seqnum);
        buf.put_u16(self.payloadlen);
        buf.put_u16(self.flags.into());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<VcmtpHeader, SendError> {
        let prodindex = buf.try_get_u32()?;
        let seqnum = buf.try_get_u32()?;
        let payloadlen = buf.try_get_u16()?;
        let raw_flags = buf.try_get_u16()?;
        let flags = FrameKind::try_from(raw_flags).map_err(|_| {
            SendError::MalformedFrame(format!("unknown flags value {:#06x}", raw_flags))
        })?;
        Ok(VcmtpHeader {
            prodindex,
            seqnum,
            payloadlen,
            flags,
        })
    }
}

/// Body of a BOP frame: the product size followed by the opaque
/// application-supplied metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BopMsg {
    pub prodsize: u32,
    pub metadata: Bytes,
}

impl BopMsg {
    /// The `payloadlen` header value for this body.
    pub fn payloadlen(&self) -> u16 {
        debug_assert!(self.metadata.len() <= AVAIL_BOP_LEN);
        (BOP_FIXED_LEN + self.metadata.len()) as u16
    }

    /// Serializes only the fixed prefix; the metadata travels as a separate
    /// buffer in the multicast gather send.
    pub fn ser_fixed(&self, buf: &mut BytesMut) {
        buf.put_u32(self.prodsize);
        buf.put_u16(self.metadata.len() as u16);
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.ser_fixed(buf);
        buf.put_slice(&self.metadata);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<BopMsg, SendError> {
        let prodsize = buf.try_get_u32()?;
        let metasize = buf.try_get_u16()? as usize;
        if buf.remaining() < metasize {
            return Err(SendError::MalformedFrame(format!(
                "BOP body truncated: {} metadata bytes announced, {} present",
                metasize,
                buf.remaining()
            )));
        }
        let metadata = buf.copy_to_bytes(metasize);
        Ok(BopMsg { prodsize, metadata })
    }
}
