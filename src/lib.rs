//! Sender side of VCMTPv3, a reliable multicast file-transfer protocol.
//!
//! The sender multicasts a sequence of variably-sized *products* (opaque
//! byte blobs plus optional per-product metadata) over UDP and listens on a
//! TCP port so that each receiver can open a unicast control connection and
//! request whatever the multicast lost for it. Reliability is bounded: each
//! product stays retransmittable for a lifetime proportional to the time
//! its multicast took, then ages out of the sender's cache and all further
//! requests for it are rejected.
//!
//! ## Channels and frames
//!
//! All frames carry the same 12-byte header (see [frame]); the `flags`
//! field selects the kind:
//!
//! ```ascii
//! multicast UDP, sender -> group:
//!   BOP        beginning of product: product size + metadata
//!   MEM_DATA   one data block of up to VCMTP_DATA_LEN bytes
//!   EOP        end of product
//!
//! control TCP, receiver -> sender:
//!   RETX_REQ   re-send a byte range of a product
//!   BOP_REQ    re-send the BOP
//!   EOP_REQ    re-send the EOP
//!   RETX_END   product fully reassembled on this receiver
//!
//! control TCP, sender -> receiver:
//!   RETX_DATA  retransmitted data block
//!   RETX_BOP   retransmitted BOP
//!   RETX_EOP   retransmitted EOP
//!   RETX_REJ   request rejected: product no longer retransmittable
//! ```
//!
//! ## Product lifecycle
//!
//! [VcmtpSender::send_product] records the product in the retransmission
//! table together with a snapshot of the receivers connected at that moment,
//! multicasts BOP, data blocks and EOP, and schedules the product's index on
//! a delay queue with the computed retransmission lifetime. The entry leaves
//! the table either when the last snapshot receiver reports `RETX_END` or
//! when the timer pops the index - whichever happens first. Exactly that one
//! path invokes the application's [SendEventNotifier], so the notification
//! fires at most once per product. Receivers that connect mid-product are
//! not part of the snapshot and are answered with `RETX_REJ` for it.
//!
//! ## Task model
//!
//! Three kinds of background tasks run between [VcmtpSender::start] and
//! [VcmtpSender::stop]: a timer aging products out, an acceptor turning
//! incoming control connections into workers, and one worker per receiver
//! serving its requests. A worker failure only tears down that receiver's
//! connection; timer, acceptor and send failures are fatal, recorded in a
//! set-once error slot and surfaced by [VcmtpSender::stop].

pub mod config;
pub mod delay_queue;
pub mod error;
pub mod frame;
pub mod notifier;
mod retx_tasks;
mod retx_worker;
pub mod sender;
pub mod sender_metadata;
pub mod tcp_send;
pub mod udp_send;

pub use config::SenderConfig;
pub use error::SendError;
pub use notifier::SendEventNotifier;
pub use sender::VcmtpSender;
