//! The per-receiver request loop.
//!
//! One worker task runs per accepted control connection. It reads one frame
//! header at a time and answers data, BOP and EOP retransmission requests
//! from the retransmission table, or records the receiver's completion of a
//! product. A request for a product that is no longer cached - or that was
//! multicast before the receiver connected - is answered with `RETX_REJ`.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::frame::{BopMsg, FrameKind, VcmtpHeader, VCMTP_DATA_LEN};
use crate::notifier::SendEventNotifier;
use crate::retx_tasks::RetxTaskList;
use crate::sender_metadata::{RetxMetadata, SenderMetadata};
use crate::tcp_send::{ReceiverId, TcpSend};

pub struct RetxWorker {
    receiver: ReceiverId,
    tcpsend: Arc<TcpSend>,
    send_meta: Arc<SenderMetadata>,
    retx_tasks: Arc<RetxTaskList>,
    notifier: Option<Arc<dyn SendEventNotifier>>,
}

/// Removes the worker's connection and task-list entries when the task
/// ends - whether its loop returned, failed, or the task was cancelled at
/// shutdown.
struct WorkerCleanup {
    receiver: ReceiverId,
    tcpsend: Arc<TcpSend>,
    retx_tasks: Arc<RetxTaskList>,
}

impl Drop for WorkerCleanup {
    fn drop(&mut self) {
        self.tcpsend.remove(self.receiver);
        self.retx_tasks.remove(self.receiver);
    }
}

impl RetxWorker {
    pub fn new(
        receiver: ReceiverId,
        tcpsend: Arc<TcpSend>,
        send_meta: Arc<SenderMetadata>,
        retx_tasks: Arc<RetxTaskList>,
        notifier: Option<Arc<dyn SendEventNotifier>>,
    ) -> RetxWorker {
        RetxWorker {
            receiver,
            tcpsend,
            send_meta,
            retx_tasks,
            notifier,
        }
    }

    /// Request loop. Runs until the receiver disconnects, a request cannot
    /// be parsed, a response cannot be written, or the task is cancelled.
    /// Failures here terminate only this receiver's worker.
    pub async fn run(self) {
        let _cleanup = WorkerCleanup {
            receiver: self.receiver,
            tcpsend: self.tcpsend.clone(),
            retx_tasks: self.retx_tasks.clone(),
        };

        debug!(receiver = %self.receiver, "retransmission worker started");
        if let Err(e) = self.request_loop().await {
            debug!(receiver = %self.receiver, error = %e, "retransmission worker exiting");
        }
    }

    async fn request_loop(&self) -> Result<(), SendError> {
        loop {
            let request = self.tcpsend.parse_header(self.receiver).await?;
            let meta = self.send_meta.get(request.prodindex);

            match request.flags {
                FrameKind::RetxReq => self.handle_retx_req(&request, meta).await?,
                FrameKind::RetxEnd => self.handle_retx_end(&request, meta),
                FrameKind::BopReq => self.handle_bop_req(&request, meta).await?,
                FrameKind::EopReq => self.handle_eop_req(&request, meta).await?,
                other => {
                    warn!(receiver = %self.receiver, flags = ?other,
                        "ignoring unexpected frame kind on control channel");
                }
            }
        }
    }

    /// True iff the product is retransmittable to this receiver: still
    /// cached, and multicast while the receiver was already connected.
    fn serves(&self, meta: &RetxMetadata) -> bool {
        meta.unfinished_receivers.contains(&self.receiver)
    }

    async fn handle_retx_req(
        &self,
        request: &VcmtpHeader,
        meta: Option<RetxMetadata>,
    ) -> Result<(), SendError> {
        debug!(receiver = %self.receiver, prodindex = request.prodindex,
            seqnum = request.seqnum, span = request.payloadlen, "data retransmission requested");
        match meta {
            Some(meta) if self.serves(&meta) => self.retransmit(request, &meta).await,
            _ => self.reject(request.prodindex).await,
        }
    }

    /// The receiver has fully reassembled the product. Clearing the last
    /// unfinished receiver removes the entry and tells the application; a
    /// timer firing afterwards finds nothing to remove and stays silent.
    fn handle_retx_end(&self, request: &VcmtpHeader, meta: Option<RetxMetadata>) {
        debug!(receiver = %self.receiver, prodindex = request.prodindex, "completion received");
        if meta.is_none() {
            return;
        }
        if self
            .send_meta
            .clear_unfinished(request.prodindex, self.receiver)
        {
            debug!(prodindex = request.prodindex, "all receivers confirmed complete reception");
            if let Some(notifier) = &self.notifier {
                notifier.notify_of_eop(request.prodindex);
            }
        }
    }

    async fn handle_bop_req(
        &self,
        request: &VcmtpHeader,
        meta: Option<RetxMetadata>,
    ) -> Result<(), SendError> {
        debug!(receiver = %self.receiver, prodindex = request.prodindex, "BOP retransmission requested");
        match meta {
            Some(meta) if self.serves(&meta) => self.retransmit_bop(request, &meta).await,
            _ => self.reject(request.prodindex).await,
        }
    }

    async fn handle_eop_req(
        &self,
        request: &VcmtpHeader,
        meta: Option<RetxMetadata>,
    ) -> Result<(), SendError> {
        debug!(receiver = %self.receiver, prodindex = request.prodindex, "EOP retransmission requested");
        match meta {
            Some(meta) if self.serves(&meta) => self.retransmit_eop(request).await,
            _ => self.reject(request.prodindex).await,
        }
    }

    /// Re-sends the requested byte range as a sequence of whole data blocks.
    /// The start is widened down to its block boundary: requests start on
    /// block boundaries anyway, and whole blocks keep the per-frame payload
    /// computation trivial. Only the last block may be short.
    async fn retransmit(
        &self,
        request: &VcmtpHeader,
        meta: &RetxMetadata,
    ) -> Result<(), SendError> {
        if request.payloadlen == 0 {
            return Ok(());
        }

        let end = u64::min(
            meta.prodsize as u64,
            request.seqnum as u64 + request.payloadlen as u64,
        ) as u32;
        let mut start = (request.seqnum / VCMTP_DATA_LEN as u32) * VCMTP_DATA_LEN as u32;

        while start < end {
            let payloadlen = u32::min(VCMTP_DATA_LEN as u32, end - start);
            let block = &meta.product[start as usize..(start + payloadlen) as usize];
            let header = VcmtpHeader {
                prodindex: request.prodindex,
                seqnum: start,
                payloadlen: payloadlen as u16,
                flags: FrameKind::RetxData,
            };
            self.tcpsend.send(self.receiver, &header, Some(block)).await?;
            debug!(receiver = %self.receiver, prodindex = request.prodindex,
                seqnum = start, payloadlen, "data block retransmitted");
            start += payloadlen;
        }
        Ok(())
    }

    async fn retransmit_bop(
        &self,
        request: &VcmtpHeader,
        meta: &RetxMetadata,
    ) -> Result<(), SendError> {
        let bop = BopMsg {
            prodsize: meta.prodsize,
            metadata: meta.metadata.clone(),
        };
        let mut body = BytesMut::with_capacity(bop.payloadlen() as usize);
        bop.ser(&mut body);

        let mut header = VcmtpHeader::control(request.prodindex, FrameKind::RetxBop);
        header.payloadlen = bop.payloadlen();
        self.tcpsend.send(self.receiver, &header, Some(&body)).await
    }

    async fn retransmit_eop(&self, request: &VcmtpHeader) -> Result<(), SendError> {
        let header = VcmtpHeader::control(request.prodindex, FrameKind::RetxEop);
        self.tcpsend.send(self.receiver, &header, None).await
    }

    async fn reject(&self, prodindex: u32) -> Result<(), SendError> {
        debug!(receiver = %self.receiver, prodindex, "rejecting retransmission request");
        let header = VcmtpHeader::control(prodindex, FrameKind::RetxRej);
        self.tcpsend.send(self.receiver, &header, None).await
    }
}
