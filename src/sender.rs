//! The sender façade and its background tasks.
//!
//! [VcmtpSender] multicasts products on the caller's task and runs two
//! background tasks after [VcmtpSender::start]: the timer, which ages
//! products out of the retransmission table, and the acceptor, which turns
//! incoming control connections into per-receiver retransmission workers.
//!
//! A failure on either background task - or in [VcmtpSender::send_product]
//! itself - is recorded in a set-once error slot and brings the whole sender
//! down; [VcmtpSender::stop] surfaces the recorded error to the caller.
//! Worker failures are local to their receiver and never reach the slot.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::SenderConfig;
use crate::delay_queue::ProductIndexDelayQueue;
use crate::error::SendError;
use crate::frame::{BopMsg, FrameKind, VcmtpHeader, AVAIL_BOP_LEN, VCMTP_DATA_LEN, VCMTP_HEADER_LEN};
use crate::notifier::SendEventNotifier;
use crate::retx_tasks::RetxTaskList;
use crate::retx_worker::RetxWorker;
use crate::sender_metadata::{RetxMetadata, SenderMetadata};
use crate::tcp_send::TcpSend;
use crate::udp_send::UdpSend;

/// Everything the background tasks share with the façade. Workers, timer
/// and acceptor get explicit handles to this instead of pointers back into
/// [VcmtpSender].
struct SenderShared {
    udpsend: UdpSend,
    tcpsend: Arc<TcpSend>,
    send_meta: Arc<SenderMetadata>,
    delay_q: ProductIndexDelayQueue,
    retx_tasks: Arc<RetxTaskList>,
    notifier: Option<Arc<dyn SendEventNotifier>>,
    /// Link speed hint in bits per second; zero means unpaced.
    link_speed: Arc<Mutex<u64>>,
    error_slot: Mutex<Option<SendError>>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
    acceptor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SenderShared {
    /// First writer wins; [VcmtpSender::stop] drains the slot.
    fn record_error(&self, e: SendError) {
        let mut slot = self.error_slot.lock();
        if slot.is_none() {
            *slot = Some(e);
        } else {
            debug!(error = %e, "error slot already occupied, dropping subsequent error");
        }
    }

    /// Synchronous part of shutdown: stops the timer through the delay
    /// queue, cancels the acceptor and every worker. Joining is left to
    /// [VcmtpSender::stop] so this can run from within a failing task.
    fn initiate_shutdown(&self) {
        self.delay_q.disable();
        if let Some(handle) = &*self.acceptor_handle.lock() {
            handle.abort();
        }
        debug!(workers = self.retx_tasks.len(), "cancelling retransmission workers");
        self.retx_tasks.shutdown();
    }
}

/// Terminal failure of a background task or a send: record it, then bring
/// the sender down.
fn task_exit(shared: &SenderShared, e: SendError) {
    error!(error = %e, "fatal sender error, shutting down");
    shared.record_error(e);
    shared.initiate_shutdown();
}

/// Ages products out of the retransmission table. Exits cleanly when the
/// delay queue is disabled at shutdown.
async fn timer_task(shared: Arc<SenderShared>) -> Result<(), SendError> {
    loop {
        let prodindex = match shared.delay_q.pop().await {
            Ok(prodindex) => prodindex,
            Err(SendError::QueueDisabled) => {
                debug!("delay queue disabled, timer exiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!(prodindex, "retransmission lifetime expired");
        if shared.send_meta.remove(prodindex) {
            if let Some(notifier) = &shared.notifier {
                notifier.notify_of_eop(prodindex);
            }
        }
    }
}

/// Accepts control connections and spawns one retransmission worker per
/// receiver. There is no await between a successful accept and the worker's
/// registration, so cancellation cannot strand an accepted socket.
async fn acceptor_task(shared: Arc<SenderShared>) -> Result<(), SendError> {
    loop {
        let receiver = shared.tcpsend.accept().await?;
        let worker = RetxWorker::new(
            receiver,
            shared.tcpsend.clone(),
            shared.send_meta.clone(),
            shared.retx_tasks.clone(),
            shared.notifier.clone(),
        );
        let handle = tokio::spawn(worker.run());
        shared.retx_tasks.add(receiver, handle);
    }
}

/// Sender side of the protocol: multicasts products to the group and serves
/// retransmission requests over per-receiver TCP connections until each
/// product's retransmission lifetime expires.
pub struct VcmtpSender {
    config: SenderConfig,
    notifier: Option<Arc<dyn SendEventNotifier>>,
    link_speed: Arc<Mutex<u64>>,
    prod_index: u32,
    shared: Option<Arc<SenderShared>>,
}

impl VcmtpSender {
    /// Validates the configuration and constructs a stopped sender. No
    /// sockets are bound and no tasks run until [start](Self::start).
    pub fn new(
        config: SenderConfig,
        notifier: Option<Arc<dyn SendEventNotifier>>,
    ) -> Result<VcmtpSender, SendError> {
        config.validate()?;
        Ok(VcmtpSender {
            prod_index: config.init_prodindex,
            config,
            notifier,
            link_speed: Arc::new(Mutex::new(0)),
            shared: None,
        })
    }

    /// Binds both sockets and spawns the timer and acceptor tasks.
    pub async fn start(&mut self) -> Result<(), SendError> {
        if self.shared.is_some() {
            return Err(SendError::System("sender is already started".into()));
        }

        let tcpsend = Arc::new(TcpSend::init(self.config.tcp_addr, self.config.tcp_port).await?);
        let udpsend = UdpSend::init(
            self.config.mcast_group,
            self.config.ttl,
            self.config.default_if,
        )?;
        info!(tcp_port = tcpsend.local_port()?, group = %self.config.mcast_group, "sender starting");

        let shared = Arc::new(SenderShared {
            udpsend,
            tcpsend,
            send_meta: Arc::new(SenderMetadata::new()),
            delay_q: ProductIndexDelayQueue::new(),
            retx_tasks: Arc::new(RetxTaskList::new()),
            notifier: self.notifier.clone(),
            link_speed: self.link_speed.clone(),
            error_slot: Mutex::new(None),
            timer_handle: Mutex::new(None),
            acceptor_handle: Mutex::new(None),
        });

        let timer_shared = shared.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = timer_task(timer_shared.clone()).await {
                task_exit(&timer_shared, e);
            }
        });
        *shared.timer_handle.lock() = Some(handle);

        let acceptor_shared = shared.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = acceptor_task(acceptor_shared.clone()).await {
                task_exit(&acceptor_shared, e);
            }
        });
        *shared.acceptor_handle.lock() = Some(handle);

        self.shared = Some(shared);
        Ok(())
    }

    /// Stops the background tasks, cancels every worker and surfaces the
    /// first error any task recorded. Idempotent.
    pub async fn stop(&mut self) -> Result<(), SendError> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };

        shared.initiate_shutdown();
        let timer = shared.timer_handle.lock().take();
        let acceptor = shared.acceptor_handle.lock().take();
        if let Some(handle) = timer {
            let _ = handle.await;
        }
        if let Some(handle) = acceptor {
            // cancelled with abort, so a JoinError is the normal outcome
            let _ = handle.await;
        }
        info!("sender stopped");

        let result = match shared.error_slot.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        result
    }

    /// The bound TCP control port, once started. Useful when the
    /// configuration requested port 0.
    pub fn tcp_port(&self) -> Result<u16, SendError> {
        self.shared()?.tcpsend.local_port()
    }

    /// Stores the link-speed hint read by the multicast pacing logic.
    pub fn set_link_speed(&self, bits_per_second: u64) {
        *self.link_speed.lock() = bits_per_second;
    }

    /// Selects the outgoing multicast interface.
    pub fn set_default_if(&self, interface: Ipv4Addr) -> Result<(), SendError> {
        self.shared()?.udpsend.set_default_if(interface)
    }

    /// Multicasts a product without metadata.
    pub async fn send_product(&mut self, data: Bytes) -> Result<u32, SendError> {
        self.send_product_with_meta(data, None).await
    }

    /// Multicasts a product with optional per-product metadata.
    pub async fn send_product_with_meta(
        &mut self,
        data: Bytes,
        metadata: Option<Bytes>,
    ) -> Result<u32, SendError> {
        let ratio = self.config.retx_timeout_ratio;
        self.send_product_with_ratio(data, metadata, ratio).await
    }

    /// Multicasts one product - BOP, data blocks, EOP - and schedules its
    /// retransmission lifetime, computed as the multicast duration scaled by
    /// `timeout_ratio`. Returns the index assigned to the product; the
    /// internal counter advances only on success.
    ///
    /// Any failure here is terminal for the sender as a whole: the error is
    /// recorded, shutdown is initiated, and the same error is returned.
    pub async fn send_product_with_ratio(
        &mut self,
        data: Bytes,
        metadata: Option<Bytes>,
        timeout_ratio: f32,
    ) -> Result<u32, SendError> {
        let shared = self.shared()?.clone();
        match self
            .do_send_product(&shared, data, metadata, timeout_ratio)
            .await
        {
            Ok(prodindex) => {
                self.prod_index = self.prod_index.wrapping_add(1);
                Ok(prodindex)
            }
            Err(e) => {
                task_exit(&shared, e.duplicate());
                Err(e)
            }
        }
    }

    async fn do_send_product(
        &self,
        shared: &SenderShared,
        data: Bytes,
        metadata: Option<Bytes>,
        timeout_ratio: f32,
    ) -> Result<u32, SendError> {
        if data.len() > u32::MAX as usize {
            return Err(SendError::InvalidArgument(format!(
                "product of {} bytes exceeds the wire limit",
                data.len()
            )));
        }
        if let Some(metadata) = &metadata {
            if metadata.len() > AVAIL_BOP_LEN {
                return Err(SendError::InvalidArgument(format!(
                    "metadata of {} bytes exceeds the maximum of {AVAIL_BOP_LEN}",
                    metadata.len()
                )));
            }
        }
        if !timeout_ratio.is_finite() || timeout_ratio < 0.0 {
            return Err(SendError::InvalidArgument(format!(
                "retransmission timeout ratio must be finite and non-negative, was {timeout_ratio}"
            )));
        }

        let prodindex = self.prod_index;
        let metadata = metadata.unwrap_or_default();

        // Insert before the first frame hits the wire: a fast receiver's
        // immediate retransmission request must find the entry.
        shared.send_meta.add(RetxMetadata::new(
            prodindex,
            data.clone(),
            metadata.clone(),
            timeout_ratio,
            shared.tcpsend.connected_ids(),
        ));

        self.send_bop(shared, prodindex, data.len() as u32, &metadata)
            .await?;
        self.send_data(shared, prodindex, &data).await?;
        self.send_eop(shared, prodindex).await?;

        let Some(period) = shared.send_meta.set_mcast_end(prodindex, Instant::now()) else {
            // every receiver confirmed completion while the multicast was
            // still in flight; nothing left to age out
            return Ok(prodindex);
        };
        shared.delay_q.push(prodindex, period);
        debug!(prodindex, ?period, "product multicast, retransmission window open");
        Ok(prodindex)
    }

    async fn send_bop(
        &self,
        shared: &SenderShared,
        prodindex: u32,
        prodsize: u32,
        metadata: &Bytes,
    ) -> Result<(), SendError> {
        let bop = BopMsg {
            prodsize,
            metadata: metadata.clone(),
        };
        let mut header_buf = BytesMut::with_capacity(VCMTP_HEADER_LEN);
        VcmtpHeader {
            prodindex,
            seqnum: 0,
            payloadlen: bop.payloadlen(),
            flags: FrameKind::Bop,
        }
        .ser(&mut header_buf);

        let mut fixed = BytesMut::new();
        bop.ser_fixed(&mut fixed);

        shared
            .udpsend
            .send_gather(&[&header_buf, &fixed, metadata])
            .await
    }

    async fn send_data(
        &self,
        shared: &SenderShared,
        prodindex: u32,
        data: &Bytes,
    ) -> Result<(), SendError> {
        let bits_per_second = *shared.link_speed.lock();

        let mut offset = 0usize;
        while offset < data.len() {
            let payloadlen = usize::min(VCMTP_DATA_LEN, data.len() - offset);
            let mut header_buf = BytesMut::with_capacity(VCMTP_HEADER_LEN);
            VcmtpHeader {
                prodindex,
                seqnum: offset as u32,
                payloadlen: payloadlen as u16,
                flags: FrameKind::MemData,
            }
            .ser(&mut header_buf);

            shared
                .udpsend
                .send_gather(&[&header_buf, &data[offset..offset + payloadlen]])
                .await?;

            if bits_per_second > 0 {
                let pause = std::time::Duration::from_secs_f64(
                    (payloadlen as f64 * 8.0) / bits_per_second as f64,
                );
                tokio::time::sleep(pause).await;
            }
            offset += payloadlen;
        }
        Ok(())
    }

    async fn send_eop(&self, shared: &SenderShared, prodindex: u32) -> Result<(), SendError> {
        let mut header_buf = BytesMut::with_capacity(VCMTP_HEADER_LEN);
        VcmtpHeader::control(prodindex, FrameKind::Eop).ser(&mut header_buf);
        shared.udpsend.send_to(&header_buf).await
    }

    fn shared(&self) -> Result<&Arc<SenderShared>, SendError> {
        self.shared.as_ref().ok_or(SendError::NotStarted)
    }
}

impl Drop for VcmtpSender {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.initiate_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp_send::MockDatagramSocket;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingNotifier {
        count: AtomicUsize,
    }

    impl SendEventNotifier for CountingNotifier {
        fn notify_of_eop(&self, _prodindex: u32) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn shared_with_mock_udp(notifier: Arc<dyn SendEventNotifier>) -> Arc<SenderShared> {
        let socket = MockDatagramSocket::new();
        let udpsend = UdpSend::with_socket(
            Arc::new(socket),
            SocketAddr::from(([127, 0, 0, 1], 9999)),
        );
        Arc::new(SenderShared {
            udpsend,
            tcpsend: Arc::new(
                TcpSend::init(Ipv4Addr::LOCALHOST, 0).await.unwrap(),
            ),
            send_meta: Arc::new(SenderMetadata::new()),
            delay_q: ProductIndexDelayQueue::new(),
            retx_tasks: Arc::new(RetxTaskList::new()),
            notifier: Some(notifier),
            link_speed: Arc::new(Mutex::new(0)),
            error_slot: Mutex::new(None),
            timer_handle: Mutex::new(None),
            acceptor_handle: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_timer_removes_and_notifies_once() {
        let notifier = Arc::new(CountingNotifier::default());
        let shared = shared_with_mock_udp(notifier.clone()).await;

        shared.send_meta.add(RetxMetadata::new(
            0,
            Bytes::from_static(b"data"),
            Bytes::new(),
            0.0,
            vec![],
        ));
        shared.delay_q.push(0, Duration::ZERO);

        let timer = tokio::spawn(timer_task(shared.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(shared.send_meta.get(0).is_none());
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);

        shared.delay_q.disable();
        assert!(timer.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_timer_stays_silent_for_completed_product() {
        let notifier = Arc::new(CountingNotifier::default());
        let shared = shared_with_mock_udp(notifier.clone()).await;

        // the product completed via RETX_END before the timer fired
        shared.delay_q.push(3, Duration::ZERO);

        let timer = tokio::spawn(timer_task(shared.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(notifier.count.load(Ordering::SeqCst), 0);

        shared.delay_q.disable();
        assert!(timer.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_error_slot_keeps_first_error() {
        let shared = shared_with_mock_udp(Arc::new(CountingNotifier::default())).await;

        shared.record_error(SendError::System("first".into()));
        shared.record_error(SendError::System("second".into()));

        match shared.error_slot.lock().take() {
            Some(SendError::System(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected slot content: {other:?}"),
        };
    }

    #[tokio::test]
    async fn test_unstarted_sender_rejects_operations() {
        let config = SenderConfig::new(
            Ipv4Addr::LOCALHOST,
            0,
            std::net::SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 1), 5000),
        );
        let mut sender = VcmtpSender::new(config, None).unwrap();

        assert!(matches!(sender.tcp_port(), Err(SendError::NotStarted)));
        assert!(matches!(
            sender.set_default_if(Ipv4Addr::LOCALHOST),
            Err(SendError::NotStarted)
        ));
        assert!(matches!(
            sender.send_product(Bytes::from_static(b"x")).await,
            Err(SendError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = SenderConfig::new(
            Ipv4Addr::LOCALHOST,
            0,
            std::net::SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 1), 5000),
        );
        config.retx_timeout_ratio = -2.0;

        assert!(matches!(
            VcmtpSender::new(config, None),
            Err(SendError::InvalidArgument(_))
        ));
    }
}
