//! The retransmission table: everything the sender remembers about recently
//! multicast products.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::trace;

use crate::tcp_send::ReceiverId;

/// Sender-side record of one product, kept from the start of its multicast
/// until its retransmission lifetime expires or every receiver confirms
/// complete reception.
///
/// Metadata and product bytes are owned copies taken at insertion, so
/// retransmission never depends on the lifetime of caller-held buffers.
#[derive(Clone, Debug)]
pub struct RetxMetadata {
    pub prodindex: u32,
    pub prodsize: u32,
    pub metadata: Bytes,
    pub product: Bytes,
    pub mcast_start: Instant,
    pub mcast_end: Option<Instant>,
    /// Scaling factor from multicast duration to retransmission lifetime.
    pub retx_timeout_ratio: f32,
    pub retx_timeout_period: Option<Duration>,
    /// Receivers connected when the multicast started that have not yet
    /// confirmed complete reception. This set only ever shrinks: receivers
    /// connecting later are not added and their requests for this product
    /// are rejected.
    pub unfinished_receivers: FxHashSet<ReceiverId>,
}

impl RetxMetadata {
    pub fn new(
        prodindex: u32,
        product: Bytes,
        metadata: Bytes,
        retx_timeout_ratio: f32,
        receivers: Vec<ReceiverId>,
    ) -> RetxMetadata {
        debug_assert!(product.len() <= u32::MAX as usize);
        RetxMetadata {
            prodindex,
            prodsize: product.len() as u32,
            metadata,
            product,
            mcast_start: Instant::now(),
            mcast_end: None,
            retx_timeout_ratio,
            retx_timeout_period: None,
            unfinished_receivers: receivers.into_iter().collect(),
        }
    }
}

/// Concurrent map from product index to [RetxMetadata].
///
/// Lookups happen on every receiver request; mutation is limited to the
/// multicast path (insert), receiver completion and the timer (removal).
/// The two removal paths are serialized by the write lock, and their boolean
/// results are the sole trigger for the application's end-of-product
/// notification - exactly one of them returns true per product.
pub struct SenderMetadata {
    entries: RwLock<FxHashMap<u32, RetxMetadata>>,
}

impl SenderMetadata {
    pub fn new() -> SenderMetadata {
        SenderMetadata {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn add(&self, meta: RetxMetadata) {
        trace!(prodindex = meta.prodindex, "inserting retransmission entry");
        self.entries.write().insert(meta.prodindex, meta);
    }

    pub fn get(&self, prodindex: u32) -> Option<RetxMetadata> {
        self.entries.read().get(&prodindex).cloned()
    }

    /// Records the end of the multicast phase and derives the product's
    /// retransmission lifetime from it. Returns the lifetime, or `None` if
    /// the entry is already gone.
    pub fn set_mcast_end(&self, prodindex: u32, end: Instant) -> Option<Duration> {
        let mut entries = self.entries.write();
        let meta = entries.get_mut(&prodindex)?;
        let period = (end - meta.mcast_start).mul_f32(meta.retx_timeout_ratio);
        meta.mcast_end = Some(end);
        meta.retx_timeout_period = Some(period);
        Some(period)
    }

    /// Removes `receiver` from the entry's unfinished set. Returns true iff
    /// that leaves the set empty, which also removes the entry itself - the
    /// caller's one-shot signal that the product is complete. Absent entries
    /// return false.
    pub fn clear_unfinished(&self, prodindex: u32, receiver: ReceiverId) -> bool {
        let mut entries = self.entries.write();
        let Some(meta) = entries.get_mut(&prodindex) else {
            return false;
        };
        meta.unfinished_receivers.remove(&receiver);
        if meta.unfinished_receivers.is_empty() {
            entries.remove(&prodindex);
            true
        } else {
            false
        }
    }

    /// Unconditional removal, the timer path. Returns true iff the entry was
    /// still present.
    pub fn remove(&self, prodindex: u32) -> bool {
        self.entries.write().remove(&prodindex).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn receiver(raw: u32) -> ReceiverId {
        ReceiverId::from_raw(raw)
    }

    fn meta_with_receivers(prodindex: u32, receivers: &[u32]) -> RetxMetadata {
        RetxMetadata::new(
            prodindex,
            Bytes::from_static(b"payload"),
            Bytes::new(),
            20.0,
            receivers.iter().copied().map(receiver).collect(),
        )
    }

    #[test]
    fn test_get_returns_inserted_entry() {
        let table = SenderMetadata::new();
        table.add(meta_with_receivers(3, &[1]));

        let meta = table.get(3).unwrap();
        assert_eq!(meta.prodindex, 3);
        assert_eq!(meta.prodsize, 7);
        assert_eq!(&meta.product[..], b"payload");
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_remove_reports_presence() {
        let table = SenderMetadata::new();
        table.add(meta_with_receivers(5, &[]));

        assert!(table.remove(5));
        assert!(!table.remove(5));
        assert!(!table.remove(99));
    }

    #[rstest]
    #[case::last_receiver(&[1], 1, true)]
    #[case::one_of_two(&[1, 2], 1, false)]
    #[case::not_a_member(&[1, 2], 9, false)]
    #[case::empty_set(&[], 9, true)]
    fn test_clear_unfinished(
        #[case] receivers: &[u32],
        #[case] clearing: u32,
        #[case] expect_removed: bool,
    ) {
        let table = SenderMetadata::new();
        table.add(meta_with_receivers(1, receivers));

        assert_eq!(table.clear_unfinished(1, receiver(clearing)), expect_removed);
        assert_eq!(table.get(1).is_none(), expect_removed);
    }

    #[test]
    fn test_clear_unfinished_absent_entry() {
        let table = SenderMetadata::new();
        assert!(!table.clear_unfinished(1, receiver(1)));
    }

    #[test]
    fn test_completion_signal_fires_exactly_once_in_sequence() {
        let table = SenderMetadata::new();
        table.add(meta_with_receivers(1, &[1, 2]));

        // both receivers confirm, then the timer fires
        assert!(!table.clear_unfinished(1, receiver(1)));
        assert!(table.clear_unfinished(1, receiver(2)));
        assert!(!table.remove(1));

        // the timer fires first, then a straggler confirms
        table.add(meta_with_receivers(2, &[1, 2]));
        assert!(table.remove(2));
        assert!(!table.clear_unfinished(2, receiver(1)));
    }

    #[test]
    fn test_concurrent_remove_and_final_clear_yield_one_signal() {
        for _ in 0..200 {
            let table = SenderMetadata::new();
            table.add(meta_with_receivers(1, &[1]));

            let (removed, cleared) = std::thread::scope(|scope| {
                let remover = scope.spawn(|| table.remove(1));
                let clearer = scope.spawn(|| table.clear_unfinished(1, receiver(1)));
                (remover.join().unwrap(), clearer.join().unwrap())
            });

            assert!(
                removed ^ cleared,
                "exactly one removal path must win, got remove={removed} clear={cleared}"
            );
            assert!(table.get(1).is_none());
        }
    }

    #[test]
    fn test_set_mcast_end_computes_timeout_period() {
        let table = SenderMetadata::new();
        let meta = meta_with_receivers(1, &[]);
        let start = meta.mcast_start;
        table.add(meta);

        let period = table
            .set_mcast_end(1, start + Duration::from_millis(10))
            .unwrap();
        assert_eq!(period, Duration::from_millis(10).mul_f32(20.0));

        let stored = table.get(1).unwrap();
        assert_eq!(stored.retx_timeout_period, Some(period));
        assert_eq!(stored.mcast_end, Some(start + Duration::from_millis(10)));

        assert!(table.set_mcast_end(99, start).is_none());
    }
}
