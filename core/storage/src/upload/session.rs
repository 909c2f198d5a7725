//! Per-request upload session bookkeeping.

use std::collections::BTreeMap;

use unidrive_common::DrivePath;

use super::plan::SlicePlan;

/// Vendor acknowledgement for one slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReceipt {
    pub index: usize,
    /// Vendor token for the slice (often its MD5, sometimes a block id).
    pub token: String,
}

/// State of one chunked upload; lives for a single request.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub target_path: DrivePath,
    pub total_size: u64,
    pub slice_size: u64,
    pub slice_count: usize,
    pub upload_id: String,
    pub content_hash: String,
    pub first_slice_hash: String,
    completed: BTreeMap<usize, SliceReceipt>,
}

impl UploadSession {
    pub fn new(
        target_path: DrivePath,
        plan: &SlicePlan,
        upload_id: String,
        content_hash: String,
        first_slice_hash: String,
    ) -> Self {
        Self {
            target_path,
            total_size: plan.total,
            slice_size: plan.slice_size,
            slice_count: plan.count(),
            upload_id,
            content_hash,
            first_slice_hash,
            completed: BTreeMap::new(),
        }
    }

    /// Record a completed slice; receipts may arrive in any order.
    pub fn record(&mut self, receipt: SliceReceipt) {
        self.completed.insert(receipt.index, receipt);
    }

    /// Number of slices recorded so far.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// True once every index in `[0, slice_count)` is recorded.
    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.slice_count
            && self.completed.keys().copied().eq(0..self.slice_count)
    }

    /// Receipts sorted by slice index.
    pub fn ordered_receipts(&self) -> Vec<&SliceReceipt> {
        self.completed.values().collect()
    }

    /// Last receipt by index, if any.
    pub fn last_receipt(&self) -> Option<&SliceReceipt> {
        self.completed.values().next_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(count_bytes: u64, slice: u64) -> UploadSession {
        UploadSession::new(
            DrivePath::parse("/a.bin").unwrap(),
            &SlicePlan::new(count_bytes, slice),
            "up-1".into(),
            "md5".into(),
            "head".into(),
        )
    }

    fn receipt(index: usize) -> SliceReceipt {
        SliceReceipt {
            index,
            token: format!("t{}", index),
        }
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut s = session(10, 4);
        assert_eq!(s.slice_count, 3);
        s.record(receipt(2));
        s.record(receipt(0));
        assert!(!s.is_complete());
        s.record(receipt(1));
        assert!(s.is_complete());

        let order: Vec<_> = s.ordered_receipts().iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(s.last_receipt().unwrap().index, 2);
    }

    #[test]
    fn test_duplicate_receipt_does_not_complete() {
        let mut s = session(8, 4);
        s.record(receipt(0));
        s.record(receipt(0));
        assert_eq!(s.completed_count(), 1);
        assert!(!s.is_complete());
    }
}
