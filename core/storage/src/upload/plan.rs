//! Slice-size negotiation and slice partitioning.

use tracing::warn;

/// 256 KiB, the alignment most vendors require for slices.
pub const KIB_256: u64 = 256 * 1024;
/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Vendor limits on slice sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicePolicy {
    /// Smallest slice the vendor accepts.
    pub vendor_min: u64,
    /// Largest slice the account tier allows.
    pub tier_max: u64,
    /// Maximum number of slices per upload.
    pub max_slices: u64,
    /// Slice sizes are rounded up to a multiple of this.
    pub granularity: u64,
}

impl SlicePolicy {
    /// Policy with a fixed slice size.
    pub fn fixed(size: u64) -> Self {
        Self {
            vendor_min: size,
            tier_max: size,
            max_slices: u64::MAX,
            granularity: 1,
        }
    }

    fn align(&self, size: u64) -> u64 {
        let g = self.granularity.max(1);
        let aligned = size.div_ceil(g).saturating_mul(g);
        if aligned > self.tier_max && self.tier_max >= g {
            self.tier_max / g * g
        } else {
            aligned
        }
    }

    /// Pick the slice size for a payload of `total` bytes.
    ///
    /// An operator override is clamped into `[vendor_min, tier_max]` and
    /// wins over low-bandwidth mode. Low-bandwidth mode picks the smallest
    /// size keeping the count within `max_slices`. Otherwise the tier
    /// maximum is used. In every mode the size grows (never past
    /// `tier_max`) when the count would exceed `max_slices`.
    pub fn negotiate(&self, total: u64, options: &SliceOptions) -> u64 {
        let min = self.vendor_min.max(1);
        let max = self.tier_max.max(min);
        let ceiling_size = if self.max_slices == u64::MAX {
            0
        } else {
            total.div_ceil(self.max_slices.max(1))
        };

        let mut size = match options.override_size {
            Some(requested) => {
                let clamped = requested.clamp(min, max);
                if clamped != requested {
                    warn!(
                        "Slice size override {} outside [{}, {}], using {}",
                        requested, min, max, clamped
                    );
                }
                clamped
            }
            None if options.low_bandwidth => ceiling_size.clamp(min, max),
            None => max,
        };

        if size < ceiling_size {
            let grown = ceiling_size.min(max);
            warn!(
                "Slice size {} would exceed {} slices, growing to {}",
                size, self.max_slices, grown
            );
            size = grown;
        }

        self.align(size)
    }
}

/// Per-mount slice preferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceOptions {
    /// Operator-requested slice size in bytes.
    pub override_size: Option<u64>,
    /// Prefer many small slices.
    pub low_bandwidth: bool,
}

/// One byte range of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl SliceRange {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Partition of `[0, total)` into consecutive slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    pub total: u64,
    pub slice_size: u64,
    pub slices: Vec<SliceRange>,
}

impl SlicePlan {
    /// Split `total` bytes into `ceil(total / slice_size)` slices.
    pub fn new(total: u64, slice_size: u64) -> Self {
        let slice_size = slice_size.max(1);
        let count = total.div_ceil(slice_size);
        let slices = (0..count)
            .map(|i| {
                let offset = i * slice_size;
                SliceRange {
                    index: i as usize,
                    offset,
                    len: slice_size.min(total - offset),
                }
            })
            .collect();
        Self {
            total,
            slice_size,
            slices,
        }
    }

    /// Number of slices.
    pub fn count(&self) -> usize {
        self.slices.len()
    }
}
