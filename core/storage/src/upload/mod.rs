//! Chunked, resumable, dedup-aware upload protocol.

mod driver;
mod hash;
mod plan;
mod session;

pub use driver::{
    ChunkedUpload, Finalize, UploadDriver, UploadOutcome, UploadSettings, UploadTarget,
};
pub use hash::{slice_hashes, slice_md5, ContentDigest};
pub use plan::{SliceOptions, SlicePlan, SlicePolicy, SliceRange, KIB_256, MIB};
pub use session::{SliceReceipt, UploadSession};
