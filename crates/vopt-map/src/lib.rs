#![forbid(unsafe_code)]
//! Block map for VOpt: a forest of fixed-height trees mapping logical to
//! physical blocks, with a per-zone page cache whose era-based writeback
//! bounds recovery journal reaping.

pub mod cache;
pub mod page;
pub mod zone;

pub use cache::{CacheStats, PageCache, PageState};
pub use page::TreePage;
pub use zone::{
    compute_forest_size, compute_height, AllocatedTreePage, BlockMapGeometry, BlockMapZone,
    TreePageAllocator,
};
