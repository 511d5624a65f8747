#![forbid(unsafe_code)]
//! Deduplication index for VOpt: a content-addressable advice service.
//!
//! Given a 16-byte chunk fingerprint, the index answers with the probable
//! prior physical location of that content. Recent records buffer in
//! per-zone open chapter shards; closed chapters live in an on-disk ring
//! with a dense recent region and a sparse, cache-mediated tail.

pub mod geometry;
pub mod open_chapter;
pub mod router;
pub mod volume;

pub use geometry::{IndexGeometry, RECORDS_PER_PAGE, RECORD_SIZE};
pub use open_chapter::{OpenChapterRecord, OpenChapterZone};
pub use router::{CompletedRequest, IndexRequest, IndexRouter, IndexStats, RequestAction};
pub use volume::{cache_probe_type, CacheProbeType, SearchOutcome, Volume, VolumeStats};

use metrohash::MetroHash128;
use std::hash::Hasher;
use vopt_types::{ChunkName, CHUNK_NAME_SIZE};

/// Fingerprint one 4 KiB block of data.
#[must_use]
pub fn fingerprint_block(data: &[u8]) -> ChunkName {
    let mut hasher = MetroHash128::default();
    hasher.write(data);
    let (low, high) = hasher.finish128();
    let mut name = [0u8; CHUNK_NAME_SIZE];
    name[0..8].copy_from_slice(&low.to_le_bytes());
    name[8..16].copy_from_slice(&high.to_le_bytes());
    ChunkName(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable_and_content_addressed() {
        let a = vec![0x11u8; 4096];
        let b = vec![0x22u8; 4096];
        assert_eq!(fingerprint_block(&a), fingerprint_block(&a));
        assert_ne!(fingerprint_block(&a), fingerprint_block(&b));
    }
}
