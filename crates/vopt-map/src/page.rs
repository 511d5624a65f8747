//! Tree page format.
//!
//! A tree page is one 4 KiB block: a 36-byte header followed by 812 packed
//! 5-byte mapping entries. Interior pages store child-page PBNs as mapped
//! entries; an unmapped entry means "all descendants unmapped".

use vopt_error::{Result, VoptError};
use vopt_types::{
    pack_block_map_entry, unpack_block_map_entry, DataLocation, Pbn, BLOCK_MAP_ENTRIES_PER_PAGE,
    BLOCK_MAP_ENTRY_SIZE, BLOCK_SIZE,
};

/// On-disk page header size; entries start immediately after.
pub const PAGE_HEADER_SIZE: usize = 36;

const PAGE_VERSION: u32 = 4;

/// One block map tree page, interior or leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreePage {
    buf: Vec<u8>,
}

impl TreePage {
    /// Create an initialized, all-unmapped page claiming to live at `pbn`.
    #[must_use]
    pub fn new(pbn: Pbn, nonce: u64) -> Self {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&PAGE_VERSION.to_le_bytes());
        buf[4..12].copy_from_slice(&pbn.0.to_le_bytes());
        buf[12..20].copy_from_slice(&nonce.to_le_bytes());
        buf[20] = 1; // initialized
        Self { buf }
    }

    /// Adopt a page read from `pbn`, validating its header. A page of all
    /// zeros (never written) is accepted as an uninitialized page and
    /// re-initialized in place.
    pub fn from_block(pbn: Pbn, nonce: u64, buf: Vec<u8>) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(VoptError::InvalidArgument(
                "tree page is not one block".to_owned(),
            ));
        }
        if buf[20] == 0 {
            return Ok(Self::new(pbn, nonce));
        }
        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let stored_pbn = u64::from_le_bytes(buf[4..12].try_into().expect("8 bytes"));
        let stored_nonce = u64::from_le_bytes(buf[12..20].try_into().expect("8 bytes"));
        if version != PAGE_VERSION || stored_nonce != nonce {
            return Err(VoptError::BadState(format!(
                "tree page at {pbn} has version {version}, nonce {stored_nonce:#x}"
            )));
        }
        if stored_pbn != pbn.0 {
            return Err(VoptError::BadState(format!(
                "tree page at {pbn} claims to live at P{stored_pbn}"
            )));
        }
        Ok(Self { buf })
    }

    /// Read the mapping in `slot`.
    #[must_use]
    pub fn entry(&self, slot: usize) -> DataLocation {
        debug_assert!(slot < BLOCK_MAP_ENTRIES_PER_PAGE);
        let offset = PAGE_HEADER_SIZE + slot * BLOCK_MAP_ENTRY_SIZE;
        let mut packed = [0u8; BLOCK_MAP_ENTRY_SIZE];
        packed.copy_from_slice(&self.buf[offset..offset + BLOCK_MAP_ENTRY_SIZE]);
        unpack_block_map_entry(&packed)
    }

    /// Store a mapping in `slot`.
    pub fn set_entry(&mut self, slot: usize, location: DataLocation) {
        debug_assert!(slot < BLOCK_MAP_ENTRIES_PER_PAGE);
        let offset = PAGE_HEADER_SIZE + slot * BLOCK_MAP_ENTRY_SIZE;
        self.buf[offset..offset + BLOCK_MAP_ENTRY_SIZE]
            .copy_from_slice(&pack_block_map_entry(location));
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Iterate the mapped entries of this page as `(slot, location)`.
    pub fn mapped_entries(&self) -> impl Iterator<Item = (usize, DataLocation)> + '_ {
        (0..BLOCK_MAP_ENTRIES_PER_PAGE).filter_map(move |slot| {
            let entry = self.entry(slot);
            entry.is_mapped().then_some((slot, entry))
        })
    }
}
