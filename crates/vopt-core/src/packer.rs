//! The packer: coalescing compressed write fragments into shared physical
//! blocks.
//!
//! Fragments accumulate in a bin until fourteen are present or their bytes
//! would overflow the block, at which point the engine allocates one
//! physical block, writes the packed block under a compressed-write lock,
//! and journals one mapping per fragment. The on-disk format is a small
//! header of fourteen little-endian fragment sizes followed by the
//! fragment bytes, so a fragment's offset is the sum of the sizes before
//! its slot.

use crate::vio::DataVio;
use vopt_error::{Result, VoptError};
use vopt_types::{BLOCK_SIZE, MAX_COMPRESSION_SLOTS};

const PACKED_MAGIC: u32 = 0x4b50_4356; // "VCPK"

/// Header: magic plus fourteen u16 fragment sizes.
pub const PACKED_HEADER_SIZE: usize = 4 + 2 * MAX_COMPRESSION_SLOTS as usize;

/// Usable payload bytes per packed block.
pub const PACKED_CAPACITY: usize = BLOCK_SIZE - PACKED_HEADER_SIZE;

/// Compress one block; `None` when compression does not pay for itself.
#[must_use]
pub fn compress_fragment(data: &[u8]) -> Option<Vec<u8>> {
    let compressed = lz4_flex::block::compress(data);
    // A fragment must leave room for at least one more to be worth packing.
    if compressed.len() <= PACKED_CAPACITY / 2 {
        Some(compressed)
    } else {
        None
    }
}

/// Serialize up to fourteen fragments into one block.
pub fn pack_fragments(fragments: &[Vec<u8>]) -> Result<Vec<u8>> {
    if fragments.len() > MAX_COMPRESSION_SLOTS as usize {
        return Err(VoptError::InvalidArgument(format!(
            "{} fragments exceed the slot count",
            fragments.len()
        )));
    }
    let total: usize = fragments.iter().map(Vec::len).sum();
    if total > PACKED_CAPACITY {
        return Err(VoptError::InvalidArgument(format!(
            "{total} fragment bytes exceed packed capacity"
        )));
    }
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..4].copy_from_slice(&PACKED_MAGIC.to_le_bytes());
    let mut offset = PACKED_HEADER_SIZE;
    for (slot, fragment) in fragments.iter().enumerate() {
        let size_offset = 4 + slot * 2;
        block[size_offset..size_offset + 2]
            .copy_from_slice(&(fragment.len() as u16).to_le_bytes());
        block[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
    }
    Ok(block)
}

/// Extract and decompress the fragment in `slot` back to one block.
pub fn unpack_fragment(block: &[u8], slot: u8) -> Result<Vec<u8>> {
    if slot >= MAX_COMPRESSION_SLOTS {
        return Err(VoptError::InvalidArgument(format!(
            "compression slot {slot} out of range"
        )));
    }
    let magic = u32::from_le_bytes(block[0..4].try_into().expect("4 bytes"));
    if magic != PACKED_MAGIC {
        return Err(VoptError::BadState(
            "block is not a packed compressed block".to_owned(),
        ));
    }
    let size_at = |s: usize| {
        usize::from(u16::from_le_bytes([block[4 + s * 2], block[5 + s * 2]]))
    };
    let size = size_at(usize::from(slot));
    if size == 0 {
        return Err(VoptError::BadState(format!("slot {slot} is empty")));
    }
    let offset: usize = (0..usize::from(slot)).map(size_at).sum::<usize>() + PACKED_HEADER_SIZE;
    if offset + size > BLOCK_SIZE {
        return Err(VoptError::BadState("fragment overruns the block".to_owned()));
    }
    lz4_flex::block::decompress(&block[offset..offset + size], BLOCK_SIZE)
        .map_err(|e| VoptError::BadState(format!("fragment decompression failed: {e}")))
}

/// The packer's single open bin of vios awaiting a shared block.
pub struct Packer {
    bin: Vec<Box<DataVio>>,
    bin_bytes: usize,
    pub fragments_packed: u64,
    pub blocks_written: u64,
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

/// What `add` did with the vio.
pub enum PackerVerdict {
    /// Added; the bin is still open.
    Added,
    /// Added, and the bin is now full: flush it.
    BinFull,
}

impl Packer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bin: Vec::new(),
            bin_bytes: 0,
            fragments_packed: 0,
            blocks_written: 0,
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.bin.len()
    }

    /// Whether `bytes` more would still fit alongside the current bin.
    #[must_use]
    pub fn fits(&self, bytes: usize) -> bool {
        self.bin.len() < MAX_COMPRESSION_SLOTS as usize
            && self.bin_bytes + bytes <= PACKED_CAPACITY
    }

    /// Add a vio whose `compression` holds its fragment bytes. The caller
    /// checked `fits`.
    pub fn add(&mut self, vio: Box<DataVio>, fragment_len: usize) -> PackerVerdict {
        self.bin_bytes += fragment_len;
        self.bin.push(vio);
        self.fragments_packed += 1;
        if self.bin.len() == MAX_COMPRESSION_SLOTS as usize || self.bin_bytes == PACKED_CAPACITY {
            PackerVerdict::BinFull
        } else {
            PackerVerdict::Added
        }
    }

    /// Take the bin for flushing. Each vio's slot is its position.
    pub fn take_bin(&mut self) -> Vec<Box<DataVio>> {
        self.bin_bytes = 0;
        if !self.bin.is_empty() {
            self.blocks_written += 1;
        }
        std::mem::take(&mut self.bin)
    }
}
