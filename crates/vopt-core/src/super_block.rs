//! The super block and the on-device layout.
//!
//! Block zero holds a crc32c-protected description of the whole device:
//! geometry, identity nonce, the recovery journal's saved state, and the
//! clean-shutdown flag that decides whether the next load must recover.

use crate::config::ThreadCountConfig;
use std::sync::Arc;
use vopt_block::{BlockIo, IoPriority};
use vopt_depot::DepotConfig;
use vopt_error::{Result, VoptError};
use vopt_index::IndexGeometry;
use vopt_journal::JournalConfig;
use vopt_map::BlockMapGeometry;
use vopt_types::{Pbn, BLOCK_SIZE, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK};

pub const SUPER_VERSION_MINIMUM: u32 = 1;
pub const SUPER_VERSION_CURRENT: u32 = 3;
pub const SUPER_VERSION_MAXIMUM: u32 = 7;

const SUPER_MAGIC: u32 = 0x5642_4f50; // "POBV"

/// Format-time tunables.
#[derive(Debug, Clone, Copy)]
pub struct FormatParams {
    /// Blocks per slab.
    pub slab_size: u64,
    pub root_count: u32,
    /// Recovery journal blocks; must be a power of two.
    pub journal_size: u64,
    pub index: IndexGeometry,
    pub nonce: u64,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            slab_size: 4096,
            root_count: 8,
            journal_size: 64,
            index: IndexGeometry {
                records_per_chapter: 1024,
                chapters: 64,
                sparse_chapters: 16,
                zone_count: 1,
                open_chapter_load_ratio: 4,
            },
            nonce: 0x56_4f_50_54_2d_30_30_31,
        }
    }
}

/// Everything the engine needs to know about where things live.
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub version: u32,
    pub nonce: u64,
    pub physical_blocks: u64,
    pub logical_blocks: u64,
    pub slab_size: u64,
    pub slab_count: u32,
    pub root_count: u32,
    pub tree_height: u32,
    pub journal_size: u64,
    pub index: IndexGeometry,
    pub recovery_count: u8,
    /// True when the device shut down through the save path.
    pub clean: bool,
    // Recovery journal state, as of the last save.
    pub journal_start: u64,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    /// Newest closed index chapter at the last save; `u64::MAX` when no
    /// chapter has ever closed.
    pub index_newest_closed: u64,
}

impl SuperBlock {
    /// Lay out a fresh device over `physical_blocks`.
    pub fn format(physical_blocks: u64, logical_blocks: u64, params: &FormatParams) -> Result<Self> {
        if !params.journal_size.is_power_of_two() {
            return Err(VoptError::BadConfiguration(format!(
                "journal size {} is not a power of two",
                params.journal_size
            )));
        }
        params.index.validate()?;
        let tree_height = vopt_map::compute_height(logical_blocks, params.root_count);
        let mut this = Self {
            version: SUPER_VERSION_CURRENT,
            nonce: params.nonce,
            physical_blocks,
            logical_blocks,
            slab_size: params.slab_size,
            slab_count: 0,
            root_count: params.root_count,
            tree_height,
            journal_size: params.journal_size,
            index: params.index,
            recovery_count: 0,
            clean: true,
            journal_start: 1,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            index_newest_closed: u64::MAX,
        };
        let depot_origin = this.depot_origin().0;
        let remaining = physical_blocks
            .checked_sub(depot_origin)
            .ok_or_else(|| VoptError::BadConfiguration("device too small".to_owned()))?;
        let slab_count = remaining / params.slab_size;
        if slab_count == 0 {
            return Err(VoptError::BadConfiguration(format!(
                "no room for any slab in {physical_blocks} blocks"
            )));
        }
        this.slab_count = u32::try_from(slab_count)
            .map_err(|_| VoptError::BadConfiguration("slab count overflow".to_owned()))?;
        Ok(this)
    }

    // Regions, in on-device order.

    #[must_use]
    pub fn summary_origin(&self) -> Pbn {
        Pbn(1)
    }

    #[must_use]
    pub fn summary_blocks(&self) -> u64 {
        // Sized for the slab count ceiling the device could ever hold.
        let max_slabs = self.physical_blocks / self.slab_size.max(1) + 1;
        (max_slabs * 4).div_ceil(BLOCK_SIZE as u64)
    }

    #[must_use]
    pub fn journal_origin(&self) -> Pbn {
        Pbn(self.summary_origin().0 + self.summary_blocks())
    }

    #[must_use]
    pub fn block_map_root_origin(&self) -> Pbn {
        Pbn(self.journal_origin().0 + self.journal_size)
    }

    #[must_use]
    pub fn index_origin(&self) -> Pbn {
        Pbn(self.block_map_root_origin().0 + u64::from(self.root_count))
    }

    #[must_use]
    pub fn index_blocks(&self) -> u64 {
        vopt_index::Volume::region_blocks(&self.index)
    }

    #[must_use]
    pub fn depot_origin(&self) -> Pbn {
        Pbn(self.index_origin().0 + self.index_blocks())
    }

    // Component configurations derived from the layout.

    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            origin: self.journal_origin(),
            size: self.journal_size,
            nonce: self.nonce,
            entries_per_block: RECOVERY_JOURNAL_ENTRIES_PER_BLOCK,
        }
    }

    pub fn depot_config(&self) -> Result<DepotConfig> {
        let (data_blocks, ref_count_blocks, journal_blocks) =
            DepotConfig::partition_slab(self.slab_size)?;
        Ok(DepotConfig {
            origin: self.depot_origin(),
            slab_count: self.slab_count,
            slab_size: self.slab_size,
            data_blocks,
            ref_count_blocks,
            journal_blocks,
            summary_origin: self.summary_origin(),
            nonce: self.nonce,
            physical_zones: 1, // overwritten by the engine's zone config
        })
    }

    pub fn depot_config_for(&self, threads: &ThreadCountConfig) -> Result<DepotConfig> {
        let mut config = self.depot_config()?;
        let (_, physical, _) = threads.effective();
        config.physical_zones = physical as u8;
        Ok(config)
    }

    pub fn block_map_geometry(&self) -> BlockMapGeometry {
        BlockMapGeometry {
            root_origin: self.block_map_root_origin(),
            root_count: self.root_count,
            height: self.tree_height,
            logical_blocks: self.logical_blocks,
            nonce: self.nonce,
        }
    }

    /// Serialize to one block.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&SUPER_MAGIC.to_le_bytes());
        // Payload starts after magic + crc; crc filled last.
        let payload = &mut block[8..];
        payload[0..4].copy_from_slice(&self.version.to_le_bytes());
        payload[4..12].copy_from_slice(&self.nonce.to_le_bytes());
        payload[12..20].copy_from_slice(&self.physical_blocks.to_le_bytes());
        payload[20..28].copy_from_slice(&self.logical_blocks.to_le_bytes());
        payload[28..36].copy_from_slice(&self.slab_size.to_le_bytes());
        payload[36..40].copy_from_slice(&self.slab_count.to_le_bytes());
        payload[40..44].copy_from_slice(&self.root_count.to_le_bytes());
        payload[44..48].copy_from_slice(&self.tree_height.to_le_bytes());
        payload[48..56].copy_from_slice(&self.journal_size.to_le_bytes());
        payload[56..60].copy_from_slice(&self.index.records_per_chapter.to_le_bytes());
        payload[60..68].copy_from_slice(&self.index.chapters.to_le_bytes());
        payload[68..76].copy_from_slice(&self.index.sparse_chapters.to_le_bytes());
        payload[76..80].copy_from_slice(&self.index.zone_count.to_le_bytes());
        payload[80..84].copy_from_slice(&self.index.open_chapter_load_ratio.to_le_bytes());
        payload[84] = self.recovery_count;
        payload[85] = u8::from(self.clean);
        payload[86..94].copy_from_slice(&self.journal_start.to_le_bytes());
        payload[94..102].copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        payload[102..110].copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        payload[110..118].copy_from_slice(&self.index_newest_closed.to_le_bytes());
        let crc = crc32c::crc32c(&block[8..]);
        block[4..8].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// Deserialize, validating magic, checksum, and version bounds.
    pub fn unpack(block: &[u8]) -> Result<Self> {
        if block.len() != BLOCK_SIZE {
            return Err(VoptError::InvalidArgument(
                "super block is not one block".to_owned(),
            ));
        }
        let magic = u32::from_le_bytes(block[0..4].try_into().expect("4 bytes"));
        if magic != SUPER_MAGIC {
            return Err(VoptError::BadState("no super block found".to_owned()));
        }
        let stored_crc = u32::from_le_bytes(block[4..8].try_into().expect("4 bytes"));
        let computed = crc32c::crc32c(&block[8..]);
        if stored_crc != computed {
            return Err(VoptError::BadState(format!(
                "super block checksum {computed:#x} does not match stored {stored_crc:#x}"
            )));
        }
        let payload = &block[8..];
        let version = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
        if !(SUPER_VERSION_MINIMUM..=SUPER_VERSION_MAXIMUM).contains(&version) {
            return Err(VoptError::UnsupportedVersion {
                found: version,
                min: SUPER_VERSION_MINIMUM,
                max: SUPER_VERSION_MAXIMUM,
            });
        }
        let u64_at = |offset: usize| {
            u64::from_le_bytes(payload[offset..offset + 8].try_into().expect("8 bytes"))
        };
        let u32_at = |offset: usize| {
            u32::from_le_bytes(payload[offset..offset + 4].try_into().expect("4 bytes"))
        };
        Ok(Self {
            version,
            nonce: u64_at(4),
            physical_blocks: u64_at(12),
            logical_blocks: u64_at(20),
            slab_size: u64_at(28),
            slab_count: u32_at(36),
            root_count: u32_at(40),
            tree_height: u32_at(44),
            journal_size: u64_at(48),
            index: IndexGeometry {
                records_per_chapter: u32_at(56),
                chapters: u64_at(60),
                sparse_chapters: u64_at(68),
                zone_count: u32_at(76),
                open_chapter_load_ratio: u32_at(80),
            },
            recovery_count: payload[84],
            clean: payload[85] != 0,
            journal_start: u64_at(86),
            logical_blocks_used: u64_at(94),
            block_map_data_blocks: u64_at(102),
            index_newest_closed: u64_at(110),
        })
    }

    pub fn write(&self, device: &Arc<dyn BlockIo>) -> Result<()> {
        device.write_block(IoPriority::Metadata, Pbn(0), &self.pack())?;
        device.flush()
    }

    pub fn read(device: &Arc<dyn BlockIo>) -> Result<Self> {
        let block = device.read_block(IoPriority::Metadata, Pbn(0))?;
        Self::unpack(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_block::RamDevice;

    fn small_params() -> FormatParams {
        FormatParams {
            slab_size: 64,
            root_count: 2,
            journal_size: 8,
            index: IndexGeometry {
                records_per_chapter: 8,
                chapters: 4,
                sparse_chapters: 1,
                zone_count: 1,
                open_chapter_load_ratio: 4,
            },
            nonce: 0x1111,
        }
    }

    #[test]
    fn format_lays_out_disjoint_regions() {
        let sb = SuperBlock::format(4096, 2000, &small_params()).unwrap();
        assert!(sb.summary_origin().0 > 0);
        assert!(sb.journal_origin().0 > sb.summary_origin().0);
        assert!(sb.block_map_root_origin().0 >= sb.journal_origin().0 + sb.journal_size);
        assert!(sb.index_origin().0 >= sb.block_map_root_origin().0 + u64::from(sb.root_count));
        assert!(sb.depot_origin().0 >= sb.index_origin().0 + sb.index_blocks());
        assert!(sb.slab_count > 0);
        let depot = sb.depot_config().unwrap();
        assert!(depot.end().0 <= 4096);
    }

    #[test]
    fn pack_unpack_round_trip() {
        let mut sb = SuperBlock::format(4096, 2000, &small_params()).unwrap();
        sb.recovery_count = 3;
        sb.clean = false;
        sb.logical_blocks_used = 777;
        let restored = SuperBlock::unpack(&sb.pack()).unwrap();
        assert_eq!(restored.nonce, sb.nonce);
        assert_eq!(restored.slab_count, sb.slab_count);
        assert_eq!(restored.recovery_count, 3);
        assert!(!restored.clean);
        assert_eq!(restored.logical_blocks_used, 777);
        assert_eq!(restored.index.records_per_chapter, 8);
        assert_eq!(restored.tree_height, sb.tree_height);
    }

    #[test]
    fn version_bounds_are_enforced() {
        let sb = SuperBlock::format(4096, 2000, &small_params()).unwrap();
        for version in [1u32, 3, 7] {
            let mut test = sb;
            test.version = version;
            assert!(SuperBlock::unpack(&test.pack()).is_ok(), "version {version}");
        }
        for version in [0u32, 8] {
            let mut test = sb;
            test.version = version;
            assert!(
                matches!(
                    SuperBlock::unpack(&test.pack()),
                    Err(VoptError::UnsupportedVersion { .. })
                ),
                "version {version}"
            );
        }
    }

    #[test]
    fn corruption_is_detected() {
        let sb = SuperBlock::format(4096, 2000, &small_params()).unwrap();
        let mut block = sb.pack();
        block[100] ^= 0xff;
        assert!(SuperBlock::unpack(&block).is_err());
        assert!(SuperBlock::unpack(&vec![0u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn device_round_trip() {
        let device: Arc<dyn BlockIo> = RamDevice::new(4096);
        let sb = SuperBlock::format(4096, 2000, &small_params()).unwrap();
        sb.write(&device).unwrap();
        let read = SuperBlock::read(&device).unwrap();
        assert_eq!(read.nonce, sb.nonce);
    }
}
