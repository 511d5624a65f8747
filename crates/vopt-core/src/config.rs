//! Device configuration: thread counts and the device-table line.
//!
//! The table line is `V<n> <parent> <physical_blocks> <logical_block_size>
//! <cache_size> <block_map_maximum_age> [<key=value>…|.]`. Zone counts must
//! be all zero (one thread services everything) or all nonzero.

use std::time::Duration;
use vopt_error::{Result, VoptError};

pub const MAX_LOGICAL_ZONES: u32 = 60;
pub const MAX_PHYSICAL_ZONES: u32 = 16;
pub const MAX_HASH_ZONES: u32 = 100;

/// Counts of the worker threads and zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCountConfig {
    pub logical_zones: u32,
    pub physical_zones: u32,
    pub hash_zones: u32,
    pub bio_threads: u32,
    pub bio_ack_threads: u32,
    pub cpu_threads: u32,
    pub bio_rotation_interval: u32,
}

impl Default for ThreadCountConfig {
    fn default() -> Self {
        Self {
            logical_zones: 1,
            physical_zones: 1,
            hash_zones: 1,
            bio_threads: 4,
            bio_ack_threads: 1,
            cpu_threads: 1,
            bio_rotation_interval: 64,
        }
    }
}

impl ThreadCountConfig {
    pub fn validate(&self) -> Result<()> {
        let zones = [self.logical_zones, self.physical_zones, self.hash_zones];
        let all_zero = zones.iter().all(|&z| z == 0);
        let all_nonzero = zones.iter().all(|&z| z > 0);
        if !all_zero && !all_nonzero {
            return Err(VoptError::BadConfiguration(
                "logical, physical, and hash zone counts must be all zero or all nonzero"
                    .to_owned(),
            ));
        }
        if self.logical_zones > MAX_LOGICAL_ZONES {
            return Err(VoptError::BadConfiguration(format!(
                "logical zones {} > {MAX_LOGICAL_ZONES}",
                self.logical_zones
            )));
        }
        if self.physical_zones > MAX_PHYSICAL_ZONES {
            return Err(VoptError::BadConfiguration(format!(
                "physical zones {} > {MAX_PHYSICAL_ZONES}",
                self.physical_zones
            )));
        }
        if self.hash_zones > MAX_HASH_ZONES {
            return Err(VoptError::BadConfiguration(format!(
                "hash zones {} > {MAX_HASH_ZONES}",
                self.hash_zones
            )));
        }
        if self.cpu_threads == 0 {
            return Err(VoptError::BadConfiguration("cpu threads must be >= 1".to_owned()));
        }
        if self.bio_threads == 0 {
            return Err(VoptError::BadConfiguration("bio threads must be >= 1".to_owned()));
        }
        if !(1..=1024).contains(&self.bio_rotation_interval) {
            return Err(VoptError::BadConfiguration(format!(
                "bioRotationInterval {} outside 1..=1024",
                self.bio_rotation_interval
            )));
        }
        Ok(())
    }

    /// Effective zone counts: the all-zero small-device configuration
    /// collapses to one of each.
    #[must_use]
    pub fn effective(&self) -> (usize, usize, usize) {
        if self.logical_zones == 0 {
            (1, 1, 1)
        } else {
            (
                self.logical_zones as usize,
                self.physical_zones as usize,
                self.hash_zones as usize,
            )
        }
    }
}

/// Parsed device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub version: u32,
    pub parent_device: String,
    pub physical_blocks: u64,
    pub logical_block_size: u32,
    /// Block map page cache size, in pages per logical zone.
    pub cache_size: u64,
    /// Eras a block map page may stay dirty before writeback.
    pub block_map_maximum_age: u64,
    pub max_discard_blocks: u32,
    pub deduplication: bool,
    pub compression: bool,
    pub threads: ThreadCountConfig,
    pub dedupe_timeout: Duration,
}

pub const DEFAULT_DEDUPE_TIMEOUT_MS: u64 = 5000;

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| VoptError::BadConfiguration(format!("bad {what}: {value:?}")))
}

impl DeviceConfig {
    /// Parse a device-table line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let version_word = words
            .next()
            .ok_or_else(|| VoptError::BadConfiguration("empty table line".to_owned()))?;
        let version: u32 = version_word
            .strip_prefix('V')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                VoptError::BadConfiguration(format!("bad version word {version_word:?}"))
            })?;
        if !(1..=4).contains(&version) {
            return Err(VoptError::BadConfiguration(format!(
                "unsupported table version {version}"
            )));
        }
        let parent_device = words
            .next()
            .ok_or_else(|| VoptError::BadConfiguration("missing parent device".to_owned()))?
            .to_owned();
        let physical_blocks: u64 = parse_number(
            words.next().ok_or_else(|| {
                VoptError::BadConfiguration("missing physical block count".to_owned())
            })?,
            "physical block count",
        )?;
        let logical_block_size: u32 = parse_number(
            words.next().ok_or_else(|| {
                VoptError::BadConfiguration("missing logical block size".to_owned())
            })?,
            "logical block size",
        )?;
        if logical_block_size != 512 && logical_block_size != 4096 {
            return Err(VoptError::BadConfiguration(format!(
                "logical block size {logical_block_size} is not 512 or 4096"
            )));
        }
        let cache_size: u64 = parse_number(
            words
                .next()
                .ok_or_else(|| VoptError::BadConfiguration("missing cache size".to_owned()))?,
            "cache size",
        )?;
        let block_map_maximum_age: u64 = parse_number(
            words.next().ok_or_else(|| {
                VoptError::BadConfiguration("missing block map maximum age".to_owned())
            })?,
            "block map maximum age",
        )?;

        let mut config = Self {
            version,
            parent_device,
            physical_blocks,
            logical_block_size,
            cache_size,
            block_map_maximum_age,
            max_discard_blocks: 1,
            deduplication: true,
            compression: false,
            threads: ThreadCountConfig::default(),
            dedupe_timeout: Duration::from_millis(DEFAULT_DEDUPE_TIMEOUT_MS),
        };

        let mut explicit_zones = (None, None, None);
        for word in words {
            if word == "." {
                break;
            }
            let (key, value) = word.split_once('=').ok_or_else(|| {
                VoptError::BadConfiguration(format!("optional argument {word:?} is not key=value"))
            })?;
            match key {
                "maxDiscard" => {
                    let blocks: u32 = parse_number(value, "maxDiscard")?;
                    if blocks == 0 || blocks > u32::MAX / 4096 {
                        return Err(VoptError::BadConfiguration(format!(
                            "maxDiscard {blocks} out of range"
                        )));
                    }
                    config.max_discard_blocks = blocks;
                }
                "deduplication" => {
                    config.deduplication = match value {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(VoptError::BadConfiguration(format!(
                                "deduplication must be on or off, got {other:?}"
                            )))
                        }
                    };
                }
                "compression" => {
                    config.compression = match value {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(VoptError::BadConfiguration(format!(
                                "compression must be on or off, got {other:?}"
                            )))
                        }
                    };
                }
                "cpu" => config.threads.cpu_threads = parse_number(value, "cpu")?,
                "ack" => config.threads.bio_ack_threads = parse_number(value, "ack")?,
                "bio" => config.threads.bio_threads = parse_number(value, "bio")?,
                "bioRotationInterval" => {
                    config.threads.bio_rotation_interval =
                        parse_number(value, "bioRotationInterval")?;
                }
                "logical" => explicit_zones.0 = Some(parse_number(value, "logical")?),
                "physical" => explicit_zones.1 = Some(parse_number(value, "physical")?),
                "hash" => explicit_zones.2 = Some(parse_number(value, "hash")?),
                other => {
                    return Err(VoptError::BadConfiguration(format!(
                        "unrecognized key {other:?}"
                    )))
                }
            }
        }
        if let (Some(logical), Some(physical), Some(hash)) = explicit_zones {
            config.threads.logical_zones = logical;
            config.threads.physical_zones = physical;
            config.threads.hash_zones = hash;
        } else if explicit_zones != (None, None, None) {
            return Err(VoptError::BadConfiguration(
                "logical, physical, and hash must be given together".to_owned(),
            ));
        }
        config.threads.validate()?;
        if config.physical_blocks == 0 {
            return Err(VoptError::BadConfiguration(
                "physical block count must be nonzero".to_owned(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_line() {
        let config = DeviceConfig::parse("V4 /dev/sdb1 1048576 4096 128 1024").unwrap();
        assert_eq!(config.parent_device, "/dev/sdb1");
        assert_eq!(config.physical_blocks, 1_048_576);
        assert_eq!(config.cache_size, 128);
        assert_eq!(config.block_map_maximum_age, 1024);
        assert!(config.deduplication);
    }

    #[test]
    fn parses_optional_arguments() {
        let config = DeviceConfig::parse(
            "V4 /dev/sdb1 1048576 512 128 1024 maxDiscard=16 deduplication=off cpu=2 ack=1 bio=3 bioRotationInterval=32 logical=2 physical=2 hash=4",
        )
        .unwrap();
        assert_eq!(config.max_discard_blocks, 16);
        assert!(!config.deduplication);
        assert_eq!(config.threads.cpu_threads, 2);
        assert_eq!(config.threads.logical_zones, 2);
        assert_eq!(config.threads.hash_zones, 4);
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(DeviceConfig::parse("").is_err());
        assert!(DeviceConfig::parse("X4 /dev/sdb1 100 4096 128 16").is_err());
        assert!(DeviceConfig::parse("V9 /dev/sdb1 100 4096 128 16").is_err());
        assert!(DeviceConfig::parse("V4 /dev/sdb1 100 1024 128 16").is_err());
        assert!(DeviceConfig::parse("V4 /dev/sdb1 100 4096 128 16 maxDiscard=0").is_err());
        assert!(DeviceConfig::parse("V4 /dev/sdb1 100 4096 128 16 bogus=1").is_err());
        assert!(DeviceConfig::parse("V4 /dev/sdb1 100 4096 128 16 logical=2").is_err());
        assert!(
            DeviceConfig::parse("V4 /dev/sdb1 100 4096 128 16 logical=0 physical=2 hash=2")
                .is_err()
        );
    }

    #[test]
    fn zone_count_bounds() {
        let mut threads = ThreadCountConfig::default();
        threads.logical_zones = 61;
        assert!(threads.validate().is_err());
        let mut threads = ThreadCountConfig::default();
        threads.physical_zones = 17;
        assert!(threads.validate().is_err());
        let mut threads = ThreadCountConfig {
            logical_zones: 0,
            physical_zones: 0,
            hash_zones: 0,
            ..ThreadCountConfig::default()
        };
        assert!(threads.validate().is_ok());
        assert_eq!(threads.effective(), (1, 1, 1));
        threads.bio_rotation_interval = 2000;
        assert!(threads.validate().is_err());
    }
}
