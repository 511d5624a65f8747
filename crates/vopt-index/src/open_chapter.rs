//! One zone's shard of the open chapter.
//!
//! A records array of `capacity + 1` slots (record number zero is the
//! empty sentinel) fronted by a power-of-two hash slot table probed
//! quadratically (steps 1, 2, 3, …), which is exhaustive for power-of-two
//! table sizes. Removal tombstones the record: probe chains skip it, but
//! the slot is not reused until the chapter closes.

use vopt_error::{Result, VoptError};
use vopt_types::{ChunkName, DataLocation};

/// One buffered fingerprint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenChapterRecord {
    pub name: ChunkName,
    pub advice: DataLocation,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Index into `records`; zero means empty.
    record_number: u32,
    deleted: bool,
}

/// A zone's open chapter shard.
#[derive(Debug)]
pub struct OpenChapterZone {
    slots: Vec<Slot>,
    records: Vec<Option<OpenChapterRecord>>,
    capacity: u32,
    size: u32,
    deleted: u32,
}

impl OpenChapterZone {
    /// `capacity` records, with a slot table of the next power of two at
    /// or above `capacity * load_ratio`.
    #[must_use]
    pub fn new(capacity: u32, load_ratio: u32) -> Self {
        let slot_count = ((capacity * load_ratio).max(2) as usize).next_power_of_two();
        Self {
            slots: vec![Slot::default(); slot_count],
            records: vec![None; capacity as usize + 1],
            capacity,
            size: 0,
            deleted: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Live records (deletions excluded).
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.size - self.deleted
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.size
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    /// Quadratic probe for `name`. Returns the slot index probed last and
    /// the live record found, if any.
    fn probe(&self, name: &ChunkName) -> (usize, Option<u32>) {
        let slot_count = self.slots.len();
        let mut probe = name.hash_slot(slot_count);
        let mut attempts = 1usize;
        loop {
            let slot = self.slots[probe];
            if slot.record_number == 0 {
                // End of the chain: not present.
                return (probe, None);
            }
            if !slot.deleted {
                if let Some(record) = &self.records[slot.record_number as usize] {
                    if record.name == *name {
                        return (probe, Some(slot.record_number));
                    }
                }
            }
            probe = (probe + attempts) % slot_count;
            attempts += 1;
        }
    }

    /// Look up the advice stored for `name`.
    #[must_use]
    pub fn search(&self, name: &ChunkName) -> Option<DataLocation> {
        let (_, found) = self.probe(name);
        found.and_then(|number| self.records[number as usize].map(|r| r.advice))
    }

    /// Insert or update. Returns the remaining capacity. A new name in a
    /// full shard fails with `VolumeOverflow`; updating an existing name
    /// always succeeds.
    pub fn put(&mut self, name: ChunkName, advice: DataLocation) -> Result<u32> {
        let (slot, found) = self.probe(&name);
        if let Some(number) = found {
            self.records[number as usize] = Some(OpenChapterRecord { name, advice });
            return Ok(self.remaining());
        }
        if self.is_full() {
            return Err(VoptError::VolumeOverflow);
        }
        self.size += 1;
        let number = self.size;
        self.slots[slot].record_number = number;
        self.slots[slot].deleted = false;
        self.records[number as usize] = Some(OpenChapterRecord { name, advice });
        Ok(self.remaining())
    }

    /// Tombstone `name`. Returns whether it was present.
    pub fn remove(&mut self, name: &ChunkName) -> bool {
        let (slot, found) = self.probe(name);
        let Some(number) = found else {
            return false;
        };
        self.slots[slot].deleted = true;
        self.records[number as usize] = None;
        self.deleted += 1;
        debug_assert!(self.slots[slot].record_number == number);
        true
    }

    /// Drain the live records for chapter close, leaving the shard empty.
    pub fn close(&mut self) -> Vec<OpenChapterRecord> {
        let records = self
            .records
            .iter()
            .skip(1)
            .filter_map(|r| *r)
            .collect();
        self.reset();
        records
    }

    /// Clear every slot and record.
    pub fn reset(&mut self) {
        self.slots.fill(Slot::default());
        self.records.fill(None);
        self.size = 0;
        self.deleted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vopt_types::{MappingState, Pbn, CHUNK_NAME_SIZE};

    fn name(seed: u8) -> ChunkName {
        let mut bytes = [0u8; CHUNK_NAME_SIZE];
        bytes[0] = seed;
        bytes[8] = seed.wrapping_mul(31);
        bytes[15] = seed ^ 0x5a;
        ChunkName(bytes)
    }

    fn advice(pbn: u64) -> DataLocation {
        DataLocation::new(Pbn(pbn), MappingState::Uncompressed)
    }

    #[test]
    fn put_then_search_returns_the_advice() {
        let mut zone = OpenChapterZone::new(4, 4);
        zone.put(name(1), advice(10)).unwrap();
        assert_eq!(zone.search(&name(1)), Some(advice(10)));
        assert_eq!(zone.search(&name(2)), None);
    }

    #[test]
    fn put_updates_in_place() {
        let mut zone = OpenChapterZone::new(2, 4);
        zone.put(name(1), advice(10)).unwrap();
        let remaining = zone.put(name(1), advice(20)).unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(zone.search(&name(1)), Some(advice(20)));
        assert_eq!(zone.record_count(), 1);
    }

    #[test]
    fn overflow_only_for_new_names() {
        let mut zone = OpenChapterZone::new(2, 4);
        zone.put(name(1), advice(1)).unwrap();
        let remaining = zone.put(name(2), advice(2)).unwrap();
        assert_eq!(remaining, 0);
        assert!(matches!(
            zone.put(name(3), advice(3)),
            Err(VoptError::VolumeOverflow)
        ));
        // Updating an existing name still succeeds at capacity.
        zone.put(name(2), advice(22)).unwrap();
        assert_eq!(zone.search(&name(2)), Some(advice(22)));
    }

    #[test]
    fn remove_tombstones_until_close() {
        let mut zone = OpenChapterZone::new(4, 4);
        zone.put(name(1), advice(1)).unwrap();
        zone.put(name(2), advice(2)).unwrap();
        assert!(zone.remove(&name(1)));
        assert!(!zone.remove(&name(1)));
        assert_eq!(zone.search(&name(1)), None);
        assert_eq!(zone.search(&name(2)), Some(advice(2)));
        assert_eq!(zone.record_count(), 1);
        // The tombstoned slot is not reused before close: size is still 2.
        assert_eq!(zone.remaining(), 2);
        let records = zone.close();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, name(2));
        assert_eq!(zone.record_count(), 0);
    }

    #[test]
    fn quadratic_probing_fills_a_power_of_two_table() {
        // Capacity 8 with load ratio 2 gives a 16-slot table; inserting
        // 8 distinct names must always succeed regardless of clustering.
        let mut zone = OpenChapterZone::new(8, 2);
        for seed in 0..8 {
            zone.put(name(seed), advice(u64::from(seed))).unwrap();
        }
        for seed in 0..8 {
            assert_eq!(zone.search(&name(seed)), Some(advice(u64::from(seed))));
        }
        assert!(zone.is_full());
    }
}
