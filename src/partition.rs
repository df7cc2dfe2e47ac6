//! Partition View (spec §4.6): a `BlockDevice` that wraps a parent
//! device, translating LBAs by a fixed offset and enforcing its own
//! in-flight ceiling independent of (but bounded by) the parent's slot
//! pool. Grounded in the division of concerns in
//! `examples/RedHatOnTop-kernel-performed-illegal-operation/kernel/src/drivers/storage/partition.rs`
//! (which parses GPT/MBR tables — out of scope here, spec §1) without
//! that table-parsing responsibility: this module only implements the
//! resulting view once a caller supplies the starting LBA and extent.

use crate::block::{BlockDevice, BlockSegment, IoCallback, IoDirection, SectorRange};
use crate::dma::{DataspaceHandle, Direction};
use crate::error::{DriverError, DriverResult};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

/// How a partition's in-flight ceiling is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightCeiling {
    Absolute(u32),
    /// `parent_max_in_flight - n`, clamped to zero.
    RelativeToParent(u32),
}

/// A bounded view over a parent device: `[starting_lba, starting_lba +
/// sector_count)`.
pub struct Partition {
    id: u32,
    parent: Arc<dyn BlockDevice>,
    starting_lba: u64,
    sector_count: u64,
    ceiling: InFlightCeiling,
    in_flight: Arc<AtomicU32>,
    read_only: bool,
}

impl core::fmt::Debug for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("starting_lba", &self.starting_lba)
            .field("sector_count", &self.sector_count)
            .field("ceiling", &self.ceiling)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Partition {
    pub fn new(
        id: u32,
        parent: Arc<dyn BlockDevice>,
        starting_lba: u64,
        sector_count: u64,
        ceiling: InFlightCeiling,
        read_only: bool,
    ) -> DriverResult<Self> {
        let end = starting_lba.checked_add(sector_count).ok_or(DriverError::InvalidArgument)?;
        if end > parent.capacity() {
            return Err(DriverError::InvalidArgument);
        }
        Ok(Self {
            id,
            parent,
            starting_lba,
            sector_count,
            ceiling,
            in_flight: Arc::new(AtomicU32::new(0)),
            read_only,
        })
    }

    pub fn max_in_flight_ceiling(&self) -> u32 {
        match self.ceiling {
            InFlightCeiling::Absolute(n) => n,
            InFlightCeiling::RelativeToParent(n) => self.parent.max_in_flight().saturating_sub(n),
        }
    }

    fn enter(&self) -> DriverResult<()> {
        let ceiling = self.max_in_flight_ceiling();
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current >= ceiling {
                return Err(DriverError::Busy);
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn validate_range(&self, start_lba: u64, sectors: u64) -> DriverResult<()> {
        let end = start_lba.checked_add(sectors).ok_or(DriverError::InvalidArgument)?;
        if end > self.sector_count {
            return Err(DriverError::InvalidArgument);
        }
        Ok(())
    }
}

impl BlockDevice for Partition {
    fn capacity(&self) -> u64 {
        self.sector_count
    }

    fn sector_size(&self) -> u32 {
        self.parent.sector_size()
    }

    fn max_segments(&self) -> usize {
        self.parent.max_segments()
    }

    fn max_in_flight(&self) -> u32 {
        self.max_in_flight_ceiling()
    }

    fn is_read_only(&self) -> bool {
        self.read_only || self.parent.is_read_only()
    }

    fn match_hid(&self, id: &[u8]) -> bool {
        id == self.id.to_le_bytes()
    }

    fn read_write(
        &self,
        start_lba: u64,
        segments: &[BlockSegment],
        direction: IoDirection,
        callback: IoCallback,
    ) -> DriverResult<()> {
        if direction == IoDirection::Write && self.is_read_only() {
            return Err(DriverError::InvalidArgument);
        }
        let sectors: u64 = segments
            .iter()
            .map(|s| s.sector_count as u64)
            .sum();
        self.validate_range(start_lba, sectors)?;
        self.enter()?;

        let in_flight = self.in_flight.clone();
        let guarded_callback: IoCallback = alloc::boxed::Box::new(move |result| {
            in_flight.fetch_sub(1, Ordering::AcqRel);
            callback(result);
        });

        let translated_lba = self.starting_lba + start_lba;
        let result = self.parent.read_write(translated_lba, segments, direction, guarded_callback);
        if result.is_err() {
            self.leave();
        }
        result
    }

    fn flush(&self, callback: IoCallback) -> DriverResult<()> {
        self.parent.flush(callback)
    }

    fn discard(&self, range: SectorRange, callback: IoCallback) -> DriverResult<()> {
        if self.is_read_only() {
            return Err(DriverError::InvalidArgument);
        }
        self.validate_range(range.start_lba, range.sector_count as u64)?;
        let translated = SectorRange {
            start_lba: self.starting_lba + range.start_lba,
            sector_count: range.sector_count,
        };
        self.parent.discard(translated, callback)
    }

    fn dma_map(&self, region: DataspaceHandle, offset: usize, length: usize, direction: Direction) -> DriverResult<u64> {
        self.parent.dma_map(region, offset, length, direction)
    }

    fn dma_unmap(&self, bus_addr: u64, length: usize, direction: Direction) {
        self.parent.dma_unmap(bus_addr, length, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct FakeParent {
        capacity: u64,
        max_in_flight: u32,
        accepted: Mutex<Vec<u64>>,
    }

    impl BlockDevice for FakeParent {
        fn capacity(&self) -> u64 {
            self.capacity
        }
        fn sector_size(&self) -> u32 {
            512
        }
        fn max_segments(&self) -> usize {
            16
        }
        fn max_in_flight(&self) -> u32 {
            self.max_in_flight
        }
        fn is_read_only(&self) -> bool {
            false
        }
        fn match_hid(&self, _id: &[u8]) -> bool {
            false
        }
        fn read_write(&self, start_lba: u64, _segments: &[BlockSegment], _direction: IoDirection, callback: IoCallback) -> DriverResult<()> {
            self.accepted.lock().push(start_lba);
            callback(Ok(512));
            Ok(())
        }
        fn flush(&self, callback: IoCallback) -> DriverResult<()> {
            callback(Ok(0));
            Ok(())
        }
        fn discard(&self, _range: SectorRange, callback: IoCallback) -> DriverResult<()> {
            callback(Ok(0));
            Ok(())
        }
        fn dma_map(&self, _region: DataspaceHandle, _offset: usize, _length: usize, _direction: Direction) -> DriverResult<u64> {
            Ok(0x1000)
        }
        fn dma_unmap(&self, _bus_addr: u64, _length: usize, _direction: Direction) {}
    }

    #[test]
    fn read_write_translates_lba_by_starting_offset() {
        let parent = Arc::new(FakeParent { capacity: 1000, max_in_flight: 8, accepted: Mutex::new(Vec::new()) });
        let part = Partition::new(1, parent.clone(), 100, 50, InFlightCeiling::Absolute(4), false).unwrap();
        part.read_write(5, &[BlockSegment { bus_addr: 0, sector_count: 1 }], IoDirection::Read, Box::new(|_| {}))
            .unwrap();
        assert_eq!(parent.accepted.lock().as_slice(), &[105]);
    }

    #[test]
    fn out_of_range_request_rejected_before_reaching_parent() {
        let parent = Arc::new(FakeParent { capacity: 1000, max_in_flight: 8, accepted: Mutex::new(Vec::new()) });
        let part = Partition::new(1, parent.clone(), 100, 50, InFlightCeiling::Absolute(4), false).unwrap();
        let err = part
            .read_write(48, &[BlockSegment { bus_addr: 0, sector_count: 4 }], IoDirection::Read, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, DriverError::InvalidArgument);
        assert!(parent.accepted.lock().is_empty());
    }

    #[test]
    fn construction_rejects_partition_exceeding_parent_capacity() {
        let parent = Arc::new(FakeParent { capacity: 100, max_in_flight: 8, accepted: Mutex::new(Vec::new()) });
        let err = Partition::new(1, parent, 90, 50, InFlightCeiling::Absolute(4), false).unwrap_err();
        assert_eq!(err, DriverError::InvalidArgument);
    }

    #[test]
    fn relative_ceiling_is_parent_max_minus_n() {
        let parent = Arc::new(FakeParent { capacity: 1000, max_in_flight: 32, accepted: Mutex::new(Vec::new()) });
        let part = Partition::new(1, parent, 0, 100, InFlightCeiling::RelativeToParent(24), false).unwrap();
        assert_eq!(part.max_in_flight_ceiling(), 8);
    }

    #[test]
    fn ceiling_of_eight_of_parent_max_thirty_two_rejects_the_ninth_request() {
        // Literal end-to-end scenario: a partition ceiling of 8 against a
        // parent slot pool of 32 must reject the 9th concurrent request
        // with Busy while the first 8 are accepted.
        struct SlowParent {
            accepted: Mutex<Vec<IoCallback>>,
        }
        impl BlockDevice for SlowParent {
            fn capacity(&self) -> u64 { 10_000 }
            fn sector_size(&self) -> u32 { 512 }
            fn max_segments(&self) -> usize { 16 }
            fn max_in_flight(&self) -> u32 { 32 }
            fn is_read_only(&self) -> bool { false }
            fn match_hid(&self, _id: &[u8]) -> bool { false }
            fn read_write(&self, _start_lba: u64, _segments: &[BlockSegment], _direction: IoDirection, callback: IoCallback) -> DriverResult<()> {
                self.accepted.lock().push(callback);
                Ok(())
            }
            fn flush(&self, callback: IoCallback) -> DriverResult<()> { callback(Ok(0)); Ok(()) }
            fn discard(&self, _range: SectorRange, callback: IoCallback) -> DriverResult<()> { callback(Ok(0)); Ok(()) }
            fn dma_map(&self, _r: DataspaceHandle, _o: usize, _l: usize, _d: Direction) -> DriverResult<u64> { Ok(0) }
            fn dma_unmap(&self, _b: u64, _l: usize, _d: Direction) {}
        }

        let parent = Arc::new(SlowParent { accepted: Mutex::new(Vec::new()) });
        let part = Partition::new(1, parent.clone(), 0, 10_000, InFlightCeiling::Absolute(8), false).unwrap();

        for _ in 0..8 {
            part.read_write(0, &[BlockSegment { bus_addr: 0, sector_count: 1 }], IoDirection::Read, Box::new(|_| {}))
                .unwrap();
        }
        let err = part
            .read_write(0, &[BlockSegment { bus_addr: 0, sector_count: 1 }], IoDirection::Read, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, DriverError::Busy);

        // Completing one in-flight request frees a slot for the next.
        let cb = parent.accepted.lock().remove(0);
        cb(Ok(512));
        part.read_write(0, &[BlockSegment { bus_addr: 0, sector_count: 1 }], IoDirection::Read, Box::new(|_| {}))
            .unwrap();
    }
}
