//! Client protocol (spec §6): the interface every physical device or
//! [`crate::partition::Partition`] presents to its caller, generalizing
//! the synchronous `BlockDevice` trait of
//! `examples/RedHatOnTop-kernel-performed-illegal-operation/kernel/src/drivers/storage/mod.rs`
//! into the callback-based contract a cooperative, non-blocking driver
//! core requires — a command is accepted or rejected synchronously, and
//! its outcome is delivered later through the callback the caller
//! supplied (spec §4.3, §4.4, §5).

use crate::dma::{DataspaceHandle, Direction};
use crate::error::DriverResult;
use alloc::boxed::Box;

/// Direction of a block I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One scatter-gather segment of a block request: a bus address and a
/// sector count, interpreted against the device's sector size.
#[derive(Debug, Clone, Copy)]
pub struct BlockSegment {
    pub bus_addr: u64,
    pub sector_count: u32,
}

/// Fired exactly once with the outcome of a request: the number of bytes
/// transferred on success, or the error that ended it.
pub type IoCallback = Box<dyn FnOnce(DriverResult<u32>) + Send>;

/// A logical range of sectors to deallocate (discard / write-zeroes).
#[derive(Debug, Clone, Copy)]
pub struct SectorRange {
    pub start_lba: u64,
    pub sector_count: u32,
}

/// The protocol every exposed block device — physical or
/// [`crate::partition::Partition`] — implements (spec §6).
pub trait BlockDevice: Send + Sync {
    /// Total addressable sectors.
    fn capacity(&self) -> u64;

    /// Bytes per sector.
    fn sector_size(&self) -> u32;

    /// Maximum scatter-gather segments a single request may carry.
    fn max_segments(&self) -> usize;

    /// Maximum number of requests this device will accept concurrently
    /// before returning `Busy`.
    fn max_in_flight(&self) -> u32;

    fn is_read_only(&self) -> bool;

    /// Whether this device matches a client-supplied handle (a UUID, a
    /// partition id, or similar opaque identity the external binding
    /// configuration names it by).
    fn match_hid(&self, id: &[u8]) -> bool;

    /// Submit a read or write. Validated synchronously: sector range
    /// must lie within capacity, segment count must not exceed
    /// `max_segments()`. On successful acceptance the callback fires
    /// exactly once, on completion or abort.
    fn read_write(
        &self,
        start_lba: u64,
        segments: &[BlockSegment],
        direction: IoDirection,
        callback: IoCallback,
    ) -> DriverResult<()>;

    /// Flush any device-side write cache.
    fn flush(&self, callback: IoCallback) -> DriverResult<()>;

    /// Deallocate (TRIM / Write Zeroes with deallocate) a sector range.
    fn discard(&self, range: SectorRange, callback: IoCallback) -> DriverResult<()>;

    /// Map a client-owned dataspace range into this device's DMA domain,
    /// returning the bus address segments to hand to `read_write`.
    fn dma_map(
        &self,
        region: DataspaceHandle,
        offset: usize,
        length: usize,
        direction: Direction,
    ) -> DriverResult<u64>;

    /// Tear down a mapping previously returned by `dma_map`.
    fn dma_unmap(&self, bus_addr: u64, length: usize, direction: Direction);
}
