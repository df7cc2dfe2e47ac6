//! SATA family port/controller state machine (spec §4.5), generalizing
//! the AHCI register layout of
//! `examples/RedHatOnTop-kernel-performed-illegal-operation/kernel/src/drivers/storage/ahci.rs`
//! (`AhciPort`, `FisRegH2D`, `AtaIdentify`) into a typed port driven
//! entirely through [`RegisterWindow`] and the errand scheduler, so the
//! same state machine runs against real MMIO or the in-memory test
//! backend with no other change.

use crate::dma::Direction;
use crate::errand::{Clock, Poll, PollOutcome};
use crate::error::{DriverError, DriverResult};
use crate::register::{RegisterBackend, RegisterWindow};
use crate::ring::ahci::{Callback, Segment, SlotPool, MAX_SG};
use alloc::string::String;
use bitflags::bitflags;

/// Per-port register byte offsets (AHCI 1.3 §3.3).
mod reg {
    pub const CLB: usize = 0x00;
    pub const FB: usize = 0x08;
    pub const IS: usize = 0x10;
    pub const IE: usize = 0x14;
    pub const CMD: usize = 0x18;
    pub const TFD: usize = 0x20;
    pub const SIG: usize = 0x24;
    pub const SSTS: usize = 0x28;
    pub const SCTL: usize = 0x2C;
    pub const SERR: usize = 0x30;
    pub const SACT: usize = 0x34;
    pub const CI: usize = 0x38;
}

bitflags! {
    /// Port command-and-status register bits (AHCI 1.3 §3.3.7).
    struct CmdBits: u32 {
        const ST = 1 << 0;
        const FRE = 1 << 4;
        const FR = 1 << 14;
        const CR = 1 << 15;
    }
}

bitflags! {
    /// Port interrupt-status register bits relevant to the three
    /// `handle_interrupt` branches (spec §4.5).
    struct IsBits: u32 {
        /// Port-connect-change: a device-presence transition.
        const PCS = 1 << 6;
        const IFS = 1 << 27;
        const HBDS = 1 << 28;
        const HBFS = 1 << 29;
        const TFES = 1 << 30;
    }
}

impl IsBits {
    const FATAL: IsBits = IsBits::from_bits_truncate(
        IsBits::IFS.bits() | IsBits::HBDS.bits() | IsBits::HBFS.bits() | IsBits::TFES.bits(),
    );
}

const CMD_ST: u32 = CmdBits::ST.bits();
const CMD_FRE: u32 = CmdBits::FRE.bits();
const CMD_FR: u32 = CmdBits::FR.bits();
const CMD_CR: u32 = CmdBits::CR.bits();
const IS_PCS: u32 = IsBits::PCS.bits();
const IS_FATAL_MASK: u32 = IsBits::FATAL.bits();

/// Device signature values (spec §6).
pub mod signature {
    pub const ATA: u32 = 0x0000_0101;
    pub const ATAPI: u32 = 0xEB14_0101;
    pub const PORT_MULTIPLIER: u32 = 0x9669_0101;
    pub const ENCLOSURE: u32 = 0xC33C_0101;
}

/// ATA command opcodes used to build the Host-to-Device Register FIS
/// (spec §4.3, §6).
pub mod ata_command {
    pub const READ_DMA: u8 = 0xC8;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const FLUSH_CACHE_EXT: u8 = 0xEA;
    pub const DATA_SET_MANAGEMENT: u8 = 0x06;
}

const POLL_INTERVAL_US: u64 = 10;
const POLL_BUDGET_US: u64 = 50_000;

/// Port/controller states (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Undefined,
    Present,
    Initializing,
    Attached,
    Disabled,
    Enabling,
    Disabling,
    Ready,
    Error,
    ReInitializing,
    Fatal,
}

/// Parsed ATA IDENTIFY DEVICE data (spec §4.5 "Identify handshake").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub sector_size: u32,
    pub sector_count: u64,
    pub lba48: bool,
    pub serial: String,
    pub model: String,
    pub firmware: String,
}

/// Byte-swapped ASCII field, as ATA strings store each pair of
/// characters word-swapped (matching `parse_ata_string` in
/// `examples/RedHatOnTop-kernel-performed-illegal-operation/kernel/src/drivers/storage/ahci.rs`).
fn parse_ata_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for chunk in data.chunks(2) {
        if chunk.len() == 2 {
            if chunk[1] != 0 && chunk[1] != b' ' {
                out.push(chunk[1] as char);
            }
            if chunk[0] != 0 && chunk[0] != b' ' {
                out.push(chunk[0] as char);
            }
        }
    }
    out.trim().into()
}

/// Parse a 512-byte IDENTIFY DEVICE page into an [`Identity`].
pub fn parse_identify(data: &[u8]) -> Identity {
    assert!(data.len() >= 512, "IDENTIFY DEVICE page is 512 bytes");
    let word = |w: usize| u16::from_le_bytes([data[w * 2], data[w * 2 + 1]]);

    let serial = parse_ata_string(&data[20..40]);
    let firmware = parse_ata_string(&data[46..54]);
    let model = parse_ata_string(&data[54..94]);

    let lba48 = word(83) & (1 << 10) != 0;
    let sector_count = if lba48 {
        let lo = word(100) as u64 | ((word(101) as u64) << 16);
        let hi = word(102) as u64 | ((word(103) as u64) << 16);
        lo | (hi << 32)
    } else {
        (word(60) as u64) | ((word(61) as u64) << 16)
    };

    Identity {
        sector_size: 512,
        sector_count,
        lba48,
        serial,
        model,
        firmware,
    }
}

/// Encode an LBA48 command's sector count into the hardware field: the
/// full range `1..=65536` is representable in the 16-bit count field by
/// treating `0` as the hardware's sentinel for 65536 sectors (spec §8
/// property 5).
pub fn encode_sector_count(numsec: u32) -> u16 {
    debug_assert!(numsec >= 1 && numsec <= 65_536);
    if numsec == 65_536 {
        0
    } else {
        numsec as u16
    }
}

/// One SATA port, driven by a `RegisterBackend` (real or simulated) and
/// owning a fixed-size command slot pool.
pub struct SataPort<B: RegisterBackend, const N: usize = 32> {
    window: RegisterWindow<B>,
    slots: SlotPool<N>,
    state: PortState,
    identity: Option<Identity>,
    device_max_sectors: u32,
}

impl<B: RegisterBackend, const N: usize> SataPort<B, N> {
    pub fn new(window: RegisterWindow<B>) -> Self {
        Self {
            window,
            slots: SlotPool::new(),
            state: PortState::Undefined,
            identity: None,
            device_max_sectors: u32::MAX,
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn signature(&self) -> u32 {
        self.window.read(reg::SIG)
    }

    /// `Undefined -> Present` if a device is present, else stays
    /// `Undefined` and reports `NoDevice` (spec §4.5).
    pub fn attach(&mut self, device_present: bool) -> DriverResult<()> {
        if !device_present {
            return Err(DriverError::NoDevice);
        }
        self.state = PortState::Present;
        Ok(())
    }

    /// Drain the command engine: clear ST, poll CR clear; clear FRE, poll
    /// FR clear. Shared by `initialize`'s `Present|Error -> Attached`
    /// transition and `disable`'s `Ready -> Disabled` transition (spec
    /// §4.5).
    fn drain_command_engine(&mut self, clock: &dyn Clock, mut advance: impl FnMut()) -> DriverResult<()> {
        self.window.clear_bits(reg::CMD, CMD_ST);
        let cr_clear = {
            let window = &self.window;
            let mut poll = Poll::new(clock, POLL_INTERVAL_US, POLL_BUDGET_US, || {
                window.read(reg::CMD) & CMD_CR == 0
            });
            poll.run_to_completion(clock, &mut advance)
        };
        if cr_clear != PollOutcome::Ready {
            self.state = PortState::Fatal;
            return Err(DriverError::Fatal);
        }
        // Stopping the command list invalidates any still-set command-issue
        // bits; the hardware clears them along with CR.
        self.window.write(reg::CI, 0);

        self.window.clear_bits(reg::CMD, CMD_FRE);
        let fr_clear = {
            let window = &self.window;
            let mut poll = Poll::new(clock, POLL_INTERVAL_US, POLL_BUDGET_US, || {
                window.read(reg::CMD) & CMD_FR == 0
            });
            poll.run_to_completion(clock, &mut advance)
        };
        if fr_clear != PollOutcome::Ready {
            self.state = PortState::Fatal;
            return Err(DriverError::Fatal);
        }
        Ok(())
    }

    /// `Present|Error -> Initializing -> Attached` (spec §4.5).
    pub fn initialize(&mut self, clock: &dyn Clock, advance: impl FnMut()) -> DriverResult<()> {
        if !matches!(self.state, PortState::Present | PortState::Error | PortState::ReInitializing) {
            return Err(DriverError::InvalidArgument);
        }
        self.state = PortState::Initializing;
        self.drain_command_engine(clock, advance)?;
        self.state = PortState::Attached;
        log::debug!("sata port initialized, command engine drained");
        Ok(())
    }

    /// `Attached -> Ready` (memory bases are assumed already programmed
    /// by the caller via `register` writes; spec §4.5 bundles
    /// "initialize_memory" into this step at a layer above register
    /// plumbing).
    pub fn enable(&mut self) -> DriverResult<()> {
        if self.state != PortState::Attached {
            return Err(DriverError::InvalidArgument);
        }
        self.state = PortState::Enabling;
        self.window.set_bits(reg::CMD, CMD_FRE);
        self.window.set_bits(reg::CMD, CMD_ST);
        self.state = PortState::Ready;
        log::debug!("sata port enabled, signature=0x{:08x}", self.signature());
        Ok(())
    }

    /// `Ready -> Disabled`.
    pub fn disable(&mut self, clock: &dyn Clock, advance: impl FnMut()) -> DriverResult<()> {
        if self.state != PortState::Ready {
            return Err(DriverError::InvalidArgument);
        }
        self.state = PortState::Disabling;
        self.drain_command_engine(clock, advance)?;
        self.state = PortState::Disabled;
        Ok(())
    }

    /// Submit a command: validate bounds, reserve a slot, fill its PRDT,
    /// and ring the doorbell (spec §4.5 "Command submission contract").
    pub fn send_command(
        &mut self,
        lba: u64,
        numsec: u32,
        direction: Direction,
        sg_list: &[Segment],
        callback: Callback,
    ) -> DriverResult<usize> {
        if self.state != PortState::Ready {
            return Err(DriverError::InvalidArgument);
        }
        if numsec == 0 || numsec > self.device_max_sectors {
            return Err(DriverError::InvalidArgument);
        }
        let lba48 = self.identity.as_ref().map(|id| id.lba48).unwrap_or(true);
        if lba48 && lba >= (1u64 << 48) {
            return Err(DriverError::InvalidArgument);
        }
        let capacity = self.identity.as_ref().map(|id| id.sector_count).unwrap_or(u64::MAX);
        if lba.checked_add(numsec as u64).map_or(true, |end| end > capacity) {
            return Err(DriverError::InvalidArgument);
        }
        if sg_list.len() > MAX_SG {
            return Err(DriverError::InvalidArgument);
        }

        let slot = self.slots.reserve().ok_or(DriverError::Busy)?;
        let sector_size = self.identity.as_ref().map(|id| id.sector_size).unwrap_or(512);
        let command = match (lba48, direction) {
            (true, Direction::ToDevice) => ata_command::WRITE_DMA_EXT,
            (true, Direction::FromDevice) => ata_command::READ_DMA_EXT,
            (false, Direction::ToDevice) => ata_command::WRITE_DMA,
            (false, Direction::FromDevice) => ata_command::READ_DMA,
        };
        let count = encode_sector_count(numsec);
        self.slots.setup(slot, sector_size, direction, command, lba, count, sg_list, callback)?;
        self.issue(slot);
        Ok(slot)
    }

    /// ATA FLUSH CACHE: no data transfer, just a slot round-trip through
    /// the same completion path as a read/write (spec §6 client protocol
    /// `flush`).
    pub fn flush(&mut self, callback: Callback) -> DriverResult<usize> {
        if self.state != PortState::Ready {
            return Err(DriverError::InvalidArgument);
        }
        let slot = self.slots.reserve().ok_or(DriverError::Busy)?;
        self.slots.setup(slot, 512, Direction::ToDevice, ata_command::FLUSH_CACHE_EXT, 0, 0, &[], callback)?;
        self.issue(slot);
        Ok(slot)
    }

    /// ATA DATA SET MANAGEMENT (TRIM): discard `numsec` sectors starting
    /// at `lba`. The LBA-range payload itself is built by the block
    /// device façade (spec §4.6); this layer only validates the range
    /// against device capacity and round-trips a slot, the same shape as
    /// `send_command` without a data transfer.
    pub fn discard(&mut self, lba: u64, numsec: u32, callback: Callback) -> DriverResult<usize> {
        if self.state != PortState::Ready {
            return Err(DriverError::InvalidArgument);
        }
        let capacity = self.identity.as_ref().map(|id| id.sector_count).unwrap_or(u64::MAX);
        if numsec == 0 || numsec > 65_536 || lba.checked_add(numsec as u64).map_or(true, |end| end > capacity) {
            return Err(DriverError::InvalidArgument);
        }
        let slot = self.slots.reserve().ok_or(DriverError::Busy)?;
        let count = encode_sector_count(numsec);
        self.slots.setup(slot, 512, Direction::ToDevice, ata_command::DATA_SET_MANAGEMENT, lba, count, &[], callback)?;
        self.issue(slot);
        Ok(slot)
    }

    fn issue(&self, slot: usize) {
        // Cache-coherency barrier for the command descriptor and its
        // scatter-gather table precedes the doorbell write (spec §5).
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        self.window.set_bits(reg::CI, 1 << slot);
    }

    /// Record an IDENTIFY DEVICE response once the identify command
    /// completes (spec §4.5 "Identify handshake").
    pub fn accept_identify(&mut self, page: &[u8]) {
        let identity = parse_identify(page);
        self.device_max_sectors = if identity.lba48 { 65_536 } else { 256 };
        self.identity = Some(identity);
    }

    /// Dispatch on the port interrupt-status register (spec §4.5 "Error
    /// handling on interrupt"): device-presence change, fatal/taskfile
    /// error, or ordinary completion.
    pub fn handle_interrupt(&mut self, clock: &dyn Clock, advance: impl FnMut()) -> DriverResult<()> {
        let is_value = self.window.read(reg::IS);
        if is_value == 0 {
            return Ok(());
        }

        if is_value & IS_PCS != 0 {
            self.window.write(reg::IS, is_value);
            self.abort_all();
            self.state = PortState::Error;
            return Err(DriverError::IoError);
        }

        if is_value & IS_FATAL_MASK != 0 {
            self.window.write(reg::IS, is_value);
            let ci = self.window.read(reg::CI);
            let current_tag = (0..N).find(|i| ci & (1 << i) != 0);
            if let Some(tag) = current_tag {
                self.slots.abort(tag);
            }
            let pending_mask = current_tag.map(|tag| ci & !(1 << tag)).unwrap_or(ci);

            self.state = PortState::ReInitializing;
            let reinit = self.initialize(clock, advance).and_then(|_| self.enable());
            match reinit {
                Ok(()) => {
                    if pending_mask != 0 {
                        self.window.set_bits(reg::CI, pending_mask);
                    }
                    Ok(())
                }
                Err(e) => {
                    for i in 0..N {
                        if pending_mask & (1 << i) != 0 {
                            self.slots.abort(i);
                        }
                    }
                    Err(e)
                }
            }
        } else {
            self.window.write(reg::IS, is_value);
            let ci = self.window.read(reg::CI);
            self.slots.scan_completions(ci);
            Ok(())
        }
    }

    fn abort_all(&self) {
        for i in 0..N {
            if self.slots.is_busy(i) {
                self.slots.abort(i);
            }
        }
    }

    pub fn window(&self) -> &RegisterWindow<B> {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::MemoryBackend;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec as AVec;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct FakeClock {
        now: Cell<u64>,
    }
    impl Clock for FakeClock {
        fn now_us(&self) -> u64 {
            self.now.get()
        }
    }

    fn ready_port() -> (SataPort<MemoryBackend, 32>, FakeClock) {
        let window = RegisterWindow::new(MemoryBackend::new(0x48));
        let mut port: SataPort<MemoryBackend, 32> = SataPort::new(window);
        let clock = FakeClock { now: Cell::new(0) };
        port.attach(true).unwrap();
        port.initialize(&clock, || clock.now.set(clock.now.get() + POLL_INTERVAL_US)).unwrap();
        port.enable().unwrap();
        (port, clock)
    }

    fn identify_page(serial: &str, model: &str, firmware: &str, sectors: u32) -> AVec<u8> {
        let mut page = alloc::vec![0u8; 512];
        let write_swapped = |page: &mut AVec<u8>, start: usize, len: usize, text: &str| {
            let bytes = text.as_bytes();
            for i in (0..len).step_by(2) {
                let b0 = bytes.get(i).copied().unwrap_or(b' ');
                let b1 = bytes.get(i + 1).copied().unwrap_or(b' ');
                page[start + i] = b1;
                page[start + i + 1] = b0;
            }
        };
        write_swapped(&mut page, 20, 20, serial);
        write_swapped(&mut page, 46, 8, firmware);
        write_swapped(&mut page, 54, 40, model);
        page[120..124].copy_from_slice(&sectors.to_le_bytes());
        page
    }

    #[test]
    fn identify_parses_model_serial_and_sector_count() {
        let page = identify_page("SN-01", "MODEL X", "FW01", 10_000);
        let id = parse_identify(&page);
        assert_eq!(id.serial, "SN-01");
        assert_eq!(id.model, "MODEL X");
        assert_eq!(id.firmware, "FW01");
        assert_eq!(id.sector_count, 10_000);
        assert_eq!(id.sector_size, 512);
        assert!(!id.lba48);
    }

    #[test]
    fn attach_with_no_device_reports_no_device_and_stays_undefined() {
        let window = RegisterWindow::new(MemoryBackend::new(0x48));
        let mut port: SataPort<MemoryBackend, 32> = SataPort::new(window);
        assert_eq!(port.attach(false), Err(DriverError::NoDevice));
        assert_eq!(port.state(), PortState::Undefined);
    }

    #[test]
    fn bring_up_reaches_ready_and_accepts_identify() {
        let (mut port, _clock) = ready_port();
        assert_eq!(port.state(), PortState::Ready);
        let page = identify_page("SN-01", "MODEL X", "", 10_000);
        port.accept_identify(&page);
        assert_eq!(port.identity().unwrap().model, "MODEL X");
    }

    #[test]
    fn send_command_rejects_out_of_range_lba() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 100));
        let err = port
            .send_command(95, 10, Direction::FromDevice, &[], Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, DriverError::InvalidArgument);
    }

    #[test]
    fn send_command_rejects_numsec_over_65536() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 100_000));
        let err = port
            .send_command(0, 65_537, Direction::FromDevice, &[], Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, DriverError::InvalidArgument);
    }

    #[test]
    fn sector_count_of_65536_encodes_as_zero_sentinel() {
        assert_eq!(encode_sector_count(65_536), 0);
        assert_eq!(encode_sector_count(1), 1);
        assert_eq!(encode_sector_count(65_535), 65_535);
    }

    #[test]
    fn flush_round_trips_through_the_slot_pool() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 1000));
        let done = Arc::new(AtomicU32::new(0));
        let done2 = done.clone();
        let slot = port.flush(Box::new(move |res| {
            assert_eq!(res, Ok(0));
            done2.store(1, Ordering::SeqCst);
        })).unwrap();
        port.window().clear_bits(reg::CI, 1 << slot);
        port.window().write(reg::IS, 1);
        let clock = FakeClock { now: Cell::new(0) };
        port.handle_interrupt(&clock, || {}).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discard_rejects_range_exceeding_capacity() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 100));
        let err = port.discard(90, 50, Box::new(|_| {})).unwrap_err();
        assert_eq!(err, DriverError::InvalidArgument);
    }

    #[test]
    fn send_command_issues_and_scan_completions_fires_callback() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 1000));
        let done = Arc::new(AtomicU32::new(0));
        let done2 = done.clone();
        let slot = port
            .send_command(
                0,
                8,
                Direction::FromDevice,
                &[Segment { bus_addr: 0x2000, sector_count: 8 }],
                Box::new(move |res| {
                    assert_eq!(res, Ok(4096));
                    done2.store(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        // Doorbell was rung.
        assert_eq!(port.window().read(reg::CI) & (1 << slot), 1 << slot);

        // Device clears the command-issue bit on completion.
        port.window().clear_bits(reg::CI, 1 << slot);
        port.window().write(reg::IS, 1); // ordinary data interrupt
        let clock = FakeClock { now: Cell::new(0) };
        port.handle_interrupt(&clock, || {}).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_presence_change_aborts_all_and_enters_error() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 1000));
        let aborted = Arc::new(AtomicU32::new(0));
        let a2 = aborted.clone();
        port.send_command(0, 1, Direction::FromDevice, &[], Box::new(move |res| {
            assert_eq!(res, Err(DriverError::IoError));
            a2.store(1, Ordering::SeqCst);
        }))
        .unwrap();

        port.window().write(reg::IS, IS_PCS);
        let clock = FakeClock { now: Cell::new(0) };
        let result = port.handle_interrupt(&clock, || {});
        assert_eq!(result, Err(DriverError::IoError));
        assert_eq!(port.state(), PortState::Error);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fatal_error_preserves_other_pending_slots_and_reissues_them() {
        let (mut port, _clock) = ready_port();
        port.accept_identify(&identify_page("S", "M", "F", 1000));

        let failing_tag_done = Arc::new(AtomicU32::new(0));
        let other_done = Arc::new(AtomicU32::new(0));
        let f2 = failing_tag_done.clone();
        let o2 = other_done.clone();

        // Slot 0 is "currently executing" (lowest set CI bit) and will be
        // aborted; slot 1 is merely pending and must survive.
        let slot0 = port
            .send_command(0, 1, Direction::FromDevice, &[], Box::new(move |res| {
                assert_eq!(res, Err(DriverError::IoError));
                f2.store(1, Ordering::SeqCst);
            }))
            .unwrap();
        let slot1 = port
            .send_command(1, 1, Direction::FromDevice, &[], Box::new(move |res| {
                assert!(res.is_ok());
                o2.store(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(slot0 < slot1);

        port.window().write(reg::IS, 1 << 30); // TFES
        let clock = FakeClock { now: Cell::new(0) };
        port.handle_interrupt(&clock, || clock.now.set(clock.now.get() + POLL_INTERVAL_US))
            .unwrap();

        assert_eq!(failing_tag_done.load(Ordering::SeqCst), 1);
        assert_eq!(port.state(), PortState::Ready);
        // Slot 1's doorbell bit was re-asserted; simulate its completion.
        assert_eq!(port.window().read(reg::CI) & (1 << slot1), 1 << slot1);
        port.window().clear_bits(reg::CI, 1 << slot1);
        port.window().write(reg::IS, 1);
        port.handle_interrupt(&clock, || {}).unwrap();
        assert_eq!(other_done.load(Ordering::SeqCst), 1);
    }
}
