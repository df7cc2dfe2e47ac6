//! NVMe family controller/namespace state machine (spec §4.5), driven
//! through the same [`RegisterWindow`]/errand-scheduler shape as
//! [`crate::sata`] but with NVMe's register layout, generalizing the
//! `NvmeReg`/`NvmeCap`/`NvmeCc` definitions of
//! `examples/vzwjustin-Rustos/src/drivers/storage/nvme.rs`.

use crate::errand::{Clock, Poll, PollOutcome};
use crate::error::{DriverError, DriverResult};
use crate::register::{RegisterBackend, RegisterWindow};
use crate::ring::nvme::{self, Callback, DataPointer, DataPointerMode, QueuePair, SglDescriptor};
pub use crate::sata::PortState;
use alloc::string::String;
use alloc::vec::Vec;

mod reg {
    pub const CAP: usize = 0x00; // 8 bytes
    pub const VS: usize = 0x08;
    pub const INTMS: usize = 0x0C;
    pub const INTMC: usize = 0x10;
    pub const CC: usize = 0x14;
    pub const CSTS: usize = 0x1C;
    pub const AQA: usize = 0x24;
    pub const ASQ: usize = 0x28; // 8 bytes
    pub const ACQ: usize = 0x30; // 8 bytes
}

/// Doorbell stride is `4 << CAP.DSTRD`; tests fix `DSTRD = 0`.
pub const DOORBELL_BASE: usize = 0x1000;

const CC_EN: u32 = 1 << 0;
const CSTS_RDY: u32 = 1 << 0;

const POLL_INTERVAL_US: u64 = 10;
const POLL_BUDGET_US: u64 = 50_000;

/// Admin opcodes used (spec §6).
pub mod admin_opcode {
    pub const IDENTIFY: u8 = 0x06;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const CREATE_IO_CQ: u8 = 0x05;
}

/// I/O opcodes used (spec §6). `FLUSH` is an **[EXPANSION]**: the NVMe
/// 1.x base spec's standard I/O opcode 0x00, not named by spec.md's
/// opcode list but required by the client protocol's `flush()` (spec §6).
pub mod io_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
}

fn read_u64(window: &RegisterWindow<impl RegisterBackend>, offset: usize) -> u64 {
    let lo = window.read(offset) as u64;
    let hi = window.read(offset + 4) as u64;
    lo | (hi << 32)
}

fn write_u64(window: &RegisterWindow<impl RegisterBackend>, offset: usize, value: u64) {
    window.write(offset, value as u32);
    window.write(offset + 4, (value >> 32) as u32);
}

/// Parsed Identify Controller data (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub mdts: u8,
    pub sgl_supported: bool,
}

fn ascii_field(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().into()
}

pub fn parse_identify_controller(data: &[u8]) -> ControllerIdentity {
    assert!(data.len() >= 540, "Identify Controller data structure is 4096 bytes");
    ControllerIdentity {
        serial: ascii_field(&data[4..24]),
        model: ascii_field(&data[24..64]),
        firmware: ascii_field(&data[64..72]),
        mdts: data[77],
        sgl_supported: u32::from_le_bytes(data[536..540].try_into().unwrap()) & 1 != 0,
    }
}

/// Parsed Identify Namespace data (spec §4.5, §4.4's LBA format table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIdentity {
    pub size_sectors: u64,
    pub lba_size: u32,
    pub deallocate_write_zeroes: bool,
}

pub fn parse_identify_namespace(data: &[u8]) -> NamespaceIdentity {
    assert!(data.len() >= 132, "Identify Namespace data structure is 4096 bytes");
    let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let flbas = (data[26] & 0x0F) as usize;
    let dlfeat = data[33];
    let lbaf_offset = 128 + flbas * 4;
    let lbads = data[lbaf_offset + 2];
    NamespaceIdentity {
        size_sectors: nsze,
        lba_size: 1u32 << lbads,
        deallocate_write_zeroes: dlfeat & 0x08 != 0,
    }
}

/// One namespace exposed by a controller: its identity plus its own I/O
/// submission/completion queue pair (spec §4.5: "create one I/O
/// submission+completion queue pair per namespace before the namespace
/// is exposed").
pub struct Namespace {
    pub nsid: u32,
    pub identity: NamespaceIdentity,
    pub queue: QueuePair,
    pub data_mode: DataPointerMode,
    /// I/O queue id, used to compute this namespace's doorbell offsets
    /// (admin queue is id 0; every namespace gets its own I/O pair per
    /// spec §4.5's identify handshake).
    pub queue_id: u32,
}

impl Namespace {
    /// Maximum scatter-gather segments a single command may carry (spec
    /// §4.4: PRP mode is bounded to 1 page-aligned segment beyond PRP1's
    /// own page; SGL mode is bounded by the advertised `IOQ_SGLS`).
    pub fn max_segments(&self) -> usize {
        match self.data_mode {
            DataPointerMode::Prp => 1,
            DataPointerMode::Sgl { max_segments } => max_segments,
        }
    }

    fn validate_range(&self, lba: u64, nlb: u32) -> DriverResult<()> {
        if nlb == 0 {
            return Err(DriverError::InvalidArgument);
        }
        let end = lba.checked_add(nlb as u64).ok_or(DriverError::InvalidArgument)?;
        if end > self.identity.size_sectors {
            return Err(DriverError::InvalidArgument);
        }
        Ok(())
    }

    fn build_data_pointer(&self, segment_bus_addrs: &[u64], list_pages: &[u64]) -> DriverResult<DataPointer> {
        match self.data_mode {
            DataPointerMode::Prp => nvme::build_prp(segment_bus_addrs, list_pages),
            DataPointerMode::Sgl { max_segments } => {
                let descriptors: Vec<SglDescriptor> = segment_bus_addrs
                    .iter()
                    .map(|&bus_addr| SglDescriptor { bus_addr, length: self.identity.lba_size })
                    .collect();
                nvme::build_sgl(&descriptors, max_segments)
            }
        }
    }

    /// Issue a Read (0x02) or Write (0x01) command.
    pub fn read_write(
        &mut self,
        lba: u64,
        nlb: u32,
        is_write: bool,
        segment_bus_addrs: &[u64],
        list_pages: &[u64],
        callback: Callback,
    ) -> DriverResult<(u32, DataPointer)> {
        self.validate_range(lba, nlb)?;
        let dptr = self.build_data_pointer(segment_bus_addrs, list_pages)?;
        let opcode = if is_write { io_opcode::WRITE } else { io_opcode::READ };
        let cid = self.queue.produce(
            opcode,
            self.nsid,
            dptr.clone(),
            lba as u32,
            (lba >> 32) as u32,
            nlb - 1,
            callback,
        )?;
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        Ok((cid, dptr))
    }

    /// Issue Write Zeroes (0x08). `deallocate` requests the device free
    /// the backing storage (spec §1 "block-level deallocate/discard"),
    /// only meaningful when the namespace advertises
    /// `deallocate_write_zeroes` support.
    pub fn write_zeroes(&mut self, lba: u64, nlb: u32, deallocate: bool, callback: Callback) -> DriverResult<u32> {
        self.validate_range(lba, nlb)?;
        if deallocate && !self.identity.deallocate_write_zeroes {
            return Err(DriverError::InvalidArgument);
        }
        const DEAC: u32 = 1 << 25;
        let cdw12 = (nlb - 1) | if deallocate { DEAC } else { 0 };
        let cid = self.queue.produce(
            io_opcode::WRITE_ZEROES,
            self.nsid,
            DataPointer::Inline { prp1: 0, prp2: 0 },
            lba as u32,
            (lba >> 32) as u32,
            cdw12,
            callback,
        )?;
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        Ok(cid)
    }

    /// Issue Flush (0x00): no data transfer, just a slot round-trip
    /// through the I/O queue (spec §6 client protocol `flush`).
    pub fn flush(&mut self, callback: Callback) -> DriverResult<u32> {
        let cid = self.queue.produce(
            io_opcode::FLUSH,
            self.nsid,
            DataPointer::Inline { prp1: 0, prp2: 0 },
            0,
            0,
            0,
            callback,
        )?;
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        Ok(cid)
    }

    pub fn complete(&mut self, phase_bit: bool, command_id: u32, status: DriverResult<u32>) -> Option<u32> {
        self.queue.consume(phase_bit, command_id, status)
    }
}

/// An NVMe controller: admin queue bring-up plus zero or more namespaces.
pub struct NvmeController<B: RegisterBackend> {
    window: RegisterWindow<B>,
    state: PortState,
    namespaces: Vec<Namespace>,
}

impl<B: RegisterBackend> NvmeController<B> {
    pub fn new(window: RegisterWindow<B>) -> Self {
        Self {
            window,
            state: PortState::Undefined,
            namespaces: Vec::new(),
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn namespace_mut(&mut self, nsid: u32) -> Option<&mut Namespace> {
        self.namespaces.iter_mut().find(|ns| ns.nsid == nsid)
    }

    pub fn attach(&mut self, device_present: bool) -> DriverResult<()> {
        if !device_present {
            return Err(DriverError::NoDevice);
        }
        self.state = PortState::Present;
        Ok(())
    }

    /// Disable the controller (clear CC.EN) and wait for CSTS.RDY to
    /// drop, matching AHCI's drain-before-(re)configure shape.
    pub fn initialize(&mut self, clock: &dyn Clock, mut advance: impl FnMut()) -> DriverResult<()> {
        if !matches!(self.state, PortState::Present | PortState::Error | PortState::ReInitializing) {
            return Err(DriverError::InvalidArgument);
        }
        self.state = PortState::Initializing;
        self.window.clear_bits(reg::CC, CC_EN);
        let drained = {
            let window = &self.window;
            let mut poll = Poll::new(clock, POLL_INTERVAL_US, POLL_BUDGET_US, || {
                window.read(reg::CSTS) & CSTS_RDY == 0
            });
            poll.run_to_completion(clock, &mut advance)
        };
        if drained != PollOutcome::Ready {
            self.state = PortState::Fatal;
            return Err(DriverError::Fatal);
        }
        self.state = PortState::Attached;
        Ok(())
    }

    /// Program the admin queue attributes/bases and enable the
    /// controller, polling CSTS.RDY (spec §4.5 `Attached -> Ready`).
    pub fn enable(
        &mut self,
        clock: &dyn Clock,
        mut advance: impl FnMut(),
        admin_queue_depth: u16,
        admin_sq_base: u64,
        admin_cq_base: u64,
    ) -> DriverResult<()> {
        if self.state != PortState::Attached {
            return Err(DriverError::InvalidArgument);
        }
        self.state = PortState::Enabling;
        let aqa = ((admin_queue_depth.saturating_sub(1) as u32) << 16) | admin_queue_depth.saturating_sub(1) as u32;
        self.window.write(reg::AQA, aqa);
        write_u64(&self.window, reg::ASQ, admin_sq_base);
        write_u64(&self.window, reg::ACQ, admin_cq_base);
        self.window.set_bits(reg::CC, CC_EN);

        let ready = {
            let window = &self.window;
            let mut poll = Poll::new(clock, POLL_INTERVAL_US, POLL_BUDGET_US, || {
                window.read(reg::CSTS) & CSTS_RDY != 0
            });
            poll.run_to_completion(clock, &mut advance)
        };
        if ready != PollOutcome::Ready {
            self.state = PortState::Fatal;
            return Err(DriverError::Fatal);
        }
        self.state = PortState::Ready;
        log::debug!("nvme controller enabled, vs=0x{:08x}", self.window.read(reg::VS));
        Ok(())
    }

    pub fn capability_raw(&self) -> u64 {
        read_u64(&self.window, reg::CAP)
    }

    /// Create an I/O queue pair for a namespace once Identify Namespace
    /// has been parsed (spec §4.5).
    pub fn create_namespace(&mut self, nsid: u32, identity: NamespaceIdentity, queue_depth: u32, data_mode: DataPointerMode) {
        let queue_id = self.namespaces.len() as u32 + 1;
        self.namespaces.push(Namespace {
            nsid,
            identity,
            queue: QueuePair::new(queue_depth),
            data_mode,
            queue_id,
        });
    }

    /// `CAP.DSTRD`: the doorbell stride exponent (spec §6: doorbells
    /// start at offset 0x1000 with stride `4 << CAP.DSTRD`).
    fn dstrd(&self) -> u32 {
        ((self.capability_raw() >> 32) & 0xF) as u32
    }

    fn doorbell_offset(&self, queue_id: u32, is_completion: bool) -> usize {
        let stride = 4usize << self.dstrd();
        let index = 2 * queue_id as usize + if is_completion { 1 } else { 0 };
        DOORBELL_BASE + index * stride
    }

    fn namespace_mut_by_nsid(&mut self, nsid: u32) -> DriverResult<&mut Namespace> {
        self.namespaces.iter_mut().find(|n| n.nsid == nsid).ok_or(DriverError::InvalidArgument)
    }

    /// Issue a Read/Write on `nsid`'s I/O queue and ring its submission
    /// doorbell (spec §4.4 `submit()`).
    pub fn submit_read_write(
        &mut self,
        nsid: u32,
        lba: u64,
        nlb: u32,
        is_write: bool,
        segment_bus_addrs: &[u64],
        list_pages: &[u64],
        callback: Callback,
    ) -> DriverResult<(u32, DataPointer)> {
        let ns = self.namespace_mut_by_nsid(nsid)?;
        let (cid, dptr) = ns.read_write(lba, nlb, is_write, segment_bus_addrs, list_pages, callback)?;
        let (queue_id, tail) = (ns.queue_id, ns.queue.sq_tail());
        let offset = self.doorbell_offset(queue_id, false);
        self.window.write(offset, tail);
        Ok((cid, dptr))
    }

    /// Issue Write Zeroes on `nsid`'s I/O queue and ring its submission
    /// doorbell.
    pub fn submit_write_zeroes(
        &mut self,
        nsid: u32,
        lba: u64,
        nlb: u32,
        deallocate: bool,
        callback: Callback,
    ) -> DriverResult<u32> {
        let ns = self.namespace_mut_by_nsid(nsid)?;
        let cid = ns.write_zeroes(lba, nlb, deallocate, callback)?;
        let (queue_id, tail) = (ns.queue_id, ns.queue.sq_tail());
        let offset = self.doorbell_offset(queue_id, false);
        self.window.write(offset, tail);
        Ok(cid)
    }

    /// Issue Flush on `nsid`'s I/O queue and ring its submission doorbell.
    pub fn submit_flush(&mut self, nsid: u32, callback: Callback) -> DriverResult<u32> {
        let ns = self.namespace_mut_by_nsid(nsid)?;
        let cid = ns.flush(callback)?;
        let (queue_id, tail) = (ns.queue_id, ns.queue.sq_tail());
        let offset = self.doorbell_offset(queue_id, false);
        self.window.write(offset, tail);
        Ok(cid)
    }

    /// Process a completion entry for `nsid`'s I/O queue: advance the
    /// submission queue's locally tracked head to the completion-reported
    /// value, fire the callback, then ring the completion-queue head
    /// doorbell (spec §4.4).
    pub fn complete_io(
        &mut self,
        nsid: u32,
        phase_bit: bool,
        command_id: u32,
        sq_head_reported: u32,
        status: DriverResult<u32>,
    ) -> Option<u32> {
        let ns = self.namespaces.iter_mut().find(|n| n.nsid == nsid)?;
        ns.queue.submit(sq_head_reported);
        let completed = ns.complete(phase_bit, command_id, status);
        if completed.is_some() {
            let (queue_id, head) = (ns.queue_id, ns.queue.cq_head());
            let offset = self.doorbell_offset(queue_id, true);
            self.window.write(offset, head);
        }
        completed
    }

    pub fn window(&self) -> &RegisterWindow<B> {
        &self.window
    }
}
