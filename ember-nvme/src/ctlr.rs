//! NVMe controller driver core.
//!
//! The driver runs one admin queue pair and one IO queue pair, both
//! carved from a caller supplied DMA region, and polls for completions
//! instead of taking interrupts. Admin commands run one at a time; IO
//! requests are split by the transfer size limit, submitted in batches
//! up to the ring depth and drained synchronously.

use ember_blockdev::{check_transfer, BlockDevice, DeviceHealth, SelfTestAction, SelfTestSupport};
use ember_mmio::{CompletionQueue, MmioBus, SubmissionQueue};
use ember_pal::{Clock, Deadline, DmaBuffer, DmaRegion};
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::FromBytes;

use crate::cmd::{self, CompletionEntry, SubmissionEntry};
use crate::error::{NvmeError, NvmeResult};
use crate::identify::{self, IdentifyController, IdentifyNamespace, SelfTestLog, SmartLog};
use crate::prp;
use crate::regs;

/// Most namespaces the driver keeps geometry for.
pub const MAX_NAMESPACES: usize = 32;

/// DMA memory the controller needs, in bytes.
///
/// Covers both command rings of each queue pair, one PRP list page per
/// IO submission slot and a scratch page for admin data. The region
/// handed to [`NvmeCtlr::new`] should start page aligned so the ring
/// base addresses satisfy the controller.
pub const DMA_SIZE: usize = (5 + IO_QUEUE_DEPTH as usize) * prp::PAGE_SIZE;

const ADMIN_QUEUE_ID: u16 = 0;
const IO_QUEUE_ID: u16 = 1;
/// Admin commands run strictly one at a time.
const ADMIN_QUEUE_DEPTH: u16 = 2;
/// IO ring entries, before capping by CAP.MQES.
const IO_QUEUE_DEPTH: u16 = 11;
/// Slots reserved for statically registered drive geometries.
const STATIC_NAMESPACE_SLOTS: usize = 4;
/// Time allowed for a single command to complete.
const COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Fixed geometry for a drive known ahead of time.
///
/// When the controller's model number contains `model`, namespace
/// enumeration is skipped entirely and the registered geometry is used
/// as is. Some DRAM-less controllers stall on Identify Namespace early
/// in boot; this sidesteps them.
#[derive(Clone, Copy, Debug)]
pub struct StaticNamespace {
    /// Substring of the Identify Controller model number to match.
    pub model: &'static str,
    /// Namespace ID to register.
    pub nsid: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Capacity in blocks.
    pub block_count: u64,
}

/// Cached Identify Controller fields.
#[derive(Clone, Copy, Debug)]
pub struct ControllerInfo {
    /// Serial number, space padded ASCII.
    pub sn: [u8; 20],
    /// Model number, space padded ASCII.
    pub mn: [u8; 40],
    /// Firmware revision, space padded ASCII.
    pub fr: [u8; 8],
    /// Maximum data transfer size exponent, zero for unlimited.
    pub mdts: u8,
    /// Optional admin command support bits.
    pub oacs: u16,
    /// Number of namespaces the controller supports.
    pub nn: u32,
}

impl ControllerInfo {
    /// Returns the model number without padding.
    #[must_use]
    pub fn model(&self) -> &str {
        identify::id_string(&self.mn)
    }

    /// Returns the serial number without padding.
    #[must_use]
    pub fn serial(&self) -> &str {
        identify::id_string(&self.sn)
    }

    /// Returns the firmware revision without padding.
    #[must_use]
    pub fn firmware(&self) -> &str {
        identify::id_string(&self.fr)
    }
}

/// Geometry of one attached namespace.
#[derive(Clone, Copy, Debug)]
struct NamespaceInfo {
    nsid: u32,
    block_size: u32,
    block_count: u64,
}

/// Polled driver for one NVMe controller.
pub struct NvmeCtlr<B: MmioBus, C: Clock> {
    bus: B,
    clock: C,
    /// Doorbell stride in bytes, from CAP.DSTRD.
    dstrd: usize,
    /// Enable, disable and shutdown latency allowance, from CAP.TO.
    timeout_ms: u64,
    admin_sq: SubmissionQueue<SubmissionEntry>,
    admin_cq: CompletionQueue<CompletionEntry>,
    io_sq: SubmissionQueue<SubmissionEntry>,
    io_cq: CompletionQueue<CompletionEntry>,
    /// One PRP list page per IO submission slot.
    prp_lists: DmaBuffer,
    /// Admin data buffer, one page.
    scratch: DmaBuffer,
    next_cid: u16,
    /// Largest transfer per command in bytes.
    max_transfer: usize,
    identity: Option<ControllerInfo>,
    namespaces: [Option<NamespaceInfo>; MAX_NAMESPACES],
    static_namespaces: [Option<StaticNamespace>; STATIC_NAMESPACE_SLOTS],
    enabled: bool,
}

impl<B: MmioBus, C: Clock> NvmeCtlr<B, C> {
    /// Creates a driver over `bus` and carves its queues out of `dma`.
    ///
    /// Fails when the controller does not speak the NVM command set,
    /// needs pages larger than 4 KiB, or `dma` cannot supply
    /// [`DMA_SIZE`] bytes.
    pub fn new(bus: B, clock: C, dma: &mut DmaRegion) -> NvmeResult<Self> {
        let cap = bus.read64_pair(regs::CAP);
        if regs::cap::css(cap) & regs::cap::CSS_NVM == 0 {
            log::warn!("new: controller lacks the nvm command set");
            return Err(NvmeError::Unsupported);
        }
        if regs::cap::mpsmin(cap) != 0 {
            log::warn!("new: minimum page size above 4 KiB");
            return Err(NvmeError::Unsupported);
        }
        let max_entries = regs::cap::mqes(cap) + 1;
        if max_entries < u32::from(ADMIN_QUEUE_DEPTH) {
            log::warn!("new: queues capped at {} entries", max_entries);
            return Err(NvmeError::Unsupported);
        }
        let io_depth = max_entries.min(u32::from(IO_QUEUE_DEPTH)) as u16;

        let asq = Self::carve(dma, SubmissionQueue::<SubmissionEntry>::memory_size(ADMIN_QUEUE_DEPTH))?;
        let acq = Self::carve(dma, CompletionQueue::<CompletionEntry>::memory_size(ADMIN_QUEUE_DEPTH))?;
        let iosq = Self::carve(dma, SubmissionQueue::<SubmissionEntry>::memory_size(io_depth))?;
        let iocq = Self::carve(dma, CompletionQueue::<CompletionEntry>::memory_size(io_depth))?;
        let prp_lists = Self::carve(dma, usize::from(io_depth) * prp::PAGE_SIZE)?;
        let scratch = Self::carve(dma, prp::PAGE_SIZE)?;

        // SAFETY: Each ring was carved from the caller's DMA region for
        // that ring alone, stays allocated for the driver's lifetime and
        // carries the matching bus address.
        let (admin_sq, admin_cq, io_sq, io_cq) = unsafe {
            (
                SubmissionQueue::new(asq.base() as *mut SubmissionEntry, asq.bus_addr(), ADMIN_QUEUE_DEPTH),
                CompletionQueue::new(
                    acq.base() as *const CompletionEntry,
                    acq.bus_addr(),
                    ADMIN_QUEUE_DEPTH,
                    cmd::PHASE_BIT,
                    cmd::STATUS_FIELD_OFFSET,
                ),
                SubmissionQueue::new(iosq.base() as *mut SubmissionEntry, iosq.bus_addr(), io_depth),
                CompletionQueue::new(
                    iocq.base() as *const CompletionEntry,
                    iocq.bus_addr(),
                    io_depth,
                    cmd::PHASE_BIT,
                    cmd::STATUS_FIELD_OFFSET,
                ),
            )
        };

        Ok(Self {
            bus,
            clock,
            dstrd: regs::cap::dstrd_bytes(cap),
            // A zero CAP.TO would fail every register wait on the spot.
            timeout_ms: regs::cap::to_ms(cap).max(500),
            admin_sq,
            admin_cq,
            io_sq,
            io_cq,
            prp_lists,
            scratch,
            next_cid: 0,
            max_transfer: prp::MAX_TRANSFER,
            identity: None,
            namespaces: [None; MAX_NAMESPACES],
            static_namespaces: [None; STATIC_NAMESPACE_SLOTS],
            enabled: false,
        })
    }

    fn carve(dma: &mut DmaRegion, len: usize) -> NvmeResult<DmaBuffer> {
        let mut buf = dma.alloc(len, prp::PAGE_SIZE).ok_or(NvmeError::OutOfMemory)?;
        buf.fill(0, len, 0);
        Ok(buf)
    }

    /// Registers a fixed geometry consulted by [`Self::setup`].
    ///
    /// Must be called before setup to take effect. Up to
    /// four entries are kept.
    pub fn add_static_namespace(&mut self, ns: StaticNamespace) -> NvmeResult<()> {
        let Some(slot) = self.static_namespaces.iter_mut().find(|slot| slot.is_none()) else {
            log::warn!("add_static_namespace: table full");
            return Err(NvmeError::InvalidParameter);
        };
        *slot = Some(ns);
        Ok(())
    }

    /// Brings the controller up and discovers its namespaces.
    ///
    /// Resets the controller, installs the admin queue pair, creates the
    /// IO queue pair and identifies the controller and its active
    /// namespaces. Does nothing when already set up; a failed setup
    /// leaves the controller disabled.
    pub fn setup(&mut self) -> NvmeResult<()> {
        if self.enabled {
            return Ok(());
        }
        self.identity = None;
        self.namespaces = [None; MAX_NAMESPACES];

        self.disable()?;
        // Polled driver, mask every interrupt vector.
        self.bus.write32(regs::INTMS, !0);
        let aqa = u32::from(self.admin_cq.depth() - 1) << 16 | u32::from(self.admin_sq.depth() - 1);
        self.bus.write32(regs::AQA, aqa);
        self.bus.write64_pair(regs::ASQ, self.admin_sq.bus_addr());
        self.bus.write64_pair(regs::ACQ, self.admin_cq.bus_addr());
        self.enable()?;

        self.request_queue_pair()?;
        self.create_io_queues()?;
        self.identify_controller()?;
        if !self.adopt_static_namespaces() {
            self.enumerate_namespaces()?;
        }
        self.enabled = true;
        Ok(())
    }

    /// Returns the cached Identify Controller fields once set up.
    #[must_use]
    pub fn controller_info(&self) -> Option<&ControllerInfo> {
        self.identity.as_ref()
    }

    /// Returns the number of namespaces discovered by setup.
    #[must_use]
    pub fn namespace_count(&self) -> usize {
        self.namespaces.iter().flatten().count()
    }

    /// Returns a block device view of one namespace.
    pub fn block_dev(&mut self, nsid: u32) -> NvmeResult<NvmeBlockDev<'_, B, C>> {
        let info = self
            .namespaces
            .iter()
            .flatten()
            .find(|ns| ns.nsid == nsid)
            .copied()
            .ok_or(NvmeError::NoNamespace)?;
        Ok(NvmeBlockDev { ctlr: self, info })
    }

    /// Notifies the controller of shutdown and disables it.
    ///
    /// Asks for a normal shutdown first so the device can flush; when
    /// that times out the notification is repeated abruptly, best
    /// effort, before the controller is disabled.
    pub fn shutdown(&mut self) -> NvmeResult<()> {
        let cc = self.bus.read32(regs::CC);
        self.bus.write32(regs::CC, (cc & !regs::cc::SHN_MASK) | regs::cc::SHN_NORMAL);
        let notified = match self.wait_csts(regs::csts::SHST_MASK, regs::csts::SHST_COMPLETE) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("shutdown: normal shutdown stalled, going abrupt");
                let cc = self.bus.read32(regs::CC);
                self.bus.write32(regs::CC, (cc & !regs::cc::SHN_MASK) | regs::cc::SHN_ABRUPT);
                let _ = self.wait_csts(regs::csts::SHST_MASK, regs::csts::SHST_COMPLETE);
                Err(err)
            }
        };
        let disabled = self.disable();
        notified.and(disabled)
    }

    /// Reads `out.len()` bytes of log page `lid`.
    ///
    /// The length must be a nonzero whole number of dwords and fit the
    /// admin data buffer.
    pub fn get_log_page(&mut self, lid: u8, out: &mut [u8]) -> NvmeResult<()> {
        if out.is_empty() || out.len() % 4 != 0 || out.len() > self.scratch.len() {
            log::warn!("get_log_page: bad length {} for log {:#x}", out.len(), lid);
            return Err(NvmeError::InvalidParameter);
        }
        self.scratch.fill(0, self.scratch.len(), 0);
        self.admin_cmd(cmd::get_log_page(lid, cmd::NSID_ALL, out.len(), self.scratch.bus_addr()))?;
        self.scratch.read_bytes(0, out);
        Ok(())
    }

    /// Reads and decodes the SMART / Health Information log page.
    pub fn smart_log(&mut self) -> NvmeResult<SmartLog> {
        let mut raw = [0u8; identify::SMART_LOG_SIZE];
        self.get_log_page(cmd::log_page::SMART, &mut raw)?;
        let (log, _) = SmartLog::read_from_prefix(&raw).map_err(|_| NvmeError::Protocol)?;
        Ok(log)
    }

    /// Reads and decodes the self-test log page.
    pub fn self_test_log(&mut self) -> NvmeResult<SelfTestLog> {
        let mut raw = [0u8; identify::SELF_TEST_LOG_SIZE];
        self.get_log_page(cmd::log_page::SELF_TEST, &mut raw)?;
        let (log, _) = SelfTestLog::read_from_prefix(&raw).map_err(|_| NvmeError::Protocol)?;
        Ok(log)
    }

    /// Returns true when the controller implements Device Self-test.
    #[must_use]
    pub fn self_test_supported(&self) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|info| info.oacs & identify::OACS_SELF_TEST != 0)
    }

    /// Issues a Device Self-test command with one of the
    /// [`cmd::self_test`] action codes.
    pub fn device_self_test(&mut self, code: u32) -> NvmeResult<()> {
        if !self.self_test_supported() {
            log::warn!("device_self_test: not supported by controller");
            return Err(NvmeError::Unsupported);
        }
        self.admin_cmd(cmd::device_self_test(code))?;
        Ok(())
    }

    /// Disables the controller without a shutdown notification.
    ///
    /// For handing the controller to another driver; use
    /// [`Self::shutdown`] before power-off.
    pub fn disable(&mut self) -> NvmeResult<()> {
        self.enabled = false;
        let cc = self.bus.read32(regs::CC);
        self.bus.write32(regs::CC, cc & !regs::cc::EN);
        self.wait_csts(regs::csts::RDY, 0)
    }

    fn enable(&mut self) -> NvmeResult<()> {
        // Entry sizes are fixed at 64 and 16 bytes; page size and
        // arbitration keep their zero defaults.
        let cc = regs::cc::EN | 6 << regs::cc::IOSQES_SHIFT | 4 << regs::cc::IOCQES_SHIFT;
        self.bus.write32(regs::CC, cc);
        self.wait_csts(regs::csts::RDY, regs::csts::RDY)
    }

    fn wait_csts(&self, mask: u32, value: u32) -> NvmeResult<()> {
        let deadline = Deadline::after_ms(&self.clock, self.timeout_ms);
        loop {
            let timed_out = deadline.expired(&self.clock);
            let status = self.bus.read32(regs::CSTS);
            if status & mask == value {
                return Ok(());
            }
            if timed_out {
                log::warn!("wait_csts: status {:#x} never matched {:#x}/{:#x}", status, mask, value);
                return Err(NvmeError::Timeout);
            }
        }
    }

    /// Asks for one IO queue pair via Set Features.
    fn request_queue_pair(&mut self) -> NvmeResult<()> {
        // Both counts are zero based, so this requests one of each.
        let completion = self.admin_cmd(cmd::set_features(cmd::feature::NUMBER_OF_QUEUES, 0))?;
        let granted = completion.result.get();
        log::debug!(
            "request_queue_pair: granted {} submission, {} completion",
            (granted & 0xffff) + 1,
            (granted >> 16) + 1
        );
        Ok(())
    }

    fn create_io_queues(&mut self) -> NvmeResult<()> {
        // The completion queue must exist before a submission queue
        // points at it.
        self.admin_cmd(cmd::create_io_cq(IO_QUEUE_ID, self.io_cq.depth(), self.io_cq.bus_addr()))?;
        self.admin_cmd(cmd::create_io_sq(
            IO_QUEUE_ID,
            self.io_sq.depth(),
            IO_QUEUE_ID,
            self.io_sq.bus_addr(),
        ))?;
        Ok(())
    }

    fn identify_controller(&mut self) -> NvmeResult<()> {
        self.scratch.fill(0, self.scratch.len(), 0);
        self.admin_cmd(cmd::identify(cmd::cns::CONTROLLER, 0, self.scratch.bus_addr()))?;
        let ident: IdentifyController = self.scratch.read(0);
        let info = ControllerInfo {
            sn: ident.sn,
            mn: ident.mn,
            fr: ident.fr,
            mdts: ident.mdts,
            oacs: ident.oacs.get(),
            nn: ident.nn.get(),
        };
        log::debug!(
            "identify_controller: {} (serial {}, firmware {}), {} namespaces",
            info.model(),
            info.serial(),
            info.firmware(),
            info.nn
        );
        // MDTS counts in powers of two of the page size; zero means no
        // limit. One PRP list page caps a command at 2 MiB either way.
        self.max_transfer = if ident.mdts == 0 || ident.mdts >= 9 {
            prp::MAX_TRANSFER
        } else {
            prp::PAGE_SIZE << ident.mdts
        };
        self.identity = Some(info);
        Ok(())
    }

    /// Installs registered geometries when the model number matches.
    ///
    /// Returns false when no entry matched and enumeration should run.
    fn adopt_static_namespaces(&mut self) -> bool {
        let Some(identity) = self.identity.as_ref() else {
            return false;
        };
        let model = identify::id_string(&identity.mn);
        let mut found = 0;
        for ns in self.static_namespaces.iter().flatten() {
            if !model.contains(ns.model) {
                continue;
            }
            log::debug!(
                "adopt_static_namespaces: {} matched, namespace {} uses fixed geometry",
                ns.model,
                ns.nsid
            );
            self.namespaces[found] = Some(NamespaceInfo {
                nsid: ns.nsid,
                block_size: ns.block_size,
                block_count: ns.block_count,
            });
            found += 1;
        }
        found > 0
    }

    fn enumerate_namespaces(&mut self) -> NvmeResult<()> {
        let nn = self.identity.as_ref().map_or(0, |info| info.nn);
        self.scratch.fill(0, self.scratch.len(), 0);
        self.admin_cmd(cmd::identify(cmd::cns::ACTIVE_NAMESPACES, 0, self.scratch.bus_addr()))?;

        // Collect the IDs first; identifying each namespace reuses the
        // scratch page the list sits in.
        let mut ids = [0u32; MAX_NAMESPACES];
        let mut count = 0;
        for slot in 0..self.scratch.len() / size_of::<u32>() {
            let nsid = self.scratch.read::<U32<LittleEndian>>(slot * size_of::<u32>()).get();
            if nsid == 0 {
                // Unused list slots read as zero.
                continue;
            }
            if nsid > nn {
                log::warn!("enumerate_namespaces: active ID {} above controller limit {}", nsid, nn);
                return Err(NvmeError::Protocol);
            }
            if count == MAX_NAMESPACES {
                log::warn!("enumerate_namespaces: keeping the first {} namespaces", MAX_NAMESPACES);
                break;
            }
            ids[count] = nsid;
            count += 1;
        }

        for (slot, &nsid) in ids[..count].iter().enumerate() {
            let info = self.identify_namespace(nsid)?;
            log::debug!(
                "enumerate_namespaces: namespace {}: {} blocks of {} bytes",
                nsid,
                info.block_count,
                info.block_size
            );
            self.namespaces[slot] = Some(info);
        }
        Ok(())
    }

    fn identify_namespace(&mut self, nsid: u32) -> NvmeResult<NamespaceInfo> {
        self.scratch.fill(0, self.scratch.len(), 0);
        self.admin_cmd(cmd::identify(cmd::cns::NAMESPACE, nsid, self.scratch.bus_addr()))?;
        let ident: IdentifyNamespace = self.scratch.read(0);
        if ident.nsze.get() == 0 {
            log::warn!("identify_namespace: namespace {} reports zero size", nsid);
            return Err(NvmeError::Protocol);
        }
        let shift = ident.lba_shift();
        if !(9..32).contains(&shift) {
            log::warn!("identify_namespace: namespace {} block shift {} unusable", nsid, shift);
            return Err(NvmeError::Protocol);
        }
        Ok(NamespaceInfo {
            nsid,
            block_size: 1 << shift,
            block_count: ident.nsze.get(),
        })
    }

    /// Runs one admin command to completion.
    fn admin_cmd(&mut self, mut entry: SubmissionEntry) -> NvmeResult<CompletionEntry> {
        entry.cid = U16::new(self.take_cid());
        if self.admin_sq.submit(entry).is_none() {
            // Strictly one at a time; a full ring means lost completions.
            log::warn!("admin_cmd: submission ring out of slots");
            return Err(NvmeError::Timeout);
        }
        self.bus
            .write32(regs::sq_doorbell(ADMIN_QUEUE_ID, self.dstrd), self.admin_sq.doorbell_value());
        Self::drain(
            &self.bus,
            &self.clock,
            &mut self.admin_sq,
            &mut self.admin_cq,
            ADMIN_QUEUE_ID,
            self.dstrd,
            1,
        )
    }

    fn take_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cid
    }

    /// Consumes `pending` completions from one queue pair.
    ///
    /// Failed commands are reported after the whole batch has been
    /// consumed, so one bad command does not strand the others. The
    /// head doorbell is written once at the end, and once more before
    /// giving up on a timeout. Returns the last completion.
    fn drain(
        bus: &B,
        clock: &C,
        sq: &mut SubmissionQueue<SubmissionEntry>,
        cq: &mut CompletionQueue<CompletionEntry>,
        qid: u16,
        dstrd: usize,
        pending: usize,
    ) -> NvmeResult<CompletionEntry> {
        let mut failed = false;
        let mut last = CompletionEntry::default();
        for _ in 0..pending {
            let deadline = Deadline::after_ms(clock, COMMAND_TIMEOUT_MS);
            let entry = loop {
                let timed_out = deadline.expired(clock);
                if let Some(entry) = cq.pop() {
                    break entry;
                }
                if timed_out {
                    bus.write32(regs::cq_doorbell(qid, dstrd), cq.doorbell_value());
                    log::warn!("drain: queue {} command timed out", qid);
                    return Err(NvmeError::Timeout);
                }
            };
            sq.update_head(entry.sq_head.get());
            let status = entry.status_code();
            if status != 0 {
                log::warn!(
                    "drain: queue {} cid {} failed with status {:#x}",
                    qid,
                    entry.cid.get(),
                    status
                );
                failed = true;
            }
            last = entry;
        }
        bus.write32(regs::cq_doorbell(qid, dstrd), cq.doorbell_value());
        if failed {
            return Err(NvmeError::Device);
        }
        Ok(last)
    }

    /// Moves `count` blocks between `buf_addr` and the namespace.
    ///
    /// The request is split by the transfer size limit and batched onto
    /// the IO ring. Returns the number of blocks confirmed transferred;
    /// when a later batch fails after an earlier one completed, the
    /// partial count is returned instead of the error.
    fn transfer(
        &mut self,
        nsid: u32,
        opcode: u8,
        lba: u64,
        count: u64,
        block_size: u32,
        buf_addr: u64,
    ) -> NvmeResult<u64> {
        let block = u64::from(block_size);
        // The block count field is 16 bits wide, zero based.
        let max_blocks = (self.max_transfer as u64 / block).clamp(1, 1 << 16);

        let mut submitted = 0u64;
        let mut confirmed = 0u64;
        let mut batch_blocks = 0u64;
        let mut batch_cmds = 0usize;
        let mut failure = None;
        while submitted < count {
            if self.io_sq.is_full() {
                if batch_cmds == 0 {
                    // Leftovers of an earlier, timed out transfer own
                    // the ring; nothing here can complete.
                    log::warn!("transfer: submission ring stuck full");
                    return Err(NvmeError::Timeout);
                }
                self.ring_io_doorbell();
                match self.drain_io(batch_cmds) {
                    Ok(()) => {
                        confirmed += batch_blocks;
                        batch_blocks = 0;
                        batch_cmds = 0;
                    }
                    Err(err) => {
                        failure = Some(err);
                        batch_cmds = 0;
                        break;
                    }
                }
            }

            let chunk = (count - submitted).min(max_blocks);
            let slot = self.io_sq.tail();
            let prps = match prp::fill(
                &mut self.prp_lists,
                usize::from(slot) * prp::PAGE_SIZE,
                buf_addr + submitted * block,
                (chunk * block) as usize,
            ) {
                Ok(prps) => prps,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let mut entry = cmd::read_write(opcode, nsid, lba + submitted, chunk as u32);
            entry.prp1 = U64::new(prps.prp1);
            entry.prp2 = U64::new(prps.prp2);
            entry.cid = U16::new(self.take_cid());
            if self.io_sq.submit(entry).is_none() {
                failure = Some(NvmeError::Timeout);
                break;
            }
            submitted += chunk;
            batch_blocks += chunk;
            batch_cmds += 1;
        }

        if batch_cmds > 0 {
            self.ring_io_doorbell();
            match self.drain_io(batch_cmds) {
                Ok(()) => confirmed += batch_blocks,
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        if self.io_sq.is_empty() {
            // A drained ring lets command IDs start over.
            self.next_cid = 0;
        }

        match failure {
            None => Ok(confirmed),
            Some(err) if confirmed > 0 => {
                log::warn!("transfer: completed {} of {} blocks ({})", confirmed, count, err);
                Ok(confirmed)
            }
            Some(err) => Err(err),
        }
    }

    fn ring_io_doorbell(&self) {
        self.bus
            .write32(regs::sq_doorbell(IO_QUEUE_ID, self.dstrd), self.io_sq.doorbell_value());
    }

    fn drain_io(&mut self, pending: usize) -> NvmeResult<()> {
        Self::drain(
            &self.bus,
            &self.clock,
            &mut self.io_sq,
            &mut self.io_cq,
            IO_QUEUE_ID,
            self.dstrd,
            pending,
        )
        .map(|_| ())
    }
}

/// Block device view of one namespace.
pub struct NvmeBlockDev<'c, B: MmioBus, C: Clock> {
    ctlr: &'c mut NvmeCtlr<B, C>,
    info: NamespaceInfo,
}

impl<B: MmioBus, C: Clock> NvmeBlockDev<'_, B, C> {
    /// Returns the namespace ID this device addresses.
    #[must_use]
    pub fn nsid(&self) -> u32 {
        self.info.nsid
    }
}

impl<B: MmioBus, C: Clock> BlockDevice for NvmeBlockDev<'_, B, C> {
    type Error = NvmeError;

    fn block_size(&self) -> u32 {
        self.info.block_size
    }

    fn block_count(&self) -> u64 {
        self.info.block_count
    }

    fn read_blocks(&mut self, lba: u64, count: u64, buf: &mut DmaBuffer) -> NvmeResult<u64> {
        if !check_transfer(lba, count, self.info.block_count, self.info.block_size, buf.len()) {
            return Err(NvmeError::InvalidParameter);
        }
        self.ctlr
            .transfer(self.info.nsid, cmd::io_opc::READ, lba, count, self.info.block_size, buf.bus_addr())
    }

    fn write_blocks(&mut self, lba: u64, count: u64, buf: &DmaBuffer) -> NvmeResult<u64> {
        if !check_transfer(lba, count, self.info.block_count, self.info.block_size, buf.len()) {
            return Err(NvmeError::InvalidParameter);
        }
        self.ctlr
            .transfer(self.info.nsid, cmd::io_opc::WRITE, lba, count, self.info.block_size, buf.bus_addr())
    }
}

impl<B: MmioBus, C: Clock> DeviceHealth for NvmeBlockDev<'_, B, C> {
    type Error = NvmeError;

    fn health_info(&mut self, out: &mut [u8]) -> NvmeResult<()> {
        if out.len() != identify::SMART_LOG_SIZE {
            log::warn!("health_info: buffer must be {} bytes", identify::SMART_LOG_SIZE);
            return Err(NvmeError::InvalidParameter);
        }
        self.ctlr.get_log_page(cmd::log_page::SMART, out)
    }

    fn self_test_log(&mut self, out: &mut [u8]) -> NvmeResult<()> {
        if !self.ctlr.self_test_supported() {
            return Err(NvmeError::Unsupported);
        }
        if out.len() != identify::SELF_TEST_LOG_SIZE {
            log::warn!("self_test_log: buffer must be {} bytes", identify::SELF_TEST_LOG_SIZE);
            return Err(NvmeError::InvalidParameter);
        }
        self.ctlr.get_log_page(cmd::log_page::SELF_TEST, out)
    }

    fn self_test_control(&mut self, action: SelfTestAction) -> NvmeResult<()> {
        let code = match action {
            SelfTestAction::Short => cmd::self_test::SHORT,
            SelfTestAction::Extended => cmd::self_test::EXTENDED,
            SelfTestAction::Abort => cmd::self_test::ABORT,
        };
        self.ctlr.device_self_test(code)
    }

    fn self_test_support(&self) -> SelfTestSupport {
        let available = self.ctlr.self_test_supported();
        SelfTestSupport {
            short_test: available,
            extended_test: available,
        }
    }
}
