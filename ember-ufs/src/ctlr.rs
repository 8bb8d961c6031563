//! Host controller driver.
//!
//! [`UfsCtlr`] owns the controller registers and a small DMA area holding
//! the transfer request list and a single command descriptor. Bring-up
//! follows the JESD223D initialisation sequence: enable the host, start
//! the link, walk the device through its boot handshake one query at a
//! time, then negotiate the fastest transfer mode both ends support.
//! Requests run one at a time in slot zero and completion is detected by
//! polling; interrupts stay off throughout.

use ember_blockdev::{check_transfer, BlockDevice};
use ember_mmio::{barrier, MmioBus};
use ember_pal::{Clock, Deadline, DmaBuffer, DmaRegion};
use zerocopy::byteorder::{U16, U32};
use zerocopy::FromZeros;

use crate::desc::{self, Descriptor, RefClkFreq, DESCRIPTOR_MAX_SIZE};
use crate::error::{UfsError, UfsResult};
use crate::regs;
use crate::scsi;
use crate::uic::{self, GearSettings, TransferMode};
use crate::upiu::{self, CommandUpiu, QueryUpiu, ResponseUpiu, UpiuHeader};
use crate::utp::{self, TransferReqDesc};

/// Number of logical units a device can expose.
pub const MAX_LUNS: usize = 32;

const HCE_DISABLE_TIMEOUT_US: u64 = 10_000;
const HCE_ENABLE_TIMEOUT_US: u64 = 100_000;
const LINK_STARTUP_TIMEOUT_US: u64 = 10_000;
const UIC_TIMEOUT_US: u64 = 100_000;
const POWER_MODE_TIMEOUT_US: u64 = 500_000;
const REQUEST_TIMEOUT_US: u64 = 30_000_000;
const DEVICE_INIT_TIMEOUT_US: u64 = 5_000_000;

const SETUP_RETRIES: u32 = 5;
const LINK_STARTUP_RETRIES: u32 = 5;
const NOP_RETRIES: u32 = 10;
const UIC_PEER_RETRIES: u32 = 3;
const BUSY_RETRIES: u32 = 3;

/// Driver configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct UfsConfig {
    /// Reference clock frequency to program into the device. Leave unset
    /// when the boot firmware has already done so.
    pub ref_clk: Option<RefClkFreq>,
}

/// Board hooks invoked at fixed points of controller bring-up.
///
/// Clock, reset and PHY programming that sits outside the host controller
/// register file goes here. Every method defaults to doing nothing, so
/// boards only implement the points they care about. An error from a hook
/// aborts the setup step that invoked it.
pub trait UfsHooks<B: MmioBus> {
    /// Called after the controller has been disabled, before it is
    /// enabled again.
    fn pre_hce_enable(&mut self, bus: &B) -> UfsResult<()> {
        let _ = bus;
        Ok(())
    }

    /// Called once the controller is enabled, before link startup.
    fn pre_link_startup(&mut self, bus: &B) -> UfsResult<()> {
        let _ = bus;
        Ok(())
    }

    /// Called once the link is up.
    fn post_link_startup(&mut self, bus: &B) -> UfsResult<()> {
        let _ = bus;
        Ok(())
    }

    /// Called before a power mode change. `mode` may be adjusted to
    /// account for board limits such as trace length or lane wiring.
    fn pre_gear_switch(&mut self, bus: &B, mode: &mut TransferMode) -> UfsResult<()> {
        let _ = (bus, mode);
        Ok(())
    }

    /// Called after a successful power mode change.
    fn post_gear_switch(&mut self, bus: &B, mode: &TransferMode) -> UfsResult<()> {
        let _ = (bus, mode);
        Ok(())
    }
}

/// Hook implementation for boards that need no extra programming.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl<B: MmioBus> UfsHooks<B> for NoHooks {}

/// Geometry of an active logical unit.
#[derive(Clone, Copy, Debug)]
struct LunInfo {
    block_size: u32,
    block_count: u64,
}

/// A UFS host controller.
///
/// The driver is fully polled and issues one request at a time, which is
/// all a boot environment needs. `B` abstracts the register bus, `C` the
/// time source and `H` the board hooks.
pub struct UfsCtlr<B: MmioBus, C: Clock, H: UfsHooks<B> = NoHooks> {
    bus: B,
    clock: C,
    hooks: H,
    config: UfsConfig,
    dma: DmaBuffer,
    initialized: bool,
    max_mode: Option<TransferMode>,
    device_desc: Option<Descriptor>,
    luns: [Option<LunInfo>; MAX_LUNS],
}

impl<B: MmioBus, C: Clock> UfsCtlr<B, C> {
    /// Creates a driver without board hooks.
    ///
    /// Carves the transfer request list and command descriptor out of
    /// `dma`. The controller is untouched until [`setup`](Self::setup).
    pub fn new(bus: B, clock: C, dma: &mut DmaRegion, config: UfsConfig) -> UfsResult<Self> {
        Self::with_hooks(bus, clock, NoHooks, dma, config)
    }
}

impl<B: MmioBus, C: Clock, H: UfsHooks<B>> UfsCtlr<B, C, H> {
    /// Creates a driver with board hooks.
    pub fn with_hooks(
        bus: B,
        clock: C,
        hooks: H,
        dma: &mut DmaRegion,
        config: UfsConfig,
    ) -> UfsResult<Self> {
        let dma = dma
            .alloc(utp::DMA_SIZE, utp::DMA_ALIGN)
            .ok_or(UfsError::OutOfMemory)?;
        Ok(Self {
            bus,
            clock,
            hooks,
            config,
            dma,
            initialized: false,
            max_mode: None,
            device_desc: None,
            luns: [None; MAX_LUNS],
        })
    }

    /// Brings the controller and device to the point where logical units
    /// can be scanned. Does nothing once it has succeeded.
    pub fn setup(&mut self) -> UfsResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.max_mode = None;
        self.device_desc = None;
        self.luns = [None; MAX_LUNS];

        self.utp_init()?;
        self.ping()?;
        self.device_init()?;
        if let Some(freq) = self.config.ref_clk {
            self.write_attr(desc::attr::REF_CLK_FREQ, freq as u32)?;
        }
        let device_desc = self.read_descriptor(desc::idn::DEVICE, 0)?;
        let device = device_desc.device()?;
        let lu_count = device.lu_count;
        log::debug!(
            "setup: ufs device {:#06x}, {} logical units",
            device.spec_version.get(),
            lu_count
        );
        self.device_desc = Some(device_desc);

        // A device without logical units has nothing to transfer, so the
        // link can stay in its startup gear.
        if lu_count > 0 {
            let mode = self.probe_transfer_mode()?;
            self.set_gear(mode)?;
        }

        self.initialized = true;
        Ok(())
    }

    /// Runs [`setup`](Self::setup), retrying from scratch on failure.
    ///
    /// Marginal links occasionally fail partway through bring-up and
    /// recover on the next full attempt.
    pub fn setup_retry(&mut self) -> UfsResult<()> {
        let mut attempt = 1;
        loop {
            match self.setup() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < SETUP_RETRIES => {
                    attempt += 1;
                    log::warn!("setup_retry: setup failed ({}), retrying", err);
                }
                Err(err) => {
                    log::warn!("setup_retry: giving up after {} attempts", SETUP_RETRIES);
                    return Err(err);
                }
            }
        }
    }

    /// Probes logical units until the count the device reports is found,
    /// and returns that count.
    ///
    /// Runs [`setup_retry`](Self::setup_retry) first when needed. Disabled
    /// units are skipped; units found by an earlier scan are kept without
    /// re-probing; any other per-unit failure aborts the scan.
    pub fn scan(&mut self) -> UfsResult<usize> {
        if !self.initialized {
            self.setup_retry()?;
        }
        let total = match self.device_desc.as_ref() {
            Some(device_desc) => device_desc.device()?.lu_count,
            None => 0,
        };
        let mut active = 0;
        for lun in 0..MAX_LUNS as u8 {
            if active >= usize::from(total) {
                break;
            }
            if self.luns[usize::from(lun)].is_some() {
                active += 1;
                continue;
            }
            match self.setup_lun(lun) {
                Ok(()) => active += 1,
                Err(UfsError::LunDisabled) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(active)
    }

    /// Returns a block device handle for an active logical unit.
    pub fn block_dev(&mut self, lun: u8) -> UfsResult<UfsBlockDev<'_, B, C, H>> {
        let info = *self
            .luns
            .get(usize::from(lun))
            .and_then(|slot| slot.as_ref())
            .ok_or(UfsError::LunDisabled)?;
        Ok(UfsBlockDev {
            ctlr: self,
            lun,
            info,
        })
    }

    /// Returns the cached device descriptor, once
    /// [`setup`](Self::setup) has read it.
    #[must_use]
    pub fn device_descriptor(&self) -> Option<&Descriptor> {
        self.device_desc.as_ref()
    }

    /// Reads a descriptor from the device.
    pub fn read_descriptor(&mut self, idn: u8, index: u8) -> UfsResult<Descriptor> {
        let mut raw = [0u8; DESCRIPTOR_MAX_SIZE];
        let len = self.query(
            upiu::query_op::READ_DESCRIPTOR,
            idn,
            index,
            0,
            Some(&mut raw),
        )?;
        let len = len.min(DESCRIPTOR_MAX_SIZE as u32) as u8;
        if len < 2 || raw[1] != idn {
            log::warn!(
                "read_descriptor: got descriptor {:#x} of {} bytes, wanted {:#x}",
                raw[1],
                len,
                idn
            );
            return Err(UfsError::Io);
        }
        Ok(Descriptor::new(len, raw))
    }

    /// Reads an attribute.
    pub fn read_attr(&mut self, idn: u8) -> UfsResult<u32> {
        self.query(upiu::query_op::READ_ATTR, idn, 0, 0, None)
    }

    /// Writes an attribute.
    pub fn write_attr(&mut self, idn: u8, value: u32) -> UfsResult<()> {
        self.query(upiu::query_op::WRITE_ATTR, idn, 0, value, None)
            .map(|_| ())
    }

    /// Reads a flag.
    pub fn read_flag(&mut self, idn: u8) -> UfsResult<u8> {
        self.query(upiu::query_op::READ_FLAG, idn, 0, 0, None)
            .map(|value| value as u8)
    }

    /// Sets a flag.
    pub fn set_flag(&mut self, idn: u8) -> UfsResult<()> {
        self.query(upiu::query_op::SET_FLAG, idn, 0, 0, None)
            .map(|_| ())
    }

    fn setup_lun(&mut self, lun: u8) -> UfsResult<()> {
        let descriptor = self.read_descriptor(desc::idn::UNIT, lun)?;
        let unit = descriptor.unit()?;
        if unit.lu_enable == 0 {
            return Err(UfsError::LunDisabled);
        }
        if unit.logical_block_size >= 32 {
            log::warn!(
                "setup_lun: lun {} has unusable block size shift {}",
                lun,
                unit.logical_block_size
            );
            return Err(UfsError::Protocol);
        }
        let info = LunInfo {
            block_size: 1u32 << unit.logical_block_size,
            block_count: unit.logical_block_count.get(),
        };

        self.scsi_command(lun, scsi::test_unit_ready_cdb(), 0, 0, 0)?;

        log::debug!(
            "setup_lun: lun {} ready, {} blocks of {} bytes",
            lun,
            info.block_count,
            info.block_size
        );
        self.luns[usize::from(lun)] = Some(info);
        Ok(())
    }

    /// Reads the lane counts and gear limits both ends agree on.
    fn probe_transfer_mode(&mut self) -> UfsResult<TransferMode> {
        if let Some(mode) = self.max_mode {
            return Ok(mode);
        }
        let rx_lanes = self.dme_get(uic::pa::CONNECTED_RX_DATA_LANES).unwrap_or(0);
        let tx_lanes = self.dme_get(uic::pa::CONNECTED_TX_DATA_LANES).unwrap_or(0);
        if rx_lanes == 0 || tx_lanes == 0 {
            log::warn!("probe_transfer_mode: no connected data lanes");
            return Err(UfsError::InvalidParameter);
        }
        // The transmit direction is limited by what the device side can
        // receive, so its gear comes from the peer attributes.
        let rx = self.lane_capability(rx_lanes, false)?;
        let tx = self.lane_capability(tx_lanes, true)?;
        let mode = TransferMode {
            hs_series: uic::hs_series::B,
            rx,
            tx,
        };
        self.max_mode = Some(mode);
        Ok(mode)
    }

    fn lane_capability(&mut self, lanes: u32, peer: bool) -> UfsResult<GearSettings> {
        let hs_gear = if peer {
            self.dme_peer_get(uic::pa::MAX_RX_HS_GEAR)?
        } else {
            self.dme_get(uic::pa::MAX_RX_HS_GEAR)?
        };
        let (power_mode, gear) = if hs_gear != 0 {
            (uic::power_mode::FAST, hs_gear)
        } else {
            let pwm_gear = if peer {
                self.dme_peer_get(uic::pa::MAX_RX_PWM_GEAR)?
            } else {
                self.dme_get(uic::pa::MAX_RX_PWM_GEAR)?
            };
            (uic::power_mode::SLOW, pwm_gear)
        };
        if gear == 0 {
            log::warn!("lane_capability: no usable gear reported");
            return Err(UfsError::InvalidParameter);
        }
        Ok(GearSettings {
            power_mode,
            lanes,
            gear,
        })
    }

    /// Switches the link to `target`, going through an automatic mode
    /// first where the stack is new enough to support it.
    fn set_gear(&mut self, target: TransferMode) -> UfsResult<()> {
        if target.any_fast() {
            let local = self.dme_get(uic::pa::LOCAL_VER_INFO).unwrap_or(0);
            let remote = self.dme_get(uic::pa::REMOTE_VER_INFO).unwrap_or(0);
            if local & uic::ver::MASK >= uic::ver::UNIPRO_1_8
                && remote & uic::ver::MASK >= uic::ver::UNIPRO_1_8
            {
                self.gear_switch(target.as_fast_auto())?;
            }
        }
        self.gear_switch(target)
    }

    fn gear_switch(&mut self, mut mode: TransferMode) -> UfsResult<()> {
        self.hooks.pre_gear_switch(&self.bus, &mut mode)?;
        self.bus.write32(regs::IS, regs::is::UPMS);

        self.dme_set(uic::pa::ACTIVE_TX_DATA_LANES, mode.tx.lanes)?;
        self.dme_set(uic::pa::ACTIVE_RX_DATA_LANES, mode.rx.lanes)?;
        self.dme_set(uic::pa::RX_GEAR, mode.rx.gear)?;
        self.dme_set(uic::pa::TX_GEAR, mode.tx.gear)?;
        self.dme_set(
            uic::pa::TX_TERMINATION,
            uic::is_fast_mode(mode.tx.power_mode) as u32,
        )?;
        self.dme_set(
            uic::pa::RX_TERMINATION,
            uic::is_fast_mode(mode.rx.power_mode) as u32,
        )?;
        if mode.any_fast() {
            self.dme_set(uic::pa::HS_SERIES, mode.hs_series)?;
        }

        // Flow control timers, once as power mode user data for the
        // peer and once for the local data link layer.
        self.dme_set(uic::pa::pwr_mode_user_data(0), uic::timer::FC0_PROT_TIMEOUT)?;
        self.dme_set(uic::pa::pwr_mode_user_data(1), uic::timer::TC0_REPLAY_TIMEOUT)?;
        self.dme_set(uic::pa::pwr_mode_user_data(2), uic::timer::AFC0_REQ_TIMEOUT)?;
        self.dme_set(uic::pa::pwr_mode_user_data(3), uic::timer::FC0_PROT_TIMEOUT)?;
        self.dme_set(uic::pa::pwr_mode_user_data(4), uic::timer::TC0_REPLAY_TIMEOUT)?;
        self.dme_set(uic::pa::pwr_mode_user_data(5), uic::timer::AFC0_REQ_TIMEOUT)?;
        self.dme_set(uic::dl::FC0_PROT_TIMEOUT, uic::timer::FC0_PROT_TIMEOUT)?;
        self.dme_set(uic::dl::TC0_REPLAY_TIMEOUT, uic::timer::TC0_REPLAY_TIMEOUT)?;
        self.dme_set(uic::dl::AFC0_REQ_TIMEOUT, uic::timer::AFC0_REQ_TIMEOUT)?;

        self.dme_set(uic::pa::PWR_MODE, mode.pwr_mode_request())?;
        self.poll_completion(regs::is::UPMS, 0, POWER_MODE_TIMEOUT_US)?;

        let status = regs::hcs::upmcrs(self.bus.read32(regs::HCS));
        if status != regs::hcs::UPMCRS_PWR_LOCAL {
            log::warn!("gear_switch: power mode change failed with status {}", status);
            return Err(UfsError::Io);
        }
        self.hooks.post_gear_switch(&self.bus, &mode)?;
        Ok(())
    }

    /// Sets `fDeviceInit` and waits for the device to clear it, at which
    /// point the boot sequence is complete.
    fn device_init(&mut self) -> UfsResult<()> {
        self.set_flag(desc::flag::DEVICE_INIT)?;
        let deadline = Deadline::after_us(&self.clock, DEVICE_INIT_TIMEOUT_US);
        loop {
            let timed_out = deadline.expired(&self.clock);
            if self.read_flag(desc::flag::DEVICE_INIT)? == 0 {
                return Ok(());
            }
            if timed_out {
                log::warn!("device_init: fDeviceInit did not clear");
                return Err(UfsError::Timeout);
            }
            self.clock.delay_ms(1);
        }
    }

    /// Exchanges NOP UPIUs until the device answers.
    fn ping(&mut self) -> UfsResult<()> {
        let mut last = UfsError::Io;
        for attempt in 0..NOP_RETRIES {
            match self.nop() {
                Ok(()) => {
                    if attempt > 0 {
                        log::debug!("ping: device answered after {} attempts", attempt + 1);
                    }
                    return Ok(());
                }
                Err(err) => last = err,
            }
        }
        log::warn!("ping: no response to nop ({})", last);
        Err(last)
    }

    fn nop(&mut self) -> UfsResult<()> {
        let tag = utp::DEFAULT_TAG;
        self.dma.fill(utp::cmd_upiu_offset(tag), utp::UPIU_SIZE, 0);
        self.dma.fill(utp::resp_upiu_offset(tag), utp::UPIU_SIZE, 0);

        let mut header = UpiuHeader::new_zeroed();
        header.trans_type = upiu::trans::NOP_OUT;
        header.task_tag = tag;
        self.dma.write(utp::cmd_upiu_offset(tag), header);

        let utrd = TransferReqDesc::for_slot(tag, utp::dword0::DDIR_NONE, 0, self.dma.bus_addr());
        self.dma.write(utp::utrd_offset(tag), utrd);

        self.process_request(tag)?;
        self.check_ocs(tag)?;

        let resp: UpiuHeader = self.dma.read(utp::resp_upiu_offset(tag));
        if resp.trans_type != upiu::trans::NOP_IN {
            log::warn!("nop: unexpected response type {:#x}", resp.trans_type);
            return Err(UfsError::Protocol);
        }
        Ok(())
    }

    /// Issues one query request and returns the value it carries: the
    /// descriptor length for descriptor reads, the attribute value for
    /// attribute reads and the flag value for flag reads.
    fn query(
        &mut self,
        opcode: u8,
        idn: u8,
        index: u8,
        value: u32,
        out: Option<&mut [u8]>,
    ) -> UfsResult<u32> {
        let tag = utp::DEFAULT_TAG;
        self.dma.fill(utp::cmd_upiu_offset(tag), utp::UPIU_SIZE, 0);
        self.dma.fill(utp::resp_upiu_offset(tag), utp::UPIU_SIZE, 0);

        let mut req = QueryUpiu::new_zeroed();
        req.header.trans_type = upiu::trans::QUERY_REQUEST;
        req.header.task_tag = tag;
        req.header.function = upiu::query_op::function(opcode);
        req.opcode = opcode;
        req.idn = idn;
        req.index = index;
        match opcode {
            upiu::query_op::READ_DESCRIPTOR => {
                let want = out.as_ref().map_or(0, |out| out.len());
                req.data_len = U16::new(want.min(DESCRIPTOR_MAX_SIZE) as u16);
            }
            upiu::query_op::WRITE_ATTR => req.attr_val = U32::new(value),
            _ => {}
        }
        self.dma.write(utp::cmd_upiu_offset(tag), req);

        let utrd = TransferReqDesc::for_slot(tag, utp::dword0::DDIR_NONE, 0, self.dma.bus_addr());
        self.dma.write(utp::utrd_offset(tag), utrd);

        self.process_request(tag)?;
        self.check_ocs(tag)?;

        let resp: QueryUpiu = self.dma.read(utp::resp_upiu_offset(tag));
        if resp.header.trans_type != upiu::trans::QUERY_RESPONSE {
            log::warn!(
                "query: unexpected response type {:#x}",
                resp.header.trans_type
            );
            return Err(UfsError::Protocol);
        }
        if resp.header.response != 0 || resp.opcode != opcode {
            log::warn!(
                "query: opcode {:#x} idn {:#x} failed with response {:#x}",
                opcode,
                idn,
                resp.header.response
            );
            return Err(UfsError::Protocol);
        }

        if let Some(out) = out {
            let len = usize::from(resp.data_len.get()).min(out.len());
            self.dma.read_bytes(
                utp::resp_upiu_offset(tag) + size_of::<QueryUpiu>(),
                &mut out[..len],
            );
        }
        Ok(match opcode {
            upiu::query_op::READ_DESCRIPTOR => u32::from(resp.data_len.get()),
            upiu::query_op::READ_ATTR => resp.attr_val.get(),
            upiu::query_op::READ_FLAG => u32::from(resp.flag_val()),
            _ => 0,
        })
    }

    /// Issues a SCSI command, retrying through unit attention and busy
    /// conditions.
    fn scsi_command(
        &mut self,
        lun: u8,
        cdb: [u8; 16],
        flags: u8,
        buf_addr: u64,
        len: usize,
    ) -> UfsResult<()> {
        let mut busy_retries = BUSY_RETRIES;
        loop {
            let mut rc = self.do_scsi_command(lun, cdb, flags, buf_addr, len);
            if rc == Err(UfsError::UnitAttention) {
                // The attention is reported once; the repeat sees the
                // real state.
                rc = self.do_scsi_command(lun, cdb, flags, buf_addr, len);
            }
            match rc {
                Ok(()) => return Ok(()),
                Err(UfsError::Busy) if busy_retries > 0 => busy_retries -= 1,
                Err(err) => {
                    log::warn!("scsi_command: op {:#x} on lun {} failed ({})", cdb[0], lun, err);
                    return Err(err);
                }
            }
        }
    }

    fn do_scsi_command(
        &mut self,
        lun: u8,
        cdb: [u8; 16],
        flags: u8,
        buf_addr: u64,
        len: usize,
    ) -> UfsResult<()> {
        if buf_addr % 4 != 0 || len % 4 != 0 {
            log::warn!("do_scsi_command: unaligned data {:#x}+{}", buf_addr, len);
            return Err(UfsError::InvalidParameter);
        }
        let tag = utp::DEFAULT_TAG;
        self.dma.fill(utp::cmd_upiu_offset(tag), utp::UPIU_SIZE, 0);
        self.dma.fill(utp::resp_upiu_offset(tag), utp::UPIU_SIZE, 0);

        let mut cmd = CommandUpiu::new_zeroed();
        cmd.header.trans_type = upiu::trans::COMMAND;
        cmd.header.flags = flags;
        cmd.header.lun = lun;
        cmd.header.task_tag = tag;
        cmd.header.cmd_set = upiu::CMD_SET_SCSI;
        cmd.transfer_len = U32::new(len as u32);
        cmd.cdb = cdb;
        self.dma.write(utp::cmd_upiu_offset(tag), cmd);

        let ddir = if flags & upiu::flags::READ != 0 {
            utp::dword0::DDIR_FROM_DEVICE
        } else if flags & upiu::flags::WRITE != 0 {
            utp::dword0::DDIR_TO_DEVICE
        } else {
            utp::dword0::DDIR_NONE
        };
        let prdt_entries = utp::build_prdt(&mut self.dma, tag, buf_addr, len);
        let utrd = TransferReqDesc::for_slot(tag, ddir, prdt_entries, self.dma.bus_addr());
        self.dma.write(utp::utrd_offset(tag), utrd);

        self.process_request(tag)?;
        self.check_ocs(tag)?;

        let resp: ResponseUpiu = self.dma.read(utp::resp_upiu_offset(tag));
        if resp.header.trans_type != upiu::trans::RESPONSE {
            log::warn!(
                "do_scsi_command: unexpected response type {:#x}",
                resp.header.trans_type
            );
            return Err(UfsError::Protocol);
        }
        if resp.header.status == scsi::status::CHECK_CONDITION
            && resp.header.data_segment_len.get() != 0
        {
            let sense: scsi::SenseData = self
                .dma
                .read(utp::resp_upiu_offset(tag) + size_of::<ResponseUpiu>());
            return scsi::check_sense(resp.header.data_segment_len.get(), &sense);
        }
        if resp.header.response != 0 {
            log::warn!("do_scsi_command: target failure {:#x}", resp.header.response);
            return Err(UfsError::Protocol);
        }
        match resp.header.status {
            scsi::status::GOOD => Ok(()),
            scsi::status::BUSY => Err(UfsError::Busy),
            status => {
                log::warn!("do_scsi_command: scsi status {:#x}", status);
                Err(UfsError::Io)
            }
        }
    }

    /// Resets the controller, starts the link and hands it the transfer
    /// request list.
    fn utp_init(&mut self) -> UfsResult<()> {
        // The enable bit must go through zero to discard state left over
        // from firmware.
        self.bus.write32(regs::HCE, 0);
        self.wait_register(regs::HCE, 1, 0, HCE_DISABLE_TIMEOUT_US)?;
        self.hooks.pre_hce_enable(&self.bus)?;
        self.bus.write32(regs::HCE, 1);
        // The bit reads back set before the controller is actually ready.
        self.clock.delay_ms(1);
        self.wait_register(regs::HCE, 1, 1, HCE_ENABLE_TIMEOUT_US)?;
        self.bus.write32(regs::IE, 0);

        self.hooks.pre_link_startup(&self.bus)?;
        self.link_startup()?;
        self.hooks.post_link_startup(&self.bus)?;

        self.dma.fill(0, utp::DMA_SIZE, 0);
        self.bus.write32(regs::UTRLBA, self.dma.bus_addr() as u32);
        self.bus
            .write32(regs::UTRLBAU, (self.dma.bus_addr() >> 32) as u32);
        self.bus.write32(regs::UTRLRSR, 1);
        Ok(())
    }

    fn link_startup(&mut self) -> UfsResult<()> {
        for attempt in 0..LINK_STARTUP_RETRIES {
            if let Err(err) = self.uic_getset(uic::dme::LINK_STARTUP, 0, 0) {
                log::warn!("link_startup: dme command failed ({}), retrying", err);
                continue;
            }
            if self
                .wait_register(regs::HCS, regs::hcs::DP, regs::hcs::DP, LINK_STARTUP_TIMEOUT_US)
                .is_ok()
            {
                if attempt > 0 {
                    log::debug!("link_startup: link up after {} attempts", attempt + 1);
                }
                return Ok(());
            }
            // The device may still be coming out of reset. Wait for it
            // to signal readiness, then go again.
            let _ = self.wait_register(
                regs::IS,
                regs::is::ULSS,
                regs::is::ULSS,
                LINK_STARTUP_TIMEOUT_US,
            );
            self.bus.write32(regs::IS, regs::is::ULSS);
            log::debug!("link_startup: no device present, retrying");
        }
        log::warn!("link_startup: giving up");
        Err(UfsError::Timeout)
    }

    fn dme_get(&mut self, attr: u32) -> UfsResult<u32> {
        self.uic_getset(uic::dme::GET, uic::mib_attr_sel(attr, 0), 0)
    }

    fn dme_peer_get(&mut self, attr: u32) -> UfsResult<u32> {
        self.uic_getset(uic::dme::PEER_GET, uic::mib_attr_sel(attr, 0), 0)
    }

    fn dme_set(&mut self, attr: u32, value: u32) -> UfsResult<()> {
        self.uic_getset(uic::dme::SET, uic::mib_attr_sel(attr, 0), value)
            .map(|_| ())
    }

    /// Issues a UIC command, retrying peer accesses which are carried
    /// over the link and can fail transiently.
    fn uic_getset(&mut self, cmd: u32, attr: u32, set_val: u32) -> UfsResult<u32> {
        let retries = match cmd {
            uic::dme::PEER_GET | uic::dme::PEER_SET => UIC_PEER_RETRIES,
            _ => 0,
        };
        let mut attempt = 0;
        loop {
            match self.uic_do_getset(cmd, attr, set_val) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    log::debug!("uic_getset: peer access failed ({}), retrying", err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn uic_do_getset(&mut self, cmd: u32, attr: u32, set_val: u32) -> UfsResult<u32> {
        self.wait_register(regs::HCS, regs::hcs::UCRDY, regs::hcs::UCRDY, UIC_TIMEOUT_US)
            .map_err(|_| UfsError::Io)?;
        self.bus.write32(regs::IS, regs::is::UCCS);

        let arg2 = match cmd {
            uic::dme::SET | uic::dme::PEER_SET => uic::attr_set_type(uic::ATTR_SET_NORMAL),
            _ => 0,
        };
        self.bus.write32(regs::UICCMDARG1, attr);
        self.bus.write32(regs::UICCMDARG2, arg2);
        self.bus.write32(regs::UICCMDARG3, set_val);
        self.bus.write32(regs::UICCMD, cmd);

        self.poll_completion(regs::is::UCCS, 0, UIC_TIMEOUT_US)
            .map_err(|_| UfsError::Io)?;

        let result = self.bus.read32(regs::UICCMDARG2) & uic::RESULT_MASK;
        if result != 0 {
            log::warn!(
                "uic_do_getset: command {:#x} attr {:#x} failed with {:#x}",
                cmd,
                attr >> 16,
                result
            );
            return Err(UfsError::Io);
        }
        Ok(match cmd {
            uic::dme::GET | uic::dme::PEER_GET => self.bus.read32(regs::UICCMDARG3),
            _ => 0,
        })
    }

    /// Rings the doorbell for `tag` and waits for the slot to complete.
    fn process_request(&mut self, tag: u8) -> UfsResult<()> {
        let bit = 1u32 << tag;
        self.bus.write32(regs::IS, regs::is::UE | regs::is::UTRCS);
        if self.bus.read32(regs::UTRLRSR) != 1 {
            log::warn!("process_request: transfer request list not running");
            return Err(UfsError::Io);
        }
        // Publish the descriptor and UPIU writes before the doorbell.
        barrier::write_barrier();
        self.bus.write32(regs::UTRLDBR, bit);
        match self.poll_completion(regs::is::UTRCS, bit, REQUEST_TIMEOUT_US) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Take the slot back so the next request can use it.
                self.bus.write32(regs::UTRLCLR, !bit);
                Err(err)
            }
        }
    }

    fn check_ocs(&self, tag: u8) -> UfsResult<()> {
        let utrd: TransferReqDesc = self.dma.read(utp::utrd_offset(tag));
        if utrd.ocs != utp::ocs::SUCCESS {
            log::warn!("check_ocs: request failed with ocs {:#x}", utrd.ocs);
            return Err(UfsError::Io);
        }
        Ok(())
    }

    /// Waits for `mask` to raise in the interrupt status register, and
    /// for `doorbell` to clear when nonzero.
    fn poll_completion(&self, mask: u32, doorbell: u32, timeout_us: u64) -> UfsResult<()> {
        let deadline = Deadline::after_us(&self.clock, timeout_us);
        loop {
            let timed_out = deadline.expired(&self.clock);
            let status = self.bus.read32(regs::IS);
            if status & mask != 0
                && (doorbell == 0 || self.bus.read32(regs::UTRLDBR) & doorbell == 0)
            {
                barrier::read_barrier();
                self.bus.write32(regs::IS, mask);
                return Ok(());
            }
            if status & regs::is::ALL_ERROR != 0 {
                self.host_error(status)?;
            }
            if timed_out {
                return Err(UfsError::Timeout);
            }
        }
    }

    /// Drains and reports the error status registers. Returns `Ok` for
    /// error noise that does not end the current operation.
    fn host_error(&self, status: u32) -> UfsResult<()> {
        let uecpa = self.bus.read32(regs::UECPA);
        let uecdl = self.bus.read32(regs::UECDL);
        let uecn = self.bus.read32(regs::UECN);
        let uect = self.bus.read32(regs::UECT);
        let uecdme = self.bus.read32(regs::UECDME);
        log::warn!(
            "host_error: is {:#x} pa {:#x} dl {:#x} n {:#x} t {:#x} dme {:#x}",
            status,
            uecpa,
            uecdl,
            uecn,
            uect,
            uecdme
        );
        self.bus.write32(regs::IS, regs::is::ALL_ERROR);
        if status & regs::is::FATAL != 0 {
            return Err(UfsError::Io);
        }
        if uecdl & regs::uecdl::PA_INIT_ERROR != 0 {
            return Err(UfsError::Io);
        }
        Ok(())
    }

    fn wait_register(
        &self,
        offset: usize,
        mask: u32,
        value: u32,
        timeout_us: u64,
    ) -> UfsResult<()> {
        let deadline = Deadline::after_us(&self.clock, timeout_us);
        loop {
            let timed_out = deadline.expired(&self.clock);
            if self.bus.read32(offset) & mask == value {
                return Ok(());
            }
            if timed_out {
                return Err(UfsError::Timeout);
            }
        }
    }
}

/// One active logical unit presented as a block device.
///
/// Handles borrow the controller, so transfers on different units take
/// turns; the single request slot serialises them anyway.
pub struct UfsBlockDev<'c, B: MmioBus, C: Clock, H: UfsHooks<B>> {
    ctlr: &'c mut UfsCtlr<B, C, H>,
    lun: u8,
    info: LunInfo,
}

impl<B: MmioBus, C: Clock, H: UfsHooks<B>> UfsBlockDev<'_, B, C, H> {
    /// Returns the logical unit number this handle addresses.
    #[must_use]
    pub fn lun(&self) -> u8 {
        self.lun
    }

    fn transfer(
        &mut self,
        lba: u64,
        count: u64,
        buf_addr: u64,
        buf_len: usize,
        flags: u8,
    ) -> UfsResult<u64> {
        if !check_transfer(lba, count, self.info.block_count, self.info.block_size, buf_len) {
            return Err(UfsError::InvalidParameter);
        }
        // 10-byte commands carry 32 bit block addresses.
        if lba.saturating_add(count) > u64::from(u32::MAX) + 1 {
            log::warn!("transfer: lba {} out of 10-byte command range", lba);
            return Err(UfsError::InvalidParameter);
        }
        let block_size = u64::from(self.info.block_size);
        let prdt_limit = (utp::MAX_PRDT_ENTRIES * utp::PRDT_DBC_MAX) as u64 / block_size;
        let max_blocks = scsi::MAX_BLOCKS_PER_CMD.min(prdt_limit);

        let mut done = 0u64;
        while done < count {
            let chunk = (count - done).min(max_blocks);
            let chunk_lba = (lba + done) as u32;
            let cdb = if flags & upiu::flags::READ != 0 {
                scsi::read10_cdb(chunk_lba, chunk as u16)
            } else {
                scsi::write10_cdb(chunk_lba, chunk as u16)
            };
            self.ctlr.scsi_command(
                self.lun,
                cdb,
                flags,
                buf_addr + done * block_size,
                (chunk * block_size) as usize,
            )?;
            done += chunk;
        }
        Ok(done)
    }
}

impl<B: MmioBus, C: Clock, H: UfsHooks<B>> BlockDevice for UfsBlockDev<'_, B, C, H> {
    type Error = UfsError;

    fn block_size(&self) -> u32 {
        self.info.block_size
    }

    fn block_count(&self) -> u64 {
        self.info.block_count
    }

    fn read_blocks(&mut self, lba: u64, count: u64, buf: &mut DmaBuffer) -> Result<u64, UfsError> {
        self.transfer(lba, count, buf.bus_addr(), buf.len(), upiu::flags::READ)
    }

    fn write_blocks(&mut self, lba: u64, count: u64, buf: &DmaBuffer) -> Result<u64, UfsError> {
        self.transfer(lba, count, buf.bus_addr(), buf.len(), upiu::flags::WRITE)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::cell::{Cell, RefCell, RefMut};
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::vec::Vec;

    use zerocopy::byteorder::U64;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::desc::{DeviceDescriptor, UnitDescriptor};
    use crate::utp::PrdtEntry;

    /// Clock that advances on its own so timeout paths stay short.
    struct TestClock {
        now: Cell<u64>,
    }

    impl TestClock {
        fn new() -> Self {
            Self { now: Cell::new(0) }
        }
    }

    impl Clock for TestClock {
        fn now_us(&self) -> u64 {
            let now = self.now.get();
            self.now.set(now + 500);
            now
        }

        fn delay_us(&self, us: u64) {
            self.now.set(self.now.get() + us);
        }
    }

    #[derive(Clone, Copy)]
    struct SimLun {
        block_size_shift: u8,
        block_count: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct SimCmd {
        lun: u8,
        opcode: u8,
        cdb1: u8,
        lba: u32,
        blocks: u16,
        transfer_len: u32,
    }

    /// Register-level model of a controller with one device behind it.
    /// Requests are completed synchronously from the doorbell write; DMA
    /// addresses double as CPU addresses.
    #[derive(Default)]
    struct DeviceState {
        hce: u32,
        is: u32,
        doorbell: u32,
        utrlba: u64,
        utrlrsr: u32,
        arg1: u32,
        arg2: u32,
        arg3: u32,
        link_up: bool,
        upmcrs: u32,
        mib: BTreeMap<u32, u32>,
        peer_mib: BTreeMap<u32, u32>,
        luns: [Option<SimLun>; 8],
        stall_hce: bool,
        link_failures: u32,
        pwr_failures: u32,
        nop_ignores: u32,
        device_init_polls: u32,
        busy_responses: u32,
        ua_pending: bool,
        sense_key: Option<u8>,
        link_startups: u32,
        nops: u32,
        desc_reads: u32,
        mib_writes: Vec<(u32, u32)>,
        attr_writes: Vec<(u8, u32)>,
        set_flags: Vec<u8>,
        commands: Vec<SimCmd>,
    }

    impl DeviceState {
        fn read32(&mut self, offset: usize) -> u32 {
            match offset {
                regs::HCE => self.hce,
                regs::IS => self.is,
                regs::HCS => {
                    let mut value =
                        regs::hcs::UCRDY | (self.upmcrs << regs::hcs::UPMCRS_SHIFT);
                    if self.link_up {
                        value |= regs::hcs::DP;
                    }
                    value
                }
                regs::UTRLDBR => self.doorbell,
                regs::UTRLRSR => self.utrlrsr,
                regs::UICCMDARG2 => self.arg2,
                regs::UICCMDARG3 => self.arg3,
                regs::UECPA | regs::UECDL | regs::UECN | regs::UECT | regs::UECDME => 0,
                other => panic!("unexpected register read at {other:#x}"),
            }
        }

        fn write32(&mut self, offset: usize, value: u32) {
            match offset {
                regs::HCE => {
                    if value & 1 == 0 && self.stall_hce {
                        // The disable request is accepted but never
                        // finishes; the bit keeps reading back set.
                        return;
                    }
                    self.hce = value & 1;
                    if self.hce == 0 {
                        self.link_up = false;
                        self.doorbell = 0;
                        self.utrlrsr = 0;
                    }
                }
                regs::IS => self.is &= !value,
                regs::IE => {}
                regs::UTRLBA => self.utrlba = (self.utrlba & !0xffff_ffff) | u64::from(value),
                regs::UTRLBAU => {
                    self.utrlba = (self.utrlba & 0xffff_ffff) | (u64::from(value) << 32);
                }
                regs::UTRLRSR => self.utrlrsr = value,
                regs::UTRLDBR => {
                    if value & 1 != 0 && self.utrlrsr == 1 {
                        self.doorbell |= 1;
                        self.process_request();
                    }
                }
                regs::UTRLCLR => self.doorbell &= value,
                regs::UICCMDARG1 => self.arg1 = value,
                regs::UICCMDARG2 => self.arg2 = value,
                regs::UICCMDARG3 => self.arg3 = value,
                regs::UICCMD => self.uic_command(value),
                other => panic!("unexpected register write at {other:#x}"),
            }
        }

        fn uic_command(&mut self, cmd: u32) {
            self.arg2 = 0;
            match cmd {
                uic::dme::LINK_STARTUP => {
                    self.link_startups += 1;
                    if self.link_failures > 0 {
                        self.link_failures -= 1;
                        self.is |= regs::is::ULSS;
                    } else {
                        self.link_up = true;
                    }
                }
                uic::dme::GET => match self.mib.get(&(self.arg1 >> 16)) {
                    Some(value) => self.arg3 = *value,
                    None => self.arg2 = 0x01,
                },
                uic::dme::PEER_GET => match self.peer_mib.get(&(self.arg1 >> 16)) {
                    Some(value) => self.arg3 = *value,
                    None => self.arg2 = 0x01,
                },
                uic::dme::SET => {
                    let attr = self.arg1 >> 16;
                    self.mib_writes.push((attr, self.arg3));
                    if attr == uic::pa::PWR_MODE {
                        if self.pwr_failures > 0 {
                            self.pwr_failures -= 1;
                            self.upmcrs = 2;
                            // The mode was too fast for the link; both
                            // ends come back advertising a slower gear.
                            self.mib.insert(uic::pa::MAX_RX_HS_GEAR, 1);
                            self.peer_mib.insert(uic::pa::MAX_RX_HS_GEAR, 1);
                        } else {
                            self.upmcrs = regs::hcs::UPMCRS_PWR_LOCAL;
                        }
                        self.is |= regs::is::UPMS;
                    }
                }
                uic::dme::PEER_SET => self.mib_writes.push((self.arg1 >> 16, self.arg3)),
                other => panic!("uic command {other:#x} not modelled"),
            }
            self.is |= regs::is::UCCS;
        }

        fn process_request(&mut self) {
            let utrd_addr = self.utrlba as usize + utp::utrd_offset(utp::DEFAULT_TAG);
            // SAFETY: the driver points the list registers at identity
            // mapped test memory.
            let mut utrd: TransferReqDesc =
                unsafe { core::ptr::read_unaligned(utrd_addr as *const _) };
            let ucd =
                (u64::from(utrd.ucdba.get()) | (u64::from(utrd.ucdbau.get()) << 32)) as usize;
            let resp = ucd + utrd.resp_offset.get() as usize * 4;

            // SAFETY: as above; the command descriptor lives in the same
            // identity mapped area.
            let header: UpiuHeader = unsafe { core::ptr::read_unaligned(ucd as *const _) };
            match header.trans_type {
                upiu::trans::NOP_OUT => {
                    self.nops += 1;
                    if self.nop_ignores > 0 {
                        self.nop_ignores -= 1;
                        // Swallow the request; the doorbell stays set.
                        return;
                    }
                    let mut out = UpiuHeader::new_zeroed();
                    out.trans_type = upiu::trans::NOP_IN;
                    out.task_tag = header.task_tag;
                    // SAFETY: the response area is identity mapped.
                    unsafe { core::ptr::write_unaligned(resp as *mut UpiuHeader, out) };
                }
                upiu::trans::QUERY_REQUEST => {
                    // SAFETY: as above.
                    let req: QueryUpiu = unsafe { core::ptr::read_unaligned(ucd as *const _) };
                    self.query(req, resp);
                }
                upiu::trans::COMMAND => {
                    // SAFETY: as above.
                    let cmd: CommandUpiu = unsafe { core::ptr::read_unaligned(ucd as *const _) };
                    self.scsi(cmd, ucd, resp, &utrd);
                }
                other => panic!("transaction {other:#x} not modelled"),
            }

            utrd.ocs = utp::ocs::SUCCESS;
            // SAFETY: writing back the completed descriptor.
            unsafe { core::ptr::write_unaligned(utrd_addr as *mut TransferReqDesc, utrd) };
            self.doorbell &= !1;
            self.is |= regs::is::UTRCS;
        }

        fn query(&mut self, req: QueryUpiu, resp: usize) {
            let mut out = req;
            out.header.trans_type = upiu::trans::QUERY_RESPONSE;
            match req.opcode {
                upiu::query_op::READ_DESCRIPTOR => {
                    self.desc_reads += 1;
                    let (bytes, len) = self.descriptor(req.idn, req.index);
                    out.data_len = U16::new(len as u16);
                    // SAFETY: the data segment follows the response UPIU
                    // in identity mapped memory.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            (resp + size_of::<QueryUpiu>()) as *mut u8,
                            len,
                        );
                    }
                }
                upiu::query_op::READ_FLAG => {
                    let value = if req.idn == desc::flag::DEVICE_INIT {
                        if self.device_init_polls > 0 {
                            self.device_init_polls -= 1;
                            1
                        } else {
                            0
                        }
                    } else {
                        0
                    };
                    out.attr_val = U32::new(value);
                }
                upiu::query_op::SET_FLAG => {
                    self.set_flags.push(req.idn);
                    out.attr_val = U32::new(1);
                }
                upiu::query_op::WRITE_ATTR => {
                    self.attr_writes.push((req.idn, req.attr_val.get()));
                }
                other => panic!("query opcode {other:#x} not modelled"),
            }
            // SAFETY: the response area is identity mapped.
            unsafe { core::ptr::write_unaligned(resp as *mut QueryUpiu, out) };
        }

        fn descriptor(&self, idn: u8, index: u8) -> ([u8; DESCRIPTOR_MAX_SIZE], usize) {
            let mut raw = [0u8; DESCRIPTOR_MAX_SIZE];
            match idn {
                desc::idn::DEVICE => {
                    let mut device = DeviceDescriptor::new_zeroed();
                    device.length = 31;
                    device.descriptor_idn = desc::idn::DEVICE;
                    device.lu_count = self.luns.iter().flatten().count() as u8;
                    device.spec_version = U16::new(0x0310);
                    raw[..31].copy_from_slice(device.as_bytes());
                    (raw, 31)
                }
                desc::idn::UNIT => {
                    let mut unit = UnitDescriptor::new_zeroed();
                    unit.length = 35;
                    unit.descriptor_idn = desc::idn::UNIT;
                    unit.unit_index = index;
                    if let Some(lun) = self.luns.get(usize::from(index)).copied().flatten() {
                        unit.lu_enable = 1;
                        unit.logical_block_size = lun.block_size_shift;
                        unit.logical_block_count = U64::new(lun.block_count);
                    }
                    raw[..35].copy_from_slice(unit.as_bytes());
                    (raw, 35)
                }
                other => panic!("descriptor idn {other:#x} not modelled"),
            }
        }

        fn scsi(&mut self, cmd: CommandUpiu, ucd: usize, resp: usize, utrd: &TransferReqDesc) {
            let opcode = cmd.cdb[0];
            self.commands.push(SimCmd {
                lun: cmd.header.lun,
                opcode,
                cdb1: cmd.cdb[1],
                lba: u32::from_be_bytes([cmd.cdb[2], cmd.cdb[3], cmd.cdb[4], cmd.cdb[5]]),
                blocks: u16::from_be_bytes([cmd.cdb[7], cmd.cdb[8]]),
                transfer_len: cmd.transfer_len.get(),
            });

            let mut out = ResponseUpiu::new_zeroed();
            out.header.trans_type = upiu::trans::RESPONSE;
            out.header.lun = cmd.header.lun;
            out.header.task_tag = cmd.header.task_tag;

            if self.ua_pending {
                self.ua_pending = false;
                Self::attach_sense(resp, &mut out, scsi::sense_key::UNIT_ATTENTION);
            } else if let Some(key) = self.sense_key.take() {
                Self::attach_sense(resp, &mut out, key);
            } else if self.busy_responses > 0 {
                self.busy_responses -= 1;
                out.header.status = scsi::status::BUSY;
            } else {
                out.header.status = scsi::status::GOOD;
                if opcode == scsi::READ_10 {
                    Self::fill_read_buffers(ucd, utrd);
                }
            }
            // SAFETY: the response area is identity mapped.
            unsafe { core::ptr::write_unaligned(resp as *mut ResponseUpiu, out) };
        }

        fn attach_sense(resp: usize, out: &mut ResponseUpiu, key: u8) {
            let mut sense = scsi::SenseData::new_zeroed();
            sense.len = U16::new(scsi::SENSE_LEN as u16);
            sense.sense.response_code = scsi::SENSE_FORMAT_FIXED;
            sense.sense.flags = key;
            // SAFETY: the sense segment follows the response UPIU in
            // identity mapped memory.
            unsafe {
                core::ptr::write_unaligned(
                    (resp + size_of::<ResponseUpiu>()) as *mut scsi::SenseData,
                    sense,
                );
            }
            out.header.status = scsi::status::CHECK_CONDITION;
            out.header.data_segment_len = U16::new(size_of::<scsi::SenseData>() as u16);
        }

        fn fill_read_buffers(ucd: usize, utrd: &TransferReqDesc) {
            let table = ucd + utrd.prdt_offset.get() as usize * 4;
            for i in 0..usize::from(utrd.prdt_len.get()) {
                // SAFETY: reading PRDT entries the driver just wrote.
                let entry: PrdtEntry = unsafe {
                    core::ptr::read_unaligned((table + i * utp::PRDT_ENTRY_SIZE) as *const _)
                };
                let len = entry.byte_count.get() as usize + 1;
                // SAFETY: the data buffer is identity mapped test memory.
                unsafe {
                    core::ptr::write_bytes(entry.base_addr.get() as usize as *mut u8, 0xa5, len);
                }
            }
        }
    }

    #[derive(Clone)]
    struct ModelBus {
        state: Rc<RefCell<DeviceState>>,
    }

    impl ModelBus {
        fn new(state: DeviceState) -> Self {
            Self {
                state: Rc::new(RefCell::new(state)),
            }
        }

        fn state(&self) -> RefMut<'_, DeviceState> {
            self.state.borrow_mut()
        }
    }

    impl MmioBus for ModelBus {
        fn read32(&self, offset: usize) -> u32 {
            self.state.borrow_mut().read32(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.state.borrow_mut().write32(offset, value)
        }
    }

    fn default_state() -> DeviceState {
        let mut state = DeviceState::default();
        state.device_init_polls = 1;
        state.mib.insert(uic::pa::CONNECTED_RX_DATA_LANES, 2);
        state.mib.insert(uic::pa::CONNECTED_TX_DATA_LANES, 2);
        state.mib.insert(uic::pa::MAX_RX_HS_GEAR, 3);
        state.mib.insert(uic::pa::MAX_RX_PWM_GEAR, 4);
        state.peer_mib.insert(uic::pa::MAX_RX_HS_GEAR, 3);
        state.peer_mib.insert(uic::pa::MAX_RX_PWM_GEAR, 4);
        state.luns[0] = Some(SimLun {
            block_size_shift: 12,
            block_count: 0x10000,
        });
        state
    }

    fn dma_region(size: usize) -> DmaRegion {
        let backing = std::vec![0u8; size + 4096].leak();
        let addr = backing.as_mut_ptr() as usize;
        let base = (addr + 4095) & !4095;
        // SAFETY: the backing memory is leaked and stays valid; the CPU
        // address doubles as the bus address.
        unsafe { DmaRegion::new(base, base as u64, size) }
    }

    fn build(
        state: DeviceState,
        config: UfsConfig,
        io_bytes: usize,
    ) -> (ModelBus, DmaRegion, UfsCtlr<ModelBus, TestClock>) {
        let bus = ModelBus::new(state);
        let mut region = dma_region(utp::DMA_SIZE + utp::DMA_ALIGN + io_bytes + 4096);
        let ctlr = UfsCtlr::new(bus.clone(), TestClock::new(), &mut region, config).unwrap();
        (bus, region, ctlr)
    }

    fn mib_values(state: &DeviceState, attr: u32) -> Vec<u32> {
        state
            .mib_writes
            .iter()
            .filter(|(written, _)| *written == attr)
            .map(|(_, value)| *value)
            .collect()
    }

    #[test]
    fn setup_completes_boot_sequence() {
        let (bus, _region, mut ctlr) = build(default_state(), UfsConfig::default(), 0);
        ctlr.setup().unwrap();

        let state = bus.state();
        assert_eq!(state.link_startups, 1);
        assert_eq!(state.nops, 1);
        assert_eq!(state.set_flags, [desc::flag::DEVICE_INIT]);
        assert!(state.attr_writes.is_empty());
        // Both directions high speed: fast mode in each nibble.
        assert_eq!(mib_values(&state, uic::pa::PWR_MODE), [0x11]);
        assert_eq!(mib_values(&state, uic::pa::HS_SERIES), [uic::hs_series::B]);
        assert_eq!(mib_values(&state, uic::pa::RX_GEAR), [3]);
        assert_eq!(mib_values(&state, uic::pa::TX_TERMINATION), [1]);
        assert_eq!(mib_values(&state, uic::pa::ACTIVE_RX_DATA_LANES), [2]);
        assert_eq!(
            mib_values(&state, uic::dl::AFC0_REQ_TIMEOUT),
            [uic::timer::AFC0_REQ_TIMEOUT]
        );
        drop(state);

        let device = ctlr.device_descriptor().unwrap().device().unwrap();
        assert_eq!(device.lu_count, 1);
    }

    #[test]
    fn second_setup_uses_cached_state() {
        let (bus, _region, mut ctlr) = build(default_state(), UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        let reads = bus.state().desc_reads;
        let nops = bus.state().nops;

        ctlr.setup().unwrap();
        let device = ctlr.device_descriptor().unwrap().device().unwrap();
        assert_eq!(device.lu_count, 1);
        assert_eq!(bus.state().desc_reads, reads);
        assert_eq!(bus.state().nops, nops);
    }

    #[test]
    fn setup_skips_gear_without_units() {
        let mut state = default_state();
        state.luns = [None; 8];
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(ctlr.scan().unwrap(), 0);
        assert!(mib_values(&bus.state(), uic::pa::PWR_MODE).is_empty());
    }

    #[test]
    fn setup_retries_link_startup() {
        let mut state = default_state();
        state.link_failures = 2;
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(bus.state().link_startups, 3);
    }

    #[test]
    fn setup_inserts_auto_mode_for_new_unipro() {
        let mut state = default_state();
        state.mib.insert(uic::pa::LOCAL_VER_INFO, uic::ver::UNIPRO_1_8);
        state.mib.insert(uic::pa::REMOTE_VER_INFO, uic::ver::UNIPRO_1_8);
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        // Automatic mode in both nibbles first, then the final fast mode.
        assert_eq!(mib_values(&bus.state(), uic::pa::PWR_MODE), [0x44, 0x11]);
    }

    #[test]
    fn setup_falls_back_to_pwm_gears() {
        let mut state = default_state();
        state.mib.insert(uic::pa::MAX_RX_HS_GEAR, 0);
        state.peer_mib.insert(uic::pa::MAX_RX_HS_GEAR, 0);
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();

        let state = bus.state();
        assert_eq!(mib_values(&state, uic::pa::PWR_MODE), [0x22]);
        assert_eq!(mib_values(&state, uic::pa::RX_GEAR), [4]);
        assert_eq!(mib_values(&state, uic::pa::TX_TERMINATION), [0]);
        assert!(mib_values(&state, uic::pa::HS_SERIES).is_empty());
    }

    #[test]
    fn gear_switch_checks_power_status() {
        let mut state = default_state();
        state.pwr_failures = 1;
        let (_bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        assert_eq!(ctlr.setup(), Err(UfsError::Io));
    }

    #[test]
    fn setup_retry_renegotiates_after_failed_switch() {
        let mut state = default_state();
        state.pwr_failures = 1;
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup_retry().unwrap();

        let state = bus.state();
        assert_eq!(state.link_startups, 2);
        // Gear 3 was probed before the failed switch; the retry reads
        // the degraded capabilities instead of trusting the stale mode.
        assert_eq!(mib_values(&state, uic::pa::RX_GEAR), [3, 1]);
        assert_eq!(mib_values(&state, uic::pa::TX_GEAR), [3, 1]);
        assert_eq!(mib_values(&state, uic::pa::PWR_MODE), [0x11, 0x11]);
    }

    #[test]
    fn setup_times_out_when_hce_stalls() {
        let mut state = default_state();
        state.hce = 1;
        state.stall_hce = true;
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        assert_eq!(ctlr.setup(), Err(UfsError::Timeout));
        assert_eq!(bus.state().link_startups, 0);
    }

    #[test]
    fn device_init_timeout() {
        let mut state = default_state();
        state.device_init_polls = u32::MAX;
        let (_bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        assert_eq!(ctlr.setup(), Err(UfsError::Timeout));
    }

    #[test]
    fn ref_clk_programmed_when_configured() {
        let config = UfsConfig {
            ref_clk: Some(RefClkFreq::Mhz26),
        };
        let (bus, _region, mut ctlr) = build(default_state(), config, 0);
        ctlr.setup().unwrap();
        assert_eq!(bus.state().attr_writes, [(desc::attr::REF_CLK_FREQ, 1)]);
    }

    #[test]
    fn ping_retries_after_silent_device() {
        let mut state = default_state();
        state.nop_ignores = 2;
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(bus.state().nops, 3);
    }

    #[test]
    fn scan_counts_enabled_luns() {
        let mut state = default_state();
        state.luns[2] = Some(SimLun {
            block_size_shift: 9,
            block_count: 4096,
        });
        let (_bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(ctlr.scan().unwrap(), 2);

        assert!(ctlr.block_dev(0).is_ok());
        assert!(matches!(ctlr.block_dev(1), Err(UfsError::LunDisabled)));
        let dev = ctlr.block_dev(2).unwrap();
        assert_eq!(dev.block_size(), 512);
        assert_eq!(dev.block_count(), 4096);
    }

    #[test]
    fn unit_attention_retried_once() {
        let mut state = default_state();
        state.ua_pending = true;
        let (bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(ctlr.scan().unwrap(), 1);

        let state = bus.state();
        let turs = state
            .commands
            .iter()
            .filter(|cmd| cmd.opcode == scsi::TEST_UNIT_READY)
            .count();
        assert_eq!(turs, 2);
    }

    #[test]
    fn busy_retries_bounded() {
        let mut state = default_state();
        state.busy_responses = 3;
        let (_bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        // Three busy answers, then success on the fourth attempt.
        assert_eq!(ctlr.scan().unwrap(), 1);

        let mut state = default_state();
        state.busy_responses = 4;
        let (_bus, _region, mut ctlr) = build(state, UfsConfig::default(), 0);
        ctlr.setup().unwrap();
        assert_eq!(ctlr.scan(), Err(UfsError::Busy));
    }

    #[test]
    fn reads_chunk_at_cdb_limit() {
        let mut state = default_state();
        state.luns[0] = Some(SimLun {
            block_size_shift: 9,
            block_count: 200_000,
        });
        let count = 70_000u64;
        let bytes = (count * 512) as usize;
        let (bus, mut region, mut ctlr) = build(state, UfsConfig::default(), bytes);
        ctlr.setup().unwrap();
        ctlr.scan().unwrap();

        let mut buf = region.alloc(bytes, 4096).unwrap();
        let mut dev = ctlr.block_dev(0).unwrap();
        assert_eq!(dev.read_blocks(0, count, &mut buf).unwrap(), count);

        let state = bus.state();
        let reads: Vec<&SimCmd> = state
            .commands
            .iter()
            .filter(|cmd| cmd.opcode == scsi::READ_10)
            .collect();
        assert_eq!(reads.len(), 2);
        assert_eq!((reads[0].lba, reads[0].blocks), (0, 65535));
        assert_eq!(reads[0].transfer_len, 65535 * 512);
        assert_eq!((reads[1].lba, reads[1].blocks), (65535, 4465));
        drop(state);

        assert_eq!(buf.read::<u8>(0), 0xa5);
        assert_eq!(buf.read::<u8>(bytes - 1), 0xa5);
    }

    #[test]
    fn write_sets_force_unit_access() {
        let (bus, mut region, mut ctlr) = build(default_state(), UfsConfig::default(), 8192);
        ctlr.setup().unwrap();
        ctlr.scan().unwrap();

        let buf = region.alloc(4096, 4096).unwrap();
        let mut dev = ctlr.block_dev(0).unwrap();
        assert_eq!(dev.write_blocks(5, 1, &buf).unwrap(), 1);

        let state = bus.state();
        let write = state
            .commands
            .iter()
            .find(|cmd| cmd.opcode == scsi::WRITE_10)
            .unwrap();
        assert_eq!(write.cdb1, scsi::FUA);
        assert_eq!(write.lba, 5);
        assert_eq!(write.blocks, 1);
        assert_eq!(write.transfer_len, 4096);
    }

    #[test]
    fn check_condition_maps_sense_key() {
        let (bus, mut region, mut ctlr) = build(default_state(), UfsConfig::default(), 8192);
        ctlr.setup().unwrap();
        ctlr.scan().unwrap();

        // Medium error on the next command.
        bus.state().sense_key = Some(0x03);
        let mut buf = region.alloc(4096, 4096).unwrap();
        let mut dev = ctlr.block_dev(0).unwrap();
        assert_eq!(dev.read_blocks(0, 1, &mut buf), Err(UfsError::Io));
    }

    #[test]
    fn rejects_lba_beyond_cdb_range() {
        let mut state = default_state();
        state.luns[0] = Some(SimLun {
            block_size_shift: 9,
            block_count: 1 << 33,
        });
        let (bus, mut region, mut ctlr) = build(state, UfsConfig::default(), 8192);
        ctlr.setup().unwrap();
        ctlr.scan().unwrap();

        let mut buf = region.alloc(512, 4096).unwrap();
        let mut dev = ctlr.block_dev(0).unwrap();
        assert_eq!(
            dev.read_blocks(1 << 32, 1, &mut buf),
            Err(UfsError::InvalidParameter)
        );
        let reads = bus
            .state()
            .commands
            .iter()
            .filter(|cmd| cmd.opcode == scsi::READ_10)
            .count();
        assert_eq!(reads, 0);
    }

    #[test]
    fn rejects_transfers_off_the_end() {
        let (bus, mut region, mut ctlr) = build(default_state(), UfsConfig::default(), 8192);
        ctlr.setup().unwrap();
        ctlr.scan().unwrap();

        let mut buf = region.alloc(8192, 4096).unwrap();
        let mut dev = ctlr.block_dev(0).unwrap();
        let last = dev.block_count() - 1;
        assert_eq!(
            dev.read_blocks(last, 2, &mut buf),
            Err(UfsError::InvalidParameter)
        );
        // A buffer smaller than the transfer is also refused.
        assert_eq!(
            dev.read_blocks(0, 4, &mut buf),
            Err(UfsError::InvalidParameter)
        );
        let reads = bus
            .state()
            .commands
            .iter()
            .filter(|cmd| cmd.opcode == scsi::READ_10)
            .count();
        assert_eq!(reads, 0);
    }

    #[derive(Clone, Default)]
    struct RecordingHooks {
        events: Rc<RefCell<Vec<&'static str>>>,
    }

    impl UfsHooks<ModelBus> for RecordingHooks {
        fn pre_hce_enable(&mut self, _bus: &ModelBus) -> UfsResult<()> {
            self.events.borrow_mut().push("pre_hce");
            Ok(())
        }

        fn pre_link_startup(&mut self, _bus: &ModelBus) -> UfsResult<()> {
            self.events.borrow_mut().push("pre_link");
            Ok(())
        }

        fn post_link_startup(&mut self, _bus: &ModelBus) -> UfsResult<()> {
            self.events.borrow_mut().push("post_link");
            Ok(())
        }

        fn pre_gear_switch(&mut self, _bus: &ModelBus, mode: &mut TransferMode) -> UfsResult<()> {
            mode.rx.gear = 1;
            mode.tx.gear = 1;
            self.events.borrow_mut().push("pre_gear");
            Ok(())
        }

        fn post_gear_switch(&mut self, _bus: &ModelBus, _mode: &TransferMode) -> UfsResult<()> {
            self.events.borrow_mut().push("post_gear");
            Ok(())
        }
    }

    #[test]
    fn hooks_run_in_order_and_adjust_mode() {
        let bus = ModelBus::new(default_state());
        let hooks = RecordingHooks::default();
        let events = Rc::clone(&hooks.events);
        let mut region = dma_region(utp::DMA_SIZE + utp::DMA_ALIGN + 4096);
        let mut ctlr = UfsCtlr::with_hooks(
            bus.clone(),
            TestClock::new(),
            hooks,
            &mut region,
            UfsConfig::default(),
        )
        .unwrap();
        ctlr.setup().unwrap();

        assert_eq!(
            *events.borrow(),
            ["pre_hce", "pre_link", "post_link", "pre_gear", "post_gear"]
        );
        let state = bus.state();
        assert_eq!(mib_values(&state, uic::pa::RX_GEAR), [1]);
        assert_eq!(mib_values(&state, uic::pa::TX_GEAR), [1]);
    }

    #[test]
    fn out_of_dma_memory_reported() {
        let mut region = dma_region(1024);
        let result = UfsCtlr::new(
            ModelBus::new(default_state()),
            TestClock::new(),
            &mut region,
            UfsConfig::default(),
        );
        assert!(matches!(result, Err(UfsError::OutOfMemory)));
    }
}
