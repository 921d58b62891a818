//! xHCI host controller driver.
//!
//! Bring-up follows the fixed sequence: halt, reset (waiting for CNR to
//! clear), program device slots and the DCBAA with scratchpads, write
//! the command ring base with its initial cycle, program the event ring
//! segment table, enable interrupter 0, set Run/Stop, then inspect
//! ports and enumerate devices. Before any of that, ownership is taken
//! from BIOS through the USB Legacy Support extended capability; a
//! firmware that never lets go is tolerated with a forced, logged
//! takeover.
//!
//! Every hardware wait is a bounded retry loop; a controller that never
//! comes ready is logged and skipped, never fatal.

pub mod context;
pub mod ring;
pub mod trb;

use super::enumeration::{
    parse_configuration, DeviceDescriptor, EndpointInfo, SetupPacket, DESC_CONFIGURATION,
    DESC_DEVICE,
};
use super::{DeviceSpeed, UsbDevice};
use crate::drivers::{poll_until, DriverError, DriverResult};
use crate::mm::{self, PhysAddr};
use alloc::vec::Vec;
use context::{
    DeviceContext, DeviceContextArray, EndpointContextFields, InputContext, SlotContextFields,
    EP_TYPE_CONTROL, EP_TYPE_INTERRUPT_IN,
};
use ring::{EventRing, ProducerRing};
use trb::{CommandCompletionEvent, TransferEvent, Trb};

// Capability registers
const CAP_CAPLENGTH: usize = 0x00;
const CAP_HCSPARAMS1: usize = 0x04;
const CAP_HCSPARAMS2: usize = 0x08;
const CAP_HCCPARAMS1: usize = 0x10;
const CAP_DBOFF: usize = 0x14;
const CAP_RTSOFF: usize = 0x18;

// Operational registers (relative to the operational base)
const OP_USBCMD: usize = 0x00;
const OP_USBSTS: usize = 0x04;
const OP_CRCR: usize = 0x18;
const OP_DCBAAP: usize = 0x30;
const OP_CONFIG: usize = 0x38;
const OP_PORTSC_BASE: usize = 0x400;
const PORTSC_STRIDE: usize = 0x10;

// USBCMD bits
const CMD_RUN: u32 = 1 << 0;
const CMD_RESET: u32 = 1 << 1;
const CMD_INTE: u32 = 1 << 2;

// USBSTS bits
const STS_HALTED: u32 = 1 << 0;
const STS_NOT_READY: u32 = 1 << 11;

// PORTSC bits
const PORTSC_CCS: u32 = 1 << 0;
const PORTSC_PED: u32 = 1 << 1;
const PORTSC_RESET: u32 = 1 << 4;
const PORTSC_CSC: u32 = 1 << 17;
const PORTSC_PRC: u32 = 1 << 21;

// Interrupter register offsets within a runtime interrupter set
const IR_IMAN: usize = 0x00;
const IR_ERSTSZ: usize = 0x08;
const IR_ERSTBA: usize = 0x10;
const IR_ERDP: usize = 0x18;

const IMAN_ENABLE: u32 = 1 << 1;

// Extended capability ids
const XCAP_LEGACY: u8 = 1;

// USBLEGSUP bits
const LEGSUP_BIOS_OWNED: u32 = 1 << 16;
const LEGSUP_OS_OWNED: u32 = 1 << 24;

const RESET_RETRIES: u32 = 100_000;
/// About one second of polling at bring-up cadence.
const BIOS_HANDOFF_RETRIES: u32 = 1_000_000;
const COMMAND_RETRIES: u32 = 100_000;

/// How BIOS ownership ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// No USB Legacy Support capability: nothing to take over
    NotPresent,
    BiosReleased,
    /// BIOS never cleared its bit; we cleared it ourselves
    ForcedTakeover,
}

#[inline]
fn mmio_read32(addr: usize) -> u32 {
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

#[inline]
fn mmio_write32(addr: usize, value: u32) {
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
}

#[inline]
fn mmio_write64(addr: usize, value: u64) {
    unsafe { core::ptr::write_volatile(addr as *mut u64, value) }
}

/// Claim the controller from BIOS via the USB Legacy Support extended
/// capability. Bounded wait, then forced takeover; both outcomes are
/// recorded. Legacy SMIs are silenced either way.
pub fn bios_handoff(cap_base: usize) -> HandoffOutcome {
    let hccparams1 = mmio_read32(cap_base + CAP_HCCPARAMS1);
    let xecp = ((hccparams1 >> 16) & 0xFFFF) as usize;
    if xecp == 0 {
        return HandoffOutcome::NotPresent;
    }

    let mut addr = cap_base + xecp * 4;
    let mut ttl = 48;
    loop {
        let cap = mmio_read32(addr);
        if cap as u8 == XCAP_LEGACY {
            break;
        }
        let next = ((cap >> 8) & 0xFF) as usize;
        if next == 0 || ttl == 0 {
            return HandoffOutcome::NotPresent;
        }
        addr += next * 4;
        ttl -= 1;
    }

    // Ask for ownership
    mmio_write32(addr, mmio_read32(addr) | LEGSUP_OS_OWNED);

    let released = poll_until(BIOS_HANDOFF_RETRIES, || {
        mmio_read32(addr) & LEGSUP_BIOS_OWNED == 0
    })
    .is_ok();

    let outcome = if released {
        HandoffOutcome::BiosReleased
    } else {
        // Take it anyway
        mmio_write32(addr, mmio_read32(addr) & !LEGSUP_BIOS_OWNED);
        crate::warn!("xhci: BIOS never released ownership, forcing takeover");
        HandoffOutcome::ForcedTakeover
    };

    // Silence legacy SMIs
    mmio_write32(addr + 4, 0);
    outcome
}

pub struct XhciController {
    cap_base: usize,
    op_base: usize,
    rt_base: usize,
    db_base: usize,
    max_slots: u8,
    max_ports: u8,
    command_ring: ProducerRing,
    event_ring: EventRing,
    dcbaa: DeviceContextArray,
    slot_in_use: [bool; 64],
    pub handoff: HandoffOutcome,
}

impl XhciController {
    /// Bring the controller from whatever state firmware left it in to
    /// Running with command/event rings live.
    pub fn new(mmio_base: usize) -> DriverResult<Self> {
        let caplength = (mmio_read32(mmio_base + CAP_CAPLENGTH) & 0xFF) as usize;
        let hcsparams1 = mmio_read32(mmio_base + CAP_HCSPARAMS1);
        let hcsparams2 = mmio_read32(mmio_base + CAP_HCSPARAMS2);
        let max_slots = (hcsparams1 & 0xFF) as u8;
        let max_ports = ((hcsparams1 >> 24) & 0xFF) as u8;
        let scratchpads = (((hcsparams2 >> 27) & 0x1F) | (((hcsparams2 >> 21) & 0x1F) << 5)) as usize;

        let op_base = mmio_base + caplength;
        let rt_base = mmio_base + (mmio_read32(mmio_base + CAP_RTSOFF) & !0x1F) as usize;
        let db_base = mmio_base + (mmio_read32(mmio_base + CAP_DBOFF) & !0x3) as usize;

        crate::info!(
            "xhci: {} slots, {} ports, {} scratchpads",
            max_slots,
            max_ports,
            scratchpads
        );

        let handoff = bios_handoff(mmio_base);

        // Halted -> Reset (CNR must clear before register writes)
        Self::halt(op_base)?;
        Self::reset(op_base)?;

        // Device slots and DCBAA (scratchpads hang off slot 0); the
        // slot bookkeeping array caps what we enable
        let slots = if max_slots == 0 { 1 } else { max_slots.min(63) };
        mmio_write32(
            op_base + OP_CONFIG,
            (mmio_read32(op_base + OP_CONFIG) & !0xFF) | slots as u32,
        );
        let dcbaa = DeviceContextArray::new(slots as usize, scratchpads)?;
        mmio_write64(op_base + OP_DCBAAP, dcbaa.base());

        // Command ring with its initial cycle state
        let command_ring = ProducerRing::new(256)?;
        mmio_write64(op_base + OP_CRCR, command_ring.crcr_value());

        // Event ring segment table on interrupter 0
        let event_ring = EventRing::new(256)?;
        let ir0 = rt_base + 0x20;
        mmio_write32(ir0 + IR_ERSTSZ, 1);
        mmio_write64(ir0 + IR_ERDP, event_ring.dequeue_pointer());
        mmio_write64(ir0 + IR_ERSTBA, event_ring.erst_base());
        mmio_write32(ir0 + IR_IMAN, IMAN_ENABLE);

        // Run
        let cmd = mmio_read32(op_base + OP_USBCMD) | CMD_RUN | CMD_INTE;
        mmio_write32(op_base + OP_USBCMD, cmd);
        poll_until(RESET_RETRIES, || {
            mmio_read32(op_base + OP_USBSTS) & STS_HALTED == 0
        })?;

        crate::info!("xhci: controller running");
        Ok(Self {
            cap_base: mmio_base,
            op_base,
            rt_base,
            db_base,
            max_slots: slots,
            max_ports,
            command_ring,
            event_ring,
            dcbaa,
            slot_in_use: [false; 64],
            handoff,
        })
    }

    fn halt(op_base: usize) -> DriverResult<()> {
        let cmd = mmio_read32(op_base + OP_USBCMD) & !CMD_RUN;
        mmio_write32(op_base + OP_USBCMD, cmd);
        poll_until(RESET_RETRIES, || {
            mmio_read32(op_base + OP_USBSTS) & STS_HALTED != 0
        })
    }

    fn reset(op_base: usize) -> DriverResult<()> {
        mmio_write32(op_base + OP_USBCMD, mmio_read32(op_base + OP_USBCMD) | CMD_RESET);
        poll_until(RESET_RETRIES, || {
            mmio_read32(op_base + OP_USBCMD) & CMD_RESET == 0
        })?;
        // Controller Not Ready gates every register write after reset
        poll_until(RESET_RETRIES, || {
            mmio_read32(op_base + OP_USBSTS) & STS_NOT_READY == 0
        })
    }

    /// Write a doorbell: 0 targets the command ring, others a device
    /// slot with the endpoint DCI as the value.
    pub fn ring_doorbell(&self, slot: u8, target: u8) {
        mmio_write32(self.db_base + slot as usize * 4, target as u32);
    }

    pub fn capability_base(&self) -> usize {
        self.cap_base
    }

    /// Post one transfer TRB on an endpoint ring and ring its doorbell.
    pub fn enqueue_transfer(
        &self,
        slot_id: u8,
        dci: u8,
        ring: &mut ProducerRing,
        buffer: PhysAddr,
        len: u32,
    ) -> PhysAddr {
        let addr = ring.enqueue(Trb::normal(buffer, len, false, true));
        self.ring_doorbell(slot_id, dci);
        addr
    }

    /// Pop the next pending event TRB, updating ERDP.
    pub fn poll_events(&mut self) -> Option<Trb> {
        let event = self.event_ring.dequeue_event()?;
        let ir0 = self.rt_base + 0x20;
        mmio_write64(ir0 + IR_ERDP, self.event_ring.dequeue_pointer());
        Some(event)
    }

    /// Enqueue a command, ring doorbell 0, and wait for its completion
    /// event.
    pub fn enqueue_cmd(&mut self, command: Trb) -> DriverResult<CommandCompletionEvent> {
        let command_addr = self.command_ring.enqueue(command);
        self.ring_doorbell(0, 0);

        let mut completion = None;
        poll_until(COMMAND_RETRIES, || {
            while let Some(event) = self.poll_events() {
                if let Some(done) = CommandCompletionEvent::from_trb(event) {
                    if done.command_trb() == command_addr {
                        completion = Some(done);
                        return true;
                    }
                }
            }
            false
        })?;

        let completion = completion.ok_or(DriverError::Protocol)?;
        if !completion.is_success() {
            crate::warn!(
                "xhci: command {:?} failed with code {}",
                command.trb_type(),
                completion.completion_code()
            );
            return Err(DriverError::Protocol);
        }
        Ok(completion)
    }

    fn allocate_slot(&mut self) -> DriverResult<u8> {
        for slot in 1..=self.max_slots as usize {
            if !self.slot_in_use[slot] {
                self.slot_in_use[slot] = true;
                return Ok(slot as u8);
            }
        }
        Err(DriverError::Busy)
    }

    /// Run a control transfer on a device's EP0 ring: Setup, optional
    /// Data, Status; then wait for the transfer event.
    pub fn control_transfer(
        &mut self,
        slot_id: u8,
        ep0_ring: &mut ProducerRing,
        setup: &SetupPacket,
        data: Option<(PhysAddr, u32)>,
    ) -> DriverResult<u32> {
        let dir_in = setup.device_to_host();
        // Transfer type: 0 = no data, 2 = OUT data, 3 = IN data
        let transfer_type = match (setup.has_data_stage(), dir_in) {
            (false, _) => 0,
            (true, false) => 2,
            (true, true) => 3,
        };

        ep0_ring.enqueue(Trb::setup_stage(setup.as_u64(), transfer_type));
        if let Some((buffer, len)) = data {
            ep0_ring.enqueue(Trb::data_stage(buffer, len, dir_in));
        }
        // Status stage runs opposite the data direction
        ep0_ring.enqueue(Trb::status_stage(!dir_in || data.is_none()));
        self.ring_doorbell(slot_id, 1);

        let mut transferred = 0;
        let mut seen = false;
        poll_until(COMMAND_RETRIES, || {
            while let Some(event) = self.poll_events() {
                if let Some(done) = TransferEvent::from_trb(event) {
                    if done.slot_id() == slot_id {
                        seen = done.is_success();
                        let requested = data.map(|(_, len)| len).unwrap_or(0);
                        transferred = requested.saturating_sub(done.residual_length());
                        return true;
                    }
                }
            }
            false
        })?;

        if !seen {
            return Err(DriverError::Protocol);
        }
        Ok(transferred)
    }

    /// Enumerate every port with a connected device.
    pub fn enumerate_devices(&mut self) -> Vec<UsbDevice> {
        let mut devices = Vec::new();
        for port in 0..self.max_ports {
            match self.enumerate_port(port) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => {
                    crate::warn!("xhci: port {} enumeration failed: {}", port, e.name());
                }
            }
        }
        devices
    }

    fn portsc_addr(&self, port: u8) -> usize {
        self.op_base + OP_PORTSC_BASE + port as usize * PORTSC_STRIDE
    }

    /// Full per-port flow: reset, Enable Slot, Address Device, read
    /// descriptors, adjust EP0, configure the keyboard interrupt
    /// endpoint, and post the first interrupt transfer.
    fn enumerate_port(&mut self, port: u8) -> DriverResult<Option<UsbDevice>> {
        let portsc = mmio_read32(self.portsc_addr(port));
        if portsc & PORTSC_CCS == 0 {
            return Ok(None);
        }

        // Acknowledge connect-status change, then reset the port
        mmio_write32(self.portsc_addr(port), portsc | PORTSC_CSC);
        mmio_write32(self.portsc_addr(port), portsc | PORTSC_RESET);
        poll_until(RESET_RETRIES, || {
            let sc = mmio_read32(self.portsc_addr(port));
            sc & PORTSC_PRC != 0 || sc & PORTSC_PED != 0
        })?;
        let portsc = mmio_read32(self.portsc_addr(port));
        let speed = DeviceSpeed::from_portsc(((portsc >> 10) & 0xF) as u8);

        crate::info!("xhci: port {} connected, {:?}", port, speed);

        // Enable Slot
        let completion = self.enqueue_cmd(Trb::enable_slot())?;
        let slot_id = if completion.slot_id() != 0 {
            completion.slot_id()
        } else {
            self.allocate_slot()?
        };
        if slot_id as usize >= self.slot_in_use.len() {
            return Err(DriverError::Protocol);
        }
        self.slot_in_use[slot_id as usize] = true;

        // Output context + EP0 transfer ring, then Address Device
        let device_ctx = DeviceContext::new()?;
        self.dcbaa.set_slot(slot_id, &device_ctx)?;

        let mut ep0_ring = ProducerRing::new(16)?;
        let mut input = InputContext::new()?;
        input.clear();
        input.set_add_flags(0b11); // slot + EP0
        input.write_slot(&SlotContextFields {
            route_string: 0,
            speed: ((portsc >> 10) & 0xF) as u8,
            context_entries: 1,
            root_hub_port: port + 1,
        });
        input.write_endpoint(
            1,
            &EndpointContextFields {
                endpoint_type: EP_TYPE_CONTROL,
                max_packet_size: speed.default_max_packet(),
                interval: 0,
                ring_base: ep0_ring.base(),
                dequeue_cycle: true,
                error_count: 3,
            },
        );
        self.enqueue_cmd(Trb::address_device(slot_id, input.base(), false))?;

        // Device descriptor: first 8 bytes to learn EP0's max packet
        let buffer = mm::alloc_frame().map_err(DriverError::from)?;
        let short = SetupPacket::get_descriptor(DESC_DEVICE, 0, 8);
        self.control_transfer(slot_id, &mut ep0_ring, &short, Some((buffer, 8)))?;
        let short_desc = unsafe { core::slice::from_raw_parts(mm::phys_to_ptr(buffer), 8) };
        let bcd_usb = u16::from_le_bytes([short_desc[2], short_desc[3]]);
        let real_mps = if bcd_usb >= 0x0300 {
            1u16 << short_desc[7].min(15)
        } else {
            short_desc[7] as u16
        };

        // Re-evaluate EP0 if the default guess was wrong
        if real_mps != 0 && real_mps != speed.default_max_packet() {
            input.clear();
            input.set_add_flags(0b10); // EP0 only
            input.write_endpoint(
                1,
                &EndpointContextFields {
                    endpoint_type: EP_TYPE_CONTROL,
                    max_packet_size: real_mps,
                    interval: 0,
                    ring_base: ep0_ring.base(),
                    dequeue_cycle: true,
                    error_count: 3,
                },
            );
            self.enqueue_cmd(Trb::evaluate_context(slot_id, input.base()))?;
        }

        // Full device descriptor
        let full = SetupPacket::get_descriptor(DESC_DEVICE, 0, 18);
        self.control_transfer(slot_id, &mut ep0_ring, &full, Some((buffer, 18)))?;
        let device_desc = DeviceDescriptor::parse(unsafe {
            core::slice::from_raw_parts(mm::phys_to_ptr(buffer), 18)
        })?;

        // Configuration descriptor: header first for the total length
        let header = SetupPacket::get_descriptor(DESC_CONFIGURATION, 0, 9);
        self.control_transfer(slot_id, &mut ep0_ring, &header, Some((buffer, 9)))?;
        let total_len = {
            let bytes = unsafe { core::slice::from_raw_parts(mm::phys_to_ptr(buffer), 9) };
            u16::from_le_bytes([bytes[2], bytes[3]]).min(mm::PAGE_SIZE as u16)
        };
        let full_config = SetupPacket::get_descriptor(DESC_CONFIGURATION, 0, total_len);
        self.control_transfer(slot_id, &mut ep0_ring, &full_config, Some((buffer, total_len as u32)))?;
        let config = parse_configuration(unsafe {
            core::slice::from_raw_parts(mm::phys_to_ptr(buffer), total_len as usize)
        })?;

        // Activate the configuration
        let set_config = SetupPacket::set_configuration(config.value);
        self.control_transfer(slot_id, &mut ep0_ring, &set_config, None)?;

        // Wire the keyboard's interrupt-IN endpoint and post the first
        // transfer
        if let Some(endpoint) = config.keyboard_endpoint {
            self.configure_keyboard_endpoint(slot_id, &mut input, &endpoint, port)?;
        }

        mm::free_frame(buffer);
        // The output context and EP0 ring stay with the controller for
        // the device's lifetime
        core::mem::forget(device_ctx);
        core::mem::forget(ep0_ring);

        crate::info!(
            "xhci: slot {} = {:04x}:{:04x} class {:02x}",
            slot_id,
            device_desc.vendor_id,
            device_desc.product_id,
            device_desc.class
        );

        Ok(Some(UsbDevice {
            slot_id,
            port,
            speed,
            vendor_id: device_desc.vendor_id,
            product_id: device_desc.product_id,
            class: device_desc.class,
            keyboard_endpoint: config.keyboard_endpoint,
        }))
    }

    fn configure_keyboard_endpoint(
        &mut self,
        slot_id: u8,
        input: &mut InputContext,
        endpoint: &EndpointInfo,
        _port: u8,
    ) -> DriverResult<()> {
        let dci = endpoint.dci();
        let mut interrupt_ring = ProducerRing::new(16)?;

        input.clear();
        input.set_add_flags(1 | (1 << dci)); // slot + the endpoint
        input.write_slot(&SlotContextFields {
            route_string: 0,
            speed: 0,
            context_entries: dci,
            root_hub_port: 0,
        });
        input.write_endpoint(
            dci,
            &EndpointContextFields {
                endpoint_type: EP_TYPE_INTERRUPT_IN,
                max_packet_size: endpoint.max_packet_size,
                interval: endpoint.interval,
                ring_base: interrupt_ring.base(),
                dequeue_cycle: true,
                error_count: 3,
            },
        );
        self.enqueue_cmd(Trb::configure_endpoint(slot_id, input.base()))?;

        // First interrupt-IN transfer, then the endpoint doorbell
        let report = mm::alloc_frame().map_err(DriverError::from)?;
        interrupt_ring.enqueue(Trb::normal(
            report,
            endpoint.max_packet_size as u32,
            false,
            true,
        ));
        self.ring_doorbell(slot_id, dci);

        core::mem::forget(interrupt_ring);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    /// A fake register file: plain memory standing in for controller
    /// MMIO. State machines that require controller-side behavior
    /// (reset self-clear) therefore time out, which is exactly the
    /// policy path under test.
    struct FakeRegs {
        backing: Vec<u32>,
    }

    impl FakeRegs {
        fn new() -> Self {
            Self {
                backing: alloc::vec![0u32; 1024],
            }
        }

        fn base(&self) -> usize {
            self.backing.as_ptr() as usize
        }

        fn set(&mut self, offset: usize, value: u32) {
            self.backing[offset / 4] = value;
        }

        fn get(&self, offset: usize) -> u32 {
            self.backing[offset / 4]
        }
    }

    #[test]
    fn handoff_forces_takeover_when_bios_clings() {
        init_global_test_arena();
        let mut regs = FakeRegs::new();
        // xECP at dword 0x40: legacy support capability, BIOS owned
        regs.set(CAP_HCCPARAMS1, 0x40 << 16);
        regs.set(0x100, XCAP_LEGACY as u32 | LEGSUP_BIOS_OWNED);
        regs.set(0x104, 0xDEAD_BEEF); // legacy control/status

        let outcome = bios_handoff(regs.base());
        assert_eq!(outcome, HandoffOutcome::ForcedTakeover);

        let legsup = regs.get(0x100);
        assert!(legsup & LEGSUP_OS_OWNED != 0, "OS-owned set");
        assert!(legsup & LEGSUP_BIOS_OWNED == 0, "BIOS bit forcibly cleared");
        assert_eq!(regs.get(0x104), 0, "legacy SMIs silenced");
    }

    #[test]
    fn handoff_succeeds_when_bios_released() {
        init_global_test_arena();
        let mut regs = FakeRegs::new();
        // BIOS-owned already clear
        regs.set(CAP_HCCPARAMS1, 0x40 << 16);
        regs.set(0x100, XCAP_LEGACY as u32);

        assert_eq!(bios_handoff(regs.base()), HandoffOutcome::BiosReleased);
        assert!(regs.get(0x100) & LEGSUP_OS_OWNED != 0);
    }

    #[test]
    fn handoff_skips_missing_capability() {
        init_global_test_arena();
        let mut regs = FakeRegs::new();
        regs.set(CAP_HCCPARAMS1, 0); // no extended capabilities
        assert_eq!(bios_handoff(regs.base()), HandoffOutcome::NotPresent);

        // Chain of non-legacy capabilities ends cleanly
        regs.set(CAP_HCCPARAMS1, 0x40 << 16);
        regs.set(0x100, 0x02); // some other capability, next = 0
        assert_eq!(bios_handoff(regs.base()), HandoffOutcome::NotPresent);
    }

    #[test]
    fn bring_up_times_out_on_dead_controller() {
        init_global_test_arena();
        let mut regs = FakeRegs::new();
        // Plausible capability block, but operational registers never
        // respond: halt waits for HCHalted forever
        regs.set(CAP_CAPLENGTH, 0x20);
        regs.set(CAP_HCSPARAMS1, (4 << 24) | 8);
        regs.set(CAP_DBOFF, 0x800);
        regs.set(CAP_RTSOFF, 0x600);

        match XhciController::new(regs.base()) {
            Err(DriverError::Timeout(_)) => {}
            other => panic!("dead controller must time out, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn reset_waits_for_cnr_clear() {
        init_global_test_arena();
        let mut regs = FakeRegs::new();
        regs.set(CAP_CAPLENGTH, 0x20);
        // Halted already; reset bit self-clears in plain memory only if
        // never set... it stays set, so reset times out
        regs.set(0x20 + OP_USBSTS, STS_HALTED);

        match XhciController::new(regs.base()) {
            Err(DriverError::Timeout(_)) => {}
            other => panic!("stuck reset must time out, got {:?}", other.map(|_| ())),
        }
    }
}
