//! Transfer Request Blocks.
//!
//! 16-byte units exchanged with the controller over the command, event,
//! and transfer rings. The control dword carries the type, the cycle
//! bit, and per-type flags.

/// TRB type codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    // Transfer TRBs
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Link = 6,
    NoOp = 8,

    // Command TRBs
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    NoOpCommand = 23,

    // Event TRBs
    TransferEvent = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
}

impl TrbType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Normal),
            2 => Some(Self::SetupStage),
            3 => Some(Self::DataStage),
            4 => Some(Self::StatusStage),
            6 => Some(Self::Link),
            8 => Some(Self::NoOp),
            9 => Some(Self::EnableSlot),
            10 => Some(Self::DisableSlot),
            11 => Some(Self::AddressDevice),
            12 => Some(Self::ConfigureEndpoint),
            13 => Some(Self::EvaluateContext),
            23 => Some(Self::NoOpCommand),
            32 => Some(Self::TransferEvent),
            33 => Some(Self::CommandCompletion),
            34 => Some(Self::PortStatusChange),
            _ => None,
        }
    }
}

/// Completion codes the driver distinguishes.
pub const COMPLETION_SUCCESS: u8 = 1;
pub const COMPLETION_SHORT_PACKET: u8 = 13;

const CYCLE_BIT: u32 = 1 << 0;
const TOGGLE_CYCLE: u32 = 1 << 1;
const IOC: u32 = 1 << 5;
const IDT: u32 = 1 << 6;
const CHAIN: u32 = 1 << 4;

/// Generic 16-byte TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn zeroed() -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: 0,
        }
    }

    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_u8(((self.control >> 10) & 0x3F) as u8)
    }

    pub fn set_trb_type(&mut self, trb_type: TrbType) {
        self.control = (self.control & !(0x3F << 10)) | ((trb_type as u32) << 10);
    }

    pub fn cycle(&self) -> bool {
        self.control & CYCLE_BIT != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= CYCLE_BIT;
        } else {
            self.control &= !CYCLE_BIT;
        }
    }

    pub fn toggles_cycle(&self) -> bool {
        self.control & TOGGLE_CYCLE != 0
    }

    /// Link TRB closing a ring segment back to `ring_base`.
    pub fn link(ring_base: u64, toggle_cycle: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = ring_base;
        trb.set_trb_type(TrbType::Link);
        if toggle_cycle {
            trb.control |= TOGGLE_CYCLE;
        }
        trb
    }

    pub fn noop() -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(TrbType::NoOp);
        trb
    }

    pub fn noop_command() -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(TrbType::NoOpCommand);
        trb
    }

    pub fn enable_slot() -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(TrbType::EnableSlot);
        trb
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(TrbType::DisableSlot);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    pub fn address_device(slot_id: u8, input_context: u64, block_set_address: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = input_context;
        trb.set_trb_type(TrbType::AddressDevice);
        trb.control |= (slot_id as u32) << 24;
        if block_set_address {
            trb.control |= 1 << 9;
        }
        trb
    }

    pub fn configure_endpoint(slot_id: u8, input_context: u64) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = input_context;
        trb.set_trb_type(TrbType::ConfigureEndpoint);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    pub fn evaluate_context(slot_id: u8, input_context: u64) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = input_context;
        trb.set_trb_type(TrbType::EvaluateContext);
        trb.control |= (slot_id as u32) << 24;
        trb
    }

    /// Setup Stage TRB with immediate data (the 8 setup bytes ride in
    /// the parameter field).
    pub fn setup_stage(setup_bytes: u64, transfer_type: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = setup_bytes;
        trb.status = 8;
        trb.set_trb_type(TrbType::SetupStage);
        trb.control |= IDT | ((transfer_type as u32 & 0x3) << 16);
        trb
    }

    pub fn data_stage(buffer: u64, length: u32, dir_in: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = buffer;
        trb.status = length & 0x1FFFF;
        trb.set_trb_type(TrbType::DataStage);
        if dir_in {
            trb.control |= 1 << 16;
        }
        trb
    }

    pub fn status_stage(dir_in: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(TrbType::StatusStage);
        if dir_in {
            trb.control |= 1 << 16;
        }
        trb.control |= IOC;
        trb
    }

    pub fn normal(buffer: u64, length: u32, chain: bool, ioc: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.parameter = buffer;
        trb.status = length & 0x1FFFF;
        trb.set_trb_type(TrbType::Normal);
        if chain {
            trb.control |= CHAIN;
        }
        if ioc {
            trb.control |= IOC;
        }
        trb
    }
}

/// Command Completion Event view.
pub struct CommandCompletionEvent(pub Trb);

impl CommandCompletionEvent {
    pub fn from_trb(trb: Trb) -> Option<Self> {
        (trb.trb_type() == Some(TrbType::CommandCompletion)).then_some(Self(trb))
    }

    pub fn completion_code(&self) -> u8 {
        ((self.0.status >> 24) & 0xFF) as u8
    }

    pub fn slot_id(&self) -> u8 {
        ((self.0.control >> 24) & 0xFF) as u8
    }

    pub fn command_trb(&self) -> u64 {
        self.0.parameter
    }

    pub fn is_success(&self) -> bool {
        self.completion_code() == COMPLETION_SUCCESS
    }
}

/// Transfer Event view.
pub struct TransferEvent(pub Trb);

impl TransferEvent {
    pub fn from_trb(trb: Trb) -> Option<Self> {
        (trb.trb_type() == Some(TrbType::TransferEvent)).then_some(Self(trb))
    }

    pub fn completion_code(&self) -> u8 {
        ((self.0.status >> 24) & 0xFF) as u8
    }

    pub fn slot_id(&self) -> u8 {
        ((self.0.control >> 24) & 0xFF) as u8
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.0.control >> 16) & 0x1F) as u8
    }

    pub fn residual_length(&self) -> u32 {
        self.0.status & 0xFF_FFFF
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.completion_code(),
            COMPLETION_SUCCESS | COMPLETION_SHORT_PACKET
        )
    }
}

/// Port Status Change Event view.
pub struct PortStatusChangeEvent(pub Trb);

impl PortStatusChangeEvent {
    pub fn from_trb(trb: Trb) -> Option<Self> {
        (trb.trb_type() == Some(TrbType::PortStatusChange)).then_some(Self(trb))
    }

    pub fn port_id(&self) -> u8 {
        ((self.0.parameter >> 24) & 0xFF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trb_is_sixteen_bytes() {
        assert_eq!(core::mem::size_of::<Trb>(), 16);
        assert_eq!(core::mem::align_of::<Trb>(), 16);
    }

    #[test]
    fn type_and_cycle_encoding() {
        let mut trb = Trb::zeroed();
        trb.set_trb_type(TrbType::EnableSlot);
        assert_eq!(trb.trb_type(), Some(TrbType::EnableSlot));
        assert!(!trb.cycle());
        trb.set_cycle(true);
        assert!(trb.cycle());
        assert_eq!(trb.trb_type(), Some(TrbType::EnableSlot), "cycle does not clobber type");
    }

    #[test]
    fn link_trb_carries_toggle() {
        let link = Trb::link(0x1000, true);
        assert_eq!(link.trb_type(), Some(TrbType::Link));
        assert!(link.toggles_cycle());
        assert_eq!(link.parameter, 0x1000);
    }

    #[test]
    fn completion_event_fields() {
        let mut raw = Trb::zeroed();
        raw.set_trb_type(TrbType::CommandCompletion);
        raw.parameter = 0xDEAD_0000;
        raw.status = (COMPLETION_SUCCESS as u32) << 24;
        raw.control |= 5 << 24;

        let event = CommandCompletionEvent::from_trb(raw).unwrap();
        assert!(event.is_success());
        assert_eq!(event.slot_id(), 5);
        assert_eq!(event.command_trb(), 0xDEAD_0000);
    }
}
