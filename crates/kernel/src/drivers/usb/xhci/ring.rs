//! TRB rings.
//!
//! Producer rings (command, transfer) end in a Link TRB that points back
//! to the ring base with Toggle Cycle set: crossing it flips the
//! producer cycle state, so the consumer distinguishes fresh entries
//! from stale ones across wrap-around forever. Producers write every
//! TRB field before the control dword carrying the cycle bit; consumers
//! accept a TRB only while its cycle bit matches their expectation and
//! flip that expectation exactly once per wrap.
use super::trb::{Trb, TrbType};
use crate::drivers::{DriverError, DriverResult};
use crate::mm::{self, PhysAddr, PAGE_SIZE};
use core::sync::atomic::{fence, Ordering};

/// Driver-side producer ring (command and transfer rings).
pub struct ProducerRing {
    base: PhysAddr,
    order: u8,
    size: usize,
    enqueue: usize,
    /// Producer cycle state
    cycle: bool,
}

impl ProducerRing {
    /// Allocate a ring of `size` TRBs (the last slot is the Link TRB).
    pub fn new(size: usize) -> DriverResult<Self> {
        if size < 4 || size > 256 || !size.is_power_of_two() {
            return Err(DriverError::InvalidParameter);
        }
        let bytes = size * core::mem::size_of::<Trb>();
        let order = bytes.div_ceil(PAGE_SIZE).next_power_of_two().trailing_zeros() as u8;
        let base = mm::alloc_frames_in(order, mm::Zone::Normal).map_err(DriverError::from)?;

        let mut ring = Self {
            base,
            order,
            size,
            enqueue: 0,
            cycle: true,
        };
        // Install the Link TRB with the consumer-side cycle still clear;
        // its cycle bit is written when the producer crosses it
        ring.write_slot_raw(size - 1, Trb::link(base, true));
        Ok(ring)
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Ring base with the initial producer cycle, as CRCR wants it.
    pub fn crcr_value(&self) -> u64 {
        self.base | self.cycle as u64
    }

    fn slot_ptr(&self, index: usize) -> *mut Trb {
        unsafe { (mm::phys_to_ptr(self.base) as *mut Trb).add(index) }
    }

    fn write_slot_raw(&mut self, index: usize, trb: Trb) {
        unsafe { core::ptr::write_volatile(self.slot_ptr(index), trb) };
    }

    /// Publish one TRB: parameter and status first, control (with the
    /// producer cycle) last, behind a release fence.
    fn publish(&mut self, index: usize, mut trb: Trb) {
        trb.set_cycle(self.cycle);
        unsafe {
            let slot = self.slot_ptr(index);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*slot).parameter), trb.parameter);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*slot).status), trb.status);
            fence(Ordering::Release);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*slot).control), trb.control);
        }
    }

    /// Enqueue a TRB, crossing the Link TRB (and toggling the cycle)
    /// when the segment is full. Returns the physical address of the
    /// slot used, which completion events echo back.
    pub fn enqueue(&mut self, trb: Trb) -> PhysAddr {
        if self.enqueue == self.size - 1 {
            // Hand the Link TRB to the consumer, then wrap
            let link = Trb::link(self.base, true);
            self.publish(self.size - 1, link);
            self.cycle = !self.cycle;
            self.enqueue = 0;
        }

        let index = self.enqueue;
        self.publish(index, trb);
        self.enqueue += 1;
        self.base + (index * core::mem::size_of::<Trb>()) as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ProducerRing {
    fn drop(&mut self) {
        mm::free_frames(self.base, self.order);
    }
}

/// Event Ring Segment Table entry.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct ErstEntry {
    pub base: u64,
    pub size: u16,
    _reserved: [u8; 6],
}

/// Consumer-side event ring with its one-segment ERST.
pub struct EventRing {
    segment: PhysAddr,
    segment_order: u8,
    erst: PhysAddr,
    size: usize,
    dequeue: usize,
    /// Consumer cycle state
    cycle: bool,
}

impl EventRing {
    pub fn new(size: usize) -> DriverResult<Self> {
        if size < 16 || size > 4096 || !size.is_power_of_two() {
            return Err(DriverError::InvalidParameter);
        }
        let bytes = size * core::mem::size_of::<Trb>();
        let order = bytes.div_ceil(PAGE_SIZE).next_power_of_two().trailing_zeros() as u8;
        let segment = mm::alloc_frames_in(order, mm::Zone::Normal).map_err(DriverError::from)?;
        let erst = mm::alloc_frame().map_err(DriverError::from)?;

        unsafe {
            core::ptr::write_volatile(
                mm::phys_to_ptr(erst) as *mut ErstEntry,
                ErstEntry {
                    base: segment,
                    size: size as u16,
                    _reserved: [0; 6],
                },
            );
        }

        Ok(Self {
            segment,
            segment_order: order,
            erst,
            size,
            dequeue: 0,
            cycle: true,
        })
    }

    pub fn erst_base(&self) -> PhysAddr {
        self.erst
    }

    pub fn segment_base(&self) -> PhysAddr {
        self.segment
    }

    /// Current dequeue pointer for ERDP updates.
    pub fn dequeue_pointer(&self) -> PhysAddr {
        self.segment + (self.dequeue * core::mem::size_of::<Trb>()) as u64
    }

    fn slot_ptr(&self, index: usize) -> *const Trb {
        unsafe { (mm::phys_to_ptr(self.segment) as *const Trb).add(index) }
    }

    /// Pop the next event whose cycle matches the consumer expectation.
    /// Crossing the segment end toggles the expectation exactly once.
    pub fn dequeue_event(&mut self) -> Option<Trb> {
        let trb = unsafe { core::ptr::read_volatile(self.slot_ptr(self.dequeue)) };
        if trb.cycle() != self.cycle {
            return None;
        }
        fence(Ordering::Acquire);

        self.dequeue += 1;
        if self.dequeue == self.size {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }

    pub fn has_events(&self) -> bool {
        let trb = unsafe { core::ptr::read_volatile(self.slot_ptr(self.dequeue)) };
        trb.cycle() == self.cycle
    }
}

impl Drop for EventRing {
    fn drop(&mut self) {
        mm::free_frames(self.segment, self.segment_order);
        mm::free_frame(self.erst);
    }
}

/// Consumer model for producer rings: follows Link TRBs and flips its
/// expected cycle once per traversal. The hardware does exactly this;
/// tests reuse it to validate the producer protocol.
pub struct RingConsumer {
    base: PhysAddr,
    dequeue: usize,
    expected_cycle: bool,
    pub link_traversals: usize,
}

impl RingConsumer {
    pub fn new(base: PhysAddr) -> Self {
        Self {
            base,
            dequeue: 0,
            expected_cycle: true,
            link_traversals: 0,
        }
    }

    /// Next non-link TRB owned by the consumer, if any.
    pub fn consume(&mut self) -> Option<Trb> {
        loop {
            let slot = unsafe {
                (mm::phys_to_ptr(self.base) as *const Trb).add(self.dequeue)
            };
            let trb = unsafe { core::ptr::read_volatile(slot) };
            if trb.cycle() != self.expected_cycle {
                return None;
            }
            fence(Ordering::Acquire);

            if trb.trb_type() == Some(TrbType::Link) {
                self.dequeue = 0;
                if trb.toggles_cycle() {
                    self.expected_cycle = !self.expected_cycle;
                }
                self.link_traversals += 1;
                continue;
            }

            self.dequeue += 1;
            return Some(trb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    #[test]
    fn producer_fills_and_wraps_through_link() {
        init_global_test_arena();
        let mut ring = ProducerRing::new(8).unwrap();
        let mut consumer = RingConsumer::new(ring.base());

        // Two full laps: 7 usable slots per lap
        let mut produced = 0u64;
        for lap in 0..2 {
            for _ in 0..7 {
                let mut trb = Trb::noop_command();
                trb.parameter = produced;
                produced += 1;
                ring.enqueue(trb);
            }
            let mut seen = 0;
            while let Some(trb) = consumer.consume() {
                assert_eq!(trb.parameter, (lap * 7 + seen) as u64);
                seen += 1;
            }
            assert_eq!(seen, 7, "whole lap visible");
        }
        assert_eq!(
            consumer.link_traversals, 1,
            "one wrap consumed so far; the second lap's link is not yet crossed"
        );
    }

    #[test]
    fn consumer_toggles_cycle_once_per_link() {
        init_global_test_arena();
        let mut ring = ProducerRing::new(4).unwrap();
        let mut consumer = RingConsumer::new(ring.base());

        // 3 usable slots per lap; run 4 laps
        for i in 0..12u64 {
            let mut trb = Trb::noop_command();
            trb.parameter = i;
            ring.enqueue(trb);
            let got = consumer.consume().expect("published TRB is visible");
            assert_eq!(got.parameter, i);
        }
        assert_eq!(consumer.link_traversals, 3);
    }

    #[test]
    fn consumer_stops_at_stale_entries() {
        init_global_test_arena();
        let mut ring = ProducerRing::new(8).unwrap();
        let mut consumer = RingConsumer::new(ring.base());

        assert!(consumer.consume().is_none(), "fresh ring is empty");
        ring.enqueue(Trb::noop_command());
        assert!(consumer.consume().is_some());
        assert!(consumer.consume().is_none(), "no overrun past the producer");
    }

    #[test]
    fn event_ring_wrap_toggles_consumer_cycle() {
        init_global_test_arena();
        let mut ring = EventRing::new(16).unwrap();

        // Device-side producer model
        let mut producer_cycle = true;
        let segment_base = ring.segment_base();
        let write_event = |index: usize, cycle: bool, param: u64| {
            let mut trb = Trb::zeroed();
            trb.set_trb_type(TrbType::CommandCompletion);
            trb.parameter = param;
            trb.set_cycle(cycle);
            unsafe {
                core::ptr::write_volatile(
                    (mm::phys_to_ptr(segment_base) as *mut Trb).add(index),
                    trb,
                );
            }
        };

        // Fill a lap and a half
        for i in 0..24usize {
            let index = i % 16;
            if index == 0 && i > 0 {
                producer_cycle = !producer_cycle;
            }
            write_event(index, producer_cycle, i as u64);
            let got = ring.dequeue_event().expect("event visible");
            assert_eq!(got.parameter, i as u64);
        }
        assert!(!ring.has_events());
    }

    #[test]
    fn crcr_carries_initial_cycle() {
        init_global_test_arena();
        let ring = ProducerRing::new(16).unwrap();
        assert_eq!(ring.crcr_value() & 0x1, 1);
        assert_eq!(ring.crcr_value() & !0x3F, ring.base());
    }
}
