//! Boot handoff and kernel initialization order.
//!
//! The ARM64 entry hands over a device-tree pointer; the x86_64 entry
//! receives the Limine-style package (HHDM offset, framebuffer, RSDP,
//! kernel bases). Either way the architecture stub distills it into a
//! `BootInfo` and calls `kernel_main`, which brings the subsystems up
//! leaves first: console, heap, paging, frames, scheduler, devices.

use crate::mm::{self, PhysAddr};

/// One entry of the firmware memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub length: u64,
    pub usable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub address: PhysAddr,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
}

/// Everything the kernel needs from the bootloader, normalized across
/// targets.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub memory_map: heapless::Vec<MemoryRegion, 16>,
    /// Higher-half direct-map offset (x86_64/Limine; zero on the
    /// identity-mapped ARM64 boot path)
    pub hhdm_offset: u64,
    pub framebuffer: Option<FramebufferInfo>,
    /// RSDP physical address (x86_64)
    pub rsdp: Option<PhysAddr>,
    /// Flattened device tree (ARM64)
    pub dtb: Option<PhysAddr>,
    pub uart_base: usize,
    pub uart_clock_hz: u32,
    /// PCIe ECAM window, from the DT or the MCFG table
    pub ecam_base: Option<PhysAddr>,
    /// Device-MMIO windows to identity-map with device attributes
    pub mmio_windows: heapless::Vec<(PhysAddr, u64), 8>,
}

/// Boot heap carve-out: the first usable region donates this much.
const BOOT_HEAP_BYTES: u64 = 8 * 1024 * 1024;

/// Bring the kernel up in dependency order and fall into the idle loop.
///
/// # Safety
/// Must be called exactly once, from the boot CPU, with `info` describing
/// the machine truthfully.
pub unsafe fn kernel_main(info: &BootInfo) -> ! {
    unsafe { crate::uart::init(info.uart_base, info.uart_clock_hz) };
    crate::time::init_boot_timestamp();
    crate::info!("helium: booting");

    mm::set_direct_map_offset(info.hhdm_offset);

    // Heap before everything: allocator metadata lives there
    let heap_region = info
        .memory_map
        .iter()
        .find(|r| r.usable && r.length >= BOOT_HEAP_BYTES)
        .expect("no usable memory for the boot heap");
    unsafe {
        crate::heap::init(
            (heap_region.base + info.hhdm_offset) as usize,
            BOOT_HEAP_BYTES as usize,
        );
    }

    // Kernel page tables: identity RAM window plus device windows
    let ram_top = info
        .memory_map
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0);
    let mmio: alloc::vec::Vec<(PhysAddr, u64)> = info.mmio_windows.iter().copied().collect();
    let kernel_root =
        mm::init_kernel_space(ram_top, &mmio).expect("kernel address space construction failed");

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        crate::arch::aarch64::mmu::enable(kernel_root)
    };
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = kernel_root; // firmware paging stays live on x86_64

    // Physical frames: usable regions minus the heap carve-out
    let mut ranges = alloc::vec::Vec::new();
    for region in info.memory_map.iter().filter(|r| r.usable) {
        if region.base == heap_region.base {
            if region.length > BOOT_HEAP_BYTES {
                ranges.push((region.base + BOOT_HEAP_BYTES, (region.length - BOOT_HEAP_BYTES) as usize));
            }
        } else {
            ranges.push((region.base, region.length as usize));
        }
    }
    mm::init_frame_allocator(&ranges).expect("frame allocator init failed");
    crate::info!(
        "mm: {} MiB free of {} MiB",
        mm::free_bytes() / (1024 * 1024),
        mm::total_bytes() / (1024 * 1024)
    );

    crate::task::init().expect("scheduler init failed");

    bring_up_devices(info);

    crate::info!("helium: entering idle");
    idle_loop()
}

/// Probe and start the devices the core drives. Failures are logged and
/// the device skipped; boot continues.
fn bring_up_devices(info: &BootInfo) {
    let Some(ecam_base) = info.ecam_base else {
        crate::info!("pci: no ECAM window reported, skipping device bring-up");
        return;
    };
    let ecam = unsafe { crate::drivers::pci::Ecam::new(ecam_base) };
    let devices = crate::drivers::pci::scan(&ecam);

    for device in devices.iter() {
        // virtio-pci vendor with a display-class function
        if device.vendor_id == 0x1AF4 && device.class == 0x03 {
            match crate::drivers::virtio::VirtioPciTransport::new(&ecam, device.bdf)
                .and_then(crate::drivers::virtio::gpu::VirtioGpu::new)
            {
                Ok(gpu) => {
                    let (w, h) = gpu.display_size();
                    crate::info!("virtio-gpu: ready at {}x{}", w, h);
                    core::mem::forget(gpu);
                }
                Err(e) => crate::warn!("virtio-gpu: bring-up failed: {}", e.name()),
            }
        }

        // xHCI: serial-bus class, USB subclass, xHCI programming interface
        if device.class == 0x0C && device.subclass == 0x03 && device.prog_if == 0x30 {
            match crate::drivers::pci::assign_bar(&ecam, device.bdf, 0).and_then(|bar| {
                crate::drivers::pci::enable_bus_mastering(&ecam, device.bdf);
                crate::drivers::usb::xhci::XhciController::new(mm::phys_to_ptr(bar) as usize)
            }) {
                Ok(mut xhci) => {
                    let found = xhci.enumerate_devices();
                    crate::info!("xhci: {} devices enumerated", found.len());
                    core::mem::forget(xhci);
                }
                Err(e) => crate::warn!("xhci: bring-up failed: {}", e.name()),
            }
        }
    }
}

fn idle_loop() -> ! {
    loop {
        crate::task::schedule();
        unsafe {
            #[cfg(target_arch = "aarch64")]
            core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
            #[cfg(target_arch = "x86_64")]
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;
    use crate::mm::buddy::FrameAllocator;
    use crate::task::Scheduler;

    #[test]
    fn boot_memory_map_reaches_idle() {
        // 256 MiB of RAM at 0x4000_0000: paging init succeeds, the frame
        // allocator accounts for at least 200 MiB, the fresh run queue is
        // empty, and the first scheduling decision keeps idle running.
        init_global_test_arena();

        let ram = (0x4000_0000u64, 256 * 1024 * 1024usize);
        let mut frames = FrameAllocator::new_for_tests();
        frames.init(&[ram]).unwrap();
        assert!(frames.free_bytes() >= 200 * 1024 * 1024);
        assert_eq!(frames.total_bytes(), 256 * 1024 * 1024);

        if crate::mm::kernel_root() == 0 {
            crate::mm::init_kernel_space(crate::mm::paging::L1_BLOCK_SIZE, &[(0x0900_0000, 0x1000)])
                .unwrap();
        }
        assert_ne!(crate::mm::kernel_root(), 0);

        let mut sched = Scheduler::new().unwrap();
        assert!(sched.queue.is_empty());
        assert!(sched.pick_next().is_none(), "idle task keeps the CPU");
        assert_eq!(sched.current, sched.idle);
    }
}
