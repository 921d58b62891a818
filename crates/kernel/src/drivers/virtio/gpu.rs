/// VirtIO GPU driver (device id 16, 2D only).
///
/// Brings the device through the status handshake, programs the control
/// and cursor queues, then speaks the 2D command set: display info,
/// resource create, backing attach, scanout, transfer, flush. The
/// framebuffer it exposes is consumed by the display stack upstream.
use super::queue::{Buffer, VirtQueue};
use super::{negotiate, status, VirtioTransport};
use crate::drivers::{poll_until, DriverError, DriverResult};
use crate::mm::{self, PhysAddr, PAGE_SIZE};

/// Feature bits
pub const VIRTIO_GPU_F_EDID: u64 = 1 << 1;

// Control command types
const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

// Response types
const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;

/// BGRA8888
const FORMAT_B8G8R8A8: u32 = 1;

const MAX_SCANOUTS: usize = 16;

/// Fallback mode when the device reports no enabled scanout.
const DEFAULT_WIDTH: u32 = 1024;
const DEFAULT_HEIGHT: u32 = 768;

/// Largest control queue we program.
const MAX_CONTROL_QUEUE: u16 = 256;

const COMPLETION_RETRIES: u32 = 100_000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CtrlHdr {
    cmd_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DisplayOne {
    r: Rect,
    enabled: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RespDisplayInfo {
    hdr: CtrlHdr,
    pmodes: [DisplayOne; MAX_SCANOUTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceCreate2d {
    hdr: CtrlHdr,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceAttachBacking {
    hdr: CtrlHdr,
    resource_id: u32,
    nr_entries: u32,
    // one entry inline
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SetScanout {
    hdr: CtrlHdr,
    r: Rect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TransferToHost2d {
    hdr: CtrlHdr,
    r: Rect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceFlush {
    hdr: CtrlHdr,
    r: Rect,
    resource_id: u32,
    padding: u32,
}

pub struct VirtioGpu<T: VirtioTransport> {
    transport: T,
    control: VirtQueue,
    #[allow(dead_code)]
    cursor: VirtQueue,
    /// One frame each for command and response staging
    req_buf: PhysAddr,
    resp_buf: PhysAddr,
    width: u32,
    height: u32,
    framebuffer: Option<PhysAddr>,
    fb_order: u8,
    scanout_resource: u32,
}

impl<T: VirtioTransport> VirtioGpu<T> {
    /// Bring the device to DRIVER_OK with both queues live, then query
    /// the display mode.
    pub fn new(transport: T) -> DriverResult<Self> {
        negotiate(&transport, VIRTIO_GPU_F_EDID)?;

        let max = transport.max_queue_size(0);
        if max == 0 {
            return Err(DriverError::Protocol);
        }
        let size = max.min(MAX_CONTROL_QUEUE);
        let control = VirtQueue::new(0, size)?;
        let (desc, avail, used) = control.addresses();
        transport.setup_queue(0, size, desc, avail, used);
        transport.enable_queue(0);

        let cursor_size = transport.max_queue_size(1).min(16).max(1);
        let cursor = VirtQueue::new(1, cursor_size.next_power_of_two())?;
        let (desc, avail, used) = cursor.addresses();
        transport.setup_queue(1, cursor.size, desc, avail, used);
        transport.enable_queue(1);

        transport.write_status(
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );

        let req_buf = mm::alloc_frame().map_err(DriverError::from)?;
        let resp_buf = mm::alloc_frame().map_err(DriverError::from)?;

        let mut gpu = Self {
            transport,
            control,
            cursor,
            req_buf,
            resp_buf,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            framebuffer: None,
            fb_order: 0,
            scanout_resource: 0,
        };
        gpu.query_display_info()?;
        crate::info!("virtio-gpu: display {}x{}", gpu.width, gpu.height);
        Ok(gpu)
    }

    /// Issue one request/response exchange over the control queue.
    fn command<Req: Copy>(&mut self, request: &Req, resp_len: usize) -> DriverResult<u32> {
        let req_len = core::mem::size_of::<Req>();
        unsafe {
            core::ptr::write_unaligned(mm::phys_to_ptr(self.req_buf) as *mut Req, *request);
            core::ptr::write_bytes(mm::phys_to_ptr(self.resp_buf), 0, resp_len);
        }

        let token = self.control.post(&[
            Buffer {
                addr: self.req_buf,
                len: req_len as u32,
                device_writes: false,
            },
            Buffer {
                addr: self.resp_buf,
                len: resp_len as u32,
                device_writes: true,
            },
        ])?;
        self.transport.notify(0);

        let mut done = false;
        poll_until(COMPLETION_RETRIES, || {
            if let Some((completed, _len)) = self.control.next_completion() {
                done = completed == token;
                true
            } else {
                false
            }
        })?;
        if !done {
            return Err(DriverError::Protocol);
        }

        let resp_type =
            unsafe { core::ptr::read_unaligned(mm::phys_to_ptr(self.resp_buf) as *const u32) };
        Ok(resp_type)
    }

    fn query_display_info(&mut self) -> DriverResult<()> {
        let req = CtrlHdr {
            cmd_type: CMD_GET_DISPLAY_INFO,
            ..Default::default()
        };
        let resp_type = self.command(&req, core::mem::size_of::<RespDisplayInfo>())?;
        if resp_type != RESP_OK_DISPLAY_INFO {
            return Err(DriverError::Protocol);
        }

        let info = unsafe {
            core::ptr::read_unaligned(mm::phys_to_ptr(self.resp_buf) as *const RespDisplayInfo)
        };
        match info.pmodes.iter().find(|m| m.enabled != 0) {
            Some(mode) if mode.r.width > 0 && mode.r.height > 0 => {
                self.width = mode.r.width;
                self.height = mode.r.height;
            }
            _ => {
                // No mode reported; stay on the default
                self.width = DEFAULT_WIDTH;
                self.height = DEFAULT_HEIGHT;
            }
        }
        Ok(())
    }

    /// Allocate and wire a BGRA framebuffer: create the 2D resource,
    /// attach backing pages, point scanout 0 at it.
    pub fn setup_framebuffer(&mut self) -> DriverResult<PhysAddr> {
        let bytes = self.width as usize * self.height as usize * 4;
        let order = bytes
            .div_ceil(PAGE_SIZE)
            .next_power_of_two()
            .trailing_zeros() as u8;
        let fb = mm::alloc_frames_in(order, mm::Zone::Normal).map_err(DriverError::from)?;

        let resource_id = 1;
        let create = ResourceCreate2d {
            hdr: CtrlHdr {
                cmd_type: CMD_RESOURCE_CREATE_2D,
                ..Default::default()
            },
            resource_id,
            format: FORMAT_B8G8R8A8,
            width: self.width,
            height: self.height,
        };
        let resp = self.clone_and_run(&create)?;
        Self::expect_ok(resp)?;

        let attach = ResourceAttachBacking {
            hdr: CtrlHdr {
                cmd_type: CMD_RESOURCE_ATTACH_BACKING,
                ..Default::default()
            },
            resource_id,
            nr_entries: 1,
            addr: fb,
            length: bytes as u32,
            padding: 0,
        };
        let resp = self.clone_and_run(&attach)?;
        Self::expect_ok(resp)?;

        let scanout = SetScanout {
            hdr: CtrlHdr {
                cmd_type: CMD_SET_SCANOUT,
                ..Default::default()
            },
            r: self.full_rect(),
            scanout_id: 0,
            resource_id,
        };
        let resp = self.clone_and_run(&scanout)?;
        Self::expect_ok(resp)?;

        self.framebuffer = Some(fb);
        self.fb_order = order;
        self.scanout_resource = resource_id;
        Ok(fb)
    }

    fn clone_and_run<Req: Copy>(&mut self, req: &Req) -> DriverResult<u32> {
        let req = *req;
        self.command(&req, core::mem::size_of::<CtrlHdr>())
    }

    fn expect_ok(resp_type: u32) -> DriverResult<()> {
        if resp_type == RESP_OK_NODATA {
            Ok(())
        } else {
            Err(DriverError::Protocol)
        }
    }

    fn full_rect(&self) -> Rect {
        Rect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }

    /// Push framebuffer contents to the host and flush the scanout.
    pub fn flush(&mut self) -> DriverResult<()> {
        if self.framebuffer.is_none() {
            return Err(DriverError::NotInitialized);
        }
        let transfer = TransferToHost2d {
            hdr: CtrlHdr {
                cmd_type: CMD_TRANSFER_TO_HOST_2D,
                ..Default::default()
            },
            r: self.full_rect(),
            offset: 0,
            resource_id: self.scanout_resource,
            padding: 0,
        };
        let resp = self.clone_and_run(&transfer)?;
        Self::expect_ok(resp)?;

        let flush = ResourceFlush {
            hdr: CtrlHdr {
                cmd_type: CMD_RESOURCE_FLUSH,
                ..Default::default()
            },
            r: self.full_rect(),
            resource_id: self.scanout_resource,
            padding: 0,
        };
        let resp = self.clone_and_run(&flush)?;
        Self::expect_ok(resp)
    }

    pub fn display_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn control_queue_size(&self) -> u16 {
        self.control.size
    }
}

impl<T: VirtioTransport> Drop for VirtioGpu<T> {
    fn drop(&mut self) {
        mm::free_frame(self.req_buf);
        mm::free_frame(self.resp_buf);
        if let Some(fb) = self.framebuffer {
            mm::free_frames(fb, self.fb_order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::virtio::queue::tests::DeviceSide;
    use crate::mm::buddy::tests::init_global_test_arena;
    use std::cell::RefCell;

    /// Host-side virtio-gpu model: answers every control command, and
    /// reports no enabled scanout so the driver falls back to the
    /// default mode.
    struct ModelGpu {
        state: RefCell<ModelState>,
    }

    struct ModelState {
        status: u8,
        queues: [QueueState; 2],
    }

    #[derive(Default, Clone, Copy)]
    struct QueueState {
        size: u16,
        desc: u64,
        avail: u64,
        used: u64,
        enabled: bool,
        last_avail: u16,
        used_idx: u16,
    }

    unsafe impl Send for ModelGpu {}

    impl ModelGpu {
        fn new() -> Self {
            Self {
                state: RefCell::new(ModelState {
                    status: 0,
                    queues: [QueueState::default(); 2],
                }),
            }
        }
    }

    impl VirtioTransport for ModelGpu {
        fn read_status(&self) -> u8 {
            self.state.borrow().status
        }
        fn write_status(&self, s: u8) {
            self.state.borrow_mut().status = s;
        }
        fn read_device_features(&self) -> u64 {
            VIRTIO_GPU_F_EDID
        }
        fn write_driver_features(&self, _f: u64) {}
        fn max_queue_size(&self, queue: u16) -> u16 {
            if queue == 0 {
                64
            } else {
                16
            }
        }
        fn setup_queue(&self, queue: u16, size: u16, desc: u64, avail: u64, used: u64) {
            let mut state = self.state.borrow_mut();
            let q = &mut state.queues[queue as usize];
            q.size = size;
            q.desc = desc;
            q.avail = avail;
            q.used = used;
        }
        fn enable_queue(&self, queue: u16) {
            self.state.borrow_mut().queues[queue as usize].enabled = true;
        }
        fn queue_enabled(&self, queue: u16) -> bool {
            self.state.borrow().queues[queue as usize].enabled
        }
        fn notify(&self, queue: u16) {
            if queue != 0 {
                return;
            }
            let mut state = self.state.borrow_mut();
            let q = &mut state.queues[0];
            let mut side = DeviceSide::from_raw(q.desc, q.avail, q.used, q.size);
            // Resume device-side cursors across notifies
            side.last_avail = q.last_avail;
            side.used_idx = q.used_idx;

            while let Some((head, _writable)) = side.pop_avail() {
                let chain = side.chain(head);
                let req = chain[0];
                let resp = *chain.last().unwrap();

                let cmd = unsafe {
                    core::ptr::read_unaligned(crate::mm::phys_to_ptr(req.addr) as *const u32)
                };
                let (resp_type, resp_len) = match cmd {
                    CMD_GET_DISPLAY_INFO => (
                        RESP_OK_DISPLAY_INFO,
                        core::mem::size_of::<RespDisplayInfo>(),
                    ),
                    _ => (RESP_OK_NODATA, core::mem::size_of::<CtrlHdr>()),
                };
                unsafe {
                    // Zeroed body: every scanout reads as disabled
                    core::ptr::write_bytes(
                        crate::mm::phys_to_ptr(resp.addr),
                        0,
                        resp_len.min(resp.len as usize),
                    );
                    core::ptr::write_unaligned(
                        crate::mm::phys_to_ptr(resp.addr) as *mut u32,
                        resp_type,
                    );
                }
                side.complete(head, resp_len as u32);
            }

            q.last_avail = side.last_avail;
            q.used_idx = side.used_idx;
        }
        fn read_device_config_u32(&self, _o: usize) -> u32 {
            0
        }
        fn write_device_config_u32(&self, _o: usize, _v: u32) {}
    }

    #[test]
    fn bring_up_reaches_driver_ok_with_default_mode() {
        init_global_test_arena();
        let gpu = VirtioGpu::new(ModelGpu::new()).unwrap();

        let status = gpu.transport().read_status();
        assert!(status & status::DRIVER_OK != 0);
        assert!(status & status::FEATURES_OK != 0);
        assert!(gpu.transport().queue_enabled(0), "control queue live");
        assert!(gpu.control_queue_size() <= 256);
        assert_eq!(gpu.display_size(), (1024, 768), "default mode");
    }

    #[test]
    fn framebuffer_setup_and_flush_round_trip() {
        init_global_test_arena();
        let mut gpu = VirtioGpu::new(ModelGpu::new()).unwrap();
        let fb = gpu.setup_framebuffer().unwrap();
        assert_ne!(fb, 0);
        gpu.flush().unwrap();
    }
}
