//! AArch64 task contexts.
//!
//! `Context` holds exactly what the cooperative switch needs: callee-saved
//! GPRs, frame pointer, stack pointer, and a resume address in x30.
//! `TrapFrame` is the full register snapshot taken at exception entry and
//! consumed by fork/exec and the user-return path.

/// Callee-saved register context for kernel-mode switches.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub sp: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub x29: u64, // frame pointer
    pub x30: u64, // resume address
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
        }
    }

    /// Context that, on first switch-in, calls `entry(arg)` on `stack_top`.
    ///
    /// The entry trampoline moves the stashed argument into x0 and branches
    /// to the stashed entry point; `entry` must never return.
    pub fn new_kernel(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.sp = stack_top & !0xF;
        ctx.x19 = entry as usize as u64;
        ctx.x20 = arg as u64;
        ctx.x30 = task_entry_trampoline as usize as u64;
        ctx
    }

    /// Context that, on first switch-in, restores the trap frame found at
    /// the top of the kernel stack and erets to user mode. Used by fork:
    /// the child resumes at the parent's trap point with its own frame.
    pub fn new_forked(kstack_top: u64, frame_at: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.sp = kstack_top & !0xF;
        ctx.x19 = frame_at;
        ctx.x30 = user_return_trampoline as usize as u64;
        ctx
    }
}

/// Full register snapshot at exception entry (SVC, IRQ, fault).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub regs: [u64; 31], // x0..x30
    pub sp: u64,         // SP_EL0
    pub pc: u64,         // ELR_EL1
    pub pstate: u64,     // SPSR_EL1
}

impl TrapFrame {
    /// Force the syscall return value seen by this frame's task.
    pub fn set_return_value(&mut self, value: u64) {
        self.regs[0] = value;
    }

    pub fn return_value(&self) -> u64 {
        self.regs[0]
    }

    /// First argument register, for threads entering at a fresh PC.
    pub fn set_arg0(&mut self, value: u64) {
        self.regs[0] = value;
    }

    /// Point the frame at a fresh user entry (exec).
    pub fn set_user_entry(&mut self, pc: u64, sp: u64) {
        self.pc = pc;
        self.sp = sp;
        self.pstate = 0; // EL0t, all interrupts enabled
    }

    pub fn syscall_number(&self) -> u64 {
        self.regs[8]
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [
            self.regs[0],
            self.regs[1],
            self.regs[2],
            self.regs[3],
            self.regs[4],
            self.regs[5],
        ]
    }
}

extern "C" {
    fn cpu_context_switch(old: *mut Context, new: *const Context);
    fn task_entry_trampoline() -> !;
    fn user_return_trampoline() -> !;
}

/// See [`crate::arch::context_switch`].
#[inline]
pub unsafe fn switch(old: *mut Context, new: *const Context) {
    cpu_context_switch(old, new)
}

core::arch::global_asm!(
    r#"
    .text
    .global cpu_context_switch
cpu_context_switch:
    // x0 = old, x1 = new
    mov     x2, sp
    str     x2, [x0, #0]
    stp     x19, x20, [x0, #8]
    stp     x21, x22, [x0, #24]
    stp     x23, x24, [x0, #40]
    stp     x25, x26, [x0, #56]
    stp     x27, x28, [x0, #72]
    stp     x29, x30, [x0, #88]

    ldr     x2, [x1, #0]
    mov     sp, x2
    ldp     x19, x20, [x1, #8]
    ldp     x21, x22, [x1, #24]
    ldp     x23, x24, [x1, #40]
    ldp     x25, x26, [x1, #56]
    ldp     x27, x28, [x1, #72]
    ldp     x29, x30, [x1, #88]

    ret

    .global task_entry_trampoline
task_entry_trampoline:
    // First switch into a kernel task: x19 = entry, x20 = arg
    mov     x0, x20
    br      x19

    .global user_return_trampoline
user_return_trampoline:
    // First switch into a forked task: x19 = &TrapFrame
    mov     x9, x19
    ldr     x10, [x9, #248]         // sp
    msr     sp_el0, x10
    ldr     x10, [x9, #256]         // pc
    msr     elr_el1, x10
    ldr     x10, [x9, #264]         // pstate
    msr     spsr_el1, x10
    ldp     x0, x1, [x9, #0]
    ldp     x2, x3, [x9, #16]
    ldp     x4, x5, [x9, #32]
    ldp     x6, x7, [x9, #48]
    ldr     x8, [x9, #64]
    ldp     x10, x11, [x9, #80]
    ldp     x12, x13, [x9, #96]
    ldp     x14, x15, [x9, #112]
    ldp     x16, x17, [x9, #128]
    ldp     x18, x19, [x9, #144]
    ldp     x20, x21, [x9, #160]
    ldp     x22, x23, [x9, #176]
    ldp     x24, x25, [x9, #192]
    ldp     x26, x27, [x9, #208]
    ldp     x28, x29, [x9, #224]
    ldr     x30, [x9, #240]
    ldr     x9, [x9, #72]
    eret
    "#
);
