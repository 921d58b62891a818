//! x86_64 task contexts.
//!
//! `Context` keeps the System V callee-saved set plus the stack pointer;
//! everything else is on the stack when a cooperative switch happens.
//! `TrapFrame` is the syscall/interrupt entry snapshot used by fork/exec.

/// Callee-saved register context for kernel-mode switches.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64, // frame pointer
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Context that, on first switch-in, calls `entry(arg)` on `stack_top`.
    pub fn new_kernel(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: u64) -> Self {
        let mut ctx = Self::zeroed();
        // The switch routine `ret`s into the trampoline, which moves the
        // stashed argument into rdi and jumps to the stashed entry.
        let mut sp = stack_top & !0xF;
        sp -= 8;
        unsafe {
            core::ptr::write(sp as *mut u64, task_entry_trampoline as usize as u64);
        }
        ctx.rsp = sp;
        ctx.r12 = entry as usize as u64;
        ctx.r13 = arg as u64;
        ctx
    }

    /// Context that, on first switch-in, restores the trap frame at
    /// `frame_at` and iretqs to user mode (fork child resume path).
    pub fn new_forked(kstack_top: u64, frame_at: u64) -> Self {
        let mut ctx = Self::zeroed();
        let mut sp = kstack_top & !0xF;
        sp -= 8;
        unsafe {
            core::ptr::write(sp as *mut u64, user_return_trampoline as usize as u64);
        }
        ctx.rsp = sp;
        ctx.r12 = frame_at;
        ctx
    }
}

/// Register snapshot at syscall/interrupt entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rcx: u64,
    pub r11: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl TrapFrame {
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    pub fn return_value(&self) -> u64 {
        self.rax
    }

    /// First argument register, for threads entering at a fresh PC.
    pub fn set_arg0(&mut self, value: u64) {
        self.rdi = value;
    }

    pub fn set_user_entry(&mut self, pc: u64, sp: u64) {
        self.rip = pc;
        self.rsp = sp;
        self.rflags = 0x202; // IF set
    }

    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
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
    // rdi = old, rsi = new
    mov     [rdi + 0x00], rsp
    mov     [rdi + 0x08], rbx
    mov     [rdi + 0x10], rbp
    mov     [rdi + 0x18], r12
    mov     [rdi + 0x20], r13
    mov     [rdi + 0x28], r14
    mov     [rdi + 0x30], r15

    mov     rsp, [rsi + 0x00]
    mov     rbx, [rsi + 0x08]
    mov     rbp, [rsi + 0x10]
    mov     r12, [rsi + 0x18]
    mov     r13, [rsi + 0x20]
    mov     r14, [rsi + 0x28]
    mov     r15, [rsi + 0x30]

    ret

    .global task_entry_trampoline
task_entry_trampoline:
    // First switch into a kernel task: r12 = entry, r13 = arg
    mov     rdi, r13
    jmp     r12

    .global user_return_trampoline
user_return_trampoline:
    // First switch into a forked task: r12 = &TrapFrame
    mov     r11, r12
    // Build the iretq frame: ss, rsp, rflags, cs, rip
    mov     rax, 0x1B            // user data selector, RPL 3
    push    rax
    push    qword ptr [r11 + 0x80]   // rsp
    push    qword ptr [r11 + 0x88]   // rflags
    mov     rax, 0x23            // user code selector, RPL 3
    push    rax
    push    qword ptr [r11 + 0x78]   // rip
    mov     rax, [r11 + 0x00]
    mov     rdi, [r11 + 0x08]
    mov     rsi, [r11 + 0x10]
    mov     rdx, [r11 + 0x18]
    mov     r10, [r11 + 0x20]
    mov     r8,  [r11 + 0x28]
    mov     r9,  [r11 + 0x30]
    mov     rbx, [r11 + 0x38]
    mov     rbp, [r11 + 0x40]
    mov     r12, [r11 + 0x48]
    mov     r13, [r11 + 0x50]
    mov     r14, [r11 + 0x58]
    mov     r15, [r11 + 0x60]
    mov     rcx, [r11 + 0x68]
    mov     r11, [r11 + 0x70]
    iretq
    "#
);
