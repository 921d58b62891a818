//! System-call surface.
//!
//! Numbers follow the AArch64 Linux generic table so the C library
//! collaborator links unchanged; the trap stub puts the number in x8
//! (rax on x86_64) and arguments in the first six argument registers.
//! Process-model calls land in the task subsystem; file-backed calls
//! forward to the VFS collaborator registered at boot and answer
//! ENOSYS until one shows up.

use crate::arch::TrapFrame;
use crate::error::Errno;
use crate::mm::SharedAddressSpace;
use crate::task::{self, CloneFlags};
use alloc::string::String;
use alloc::vec::Vec;
use spin::Once;

pub mod nr {
    pub const GETCWD: u64 = 17;
    pub const DUP: u64 = 23;
    pub const DUP3: u64 = 24;
    pub const CHDIR: u64 = 49;
    pub const OPENAT: u64 = 56;
    pub const CLOSE: u64 = 57;
    pub const PIPE2: u64 = 59;
    pub const LSEEK: u64 = 62;
    pub const READ: u64 = 63;
    pub const WRITE: u64 = 64;
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
    pub const NANOSLEEP: u64 = 101;
    pub const GETPID: u64 = 172;
    pub const GETPPID: u64 = 173;
    pub const GETUID: u64 = 174;
    pub const GETEUID: u64 = 175;
    pub const GETGID: u64 = 176;
    pub const GETEGID: u64 = 177;
    pub const CLONE: u64 = 220;
    pub const EXECVE: u64 = 221;
}

/// File-backed operations the in-RAM VFS collaborator provides.
pub trait VfsHooks: Send + Sync {
    fn read(&self, fd: i32, buf: u64, count: usize) -> Result<isize, Errno>;
    fn write(&self, fd: i32, buf: u64, count: usize) -> Result<isize, Errno>;
    fn openat(&self, dirfd: i32, path: u64, flags: u32) -> Result<i32, Errno>;
    fn close(&self, fd: i32) -> Result<(), Errno>;
    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64, Errno>;
    fn pipe2(&self, fds: u64, flags: u32) -> Result<(), Errno>;
    fn dup(&self, fd: i32) -> Result<i32, Errno>;
    fn dup3(&self, old: i32, new: i32, flags: u32) -> Result<i32, Errno>;
    fn chdir(&self, path: u64) -> Result<(), Errno>;
    fn getcwd(&self, buf: u64, size: usize) -> Result<isize, Errno>;
}

static VFS: Once<&'static dyn VfsHooks> = Once::new();

pub fn register_vfs(vfs: &'static dyn VfsHooks) {
    VFS.call_once(|| vfs);
}

fn vfs() -> Result<&'static dyn VfsHooks, Errno> {
    VFS.get().copied().ok_or(Errno::ENOSYS)
}

fn credentials() -> task::Credentials {
    task::sched::with_sched(|s| {
        let id = s.current;
        s.table.get(id).map(|t| t.cred).unwrap_or_default()
    })
    .unwrap_or_default()
}

/// Caps on what execve will pull out of user memory.
const MAX_STRING_BYTES: usize = 4096;
const MAX_PTR_ENTRIES: usize = 64;

/// Bounded reader for pointer arguments. A task with an address space
/// is read through its translations; kernel tasks pass kernel pointers,
/// read directly.
struct UserMem {
    space: Option<SharedAddressSpace>,
}

impl UserMem {
    fn for_current() -> Self {
        let space = task::sched::with_sched(|s| {
            let id = s.current;
            s.table.get(id).and_then(|t| t.space.clone())
        })
        .ok()
        .flatten();
        Self { space }
    }

    fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        if vaddr == 0 {
            return Err(Errno::EFAULT);
        }
        match &self.space {
            Some(space) => space.lock().read_bytes(vaddr, buf).map_err(Errno::from),
            None => {
                unsafe {
                    core::ptr::copy_nonoverlapping(vaddr as *const u8, buf.as_mut_ptr(), buf.len());
                }
                Ok(())
            }
        }
    }

    /// NUL-terminated string, at most MAX_STRING_BYTES.
    fn read_string(&self, vaddr: u64) -> Result<String, Errno> {
        let mut bytes = Vec::new();
        for offset in 0..MAX_STRING_BYTES as u64 {
            let mut byte = [0u8; 1];
            self.read(vaddr + offset, &mut byte)?;
            if byte[0] == 0 {
                return String::from_utf8(bytes).map_err(|_| Errno::EINVAL);
            }
            bytes.push(byte[0]);
        }
        Err(Errno::E2BIG)
    }

    /// NULL-terminated pointer array of strings (argv/envp shape). A
    /// null array pointer reads as empty.
    fn read_string_array(&self, vaddr: u64) -> Result<Vec<String>, Errno> {
        let mut strings = Vec::new();
        if vaddr == 0 {
            return Ok(strings);
        }
        for slot in 0..MAX_PTR_ENTRIES as u64 {
            let mut word = [0u8; 8];
            self.read(vaddr + slot * 8, &mut word)?;
            let ptr = u64::from_le_bytes(word);
            if ptr == 0 {
                return Ok(strings);
            }
            strings.push(self.read_string(ptr)?);
        }
        Err(Errno::E2BIG)
    }
}

/// Decode path/argv/envp from the trap's raw pointers and replace the
/// calling task's image.
fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> Result<isize, Errno> {
    let mem = UserMem::for_current();
    let path = mem.read_string(path_ptr)?;
    let argv = mem.read_string_array(argv_ptr)?;
    let envp = mem.read_string_array(envp_ptr)?;

    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();
    task::execve(&path, &argv_refs, &envp_refs)
        .map(|_| 0)
        .map_err(Errno::from)
}

/// Dispatch one trap. The return value goes back in the first argument
/// register; errors return negated errno values.
pub fn dispatch(frame: &mut TrapFrame) -> isize {
    let nr_val = frame.syscall_number();
    let args = frame.syscall_args();

    let result: Result<isize, Errno> = match nr_val {
        nr::READ => vfs().and_then(|v| v.read(args[0] as i32, args[1], args[2] as usize)),
        nr::WRITE => vfs().and_then(|v| v.write(args[0] as i32, args[1], args[2] as usize)),
        nr::OPENAT => {
            vfs().and_then(|v| v.openat(args[0] as i32, args[1], args[2] as u32).map(|fd| fd as isize))
        }
        nr::CLOSE => vfs().and_then(|v| v.close(args[0] as i32).map(|_| 0)),
        nr::LSEEK => {
            vfs().and_then(|v| v.lseek(args[0] as i32, args[1] as i64, args[2] as i32).map(|o| o as isize))
        }
        nr::PIPE2 => vfs().and_then(|v| v.pipe2(args[0], args[1] as u32).map(|_| 0)),
        nr::DUP => vfs().and_then(|v| v.dup(args[0] as i32).map(|fd| fd as isize)),
        nr::DUP3 => vfs().and_then(|v| {
            v.dup3(args[0] as i32, args[1] as i32, args[2] as u32)
                .map(|fd| fd as isize)
        }),
        nr::CHDIR => vfs().and_then(|v| v.chdir(args[0]).map(|_| 0)),
        nr::GETCWD => vfs().and_then(|v| v.getcwd(args[0], args[1] as usize)),

        nr::EXIT | nr::EXIT_GROUP => task::exit(args[0] as i32),

        nr::GETPID => Ok(task::current() as isize),
        nr::GETPPID => task::sched::with_sched(|s| {
            let id = s.current;
            s.table.get(id).and_then(|t| t.parent).unwrap_or(0) as isize
        })
        .map_err(Errno::from),
        nr::GETUID => Ok(credentials().uid as isize),
        nr::GETEUID => Ok(credentials().euid as isize),
        nr::GETGID => Ok(credentials().gid as isize),
        nr::GETEGID => Ok(credentials().egid as isize),

        nr::CLONE => {
            // args: flags, user stack top, entry, arg
            let mut flags = CloneFlags::empty();
            // CLONE_VM | CLONE_THREAD in the conventional encoding
            if args[0] & 0x100 != 0 {
                flags |= CloneFlags::SHARE_VM;
            }
            if args[0] & 0x10000 != 0 {
                flags |= CloneFlags::SAME_THREAD_GROUP;
            }
            if flags.is_empty() {
                task::fork().map(|id| id as isize).map_err(Errno::from)
            } else {
                task::create_thread(args[2], args[3], args[1], flags)
                    .map(|id| id as isize)
                    .map_err(Errno::from)
            }
        }
        nr::EXECVE => sys_execve(args[0], args[1], args[2]),

        nr::NANOSLEEP => {
            task::yield_now();
            Ok(0)
        }

        _ => {
            crate::debug!("syscall: unknown number {}", nr_val);
            Err(Errno::ENOSYS)
        }
    };

    let value = match result {
        Ok(v) => v,
        Err(e) => e.as_isize(),
    };
    frame.set_return_value(value as u64);

    // KILL delivery checkpoint on the kernel-to-user return path: a
    // task marked for termination dies here instead of resuming user
    // code.
    let doomed = task::sched::with_sched(|s| {
        let id = s.current;
        task::check_pending_kill(s, id)
    })
    .unwrap_or(false);
    if doomed {
        task::schedule();
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    #[test]
    fn dispatch_process_identity_calls() {
        init_global_test_arena();
        crate::task::init().unwrap();

        let mut frame = TrapFrame::default();
        set_syscall(&mut frame, nr::GETPID, &[0; 6]);
        let pid = dispatch(&mut frame);
        assert!(pid >= 0);
        assert_eq!(frame.return_value() as isize, pid);

        set_syscall(&mut frame, nr::GETUID, &[0; 6]);
        assert_eq!(dispatch(&mut frame), 0, "boot tasks run as root");
    }

    #[test]
    fn file_calls_answer_enosys_without_vfs() {
        init_global_test_arena();
        crate::task::init().unwrap();

        let mut frame = TrapFrame::default();
        set_syscall(&mut frame, nr::READ, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(dispatch(&mut frame), Errno::ENOSYS.as_isize());
    }

    #[test]
    fn dispatch_execve_replaces_current_image() {
        init_global_test_arena();
        crate::task::init().unwrap();
        crate::task::exec::tests::register_sample_fs();

        // Kernel-task exec: NUL-terminated path plus NULL-terminated
        // argv/envp pointer arrays, exactly as the C library lays them
        // out
        let path = b"/bin/prog\0";
        let arg0 = b"prog\0";
        let argv: [u64; 2] = [arg0.as_ptr() as u64, 0];
        let envp: [u64; 1] = [0];

        let mut frame = TrapFrame::default();
        set_syscall(
            &mut frame,
            nr::EXECVE,
            &[
                path.as_ptr() as u64,
                argv.as_ptr() as u64,
                envp.as_ptr() as u64,
                0,
                0,
                0,
            ],
        );
        assert_eq!(dispatch(&mut frame), 0);

        let (comm, has_space) = crate::task::sched::with_sched(|s| {
            let id = s.current;
            let task = s.table.get(id).unwrap();
            (String::from(task.comm.as_str()), task.space.is_some())
        })
        .unwrap();
        assert_eq!(comm, "prog", "command name follows the image");
        assert!(has_space, "exec installed a fresh address space");
    }

    #[test]
    fn execve_rejects_bad_pointers() {
        init_global_test_arena();
        crate::task::init().unwrap();
        crate::task::exec::tests::register_sample_fs();

        let mut frame = TrapFrame::default();
        set_syscall(&mut frame, nr::EXECVE, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(dispatch(&mut frame), Errno::EFAULT.as_isize());
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        init_global_test_arena();
        crate::task::init().unwrap();

        let mut frame = TrapFrame::default();
        set_syscall(&mut frame, 9999, &[0; 6]);
        assert_eq!(dispatch(&mut frame), Errno::ENOSYS.as_isize());
    }

    #[cfg(target_arch = "aarch64")]
    fn set_syscall(frame: &mut TrapFrame, nr_val: u64, args: &[u64; 6]) {
        frame.regs[8] = nr_val;
        frame.regs[..6].copy_from_slice(args);
    }

    #[cfg(target_arch = "x86_64")]
    fn set_syscall(frame: &mut TrapFrame, nr_val: u64, args: &[u64; 6]) {
        frame.rax = nr_val;
        frame.rdi = args[0];
        frame.rsi = args[1];
        frame.rdx = args[2];
        frame.r10 = args[3];
        frame.r8 = args[4];
        frame.r9 = args[5];
    }
}
