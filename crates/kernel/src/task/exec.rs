/// ELF64 loading and exec.
///
/// Parses an ELF64 executable, eagerly maps its LOAD segments into a
/// fresh address space, builds the initial user stack (System V layout:
/// argc on top, argv/envp pointer arrays beneath, strings above), and
/// points the task at the entry point. Segment bytes are written through
/// the kernel's view of the freshly allocated frames, so the destination
/// space never has to be active during loading.
///
/// The file itself comes from the VFS collaborator registered at boot.
use super::sched::Scheduler;
use super::task::TaskId;
use crate::error::KernelError;
use crate::mm::{self, AddressSpace, MapFlags, USER_STACK_SIZE, USER_STACK_TOP};
use alloc::vec::Vec;
use spin::Once;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;

pub const EM_AARCH64: u16 = 183;
pub const EM_X86_64: u16 = 62;

/// Machine this kernel accepts.
#[cfg(target_arch = "aarch64")]
pub const EM_NATIVE: u16 = EM_AARCH64;
#[cfg(target_arch = "x86_64")]
pub const EM_NATIVE: u16 = EM_X86_64;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Where the loaded image starts executing.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: u64,
    pub stack_pointer: u64,
}

fn read_struct<T: Copy>(data: &[u8], offset: usize) -> Result<T, KernelError> {
    let size = core::mem::size_of::<T>();
    if offset + size > data.len() {
        return Err(KernelError::BadFormat);
    }
    // Alignment is not guaranteed inside a byte buffer
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

/// Load an ELF64 executable into `space` and prepare its initial stack.
pub fn load_elf(
    space: &mut AddressSpace,
    elf: &[u8],
    argv: &[&str],
    envp: &[&str],
) -> Result<LoadedImage, KernelError> {
    let ehdr: Elf64Ehdr = read_struct(elf, 0)?;

    if ehdr.e_ident[0..4] != ELF_MAGIC {
        return Err(KernelError::BadFormat);
    }
    if ehdr.e_ident[4] != ELFCLASS64 || ehdr.e_ident[5] != ELFDATA2LSB {
        return Err(KernelError::BadFormat);
    }
    if ehdr.e_machine != EM_NATIVE {
        return Err(KernelError::BadFormat);
    }
    if ehdr.e_type != ET_EXEC || ehdr.e_phnum == 0 {
        return Err(KernelError::BadFormat);
    }

    for i in 0..ehdr.e_phnum as usize {
        let phdr: Elf64Phdr =
            read_struct(elf, ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize)?;
        match phdr.p_type {
            PT_LOAD => load_segment(space, elf, &phdr)?,
            // No dynamic linker support
            PT_INTERP => return Err(KernelError::Unsupported),
            _ => {}
        }
    }

    let stack_pointer = build_user_stack(space, argv, envp)?;

    crate::info!(
        "exec: entry {:#x}, sp {:#x}, {} segments",
        ehdr.e_entry,
        stack_pointer,
        ehdr.e_phnum
    );
    Ok(LoadedImage {
        entry: ehdr.e_entry,
        stack_pointer,
    })
}

fn load_segment(
    space: &mut AddressSpace,
    elf: &[u8],
    phdr: &Elf64Phdr,
) -> Result<(), KernelError> {
    if phdr.p_memsz == 0 {
        return Ok(());
    }
    if phdr.p_filesz > phdr.p_memsz {
        return Err(KernelError::BadFormat);
    }
    let file_end = phdr
        .p_offset
        .checked_add(phdr.p_filesz)
        .ok_or(KernelError::BadFormat)?;
    if file_end > elf.len() as u64 {
        return Err(KernelError::BadFormat);
    }

    let mut flags = MapFlags::USER;
    if phdr.p_flags & PF_R != 0 {
        flags |= MapFlags::READ;
    }
    if phdr.p_flags & PF_W != 0 {
        flags |= MapFlags::WRITE;
    }
    if phdr.p_flags & PF_X != 0 {
        flags |= MapFlags::EXEC;
    }

    let page_start = mm::page_align_down(phdr.p_vaddr);
    let page_end = mm::page_align_up(phdr.p_vaddr + phdr.p_memsz);
    space.map_region(page_start, page_end - page_start, flags)?;

    // File payload; the gap up to p_memsz stays zero because frames come
    // out of the allocator zeroed
    space.write_bytes(
        phdr.p_vaddr,
        &elf[phdr.p_offset as usize..file_end as usize],
    )?;

    // Segment boundary bookkeeping
    if flags.contains(MapFlags::EXEC) {
        if space.segments.code_start == 0 || page_start < space.segments.code_start {
            space.segments.code_start = page_start;
        }
        if page_end > space.segments.code_end {
            space.segments.code_end = page_end;
        }
    } else if page_end > space.segments.data_end {
        space.segments.data_end = page_end;
    }

    crate::debug!(
        "exec: LOAD {:#x}..{:#x} filesz {:#x} {:?}",
        page_start,
        page_end,
        phdr.p_filesz,
        flags
    );
    Ok(())
}

/// Map the 1 MiB user stack and lay out the System V initial frame:
///
/// ```text
///   stack top ->  env strings, arg strings
///                 ...
///        sp  ->  argc | argv[0..n] NULL | envp[0..m] NULL
/// ```
fn build_user_stack(
    space: &mut AddressSpace,
    argv: &[&str],
    envp: &[&str],
) -> Result<u64, KernelError> {
    let stack_top = USER_STACK_TOP;
    let stack_base = stack_top - USER_STACK_SIZE;
    space.map_region(
        stack_base,
        USER_STACK_SIZE,
        MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
    )?;
    space.segments.stack_top = stack_top;

    // Strings first, growing down from the top
    let mut sp = stack_top;
    let mut write_string = |space: &AddressSpace, sp: &mut u64, s: &str| -> Result<u64, KernelError> {
        *sp -= s.len() as u64 + 1;
        space.write_bytes(*sp, s.as_bytes())?;
        space.write_bytes(*sp + s.len() as u64, &[0])?;
        Ok(*sp)
    };

    let mut env_ptrs = Vec::with_capacity(envp.len());
    for env in envp.iter().rev() {
        env_ptrs.push(write_string(space, &mut sp, env)?);
    }
    env_ptrs.reverse();
    space.segments.env_start = sp;

    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        arg_ptrs.push(write_string(space, &mut sp, arg)?);
    }
    arg_ptrs.reverse();
    space.segments.args_start = sp;

    // Pointer area: argc, argv[] with NULL, envp[] with NULL
    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1;
    sp &= !0xF;
    sp -= (words * 8) as u64;
    sp &= !0xF;

    let mut cursor = sp;
    let mut push_word = |space: &AddressSpace, cursor: &mut u64, word: u64| -> Result<(), KernelError> {
        space.write_bytes(*cursor, &word.to_le_bytes())?;
        *cursor += 8;
        Ok(())
    };

    push_word(space, &mut cursor, argv.len() as u64)?;
    for ptr in &arg_ptrs {
        push_word(space, &mut cursor, *ptr)?;
    }
    push_word(space, &mut cursor, 0)?;
    for ptr in &env_ptrs {
        push_word(space, &mut cursor, *ptr)?;
    }
    push_word(space, &mut cursor, 0)?;

    Ok(sp)
}

/// Source of executable images; the in-RAM VFS registers itself here.
pub trait ExecFilesystem: Send + Sync {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, KernelError>;
}

static EXEC_FS: Once<&'static dyn ExecFilesystem> = Once::new();

pub fn register_filesystem(fs: &'static dyn ExecFilesystem) {
    EXEC_FS.call_once(|| fs);
}

/// Replace a task's program image: fresh address space, new entry/stack,
/// command name from the final path component.
pub fn do_execve(
    sched: &mut Scheduler,
    id: TaskId,
    path: &str,
    argv: &[&str],
    envp: &[&str],
) -> Result<(), KernelError> {
    let fs = EXEC_FS.get().ok_or(KernelError::Unsupported)?;
    let image = fs.read_file(path)?;

    let mut space = AddressSpace::new_user()?;
    let loaded = load_elf(&mut space, &image, argv, envp)?;

    let task = sched.table.get_mut(id).ok_or(KernelError::NoSuchTask)?;
    task.set_comm_from_path(path);
    // The old space dies with its last reference
    task.space = Some(space.into_shared());
    task.trap_frame.set_user_entry(loaded.entry, loaded.stack_pointer);
    Ok(())
}
