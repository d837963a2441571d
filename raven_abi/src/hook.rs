//! Load-hook installation: base-relocation-aware addressing, the jump patch,
//! and the register-preserving trampoline.
//!
//! The patch is a single `jmp rel32` written over a fixed point in the
//! host's level-load path. The trampoline it reaches saves every
//! general-purpose register, the flags, and the FPU/SIMD environment, calls
//! the extender's registrar entry, restores everything, replays the original
//! instruction bytes the patch overwrote, and jumps back to the host's next
//! instruction. Any deviation in that sequence corrupts the host's own
//! stack or register state, so the byte emission below is covered by tests
//! even though installation itself can only run inside the host process.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;

/// Length of the `jmp rel32` patch.
pub const JMP_REL32_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("patch must displace at least {JMP_REL32_LEN} bytes, got {0}")]
    ShortDisplacement(usize),
    #[error("encoding trampoline bytes: {0}")]
    Encode(#[from] io::Error),
    #[error("changing page protection failed (errno {0})")]
    Protect(i32),
    #[error("allocating executable trampoline memory failed (errno {0})")]
    Allocate(i32),
    #[error("load hook is already installed")]
    AlreadyInstalled,
}

/// Rebase a virtual address from the image's on-disk expected base to where
/// the loader actually placed the module.
pub fn relocate(expected_va: u32, expected_base: u32, actual_base: u32) -> u32 {
    actual_base.wrapping_add(expected_va.wrapping_sub(expected_base))
}

/// `jmp rel32` reaching `to` from a patch whose first byte sits at `from`.
pub fn jmp_rel32(from: u32, to: u32) -> [u8; JMP_REL32_LEN] {
    let rel = to.wrapping_sub(from.wrapping_add(JMP_REL32_LEN as u32));
    let mut bytes = [0u8; JMP_REL32_LEN];
    bytes[0] = 0xE9;
    bytes[1..].copy_from_slice(&rel.to_le_bytes());
    bytes
}

/// Full patch for a site that displaces `displaced_len` bytes of original
/// code: the jump followed by NOP padding up to the next intact instruction.
pub fn patch_bytes(site: u32, trampoline: u32, displaced_len: usize) -> Result<Vec<u8>, HookError> {
    if displaced_len < JMP_REL32_LEN {
        return Err(HookError::ShortDisplacement(displaced_len));
    }
    let mut bytes = Vec::with_capacity(displaced_len);
    bytes.extend_from_slice(&jmp_rel32(site, trampoline));
    bytes.resize(displaced_len, 0x90);
    Ok(bytes)
}

/// Everything the emitted trampoline needs, expressed in host virtual
/// addresses. `displaced` holds the original instruction bytes the patch
/// overwrote; they are replayed verbatim before resuming at `resume`.
pub struct TrampolineSpec {
    /// Address of the `extern "C" fn()` registrar entry inside this module.
    pub entry: u32,
    /// 16-byte-aligned 512-byte scratch area for fxsave/fxrstor.
    pub fxsave_area: u32,
    pub displaced: Vec<u8>,
    pub resume: u32,
}

impl TrampolineSpec {
    /// Assemble the trampoline for placement at `at`:
    ///
    /// ```text
    /// pushad; pushfd
    /// mov eax, fxsave_area; fxsave  [eax]
    /// mov eax, entry;       call eax
    /// mov eax, fxsave_area; fxrstor [eax]
    /// popfd; popad
    /// <displaced original bytes>
    /// jmp resume
    /// ```
    ///
    /// The host resumes with every register, the flags, and the FPU/SIMD
    /// state exactly as they were at the patch site.
    pub fn emit(&self, at: u32) -> Result<Vec<u8>, HookError> {
        if self.displaced.len() < JMP_REL32_LEN {
            return Err(HookError::ShortDisplacement(self.displaced.len()));
        }
        let mut out: Vec<u8> = Vec::with_capacity(32 + self.displaced.len());
        out.push(0x60); // pushad
        out.push(0x9C); // pushfd
        out.push(0xB8); // mov eax, imm32
        out.write_u32::<LittleEndian>(self.fxsave_area)?;
        out.extend_from_slice(&[0x0F, 0xAE, 0x00]); // fxsave [eax]
        out.push(0xB8);
        out.write_u32::<LittleEndian>(self.entry)?;
        out.extend_from_slice(&[0xFF, 0xD0]); // call eax
        out.push(0xB8);
        out.write_u32::<LittleEndian>(self.fxsave_area)?;
        out.extend_from_slice(&[0x0F, 0xAE, 0x08]); // fxrstor [eax]
        out.push(0x9D); // popfd
        out.push(0x61); // popad
        out.extend_from_slice(&self.displaced);
        let jmp_at = at.wrapping_add(out.len() as u32);
        out.extend_from_slice(&jmp_rel32(jmp_at, self.resume));
        Ok(out)
    }
}

/// Temporarily lift write protection on the pages covering `addr..addr+len`,
/// run `f`, then restore read/execute protection. Executable memory is left
/// writable no longer than the patch write itself.
///
/// # Safety
/// `addr..addr+len` must be mapped code belonging to the host image.
pub unsafe fn with_writable(addr: *mut u8, len: usize, f: impl FnOnce()) -> Result<(), HookError> {
    protect(addr, len, Protection::ReadWriteExecute)?;
    f();
    protect(addr, len, Protection::ReadExecute)
}

/// Write `bytes` over mapped host code, handling protection around the copy.
///
/// # Safety
/// Same requirements as [`with_writable`]; additionally no other thread may
/// be executing the patched range.
pub unsafe fn write_patch(target: *mut u8, bytes: &[u8]) -> Result<(), HookError> {
    with_writable(target, bytes.len(), || {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len());
    })
}

enum Protection {
    ReadExecute,
    ReadWriteExecute,
}

#[cfg(unix)]
unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> Result<(), HookError> {
    let page = page_size();
    let start = (addr as usize) & !(page - 1);
    let span = (addr as usize + len).next_multiple_of(page) - start;
    let prot = match protection {
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    };
    if libc::mprotect(start as *mut libc::c_void, span, prot) != 0 {
        return Err(HookError::Protect(last_errno()));
    }
    Ok(())
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(unix)]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

#[cfg(windows)]
mod win {
    use std::ffi::c_void;

    pub const PAGE_EXECUTE_READ: u32 = 0x20;
    pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
    pub const MEM_COMMIT: u32 = 0x1000;
    pub const MEM_RESERVE: u32 = 0x2000;
    pub const MEM_RELEASE: u32 = 0x8000;

    extern "system" {
        pub fn VirtualProtect(
            address: *mut c_void,
            size: usize,
            new_protect: u32,
            old_protect: *mut u32,
        ) -> i32;
        pub fn VirtualAlloc(
            address: *mut c_void,
            size: usize,
            allocation_type: u32,
            protect: u32,
        ) -> *mut c_void;
        pub fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
    }
}

#[cfg(windows)]
unsafe fn protect(addr: *mut u8, len: usize, protection: Protection) -> Result<(), HookError> {
    let new_protect = match protection {
        Protection::ReadExecute => win::PAGE_EXECUTE_READ,
        Protection::ReadWriteExecute => win::PAGE_EXECUTE_READWRITE,
    };
    let mut old = 0u32;
    if win::VirtualProtect(addr.cast(), len, new_protect, &mut old) == 0 {
        return Err(HookError::Protect(
            io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }
    Ok(())
}

/// Page of executable memory owned by the hook; holds the emitted
/// trampoline for the lifetime of the process.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ExecBuffer {
    pub fn allocate(len: usize) -> Result<Self, HookError> {
        #[cfg(unix)]
        {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(HookError::Allocate(last_errno()));
            }
            Ok(ExecBuffer {
                ptr: ptr.cast(),
                len,
            })
        }
        #[cfg(windows)]
        {
            let ptr = unsafe {
                win::VirtualAlloc(
                    std::ptr::null_mut(),
                    len,
                    win::MEM_COMMIT | win::MEM_RESERVE,
                    win::PAGE_EXECUTE_READWRITE,
                )
            };
            if ptr.is_null() {
                return Err(HookError::Allocate(
                    io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                ));
            }
            Ok(ExecBuffer {
                ptr: ptr.cast(),
                len,
            })
        }
    }

    pub fn addr(&self) -> u32 {
        self.ptr as usize as u32
    }

    /// Copy `bytes` into the buffer.
    ///
    /// # Safety
    /// Nothing may be executing the buffer while it is rewritten.
    pub unsafe fn fill(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.len);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len());
    }
}

// Sole owner of its mapping; the pointer is never shared.
unsafe impl Send for ExecBuffer {}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            #[cfg(unix)]
            {
                libc::munmap(self.ptr.cast(), self.len);
            }
            #[cfg(windows)]
            {
                win::VirtualFree(self.ptr.cast(), 0, win::MEM_RELEASE);
            }
        }
    }
}

/// Installed-state tracker for the single load hook. Installation happens
/// once at attach; the patch stays armed for every subsequent load event
/// until process exit, which tears it down implicitly.
pub struct LoadHook {
    trampoline: Option<ExecBuffer>,
}

impl LoadHook {
    pub const fn new() -> Self {
        LoadHook { trampoline: None }
    }

    pub fn is_installed(&self) -> bool {
        self.trampoline.is_some()
    }

    /// Emit the trampoline for `spec`, place it in executable memory, and
    /// write the jump patch over `site`.
    ///
    /// # Safety
    /// `site` must point at the documented hook site of the live host image
    /// and `spec.displaced` must hold exactly the instruction bytes the
    /// patch overwrites, ending on an instruction boundary.
    pub unsafe fn install(&mut self, site: *mut u8, spec: &TrampolineSpec) -> Result<(), HookError> {
        if self.is_installed() {
            return Err(HookError::AlreadyInstalled);
        }
        let mut buffer = ExecBuffer::allocate(spec.displaced.len() + 64)?;
        let body = spec.emit(buffer.addr())?;
        buffer.fill(&body);
        let patch = patch_bytes(site as usize as u32, buffer.addr(), spec.displaced.len())?;
        write_patch(site, &patch)?;
        self.trampoline = Some(buffer);
        Ok(())
    }
}

impl Default for LoadHook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocate_applies_load_base_delta() {
        assert_eq!(relocate(0x0047_23A0, 0x0040_0000, 0x0040_0000), 0x0047_23A0);
        assert_eq!(relocate(0x0047_23A0, 0x0040_0000, 0x0062_0000), 0x0069_23A0);
        // Loading below the expected base wraps cleanly.
        assert_eq!(relocate(0x0047_23A0, 0x0040_0000, 0x0030_0000), 0x0037_23A0);
    }

    #[test]
    fn jmp_rel32_encodes_forward_and_backward() {
        // jmp to the instruction immediately after the patch is rel 0.
        assert_eq!(jmp_rel32(0x1000, 0x1005), [0xE9, 0, 0, 0, 0]);
        assert_eq!(jmp_rel32(0x1000, 0x1105), [0xE9, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(jmp_rel32(0x1000, 0x0F05), [0xE9, 0x00, 0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn patch_pads_displaced_tail_with_nops() {
        let patch = patch_bytes(0x1000, 0x2000, 7).expect("patch");
        assert_eq!(patch.len(), 7);
        assert_eq!(patch[0], 0xE9);
        assert_eq!(&patch[5..], &[0x90, 0x90]);
    }

    #[test]
    fn patch_rejects_short_sites() {
        assert!(matches!(
            patch_bytes(0x1000, 0x2000, 3),
            Err(HookError::ShortDisplacement(3))
        ));
    }

    #[test]
    fn trampoline_preserves_and_replays() {
        let spec = TrampolineSpec {
            entry: 0x1122_3344,
            fxsave_area: 0x5566_7788,
            displaced: vec![0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x40],
            resume: 0x0047_23A6,
        };
        let body = spec.emit(0x0A00_0000).expect("emit");

        // pushad/pushfd first, popfd/popad before the displaced bytes.
        assert_eq!(&body[..2], &[0x60, 0x9C]);
        let fx_save = [0xB8, 0x88, 0x77, 0x66, 0x55, 0x0F, 0xAE, 0x00];
        assert_eq!(&body[2..10], &fx_save);
        let call_entry = [0xB8, 0x44, 0x33, 0x22, 0x11, 0xFF, 0xD0];
        assert_eq!(&body[10..17], &call_entry);
        let fx_restore = [0xB8, 0x88, 0x77, 0x66, 0x55, 0x0F, 0xAE, 0x08];
        assert_eq!(&body[17..25], &fx_restore);
        assert_eq!(&body[25..27], &[0x9D, 0x61]);
        assert_eq!(&body[27..33], &spec.displaced[..]);

        // Tail jump targets the resume address from its own location.
        assert_eq!(body[33], 0xE9);
        let rel = i32::from_le_bytes([body[34], body[35], body[36], body[37]]);
        let jmp_end = 0x0A00_0000u32.wrapping_add(38);
        assert_eq!(jmp_end.wrapping_add(rel as u32), spec.resume);
    }

    #[test]
    fn trampoline_rejects_short_displacement() {
        let spec = TrampolineSpec {
            entry: 0,
            fxsave_area: 0,
            displaced: vec![0x90; 4],
            resume: 0,
        };
        assert!(matches!(
            spec.emit(0),
            Err(HookError::ShortDisplacement(4))
        ));
    }
}
