//! baretk C ABI
//!
//! `extern "C"` surface declared in `include/baretk.h`.
//!
//! # Handles
//! `BARETK_Program`, `BARETK_Disassembly` and `BARETK_Decomp` are opaque
//! pointer types on the C side. Their values are packed [`registry`] handles,
//! never addresses, so a stale or foreign handle is detected instead of
//! dereferenced. NULL means absent or failed.
//!
//! # Errors
//! Every export runs under [`std::panic::catch_unwind`]. Failures are logged
//! with `log::error!` and mapped to the function's failure value (NULL, 0 or
//! an empty record). No error crosses the boundary as a panic.
//!
//! # Pointer lifetimes
//! Segment arrays, section bytes and machine-type strings returned to C stay
//! valid while the object that owns them is alive, including after the
//! owning program has been moved into a disassembly or decomp.

pub mod registry;

use anyhow::{anyhow, Context, Result};
use baretk_core::pipeline;
use baretk_core::strings::{render_strings, scan_strings, FoundString};
use baretk_core::{decompile, disassemble, AnalysisConfig, Language, Machine, Program, Segment};
use registry::{registry, HandleKind, Object, RegistryError};
use std::ffi::{c_char, c_int, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

/// Opaque program type; only pointers to it cross the ABI.
#[repr(C)]
pub struct BaretkProgramOpaque {
    _private: [u8; 0],
}

#[repr(C)]
pub struct BaretkDisassemblyOpaque {
    _private: [u8; 0],
}

#[repr(C)]
pub struct BaretkDecompOpaque {
    _private: [u8; 0],
}

pub type BaretkProgram = *mut BaretkProgramOpaque;
pub type BaretkDisassembly = *mut BaretkDisassemblyOpaque;
pub type BaretkDecomp = *mut BaretkDecompOpaque;

/// `BARETK_SegmentArray`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaretkSegmentArray {
    pub segments: *const Segment,
    pub size: usize,
}

/// `BARETK_U8Array`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaretkU8Array {
    pub bytes: *const u8,
    pub size: usize,
}

/// `BARETK_Section`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaretkSection {
    pub addr: u64,
    pub bytes: BaretkU8Array,
}

impl BaretkSegmentArray {
    const EMPTY: BaretkSegmentArray = BaretkSegmentArray {
        segments: std::ptr::null(),
        size: 0,
    };
}

impl BaretkSection {
    const MISS: BaretkSection = BaretkSection {
        addr: 0,
        bytes: BaretkU8Array {
            bytes: std::ptr::null(),
            size: 0,
        },
    };
}

/// Run an export body, mapping errors and panics to `fallback`.
fn guard<T>(name: &str, fallback: T, body: impl FnOnce() -> Result<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            match err.downcast_ref::<RegistryError>() {
                Some(RegistryError::Null) => log::debug!("{}: null handle", name),
                _ => log::error!("{}: {:#}", name, err),
            }
            fallback
        }
        Err(_) => {
            log::error!("{}: panic caught at the C boundary", name);
            fallback
        }
    }
}

/// Borrow a C string argument as a path.
///
/// # Safety
/// `ptr` must be NULL or point to a NUL-terminated string.
unsafe fn path_arg(ptr: *const c_char, what: &str) -> Result<PathBuf> {
    if ptr.is_null() {
        return Err(anyhow!("{} is NULL", what));
    }
    let text: &str = CStr::from_ptr(ptr)
        .to_str()
        .with_context(|| format!("{} is not valid UTF-8", what))?;
    Ok(PathBuf::from(text))
}

/// Optional output path: NULL selects stdout.
///
/// # Safety
/// Same as [`path_arg`].
unsafe fn out_arg(ptr: *const c_char) -> Result<Option<PathBuf>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        path_arg(ptr, "out_path").map(Some)
    }
}

fn machine_name(machine: Machine) -> &'static CStr {
    match machine {
        Machine::X86 => c"x86",
        Machine::Amd64 => c"amd64",
        Machine::Arm => c"arm",
        Machine::Aarch64 => c"aarch64",
        Machine::RiscV32 => c"riscv32",
        Machine::RiscV64 => c"riscv64",
        Machine::Unknown => c"unknown",
    }
}

fn publish(object: Object) -> Result<usize> {
    Ok(registry().insert(object)?.pack())
}

// ---------------------------------------------------------------------------
// Standalone file utilities
// ---------------------------------------------------------------------------

/// Print the ASCII strings of a file as `offset: text` lines.
///
/// Returns 1 on success, 0 otherwise.
///
/// # Safety
/// `path` must be a NUL-terminated string; `out_path` must be NULL or one.
#[no_mangle]
pub unsafe extern "C" fn baretk_print_strings(
    path: *const c_char,
    min_len: c_int,
    printable: c_int,
    out_path: *const c_char,
) -> c_int {
    guard("baretk_print_strings", 0, || {
        let path: PathBuf = path_arg(path, "path")?;
        let out: Option<PathBuf> = out_arg(out_path)?;
        let min_len: usize = usize::try_from(min_len).unwrap_or(0);
        let text: String = pipeline::strings_report(&path, min_len, printable != 0)?;
        pipeline::write_output(&text, out.as_deref())?;
        Ok(1)
    })
}

/// Print the ASCII strings of an in-memory buffer. Only printable runs are
/// reported.
///
/// # Safety
/// `bytes` must point to `size` readable bytes; `out_path` must be NULL or a
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_print_strings_from_bytes(
    bytes: *const u8,
    size: usize,
    min_len: c_int,
    out_path: *const c_char,
) -> c_int {
    guard("baretk_print_strings_from_bytes", 0, || {
        if bytes.is_null() {
            return Err(anyhow!("bytes is NULL"));
        }
        let data: &[u8] = std::slice::from_raw_parts(bytes, size);
        let out: Option<PathBuf> = out_arg(out_path)?;
        let min_len: usize = usize::try_from(min_len).unwrap_or(0);
        let found: Vec<FoundString> = scan_strings(data, min_len, true);
        let text: String = format!("ASCII strings found:\n{}", render_strings(&found));
        pipeline::write_output(&text, out.as_deref())?;
        Ok(1)
    })
}

/// Write the disassembly listing of a file.
///
/// # Safety
/// `path` must be a NUL-terminated string; `out_path` must be NULL or one.
#[no_mangle]
pub unsafe extern "C" fn baretk_disassemble_file(
    path: *const c_char,
    out_path: *const c_char,
) -> c_int {
    guard("baretk_disassemble_file", 0, || {
        let path: PathBuf = path_arg(path, "path")?;
        let out: Option<PathBuf> = out_arg(out_path)?;
        let listing: String = pipeline::listing_file(&path, &AnalysisConfig::default())?;
        pipeline::write_output(&listing, out.as_deref())?;
        Ok(1)
    })
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// Load a program from a file. Free with [`baretk_free_program`].
///
/// # Safety
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_load_program(path: *const c_char) -> BaretkProgram {
    guard("baretk_load_program", std::ptr::null_mut(), || {
        let path: PathBuf = path_arg(path, "path")?;
        let program: Program = pipeline::load_program(&path)?;
        Ok(publish(Object::Program(program))? as BaretkProgram)
    })
}

/// Free a program. NULL is a no-op; a stale or borrowed handle is logged
/// and ignored.
#[no_mangle]
pub extern "C" fn baretk_free_program(program: BaretkProgram) {
    if program.is_null() {
        return;
    }
    guard("baretk_free_program", (), || {
        registry().take(program as usize, HandleKind::OwnedProgram)?;
        Ok(())
    })
}

/// Deep copy of a program, owned by the caller.
#[no_mangle]
pub extern "C" fn baretk_clone_program(program: BaretkProgram) -> BaretkProgram {
    guard("baretk_clone_program", std::ptr::null_mut(), || {
        let mut reg = registry();
        let copy: Program = reg.program(program as usize)?.clone();
        Ok(reg.insert(Object::Program(copy))?.pack() as BaretkProgram)
    })
}

/// `BARETK_Endianess` of a program; little-endian for NULL.
#[no_mangle]
pub extern "C" fn baretk_get_endianess(program: BaretkProgram) -> c_int {
    guard("baretk_get_endianess", 0x1, || {
        let reg = registry();
        Ok(reg.program(program as usize)?.endianness() as u8 as c_int)
    })
}

/// Static NUL-terminated machine name; `"???"` for NULL.
#[no_mangle]
pub extern "C" fn baretk_get_machine_type(program: BaretkProgram) -> *const c_char {
    guard("baretk_get_machine_type", c"???".as_ptr(), || {
        let reg = registry();
        Ok(machine_name(reg.program(program as usize)?.machine()).as_ptr())
    })
}

/// Segment table of a program.
#[no_mangle]
pub extern "C" fn baretk_get_segments(program: BaretkProgram) -> BaretkSegmentArray {
    guard("baretk_get_segments", BaretkSegmentArray::EMPTY, || {
        let reg = registry();
        let segments: &[Segment] = reg.program(program as usize)?.segments();
        Ok(BaretkSegmentArray {
            segments: segments.as_ptr(),
            size: segments.len(),
        })
    })
}

/// Address and contents of the section named `key`; `{0, {NULL, 0}}` when
/// there is no such section.
///
/// # Safety
/// `key` must be NULL or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_get_section(
    program: BaretkProgram,
    key: *const c_char,
) -> BaretkSection {
    guard("baretk_get_section", BaretkSection::MISS, || {
        if key.is_null() {
            return Ok(BaretkSection::MISS);
        }
        let key: &str = CStr::from_ptr(key).to_str().context("key is not valid UTF-8")?;
        let reg = registry();
        let section = match reg.program(program as usize)?.section(key) {
            Some(section) => section,
            None => {
                log::debug!("no section named '{}'", key);
                return Ok(BaretkSection::MISS);
            }
        };
        let bytes: BaretkU8Array = if section.data.is_empty() {
            BaretkSection::MISS.bytes
        } else {
            BaretkU8Array {
                bytes: section.data.as_ptr(),
                size: section.data.len(),
            }
        };
        Ok(BaretkSection {
            addr: section.addr,
            bytes,
        })
    })
}

// ---------------------------------------------------------------------------
// Disassembly
// ---------------------------------------------------------------------------

/// Disassemble a program, taking ownership of it. The program handle is
/// stale afterwards, whether or not disassembly succeeds.
#[no_mangle]
pub extern "C" fn baretk_disassemble_from_program(program: BaretkProgram) -> BaretkDisassembly {
    guard(
        "baretk_disassemble_from_program",
        std::ptr::null_mut(),
        || {
            let taken: Object = registry().take(program as usize, HandleKind::OwnedProgram)?;
            let Object::Program(program) = taken else {
                return Err(anyhow!("program handle held another object"));
            };
            let disassembly = disassemble(program)?;
            Ok(publish(Object::Disassembly(disassembly))? as BaretkDisassembly)
        },
    )
}

/// Load and disassemble a file.
///
/// # Safety
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_disassemble_from_file(path: *const c_char) -> BaretkDisassembly {
    guard("baretk_disassemble_from_file", std::ptr::null_mut(), || {
        let path: PathBuf = path_arg(path, "path")?;
        let disassembly = pipeline::disassemble_file(&path, &AnalysisConfig::default())?;
        Ok(publish(Object::Disassembly(disassembly))? as BaretkDisassembly)
    })
}

/// Borrowed program of a disassembly. Must not be freed.
#[no_mangle]
pub extern "C" fn baretk_get_program_from_disassembly(
    disasm: BaretkDisassembly,
) -> BaretkProgram {
    guard(
        "baretk_get_program_from_disassembly",
        std::ptr::null_mut(),
        || {
            let view = registry().view(disasm as usize, HandleKind::ProgramInDisassembly)?;
            Ok(view.pack() as BaretkProgram)
        },
    )
}

/// Free a disassembly. NULL is a no-op.
#[no_mangle]
pub extern "C" fn baretk_free_disassembly(disasm: BaretkDisassembly) {
    if disasm.is_null() {
        return;
    }
    guard("baretk_free_disassembly", (), || {
        registry().take(disasm as usize, HandleKind::OwnedDisassembly)?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Decomp
// ---------------------------------------------------------------------------

/// Decompile a disassembly, taking ownership of it. `lang` is a
/// `BARETK_Lang`; unknown values select pseudocode.
#[no_mangle]
pub extern "C" fn baretk_decomp_disassembly(
    disasm: BaretkDisassembly,
    lang: c_int,
) -> BaretkDecomp {
    guard("baretk_decomp_disassembly", std::ptr::null_mut(), || {
        let taken: Object = registry().take(disasm as usize, HandleKind::OwnedDisassembly)?;
        let Object::Disassembly(disassembly) = taken else {
            return Err(anyhow!("disassembly handle held another object"));
        };
        let language: Language = Language::from_raw(u32::try_from(lang).unwrap_or(0));
        let decomp = decompile(disassembly, language)?;
        Ok(publish(Object::Decomp(decomp))? as BaretkDecomp)
    })
}

/// Load, disassemble and decompile a file to pseudocode.
///
/// # Safety
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_decomp_from_file(path: *const c_char) -> BaretkDecomp {
    guard("baretk_decomp_from_file", std::ptr::null_mut(), || {
        let path: PathBuf = path_arg(path, "path")?;
        let decomp =
            pipeline::decompile_file(&path, Language::Pseudocode, &AnalysisConfig::default())?;
        Ok(publish(Object::Decomp(decomp))? as BaretkDecomp)
    })
}

/// Borrowed disassembly of a decomp. Must not be freed.
#[no_mangle]
pub extern "C" fn baretk_get_disassembly_from_decomp(decomp: BaretkDecomp) -> BaretkDisassembly {
    guard(
        "baretk_get_disassembly_from_decomp",
        std::ptr::null_mut(),
        || {
            let view = registry().view(decomp as usize, HandleKind::DisassemblyInDecomp)?;
            Ok(view.pack() as BaretkDisassembly)
        },
    )
}

/// Free a decomp. NULL is a no-op.
#[no_mangle]
pub extern "C" fn baretk_free_decomp(decomp: BaretkDecomp) {
    if decomp.is_null() {
        return;
    }
    guard("baretk_free_decomp", (), || {
        registry().take(decomp as usize, HandleKind::OwnedDecomp)?;
        Ok(())
    })
}

/// Write the decompiled text in the decomp's language.
///
/// # Safety
/// `out_path` must be NULL or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn baretk_print_decomp(
    decomp: BaretkDecomp,
    out_path: *const c_char,
) -> c_int {
    guard("baretk_print_decomp", 0, || {
        let out: Option<PathBuf> = out_arg(out_path)?;
        // Render under the lock, write after releasing it.
        let text: String = registry().decomp(decomp as usize)?.text();
        pipeline::write_output(&text, out.as_deref())?;
        Ok(1)
    })
}
