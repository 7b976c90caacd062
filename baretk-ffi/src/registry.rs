//! Handle Registry
//!
//! Objects handed out through the C ABI live in a process-wide arena. C code
//! never sees a real pointer: a handle is a packed `(generation, index, kind)`
//! value that is only ever looked up, never dereferenced.
//!
//! # Handle Layout
//! ```text
//! | generation (high bits) | slot index (24 bits) | kind (3 bits) |
//! ```
//! The kind is never zero, so no live handle packs to NULL.
//!
//! # Ownership
//! - Owned kinds (`OwnedProgram`, `OwnedDisassembly`, `OwnedDecomp`) may be
//!   freed or consumed. Either removes the object from its slot and bumps the
//!   slot generation, so every handle to the old object goes stale.
//! - View kinds (`ProgramInDisassembly`, `ProgramInDecomp`,
//!   `DisassemblyInDecomp`) share their owner's slot and generation. They
//!   resolve through the owner and cannot be freed or consumed.

use baretk_core::{Decomp, Disassembly, Program};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const KIND_BITS: u32 = 3;
const INDEX_BITS: u32 = 24;
const KIND_MASK: usize = (1 << KIND_BITS) - 1;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GENERATION_SHIFT: u32 = KIND_BITS + INDEX_BITS;
const GENERATION_MASK: usize = usize::MAX >> GENERATION_SHIFT;

/// What a handle refers to, and whether its holder owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleKind {
    OwnedProgram = 1,
    ProgramInDisassembly = 2,
    ProgramInDecomp = 3,
    OwnedDisassembly = 4,
    DisassemblyInDecomp = 5,
    OwnedDecomp = 6,
}

impl HandleKind {
    fn from_bits(bits: usize) -> Option<HandleKind> {
        Some(match bits {
            1 => HandleKind::OwnedProgram,
            2 => HandleKind::ProgramInDisassembly,
            3 => HandleKind::ProgramInDecomp,
            4 => HandleKind::OwnedDisassembly,
            5 => HandleKind::DisassemblyInDecomp,
            6 => HandleKind::OwnedDecomp,
            _ => return None,
        })
    }

    pub fn is_owned(self) -> bool {
        matches!(
            self,
            HandleKind::OwnedProgram | HandleKind::OwnedDisassembly | HandleKind::OwnedDecomp
        )
    }
}

/// Unpacked handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub kind: HandleKind,
    pub index: usize,
    /// Slot generation, truncated to the bits available in a pointer
    pub generation: usize,
}

impl Handle {
    pub fn pack(self) -> usize {
        ((self.generation & GENERATION_MASK) << GENERATION_SHIFT)
            | ((self.index & INDEX_MASK) << KIND_BITS)
            | self.kind as usize
    }

    pub fn unpack(raw: usize) -> Result<Handle, RegistryError> {
        if raw == 0 {
            return Err(RegistryError::Null);
        }
        let kind: HandleKind =
            HandleKind::from_bits(raw & KIND_MASK).ok_or(RegistryError::Invalid(raw))?;
        Ok(Handle {
            kind,
            index: (raw >> KIND_BITS) & INDEX_MASK,
            generation: raw >> GENERATION_SHIFT,
        })
    }

    /// Same object, seen as another kind.
    pub fn view(self, kind: HandleKind) -> Handle {
        Handle { kind, ..self }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("null handle")]
    Null,

    #[error("0x{0:x} is not a baretk handle")]
    Invalid(usize),

    #[error("stale handle {0:?} (object already freed or consumed)")]
    Stale(Handle),

    #[error("handle {0:?} is a borrowed view owned by another object")]
    Borrowed(Handle),

    #[error("handle {found:?} used where a {expected:?} handle is required")]
    WrongKind {
        expected: HandleKind,
        found: HandleKind,
    },

    #[error("handle registry is full")]
    Full,
}

/// An object owned by the registry.
#[derive(Debug)]
pub enum Object {
    Program(Program),
    Disassembly(Disassembly),
    Decomp(Decomp),
}

impl Object {
    fn kind(&self) -> HandleKind {
        match self {
            Object::Program(_) => HandleKind::OwnedProgram,
            Object::Disassembly(_) => HandleKind::OwnedDisassembly,
            Object::Decomp(_) => HandleKind::OwnedDecomp,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: usize,
    object: Option<Object>,
}

/// Generation-tagged arena of ABI objects.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an object and return its owning handle.
    pub fn insert(&mut self, object: Object) -> Result<Handle, RegistryError> {
        let kind: HandleKind = object.kind();
        let index: usize = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() > INDEX_MASK {
                    return Err(RegistryError::Full);
                }
                self.slots.push(Slot {
                    generation: 0,
                    object: None,
                });
                self.slots.len() - 1
            }
        };
        let slot: &mut Slot = &mut self.slots[index];
        slot.object = Some(object);
        Ok(Handle {
            kind,
            index,
            generation: slot.generation & GENERATION_MASK,
        })
    }

    fn slot(&self, handle: Handle) -> Result<&Object, RegistryError> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation & GENERATION_MASK == handle.generation)
            .and_then(|s| s.object.as_ref())
            .ok_or(RegistryError::Stale(handle))
    }

    /// Program behind an owned program handle or a program view.
    pub fn program(&self, raw: usize) -> Result<&Program, RegistryError> {
        let handle: Handle = Handle::unpack(raw)?;
        match (handle.kind, self.slot(handle)?) {
            (HandleKind::OwnedProgram, Object::Program(p)) => Ok(p),
            (HandleKind::ProgramInDisassembly, Object::Disassembly(d)) => Ok(d.program()),
            (HandleKind::ProgramInDecomp, Object::Decomp(dc)) => Ok(dc.disassembly().program()),
            (found, _) => Err(RegistryError::WrongKind {
                expected: HandleKind::OwnedProgram,
                found,
            }),
        }
    }

    /// Disassembly behind an owned disassembly handle or a disassembly view.
    pub fn disassembly(&self, raw: usize) -> Result<&Disassembly, RegistryError> {
        let handle: Handle = Handle::unpack(raw)?;
        match (handle.kind, self.slot(handle)?) {
            (HandleKind::OwnedDisassembly, Object::Disassembly(d)) => Ok(d),
            (HandleKind::DisassemblyInDecomp, Object::Decomp(dc)) => Ok(dc.disassembly()),
            (found, _) => Err(RegistryError::WrongKind {
                expected: HandleKind::OwnedDisassembly,
                found,
            }),
        }
    }

    pub fn decomp(&self, raw: usize) -> Result<&Decomp, RegistryError> {
        let handle: Handle = Handle::unpack(raw)?;
        match (handle.kind, self.slot(handle)?) {
            (HandleKind::OwnedDecomp, Object::Decomp(dc)) => Ok(dc),
            (found, _) => Err(RegistryError::WrongKind {
                expected: HandleKind::OwnedDecomp,
                found,
            }),
        }
    }

    /// Handle of the borrowed view `kind` inside the object `raw` refers to.
    ///
    /// A view of a view resolves to the same owner: the program view of a
    /// disassembly that is itself a view into a decomp is a `ProgramInDecomp`.
    pub fn view(&self, raw: usize, kind: HandleKind) -> Result<Handle, RegistryError> {
        let handle: Handle = Handle::unpack(raw)?;
        self.slot(handle)?;
        let view: HandleKind = match (handle.kind, kind) {
            (HandleKind::OwnedDisassembly, HandleKind::ProgramInDisassembly) => kind,
            (HandleKind::DisassemblyInDecomp, HandleKind::ProgramInDisassembly) => {
                HandleKind::ProgramInDecomp
            }
            (HandleKind::OwnedDecomp, HandleKind::DisassemblyInDecomp) => kind,
            (found, HandleKind::ProgramInDisassembly) => {
                return Err(RegistryError::WrongKind {
                    expected: HandleKind::OwnedDisassembly,
                    found,
                })
            }
            (found, _) => {
                return Err(RegistryError::WrongKind {
                    expected: HandleKind::OwnedDecomp,
                    found,
                })
            }
        };
        Ok(handle.view(view))
    }

    /// Remove the object behind an owned handle of kind `expected`.
    ///
    /// The slot generation is bumped, so `raw` and all views of the object go
    /// stale.
    pub fn take(&mut self, raw: usize, expected: HandleKind) -> Result<Object, RegistryError> {
        let handle: Handle = Handle::unpack(raw)?;
        if !handle.kind.is_owned() {
            return Err(RegistryError::Borrowed(handle));
        }
        if handle.kind != expected {
            return Err(RegistryError::WrongKind {
                expected,
                found: handle.kind,
            });
        }
        self.slot(handle)?;
        let slot: &mut Slot = &mut self.slots[handle.index];
        let object: Option<Object> = slot.object.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        object.ok_or(RegistryError::Stale(handle))
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Lock the process-wide registry.
///
/// A panic while the lock was held cannot leave a slot half-written, so a
/// poisoned lock is recovered.
pub fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use baretk_core::loader::load;

    /// ELF64 x86-64 with one R-X PT_LOAD holding `ret`.
    fn program() -> Program {
        let mut data = vec![0u8; 0x78];
        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = 2;
        data[5] = 1;
        data[6] = 1;
        data[18..20].copy_from_slice(&62u16.to_le_bytes());
        data[24..32].copy_from_slice(&0x1078u64.to_le_bytes());
        data[32..40].copy_from_slice(&64u64.to_le_bytes());
        data[54..56].copy_from_slice(&56u16.to_le_bytes());
        data[56..58].copy_from_slice(&1u16.to_le_bytes());
        data[64..68].copy_from_slice(&1u32.to_le_bytes());
        data[68..72].copy_from_slice(&5u32.to_le_bytes());
        data[72..80].copy_from_slice(&0x78u64.to_le_bytes());
        data[80..88].copy_from_slice(&0x1078u64.to_le_bytes());
        data[88..96].copy_from_slice(&0x1078u64.to_le_bytes());
        data[96..104].copy_from_slice(&1u64.to_le_bytes());
        data[104..112].copy_from_slice(&1u64.to_le_bytes());
        data.push(0xc3);
        load(&data).unwrap()
    }

    #[test]
    fn pack_round_trips_and_is_never_null() {
        let h = Handle {
            kind: HandleKind::DisassemblyInDecomp,
            index: 0,
            generation: 0,
        };
        assert_ne!(h.pack(), 0);
        assert_eq!(Handle::unpack(h.pack()), Ok(h));
        assert_eq!(Handle::unpack(0), Err(RegistryError::Null));
        assert_eq!(Handle::unpack(0x10), Err(RegistryError::Invalid(0x10)));
    }

    #[test]
    fn freed_handle_goes_stale_even_after_slot_reuse() {
        let mut reg = Registry::new();
        let first: usize = reg.insert(Object::Program(program())).unwrap().pack();
        assert!(reg.take(first, HandleKind::OwnedProgram).is_ok());
        assert!(matches!(
            reg.take(first, HandleKind::OwnedProgram),
            Err(RegistryError::Stale(_))
        ));

        let second: usize = reg.insert(Object::Program(program())).unwrap().pack();
        assert_ne!(first, second);
        assert!(matches!(reg.program(first), Err(RegistryError::Stale(_))));
        assert!(reg.program(second).is_ok());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn views_resolve_through_owner_and_cannot_be_taken() {
        let mut reg = Registry::new();
        let d = baretk_core::disassemble(program()).unwrap();
        let owner: usize = reg.insert(Object::Disassembly(d)).unwrap().pack();
        let view: usize = reg
            .view(owner, HandleKind::ProgramInDisassembly)
            .unwrap()
            .pack();

        assert_eq!(reg.program(view).unwrap().entry_point(), 0x1078);
        assert!(matches!(
            reg.take(view, HandleKind::OwnedProgram),
            Err(RegistryError::Borrowed(_))
        ));

        reg.take(owner, HandleKind::OwnedDisassembly).unwrap();
        assert!(matches!(reg.program(view), Err(RegistryError::Stale(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mut reg = Registry::new();
        let p: usize = reg.insert(Object::Program(program())).unwrap().pack();
        assert!(matches!(
            reg.disassembly(p),
            Err(RegistryError::WrongKind { .. })
        ));
        assert!(matches!(
            reg.take(p, HandleKind::OwnedDecomp),
            Err(RegistryError::WrongKind { .. })
        ));
        assert!(reg.program(p).is_ok());
    }
}
