//! Register handles and register access indirection.
//!
//! Every register touch of a clock goes through a [RegisterAccess] implementation. [DirectIo]
//! performs volatile memory-mapped accesses. Any other implementation redirects the accesses,
//! for example to a different bus or to a [ShadowRegisters] store.
use core::cell::RefCell;

use critical_section::Mutex;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRegisterError {
    #[error("register address is null")]
    Null,
    #[error("register address {0:#x} is not 4-byte aligned")]
    Unaligned(usize),
    #[error("register offset {offset:#x} overflows base address {base:#x}")]
    Overflow { base: usize, offset: u32 },
}

/// Validated address of a 32-bit register.
///
/// The handle is only an address. It does not grant access by itself, all accesses go through a
/// [RegisterAccess] implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegisterHandle(usize);

impl RegisterHandle {
    pub const fn new(addr: usize) -> Result<Self, InvalidRegisterError> {
        if addr == 0 {
            return Err(InvalidRegisterError::Null);
        }
        if addr % 4 != 0 {
            return Err(InvalidRegisterError::Unaligned(addr));
        }
        Ok(Self(addr))
    }

    /// Handle for a register at `offset` bytes from this one.
    pub const fn offset(self, offset: u32) -> Result<Self, InvalidRegisterError> {
        match self.0.checked_add(offset as usize) {
            Some(addr) => Self::new(addr),
            None => Err(InvalidRegisterError::Overflow {
                base: self.0,
                offset,
            }),
        }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

pub trait RegisterAccess {
    fn read(&self, reg: RegisterHandle) -> u32;

    fn write(&self, reg: RegisterHandle, value: u32);

    /// Read-modify-write helper. Returns the written value.
    ///
    /// This is not atomic. Callers must serialize accesses to the same register.
    #[inline]
    fn modify<F: FnOnce(u32) -> u32>(&self, reg: RegisterHandle, f: F) -> u32
    where
        Self: Sized,
    {
        let value = f(self.read(reg));
        self.write(reg, value);
        value
    }
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &T {
    #[inline]
    fn read(&self, reg: RegisterHandle) -> u32 {
        (**self).read(reg)
    }

    #[inline]
    fn write(&self, reg: RegisterHandle, value: u32) {
        (**self).write(reg, value)
    }
}

/// Direct volatile memory-mapped register access.
#[derive(Debug, Clone, Copy)]
pub struct DirectIo(());

impl DirectIo {
    /// Create a new direct MMIO accessor.
    ///
    /// # Safety
    ///
    /// Every [RegisterHandle] accessed through this accessor must be the address of a mapped
    /// 32-bit register for the whole lifetime of the accessor.
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

impl RegisterAccess for DirectIo {
    #[inline]
    fn read(&self, reg: RegisterHandle) -> u32 {
        // Safety: Handles are aligned and non-null, the constructor contract guarantees that
        // they are mapped.
        unsafe { core::ptr::read_volatile(reg.addr() as *const u32) }
    }

    #[inline]
    fn write(&self, reg: RegisterHandle, value: u32) {
        // Safety: See read.
        unsafe { core::ptr::write_volatile(reg.addr() as *mut u32, value) }
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("shadow register store is full")]
pub struct ShadowFullError;

/// In-memory register store which can hold up to `N` distinct registers.
///
/// Reads of registers which were never written return 0. Writes to a new register while the
/// store is full are dropped.
pub struct ShadowRegisters<const N: usize> {
    regs: Mutex<RefCell<heapless::LinearMap<usize, u32, N>>>,
}

impl<const N: usize> Default for ShadowRegisters<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ShadowRegisters<N> {
    pub const fn new() -> Self {
        Self {
            regs: Mutex::new(RefCell::new(heapless::LinearMap::new())),
        }
    }

    /// Set the value of a register, for example its reset value.
    pub fn preload(&self, reg: RegisterHandle, value: u32) -> Result<(), ShadowFullError> {
        critical_section::with(|cs| {
            self.regs
                .borrow(cs)
                .borrow_mut()
                .insert(reg.addr(), value)
                .map(|_| ())
                .map_err(|_| ShadowFullError)
        })
    }

    /// Current value of a register, or [None] if it was never written.
    pub fn get(&self, reg: RegisterHandle) -> Option<u32> {
        critical_section::with(|cs| self.regs.borrow(cs).borrow().get(&reg.addr()).copied())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.regs.borrow(cs).borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        critical_section::with(|cs| self.regs.borrow(cs).borrow_mut().clear())
    }
}

impl<const N: usize> RegisterAccess for ShadowRegisters<N> {
    fn read(&self, reg: RegisterHandle) -> u32 {
        self.get(reg).unwrap_or(0)
    }

    fn write(&self, reg: RegisterHandle, value: u32) {
        if self.preload(reg, value).is_err() {
            log::warn!(
                "shadow store full, dropping write {:#010x} to {:#x}",
                value,
                reg.addr()
            );
        }
    }
}
