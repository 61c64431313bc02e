//! # Address Module
//!
//! [`Addr`] is the one address type used for debuggee memory, program counters and debug info
//! addresses alike. Whether an [`Addr`] is a runtime address or an address as recorded in the
//! debug info is decided by the context; the two differ by the load bias of position independent
//! executables (see [`Addr::relocate`] and [`Addr::unrelocate`]).

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::{Word, WORD_BYTES};

#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Addr(usize);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub const fn new(raw: usize) -> Addr {
        Addr(raw)
    }

    pub fn usize(&self) -> usize {
        self.0
    }
    pub fn u64(&self) -> u64 {
        self.0 as u64
    }

    /// Rounds down to the start of the machine word containing this address
    pub fn align_to_word(&self) -> Addr {
        Addr(self.0 & !(WORD_BYTES - 1))
    }

    /// Byte offset of this address inside its machine word
    pub fn word_offset(&self) -> usize {
        self.0 & (WORD_BYTES - 1)
    }

    /// Adds a signed offset, `None` on over- or underflow
    pub fn offset(&self, delta: i64) -> Option<Addr> {
        self.0.checked_add_signed(delta as isize).map(Addr)
    }

    /// Turns a debug info address into a runtime address
    pub fn relocate(&self, load_bias: Addr) -> Addr {
        Addr(self.0.wrapping_add(load_bias.0))
    }

    /// Turns a runtime address into a debug info address
    pub fn unrelocate(&self, load_bias: Addr) -> Addr {
        Addr(self.0.wrapping_sub(load_bias.0))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<usize> for Addr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<usize> for Addr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs
    }
}

impl Sub for Addr {
    type Output = usize;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<usize> for Addr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<usize> for Addr {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value)
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value as usize)
    }
}

impl From<Word> for Addr {
    fn from(value: Word) -> Self {
        Addr(value as usize)
    }
}

impl From<Addr> for Word {
    fn from(value: Addr) -> Self {
        value.0 as Word
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0 as u64
    }
}

impl From<Addr> for *mut std::ffi::c_void {
    fn from(value: Addr) -> Self {
        value.0 as *mut std::ffi::c_void
    }
}
