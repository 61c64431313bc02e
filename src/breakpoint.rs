//! # Breakpoint Module
//!
//! Software breakpoints and the set that owns them.
//!
//! A breakpoint is an `int3` byte written over the first byte of an instruction. The
//! [`BreakpointSet`] is the only code that writes or restores those bytes: every place that needs
//! a breakpoint temporarily out of the way (stepping over it, killing the process) goes through
//! [`BreakpointSet::install`] and [`BreakpointSet::uninstall`], so that [`Breakpoint::installed`]
//! always matches what is in debuggee memory.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::consts::INT3_BYTE;
use crate::errors::{DebuggerError, Result};
use crate::tracee::Tracee;
use crate::Addr;

const BYTE_MASK: i64 = 0xff;

/// One software breakpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    id: usize,
    addr: Addr,
    /// the byte the `int3` replaced, only meaningful while installed
    saved_byte: Option<u8>,
    enabled: bool,
}

impl Breakpoint {
    fn new(id: usize, addr: Addr) -> Self {
        Self {
            id,
            addr,
            saved_byte: None,
            enabled: true,
        }
    }

    /// Number shown to the user, stable for the lifetime of the breakpoint
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// The `int3` is currently written into debuggee memory
    #[inline]
    pub fn installed(&self) -> bool {
        self.saved_byte.is_some()
    }

    /// The breakpoint should be in memory whenever the debuggee runs
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The original instruction byte, if the breakpoint is installed
    pub fn saved_byte(&self) -> Option<u8> {
        self.saved_byte
    }
}

/// All breakpoints of one inferior, keyed by address
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    breakpoints: BTreeMap<Addr, Breakpoint>,
    next_id: usize,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a breakpoint at `addr`
    ///
    /// Adding an address that is already present does not create a second entry, it only
    /// enables the existing one again. Nothing is written to memory here, see
    /// [`BreakpointSet::install`].
    pub fn add(&mut self, addr: Addr) -> &Breakpoint {
        let next_id = &mut self.next_id;
        let bp = self.breakpoints.entry(addr).or_insert_with(|| {
            *next_id += 1;
            Breakpoint::new(*next_id, addr)
        });
        bp.enabled = true;
        bp
    }

    /// Forgets the breakpoint at `addr`, if there is one
    ///
    /// The caller has to uninstall it first while the debuggee is alive.
    pub fn remove(&mut self, addr: Addr) -> Option<Breakpoint> {
        self.breakpoints.remove(&addr)
    }

    pub fn set_enabled(&mut self, addr: Addr, enabled: bool) -> Result<()> {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.enabled = enabled;
                Ok(())
            }
            None => Err(DebuggerError::NoBreakpoint(addr)),
        }
    }

    pub fn get(&self, addr: Addr) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn get_by_id(&self, id: usize) -> Option<&Breakpoint> {
        self.breakpoints.values().find(|bp| bp.id == id)
    }

    #[inline]
    pub fn is_installed(&self, addr: Addr) -> bool {
        self.breakpoints.get(&addr).is_some_and(Breakpoint::installed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Writes the `int3` for the breakpoint at `addr` and saves the byte it replaces
    ///
    /// Installing an installed breakpoint does nothing.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoBreakpoint`] if there is no breakpoint at `addr`, or if the
    /// memory can not be accessed.
    pub fn install<T: Tracee>(&mut self, tracee: &mut T, addr: Addr) -> Result<()> {
        let bp = self
            .breakpoints
            .get_mut(&addr)
            .ok_or(DebuggerError::NoBreakpoint(addr))?;
        if bp.installed() {
            return Ok(());
        }

        let aligned = addr.align_to_word();
        let shift = addr.word_offset() * 8;
        let word = tracee
            .read_word(aligned)
            .map_err(|_| DebuggerError::AccessError(addr))?;
        trace!("original word: {word:016x}");
        let original = ((word >> shift) & BYTE_MASK) as u8;
        let patched = (word & !(BYTE_MASK << shift)) | ((INT3_BYTE as i64) << shift);
        trace!("patched word:  {patched:016x}");
        tracee
            .write_word(aligned, patched)
            .map_err(|_| DebuggerError::AccessError(addr))?;

        bp.saved_byte = Some(original);
        debug!("installed breakpoint {} at {addr}", bp.id);
        Ok(())
    }

    /// Restores the original byte of the breakpoint at `addr`
    ///
    /// Uninstalling a breakpoint that is not installed (or not present) does nothing.
    pub fn uninstall<T: Tracee>(&mut self, tracee: &mut T, addr: Addr) -> Result<()> {
        let Some(bp) = self.breakpoints.get_mut(&addr) else {
            return Ok(());
        };
        let Some(original) = bp.saved_byte else {
            return Ok(());
        };

        let aligned = addr.align_to_word();
        let shift = addr.word_offset() * 8;
        let word = tracee
            .read_word(aligned)
            .map_err(|_| DebuggerError::AccessError(addr))?;
        let restored = (word & !(BYTE_MASK << shift)) | ((original as i64) << shift);
        trace!("restored word: {restored:016x}");
        tracee
            .write_word(aligned, restored)
            .map_err(|_| DebuggerError::AccessError(addr))?;

        bp.saved_byte = None;
        debug!("uninstalled breakpoint {} at {addr}", bp.id);
        Ok(())
    }

    /// Installs every enabled breakpoint that is not yet in memory
    ///
    /// Returns the addresses that could not be installed, those stay registered but inactive.
    pub fn install_enabled<T: Tracee>(&mut self, tracee: &mut T) -> Vec<Addr> {
        let pending: Vec<Addr> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled && !bp.installed())
            .map(|bp| bp.addr)
            .collect();
        pending
            .into_iter()
            .filter(|addr| self.install(tracee, *addr).is_err())
            .collect()
    }

    /// Uninstalls every breakpoint, restoring all patched bytes
    pub fn sweep<T: Tracee>(&mut self, tracee: &mut T) -> Result<()> {
        let installed: Vec<Addr> = self
            .breakpoints
            .values()
            .filter(|bp| bp.installed())
            .map(|bp| bp.addr)
            .collect();
        for addr in installed {
            self.uninstall(tracee, addr)?;
        }
        Ok(())
    }

    /// Marks every breakpoint as not installed without touching memory
    ///
    /// Used once the process is gone and its memory with it.
    pub fn forget_installed(&mut self) {
        for bp in self.breakpoints.values_mut() {
            bp.saved_byte = None;
        }
    }

    /// Records that `value` was written over the installed breakpoint at `addr`
    ///
    /// The new byte becomes the one restored on uninstall, memory keeps the `int3`.
    pub(crate) fn replace_saved_byte(&mut self, addr: Addr, value: u8) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) if bp.installed() => {
                bp.saved_byte = Some(value);
                true
            }
            _ => false,
        }
    }
}
