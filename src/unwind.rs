//! # Unwind Module
//!
//! Call frame information from `.eh_frame` and `.debug_frame`.
//!
//! For a program counter the CFI gives the rule for the canonical frame address (CFA) of the
//! frame and the rules that recover the registers of the caller. The frame base of functions
//! using `DW_OP_call_frame_cfa` and the [`Backtrace`](crate::backtrace::Backtrace) both come from
//! here. The rows are read with [`gimli`] on every query, nothing is cached.

use std::fmt::Debug;

use gimli::{
    BaseAddresses, DebugFrame, EhFrame, RunTimeEndian, UnwindContext, UnwindSection,
    UnwindTableRow,
};
use tracing::trace;

use crate::errors::{DebuggerError, Result};
use crate::scope::MemoryAccess;
use crate::{Addr, Register, RegisterSnapshot, WORD_BYTES};

/// DWARF register number of the return address column on x86_64
const RETURN_ADDRESS: gimli::Register = gimli::X86_64::RA;

/// The contents of one CFI section and where it is in the debug info address space
#[derive(Clone, PartialEq, Eq)]
struct CfiSection {
    address: Addr,
    data: Vec<u8>,
}

impl Debug for CfiSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes at {}", self.data.len(), self.address)
    }
}

/// The unwind tables of one executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrameInfo {
    eh_frame: Option<CfiSection>,
    debug_frame: Option<CfiSection>,
    /// address of `.text`, base for `DW_EH_PE_textrel` pointers
    text: Addr,
    endian: RunTimeEndian,
}

impl Default for CallFrameInfo {
    fn default() -> Self {
        Self::new(RunTimeEndian::Little)
    }
}

impl CallFrameInfo {
    pub fn new(endian: RunTimeEndian) -> Self {
        Self {
            eh_frame: None,
            debug_frame: None,
            text: Addr::NULL,
            endian,
        }
    }

    /// Uses the `.eh_frame` section located at `address`
    pub fn with_eh_frame(mut self, address: Addr, data: Vec<u8>) -> Self {
        self.eh_frame = Some(CfiSection { address, data });
        self
    }

    pub fn with_debug_frame(mut self, address: Addr, data: Vec<u8>) -> Self {
        self.debug_frame = Some(CfiSection { address, data });
        self
    }

    pub fn with_text(mut self, address: Addr) -> Self {
        self.text = address;
        self
    }

    /// There is no unwind information at all
    pub fn is_empty(&self) -> bool {
        self.eh_frame.is_none() && self.debug_frame.is_none()
    }

    /// The unwind row covering `pc`, a debug info address
    ///
    /// `.debug_frame` is asked first, it is the more complete one if a compiler emits both.
    /// [`None`] if neither section describes `pc`.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::Gimli`] if the section is malformed.
    pub fn row(&self, pc: Addr) -> Result<Option<UnwindRow>> {
        let mut ctx = UnwindContext::new();

        if let Some(section) = &self.debug_frame {
            let mut debug_frame = DebugFrame::new(&section.data, self.endian);
            debug_frame.set_address_size(WORD_BYTES as u8);
            let bases = BaseAddresses::default().set_text(self.text.u64());
            let found = debug_frame.unwind_info_for_address(
                &bases,
                &mut ctx,
                pc.u64(),
                DebugFrame::cie_from_offset,
            );
            if let Some(row) = owned_row(found)? {
                trace!("unwind row for {pc} from .debug_frame: {row:?}");
                return Ok(Some(row));
            }
        }

        if let Some(section) = &self.eh_frame {
            let mut eh_frame = EhFrame::new(&section.data, self.endian);
            eh_frame.set_address_size(WORD_BYTES as u8);
            let bases = BaseAddresses::default()
                .set_eh_frame(section.address.u64())
                .set_text(self.text.u64());
            let found =
                eh_frame.unwind_info_for_address(&bases, &mut ctx, pc.u64(), EhFrame::cie_from_offset);
            if let Some(row) = owned_row(found)? {
                trace!("unwind row for {pc} from .eh_frame: {row:?}");
                return Ok(Some(row));
            }
        }

        Ok(None)
    }
}

fn owned_row(found: gimli::Result<&UnwindTableRow<usize>>) -> Result<Option<UnwindRow>> {
    match found {
        Ok(row) => Ok(Some(UnwindRow::from_gimli(row))),
        Err(gimli::Error::NoUnwindInfoForAddress) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// How the canonical frame address is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule {
    /// The value of a register plus an offset
    RegisterOffset { register: Register, offset: i64 },
    /// A DWARF expression, or a register the debugger does not track
    Unsupported,
}

/// Where the caller's value of a register is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedRegister {
    /// No rule: the register was not saved, or has no value in the caller
    Undefined,
    /// The register was not touched
    SameValue,
    /// Saved in memory at CFA + offset
    AtCfaOffset(i64),
    /// The value is CFA + offset
    CfaOffset(i64),
    Unsupported,
}

impl SavedRegister {
    fn from_gimli(rule: gimli::RegisterRule<usize>) -> Self {
        match rule {
            gimli::RegisterRule::Undefined => Self::Undefined,
            gimli::RegisterRule::SameValue => Self::SameValue,
            gimli::RegisterRule::Offset(offset) => Self::AtCfaOffset(offset),
            gimli::RegisterRule::ValOffset(offset) => Self::CfaOffset(offset),
            _ => Self::Unsupported,
        }
    }
}

/// One row of the unwind table, reduced to the registers the debugger works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRow {
    /// debug info addresses covered by the row, `[start, end)`
    pub start: Addr,
    pub end: Addr,
    pub cfa: CfaRule,
    pub return_address: SavedRegister,
    pub frame_pointer: SavedRegister,
}

impl UnwindRow {
    fn from_gimli(row: &UnwindTableRow<usize>) -> Self {
        let cfa = match row.cfa() {
            gimli::CfaRule::RegisterAndOffset { register, offset } => {
                match Register::from_dwarf(*register) {
                    Some(register) => CfaRule::RegisterOffset {
                        register,
                        offset: *offset,
                    },
                    None => CfaRule::Unsupported,
                }
            }
            gimli::CfaRule::Expression(_) => CfaRule::Unsupported,
        };
        Self {
            start: Addr::from(row.start_address()),
            end: Addr::from(row.end_address()),
            cfa,
            return_address: SavedRegister::from_gimli(row.register(RETURN_ADDRESS)),
            frame_pointer: SavedRegister::from_gimli(row.register(gimli::X86_64::RBP)),
        }
    }

    /// The register the CFA is computed from, if it is a simple register rule
    pub fn cfa_register(&self) -> Option<Register> {
        match self.cfa {
            CfaRule::RegisterOffset { register, .. } => Some(register),
            CfaRule::Unsupported => None,
        }
    }

    /// The canonical frame address of the frame with registers `regs`
    pub fn cfa(&self, regs: &RegisterSnapshot) -> Result<Addr> {
        match self.cfa {
            CfaRule::RegisterOffset { register, offset } => regs
                .get(register)
                .offset(offset)
                .ok_or_else(|| unwind_error(regs.pc, "the CFA overflows")),
            CfaRule::Unsupported => Err(unwind_error(regs.pc, "CFA rule is not supported")),
        }
    }

    /// The registers of the caller of the frame with registers `regs`
    ///
    /// The stack pointer of the caller is the CFA. [`None`] if the return address is undefined,
    /// which marks the outermost frame.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::Unwind`] if a rule can not be evaluated and with
    /// [`DebuggerError::AccessError`] if a saved register can not be read.
    pub fn caller<M: MemoryAccess>(
        &self,
        regs: &RegisterSnapshot,
        mem: &mut M,
    ) -> Result<Option<RegisterSnapshot>> {
        let cfa = self.cfa(regs)?;
        let pc = match self.return_address {
            SavedRegister::AtCfaOffset(offset) => read_addr(mem, at(cfa, offset, regs.pc)?)?,
            SavedRegister::Undefined => return Ok(None),
            other => {
                return Err(unwind_error(
                    regs.pc,
                    &format!("return address rule {other:?} is not supported"),
                ))
            }
        };
        // rbp is callee saved, no rule means it still holds the caller's value
        let frame_pointer = match self.frame_pointer {
            SavedRegister::Undefined | SavedRegister::SameValue => regs.frame_pointer,
            SavedRegister::AtCfaOffset(offset) => read_addr(mem, at(cfa, offset, regs.pc)?)?,
            SavedRegister::CfaOffset(offset) => at(cfa, offset, regs.pc)?,
            SavedRegister::Unsupported => {
                return Err(unwind_error(regs.pc, "rbp rule is not supported"))
            }
        };
        Ok(Some(RegisterSnapshot {
            pc,
            frame_pointer,
            stack_pointer: cfa,
        }))
    }
}

fn at(cfa: Addr, offset: i64, pc: Addr) -> Result<Addr> {
    cfa.offset(offset)
        .ok_or_else(|| unwind_error(pc, "saved register address overflows"))
}

fn unwind_error(pc: Addr, reason: &str) -> DebuggerError {
    DebuggerError::Unwind {
        pc,
        reason: reason.to_string(),
    }
}

fn read_addr<M: MemoryAccess>(mem: &mut M, at: Addr) -> Result<Addr> {
    let bytes = mem.read_memory(at, WORD_BYTES)?;
    let word: [u8; WORD_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| DebuggerError::AccessError(at))?;
    Ok(Addr::from(u64::from_le_bytes(word)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inferior::{Inferior, StopEvent};
    use crate::testing::{
        sample_cfi, sample_debug_frame_cfi, SimulatedProcess, CALLER_FRAME, FRAME_POINTER, HELPER,
        HELPER_BODY, HELPER_CFA, MAIN, MAIN_AFTER_CALL, MAIN_END, SPIN,
    };

    fn regs(pc: Addr, frame_pointer: Addr, stack_pointer: Addr) -> RegisterSnapshot {
        RegisterSnapshot {
            pc,
            frame_pointer,
            stack_pointer,
        }
    }

    #[test]
    fn test_rows_follow_the_prologue() {
        let cfi = sample_cfi();
        let entry = cfi.row(HELPER).unwrap().unwrap();
        assert_eq!(
            entry.cfa,
            CfaRule::RegisterOffset {
                register: Register::rsp,
                offset: 8
            }
        );
        assert_eq!(entry.return_address, SavedRegister::AtCfaOffset(-8));
        assert_eq!(entry.frame_pointer, SavedRegister::Undefined);

        let pushed = cfi.row(HELPER + 1).unwrap().unwrap();
        assert_eq!(pushed.cfa_register(), Some(Register::rsp));
        assert_eq!(pushed.frame_pointer, SavedRegister::AtCfaOffset(-16));

        let body = cfi.row(HELPER_BODY).unwrap().unwrap();
        assert_eq!(
            body.cfa,
            CfaRule::RegisterOffset {
                register: Register::rbp,
                offset: 16
            }
        );
        // after `pop rbp` the CFA is relative to rsp again
        assert_eq!(cfi.row(HELPER + 6).unwrap().unwrap().cfa_register(), Some(Register::rsp));
    }

    #[test]
    fn test_debug_frame_gives_the_same_rows() {
        let eh_frame = sample_cfi();
        let debug_frame = sample_debug_frame_cfi();
        for offset in 0..7 {
            let pc = HELPER + offset;
            let row = debug_frame.row(pc).unwrap().unwrap();
            assert_eq!(Some(row), eh_frame.row(pc).unwrap(), "at {pc}");
        }
        assert!(debug_frame.row(MAIN_END).unwrap().is_none());
    }

    #[test]
    fn test_no_row_outside_described_code() {
        let cfi = sample_cfi();
        assert!(cfi.row(MAIN_END).unwrap().is_none());
        assert!(cfi.row(Addr::from(0x10usize)).unwrap().is_none());
        assert!(cfi.row(SPIN).unwrap().is_some());
        assert!(CallFrameInfo::default().row(MAIN).unwrap().is_none());
        assert!(CallFrameInfo::default().is_empty());
    }

    #[test]
    fn test_caller_of_helper_at_entry() {
        let cfi = sample_cfi();
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        inferior.add_breakpoint(HELPER).unwrap();
        assert_eq!(
            inferior.continue_execution().unwrap(),
            StopEvent::BreakpointHit(HELPER)
        );
        let callee = inferior.registers().unwrap();
        let row = cfi.row(callee.pc).unwrap().unwrap();
        assert_eq!(row.cfa(&callee).unwrap(), HELPER_CFA);

        let caller = row.caller(&callee, &mut inferior).unwrap().unwrap();
        assert_eq!(caller, regs(MAIN_AFTER_CALL, FRAME_POINTER, HELPER_CFA));
    }

    #[test]
    fn test_caller_restores_saved_rbp() {
        let cfi = sample_cfi();
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        inferior.add_breakpoint(HELPER_BODY).unwrap();
        inferior.continue_execution().unwrap();
        let callee = inferior.registers().unwrap();
        assert_ne!(callee.frame_pointer, FRAME_POINTER);

        let row = cfi.row(callee.pc).unwrap().unwrap();
        let caller = row.caller(&callee, &mut inferior).unwrap().unwrap();
        assert_eq!(caller, regs(MAIN_AFTER_CALL, FRAME_POINTER, HELPER_CFA));

        // one more level: main was entered with CALLER_FRAME in rbp
        let main_row = cfi.row(caller.pc - 1).unwrap().unwrap();
        let outer = main_row.caller(&caller, &mut inferior).unwrap().unwrap();
        assert_eq!(outer.frame_pointer, CALLER_FRAME);
        assert_eq!(outer.stack_pointer, FRAME_POINTER + 16);
    }

    #[test]
    fn test_unreadable_return_address() {
        let cfi = sample_cfi();
        let row = cfi.row(HELPER).unwrap().unwrap();
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        let bogus = regs(HELPER, FRAME_POINTER, Addr::from(0x10usize));
        assert!(matches!(
            row.caller(&bogus, &mut inferior),
            Err(DebuggerError::AccessError(_))
        ));
    }

    #[test]
    fn test_undefined_return_address_ends_the_stack() {
        let row = UnwindRow {
            start: MAIN,
            end: MAIN_END,
            cfa: CfaRule::RegisterOffset {
                register: Register::rsp,
                offset: 8,
            },
            return_address: SavedRegister::Undefined,
            frame_pointer: SavedRegister::Undefined,
        };
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        let top = regs(MAIN, CALLER_FRAME, FRAME_POINTER);
        assert_eq!(row.caller(&top, &mut inferior).unwrap(), None);

        let unsupported = UnwindRow {
            cfa: CfaRule::Unsupported,
            ..row
        };
        assert!(matches!(
            unsupported.cfa(&top),
            Err(DebuggerError::Unwind { .. })
        ));
    }
}
