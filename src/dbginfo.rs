//! # Debug Info Module
//!
//! [`DwarfData`] is the query side of the debug information: which source line an address
//! belongs to, which function contains it, where a breakpoint for a function or line should go,
//! and what value a variable has.
//!
//! All addresses stored here are debug info addresses. For position independent executables
//! they differ from runtime addresses by the load bias, callers translate with
//! [`Addr::relocate`] and [`Addr::unrelocate`]. How the data is read from an ELF file is in
//! [`dwarf_parse`](crate::dwarf_parse).
//!
//! Frame bases are computed with the [`CallFrameInfo`] of the executable. A frame base that is a
//! register is only trusted once the prologue has set that register up.

use serde::Serialize;
use tracing::{trace, warn};

use crate::errors::{DebuggerError, Result};
use crate::linetable::{LineRecord, SourceLineTable, SourceLocation};
use crate::scope::{
    AddrRange, FrameBase, FrameContext, MemoryAccess, VariableDescriptor, VariableScope,
};
use crate::unwind::{CallFrameInfo, UnwindRow};
use crate::value::Value;
use crate::{Addr, Register, RegisterSnapshot, WORD_BYTES};

/// A function with code, as described by a `DW_TAG_subprogram`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    name: String,
    linkage_name: Option<String>,
    ranges: Vec<AddrRange>,
    #[serde(skip)]
    frame_base: FrameBase,
    #[serde(skip)]
    scope: VariableScope,
    decl_file: Option<usize>,
    decl_line: Option<u64>,
}

impl Function {
    pub fn new(
        name: impl ToString,
        ranges: Vec<AddrRange>,
        frame_base: FrameBase,
        scope: VariableScope,
    ) -> Self {
        Self {
            name: name.to_string(),
            linkage_name: None,
            ranges,
            frame_base,
            scope,
            decl_file: None,
            decl_line: None,
        }
    }

    /// Sets the file (an index into the line table's files) and line of the declaration
    pub fn with_decl(mut self, file: usize, line: u64) -> Self {
        self.decl_file = Some(file);
        self.decl_line = Some(line);
        self
    }

    pub fn with_linkage_name(mut self, linkage_name: impl ToString) -> Self {
        self.linkage_name = Some(linkage_name.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn linkage_name(&self) -> Option<&str> {
        self.linkage_name.as_deref()
    }

    /// Demangled name if there is a linkage name, the plain name otherwise
    pub fn display_name(&self) -> String {
        match &self.linkage_name {
            Some(linkage) => format!("{:#}", rustc_demangle::demangle(linkage)),
            None => self.name.clone(),
        }
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn frame_base(&self) -> &FrameBase {
        &self.frame_base
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn decl_file(&self) -> Option<usize> {
        self.decl_file
    }

    pub fn decl_line(&self) -> Option<u64> {
        self.decl_line
    }

    /// Lowest address of the function
    pub fn entry(&self) -> Addr {
        self.ranges.iter().map(|r| r.low).min().unwrap_or(Addr::NULL)
    }

    pub fn contains(&self, pc: Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(pc))
    }

    fn matches_name(&self, name: &str) -> bool {
        self.name == name
            || self.linkage_name.as_deref() == Some(name)
            || self.display_name() == name
    }
}

/// Parsed debug information of one executable
#[derive(Debug, Clone, Default)]
pub struct DwarfData {
    lines: SourceLineTable,
    functions: Vec<Function>,
    globals: Vec<VariableDescriptor>,
    cfi: CallFrameInfo,
    position_independent: bool,
}

impl DwarfData {
    /// Bundles already parsed debug information
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::MalformedDebugInfo`] if a function has an empty address range.
    pub fn new(
        lines: SourceLineTable,
        mut functions: Vec<Function>,
        globals: Vec<VariableDescriptor>,
    ) -> Result<Self> {
        for function in &functions {
            if let Some(range) = function.ranges.iter().find(|r| r.low >= r.high) {
                return Err(DebuggerError::MalformedDebugInfo(format!(
                    "function {} has an empty range [{}, {})",
                    function.name, range.low, range.high
                )));
            }
        }
        functions.sort_by_key(Function::entry);
        Ok(Self {
            lines,
            functions,
            globals,
            cfi: CallFrameInfo::default(),
            position_independent: false,
        })
    }

    /// Debug info that knows nothing, every query comes back empty
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_position_independent(mut self, position_independent: bool) -> Self {
        self.position_independent = position_independent;
        self
    }

    pub fn with_call_frame_info(mut self, cfi: CallFrameInfo) -> Self {
        self.cfi = cfi;
        self
    }

    pub fn call_frame_info(&self) -> &CallFrameInfo {
        &self.cfi
    }

    /// The executable is loaded at a random base and needs a load bias
    pub fn position_independent(&self) -> bool {
        self.position_independent
    }

    pub fn lines(&self) -> &SourceLineTable {
        &self.lines
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn globals(&self) -> &[VariableDescriptor] {
        &self.globals
    }

    pub fn line_at(&self, pc: Addr) -> Option<&LineRecord> {
        self.lines.lookup(pc)
    }

    pub fn location_at(&self, pc: Addr) -> Option<SourceLocation> {
        self.lines.location(pc)
    }

    pub fn function_at(&self, pc: Addr) -> Option<&Function> {
        self.functions.iter().find(|f| f.contains(pc))
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.matches_name(name))
    }

    /// The first address of `function` after the prologue that sets up its frame
    pub fn body_start(&self, function: &Function) -> Addr {
        let entry = function.entry();
        let high = function
            .ranges
            .iter()
            .find(|r| r.contains(entry))
            .map(|r| r.high)
            .unwrap_or(entry);
        self.lines.function_body_start(entry, high)
    }

    /// Where a breakpoint on function `name` goes: the first line of its body, after the
    /// prologue
    pub fn breakpoint_address_for_function(&self, name: &str) -> Result<Addr> {
        let function = self
            .function_by_name(name)
            .ok_or_else(|| DebuggerError::UnknownFunction(name.to_string()))?;
        Ok(self.body_start(function))
    }

    /// The unwind row for `pc`, a debug info address
    pub fn unwind_row(&self, pc: Addr) -> Result<Option<UnwindRow>> {
        self.cfi.row(pc)
    }

    /// Where a breakpoint on `line` goes
    ///
    /// Without a file name the file that declares `main` is used, or the first file if there is
    /// no `main`.
    pub fn address_for_line(&self, file: Option<&str>, line: u64) -> Result<Addr> {
        let file_id = match file {
            Some(name) => Some(
                self.lines
                    .find_file(name)
                    .ok_or_else(|| DebuggerError::SourceFileUnavailable(name.into()))?,
            ),
            None => self.function_by_name("main").and_then(Function::decl_file),
        };
        self.lines
            .address_for_line(file_id, line)
            .ok_or(DebuggerError::UnknownLine(line))
    }

    /// The declaration `name` refers to at `pc`: locals of the function containing `pc` first,
    /// then globals
    pub fn lookup_variable(&self, name: &str, pc: Addr) -> Option<&VariableDescriptor> {
        self.function_at(pc)
            .and_then(|f| f.scope.lookup(name, pc))
            .or_else(|| self.globals.iter().find(|g| g.name == name))
    }

    /// Everything `print` could show at `pc`, innermost first
    pub fn visible_variables(&self, pc: Addr) -> Vec<&VariableDescriptor> {
        let mut visible = self
            .function_at(pc)
            .map(|f| f.scope.visible_variables(pc))
            .unwrap_or_default();
        for global in &self.globals {
            if !visible.iter().any(|v| v.name == global.name) {
                visible.push(global);
            }
        }
        visible
    }

    /// The canonical frame address of the innermost frame
    ///
    /// Taken from the unwind row for the program counter. Without unwind information only the
    /// two states of a standard `push rbp; mov rbp, rsp` prologue are known: at the entry the CFA
    /// is `rsp + 8`, in the body it is `rbp + 16`.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::Unwind`] if the CFA can not be determined at this address.
    pub fn cfa(&self, regs: &RegisterSnapshot, load_bias: Addr) -> Result<Addr> {
        let pc = regs.pc.unrelocate(load_bias);
        if let Some(row) = self.unwind_row(pc)? {
            return row.cfa(regs);
        }
        let function = self.function_at(pc).ok_or_else(|| DebuggerError::Unwind {
            pc: regs.pc,
            reason: "no unwind information and no function".to_string(),
        })?;
        if pc == function.entry() {
            Ok(regs.stack_pointer + WORD_BYTES)
        } else if pc >= self.body_start(function) {
            Ok(regs.frame_pointer + 2 * WORD_BYTES)
        } else {
            Err(DebuggerError::Unwind {
                pc: regs.pc,
                reason: "inside the prologue and no unwind information".to_string(),
            })
        }
    }

    /// Evaluates the frame base of `function` for the innermost frame
    ///
    /// # Errors
    ///
    /// [`DebuggerError::UnsupportedLocationExpr`] if the frame base can not be evaluated, which
    /// includes a frame pointer based frame base while the frame pointer is not set up yet.
    pub fn frame_base(
        &self,
        function: &Function,
        regs: &RegisterSnapshot,
        load_bias: Addr,
    ) -> Result<Addr> {
        let not_set_up = |form: &str| DebuggerError::UnsupportedLocationExpr {
            name: format!("frame base of {}", function.name),
            form: form.to_string(),
        };
        match &function.frame_base {
            FrameBase::Register(Register::rbp) => {
                let pc = regs.pc.unrelocate(load_bias);
                let ready = match self.unwind_row(pc)? {
                    Some(row) => row.cfa_register() == Some(Register::rbp),
                    None => pc >= self.body_start(function),
                };
                if !ready {
                    return Err(not_set_up("rbp before the prologue set it up"));
                }
                Ok(regs.frame_pointer)
            }
            FrameBase::Register(register) => Ok(regs.get(*register)),
            FrameBase::CallFrameCfa => self
                .cfa(regs, load_bias)
                .map_err(|e| not_set_up(&format!("DW_OP_call_frame_cfa ({e})"))),
            FrameBase::Unsupported(form) => Err(not_set_up(form)),
        }
    }

    /// Builds the [`FrameContext`] for the innermost frame of a stopped debuggee
    pub fn frame_context(&self, regs: &RegisterSnapshot, load_bias: Addr) -> FrameContext {
        let pc = regs.pc.unrelocate(load_bias);
        let frame_base = self
            .function_at(pc)
            .and_then(|f| match self.frame_base(f, regs, load_bias) {
                Ok(base) => {
                    trace!("frame base of {} is {base}", f.name);
                    Some(base)
                }
                Err(e) => {
                    warn!("no frame base for {}: {e}", f.name);
                    None
                }
            });
        FrameContext::new(pc, frame_base, load_bias)
    }

    /// Finds `name` at `frame.pc` and reads its value
    pub fn resolve_variable<M: MemoryAccess>(
        &self,
        name: &str,
        frame: &FrameContext,
        mem: &mut M,
    ) -> Result<Value> {
        self.lookup_variable(name, frame.pc)
            .ok_or_else(|| DebuggerError::VariableNotFound(name.to_string()))?
            .read(frame, mem)
    }
}
