//! # Scope Module
//!
//! Variables and the lexical scopes they are declared in.
//!
//! Each function owns a tree of [`VariableScope`]s: the root covers the whole function, children
//! are lexical blocks. Resolving a name walks from the innermost scope containing the program
//! counter outward, so a block local declaration shadows one of the same name further out.
//!
//! Nothing here caches values. A [`VariableDescriptor`] only knows *where* a variable lives
//! relative to a [`FrameContext`], the value is read from memory on every query.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{DebuggerError, Result};
use crate::value::Value;
use crate::{Addr, Register};

/// Anything variables can be read from
pub trait MemoryAccess {
    /// Reads `len` bytes at `addr`
    ///
    /// May return fewer bytes than requested if the read runs into unmapped memory.
    fn read_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Signed,
    Unsigned,
    Float,
    Bool,
    Char,
    Pointer,
    Aggregate,
}

/// What a variable is, as far as printing it is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub size: usize,
    pub kind: TypeKind,
}

impl TypeDescriptor {
    pub fn new(name: impl ToString, size: usize, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            size,
            kind,
        }
    }

    pub fn signed(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Signed)
    }

    pub fn unsigned(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Unsigned)
    }

    pub fn float(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Float)
    }

    pub fn boolean(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Bool)
    }

    pub fn character(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Char)
    }

    pub fn pointer(name: impl ToString) -> Self {
        Self::new(name, crate::WORD_BYTES, TypeKind::Pointer)
    }

    pub fn aggregate(name: impl ToString, size: usize) -> Self {
        Self::new(name, size, TypeKind::Aggregate)
    }
}

/// Where a variable lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// `DW_OP_fbreg`: a fixed offset from the frame base of the function
    FrameBaseOffset(i64),
    /// `DW_OP_addr`: a fixed address, as recorded in the debug info
    Address(Addr),
    /// A location expression that can not be evaluated, with a description of its form
    Unsupported(String),
}

/// How the frame base of a function is computed (`DW_AT_frame_base`)
///
/// Evaluated by [`DwarfData::frame_base`](crate::dbginfo::DwarfData::frame_base), which needs
/// the unwind information of the executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBase {
    /// The value of a register
    Register(Register),
    /// `DW_OP_call_frame_cfa`
    CallFrameCfa,
    Unsupported(String),
}

/// Everything needed to turn a [`Location`] into an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// The program counter as a debug info address
    pub pc: Addr,
    /// Frame base of the function containing `pc`, [`None`] if it could not be computed
    pub frame_base: Option<Addr>,
    /// Difference between runtime and debug info addresses
    pub load_bias: Addr,
}

impl FrameContext {
    pub fn new(pc: Addr, frame_base: Option<Addr>, load_bias: Addr) -> Self {
        Self {
            pc,
            frame_base,
            load_bias,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub ty: TypeDescriptor,
    pub location: Location,
    pub decl_line: Option<u64>,
}

impl VariableDescriptor {
    pub fn new(name: impl ToString, ty: TypeDescriptor, location: Location) -> Self {
        Self {
            name: name.to_string(),
            ty,
            location,
            decl_line: None,
        }
    }

    pub fn with_decl_line(mut self, line: u64) -> Self {
        self.decl_line = Some(line);
        self
    }

    /// The runtime address of the variable in `frame`
    pub fn address(&self, frame: &FrameContext) -> Result<Addr> {
        match &self.location {
            Location::FrameBaseOffset(offset) => {
                let base = frame
                    .frame_base
                    .ok_or_else(|| DebuggerError::UnsupportedLocationExpr {
                        name: self.name.clone(),
                        form: "DW_OP_fbreg without a usable frame base".to_string(),
                    })?;
                base.offset(*offset).ok_or(DebuggerError::ReadError {
                    name: self.name.clone(),
                    addr: base,
                })
            }
            Location::Address(addr) => Ok(addr.relocate(frame.load_bias)),
            Location::Unsupported(form) => Err(DebuggerError::UnsupportedLocationExpr {
                name: self.name.clone(),
                form: form.clone(),
            }),
        }
    }

    /// Reads and decodes the current value of the variable
    ///
    /// # Errors
    ///
    /// [`DebuggerError::UnsupportedLocationExpr`] if the location can not be evaluated and
    /// [`DebuggerError::ReadError`] if the memory at the computed address can not be read.
    pub fn read<M: MemoryAccess>(&self, frame: &FrameContext, mem: &mut M) -> Result<Value> {
        let addr = self.address(frame)?;
        trace!("reading {} ({} bytes) at {addr}", self.name, self.ty.size);
        let bytes = mem
            .read_memory(addr, self.ty.size)
            .map_err(|_| DebuggerError::ReadError {
                name: self.name.clone(),
                addr,
            })?;
        if bytes.len() != self.ty.size {
            return Err(DebuggerError::ReadError {
                name: self.name.clone(),
                addr,
            });
        }
        Ok(Value::decode(&self.ty, &bytes))
    }
}

/// A half open range of debug info addresses, `[low, high)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrRange {
    pub low: Addr,
    pub high: Addr,
}

impl AddrRange {
    pub fn new(low: Addr, high: Addr) -> Self {
        Self { low, high }
    }

    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.low <= addr && addr < self.high
    }
}

/// A function body or lexical block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableScope {
    pub ranges: Vec<AddrRange>,
    pub variables: Vec<VariableDescriptor>,
    pub children: Vec<VariableScope>,
}

impl VariableScope {
    pub fn new(ranges: Vec<AddrRange>) -> Self {
        Self {
            ranges,
            variables: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_variable(mut self, variable: VariableDescriptor) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_child(mut self, child: VariableScope) -> Self {
        self.children.push(child);
        self
    }

    pub fn contains(&self, pc: Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(pc))
    }

    /// The scopes containing `pc`, innermost first, ending with `self`
    ///
    /// Empty if `pc` is not inside this scope.
    pub fn scope_chain(&self, pc: Addr) -> Vec<&VariableScope> {
        if !self.contains(pc) {
            return Vec::new();
        }
        let mut chain = self
            .children
            .iter()
            .map(|child| child.scope_chain(pc))
            .find(|chain| !chain.is_empty())
            .unwrap_or_default();
        chain.push(self);
        chain
    }

    /// The declaration `name` refers to at `pc`
    pub fn lookup(&self, name: &str, pc: Addr) -> Option<&VariableDescriptor> {
        self.scope_chain(pc)
            .into_iter()
            .find_map(|scope| scope.variables.iter().find(|v| v.name == name))
    }

    /// Every variable visible at `pc`, innermost first, without the shadowed ones
    pub fn visible_variables(&self, pc: Addr) -> Vec<&VariableDescriptor> {
        let mut visible: Vec<&VariableDescriptor> = Vec::new();
        for scope in self.scope_chain(pc) {
            for var in &scope.variables {
                if !visible.iter().any(|v| v.name == var.name) {
                    visible.push(var);
                }
            }
        }
        visible
    }

    /// Finds `name` at `frame.pc` and reads its value
    pub fn resolve<M: MemoryAccess>(
        &self,
        name: &str,
        frame: &FrameContext,
        mem: &mut M,
    ) -> Result<Value> {
        self.lookup(name, frame.pc)
            .ok_or_else(|| DebuggerError::VariableNotFound(name.to_string()))?
            .read(frame, mem)
    }
}
