//! # DWARF Parsing
//!
//! Builds a [`DwarfData`] from an ELF executable.
//!
//! [`object`] finds (and if needed decompresses) the debug sections, [`gimli`] reads them. Two
//! things are extracted from every compilation unit:
//!
//! - the rows of its line program, which become [`LineRecord`]s
//! - the tree of debugging information entries, from which functions with their scopes and
//!   variables, and the unit level variables (globals), are taken
//!
//! Everything that can not be represented, like variables kept in registers or described by
//! location lists, is kept with an [`Location::Unsupported`] location, so that printing it gives
//! a precise error instead of "not found".

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use gimli::{
    AttributeValue, DebuggingInformationEntry, DwAt, EndianRcSlice, EntriesTreeNode, Expression,
    FileEntry, LineProgramHeader, Operation, Reader, RunTimeEndian, Unit, UnitOffset,
};
use object::{Object, ObjectKind, ObjectSection};
use tracing::{debug, info, trace, warn};

use crate::dbginfo::{DwarfData, Function};
use crate::errors::Result;
use crate::linetable::{LineRecord, SourceLineTable};
use crate::scope::{
    AddrRange, FrameBase, Location, TypeDescriptor, TypeKind, VariableDescriptor, VariableScope,
};
use crate::unwind::CallFrameInfo;
use crate::Addr;

/// The [`gimli::Reader`] used for all sections
pub(crate) type GimliReader = EndianRcSlice<RunTimeEndian>;

/// Type chains deeper than this are cut off, they are either broken or cyclic
const MAX_TYPE_DEPTH: usize = 16;

impl DwarfData {
    /// Reads the debug information of the executable at `path`
    ///
    /// An executable without debug information gives an empty [`DwarfData`], queries on it just
    /// find nothing.
    ///
    /// # Errors
    ///
    /// Fails if the file can not be read or parsed as an object file, if the DWARF data can not be
    /// read, and with [`MalformedDebugInfo`](crate::errors::DebuggerError::MalformedDebugInfo) if the
    /// result is inconsistent.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let object_info = object::File::parse(&*data)?;
        let endian = if object_info.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<GimliReader> {
            let data = match object_info.section_by_name(id.name()) {
                Some(section) => section.uncompressed_data()?,
                None => Cow::Borrowed(&[][..]),
            };
            Ok(GimliReader::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut loader = DwarfLoader::new(&dwarf);
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            loader.load_unit(&unit)?;
        }

        let dwarf_data = loader
            .finish()?
            .with_position_independent(object_info.kind() == ObjectKind::Dynamic)
            .with_call_frame_info(load_call_frame_info(&object_info, endian)?);
        info!(
            "loaded debug info of {}: {} line records, {} functions, {} globals",
            path.display(),
            dwarf_data.lines().records().len(),
            dwarf_data.functions().len(),
            dwarf_data.globals().len()
        );
        Ok(dwarf_data)
    }
}

/// Takes `.eh_frame` and `.debug_frame` with the addresses they are mapped at
fn load_call_frame_info(
    object_info: &object::File,
    endian: RunTimeEndian,
) -> Result<CallFrameInfo> {
    let mut cfi = CallFrameInfo::new(endian);
    if let Some(text) = object_info.section_by_name(".text") {
        cfi = cfi.with_text(Addr::from(text.address()));
    }
    if let Some(section) = object_info.section_by_name(".eh_frame") {
        let data = section.uncompressed_data()?;
        cfi = cfi.with_eh_frame(Addr::from(section.address()), data.into_owned());
    }
    if let Some(section) = object_info.section_by_name(".debug_frame") {
        let data = section.uncompressed_data()?;
        cfi = cfi.with_debug_frame(Addr::from(section.address()), data.into_owned());
    }
    if cfi.is_empty() {
        warn!("no call frame information, frames can only be found at function entries");
    }
    Ok(cfi)
}

struct DwarfLoader<'d> {
    dwarf: &'d gimli::Dwarf<GimliReader>,
    files: Vec<PathBuf>,
    file_ids: HashMap<PathBuf, usize>,
    records: Vec<LineRecord>,
    functions: Vec<Function>,
    globals: Vec<VariableDescriptor>,
}

impl<'d> DwarfLoader<'d> {
    fn new(dwarf: &'d gimli::Dwarf<GimliReader>) -> Self {
        Self {
            dwarf,
            files: Vec::new(),
            file_ids: HashMap::new(),
            records: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    fn finish(self) -> Result<DwarfData> {
        let records = normalize_line_records(self.records);
        let lines = SourceLineTable::new(self.files, records)?;
        DwarfData::new(lines, self.functions, self.globals)
    }

    fn load_unit(&mut self, unit: &Unit<GimliReader>) -> Result<()> {
        // maps the file indices of this unit's line program to ids in `self.files`
        let mut unit_files: HashMap<u64, usize> = HashMap::new();
        self.load_line_program(unit, &mut unit_files)?;

        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        self.walk_items(unit, &mut unit_files, root)
    }

    fn load_line_program(
        &mut self,
        unit: &Unit<GimliReader>,
        unit_files: &mut HashMap<u64, usize>,
    ) -> Result<()> {
        let Some(program) = unit.line_program.clone() else {
            return Ok(());
        };
        let mut rows = program.rows();
        // start of the row that is still open and the position it belongs to
        let mut open: Option<(Addr, Option<(usize, u64)>)> = None;

        while let Some((header, row)) = rows.next_row()? {
            let addr = Addr::from(row.address());
            if let Some((low, Some((file, line)))) = open {
                if addr > low {
                    self.records.push(LineRecord::new(low, addr, file, line));
                }
            }
            if row.end_sequence() {
                open = None;
                continue;
            }

            let position = match row.line() {
                Some(line) => self
                    .file_id(unit, header, row.file_index(), unit_files)?
                    .map(|file| (file, line.get())),
                // line 0 is code that belongs to no line
                None => None,
            };
            open = Some((addr, position));
        }
        Ok(())
    }

    fn file_id(
        &mut self,
        unit: &Unit<GimliReader>,
        header: &LineProgramHeader<GimliReader>,
        index: u64,
        unit_files: &mut HashMap<u64, usize>,
    ) -> Result<Option<usize>> {
        if let Some(id) = unit_files.get(&index) {
            return Ok(Some(*id));
        }
        let Some(file) = header.file(index) else {
            warn!("line program refers to file {index}, which it does not declare");
            return Ok(None);
        };
        let path = self.file_path(unit, header, file)?;
        let id = self.intern(path);
        unit_files.insert(index, id);
        Ok(Some(id))
    }

    fn file_path(
        &self,
        unit: &Unit<GimliReader>,
        header: &LineProgramHeader<GimliReader>,
        file: &FileEntry<GimliReader>,
    ) -> Result<PathBuf> {
        let mut path = PathBuf::new();
        if let Some(comp_dir) = &unit.comp_dir {
            path.push(comp_dir.to_string_lossy()?.as_ref());
        }
        // absolute components replace what was pushed before
        if let Some(dir) = file.directory(header) {
            let dir = self.dwarf.attr_string(unit, dir)?;
            path.push(dir.to_string_lossy()?.as_ref());
        }
        let name = self.dwarf.attr_string(unit, file.path_name())?;
        path.push(name.to_string_lossy()?.as_ref());
        Ok(path)
    }

    fn intern(&mut self, path: PathBuf) -> usize {
        if let Some(id) = self.file_ids.get(&path) {
            return *id;
        }
        let id = self.files.len();
        trace!("source file {id}: {}", path.display());
        self.files.push(path.clone());
        self.file_ids.insert(path, id);
        id
    }

    /// Walks entries that can contain functions and globals, like the unit itself or namespaces
    fn walk_items(
        &mut self,
        unit: &Unit<GimliReader>,
        unit_files: &mut HashMap<u64, usize>,
        node: EntriesTreeNode<'_, '_, '_, GimliReader>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            match child.entry().tag() {
                gimli::DW_TAG_subprogram => self.load_function(unit, unit_files, child)?,
                gimli::DW_TAG_variable => {
                    if let Some(global) = self.load_variable(unit, child.entry())? {
                        self.globals.push(global);
                    }
                }
                gimli::DW_TAG_namespace
                | gimli::DW_TAG_module
                | gimli::DW_TAG_structure_type
                | gimli::DW_TAG_class_type
                | gimli::DW_TAG_union_type => self.walk_items(unit, unit_files, child)?,
                _ => (),
            }
        }
        Ok(())
    }

    fn load_function(
        &mut self,
        unit: &Unit<GimliReader>,
        unit_files: &mut HashMap<u64, usize>,
        node: EntriesTreeNode<'_, '_, '_, GimliReader>,
    ) -> Result<()> {
        let entry = node.entry();
        let ranges = self.ranges(unit, entry)?;
        if ranges.is_empty() {
            // declarations and functions that only exist inlined have no code of their own
            return Ok(());
        }
        let Some(name) = self.name_of(unit, entry)? else {
            debug!("skipping a function without name at {}", ranges[0].low);
            return Ok(());
        };
        let linkage_name = match self.attr_string(unit, entry, gimli::DW_AT_linkage_name)? {
            Some(n) => Some(n),
            None => self.attr_string(unit, entry, gimli::DW_AT_MIPS_linkage_name)?,
        };
        let decl_file = match entry.attr_value(gimli::DW_AT_decl_file)? {
            Some(AttributeValue::FileIndex(idx)) | Some(AttributeValue::Udata(idx)) => {
                match &unit.line_program {
                    Some(program) => self.file_id(unit, program.header(), idx, unit_files)?,
                    None => None,
                }
            }
            _ => None,
        };
        let decl_line = attr_udata(entry, gimli::DW_AT_decl_line)?;
        let frame_base = self.frame_base(unit, entry)?;

        let scope = self.load_scope(unit, node, ranges.clone())?;
        let mut function = Function::new(&name, ranges, frame_base, scope);
        if let (Some(file), Some(line)) = (decl_file, decl_line) {
            function = function.with_decl(file, line);
        }
        if let Some(linkage_name) = linkage_name {
            function = function.with_linkage_name(linkage_name);
        }
        trace!("function {name} at {}", function.entry());
        self.functions.push(function);
        Ok(())
    }

    fn load_scope(
        &self,
        unit: &Unit<GimliReader>,
        node: EntriesTreeNode<'_, '_, '_, GimliReader>,
        ranges: Vec<AddrRange>,
    ) -> Result<VariableScope> {
        let mut scope = VariableScope::new(ranges);
        let mut children = node.children();
        while let Some(child) = children.next()? {
            match child.entry().tag() {
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    if let Some(var) = self.load_variable(unit, child.entry())? {
                        scope = scope.with_variable(var);
                    }
                }
                gimli::DW_TAG_lexical_block => {
                    let mut block_ranges = self.ranges(unit, child.entry())?;
                    if block_ranges.is_empty() {
                        block_ranges = scope.ranges.clone();
                    }
                    let block = self.load_scope(unit, child, block_ranges)?;
                    scope = scope.with_child(block);
                }
                _ => (),
            }
        }
        Ok(scope)
    }

    fn load_variable(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<Option<VariableDescriptor>> {
        if let Some(AttributeValue::Flag(true)) = entry.attr_value(gimli::DW_AT_declaration)? {
            return Ok(None);
        }
        let Some(name) = self.name_of(unit, entry)? else {
            return Ok(None);
        };

        let ty = match self.type_of(unit, entry)? {
            Some(offset) => self.resolve_type(unit, offset, 0)?,
            None => TypeDescriptor::aggregate("void", 0),
        };
        let location = match entry.attr_value(gimli::DW_AT_location)? {
            Some(AttributeValue::Exprloc(expr)) => self.location(unit, expr)?,
            Some(AttributeValue::LocationListsRef(_)) | Some(AttributeValue::SecOffset(_)) => {
                Location::Unsupported("location list".to_string())
            }
            Some(other) => Location::Unsupported(format!("location attribute {other:?}")),
            None => Location::Unsupported("optimized out".to_string()),
        };

        let mut var = VariableDescriptor::new(name, ty, location);
        if let Some(line) = attr_udata(entry, gimli::DW_AT_decl_line)? {
            var = var.with_decl_line(line);
        }
        Ok(Some(var))
    }

    fn location(
        &self,
        unit: &Unit<GimliReader>,
        expr: Expression<GimliReader>,
    ) -> Result<Location> {
        let mut ops = expr.operations(unit.encoding());
        let first = ops.next()?;
        let second = ops.next()?;
        Ok(match (first, second) {
            (Some(Operation::FrameOffset { offset }), None) => Location::FrameBaseOffset(offset),
            (Some(Operation::Address { address }), None) => Location::Address(address.into()),
            (Some(Operation::AddressIndex { index }), None) => {
                Location::Address(self.dwarf.address(unit, index)?.into())
            }
            (Some(op), None) => Location::Unsupported(describe_operation(&op)),
            (Some(_), Some(_)) => {
                Location::Unsupported("expression with multiple operations".to_string())
            }
            (None, _) => Location::Unsupported("empty expression".to_string()),
        })
    }

    fn frame_base(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<FrameBase> {
        let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_frame_base)? else {
            return Ok(FrameBase::Unsupported("no DW_AT_frame_base".to_string()));
        };
        let mut ops = expr.operations(unit.encoding());
        let first = ops.next()?;
        let second = ops.next()?;
        Ok(match (first, second) {
            (Some(Operation::Register { register }), None) => {
                match crate::Register::from_dwarf(register) {
                    Some(reg) => FrameBase::Register(reg),
                    None => FrameBase::Unsupported(format!("DW_OP_reg{}", register.0)),
                }
            }
            (Some(Operation::CallFrameCFA), None) => FrameBase::CallFrameCfa,
            (Some(op), None) => FrameBase::Unsupported(describe_operation(&op)),
            _ => FrameBase::Unsupported("frame base expression".to_string()),
        })
    }

    fn ranges(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<Vec<AddrRange>> {
        let mut ranges = Vec::new();
        let mut iter = self.dwarf.die_ranges(unit, entry)?;
        while let Some(range) = iter.next()? {
            // code removed by the linker keeps its ranges, but they start at 0
            if range.begin == 0 || range.begin >= range.end {
                continue;
            }
            ranges.push(AddrRange::new(range.begin.into(), range.end.into()));
        }
        Ok(ranges)
    }

    fn attr_string(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
        attr: DwAt,
    ) -> Result<Option<String>> {
        Ok(match entry.attr_value(attr)? {
            Some(value) => Some(
                self.dwarf
                    .attr_string(unit, value)?
                    .to_string_lossy()?
                    .into_owned(),
            ),
            None => None,
        })
    }

    /// The entry a definition refers to for the attributes it does not repeat
    fn origin_of(
        &self,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<Option<UnitOffset>> {
        for attr in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
            if let Some(AttributeValue::UnitRef(offset)) = entry.attr_value(attr)? {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn name_of(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<Option<String>> {
        if let Some(name) = self.attr_string(unit, entry, gimli::DW_AT_name)? {
            return Ok(Some(name));
        }
        match self.origin_of(entry)? {
            Some(offset) => {
                let origin = unit.entry(offset)?;
                self.attr_string(unit, &origin, gimli::DW_AT_name)
            }
            None => Ok(None),
        }
    }

    fn type_of(
        &self,
        unit: &Unit<GimliReader>,
        entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    ) -> Result<Option<UnitOffset>> {
        if let Some(AttributeValue::UnitRef(offset)) = entry.attr_value(gimli::DW_AT_type)? {
            return Ok(Some(offset));
        }
        match self.origin_of(entry)? {
            Some(offset) => {
                let origin = unit.entry(offset)?;
                match origin.attr_value(gimli::DW_AT_type)? {
                    Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    fn resolve_type(
        &self,
        unit: &Unit<GimliReader>,
        offset: UnitOffset,
        depth: usize,
    ) -> Result<TypeDescriptor> {
        if depth > MAX_TYPE_DEPTH {
            warn!("type chain at {offset:?} is too deep");
            return Ok(TypeDescriptor::aggregate("?", 0));
        }
        let entry = unit.entry(offset)?;
        let name = self.attr_string(unit, &entry, gimli::DW_AT_name)?;
        let size = attr_udata(&entry, gimli::DW_AT_byte_size)?.unwrap_or(0) as usize;
        let inner = match entry.attr_value(gimli::DW_AT_type)? {
            Some(AttributeValue::UnitRef(inner)) => Some(inner),
            _ => None,
        };

        Ok(match entry.tag() {
            gimli::DW_TAG_base_type => {
                let kind = match entry.attr_value(gimli::DW_AT_encoding)? {
                    Some(AttributeValue::Encoding(encoding)) => encoding_kind(encoding),
                    _ => TypeKind::Aggregate,
                };
                TypeDescriptor::new(name.unwrap_or_else(|| "?".to_string()), size, kind)
            }
            gimli::DW_TAG_typedef => {
                let target = match inner {
                    Some(inner) => self.resolve_type(unit, inner, depth + 1)?,
                    None => TypeDescriptor::aggregate("void", 0),
                };
                TypeDescriptor::new(name.unwrap_or(target.name), target.size, target.kind)
            }
            gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type | gimli::DW_TAG_restrict_type => {
                let target = match inner {
                    Some(inner) => self.resolve_type(unit, inner, depth + 1)?,
                    None => TypeDescriptor::aggregate("void", 0),
                };
                let qualifier = match entry.tag() {
                    gimli::DW_TAG_const_type => "const",
                    gimli::DW_TAG_volatile_type => "volatile",
                    _ => "restrict",
                };
                TypeDescriptor::new(
                    format!("{qualifier} {}", target.name),
                    target.size,
                    target.kind,
                )
            }
            gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type => {
                let pointee = match inner {
                    Some(inner) => self.resolve_type(unit, inner, depth + 1)?.name,
                    None => "void".to_string(),
                };
                TypeDescriptor::pointer(name.unwrap_or_else(|| format!("{pointee} *")))
            }
            gimli::DW_TAG_enumeration_type => TypeDescriptor::signed(
                name.map(|n| format!("enum {n}"))
                    .unwrap_or_else(|| "enum".to_string()),
                size,
            ),
            gimli::DW_TAG_array_type => {
                let element = match inner {
                    Some(inner) => self.resolve_type(unit, inner, depth + 1)?,
                    None => TypeDescriptor::aggregate("?", 0),
                };
                let count = self.array_count(unit, offset)?;
                TypeDescriptor::aggregate(
                    format!("{}[{count}]", element.name),
                    element.size * count,
                )
            }
            gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => TypeDescriptor::aggregate(
                name.map(|n| format!("struct {n}"))
                    .unwrap_or_else(|| "struct".to_string()),
                size,
            ),
            gimli::DW_TAG_union_type => TypeDescriptor::aggregate(
                name.map(|n| format!("union {n}"))
                    .unwrap_or_else(|| "union".to_string()),
                size,
            ),
            other => {
                debug!("unhandled type tag {other} at {offset:?}");
                TypeDescriptor::aggregate(name.unwrap_or_else(|| other.to_string()), size)
            }
        })
    }

    /// Number of elements of an array type, the product over all its dimensions
    fn array_count(&self, unit: &Unit<GimliReader>, offset: UnitOffset) -> Result<usize> {
        let mut tree = unit.entries_tree(Some(offset))?;
        let mut children = tree.root()?.children();
        let mut count = 1usize;
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            let dimension = match attr_udata(entry, gimli::DW_AT_count)? {
                Some(n) => n as usize,
                None => match attr_udata(entry, gimli::DW_AT_upper_bound)? {
                    Some(upper) => upper as usize + 1,
                    // flexible array member
                    None => 0,
                },
            };
            count = count.saturating_mul(dimension);
        }
        Ok(count)
    }
}

fn attr_udata(
    entry: &DebuggingInformationEntry<'_, '_, GimliReader>,
    attr: DwAt,
) -> Result<Option<u64>> {
    Ok(entry.attr(attr)?.and_then(|a| a.udata_value()))
}

fn encoding_kind(encoding: gimli::DwAte) -> TypeKind {
    match encoding {
        gimli::DW_ATE_signed => TypeKind::Signed,
        gimli::DW_ATE_unsigned => TypeKind::Unsigned,
        gimli::DW_ATE_float => TypeKind::Float,
        gimli::DW_ATE_boolean => TypeKind::Bool,
        gimli::DW_ATE_signed_char | gimli::DW_ATE_unsigned_char | gimli::DW_ATE_UTF => {
            TypeKind::Char
        }
        gimli::DW_ATE_address => TypeKind::Pointer,
        _ => TypeKind::Aggregate,
    }
}

fn describe_operation(op: &Operation<GimliReader>) -> String {
    match op {
        Operation::Register { register } => format!("DW_OP_reg{}", register.0),
        Operation::RegisterOffset {
            register, offset, ..
        } => format!("DW_OP_breg{} {offset}", register.0),
        Operation::Piece { .. } => "DW_OP_piece".to_string(),
        Operation::StackValue => "DW_OP_stack_value".to_string(),
        Operation::ImplicitValue { .. } => "DW_OP_implicit_value".to_string(),
        Operation::EntryValue { .. } => "DW_OP_entry_value".to_string(),
        Operation::TLS => "DW_OP_form_tls_address".to_string(),
        other => format!("{other:?}"),
    }
}

/// Sorts the raw line records, drops overlapping ones and merges neighbours on the same line
fn normalize_line_records(mut records: Vec<LineRecord>) -> Vec<LineRecord> {
    records.sort_by_key(|r| r.low);
    let mut normalized: Vec<LineRecord> = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    for record in records {
        if record.low == Addr::NULL {
            dropped += 1;
            continue;
        }
        match normalized.last_mut() {
            Some(last) if record.low < last.high => dropped += 1,
            Some(last) if record.low == last.high && last.same_line(&record) => {
                last.high = record.high
            }
            _ => normalized.push(record),
        }
    }
    if dropped > 0 {
        debug!("dropped {dropped} overlapping or discarded line records");
    }
    normalized
}
