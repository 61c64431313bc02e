//! # Line Table Module
//!
//! Maps addresses to source lines and back.
//!
//! A [`SourceLineTable`] is a list of [`LineRecord`]s, each covering the half open address range
//! `[low, high)`. The records are validated once when the table is built: every range is non
//! empty, the records are sorted by `low` and no two records overlap. Lookups are a binary search
//! and rely on that.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{DebuggerError, Result};
use crate::Addr;

/// One row of the line table: the code in `[low, high)` belongs to `line` of `file`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub low: Addr,
    pub high: Addr,
    /// index into [`SourceLineTable::files`]
    pub file: usize,
    pub line: u64,
}

impl LineRecord {
    pub fn new(low: Addr, high: Addr, file: usize, line: u64) -> Self {
        Self {
            low,
            high,
            file,
            line,
        }
    }

    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.low <= addr && addr < self.high
    }

    /// Both records describe the same source line
    #[inline]
    pub fn same_line(&self, other: &LineRecord) -> bool {
        self.file == other.file && self.line == other.line
    }
}

/// A resolved source position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u64,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLineTable {
    files: Vec<PathBuf>,
    records: Vec<LineRecord>,
}

impl SourceLineTable {
    /// Builds a table from its file list and records
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::MalformedDebugInfo`] if a record has an empty range, refers
    /// to a file that is not in `files`, or if the records are not strictly sorted and
    /// non-overlapping.
    pub fn new(files: Vec<PathBuf>, records: Vec<LineRecord>) -> Result<Self> {
        for (idx, record) in records.iter().enumerate() {
            if record.low >= record.high {
                return Err(DebuggerError::MalformedDebugInfo(format!(
                    "line record {idx} has an empty range [{}, {})",
                    record.low, record.high
                )));
            }
            if record.file >= files.len() {
                return Err(DebuggerError::MalformedDebugInfo(format!(
                    "line record {idx} refers to file {} but there are only {} files",
                    record.file,
                    files.len()
                )));
            }
        }
        for (idx, pair) in records.windows(2).enumerate() {
            if pair[0].high > pair[1].low {
                return Err(DebuggerError::MalformedDebugInfo(format!(
                    "line records {idx} and {} are unsorted or overlap: [{}, {}) and [{}, {})",
                    idx + 1,
                    pair[0].low,
                    pair[0].high,
                    pair[1].low,
                    pair[1].high
                )));
            }
        }
        Ok(Self { files, records })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn records(&self) -> &[LineRecord] {
        &self.records
    }

    pub fn file(&self, id: usize) -> Option<&Path> {
        self.files.get(id).map(PathBuf::as_path)
    }

    /// Finds the record whose range contains `addr`
    ///
    /// Returns [`None`] if `addr` lies in a gap, for example in code without debug info.
    pub fn lookup(&self, addr: Addr) -> Option<&LineRecord> {
        // index of the first record with low > addr, the candidate is right before it
        let idx = self.records.partition_point(|r| r.low <= addr);
        let candidate = self.records.get(idx.checked_sub(1)?)?;
        candidate.contains(addr).then_some(candidate)
    }

    /// Like [`SourceLineTable::lookup`], with the file id resolved to its path
    pub fn location(&self, addr: Addr) -> Option<SourceLocation> {
        let record = self.lookup(addr)?;
        Some(SourceLocation {
            file: self.file(record.file)?.to_path_buf(),
            line: record.line,
        })
    }

    /// Finds the id of a file either by its full path or by its file name
    pub fn find_file(&self, name: &str) -> Option<usize> {
        let wanted = Path::new(name);
        self.files
            .iter()
            .position(|f| f == wanted)
            .or_else(|| self.files.iter().position(|f| f.ends_with(wanted)))
            .or_else(|| {
                self.files
                    .iter()
                    .position(|f| f.file_name() == wanted.file_name())
            })
    }

    /// The lowest address of `line` in `file`
    ///
    /// If `line` has no code, the next line after it that does is used, like a breakpoint on a
    /// blank line or a comment would be placed. Without a file the first file of the table is
    /// searched.
    pub fn address_for_line(&self, file: Option<usize>, line: u64) -> Option<Addr> {
        let file = file.unwrap_or(0);
        let best_line = self
            .records
            .iter()
            .filter(|r| r.file == file && r.line >= line)
            .map(|r| r.line)
            .min()?;
        self.records
            .iter()
            .filter(|r| r.file == file && r.line == best_line)
            .map(|r| r.low)
            .min()
    }

    /// The first address in `[low, high)` that is on a different line than `low`
    ///
    /// For a function this skips the prologue. Falls back to `low` if the range has no line info
    /// or only a single line.
    pub fn function_body_start(&self, low: Addr, high: Addr) -> Addr {
        let Some(first) = self.lookup(low) else {
            return low;
        };
        let start = self.records.partition_point(|r| r.high <= low);
        self.records[start..]
            .iter()
            .take_while(|r| r.low < high)
            .find(|r| !r.same_line(first))
            .map(|r| r.low.max(low))
            .unwrap_or(low)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(raw: usize) -> Addr {
        Addr::from(raw)
    }

    fn table() -> SourceLineTable {
        SourceLineTable::new(
            vec![PathBuf::from("/src/main.c"), PathBuf::from("/src/util.c")],
            vec![
                LineRecord::new(addr(0x1000), addr(0x1004), 0, 1),
                LineRecord::new(addr(0x1004), addr(0x1010), 0, 2),
                // gap from 0x1010 to 0x1020
                LineRecord::new(addr(0x1020), addr(0x1028), 0, 5),
                LineRecord::new(addr(0x1028), addr(0x1030), 0, 2),
                LineRecord::new(addr(0x2000), addr(0x2008), 1, 7),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_is_uniform_inside_a_range() {
        let table = table();
        for raw in 0x1004..0x1010 {
            let record = table.lookup(addr(raw)).unwrap();
            assert_eq!((record.file, record.line), (0, 2));
        }
        // low is inclusive, high is exclusive
        assert_eq!(table.lookup(addr(0x1000)).unwrap().line, 1);
        assert_eq!(table.lookup(addr(0x1003)).unwrap().line, 1);
        assert_eq!(table.lookup(addr(0x1004)).unwrap().line, 2);
    }

    #[test]
    fn test_lookup_gaps() {
        let table = table();
        assert!(table.lookup(addr(0xfff)).is_none());
        assert!(table.lookup(addr(0x1010)).is_none());
        assert!(table.lookup(addr(0x101f)).is_none());
        assert!(table.lookup(addr(0x1030)).is_none());
        assert!(table.lookup(addr(0x9999)).is_none());
        assert!(SourceLineTable::empty().lookup(addr(0x1000)).is_none());
    }

    #[test]
    fn test_location_display() {
        let table = table();
        let loc = table.location(addr(0x2004)).unwrap();
        assert_eq!(loc.to_string(), "/src/util.c:7");
    }

    #[test]
    fn test_rejects_overlap() {
        let err = SourceLineTable::new(
            vec![PathBuf::from("a.c")],
            vec![
                LineRecord::new(addr(0x10), addr(0x20), 0, 1),
                LineRecord::new(addr(0x18), addr(0x30), 0, 2),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, DebuggerError::MalformedDebugInfo(_)));
    }

    #[test]
    fn test_rejects_unsorted_empty_and_bad_file() {
        let files = vec![PathBuf::from("a.c")];
        assert!(SourceLineTable::new(
            files.clone(),
            vec![
                LineRecord::new(addr(0x20), addr(0x30), 0, 2),
                LineRecord::new(addr(0x10), addr(0x18), 0, 1),
            ],
        )
        .is_err());
        assert!(SourceLineTable::new(
            files.clone(),
            vec![LineRecord::new(addr(0x20), addr(0x20), 0, 2)],
        )
        .is_err());
        assert!(SourceLineTable::new(files, vec![LineRecord::new(addr(0x20), addr(0x28), 3, 2)])
            .is_err());
    }

    #[test]
    fn test_address_for_line() {
        let table = table();
        // line 2 has two ranges, the lower one wins
        assert_eq!(table.address_for_line(None, 2), Some(addr(0x1004)));
        // no code on line 3 or 4, the next line with code is 5
        assert_eq!(table.address_for_line(Some(0), 3), Some(addr(0x1020)));
        assert_eq!(table.address_for_line(Some(1), 7), Some(addr(0x2000)));
        assert_eq!(table.address_for_line(Some(1), 8), None);
    }

    #[test]
    fn test_find_file() {
        let table = table();
        assert_eq!(table.find_file("/src/util.c"), Some(1));
        assert_eq!(table.find_file("main.c"), Some(0));
        assert_eq!(table.find_file("src/util.c"), Some(1));
        assert_eq!(table.find_file("other.c"), None);
    }

    #[test]
    fn test_function_body_start() {
        let table = table();
        assert_eq!(table.function_body_start(addr(0x1000), addr(0x1010)), addr(0x1004));
        // a single line function keeps its entry
        assert_eq!(table.function_body_start(addr(0x2000), addr(0x2008)), addr(0x2000));
        // no line info at all
        assert_eq!(table.function_body_start(addr(0x3000), addr(0x3010)), addr(0x3000));
    }
}
