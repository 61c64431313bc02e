//! # Source Module
//!
//! Reads source files named by the debug info and hands out single lines of them.
//!
//! Paths recorded by the compiler do not always exist where the debugger runs (the program may
//! have been built elsewhere). If a path does not exist, each of the configured source
//! directories is searched for a file with the same file name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::errors::{DebuggerError, Result};
use crate::linetable::SourceLineTable;
use crate::Addr;

/// Prints source lines, keeping every file it read in memory
#[derive(Debug, Clone, Default)]
pub struct SourcePrinter {
    source_dirs: Vec<PathBuf>,
    cache: HashMap<PathBuf, Vec<String>>,
}

impl SourcePrinter {
    pub fn new(source_dirs: Vec<PathBuf>) -> Self {
        Self {
            source_dirs,
            cache: HashMap::new(),
        }
    }

    fn locate(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        let name = path.file_name()?;
        self.source_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn lines_of(&mut self, path: &Path) -> Result<&[String]> {
        if !self.cache.contains_key(path) {
            let found = self
                .locate(path)
                .ok_or_else(|| DebuggerError::SourceFileUnavailable(path.to_path_buf()))?;
            let raw = std::fs::read(&found).map_err(|e| {
                debug!("could not read {}: {e}", found.display());
                DebuggerError::SourceFileUnavailable(path.to_path_buf())
            })?;
            let lines: Vec<String> = String::from_utf8_lossy(&raw)
                .lines()
                .map(str::to_string)
                .collect();
            trace!("read {} lines from {}", lines.len(), found.display());
            self.cache.insert(path.to_path_buf(), lines);
        }
        Ok(self.cache.get(path).map(Vec::as_slice).unwrap_or_default())
    }

    /// The text of line `line` (counting from 1) of `path`, without the line ending
    ///
    /// # Errors
    ///
    /// [`DebuggerError::SourceFileUnavailable`] if the file can not be found or read,
    /// [`DebuggerError::NoSuchSourceLine`] if it is shorter than `line`.
    pub fn source_line(&mut self, path: &Path, line: u64) -> Result<String> {
        let lines = self.lines_of(path)?;
        line.checked_sub(1)
            .and_then(|idx| lines.get(idx as usize))
            .cloned()
            .ok_or_else(|| DebuggerError::NoSuchSourceLine {
                file: path.to_path_buf(),
                line,
            })
    }

    /// Lines `line - radius` to `line + radius`, clipped to the file, with their numbers
    pub fn source_window(
        &mut self,
        path: &Path,
        line: u64,
        radius: u64,
    ) -> Result<Vec<(u64, String)>> {
        let lines = self.lines_of(path)?;
        if line == 0 || line as usize > lines.len() {
            return Err(DebuggerError::NoSuchSourceLine {
                file: path.to_path_buf(),
                line,
            });
        }
        let first = line.saturating_sub(radius).max(1);
        let last = (line + radius).min(lines.len() as u64);
        Ok((first..=last)
            .map(|n| (n, lines[n as usize - 1].clone()))
            .collect())
    }

    /// The source line that the debug-info address `pc` belongs to
    ///
    /// # Errors
    ///
    /// [`DebuggerError::NoLineInfo`] if `pc` is not covered by the line table, otherwise the
    /// errors of [`SourcePrinter::source_line`].
    pub fn print_source_at(&mut self, lines: &SourceLineTable, pc: Addr) -> Result<String> {
        let location = lines.location(pc).ok_or(DebuggerError::NoLineInfo(pc))?;
        self.source_line(&location.file, location.line)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::linetable::LineRecord;

    const SOURCE: &str = "int main() {\n    int count = 42;\r\n    return count;\n}\n";

    fn source_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".c").tempfile().unwrap();
        file.write_all(SOURCE.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_source_line_is_exact() {
        let file = source_file();
        let mut printer = SourcePrinter::default();
        assert_eq!(printer.source_line(file.path(), 1).unwrap(), "int main() {");
        // the carriage return is part of the line ending
        assert_eq!(
            printer.source_line(file.path(), 2).unwrap(),
            "    int count = 42;"
        );
        assert_eq!(printer.source_line(file.path(), 4).unwrap(), "}");
    }

    #[test]
    fn test_line_out_of_range() {
        let file = source_file();
        let mut printer = SourcePrinter::default();
        for line in [0, 5, 1000] {
            assert!(matches!(
                printer.source_line(file.path(), line),
                Err(DebuggerError::NoSuchSourceLine { line: l, .. }) if l == line
            ));
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut printer = SourcePrinter::default();
        let path = dir.path().join("gone.c");
        assert!(matches!(
            printer.source_line(&path, 1),
            Err(DebuggerError::SourceFileUnavailable(p)) if p == path
        ));
    }

    #[test]
    fn test_falls_back_to_source_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.c"), SOURCE).unwrap();
        let mut printer = SourcePrinter::new(vec![dir.path().to_path_buf()]);
        let recorded = Path::new("/build/somewhere/else/main.c");
        assert_eq!(printer.source_line(recorded, 3).unwrap(), "    return count;");
    }

    #[test]
    fn test_cached_after_first_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.c");
        std::fs::write(&path, SOURCE).unwrap();
        let mut printer = SourcePrinter::default();
        assert_eq!(printer.source_line(&path, 4).unwrap(), "}");
        std::fs::remove_file(&path).unwrap();
        assert_eq!(printer.source_line(&path, 1).unwrap(), "int main() {");
    }

    #[test]
    fn test_window_is_clipped() {
        let file = source_file();
        let mut printer = SourcePrinter::default();
        let window = printer.source_window(file.path(), 1, 2).unwrap();
        assert_eq!(
            window.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let window = printer.source_window(file.path(), 4, 1).unwrap();
        assert_eq!(window.last().unwrap(), &(4, "}".to_string()));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_print_source_at() {
        let file = source_file();
        let base = Addr::from(0x401000usize);
        let lines = SourceLineTable::new(
            vec![file.path().to_path_buf()],
            vec![
                LineRecord::new(base, base + 4, 0, 1),
                LineRecord::new(base + 4, base + 0x10, 0, 2),
            ],
        )
        .unwrap();
        let mut printer = SourcePrinter::default();
        assert_eq!(
            printer.print_source_at(&lines, base + 8).unwrap(),
            "    int count = 42;"
        );
        assert!(matches!(
            printer.print_source_at(&lines, base + 0x10),
            Err(DebuggerError::NoLineInfo(_))
        ));
    }
}
