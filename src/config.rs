//! # Configuration
//!
//! Session wide settings. The binaries fill a [`DebuggerConfig`] from their command line
//! arguments, library users start from [`DebuggerConfig::default`].

use std::path::PathBuf;

/// Default ceiling for the number of instructions one line step may execute
pub const DEFAULT_MAX_STEPS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerConfig {
    /// How many single steps a line step may take before giving up with
    /// [`NoLineInfo`](crate::errors::DebuggerError::NoLineInfo)
    pub max_steps: usize,
    /// Launch the debuggee with address space layout randomization turned off
    pub disable_aslr: bool,
    /// Directories searched by file name when a source path from the debug info does not exist
    pub source_dirs: Vec<PathBuf>,
    /// Print the source line whenever the debuggee stops
    pub show_source_on_stop: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            disable_aslr: true,
            source_dirs: Vec::new(),
            show_source_on_stop: true,
        }
    }
}
