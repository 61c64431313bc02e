//! # Memory Map Module
//!
//! Provides functionality for analyzing memory maps of debugged processes.
//!
//! The memory map decides two things for the debugger: whether an address may carry a
//! breakpoint (it must lie in a mapped, executable region) and where a position independent
//! executable was loaded (the first mapping of the executable file).
//!
//! The memory map information is extracted from the `/proc/<pid>/maps` file using the
//! [`proc_maps`] crate and provides a structured way to analyze process memory regions.

use std::fmt::{self, Display};
use std::path::Path;

use serde::Serialize;

use crate::addr::Addr;

/// Represents a single region in a process's memory map
///
/// Each region corresponds to a line in the `/proc/<pid>/maps` file and represents
/// a contiguous range of memory with specific access permissions and backing.
///
/// # Examples
///
/// ```
/// use deet::memorymap::MemoryRegion;
/// use deet::memorymap::MemoryPermissions;
/// use deet::addr::Addr;
///
/// let region = MemoryRegion::new(
///     Addr::from(0x7f000000usize),
///     0x1000,
///     MemoryPermissions::code(),
///     Some("/lib/libc.so.6".to_string()),
/// );
///
/// assert_eq!(region.size, 0x1000);
/// assert!(region.contains(Addr::from(0x7f000fffusize)));
/// assert!(!region.contains(Addr::from(0x7f001000usize)));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRegion {
    /// Starting address of the memory region
    pub start_address: Addr,
    /// End address of the memory region (exclusive)
    pub end_address: Addr,
    /// Size of the memory region in bytes
    pub size: usize,
    /// Access permissions for the memory region
    pub permissions: MemoryPermissions,
    /// Offset within the mapped file (if any)
    pub offset: usize,
    /// Path to the mapped file, if any
    pub path: Option<String>,
}

/// Represents a memory region's access permissions
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MemoryPermissions {
    /// Read permission
    pub read: bool,
    /// Write permission
    pub write: bool,
    /// Execute permission
    pub execute: bool,
    /// Whether the memory is private (copy on write) rather than shared
    pub private: bool,
}

impl MemoryPermissions {
    /// `r-xp`, what a text segment is mapped with
    pub fn code() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
            private: true,
        }
    }

    /// `rw-p`, what data, heap and stack are mapped with
    pub fn data() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
            private: true,
        }
    }
}

impl MemoryRegion {
    pub fn new(
        start_address: Addr,
        size: usize,
        permissions: MemoryPermissions,
        path: Option<String>,
    ) -> Self {
        Self {
            start_address,
            end_address: start_address + size,
            size,
            permissions,
            offset: 0,
            path,
        }
    }

    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start_address <= addr && addr < self.end_address
    }
}

/// Represents the complete memory map of a debugged process
///
/// A `ProcessMemoryMap` contains a collection of memory regions and summary statistics
/// about the process's memory usage.
///
/// # Examples
///
/// ```no_run
/// use deet::memorymap::ProcessMemoryMap;
/// use proc_maps::get_process_maps;
///
/// // Get the memory map for the current process
/// let maps = get_process_maps(std::process::id() as i32).unwrap();
/// let memory_map = ProcessMemoryMap::from(maps);
///
/// println!("Total mapped memory: {} bytes", memory_map.total_mapped);
/// println!("Executable regions: {}", memory_map.executable_regions);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMemoryMap {
    /// List of memory regions in the process
    pub regions: Vec<MemoryRegion>,
    /// Total amount of mapped memory in bytes
    pub total_mapped: usize,
    /// Number of executable memory regions
    pub executable_regions: usize,
    /// Number of writable memory regions
    pub writable_regions: usize,
}

impl ProcessMemoryMap {
    /// Builds a map from already parsed regions and computes the summary statistics
    pub fn from_regions(regions: Vec<MemoryRegion>) -> Self {
        let total_mapped = regions.iter().map(|r| r.size).sum();
        let executable_regions = regions.iter().filter(|r| r.permissions.execute).count();
        let writable_regions = regions.iter().filter(|r| r.permissions.write).count();

        ProcessMemoryMap {
            regions,
            total_mapped,
            executable_regions,
            writable_regions,
        }
    }

    /// Finds the region containing `addr`
    pub fn region_containing(&self, addr: Addr) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Returns true if `addr` lies in a mapped region that may be executed
    pub fn is_executable(&self, addr: Addr) -> bool {
        self.region_containing(addr)
            .is_some_and(|r| r.permissions.execute)
    }

    /// Start of the lowest mapping backed by `path`
    ///
    /// For a position independent executable this is the load bias that has to be added to
    /// the addresses in its debug info.
    pub fn load_base_of(&self, path: &Path) -> Option<Addr> {
        let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.regions
            .iter()
            .filter(|r| r.path.as_deref().is_some_and(|p| Path::new(p) == wanted))
            .map(|r| r.start_address)
            .min()
    }
}

impl From<Vec<proc_maps::MapRange>> for ProcessMemoryMap {
    fn from(ranges: Vec<proc_maps::MapRange>) -> Self {
        let regions: Vec<MemoryRegion> = ranges
            .iter()
            .map(|range| {
                let start = range.start();
                let size = range.size();

                // the 4th char of the flags is 'p' for private and 's' for shared
                let is_private = range.flags.len() >= 4 && &range.flags[3..4] == "p";

                MemoryRegion {
                    start_address: Addr::from(start),
                    end_address: Addr::from(start + size),
                    size,
                    permissions: MemoryPermissions {
                        read: range.is_read(),
                        write: range.is_write(),
                        execute: range.is_exec(),
                        private: is_private,
                    },
                    offset: range.offset,
                    path: range.filename().map(|p| p.to_string_lossy().to_string()),
                }
            })
            .collect();

        Self::from_regions(regions)
    }
}

impl Display for ProcessMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total regions: {}", self.regions.len())?;
        writeln!(f, "Total mapped: {} bytes", self.total_mapped)?;

        for (i, region) in self.regions.iter().enumerate() {
            let perm_str = format!(
                "{}{}{}{}",
                if region.permissions.read { "r" } else { "-" },
                if region.permissions.write { "w" } else { "-" },
                if region.permissions.execute { "x" } else { "-" },
                if region.permissions.private { "p" } else { "s" },
            );

            writeln!(
                f,
                "#{}: {:016x}-{:016x} {} ({} bytes) {}",
                i,
                region.start_address.usize(),
                region.end_address.usize(),
                perm_str,
                region.size,
                region.path.as_deref().unwrap_or("[anonymous]")
            )?;
        }

        Ok(())
    }
}
