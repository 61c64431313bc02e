//! Thanks to the BugStalker debugger, which has written down these constants in a convenient
//! way. They are deeply nested into the libc, and not available from nix or the rust bindings of
//! the libc
//!
//! Source: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>
//!
//! The inferior uses them to tell a trap of an `int3` apart from the trap that ends a single step.

/// Sent by the kernel from somewhere, `int3` traps on x86_64 arrive with this code
pub const SI_KERNEL: i32 = 0x80;

// ---------------- SIGTRAP si_codes ---------------------------------------------------------------

/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap, what a finished `PTRACE_SINGLESTEP` reports
pub const TRAP_TRACE: i32 = 0x2;

/// The instruction byte of `int3`
pub const INT3_BYTE: u8 = 0xcc;

/// Returns true if a `SIGTRAP` with this si_code was raised by executing a trap instruction
#[inline]
pub fn is_software_trap(si_code: i32) -> bool {
    si_code == SI_KERNEL || si_code == TRAP_BRKPT
}
