//! A simulated tracee for tests
//!
//! [`SimulatedProcess`] implements [`Tracee`] over a few in-memory regions. Instructions are
//! decoded with iced-x86 so that a single step advances the program counter by exactly one real
//! instruction. Control flow and the frame handling of the sample are simulated: `call` and
//! `ret` go through the stack, `push rbp`, `pop rbp`, `mov rbp, rsp` and `sub rsp, imm` update
//! the registers, `int3` traps like the kernel reports it and `hlt` ends the process. Everything
//! else just falls through to the next instruction.

use std::path::{Path, PathBuf};

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, DebugFrame, EhFrame, EndianVec,
    FrameDescriptionEntry, FrameTable,
};
use gimli::{Encoding, Format, LittleEndian, RunTimeEndian, X86_64};
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, Register as X86Register};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::DebuggerConfig;
use crate::consts::{INT3_BYTE, SI_KERNEL, TRAP_TRACE};
use crate::dbginfo::{DwarfData, Function};
use crate::errors::{DebuggerError, Result};
use crate::linetable::{LineRecord, SourceLineTable};
use crate::memorymap::{MemoryPermissions, MemoryRegion, ProcessMemoryMap};
use crate::scope::{AddrRange, FrameBase, Location, TypeDescriptor, VariableDescriptor, VariableScope};
use crate::tracee::{Resume, Tracee, WaitOutcome};
use crate::unwind::CallFrameInfo;
use crate::{Addr, RegisterSnapshot, Word, WORD_BYTES};

pub const CODE_START: Addr = Addr::new(0x401000);
pub const EH_FRAME_START: Addr = Addr::new(0x402000);
pub const DATA_START: Addr = Addr::new(0x404000);
pub const STACK_START: Addr = Addr::new(0x7ffd0000);
pub const STACK_SIZE: usize = 0x2000;
/// `rbp` of `main` once its prologue ran
pub const FRAME_POINTER: Addr = Addr::new(0x7ffd1000);
/// `rbp` when the program starts, the frame pointer of whoever called `main`
pub const CALLER_FRAME: Addr = Addr::new(0x7ffd1040);
/// Canonical frame address of `helper` when called from `main`
pub const HELPER_CFA: Addr = Addr::new(0x7ffd0fe0);

/// The sample program, x86_64 machine code placed at [`CODE_START`]
///
/// ```text
/// main:    +0x00 push rbp              ; main.c:1
///          +0x01 mov rbp, rsp          ; main.c:1
///          +0x04 sub rsp, 0x20         ; main.c:1
///          +0x08 mov eax, 1            ; main.c:2
///          +0x0d mov eax, 2            ; main.c:2
///          +0x12 call helper           ; main.c:3
///          +0x17 nop                   ; main.c:4
///          +0x18 hlt                   ; main.c:4
///          +0x19 nop * 7               ; no line info
/// helper:  +0x20 push rbp              ; main.c:10
///          +0x21 mov rbp, rsp          ; main.c:10
///          +0x24 nop                   ; main.c:11
///          +0x25 pop rbp               ; main.c:12
///          +0x26 ret                   ; main.c:12
///          +0x27 nop * 9               ; no line info
/// spin:    +0x30 jmp spin              ; main.c:20
/// ```
pub const SAMPLE_CODE: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0x48, 0x83, 0xec, 0x20, // sub rsp, 0x20
    0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
    0xe8, 0x09, 0x00, 0x00, 0x00, // call +0x09
    0x90, // nop
    0xf4, // hlt
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // padding
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0x90, // nop
    0x5d, // pop rbp
    0xc3, // ret
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // padding
    0xeb, 0xfe, // jmp $
];

pub const MAIN: Addr = Addr::new(0x401000);
pub const MAIN_LINE2: Addr = Addr::new(0x401008);
pub const MAIN_LINE2_SECOND: Addr = Addr::new(0x40100d);
pub const MAIN_CALL: Addr = Addr::new(0x401012);
pub const MAIN_AFTER_CALL: Addr = Addr::new(0x401017);
pub const MAIN_END: Addr = Addr::new(0x401019);
pub const HELPER: Addr = Addr::new(0x401020);
pub const HELPER_BODY: Addr = Addr::new(0x401024);
pub const HELPER_END: Addr = Addr::new(0x401027);
pub const SPIN: Addr = Addr::new(0x401030);

/// Value of `count` at `rbp - 8` in `main`
pub const COUNT_VALUE: i32 = 42;
/// Value of the outer `x` at `rbp - 12` in `main`
pub const OUTER_X: i32 = 1;
/// Value of the block local `x` at `rbp - 16` in `main`
pub const INNER_X: i32 = -2;
/// Value of the parameter `a` of `helper`, at its CFA - 0x24
pub const HELPER_ARG: i32 = 3;
/// Value of the global `g_total` at [`DATA_START`]
pub const GLOBAL_TOTAL: u64 = 7;

struct Segment {
    region: MemoryRegion,
    bytes: Vec<u8>,
}

pub struct SimulatedProcess {
    segments: Vec<Segment>,
    regs: RegisterSnapshot,
    pending: Option<(Resume, Option<Signal>)>,
    injected: Option<WaitOutcome>,
    terminated: Option<WaitOutcome>,
    pub exit_code: i32,
    /// how many instructions were executed in total
    pub executed: usize,
}

impl SimulatedProcess {
    /// The sample program stopped at the first instruction of `main`
    ///
    /// The stack already holds the values the locals of `main` and the parameter of `helper`
    /// will have once their frames are set up.
    pub fn sample() -> Self {
        let mut code = SAMPLE_CODE.to_vec();
        code.resize(0x1000, 0x90);

        let mut stack = vec![0u8; STACK_SIZE];
        let frame = FRAME_POINTER - STACK_START;
        stack[frame - 8..frame - 4].copy_from_slice(&COUNT_VALUE.to_le_bytes());
        stack[frame - 12..frame - 8].copy_from_slice(&OUTER_X.to_le_bytes());
        stack[frame - 16..frame - 12].copy_from_slice(&INNER_X.to_le_bytes());
        let arg = HELPER_CFA - STACK_START - 0x24;
        stack[arg..arg + 4].copy_from_slice(&HELPER_ARG.to_le_bytes());

        let mut data = vec![0u8; 0x1000];
        data[..8].copy_from_slice(&GLOBAL_TOTAL.to_le_bytes());

        Self {
            segments: vec![
                Segment {
                    region: MemoryRegion::new(
                        CODE_START,
                        code.len(),
                        MemoryPermissions::code(),
                        Some("/tmp/sample".to_string()),
                    ),
                    bytes: code,
                },
                Segment {
                    region: MemoryRegion::new(
                        DATA_START,
                        data.len(),
                        MemoryPermissions::data(),
                        Some("/tmp/sample".to_string()),
                    ),
                    bytes: data,
                },
                Segment {
                    region: MemoryRegion::new(
                        STACK_START,
                        stack.len(),
                        MemoryPermissions::data(),
                        None,
                    ),
                    bytes: stack,
                },
            ],
            // as if `main` was just called: rsp points to the return address
            regs: RegisterSnapshot {
                pc: MAIN,
                frame_pointer: CALLER_FRAME,
                stack_pointer: FRAME_POINTER + WORD_BYTES,
            },
            pending: None,
            injected: None,
            terminated: None,
            exit_code: 0,
            executed: 0,
        }
    }

    /// Makes the next [`Tracee::wait`] report `outcome` instead of running the program
    pub fn inject(&mut self, outcome: WaitOutcome) {
        self.injected = Some(outcome);
    }

    /// Reads memory without going through the [`Tracee`] interface
    pub fn peek(&self, addr: Addr, len: usize) -> Vec<u8> {
        let seg = self.segment(addr).expect("peek at unmapped memory");
        let start = addr - seg.region.start_address;
        seg.bytes[start..start + len].to_vec()
    }

    fn segment(&self, addr: Addr) -> Option<&Segment> {
        self.segments.iter().find(|s| s.region.contains(addr))
    }

    fn segment_mut(&mut self, addr: Addr) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.region.contains(addr))
    }

    fn fetch(&self, pc: Addr) -> Option<Vec<u8>> {
        let seg = self.segment(pc)?;
        if !seg.region.permissions.execute {
            return None;
        }
        let start = pc - seg.region.start_address;
        let end = (start + 15).min(seg.bytes.len());
        Some(seg.bytes[start..end].to_vec())
    }

    /// Executes one instruction, returns an outcome if it did not simply fall through
    fn execute_one(&mut self) -> Option<WaitOutcome> {
        const FAULT: WaitOutcome = WaitOutcome::Stopped {
            signal: Signal::SIGSEGV,
            code: 1,
        };

        self.executed += 1;
        let pc = self.regs.pc;
        let Some(bytes) = self.fetch(pc) else {
            return Some(FAULT);
        };
        if bytes[0] == INT3_BYTE {
            self.regs.pc = pc + 1;
            return Some(WaitOutcome::Stopped {
                signal: Signal::SIGTRAP,
                code: SI_KERNEL,
            });
        }

        let mut decoder = Decoder::with_ip(64, &bytes, pc.u64(), DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Some(WaitOutcome::Stopped {
                signal: Signal::SIGILL,
                code: 0,
            });
        }
        if instruction.mnemonic() == Mnemonic::Hlt {
            return Some(WaitOutcome::Exited(self.exit_code));
        }

        let next = Addr::from(instruction.next_ip());
        let executed = match instruction.flow_control() {
            FlowControl::Call => self.push(next).map(|()| {
                self.regs.pc = Addr::from(instruction.near_branch_target());
            }),
            FlowControl::UnconditionalBranch => {
                self.regs.pc = Addr::from(instruction.near_branch_target());
                Ok(())
            }
            FlowControl::Return => self.pop().map(|ret| self.regs.pc = ret),
            _ => self.execute_frame_op(&instruction).map(|()| self.regs.pc = next),
        };
        executed.err().map(|_| FAULT)
    }

    /// The instructions of prologues and epilogues, everything else does nothing
    fn execute_frame_op(&mut self, instruction: &Instruction) -> Result<()> {
        let op0 = instruction.op0_register();
        match instruction.mnemonic() {
            Mnemonic::Push if op0 == X86Register::RBP => self.push(self.regs.frame_pointer),
            Mnemonic::Pop if op0 == X86Register::RBP => {
                self.regs.frame_pointer = self.pop()?;
                Ok(())
            }
            Mnemonic::Mov
                if op0 == X86Register::RBP && instruction.op1_register() == X86Register::RSP =>
            {
                self.regs.frame_pointer = self.regs.stack_pointer;
                Ok(())
            }
            Mnemonic::Sub if op0 == X86Register::RSP => {
                // only `sub rsp, imm` occurs, a register operand is ignored
                let imm = instruction.try_immediate(1).unwrap_or(0);
                self.regs.stack_pointer -= imm as usize;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn push(&mut self, value: Addr) -> Result<()> {
        let sp = self.regs.stack_pointer - WORD_BYTES;
        self.write_word(sp, value.u64() as Word)?;
        self.regs.stack_pointer = sp;
        Ok(())
    }

    fn pop(&mut self) -> Result<Addr> {
        let value = self.read_word(self.regs.stack_pointer)?;
        self.regs.stack_pointer += WORD_BYTES;
        Ok(Addr::from(value as u64))
    }

    fn finish(&mut self, outcome: WaitOutcome) -> WaitOutcome {
        if outcome.is_terminal() {
            self.terminated = Some(outcome);
        }
        outcome
    }
}

impl Tracee for SimulatedProcess {
    fn spawn(path: &Path, _args: &[String], _config: &DebuggerConfig) -> Result<Self> {
        Err(DebuggerError::Launch(format!(
            "a simulated process can not start {}",
            path.display()
        )))
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(4242)
    }

    fn read_word(&mut self, addr: Addr) -> Result<Word> {
        let mut buf = [0u8; WORD_BYTES];
        if self.read_bytes(addr, &mut buf)? != WORD_BYTES {
            return Err(DebuggerError::AccessError(addr));
        }
        Ok(Word::from_le_bytes(buf))
    }

    fn write_word(&mut self, addr: Addr, word: Word) -> Result<()> {
        if self.write_bytes(addr, &word.to_le_bytes())? != WORD_BYTES {
            return Err(DebuggerError::AccessError(addr));
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        let seg = self.segment(addr).ok_or(DebuggerError::AccessError(addr))?;
        let start = addr - seg.region.start_address;
        let len = buf.len().min(seg.bytes.len() - start);
        buf[..len].copy_from_slice(&seg.bytes[start..start + len]);
        Ok(len)
    }

    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        let seg = self
            .segment_mut(addr)
            .ok_or(DebuggerError::AccessError(addr))?;
        let start = addr - seg.region.start_address;
        let len = data.len().min(seg.bytes.len() - start);
        seg.bytes[start..start + len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn registers(&self) -> Result<RegisterSnapshot> {
        Ok(self.regs)
    }

    fn set_pc(&mut self, pc: Addr) -> Result<()> {
        self.regs.pc = pc;
        Ok(())
    }

    fn resume(&mut self, mode: Resume, signal: Option<Signal>) -> Result<()> {
        if self.terminated.is_some() {
            return Err(DebuggerError::Os(nix::Error::ESRCH));
        }
        self.pending = Some((mode, signal));
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitOutcome> {
        if let Some(outcome) = self.injected.take() {
            self.pending = None;
            return Ok(self.finish(outcome));
        }
        let (mode, signal) = self.pending.take().ok_or(DebuggerError::Os(nix::Error::ECHILD))?;

        // the default action of every signal the tests deliver is to terminate
        if let Some(sig) = signal {
            return Ok(self.finish(WaitOutcome::Signaled(sig)));
        }

        let outcome = match mode {
            Resume::Step => self.execute_one().unwrap_or(WaitOutcome::Stopped {
                signal: Signal::SIGTRAP,
                code: TRAP_TRACE,
            }),
            Resume::Continue => {
                let mut outcome = None;
                for _ in 0..100_000 {
                    outcome = self.execute_one();
                    if outcome.is_some() {
                        break;
                    }
                }
                outcome.unwrap_or(WaitOutcome::Stopped {
                    signal: Signal::SIGSTOP,
                    code: 0,
                })
            }
        };
        Ok(self.finish(outcome))
    }

    fn interrupt(&mut self) -> Result<()> {
        self.injected = Some(WaitOutcome::Stopped {
            signal: Signal::SIGSTOP,
            code: 0,
        });
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.terminated = Some(WaitOutcome::Signaled(Signal::SIGKILL));
        Ok(())
    }

    fn memory_map(&self) -> Result<ProcessMemoryMap> {
        Ok(ProcessMemoryMap::from_regions(
            self.segments.iter().map(|s| s.region.clone()).collect(),
        ))
    }
}

/// Unwind information for [`SAMPLE_CODE`], as a compiler emits it for frame pointer prologues
fn sample_frame_table() -> FrameTable {
    let encoding = Encoding {
        address_size: WORD_BYTES as u8,
        format: Format::Dwarf32,
        version: 1,
    };
    let mut cie = CommonInformationEntry::new(encoding, 1, -8, X86_64::RA);
    cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
    cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));

    let mut table = FrameTable::default();
    let cie = table.add_cie(cie);

    let frame_setup = |start: Addr, end: Addr| {
        let mut fde = FrameDescriptionEntry::new(Address::Constant(start.u64()), (end - start) as u32);
        // after `push rbp`
        fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
        fde.add_instruction(1, CallFrameInstruction::Offset(X86_64::RBP, -16));
        // after `mov rbp, rsp`
        fde.add_instruction(4, CallFrameInstruction::CfaRegister(X86_64::RBP));
        fde
    };

    table.add_fde(cie, frame_setup(MAIN, MAIN_END));
    let mut helper = frame_setup(HELPER, HELPER_END);
    // after `pop rbp`
    helper.add_instruction(6, CallFrameInstruction::Cfa(X86_64::RSP, 8));
    table.add_fde(cie, helper);
    table.add_fde(
        cie,
        FrameDescriptionEntry::new(Address::Constant(SPIN.u64()), 2),
    );
    table
}

/// [`sample_frame_table`] as `.eh_frame`
pub fn sample_cfi() -> CallFrameInfo {
    let mut eh_frame = EhFrame(EndianVec::new(LittleEndian));
    sample_frame_table()
        .write_eh_frame(&mut eh_frame)
        .expect("sample frame table can be written");
    CallFrameInfo::new(RunTimeEndian::Little)
        .with_eh_frame(EH_FRAME_START, eh_frame.0.into_vec())
        .with_text(CODE_START)
}

/// [`sample_frame_table`] as `.debug_frame`
pub fn sample_debug_frame_cfi() -> CallFrameInfo {
    let mut debug_frame = DebugFrame(EndianVec::new(LittleEndian));
    sample_frame_table()
        .write_debug_frame(&mut debug_frame)
        .expect("sample frame table can be written");
    CallFrameInfo::new(RunTimeEndian::Little)
        .with_debug_frame(Addr::NULL, debug_frame.0.into_vec())
        .with_text(CODE_START)
}

/// Debug info describing [`SAMPLE_CODE`]
///
/// `main` declares `count` and `x`, and has an inner block covering line 2 that declares
/// another `x`. Its frame base is `rbp`. `helper` has the parameter `a` and uses the CFA as frame
/// base. There is one global, `g_total`. Unwind information comes from [`sample_cfi`].
pub fn sample_dwarf() -> DwarfData {
    let int = TypeDescriptor::signed("int", 4);
    let lines = SourceLineTable::new(
        vec![PathBuf::from("main.c")],
        vec![
            LineRecord::new(MAIN, MAIN_LINE2, 0, 1),
            LineRecord::new(MAIN_LINE2, MAIN_CALL, 0, 2),
            LineRecord::new(MAIN_CALL, MAIN_AFTER_CALL, 0, 3),
            LineRecord::new(MAIN_AFTER_CALL, MAIN_END, 0, 4),
            LineRecord::new(HELPER, HELPER_BODY, 0, 10),
            LineRecord::new(HELPER_BODY, HELPER_BODY + 1, 0, 11),
            LineRecord::new(HELPER_BODY + 1, HELPER_END, 0, 12),
            LineRecord::new(SPIN, SPIN + 2, 0, 20),
        ],
    )
    .expect("sample line table is well formed");

    let main_scope = VariableScope::new(vec![AddrRange::new(MAIN, MAIN_END)])
        .with_variable(VariableDescriptor::new(
            "count",
            int.clone(),
            Location::FrameBaseOffset(-8),
        ))
        .with_variable(VariableDescriptor::new(
            "x",
            int.clone(),
            Location::FrameBaseOffset(-12),
        ))
        .with_variable(VariableDescriptor::new(
            "weird",
            int.clone(),
            Location::Unsupported("DW_OP_piece".to_string()),
        ))
        .with_child(
            VariableScope::new(vec![AddrRange::new(MAIN_LINE2, MAIN_CALL)]).with_variable(
                VariableDescriptor::new("x", int.clone(), Location::FrameBaseOffset(-16)),
            ),
        );

    let helper_scope = VariableScope::new(vec![AddrRange::new(HELPER, HELPER_END)])
        .with_variable(VariableDescriptor::new(
            "a",
            int.clone(),
            Location::FrameBaseOffset(-0x24),
        ));

    let functions = vec![
        Function::new(
            "main",
            vec![AddrRange::new(MAIN, MAIN_END)],
            FrameBase::Register(crate::Register::rbp),
            main_scope,
        )
        .with_decl(0, 1),
        Function::new(
            "helper",
            vec![AddrRange::new(HELPER, HELPER_END)],
            FrameBase::CallFrameCfa,
            helper_scope,
        )
        .with_decl(0, 10),
        Function::new(
            "spin",
            vec![AddrRange::new(SPIN, SPIN + 2)],
            FrameBase::CallFrameCfa,
            VariableScope::new(vec![AddrRange::new(SPIN, SPIN + 2)]),
        )
        .with_decl(0, 20),
    ];

    let globals = vec![VariableDescriptor::new(
        "g_total",
        TypeDescriptor::unsigned("unsigned long", 8),
        Location::Address(DATA_START),
    )];

    DwarfData::new(lines, functions, globals)
        .expect("sample debug info is well formed")
        .with_call_frame_info(sample_cfi())
}
