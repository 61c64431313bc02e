//! An interactive prompt
//!
//! Lines are split like a shell would with `shlex`, the first word is the command. An empty line
//! repeats the last command, which makes stepping through a program a matter of pressing enter.
//! The history is kept in a file across sessions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use dialoguer::{BasicHistory, History, Input};
use tracing::{trace, warn};

use super::{parse_addr, BreakpointSpec, DebuggerUI, Status};
use crate::errors::{DebuggerError, Result};
use crate::feedback::Feedback;

const PROMPT: &str = "(deet)";
const HISTORY_FILE: &str = ".deet_history";
const HISTORY_ENTRIES: usize = 500;
const DEFAULT_READ_LEN: usize = 16;
const DEFAULT_DISAS_LEN: usize = 32;
const DEFAULT_LIST_RADIUS: u64 = 5;

const HELP: &str = "\
Commands:
  r, run [ARGS..]              start the program
  c, cont, continue            continue until the next breakpoint
  n, next, s, step             step to the next source line
  si, stepi                    execute a single instruction
  b, break LOCATION            set a breakpoint at *ADDR, LINE, FILE:LINE or FUNCTION
  d, delete LOCATION|ID        remove a breakpoint
  enable LOCATION|ID           enable a breakpoint
  disable LOCATION|ID          disable a breakpoint
  info breakpoints, ib         list breakpoints
  bt, back, backtrace          show the call stack
  p, print NAME                print a variable
  l, list [RADIUS]             show the source around the current line
  regs, registers              show the registers
  x ADDR [LEN]                 read memory
  w, write ADDR WORD           write a word to memory
  disas [ADDR] [LEN] [--literal]
                               disassemble at ADDR or the program counter
  k, kill                      kill the program
  q, quit, exit                leave the debugger";

/// Prompt history that is appended to a file
///
/// Dialoguer's [`BasicHistory`] only lives in memory, this wraps one and writes every new entry to
/// the history file as well.
struct FileHistory {
    entries: BasicHistory,
    path: Option<PathBuf>,
}

impl FileHistory {
    fn load(path: Option<PathBuf>) -> Self {
        let mut entries = BasicHistory::new()
            .max_entries(HISTORY_ENTRIES)
            .no_duplicates(true);
        if let Some(content) = path.as_ref().and_then(|p| std::fs::read_to_string(p).ok()) {
            let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
            let skip = lines.len().saturating_sub(HISTORY_ENTRIES);
            for line in lines.into_iter().skip(skip) {
                History::<String>::write(&mut entries, &line.to_string());
            }
        }
        Self { entries, path }
    }
}

impl History<String> for FileHistory {
    fn read(&self, pos: usize) -> Option<String> {
        History::<String>::read(&self.entries, pos)
    }

    fn write(&mut self, val: &String) {
        History::<String>::write(&mut self.entries, val);
        let Some(path) = &self.path else {
            return;
        };
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{val}"));
        if let Err(e) = res {
            warn!("could not save history to {}: {e}", path.display());
        }
    }
}

pub struct CliUi {
    history: FileHistory,
    last: Option<Status>,
}

impl CliUi {
    /// Sets up the prompt, with the history in `~/.deet_history` if there is a home directory
    pub fn build() -> Result<Self> {
        let path = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HISTORY_FILE));
        Ok(CliUi {
            history: FileHistory::load(path),
            last: None,
        })
    }

    fn get_line(&mut self) -> Result<String> {
        let line: String = Input::new()
            .with_prompt(PROMPT)
            .allow_empty(true)
            .history_with(&mut self.history)
            .interact_text()?;
        trace!("read line: {line:?}");
        Ok(line)
    }
}

impl DebuggerUI for CliUi {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        match &feedback {
            Feedback::Ok => (),
            Feedback::Error(e) => eprintln!("Error: {e}"),
            other => println!("{other}"),
        }

        loop {
            let line = self.get_line()?;
            if line.trim().is_empty() {
                match &self.last {
                    Some(last) => return Ok(last.clone()),
                    None => continue,
                }
            }
            let Some(tokens) = shlex::split(&line) else {
                eprintln!("Error: unbalanced quotes");
                continue;
            };
            match parse_command(&tokens) {
                Ok(Some(status)) => {
                    self.last = Some(status.clone());
                    return Ok(status);
                }
                Ok(None) => println!("{HELP}"),
                Err(e) => eprintln!("Error: {e}"),
            }
        }
    }
}

fn usage(message: &str) -> DebuggerError {
    DebuggerError::ParseCommand(message.to_string())
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| DebuggerError::ParseCommand(format!("not a number: '{raw}'")))
}

/// Turns the words of a command line into a [`Status`]
///
/// Returns `Ok(None)` for `help`.
pub fn parse_command(tokens: &[String]) -> Result<Option<Status>> {
    let Some((cmd, args)) = tokens.split_first() else {
        return Err(usage("empty command"));
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let status = match (cmd.as_str(), args.as_slice()) {
        ("h" | "help", _) => return Ok(None),
        ("r" | "run", rest) => Status::Run(rest.iter().map(|s| s.to_string()).collect()),
        ("c" | "cont" | "continue", []) => Status::Continue,
        ("n" | "next" | "s" | "step", []) => Status::StepLine,
        ("si" | "stepi", []) => Status::StepSingle,
        ("b" | "break" | "breakpoint", [location]) => Status::SetBreakpoint(location.parse()?),
        ("b" | "break" | "breakpoint", _) => {
            return Err(usage("usage: b *ADDR|LINE|FILE:LINE|FUNCTION"))
        }
        ("d" | "delete", [location]) => {
            Status::DelBreakpoint(BreakpointSpec::parse_existing(location)?)
        }
        ("enable", [location]) => {
            Status::EnableBreakpoint(BreakpointSpec::parse_existing(location)?)
        }
        ("disable", [location]) => {
            Status::DisableBreakpoint(BreakpointSpec::parse_existing(location)?)
        }
        ("d" | "delete" | "enable" | "disable", _) => {
            return Err(usage("usage: delete|enable|disable LOCATION|ID"))
        }
        ("ib", []) | ("info" | "i", ["b" | "break" | "breakpoints"]) => Status::ListBreakpoints,
        ("bt" | "back" | "backtrace", []) => Status::Backtrace,
        ("p" | "print", [name]) => Status::PrintVariable(name.to_string()),
        ("p" | "print", _) => return Err(usage("usage: p NAME")),
        ("l" | "list", []) => Status::PrintSource(DEFAULT_LIST_RADIUS),
        ("l" | "list", [radius]) => Status::PrintSource(parse_number(radius)?),
        ("regs" | "registers", []) => Status::DumpRegisters,
        ("x", [addr]) => Status::ReadMem(parse_addr(addr)?, DEFAULT_READ_LEN),
        ("x", [addr, len]) => Status::ReadMem(parse_addr(addr)?, parse_number(len)?),
        ("x", _) => return Err(usage("usage: x ADDR [LEN]")),
        ("w" | "write", [addr, word]) => {
            let word = match word.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16)
                    .map(|w| w as i64)
                    .map_err(|_| usage("invalid hexadecimal word"))?,
                None => parse_number(word)?,
            };
            Status::WriteMem(parse_addr(addr)?, word)
        }
        ("w" | "write", _) => return Err(usage("usage: w ADDR WORD")),
        ("disas", rest) => {
            let literal = rest.contains(&"--literal");
            let rest: Vec<&str> = rest.iter().copied().filter(|a| *a != "--literal").collect();
            match rest.as_slice() {
                [] => Status::DisassembleAt(None, DEFAULT_DISAS_LEN, literal),
                [addr] => Status::DisassembleAt(Some(parse_addr(addr)?), DEFAULT_DISAS_LEN, literal),
                [addr, len] => {
                    Status::DisassembleAt(Some(parse_addr(addr)?), parse_number(len)?, literal)
                }
                _ => return Err(usage("usage: disas [ADDR] [LEN] [--literal]")),
            }
        }
        ("k" | "kill", []) => Status::Kill,
        ("q" | "quit" | "exit", []) => Status::DebuggerQuit,
        (other, _) => {
            return Err(DebuggerError::ParseCommand(format!(
                "unrecognized command '{other}', try 'help'"
            )))
        }
    };
    Ok(Some(status))
}
