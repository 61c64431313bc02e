//! # Debugger Module
//!
//! The debugging session: one executable, its debug info, and at most one running [`Inferior`].
//!
//! [`Debugger::run_debugger`] is the main loop. It hands the [`Feedback`] of the last command to
//! the [`DebuggerUI`], gets the next [`Status`] back and executes it with
//! [`Debugger::execute`]. Errors of a single command become [`Feedback::Error`], only an error of
//! the UI itself ends the loop.
//!
//! Breakpoints are remembered as the user gave them. When the program is (re)started they are
//! resolved again against the new process, so they survive `run` and work for position
//! independent executables, whose load address is only known after launch.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::backtrace::Backtrace;
use crate::config::DebuggerConfig;
use crate::dbginfo::DwarfData;
use crate::errors::{DebuggerError, Result};
use crate::feedback::Feedback;
use crate::inferior::{Inferior, StopEvent};
use crate::process::PtraceProcess;
use crate::source::SourcePrinter;
use crate::step::{CancelToken, StepController};
use crate::tracee::Tracee;
use crate::ui::{BreakpointSpec, DebuggerUI, Status};
use crate::{Addr, Word};

/// A breakpoint the user asked for, kept across runs
#[derive(Debug, Clone, PartialEq, Eq)]
struct BreakpointRequest {
    spec: BreakpointSpec,
    enabled: bool,
}

pub struct Debugger<UI: DebuggerUI, T: Tracee = PtraceProcess> {
    executable: PathBuf,
    dwarf: DwarfData,
    config: DebuggerConfig,
    ui: UI,
    inferior: Option<Inferior<T>>,
    /// runtime address minus debug info address, zero unless position independent
    load_bias: Addr,
    requests: Vec<BreakpointRequest>,
    source: SourcePrinter,
    cancel: CancelToken,
}

impl<UI: DebuggerUI, T: Tracee> Debugger<UI, T> {
    /// Sets up a session for `executable`, reading its debug info
    ///
    /// # Errors
    ///
    /// Fails if the executable does not exist or its debug info can not be parsed.
    pub fn build(executable: impl AsRef<Path>, ui: UI, config: DebuggerConfig) -> Result<Self> {
        let executable = PtraceProcess::resolve_executable(executable.as_ref())?;
        let dwarf = DwarfData::from_file(&executable).inspect_err(|e| {
            error!("could not read the debug info of {}: {e}", executable.display());
        })?;
        Ok(Self::with_debug_info(executable, dwarf, ui, config))
    }

    /// Sets up a session with debug info that was already loaded
    pub fn with_debug_info(
        executable: impl AsRef<Path>,
        dwarf: DwarfData,
        ui: UI,
        config: DebuggerConfig,
    ) -> Self {
        Debugger {
            executable: executable.as_ref().to_path_buf(),
            dwarf,
            source: SourcePrinter::new(config.source_dirs.clone()),
            config,
            ui,
            inferior: None,
            load_bias: Addr::NULL,
            requests: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Uses `cancel` to interrupt long running steps, for example from a `SIGINT` handler
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn ui(&self) -> &UI {
        &self.ui
    }

    pub fn dwarf(&self) -> &DwarfData {
        &self.dwarf
    }

    pub fn inferior(&self) -> Option<&Inferior<T>> {
        self.inferior.as_ref()
    }

    pub fn load_bias(&self) -> Addr {
        self.load_bias
    }

    pub fn run_debugger(&mut self) -> Result<()> {
        let mut feedback = Feedback::Ok;
        loop {
            let status = match self.ui.process(feedback) {
                Ok(status) => status,
                Err(e) => {
                    error!("{e}");
                    return Err(e);
                }
            };
            debug!("command: {status:?}");
            if status == Status::DebuggerQuit {
                break;
            }
            feedback = self.execute(status).into();
        }
        self.cleanup()
    }

    /// Executes one command
    pub fn execute(&mut self, status: Status) -> Result<Feedback> {
        match status {
            Status::Run(args) => self.run(&args),
            Status::Continue => self.cont(),
            Status::StepLine => self.step_line(),
            Status::StepSingle => self.step_single(),
            Status::SetBreakpoint(spec) => self.set_bp(spec),
            Status::DelBreakpoint(spec) => self.del_bp(&spec),
            Status::EnableBreakpoint(spec) => self.toggle_bp(&spec, true),
            Status::DisableBreakpoint(spec) => self.toggle_bp(&spec, false),
            Status::ListBreakpoints => self.list_bps(),
            Status::Backtrace => self.backtrace(),
            Status::PrintVariable(name) => self.print_variable(&name),
            Status::PrintSource(radius) => self.print_source(radius),
            Status::DumpRegisters => Ok(Feedback::Registers(self.live_inferior()?.registers()?)),
            Status::ReadMem(addr, len) => self.read_mem(addr, len),
            Status::WriteMem(addr, word) => self.write_mem(addr, word),
            Status::DisassembleAt(addr, len, literal) => self.disassemble(addr, len, literal),
            Status::Kill => self.kill(),
            Status::DebuggerQuit => Ok(Feedback::Ok),
        }
    }

    /// Kills the inferior, if there is one
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(inferior) = self.inferior.as_mut() {
            inferior.kill()?;
        }
        Ok(())
    }

    /// Takes control of a started inferior: computes the load bias and sets the requested
    /// breakpoints
    ///
    /// Breakpoints that can not be set are logged and skipped.
    pub fn attach_inferior(&mut self, mut inferior: Inferior<T>) {
        self.load_bias = self.compute_load_bias(&inferior);
        if self.load_bias != Addr::NULL {
            info!("load bias is {}", self.load_bias);
        }

        for request in &self.requests {
            let set = self
                .resolve_request(&request.spec)
                .and_then(|addr| {
                    inferior.add_breakpoint(addr)?;
                    if !request.enabled {
                        inferior.disable_breakpoint(addr)?;
                    }
                    Ok(addr)
                });
            match set {
                Ok(addr) => debug!("set breakpoint {} at {addr}", request.spec),
                Err(e) => warn!("could not set breakpoint {}: {e}", request.spec),
            }
        }
        self.inferior = Some(inferior);
    }

    fn compute_load_bias(&self, inferior: &Inferior<T>) -> Addr {
        if !self.dwarf.position_independent() {
            return Addr::NULL;
        }
        match inferior.memory_map() {
            Ok(map) => map.load_base_of(&self.executable).unwrap_or_else(|| {
                warn!("{} is not mapped, assuming no load bias", self.executable.display());
                Addr::NULL
            }),
            Err(e) => {
                warn!("could not read the memory map: {e}");
                Addr::NULL
            }
        }
    }

    fn err_if_no_inferior(&self) -> Result<()> {
        if self.inferior.is_none() {
            let err = DebuggerError::NoDebuggee;
            error!("{err}");
            Err(err)
        } else {
            Ok(())
        }
    }

    fn live_inferior(&mut self) -> Result<&mut Inferior<T>> {
        self.err_if_no_inferior()?;
        match self.inferior.as_mut() {
            Some(inferior) if inferior.is_alive() => Ok(inferior),
            Some(_) => Err(DebuggerError::ProcessExited),
            None => Err(DebuggerError::NoDebuggee),
        }
    }

    /// The inferior if it is alive, [`None`] if there is none or it has exited
    fn alive(&self) -> Option<&Inferior<T>> {
        self.inferior.as_ref().filter(|i| i.is_alive())
    }

    /// Runtime address of a requested breakpoint
    fn resolve_request(&self, spec: &BreakpointSpec) -> Result<Addr> {
        Ok(match spec {
            BreakpointSpec::Address(addr) => *addr,
            BreakpointSpec::Line { file, line } => self
                .dwarf
                .address_for_line(file.as_deref(), *line)?
                .relocate(self.load_bias),
            BreakpointSpec::Function(name) => self
                .dwarf
                .breakpoint_address_for_function(name)?
                .relocate(self.load_bias),
            BreakpointSpec::Id(id) => return self.resolve_id(*id),
        })
    }

    /// Ids are the ones of the breakpoint set while a process is alive, and positions in the
    /// request list otherwise
    fn resolve_id(&self, id: usize) -> Result<Addr> {
        match self.alive() {
            Some(inferior) => inferior
                .breakpoints()
                .get_by_id(id)
                .map(|bp| bp.addr())
                .ok_or(DebuggerError::UnknownBreakpointId(id)),
            None => match id.checked_sub(1).and_then(|idx| self.requests.get(idx)) {
                Some(request) if !matches!(request.spec, BreakpointSpec::Id(_)) => {
                    self.resolve_request(&request.spec)
                }
                _ => Err(DebuggerError::UnknownBreakpointId(id)),
            },
        }
    }

    fn run(&mut self, args: &[String]) -> Result<Feedback> {
        if let Some(mut old) = self.inferior.take() {
            info!("killing the previous inferior {}", old.pid());
            old.kill()?;
        }
        let inferior = Inferior::launch(&self.executable, args, &self.config).inspect_err(|e| {
            error!("could not launch {}: {e}", self.executable.display());
        })?;
        self.attach_inferior(inferior);
        self.cont()
    }

    fn cont(&mut self) -> Result<Feedback> {
        self.cancel.reset();
        let event = self.live_inferior()?.continue_execution()?;
        self.stop_feedback(event)
    }

    fn step_line(&mut self) -> Result<Feedback> {
        self.cancel.reset();
        let inferior = self.inferior.as_mut().ok_or(DebuggerError::NoDebuggee)?;
        let event = StepController::new(&self.dwarf)
            .with_max_steps(self.config.max_steps)
            .with_cancel(self.cancel.clone())
            .with_load_bias(self.load_bias)
            .next_line(inferior)?;
        self.stop_feedback(event)
    }

    fn step_single(&mut self) -> Result<Feedback> {
        let event = self.live_inferior()?.single_step()?;
        self.stop_feedback(event)
    }

    /// Describes where the inferior is after `event`
    fn stop_feedback(&mut self, event: StopEvent) -> Result<Feedback> {
        if event.is_terminal() {
            return Ok(Feedback::Stopped {
                event,
                function: None,
                location: None,
                source: None,
            });
        }

        let pc = self.live_inferior()?.registers()?.pc.unrelocate(self.load_bias);
        let function = self.dwarf.function_at(pc).map(|f| f.display_name());
        let location = self.dwarf.location_at(pc);
        let source = match (&location, self.config.show_source_on_stop) {
            (Some(loc), true) => match self.source.source_line(&loc.file, loc.line) {
                Ok(text) => Some(text),
                Err(e) => {
                    debug!("no source to show: {e}");
                    None
                }
            },
            _ => None,
        };

        Ok(Feedback::Stopped {
            event,
            function,
            location,
            source,
        })
    }

    fn set_bp(&mut self, spec: BreakpointSpec) -> Result<Feedback> {
        if let BreakpointSpec::Id(id) = spec {
            return Err(DebuggerError::ParseCommand(format!(
                "can not set a breakpoint at breakpoint number {id}"
            )));
        }
        let addr = self.resolve_request(&spec)?;

        // before the start the load bias is unknown, the address would be wrong for PIE
        let feedback = if self.alive().is_some() {
            Feedback::Breakpoint(self.live_inferior()?.add_breakpoint(addr)?)
        } else {
            Feedback::Text(format!(
                "Breakpoint {} at {spec} will be set when the program starts",
                self.requests.len() + 1
            ))
        };

        let known = self.requests_at(addr);
        if known.is_empty() {
            self.requests.push(BreakpointRequest {
                spec,
                enabled: true,
            });
        }
        for idx in known {
            self.requests[idx].enabled = true;
        }
        Ok(feedback)
    }

    fn del_bp(&mut self, spec: &BreakpointSpec) -> Result<Feedback> {
        let addr = self.resolve_request(spec)?;
        if let Some(inferior) = self.inferior.as_mut().filter(|i| i.is_alive()) {
            inferior.remove_breakpoint(addr)?;
        }
        let requests = std::mem::take(&mut self.requests);
        self.requests = requests
            .into_iter()
            .filter(|r| self.resolve_request(&r.spec).ok() != Some(addr))
            .collect();
        Ok(Feedback::Ok)
    }

    fn toggle_bp(&mut self, spec: &BreakpointSpec, enabled: bool) -> Result<Feedback> {
        let addr = self.resolve_request(spec)?;
        if let Some(inferior) = self.inferior.as_mut().filter(|i| i.is_alive()) {
            if enabled {
                inferior.enable_breakpoint(addr)?;
            } else {
                inferior.disable_breakpoint(addr)?;
            }
        }
        for idx in self.requests_at(addr) {
            self.requests[idx].enabled = enabled;
        }
        Ok(Feedback::Ok)
    }

    /// Indices of the requests that resolve to `addr`
    fn requests_at(&self, addr: Addr) -> Vec<usize> {
        self.requests
            .iter()
            .enumerate()
            .filter(|(_, r)| self.resolve_request(&r.spec).ok() == Some(addr))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn list_bps(&self) -> Result<Feedback> {
        if let Some(inferior) = self.alive() {
            return Ok(Feedback::Breakpoints(
                inferior.breakpoints().iter().cloned().collect(),
            ));
        }
        if self.requests.is_empty() {
            return Ok(Feedback::Text("No breakpoints".to_string()));
        }
        let lines: Vec<String> = self
            .requests
            .iter()
            .enumerate()
            .map(|(idx, r)| {
                format!(
                    "{:<4}{} {}",
                    idx + 1,
                    r.spec,
                    if r.enabled { "enabled" } else { "disabled" }
                )
            })
            .collect();
        Ok(Feedback::Text(lines.join("\n")))
    }

    fn backtrace(&mut self) -> Result<Feedback> {
        let load_bias = self.load_bias;
        let inferior = self.inferior.as_mut().ok_or(DebuggerError::NoDebuggee)?;
        let regs = inferior.registers()?;
        let bt = Backtrace::capture(&self.dwarf, &regs, load_bias, inferior)?;
        Ok(Feedback::Backtrace(bt))
    }

    fn print_variable(&mut self, name: &str) -> Result<Feedback> {
        let load_bias = self.load_bias;
        let inferior = self.inferior.as_mut().ok_or(DebuggerError::NoDebuggee)?;
        let regs = inferior.registers()?;
        let frame = self.dwarf.frame_context(&regs, load_bias);
        let value = self.dwarf.resolve_variable(name, &frame, inferior)?;
        Ok(Feedback::Variable {
            name: name.to_string(),
            value,
        })
    }

    fn print_source(&mut self, radius: u64) -> Result<Feedback> {
        let pc = self.live_inferior()?.registers()?.pc.unrelocate(self.load_bias);
        let location = self
            .dwarf
            .location_at(pc)
            .ok_or(DebuggerError::NoLineInfo(pc))?;
        let lines = self
            .source
            .source_window(&location.file, location.line, radius)?;
        Ok(Feedback::Source { location, lines })
    }

    fn read_mem(&mut self, addr: Addr, len: usize) -> Result<Feedback> {
        let bytes = self.live_inferior()?.read_memory(addr, len)?;
        Ok(Feedback::Memory { addr, bytes })
    }

    fn write_mem(&mut self, addr: Addr, word: Word) -> Result<Feedback> {
        self.live_inferior()?
            .write_memory(addr, &word.to_le_bytes())?;
        Ok(Feedback::Ok)
    }

    fn disassemble(&mut self, addr: Option<Addr>, len: usize, literal: bool) -> Result<Feedback> {
        let inferior = self.live_inferior()?;
        let addr = match addr {
            Some(addr) => addr,
            None => inferior.registers()?.pc,
        };
        Ok(Feedback::Disassembly(
            inferior.disassemble(addr, len, literal)?,
        ))
    }

    fn kill(&mut self) -> Result<Feedback> {
        self.live_inferior()?.kill()?;
        Ok(Feedback::Stopped {
            event: StopEvent::Signaled(Signal::SIGKILL),
            function: None,
            location: None,
            source: None,
        })
    }
}
