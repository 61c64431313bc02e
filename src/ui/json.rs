//! A JSON-lines interface for driving the debugger from other programs
//!
//! Every command is one line of JSON, an [`Input`] object holding a [`Status`]:
//!
//! ```json
//! {"status":{"SetBreakpoint":{"Function":"main"}}}
//! {"status":"StepLine"}
//! ```
//!
//! Every response is one line of JSON as produced by [`JsonUi::format_feedback`]. End of input
//! quits the debugger.

use std::io::{BufRead, BufReader, Write};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{trace, warn};

use super::{DebuggerUI, Status};
use crate::errors::Result;
use crate::feedback::Feedback;
use crate::inferior::StopEvent;

/// One command read from the input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub status: Status,
}

pub struct JsonUi {
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl JsonUi {
    /// Reads commands from stdin and writes responses to stdout
    pub fn build() -> Result<Self> {
        Ok(Self::with_io(
            BufReader::new(std::io::stdin()),
            std::io::stdout(),
        ))
    }

    pub fn with_io(input: impl BufRead + 'static, output: impl Write + 'static) -> Self {
        JsonUi {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    fn stop_event(event: &StopEvent) -> Value {
        match event {
            StopEvent::BreakpointHit(addr) => json!({ "breakpoint_hit": addr }),
            StopEvent::SteppedOne => json!("stepped_one"),
            StopEvent::Stopped(signal) => json!({ "stopped": signal.as_str() }),
            StopEvent::Cancelled => json!("cancelled"),
            StopEvent::Exited(code) => json!({ "exited": code }),
            StopEvent::Signaled(signal) => json!({ "signaled": signal.as_str() }),
        }
    }

    /// The JSON object sent for `feedback`
    pub fn format_feedback(feedback: &Feedback) -> Value {
        match feedback {
            Feedback::Ok => json!({ "ok": null }),
            Feedback::Error(e) => json!({ "error": e.to_string() }),
            Feedback::Text(t) => json!({ "text": t }),
            Feedback::Stopped {
                event,
                function,
                location,
                source,
            } => json!({
                "stopped": {
                    "event": Self::stop_event(event),
                    "function": function,
                    "location": location,
                    "source": source,
                }
            }),
            Feedback::Variable { name, value } => json!({
                "variable": { "name": name, "value": value, "display": value.to_string() }
            }),
            Feedback::Source { location, lines } => {
                json!({ "source": { "location": location, "lines": lines } })
            }
            Feedback::Registers(regs) => json!({ "registers": regs }),
            Feedback::Memory { addr, bytes } => json!({ "memory": { "addr": addr, "bytes": bytes } }),
            Feedback::Word(w) => json!({ "word": w }),
            Feedback::Breakpoint(bp) => json!({ "breakpoint": bp }),
            Feedback::Breakpoints(bps) => json!({ "breakpoints": bps }),
            Feedback::Backtrace(bt) => json!({ "backtrace": bt }),
            Feedback::Disassembly(d) => json!({ "disassembly": d }),
        }
    }

    fn send(&mut self, value: &Value) -> Result<()> {
        writeln!(self.output, "{value}")?;
        self.output.flush()?;
        Ok(())
    }
}

impl DebuggerUI for JsonUi {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        self.send(&Self::format_feedback(&feedback))?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.input.read_line(&mut line)? == 0 {
                trace!("end of input");
                return Ok(Status::DebuggerQuit);
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Input>(&line) {
                Ok(input) => return Ok(input.status),
                Err(e) => {
                    warn!("could not parse input: {e}");
                    self.send(&json!({ "error": format!("could not parse input: {e}") }))?;
                }
            }
        }
    }
}
