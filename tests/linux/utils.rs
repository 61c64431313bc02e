use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;

use deet::errors::Result;
use deet::feedback::Feedback;
use deet::ui::{DebuggerUI, Status};

pub fn program_source(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/linux/programs")
        .join(name)
}

/// Compiles `source` with debug info, `None` if there is no C compiler
pub fn compile_debuggee(source: &Path, is_pie: bool) -> Option<tempfile::TempPath> {
    if which::which("cc").is_err() {
        println!("no C compiler, skipping");
        return None;
    }
    let out_file = tempfile::NamedTempFile::new().expect("tempfile");

    let mut cc = Command::new("cc");
    cc.args(["-g", "-O0", "-fno-omit-frame-pointer"])
        .arg(source)
        .arg("-o")
        .arg(out_file.path());
    if is_pie {
        cc.arg("-pie");
    } else {
        cc.arg("-no-pie");
    }

    println!("running: {cc:?}");

    let cc = cc.output().expect("cc");

    if !cc.status.success() {
        let msg = String::from_utf8_lossy(&cc.stderr);
        panic!("{msg}");
    }

    Some(out_file.into_temp_path())
}

/// Plays back a fixed list of commands and records everything it is shown
#[derive(Default)]
pub struct ScriptedUi {
    commands: VecDeque<Status>,
    pub shown: Vec<String>,
}

impl ScriptedUi {
    pub fn new(commands: Vec<Status>) -> Self {
        Self {
            commands: commands.into(),
            shown: Vec::new(),
        }
    }
}

impl DebuggerUI for ScriptedUi {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        println!("{feedback}");
        self.shown.push(feedback.to_string());
        Ok(self.commands.pop_front().unwrap_or(Status::DebuggerQuit))
    }
}
