use std::path::PathBuf;
use std::process::exit;

use deet::addr::Addr;
use deet::config::DebuggerConfig;
use deet::debugger::Debugger;
use deet::errors::DebuggerError;
use deet::feedback::Feedback;
use deet::inferior::StopEvent;
use deet::linetable::SourceLocation;
use deet::ui::json::{Input, JsonUi};
use deet::ui::{BreakpointSpec, Status};
use deet::value::Value;

use clap::Parser;
use tracing::{trace, Level};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
"#
)]
/// deet server - JSON interface for programmatic debugging
///
/// Reads one JSON command per line from stdin and answers with one JSON object per line on
/// stdout. Logs go to stderr. End of input quits and kills the debuggee.
struct Args {
    /// The program to debug
    #[arg(required_unless_present_any = ["example_statuses", "example_feedbacks"])]
    program: Option<PathBuf>,

    /// More log output, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long)]
    /// Print example JSON commands and exit
    ///
    /// Displays sample JSON structures for sending commands to the debugger
    example_statuses: bool,

    #[arg(long)]
    /// Print example JSON responses and exit
    ///
    /// Displays sample JSON structures for the responses sent by the debugger
    example_feedbacks: bool,
}

fn main() -> Result<(), DebuggerError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);

    if args.example_statuses {
        example_statuses()?;
        exit(0);
    }
    if args.example_feedbacks {
        example_feedbacks();
        exit(0);
    }

    let Some(program) = args.program else {
        return Err(DebuggerError::ExecutableDoesNotExist(String::new()));
    };
    let ui = JsonUi::build()?;
    let mut debug: Debugger<_> = Debugger::build(&program, ui, DebuggerConfig::default())?;
    debug.run_debugger()?;

    Ok(())
}

fn example_statuses() -> Result<(), DebuggerError> {
    let statuses: &[Status] = &[
        Status::Run(vec!["--flag".to_string(), "input.txt".to_string()]),
        Status::SetBreakpoint(BreakpointSpec::Function("main".to_string())),
        Status::SetBreakpoint(BreakpointSpec::Line {
            file: Some("main.c".to_string()),
            line: 12,
        }),
        Status::SetBreakpoint(BreakpointSpec::Address(Addr::from(0x401136usize))),
        Status::DelBreakpoint(BreakpointSpec::Id(1)),
        Status::Continue,
        Status::StepLine,
        Status::StepSingle,
        Status::PrintVariable("count".to_string()),
        Status::PrintSource(3),
        Status::Backtrace,
        Status::ReadMem(Addr::from(0x7fffffffe000usize), 16),
        Status::DisassembleAt(None, 32, false),
        Status::Kill,
        Status::DebuggerQuit,
    ];

    for s in statuses {
        println!(
            "{}",
            serde_json::to_string(&Input { status: s.clone() })?
        )
    }
    Ok(())
}

fn example_feedbacks() {
    let feedbacks: &[Feedback] = &[
        Feedback::Ok,
        Feedback::Stopped {
            event: StopEvent::BreakpointHit(Addr::from(0x401136usize)),
            function: Some("main".to_string()),
            location: Some(SourceLocation {
                file: PathBuf::from("/src/main.c"),
                line: 12,
            }),
            source: Some("    int count = 0;".to_string()),
        },
        Feedback::Variable {
            name: "count".to_string(),
            value: Value::Signed(42),
        },
        Feedback::Word(921589215i64),
        Feedback::Error(DebuggerError::VariableNotFound("cnt".to_string())),
    ];

    for f in feedbacks {
        println!("{}", JsonUi::format_feedback(f))
    }
}

fn setup_logger(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // stdout belongs to the protocol, logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_file(false)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
    trace!("set up the logger");
}
