use std::path::PathBuf;
use std::sync::OnceLock;

use deet::config::{DebuggerConfig, DEFAULT_MAX_STEPS};
use deet::debugger::Debugger;
use deet::errors::DebuggerError;
use deet::step::CancelToken;
use deet::ui::cli::CliUi;

use clap::Parser;
use nix::libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, Level};

/// Debug a program, stepping by source line and printing variables
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The program to debug, started with `run`
    program: PathBuf,

    /// More log output, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Keep address space layout randomization enabled for the debuggee
    #[arg(long)]
    aslr: bool,

    /// Directory to search for source files that are not where the debug info says
    #[arg(short = 'd', long = "source-dir")]
    source_dirs: Vec<PathBuf>,

    /// Do not print the source line when the program stops
    #[arg(long)]
    no_source: bool,

    /// Instructions a single `next` may execute before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    max_steps: usize,
}

/// The token of the session, for the `SIGINT` handler
static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigint(_signal: c_int) {
    if let Some(cancel) = CANCEL.get() {
        cancel.cancel();
    }
}

fn main() -> Result<(), DebuggerError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);

    let config = DebuggerConfig {
        max_steps: args.max_steps,
        disable_aslr: !args.aslr,
        source_dirs: args.source_dirs,
        show_source_on_stop: !args.no_source,
    };

    let ui = CliUi::build()?;
    let mut debug: Debugger<CliUi> = Debugger::build(&args.program, ui, config)?;
    route_sigint(debug.cancel_token())?;
    debug.run_debugger()?;

    Ok(())
}

/// Ctrl-C interrupts what the debuggee is doing instead of ending the debugger
fn route_sigint(cancel: CancelToken) -> Result<(), DebuggerError> {
    let _ = CANCEL.set(cancel);
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only loads the token and stores to an atomic
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    debug!("routed SIGINT to the cancel token");
    Ok(())
}

fn setup_logger(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}
