mod utils;

use deet::config::DebuggerConfig;
use deet::debugger::Debugger;
use deet::ui::{BreakpointSpec, Status};

use self::utils::{compile_debuggee, program_source, ScriptedUi};

#[test]
fn adder_nopie() {
    test_step_into_add(false);
}

#[test]
fn adder_pie() {
    test_step_into_add(true);
}

#[test]
fn adder_unknown_function() {
    let Some(exe) = compile_debuggee(&program_source("adder.c"), false) else {
        return;
    };
    let mut debugger: Debugger<ScriptedUi> =
        Debugger::build(&exe, ScriptedUi::default(), DebuggerConfig::default()).unwrap();
    assert!(debugger
        .execute(Status::SetBreakpoint(BreakpointSpec::Function(
            "subtract".to_string()
        )))
        .is_err());
    // nothing was started
    assert!(debugger.inferior().is_none());
}

fn test_step_into_add(is_pie: bool) {
    let Some(exe) = compile_debuggee(&program_source("adder.c"), is_pie) else {
        return;
    };
    let config = DebuggerConfig {
        show_source_on_stop: false,
        ..Default::default()
    };
    let ui = ScriptedUi::new(vec![
        Status::SetBreakpoint(BreakpointSpec::Function("main".to_string())),
        Status::Run(Vec::new()),
        Status::StepLine,
        Status::PrintVariable("count".to_string()),
        Status::StepLine,
        Status::PrintVariable("a".to_string()),
        Status::PrintVariable("b".to_string()),
        Status::Backtrace,
        Status::StepLine,
        Status::PrintVariable("sum".to_string()),
        Status::Continue,
    ]);
    let mut debugger: Debugger<ScriptedUi> = Debugger::build(&exe, ui, config).unwrap();
    debugger.run_debugger().unwrap();

    let shown = &debugger.ui().shown;
    assert_eq!(shown.len(), 12, "{shown:#?}");
    assert_eq!(
        shown[1],
        "Breakpoint 1 at main will be set when the program starts"
    );
    assert!(shown[2].starts_with("Breakpoint hit at "), "{}", shown[2]);
    assert!(shown[2].contains("Stopped at main (") && shown[2].ends_with(":7)"));
    assert!(shown[3].starts_with("Stopped at main (") && shown[3].ends_with(":8)"));
    assert_eq!(shown[4], "count = 40");

    // stepping into the call ends after the prologue of add
    assert!(shown[5].starts_with("Stopped at add (") && shown[5].ends_with(":2)"));
    assert_eq!(shown[6], "a = 40");
    assert_eq!(shown[7], "b = 2");
    let frames: Vec<&str> = shown[8].lines().collect();
    assert_eq!(frames.len(), 2, "{}", shown[8]);
    assert!(frames[0].starts_with("#0 ") && frames[0].contains(" add ("));
    assert!(frames[1].starts_with("#1 ") && frames[1].contains(" main ("));
    assert!(frames[1].ends_with(":8)"));

    assert!(shown[9].starts_with("Stopped at add (") && shown[9].ends_with(":3)"));
    assert_eq!(shown[10], "sum = 42");
    assert_eq!(shown[11], "Child exited (status 0)");
    assert!(debugger.inferior().map_or(true, |i| !i.is_alive()));
}
