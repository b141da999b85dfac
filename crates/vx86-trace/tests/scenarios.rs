use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use vx86_cpu_core::Gpr;
use vx86_trace::report::StopReport;
use vx86_trace::{driver, Engine, Report, Scenario};

fn scenario_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("scenarios")
        .join(name)
}

fn load(name: &str) -> Scenario {
    Scenario::load(&scenario_path(name)).unwrap()
}

fn run(scenario: &Scenario, engine: Engine) -> Report {
    let (mut cpu, mut thread) = scenario.build().unwrap();
    let summary = driver::run(scenario, engine, &mut cpu, &mut thread).unwrap();
    Report::new(&summary, &mut cpu, &thread)
}

/// Runs both engines and checks they end in the same state after the same number of steps.
fn run_both_with(scenario: &Scenario, name: &str) -> Report {
    let interp = run(scenario, Engine::Interp);
    let jit = run(scenario, Engine::Jit);
    assert_eq!(jit, interp, "{name}");
    interp
}

fn run_both(name: &str) -> Report {
    run_both_with(&load(name), name)
}

#[test]
fn every_scenario_agrees_across_engines() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect();
    names.sort();
    assert!(!names.is_empty());
    for name in names {
        run_both(&name);
    }
}

#[test]
fn counted_loop_runs_to_completion() {
    let report = run_both("counted_loop.json");
    assert_eq!(report.stop, StopReport::OutOfCode { eip: 0x1009 });
    assert_eq!(report.regs[&Gpr::Ecx], 0);
    assert_eq!(report.regs[&Gpr::Eax], 115);
    assert_eq!(report.regs[&Gpr::Esp], 0x8000 - 12);
    // ZF and PF from the final DEC, IF from reset.
    assert_eq!(report.regs[&Gpr::Edx], 0x246);
    assert_eq!(report.steps, 3 * 4 + 2);
}

#[test]
fn step_limit_cuts_cached_blocks_short() {
    let mut scenario = load("counted_loop.json");
    scenario.max_steps = 5;
    let report = run_both_with(&scenario, "counted_loop.json");
    assert_eq!(report.stop, StopReport::StepLimit);
    assert_eq!(report.steps, 5);
    assert_eq!(report.regs[&Gpr::Ecx], 2);
    assert_eq!(report.regs[&Gpr::Eax], 105);
    assert_eq!(report.eip, 0x1001);
}

#[test]
fn every_step_limit_agrees_across_engines() {
    for name in ["counted_loop.json", "stack_reload.json", "far_call.json"] {
        let mut scenario = load(name);
        for max_steps in 1..=16 {
            scenario.max_steps = max_steps;
            let report = run_both_with(&scenario, name);
            assert!(report.steps <= max_steps, "{name} at {max_steps}");
        }
    }
}

#[test]
fn far_call_returns_to_caller() {
    let report = run_both("far_call.json");
    assert_eq!(report.stop, StopReport::OutOfCode { eip: 0x100D });
    assert_eq!(report.regs[&Gpr::Esi], 170);
    assert_eq!(report.regs[&Gpr::Ebx], 170);
    assert_eq!(report.regs[&Gpr::Esp], 0x8000);
    assert_eq!(report.regs[&Gpr::Ebp], 30000);
}

#[test]
fn reloading_ss_mid_loop() {
    let report = run_both("stack_reload.json");
    assert_eq!(report.stop, StopReport::OutOfCode { eip: 0x100B });
    assert_eq!(report.regs[&Gpr::Ebx], 7);
    assert_eq!(report.regs[&Gpr::Esp], 0x8000);
}

#[test]
fn handled_fault_stops_at_the_faulting_jump() {
    let report = run_both("handled_fault.json");
    assert_eq!(report.stop, StopReport::FaultDelivered { eip: 0x1001 });
    assert_eq!(report.signals.len(), 1);
    assert_eq!(report.signals[0].error, 0x2C);
}

#[test]
fn unhandled_fault_reports_backtrace() {
    let report = run_both("unhandled_fault.json");
    let StopReport::Fatal {
        reason,
        backtrace: Some(backtrace),
    } = &report.stop
    else {
        panic!("expected a fatal stop, got {:?}", report.stop);
    };
    assert!(reason.contains("unhandled exception"), "{reason}");
    let functions: Vec<&str> = backtrace
        .frames
        .iter()
        .map(|frame| frame.function.as_str())
        .collect();
    assert_eq!(functions, vec!["demo_entry", "demo_worker"]);
    assert!(report.signals.is_empty());
}
