
use std::time::Duration;

use runem::console::{Console, SharedBuffer};
use runem::error::{JobError, RunemError};
use runem::registry::JobRegistry;
use runem::report::ReportStyle;
use runem::runner::{RunRequest, RunSettings, Runner};
use runem::scheduler::{JobReport, APP_PHASE};
use runem::worker::PhaseState;
use test_harness::*;

const TWO_PHASES: &str = r#"
- config:
    phases: [phaseA, phaseB]
- job: {addr: {file: hooks.rs, function: a1}, when: {phase: phaseA, tags: [py]}}
- job: {addr: {file: hooks.rs, function: a2}, when: {phase: phaseA, tags: [py]}}
- job: {addr: {file: hooks.rs, function: b1}, when: {phase: phaseB, tags: [py]}}
"#;

fn runner(yaml: &str, registry: JobRegistry) -> (Runner, SharedBuffer) {
    let cfg = config(yaml, &registry);
    let (console, buf) = Console::buffered();
    (Runner::new(cfg, registry, console), buf)
}

fn settings(runner: &Runner, request: RunRequest, root: &std::path::Path) -> RunSettings {
    let selection = request.selection(runner.config()).unwrap();
    let options = request.options(runner.config());
    let mut settings = RunSettings::new(selection, options, root);
    settings.procs = 2;
    settings.report_style = ReportStyle::Plain;
    settings
}

fn two_phase_registry(log: &SpanLog, a1_fails: bool) -> JobRegistry {
    let mut registry = JobRegistry::new();
    let a1 = RecordingJob::new(log, 10);
    registry.register(HOOKS_FILE, "a1", if a1_fails { a1.failing() } else { a1 });
    registry.register(HOOKS_FILE, "a2", RecordingJob::new(log, 40));
    registry.register(HOOKS_FILE, "b1", RecordingJob::new(log, 10));
    registry
}

#[tokio::test]
async fn test_only_requested_phase_runs() {
    let log = span_log();
    let (runner, buf) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let request = RunRequest {
        phases: Some(vec!["phaseA".into()]),
        ..RunRequest::default()
    };
    let settings = settings(&runner, request, &std::env::temp_dir());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    assert!(outcome.error.is_none());
    let lines = buf.lines();
    assert!(lines.contains(&"runem: will run 2 jobs for phase 'phaseA'".to_string()));
    assert!(lines.contains(&"runem: skipping phase 'phaseB'".to_string()));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("runem: Running 'phaseA' with")));
    assert!(!lines.iter().any(|l| l.starts_with("runem: Running 'phaseB'")));
    assert!(spans(&log).iter().all(|s| s.phase == "phaseA"));
    assert_eq!(outcome.state_of("phaseB"), Some(PhaseState::Skipped));
}

#[tokio::test]
async fn test_failure_stops_later_phases_after_reporting() {
    let log = span_log();
    let (runner, buf) = runner(TWO_PHASES, two_phase_registry(&log, true));
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    // both phase A jobs reported timings, the failed one marked as such
    let phase_a: Vec<&str> = outcome.run_result["phaseA"]
        .iter()
        .map(|m| m.timing.label.as_str())
        .collect();
    assert_eq!(phase_a, vec!["a1: failed", "a2"]);
    // phase B never dispatched
    assert!(!outcome.run_result.contains_key("phaseB"));
    assert!(spans(&log).iter().all(|s| s.phase == "phaseA"));
    assert_eq!(outcome.state_of("phaseA"), Some(PhaseState::Failed));
    assert_eq!(outcome.state_of("phaseB"), Some(PhaseState::Pending));

    // the report and failure summary were printed before the error surfaces
    let lines = buf.lines();
    assert!(lines.contains(&"runem: reports:".to_string()));
    assert!(lines
        .last()
        .unwrap()
        .starts_with("runem: FAILED: runem took:"));
    assert!(!outcome.summary.success);
    match outcome.into_result() {
        Err(RunemError::JobFailed { label, .. }) => assert_eq!(label, "a1"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_phases_do_not_overlap() {
    let log = span_log();
    let (runner, _) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;
    assert!(outcome.error.is_none());

    let spans = spans(&log);
    let last_a_end = spans
        .iter()
        .filter(|s| s.phase == "phaseA")
        .map(|s| s.end)
        .max()
        .unwrap();
    let b_start = spans.iter().find(|s| s.phase == "phaseB").unwrap().start;
    assert!(b_start >= last_a_end);
}

#[tokio::test]
async fn test_requested_phase_order_is_used() {
    let log = span_log();
    let (runner, _) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let request = RunRequest {
        phases: Some(vec!["phaseB".into(), "phaseA".into()]),
        ..RunRequest::default()
    };
    let settings = settings(&runner, request, &std::env::temp_dir());

    runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    let spans = spans(&log);
    assert_eq!(spans[0].phase, "phaseB");
}

#[tokio::test]
async fn test_report_and_time_saved() {
    let log = span_log();
    let mut registry = JobRegistry::new();
    registry.register(
        HOOKS_FILE,
        "a1",
        RecordingJob::new(&log, 20).with_report(JobReport::default().with_url("coverage", "htmlcov")),
    );
    registry.register(HOOKS_FILE, "a2", RecordingJob::new(&log, 20));
    registry.register(HOOKS_FILE, "b1", RecordingJob::new(&log, 20));
    let (runner, buf) = runner(TWO_PHASES, registry);
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    let app: Vec<&str> = outcome.run_result[APP_PHASE]
        .iter()
        .map(|m| m.timing.label.as_str())
        .collect();
    assert_eq!(app, vec!["pre-build", "run-phases"]);

    let report = &outcome.report;
    let job_total: Duration = ["phaseA", "phaseB"]
        .iter()
        .flat_map(|p| outcome.run_result[*p].iter())
        .map(|m| m.timing.duration)
        .sum();
    assert_eq!(report.system_time, job_total);
    assert_eq!(
        report.time_saved,
        chrono::TimeDelta::from_std(report.system_time).unwrap()
            - chrono::TimeDelta::from_std(report.wall_clock).unwrap()
    );

    let lines = buf.lines();
    assert!(lines.contains(&"runem: report: coverage: htmlcov".to_string()));
    assert!(lines.last().unwrap().starts_with("runem: DONE: runem took:"));
}

#[tokio::test]
async fn test_pre_build_counts_time_before_the_run() {
    let log = span_log();
    let (runner, _) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let earlier = std::time::Instant::now() - Duration::from_millis(200);
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir())
        .timed_from(earlier, chrono::Utc::now());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    let pre_build = &outcome.run_result[APP_PHASE][0].timing;
    assert_eq!(pre_build.label, "pre-build");
    assert!(pre_build.duration >= Duration::from_millis(200));
    assert!(outcome.report.wall_clock >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_command_jobs_run_in_their_working_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("web")).unwrap();
    let yaml = r#"
- config:
    phases: [build]
- job:
    label: marker
    command: "touch made-here"
    ctx: {cwd: web}
    when: {phase: build, tags: [js]}
"#;
    let (runner, _) = runner(yaml, JobRegistry::new());
    let settings = settings(&runner, RunRequest::default(), dir.path());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("js", &["web/app.js"])]))
        .await;

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert!(dir.path().join("web").join("made-here").exists());
    assert!(!dir.path().join("made-here").exists());
}

#[tokio::test]
async fn test_failing_command_job_fails_the_run() {
    let yaml = r#"
- config:
    phases: [check]
- job: {label: bad, command: "echo nope >&2; exit 3", when: {phase: check, tags: [py]}}
"#;
    let (runner, _) = runner(yaml, JobRegistry::new());
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    match outcome.error {
        Some(RunemError::JobFailed { source, .. }) => assert!(matches!(
            source,
            JobError::BadExitCode {
                exit_code: Some(3),
                ..
            }
        )),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_exit_hook_sees_final_metrics() {
    let dir = tempfile::TempDir::new().unwrap();
    let yaml = r#"
- config:
    phases: [check]
- job: {label: ok, command: "true", when: {phase: check, tags: [py]}}
- hook:
    hook_name: on-exit
    command: "echo $RUNEM_SUCCESS > hook-ran"
- hook:
    hook_name: on-exit
    command: "exit 1"
"#;
    let (runner, buf) = runner(yaml, JobRegistry::new());
    let settings = settings(&runner, RunRequest::default(), dir.path());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    // a failing hook is reported but does not fail the run
    assert!(outcome.error.is_none());
    assert!(buf.lines().iter().any(|l| l.contains("WARNING: hook")));
    let written = std::fs::read_to_string(dir.path().join("hook-ran")).unwrap();
    assert_eq!(written.trim(), "true");
}

#[tokio::test]
async fn test_json_summary_is_written() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = span_log();
    let (runner, _) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let mut settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());
    let path = dir.path().join("summary.json");
    settings.report_json = Some(path.clone());

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;
    assert!(outcome.error.is_none());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["phases"][0]["name"], "phaseA");
    assert_eq!(json["phases"][0]["state"], "completed");
    assert_eq!(json["phases"][1]["jobs"][0]["label"], "b1");
}

#[tokio::test]
async fn test_interrupt_stops_before_the_next_phase() {
    let log = span_log();
    let (runner, _) = runner(TWO_PHASES, two_phase_registry(&log, false));
    let token = tokio_util::sync::CancellationToken::new();
    let runner = runner.with_shutdown(token.clone());
    let settings = settings(&runner, RunRequest::default(), &std::env::temp_dir());
    token.cancel();

    let outcome = runner
        .run_with_files(&settings, lookup(&[("py", &["a.py"])]))
        .await;

    assert!(matches!(outcome.error, Some(RunemError::Interrupted(ref p)) if p == "phaseA"));
    assert!(spans(&log).is_empty());
}
