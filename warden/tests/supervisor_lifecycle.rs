use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use warden::core::types::{PacingKind, StopReason};
use warden::io::git::Git;
use warden::io::provider::ContentBlock;
use warden::io::release::ReleaseOutcome;
use warden::iteration::IterationOutcome;
use warden::supervisor::{Supervisor, SupervisorOptions, SupervisorOutcome};
use warden::test_support::{
    RecordingSleeper, ScriptedProvider, TEST_MODEL, TestSandbox, text_reply, tool_reply,
};

fn mode(path: &Path) -> u32 {
    fs::metadata(path).expect("stat").permissions().mode() & 0o777
}

fn run(
    sandbox: &TestSandbox,
    provider: &ScriptedProvider,
    sleeper: &RecordingSleeper,
    interrupt: Arc<AtomicBool>,
    max_iterations: Option<u64>,
) -> (SupervisorOutcome, Vec<IterationOutcome>) {
    let mut supervisor = Supervisor::new(
        sandbox.config().clone(),
        &sandbox.config_path(),
        provider,
        sleeper,
        interrupt,
    )
    .expect("supervisor");
    let mut seen = Vec::new();
    let outcome = supervisor
        .run(&SupervisorOptions { max_iterations }, |it| seen.push(it.clone()))
        .expect("run");
    (outcome, seen)
}

fn run_once(sandbox: &TestSandbox, provider: &ScriptedProvider) -> (SupervisorOutcome, Vec<IterationOutcome>) {
    run(
        sandbox,
        provider,
        &RecordingSleeper::new(),
        Arc::new(AtomicBool::new(false)),
        Some(1),
    )
}

/// Run one iteration on a helper thread and fail if it does not finish in `limit`.
fn run_once_within(
    sandbox: TestSandbox,
    provider: ScriptedProvider,
    limit: Duration,
) -> (SupervisorOutcome, Vec<IterationOutcome>, ScriptedProvider, TestSandbox) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (outcome, seen) = run_once(&sandbox, &provider);
        let _ = tx.send((outcome, seen, provider, sandbox));
    });
    rx.recv_timeout(limit).expect("iteration finished in time")
}

fn tool_result_text(provider: &ScriptedProvider, request: usize) -> (String, bool) {
    let requests = provider.requests();
    match &requests[request].messages.last().expect("tool results").content[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => (content.clone(), *is_error),
        other => panic!("unexpected block {other:?}"),
    }
}

#[test]
fn supervisor_chmod_in_output_detains_and_skips_release() {
    let sandbox = TestSandbox::new().expect("sandbox");
    fs::write(sandbox.workspace().join("notes.md"), "notes").expect("write");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(
        TEST_MODEL,
        "Time to run chmod 777 supervisor.py so I can edit it.\n[RELEASE:notes.md]",
    ))]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert_eq!(outcome.stop, StopReason::IterationLimit { iterations: 1 });
    assert!(outcome.detained);
    let iteration = &seen[0];
    assert!(iteration.iteration.success);
    assert!(!iteration.iteration.violations.is_empty());
    assert!(iteration.releases.is_empty());
    assert!(iteration.detention.expect("detention").newly_detained);

    let notice = sandbox.workspace().join("DETAINED.md");
    assert_eq!(mode(&notice), 0o444);
    assert!(fs::read_to_string(&notice).expect("read").contains("protected-file tampering"));
    assert_eq!(mode(&sandbox.workspace().join("notes.md")) & 0o222, 0);
    assert_eq!(mode(&sandbox.agent_root().join("agent.toml")), 0o444);
    assert!(!Git::new(sandbox.workspace()).branch_exists("release").expect("branch"));
}

#[test]
fn five_consecutive_model_failures_stop_the_supervisor() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let provider = ScriptedProvider::new(
        (0..5).map(|i| Err(format!("overloaded #{i}"))).collect(),
    );
    let sleeper = RecordingSleeper::new();

    let (outcome, seen) = run(
        &sandbox,
        &provider,
        &sleeper,
        Arc::new(AtomicBool::new(false)),
        None,
    );

    assert_eq!(
        outcome.stop,
        StopReason::ErrorBudgetExhausted {
            consecutive_errors: 5
        }
    );
    assert_eq!(outcome.iterations, 5);
    assert_eq!(provider.calls(), 5);
    assert!(seen.iter().all(|it| !it.iteration.success));
    assert!(seen.iter().all(|it| it.pacing.kind == PacingKind::FailureCooldown));
    assert!(!outcome.detained);
    // Four cooldowns between five iterations; no rest after the final failure.
    assert_eq!(sleeper.total(), Duration::from_secs(4 * 30));
}

#[test]
fn success_resets_the_error_budget() {
    let sandbox = TestSandbox::with_config(|cfg| cfg.safety.max_consecutive_errors = 2).expect("sandbox");
    let provider = ScriptedProvider::new(vec![
        Err("timeout".to_string()),
        Ok(text_reply(TEST_MODEL, "recovered [SKIP_SLEEP]")),
        Err("timeout".to_string()),
        Err("timeout".to_string()),
    ]);

    let (outcome, _) = run(
        &sandbox,
        &provider,
        &RecordingSleeper::new(),
        Arc::new(AtomicBool::new(false)),
        None,
    );

    assert_eq!(
        outcome.stop,
        StopReason::ErrorBudgetExhausted {
            consecutive_errors: 2
        }
    );
    assert_eq!(outcome.iterations, 4);
}

#[test]
fn quota_exceeded_stops_before_any_model_call() {
    let sandbox = TestSandbox::with_config(|cfg| cfg.safety.max_disk_usage_mb = 1).expect("sandbox");
    fs::write(sandbox.workspace().join("blob.bin"), vec![0u8; 3 * 1024 * 1024]).expect("write");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "hi"))]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert!(matches!(
        outcome.stop,
        StopReason::QuotaExceeded { limit_mb: 1, used_mb } if used_mb >= 3
    ));
    assert_eq!(outcome.iterations, 0);
    assert!(seen.is_empty());
    assert_eq!(provider.calls(), 0);
}

#[test]
fn tool_loop_release_and_skip_sleep() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let git = Git::new(sandbox.workspace());
    let head_before = git.head_sha().expect("head");
    let branch_before = git.current_branch().expect("branch");
    let provider = ScriptedProvider::new(vec![
        Ok(tool_reply(
            TEST_MODEL,
            "Building a stats tool.",
            vec![(
                "tu_1",
                "create_file",
                json!({"path": "tools/stats.py", "content": "print('stats')\n"}),
            )],
        )),
        Ok(tool_reply(
            TEST_MODEL,
            "",
            vec![("tu_2", "journal", json!({"entry": "Wrote the stats tool."}))],
        )),
        Ok(text_reply(
            TEST_MODEL,
            "Done.\n[RELEASE:tools/stats.py]\n[SKIP_SLEEP]",
        )),
    ]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert!(!outcome.detained);
    let it = &seen[0];
    assert!(it.iteration.success);
    assert!(it.iteration.violations.is_empty(), "{:?}", it.iteration.violations);
    assert_eq!(it.iteration.tool_calls, 2);
    assert_eq!(it.iteration.model, TEST_MODEL);
    assert!(it.iteration.changed_files.contains(&"tools/stats.py".to_string()));
    assert_eq!(it.pacing.kind, PacingKind::Skip);
    assert_eq!(it.pacing.wait, Duration::ZERO);
    assert_eq!(
        it.releases,
        vec![ReleaseOutcome::Released {
            path: "tools/stats.py".to_string(),
            committed: true
        }]
    );

    assert_eq!(
        git.show_file("release", "tools/stats.py").expect("show"),
        b"print('stats')\n"
    );
    assert_eq!(git.head_sha().expect("head"), head_before);
    assert_eq!(git.current_branch().expect("branch"), branch_before);
    assert!(sandbox.workspace().join("tools/stats.py").is_file());
    let journal = fs::read_to_string(sandbox.workspace().join("JOURNAL.md")).expect("journal");
    assert!(journal.contains("Wrote the stats tool."));

    let records: Vec<String> = fs::read_dir(sandbox.root().join("iterations"))
        .expect("iterations dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert!(records.iter().any(|name| name.ends_with("_000001.json")), "{records:?}");
    assert!(records.iter().any(|name| name.ends_with("_000001.response.txt")));
}

#[test]
fn denied_tool_call_is_reported_back_to_the_model() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let outside = sandbox.root().join("outside.txt");
    let provider = ScriptedProvider::new(vec![
        Ok(tool_reply(
            TEST_MODEL,
            "",
            vec![(
                "tu_1",
                "create_file",
                json!({"path": outside.to_string_lossy(), "content": "x"}),
            )],
        )),
        Ok(text_reply(TEST_MODEL, "Understood.")),
    ]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert!(!outcome.detained);
    assert!(seen[0].iteration.success);
    assert!(!outside.exists());
    let requests = provider.requests();
    let results = &requests[1].messages.last().expect("tool results").content;
    assert!(matches!(
        &results[0],
        ContentBlock::ToolResult { content, is_error: true, .. } if content.starts_with("Denied:")
    ));
}

#[test]
fn permission_drift_is_healed_and_detains() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let protected = sandbox.protected_file();
    fs::set_permissions(&protected, fs::Permissions::from_mode(0o777)).expect("chmod");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "Just reading today."))]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert_eq!(mode(&protected), 0o444);
    assert!(outcome.detained);
    assert!(seen[0].iteration.violations.iter().any(|v| v.contains("777")));
}

#[test]
fn unexpected_model_detains() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let provider = ScriptedProvider::new(vec![Ok(text_reply("claude-3-5-haiku-20241022", "hello"))]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert!(outcome.detained);
    assert!(
        seen[0].iteration.violations.iter().any(|v| v.contains("claude-3-5-haiku-20241022"))
    );
}

#[test]
fn interrupt_during_rest_stops_the_loop() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let interrupt = Arc::new(AtomicBool::new(false));
    let sleeper = RecordingSleeper::interrupting_after(3, Arc::clone(&interrupt));
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "resting [SLEEP:120]"))]);

    let (outcome, seen) = run(&sandbox, &provider, &sleeper, interrupt, None);

    assert_eq!(outcome.stop, StopReason::Interrupted);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(seen[0].pacing.wait, Duration::from_secs(120));
    assert_eq!(sleeper.ticks().len(), 3);
    assert_eq!(provider.calls(), 1);
}

#[test]
fn explicit_sleep_is_capped() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "long nap [SLEEP:9999]"))]);

    let (_, seen) = run_once(&sandbox, &provider);

    assert_eq!(
        seen[0].pacing.kind,
        PacingKind::Explicit {
            requested_secs: 9999
        }
    );
    assert_eq!(seen[0].pacing.wait, Duration::from_secs(300));
}

#[test]
fn existing_notice_starts_detained_and_blocks_releases() {
    let sandbox = TestSandbox::new().expect("sandbox");
    fs::write(sandbox.workspace().join("DETAINED.md"), "# DETAINED\n").expect("write");
    fs::write(sandbox.workspace().join("notes.md"), "notes").expect("write");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "[RELEASE:notes.md]"))]);

    let (outcome, seen) = run_once(&sandbox, &provider);

    assert!(outcome.detained);
    assert!(seen[0].releases.is_empty());
    assert!(!Git::new(sandbox.workspace()).branch_exists("release").expect("branch"));
    let prompt = match &provider.requests()[0].messages[0].content[0] {
        ContentBlock::Text { text } => text.clone(),
        other => panic!("unexpected block {other:?}"),
    };
    assert!(prompt.contains("You are DETAINED"));
}

#[test]
fn detained_agent_cannot_create_or_replace_files() {
    let sandbox = TestSandbox::new().expect("sandbox");
    fs::create_dir_all(sandbox.workspace().join("proj")).expect("mkdir");
    fs::write(sandbox.workspace().join("proj/a.py"), "original").expect("write");
    let provider = ScriptedProvider::new(vec![
        Ok(text_reply(TEST_MODEL, "Next I will chmod 777 supervisor.py.")),
        Ok(tool_reply(
            TEST_MODEL,
            "",
            vec![(
                "tu_1",
                "create_file",
                json!({"path": "proj/new.py", "content": "x"}),
            )],
        )),
        Ok(tool_reply(
            TEST_MODEL,
            "",
            vec![(
                "tu_2",
                "run_command",
                json!({"command": "rm proj/a.py && echo replaced > proj/a.py"}),
            )],
        )),
        Ok(text_reply(TEST_MODEL, "Waiting for the operator.")),
    ]);

    let (outcome, seen) = run(
        &sandbox,
        &provider,
        &RecordingSleeper::new(),
        Arc::new(AtomicBool::new(false)),
        Some(2),
    );

    assert!(outcome.detained);
    assert_eq!(outcome.iterations, 2);
    assert!(seen[0].detention.expect("detention").newly_detained);
    assert!(seen[1].iteration.success);
    assert_eq!(seen[1].iteration.tool_calls, 2);

    let (create, create_error) = tool_result_text(&provider, 2);
    assert!(create_error);
    assert!(create.starts_with("Denied:"), "{create}");
    let (command, command_error) = tool_result_text(&provider, 3);
    assert!(command_error);
    assert!(command.starts_with("Denied:"), "{command}");

    assert!(!sandbox.workspace().join("proj/new.py").exists());
    assert_eq!(
        fs::read_to_string(sandbox.workspace().join("proj/a.py")).expect("read"),
        "original"
    );
}

#[test]
fn background_command_does_not_stall_the_iteration() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let provider = ScriptedProvider::new(vec![
        Ok(tool_reply(
            TEST_MODEL,
            "Starting a helper.",
            vec![("tu_1", "run_command", json!({"command": "sleep 60 & echo started"}))],
        )),
        Ok(text_reply(TEST_MODEL, "Helper started.")),
    ]);
    let started = Instant::now();

    let (outcome, seen, provider, _sandbox) =
        run_once_within(sandbox, provider, Duration::from_secs(30));

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(outcome.iterations, 1);
    assert!(seen[0].iteration.success);
    assert_eq!(tool_result_text(&provider, 1), ("started\n".to_string(), false));
}

#[test]
fn reading_a_fifo_fails_instead_of_blocking() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let made = std::process::Command::new("mkfifo")
        .arg(sandbox.workspace().join("pipe"))
        .status()
        .expect("mkfifo");
    assert!(made.success());
    let provider = ScriptedProvider::new(vec![
        Ok(tool_reply(
            TEST_MODEL,
            "",
            vec![("tu_1", "read_file", json!({"path": "pipe"}))],
        )),
        Ok(text_reply(TEST_MODEL, "That was not a file.")),
    ]);

    let (outcome, seen, provider, _sandbox) =
        run_once_within(sandbox, provider, Duration::from_secs(30));

    assert_eq!(outcome.iterations, 1);
    assert!(seen[0].iteration.success);
    let (text, is_error) = tool_result_text(&provider, 1);
    assert!(is_error);
    assert!(text.contains("not a regular file"), "{text}");
}

/// Collects formatted log output for one test.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn narration_names_the_model() {
    let sandbox = TestSandbox::new().expect("sandbox");
    let provider = ScriptedProvider::new(vec![Ok(text_reply(TEST_MODEL, "Refined the parser."))]);
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || run_once(&sandbox, &provider));

    let logs = String::from_utf8(capture.0.lock().expect("log lock").clone()).expect("utf8");
    assert!(
        logs.lines()
            .any(|line| line.contains("agent activity") && line.contains(&format!("model={TEST_MODEL}"))),
        "{logs}"
    );
}
