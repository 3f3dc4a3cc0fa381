mod common;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use process_supervisor::{EventKind, ProcessState, Propagation, SupervisorError, Task};

use common::{create_context, eventually, is_alive, run_until, task, EventLog};

const LIMIT: Duration = Duration::from_secs(10);

async fn log_contains(path: &Path, needle: &str) -> bool {
    let path = path.to_path_buf();
    let needle = needle.to_string();
    eventually(Duration::from_secs(5), || {
        let path = path.clone();
        let needle = needle.clone();
        async move {
            tokio::fs::read_to_string(&path)
                .await
                .map(|content| content.contains(&needle))
                .unwrap_or(false)
        }
    })
    .await
}

#[tokio::test]
async fn test_concurrent_exits_each_publish_finish() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    for name in ["first", "second"] {
        ctx.add_task(task(name, "true")).unwrap();
        ctx.start_task(name).unwrap();
    }

    run_until(&mut ctx, LIMIT, |ctx| ctx.get_running_processes().is_empty()).await;

    assert_eq!(ctx.get_stopped_processes().len(), 2);
    for name in ["first", "second"] {
        assert_eq!(events.count(EventKind::TaskFinish, name), 1);
        let process = ctx.get_process(name).unwrap();
        assert_eq!(process.state(), ProcessState::ExitNormal);
        assert_eq!(process.exit_code(), Some(0));
        assert_eq!(process.pid(), None);
        assert!(process.info().check_success().is_ok());
    }
}

#[tokio::test]
async fn test_nonzero_exit_publishes_running_error() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    ctx.add_task(task("failing", "false")).unwrap();
    ctx.start_task("failing").unwrap();

    run_until(&mut ctx, LIMIT, |ctx| !ctx.is_running("failing")).await;

    let process = ctx.get_process("failing").unwrap();
    assert_eq!(process.state(), ProcessState::ExitError);
    assert_eq!(process.exit_code(), Some(1));
    assert_eq!(events.count(EventKind::TaskRunningError, "failing"), 1);
    assert_eq!(events.count(EventKind::TaskFinish, "failing"), 0);
    assert!(matches!(
        process.info().check_success(),
        Err(SupervisorError::ProcessRuntimeError { exit_code: 1, .. })
    ));
}

#[tokio::test]
async fn test_output_lands_in_default_log_files() {
    let (mut ctx, logs) = create_context();
    ctx.add_task(task("greeter", "echo hello supervisor")).unwrap();
    ctx.add_task(task("complainer", "ls /definitely/not/a/real/path"))
        .unwrap();
    ctx.start_task("greeter").unwrap();
    ctx.start_task("complainer").unwrap();

    let out = logs.path().join("greeter").join("greeter_out.log");
    let err = logs.path().join("complainer").join("complainer_err.log");
    assert_eq!(
        ctx.get_process("greeter").unwrap().stdout_logfile(),
        Some(out.as_path())
    );
    assert_eq!(
        ctx.get_process("complainer").unwrap().stderr_logfile(),
        Some(err.as_path())
    );

    run_until(&mut ctx, LIMIT, |ctx| ctx.get_running_processes().is_empty()).await;

    assert!(log_contains(&out, "hello supervisor").await);
    assert!(log_contains(&err, "/definitely/not/a/real/path").await);
    assert_eq!(
        ctx.get_process("complainer").unwrap().state(),
        ProcessState::ExitError
    );
}

#[tokio::test]
async fn test_children_see_marker_and_task_environment() {
    let (mut ctx, logs) = create_context();
    let marker = Task::builder("marker")
        .command("printenv PROCESS_SUPERVISOR_ENABLED")
        .build()
        .unwrap();
    let greeting = Task::builder("greeting")
        .command("printenv GREETING")
        .environment("GREETING=bonjour; OTHER=1")
        .build()
        .unwrap();
    ctx.add_task(marker).unwrap();
    ctx.add_task(greeting).unwrap();
    ctx.start_task("marker").unwrap();
    ctx.start_task("greeting").unwrap();

    run_until(&mut ctx, LIMIT, |ctx| ctx.get_running_processes().is_empty()).await;

    assert_eq!(ctx.get_process("marker").unwrap().exit_code(), Some(0));
    assert_eq!(ctx.get_process("greeting").unwrap().exit_code(), Some(0));
    assert!(log_contains(&logs.path().join("marker/marker_out.log"), "1").await);
    assert!(log_contains(&logs.path().join("greeting/greeting_out.log"), "bonjour").await);
}

#[tokio::test]
async fn test_working_directory_and_configured_log_paths() {
    let (mut ctx, logs) = create_context();
    let workdir = tempfile::tempdir().unwrap();
    let workdir_path = workdir.path().canonicalize().unwrap();
    let out = logs.path().join("where.log");
    let task = Task::builder("where")
        .command("pwd")
        .directory(&workdir_path)
        .stdout_logfile("where.log")
        .build()
        .unwrap();
    ctx.add_task(task).unwrap();
    ctx.start_task("where").unwrap();
    assert_eq!(
        ctx.get_process("where").unwrap().stdout_logfile(),
        Some(out.as_path())
    );

    run_until(&mut ctx, LIMIT, |ctx| !ctx.is_running("where")).await;

    assert!(log_contains(&out, &workdir_path.display().to_string()).await);
}

#[tokio::test]
async fn test_bad_directory_or_log_parent_fails_start() {
    let (mut ctx, _logs) = create_context();
    let lost = Task::builder("lost")
        .command("true")
        .directory("/definitely/not/a/dir")
        .build()
        .unwrap();
    let orphan_log = Task::builder("orphan-log")
        .command("true")
        .stderr_logfile("/definitely/not/a/dir/err.log")
        .build()
        .unwrap();
    ctx.add_task(lost).unwrap();
    ctx.add_task(orphan_log).unwrap();

    assert!(matches!(
        ctx.start_task("lost"),
        Err(SupervisorError::RunError(_))
    ));
    assert!(matches!(
        ctx.start_task("orphan-log"),
        Err(SupervisorError::DictionaryNotExist(_))
    ));
    assert!(ctx.get_running_processes().is_empty());
    assert_eq!(ctx.get_stopped_processes().len(), 2);
}

#[tokio::test]
async fn test_auto_restart_is_bounded_by_retries() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    let flaky = Task::builder("flaky")
        .command("false")
        .auto_restart(true)
        .restart_retries(2)
        .build()
        .unwrap();
    ctx.add_task(flaky).unwrap();
    ctx.add_task(task("never-restarted", "false")).unwrap();
    ctx.start_task("flaky").unwrap();
    ctx.start_task("never-restarted").unwrap();

    let started = std::time::Instant::now();
    let log = events.clone();
    run_until(&mut ctx, LIMIT, move |_| {
        log.count(EventKind::TaskRunningError, "flaky") >= 3
            && started.elapsed() > Duration::from_millis(500)
    })
    .await;

    // Initial run plus two restarts.
    assert_eq!(events.count(EventKind::TaskRunning, "flaky"), 3);
    assert_eq!(events.count(EventKind::TaskRunningError, "flaky"), 3);
    assert_eq!(events.count(EventKind::TaskRunning, "never-restarted"), 1);
    assert_eq!(
        ctx.get_process("flaky").unwrap().state(),
        ProcessState::ExitError
    );
}

#[tokio::test]
async fn test_deleted_task_is_not_auto_restarted() {
    let logs = tempfile::tempdir().unwrap();
    let mut config = common::test_config(logs.path());
    config.restart_base_delay = Duration::from_millis(200);
    let mut ctx = process_supervisor::Context::new(&config);
    let events = EventLog::default();
    events.attach(&mut ctx);
    let flaky = Task::builder("flaky")
        .command("false")
        .auto_restart(true)
        .restart_retries(5)
        .build()
        .unwrap();
    ctx.add_task(flaky).unwrap();
    ctx.start_task("flaky").unwrap();

    ctx.subscribe(EventKind::TaskRunningError, |ctx, event| {
        let name = event.task_name().unwrap().to_string();
        ctx.delete_task(&name)?;
        Ok(process_supervisor::Propagation::Continue)
    });

    let started = std::time::Instant::now();
    run_until(&mut ctx, LIMIT, move |_| {
        started.elapsed() > Duration::from_millis(600)
    })
    .await;

    assert_eq!(events.count(EventKind::TaskRunning, "flaky"), 1);
    assert_eq!(events.count(EventKind::TaskDelete, "flaky"), 1);
}

#[tokio::test]
async fn test_stop_after_unreported_exit_is_harmless() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    ctx.add_task(task("quick", "true")).unwrap();
    ctx.start_task("quick").unwrap();

    // The child exits and is reaped, but the loop has not seen the report yet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.is_running("quick"));
    ctx.stop_task("quick").unwrap();
    assert_eq!(events.count(EventKind::TaskStop, "quick"), 1);

    let started = Instant::now();
    run_until(&mut ctx, LIMIT, move |_| {
        started.elapsed() > Duration::from_millis(100)
    })
    .await;

    let process = ctx.get_process("quick").unwrap();
    assert_eq!(process.state(), ProcessState::Stopped);
    assert_eq!(process.exit_code(), None);
    assert_eq!(events.count(EventKind::TaskFinish, "quick"), 0);
}

#[tokio::test]
async fn test_manual_start_supersedes_pending_auto_restart() {
    let logs = tempfile::tempdir().unwrap();
    let mut config = common::test_config(logs.path());
    config.restart_base_delay = Duration::from_millis(300);
    let mut ctx = process_supervisor::Context::new(&config);
    let events = EventLog::default();
    events.attach(&mut ctx);
    let flaky = Task::builder("flaky")
        .command("false")
        .auto_restart(true)
        .restart_retries(5)
        .build()
        .unwrap();
    ctx.add_task(flaky).unwrap();

    // 100ms after the first failure, start the task again by hand. The
    // restart that failure scheduled (due at 300ms) must then be dropped.
    let first_failure = Arc::new(Mutex::new(None::<Instant>));
    let seen = first_failure.clone();
    ctx.subscribe(EventKind::TaskRunningError, move |_, _| {
        seen.lock().get_or_insert_with(Instant::now);
        Ok(Propagation::Continue)
    });
    let restarted_by_hand = Arc::new(AtomicBool::new(false));
    let seen = first_failure.clone();
    let done = restarted_by_hand.clone();
    ctx.subscribe(EventKind::Heartbeat, move |ctx, _| {
        let due = seen
            .lock()
            .is_some_and(|at| at.elapsed() >= Duration::from_millis(100));
        if due && !done.swap(true, Ordering::SeqCst) {
            ctx.start_task("flaky")?;
        }
        Ok(Propagation::Continue)
    });
    ctx.start_task("flaky").unwrap();

    let started = Instant::now();
    run_until(&mut ctx, LIMIT, move |_| {
        started.elapsed() > Duration::from_millis(700)
    })
    .await;

    // First run, the manual start, and the one restart the manual run scheduled.
    assert!(restarted_by_hand.load(Ordering::SeqCst));
    assert_eq!(events.count(EventKind::TaskRunning, "flaky"), 3);
    assert_eq!(events.count(EventKind::TaskRunningError, "flaky"), 3);
}

#[tokio::test]
async fn test_background_children_die_with_their_task() {
    let (mut ctx, logs) = create_context();
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("spawn.sh"), "sleep 30 &\necho $!\n").unwrap();
    let spawner = Task::builder("spawner")
        .command("sh spawn.sh")
        .directory(workdir.path())
        .build()
        .unwrap();
    let events = EventLog::default();
    events.attach(&mut ctx);
    ctx.add_task(spawner).unwrap();
    ctx.start_task("spawner").unwrap();

    run_until(&mut ctx, LIMIT, |ctx| !ctx.is_running("spawner")).await;
    assert_eq!(events.count(EventKind::TaskFinish, "spawner"), 1);

    let out = logs.path().join("spawner").join("spawner_out.log");
    let pid = Arc::new(Mutex::new(None::<u32>));
    let found = pid.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let out = out.clone();
            let found = found.clone();
            async move {
                let parsed = tokio::fs::read_to_string(&out)
                    .await
                    .ok()
                    .and_then(|content| content.trim().parse::<u32>().ok());
                *found.lock() = parsed;
                parsed.is_some()
            }
        })
        .await
    );
    let grandchild = pid.lock().unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async move { !is_alive(grandchild) }).await
    );
}
