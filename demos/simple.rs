use std::time::Duration;

use process_supervisor::{Result, SupervisorBuilder, Task};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("process_supervisor=info").init();

    // `tick` runs every five seconds; `tock` runs each time `tick` finishes.
    let tick = Task::builder("tick")
        .command("date")
        .cron_expression("*/5 * * * * *")
        .build()?;
    let tock = Task::builder("tock")
        .command("echo tock")
        .trigger_events("TASK_FINISH__tick")
        .build()?;
    let flaky = Task::builder("flaky")
        .command("ls /no/such/path")
        .auto_restart(true)
        .restart_retries(3)
        .build()?;

    let supervisor = SupervisorBuilder::new()
        .with_heartbeat_interval(Duration::from_millis(500))
        .with_log_dir("demo-logs")
        .with_builtin_mods()
        .with_task(tick)
        .with_task(tock)
        .with_task(flaky)
        .build()?;

    let handle = supervisor.run();
    handle.start_task("flaky").await.ok();

    tokio::time::sleep(Duration::from_secs(12)).await;
    for (name, info) in handle.get_all_processes().await.unwrap_or_default() {
        println!("{name}: {} (exit code {:?})", info.state, info.exit_code);
    }

    handle.shutdown().ok();
    handle.wait().await.ok();
    Ok(())
}
