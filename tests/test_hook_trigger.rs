mod common;

use std::time::Duration;

use process_supervisor::{
    Event, EventKind, HookTrigger, Mod, ModConfig, SupervisorError, Task,
};

use common::{create_context, run_until, task, EventLog};

fn hooked(name: &str, command: &str, triggers: &str) -> Task {
    Task::builder(name)
        .command(command)
        .trigger_events(triggers)
        .build()
        .unwrap()
}

async fn hook_trigger(ctx: &mut process_supervisor::Context) -> HookTrigger {
    let trigger = HookTrigger::new();
    trigger.setup_mod(ctx, &ModConfig::default()).await.unwrap();
    trigger
}

#[tokio::test]
async fn test_finish_of_hook_task_starts_dependent() {
    let (mut ctx, _logs) = create_context();
    let trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(task("A", "true")).unwrap();
    ctx.add_task(hooked("B", "sleep 30", "TASK_FINISH__A")).unwrap();
    assert_eq!(
        trigger.hooked_tasks(EventKind::TaskFinish, "A"),
        vec!["B".to_string()]
    );

    ctx.publish(Event::TaskFinish {
        task_name: "A".into(),
    })
    .unwrap();

    assert!(ctx.is_running("B"));
    assert!(!ctx.is_running("A"));
    ctx.stop_task("B").unwrap();
}

#[tokio::test]
async fn test_event_names_are_case_insensitive_and_other_kinds_ignored() {
    let (mut ctx, _logs) = create_context();
    let trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(task("A", "sleep 30")).unwrap();
    ctx.add_task(hooked("B", "sleep 30", "task_stop__A")).unwrap();
    assert_eq!(
        trigger.hooked_tasks(EventKind::TaskStop, "A"),
        vec!["B".to_string()]
    );

    ctx.start_task("A").unwrap();
    assert!(!ctx.is_running("B"));

    ctx.stop_task("A").unwrap();
    assert!(ctx.is_running("B"));
    ctx.stop_task("B").unwrap();
}

#[tokio::test]
async fn test_unknown_event_name_is_rejected() {
    let (mut ctx, _logs) = create_context();
    let trigger = hook_trigger(&mut ctx).await;

    let err = Task::builder("B")
        .command("true")
        .trigger_events("TASK_EXPLODED__A")
        .build()
        .unwrap_err();
    assert!(matches!(err.root(), SupervisorError::UnknownEvent(name) if name == "TASK_EXPLODED"));
    assert!(matches!(
        ctx.get_process("B"),
        Err(SupervisorError::TaskNotFound(_))
    ));
    assert!(trigger.hooked_tasks(EventKind::TaskFinish, "A").is_empty());
}

#[tokio::test]
async fn test_system_setup_backfills_without_duplicates() {
    let (mut ctx, _logs) = create_context();
    ctx.add_task(task("A", "true")).unwrap();
    ctx.add_task(hooked("B", "true", "TASK_FINISH__A TASK_RUNNING_ERROR__A"))
        .unwrap();
    let trigger = hook_trigger(&mut ctx).await;
    assert!(trigger.hooked_tasks(EventKind::TaskFinish, "A").is_empty());

    ctx.publish(Event::SystemSetup).unwrap();
    ctx.publish(Event::SystemSetup).unwrap();

    assert_eq!(
        trigger.hooked_tasks(EventKind::TaskFinish, "A"),
        vec!["B".to_string()]
    );
    assert_eq!(
        trigger.hooked_tasks(EventKind::TaskRunningError, "A"),
        vec!["B".to_string()]
    );
}

#[tokio::test]
async fn test_deleted_task_is_unhooked() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    let trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(task("A", "true")).unwrap();
    ctx.add_task(hooked("B", "true", "TASK_FINISH__A")).unwrap();
    ctx.add_task(hooked("C", "sleep 30", "TASK_FINISH__A")).unwrap();

    ctx.delete_task("B").unwrap();
    assert_eq!(
        trigger.hooked_tasks(EventKind::TaskFinish, "A"),
        vec!["C".to_string()]
    );

    ctx.publish(Event::TaskFinish {
        task_name: "A".into(),
    })
    .unwrap();
    assert!(ctx.is_running("C"));
    assert_eq!(events.count(EventKind::TaskPreStart, "B"), 0);
    ctx.stop_task("C").unwrap();
}

#[tokio::test]
async fn test_mutual_hooks_do_not_loop() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    let _trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(hooked("A", "sleep 30", "TASK_RUNNING__B")).unwrap();
    ctx.add_task(hooked("B", "sleep 30", "TASK_RUNNING__A")).unwrap();

    ctx.start_task("A").unwrap();

    assert!(ctx.is_running("A"));
    assert!(ctx.is_running("B"));
    assert_eq!(events.count(EventKind::TaskRunning, "A"), 1);
    assert_eq!(events.count(EventKind::TaskRunning, "B"), 1);
    ctx.stop_task("A").unwrap();
    ctx.stop_task("B").unwrap();
}

#[tokio::test]
async fn test_chain_runs_through_the_loop() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    let _trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(task("extract", "true")).unwrap();
    ctx.add_task(hooked("transform", "true", "TASK_FINISH__extract"))
        .unwrap();
    ctx.add_task(hooked("load", "true", "TASK_FINISH__transform"))
        .unwrap();
    ctx.start_task("extract").unwrap();

    let log = events.clone();
    run_until(&mut ctx, Duration::from_secs(10), move |_| {
        log.count(EventKind::TaskFinish, "load") == 1
    })
    .await;

    for name in ["extract", "transform", "load"] {
        assert_eq!(events.count(EventKind::TaskFinish, name), 1);
        assert_eq!(ctx.get_process(name).unwrap().exit_code(), Some(0));
    }
}

#[tokio::test]
async fn test_failed_hook_publishes_finish_error() {
    let (mut ctx, _logs) = create_context();
    let events = EventLog::default();
    events.attach(&mut ctx);
    let _trigger = hook_trigger(&mut ctx).await;
    ctx.add_task(task("A", "true")).unwrap();
    ctx.add_task(hooked("B", "no-such-binary-on-this-host", "TASK_FINISH__A"))
        .unwrap();
    ctx.start_task("A").unwrap();

    let log = events.clone();
    run_until(&mut ctx, Duration::from_secs(10), move |_| {
        log.count(EventKind::TaskFinishError, "A") == 1
    })
    .await;

    assert_eq!(events.count(EventKind::TaskFinish, "A"), 1);
    assert_eq!(events.count(EventKind::TaskRunning, "B"), 0);
    assert_eq!(
        ctx.get_process("A").unwrap().state(),
        process_supervisor::ProcessState::ExitNormal
    );
}
