use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use convoy::core::task::{Task, TaskId, TaskStatus};
use convoy::orchestrator::{Orchestrator, OrchestratorEvent};
use convoy::session::SessionStatus;
use convoy::Error;

use crate::fixtures::TestRepo;

#[tokio::test]
async fn test_diamond_executes_to_completion() {
    let repo = TestRepo::new();
    let command = repo.script("ok.sh", "exit 0\n");
    let config = repo.config(&command, 4);

    let tasks = vec![
        Task::new("a", "A"),
        Task::new("b", "B").depends_on("a"),
        Task::new("c", "C").depends_on("a"),
        Task::new("d", "D").depends_on("b").depends_on("c"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let summary = orchestrator.execute(tasks).await.unwrap();

    assert_eq!(summary.total, 4);
    assert_eq!(summary.completed, 4);
    assert!(summary.all_completed());
    assert_eq!(
        summary.statuses.get(&TaskId::from("d")),
        Some(&TaskStatus::Completed)
    );
}

#[tokio::test]
async fn test_dependency_order_is_respected() {
    let repo = TestRepo::new();
    let log = repo.scratch("order.log");
    let command = repo.script(
        "record.sh",
        &format!("echo \"$1\" >> {}\nexit 0\n", log.display()),
    );
    let config = repo.config(&command, 4);

    let tasks = vec![
        Task::new("a", "a"),
        Task::new("b", "b").depends_on("a"),
        Task::new("c", "c").depends_on("b"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let summary = orchestrator.execute(tasks).await.unwrap();
    assert!(summary.all_completed());

    let recorded = std::fs::read_to_string(&log).unwrap();
    let order: Vec<&str> = recorded.lines().collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_failure_cancels_dependents_only() {
    let repo = TestRepo::new();
    // The fake agent fails when its title starts with "fail".
    let command = repo.script(
        "maybe-fail.sh",
        "case \"$1\" in fail*) exit 1;; esac\nexit 0\n",
    );
    let config = repo.config(&command, 4);

    let tasks = vec![
        Task::new("a", "ok"),
        Task::new("b", "fail-here").depends_on("a"),
        Task::new("c", "ok").depends_on("a"),
        Task::new("d", "ok").depends_on("b"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let summary = orchestrator.execute(tasks).await.unwrap();

    assert_eq!(summary.completed, 2); // a and c
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 1);
    assert!(matches!(
        summary.statuses.get(&TaskId::from("b")),
        Some(TaskStatus::Failed { .. })
    ));
    assert_eq!(
        summary.statuses.get(&TaskId::from("d")),
        Some(&TaskStatus::Cancelled)
    );
    assert_eq!(
        summary.statuses.get(&TaskId::from("c")),
        Some(&TaskStatus::Completed)
    );
}

#[tokio::test]
async fn test_next_wave_waits_for_full_wave_even_under_failure() {
    let repo = TestRepo::new();
    let log = repo.scratch("barrier.log");
    // One wave-1 task fails instantly, the other takes a while; the
    // wave-2 task must still wait out the whole wave.
    let command = repo.script(
        "barrier.sh",
        &format!(
            "case \"$1\" in\n  fail*) exit 1;;\n  slow*) sleep 0.3; echo \"$1\" >> {log}; exit 0;;\n  *) echo \"$1\" >> {log}; exit 0;;\nesac\n",
            log = log.display()
        ),
    );
    let config = repo.config(&command, 4);

    let tasks = vec![
        Task::new("a", "fail-a"),
        Task::new("b", "slow-b"),
        Task::new("c", "c").depends_on("b"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let summary = orchestrator.execute(tasks).await.unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    let recorded = std::fs::read_to_string(&log).unwrap();
    let order: Vec<&str> = recorded.lines().collect();
    assert_eq!(order, vec!["slow-b", "c"]);
}

#[tokio::test]
async fn test_global_concurrency_bound_holds() {
    let repo = TestRepo::new();
    let command = repo.script("slow.sh", "sleep 0.3\nexit 0\n");
    let config = repo.config(&command, 2);

    let tasks: Vec<Task> = (0..6).map(|i| Task::new(format!("t{}", i), "T")).collect();

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let registry = orchestrator.registry();

    let handle = tokio::spawn(async move { orchestrator.execute(tasks).await });

    let mut max_running = 0usize;
    while !handle.is_finished() {
        let running = registry
            .read()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .count();
        max_running = max_running.max(running);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.completed, 6);
    assert!(
        max_running <= 2,
        "observed {} concurrent sessions, bound is 2",
        max_running
    );
}

#[tokio::test]
async fn test_stop_cancels_live_and_pending_tasks() {
    let repo = TestRepo::new();
    let command = repo.script("hang.sh", "sleep 10\nexit 0\n");
    let config = repo.config(&command, 2);

    let tasks = vec![
        Task::new("a", "A"),
        Task::new("b", "B"),
        Task::new("c", "C"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let stop = orchestrator.stop_handle();

    let started = Instant::now();
    let handle = tokio::spawn(async move { orchestrator.execute(tasks).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.stop();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.cancelled, 3);
    // Grace period is 50ms; the run winds down well before the 10s sleeps.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cycle_fails_before_touching_workspaces() {
    let repo = TestRepo::new();
    let command = repo.script("ok.sh", "exit 0\n");
    let config = repo.config(&command, 4);
    let workspace_root = repo.tmp.path().join("ws");

    let tasks = vec![
        Task::new("a", "A").depends_on("b"),
        Task::new("b", "B").depends_on("a"),
    ];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let err = orchestrator.execute(tasks).await.unwrap_err();
    assert!(matches!(err, Error::DependencyCycle { .. }));
    assert!(!workspace_root.join("repo").join("a").exists());
}

#[tokio::test]
async fn test_missing_agent_fails_fast() {
    let repo = TestRepo::new();
    let config = repo.config("definitely-not-a-real-binary-xyz", 4);

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let err = orchestrator
        .execute(vec![Task::new("a", "A")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentNotAvailable(_)));
}

#[tokio::test]
async fn test_progress_events_are_emitted() {
    let repo = TestRepo::new();
    let command = repo.script("noisy.sh", "echo working on \"$1\"\nexit 0\n");
    let config = repo.config(&command, 4);

    let tasks = vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")];

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    let (tx, mut rx) = mpsc::channel(1024);
    orchestrator.set_event_sender(tx);

    let summary = orchestrator.execute(tasks).await.unwrap();
    assert!(summary.all_completed());
    drop(orchestrator);

    let mut wave_starts = 0;
    let mut created = 0;
    let mut completions = 0;
    let mut saw_output = false;
    while let Some(event) = rx.recv().await {
        match event {
            OrchestratorEvent::WaveStarted { .. } => wave_starts += 1,
            OrchestratorEvent::SessionCreated { .. } => created += 1,
            OrchestratorEvent::TaskCompleted { .. } => completions += 1,
            OrchestratorEvent::TaskOutput { line, .. } => {
                saw_output = saw_output || line.contains("working on");
            }
            _ => {}
        }
    }
    assert_eq!(wave_starts, 2);
    assert_eq!(created, 2);
    assert_eq!(completions, 2);
    assert!(saw_output);
}

#[tokio::test]
async fn test_stop_before_execute_launches_nothing() {
    // The orchestrator is one-shot: a stop that lands before execute must
    // keep the admission loop from launching even the first burst.
    let repo = TestRepo::new();
    let marker = repo.scratch("ran.marker");
    let command = repo.script(
        "mark.sh",
        &format!("echo ran >> {}\nexit 0\n", marker.display()),
    );
    let config = repo.config(&command, 2);

    let mut orchestrator = Orchestrator::new(config, &repo.repo_dir).unwrap();
    orchestrator.stop_handle().stop();

    let summary = orchestrator
        .execute(vec![Task::new("a", "A"), Task::new("b", "B")])
        .await
        .unwrap();
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.cancelled, 2);
    assert!(!marker.exists(), "a session ran after stop was requested");
}
