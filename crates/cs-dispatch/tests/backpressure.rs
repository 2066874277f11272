use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cs_dispatch::{
    count_statuses, read_records, DispatcherConfig, JobCommand, JobDispatcher, JobHandle, JobSpec,
    JobStatus, ResultLog, SimulatedBackend, SimulatedOutcome,
};
use cs_types::{EvaluationResult, FailureKind, InstanceId, SolveStatus, SolverReport};
use tokio::time::Instant;
use uuid::Uuid;

fn job(configuration: Uuid, instance: &str, timeout: Duration) -> JobSpec {
    JobSpec::new(
        configuration,
        InstanceId::new(instance),
        JobCommand::new("solver", vec![instance.to_string()]),
        timeout,
    )
}

fn config(max_in_flight: usize) -> DispatcherConfig {
    DispatcherConfig::default()
        .with_max_in_flight(max_in_flight)
        .with_poll_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn in_flight_bound_is_never_exceeded() {
    let backend = Arc::new(SimulatedBackend::new(|_| {
        SimulatedOutcome::report(
            &SolverReport::solved(SolveStatus::Optimal, 1.0),
            Duration::from_millis(20),
        )
    }));
    let dispatcher = JobDispatcher::new(backend.clone(), config(3));
    let configuration = Uuid::new_v4();

    let handles: Vec<JobHandle> = (0..20)
        .map(|i| dispatcher.submit(job(configuration, &format!("inst-{i}"), Duration::from_secs(10))))
        .collect();

    // Submissions beyond the bound are queued, not sent to the backend.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(dispatcher.in_flight() <= 3);
    assert!(backend.submissions() <= 3);

    let statuses = dispatcher
        .wait_all(&handles, Instant::now() + Duration::from_secs(10))
        .await;
    let (succeeded, failed, timed_out) = count_statuses(statuses.iter().map(|(_, s)| s));
    assert_eq!((succeeded, failed, timed_out), (20, 0, 0));

    assert_eq!(backend.submissions(), 20);
    assert!(backend.max_active() <= 3);
    assert!(backend.max_active() >= 2);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn slow_jobs_time_out_without_stalling_the_rest() {
    let backend = Arc::new(SimulatedBackend::new(|command| {
        if command.args.first().map(String::as_str) == Some("slow") {
            SimulatedOutcome::Hang
        } else {
            SimulatedOutcome::report(
                &SolverReport::solved(SolveStatus::Optimal, 2.0),
                Duration::from_millis(5),
            )
        }
    }));
    let dispatcher = JobDispatcher::new(backend.clone(), config(2));
    let configuration = Uuid::new_v4();

    let mut handles = vec![dispatcher.submit(job(configuration, "slow", Duration::from_millis(80)))];
    handles.extend(
        (0..6).map(|i| dispatcher.submit(job(configuration, &format!("fast-{i}"), Duration::from_secs(5)))),
    );

    let statuses = dispatcher
        .wait_all(&handles, Instant::now() + Duration::from_secs(5))
        .await;
    assert!(matches!(statuses[0].1, JobStatus::TimedOut(_)));
    assert!(statuses[1..]
        .iter()
        .all(|(_, s)| matches!(s, JobStatus::Succeeded(_))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.cancellations(), 1);
    assert_eq!(backend.active(), 0);
}

#[tokio::test]
async fn failures_are_classified_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("evaluations.jsonl");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let backend = Arc::new(SimulatedBackend::new(move |command| {
        counter.fetch_add(1, Ordering::SeqCst);
        match command.args.first().map(String::as_str) {
            Some("crash") => SimulatedOutcome::exit(137, "", Duration::from_millis(1)),
            Some("garbage") => SimulatedOutcome::exit(0, "presolving...\n", Duration::from_millis(1)),
            Some("solver-error") => SimulatedOutcome::exit(
                0,
                r#"{"status":"error","solve_time":0.0,"message":"out of memory"}"#,
                Duration::from_millis(1),
            ),
            Some("offline") => SimulatedOutcome::Unreachable {
                message: "connection refused".into(),
            },
            _ => SimulatedOutcome::report(
                &SolverReport::solved(SolveStatus::Optimal, 7.5),
                Duration::from_millis(1),
            ),
        }
    }));
    let dispatcher = JobDispatcher::with_result_log(
        backend,
        config(4),
        ResultLog::open(&log_path).unwrap(),
    );
    let configuration = Uuid::new_v4();

    let names = ["crash", "garbage", "solver-error", "offline", "ok"];
    let handles: Vec<JobHandle> = names
        .iter()
        .map(|name| dispatcher.submit(job(configuration, name, Duration::from_secs(5))))
        .collect();
    let statuses = dispatcher
        .wait_all(&handles, Instant::now() + Duration::from_secs(5))
        .await;

    let kinds: Vec<Option<FailureKind>> = statuses
        .iter()
        .map(|(_, s)| s.result().and_then(|r| r.outcome.failure_kind()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some(FailureKind::NonZeroExit),
            Some(FailureKind::MalformedOutput),
            Some(FailureKind::SolverError),
            Some(FailureKind::BackendUnreachable),
            None,
        ]
    );
    assert_eq!(statuses[4].1.result().unwrap().outcome.score(), Some(7.5));
    assert_eq!(calls.load(Ordering::SeqCst), names.len());

    let mut logged: Vec<EvaluationResult> = read_records(&log_path).unwrap();
    logged.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    let logged_ids: Vec<&str> = logged.iter().map(|r| r.instance_id.as_str()).collect();
    assert_eq!(
        logged_ids,
        vec!["crash", "garbage", "offline", "ok", "solver-error"]
    );
    assert!(logged.iter().all(|r| r.configuration_id == configuration));
}

#[tokio::test]
async fn cancelled_jobs_are_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("evaluations.jsonl");
    let backend = Arc::new(SimulatedBackend::new(|_| SimulatedOutcome::Hang));
    let dispatcher = JobDispatcher::with_result_log(
        backend.clone(),
        config(1),
        ResultLog::open(&log_path).unwrap(),
    );
    let configuration = Uuid::new_v4();

    // One job holds the only slot, the second waits in the queue.
    let running = dispatcher.submit(job(configuration, "a", Duration::from_secs(60)));
    let queued = dispatcher.submit(job(configuration, "b", Duration::from_secs(60)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dispatcher.in_flight(), 1);
    assert_eq!(backend.submissions(), 1);

    dispatcher.cancel_all(&[running, queued]);
    for handle in [running, queued] {
        let status = dispatcher.wait(handle).await.unwrap();
        assert_eq!(
            status.result().unwrap().outcome.failure_kind(),
            Some(FailureKind::Cancelled)
        );
    }
    assert_eq!(backend.submissions(), 1);
    assert!(read_records::<EvaluationResult>(&log_path).unwrap().is_empty());
}
