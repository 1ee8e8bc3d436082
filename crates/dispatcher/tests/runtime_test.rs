mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;

use common::{
    config, dynamic_worker, start, start_with, worker, Harness, RecordingMonitor, ScriptedJobs,
    APP,
};
use dataflow_core::{CoreElementConfig, ImplementationConfig, ResourcesConfig, SchedulerError};
use dataflow_domain::{
    AccessMode, DataLocation, Direction, Parameter, ParameterValue, ResourceDescription,
    TaskDescription, TaskMonitor, TransferReason,
};
use dataflow_worker::WorkerSet;

fn increment(name: &str, parameters: Vec<Parameter>) -> TaskDescription {
    TaskDescription::new(0, name, parameters)
}

fn watch(monitor: &Arc<RecordingMonitor>) -> Option<Arc<dyn TaskMonitor>> {
    let monitor: Arc<dyn TaskMonitor> = monitor.clone();
    Some(monitor)
}

fn failed_tasks(result: Result<(), SchedulerError>) -> Vec<u64> {
    match result {
        Err(SchedulerError::ApplicationFailed { failed_tasks, .. }) => failed_tasks,
        other => panic!("expected application failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_job_resubmitted_on_same_worker_until_success() {
    let h = start_with(config(vec![worker("w1", 1)]), ScriptedJobs::failing_first(2));
    let monitor = Arc::new(RecordingMonitor::default());

    let task_id = h
        .runtime
        .execute_task(APP, increment("inc", vec![Parameter::basic(json!(1))]), watch(&monitor))
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    assert_eq!(h.jobs.workers_of(task_id), vec!["w1", "w1", "w1"]);
    assert_eq!(monitor.count("submission"), 3);
    assert_eq!(monitor.count("error"), 2);
    assert_eq!(monitor.count("success"), 1);
    assert_eq!(monitor.count("completion"), 1);
}

#[tokio::test]
async fn test_exhausted_worker_reschedules_elsewhere() {
    let h = start_with(
        config(vec![worker("w1", 1), worker("w2", 1)]),
        ScriptedJobs::failing_on_worker("w1"),
    );

    let task_id = h
        .runtime
        .execute_task(APP, increment("inc", vec![]), None)
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    assert_eq!(h.jobs.workers_of(task_id), vec!["w1", "w1", "w1", "w2"]);
}

#[tokio::test]
async fn test_task_fails_after_every_worker_is_tried() {
    let h = start_with(
        config(vec![worker("w1", 1), worker("w2", 1)]),
        ScriptedJobs::failing_task("doomed"),
    );
    let monitor = Arc::new(RecordingMonitor::default());

    let task_id = h
        .runtime
        .execute_task(APP, increment("doomed", vec![]), watch(&monitor))
        .await
        .unwrap();
    let result = h.runtime.barrier(APP).await;

    assert_eq!(failed_tasks(result), vec![task_id]);
    assert_eq!(h.jobs.workers_of(task_id).len(), 6);
    let failure = monitor
        .events()
        .into_iter()
        .find(|e| e.starts_with("failed:"))
        .unwrap();
    assert!(failure.contains("doomed"));
    assert!(failure.contains("job[1|2|3|4|5|6]"));
    assert_eq!(monitor.count("completion"), 1);
}

#[tokio::test]
async fn test_failure_cancels_dependents_but_not_unrelated_tasks() {
    let h = start_with(
        config(vec![worker("w1", 1)]),
        ScriptedJobs::failing_task("bad"),
    );
    let ok_monitor = Arc::new(RecordingMonitor::default());

    let bad = h
        .runtime
        .execute_task(
            APP,
            increment("bad", vec![Parameter::object(Direction::Out, 1, json!(0))]),
            None,
        )
        .await
        .unwrap();
    h.runtime
        .execute_task(
            APP,
            increment(
                "dependent",
                vec![
                    Parameter::object(Direction::In, 1, json!(0)),
                    Parameter::object(Direction::Out, 2, json!(0)),
                ],
            ),
            None,
        )
        .await
        .unwrap();
    h.runtime
        .execute_task(
            APP,
            increment(
                "transitive",
                vec![Parameter::object(Direction::In, 2, json!(0))],
            ),
            None,
        )
        .await
        .unwrap();
    h.runtime
        .execute_task(
            APP,
            increment("unrelated", vec![Parameter::object(Direction::Out, 3, json!(0))]),
            watch(&ok_monitor),
        )
        .await
        .unwrap();

    let result = h.runtime.barrier(APP).await;
    assert_eq!(failed_tasks(result), vec![bad]);
    assert_eq!(ok_monitor.count("success"), 1);

    let report = h.runtime.task_report().await;
    let app = &report.apps[0];
    assert_eq!(app.total, 4);
    assert_eq!(app.in_progress, 0);
    assert_eq!(app.completed, 1);
    assert_eq!(app.failed, 1);
    assert_eq!(app.canceled, 2);
}

#[tokio::test]
async fn test_input_transfer_abandoned_after_retry_bound() {
    let h = start(config(vec![worker("w1", 1)]));
    h.transfers.fail_staging();

    let task_id = h
        .runtime
        .execute_task(
            APP,
            increment(
                "reader",
                vec![Parameter::file(Direction::In, "master", "/data/in.txt")],
            ),
            None,
        )
        .await
        .unwrap();
    let result = h.runtime.barrier(APP).await;

    assert_eq!(failed_tasks(result), vec![task_id]);
    assert_eq!(h.transfers.requests(TransferReason::InputStaging).len(), 2);
    assert!(h.jobs.submitted().is_empty());
}

#[tokio::test]
async fn test_inputs_staged_from_master() {
    let h = start(config(vec![worker("w1", 1)]));

    h.runtime
        .execute_task(
            APP,
            increment(
                "reader",
                vec![Parameter::file(Direction::In, "master", "/data/in.txt")],
            ),
            None,
        )
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    let staged = h.transfers.requests(TransferReason::InputStaging);
    assert_eq!(staged.len(), 1);
    assert_eq!(
        staged[0].source,
        Some(DataLocation::file("master", "/data/in.txt"))
    );
    assert_eq!(
        staged[0].target,
        DataLocation::file("w1", format!("/tmp/dataflow/worker/{}", staged[0].data))
    );
}

#[tokio::test]
async fn test_resident_inputs_skip_transfer_and_results_return() {
    let h = start(config(vec![worker("w1", 1)]));

    h.runtime
        .execute_task(
            APP,
            increment(
                "writer",
                vec![Parameter::file(Direction::Out, "master", "/out.txt")],
            ),
            None,
        )
        .await
        .unwrap();
    h.runtime
        .execute_task(
            APP,
            increment(
                "reader",
                vec![Parameter::file(Direction::In, "master", "/out.txt")],
            ),
            None,
        )
        .await
        .unwrap();
    let written = h.runtime.end_of_application(APP).await.unwrap();
    let out = h
        .runtime
        .data_id_of(&ParameterValue::File {
            host: "master".to_string(),
            path: "/out.txt".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(written, vec![out]);

    assert!(h.transfers.requests(TransferReason::InputStaging).is_empty());
    let results = h.transfers.requests(TransferReason::ResultFile);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].target, DataLocation::file("master", "/out.txt"));
}

#[tokio::test]
async fn test_generated_object_reaches_application() {
    let h = start(config(vec![worker("w1", 1)]));
    let monitor = Arc::new(RecordingMonitor::default());

    h.runtime
        .execute_task(
            APP,
            increment("produce", vec![Parameter::object(Direction::Out, 9, json!(0))]),
            watch(&monitor),
        )
        .await
        .unwrap();

    let data_id = h
        .runtime
        .data_id_of(&ParameterValue::Object {
            code: 9,
            value: json!(0),
            persistent_id: None,
        })
        .await
        .unwrap();
    let snapshot = h
        .runtime
        .wait_for_data(data_id, AccessMode::Read)
        .await
        .unwrap();

    assert_eq!(snapshot.instance.version, 2);
    assert_eq!(snapshot.value, Some(json!(1)));
    let location = DataLocation::object("w1", snapshot.instance.renaming());
    assert!(snapshot.locations.contains(&location));
    assert_eq!(
        monitor.events(),
        vec![
            "creation".to_string(),
            "schedule:w1".to_string(),
            "submission:1".to_string(),
            format!("value:0:{location}"),
            "success".to_string(),
            "completion".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_replicated_task_runs_once_per_worker() {
    let h = start(config(vec![
        worker("w1", 1),
        worker("w2", 1),
        worker("w3", 1),
    ]));

    let task_id = h
        .runtime
        .execute_task(APP, increment("setup", vec![]).replicated(), None)
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    let mut workers = h.jobs.workers_of(task_id);
    workers.sort();
    assert_eq!(workers, vec!["w1", "w2", "w3"]);
    assert_eq!(h.runtime.task_report().await.apps[0].completed, 1);
}

#[tokio::test]
async fn test_distributed_tasks_round_robin() {
    let h = start(config(vec![worker("w1", 1), worker("w2", 1)]));

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            h.runtime
                .execute_task(APP, increment("part", vec![]).distributed(), None)
                .await
                .unwrap(),
        );
    }
    h.runtime.barrier(APP).await.unwrap();

    let placed: Vec<Vec<String>> = ids.iter().map(|id| h.jobs.workers_of(*id)).collect();
    assert_eq!(
        placed,
        vec![vec!["w1"], vec!["w2"], vec!["w1"], vec!["w2"]]
    );
}

#[tokio::test]
async fn test_read_write_persistent_object_gets_new_version() {
    let h = start(config(vec![worker("w1", 1)]));

    h.runtime
        .execute_task(
            APP,
            increment("update", vec![Parameter::persistent(Direction::InOut, "obj-1")]),
            None,
        )
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    assert_eq!(
        h.storage.calls(),
        vec![("obj-1".to_string(), false, "w1".to_string())]
    );
    let jobs = h.jobs.submitted();
    assert_eq!(jobs[0].parameters[0].persistent_id.as_deref(), Some("obj-1.v1"));
}

#[tokio::test]
async fn test_storage_failure_is_not_retried() {
    let h = start(config(vec![worker("w1", 1), worker("w2", 1)]));
    h.storage.break_backend();

    let task_id = h
        .runtime
        .execute_task(
            APP,
            increment("update", vec![Parameter::persistent(Direction::InOut, "obj-1")]),
            None,
        )
        .await
        .unwrap();
    let result = h.runtime.barrier(APP).await;

    assert_eq!(failed_tasks(result), vec![task_id]);
    assert_eq!(h.storage.calls().len(), 1);
    assert!(h.jobs.submitted().is_empty());
}

#[tokio::test]
async fn test_barrier_without_tasks_returns_immediately() {
    let h = start(config(vec![worker("w1", 1)]));
    h.runtime.barrier(7).await.unwrap();
}

#[tokio::test]
async fn test_closed_application_rejects_tasks() {
    let h = start(config(vec![worker("w1", 1)]));
    h.runtime.end_of_application(APP).await.unwrap();

    let err = h
        .runtime
        .execute_task(APP, increment("late", vec![]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ApplicationClosed { app_id: APP }));
}

#[tokio::test]
async fn test_unknown_core_element_rejected() {
    let h = start(config(vec![worker("w1", 1)]));
    let err = h
        .runtime
        .execute_task(APP, TaskDescription::new(5, "missing", vec![]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownCoreElement { id: 5 }));
}

#[tokio::test]
async fn test_core_element_registered_at_runtime() {
    let h = start(config(vec![worker("w1", 1)]));
    let core_id = h
        .runtime
        .register_core_element(CoreElementConfig {
            signature: "double()".to_string(),
            implementations: vec![ImplementationConfig {
                kind: "binary".to_string(),
                target: "/usr/bin/double".to_string(),
                cpu_cores: 1,
                gpus: 0,
                memory_mb: 0,
                processes: None,
            }],
        })
        .await
        .unwrap();
    assert_eq!(core_id, 1);

    let task_id = h
        .runtime
        .execute_task(APP, TaskDescription::new(core_id, "double", vec![]), None)
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();
    assert_eq!(h.jobs.workers_of(task_id), vec!["w1"]);
}

#[tokio::test]
async fn test_added_worker_picks_up_waiting_tasks() {
    let h = start(config(vec![]));

    let task_id = h
        .runtime
        .execute_task(APP, increment("inc", vec![]), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.jobs.submitted().is_empty());

    h.runtime.add_worker_config(&worker("late", 2)).await.unwrap();
    h.runtime.barrier(APP).await.unwrap();
    assert_eq!(h.jobs.workers_of(task_id), vec!["late"]);
}

#[tokio::test]
async fn test_resize_unknown_worker_fails() {
    let h = start(config(vec![worker("w1", 1)]));
    h.runtime
        .resize_worker("w1", ResourceDescription::cores(2), true)
        .await
        .unwrap();
    let err = h
        .runtime
        .resize_worker("ghost", ResourceDescription::cores(1), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::WorkerNotFound { .. }));
}

#[tokio::test]
async fn test_draining_worker_removed_after_running_actions() {
    let gate = Arc::new(Semaphore::new(0));
    let Harness { runtime, jobs, .. } = start_with(
        config(vec![worker("w1", 1), dynamic_worker("w2", 1)]),
        ScriptedJobs::gated(gate.clone()),
    );
    let runtime = Arc::new(runtime);

    let first = runtime
        .execute_task(APP, increment("a", vec![]), None)
        .await
        .unwrap();
    let second = runtime
        .execute_task(APP, increment("b", vec![]), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(jobs.workers_of(first), vec!["w1"]);
    assert_eq!(jobs.workers_of(second), vec!["w2"]);

    let err = runtime.remove_worker("w1").await.unwrap_err();
    assert!(matches!(err, SchedulerError::CriticalWorker { .. }));

    let removal = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.remove_worker("w2").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!removal.is_finished());

    gate.add_permits(2);
    removal.await.unwrap().unwrap();
    runtime.barrier(APP).await.unwrap();

    let names: Vec<String> = runtime
        .pool_state()
        .await
        .workers
        .into_iter()
        .map(|(name, _, _)| name)
        .collect();
    assert_eq!(names, vec!["w1"]);
    runtime.shutdown().await.unwrap();
}

fn elastic(min_vms: u32, max_vms: u32) -> ResourcesConfig {
    ResourcesConfig {
        min_vms,
        initial_vms: min_vms,
        max_vms,
    }
}

#[tokio::test]
async fn test_confirmed_creation_picks_up_waiting_tasks() {
    let mut cfg = config(vec![]);
    cfg.resources = elastic(0, 1);
    let h = start(cfg);

    let task_id = h
        .runtime
        .execute_task(APP, increment("inc", vec![]), None)
        .await
        .unwrap();
    let request = h
        .runtime
        .request_creation(Some("cloud".to_string()), ResourceDescription::cores(2))
        .await
        .unwrap();
    assert_eq!(h.runtime.pool_state().await.pending_creations, 1);
    let err = h
        .runtime
        .request_creation(None, ResourceDescription::cores(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ElasticLimit { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.jobs.submitted().is_empty());

    h.runtime
        .confirm_creation(request, &worker("vm-1", 2))
        .await
        .unwrap();
    h.runtime.barrier(APP).await.unwrap();

    assert_eq!(h.jobs.workers_of(task_id), vec!["vm-1"]);
    let state = h.runtime.pool_state().await;
    assert_eq!(state.pending_creations, 0);
    assert_eq!(state.workers[0].0, "vm-1");
    assert_eq!(state.workers[0].1, WorkerSet::Critical);
}

#[tokio::test]
async fn test_cancelled_creation_cannot_be_confirmed() {
    let mut cfg = config(vec![worker("w1", 1)]);
    cfg.resources = elastic(0, 1);
    let h = start(cfg);

    let request = h
        .runtime
        .request_creation(None, ResourceDescription::cores(1))
        .await
        .unwrap();
    assert!(h.runtime.cancel_creation(request).await.unwrap());
    assert!(!h.runtime.cancel_creation(request).await.unwrap());
    assert!(h
        .runtime
        .confirm_creation(request, &worker("vm-1", 1))
        .await
        .is_err());
    assert_eq!(h.runtime.pool_state().await.workers.len(), 1);

    // 取消后释放了配额
    h.runtime
        .request_creation(None, ResourceDescription::cores(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_removal_keeps_minimum_dynamic_workers() {
    let mut cfg = config(vec![
        worker("w1", 1),
        dynamic_worker("d1", 1),
        dynamic_worker("d2", 1),
    ]);
    cfg.resources = elastic(1, 3);
    let h = start(cfg);

    h.runtime.remove_worker("d1").await.unwrap();
    let err = h.runtime.remove_worker("d2").await.unwrap_err();
    assert!(matches!(err, SchedulerError::ElasticLimit { .. }));

    let names: Vec<String> = h
        .runtime
        .pool_state()
        .await
        .workers
        .into_iter()
        .map(|(name, _, _)| name)
        .collect();
    assert_eq!(names, vec!["d2", "w1"]);
}

#[tokio::test]
async fn test_shutdown_closes_runtime() {
    let h = start(config(vec![worker("w1", 1)]));
    h.runtime.shutdown().await.unwrap();

    let err = h
        .runtime
        .execute_task(APP, increment("late", vec![]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ChannelClosed));
}
