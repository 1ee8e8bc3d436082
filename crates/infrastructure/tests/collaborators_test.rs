use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use dataflow_core::{
    AppConfig, CoreElementConfig, ImplementationConfig, SchedulerError, WorkerConfig,
};
use dataflow_dispatcher::Runtime;
use dataflow_domain::{
    AccessMode, CollaboratorEvent, DataInstance, DataLocation, DataTransfer, Direction, Parameter,
    ParameterValue, TaskDescription, TransferListener, TransferReason, TransferRequest,
};
use dataflow_infrastructure::{
    InMemoryPersistentStorage, InMemoryTransferService, MetricsCollector, SimulatedJobSubmitter,
    SimulationConfig,
};

const APP: u64 = 7;

fn app_config(workers: &[&str]) -> AppConfig {
    AppConfig {
        workers: workers
            .iter()
            .map(|name| WorkerConfig {
                name: name.to_string(),
                host: None,
                working_dir: "/scratch".to_string(),
                cpu_cores: 2,
                gpus: 0,
                memory_mb: 0,
                app_id: None,
                dynamic: false,
                provider: None,
            })
            .collect(),
        core_elements: vec![CoreElementConfig {
            signature: "step()".to_string(),
            implementations: vec![ImplementationConfig {
                kind: "method".to_string(),
                target: "demo.Step".to_string(),
                cpu_cores: 1,
                gpus: 0,
                memory_mb: 0,
                processes: None,
            }],
        }],
        ..AppConfig::default()
    }
}

struct Setup {
    runtime: Runtime,
    transfers: Arc<InMemoryTransferService>,
    storage: Arc<InMemoryPersistentStorage>,
}

fn setup(workers: &[&str], failure_rate: f64) -> Setup {
    let transfers = Arc::new(InMemoryTransferService::new(Duration::from_millis(1)));
    let storage = Arc::new(InMemoryPersistentStorage::new());
    let runtime = Runtime::builder(app_config(workers))
        .with_job_submitter(Arc::new(SimulatedJobSubmitter::new(SimulationConfig {
            latency: Duration::from_millis(2),
            failure_rate,
        })))
        .with_data_transfer(transfers.clone())
        .with_storage(storage.clone())
        .with_metrics(Arc::new(MetricsCollector::new()))
        .build()
        .unwrap();
    Setup {
        runtime,
        transfers,
        storage,
    }
}

fn step(name: &str, parameters: Vec<Parameter>) -> TaskDescription {
    TaskDescription::new(0, name, parameters)
}

#[tokio::test]
async fn test_object_chain_produces_final_value() {
    let s = setup(&["w1", "w2"], 0.0);

    s.runtime
        .execute_task(APP, step("first", vec![Parameter::object(Direction::Out, 1, json!(0))]), None)
        .await
        .unwrap();
    s.runtime
        .execute_task(
            APP,
            step("second", vec![Parameter::object(Direction::InOut, 1, json!(0))]),
            None,
        )
        .await
        .unwrap();

    let data_id = s
        .runtime
        .data_id_of(&ParameterValue::Object {
            code: 1,
            value: json!(0),
            persistent_id: None,
        })
        .await
        .unwrap();
    let snapshot = s
        .runtime
        .wait_for_data(data_id, AccessMode::Read)
        .await
        .unwrap();

    assert_eq!(snapshot.instance.version, 3);
    assert_eq!(snapshot.value.as_ref().unwrap()["task"], json!("second"));
    s.runtime.end_of_application(APP).await.unwrap();

    let report = s.runtime.task_report().await;
    assert_eq!(report.apps[0].completed, 2);
    assert_eq!(report.apps[0].failed, 0);
}

#[tokio::test]
async fn test_master_file_staged_into_worker_directory() {
    let s = setup(&["w1"], 0.0);

    s.runtime
        .execute_task(
            APP,
            step("read", vec![Parameter::file(Direction::In, "master", "/input.csv")]),
            None,
        )
        .await
        .unwrap();
    s.runtime.barrier(APP).await.unwrap();

    assert_eq!(s.transfers.transfer_count().await, 1);
    let target = DataLocation::file("w1", "/scratch/d1v1");
    assert_eq!(
        s.transfers.stored_at(&target).await,
        Some(DataInstance::new(1, 1))
    );
}

#[tokio::test]
async fn test_persistent_update_creates_new_version() {
    let s = setup(&["w1"], 0.0);
    s.storage.register("model", "w1").await;

    s.runtime
        .execute_task(
            APP,
            step("train", vec![Parameter::persistent(Direction::InOut, "model")]),
            None,
        )
        .await
        .unwrap();
    s.runtime.barrier(APP).await.unwrap();

    assert!(s.storage.contains("model.v1").await);
    assert!(!s.storage.contains("model").await);
}

#[tokio::test]
async fn test_always_failing_jobs_fail_the_application() {
    let s = setup(&["w1"], 1.0);

    let task_id = s
        .runtime
        .execute_task(APP, step("broken", vec![]), None)
        .await
        .unwrap();

    match s.runtime.barrier(APP).await {
        Err(SchedulerError::ApplicationFailed { failed_tasks, .. }) => {
            assert_eq!(failed_tasks, vec![task_id]);
        }
        other => panic!("expected application failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transfer_without_source_reports_failure() {
    let service = InMemoryTransferService::new(Duration::ZERO);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = TransferRequest {
        data: DataInstance::new(4, 2),
        source: None,
        target: DataLocation::file("w1", "/scratch/d4v2"),
        reason: TransferReason::InputStaging,
    };

    service
        .transfer(request, TransferListener::new(Some(3), 1, tx))
        .await
        .unwrap();

    match rx.recv().await {
        Some(CollaboratorEvent::TransferFailed { action_id, data, .. }) => {
            assert_eq!(action_id, Some(3));
            assert_eq!(data, DataInstance::new(4, 2));
        }
        other => panic!("expected transfer failure, got {other:?}"),
    }
    assert_eq!(service.transfer_count().await, 0);
}
