use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde_json::json;
use tracing::{info, warn};

use dataflow_core::{AppConfig, CoreElementConfig, ImplementationConfig, WorkerConfig};
use dataflow_dispatcher::{Runtime, RuntimeReport};
use dataflow_domain::{
    AccessMode, AppId, CoreId, Direction, Parameter, ParameterValue, TaskDescription,
};
use dataflow_infrastructure::{
    InMemoryPersistentStorage, InMemoryTransferService, MetricsCollector, SimulatedJobSubmitter,
    SimulationConfig,
};

const APP_ID: AppId = 1;
const STATE_CODE: u64 = 1;
const MODEL_ID: &str = "demo-model";

const GENERATE: &str = "generate()";
const TRANSFORM: &str = "transform()";
const MERGE: &str = "merge()";

#[derive(Debug, Clone, Copy)]
pub struct DemoOptions {
    pub tasks: usize,
    pub failure_rate: f64,
    pub latency: Duration,
}

fn method(target: &str, cpu_cores: u32) -> ImplementationConfig {
    ImplementationConfig {
        kind: "method".to_string(),
        target: target.to_string(),
        cpu_cores,
        gpus: 0,
        memory_mb: 0,
        processes: None,
    }
}

fn demo_core_element(signature: &str) -> CoreElementConfig {
    let implementations = match signature {
        GENERATE => vec![method("demo.Generate", 1)],
        TRANSFORM => vec![method("demo.Transform", 1)],
        _ => vec![method("demo.Merge", 2)],
    };
    CoreElementConfig {
        signature: signature.to_string(),
        implementations,
    }
}

/// 配置中没有Worker时使用本地模拟节点
pub fn fill_defaults(config: &mut AppConfig) {
    if config.workers.is_empty() {
        config.workers = (1..=2)
            .map(|i| WorkerConfig {
                name: format!("worker-{i}"),
                host: None,
                working_dir: format!("/tmp/dataflow/worker-{i}"),
                cpu_cores: 4,
                gpus: 0,
                memory_mb: 8192,
                app_id: None,
                dynamic: false,
                provider: None,
            })
            .collect();
    }
}

/// 演示应用：链式更新、文件扇出、汇总与持久化对象更新
pub struct DemoApplication {
    runtime: Runtime,
    storage: Arc<InMemoryPersistentStorage>,
    options: DemoOptions,
    known_cores: HashMap<String, CoreId>,
    master: String,
    master_dir: String,
}

impl DemoApplication {
    pub fn start(config: AppConfig, options: DemoOptions) -> Result<Self> {
        let mut known_cores = HashMap::new();
        for core in &config.core_elements {
            let next = known_cores.len();
            known_cores.entry(core.signature.clone()).or_insert(next);
        }
        let master = config.runtime.master_name.clone();
        let master_dir = config.runtime.working_dir.trim_end_matches('/').to_string();
        let metrics_enabled = config.observability.metrics_enabled;

        let storage = Arc::new(InMemoryPersistentStorage::new());
        let mut builder = Runtime::builder(config)
            .with_job_submitter(Arc::new(SimulatedJobSubmitter::new(SimulationConfig {
                latency: options.latency,
                failure_rate: options.failure_rate,
            })))
            .with_data_transfer(Arc::new(InMemoryTransferService::new(
                options.latency / 10,
            )))
            .with_storage(storage.clone());
        if metrics_enabled {
            builder = builder.with_metrics(Arc::new(MetricsCollector::new()));
        }
        let runtime = builder.build().context("启动运行时失败")?;

        Ok(Self {
            runtime,
            storage,
            options,
            known_cores,
            master,
            master_dir,
        })
    }

    async fn core_id(&self, signature: &str) -> Result<CoreId> {
        if let Some(id) = self.known_cores.get(signature) {
            return Ok(*id);
        }
        let id = self
            .runtime
            .register_core_element(demo_core_element(signature))
            .await
            .with_context(|| format!("注册任务类型 {signature} 失败"))?;
        Ok(id)
    }

    async fn submit(&self, description: TaskDescription) -> Result<u64> {
        let name = description.name.clone();
        self.runtime
            .execute_task(APP_ID, description, None)
            .await
            .with_context(|| format!("提交任务 {name} 失败"))
    }

    pub async fn run(&self) -> Result<()> {
        let generate = self.core_id(GENERATE).await?;
        let transform = self.core_id(TRANSFORM).await?;
        let merge = self.core_id(MERGE).await?;
        let input = format!("{}/input.csv", self.master_dir);

        self.submit(TaskDescription::new(
            generate,
            "generate",
            vec![
                Parameter::object(Direction::Out, STATE_CODE, json!(0)),
                Parameter::basic(json!(self.options.tasks)),
            ],
        ))
        .await?;

        for i in 0..self.options.tasks {
            self.submit(
                TaskDescription::new(
                    transform,
                    format!("update-{i}"),
                    vec![Parameter::object(Direction::InOut, STATE_CODE, json!(0))],
                )
                .with_priority(i == 0),
            )
            .await?;
        }

        let parts: Vec<String> = (0..self.options.tasks)
            .map(|i| format!("{}/part-{i}.out", self.master_dir))
            .collect();
        try_join_all(parts.iter().enumerate().map(|(i, part)| {
            self.submit(TaskDescription::new(
                transform,
                format!("split-{i}"),
                vec![
                    Parameter::file(Direction::In, &self.master, &input),
                    Parameter::file(Direction::Out, &self.master, part),
                    Parameter::string(format!("partition {i}")),
                ],
            ))
        }))
        .await?;

        let mut merge_params: Vec<Parameter> = parts
            .iter()
            .map(|part| Parameter::file(Direction::In, &self.master, part))
            .collect();
        merge_params.push(Parameter::object(Direction::In, STATE_CODE, json!(0)));
        merge_params.push(Parameter::file(
            Direction::Out,
            &self.master,
            format!("{}/result.out", self.master_dir),
        ));
        self.submit(TaskDescription::new(merge, "merge", merge_params))
            .await?;

        let pool = self.runtime.pool_state().await;
        info!("{pool}");
        if let Some((first, _, _)) = pool.workers.first() {
            self.storage.register(MODEL_ID, first).await;
            self.submit(TaskDescription::new(
                transform,
                "train",
                vec![Parameter::persistent(Direction::InOut, MODEL_ID)],
            ))
            .await?;
        }

        self.report_state().await;

        self.runtime.barrier(APP_ID).await.context("等待任务结束失败")?;
        let written = self
            .runtime
            .end_of_application(APP_ID)
            .await
            .context("结束应用失败")?;
        info!("应用 {} 结束，共写入 {} 个文件", APP_ID, written.len());
        Ok(())
    }

    async fn report_state(&self) {
        let value = ParameterValue::Object {
            code: STATE_CODE,
            value: json!(0),
            persistent_id: None,
        };
        let Some(data_id) = self.runtime.data_id_of(&value).await else {
            return;
        };
        match self.runtime.wait_for_data(data_id, AccessMode::Read).await {
            Ok(snapshot) => info!(
                "链式更新完成: 版本 {}，值 {}",
                snapshot.instance,
                snapshot.value.unwrap_or_default()
            ),
            Err(e) => warn!("链式更新未完成: {e}"),
        }
    }

    pub async fn report(&self) -> RuntimeReport {
        self.runtime.task_report().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await?;
        Ok(())
    }
}
