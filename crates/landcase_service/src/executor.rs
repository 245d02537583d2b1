use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use landcase_core::{
    create_phase_plan, run_phase_plan, CaseRecord, CaseStatus, RegistryHandle, TaskStatus, TaskView,
};
use landcase_toolchain::{PlanExecutor, StatusSink, ToolchainError, ToolchainFuture};

use crate::reconcile::error_excerpt;
use crate::store::CaseStore;
use crate::ServiceError;

pub type ExecutorFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boundary to the background task executor. The core treats submission as
/// fire-and-forget: it receives an opaque handle immediately and polls it
/// through this trait on every read.
pub trait TaskExecutor: Send + Sync {
    fn submit_create<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>>;
    fn submit_run<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>>;
    fn poll<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, TaskView>;
    /// Best-effort: drop bookkeeping for a handle and abort its task if it
    /// is still running. The underlying subprocess is not guaranteed dead.
    fn forget<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, Result<(), ServiceError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Create,
    Run,
}

#[derive(Debug)]
struct TaskSlot {
    status: TaskStatus,
    result: Option<Value>,
    trace: Option<String>,
    abort: Option<AbortHandle>,
}

impl TaskSlot {
    fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            trace: None,
            abort: None,
        }
    }
}

/// In-process executor driving the toolchain interpreter on spawned tasks.
/// Serves as the bundled default and as the reference behavior for external
/// queue integrations.
pub struct TokioTaskExecutor {
    runner: Arc<PlanExecutor>,
    registry: Arc<RegistryHandle>,
    store: Arc<dyn CaseStore>,
    slots: Arc<RwLock<HashMap<String, TaskSlot>>>,
}

impl TokioTaskExecutor {
    pub fn new(
        runner: Arc<PlanExecutor>,
        registry: Arc<RegistryHandle>,
        store: Arc<dyn CaseStore>,
    ) -> Self {
        Self {
            runner,
            registry,
            store,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn dispatch(&self, record: CaseRecord, phase: Phase) -> Result<String, ServiceError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.slots
            .write()
            .await
            .insert(task_id.clone(), TaskSlot::pending());

        let runner = Arc::clone(&self.runner);
        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let slots = Arc::clone(&self.slots);
        let slot_key = task_id.clone();

        let handle = tokio::spawn(async move {
            set_slot(&slots, &slot_key, TaskStatus::Started, None, None).await;

            match run_phase(phase, &record, &runner, &registry, &store).await {
                Ok(message) => {
                    set_slot(
                        &slots,
                        &slot_key,
                        TaskStatus::Success,
                        Some(Value::String(message.to_owned())),
                        None,
                    )
                    .await;
                }
                Err(err) => {
                    tracing::error!(case_id = %record.id, error = %err, "case phase failed");
                    mark_case_failed(&store, &record.id).await;
                    set_slot(
                        &slots,
                        &slot_key,
                        TaskStatus::Failure,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                }
            }
        });

        if let Some(slot) = self.slots.write().await.get_mut(&task_id) {
            slot.abort = Some(handle.abort_handle());
        }
        Ok(task_id)
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn submit_create<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>> {
        Box::pin(async move { self.dispatch(record.clone(), Phase::Create).await })
    }

    fn submit_run<'a>(
        &'a self,
        record: &'a CaseRecord,
    ) -> ExecutorFuture<'a, Result<String, ServiceError>> {
        Box::pin(async move { self.dispatch(record.clone(), Phase::Run).await })
    }

    fn poll<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, TaskView> {
        Box::pin(async move {
            let slots = self.slots.read().await;
            match slots.get(task_id) {
                Some(slot) => TaskView {
                    task_id: Some(task_id.to_owned()),
                    status: Some(slot.status),
                    result: slot.result.clone(),
                    error: slot.trace.as_deref().and_then(error_excerpt),
                },
                // Unknown handles report PENDING, matching queue semantics
                // where a handle may be polled before the broker sees it.
                None => TaskView {
                    task_id: Some(task_id.to_owned()),
                    status: Some(TaskStatus::Pending),
                    result: None,
                    error: None,
                },
            }
        })
    }

    fn forget<'a>(&'a self, task_id: &'a str) -> ExecutorFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            if let Some(slot) = self.slots.write().await.remove(task_id) {
                if let Some(abort) = slot.abort {
                    abort.abort();
                }
            }
            Ok(())
        })
    }
}

async fn run_phase(
    phase: Phase,
    record: &CaseRecord,
    runner: &PlanExecutor,
    registry: &RegistryHandle,
    store: &Arc<dyn CaseStore>,
) -> Result<&'static str, ToolchainError> {
    let registry = registry.get();
    let plan = match phase {
        Phase::Create => create_phase_plan(record, &registry)?,
        Phase::Run => run_phase_plan(record, &registry)?,
    };
    let sink = StoreStatusSink {
        store: Arc::clone(store),
    };
    runner.execute_plan(record, &plan, &sink).await?;
    Ok(match phase {
        Phase::Create => "case is configured",
        Phase::Run => "case is ready",
    })
}

async fn set_slot(
    slots: &RwLock<HashMap<String, TaskSlot>>,
    task_id: &str,
    status: TaskStatus,
    result: Option<Value>,
    trace: Option<String>,
) {
    if let Some(slot) = slots.write().await.get_mut(task_id) {
        slot.status = status;
        slot.result = result;
        slot.trace = trace;
    }
}

async fn mark_case_failed(store: &Arc<dyn CaseStore>, case_id: &str) {
    let store = Arc::clone(store);
    let id = case_id.to_owned();
    let outcome = tokio::task::spawn_blocking(move || store.update_status(&id, CaseStatus::Failed))
        .await;
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            tracing::warn!(case_id, error = %err, "failed to persist FAILED status")
        }
        Err(err) => tracing::warn!(case_id, error = %err, "status worker join failed"),
    }
}

/// Persists interpreter progress through the case store; the blocking store
/// call is offloaded so the executor's worker stays async-clean.
struct StoreStatusSink {
    store: Arc<dyn CaseStore>,
}

impl StatusSink for StoreStatusSink {
    fn record_status<'a>(
        &'a self,
        case_id: &'a str,
        status: CaseStatus,
    ) -> ToolchainFuture<'a, Result<(), ToolchainError>> {
        Box::pin(async move {
            let store = Arc::clone(&self.store);
            let id = case_id.to_owned();
            tokio::task::spawn_blocking(move || store.update_status(&id, status))
                .await
                .map_err(|err| ToolchainError::Status(format!("status worker join failed: {err}")))?
                .map(|_| ())
                .map_err(|err| ToolchainError::Status(err.to_string()))
        })
    }
}
