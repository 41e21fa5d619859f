//! Persisted progress markers for multi-step lifecycle flows.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use storage::{Storage, StoredSagaRun, SAGA_COMPLETED, SAGA_FAILED, SAGA_RUNNING};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaKind {
    AcceptProposal,
    CompleteStage,
}

impl SagaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaKind::AcceptProposal => "accept_proposal",
            SagaKind::CompleteStage => "complete_stage",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accept_proposal" => Some(SagaKind::AcceptProposal),
            "complete_stage" => Some(SagaKind::CompleteStage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => SAGA_RUNNING,
            RunStatus::Failed => SAGA_FAILED,
            RunStatus::Completed => SAGA_COMPLETED,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            SAGA_RUNNING => Some(RunStatus::Running),
            SAGA_FAILED => Some(RunStatus::Failed),
            SAGA_COMPLETED => Some(RunStatus::Completed),
            _ => None,
        }
    }
}

/// One journalled flow: how far it got and the context it carried.
#[derive(Debug, Clone)]
pub struct SagaRun {
    pub run_id: String,
    pub kind: SagaKind,
    pub subject_id: i64,
    pub status: RunStatus,
    pub failed_step: Option<String>,
    pub last_error: Option<String>,
    pub context: Value,
    pub completed_steps: Vec<String>,
}

impl SagaRun {
    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|done| done == step)
    }
}

#[async_trait]
pub trait SagaJournal: Send + Sync {
    /// Opens a running entry and returns its id.
    async fn begin(&self, kind: SagaKind, subject_id: i64, context: &Value) -> Result<String>;
    async fn record_step(&self, run_id: &str, step: &str, context: &Value) -> Result<()>;
    async fn fail(&self, run_id: &str, step: &str, error: &str) -> Result<()>;
    async fn complete(&self, run_id: &str) -> Result<()>;
    async fn load(&self, run_id: &str) -> Result<Option<SagaRun>>;
    /// Running and failed runs, oldest first.
    async fn list_incomplete(&self) -> Result<Vec<SagaRun>>;
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Journal that lives as long as the process.
#[derive(Default)]
pub struct MemorySagaJournal {
    runs: Mutex<Vec<SagaRun>>,
}

impl MemorySagaJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn find_run<'a>(runs: &'a mut [SagaRun], run_id: &str) -> Result<&'a mut SagaRun> {
    runs.iter_mut()
        .find(|run| run.run_id == run_id)
        .ok_or_else(|| anyhow!("saga run {run_id} does not exist"))
}

#[async_trait]
impl SagaJournal for MemorySagaJournal {
    async fn begin(&self, kind: SagaKind, subject_id: i64, context: &Value) -> Result<String> {
        let run_id = new_run_id();
        self.runs.lock().await.push(SagaRun {
            run_id: run_id.clone(),
            kind,
            subject_id,
            status: RunStatus::Running,
            failed_step: None,
            last_error: None,
            context: context.clone(),
            completed_steps: Vec::new(),
        });
        Ok(run_id)
    }

    async fn record_step(&self, run_id: &str, step: &str, context: &Value) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let run = find_run(&mut runs, run_id)?;
        if !run.has_completed(step) {
            run.completed_steps.push(step.to_string());
        }
        run.context = context.clone();
        run.status = RunStatus::Running;
        run.failed_step = None;
        run.last_error = None;
        Ok(())
    }

    async fn fail(&self, run_id: &str, step: &str, error: &str) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let run = find_run(&mut runs, run_id)?;
        run.status = RunStatus::Failed;
        run.failed_step = Some(step.to_string());
        run.last_error = Some(error.to_string());
        Ok(())
    }

    async fn complete(&self, run_id: &str) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let run = find_run(&mut runs, run_id)?;
        run.status = RunStatus::Completed;
        run.failed_step = None;
        run.last_error = None;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SagaRun>> {
        let runs = self.runs.lock().await;
        Ok(runs.iter().find(|run| run.run_id == run_id).cloned())
    }

    async fn list_incomplete(&self) -> Result<Vec<SagaRun>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .filter(|run| run.status != RunStatus::Completed)
            .cloned()
            .collect())
    }
}

/// Journal kept in the SQLite database shared with other local state.
pub struct DurableSagaJournal {
    store: Storage,
}

impl DurableSagaJournal {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize saga journal at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }

    pub fn with_storage(store: Storage) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

fn run_from_stored(stored: StoredSagaRun) -> Result<SagaRun> {
    let kind = SagaKind::parse(&stored.kind)
        .ok_or_else(|| anyhow!("saga run {} has unknown kind '{}'", stored.run_id, stored.kind))?;
    let status = RunStatus::parse(&stored.status).ok_or_else(|| {
        anyhow!(
            "saga run {} has unknown status '{}'",
            stored.run_id,
            stored.status
        )
    })?;
    Ok(SagaRun {
        run_id: stored.run_id,
        kind,
        subject_id: stored.subject_id,
        status,
        failed_step: stored.failed_step,
        last_error: stored.last_error,
        context: stored.context,
        completed_steps: stored.completed_steps,
    })
}

#[async_trait]
impl SagaJournal for DurableSagaJournal {
    async fn begin(&self, kind: SagaKind, subject_id: i64, context: &Value) -> Result<String> {
        let run_id = new_run_id();
        self.store
            .create_saga_run(&run_id, kind.as_str(), subject_id, context)
            .await?;
        Ok(run_id)
    }

    async fn record_step(&self, run_id: &str, step: &str, context: &Value) -> Result<()> {
        self.store.mark_saga_step(run_id, step, context).await
    }

    async fn fail(&self, run_id: &str, step: &str, error: &str) -> Result<()> {
        self.store.fail_saga_run(run_id, step, error).await
    }

    async fn complete(&self, run_id: &str) -> Result<()> {
        self.store.complete_saga_run(run_id).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<SagaRun>> {
        self.store
            .load_saga_run(run_id)
            .await?
            .map(run_from_stored)
            .transpose()
    }

    async fn list_incomplete(&self) -> Result<Vec<SagaRun>> {
        self.store
            .list_incomplete_saga_runs()
            .await?
            .into_iter()
            .map(run_from_stored)
            .collect()
    }
}
