use crate::{
    models::{ApiError, BatchRequest, BatchResponse},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
    cancels: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

struct Job {
    id: Uuid,
    request: BatchRequest,
    cancel: oneshot::Receiver<()>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: Box<BatchResponse>,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let cancels = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();
        let cancels_bg = cancels.clone();

        let handle = tokio::spawn(async move {
            while let Some(mut job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    if matches!(guard.get(&job.id), Some(JobState::Cancelled)) {
                        continue;
                    }
                    guard.insert(job.id, JobState::Running);
                }

                let result = tokio::select! {
                    result = pipeline.run(job.request) => Some(result),
                    Ok(()) = &mut job.cancel => None,
                };
                cancels_bg.lock().await.remove(&job.id);

                let mut guard = statuses_bg.lock().await;
                if matches!(guard.get(&job.id), Some(JobState::Cancelled)) {
                    info!(target = "furnish.jobs", job_id = %job.id, "job_cancelled");
                    continue;
                }
                match result {
                    Some(Ok(resp)) => {
                        guard.insert(
                            job.id,
                            JobState::Completed {
                                result: Box::new(resp),
                            },
                        );
                    }
                    Some(Err(err)) => {
                        warn!(
                            target = "furnish.jobs",
                            job_id = %job.id,
                            stage = err.stage(),
                            error = %err,
                            "job_failed"
                        );
                        guard.insert(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                    None => {
                        guard.insert(job.id, JobState::Cancelled);
                    }
                }
            }
        });

        (
            Self {
                tx,
                statuses,
                cancels,
            },
            handle,
        )
    }

    pub async fn enqueue_batch(&self, request: BatchRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        let (cancel_tx, cancel) = oneshot::channel();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        self.cancels.lock().await.insert(id, cancel_tx);
        let job = Job {
            id,
            request,
            cancel,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            self.cancels.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }

    /// Cancel a queued or running job. Finished jobs keep their state.
    /// Returns `None` for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.statuses.lock().await;
        let state = guard.get_mut(&id)?;
        if !state.is_terminal() {
            *state = JobState::Cancelled;
            if let Some(tx) = self.cancels.lock().await.remove(&id) {
                let _ = tx.send(());
            }
            info!(target = "furnish.jobs", job_id = %id, "job_cancel_requested");
        }
        Some(JobInfo {
            id: id.to_string(),
            state: state.clone(),
        })
    }
}
