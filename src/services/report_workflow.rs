//! Report generation and artifact management
//!
//! Generation follows `Idle -> Confirming -> Requested -> Succeeded|Failed
//! -> Idle`. The artifact listing is a separate snapshot that is replaced as
//! a whole; a successful generation re-fetches it before the job is reported
//! as succeeded so the new artifact is visible immediately.

use chrono::Utc;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::adapters::{ArtifactAccess, ByteStream, ConsoleBackend};
use crate::domain::{
    validate_file_name, ArtifactFilter, ArtifactListing, JobPhase, ReportArtifact, ReportJob,
    ReportRequest, ReportType, WorkflowState, DELETE_CONFIRMATION_PHRASE,
};
use crate::error::{OpsdeckError, Result};
use crate::services::Confirmer;

/// Artifact file name from a generation status message such as
/// `"schedule weekly report generated: /data/reports/weekly-2024-01-08.pdf"`
pub fn artifact_from_message(message: &str) -> Option<String> {
    let (_, tail) = message.rsplit_once(':')?;
    let name = tail.trim().rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Open inline view of an artifact. Dropping or closing it releases the
/// connection and leaves no trace.
pub struct PreviewHandle {
    artifact: ReportArtifact,
    stream: Option<ByteStream>,
}

impl PreviewHandle {
    pub fn artifact(&self) -> &ReportArtifact {
        &self.artifact
    }

    /// Next body chunk; `None` once the body ends or the preview is closed
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        let stream = self.stream.as_mut()?;
        let chunk = stream.next().await;
        if chunk.is_none() {
            self.stream = None;
        }
        chunk
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed preview of {}", self.artifact.file_name);
        }
    }
}

pub struct ReportWorkflow {
    backend: Arc<dyn ConsoleBackend>,
    state_tx: watch::Sender<WorkflowState>,
    listing_tx: watch::Sender<Option<Arc<ArtifactListing>>>,
    /// Bumped by `reset`; a generation response from an older value is ignored
    generation: AtomicU64,
}

impl ReportWorkflow {
    pub fn new(backend: Arc<dyn ConsoleBackend>) -> Self {
        let (state_tx, _) = watch::channel(WorkflowState::Idle);
        let (listing_tx, _) = watch::channel(None);
        Self {
            backend,
            state_tx,
            listing_tx,
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state_tx.subscribe()
    }

    /// Current artifact listing; `None` until fetched or after invalidation
    pub fn listing(&self) -> Option<Arc<ArtifactListing>> {
        self.listing_tx.borrow().clone()
    }

    /// Operator picked a report; wait for explicit confirmation
    pub fn select(&self, request: ReportRequest) -> Result<()> {
        request.validate()?;

        let mut busy = false;
        self.state_tx.send_if_modified(|state| {
            if state.is_busy() {
                busy = true;
                return false;
            }
            *state = WorkflowState::Confirming(request);
            true
        });
        if busy {
            return Err(OpsdeckError::InvalidState(
                "a report is already being generated".to_string(),
            ));
        }
        Ok(())
    }

    /// Leave confirmation without submitting
    pub fn cancel(&self) -> Result<()> {
        let mut cancelled = false;
        self.state_tx.send_if_modified(|state| {
            if matches!(state, WorkflowState::Confirming(_)) {
                *state = WorkflowState::Idle;
                cancelled = true;
            }
            cancelled
        });
        if cancelled {
            Ok(())
        } else {
            Err(OpsdeckError::InvalidState(format!(
                "nothing to cancel ({})",
                self.state()
            )))
        }
    }

    /// Dismiss the success or failure acknowledgment
    pub fn acknowledge(&self) {
        self.state_tx.send_if_modified(|state| {
            if matches!(state, WorkflowState::Succeeded(_) | WorkflowState::Failed(_)) {
                *state = WorkflowState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Drop back to idle, e.g. when the operator navigates away. A response
    /// still in flight will be ignored.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state_tx.send_replace(WorkflowState::Idle);
    }

    /// Submit the confirmed request. Returns the settled job; transport
    /// failures are part of the job, not an error.
    pub async fn confirm(&self) -> Result<ReportJob> {
        let mut started = None;
        self.state_tx.send_if_modified(|state| {
            if let WorkflowState::Confirming(request) = state {
                let mut job = ReportJob::new(*request);
                job.phase = JobPhase::Generating;
                *state = WorkflowState::Requested(job.clone());
                started = Some((job, self.generation.load(Ordering::SeqCst)));
                true
            } else {
                false
            }
        });
        let Some((mut job, generation)) = started else {
            return Err(OpsdeckError::InvalidState(format!(
                "no report awaiting confirmation ({})",
                self.state()
            )));
        };

        info!("Generating {}", job.request);
        let outcome = self.backend.generate_report(&job.request).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring report response after reset");
            job.phase = match outcome {
                Ok(message) => JobPhase::Ready {
                    artifact: artifact_from_message(&message),
                    message,
                },
                Err(e) => JobPhase::Failed {
                    reason: e.operator_message(),
                },
            };
            return Ok(job);
        }

        match outcome {
            Ok(message) => {
                let artifact = artifact_from_message(&message);
                info!("Report ready: {}", message);
                // The listing must include the new artifact before success is shown
                if let Err(e) = self.refresh().await {
                    warn!("Listing refresh after generation failed: {}", e);
                    self.listing_tx.send_replace(None);
                }
                job.phase = JobPhase::Ready { artifact, message };
                self.state_tx.send_replace(WorkflowState::Succeeded(job.clone()));
            }
            Err(e) => {
                warn!("Report generation failed: {}", e);
                job.phase = JobPhase::Failed {
                    reason: e.operator_message(),
                };
                self.state_tx.send_replace(WorkflowState::Failed(job.clone()));
            }
        }
        Ok(job)
    }

    /// Full flow: select, ask `confirmer`, submit. `None` when declined.
    pub async fn submit(
        &self,
        request: ReportRequest,
        confirmer: &dyn Confirmer,
    ) -> Result<Option<ReportJob>> {
        self.select(request)?;
        let prompt = format!("Generate {}?", request);
        if !confirmer.confirm(&prompt).await {
            self.cancel()?;
            info!("Report generation cancelled by operator");
            return Ok(None);
        }
        self.confirm().await.map(Some)
    }

    /// Re-fetch the listing. On failure the previous listing stays.
    pub async fn refresh(&self) -> Result<Arc<ArtifactListing>> {
        let index = self.backend.list_artifacts().await?;
        let listing = Arc::new(ArtifactListing::from_index(&index, Utc::now()));
        debug!("Artifact listing refreshed: {} files", listing.len());
        self.listing_tx.send_replace(Some(Arc::clone(&listing)));
        Ok(listing)
    }

    /// Artifacts of the current listing matching `filter`
    pub fn filtered(&self, filter: &ArtifactFilter) -> Vec<ReportArtifact> {
        self.listing()
            .map(|listing| listing.filtered(filter).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn preview(&self, report_type: ReportType, file_name: &str) -> Result<PreviewHandle> {
        validate_file_name(file_name)?;
        let stream = self
            .backend
            .open_artifact(report_type, file_name, ArtifactAccess::Preview)
            .await?;
        Ok(PreviewHandle {
            artifact: ReportArtifact::new(report_type, file_name),
            stream: Some(stream),
        })
    }

    /// Stream an artifact into `dest_dir` under its declared file name.
    /// A partial file is removed if the transfer fails.
    pub async fn download(
        &self,
        report_type: ReportType,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        let mut stream = self
            .backend
            .open_artifact(report_type, file_name, ArtifactAccess::Download)
            .await?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(file_name.trim());
        let partial = dest_dir.join(format!(".{}.part", file_name.trim()));

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut total = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                total += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&partial, &target).await?;
            Ok::<usize, OpsdeckError>(total)
        }
        .await;

        match written {
            Ok(total) => {
                info!("Downloaded {} ({} bytes) to {}", file_name, total, target.display());
                Ok(target)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                warn!("Download of {} failed: {}", file_name, e);
                Err(e)
            }
        }
    }

    /// Delete an artifact after the operator typed the exact confirmation
    /// phrase. On failure the listing is left unchanged.
    pub async fn delete(
        &self,
        report_type: ReportType,
        file_name: &str,
        typed_phrase: &str,
    ) -> Result<String> {
        if typed_phrase != DELETE_CONFIRMATION_PHRASE {
            return Err(OpsdeckError::Validation(format!(
                "type \"{}\" to confirm deletion",
                DELETE_CONFIRMATION_PHRASE
            )));
        }
        validate_file_name(file_name)?;

        let message = self.backend.delete_artifact(report_type, file_name).await?;
        info!("Deleted {}/{}", report_type, file_name);

        if let Err(e) = self.refresh().await {
            warn!("Listing refresh after delete failed: {}", e);
            // Never keep showing the deleted file
            self.listing_tx.send_modify(|listing| {
                if let Some(current) = listing.as_ref() {
                    let mut next = (**current).clone();
                    next.artifacts
                        .retain(|a| !(a.report_type == report_type && a.file_name == file_name));
                    *listing = Some(Arc::new(next));
                }
            });
        }
        Ok(message)
    }
}
