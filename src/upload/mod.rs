//! Upload pipeline.
//!
//! Validates each part of a multipart upload, stages surviving bytes to
//! a temp file, registers a job with the coalescer, and streams
//! progress events back to the caller. Per-request progress
//! accumulation is modeled here as an explicit channel: the handler
//! either drains it fully into a JSON array or forwards each event as
//! it arrives.

use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::cache::Cache;
use crate::coalescer::{Coalescer, JobFuture};
use crate::config::Config;
use crate::executor::model::{ModelSingleton, OcrModel};
use crate::executor::Executor;
use crate::hash::PageHash;

/// Progress event category: info, success, warning, or error.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Info,
    Success,
    Warning,
    Error,
}

/// One `[message, category]` progress event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent(pub String, pub Category);

impl ProgressEvent {
    pub fn info(msg: impl Into<String>) -> Self {
        Self(msg.into(), Category::Info)
    }
    pub fn success(msg: impl Into<String>) -> Self {
        Self(msg.into(), Category::Success)
    }
    pub fn warning(msg: impl Into<String>) -> Self {
        Self(msg.into(), Category::Warning)
    }
    pub fn error(msg: impl Into<String>) -> Self {
        Self(msg.into(), Category::Error)
    }
}

/// Result of one admitted-or-joined OCR job, shared by every waiter.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub hash: PageHash,
    pub display_name: String,
    pub outcome: Result<Value, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("multipart body error: {0}")]
    Multipart(#[from] MultipartError),
}

pub struct UploadPipeline<C: Cache + 'static> {
    cache: Arc<C>,
    coalescer: Arc<Coalescer<JobOutcome>>,
    executor: Executor,
    model: Arc<ModelSingleton>,
    config: Arc<Config>,
}

impl<C: Cache + 'static> UploadPipeline<C> {
    pub fn new(
        cache: Arc<C>,
        coalescer: Arc<Coalescer<JobOutcome>>,
        executor: Executor,
        model: Arc<ModelSingleton>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            coalescer,
            executor,
            model,
            config,
        }
    }

    /// Drive the whole pipeline, sending every event to `tx` as it is
    /// produced. The caller decides whether to buffer these into one
    /// JSON array or forward them live as they arrive.
    pub async fn run(&self, mut multipart: Multipart, tx: UnboundedSender<ProgressEvent>) {
        let send = |event: ProgressEvent| {
            let _ = tx.send(event);
        };

        let mut saw_any_part = false;
        let mut pending: Vec<JobFuture<JobOutcome>> = Vec::new();
        let mut aborted = false;

        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    send(ProgressEvent::error(format!("Malformed upload body: {e}")));
                    break;
                }
            };
            saw_any_part = true;

            match self.process_part(field).await {
                PartOutcome::Rejected(event) => send(event),
                PartOutcome::StrictAbort(event) => {
                    send(event);
                    send(ProgressEvent::error(
                        "Ignoring new images because of unacceptable client error",
                    ));
                    aborted = true;
                }
                PartOutcome::AlreadyQueued(event, future) => {
                    send(event);
                    pending.push(future);
                }
                PartOutcome::AlreadyCached(event) => send(event),
                PartOutcome::Admitted(future) => pending.push(future),
            }

            if aborted {
                break;
            }
        }

        if !saw_any_part {
            send(ProgressEvent::error("No files were uploaded"));
        }

        if pending.is_empty() {
            send(ProgressEvent::info("No files were processed"));
            return;
        }

        let total = pending.len();
        for future in pending {
            let outcome = future.await;
            match outcome.outcome {
                Ok(_) => send(ProgressEvent::success(format!(
                    "Finished OCR of \"{}\" successfully",
                    outcome.display_name
                ))),
                Err(message) => send(ProgressEvent::error(format!(
                    "Failed OCR of \"{}\": {}",
                    outcome.display_name, message
                ))),
            }
        }
        send(ProgressEvent::info(format!("Finished OCR of all {total} files")));
    }

    async fn process_part(&self, mut field: axum::extract::multipart::Field<'_>) -> PartOutcome {
        let raw_name = field.name().unwrap_or_default().to_string();
        let display_name = field.file_name().unwrap_or(&raw_name).to_string();
        let content_type = field.content_type().map(str::to_string);

        let hash = match PageHash::parse(&raw_name) {
            Ok(h) => h,
            Err(_) => {
                // Still need to drain the part before moving on.
                let _ = field.bytes().await;
                return PartOutcome::Rejected(ProgressEvent::error(
                    "File form key is not a valid hash",
                ));
            }
        };

        if self.coalescer.contains(&hash) {
            let _ = field.bytes().await;
            let (future, _admitted) = self.coalescer.submit_or_join(hash.clone(), move || {
                lost_race_job(hash.clone(), display_name.clone())
            });
            return PartOutcome::AlreadyQueued(
                ProgressEvent::error("Already have file in queue"),
                future,
            );
        }

        match self.cache.has(&hash).await {
            Ok(true) => {
                let _ = field.bytes().await;
                return PartOutcome::AlreadyCached(ProgressEvent::error(
                    "Already have file in cache",
                ));
            }
            Ok(false) => {}
            Err(e) => {
                let _ = field.bytes().await;
                warn!(error = %e, "cache lookup failed during upload");
                return PartOutcome::Rejected(ProgressEvent::error(
                    "Cache lookup failed, skipping this file",
                ));
            }
        }

        if let Some(len) = field.headers().get(axum::http::header::CONTENT_LENGTH) {
            if let Ok(len) = len.to_str().unwrap_or_default().parse::<u64>() {
                if len > self.config.max_image_size {
                    let _ = field.bytes().await;
                    return PartOutcome::Rejected(too_large(self.config.max_image_size));
                }
            }
        }

        if let Some(ct) = &content_type {
            if !ct.starts_with("image/") {
                let _ = field.bytes().await;
                return PartOutcome::Rejected(ProgressEvent::error("Files need to be images"));
            }
        }

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return PartOutcome::Rejected(ProgressEvent::error(format!(
                    "Error reading upload body: {e}"
                )))
            }
        };

        if bytes.is_empty() {
            return PartOutcome::Rejected(ProgressEvent::error("Empty file was uploaded"));
        }

        if bytes.len() as u64 > self.config.max_image_size {
            let event = too_large(self.config.max_image_size);
            return if self.config.strict_new_images {
                PartOutcome::StrictAbort(event)
            } else {
                PartOutcome::Rejected(event)
            };
        }

        let actual = PageHash::of_bytes(&bytes);
        if actual != hash {
            let event = ProgressEvent::error("File hash does not match its contents");
            return if self.config.strict_new_images {
                PartOutcome::StrictAbort(event)
            } else {
                PartOutcome::Rejected(event)
            };
        }

        let staged_path = match stage_bytes(&bytes).await {
            Ok(path) => path,
            Err(e) => {
                return PartOutcome::Rejected(ProgressEvent::error(format!(
                    "Failed to stage upload: {e}"
                )))
            }
        };

        let cache = self.cache.clone();
        let executor = self.executor.clone();
        let model = self.model.clone();
        let coalescer = self.coalescer.clone();
        let job_hash = hash.clone();
        let job_name = display_name.clone();
        let job_hash_for_panic = job_hash.clone();
        let job_name_for_panic = job_name.clone();

        // The coalescer's shared future is lazy: it only starts running
        // whatever `job_factory` returns once something polls it. If
        // that returned value were the OCR work itself, a batch of jobs
        // awaited one at a time at the end of `run` would execute them
        // one at a time too, regardless of `EXECUTOR_MAX_WORKERS`. So
        // the work is handed to `tokio::spawn` here, synchronously,
        // under the coalescer's admission lock — it starts making
        // progress immediately, concurrently with every other admitted
        // job — and the factory only returns a thin future that joins
        // that already-running task.
        let (future, _admitted) = self.coalescer.submit_or_join(hash, move || {
            let handle = tokio::spawn(async move {
                let model_instance = model.get().await;
                let staged_for_job = staged_path.clone();
                let outcome = executor
                    .submit(move || async move { run_job(model_instance, staged_for_job).await })
                    .await;

                if let Ok(value) = &outcome {
                    if let Err(e) = cache.set(&job_hash, value.clone(), None).await {
                        warn!(error = %e, "failed to persist OCR result");
                    }
                }

                let _ = tokio::fs::remove_file(&staged_path).await;
                coalescer.remove(&job_hash);

                JobOutcome {
                    hash: job_hash,
                    display_name: job_name,
                    outcome,
                }
            });

            Box::pin(async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome {
                        hash: job_hash_for_panic,
                        display_name: job_name_for_panic,
                        outcome: Err(format!("OCR job panicked: {e}")),
                    },
                }
            }) as Pin<Box<dyn std::future::Future<Output = JobOutcome> + Send>>
        });

        PartOutcome::Admitted(future)
    }
}

enum PartOutcome {
    Rejected(ProgressEvent),
    StrictAbort(ProgressEvent),
    AlreadyQueued(ProgressEvent, JobFuture<JobOutcome>),
    AlreadyCached(ProgressEvent),
    Admitted(JobFuture<JobOutcome>),
}

fn too_large(max: u64) -> ProgressEvent {
    ProgressEvent::error(format!(
        "File size is too large. At most {max} bytes are accepted"
    ))
}

/// Fallback used only if a hash is observed in-flight by `contains`
/// but has already completed and been removed by the time the join is
/// attempted. Vanishingly rare; surfaces as a per-file error rather
/// than panicking.
fn lost_race_job(
    hash: PageHash,
    display_name: String,
) -> Pin<Box<dyn std::future::Future<Output = JobOutcome> + Send>> {
    Box::pin(async move {
        JobOutcome {
            hash,
            display_name,
            outcome: Err("in-flight job vanished before it could be joined".to_string()),
        }
    })
}

const STAGED_FILE_PREFIX: &str = "mokuro_page_";

async fn stage_bytes(bytes: &[u8]) -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new().prefix(STAGED_FILE_PREFIX).tempfile()?;
    let (mut handle, path) = file.keep().map_err(|e| e.error)?;
    use std::io::Write;
    handle.write_all(bytes)?;
    Ok(path)
}

/// Remove any staged upload files left behind by a previous process
/// that was killed before a job could release them. Jobs always clean
/// up their own staged file on success or failure; this only catches
/// what a crash or `kill -9` left orphaned in the OS temp directory.
/// Intended to run once at startup, before the server begins accepting
/// uploads.
pub async fn sweep_stale_staged_files() -> std::io::Result<usize> {
    let dir = std::env::temp_dir();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(STAGED_FILE_PREFIX) {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

async fn run_job(
    model: Arc<dyn crate::executor::model::OcrModel>,
    path: PathBuf,
) -> Result<Value, String> {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err("staged path is not a regular file".to_string()),
        Err(e) => return Err(format!("staged file missing: {e}")),
    }

    model.recognize(&path).await.map_err(|e| e.to_string())
}
