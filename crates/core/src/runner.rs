//! Task runner: executes one reconstruction task outside the HTTP request
//! path and settles the job record into its terminal state.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::Layer;

use crate::algorithms::{AlgorithmRegistry, ReconstructionTask};
use crate::job::{JobStatus, JobUpdate, ABORTED_BY_USER};
use crate::queue::TaskMessage;
use crate::store::JobStore;

/// Executes one enqueued reconstruction task end to end.
///
/// The lifecycle contract: a pending cancellation short-circuits to
/// `Canceled` before anything runs; otherwise the record moves to `Started`,
/// the algorithm executes with a log-capture subscriber installed for the
/// duration of the call, and the record settles into `Finished`, `Stopped`
/// (cancel arrived mid-run) or `Failed`. A failure is recorded *and*
/// propagated so the queue's own failure bookkeeping fires.
pub fn run_reconstruction_task(
    store: &JobStore,
    registry: &AlgorithmRegistry,
    queue_task_id: &str,
    message: &TaskMessage,
) -> Result<()> {
    let job_id = &message.job_id;
    let job = store
        .load(job_id)
        .with_context(|| format!("failed to load job record {job_id}"))?;

    if job.cancel_requested {
        info!(job_id, "cancel requested before start; skipping run");
        store.update(
            job_id,
            JobUpdate {
                status: Some(JobStatus::Canceled),
                error: Some(Some(ABORTED_BY_USER.to_string())),
                ..Default::default()
            },
        )?;
        return Ok(());
    }

    store.update(
        job_id,
        JobUpdate {
            status: Some(JobStatus::Started),
            queue_task_id: Some(queue_task_id.to_string()),
            ..Default::default()
        },
    )?;

    let algorithm = registry
        .get(message.algorithm)
        .with_context(|| format!("unknown algorithm: {}", message.algorithm))?;

    if let Some(parent) = message.output_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create output directory: {}", parent.display())
        })?;
    }

    let task = ReconstructionTask {
        job_id: job_id.clone(),
        input_path: message.input_path.clone(),
        output_path: message.output_path.clone(),
    };

    info!(job_id, algorithm = %message.algorithm, "starting reconstruction");

    // Swap in a capturing subscriber for the duration of the algorithm call;
    // the lines land on the record whatever the outcome.
    let capture = LogCapture::new();
    let run_result = {
        let subscriber = Registry::default().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || algorithm.run(&task, &message.params))
    };
    let log_messages = capture.lines();

    match run_result {
        Err(err) => {
            error!(job_id, error = %err, "reconstruction failed");
            let update = JobUpdate {
                status: Some(JobStatus::Failed),
                error: Some(Some(format!("{err:#}"))),
                log_messages: Some(log_messages),
                ..Default::default()
            };
            if let Err(update_err) = store.update(job_id, update) {
                error!(job_id, error = %update_err, "failed to record failure on job record");
            }
            Err(err)
        }
        Ok(result) => {
            // Reload: an abort may have landed while the algorithm ran.
            let stored = store
                .load(job_id)
                .with_context(|| format!("failed to reload job record {job_id}"))?;
            if stored.cancel_requested {
                info!(job_id, "cancel requested during run; discarding result");
                store.update(
                    job_id,
                    JobUpdate {
                        status: Some(JobStatus::Stopped),
                        error: Some(Some(ABORTED_BY_USER.to_string())),
                        log_messages: Some(log_messages),
                        ..Default::default()
                    },
                )?;
            } else {
                info!(job_id, shape = ?result.result_shape, "reconstruction finished");
                store.update(
                    job_id,
                    JobUpdate {
                        status: Some(JobStatus::Finished),
                        result_shape: Some(result.result_shape),
                        result_dataset: Some(result.result_dataset),
                        error: Some(None),
                        log_messages: Some(log_messages),
                        ..Default::default()
                    },
                )?;
            }
            Ok(())
        }
    }
}

#[derive(Clone)]
struct LogCapture {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCapture {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let metadata = event.metadata();
        self.push(format!(
            "{} | {} | {} | {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            metadata.level(),
            metadata.target(),
            fields.rendered()
        ));
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    extra: Vec<String>,
}

impl EventFields {
    fn rendered(&self) -> String {
        if self.extra.is_empty() {
            self.message.clone()
        } else if self.message.is_empty() {
            self.extra.join(" ")
        } else {
            format!("{} {}", self.message, self.extra.join(" "))
        }
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.extra.push(format!("{}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{
        AlgorithmId, AlgorithmParams, DownloadFormat, ReconstructionAlgorithm,
        ReconstructionResult, RESULT_DATASET,
    };
    use crate::job::JobRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type RunHook = dyn Fn(&ReconstructionTask) -> Result<()> + Send + Sync;

    struct StubAlgorithm {
        calls: Arc<AtomicUsize>,
        hook: Box<RunHook>,
    }

    impl StubAlgorithm {
        fn boxed(calls: Arc<AtomicUsize>, hook: Box<RunHook>) -> Box<dyn ReconstructionAlgorithm> {
            Box::new(Self { calls, hook })
        }
    }

    impl ReconstructionAlgorithm for StubAlgorithm {
        fn id(&self) -> AlgorithmId {
            AlgorithmId::DirectReconstruction
        }

        fn name(&self) -> &'static str {
            "Stub"
        }

        fn description(&self) -> &'static str {
            "test stub"
        }

        fn default_params(&self) -> AlgorithmParams {
            AlgorithmParams::DirectReconstruction(Default::default())
        }

        fn run(
            &self,
            task: &ReconstructionTask,
            _params: &AlgorithmParams,
        ) -> Result<ReconstructionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tracing::info!(job_id = %task.job_id, "stub reconstruction running");
            (self.hook)(task)?;
            std::fs::write(&task.output_path, b"stub result")?;
            Ok(ReconstructionResult {
                result_shape: vec![2, 4, 4],
                result_dataset: RESULT_DATASET.to_string(),
                output_path: task.output_path.clone(),
            })
        }
    }

    struct Fixture {
        _temp: TempDir,
        store: JobStore,
        registry: AlgorithmRegistry,
        calls: Arc<AtomicUsize>,
        message: TaskMessage,
    }

    fn fixture_with_hook(hook: Box<RunHook>) -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let store = JobStore::new(temp.path().join("results"), temp.path().join("inputs"));
        store.ensure_io_directories().expect("io dirs");

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = AlgorithmRegistry::new();
        registry.register(StubAlgorithm::boxed(calls.clone(), hook));

        let job = JobRecord {
            id: "job-1".to_string(),
            name: "scan".to_string(),
            status: JobStatus::Queued,
            algorithm: AlgorithmId::DirectReconstruction,
            params: AlgorithmParams::DirectReconstruction(Default::default()),
            result_shape: None,
            result_dataset: RESULT_DATASET.to_string(),
            available_formats: vec![DownloadFormat::Npy],
            created_at: Utc::now(),
            input_filename: "scan.npy".to_string(),
            input_available: true,
            result_available: false,
            log_messages: Vec::new(),
            error: None,
            queue_task_id: None,
            cancel_requested: false,
        };
        store.save(&job).expect("save job");

        let message = TaskMessage {
            job_id: "job-1".to_string(),
            algorithm: AlgorithmId::DirectReconstruction,
            input_path: store.input_path("job-1", "scan.npy"),
            output_path: store.result_path("job-1"),
            params: AlgorithmParams::DirectReconstruction(Default::default()),
        };

        Fixture {
            _temp: temp,
            store,
            registry,
            calls,
            message,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_hook(Box::new(|_| Ok(())))
    }

    #[test]
    fn successful_run_finishes_with_shape_and_captured_logs() {
        let fx = fixture();
        run_reconstruction_task(&fx.store, &fx.registry, "task-1", &fx.message)
            .expect("runner succeeds");

        let job = fx.store.load("job-1").expect("load");
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result_shape, Some(vec![2, 4, 4]));
        assert_eq!(job.result_dataset, RESULT_DATASET);
        assert_eq!(job.error, None);
        assert_eq!(job.queue_task_id.as_deref(), Some("task-1"));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert!(
            job.log_messages
                .iter()
                .any(|line| line.contains("stub reconstruction running")),
            "captured logs: {:?}",
            job.log_messages
        );
    }

    #[test]
    fn pending_cancel_short_circuits_without_running() {
        let fx = fixture();
        fx.store
            .update(
                "job-1",
                JobUpdate {
                    cancel_requested: Some(true),
                    ..Default::default()
                },
            )
            .expect("raise cancel flag");

        run_reconstruction_task(&fx.store, &fx.registry, "task-1", &fx.message)
            .expect("short circuit is not an error");

        let job = fx.store.load("job-1").expect("load");
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error.as_deref(), Some(ABORTED_BY_USER));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_during_run_resolves_to_stopped() {
        // The hook plays the abort handler: it raises the cancel flag while
        // the algorithm is executing.
        let temp_store: Arc<Mutex<Option<JobStore>>> = Arc::new(Mutex::new(None));
        let store_for_hook = temp_store.clone();
        let fx = fixture_with_hook(Box::new(move |_task| {
            let guard = store_for_hook.lock().unwrap();
            let store = guard.as_ref().expect("store injected");
            store.update(
                "job-1",
                JobUpdate {
                    cancel_requested: Some(true),
                    ..Default::default()
                },
            )
        }));
        *temp_store.lock().unwrap() = Some(fx.store.clone());

        run_reconstruction_task(&fx.store, &fx.registry, "task-1", &fx.message)
            .expect("stopped outcome is not an error");

        let job = fx.store.load("job-1").expect("load");
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(job.error.as_deref(), Some(ABORTED_BY_USER));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_records_the_error_chain_and_propagates() {
        let fx = fixture_with_hook(Box::new(|_| {
            Err(anyhow::anyhow!("gradient diverged")).context("sense iteration 3")
        }));

        let result = run_reconstruction_task(&fx.store, &fx.registry, "task-1", &fx.message);
        assert!(result.is_err(), "failure must be re-signaled to the queue");

        let job = fx.store.load("job-1").expect("load");
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.expect("error recorded");
        assert!(error.contains("sense iteration 3"));
        assert!(error.contains("gradient diverged"));
        assert!(
            job.log_messages
                .iter()
                .any(|line| line.contains("stub reconstruction running")),
            "logs captured even on failure"
        );
    }

    #[test]
    fn captured_lines_carry_level_and_target() {
        let fx = fixture();
        run_reconstruction_task(&fx.store, &fx.registry, "task-1", &fx.message)
            .expect("runner succeeds");

        let job = fx.store.load("job-1").expect("load");
        let line = job
            .log_messages
            .iter()
            .find(|line| line.contains("stub reconstruction running"))
            .expect("stub line captured");
        assert!(line.contains("INFO"));
        assert!(line.contains("job_id"));
    }
}
