//! The serial installer worker.
//!
//! One dedicated OS thread owns the installer backend and executes its
//! stages in submission order. The controller never touches the backend
//! directly: it submits [`InstallerJob`]s and receives
//! [`StageOutcome`](crate::event::StageOutcome)s through the event
//! funnel. Stage 2 idempotence at the backend level lives here: the
//! worker remembers whether stage 2 ran so the stage 3 job can apply it
//! "if needed" without a second execution.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{InstallerBackend, InstallerContext, InstallerError, InstallerFactory, Stage1Ready};
use crate::event::{Event, StageOutcome};

/// Work items executed serially on the worker thread.
pub enum InstallerJob {
    /// Construct the backend and run stage 1.
    ConstructAndStage1 {
        /// Construction inputs.
        context: InstallerContext,
        /// Backend factory.
        factory: InstallerFactory,
    },
    /// Run stage 2 (updater-triggered resume).
    Stage2 {
        /// Whether the stage may present UI.
        allow_ui: bool,
    },
    /// Run stage 2 if it has not run, then stage 3.
    Stage3 {
        /// Whether a late stage 2 may present UI.
        allow_ui: bool,
    },
    /// Backend cleanup after a successful stage 3.
    Cleanup,
}

/// Handle to the worker thread.
pub struct InstallerWorker {
    jobs: std_mpsc::Sender<InstallerJob>,
    thread: Option<JoinHandle<()>>,
}

impl InstallerWorker {
    /// Spawn the worker thread, reporting outcomes into `events`.
    #[must_use]
    pub fn spawn(events: mpsc::UnboundedSender<Event>) -> Self {
        let (jobs_tx, jobs_rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("installer-worker".into())
            .spawn(move || worker_loop(&jobs_rx, &events))
            .expect("spawn installer worker thread");
        Self {
            jobs: jobs_tx,
            thread: Some(thread),
        }
    }

    /// Submit a job; order is preserved.
    pub fn submit(&self, job: InstallerJob) {
        if self.jobs.send(job).is_err() {
            warn!("installer worker is gone; job dropped");
        }
    }

    /// Stop the worker and wait for in-flight work to finish.
    pub fn shutdown(&mut self) {
        // Closing the channel ends the loop.
        let (closed_tx, _closed_rx) = std_mpsc::channel();
        self.jobs = closed_tx;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("installer worker panicked");
            }
        }
    }
}

impl Drop for InstallerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: &std_mpsc::Receiver<InstallerJob>, events: &mpsc::UnboundedSender<Event>) {
    let mut backend: Option<Box<dyn InstallerBackend>> = None;
    let mut did_stage2 = false;

    while let Ok(job) = jobs.recv() {
        match job {
            InstallerJob::ConstructAndStage1 { context, factory } => {
                let outcome = construct_and_stage1(&context, &factory, &mut backend);
                let _ = events.send(Event::Stage(StageOutcome::Stage1(outcome)));
            },
            InstallerJob::Stage2 { allow_ui } => {
                let outcome = match backend.as_mut() {
                    Some(_) if did_stage2 => Ok(()),
                    Some(backend) => {
                        let result = backend.perform_second_stage(allow_ui);
                        if result.is_ok() {
                            did_stage2 = true;
                        }
                        result
                    },
                    None => Err(missing_backend()),
                };
                let _ = events.send(Event::Stage(StageOutcome::Stage2(outcome)));
            },
            InstallerJob::Stage3 { allow_ui } => {
                let outcome = match backend.as_mut() {
                    Some(backend) => stage3(backend.as_mut(), &mut did_stage2, allow_ui),
                    None => Err(missing_backend()),
                };
                let _ = events.send(Event::Stage(StageOutcome::Stage3(outcome)));
            },
            InstallerJob::Cleanup => {
                if let Some(backend) = backend.as_mut() {
                    backend.cleanup();
                }
                let _ = events.send(Event::Stage(StageOutcome::CleanedUp));
            },
        }
    }
    debug!("installer worker stopped");
}

fn missing_backend() -> InstallerError {
    InstallerError::Io {
        path: std::path::PathBuf::new(),
        source: std::io::Error::other("no installer backend constructed"),
    }
}

fn construct_and_stage1(
    context: &InstallerContext,
    factory: &InstallerFactory,
    slot: &mut Option<Box<dyn InstallerBackend>>,
) -> Result<Stage1Ready, InstallerError> {
    let mut backend = factory(context)?;
    if let Err(error) = backend.perform_first_stage() {
        backend.cleanup();
        return Err(error);
    }
    let ready = Stage1Ready {
        can_install_silently: backend.can_install_silently(),
        displays_user_progress: backend.displays_user_progress(),
        installation_path: backend.installation_path(),
    };
    *slot = Some(backend);
    Ok(ready)
}

fn stage3(
    backend: &mut dyn InstallerBackend,
    did_stage2: &mut bool,
    allow_ui: bool,
) -> Result<(), InstallerError> {
    if !*did_stage2 {
        backend.perform_second_stage(allow_ui).inspect_err(|_| {
            backend.cleanup();
        })?;
        *did_stage2 = true;
    }
    backend.perform_third_stage().inspect_err(|_| {
        backend.cleanup();
    })
}
