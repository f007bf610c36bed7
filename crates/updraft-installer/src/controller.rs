//! The installation state machine.
//!
//! One task on the main scheduler owns all mutable session state and
//! consumes the event funnel; everything long-running (extraction,
//! validation, backend stages) executes elsewhere and reports back as
//! events. Phases progress forward only:
//!
//! ```text
//!   AwaitingInputs ──> Extracting ──> Validating ──> ResolvingTarget
//!        ▲                 │
//!        └─────────────────┘  (extraction failure rewinds; all other
//!                              failures are fatal)
//!   ResolvingTarget ──> Stage1Running ──> AwaitingTermination
//!                  ──> Stage3Running ──> Finalizing ──> exit
//! ```
//!
//! Stage 2 is orthogonal: the updater's resume command may arrive any
//! time after installation data, is latched, and executes once stage 1
//! has completed. Installation proper begins only when both validation
//! has succeeded and the agent has connected (the bootstrap latch), so
//! the agent is guaranteed available to resolve the relaunch PID.
//!
//! Timers are never cancelled; each fired timer re-checks the condition
//! it guards.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use updraft_core::archive::{unarchiver_for, ExtractError, Unarchiver};
use updraft_core::bundle::BundleInfo;
use updraft_core::codesign::{CodeSignatureCheck, ToolCodeSignatureCheck};
use updraft_core::ipc::messages::{decode_process_id, encode_progress};
use updraft_core::ipc::{
    AgentMessageId, AppcastItem, InstallationInfo, InstallationInput, InstallerMessageId, Message,
    Stage1Result, Stage2Command, Stage2Result,
};
use updraft_core::validation::{validate_update, ValidatedUpdate};

use crate::cleanup;
use crate::event::{DeadlineKind, Event, LinkEvent, LinkSide, StageOutcome};
use crate::installer::{
    default_installer_factory, InstallerContext, InstallerError, InstallerFactory, InstallerJob,
    InstallerWorker, Stage1Ready,
};
use crate::links::{
    agent_socket_path, bind_link_socket, spawn_link_server, updater_socket_path, LinkHandle,
};
use crate::watcher::TerminationHandle;

/// Directory under the staging directory receiving extraction output.
const EXTRACTION_DIR: &str = "extracted";

/// Deadlines the controller arms.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Installation input and agent connection must both exist by then.
    pub first_message: Duration,
    /// The agent must resolve the relaunch PID within this window.
    pub pid_retrieval: Duration,
    /// Wait before deciding the updater no longer presents progress UI.
    pub progress_deferral: Duration,
    /// Grace between stage 3 completion and exit, so the relaunched
    /// application gets the first chance to own OS-level activation.
    pub exit_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            first_message: Duration::from_secs(7),
            pid_retrieval: Duration::from_secs(5),
            progress_deferral: Duration::from_millis(700),
            exit_delay: Duration::from_millis(500),
        }
    }
}

/// Launch-time configuration of the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Identifier of the host bundle this daemon may update.
    pub host_bundle_identifier: String,
    /// Whether user interaction is permitted.
    pub allow_interaction: bool,
    /// Directory holding the two link sockets.
    pub socket_dir: PathBuf,
    /// The daemon's own transient bundle, removed on every exit.
    pub own_bundle_path: Option<PathBuf>,
    /// Deadline configuration.
    pub timeouts: Timeouts,
}

/// Factory selecting an unarchiver for a downloaded archive.
pub type UnarchiverFactory =
    Arc<dyn Fn(&Path, Option<&str>) -> Option<Box<dyn Unarchiver>> + Send + Sync>;

/// External collaborators the controller drives.
///
/// Swappable so tests can substitute scripted implementations.
#[derive(Clone)]
pub struct Collaborators {
    /// Unarchiver selection.
    pub unarchiver: UnarchiverFactory,
    /// Installer backend construction.
    pub installer: InstallerFactory,
    /// Code-signing judgements for the validator.
    pub codesign: Arc<dyn CodeSignatureCheck>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            unarchiver: Arc::new(|archive, password| unarchiver_for(archive, password)),
            installer: default_installer_factory(),
            codesign: Arc::new(ToolCodeSignatureCheck::default()),
        }
    }
}

/// Terminal state of one daemon run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Installation finished; exit code 0.
    Success,
    /// A fatal condition aborted the installation; exit code 1.
    Failure,
}

impl DaemonExit {
    /// Process exit code for this outcome.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }
}

/// Primary phase line of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Listening; no (valid) installation input yet.
    AwaitingInputs,
    /// The unarchiver is running.
    Extracting,
    /// The validator is running.
    Validating,
    /// Waiting for the agent to resolve the relaunch PID.
    ResolvingTarget,
    /// Stage 1 is on the worker.
    Stage1Running,
    /// Stage 1 done; waiting for the host process to exit.
    AwaitingTermination,
    /// Stage 3 (with a late stage 2 if needed) is on the worker.
    Stage3Running,
    /// Stage 3 done; backend cleanup and exit delay remain.
    Finalizing,
}

/// The two-event latch gating the start of installation.
///
/// Released exactly once, when both validation success and the initial
/// agent connection have been observed; duplicate events (an agent
/// reconnect, say) never release it early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapGate {
    Idle,
    ValidatorReady,
    AgentReady,
    Released,
}

#[derive(Debug, Clone, Copy)]
enum GateEvent {
    ValidatorSucceeded,
    AgentConnected,
}

impl BootstrapGate {
    /// Advance the latch; returns `true` on the release transition.
    fn advance(&mut self, event: GateEvent) -> bool {
        let next = match (*self, event) {
            (Self::Idle, GateEvent::ValidatorSucceeded) => Self::ValidatorReady,
            (Self::Idle, GateEvent::AgentConnected) => Self::AgentReady,
            (Self::ValidatorReady, GateEvent::AgentConnected)
            | (Self::AgentReady, GateEvent::ValidatorSucceeded) => Self::Released,
            (state, _) => state,
        };
        let released = next == Self::Released && *self != Self::Released;
        *self = next;
        released
    }
}

enum Flow {
    Continue,
    Exit(DaemonExit),
}

/// Lexical path normalization for relaunch-path comparison.
///
/// Deliberately does not resolve symlinks: the installed bundle may be
/// reached through a symlinked location, and resolving would defeat the
/// "caller customized the relaunch path" comparison.
fn normalized(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Decide what the agent should relaunch.
///
/// The new binary location takes precedence; the requested relaunch path
/// only wins when the caller customized it away from the host bundle.
fn relaunch_target(install_path: PathBuf, host_path: &Path, requested: PathBuf) -> PathBuf {
    if normalized(&install_path) != normalized(host_path)
        || normalized(&requested) == normalized(host_path)
    {
        install_path
    } else {
        requested
    }
}

fn path_payload(path: &Path) -> Bytes {
    Bytes::from(path.to_string_lossy().into_owned().into_bytes())
}

/// The installation state machine.
pub struct StageController {
    config: DaemonConfig,
    collaborators: Collaborators,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    updater: LinkHandle,
    agent: LinkHandle,
    worker: InstallerWorker,

    phase: Phase,
    gate: BootstrapGate,

    host: Option<BundleInfo>,
    input: Option<InstallationInput>,
    relaunch_path: Option<PathBuf>,
    staging_directory: Option<PathBuf>,
    validated: Option<ValidatedUpdate>,
    capabilities: Option<Stage1Ready>,
    termination: Option<TerminationHandle>,

    agent_connected: bool,
    updater_gone: bool,
    received_installation_input: bool,
    will_complete_installation: bool,
    performed_stage1: bool,
    performed_stage2: bool,
    performed_stage3: bool,
    stage2_dispatched: bool,
    received_resume: bool,
    should_relaunch: bool,
    should_show_ui: bool,
    received_updater_pong: bool,
    should_launch_installer_progress: bool,
}

impl StageController {
    /// Build a controller over already-spawned link servers.
    #[must_use]
    pub fn new(
        config: DaemonConfig,
        collaborators: Collaborators,
        updater: LinkHandle,
        agent: LinkHandle,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        let worker = InstallerWorker::spawn(events_tx.clone());
        Self {
            config,
            collaborators,
            events_tx,
            events_rx,
            updater,
            agent,
            worker,
            phase: Phase::AwaitingInputs,
            gate: BootstrapGate::Idle,
            host: None,
            input: None,
            relaunch_path: None,
            staging_directory: None,
            validated: None,
            capabilities: None,
            termination: None,
            agent_connected: false,
            updater_gone: false,
            received_installation_input: false,
            will_complete_installation: false,
            performed_stage1: false,
            performed_stage2: false,
            performed_stage3: false,
            stage2_dispatched: false,
            received_resume: false,
            should_relaunch: false,
            should_show_ui: false,
            received_updater_pong: false,
            should_launch_installer_progress: false,
        }
    }

    /// Drive the state machine to completion and tear down.
    pub async fn run(mut self) -> DaemonExit {
        info!(
            identifier = %self.config.host_bundle_identifier,
            "installer daemon ready"
        );
        self.arm_deadline(DeadlineKind::FirstMessage, self.config.timeouts.first_message);

        let exit = loop {
            let Some(event) = self.events_rx.recv().await else {
                break DaemonExit::Failure;
            };
            match self.handle(event) {
                Flow::Continue => {},
                Flow::Exit(exit) => break exit,
            }
        };
        self.teardown(exit)
    }

    fn teardown(mut self, exit: DaemonExit) -> DaemonExit {
        info!(?exit, "daemon exiting");
        self.worker.shutdown();
        let updater_socket =
            updater_socket_path(&self.config.socket_dir, &self.config.host_bundle_identifier);
        let agent_socket =
            agent_socket_path(&self.config.socket_dir, &self.config.host_bundle_identifier);
        cleanup::remove_exit_artifacts(
            self.staging_directory.as_deref(),
            &[&updater_socket, &agent_socket],
            self.config.own_bundle_path.as_deref(),
        );
        exit
    }

    fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Link(LinkSide::Updater, link_event) => self.handle_updater_link(link_event),
            Event::Link(LinkSide::Agent, link_event) => self.handle_agent_link(link_event),
            Event::ExtractionProgress(fraction) => {
                if self.phase == Phase::Extracting {
                    self.send_updater(
                        InstallerMessageId::ExtractedWithProgress,
                        encode_progress(fraction),
                    );
                }
                Flow::Continue
            },
            Event::ExtractionFinished(result) => self.handle_extraction_finished(result),
            Event::ValidationFinished(result) => self.handle_validation_finished(result),
            Event::Stage(outcome) => self.handle_stage_outcome(outcome),
            Event::HostTerminationObserved(observed) => self.handle_host_termination(observed),
            Event::Deadline(kind) => self.handle_deadline(kind),
        }
    }

    fn fatal(&mut self, reason: impl std::fmt::Display) -> Flow {
        error!("fatal: {reason}");
        Flow::Exit(DaemonExit::Failure)
    }

    fn send_updater(&self, id: InstallerMessageId, payload: Bytes) {
        self.updater.send(Message::new(id as i32, payload));
    }

    fn send_updater_empty(&self, id: InstallerMessageId) {
        self.send_updater(id, Bytes::new());
    }

    fn arm_deadline(&self, kind: DeadlineKind, after: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::Deadline(kind));
        });
    }

    fn target_terminated(&self) -> bool {
        self.termination.as_ref().is_some_and(TerminationHandle::terminated)
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    fn handle_updater_link(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Connected => {
                info!("updater connected");
                Flow::Continue
            },
            LinkEvent::Message(message) => {
                let id = match InstallerMessageId::from_wire(message.id) {
                    Ok(id) => id,
                    Err(error) => return self.fatal(error),
                };
                match id {
                    InstallerMessageId::InstallationData => {
                        self.handle_installation_input(&message.payload)
                    },
                    InstallerMessageId::SentUpdateAppcastItemData => {
                        self.handle_appcast_item(&message.payload);
                        Flow::Continue
                    },
                    InstallerMessageId::ResumeToStage2 => self.handle_resume(&message.payload),
                    InstallerMessageId::UpdaterAlivePong => {
                        self.received_updater_pong = true;
                        Flow::Continue
                    },
                    other => self.fatal(format!("unexpected {other:?} from updater")),
                }
            },
            LinkEvent::Invalidated => {
                self.updater_gone = true;
                if self.will_complete_installation {
                    // The updater may have exited on purpose once the
                    // installation was committed.
                    info!("updater link closed after installation began");
                    Flow::Continue
                } else {
                    self.fatal("updater link lost before installation began")
                }
            },
        }
    }

    fn handle_agent_link(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Connected => {
                info!("agent connected");
                self.agent_connected = true;
                if self.gate.advance(GateEvent::AgentConnected) {
                    self.begin_target_resolution()
                } else {
                    Flow::Continue
                }
            },
            LinkEvent::Message(message) => match AgentMessageId::from_wire(message.id) {
                Ok(AgentMessageId::RelaunchProcessId) => {
                    self.handle_relaunch_pid(&message.payload)
                },
                Ok(other) => {
                    warn!(?other, "ignoring unexpected agent message");
                    Flow::Continue
                },
                Err(error) => self.fatal(error),
            },
            LinkEvent::Invalidated => {
                if self.will_complete_installation {
                    warn!("agent link closed during finalization");
                    Flow::Continue
                } else {
                    self.fatal("agent link lost before installation began")
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Inputs, extraction, validation
    // ------------------------------------------------------------------

    fn handle_installation_input(&mut self, payload: &[u8]) -> Flow {
        if self.phase != Phase::AwaitingInputs {
            warn!(phase = ?self.phase, "ignoring installation data outside AwaitingInputs");
            return Flow::Continue;
        }

        let input = match InstallationInput::decode(payload) {
            Ok(input) => input,
            Err(error) => return self.fatal(format!("malformed installation input: {error}")),
        };
        let host = match BundleInfo::load(&input.host_bundle_path) {
            Ok(host) => host,
            Err(error) => return self.fatal(format!("host bundle unreadable: {error}")),
        };
        if host.identifier != self.config.host_bundle_identifier {
            return self.fatal(format!(
                "host bundle identifier {:?} does not match configured {:?}",
                host.identifier, self.config.host_bundle_identifier
            ));
        }
        let Some(relaunch_path) = input.relaunch_path.clone() else {
            return self.fatal("installation input missing relaunch path");
        };
        if !input.archive_within_staging() {
            return self.fatal(format!(
                "archive name {:?} escapes the staging directory",
                input.archive_file_name
            ));
        }

        info!(
            host = %host.bundle_path.display(),
            version = %host.version,
            archive = %input.archive_file_name,
            "received installation input"
        );
        self.staging_directory = Some(input.staging_directory.clone());
        self.relaunch_path = Some(relaunch_path);
        self.host = Some(host);
        self.input = Some(input);
        self.received_installation_input = true;
        self.begin_extraction()
    }

    fn begin_extraction(&mut self) -> Flow {
        let Some(input) = self.input.clone() else {
            return self.fatal("no installation input to extract");
        };
        self.phase = Phase::Extracting;
        self.send_updater_empty(InstallerMessageId::ExtractionStarted);

        let archive = input.archive_path();
        let destination = input.staging_directory.join(EXTRACTION_DIR);
        let select = Arc::clone(&self.collaborators.unarchiver);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let Some(unarchiver) = select(&archive, input.decryption_password.as_deref()) else {
                let _ = events.send(Event::ExtractionFinished(Err(ExtractError::Malformed(
                    format!("no suitable unarchiver for {}", archive.display()),
                ))));
                return;
            };
            // Clear output from a previous (failed) attempt.
            let _ = std::fs::remove_dir_all(&destination);
            if let Err(source) = std::fs::create_dir_all(&destination) {
                let _ = events.send(Event::ExtractionFinished(Err(ExtractError::Io {
                    path: destination,
                    source,
                })));
                return;
            }
            let mut report = |fraction: f64| {
                let _ = events.send(Event::ExtractionProgress(fraction));
            };
            let result = unarchiver.unpack(&destination, &mut report).map(|()| destination);
            let _ = events.send(Event::ExtractionFinished(result));
        });
        Flow::Continue
    }

    fn handle_extraction_finished(&mut self, result: Result<PathBuf, ExtractError>) -> Flow {
        if self.phase != Phase::Extracting {
            warn!(phase = ?self.phase, "ignoring stale extraction result");
            return Flow::Continue;
        }
        match result {
            Err(error) => {
                // Recoverable: the updater may resubmit, e.g. a full
                // archive after a failed delta.
                warn!(%error, "extraction failed; awaiting replacement input");
                self.send_updater_empty(InstallerMessageId::ArchiveExtractionFailed);
                self.input = None;
                self.relaunch_path = None;
                self.phase = Phase::AwaitingInputs;
                Flow::Continue
            },
            Ok(extraction_root) => {
                self.phase = Phase::Validating;
                self.send_updater_empty(InstallerMessageId::ValidationStarted);

                let (Some(host), Some(input)) = (self.host.clone(), self.input.clone()) else {
                    return self.fatal("extraction finished without installation input");
                };
                let codesign = Arc::clone(&self.collaborators.codesign);
                let events = self.events_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = validate_update(
                        &host,
                        &input.archive_path(),
                        &extraction_root,
                        &input.signature,
                        codesign.as_ref(),
                    );
                    let _ = events.send(Event::ValidationFinished(result));
                });
                Flow::Continue
            },
        }
    }

    fn handle_validation_finished(
        &mut self,
        result: Result<ValidatedUpdate, updraft_core::validation::ValidationError>,
    ) -> Flow {
        if self.phase != Phase::Validating {
            warn!(phase = ?self.phase, "ignoring stale validation result");
            return Flow::Continue;
        }
        match result {
            Err(error) => self.fatal(format!("update validation rejected: {error}")),
            Ok(validated) => {
                info!(source = %validated.source.path.display(), "update validated");
                self.validated = Some(validated);
                self.send_updater_empty(InstallerMessageId::InstallationStartedStage1);
                if self.gate.advance(GateEvent::ValidatorSucceeded) {
                    self.begin_target_resolution()
                } else {
                    debug!("validated; waiting for agent connection");
                    Flow::Continue
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Target resolution and stages
    // ------------------------------------------------------------------

    fn begin_target_resolution(&mut self) -> Flow {
        let Some(relaunch_path) = self.relaunch_path.clone() else {
            return self.fatal("bootstrap released without a relaunch path");
        };
        self.phase = Phase::ResolvingTarget;
        info!(path = %relaunch_path.display(), "requesting relaunch process id");
        self.agent.send(Message::new(
            AgentMessageId::RegisterRelaunchBundlePath as i32,
            path_payload(&relaunch_path),
        ));
        self.arm_deadline(DeadlineKind::PidRetrieval, self.config.timeouts.pid_retrieval);
        Flow::Continue
    }

    fn handle_relaunch_pid(&mut self, payload: &[u8]) -> Flow {
        if self.phase != Phase::ResolvingTarget || self.termination.is_some() {
            warn!(phase = ?self.phase, "ignoring unsolicited relaunch process id");
            return Flow::Continue;
        }
        let pid = match decode_process_id(payload) {
            Ok(pid) => pid,
            Err(error) => return self.fatal(error),
        };
        info!(pid, "relaunch target resolved");
        self.termination = Some(TerminationHandle::new(pid));
        self.begin_stage1()
    }

    fn begin_stage1(&mut self) -> Flow {
        let (Some(host), Some(validated), Some(staging_directory)) = (
            self.host.clone(),
            self.validated.clone(),
            self.staging_directory.clone(),
        ) else {
            return self.fatal("stage 1 requested without validated input");
        };

        self.phase = Phase::Stage1Running;
        self.will_complete_installation = true;
        let context = InstallerContext {
            host,
            staging_directory,
            source: validated.source,
            allow_interaction: self.config.allow_interaction,
        };
        self.worker.submit(InstallerJob::ConstructAndStage1 {
            context,
            factory: Arc::clone(&self.collaborators.installer),
        });
        Flow::Continue
    }

    fn handle_resume(&mut self, payload: &[u8]) -> Flow {
        let command = match Stage2Command::decode(payload) {
            Ok(command) => command,
            Err(error) => return self.fatal(error),
        };
        self.should_relaunch = command.relaunch;
        self.should_show_ui = command.show_ui;
        self.received_resume = true;
        if self.performed_stage1 {
            self.dispatch_stage2()
        } else {
            debug!("resume stored until stage 1 completes");
            Flow::Continue
        }
    }

    fn dispatch_stage2(&mut self) -> Flow {
        // Re-entrant safe: at most one stage 2 execution, and only while
        // stage 3 has not been released.
        if self.stage2_dispatched
            || self.performed_stage2
            || self.phase != Phase::AwaitingTermination
        {
            return Flow::Continue;
        }
        self.stage2_dispatched = true;
        self.worker.submit(InstallerJob::Stage2 {
            allow_ui: self.should_show_ui,
        });
        Flow::Continue
    }

    fn handle_stage_outcome(&mut self, outcome: StageOutcome) -> Flow {
        match outcome {
            StageOutcome::Stage1(Err(error)) => self.fatal(format!("stage 1 failed: {error}")),
            StageOutcome::Stage1(Ok(ready)) => self.enter_termination_wait(ready),
            StageOutcome::Stage2(Ok(())) => {
                self.performed_stage2 = true;
                let result = Stage2Result {
                    cancelled: false,
                    target_terminated: self.target_terminated(),
                };
                self.send_updater(InstallerMessageId::InstallationFinishedStage2, result.encode());
                Flow::Continue
            },
            StageOutcome::Stage2(Err(InstallerError::Cancelled)) => {
                // Courtesy notification before aborting.
                let result = Stage2Result {
                    cancelled: true,
                    target_terminated: self.target_terminated(),
                };
                self.send_updater(InstallerMessageId::InstallationFinishedStage2, result.encode());
                self.fatal("installation cancelled during stage 2")
            },
            StageOutcome::Stage2(Err(error)) => self.fatal(format!("stage 2 failed: {error}")),
            StageOutcome::Stage3(Err(error)) => self.fatal(format!("stage 3 failed: {error}")),
            StageOutcome::Stage3(Ok(())) => self.finish_installation(),
            StageOutcome::CleanedUp => {
                self.arm_deadline(DeadlineKind::ExitDelay, self.config.timeouts.exit_delay);
                Flow::Continue
            },
        }
    }

    fn enter_termination_wait(&mut self, ready: Stage1Ready) -> Flow {
        self.performed_stage1 = true;
        self.phase = Phase::AwaitingTermination;

        let result = Stage1Result {
            can_install_silently: ready.can_install_silently,
            target_terminated: self.target_terminated(),
        };
        self.send_updater(InstallerMessageId::InstallationFinishedStage1, result.encode());

        let displays_user_progress = ready.displays_user_progress;
        self.capabilities = Some(ready);

        if let Some(termination) = &self.termination {
            termination.start_watching(self.events_tx.clone());
        }

        self.received_updater_pong = false;
        self.send_updater_empty(InstallerMessageId::UpdaterAlivePing);

        if self.should_show_ui && !displays_user_progress {
            // If the updater stops answering, the agent takes over the
            // progress window after the deferral.
            self.should_launch_installer_progress = true;
            self.arm_deadline(
                DeadlineKind::ProgressDeferral,
                self.config.timeouts.progress_deferral,
            );
        }

        if self.received_resume {
            return self.dispatch_stage2();
        }
        Flow::Continue
    }

    fn handle_host_termination(&mut self, observed: bool) -> Flow {
        if !observed {
            return self.fatal("host termination observer failed to start");
        }
        if self.phase != Phase::AwaitingTermination {
            warn!(phase = ?self.phase, "ignoring host termination outside the wait");
            return Flow::Continue;
        }
        self.phase = Phase::Stage3Running;
        self.worker.submit(InstallerJob::Stage3 {
            allow_ui: self.should_show_ui,
        });
        Flow::Continue
    }

    fn finish_installation(&mut self) -> Flow {
        self.performed_stage2 = true;
        self.performed_stage3 = true;
        self.phase = Phase::Finalizing;

        self.agent.send(Message::empty(AgentMessageId::StopProgress as i32));
        self.should_launch_installer_progress = false;
        self.send_updater_empty(InstallerMessageId::InstallationFinishedStage3);

        let (Some(host_path), Some(install_path), Some(requested)) = (
            self.host.as_ref().map(|host| host.bundle_path.clone()),
            self.capabilities.as_ref().map(|c| c.installation_path.clone()),
            self.relaunch_path.clone(),
        ) else {
            return self.fatal("stage 3 finished without session state");
        };
        let target = relaunch_target(install_path, &host_path, requested);
        if self.should_relaunch {
            info!(path = %target.display(), "requesting relaunch");
            self.agent.send(Message::new(
                AgentMessageId::Relaunch as i32,
                path_payload(&target),
            ));
        }

        self.worker.submit(InstallerJob::Cleanup);
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Appcast forwarding, deadlines
    // ------------------------------------------------------------------

    fn handle_appcast_item(&mut self, payload: &[u8]) {
        // Best effort: malformed items are dropped silently.
        let Ok(item) = AppcastItem::decode(payload) else {
            debug!("dropping undecodable appcast item");
            return;
        };
        let info = InstallationInfo {
            appcast_item: item,
            can_silently_install: self
                .capabilities
                .as_ref()
                .is_some_and(|c| c.can_install_silently),
        };
        match info.encode() {
            Ok(bytes) => self.agent.send(Message::new(
                AgentMessageId::RegisterInstallationInfo as i32,
                Bytes::from(bytes),
            )),
            Err(error) => debug!(%error, "failed to re-encode installation info"),
        }
    }

    fn handle_deadline(&mut self, kind: DeadlineKind) -> Flow {
        match kind {
            DeadlineKind::FirstMessage => {
                if self.received_installation_input && self.agent_connected {
                    Flow::Continue
                } else {
                    self.fatal("startup deadline: no installation input or agent connection")
                }
            },
            DeadlineKind::PidRetrieval => {
                if self.termination.is_some() {
                    Flow::Continue
                } else {
                    self.fatal("relaunch process id not resolved in time")
                }
            },
            DeadlineKind::ProgressDeferral => {
                if self.should_launch_installer_progress
                    && (!self.received_updater_pong || self.updater_gone)
                {
                    info!("updater not presenting progress; agent takes over");
                    self.agent
                        .send(Message::empty(AgentMessageId::ShowProgress as i32));
                }
                Flow::Continue
            },
            DeadlineKind::ExitDelay => {
                if self.performed_stage3 {
                    Flow::Exit(DaemonExit::Success)
                } else {
                    Flow::Continue
                }
            },
        }
    }
}

/// Bind the link sockets, spawn the servers, and run the daemon.
///
/// Returns the terminal outcome; the caller maps it to a process exit
/// code. All daemon-owned on-disk artifacts are removed before this
/// returns, on every path.
pub async fn run_daemon(config: DaemonConfig, collaborators: Collaborators) -> DaemonExit {
    let updater_socket = updater_socket_path(&config.socket_dir, &config.host_bundle_identifier);
    let agent_socket = agent_socket_path(&config.socket_dir, &config.host_bundle_identifier);

    let updater_listener = match bind_link_socket(&updater_socket) {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, path = %updater_socket.display(), "failed to bind updater socket");
            cleanup::remove_exit_artifacts(None, &[], config.own_bundle_path.as_deref());
            return DaemonExit::Failure;
        },
    };
    let agent_listener = match bind_link_socket(&agent_socket) {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, path = %agent_socket.display(), "failed to bind agent socket");
            cleanup::remove_exit_artifacts(
                None,
                &[&updater_socket],
                config.own_bundle_path.as_deref(),
            );
            return DaemonExit::Failure;
        },
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let updater = spawn_link_server(updater_listener, LinkSide::Updater, events_tx.clone());
    let agent = spawn_link_server(agent_listener, LinkSide::Agent, events_tx.clone());

    let controller =
        StageController::new(config, collaborators, updater, agent, events_tx, events_rx);
    controller.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_releases_once_on_the_second_distinct_event() {
        let mut gate = BootstrapGate::Idle;
        assert!(!gate.advance(GateEvent::ValidatorSucceeded));
        assert!(gate.advance(GateEvent::AgentConnected));
        // Duplicates after release never fire again.
        assert!(!gate.advance(GateEvent::AgentConnected));
        assert!(!gate.advance(GateEvent::ValidatorSucceeded));
    }

    #[test]
    fn gate_order_is_irrelevant() {
        let mut gate = BootstrapGate::Idle;
        assert!(!gate.advance(GateEvent::AgentConnected));
        assert!(gate.advance(GateEvent::ValidatorSucceeded));
    }

    #[test]
    fn gate_ignores_duplicate_events_before_release() {
        // An agent reconnect must not release the gate on its own.
        let mut gate = BootstrapGate::Idle;
        assert!(!gate.advance(GateEvent::AgentConnected));
        assert!(!gate.advance(GateEvent::AgentConnected));
        assert_eq!(gate, BootstrapGate::AgentReady);
        assert!(gate.advance(GateEvent::ValidatorSucceeded));
    }

    #[test]
    fn normalization_is_lexical() {
        assert_eq!(
            normalized(Path::new("/apps/./Example/../Example")),
            Path::new("/apps/Example")
        );
        assert_eq!(normalized(Path::new("/apps/Example/")), Path::new("/apps/Example"));
    }

    #[test]
    fn relaunch_prefers_moved_install_path() {
        // The bundle was renamed by the update.
        let target = relaunch_target(
            PathBuf::from("/apps/Example Pro"),
            Path::new("/apps/Example"),
            PathBuf::from("/apps/Example"),
        );
        assert_eq!(target, Path::new("/apps/Example Pro"));
    }

    #[test]
    fn relaunch_uses_install_path_when_request_is_the_default() {
        let target = relaunch_target(
            PathBuf::from("/apps/Example"),
            Path::new("/apps/Example"),
            PathBuf::from("/apps/Example/"),
        );
        assert_eq!(target, Path::new("/apps/Example"));
    }

    #[test]
    fn relaunch_honors_customized_request() {
        // In-place install, caller asked for a different binary.
        let target = relaunch_target(
            PathBuf::from("/apps/Example"),
            Path::new("/apps/Example"),
            PathBuf::from("/apps/Helper"),
        );
        assert_eq!(target, Path::new("/apps/Helper"));
    }
}
