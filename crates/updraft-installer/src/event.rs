//! The controller's event funnel.
//!
//! Every asynchronous source in the daemon (link tasks, the extraction
//! and validation jobs, the installer worker, the termination watcher,
//! armed timers) reports through one unbounded channel of [`Event`]
//! values. The stage controller consumes the channel on the main
//! scheduler, so all state mutation is serialized and handlers run
//! atomically with respect to each other.

use std::path::PathBuf;

use updraft_core::archive::ExtractError;
use updraft_core::ipc::Message;
use updraft_core::validation::{ValidatedUpdate, ValidationError};

use crate::installer::{InstallerError, Stage1Ready};

/// Which peer link an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    /// The updater process driving the installation.
    Updater,
    /// The UI agent process owning progress and relaunch.
    Agent,
}

/// Lifecycle and traffic events of one peer link.
#[derive(Debug)]
pub enum LinkEvent {
    /// The peer established its (single) connection.
    Connected,
    /// A framed message arrived from the peer.
    Message(Message),
    /// The connection dropped or failed; no further traffic will arrive.
    Invalidated,
}

/// Timers armed by the controller. Each fired timer re-checks its guarded
/// precondition; timers are never cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Installation input and agent connection must both exist by now.
    FirstMessage,
    /// The agent must have resolved the relaunch PID by now.
    PidRetrieval,
    /// Decide whether the daemon must show its own progress UI.
    ProgressDeferral,
    /// Grace period between stage 3 completion and process exit.
    ExitDelay,
}

/// Results posted back from the serial installer worker.
#[derive(Debug)]
pub enum StageOutcome {
    /// Backend construction plus stage 1.
    Stage1(Result<Stage1Ready, InstallerError>),
    /// Stage 2, triggered by the updater's resume command.
    Stage2(Result<(), InstallerError>),
    /// Stage 2 (if still needed) plus stage 3, after host termination.
    Stage3(Result<(), InstallerError>),
    /// Backend cleanup after a successful stage 3.
    CleanedUp,
}

/// Everything the stage controller reacts to.
#[derive(Debug)]
pub enum Event {
    /// Link lifecycle or traffic.
    Link(LinkSide, LinkEvent),
    /// Fractional extraction progress from the unarchiver.
    ExtractionProgress(f64),
    /// Extraction ended; `Ok` carries the extraction root.
    ExtractionFinished(Result<PathBuf, ExtractError>),
    /// Validation ended.
    ValidationFinished(Result<ValidatedUpdate, ValidationError>),
    /// A worker stage ended.
    Stage(StageOutcome),
    /// The termination watcher completed. `true` means the host process
    /// was observed to exit; `false` means the observer failed to start.
    HostTerminationObserved(bool),
    /// An armed timer fired.
    Deadline(DeadlineKind),
}
