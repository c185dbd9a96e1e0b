use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle of the worker side. Written only by whoever drives the control
/// loop, read by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Init,
    Starting,
    Started,
    Running,
    Processing,
    Quitting,
    Finished,
    StartupError,
}

impl WorkerState {
    // The worker lifecycle:
    //
    //   ┌──────┐     ┌──────────┐  ok   ┌─────────┐
    //   │ INIT ├─────► STARTING ├───────► STARTED │
    //   └──────┘     └────┬─────┘       └────┬────┘
    //                     │err               │
    //                     │           ┌──────▼──────┐  next request  ┌────────────┐
    //              ┌──────▼───────┐   │   RUNNING   ◄────────────────► PROCESSING │
    //              │ STARTUP_ERROR│   └──────┬──────┘   idle         └─────┬──────┘
    //              └──────┬───────┘          │                             │quit
    //                     │                  │           ┌──────────┐      │
    //                     │                  └───────────► QUITTING ◄──────┘
    //                     │   cleanup                    └────┬─────┘
    //                     │  ┌──────────┐   cleanup           │
    //                     └──► FINISHED ◄─────────────────────┘
    //                        └──────────┘
    //
    //  Staying in the same state is always allowed, leaving `Finished` never is.
    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Init, Starting)
                | (Starting, Started | StartupError)
                | (Started | Running | Processing, Running | Processing | Quitting | Finished)
                | (Quitting | StartupError, Finished)
        )
    }

    /// No request will ever be processed again once the worker is here.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::StartupError | WorkerState::Finished)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Init => "init",
            WorkerState::Starting => "starting",
            WorkerState::Started => "started",
            WorkerState::Running => "running",
            WorkerState::Processing => "processing",
            WorkerState::Quitting => "quitting",
            WorkerState::Finished => "finished",
            WorkerState::StartupError => "startup_error",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The controller's own view of the worker, driven by what the caller has
/// observed rather than by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterState {
    Running,
    /// A quit has been submitted but its acknowledgment was not seen yet.
    Quitting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid worker state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: WorkerState,
    pub to: WorkerState,
}

/// Single-writer cell holding the current [`WorkerState`]. Readers can
/// either peek or subscribe and be woken on every change.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<WorkerState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(WorkerState::Init);
        Self { tx }
    }

    pub fn current(&self) -> WorkerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the state we left. Subscribers are only
    /// notified when the state actually changes.
    pub fn advance(&self, next: WorkerState) -> Result<WorkerState, TransitionError> {
        let mut result = Ok(next);

        self.tx.send_if_modified(|current| {
            let from = *current;
            if !from.can_become(next) {
                result = Err(TransitionError { from, to: next });
                return false;
            }

            result = Ok(from);
            *current = next;
            from != next
        });

        if let Ok(from) = result {
            if from != next {
                tracing::debug!("worker state {from} -> {next}");
            }
        }

        result
    }

    /// Wait until the state satisfies `predicate`, returning the matching state.
    pub async fn wait_for<P>(&self, mut predicate: P) -> WorkerState
    where
        P: FnMut(WorkerState) -> bool,
    {
        let mut rx = self.subscribe();

        // The sender lives in `self`, so the receiver cannot observe a
        // closed channel while we are borrowed.
        let state = match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.current(),
        };
        state
    }
}
