//! Process-wide registry of the single active run
//!
//! The slot is owned here rather than living in global state. Starting a run
//! is a compare-and-set on the slot: `Empty -> Reserved` while the browser
//! engine is prepared, then `Reserved -> Active` once the run row exists.
//! Both guards release the slot on drop, so an early return or a panic in
//! the run task can never leave it occupied.

use parking_lot::Mutex;
use qaflow_common::ActiveRunContext;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
enum Slot {
    Empty,
    Reserved {
        ticket: u64,
        project_id: String,
        test_case_id: String,
    },
    Active {
        context: ActiveRunContext,
        cancel: CancellationToken,
    },
}

#[derive(Debug)]
struct Inner {
    slot: Slot,
    next_ticket: u64,
}

#[derive(Debug)]
pub struct RunRegistry {
    inner: Mutex<Inner>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Empty,
                next_ticket: 1,
            }),
        }
    }
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for a run about to start, failing fast if it is taken
    pub fn reserve(
        self: &Arc<Self>,
        project_id: &str,
        test_case_id: &str,
    ) -> EngineResult<Reservation> {
        let mut inner = self.inner.lock();
        match &inner.slot {
            Slot::Empty => {}
            Slot::Reserved { .. } => return Err(EngineError::AlreadyRunning { run_id: None }),
            Slot::Active { context, .. } => {
                return Err(EngineError::AlreadyRunning {
                    run_id: Some(context.run_id.clone()),
                })
            }
        }

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.slot = Slot::Reserved {
            ticket,
            project_id: project_id.to_string(),
            test_case_id: test_case_id.to_string(),
        };
        debug!(test_case_id, "run slot reserved");

        Ok(Reservation {
            registry: Arc::clone(self),
            ticket,
            project_id: project_id.to_string(),
            test_case_id: test_case_id.to_string(),
            released: false,
        })
    }

    /// The run currently in progress, if any
    pub fn active_context(&self) -> Option<ActiveRunContext> {
        match &self.inner.lock().slot {
            Slot::Active { context, .. } => Some(context.clone()),
            _ => None,
        }
    }

    /// Record a cancel request for `run_id`; false when it is not the active run
    pub fn request_cancel(&self, run_id: &str) -> bool {
        match &self.inner.lock().slot {
            Slot::Active { context, cancel } if context.run_id == run_id => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Run `delete` only if no run in progress belongs to the project.
    ///
    /// The slot stays locked until `delete` returns, so no run can start
    /// for the project between the check and the commit.
    pub fn delete_project_guarded<T>(
        &self,
        project_id: &str,
        delete: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let inner = self.inner.lock();
        check_project(&inner.slot, project_id)?;
        delete()
    }

    /// Run `delete` only if the test case is not the subject of the run in progress
    pub fn delete_test_case_guarded<T>(
        &self,
        test_case_id: &str,
        delete: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let inner = self.inner.lock();
        check_test_case(&inner.slot, test_case_id)?;
        delete()
    }

    fn release_ticket(&self, ticket: u64) {
        let mut inner = self.inner.lock();
        if matches!(inner.slot, Slot::Reserved { ticket: t, .. } if t == ticket) {
            inner.slot = Slot::Empty;
            debug!("run slot reservation released");
        }
    }

    fn release_run(&self, run_id: &str) {
        let mut inner = self.inner.lock();
        if matches!(&inner.slot, Slot::Active { context, .. } if context.run_id == run_id) {
            inner.slot = Slot::Empty;
            debug!(run_id, "active run cleared");
        }
    }
}

fn check_project(slot: &Slot, project_id: &str) -> EngineResult<()> {
    let blocked = match slot {
        Slot::Empty => false,
        Slot::Reserved { project_id: p, .. } => p == project_id,
        Slot::Active { context, .. } => context.project_id == project_id,
    };
    if blocked {
        return Err(EngineError::RunInProgress {
            kind: "project".to_string(),
            id: project_id.to_string(),
        });
    }
    Ok(())
}

fn check_test_case(slot: &Slot, test_case_id: &str) -> EngineResult<()> {
    let blocked = match slot {
        Slot::Empty => false,
        Slot::Reserved { test_case_id: t, .. } => t == test_case_id,
        Slot::Active { context, .. } => context.test_case_id == test_case_id,
    };
    if blocked {
        return Err(EngineError::RunInProgress {
            kind: "test case".to_string(),
            id: test_case_id.to_string(),
        });
    }
    Ok(())
}

/// A claimed but not yet active slot
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<RunRegistry>,
    ticket: u64,
    project_id: String,
    test_case_id: String,
    released: bool,
}

impl Reservation {
    /// Promote the reservation to an active run context
    pub fn activate(mut self, run_id: &str) -> ActiveRun {
        let cancel = CancellationToken::new();
        let context = ActiveRunContext {
            run_id: run_id.to_string(),
            project_id: self.project_id.clone(),
            test_case_id: self.test_case_id.clone(),
        };

        {
            let mut inner = self.registry.inner.lock();
            inner.slot = Slot::Active {
                context: context.clone(),
                cancel: cancel.clone(),
            };
        }
        self.released = true;

        ActiveRun {
            registry: Arc::clone(&self.registry),
            context,
            cancel,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release_ticket(self.ticket);
        }
    }
}

/// Holds the active slot for the lifetime of a run
#[derive(Debug)]
pub struct ActiveRun {
    registry: Arc<RunRegistry>,
    context: ActiveRunContext,
    cancel: CancellationToken,
}

impl ActiveRun {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.registry.release_run(&self.context.run_id);
    }
}
