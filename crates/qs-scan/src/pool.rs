//! Coordinator/worker message protocol and the worker loop.
//!
//! Workers pull: each one announces itself with [`WorkerMessage::Ready`]
//! and, after every job, reports [`WorkerMessage::Finished`], which the
//! coordinator also treats as a request for more work. The coordinator
//! answers every request with exactly one [`Assignment`].

use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

use qs_types::{Evaluator, ScanError};

use crate::filter::ResultFilter;
use crate::job::{RunId, ScanJobSpec, ScanResult};

/// Worker to coordinator.
#[derive(Debug)]
pub enum WorkerMessage {
    Ready { worker: usize },
    Finished { worker: usize, result: Box<ScanResult> },
}

impl WorkerMessage {
    pub fn worker(&self) -> usize {
        match self {
            Self::Ready { worker } | Self::Finished { worker, .. } => *worker,
        }
    }
}

/// Coordinator to worker.
#[derive(Debug)]
pub enum Assignment {
    Run(Box<ScanJobSpec>),
    Stop,
}

/// Everything a worker needs besides its channels.
pub struct WorkerContext<'a, E> {
    pub id: usize,
    pub evaluator: &'a E,
    pub filter: &'a ResultFilter,
    pub run_id: RunId,
}

/// Serve assignments until told to stop or the coordinator goes away.
/// Returns the number of jobs run.
pub fn worker_loop<E: Evaluator>(
    ctx: WorkerContext<'_, E>,
    outbox: Sender<WorkerMessage>,
    inbox: Receiver<Assignment>,
) -> usize {
    let mut jobs = 0;
    if outbox.send(WorkerMessage::Ready { worker: ctx.id }).is_err() {
        return jobs;
    }
    loop {
        let job = match inbox.recv() {
            Ok(Assignment::Run(job)) => job,
            Ok(Assignment::Stop) | Err(_) => break,
        };
        jobs += 1;
        let result = run_guarded(&ctx, &job);
        let message = WorkerMessage::Finished {
            worker: ctx.id,
            result: Box::new(result),
        };
        if outbox.send(message).is_err() {
            break;
        }
    }
    debug!(worker = ctx.id, jobs, "worker stopped");
    jobs
}

/// Run one job, turning a panic into a failed result.
fn run_guarded<E: Evaluator>(ctx: &WorkerContext<'_, E>, job: &ScanJobSpec) -> ScanResult {
    let outcome = catch_unwind(AssertUnwindSafe(|| job.run(ctx.evaluator, ctx.filter, ctx.run_id)));
    outcome.unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let err = ScanError::JobPanicked {
            index: job.index,
            message,
        };
        error!(worker = ctx.id, "{}", err);
        ScanResult::failed(ctx.run_id, job.index, job.values.clone(), err.to_string())
    })
}
