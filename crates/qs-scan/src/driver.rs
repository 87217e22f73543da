//! Scan coordinator: dispatch, collection, filtering, checkpoints and the
//! wall-clock budget.

use crossbeam_channel::{bounded, unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use qs_optimizer::StageDefinition;
use qs_types::{Configuration, Evaluator, QsError, QsResult, ScanError};

use crate::checkpoint::{Checkpointer, ResultStore};
use crate::filter::{KeepThresholds, ResultFilter};
use crate::grid::{Grid, ScanDimension};
use crate::job::{RunId, ScanJobSpec, ScanResult};
use crate::pool::{worker_loop, Assignment, WorkerContext, WorkerMessage};

/// Run-level knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    pub workers: usize,
    /// Checkpoint every this many completed jobs.
    pub save_period: usize,
    /// Log progress every this many completed jobs.
    pub print_status_period: usize,
    /// Stop dispatching after this many seconds.
    pub max_seconds: Option<f64>,
    pub keep_all: bool,
    pub quit_after_init: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            save_period: 100,
            print_status_period: 100,
            max_seconds: None,
            keep_all: false,
            quit_after_init: false,
        }
    }
}

/// Everything that defines one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub reference: Configuration,
    pub stages: Vec<StageDefinition>,
    pub dimensions: Vec<ScanDimension>,
    pub thresholds: KeepThresholds,
    pub settings: ScanSettings,
}

/// Why the coordinator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStopReason {
    /// Every grid point was run (or already stored).
    Completed,
    /// The wall-clock budget ran out before every point was dispatched.
    TimeBudget,
    /// Initialization only.
    QuitAfterInit,
    /// The worker channel closed with work left.
    WorkersLost,
}

/// Summary of one scan run.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub run_id: RunId,
    pub stop_reason: ScanStopReason,
    pub grid_points: usize,
    /// Grid points skipped because the store already had them.
    pub resumed: usize,
    pub dispatched: usize,
    /// Results of this run, sorted by grid index.
    pub results: Vec<ScanResult>,
    pub persisted: usize,
    pub elapsed: Duration,
}

impl ScanReport {
    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn retained(&self) -> impl Iterator<Item = &ScanResult> {
        self.results.iter().filter(|r| r.verdict.is_retained())
    }

    pub fn retained_count(&self) -> usize {
        self.retained().count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.verdict.is_failed()).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.completed() - self.retained_count() - self.failed_count()
    }
}

/// Running tallies owned by the coordinator.
struct Progress {
    started: Instant,
    completed: usize,
    retained: Vec<ScanResult>,
    failed: usize,
    results: Vec<ScanResult>,
}

impl Progress {
    fn log_status(&self, remaining: usize) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        };
        info!(
            "Completed {} jobs ({} retained, {} failed, {} remaining) in {:.1}s, {:.2} jobs/s",
            self.completed,
            self.retained.len(),
            self.failed,
            remaining,
            elapsed,
            rate
        );
    }
}

/// Runs a scan plan over a pool of worker threads.
pub struct ScanDriver<E, S> {
    evaluator: E,
    plan: ScanPlan,
    store: S,
    run_id: RunId,
}

impl<E: Evaluator, S: ResultStore> ScanDriver<E, S> {
    pub fn new(evaluator: E, plan: ScanPlan, store: S) -> Self {
        Self {
            evaluator,
            plan,
            store,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Enumerate the grid, run every pending point and persist what is kept.
    pub fn run(&mut self) -> QsResult<ScanReport> {
        let started = Instant::now();
        let settings = self.plan.settings.clone();
        let grid = Grid::new(self.plan.dimensions.clone())?;
        info!(
            "Scan {}: {} grid points over {} dimensions, {} stages, {} workers",
            self.run_id,
            grid.len(),
            grid.dimensions().len(),
            self.plan.stages.len(),
            settings.workers
        );

        let mut report = ScanReport {
            run_id: self.run_id,
            stop_reason: ScanStopReason::QuitAfterInit,
            grid_points: grid.len(),
            resumed: 0,
            dispatched: 0,
            results: Vec::new(),
            persisted: 0,
            elapsed: Duration::ZERO,
        };
        if settings.quit_after_init {
            info!("quit_after_init is set, not dispatching");
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let stored = self.store.completed_points()?;
        check_stored_points(&grid, &stored)?;
        let mut pending: VecDeque<usize> = (0..grid.len()).filter(|i| !stored.contains_key(i)).collect();
        report.resumed = grid.len() - pending.len();
        if report.resumed > 0 {
            info!("Resuming: {} grid points already stored in {}", report.resumed, self.store.describe());
        }

        let filter = ResultFilter::new(settings.keep_all, self.plan.thresholds.clone());
        let budget = settings
            .max_seconds
            .map(|s| Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(Duration::MAX));
        let mut checkpointer = Checkpointer::new(&mut self.store, settings.save_period);
        let mut progress = Progress {
            started,
            completed: 0,
            retained: Vec::new(),
            failed: 0,
            results: Vec::new(),
        };
        let mut stop_reason = ScanStopReason::Completed;
        let mut fatal: Option<QsError> = None;
        let mut dispatched = 0;
        let workers = settings.workers.max(1).min(pending.len().max(1));

        let evaluator = &self.evaluator;
        let plan = &self.plan;
        let run_id = self.run_id;
        thread::scope(|scope| {
            let (outbox, messages) = unbounded();
            let mut inboxes: Vec<Sender<Assignment>> = Vec::with_capacity(workers);
            for id in 0..workers {
                let (tx, rx) = bounded(1);
                inboxes.push(tx);
                let outbox = outbox.clone();
                let filter = &filter;
                scope.spawn(move || {
                    let ctx = WorkerContext {
                        id,
                        evaluator,
                        filter,
                        run_id,
                    };
                    worker_loop(ctx, outbox, rx)
                });
            }
            drop(outbox);

            let mut active = workers;
            while active > 0 {
                let message = match messages.recv() {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("All workers disconnected with {} jobs pending", pending.len());
                        if !pending.is_empty() {
                            stop_reason = ScanStopReason::WorkersLost;
                        }
                        break;
                    }
                };

                let worker = message.worker();
                if let WorkerMessage::Finished { result, .. } = message {
                    progress.completed += 1;
                    if result.verdict.is_failed() {
                        progress.failed += 1;
                    } else if result.verdict.is_retained() {
                        progress.retained.push((*result).clone());
                    }
                    progress.results.push(*result);
                    checkpointer.job_completed(&progress.retained);
                    if progress.completed % settings.print_status_period.max(1) == 0 {
                        progress.log_status(pending.len());
                    }
                }

                let over_budget = budget.is_some_and(|b| started.elapsed() >= b);
                if over_budget && !pending.is_empty() && stop_reason != ScanStopReason::TimeBudget {
                    info!("Time budget exhausted, {} grid points not dispatched", pending.len());
                    stop_reason = ScanStopReason::TimeBudget;
                }

                let next = if over_budget || fatal.is_some() {
                    None
                } else {
                    pending.pop_front()
                };
                let assignment = match next.and_then(|index| grid.point(index)) {
                    Some(point) => {
                        let index = point.index;
                        match ScanJobSpec::new(point, grid.dimensions(), &plan.reference, &plan.stages) {
                            Ok(job) => Assignment::Run(Box::new(job)),
                            Err(err) => {
                                error!("Cannot build job for grid point {}: {}", index, err);
                                fatal = Some(err);
                                Assignment::Stop
                            }
                        }
                    }
                    None => Assignment::Stop,
                };
                let stopping = matches!(assignment, Assignment::Stop);
                if inboxes[worker].send(assignment).is_err() {
                    warn!("Worker {} went away", worker);
                    if let Some(index) = next {
                        pending.push_front(index);
                    }
                    active -= 1;
                    continue;
                }
                if stopping {
                    active -= 1;
                } else {
                    dispatched += 1;
                }
            }
        });

        if stop_reason == ScanStopReason::Completed && !pending.is_empty() {
            stop_reason = ScanStopReason::WorkersLost;
        }
        progress.log_status(pending.len());
        report.persisted = {
            checkpointer.finish(&progress.retained)?;
            checkpointer.persisted()
        };
        if let Some(err) = fatal {
            return Err(err);
        }
        progress.results.sort_by_key(|r| r.index);
        report.results = progress.results;
        report.dispatched = dispatched;
        report.stop_reason = stop_reason;
        report.elapsed = started.elapsed();
        info!(
            "Scan {} finished ({:?}): {} retained, {} rejected, {} failed",
            self.run_id,
            report.stop_reason,
            report.retained_count(),
            report.rejected_count(),
            report.failed_count()
        );
        Ok(report)
    }
}

/// Every stored result must sit on this grid with the same sampled values,
/// otherwise the store belongs to a different scan.
fn check_stored_points(grid: &Grid, stored: &BTreeMap<usize, Vec<f64>>) -> Result<(), ScanError> {
    for (&index, values) in stored {
        let Some(point) = grid.point(index) else {
            return Err(ScanError::StoreMismatch {
                index,
                message: format!("the grid has only {} points", grid.len()),
            });
        };
        let same = point.values.len() == values.len()
            && point
                .values
                .iter()
                .zip(values)
                .all(|(a, b)| a == b || (a - b).abs() <= 1e-12 * a.abs().max(b.abs()));
        if !same {
            return Err(ScanError::StoreMismatch {
                index,
                message: format!("stored values {:?}, grid values {:?}", values, point.values),
            });
        }
    }
    Ok(())
}
