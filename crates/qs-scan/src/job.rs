//! Scan jobs and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use qs_optimizer::{MultiStageOptimizer, StageDefinition, StageOverride};
use qs_types::{internal_error, Configuration, Diagnostics, Evaluator, QsResult};

use crate::filter::ResultFilter;
use crate::grid::{GridPoint, ScanDimension};

/// Unique scan run identifier.
pub type RunId = Uuid;

/// One grid point's worth of work: the reference configuration and the
/// pipeline with the sampled values bound to their stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanJobSpec {
    pub index: usize,
    pub values: Vec<f64>,
    pub reference: Configuration,
    pub stages: Vec<StageDefinition>,
}

impl ScanJobSpec {
    pub fn new(
        point: GridPoint,
        dimensions: &[ScanDimension],
        reference: &Configuration,
        stages: &[StageDefinition],
    ) -> QsResult<Self> {
        if point.values.len() != dimensions.len() {
            return Err(internal_error!(
                "grid point {} has {} values for {} dimensions",
                point.index,
                point.values.len(),
                dimensions.len()
            ));
        }
        let mut stages = stages.to_vec();
        let count = stages.len();
        for (dimension, value) in dimensions.iter().zip(&point.values) {
            let stage = stages.get_mut(dimension.stage).ok_or_else(|| {
                internal_error!(
                    "{} is bound to stage {}, but the pipeline has {} stages",
                    dimension.param,
                    dimension.stage,
                    count
                )
            })?;
            stage.overrides.push(StageOverride {
                param: dimension.param,
                value: *value,
            });
        }
        Ok(Self {
            index: point.index,
            values: point.values,
            reference: reference.clone(),
            stages,
        })
    }

    /// Run the pipeline and judge the outcome.
    pub fn run<E: Evaluator>(&self, evaluator: &E, filter: &ResultFilter, run_id: RunId) -> ScanResult {
        let started = Instant::now();
        let optimizer = MultiStageOptimizer::new(evaluator, self.stages.clone());
        let mut result = ScanResult::new(run_id, self.index, self.values.clone());

        match optimizer.optimize(&self.reference) {
            Ok(report) => {
                result.iterations_per_stage = report.iterations_per_stage();
                result.stage_status = report.stages.iter().map(|s| s.status.label()).collect();
                result.evaluations = report.total_evaluations();
                result.final_configuration = report.final_configuration().cloned();
                result.final_diagnostics = report.final_diagnostics().cloned();
                result.verdict = match (&report.failure, &result.final_diagnostics) {
                    (Some(err), _) => Verdict::Failed {
                        error: err.to_string(),
                    },
                    (None, Some(diagnostics)) => filter.judge(diagnostics),
                    (None, None) => Verdict::Failed {
                        error: "pipeline produced no diagnostics".to_string(),
                    },
                };
            }
            Err(err) => {
                result.verdict = Verdict::Failed {
                    error: err.to_string(),
                };
            }
        }

        result.wall_seconds = started.elapsed().as_secs_f64();
        result.completed_at = Utc::now();
        debug!(index = self.index, verdict = result.verdict.label(), "job finished");
        result
    }
}

/// Whether a completed job was kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Retained,
    Rejected { reasons: Vec<String> },
    Failed { error: String },
}

impl Verdict {
    pub fn is_retained(&self) -> bool {
        matches!(self, Self::Retained)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Retained => "retained",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Outcome of one scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub run_id: RunId,
    pub index: usize,
    pub values: Vec<f64>,
    pub verdict: Verdict,
    pub final_configuration: Option<Configuration>,
    pub final_diagnostics: Option<Diagnostics>,
    pub iterations_per_stage: Vec<usize>,
    pub stage_status: Vec<String>,
    pub evaluations: usize,
    pub wall_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

impl ScanResult {
    fn new(run_id: RunId, index: usize, values: Vec<f64>) -> Self {
        Self {
            run_id,
            index,
            values,
            verdict: Verdict::Retained,
            final_configuration: None,
            final_diagnostics: None,
            iterations_per_stage: Vec::new(),
            stage_status: Vec::new(),
            evaluations: 0,
            wall_seconds: 0.0,
            completed_at: Utc::now(),
        }
    }

    /// Result for a job that did not produce a report at all.
    pub fn failed(run_id: RunId, index: usize, values: Vec<f64>, error: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Failed {
                error: error.into(),
            },
            ..Self::new(run_id, index, values)
        }
    }
}
