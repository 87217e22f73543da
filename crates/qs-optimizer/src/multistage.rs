//! Chained optimization stages with Fourier refinement between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, info_span, warn};

use qs_types::{
    AxisSeries, ConfigError, ConfigParam, Configuration, Diagnostics, Evaluator, IterationRecord,
    QsError, QsResult, SolverError, VaryMask,
};

use crate::residuals::{Objective, TermKind};
use crate::stage::{StageOptimizer, StageReport, StageSettings, StageStatus};

/// Explicit vary flags for modes a template does not list. `None` falls
/// back to the default policy: new `R0c`/`Z0s` modes are varied, new
/// `R0s`/`Z0c` modes only when the template varies any mode of that series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NewModeFlags {
    #[serde(rename = "R0c")]
    pub r0c: Option<bool>,
    #[serde(rename = "R0s")]
    pub r0s: Option<bool>,
    #[serde(rename = "Z0c")]
    pub z0c: Option<bool>,
    #[serde(rename = "Z0s")]
    pub z0s: Option<bool>,
}

impl NewModeFlags {
    pub fn get(&self, series: AxisSeries) -> Option<bool> {
        match series {
            AxisSeries::R0c => self.r0c,
            AxisSeries::R0s => self.r0s,
            AxisSeries::Z0c => self.z0c,
            AxisSeries::Z0s => self.z0s,
        }
    }
}

/// Per-stage vary flags, possibly shorter than the axis they end up
/// applied to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaryTemplate {
    #[serde(rename = "vary_R0c")]
    pub r0c: Vec<bool>,
    #[serde(rename = "vary_R0s")]
    pub r0s: Vec<bool>,
    #[serde(rename = "vary_Z0c")]
    pub z0c: Vec<bool>,
    #[serde(rename = "vary_Z0s")]
    pub z0s: Vec<bool>,
    #[serde(rename = "vary_eta_bar")]
    pub eta_bar: bool,
    #[serde(rename = "vary_sigma0")]
    pub sigma0: bool,
    #[serde(rename = "vary_B2c")]
    pub b2c: bool,
    #[serde(rename = "vary_B2s")]
    pub b2s: bool,
    pub new_modes: NewModeFlags,
}

impl VaryTemplate {
    fn series(&self, series: AxisSeries) -> &[bool] {
        match series {
            AxisSeries::R0c => &self.r0c,
            AxisSeries::R0s => &self.r0s,
            AxisSeries::Z0c => &self.z0c,
            AxisSeries::Z0s => &self.z0s,
        }
    }

    /// Whether modes past the end of the template are varied for `series`.
    pub fn varies_new_modes(&self, series: AxisSeries) -> bool {
        self.new_modes
            .get(series)
            .unwrap_or_else(|| series.is_symmetric() || self.series(series).iter().any(|v| *v))
    }

    /// Expand to a full mask for an axis with `modes` Fourier modes.
    pub fn resolve(&self, modes: usize) -> Result<VaryMask, ConfigError> {
        let mut mask = VaryMask {
            eta_bar: self.eta_bar,
            sigma0: self.sigma0,
            b2c: self.b2c,
            b2s: self.b2s,
            ..VaryMask::default()
        };
        for series in AxisSeries::ALL {
            let listed = self.series(series);
            if listed.len() > modes {
                return Err(ConfigError::LengthMismatch {
                    field: format!("vary_{}", series.name()),
                    expected: modes,
                    actual: listed.len(),
                });
            }
            let mut flags = listed.to_vec();
            flags.resize(modes, self.varies_new_modes(series));
            match series {
                AxisSeries::R0c => mask.r0c = flags,
                AxisSeries::R0s => mask.r0s = flags,
                AxisSeries::Z0c => mask.z0c = flags,
                AxisSeries::Z0s => mask.z0s = flags,
            }
        }
        Ok(mask)
    }
}

/// Anything a scan can bind a value to within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageParam {
    Config(ConfigParam),
    Weight(TermKind),
    TargetIota,
    MinR0,
    MaxD2VolumeDPsi2,
}

impl StageParam {
    /// Whether the value lands in the stage objective rather than the
    /// configuration.
    pub fn is_objective(self) -> bool {
        !matches!(self, Self::Config(_))
    }

    pub fn apply(
        self,
        configuration: &mut Configuration,
        objective: &mut Objective,
        value: f64,
    ) -> Result<(), ConfigError> {
        match self {
            Self::Config(param) => configuration.set(param, value)?,
            Self::Weight(term) => objective.weights.set(term, value),
            Self::TargetIota => objective.targets.target_iota = value,
            Self::MinR0 => objective.targets.min_r0 = value,
            Self::MaxD2VolumeDPsi2 => objective.targets.max_d2_volume_d_psi2 = value,
        }
        Ok(())
    }
}

impl fmt::Display for StageParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(param) => write!(f, "{param}"),
            Self::Weight(term) => write!(f, "weight_{term}"),
            Self::TargetIota => write!(f, "target_iota"),
            Self::MinR0 => write!(f, "min_R0"),
            Self::MaxD2VolumeDPsi2 => write!(f, "max_d2_volume_d_psi2"),
        }
    }
}

impl FromStr for StageParam {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target_iota" => return Ok(Self::TargetIota),
            "min_R0" => return Ok(Self::MinR0),
            "max_d2_volume_d_psi2" => return Ok(Self::MaxD2VolumeDPsi2),
            _ => {}
        }
        if let Some(term) = s.strip_prefix("weight_") {
            return term
                .parse::<TermKind>()
                .map(Self::Weight)
                .map_err(|_| ConfigError::UnknownParameter {
                    field: "params".into(),
                    name: s.to_string(),
                });
        }
        s.parse::<ConfigParam>().map(Self::Config)
    }
}

/// A value bound to a stage before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    pub param: StageParam,
    pub value: f64,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageDefinition {
    pub settings: StageSettings,
    /// Fourier modes appended at the start of this stage.
    pub fourier_refine: usize,
    pub vary: VaryTemplate,
    pub objective: Objective,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<StageOverride>,
}

impl StageDefinition {
    pub fn new(vary: VaryTemplate, objective: Objective) -> Self {
        Self {
            vary,
            objective,
            ..Self::default()
        }
    }

    pub fn with_settings(mut self, settings: StageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_refinement(mut self, extra_modes: usize) -> Self {
        self.fourier_refine = extra_modes;
        self
    }

    pub fn with_override(mut self, param: StageParam, value: f64) -> Self {
        self.overrides.push(StageOverride { param, value });
        self
    }

    /// Starting point, mask and objective for this stage when the previous
    /// stage ended at `previous`.
    pub fn prepare(
        &self,
        previous: &Configuration,
    ) -> Result<(Configuration, VaryMask, Objective), ConfigError> {
        let mut start = previous.refined(self.fourier_refine);
        let mut objective = self.objective.clone();
        for o in &self.overrides {
            o.param.apply(&mut start, &mut objective, o.value)?;
        }
        let mask = self.vary.resolve(start.axis.len())?;
        Ok((start, mask, objective))
    }
}

/// Outcome of a whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Reports of the stages that ran, in order.
    pub stages: Vec<StageReport>,
    /// Set when a stage failed; later stages did not run.
    pub failure: Option<SolverError>,
}

impl PipelineReport {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn final_record(&self) -> Option<&IterationRecord> {
        self.stages.last().and_then(|s| s.final_record())
    }

    pub fn final_configuration(&self) -> Option<&Configuration> {
        self.final_record().map(|r| &r.configuration)
    }

    pub fn final_diagnostics(&self) -> Option<&Diagnostics> {
        self.final_record().map(|r| &r.diagnostics)
    }

    pub fn total_evaluations(&self) -> usize {
        self.stages.iter().map(|s| s.evaluations).sum()
    }

    pub fn iterations_per_stage(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.iterations()).collect()
    }
}

/// Runs a list of stages, each starting where the previous one ended.
#[derive(Debug, Clone)]
pub struct MultiStageOptimizer<E> {
    evaluator: E,
    stages: Vec<StageDefinition>,
}

impl<E: Evaluator> MultiStageOptimizer<E> {
    pub fn new(evaluator: E, stages: Vec<StageDefinition>) -> Self {
        Self { evaluator, stages }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Check every stage's shape against `initial` without evaluating
    /// anything: template lengths, override targets and objectives.
    pub fn validate(&self, initial: &Configuration) -> QsResult<()> {
        if self.stages.is_empty() {
            return Err(qs_types::config_error!("stages", "at least one stage is required").into());
        }
        let mut current = initial.clone();
        for (index, stage) in self.stages.iter().enumerate() {
            let (start, _, objective) = stage
                .prepare(&current)
                .map_err(|e| in_stage(index, e))?;
            objective.validate()?;
            current = start;
        }
        Ok(())
    }

    /// Run all stages from `initial`.
    ///
    /// Shape errors in any stage are returned before the first evaluation.
    /// A stage that fails numerically stops the pipeline; the returned
    /// report then holds the stages run so far and the failure.
    pub fn optimize(&self, initial: &Configuration) -> QsResult<PipelineReport> {
        self.validate(initial)?;

        let mut report = PipelineReport::default();
        let mut current = initial.clone();
        for (index, stage) in self.stages.iter().enumerate() {
            let span = info_span!("pipeline", stage = index);
            let _guard = span.enter();

            let (start, mask, objective) = stage
                .prepare(&current)
                .map_err(|e| in_stage(index, e))?;
            let optimizer = StageOptimizer::new(&self.evaluator, stage.settings.clone());
            let stage_report = optimizer.run(&start, &mask, &objective)?;

            if let StageStatus::Failed(err) = &stage_report.status {
                warn!(error = %err, "stopping pipeline");
                report.failure = Some(SolverError::StageFailed {
                    stage: index,
                    source: Box::new(err.clone()),
                });
                report.stages.push(stage_report);
                return Ok(report);
            }

            current = stage_report
                .final_configuration()
                .cloned()
                .ok_or_else(|| QsError::Internal(format!("stage {index} recorded no history")))?;
            report.stages.push(stage_report);
        }

        info!(
            stages = report.stages.len(),
            evaluations = report.total_evaluations(),
            "pipeline finished"
        );
        Ok(report)
    }
}

/// Prefix the field of a configuration error with the stage it came from.
fn in_stage(index: usize, err: ConfigError) -> ConfigError {
    let scoped = |field: String| format!("stages[{index}].{field}");
    match err {
        ConfigError::LengthMismatch {
            field,
            expected,
            actual,
        } => ConfigError::LengthMismatch {
            field: scoped(field),
            expected,
            actual,
        },
        ConfigError::UnknownParameter { field, name } => ConfigError::UnknownParameter {
            field: scoped(field),
            name,
        },
        ConfigError::InvalidValue { field, message } => ConfigError::InvalidValue {
            field: scoped(field),
            message,
        },
        ConfigError::StageOutOfRange {
            field,
            stage,
            stages,
        } => ConfigError::StageOutOfRange {
            field: scoped(field),
            stage,
            stages,
        },
        ConfigError::ModeOutOfRange { field, index: mode, len } => ConfigError::ModeOutOfRange {
            field: scoped(field),
            index: mode,
            len,
        },
        other @ ConfigError::Parse { .. } => other,
    }
}
