//! TOML scan input: `[configuration]`, `[[stages]]` and `[multiopt_scan]`.
//!
//! The file-facing structs mirror the input keys one to one and are
//! converted into library types by [`ScanInput::into_plan`], which performs
//! every load-time check before any work is dispatched.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use qs_optimizer::{
    DiffMethod, MultiStageOptimizer, NewModeFlags, Objective, SolverSettings, StageDefinition,
    StageParam, StageSettings, Targets, VaryTemplate, Weights,
};
use qs_types::{config_error, ConfigError, Configuration, Evaluator, FourierAxis, QsResult};

use crate::driver::{ScanPlan, ScanSettings};
use crate::filter::KeepThresholds;
use crate::grid::{Grid, GridPoint, ScanDimension};
use crate::job::ScanJobSpec;

/// Results file used when `results_path` is not given.
pub const DEFAULT_RESULTS_PATH: &str = "multiopt_scan_results.jsonl";

/// Whole input file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanInput {
    pub configuration: ConfigurationInput,
    #[serde(default)]
    pub stages: Vec<StageInput>,
    pub multiopt_scan: ScanSection,
}

/// `[configuration]`: the reference design.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationInput {
    pub nfp: u32,
    pub nphi: Option<usize>,
    #[serde(rename = "R0c")]
    pub r0c: Vec<f64>,
    #[serde(rename = "R0s")]
    pub r0s: Option<Vec<f64>>,
    #[serde(rename = "Z0c")]
    pub z0c: Option<Vec<f64>>,
    #[serde(rename = "Z0s")]
    pub z0s: Option<Vec<f64>>,
    pub eta_bar: f64,
    pub sigma0: Option<f64>,
    #[serde(rename = "B2c")]
    pub b2c: Option<f64>,
    #[serde(rename = "B2s")]
    pub b2s: Option<f64>,
    #[serde(rename = "B0")]
    pub b0: Option<f64>,
    #[serde(rename = "I2")]
    pub i2: Option<f64>,
    pub p2: Option<f64>,
}

impl ConfigurationInput {
    /// Missing sine/cosine series default to zeros of the `R0c` length.
    pub fn to_configuration(&self) -> Result<Configuration, ConfigError> {
        let zeros = || vec![0.0; self.r0c.len()];
        let axis = FourierAxis::new(
            self.r0c.clone(),
            self.r0s.clone().unwrap_or_else(zeros),
            self.z0c.clone().unwrap_or_else(zeros),
            self.z0s.clone().unwrap_or_else(zeros),
        )?;
        if self.nfp == 0 {
            return Err(config_error!("nfp", "must be at least 1"));
        }
        let defaults = Configuration::default();
        let nphi = self.nphi.unwrap_or(defaults.nphi);
        if nphi < 3 {
            return Err(config_error!("nphi", "needs at least 3 grid points, got {}", nphi));
        }
        Ok(Configuration {
            nfp: self.nfp,
            nphi,
            b0: self.b0.unwrap_or(defaults.b0),
            i2: self.i2.unwrap_or(defaults.i2),
            p2: self.p2.unwrap_or(defaults.p2),
            axis,
            eta_bar: self.eta_bar,
            sigma0: self.sigma0.unwrap_or(defaults.sigma0),
            b2c: self.b2c.unwrap_or(defaults.b2c),
            b2s: self.b2s.unwrap_or(defaults.b2s),
        })
    }
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageInput {
    pub max_iter: usize,
    pub diff_method: DiffMethod,
    pub solver: SolverSettings,
    pub fourier_refine: usize,
    #[serde(rename = "vary_R0c")]
    pub vary_r0c: Vec<bool>,
    #[serde(rename = "vary_R0s")]
    pub vary_r0s: Vec<bool>,
    #[serde(rename = "vary_Z0c")]
    pub vary_z0c: Vec<bool>,
    #[serde(rename = "vary_Z0s")]
    pub vary_z0s: Vec<bool>,
    pub vary_eta_bar: bool,
    pub vary_sigma0: bool,
    #[serde(rename = "vary_B2c")]
    pub vary_b2c: bool,
    #[serde(rename = "vary_B2s")]
    pub vary_b2s: bool,
    pub new_modes: NewModeFlags,
    pub weights: Weights,
    pub targets: Targets,
}

impl Default for StageInput {
    fn default() -> Self {
        let settings = StageSettings::default();
        Self {
            max_iter: settings.max_iter,
            diff_method: settings.diff_method,
            solver: settings.solver,
            fourier_refine: 0,
            vary_r0c: Vec::new(),
            vary_r0s: Vec::new(),
            vary_z0c: Vec::new(),
            vary_z0s: Vec::new(),
            vary_eta_bar: false,
            vary_sigma0: false,
            vary_b2c: false,
            vary_b2s: false,
            new_modes: NewModeFlags::default(),
            weights: Weights::default(),
            targets: Targets::default(),
        }
    }
}

impl From<StageInput> for StageDefinition {
    fn from(input: StageInput) -> Self {
        let vary = VaryTemplate {
            r0c: input.vary_r0c,
            r0s: input.vary_r0s,
            z0c: input.vary_z0c,
            z0s: input.vary_z0s,
            eta_bar: input.vary_eta_bar,
            sigma0: input.vary_sigma0,
            b2c: input.vary_b2c,
            b2s: input.vary_b2s,
            new_modes: input.new_modes,
        };
        StageDefinition::new(vary, Objective::new(input.weights).with_targets(input.targets))
            .with_refinement(input.fourier_refine)
            .with_settings(StageSettings {
                max_iter: input.max_iter,
                diff_method: input.diff_method,
                solver: input.solver,
            })
    }
}

/// `[multiopt_scan]`: dimensions, thresholds and run settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanSection {
    pub verbose: bool,
    pub quit_after_init: bool,
    pub save_period: usize,
    pub print_status_period: usize,
    pub max_seconds: Option<f64>,
    pub workers: Option<usize>,
    pub results_path: Option<PathBuf>,

    pub params: Vec<String>,
    pub params_min: Vec<f64>,
    pub params_max: Vec<f64>,
    pub params_n: Vec<usize>,
    pub params_stage: Option<Vec<usize>>,
    pub params_log: Option<Vec<bool>>,

    pub keep_all: bool,
    #[serde(rename = "min_R0_to_keep")]
    pub min_r0_to_keep: Option<f64>,
    #[serde(rename = "max_R0_to_keep")]
    pub max_r0_to_keep: Option<f64>,
    pub min_iota_to_keep: Option<f64>,
    pub max_elongation_to_keep: Option<f64>,
    #[serde(rename = "min_L_grad_B_to_keep")]
    pub min_l_grad_b_to_keep: Option<f64>,
    #[serde(rename = "min_L_grad_grad_B_to_keep")]
    pub min_l_grad_grad_b_to_keep: Option<f64>,
    #[serde(rename = "max_B20_variation_to_keep")]
    pub max_b20_variation_to_keep: Option<f64>,
    pub min_r_singularity_to_keep: Option<f64>,
    pub max_d2_volume_d_psi2_to_keep: Option<f64>,
    #[serde(rename = "min_DMerc_times_r2_to_keep")]
    pub min_dmerc_times_r2_to_keep: Option<f64>,
    #[serde(rename = "max_XY2_to_keep")]
    pub max_xy2_to_keep: Option<f64>,
    #[serde(rename = "max_Z2_to_keep")]
    pub max_z2_to_keep: Option<f64>,
    #[serde(rename = "max_XY3_to_keep")]
    pub max_xy3_to_keep: Option<f64>,
    #[serde(rename = "max_d_XY2_d_varphi_to_keep")]
    pub max_d_xy2_d_varphi_to_keep: Option<f64>,
    #[serde(rename = "max_d_Z2_d_varphi_to_keep")]
    pub max_d_z2_d_varphi_to_keep: Option<f64>,
    #[serde(rename = "max_d_XY3_d_varphi_to_keep")]
    pub max_d_xy3_d_varphi_to_keep: Option<f64>,
}

impl Default for ScanSection {
    fn default() -> Self {
        let settings = ScanSettings::default();
        Self {
            verbose: false,
            quit_after_init: false,
            save_period: settings.save_period,
            print_status_period: settings.print_status_period,
            max_seconds: None,
            workers: None,
            results_path: None,
            params: Vec::new(),
            params_min: Vec::new(),
            params_max: Vec::new(),
            params_n: Vec::new(),
            params_stage: None,
            params_log: None,
            keep_all: false,
            min_r0_to_keep: None,
            max_r0_to_keep: None,
            min_iota_to_keep: None,
            max_elongation_to_keep: None,
            min_l_grad_b_to_keep: None,
            min_l_grad_grad_b_to_keep: None,
            max_b20_variation_to_keep: None,
            min_r_singularity_to_keep: None,
            max_d2_volume_d_psi2_to_keep: None,
            min_dmerc_times_r2_to_keep: None,
            max_xy2_to_keep: None,
            max_z2_to_keep: None,
            max_xy3_to_keep: None,
            max_d_xy2_d_varphi_to_keep: None,
            max_d_z2_d_varphi_to_keep: None,
            max_d_xy3_d_varphi_to_keep: None,
        }
    }
}

impl ScanSection {
    pub fn thresholds(&self) -> KeepThresholds {
        KeepThresholds {
            min_r0: self.min_r0_to_keep,
            max_r0: self.max_r0_to_keep,
            min_iota: self.min_iota_to_keep,
            max_elongation: self.max_elongation_to_keep,
            min_l_grad_b: self.min_l_grad_b_to_keep,
            min_l_grad_grad_b: self.min_l_grad_grad_b_to_keep,
            max_b20_variation: self.max_b20_variation_to_keep,
            min_r_singularity: self.min_r_singularity_to_keep,
            max_d2_volume_d_psi2: self.max_d2_volume_d_psi2_to_keep,
            min_dmerc_times_r2: self.min_dmerc_times_r2_to_keep,
            max_xy2: self.max_xy2_to_keep,
            max_z2: self.max_z2_to_keep,
            max_xy3: self.max_xy3_to_keep,
            max_d_xy2_d_varphi: self.max_d_xy2_d_varphi_to_keep,
            max_d_z2_d_varphi: self.max_d_z2_d_varphi_to_keep,
            max_d_xy3_d_varphi: self.max_d_xy3_d_varphi_to_keep,
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.results_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_PATH))
    }

    fn settings(&self) -> Result<ScanSettings, ConfigError> {
        let defaults = ScanSettings::default();
        let workers = self.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(config_error!("workers", "at least one worker is required"));
        }
        if self.save_period == 0 {
            return Err(config_error!("save_period", "must be at least 1"));
        }
        if self.print_status_period == 0 {
            return Err(config_error!("print_status_period", "must be at least 1"));
        }
        if let Some(seconds) = self.max_seconds {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(config_error!("max_seconds", "must be finite and non-negative, got {}", seconds));
            }
        }
        Ok(ScanSettings {
            workers,
            save_period: self.save_period,
            print_status_period: self.print_status_period,
            max_seconds: self.max_seconds,
            keep_all: self.keep_all,
            quit_after_init: self.quit_after_init,
        })
    }

    fn dimensions(&self, stages: usize) -> Result<Vec<ScanDimension>, ConfigError> {
        let expected = self.params.len();
        let check = |field: &str, actual: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(ConfigError::LengthMismatch {
                    field: field.into(),
                    expected,
                    actual,
                })
            }
        };
        check("params_min", self.params_min.len())?;
        check("params_max", self.params_max.len())?;
        check("params_n", self.params_n.len())?;
        if let Some(log) = &self.params_log {
            check("params_log", log.len())?;
        }
        if let Some(stage) = &self.params_stage {
            check("params_stage", stage.len())?;
        }

        let mut dimensions = Vec::with_capacity(expected);
        for (j, name) in self.params.iter().enumerate() {
            let param: StageParam = name.parse().map_err(|_| ConfigError::UnknownParameter {
                name: name.clone(),
                field: "params".into(),
            })?;
            let stage = self.params_stage.as_ref().map_or(0, |s| s[j]);
            if stage >= stages {
                return Err(ConfigError::StageOutOfRange {
                    field: "params_stage".into(),
                    stage,
                    stages,
                });
            }
            let log = self.params_log.as_ref().is_some_and(|l| l[j]);
            let mut dimension = if log {
                ScanDimension::logarithmic(param, self.params_min[j], self.params_max[j], self.params_n[j])
            } else {
                ScanDimension::linear(param, self.params_min[j], self.params_max[j], self.params_n[j])
            };
            dimension.stage = stage;
            dimension.values()?;
            dimensions.push(dimension);
        }
        Ok(dimensions)
    }
}

/// Above this many dimensions only each dimension's own endpoints are
/// checked, with the others at their first sample.
const MAX_CORNER_DIMENSIONS: usize = 12;

/// Validate the pipeline with the scanned values bound at the corners of the
/// grid. Every sample lies between its axis endpoints, so weights, targets
/// and mode indices that pass at the corners pass everywhere.
fn check_endpoints<E: Evaluator>(
    evaluator: &E,
    reference: &Configuration,
    stages: &[StageDefinition],
    grid: &Grid,
) -> QsResult<()> {
    let dimensions = grid.dimensions();
    let mut ends = Vec::with_capacity(dimensions.len());
    for j in 0..dimensions.len() {
        let axis = grid.axis(j).unwrap_or_default();
        match (axis.first(), axis.last()) {
            (Some(first), Some(last)) => ends.push((*first, *last)),
            _ => return Err(qs_types::internal_error!("dimension {} has no samples", j)),
        }
    }

    let lower: Vec<f64> = ends.iter().map(|e| e.0).collect();
    let corners: Vec<Vec<f64>> = if ends.len() <= MAX_CORNER_DIMENSIONS {
        (0..1usize << ends.len())
            .map(|mask| {
                ends.iter()
                    .enumerate()
                    .map(|(j, &(first, last))| if mask >> j & 1 == 1 { last } else { first })
                    .collect()
            })
            .collect()
    } else {
        let mut corners = vec![lower.clone()];
        for (j, &(_, last)) in ends.iter().enumerate() {
            let mut upper = lower.clone();
            upper[j] = last;
            corners.push(upper);
        }
        corners
    };

    for values in corners {
        let job = ScanJobSpec::new(GridPoint { index: 0, values }, dimensions, reference, stages)?;
        MultiStageOptimizer::new(evaluator, job.stages).validate(&job.reference)?;
    }
    Ok(())
}

impl ScanInput {
    pub fn load(path: impl AsRef<Path>) -> QsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let input = Self::parse(&text)?;
        info!("Loaded scan input from {}", path.display());
        Ok(input)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Validate everything and build the plan. `evaluator` is only used to
    /// type the pipeline check; nothing is evaluated.
    pub fn into_plan<E: Evaluator>(self, evaluator: E) -> QsResult<ScanPlan> {
        let reference = self.configuration.to_configuration()?;
        let stages: Vec<StageDefinition> = self.stages.into_iter().map(StageDefinition::from).collect();
        let dimensions = self.multiopt_scan.dimensions(stages.len().max(1))?;
        let settings = self.multiopt_scan.settings()?;
        let grid = Grid::new(dimensions.clone())?;

        check_endpoints(&evaluator, &reference, &stages, &grid)?;

        for dimension in &dimensions {
            debug!(
                "Dimension {}: [{}, {}] x {}{} at stage {}",
                dimension.param,
                dimension.min,
                dimension.max,
                dimension.count,
                if dimension.log { " (log)" } else { "" },
                dimension.stage
            );
        }
        info!(
            "Scan plan: {} stages, {} dimensions, {} grid points, {} keep thresholds{}",
            stages.len(),
            dimensions.len(),
            grid.len(),
            self.multiopt_scan.thresholds().active(),
            if settings.keep_all { " (keep_all)" } else { "" }
        );

        Ok(ScanPlan {
            reference,
            stages,
            dimensions,
            thresholds: self.multiopt_scan.thresholds(),
            settings,
        })
    }
}
