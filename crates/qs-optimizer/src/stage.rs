//! Single-stage optimization of a configuration against one objective.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use qs_types::{
    ConfigParam, Configuration, Diagnostics, Evaluator, IterationHistory, IterationRecord,
    QsResult, SolverError, VaryMask,
};

use crate::residuals::{sum_of_squares, Objective, TermKind};
use crate::solver::{
    ConvergenceReason, DiffMethod, LeastSquaresProblem, LevenbergMarquardt, SolveStatus,
    SolverSettings,
};

/// Iteration budget, Jacobian scheme and solver tolerances for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageSettings {
    pub max_iter: usize,
    pub diff_method: DiffMethod,
    pub solver: SolverSettings,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_iter: 50,
            diff_method: DiffMethod::default(),
            solver: SolverSettings::default(),
        }
    }
}

/// Terminal status of a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Converged(ConvergenceReason),
    BudgetExhausted,
    Failed(SolverError),
}

impl StageStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Short label for logs and result rows.
    pub fn label(&self) -> String {
        match self {
            Self::Converged(reason) => format!("converged ({reason:?})"),
            Self::BudgetExhausted => "budget exhausted".to_string(),
            Self::Failed(err) => format!("failed: {err}"),
        }
    }
}

impl From<SolveStatus> for StageStatus {
    fn from(status: SolveStatus) -> Self {
        match status {
            SolveStatus::Converged(reason) => Self::Converged(reason),
            SolveStatus::BudgetExhausted => Self::BudgetExhausted,
            SolveStatus::Failed(err) => Self::Failed(err),
        }
    }
}

/// Everything one stage produced.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub status: StageStatus,
    pub history: IterationHistory,
    /// Parameters the solver was free to move, in solver order.
    pub varied: Vec<ConfigParam>,
    pub active_terms: Vec<TermKind>,
    /// Total evaluator calls, Jacobian columns included.
    pub evaluations: usize,
}

impl StageReport {
    /// Accepted iterations, not counting the initial point.
    pub fn iterations(&self) -> usize {
        self.history.len().saturating_sub(1)
    }

    /// The last recorded configuration. A report always holds at least the
    /// initial record.
    pub fn final_record(&self) -> Option<&IterationRecord> {
        self.history.last()
    }

    pub fn final_configuration(&self) -> Option<&Configuration> {
        self.history.last().map(|r| &r.configuration)
    }

    pub fn final_diagnostics(&self) -> Option<&Diagnostics> {
        self.history.last().map(|r| &r.diagnostics)
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }
}

/// Runs one least-squares stage with a fixed evaluator and settings.
#[derive(Debug, Clone)]
pub struct StageOptimizer<E> {
    evaluator: E,
    settings: StageSettings,
}

impl<E: Evaluator> StageOptimizer<E> {
    pub fn new(evaluator: E, settings: StageSettings) -> Self {
        Self {
            evaluator,
            settings,
        }
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Optimize the parameters `mask` marks as varied, starting from
    /// `initial`.
    ///
    /// Shape problems (mask length, objective definition) are returned as
    /// errors before anything is evaluated. Numerical breakdown is not an
    /// error: it ends the stage with [`StageStatus::Failed`] and the history
    /// up to that point.
    pub fn run(
        &self,
        initial: &Configuration,
        mask: &VaryMask,
        objective: &Objective,
    ) -> QsResult<StageReport> {
        mask.check_len(initial.axis.len())?;
        objective.validate()?;

        let varied = mask.varied_params();
        let active_terms = objective.active_terms();
        let mut problem = StageProblem {
            evaluator: &self.evaluator,
            base: initial,
            mask,
            varied: &varied,
            objective,
            terms: &active_terms,
        };

        let span = info_span!("stage", evaluator = self.evaluator.name());
        let _guard = span.enter();
        debug!(
            varied = varied.len(),
            terms = active_terms.len(),
            max_iter = self.settings.max_iter,
            "starting stage"
        );

        let mut history = IterationHistory::new();
        let solver = LevenbergMarquardt::new(self.settings.solver.clone(), self.settings.diff_method);
        let outcome = solver.minimize(
            &mut problem,
            initial.varied_values(mask),
            self.settings.max_iter,
            |point| {
                let (configuration, diagnostics) = point.payload;
                let objective = sum_of_squares(point.residuals);
                debug!(iteration = point.iteration, objective, "accepted");
                history.push(IterationRecord {
                    iteration: point.iteration,
                    configuration: configuration.clone(),
                    diagnostics: diagnostics.clone(),
                    residuals: point.residuals.to_vec(),
                    objective,
                });
            },
        )?;

        let status = StageStatus::from(outcome.status);
        match &status {
            StageStatus::Failed(err) => warn!(error = %err, "stage failed"),
            _ => info!(
                status = %status.label(),
                iterations = outcome.iterations,
                evaluations = outcome.evaluations,
                objective = sum_of_squares(&outcome.residuals),
                "stage finished"
            ),
        }

        Ok(StageReport {
            status,
            history,
            varied,
            active_terms,
            evaluations: outcome.evaluations,
        })
    }
}

/// Adapts a configuration, mask and objective to the flat solver interface.
struct StageProblem<'a, E> {
    evaluator: &'a E,
    base: &'a Configuration,
    mask: &'a VaryMask,
    varied: &'a [ConfigParam],
    objective: &'a Objective,
    terms: &'a [TermKind],
}

impl<E: Evaluator> LeastSquaresProblem for StageProblem<'_, E> {
    type Payload = (Configuration, Diagnostics);

    fn evaluate(&mut self, x: &[f64]) -> QsResult<(Vec<f64>, Self::Payload)> {
        let configuration = self.base.with_varied_values(self.mask, x)?;
        let diagnostics = self.evaluator.evaluate(&configuration);
        let residuals = self.objective.residuals(&diagnostics);
        Ok((residuals, (configuration, diagnostics)))
    }

    fn residual_name(&self, index: usize) -> String {
        self.terms
            .get(index)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| format!("residual {index}"))
    }

    fn parameter_name(&self, index: usize) -> String {
        self.varied
            .get(index)
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("parameter {index}"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::residuals::Weights;
    use qs_types::{AxisSeries, FourierAxis, NearAxisModel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Smooth stand-in for the physics model: each metric is a simple
    /// function of a few parameters, with a hole at eta_bar = 0.
    pub(crate) struct ToyModel {
        pub(crate) calls: AtomicUsize,
    }

    impl ToyModel {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Evaluator for ToyModel {
        fn evaluate(&self, c: &Configuration) -> Diagnostics {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let z0s: f64 = c.axis.z0s().iter().sum();
            let r0c_tail: f64 = c.axis.r0c().iter().skip(1).map(|v| v * v).sum();
            Diagnostics {
                iota: 0.2 + z0s + 0.1 * c.eta_bar,
                min_r0: c.axis.r0c()[0] - r0c_tail.sqrt(),
                max_elongation: 1.0 + (c.eta_bar - 1.0).powi(2) + 1.0 / c.eta_bar.abs(),
                min_l_grad_b: 1.0 / (1.0 + r0c_tail + c.eta_bar * c.eta_bar),
                b20_residual: c.b2c - 0.5 * c.eta_bar,
                ..Diagnostics::default()
            }
        }

        fn name(&self) -> &str {
            "toy"
        }
    }

    pub(crate) fn sample_configuration() -> Configuration {
        let axis = FourierAxis::new(
            vec![1.0, 0.1],
            vec![0.0, 0.0],
            vec![0.0, 0.0],
            vec![0.0, 0.05],
        )
        .unwrap();
        Configuration::new(3, axis, 0.8)
    }

    fn iota_objective() -> Objective {
        Objective::new(
            Weights::default()
                .with(TermKind::Iota, 1.0)
                .with(TermKind::Elongation, 0.1),
        )
    }

    #[test]
    fn history_starts_at_initial_configuration() {
        let initial = sample_configuration();
        let mut mask = VaryMask::fixed(2);
        mask.z0s[1] = true;
        mask.eta_bar = true;

        let optimizer = StageOptimizer::new(ToyModel::new(), StageSettings::default());
        let report = optimizer.run(&initial, &mask, &iota_objective()).unwrap();

        assert!(!report.is_failed(), "{:?}", report.status);
        assert_eq!(report.history.first().unwrap().configuration, initial);
        assert!(report.history.len() <= optimizer.settings().max_iter + 1);
        assert_eq!(report.iterations() + 1, report.history.len());
        let objectives = report.history.objective_series();
        assert!(objectives.windows(2).all(|w| w[1] < w[0]));
        assert!(objectives.last().unwrap() < &objectives[0]);
    }

    #[test]
    fn unvaried_parameters_stay_bit_identical() {
        let initial = sample_configuration();
        let mut mask = VaryMask::fixed(2);
        mask.z0s[1] = true;

        let report = StageOptimizer::new(ToyModel::new(), StageSettings::default())
            .run(&initial, &mask, &iota_objective())
            .unwrap();

        for record in report.history.iter() {
            let c = &record.configuration;
            assert_eq!(c.eta_bar.to_bits(), initial.eta_bar.to_bits());
            assert_eq!(c.axis.r0c(), initial.axis.r0c());
            assert_eq!(c.axis.z0s()[0].to_bits(), initial.axis.z0s()[0].to_bits());
            assert_eq!(c.b2c.to_bits(), initial.b2c.to_bits());
        }
        let last = report.final_configuration().unwrap();
        assert_ne!(last.axis.z0s()[1], initial.axis.z0s()[1]);
    }

    #[test]
    fn runs_are_reproducible() {
        let initial = sample_configuration();
        let mut mask = VaryMask::fixed(2);
        mask.r0c[1] = true;
        mask.z0s[1] = true;
        mask.eta_bar = true;
        let objective = iota_objective().with_targets(crate::residuals::Targets {
            target_iota: 0.5,
            ..Default::default()
        });

        let settings = StageSettings {
            diff_method: DiffMethod::Centered,
            ..StageSettings::default()
        };
        let a = StageOptimizer::new(ToyModel::new(), settings.clone())
            .run(&initial, &mask, &objective)
            .unwrap();
        let b = StageOptimizer::new(ToyModel::new(), settings)
            .run(&initial, &mask, &objective)
            .unwrap();
        assert_eq!(a.history, b.history);
        assert_eq!(a.status, b.status);
    }

    #[test]
    fn zero_budget_evaluates_once() {
        let model = ToyModel::new();
        let mut mask = VaryMask::fixed(2);
        mask.eta_bar = true;
        let settings = StageSettings {
            max_iter: 0,
            ..StageSettings::default()
        };
        let report = StageOptimizer::new(&model, settings)
            .run(&sample_configuration(), &mask, &iota_objective())
            .unwrap();
        assert_eq!(report.status, StageStatus::BudgetExhausted);
        assert_eq!(report.history.len(), 1);
        assert_eq!(model.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn nothing_to_vary_records_single_entry() {
        let report = StageOptimizer::new(ToyModel::new(), StageSettings::default())
            .run(&sample_configuration(), &VaryMask::fixed(2), &iota_objective())
            .unwrap();
        assert_eq!(
            report.status,
            StageStatus::Converged(ConvergenceReason::NothingToVary)
        );
        assert_eq!(report.history.len(), 1);
        assert!(report.varied.is_empty());
    }

    #[test]
    fn shape_errors_are_returned_before_evaluation() {
        let model = ToyModel::new();
        let optimizer = StageOptimizer::new(&model, StageSettings::default());

        let short_mask = VaryMask::fixed(1);
        let err = optimizer
            .run(&sample_configuration(), &short_mask, &iota_objective())
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("vary_R0c"));

        let err = optimizer
            .run(&sample_configuration(), &VaryMask::fixed(2), &Objective::default())
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(model.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn breakdown_ends_stage_as_failed() {
        let mut initial = sample_configuration();
        initial.eta_bar = 0.0;
        let mut mask = VaryMask::fixed(2);
        mask.eta_bar = true;

        let report = StageOptimizer::new(ToyModel::new(), StageSettings::default())
            .run(&initial, &mask, &iota_objective())
            .unwrap();
        match &report.status {
            StageStatus::Failed(SolverError::NonFiniteResidual { iteration, term }) => {
                assert_eq!(*iteration, 0);
                assert_eq!(term, "elongation");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(report.history.len(), 1);
    }

    #[test]
    fn physics_model_stage_moves_toward_target_iota() {
        let axis = FourierAxis::new(
            vec![1.0, 0.17],
            vec![0.0, 0.0],
            vec![0.0, 0.0],
            vec![0.0, 0.17],
        )
        .unwrap();
        let initial = Configuration::new(4, axis, 1.0).with_nphi(31);
        let mut mask = VaryMask::fixed(2);
        mask.eta_bar = true;
        mask.z0s[1] = true;
        let objective = Objective::new(Weights::default().with(TermKind::Iota, 1.0));
        let settings = StageSettings {
            max_iter: 20,
            ..StageSettings::default()
        };

        let report = StageOptimizer::new(NearAxisModel, settings)
            .run(&initial, &mask, &objective)
            .unwrap();
        assert!(!report.is_failed(), "{:?}", report.status);
        let objectives = report.history.objective_series();
        assert!(objectives.last().unwrap() <= &objectives[0]);
        assert!(report
            .varied
            .contains(&ConfigParam::Axis(AxisSeries::Z0s, 1)));
    }
}
