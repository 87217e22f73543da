//! Levenberg-Marquardt least-squares solver with finite-difference
//! Jacobians.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use qs_types::{QsResult, SolverError};

/// Finite-difference scheme for Jacobian estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMethod {
    #[default]
    Forward,
    Centered,
    Backward,
}

impl DiffMethod {
    /// Residual evaluations per Jacobian column.
    pub fn evaluations_per_column(self) -> usize {
        match self {
            Self::Forward | Self::Backward => 1,
            Self::Centered => 2,
        }
    }
}

/// Tolerances and damping schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverSettings {
    /// Relative step-size tolerance.
    pub xtol: f64,
    /// Scaled gradient tolerance.
    pub gtol: f64,
    /// Relative reduction of the sum of squares below which a step counts
    /// as converged.
    pub ftol: f64,
    pub initial_damping: f64,
    pub damping_increase: f64,
    pub damping_decrease: f64,
    pub min_damping: f64,
    pub max_damping: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            xtol: 1e-8,
            gtol: 1e-8,
            ftol: 1e-8,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 0.1,
            min_damping: 1e-12,
            max_damping: 1e12,
        }
    }
}

/// Why a solve stopped successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    /// The accepted step was below `xtol`.
    Step,
    /// The scaled gradient was below `gtol`.
    Gradient,
    /// The sum of squares stopped decreasing by more than `ftol`.
    Objective,
    /// No downhill step was found before damping hit its ceiling.
    Stalled,
    /// The problem had no free variables.
    NothingToVary,
}

/// How a solve ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Converged(ConvergenceReason),
    BudgetExhausted,
    Failed(SolverError),
}

/// A residual function over a flat parameter vector.
///
/// `Payload` is whatever the problem wants handed back for accepted points
/// (the solver itself only looks at residuals).
pub trait LeastSquaresProblem {
    type Payload;

    fn evaluate(&mut self, x: &[f64]) -> QsResult<(Vec<f64>, Self::Payload)>;

    fn residual_name(&self, index: usize) -> String;

    fn parameter_name(&self, index: usize) -> String;
}

/// An accepted point, passed to the solve observer.
pub struct AcceptedPoint<'a, T> {
    /// Number of accepted iterations so far; 0 is the initial point.
    pub iteration: usize,
    pub x: &'a [f64],
    pub residuals: &'a [f64],
    pub payload: &'a T,
}

/// Result of [`LevenbergMarquardt::minimize`].
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    pub x: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Accepted iterations, not counting the initial point.
    pub iterations: usize,
    /// Total residual evaluations, Jacobian columns included.
    pub evaluations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    settings: SolverSettings,
    diff_method: DiffMethod,
}

impl LevenbergMarquardt {
    pub fn new(settings: SolverSettings, diff_method: DiffMethod) -> Self {
        Self {
            settings,
            diff_method,
        }
    }

    /// Minimize the sum of squared residuals starting from `x0`, taking at
    /// most `max_iter` accepted steps.
    ///
    /// `observer` sees the initial point and every accepted point, in order.
    /// A non-finite residual at the current point or a non-finite Jacobian
    /// column ends the solve with [`SolveStatus::Failed`]; errors returned by
    /// the problem itself are propagated.
    pub fn minimize<P, F>(
        &self,
        problem: &mut P,
        x0: Vec<f64>,
        max_iter: usize,
        mut observer: F,
    ) -> QsResult<SolveOutcome>
    where
        P: LeastSquaresProblem,
        F: FnMut(AcceptedPoint<'_, P::Payload>),
    {
        let s = &self.settings;
        let n = x0.len();
        let mut x = x0;
        let (mut r, payload) = problem.evaluate(&x)?;
        let mut evaluations = 1;
        observer(AcceptedPoint {
            iteration: 0,
            x: &x,
            residuals: &r,
            payload: &payload,
        });

        let finish = |status, x, residuals, iterations, evaluations| SolveOutcome {
            status,
            x,
            residuals,
            iterations,
            evaluations,
        };

        if let Some(i) = r.iter().position(|v| !v.is_finite()) {
            let err = SolverError::NonFiniteResidual {
                iteration: 0,
                term: problem.residual_name(i),
            };
            return Ok(finish(SolveStatus::Failed(err), x, r, 0, evaluations));
        }
        if n == 0 {
            let status = SolveStatus::Converged(ConvergenceReason::NothingToVary);
            return Ok(finish(status, x, r, 0, evaluations));
        }

        let mut cost = sum_squares(&r);
        let mut lambda = s.initial_damping;
        let mut scale: Vec<f64> = vec![0.0; n];

        for iteration in 0..max_iter {
            let jacobian = match self.jacobian(problem, &x, &r, iteration, &mut evaluations)? {
                Ok(j) => j,
                Err(err) => return Ok(finish(SolveStatus::Failed(err), x, r, iteration, evaluations)),
            };
            let residual_vec = DVector::from_column_slice(&r);
            let gradient = jacobian.tr_mul(&residual_vec);
            let normal = jacobian.tr_mul(&jacobian);

            let scaled_gradient = gradient
                .iter()
                .zip(&x)
                .map(|(g, xi)| g.abs() * xi.abs().max(1.0))
                .fold(0.0, f64::max);
            if scaled_gradient <= s.gtol * cost.max(f64::MIN_POSITIVE) {
                let status = SolveStatus::Converged(ConvergenceReason::Gradient);
                return Ok(finish(status, x, r, iteration, evaluations));
            }

            for (j, d) in scale.iter_mut().enumerate() {
                *d = f64::max(*d, normal[(j, j)]);
            }

            loop {
                let mut damped = normal.clone();
                for (j, d) in scale.iter().enumerate() {
                    let d = if *d > 0.0 { *d } else { 1.0 };
                    damped[(j, j)] += lambda * d;
                }

                let step = damped.cholesky().map(|c| c.solve(&(-&gradient)));
                let Some(step) = step else {
                    lambda *= s.damping_increase;
                    if lambda > s.max_damping {
                        let status = SolveStatus::Converged(ConvergenceReason::Stalled);
                        return Ok(finish(status, x, r, iteration, evaluations));
                    }
                    continue;
                };

                let trial: Vec<f64> = x.iter().zip(step.iter()).map(|(a, b)| a + b).collect();
                let (trial_r, trial_payload) = problem.evaluate(&trial)?;
                evaluations += 1;
                let trial_cost = sum_squares(&trial_r);

                if trial_cost.is_finite() && trial_cost < cost {
                    let reduction = (cost - trial_cost) / cost;
                    let small_step = step
                        .iter()
                        .zip(&x)
                        .all(|(dx, xi)| dx.abs() <= s.xtol * (xi.abs() + s.xtol));

                    x = trial;
                    r = trial_r;
                    cost = trial_cost;
                    lambda = (lambda * s.damping_decrease).max(s.min_damping);
                    trace!(iteration = iteration + 1, cost, lambda, "step accepted");
                    observer(AcceptedPoint {
                        iteration: iteration + 1,
                        x: &x,
                        residuals: &r,
                        payload: &trial_payload,
                    });

                    if small_step {
                        let status = SolveStatus::Converged(ConvergenceReason::Step);
                        return Ok(finish(status, x, r, iteration + 1, evaluations));
                    }
                    if reduction <= s.ftol {
                        let status = SolveStatus::Converged(ConvergenceReason::Objective);
                        return Ok(finish(status, x, r, iteration + 1, evaluations));
                    }
                    break;
                }

                lambda *= s.damping_increase;
                trace!(iteration, trial_cost, lambda, "step rejected");
                if lambda > s.max_damping {
                    let status = SolveStatus::Converged(ConvergenceReason::Stalled);
                    return Ok(finish(status, x, r, iteration, evaluations));
                }
            }
        }

        Ok(finish(SolveStatus::BudgetExhausted, x, r, max_iter, evaluations))
    }

    /// Finite-difference Jacobian at `x`, where `r` are the residuals at `x`.
    /// The outer result carries problem errors, the inner one a non-finite
    /// column.
    fn jacobian<P: LeastSquaresProblem>(
        &self,
        problem: &mut P,
        x: &[f64],
        r: &[f64],
        iteration: usize,
        evaluations: &mut usize,
    ) -> QsResult<Result<DMatrix<f64>, SolverError>> {
        let m = r.len();
        let n = x.len();
        let mut jacobian = DMatrix::<f64>::zeros(m, n);
        let mut shifted = x.to_vec();

        for j in 0..n {
            let xj = x[j];
            let column: Vec<f64> = match self.diff_method {
                DiffMethod::Forward => {
                    let h = step_size(xj, f64::EPSILON.sqrt());
                    shifted[j] = xj + h;
                    let (plus, _) = problem.evaluate(&shifted)?;
                    plus.iter().zip(r).map(|(p, c)| (p - c) / h).collect()
                }
                DiffMethod::Backward => {
                    let h = step_size(xj, f64::EPSILON.sqrt());
                    shifted[j] = xj - h;
                    let (minus, _) = problem.evaluate(&shifted)?;
                    r.iter().zip(&minus).map(|(c, m)| (c - m) / h).collect()
                }
                DiffMethod::Centered => {
                    let h = step_size(xj, f64::EPSILON.cbrt());
                    shifted[j] = xj + h;
                    let (plus, _) = problem.evaluate(&shifted)?;
                    shifted[j] = xj - h;
                    let (minus, _) = problem.evaluate(&shifted)?;
                    plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * h)).collect()
                }
            };
            shifted[j] = xj;
            *evaluations += self.diff_method.evaluations_per_column();

            if column.len() != m || column.iter().any(|v| !v.is_finite()) {
                return Ok(Err(SolverError::NonFiniteJacobian {
                    iteration,
                    parameter: problem.parameter_name(j),
                }));
            }
            for (i, v) in column.into_iter().enumerate() {
                jacobian[(i, j)] = v;
            }
        }
        Ok(Ok(jacobian))
    }
}

/// Step `base * max(|x|, 1)`, rounded so that `x + h` is exactly
/// representable.
fn step_size(x: f64, base: f64) -> f64 {
    let h = base * x.abs().max(1.0);
    (x + h) - x
}

fn sum_squares(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rosenbrock in residual form: r = (10 (y - x^2), 1 - x).
    struct Rosenbrock {
        calls: usize,
    }

    impl LeastSquaresProblem for Rosenbrock {
        type Payload = usize;

        fn evaluate(&mut self, x: &[f64]) -> QsResult<(Vec<f64>, usize)> {
            self.calls += 1;
            Ok((vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]], self.calls))
        }

        fn residual_name(&self, index: usize) -> String {
            format!("r{index}")
        }

        fn parameter_name(&self, index: usize) -> String {
            format!("x{index}")
        }
    }

    /// Residual that blows up for x > 1.
    struct Cliff;

    impl LeastSquaresProblem for Cliff {
        type Payload = ();

        fn evaluate(&mut self, x: &[f64]) -> QsResult<(Vec<f64>, ())> {
            let v = if x[0] > 1.0 { f64::NAN } else { x[0] - 3.0 };
            Ok((vec![v], ()))
        }

        fn residual_name(&self, _: usize) -> String {
            "cliff".into()
        }

        fn parameter_name(&self, _: usize) -> String {
            "x".into()
        }
    }

    #[test]
    fn solves_rosenbrock() {
        for method in [DiffMethod::Forward, DiffMethod::Centered, DiffMethod::Backward] {
            let lm = LevenbergMarquardt::new(SolverSettings::default(), method);
            let mut problem = Rosenbrock { calls: 0 };
            let outcome = lm.minimize(&mut problem, vec![-1.2, 1.0], 200, |_| {}).unwrap();

            assert!(matches!(outcome.status, SolveStatus::Converged(_)), "{method:?}");
            assert!((outcome.x[0] - 1.0).abs() < 1e-6, "{method:?}: {:?}", outcome.x);
            assert!((outcome.x[1] - 1.0).abs() < 1e-6, "{method:?}: {:?}", outcome.x);
            assert_eq!(outcome.evaluations, problem.calls);
        }
    }

    #[test]
    fn observer_sees_initial_and_each_accepted_point() {
        let lm = LevenbergMarquardt::default();
        let mut problem = Rosenbrock { calls: 0 };
        let mut seen = Vec::new();
        let mut costs = Vec::new();
        let outcome = lm
            .minimize(&mut problem, vec![-1.2, 1.0], 5, |p| {
                seen.push(p.iteration);
                costs.push(sum_squares(p.residuals));
            })
            .unwrap();

        assert_eq!(outcome.status, SolveStatus::BudgetExhausted);
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(costs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn zero_budget_records_only_the_start() {
        let lm = LevenbergMarquardt::default();
        let mut problem = Rosenbrock { calls: 0 };
        let mut seen = 0;
        let outcome = lm.minimize(&mut problem, vec![0.0, 0.0], 0, |_| seen += 1).unwrap();
        assert_eq!(seen, 1);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.evaluations, 1);
        assert_eq!(outcome.status, SolveStatus::BudgetExhausted);
    }

    #[test]
    fn empty_parameter_vector_converges_immediately() {
        struct Constant;
        impl LeastSquaresProblem for Constant {
            type Payload = ();
            fn evaluate(&mut self, _: &[f64]) -> QsResult<(Vec<f64>, ())> {
                Ok((vec![2.0], ()))
            }
            fn residual_name(&self, _: usize) -> String {
                "c".into()
            }
            fn parameter_name(&self, _: usize) -> String {
                unreachable!()
            }
        }

        let outcome = LevenbergMarquardt::default()
            .minimize(&mut Constant, Vec::new(), 10, |_| {})
            .unwrap();
        assert_eq!(
            outcome.status,
            SolveStatus::Converged(ConvergenceReason::NothingToVary)
        );
        assert_eq!(outcome.residuals, vec![2.0]);
    }

    #[test]
    fn non_finite_start_fails() {
        let outcome = LevenbergMarquardt::default()
            .minimize(&mut Cliff, vec![2.0], 10, |_| {})
            .unwrap();
        assert_eq!(
            outcome.status,
            SolveStatus::Failed(SolverError::NonFiniteResidual {
                iteration: 0,
                term: "cliff".into()
            })
        );
    }

    #[test]
    fn non_finite_trial_steps_are_rejected_not_fatal() {
        // the minimum at x = 3 lies beyond the cliff, so every step past 1
        // must be rejected while the solver keeps x finite; backward differences
        // never cross the cliff themselves
        let outcome = LevenbergMarquardt::new(SolverSettings::default(), DiffMethod::Backward)
            .minimize(&mut Cliff, vec![0.0], 100, |_| {})
            .unwrap();
        assert!(!matches!(outcome.status, SolveStatus::Failed(_)));
        assert!(outcome.x[0] <= 1.0);
        assert!(outcome.residuals[0].is_finite());
    }

    #[test]
    fn non_finite_jacobian_fails_with_parameter_name() {
        // a forward difference from exactly 1.0 crosses the cliff
        let outcome = LevenbergMarquardt::new(SolverSettings::default(), DiffMethod::Forward)
            .minimize(&mut Cliff, vec![1.0], 10, |_| {})
            .unwrap();
        assert_eq!(
            outcome.status,
            SolveStatus::Failed(SolverError::NonFiniteJacobian {
                iteration: 0,
                parameter: "x".into()
            })
        );
    }

    #[test]
    fn step_sizes_are_representable() {
        for x in [0.0, 1.0, -3.7, 1e6, 1e-9] {
            let h = step_size(x, f64::EPSILON.sqrt());
            assert!(h > 0.0);
            assert_eq!((x + h) - x, h);
        }
    }
}
