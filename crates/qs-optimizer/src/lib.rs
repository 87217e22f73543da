//! # qs-optimizer
//!
//! Least-squares optimization of near-axis configurations.
//!
//! Provides the weighted objective terms, a Levenberg-Marquardt solver with
//! finite-difference Jacobians, a single-stage optimizer that records a full
//! iteration history, and a multi-stage pipeline that refines the Fourier
//! resolution of the axis between stages.

mod multistage;
mod residuals;
mod solver;
mod stage;

pub use multistage::{
    MultiStageOptimizer, NewModeFlags, PipelineReport, StageDefinition, StageOverride, StageParam,
    VaryTemplate,
};
pub use residuals::{sum_of_squares, Objective, Targets, TermKind, Weights};
pub use solver::{
    AcceptedPoint, ConvergenceReason, DiffMethod, LeastSquaresProblem, LevenbergMarquardt,
    SolveOutcome, SolveStatus, SolverSettings,
};
pub use stage::{StageOptimizer, StageReport, StageSettings, StageStatus};
