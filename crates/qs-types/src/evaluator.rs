//! The physics evaluator seam.

use crate::configuration::Configuration;
use crate::diagnostics::Diagnostics;

/// Computes diagnostics for a configuration.
///
/// Implementations must be pure and deterministic: the same configuration
/// always yields bit-identical diagnostics, and evaluation order does not
/// matter. The optimizers rely on this to make recorded histories
/// reproducible and single-stage pipelines identical to standalone stages.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, configuration: &Configuration) -> Diagnostics;

    /// Human-readable evaluator name.
    fn name(&self) -> &str;
}

impl<E: Evaluator + ?Sized> Evaluator for &E {
    fn evaluate(&self, configuration: &Configuration) -> Diagnostics {
        (**self).evaluate(configuration)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    fn evaluate(&self, configuration: &Configuration) -> Diagnostics {
        (**self).evaluate(configuration)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
