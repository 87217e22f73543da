//! Per-iteration optimization history.

use serde::{Deserialize, Serialize};

use crate::configuration::{ConfigParam, Configuration};
use crate::diagnostics::{Diagnostics, Metric};

/// State of the optimizer at the start of one iteration (or at the end of
/// the run, for the last record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub configuration: Configuration,
    pub diagnostics: Diagnostics,
    /// Weighted residuals of the active objective terms.
    pub residuals: Vec<f64>,
    /// Sum of squared residuals.
    pub objective: f64,
}

/// Append-only sequence of iteration records owned by one optimizer run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IterationHistory {
    records: Vec<IterationRecord>,
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Its `iteration` is overwritten with the next index.
    pub fn push(&mut self, mut record: IterationRecord) {
        record.iteration = self.records.len();
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&IterationRecord> {
        self.records.first()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }

    pub fn get(&self, iteration: usize) -> Option<&IterationRecord> {
        self.records.get(iteration)
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &IterationRecord> {
        self.records.iter()
    }

    /// Value of one configuration parameter across all iterations. Records
    /// where the parameter does not exist yield `None`.
    pub fn parameter_series(&self, param: ConfigParam) -> Vec<Option<f64>> {
        self.records
            .iter()
            .map(|r| r.configuration.get(param))
            .collect()
    }

    pub fn metric_series(&self, metric: Metric) -> Vec<f64> {
        self.records.iter().map(|r| r.diagnostics.get(metric)).collect()
    }

    pub fn objective_series(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.objective).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(eta_bar: f64, objective: f64) -> IterationRecord {
        let mut configuration = Configuration::default();
        configuration.eta_bar = eta_bar;
        IterationRecord {
            iteration: 99,
            configuration,
            diagnostics: Diagnostics {
                iota: eta_bar * 0.5,
                ..Diagnostics::default()
            },
            residuals: vec![objective.sqrt()],
            objective,
        }
    }

    #[test]
    fn push_assigns_sequential_indices() {
        let mut history = IterationHistory::new();
        history.push(record(1.0, 4.0));
        history.push(record(1.1, 1.0));
        history.push(record(1.2, 0.25));

        assert_eq!(history.len(), 3);
        let indices: Vec<_> = history.iter().map(|r| r.iteration).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(history.objective_series(), vec![4.0, 1.0, 0.25]);
    }

    #[test]
    fn series_extraction() {
        let mut history = IterationHistory::new();
        history.push(record(1.0, 1.0));
        history.push(record(2.0, 0.5));

        assert_eq!(
            history.parameter_series(ConfigParam::EtaBar),
            vec![Some(1.0), Some(2.0)]
        );
        assert_eq!(history.metric_series(Metric::Iota), vec![0.5, 1.0]);
        // default axis has a single mode
        assert_eq!(
            history.parameter_series(ConfigParam::Axis(crate::AxisSeries::R0c, 3)),
            vec![None, None]
        );
    }
}
