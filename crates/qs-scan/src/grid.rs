//! Scan dimensions and Cartesian grid enumeration.

use serde::{Deserialize, Serialize};

use qs_optimizer::StageParam;
use qs_types::{config_error, ConfigError};

/// One scanned parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDimension {
    pub param: StageParam,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    /// Space the samples logarithmically instead of linearly.
    pub log: bool,
    /// Pipeline stage the sampled value is bound to.
    pub stage: usize,
}

impl ScanDimension {
    pub fn linear(param: StageParam, min: f64, max: f64, count: usize) -> Self {
        Self {
            param,
            min,
            max,
            count,
            log: false,
            stage: 0,
        }
    }

    pub fn logarithmic(param: StageParam, min: f64, max: f64, count: usize) -> Self {
        Self {
            log: true,
            ..Self::linear(param, min, max, count)
        }
    }

    pub fn at_stage(mut self, stage: usize) -> Self {
        self.stage = stage;
        self
    }

    /// Sample values, first to last. A single sample is `min`.
    pub fn values(&self) -> Result<Vec<f64>, ConfigError> {
        if self.count == 0 {
            return Err(config_error!("params_n", "{} needs at least one sample", self.param));
        }
        if !self.min.is_finite() {
            return Err(config_error!("params_min", "{} bound {} is not finite", self.param, self.min));
        }
        if !self.max.is_finite() {
            return Err(config_error!("params_max", "{} bound {} is not finite", self.param, self.max));
        }
        if self.count == 1 {
            return Ok(vec![self.min]);
        }

        let steps = (self.count - 1) as f64;
        if self.log {
            if self.min <= 0.0 {
                return Err(config_error!(
                    "params_min",
                    "log-spaced {} needs a positive minimum, got {}",
                    self.param,
                    self.min
                ));
            }
            if self.max <= 0.0 {
                return Err(config_error!(
                    "params_max",
                    "log-spaced {} needs a positive maximum, got {}",
                    self.param,
                    self.max
                ));
            }
            let (low, high) = (self.min.ln(), self.max.ln());
            Ok((0..self.count)
                .map(|i| (low + i as f64 * (high - low) / steps).exp())
                .collect())
        } else {
            Ok((0..self.count)
                .map(|i| self.min + i as f64 * (self.max - self.min) / steps)
                .collect())
        }
    }
}

/// One grid point: its canonical index and one value per dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub index: usize,
    pub values: Vec<f64>,
}

/// Cartesian product of the scan dimensions; the last dimension varies
/// fastest. With no dimensions the grid has a single empty point.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    dimensions: Vec<ScanDimension>,
    axes: Vec<Vec<f64>>,
    len: usize,
}

impl Grid {
    pub fn new(dimensions: Vec<ScanDimension>) -> Result<Self, ConfigError> {
        let axes = dimensions
            .iter()
            .map(ScanDimension::values)
            .collect::<Result<Vec<_>, _>>()?;
        let len = axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.len()))
            .ok_or_else(|| config_error!("params_n", "grid size overflows"))?;
        Ok(Self {
            dimensions,
            axes,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dimensions(&self) -> &[ScanDimension] {
        &self.dimensions
    }

    /// Sample values of one dimension.
    pub fn axis(&self, dimension: usize) -> Option<&[f64]> {
        self.axes.get(dimension).map(Vec::as_slice)
    }

    pub fn point(&self, index: usize) -> Option<GridPoint> {
        if index >= self.len {
            return None;
        }
        let mut values = vec![0.0; self.axes.len()];
        let mut rest = index;
        for (slot, axis) in values.iter_mut().zip(&self.axes).rev() {
            *slot = axis[rest % axis.len()];
            rest /= axis.len();
        }
        Some(GridPoint { index, values })
    }

    pub fn iter(&self) -> impl Iterator<Item = GridPoint> + '_ {
        (0..self.len).filter_map(move |i| self.point(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qs_types::ConfigParam;
    use std::collections::HashSet;

    fn eta() -> StageParam {
        StageParam::Config(ConfigParam::EtaBar)
    }

    fn b2c() -> StageParam {
        StageParam::Config(ConfigParam::B2c)
    }

    #[test]
    fn linear_three_points() {
        let grid = Grid::new(vec![ScanDimension::linear(eta(), 1.0, 4.0, 3)]).unwrap();
        let values: Vec<_> = grid.iter().map(|p| p.values[0]).collect();
        assert_eq!(values, vec![1.0, 2.5, 4.0]);
    }

    #[test]
    fn log_spacing_hits_both_ends() {
        let dim = ScanDimension::logarithmic(eta(), 0.01, 100.0, 5);
        let values = dim.values().unwrap();
        let expected = [0.01, 0.1, 1.0, 10.0, 100.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() <= 1e-12 * e, "{v} vs {e}");
        }
    }

    #[test]
    fn single_sample_is_min() {
        let dim = ScanDimension::linear(eta(), 0.7, 3.0, 1);
        assert_eq!(dim.values().unwrap(), vec![0.7]);
        let dim = ScanDimension::logarithmic(eta(), 0.7, 3.0, 1);
        assert_eq!(dim.values().unwrap(), vec![0.7]);
    }

    #[test]
    fn product_is_complete_and_last_dimension_is_fastest() {
        let grid = Grid::new(vec![
            ScanDimension::linear(eta(), 0.5, 1.5, 3),
            ScanDimension::logarithmic(b2c(), 0.1, 10.0, 4),
            ScanDimension::linear(StageParam::TargetIota, 0.2, 0.4, 2),
        ])
        .unwrap();
        assert_eq!(grid.len(), 24);

        let points: Vec<_> = grid.iter().collect();
        let distinct: HashSet<Vec<u64>> = points
            .iter()
            .map(|p| p.values.iter().map(|v| v.to_bits()).collect())
            .collect();
        assert_eq!(distinct.len(), 24);
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.index, i);
        }
        assert_eq!(points[0].values[2], 0.2);
        assert_eq!(points[1].values[2], 0.4);
        assert_eq!(points[1].values[0], 0.5);
        assert_eq!(points[23].values[0], 1.5);
        assert!(grid.point(24).is_none());
    }

    #[test]
    fn no_dimensions_is_one_point() {
        let grid = Grid::new(Vec::new()).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.point(0).unwrap().values, Vec::<f64>::new());
    }

    #[test]
    fn invalid_dimensions_name_the_field() {
        let err = ScanDimension::linear(eta(), 0.0, 1.0, 0).values().unwrap_err();
        assert!(err.to_string().contains("params_n"));
        let err = ScanDimension::logarithmic(eta(), 0.0, 1.0, 3).values().unwrap_err();
        assert!(err.to_string().contains("params_min"));
        let err = ScanDimension::logarithmic(eta(), 1.0, -1.0, 3).values().unwrap_err();
        assert!(err.to_string().contains("params_max"));
        assert!(Grid::new(vec![
            ScanDimension::linear(eta(), 0.0, 1.0, 2),
            ScanDimension::linear(b2c(), 0.0, 1.0, 0),
        ])
        .is_err());
    }
}
