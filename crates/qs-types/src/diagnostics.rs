//! Physics metrics produced by an evaluator for one configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named scalar diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Iota,
    MinR0,
    MaxR0,
    MaxCurvature,
    MaxElongation,
    MinLGradB,
    MinLGradGradB,
    RSingularity,
    B20Variation,
    B20Residual,
    D2VolumeDPsi2,
    DMercTimesR2,
    StandardDeviationOfR,
    StandardDeviationOfZ,
    AxisLength,
    XY2,
    Z2,
    XY3,
    DXY2DVarphi,
    DZ2DVarphi,
    DXY3DVarphi,
}

impl Metric {
    pub const ALL: [Metric; 21] = [
        Self::Iota,
        Self::MinR0,
        Self::MaxR0,
        Self::MaxCurvature,
        Self::MaxElongation,
        Self::MinLGradB,
        Self::MinLGradGradB,
        Self::RSingularity,
        Self::B20Variation,
        Self::B20Residual,
        Self::D2VolumeDPsi2,
        Self::DMercTimesR2,
        Self::StandardDeviationOfR,
        Self::StandardDeviationOfZ,
        Self::AxisLength,
        Self::XY2,
        Self::Z2,
        Self::XY3,
        Self::DXY2DVarphi,
        Self::DZ2DVarphi,
        Self::DXY3DVarphi,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Iota => "iota",
            Self::MinR0 => "min_R0",
            Self::MaxR0 => "max_R0",
            Self::MaxCurvature => "max_curvature",
            Self::MaxElongation => "max_elongation",
            Self::MinLGradB => "min_L_grad_B",
            Self::MinLGradGradB => "min_L_grad_grad_B",
            Self::RSingularity => "r_singularity",
            Self::B20Variation => "B20_variation",
            Self::B20Residual => "B20_residual",
            Self::D2VolumeDPsi2 => "d2_volume_d_psi2",
            Self::DMercTimesR2 => "DMerc_times_r2",
            Self::StandardDeviationOfR => "standard_deviation_of_R",
            Self::StandardDeviationOfZ => "standard_deviation_of_Z",
            Self::AxisLength => "axis_length",
            Self::XY2 => "XY2",
            Self::Z2 => "Z2",
            Self::XY3 => "XY3",
            Self::DXY2DVarphi => "d_XY2_d_varphi",
            Self::DZ2DVarphi => "d_Z2_d_varphi",
            Self::DXY3DVarphi => "d_XY3_d_varphi",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Evaluator output for one configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub iota: f64,
    pub min_r0: f64,
    pub max_r0: f64,
    pub max_curvature: f64,
    pub max_elongation: f64,
    pub min_l_grad_b: f64,
    pub min_l_grad_grad_b: f64,
    pub r_singularity: f64,
    pub b20_variation: f64,
    pub b20_residual: f64,
    pub d2_volume_d_psi2: f64,
    pub dmerc_times_r2: f64,
    pub standard_deviation_of_r: f64,
    pub standard_deviation_of_z: f64,
    pub axis_length: f64,
    pub xy2: f64,
    pub z2: f64,
    pub xy3: f64,
    pub d_xy2_d_varphi: f64,
    pub d_z2_d_varphi: f64,
    pub d_xy3_d_varphi: f64,
}

impl Diagnostics {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Iota => self.iota,
            Metric::MinR0 => self.min_r0,
            Metric::MaxR0 => self.max_r0,
            Metric::MaxCurvature => self.max_curvature,
            Metric::MaxElongation => self.max_elongation,
            Metric::MinLGradB => self.min_l_grad_b,
            Metric::MinLGradGradB => self.min_l_grad_grad_b,
            Metric::RSingularity => self.r_singularity,
            Metric::B20Variation => self.b20_variation,
            Metric::B20Residual => self.b20_residual,
            Metric::D2VolumeDPsi2 => self.d2_volume_d_psi2,
            Metric::DMercTimesR2 => self.dmerc_times_r2,
            Metric::StandardDeviationOfR => self.standard_deviation_of_r,
            Metric::StandardDeviationOfZ => self.standard_deviation_of_z,
            Metric::AxisLength => self.axis_length,
            Metric::XY2 => self.xy2,
            Metric::Z2 => self.z2,
            Metric::XY3 => self.xy3,
            Metric::DXY2DVarphi => self.d_xy2_d_varphi,
            Metric::DZ2DVarphi => self.d_z2_d_varphi,
            Metric::DXY3DVarphi => self.d_xy3_d_varphi,
        }
    }

    /// First metric that is NaN or infinite, if any.
    pub fn first_non_finite(&self) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| !self.get(*m).is_finite())
    }

    /// Largest relative difference over all metrics, measured against
    /// `max(|a|, |b|, floor)`.
    pub fn max_relative_difference(&self, other: &Diagnostics, floor: f64) -> f64 {
        Metric::ALL
            .into_iter()
            .map(|m| {
                let (a, b) = (self.get(m), other.get(m));
                let scale = a.abs().max(b.abs()).max(floor);
                (a - b).abs() / scale
            })
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<_> = Metric::ALL.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Metric::ALL.len());
    }

    #[test]
    fn get_reads_matching_field() {
        let diagnostics = Diagnostics {
            iota: 0.42,
            min_l_grad_b: 0.3,
            d_xy3_d_varphi: 7.0,
            ..Diagnostics::default()
        };
        assert_eq!(diagnostics.get(Metric::Iota), 0.42);
        assert_eq!(diagnostics.get(Metric::MinLGradB), 0.3);
        assert_eq!(diagnostics.get(Metric::DXY3DVarphi), 7.0);
    }

    #[test]
    fn non_finite_metric_is_reported() {
        let mut diagnostics = Diagnostics::default();
        assert_eq!(diagnostics.first_non_finite(), None);
        diagnostics.r_singularity = f64::NAN;
        assert_eq!(diagnostics.first_non_finite(), Some(Metric::RSingularity));
    }

    #[test]
    fn relative_difference_uses_floor_for_zeros() {
        let a = Diagnostics {
            iota: 1.0,
            ..Diagnostics::default()
        };
        let mut b = a.clone();
        assert_eq!(a.max_relative_difference(&b, 1e-12), 0.0);
        b.iota = 1.0 + 1e-10;
        assert!(a.max_relative_difference(&b, 1e-12) < 1e-9);
    }
}
