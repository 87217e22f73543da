//! Weighted objective terms.
//!
//! The objective is a fixed, enumerated set of terms. A weight of zero is the
//! only way to switch a term off; active terms each emit exactly one
//! residual.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use qs_types::{ConfigError, Diagnostics, ObjectiveError};

/// One kind of objective term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TermKind {
    B20,
    Iota,
    Elongation,
    Curvature,
    R0,
    D2VolumeDPsi2,
    XY2,
    XY2Prime,
    Z2,
    Z2Prime,
    XY3,
    XY3Prime,
    GradB,
    GradGradB,
    RSingularity,
}

impl TermKind {
    pub const ALL: [TermKind; 15] = [
        Self::B20,
        Self::Iota,
        Self::Elongation,
        Self::Curvature,
        Self::R0,
        Self::D2VolumeDPsi2,
        Self::XY2,
        Self::XY2Prime,
        Self::Z2,
        Self::Z2Prime,
        Self::XY3,
        Self::XY3Prime,
        Self::GradB,
        Self::GradGradB,
        Self::RSingularity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::B20 => "B20",
            Self::Iota => "iota",
            Self::Elongation => "elongation",
            Self::Curvature => "curvature",
            Self::R0 => "R0",
            Self::D2VolumeDPsi2 => "d2_volume_d_psi2",
            Self::XY2 => "XY2",
            Self::XY2Prime => "XY2Prime",
            Self::Z2 => "Z2",
            Self::Z2Prime => "Z2Prime",
            Self::XY3 => "XY3",
            Self::XY3Prime => "XY3Prime",
            Self::GradB => "grad_B",
            Self::GradGradB => "grad_grad_B",
            Self::RSingularity => "r_singularity",
        }
    }

    /// Unweighted residual of this term.
    fn raw_residual(self, d: &Diagnostics, targets: &Targets) -> f64 {
        match self {
            Self::B20 => d.b20_residual,
            Self::Iota => d.iota - targets.target_iota,
            Self::Elongation => d.max_elongation,
            Self::Curvature => d.max_curvature,
            Self::R0 => positive_part(targets.min_r0 - d.min_r0),
            Self::D2VolumeDPsi2 => positive_part(d.d2_volume_d_psi2 - targets.max_d2_volume_d_psi2),
            Self::XY2 => d.xy2,
            Self::XY2Prime => d.d_xy2_d_varphi,
            Self::Z2 => d.z2,
            Self::Z2Prime => d.d_z2_d_varphi,
            Self::XY3 => d.xy3,
            Self::XY3Prime => d.d_xy3_d_varphi,
            Self::GradB => 1.0 / d.min_l_grad_b,
            Self::GradGradB => 1.0 / d.min_l_grad_grad_b,
            Self::RSingularity => 1.0 / d.r_singularity,
        }
    }
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TermKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| ConfigError::UnknownParameter {
                field: "weights".into(),
                name: s.to_string(),
            })
    }
}

/// `max(0, x)` that lets NaN through.
fn positive_part(x: f64) -> f64 {
    if x > 0.0 || x.is_nan() {
        x
    } else {
        0.0
    }
}

/// Weight of every term. Zero disables the term.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Weights {
    #[serde(rename = "B20")]
    pub b20: f64,
    pub iota: f64,
    pub elongation: f64,
    pub curvature: f64,
    #[serde(rename = "R0")]
    pub r0: f64,
    pub d2_volume_d_psi2: f64,
    #[serde(rename = "XY2")]
    pub xy2: f64,
    #[serde(rename = "XY2Prime")]
    pub xy2_prime: f64,
    #[serde(rename = "Z2")]
    pub z2: f64,
    #[serde(rename = "Z2Prime")]
    pub z2_prime: f64,
    #[serde(rename = "XY3")]
    pub xy3: f64,
    #[serde(rename = "XY3Prime")]
    pub xy3_prime: f64,
    #[serde(rename = "grad_B")]
    pub grad_b: f64,
    #[serde(rename = "grad_grad_B")]
    pub grad_grad_b: f64,
    pub r_singularity: f64,
}

impl Weights {
    pub fn get(&self, term: TermKind) -> f64 {
        match term {
            TermKind::B20 => self.b20,
            TermKind::Iota => self.iota,
            TermKind::Elongation => self.elongation,
            TermKind::Curvature => self.curvature,
            TermKind::R0 => self.r0,
            TermKind::D2VolumeDPsi2 => self.d2_volume_d_psi2,
            TermKind::XY2 => self.xy2,
            TermKind::XY2Prime => self.xy2_prime,
            TermKind::Z2 => self.z2,
            TermKind::Z2Prime => self.z2_prime,
            TermKind::XY3 => self.xy3,
            TermKind::XY3Prime => self.xy3_prime,
            TermKind::GradB => self.grad_b,
            TermKind::GradGradB => self.grad_grad_b,
            TermKind::RSingularity => self.r_singularity,
        }
    }

    pub fn set(&mut self, term: TermKind, weight: f64) {
        let slot = match term {
            TermKind::B20 => &mut self.b20,
            TermKind::Iota => &mut self.iota,
            TermKind::Elongation => &mut self.elongation,
            TermKind::Curvature => &mut self.curvature,
            TermKind::R0 => &mut self.r0,
            TermKind::D2VolumeDPsi2 => &mut self.d2_volume_d_psi2,
            TermKind::XY2 => &mut self.xy2,
            TermKind::XY2Prime => &mut self.xy2_prime,
            TermKind::Z2 => &mut self.z2,
            TermKind::Z2Prime => &mut self.z2_prime,
            TermKind::XY3 => &mut self.xy3,
            TermKind::XY3Prime => &mut self.xy3_prime,
            TermKind::GradB => &mut self.grad_b,
            TermKind::GradGradB => &mut self.grad_grad_b,
            TermKind::RSingularity => &mut self.r_singularity,
        };
        *slot = weight;
    }

    pub fn with(mut self, term: TermKind, weight: f64) -> Self {
        self.set(term, weight);
        self
    }
}

/// Target values some terms are measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Targets {
    pub target_iota: f64,
    /// Penalty threshold for the minimum major radius.
    #[serde(rename = "min_R0")]
    pub min_r0: f64,
    pub max_d2_volume_d_psi2: f64,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            target_iota: 0.41,
            min_r0: 0.3,
            max_d2_volume_d_psi2: 0.0,
        }
    }
}

/// Weights plus targets: everything needed to turn diagnostics into
/// residuals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Objective {
    pub weights: Weights,
    pub targets: Targets,
}

impl Objective {
    pub fn new(weights: Weights) -> Self {
        Self {
            weights,
            targets: Targets::default(),
        }
    }

    pub fn with_targets(mut self, targets: Targets) -> Self {
        self.targets = targets;
        self
    }

    /// Terms with a nonzero weight, in [`TermKind::ALL`] order.
    pub fn active_terms(&self) -> Vec<TermKind> {
        TermKind::ALL
            .into_iter()
            .filter(|t| self.weights.get(*t) != 0.0)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ObjectiveError> {
        for term in TermKind::ALL {
            let weight = self.weights.get(term);
            if !weight.is_finite() || weight < 0.0 {
                return Err(ObjectiveError::InvalidWeight {
                    term: term.name().to_string(),
                    weight,
                });
            }
        }
        if self.active_terms().is_empty() {
            return Err(ObjectiveError::NoActiveTerms);
        }
        Ok(())
    }

    /// One weighted residual per active term.
    pub fn residuals(&self, diagnostics: &Diagnostics) -> Vec<f64> {
        self.active_terms()
            .into_iter()
            .map(|t| self.weights.get(t) * t.raw_residual(diagnostics, &self.targets))
            .collect()
    }
}

/// Sum of squared residuals.
pub fn sum_of_squares(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}
