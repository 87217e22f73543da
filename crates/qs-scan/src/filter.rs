//! Keep thresholds applied to each completed job.

use serde::{Deserialize, Serialize};

use qs_types::{Diagnostics, Metric};

use crate::job::Verdict;

/// Optional bounds on final diagnostics. Unset bounds always pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepThresholds {
    pub min_r0: Option<f64>,
    pub max_r0: Option<f64>,
    /// Compared against `|iota|`.
    pub min_iota: Option<f64>,
    pub max_elongation: Option<f64>,
    pub min_l_grad_b: Option<f64>,
    pub min_l_grad_grad_b: Option<f64>,
    pub max_b20_variation: Option<f64>,
    pub min_r_singularity: Option<f64>,
    pub max_d2_volume_d_psi2: Option<f64>,
    pub min_dmerc_times_r2: Option<f64>,
    pub max_xy2: Option<f64>,
    pub max_z2: Option<f64>,
    pub max_xy3: Option<f64>,
    pub max_d_xy2_d_varphi: Option<f64>,
    pub max_d_z2_d_varphi: Option<f64>,
    pub max_d_xy3_d_varphi: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Min,
    Max,
}

impl KeepThresholds {
    /// Every threshold as (input key, bound kind, metric, value).
    fn entries(&self) -> [(&'static str, Bound, Metric, Option<f64>); 16] {
        [
            ("min_R0_to_keep", Bound::Min, Metric::MinR0, self.min_r0),
            ("max_R0_to_keep", Bound::Max, Metric::MaxR0, self.max_r0),
            ("min_iota_to_keep", Bound::Min, Metric::Iota, self.min_iota),
            ("max_elongation_to_keep", Bound::Max, Metric::MaxElongation, self.max_elongation),
            ("min_L_grad_B_to_keep", Bound::Min, Metric::MinLGradB, self.min_l_grad_b),
            ("min_L_grad_grad_B_to_keep", Bound::Min, Metric::MinLGradGradB, self.min_l_grad_grad_b),
            ("max_B20_variation_to_keep", Bound::Max, Metric::B20Variation, self.max_b20_variation),
            ("min_r_singularity_to_keep", Bound::Min, Metric::RSingularity, self.min_r_singularity),
            ("max_d2_volume_d_psi2_to_keep", Bound::Max, Metric::D2VolumeDPsi2, self.max_d2_volume_d_psi2),
            ("min_DMerc_times_r2_to_keep", Bound::Min, Metric::DMercTimesR2, self.min_dmerc_times_r2),
            ("max_XY2_to_keep", Bound::Max, Metric::XY2, self.max_xy2),
            ("max_Z2_to_keep", Bound::Max, Metric::Z2, self.max_z2),
            ("max_XY3_to_keep", Bound::Max, Metric::XY3, self.max_xy3),
            ("max_d_XY2_d_varphi_to_keep", Bound::Max, Metric::DXY2DVarphi, self.max_d_xy2_d_varphi),
            ("max_d_Z2_d_varphi_to_keep", Bound::Max, Metric::DZ2DVarphi, self.max_d_z2_d_varphi),
            ("max_d_XY3_d_varphi_to_keep", Bound::Max, Metric::DXY3DVarphi, self.max_d_xy3_d_varphi),
        ]
    }

    /// Number of thresholds that are set.
    pub fn active(&self) -> usize {
        self.entries().iter().filter(|e| e.3.is_some()).count()
    }

    /// Human-readable description of every violated threshold. NaN metrics
    /// violate any threshold set on them.
    pub fn violations(&self, diagnostics: &Diagnostics) -> Vec<String> {
        let mut reasons = Vec::new();
        for (key, bound, metric, limit) in self.entries() {
            let Some(limit) = limit else { continue };
            let mut value = diagnostics.get(metric);
            if metric == Metric::Iota {
                value = value.abs();
            }
            let passes = match bound {
                Bound::Min => value >= limit,
                Bound::Max => value <= limit,
            };
            if !passes {
                reasons.push(format!("{metric} = {value} fails {key} = {limit}"));
            }
        }
        reasons
    }
}

/// Decides whether a completed job is kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultFilter {
    pub keep_all: bool,
    pub thresholds: KeepThresholds,
}

impl ResultFilter {
    pub fn new(keep_all: bool, thresholds: KeepThresholds) -> Self {
        Self {
            keep_all,
            thresholds,
        }
    }

    /// Verdict for a job that finished without failing.
    pub fn judge(&self, diagnostics: &Diagnostics) -> Verdict {
        if self.keep_all {
            return Verdict::Retained;
        }
        let reasons = self.thresholds.violations(diagnostics);
        if reasons.is_empty() {
            Verdict::Retained
        } else {
            Verdict::Rejected { reasons }
        }
    }
}
