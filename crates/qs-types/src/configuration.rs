//! Near-axis configuration vector, parameter addressing and vary masks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// One of the four Fourier series describing the magnetic axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AxisSeries {
    R0c,
    R0s,
    Z0c,
    Z0s,
}

impl AxisSeries {
    pub const ALL: [AxisSeries; 4] = [Self::R0c, Self::R0s, Self::Z0c, Self::Z0s];

    pub fn name(self) -> &'static str {
        match self {
            Self::R0c => "R0c",
            Self::R0s => "R0s",
            Self::Z0c => "Z0c",
            Self::Z0s => "Z0s",
        }
    }

    /// Stellarator-symmetric series (cosine in R, sine in Z).
    pub fn is_symmetric(self) -> bool {
        matches!(self, Self::R0c | Self::Z0s)
    }
}

/// Serialized shape of [`FourierAxis`]; validated on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AxisCoefficients {
    #[serde(rename = "R0c")]
    r0c: Vec<f64>,
    #[serde(rename = "R0s")]
    r0s: Vec<f64>,
    #[serde(rename = "Z0c")]
    z0c: Vec<f64>,
    #[serde(rename = "Z0s")]
    z0s: Vec<f64>,
}

/// Fourier coefficients of the magnetic axis.
///
/// The four arrays always have the same length; the only way to change that
/// length is [`FourierAxis::refined`], which returns a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisCoefficients", into = "AxisCoefficients")]
pub struct FourierAxis {
    r0c: Vec<f64>,
    r0s: Vec<f64>,
    z0c: Vec<f64>,
    z0s: Vec<f64>,
}

impl TryFrom<AxisCoefficients> for FourierAxis {
    type Error = ConfigError;

    fn try_from(raw: AxisCoefficients) -> Result<Self, Self::Error> {
        Self::new(raw.r0c, raw.r0s, raw.z0c, raw.z0s)
    }
}

impl From<FourierAxis> for AxisCoefficients {
    fn from(axis: FourierAxis) -> Self {
        Self {
            r0c: axis.r0c,
            r0s: axis.r0s,
            z0c: axis.z0c,
            z0s: axis.z0s,
        }
    }
}

impl FourierAxis {
    pub fn new(
        r0c: Vec<f64>,
        r0s: Vec<f64>,
        z0c: Vec<f64>,
        z0s: Vec<f64>,
    ) -> Result<Self, ConfigError> {
        let expected = r0c.len();
        if expected == 0 {
            return Err(ConfigError::InvalidValue {
                field: "R0c".into(),
                message: "at least one Fourier mode is required".into(),
            });
        }
        for (field, values) in [("R0s", &r0s), ("Z0c", &z0c), ("Z0s", &z0s)] {
            if values.len() != expected {
                return Err(ConfigError::LengthMismatch {
                    field: field.into(),
                    expected,
                    actual: values.len(),
                });
            }
        }
        Ok(Self { r0c, r0s, z0c, z0s })
    }

    /// Planar circular axis of major radius `r0` with `modes` Fourier modes.
    pub fn circular(r0: f64, modes: usize) -> Self {
        let modes = modes.max(1);
        let mut r0c = vec![0.0; modes];
        r0c[0] = r0;
        Self {
            r0c,
            r0s: vec![0.0; modes],
            z0c: vec![0.0; modes],
            z0s: vec![0.0; modes],
        }
    }

    /// Number of Fourier modes (shared by all four series).
    pub fn len(&self) -> usize {
        self.r0c.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r0c.is_empty()
    }

    pub fn series(&self, series: AxisSeries) -> &[f64] {
        match series {
            AxisSeries::R0c => &self.r0c,
            AxisSeries::R0s => &self.r0s,
            AxisSeries::Z0c => &self.z0c,
            AxisSeries::Z0s => &self.z0s,
        }
    }

    fn series_mut(&mut self, series: AxisSeries) -> &mut Vec<f64> {
        match series {
            AxisSeries::R0c => &mut self.r0c,
            AxisSeries::R0s => &mut self.r0s,
            AxisSeries::Z0c => &mut self.z0c,
            AxisSeries::Z0s => &mut self.z0s,
        }
    }

    pub fn r0c(&self) -> &[f64] {
        &self.r0c
    }

    pub fn r0s(&self) -> &[f64] {
        &self.r0s
    }

    pub fn z0c(&self) -> &[f64] {
        &self.z0c
    }

    pub fn z0s(&self) -> &[f64] {
        &self.z0s
    }

    pub fn coefficient(&self, series: AxisSeries, mode: usize) -> Option<f64> {
        self.series(series).get(mode).copied()
    }

    pub fn set_coefficient(
        &mut self,
        series: AxisSeries,
        mode: usize,
        value: f64,
    ) -> Result<(), ConfigError> {
        let len = self.len();
        let slot = self
            .series_mut(series)
            .get_mut(mode)
            .ok_or_else(|| ConfigError::ModeOutOfRange {
                field: format!("{}{}", series.name(), mode),
                index: mode,
                len,
            })?;
        *slot = value;
        Ok(())
    }

    /// Copy of this axis with `extra` trailing modes appended to every
    /// series, each exactly 0.0. Existing coefficients are untouched.
    pub fn refined(&self, extra: usize) -> Self {
        let mut axis = self.clone();
        let new_len = self.len() + extra;
        for series in AxisSeries::ALL {
            axis.series_mut(series).resize(new_len, 0.0);
        }
        axis
    }
}

/// Address of a single scalar inside a [`Configuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigParam {
    Axis(AxisSeries, usize),
    EtaBar,
    Sigma0,
    B2c,
    B2s,
    /// Fixed scalar: scannable but never varied by the solver.
    I2,
    /// Fixed scalar: scannable but never varied by the solver.
    P2,
}

impl ConfigParam {
    /// Whether the solver may treat this parameter as a free variable.
    pub fn is_optimizable(self) -> bool {
        !matches!(self, Self::I2 | Self::P2)
    }
}

impl fmt::Display for ConfigParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Axis(series, mode) => write!(f, "{}{}", series.name(), mode),
            Self::EtaBar => write!(f, "eta_bar"),
            Self::Sigma0 => write!(f, "sigma0"),
            Self::B2c => write!(f, "B2c"),
            Self::B2s => write!(f, "B2s"),
            Self::I2 => write!(f, "I2"),
            Self::P2 => write!(f, "p2"),
        }
    }
}

impl FromStr for ConfigParam {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ConfigError::UnknownParameter {
            field: "params".into(),
            name: s.to_string(),
        };
        match s {
            "eta_bar" => return Ok(Self::EtaBar),
            "sigma0" => return Ok(Self::Sigma0),
            "B2c" => return Ok(Self::B2c),
            "B2s" => return Ok(Self::B2s),
            "I2" => return Ok(Self::I2),
            "p2" => return Ok(Self::P2),
            _ => {}
        }
        for series in AxisSeries::ALL {
            if let Some(digits) = s.strip_prefix(series.name()) {
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(unknown());
                }
                let mode = digits.parse::<usize>().map_err(|_| unknown())?;
                return Ok(Self::Axis(series, mode));
            }
        }
        Err(unknown())
    }
}

/// Full parameter vector for one candidate design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Number of field periods.
    pub nfp: u32,
    /// Grid points per field period used by the evaluator.
    pub nphi: usize,
    #[serde(rename = "B0")]
    pub b0: f64,
    #[serde(rename = "I2")]
    pub i2: f64,
    pub p2: f64,
    pub axis: FourierAxis,
    pub eta_bar: f64,
    pub sigma0: f64,
    #[serde(rename = "B2c")]
    pub b2c: f64,
    #[serde(rename = "B2s")]
    pub b2s: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            nfp: 3,
            nphi: 15,
            b0: 1.0,
            i2: 0.0,
            p2: 0.0,
            axis: FourierAxis::circular(1.0, 1),
            eta_bar: -1.0,
            sigma0: 0.0,
            b2c: 0.0,
            b2s: 0.0,
        }
    }
}

impl Configuration {
    pub fn new(nfp: u32, axis: FourierAxis, eta_bar: f64) -> Self {
        Self {
            nfp,
            axis,
            eta_bar,
            ..Self::default()
        }
    }

    pub fn with_nphi(mut self, nphi: usize) -> Self {
        self.nphi = nphi;
        self
    }

    pub fn with_second_order(mut self, b2c: f64, b2s: f64) -> Self {
        self.b2c = b2c;
        self.b2s = b2s;
        self
    }

    pub fn with_sigma0(mut self, sigma0: f64) -> Self {
        self.sigma0 = sigma0;
        self
    }

    pub fn get(&self, param: ConfigParam) -> Option<f64> {
        match param {
            ConfigParam::Axis(series, mode) => self.axis.coefficient(series, mode),
            ConfigParam::EtaBar => Some(self.eta_bar),
            ConfigParam::Sigma0 => Some(self.sigma0),
            ConfigParam::B2c => Some(self.b2c),
            ConfigParam::B2s => Some(self.b2s),
            ConfigParam::I2 => Some(self.i2),
            ConfigParam::P2 => Some(self.p2),
        }
    }

    pub fn set(&mut self, param: ConfigParam, value: f64) -> Result<(), ConfigError> {
        match param {
            ConfigParam::Axis(series, mode) => return self.axis.set_coefficient(series, mode, value),
            ConfigParam::EtaBar => self.eta_bar = value,
            ConfigParam::Sigma0 => self.sigma0 = value,
            ConfigParam::B2c => self.b2c = value,
            ConfigParam::B2s => self.b2s = value,
            ConfigParam::I2 => self.i2 = value,
            ConfigParam::P2 => self.p2 = value,
        }
        Ok(())
    }

    /// Copy with `extra` zero-valued Fourier modes appended.
    pub fn refined(&self, extra: usize) -> Self {
        Self {
            axis: self.axis.refined(extra),
            ..self.clone()
        }
    }

    /// Values of the parameters the mask marks as varied, in mask order.
    pub fn varied_values(&self, mask: &VaryMask) -> Vec<f64> {
        mask.varied_params()
            .into_iter()
            .filter_map(|p| self.get(p))
            .collect()
    }

    /// Copy with the varied parameters replaced by `values` (mask order).
    pub fn with_varied_values(&self, mask: &VaryMask, values: &[f64]) -> Result<Self, ConfigError> {
        let params = mask.varied_params();
        if params.len() != values.len() {
            return Err(ConfigError::LengthMismatch {
                field: "varied values".into(),
                expected: params.len(),
                actual: values.len(),
            });
        }
        let mut next = self.clone();
        for (param, value) in params.into_iter().zip(values) {
            next.set(param, *value)?;
        }
        Ok(next)
    }
}

/// Which parameters the solver may move during one stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VaryMask {
    #[serde(rename = "vary_R0c")]
    pub r0c: Vec<bool>,
    #[serde(rename = "vary_R0s")]
    pub r0s: Vec<bool>,
    #[serde(rename = "vary_Z0c")]
    pub z0c: Vec<bool>,
    #[serde(rename = "vary_Z0s")]
    pub z0s: Vec<bool>,
    #[serde(rename = "vary_eta_bar")]
    pub eta_bar: bool,
    #[serde(rename = "vary_sigma0")]
    pub sigma0: bool,
    #[serde(rename = "vary_B2c")]
    pub b2c: bool,
    #[serde(rename = "vary_B2s")]
    pub b2s: bool,
}

impl VaryMask {
    /// Mask for `modes` Fourier modes with nothing varied.
    pub fn fixed(modes: usize) -> Self {
        Self {
            r0c: vec![false; modes],
            r0s: vec![false; modes],
            z0c: vec![false; modes],
            z0s: vec![false; modes],
            ..Self::default()
        }
    }

    pub fn series(&self, series: AxisSeries) -> &[bool] {
        match series {
            AxisSeries::R0c => &self.r0c,
            AxisSeries::R0s => &self.r0s,
            AxisSeries::Z0c => &self.z0c,
            AxisSeries::Z0s => &self.z0s,
        }
    }

    pub fn is_varied(&self, param: ConfigParam) -> bool {
        match param {
            ConfigParam::Axis(series, mode) => self.series(series).get(mode).copied().unwrap_or(false),
            ConfigParam::EtaBar => self.eta_bar,
            ConfigParam::Sigma0 => self.sigma0,
            ConfigParam::B2c => self.b2c,
            ConfigParam::B2s => self.b2s,
            ConfigParam::I2 | ConfigParam::P2 => false,
        }
    }

    /// Varied parameters in canonical order: axis series R0c, R0s, Z0c, Z0s
    /// by mode, then eta_bar, sigma0, B2c, B2s.
    pub fn varied_params(&self) -> Vec<ConfigParam> {
        let mut params = Vec::new();
        for series in AxisSeries::ALL {
            for (mode, varied) in self.series(series).iter().enumerate() {
                if *varied {
                    params.push(ConfigParam::Axis(series, mode));
                }
            }
        }
        for (param, varied) in [
            (ConfigParam::EtaBar, self.eta_bar),
            (ConfigParam::Sigma0, self.sigma0),
            (ConfigParam::B2c, self.b2c),
            (ConfigParam::B2s, self.b2s),
        ] {
            if varied {
                params.push(param);
            }
        }
        params
    }

    pub fn varied_count(&self) -> usize {
        self.varied_params().len()
    }

    /// Every coefficient mask must match the axis length it is applied to.
    pub fn check_len(&self, modes: usize) -> Result<(), ConfigError> {
        for series in AxisSeries::ALL {
            let actual = self.series(series).len();
            if actual != modes {
                return Err(ConfigError::LengthMismatch {
                    field: format!("vary_{}", series.name()),
                    expected: modes,
                    actual,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_axis() -> FourierAxis {
        FourierAxis::new(
            vec![1.0, 0.17],
            vec![0.0, 0.01],
            vec![0.0, 0.02],
            vec![0.0, 0.17],
        )
        .unwrap()
    }

    #[test]
    fn unequal_series_are_rejected() {
        let err = FourierAxis::new(vec![1.0, 0.1], vec![0.0], vec![0.0, 0.0], vec![0.0, 0.0])
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::LengthMismatch {
                field: "R0s".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn refinement_appends_exact_zeros_and_keeps_prefix() {
        let axis = sample_axis();
        let refined = axis.refined(2).refined(1);
        assert_eq!(refined.len(), 5);
        for series in AxisSeries::ALL {
            assert_eq!(&refined.series(series)[..2], axis.series(series));
            for value in &refined.series(series)[2..] {
                assert_eq!(value.to_bits(), 0.0f64.to_bits());
            }
        }
        // the source value is untouched
        assert_eq!(axis.len(), 2);
    }

    #[test]
    fn param_names_round_trip_through_display() {
        for name in ["eta_bar", "sigma0", "B2c", "B2s", "I2", "p2", "R0c3", "Z0s12", "R0s0"] {
            let param: ConfigParam = name.parse().unwrap();
            assert_eq!(param.to_string(), name);
        }
        assert!("R0c".parse::<ConfigParam>().is_err());
        assert!("Z0sx".parse::<ConfigParam>().is_err());
        assert!("etabar".parse::<ConfigParam>().is_err());
    }

    #[test]
    fn set_rejects_missing_mode() {
        let mut config = Configuration::new(4, sample_axis(), 1.0);
        let err = config.set(ConfigParam::Axis(AxisSeries::Z0s, 2), 0.3).unwrap_err();
        assert!(matches!(err, ConfigError::ModeOutOfRange { index: 2, len: 2, .. }));
        config.set(ConfigParam::Axis(AxisSeries::Z0s, 1), 0.3).unwrap();
        assert_eq!(config.axis.z0s()[1], 0.3);
    }

    #[test]
    fn varied_values_pack_and_unpack_in_mask_order() {
        let config = Configuration::new(4, sample_axis(), 1.0).with_second_order(-0.5, 0.2);
        let mut mask = VaryMask::fixed(2);
        mask.z0s[1] = true;
        mask.r0c[1] = true;
        mask.b2c = true;

        assert_eq!(
            mask.varied_params(),
            vec![
                ConfigParam::Axis(AxisSeries::R0c, 1),
                ConfigParam::Axis(AxisSeries::Z0s, 1),
                ConfigParam::B2c,
            ]
        );
        let values = config.varied_values(&mask);
        assert_eq!(values, vec![0.17, 0.17, -0.5]);

        let moved = config.with_varied_values(&mask, &[0.2, 0.1, -0.4]).unwrap();
        assert_eq!(moved.axis.r0c(), &[1.0, 0.2]);
        assert_eq!(moved.axis.z0s(), &[0.0, 0.1]);
        assert_eq!(moved.b2c, -0.4);
        assert_eq!(moved.eta_bar, config.eta_bar);
        assert!(config.with_varied_values(&mask, &[0.0]).is_err());
    }

    #[test]
    fn fixed_scalars_are_never_varied() {
        let mask = VaryMask::fixed(1);
        assert!(!mask.is_varied(ConfigParam::I2));
        assert!(!ConfigParam::P2.is_optimizable());
        assert!(ConfigParam::B2s.is_optimizable());
    }

    #[test]
    fn mask_length_check_names_field() {
        let mut mask = VaryMask::fixed(2);
        mask.z0c.push(true);
        let err = mask.check_len(2).unwrap_err();
        assert!(err.to_string().contains("vary_Z0c"));
    }

    #[test]
    fn configuration_serde_validates_axis() {
        let config = Configuration::new(4, sample_axis(), 1.0);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"R0c\""));
        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);

        let broken = json.replace("\"R0s\":[0.0,0.01]", "\"R0s\":[0.0]");
        assert!(serde_json::from_str::<Configuration>(&broken).is_err());
    }
}
