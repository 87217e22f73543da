//! Reference near-axis evaluator.
//!
//! Axis geometry (curvature, torsion, arclength, radius statistics) is
//! computed exactly from the Fourier series on `nphi` points of one field
//! period. First-order shape uses a constant `sigma = sigma0`, which turns
//! the sigma equation into a closed-form rotational transform. Second-order
//! quantities are smooth closed-form proxies driven by `B2c`, `B2s`, `p2`
//! and `I2`. The model is deterministic and cheap, and every coefficient
//! equal to 0.0 contributes nothing, so zero-padded configurations evaluate
//! bit-identically to the unpadded ones.

use std::f64::consts::PI;

use crate::configuration::Configuration;
use crate::diagnostics::Diagnostics;
use crate::evaluator::Evaluator;

/// Vacuum permeability [H/m].
const MU0: f64 = 4.0e-7 * PI;

/// Stand-in for "no singularity found".
const R_SINGULARITY_CAP: f64 = 1.0e30;

/// Fewer points than this cannot resolve a periodic derivative.
const MIN_NPHI: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct NearAxisModel;

impl NearAxisModel {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for NearAxisModel {
    fn evaluate(&self, configuration: &Configuration) -> Diagnostics {
        let axis = AxisGeometry::compute(configuration);
        let shape = FirstOrder::compute(configuration, &axis);
        second_order(configuration, &axis, &shape)
    }

    fn name(&self) -> &str {
        "near-axis reference model"
    }
}

/// Axis shape sampled on one field period.
struct AxisGeometry {
    d_phi: f64,
    r: Vec<f64>,
    z: Vec<f64>,
    curvature: Vec<f64>,
    torsion: Vec<f64>,
    d_l_d_phi: Vec<f64>,
    axis_length: f64,
}

impl AxisGeometry {
    fn compute(c: &Configuration) -> Self {
        let nphi = c.nphi.max(MIN_NPHI);
        let nfp = f64::from(c.nfp.max(1));
        let d_phi = 2.0 * PI / (nfp * nphi as f64);

        let mut geometry = Self {
            d_phi,
            r: Vec::with_capacity(nphi),
            z: Vec::with_capacity(nphi),
            curvature: Vec::with_capacity(nphi),
            torsion: Vec::with_capacity(nphi),
            d_l_d_phi: Vec::with_capacity(nphi),
            axis_length: 0.0,
        };

        for j in 0..nphi {
            let phi = j as f64 * d_phi;
            // R, R', R'', R''' and the same for Z
            let mut rd = [0.0; 4];
            let mut zd = [0.0; 4];
            for n in 0..c.axis.len() {
                let k = n as f64 * nfp;
                let (s, co) = (k * phi).sin_cos();
                let terms = |cos_coef: f64, sin_coef: f64| -> [f64; 4] {
                    [
                        cos_coef * co + sin_coef * s,
                        k * (-cos_coef * s + sin_coef * co),
                        -k * k * (cos_coef * co + sin_coef * s),
                        k * k * k * (cos_coef * s - sin_coef * co),
                    ]
                };
                let r_terms = terms(c.axis.r0c()[n], c.axis.r0s()[n]);
                let z_terms = terms(c.axis.z0c()[n], c.axis.z0s()[n]);
                for i in 0..4 {
                    rd[i] += r_terms[i];
                    zd[i] += z_terms[i];
                }
            }

            let (sp, cp) = phi.sin_cos();
            let [r, r1, r2, r3] = rd;
            let d1 = [r1 * cp - r * sp, r1 * sp + r * cp, zd[1]];
            let d2 = [
                r2 * cp - 2.0 * r1 * sp - r * cp,
                r2 * sp + 2.0 * r1 * cp - r * sp,
                zd[2],
            ];
            let d3 = [
                r3 * cp - 3.0 * r2 * sp - 3.0 * r1 * cp + r * sp,
                r3 * sp + 3.0 * r2 * cp - 3.0 * r1 * sp - r * cp,
                zd[3],
            ];

            let speed = norm(d1);
            let cross = cross(d1, d2);
            let cross_norm = norm(cross);

            geometry.r.push(r);
            geometry.z.push(zd[0]);
            geometry.d_l_d_phi.push(speed);
            geometry.curvature.push(cross_norm / speed.powi(3));
            geometry.torsion.push(dot(cross, d3) / (cross_norm * cross_norm));
        }

        geometry.axis_length = nfp * geometry.d_l_d_phi.iter().sum::<f64>() * d_phi;
        geometry
    }

    /// Mean arclength derivative, the Boozer-angle `dl/dvarphi`.
    fn mean_d_l_d_varphi(&self) -> f64 {
        self.axis_length / (2.0 * PI)
    }
}

/// First-order shape with constant sigma.
struct FirstOrder {
    x1c: Vec<f64>,
    y1s: Vec<f64>,
    y1c: Vec<f64>,
    elongation: Vec<f64>,
    min_semi_axis: Vec<f64>,
    iota: f64,
    l_grad_b: Vec<f64>,
    grad_b_norm: Vec<f64>,
    d_grad_b_norm: Vec<f64>,
}

impl FirstOrder {
    fn compute(c: &Configuration, axis: &AxisGeometry) -> Self {
        let eta = c.eta_bar;
        let sigma = c.sigma0;
        let x1c: Vec<f64> = axis.curvature.iter().map(|k| eta / k).collect();
        let y1s: Vec<f64> = axis.curvature.iter().map(|k| k / eta).collect();
        let y1c: Vec<f64> = y1s.iter().map(|y| sigma * y).collect();

        let mut elongation = Vec::with_capacity(x1c.len());
        let mut min_semi_axis = Vec::with_capacity(x1c.len());
        for j in 0..x1c.len() {
            let p = x1c[j] * x1c[j] + y1s[j] * y1s[j] + y1c[j] * y1c[j];
            let q = (x1c[j] * y1s[j]).abs();
            let disc = (p * p - 4.0 * q * q).max(0.0).sqrt();
            elongation.push((p + disc) / (2.0 * q));
            min_semi_axis.push(((p - disc) / 2.0).max(0.0).sqrt());
        }

        // Period integral of the sigma equation with sigma' = 0.
        let mut numerator = 0.0_f64;
        let mut denominator = 0.0_f64;
        for j in 0..x1c.len() {
            let ratio = eta * eta / (axis.curvature[j] * axis.curvature[j]);
            numerator += 2.0 * ratio * (c.i2 / c.b0 - axis.torsion[j]) * axis.d_l_d_phi[j];
            denominator += ratio * ratio + 1.0 + sigma * sigma;
        }
        let iota = numerator / denominator;

        let l_prime = axis.mean_d_l_d_varphi();
        let factor = c.b0 / l_prime;
        let d_x1c = periodic_derivative(&x1c, axis.d_phi);
        let d_y1s = periodic_derivative(&y1s, axis.d_phi);
        let d_y1c = periodic_derivative(&y1c, axis.d_phi);

        let mut tensors = Vec::with_capacity(x1c.len());
        for j in 0..x1c.len() {
            let tau = axis.torsion[j];
            let tn = c.b0 * axis.curvature[j];
            let bb = factor * (x1c[j] * d_y1s[j] - iota * x1c[j] * y1c[j]);
            let nn = factor * (d_x1c[j] * y1s[j] + iota * x1c[j] * y1c[j]);
            let bn = factor * (-l_prime * tau - iota * x1c[j] * x1c[j]);
            let nb = factor
                * (d_y1c[j] * y1s[j] - d_y1s[j] * y1c[j]
                    + l_prime * tau
                    + iota * (y1s[j] * y1s[j] + y1c[j] * y1c[j]));
            tensors.push([tn, tn, bb, nn, bn, nb]);
        }

        let grad_b_norm: Vec<f64> = tensors
            .iter()
            .map(|t| t.iter().map(|v| v * v).sum::<f64>().sqrt())
            .collect();
        let l_grad_b = grad_b_norm
            .iter()
            .map(|g| c.b0 * (2.0 / (g * g)).sqrt())
            .collect();

        // Arclength derivative of the tensor, component-wise.
        let mut d_grad_b_norm: Vec<f64> = vec![0.0; x1c.len()];
        for component in 0..6 {
            let series: Vec<f64> = tensors.iter().map(|t| t[component]).collect();
            for (acc, d) in d_grad_b_norm
                .iter_mut()
                .zip(periodic_derivative(&series, axis.d_phi))
            {
                *acc += (d / l_prime) * (d / l_prime);
            }
        }
        for value in &mut d_grad_b_norm {
            *value = value.sqrt();
        }

        Self {
            x1c,
            y1s,
            y1c,
            elongation,
            min_semi_axis,
            iota,
            l_grad_b,
            grad_b_norm,
            d_grad_b_norm,
        }
    }
}

fn second_order(c: &Configuration, axis: &AxisGeometry, first: &FirstOrder) -> Diagnostics {
    let eta = c.eta_bar;
    let b0 = c.b0;
    let l_prime = axis.mean_d_l_d_varphi();
    let n = first.x1c.len();

    let d_x1c = periodic_derivative(&first.x1c, axis.d_phi);
    let d_y1s = periodic_derivative(&first.y1s, axis.d_phi);
    let d_y1c = periodic_derivative(&first.y1c, axis.d_phi);

    let mut xy2 = Vec::with_capacity(n);
    let mut z2 = Vec::with_capacity(n);
    let mut xy3 = Vec::with_capacity(n);
    let mut b20 = Vec::with_capacity(n);
    let mut l_grad_grad_b = Vec::with_capacity(n);
    let mut r_singularity = Vec::with_capacity(n);

    for j in 0..n {
        let kappa = axis.curvature[j];
        let tau = axis.torsion[j];
        let (x1c, y1s, y1c) = (first.x1c[j], first.y1s[j], first.y1c[j]);
        let amplitude = (x1c * x1c + y1s * y1s + y1c * y1c).sqrt();

        let x2c = 0.25 * kappa * x1c * x1c - c.b2c / (b0 * eta);
        let x2s = 0.25 * kappa * x1c * y1c - c.b2s / (b0 * eta);
        let y2c = 0.5 * (tau + c.i2 / b0) * x1c * y1s + 0.5 * MU0 * c.p2 / (b0 * b0) * y1s;
        let xy2_j = (x2c * x2c + x2s * x2s + y2c * y2c).sqrt();
        let z2_j = (x1c * d_x1c[j] + y1s * d_y1s[j] + y1c * d_y1c[j]).abs() / (4.0 * l_prime);

        xy2.push(xy2_j);
        z2.push(z2_j);
        xy3.push(0.5 * kappa * amplitude * xy2_j + tau.abs() * z2_j * amplitude);
        b20.push(b0 * (2.0 * kappa * x2c + tau * y2c) - MU0 * c.p2 / b0);

        let ggb = (first.d_grad_b_norm[j].powi(2)
            + (kappa * first.grad_b_norm[j]).powi(2)
            + (4.0 * (c.b2c.abs() + c.b2s.abs())).powi(2))
        .sqrt();
        l_grad_grad_b.push((4.0 * b0 / ggb).sqrt());

        let r_sing = if xy2_j > 0.0 {
            (first.min_semi_axis[j] / (2.0 * xy2_j)).min(R_SINGULARITY_CAP)
        } else {
            R_SINGULARITY_CAP
        };
        r_singularity.push(r_sing);
    }

    let b20_mean = mean(&b20);
    let d2_volume_d_psi2 = (2.0 * PI * axis.axis_length / (b0 * b0 * b0))
        * (MU0 * c.p2 / b0 - 2.0 * b20_mean + 0.75 * b0 * eta * eta * c.sigma0 * c.sigma0);
    let iota = first.iota;

    Diagnostics {
        iota,
        min_r0: min(&axis.r),
        max_r0: max(&axis.r),
        max_curvature: max(&axis.curvature),
        max_elongation: max(&first.elongation),
        min_l_grad_b: min(&first.l_grad_b),
        min_l_grad_grad_b: min(&l_grad_grad_b),
        r_singularity: min(&r_singularity),
        b20_variation: max(&b20) - min(&b20),
        b20_residual: standard_deviation(&b20) / b0,
        d2_volume_d_psi2,
        dmerc_times_r2: -d2_volume_d_psi2 * b0 * (iota * iota + 1.0) / (4.0 * PI * PI),
        standard_deviation_of_r: standard_deviation(&axis.r),
        standard_deviation_of_z: standard_deviation(&axis.z),
        axis_length: axis.axis_length,
        xy2: max(&xy2),
        z2: max(&z2),
        xy3: max(&xy3),
        d_xy2_d_varphi: max_abs(&periodic_derivative(&xy2, axis.d_phi)),
        d_z2_d_varphi: max_abs(&periodic_derivative(&z2, axis.d_phi)),
        d_xy3_d_varphi: max_abs(&periodic_derivative(&xy3, axis.d_phi)),
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

/// Second-order central difference on a periodic grid.
fn periodic_derivative(values: &[f64], spacing: f64) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|j| (values[(j + 1) % n] - values[(j + n - 1) % n]) / (2.0 * spacing))
        .collect()
}

// NaN-propagating reductions: a NaN anywhere must surface in the result.
fn min(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(f64::INFINITY, |acc, v| if v.is_nan() || v < acc { v } else { acc })
}

fn max(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, |acc, v| if v.is_nan() || v > acc { v } else { acc })
}

fn max_abs(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(0.0, |acc: f64, v| if v.is_nan() || v.abs() > acc { v.abs() } else { acc })
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn standard_deviation(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}
