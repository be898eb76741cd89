//! # HH Core
//!
//! Shared types for the Hodgkin-Huxley membrane simulator.
//!
//! ## Model
//!
//! A single patch of squid-axon membrane described by four coupled ODEs:
//!
//! ```text
//! Cm dV/dt = I_stim - gNa (V - ENa) - gK (V - EK) - gL (V - EL)
//! gNa      = gNa_max * m^3 * h
//! gK       = gK_max * n^4
//! dx/dt    = a_x(Vp) (1 - x) - b_x(Vp) x        for x in {m, h, n}
//! ```
//!
//! with `Vp = V - V_rest` the displacement from rest.
//!
//! ## Units
//!
//! | Quantity | Unit |
//! |----------|------|
//! | Time | s |
//! | Potential | mV |
//! | Capacitance | F/cm^2 |
//! | Conductance | S/cm^2 |
//! | Current | S*mV/cm^2 (mA/cm^2) |
//! | Rate coefficient | 1/ms |
//!
//! Rates come out in 1/ms while the integrator runs in seconds, hence
//! [`RATE_TIME_SCALE`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum HhError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Numeric domain error: rate {rate} is not finite at Vp = {displacement} mV{}", step_suffix(.step))]
    NumericDomain {
        /// Rate (or derived quantity) that left the finite range
        rate: &'static str,
        /// Displacement from rest at which it was evaluated
        displacement: Voltage,
        /// Integration step, when raised inside a run
        step: Option<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn step_suffix(step: &Option<usize>) -> String {
    match step {
        Some(i) => format!(" (step {i})"),
        None => String::new(),
    }
}

impl HhError {
    /// Attach the integration step to a numeric domain error.
    pub fn at_step(self, index: usize) -> Self {
        match self {
            Self::NumericDomain { rate, displacement, .. } => Self::NumericDomain {
                rate,
                displacement,
                step: Some(index),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, HhError>;

/// Time (s)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current density (mA/cm^2)
pub type Current = f64;

/// Conductance (S/cm^2)
pub type Conductance = f64;

/// Capacitance (F/cm^2)
pub type Capacitance = f64;

/// Converts rate coefficients from 1/ms to 1/s.
///
/// Gating derivatives are multiplied by this before the Euler update, since
/// the step size is expressed in seconds.
pub const RATE_TIME_SCALE: f64 = 1.0e3;

/// Largest number of samples a run may record.
pub const MAX_SAMPLES: usize = 20_000_000;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Membrane, stimulus and integration parameters for one run.
///
/// Immutable once handed to a simulation. Defaults are the classical squid
/// axon parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Membrane capacitance (F/cm^2)
    pub capacitance: Capacitance,
    /// Maximum sodium conductance (S/cm^2)
    pub g_na_max: Conductance,
    /// Maximum potassium conductance (S/cm^2)
    pub g_k_max: Conductance,
    /// Leak conductance (S/cm^2)
    pub g_leak: Conductance,
    /// Sodium Nernst potential (mV)
    pub e_na: Voltage,
    /// Potassium Nernst potential (mV)
    pub e_k: Voltage,
    /// Leak reversal potential (mV)
    pub e_leak: Voltage,
    /// Resting membrane potential (mV)
    pub v_rest: Voltage,
    /// Stimulus pulse amplitude (mA/cm^2)
    pub stimulus_amplitude: Current,
    /// Stimulus pulse duration (s)
    pub pulse_duration: Time,
    /// Integration step (s)
    pub dt: Time,
    /// Total simulated time (s)
    pub total_time: Time,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            capacitance: 1.0e-6,
            g_na_max: 120.0e-3,
            g_k_max: 36.0e-3,
            g_leak: 0.3e-3,
            e_na: 50.0,
            e_k: -77.0,
            e_leak: -54.4,
            v_rest: -65.0,
            stimulus_amplitude: 0.2,
            pulse_duration: 0.2e-3,
            dt: 1.0e-6,
            total_time: 10.0e-3,
        }
    }
}

impl SimulationConfig {
    pub fn with_stimulus(mut self, amplitude: Current, pulse_duration: Time) -> Self {
        self.stimulus_amplitude = amplitude;
        self.pulse_duration = pulse_duration;
        self
    }

    pub fn with_amplitude(mut self, amplitude: Current) -> Self {
        self.stimulus_amplitude = amplitude;
        self
    }

    pub fn with_timing(mut self, dt: Time, total_time: Time) -> Self {
        self.dt = dt;
        self.total_time = total_time;
        self
    }

    pub fn with_conductances(mut self, g_na_max: Conductance, g_k_max: Conductance, g_leak: Conductance) -> Self {
        self.g_na_max = g_na_max;
        self.g_k_max = g_k_max;
        self.g_leak = g_leak;
        self
    }

    pub fn with_reversal_potentials(mut self, e_na: Voltage, e_k: Voltage, e_leak: Voltage) -> Self {
        self.e_na = e_na;
        self.e_k = e_k;
        self.e_leak = e_leak;
        self
    }

    /// Check the configuration before any simulation work.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("capacitance", self.capacitance),
            ("g_na_max", self.g_na_max),
            ("g_k_max", self.g_k_max),
            ("g_leak", self.g_leak),
            ("e_na", self.e_na),
            ("e_k", self.e_k),
            ("e_leak", self.e_leak),
            ("v_rest", self.v_rest),
            ("stimulus_amplitude", self.stimulus_amplitude),
            ("pulse_duration", self.pulse_duration),
            ("dt", self.dt),
            ("total_time", self.total_time),
        ];
        if let Some((name, value)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(HhError::Configuration(format!("{name} must be finite, got {value}")));
        }

        if self.dt <= 0.0 {
            return Err(HhError::Configuration(format!(
                "step size must be positive, got {}",
                self.dt
            )));
        }
        if self.total_time <= self.dt {
            return Err(HhError::Configuration(format!(
                "total time {} must exceed step size {}",
                self.total_time, self.dt
            )));
        }
        if self.pulse_duration < 0.0 {
            return Err(HhError::Configuration(format!(
                "pulse duration must not be negative, got {}",
                self.pulse_duration
            )));
        }
        if self.pulse_duration > self.total_time {
            return Err(HhError::Configuration(format!(
                "pulse duration {} exceeds total time {}",
                self.pulse_duration, self.total_time
            )));
        }
        if self.capacitance <= 0.0 {
            return Err(HhError::Configuration(format!(
                "capacitance must be positive, got {}",
                self.capacitance
            )));
        }
        if self.g_na_max < 0.0 || self.g_k_max < 0.0 || self.g_leak < 0.0 {
            return Err(HhError::Configuration("conductances must not be negative".to_string()));
        }

        let steps = (self.total_time / self.dt).round();
        if steps >= MAX_SAMPLES as f64 {
            return Err(HhError::Configuration(format!(
                "total time {} at step size {} needs {steps} steps, limit is {}",
                self.total_time,
                self.dt,
                MAX_SAMPLES - 1
            )));
        }

        Ok(())
    }

    /// Number of recorded samples, `round(total_time / dt) + 1`.
    ///
    /// Saturates instead of overflowing; [`validate`](Self::validate) rejects
    /// runs longer than [`MAX_SAMPLES`].
    pub fn sample_count(&self) -> usize {
        ((self.total_time / self.dt).round() as usize).saturating_add(1)
    }

    /// Number of whole steps the stimulus pulse lasts.
    pub fn pulse_steps(&self) -> usize {
        (self.pulse_duration / self.dt).round() as usize
    }

    /// Parse a (possibly partial) JSON configuration; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// =============================================================================
// RATE FUNCTIONS
// =============================================================================

/// Closed-form rate function of the displacement `Vp` (mV), in 1/ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// `a*(Vp+b) / (exp((Vp+b)/c) - 1)`, removable singularity at `Vp = -b`
    ExpLinear { a: f64, b: f64, c: f64 },
    /// `a*exp(Vp/c)`
    Exponential { a: f64, c: f64 },
    /// `a / (exp((Vp+b)/c) + 1)`
    Sigmoid { a: f64, b: f64, c: f64 },
}

impl RateFunction {
    /// Evaluate rate at given displacement
    pub fn eval(&self, vp: Voltage) -> f64 {
        match *self {
            Self::ExpLinear { a, b, c } => {
                let x = (vp + b) / c;
                if x == 0.0 {
                    // L'Hopital: a*(Vp+b)/(exp(x)-1) -> a*c
                    a * c
                } else {
                    a * (vp + b) / x.exp_m1()
                }
            }
            Self::Exponential { a, c } => a * (vp / c).exp(),
            Self::Sigmoid { a, b, c } => a / (((vp + b) / c).exp() + 1.0),
        }
    }
}

/// Classical squid-axon rate functions.
pub mod classical {
    use super::RateFunction;

    /// `0.1*(25-Vp)/(exp(0.1*(25-Vp))-1)`, tends to 1 at Vp = 25
    pub const ALPHA_M: RateFunction = RateFunction::ExpLinear { a: -0.1, b: -25.0, c: -10.0 };
    /// `4*exp(-Vp/18)`
    pub const BETA_M: RateFunction = RateFunction::Exponential { a: 4.0, c: -18.0 };
    /// `0.07*exp(-Vp/20)`
    pub const ALPHA_H: RateFunction = RateFunction::Exponential { a: 0.07, c: -20.0 };
    /// `1/(exp(0.1*(30-Vp))+1)`
    pub const BETA_H: RateFunction = RateFunction::Sigmoid { a: 1.0, b: -30.0, c: -10.0 };
    /// `0.01*(10-Vp)/(exp(0.1*(10-Vp))-1)`, tends to 0.1 at Vp = 10
    pub const ALPHA_N: RateFunction = RateFunction::ExpLinear { a: -0.01, b: -10.0, c: -10.0 };
    /// `0.125*exp(-Vp/80)`
    pub const BETA_N: RateFunction = RateFunction::Exponential { a: 0.125, c: -80.0 };
}

/// Forward and backward rate of one gate (1/ms).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateRates {
    pub alpha: f64,
    pub beta: f64,
}

impl GateRates {
    /// Equilibrium open fraction, `alpha / (alpha + beta)`
    pub fn steady_state(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// `dx/dt` in 1/ms
    pub fn derivative(&self, x: f64) -> f64 {
        self.alpha * (1.0 - x) - self.beta * x
    }
}

/// The six transfer rates at one displacement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateCoefficients {
    pub am: f64,
    pub bm: f64,
    pub ah: f64,
    pub bh: f64,
    pub an: f64,
    pub bn: f64,
}

impl RateCoefficients {
    /// Evaluate the classical rates at displacement `vp` from rest.
    ///
    /// Fails with [`HhError::NumericDomain`] if `vp` or any rate is not finite.
    pub fn at(vp: Voltage) -> Result<Self> {
        if !vp.is_finite() {
            return Err(HhError::NumericDomain {
                rate: "Vp",
                displacement: vp,
                step: None,
            });
        }

        let rates = Self {
            am: classical::ALPHA_M.eval(vp),
            bm: classical::BETA_M.eval(vp),
            ah: classical::ALPHA_H.eval(vp),
            bh: classical::BETA_H.eval(vp),
            an: classical::ALPHA_N.eval(vp),
            bn: classical::BETA_N.eval(vp),
        };

        for (name, value) in rates.named() {
            if !value.is_finite() {
                return Err(HhError::NumericDomain {
                    rate: name,
                    displacement: vp,
                    step: None,
                });
            }
        }

        Ok(rates)
    }

    pub fn m(&self) -> GateRates {
        GateRates { alpha: self.am, beta: self.bm }
    }

    pub fn h(&self) -> GateRates {
        GateRates { alpha: self.ah, beta: self.bh }
    }

    pub fn n(&self) -> GateRates {
        GateRates { alpha: self.an, beta: self.bn }
    }

    /// Rates paired with their conventional names, in `am, bm, ah, bh, an, bn` order.
    pub fn named(&self) -> [(&'static str, f64); 6] {
        [
            ("am", self.am),
            ("bm", self.bm),
            ("ah", self.ah),
            ("bh", self.bh),
            ("an", self.an),
            ("bn", self.bn),
        ]
    }
}

// =============================================================================
// TIME SERIES
// =============================================================================

/// One recorded variable over time, the unit handed to plotting or analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points (s)
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Time, f64)> + '_ {
        self.time.iter().copied().zip(self.values.iter().copied())
    }

    /// Largest value and the time it occurs at (first occurrence wins).
    pub fn peak(&self) -> Option<(Time, f64)> {
        self.iter()
            .fold(None, |best: Option<(Time, f64)>, (t, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((t, v)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sample_count(), 10_001);
        assert_eq!(config.pulse_steps(), 200);
    }

    #[test]
    fn test_sample_count_rounds() {
        let cases = [
            (10.0e-3, 1.0e-6, 10_001),
            (5.0e-3, 2.0e-5, 251),
            (1.0e-3, 3.0e-6, 334), // 333.33.. steps
            (1.0e-3, 1.0e-4, 11),
        ];
        for (total, dt, expected) in cases {
            let config = SimulationConfig::default().with_timing(dt, total).with_stimulus(0.2, 0.0);
            assert_eq!(config.sample_count(), expected, "total={total} dt={dt}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let bad_dt = SimulationConfig::default().with_timing(0.0, 10.0e-3);
        assert!(matches!(bad_dt.validate(), Err(HhError::Configuration(_))));

        let negative_dt = SimulationConfig::default().with_timing(-1.0e-6, 10.0e-3);
        assert!(matches!(negative_dt.validate(), Err(HhError::Configuration(_))));

        let short = SimulationConfig::default().with_timing(1.0e-3, 1.0e-3);
        assert!(matches!(short.validate(), Err(HhError::Configuration(_))));

        let long_pulse = SimulationConfig::default().with_stimulus(0.2, 20.0e-3);
        assert!(matches!(long_pulse.validate(), Err(HhError::Configuration(_))));

        let nan = SimulationConfig { v_rest: f64::NAN, ..Default::default() };
        assert!(matches!(nan.validate(), Err(HhError::Configuration(_))));

        let no_cap = SimulationConfig { capacitance: 0.0, ..Default::default() };
        assert!(no_cap.validate().is_err());

        let negative_pulse = SimulationConfig::default().with_stimulus(0.2, -1.0e-4);
        assert!(matches!(negative_pulse.validate(), Err(HhError::Configuration(_))));

        let negative_g = SimulationConfig::default().with_conductances(0.12, -0.036, 0.3e-3);
        assert!(matches!(negative_g.validate(), Err(HhError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_too_many_samples() {
        let tiny_step = SimulationConfig::default().with_timing(1.0e-300, 1.0).with_stimulus(0.2, 0.0);
        assert!(matches!(tiny_step.validate(), Err(HhError::Configuration(_))));
        assert_eq!(tiny_step.sample_count(), usize::MAX);

        let huge = SimulationConfig::default().with_timing(1.0e-12, 10.0e-3);
        assert!(matches!(huge.validate(), Err(HhError::Configuration(_))));

        let at_limit = SimulationConfig::default().with_timing(1.0, (MAX_SAMPLES - 1) as f64);
        at_limit.validate().unwrap();
        assert_eq!(at_limit.sample_count(), MAX_SAMPLES);

        let over_limit = SimulationConfig::default().with_timing(1.0, MAX_SAMPLES as f64);
        assert!(over_limit.validate().is_err());
    }

    #[test]
    fn test_pulse_equal_to_total_is_valid() {
        let config = SimulationConfig::default().with_stimulus(0.2, 10.0e-3);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_config() {
        let config = SimulationConfig::from_json_str(r#"{ "stimulus_amplitude": 0.0, "dt": 2e-6 }"#).unwrap();
        assert_eq!(config.stimulus_amplitude, 0.0);
        assert_eq!(config.dt, 2.0e-6);
        assert_eq!(config.v_rest, -65.0);

        let json = config.to_json_pretty().unwrap();
        let back = SimulationConfig::from_json_str(&json).unwrap();
        assert_eq!(back.v_rest, -65.0);
        assert_relative_eq!(back.e_leak, config.e_leak, max_relative = 1e-12);
        assert_relative_eq!(back.dt, config.dt, max_relative = 1e-12);

        assert!(matches!(
            SimulationConfig::from_json_str("{ not json"),
            Err(HhError::Serialization(_))
        ));
    }

    #[test]
    fn test_rate_singularities() {
        let at_am = RateCoefficients::at(25.0).unwrap();
        assert_eq!(at_am.am, 1.0);

        let at_an = RateCoefficients::at(10.0).unwrap();
        assert_eq!(at_an.an, 0.1);
    }

    #[test]
    fn test_rates_continuous_near_singularity() {
        let exact = RateCoefficients::at(25.0).unwrap().am;
        let near = RateCoefficients::at(25.0 + 1e-9).unwrap().am;
        assert_abs_diff_eq!(exact, near, epsilon = 1e-9);

        let exact = RateCoefficients::at(10.0).unwrap().an;
        let near = RateCoefficients::at(10.0 - 1e-9).unwrap().an;
        assert_abs_diff_eq!(exact, near, epsilon = 1e-10);
    }

    #[test]
    fn test_rates_at_rest() {
        let r = RateCoefficients::at(0.0).unwrap();
        assert_relative_eq!(r.am, 2.5 / (2.5f64.exp() - 1.0), max_relative = 1e-12);
        assert_relative_eq!(r.bm, 4.0, max_relative = 1e-12);
        assert_relative_eq!(r.ah, 0.07, max_relative = 1e-12);
        assert_relative_eq!(r.bh, 1.0 / (3.0f64.exp() + 1.0), max_relative = 1e-12);
        assert_relative_eq!(r.an, 0.1 / (1.0f64.exp() - 1.0), max_relative = 1e-12);
        assert_relative_eq!(r.bn, 0.125, max_relative = 1e-12);
    }

    #[test]
    fn test_rates_finite_and_non_negative() {
        let mut vp = -100.0;
        while vp <= 100.0 {
            let r = RateCoefficients::at(vp).unwrap();
            for (name, value) in r.named() {
                assert!(value.is_finite() && value >= 0.0, "{name} = {value} at Vp = {vp}");
            }
            vp += 0.25;
        }
    }

    #[test]
    fn test_rates_numeric_domain_error() {
        let err = RateCoefficients::at(-20_000.0).unwrap_err();
        assert!(matches!(err, HhError::NumericDomain { rate: "bm", .. }));

        let err = RateCoefficients::at(f64::NAN).unwrap_err().at_step(7);
        assert!(matches!(err, HhError::NumericDomain { step: Some(7), .. }));
        assert!(err.to_string().contains("step 7"));
    }

    #[test]
    fn test_gate_rates() {
        let g = GateRates { alpha: 1.0, beta: 3.0 };
        assert_eq!(g.steady_state(), 0.25);
        assert_abs_diff_eq!(g.derivative(g.steady_state()), 0.0, epsilon = 1e-15);
        assert_eq!(g.derivative(0.0), 1.0);
    }

    #[test]
    fn test_rate_time_scale() {
        // 1/ms to 1/s
        assert_eq!(RATE_TIME_SCALE * 1.0e-3, 1.0);
    }

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("voltage").with_units("mV");
        ts.push(0.0, -65.0);
        ts.push(0.1, 20.0);
        ts.push(0.2, 20.0);
        assert_eq!(ts.len(), 3);
        assert_eq!(ts.peak(), Some((0.1, 20.0)));
        assert_eq!(ts.units.as_deref(), Some("mV"));
        assert!(TimeSeries::new("empty").peak().is_none());
    }
}
