//! # HH-SIM
//!
//! Fixed-step simulation of a Hodgkin-Huxley membrane patch.
//!
//! ## Pipeline
//!
//! 1. **Stimulus**: a single rectangular current pulse starting at t = 0
//! 2. **Initial state**: resting potential with every gate at its steady state
//! 3. **Integration**: explicit forward Euler, one step per sample
//! 4. **Recording**: a [`Trace`] of N = round(T/dt) + 1 states plus the time axis
//!
//! Each state depends only on its predecessor, so a run is strictly
//! sequential. [`Simulation::steps`] exposes the recurrence as an iterator
//! that can be abandoned between steps; [`Simulation::run`] drives it to
//! completion and either returns the whole trace or the first error.
//!
//! Gating variables are never clamped to [0, 1]. Excursions can be flagged
//! with [`Simulation::flag_gate_excursions`], which records the affected
//! indices without touching the values.

use hh_core::{
    Conductance, Current, HhError, RateCoefficients, Result, SimulationConfig, Time, TimeSeries,
    Voltage, RATE_TIME_SCALE,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use tracing::{debug, warn};

// =============================================================================
// STIMULUS
// =============================================================================

/// Injected current per sample index (mA/cm^2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusSeries {
    values: Vec<Current>,
}

impl StimulusSeries {
    /// Rectangular pulse starting at t = 0: `stimulus_amplitude` for the first
    /// `round(pulse_duration / dt)` samples, zero elsewhere.
    ///
    /// The pulse length is rounded to whole steps, so a fractional remainder
    /// below half a step is dropped (2.4 steps gives 2 active samples). A pulse
    /// shorter than half a step yields an all-zero series.
    pub fn rectangular(config: &SimulationConfig) -> Self {
        let n = config.sample_count();
        let on = config.pulse_steps().min(n);
        let mut values = vec![0.0; n];
        values[..on].fill(config.stimulus_amplitude);
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<Current> {
        self.values.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[Current] {
        &self.values
    }

    /// Number of samples carrying a nonzero current.
    pub fn active_samples(&self) -> usize {
        self.values.iter().filter(|&&i| i != 0.0).count()
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Membrane state at one sample index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Membrane potential (mV)
    pub v: Voltage,
    /// Sodium activation
    pub m: f64,
    /// Sodium inactivation
    pub h: f64,
    /// Potassium activation
    pub n: f64,
    /// Sodium conductance (S/cm^2)
    pub g_na: Conductance,
    /// Potassium conductance (S/cm^2)
    pub g_k: Conductance,
}

impl State {
    /// Build a state from voltage and gates, deriving both conductances.
    pub fn from_gates(config: &SimulationConfig, v: Voltage, m: f64, h: f64, n: f64) -> Self {
        Self {
            v,
            m,
            h,
            n,
            g_na: config.g_na_max * m.powi(3) * h,
            g_k: config.g_k_max * n.powi(4),
        }
    }

    /// Resting state: `v_rest` with every gate at `alpha / (alpha + beta)`
    /// evaluated at zero displacement.
    pub fn resting(config: &SimulationConfig) -> Result<Self> {
        let rates = RateCoefficients::at(0.0)?;
        Ok(Self::from_gates(
            config,
            config.v_rest,
            rates.m().steady_state(),
            rates.h().steady_state(),
            rates.n().steady_state(),
        ))
    }

    /// All three gates inside [0, 1].
    pub fn gates_in_bounds(&self) -> bool {
        [self.m, self.h, self.n].iter().all(|x| (0.0..=1.0).contains(x))
    }
}

// =============================================================================
// INTEGRATOR
// =============================================================================

/// Advance `previous` by one forward Euler step of `config.dt`.
///
/// The voltage update uses the previous conductances; the gates use rates
/// evaluated at the previous voltage. Gate derivatives are in 1/ms and are
/// scaled by [`RATE_TIME_SCALE`] since `dt` is in seconds.
pub fn euler_step(config: &SimulationConfig, previous: &State, stimulus: Current) -> Result<State> {
    let dt = config.dt;
    let v = previous.v;

    let dv_dt = (stimulus
        - previous.g_na * (v - config.e_na)
        - previous.g_k * (v - config.e_k)
        - config.g_leak * (v - config.e_leak))
        / config.capacitance;
    let v_next = v + dt * dv_dt;

    let vp = v - config.v_rest;
    if !v_next.is_finite() {
        return Err(HhError::NumericDomain {
            rate: "dV/dt",
            displacement: vp,
            step: None,
        });
    }

    let rates = RateCoefficients::at(vp)?;
    let m = previous.m + dt * rates.m().derivative(previous.m) * RATE_TIME_SCALE;
    let h = previous.h + dt * rates.h().derivative(previous.h) * RATE_TIME_SCALE;
    let n = previous.n + dt * rates.n().derivative(previous.n) * RATE_TIME_SCALE;

    Ok(State::from_gates(config, v_next, m, h, n))
}

// =============================================================================
// SIMULATION
// =============================================================================

/// One validated simulation run.
#[derive(Debug, Clone)]
pub struct Simulation {
    config: SimulationConfig,
    stimulus: StimulusSeries,
    flag_gates: bool,
}

impl Simulation {
    /// Validate the configuration and build the stimulus.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let stimulus = StimulusSeries::rectangular(&config);
        Ok(Self {
            config,
            stimulus,
            flag_gates: false,
        })
    }

    /// Record indices where a gate leaves [0, 1]. Values are never altered.
    pub fn flag_gate_excursions(mut self, enabled: bool) -> Self {
        self.flag_gates = enabled;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn stimulus(&self) -> &StimulusSeries {
        &self.stimulus
    }

    /// Number of states a full run produces.
    pub fn len(&self) -> usize {
        self.stimulus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimulus.is_empty()
    }

    /// Lazily produce states 0..N. Dropping the iterator stops the run.
    pub fn steps(&self) -> Steps<'_> {
        Steps {
            simulation: self,
            index: 0,
            previous: None,
            failed: false,
        }
    }

    /// Run all N-1 steps. No partial trace is returned on error.
    pub fn run(&self) -> Result<Trace> {
        self.run_with(|_, _| {})
    }

    /// Like [`Simulation::run`], calling `observe` with every produced state.
    pub fn run_with<F>(&self, mut observe: F) -> Result<Trace>
    where
        F: FnMut(usize, &State),
    {
        let n = self.len();
        debug!(
            samples = n,
            dt = self.config.dt,
            pulse_samples = self.stimulus.active_samples(),
            "starting simulation"
        );

        let mut states = Vec::with_capacity(n);
        let mut gate_excursions = Vec::new();
        for (index, state) in self.steps().enumerate() {
            let state = state?;
            if self.flag_gates && !state.gates_in_bounds() {
                if gate_excursions.is_empty() {
                    warn!(index, m = state.m, h = state.h, n = state.n, "gating variable outside [0, 1]");
                }
                gate_excursions.push(index);
            }
            observe(index, &state);
            states.push(state);
        }

        let trace = Trace {
            config: self.config,
            states,
            stimulus: self.stimulus.as_slice().to_vec(),
            gate_excursions,
        };

        if let Some((t, v)) = trace.peak() {
            debug!(peak_mv = v, peak_ms = t * 1.0e3, excursions = trace.gate_excursions.len(), "simulation complete");
        }

        Ok(trace)
    }
}

/// Iterator over the states of a run, see [`Simulation::steps`].
///
/// Yields `Err` at most once, then ends.
#[derive(Debug)]
pub struct Steps<'a> {
    simulation: &'a Simulation,
    index: usize,
    previous: Option<State>,
    failed: bool,
}

impl Iterator for Steps<'_> {
    type Item = Result<State>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.simulation.len() {
            return None;
        }

        let config = &self.simulation.config;
        let next = match self.previous {
            None => State::resting(config),
            Some(previous) => {
                // state i+1 is driven by the stimulus sample at i
                let stimulus = self.simulation.stimulus.values[self.index - 1];
                euler_step(config, &previous, stimulus).map_err(|e| e.at_step(self.index))
            }
        };

        match next {
            Ok(state) => {
                self.previous = Some(state);
                self.index += 1;
                Some(Ok(state))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let remaining = self.simulation.len() - self.index;
        (0, Some(remaining))
    }
}

impl FusedIterator for Steps<'_> {}

// =============================================================================
// TRACE
// =============================================================================

/// Recorded variable of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variable {
    Voltage,
    M,
    H,
    N,
    GNa,
    GK,
    Stimulus,
}

impl Variable {
    pub const ALL: [Variable; 7] = [
        Variable::Voltage,
        Variable::M,
        Variable::H,
        Variable::N,
        Variable::GNa,
        Variable::GK,
        Variable::Stimulus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Voltage => "Vm",
            Self::M => "m",
            Self::H => "h",
            Self::N => "n",
            Self::GNa => "gNa",
            Self::GK => "gK",
            Self::Stimulus => "Istim",
        }
    }

    pub fn units(&self) -> Option<&'static str> {
        match self {
            Self::Voltage => Some("mV"),
            Self::GNa | Self::GK => Some("S/cm^2"),
            Self::Stimulus => Some("mA/cm^2"),
            Self::M | Self::H | Self::N => None,
        }
    }
}

/// One row of a trace, flattened for tabular export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time_ms: f64,
    pub voltage: Voltage,
    pub m: f64,
    pub h: f64,
    pub n: f64,
    pub g_na: Conductance,
    pub g_k: Conductance,
    pub stimulus: Current,
}

/// Complete output of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Configuration the trace was produced with
    pub config: SimulationConfig,
    /// One state per sample index
    pub states: Vec<State>,
    /// Stimulus per sample index
    pub stimulus: Vec<Current>,
    /// Indices with a gate outside [0, 1] (only when flagging was enabled)
    pub gate_excursions: Vec<usize>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Time of sample `index` (s)
    pub fn time(&self, index: usize) -> Time {
        index as f64 * self.config.dt
    }

    /// Time axis (s)
    pub fn time_axis(&self) -> Vec<Time> {
        (0..self.len()).map(|i| self.time(i)).collect()
    }

    /// Time axis in milliseconds, for presentation
    pub fn time_axis_ms(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.time(i) * 1.0e3).collect()
    }

    fn value(&self, index: usize, variable: Variable) -> f64 {
        let s = &self.states[index];
        match variable {
            Variable::Voltage => s.v,
            Variable::M => s.m,
            Variable::H => s.h,
            Variable::N => s.n,
            Variable::GNa => s.g_na,
            Variable::GK => s.g_k,
            Variable::Stimulus => self.stimulus[index],
        }
    }

    /// Extract one variable as a named time series.
    pub fn channel(&self, variable: Variable) -> TimeSeries {
        let mut series = TimeSeries::new(variable.name());
        if let Some(units) = variable.units() {
            series = series.with_units(units);
        }
        series.time.reserve(self.len());
        series.values.reserve(self.len());
        for i in 0..self.len() {
            series.push(self.time(i), self.value(i, variable));
        }
        series
    }

    /// N x 4 matrix with columns V, m, h, n.
    pub fn to_array(&self) -> Array2<f64> {
        const COLUMNS: [Variable; 4] = [Variable::Voltage, Variable::M, Variable::H, Variable::N];
        Array2::from_shape_fn((self.len(), COLUMNS.len()), |(i, j)| self.value(i, COLUMNS[j]))
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.states.iter().enumerate().map(|(i, s)| Sample {
            time_ms: self.time(i) * 1.0e3,
            voltage: s.v,
            m: s.m,
            h: s.h,
            n: s.n,
            g_na: s.g_na,
            g_k: s.g_k,
            stimulus: self.stimulus[i],
        })
    }

    /// Peak voltage and its time (s)
    pub fn peak(&self) -> Option<(Time, Voltage)> {
        self.peak_index().map(|i| (self.time(i), self.states[i].v))
    }

    fn peak_index(&self) -> Option<usize> {
        self.states
            .iter()
            .enumerate()
            .fold(None, |best: Option<usize>, (i, s)| match best {
                Some(b) if self.states[b].v >= s.v => best,
                _ => Some(i),
            })
    }

    /// Times (s) at which the voltage crosses `threshold` going upward.
    pub fn spike_times(&self, threshold: Voltage) -> Vec<Time> {
        self.states
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0].v < threshold && w[1].v >= threshold)
            .map(|(i, _)| self.time(i + 1))
            .collect()
    }

    /// First time (s) after the voltage peak at which the membrane is back
    /// within `tolerance` mV of rest.
    pub fn return_to_rest(&self, tolerance: Voltage) -> Option<Time> {
        let peak = self.peak_index()?;
        let v_rest = self.config.v_rest;
        self.states[peak..]
            .iter()
            .position(|s| (s.v - v_rest).abs() <= tolerance)
            .map(|offset| self.time(peak + offset))
    }

    /// Largest absolute deviation from rest over the whole trace (mV).
    pub fn max_deviation_from_rest(&self) -> Voltage {
        let v_rest = self.config.v_rest;
        self.states.iter().map(|s| (s.v - v_rest).abs()).fold(0.0, f64::max)
    }
}

// =============================================================================
// TESTS
// =============================================================================
