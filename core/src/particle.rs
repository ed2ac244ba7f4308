//! Particle-filter state estimation for the planar robot.
//!
//! The filter maintains a population of weighted state hypotheses
//! ([`Particle`]) interpreted as a Monte-Carlo approximation of the posterior.
//! Encoder telemetry drives the prediction step through the motion model,
//! sensor observations reweight the population through the measurement
//! models, and a degeneracy-triggered resampling step keeps the population
//! healthy. A zero-velocity update is available for intervals where the robot
//! is known to be stationary.
//!
//! The population is created once, at construction, by sampling the prior
//! Gaussian, and is then mutated in place for the filter's entire lifetime;
//! resampling replaces it with a weighted redraw from itself.
//!
//! Every operation takes `&mut self` and touches the whole population, so
//! there is no safe partial overlap between a predict pass and a correct
//! pass. Callers that drive the filter from more than one thread must put a
//! single mutual-exclusion boundary around the entire filter.

use std::fmt::{self, Debug, Display};

use log::warn;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::measurements::MeasurementModel;
use crate::{ChassisGeometry, EncoderData, RobotState, STATE_SIZE, forward, wrap_angle};

/// Default population size.
pub const DEFAULT_NUM_SAMPLES: usize = 1000;
/// Prior variance for every state component.
pub const PRIOR_VARIANCE: f64 = 1e-3;
/// Process noise variance for every state component, per second.
pub const PROCESS_NOISE_VARIANCE: f64 = 1e-3;
/// Resampling triggers when the effective sample size falls below this
/// fraction of the population.
pub const DEFAULT_RESAMPLE_FRACTION: f64 = 0.25;

/// One state hypothesis: a state vector paired with a scalar weight.
#[derive(Clone, Copy, Debug, Default)]
pub struct Particle {
    pub state: RobotState,
    pub weight: f64,
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.state.x)
            .field("y", &self.state.y)
            .field("yaw", &self.state.yaw)
            .field("vx", &self.state.vx)
            .field("vy", &self.state.vy)
            .field("yaw_rate", &self.state.yaw_rate)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Particle {
    pub fn new(state: RobotState, weight: f64) -> Particle {
        Particle { state, weight }
    }
}

impl From<(DVector<f64>, f64)> for Particle {
    fn from(tuple: (DVector<f64>, f64)) -> Self {
        let (state_vector, weight) = tuple;
        Particle::new(RobotState::from_vector(&state_vector), weight)
    }
}

/// Strategy for collapsing the population into a single state estimate.
#[derive(Clone, Copy, Debug, Default)]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// Strategy for redrawing the population during resampling.
///
/// All three schemes satisfy the same contract: the expected multiplicity of
/// each particle in the new population equals its normalized weight times the
/// population size, and the new weights are uniform. They differ in the
/// variance of the redraw.
#[derive(Clone, Copy, Debug, Default)]
pub enum ParticleResamplingStrategy {
    Multinomial,
    #[default]
    Systematic,
    Stratified,
}

impl ParticleResamplingStrategy {
    /// Draw a replacement population from a weighted one.
    ///
    /// Weights must already be normalized to sum to one.
    pub fn resample(&self, particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        match self {
            ParticleResamplingStrategy::Multinomial => Self::multinomial_resample(particles, rng),
            ParticleResamplingStrategy::Systematic => Self::systematic_resample(particles, rng),
            ParticleResamplingStrategy::Stratified => Self::stratified_resample(particles, rng),
        }
    }

    fn multinomial_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let n = particles.len();
        let positions: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
        Self::draw_at_positions(particles, &positions)
    }

    fn systematic_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let n = particles.len();
        let step = 1.0 / n as f64;
        let offset = rng.random::<f64>() * step;
        let positions: Vec<f64> = (0..n).map(|i| offset + i as f64 * step).collect();
        Self::draw_at_positions(particles, &positions)
    }

    fn stratified_resample(particles: &[Particle], rng: &mut StdRng) -> Vec<Particle> {
        let n = particles.len();
        let step = 1.0 / n as f64;
        let positions: Vec<f64> = (0..n)
            .map(|i| (i as f64 + rng.random::<f64>()) * step)
            .collect();
        Self::draw_at_positions(particles, &positions)
    }

    /// Map sorted positions in [0, 1) through the cumulative weight
    /// distribution. Multinomial positions arrive unsorted and are sorted
    /// here first.
    fn draw_at_positions(particles: &[Particle], positions: &[f64]) -> Vec<Particle> {
        let n = particles.len();
        let uniform = 1.0 / n as f64;
        let mut sorted = positions.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mut new_particles = Vec::with_capacity(n);
        let mut index = 0;
        let mut cumulative = particles[0].weight;
        for &position in &sorted {
            while position > cumulative && index < n - 1 {
                index += 1;
                cumulative += particles[index].weight;
            }
            let mut new_particle = particles[index];
            new_particle.weight = uniform;
            new_particles.push(new_particle);
        }
        new_particles
    }
}

/// Bootstrap particle filter over the planar robot state.
///
/// Owns its motion and estimation configuration directly: process noise,
/// chassis geometry, resampling trigger and scheme, and the random number
/// generator used for both prior sampling and prediction noise. The
/// measurement models live with the caller and are passed into
/// [`ParticleFilter::update`] per correction.
#[derive(Clone)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    /// Per-component process noise standard deviations, scaled by sqrt(dt)
    /// at prediction time
    pub process_noise: DVector<f64>,
    pub geometry: ChassisGeometry,
    pub averaging_strategy: ParticleAveragingStrategy,
    pub resampling_strategy: ParticleResamplingStrategy,
    /// Resample when the effective sample size drops below this fraction of
    /// the population
    pub resample_fraction: f64,
    rng: StdRng,
}

impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.get_estimate();
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field(
                "mean_pose",
                &format_args!(
                    "({:.3} m, {:.3} m, {:.2} deg)",
                    mean[0],
                    mean[1],
                    mean[2].to_degrees()
                ),
            )
            .field(
                "mean_velocity",
                &format_args!("({:.3}, {:.3}) m/s", mean[3], mean[4]),
            )
            .finish()
    }
}

impl ParticleFilter {
    /// Create a filter with a population sampled from the prior Gaussian.
    ///
    /// The prior is zero-mean with independent variance [`PRIOR_VARIANCE`]
    /// for each of the nine components. The RNG is seeded from entropy; use
    /// [`ParticleFilter::new_with_seed`] for reproducible runs.
    ///
    /// # Arguments
    /// * `num_samples` - Population size, fixed for the filter's lifetime.
    /// * `geometry` - Drive base layout used by the motion model.
    pub fn new(num_samples: usize, geometry: ChassisGeometry) -> Self {
        Self::new_with_seed(num_samples, geometry, rand::random())
    }

    /// Create a filter with a deterministic random seed.
    ///
    /// # Panics
    /// Panics if `num_samples` is zero.
    pub fn new_with_seed(num_samples: usize, geometry: ChassisGeometry, seed: u64) -> Self {
        assert!(num_samples > 0, "Number of particles must be positive");
        let mut rng = StdRng::seed_from_u64(seed);
        let prior = Normal::new(0.0, PRIOR_VARIANCE.sqrt()).unwrap();
        let uniform = 1.0 / num_samples as f64;

        let particles = (0..num_samples)
            .map(|_| {
                let state_vector =
                    DVector::from_fn(STATE_SIZE, |_, _| prior.sample(&mut rng));
                Particle::from((state_vector, uniform))
            })
            .collect();

        ParticleFilter {
            particles,
            process_noise: DVector::from_element(STATE_SIZE, PROCESS_NOISE_VARIANCE.sqrt()),
            geometry,
            averaging_strategy: ParticleAveragingStrategy::default(),
            resampling_strategy: ParticleResamplingStrategy::default(),
            resample_fraction: DEFAULT_RESAMPLE_FRACTION,
            rng,
        }
    }

    /// Number of particles in the population
    pub fn num_samples(&self) -> usize {
        self.particles.len()
    }

    /// Read-only access to the population
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Overwrite the population weights.
    ///
    /// # Panics
    /// Panics if the slice length does not match the population size.
    pub fn set_weights(&mut self, weights: &[f64]) {
        assert_eq!(weights.len(), self.particles.len());
        for (particle, &weight) in self.particles.iter_mut().zip(weights.iter()) {
            particle.weight = weight;
        }
    }

    /// Advance every particle through the motion model with an independent
    /// process-noise draw.
    ///
    /// Weights are unaffected by prediction. Call once per telemetry cycle
    /// with the freshest encoder reading; on a telemetry timeout the caller
    /// predicts with the previous control (the drive base cannot change speed
    /// instantaneously, so coasting on the last reading beats freezing the
    /// population).
    ///
    /// # Arguments
    /// * `control` - Encoder rates for this cycle.
    /// * `dt` - Time step in seconds, must be strictly positive.
    pub fn predict(&mut self, control: &EncoderData, dt: f64) {
        assert!(dt > 0.0, "Time step must be positive");
        let dt_sqrt = dt.sqrt();
        let noise: Vec<Normal<f64>> = self
            .process_noise
            .iter()
            .map(|&std| Normal::new(0.0, std).unwrap())
            .collect();
        for particle in &mut self.particles {
            forward(&mut particle.state, control, &self.geometry, dt);
            particle.state.x += noise[0].sample(&mut self.rng) * dt_sqrt;
            particle.state.y += noise[1].sample(&mut self.rng) * dt_sqrt;
            particle.state.yaw =
                wrap_angle(particle.state.yaw + noise[2].sample(&mut self.rng) * dt_sqrt);
            particle.state.vx += noise[3].sample(&mut self.rng) * dt_sqrt;
            particle.state.vy += noise[4].sample(&mut self.rng) * dt_sqrt;
            particle.state.yaw_rate += noise[5].sample(&mut self.rng) * dt_sqrt;
            particle.state.ax += noise[6].sample(&mut self.rng) * dt_sqrt;
            particle.state.ay += noise[7].sample(&mut self.rng) * dt_sqrt;
            particle.state.yaw_accel += noise[8].sample(&mut self.rng) * dt_sqrt;
        }
    }

    /// Reweight the population by the likelihood of an observation.
    ///
    /// Each particle's weight is multiplied by the Gaussian likelihood of the
    /// observed value under the variant's observation model, then the weights
    /// are renormalized. A non-finite observation is skipped entirely rather
    /// than poisoning the population; a weight collapse falls back to uniform
    /// weights inside the renormalization.
    ///
    /// Multiple sensor variants may correct the same population in any
    /// arrival order.
    pub fn update<M: MeasurementModel + ?Sized>(&mut self, measurement: &M) {
        let observed = measurement.get_vector();
        if !observed.iter().all(|value| value.is_finite()) {
            warn!("skipping correction: non-finite observation {:?}", observed);
            return;
        }
        let noise = measurement.get_noise();
        for particle in &mut self.particles {
            let innovation = measurement.innovation(&particle.state.to_vector());
            // Diagonal covariance, so the likelihood is a product of 1-D
            // Gaussians evaluated in log space
            let mut log_likelihood = 0.0;
            for i in 0..innovation.len() {
                let variance = noise[(i, i)];
                if variance > 0.0 {
                    let normalized = innovation[i] / variance.sqrt();
                    log_likelihood += -0.5 * normalized.powi(2)
                        - 0.5 * variance.ln()
                        - 0.5 * (2.0 * std::f64::consts::PI).ln();
                }
            }
            particle.weight *= log_likelihood.exp();
        }
        self.normalize_weights();
    }

    /// Normalize weights to sum to one, falling back to uniform weights when
    /// the sum is zero or non-finite.
    pub fn normalize_weights(&mut self) {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else {
            warn!("particle weights collapsed, resetting to uniform");
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
        }
    }

    /// Effective sample size of the current weighting: `1 / sum(w_i^2)`.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Resample when the effective sample size has fallen below the trigger
    /// fraction of the population. Returns true if resampling ran.
    pub fn resample_if_needed(&mut self) -> bool {
        let threshold = self.resample_fraction * self.particles.len() as f64;
        if self.effective_sample_size() < threshold {
            self.resample();
            true
        } else {
            false
        }
    }

    /// Replace the population with a weighted redraw from itself and reset
    /// all weights to uniform.
    pub fn resample(&mut self) {
        self.normalize_weights();
        self.particles = self
            .resampling_strategy
            .resample(&self.particles, &mut self.rng);
    }

    /// Force the motion-derived state components of every particle to zero.
    ///
    /// Applied when the robot is known (by the caller's logic) to be
    /// stationary, to stop integrator and sensor drift accumulating in the
    /// velocity terms during idle periods. The acceleration components are
    /// zeroed as well: in a stationary frame they can only hold bias.
    /// Positions, headings, and weights are untouched. Mutates the live
    /// population in place and is idempotent.
    pub fn zero_velocity_update(&mut self) {
        for particle in &mut self.particles {
            particle.state.vx = 0.0;
            particle.state.vy = 0.0;
            particle.state.yaw_rate = 0.0;
            particle.state.ax = 0.0;
            particle.state.ay = 0.0;
            particle.state.yaw_accel = 0.0;
        }
    }

    /// Collapse the population into a single state estimate using the
    /// configured averaging strategy.
    pub fn get_estimate(&self) -> DVector<f64> {
        match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => self.weighted_average().0,
            ParticleAveragingStrategy::UnweightedAverage => self.unweighted_average().0,
            ParticleAveragingStrategy::HighestWeight => self.highest_weight().0,
        }
    }

    /// Covariance of the population about the configured estimate.
    pub fn get_certainty(&self) -> DMatrix<f64> {
        match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => self.weighted_average().1,
            ParticleAveragingStrategy::UnweightedAverage => self.unweighted_average().1,
            ParticleAveragingStrategy::HighestWeight => self.highest_weight().1,
        }
    }

    fn weighted_average(&self) -> (DVector<f64>, DMatrix<f64>) {
        let mut mean = DVector::<f64>::zeros(STATE_SIZE);
        for particle in &self.particles {
            mean += particle.weight * particle.state.to_vector();
        }
        let mut covariance = DMatrix::<f64>::zeros(STATE_SIZE, STATE_SIZE);
        for particle in &self.particles {
            let diff = particle.state.to_vector() - &mean;
            covariance += particle.weight * &diff * diff.transpose();
        }
        (mean, covariance)
    }

    fn unweighted_average(&self) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.particles.len() as f64;
        let mut mean = DVector::<f64>::zeros(STATE_SIZE);
        for particle in &self.particles {
            mean += particle.state.to_vector() / n;
        }
        let mut covariance = DMatrix::<f64>::zeros(STATE_SIZE, STATE_SIZE);
        for particle in &self.particles {
            let diff = particle.state.to_vector() - &mean;
            covariance += (1.0 / n) * &diff * diff.transpose();
        }
        (mean, covariance)
    }

    fn highest_weight(&self) -> (DVector<f64>, DMatrix<f64>) {
        let best = self
            .particles
            .iter()
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap())
            .expect("Particle filter has no particles");
        (
            best.state.to_vector(),
            DMatrix::<f64>::zeros(STATE_SIZE, STATE_SIZE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{BeaconPositionMeasurement, CameraPoseMeasurement, YawMeasurement};
    use assert_approx_eq::assert_approx_eq;

    fn test_filter(num_samples: usize) -> ParticleFilter {
        ParticleFilter::new_with_seed(num_samples, ChassisGeometry::default(), 42)
    }

    #[test]
    fn test_prior_sampling_statistics() {
        let filter = test_filter(2000);
        let mean = filter.get_estimate();
        let covariance = filter.get_certainty();
        for i in 0..STATE_SIZE {
            assert!(
                mean[i].abs() < 5e-3,
                "prior mean component {} too far from zero: {}",
                i,
                mean[i]
            );
            assert!(
                (covariance[(i, i)] - PRIOR_VARIANCE).abs() < 2e-4,
                "prior variance component {} off: {}",
                i,
                covariance[(i, i)]
            );
        }
    }

    #[test]
    fn test_initial_weights_uniform() {
        let filter = test_filter(100);
        for particle in filter.particles() {
            assert_approx_eq!(particle.weight, 0.01, 1e-12);
        }
        assert_approx_eq!(filter.effective_sample_size(), 100.0, 1e-6);
    }

    #[test]
    fn test_predict_moves_population() {
        let mut filter = test_filter(500);
        let control = EncoderData::new_from_rates(1.0, 1.0);
        for _ in 0..10 {
            filter.predict(&control, 0.1);
        }
        let mean = filter.get_estimate();
        // Roughly one second at one m/s; the first cycle still carries the
        // near-zero prior velocity, so allow generous slack
        assert!(mean[0] > 0.5, "mean x did not advance: {}", mean[0]);
        assert_approx_eq!(mean[3], 1.0, 0.05);
    }

    #[test]
    fn test_predict_leaves_weights_untouched() {
        let mut filter = test_filter(100);
        let weights: Vec<f64> = filter.particles().iter().map(|p| p.weight).collect();
        filter.predict(&EncoderData::new_from_rates(0.5, 0.5), 0.05);
        for (particle, expected) in filter.particles().iter().zip(weights) {
            assert_approx_eq!(particle.weight, expected, 1e-15);
        }
    }

    #[test]
    fn test_correction_favors_matching_particle() {
        let mut filter = test_filter(2);
        let mut matching = RobotState::new();
        matching.x = 1.0;
        matching.y = 2.0;
        let mut distant = RobotState::new();
        distant.x = -3.0;
        distant.y = 5.0;
        filter.particles = vec![Particle::new(matching, 0.5), Particle::new(distant, 0.5)];

        let observation = BeaconPositionMeasurement {
            x: 1.0,
            y: 2.0,
            ..Default::default()
        };
        filter.update(&observation);

        let weights: Vec<f64> = filter.particles().iter().map(|p| p.weight).collect();
        assert!(weights[0] > weights[1]);
        assert_approx_eq!(weights.iter().sum::<f64>(), 1.0, 1e-12);
    }

    #[test]
    fn test_correction_skips_non_finite_observation() {
        let mut filter = test_filter(50);
        let weights: Vec<f64> = filter.particles().iter().map(|p| p.weight).collect();
        let observation = YawMeasurement {
            yaw: f64::NAN,
            ..Default::default()
        };
        filter.update(&observation);
        for (particle, expected) in filter.particles().iter().zip(weights) {
            assert_approx_eq!(particle.weight, expected, 1e-15);
        }
    }

    #[test]
    fn test_weight_collapse_falls_back_to_uniform() {
        let mut filter = test_filter(10);
        filter.set_weights(&[0.0; 10]);
        filter.normalize_weights();
        for particle in filter.particles() {
            assert_approx_eq!(particle.weight, 0.1, 1e-12);
        }
    }

    #[test]
    fn test_implausible_observation_recovers() {
        let mut filter = test_filter(100);
        // Kilometers away from every particle under a 1e-4 variance: every
        // likelihood underflows to zero
        let observation = CameraPoseMeasurement {
            x: 5000.0,
            y: -5000.0,
            yaw: 0.0,
            ..Default::default()
        };
        filter.update(&observation);
        let sum: f64 = filter.particles().iter().map(|p| p.weight).sum();
        assert_approx_eq!(sum, 1.0, 1e-9);
        assert!(filter.particles().iter().all(|p| p.weight.is_finite()));
    }

    #[test]
    fn test_zero_velocity_update_is_idempotent() {
        let mut filter = test_filter(200);
        filter.predict(&EncoderData::new_from_rates(1.2, 0.8), 0.1);
        filter.zero_velocity_update();
        for particle in filter.particles() {
            assert_eq!(particle.state.vx, 0.0);
            assert_eq!(particle.state.vy, 0.0);
            assert_eq!(particle.state.yaw_rate, 0.0);
            assert_eq!(particle.state.ax, 0.0);
            assert_eq!(particle.state.ay, 0.0);
            assert_eq!(particle.state.yaw_accel, 0.0);
        }

        let before: Vec<Particle> = filter.particles().to_vec();
        filter.zero_velocity_update();
        for (after, expected) in filter.particles().iter().zip(before) {
            // Bitwise identical: the second application must be a no-op
            assert_eq!(after.state, expected.state);
            assert_eq!(after.weight, expected.weight);
        }
    }

    #[test]
    fn test_resample_resets_weights_and_preserves_mean() {
        for strategy in [
            ParticleResamplingStrategy::Multinomial,
            ParticleResamplingStrategy::Systematic,
            ParticleResamplingStrategy::Stratified,
        ] {
            let mut filter = test_filter(2000);
            filter.resampling_strategy = strategy;
            filter.predict(&EncoderData::new_from_rates(1.0, 0.6), 0.1);
            let observation = BeaconPositionMeasurement {
                x: 0.05,
                y: 0.02,
                variance: 0.01,
            };
            filter.update(&observation);

            let mean_before = filter.get_estimate();
            filter.resample();
            let mean_after = filter.get_estimate();

            let uniform = 1.0 / 2000.0;
            for particle in filter.particles() {
                assert_approx_eq!(particle.weight, uniform, 1e-12);
            }
            for i in 0..3 {
                assert!(
                    (mean_after[i] - mean_before[i]).abs() < 5e-3,
                    "{:?}: mean component {} drifted from {} to {}",
                    strategy,
                    i,
                    mean_before[i],
                    mean_after[i]
                );
            }
        }
    }

    #[test]
    fn test_resample_trigger_threshold() {
        let mut filter = test_filter(100);
        // Uniform weights: effective sample size equals the population size
        assert!(!filter.resample_if_needed());

        // Concentrate nearly all weight on a single particle to force the
        // effective sample size below a quarter of the population
        let mut weights = vec![1e-6; 100];
        weights[0] = 1.0;
        filter.set_weights(&weights);
        filter.normalize_weights();
        assert!(filter.effective_sample_size() < 25.0);
        assert!(filter.resample_if_needed());
        assert_approx_eq!(filter.effective_sample_size(), 100.0, 1e-6);
    }

    #[test]
    fn test_seeded_filters_are_deterministic() {
        let mut a = test_filter(100);
        let mut b = test_filter(100);
        let control = EncoderData::new_from_rates(0.8, 1.0);
        a.predict(&control, 0.1);
        b.predict(&control, 0.1);
        for (pa, pb) in a.particles().iter().zip(b.particles()) {
            assert_eq!(pa.state, pb.state);
        }
    }
}
