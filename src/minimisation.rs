use argmin::core::{Executor, Jacobian, Operator, State, TerminationReason};
use argmin::solver::gaussnewton::GaussNewton;
use nalgebra::{DMatrix, DVector};

use crate::current::{CurrentParams, ResistorNetwork};

/// Seeds sitting on a bound are moved this far (in scaled units) into the feasible region, where
/// the bound transform still has a non-zero derivative
const BOUNDARY_NUDGE: f64 = 1e-3;

/// Step sizes tried in turn; the damped step rescues partitions where the full step overshoots
const STEP_SIZES: [f64; 2] = [1.0, 0.5];

/// Least-squares problem for the current model over `(m, b, Voff, RI)`
///
/// The optimiser never sees the physical parameters directly. They span roughly ten orders of
/// magnitude (`m` in amp per count, `RI` in ohm), so each is divided by a characteristic scale
/// before being handed to the solver. The one-sided bounds `m >= 0` and `RI >= 0` are imposed by
/// the transform
/// $$
///     u = \sqrt{q^2 + 1} - 1
/// $$
/// between the unconstrained solver variable $q$ and the scaled physical value $u \geq 0$.
/// `b` and `Voff` are only scaled.
///
/// Residuals are `(predicted - measured) / current_scale`, so the solver tolerance is relative to
/// the typical current in the partition.
#[derive(Clone)]
pub(crate) struct Problem {
    adc: DVector<f64>,
    /// Probe resistor plus the fixed series resistance of the network
    load: DVector<f64>,
    current: DVector<f64>,
    scale: Scale,
}

#[derive(Clone, Copy, Debug)]
struct Scale {
    m: f64,
    b: f64,
    v_off: f64,
    r_i: f64,
    current: f64,
}

/// Result of a converged minimisation
#[derive(Clone, Copy, Debug)]
pub(crate) struct Solution {
    pub(crate) params: CurrentParams,
    pub(crate) iterations: u64,
}

fn bounded(q: f64) -> f64 {
    q.hypot(1.0) - 1.0
}

fn bounded_derivative(q: f64) -> f64 {
    q / q.hypot(1.0)
}

fn unbounded(u: f64) -> f64 {
    let u = u.max(BOUNDARY_NUDGE);
    ((u + 1.0).powi(2) - 1.0).sqrt()
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &DVector<f64>) -> f64 {
    values.sum() / values.len() as f64
}

impl Problem {
    /// Set up the problem for samples `(adc, resistor_value, input_current)`.
    ///
    /// Returns `None` when the currents are all zero, leaving no scale to fit against.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn build(
        adc: &[f64],
        resistor_value: &[f64],
        input_current: &[f64],
        network: &ResistorNetwork,
        seed: &CurrentParams,
    ) -> Option<Self> {
        debug_assert_eq!(adc.len(), resistor_value.len());
        debug_assert_eq!(adc.len(), input_current.len());

        let adc = DVector::from_column_slice(adc);
        let load = DVector::from_iterator(
            resistor_value.len(),
            resistor_value.iter().map(|r| network.load(*r)),
        );
        let current = DVector::from_column_slice(input_current);

        let current_scale = current.norm() / (current.len() as f64).sqrt();
        let adc_scale = adc.norm() / (adc.len() as f64).sqrt();
        let load_scale = mean(&load);
        if !(current_scale > 0.0 && adc_scale > 0.0 && load_scale > 0.0) {
            return None;
        }

        let m = if seed.m > 0.0 {
            seed.m
        } else {
            current_scale / adc_scale
        };
        let r_i = if seed.r_i > 0.0 { seed.r_i } else { load_scale };

        Some(Self {
            adc,
            load,
            current,
            scale: Scale {
                m,
                b: current_scale,
                v_off: current_scale * load_scale,
                r_i,
                current: current_scale,
            },
        })
    }

    fn to_internal(&self, params: &CurrentParams) -> DVector<f64> {
        DVector::from_vec(vec![
            unbounded(params.m / self.scale.m),
            params.b / self.scale.b,
            params.v_off / self.scale.v_off,
            unbounded(params.r_i / self.scale.r_i),
        ])
    }

    fn to_physical(&self, q: &DVector<f64>) -> CurrentParams {
        CurrentParams {
            m: self.scale.m * bounded(q[0]),
            b: self.scale.b * q[1],
            v_off: self.scale.v_off * q[2],
            r_i: self.scale.r_i * bounded(q[3]),
        }
    }

    fn predicted(&self, params: &CurrentParams) -> DVector<f64> {
        DVector::from_iterator(
            self.adc.len(),
            self.adc.iter().zip(self.load.iter()).map(|(adc, load)| {
                ((load + params.r_i) * params.m.mul_add(*adc, params.b) + params.v_off) / load
            }),
        )
    }

    /// Scaled residuals at physical parameters
    fn residuals(&self, params: &CurrentParams) -> DVector<f64> {
        (self.predicted(params) - &self.current) / self.scale.current
    }

    /// Run Gauss-Newton from `seed`.
    ///
    /// Each step size in [`STEP_SIZES`] is tried until one converges. Reaching `max_iters`, a
    /// singular normal matrix, or non-finite parameters count as failure.
    pub(crate) fn solve(
        self,
        seed: &CurrentParams,
        max_iters: u64,
        tolerance: f64,
    ) -> Result<Solution, argmin::core::Error> {
        let initial_parameters = self.to_internal(seed);
        let mut last_error = None;

        for gamma in STEP_SIZES {
            match self.solve_with_step(initial_parameters.clone(), gamma, max_iters, tolerance) {
                Ok(solution) => return Ok(solution),
                Err(e) => {
                    tracing::debug!(gamma, error = %e, "Gauss-Newton attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| argmin::core::Error::msg("no step size attempted")))
    }

    fn solve_with_step(
        &self,
        initial_parameters: DVector<f64>,
        gamma: f64,
        max_iters: u64,
        tolerance: f64,
    ) -> Result<Solution, argmin::core::Error> {
        let solver = GaussNewton::new()
            .with_gamma(gamma)?
            .with_tolerance(tolerance)?;

        let res = Executor::new(self.clone(), solver)
            .configure(|state| state.param(initial_parameters).max_iters(max_iters))
            .run()?;

        let state = res.state();
        match state.get_termination_reason() {
            Some(TerminationReason::SolverConverged) => {}
            Some(reason) => {
                return Err(argmin::core::Error::msg(format!(
                    "did not converge: {}",
                    reason.text()
                )))
            }
            None => return Err(argmin::core::Error::msg("solver did not terminate")),
        }

        let q = state
            .get_best_param()
            .or_else(|| state.get_param())
            .ok_or_else(|| argmin::core::Error::msg("solver returned no parameters"))?;
        let params = self.to_physical(q);
        if !params.is_finite() {
            return Err(argmin::core::Error::msg("solver diverged to non-finite parameters"));
        }

        Ok(Solution {
            params,
            iterations: state.get_iter(),
        })
    }
}

impl Operator for Problem {
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, q: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.residuals(&self.to_physical(q)))
    }
}

impl Jacobian for Problem {
    type Param = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn jacobian(&self, q: &Self::Param) -> Result<Self::Jacobian, argmin::core::Error> {
        let params = self.to_physical(q);
        let dm_dq = self.scale.m * bounded_derivative(q[0]);
        let dr_dq = self.scale.r_i * bounded_derivative(q[3]);

        let mut jacobian = DMatrix::zeros(self.adc.len(), 4);
        for (ii, (adc, load)) in self.adc.iter().zip(self.load.iter()).enumerate() {
            let gain = (load + params.r_i) / load;
            jacobian[(ii, 0)] = gain * adc * dm_dq;
            jacobian[(ii, 1)] = gain * self.scale.b;
            jacobian[(ii, 2)] = self.scale.v_off / load;
            jacobian[(ii, 3)] = params.m.mul_add(*adc, params.b) / load * dr_dq;
        }
        Ok(jacobian / self.scale.current)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use argmin::core::{Jacobian, Operator};

    use super::{bounded, unbounded, Problem};
    use crate::current::{CurrentParams, ResistorNetwork};

    fn truth() -> CurrentParams {
        CurrentParams {
            m: 2.5e-6,
            b: 4e-6,
            v_off: -0.07,
            r_i: 35.0,
        }
    }

    fn synthetic(rng: &mut impl Rng, params: &CurrentParams) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let network = ResistorNetwork::default();
        let mut adc = vec![];
        let mut resistor = vec![];
        let mut current = vec![];
        for r in [500.0, 1_000.0, 2_000.0, 5_000.0] {
            for _ in 0..10 {
                let count = rng.gen_range(10.0..1000.0);
                adc.push(count);
                resistor.push(r);
                current.push(network.predicted_current(params, count, r));
            }
        }
        (adc, resistor, current)
    }

    #[test]
    fn bound_transform_round_trips_feasible_values() {
        for u in [1e-2, 0.5, 1.0, 3.0, 250.0] {
            approx::assert_relative_eq!(bounded(unbounded(u)), u, max_relative = 1e-12);
        }
        assert!(bounded(-4.0) >= 0.0);
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let (adc, resistor, current) = synthetic(&mut rng, &truth());
        let network = ResistorNetwork::default();
        let problem = Problem::build(&adc, &resistor, &current, &network, &truth()).unwrap();

        let q: DVector<f64> = DVector::from_vec(vec![1.3, 0.4, -0.2, 0.9]);
        let computed = problem.jacobian(&q).unwrap();

        let delta = 1e-6;
        for jj in 0..4 {
            let mut plus = q.clone();
            plus[jj] += delta;
            let mut minus = q.clone();
            minus[jj] -= delta;
            let numerical =
                (problem.apply(&plus).unwrap() - problem.apply(&minus).unwrap()) / (2. * delta);
            for ii in 0..adc.len() {
                approx::assert_relative_eq!(
                    computed[(ii, jj)],
                    numerical[ii],
                    max_relative = 1e-5,
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn noiseless_data_is_fitted_from_a_perturbed_seed() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let truth = truth();
        let (adc, resistor, current) = synthetic(&mut rng, &truth);
        let network = ResistorNetwork::default();

        let start = CurrentParams {
            m: truth.m * 1.05,
            b: truth.b * 0.8,
            v_off: -0.1,
            r_i: 50.0,
        };
        let problem = Problem::build(&adc, &resistor, &current, &network, &start).unwrap();
        let solution = problem.solve(&start, 100, f64::EPSILON.sqrt()).unwrap();

        approx::assert_relative_eq!(solution.params.m, truth.m, max_relative = 1e-6);
        approx::assert_relative_eq!(solution.params.b, truth.b, max_relative = 1e-4);
        approx::assert_relative_eq!(solution.params.v_off, truth.v_off, max_relative = 1e-5);
        approx::assert_relative_eq!(solution.params.r_i, truth.r_i, max_relative = 1e-5);
    }
}
