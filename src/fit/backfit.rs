//! Penalized backfitting (RS algorithm) for distributional regression.
//!
//! The model is `g_k(θ_k) = η_k = X_k β_k` for every active parameter `k`.
//! One outer cycle updates the parameter blocks in order; each block update is
//! a short inner loop of penalized IRLS steps with the other blocks held fixed:
//!
//! 1. per observation: score `u = ∂l/∂η` and working weight `w = -∂²l/∂η²`
//!    (central differences on the link scale; `w` falls back to `u²` when
//!    the curvature is not positive)
//! 2. working response `z = η + u/w`
//! 3. solve `(XᵀWX + λP)β = XᵀWz`, choosing `λ` by local GAIC for smooth
//!    terms
//! 4. halve the step (up to `MAX_HALVINGS` times) while the penalized
//!    deviance goes up
//!
//! The state is threaded explicitly: [`update_block`] takes a state and
//! returns the next one, [`run`] chains them until the penalized deviance
//! settles. Per-observation derivatives are evaluated in parallel; every sum
//! is taken sequentially so the result does not depend on thread scheduling.

use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::domain::{DistributionParams, FitConfig, LinkKind, Param};
use crate::error::{FitError, Result};
use crate::family::Family;
use crate::fit::selection::{SmoothingCriterion, select_smoothing};
use crate::fit::term::ParamTerm;
use crate::math::{PSplineBasis, WeightedGram, difference_penalty, solve_penalized};

/// Relative step of the central differences on the link scale.
const FD_STEP: f64 = 1e-4;
const MIN_WORKING_WEIGHT: f64 = 1e-10;
const MAX_WORKING_WEIGHT: f64 = 1e10;
const MAX_HALVINGS: usize = 10;
const TAU_BOUND_SLACK: f64 = 1e-12;

/// Loop controls for one backfitting run.
#[derive(Debug, Clone)]
pub struct BackfitSettings {
    pub outer_tol: f64,
    pub inner_tol: f64,
    pub max_cycles: usize,
    pub max_inner_iter: usize,
    pub gaic_penalty: f64,
    pub lambda_grid: Vec<f64>,
    pub time_budget: Option<Duration>,
    /// Reaching `max_inner_iter` fails the run instead of being counted.
    pub strict_inner_cap: bool,
    /// Admissible `tau` range for families that estimate it.
    pub tau_bounds: (f64, f64),
}

impl BackfitSettings {
    /// Loop controls from the run configuration with the given outer cap.
    pub fn from_config(config: &FitConfig, max_cycles: usize) -> Result<Self> {
        Ok(Self {
            outer_tol: config.outer_tol,
            inner_tol: config.inner_tol,
            max_cycles,
            max_inner_iter: config.max_inner_iter,
            gaic_penalty: config.gaic_penalty,
            lambda_grid: config.lambda_grid()?,
            time_budget: config.time_budget_secs.map(Duration::from_secs_f64),
            strict_inner_cap: config.strict_inner_cap,
            tau_bounds: (config.tau_min, config.tau_max),
        })
    }
}

#[derive(Debug, Clone)]
struct Block {
    param: Param,
    kind: LinkKind,
    basis: Option<PSplineBasis>,
    design: DMatrix<f64>,
    penalty: DMatrix<f64>,
}

/// Fixed inputs of a backfitting run: data, prior weights and one block per
/// active parameter.
#[derive(Debug, Clone)]
pub struct BackfitProblem {
    family: Family,
    values: Vec<f64>,
    weights: Vec<f64>,
    blocks: Vec<Block>,
    settings: BackfitSettings,
}

impl BackfitProblem {
    /// Set up the blocks for `family`.
    ///
    /// `smooth` lists, per parameter, the basis to use when the parameter
    /// depends on age; `None` means an intercept only.
    pub fn new(
        family: Family,
        ages: Vec<f64>,
        values: Vec<f64>,
        weights: Vec<f64>,
        smooth: [Option<PSplineBasis>; 4],
        penalty_order: usize,
        settings: BackfitSettings,
    ) -> Result<Self> {
        let n = values.len();
        if n == 0 {
            return Err(FitError::InsufficientData("no observations to fit".to_string()));
        }
        if ages.len() != n || weights.len() != n {
            return Err(FitError::InvalidInput(format!(
                "ages ({}), values ({n}) and weights ({}) differ in length",
                ages.len(),
                weights.len()
            )));
        }
        if let Some(bad) = weights.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            return Err(FitError::InvalidInput(format!(
                "prior weights must be finite and > 0, got {bad}"
            )));
        }

        let mut blocks = Vec::with_capacity(family.active_params().len());
        for &param in family.active_params() {
            let block = match &smooth[param.index()] {
                None => Block {
                    param,
                    kind: LinkKind::Constant,
                    basis: None,
                    design: DMatrix::from_element(n, 1, 1.0),
                    penalty: DMatrix::zeros(1, 1),
                },
                Some(basis) => Block {
                    param,
                    kind: LinkKind::Smooth,
                    basis: Some(basis.clone()),
                    design: basis.design(&ages),
                    penalty: difference_penalty(basis.len(), penalty_order)?,
                },
            };
            blocks.push(block);
        }

        Ok(Self {
            family,
            values,
            weights,
            blocks,
            settings,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// State with every parameter flat at `start`.
    ///
    /// A starting `tau` outside the admissible range is moved to its nearest end.
    pub fn initial_state(&self, start: &DistributionParams) -> Result<BackfitState> {
        let mut start = self.family.normalize(*start);
        self.family.validate(&start)?;
        if self.family.is_active(Param::Tau) {
            let (lo, hi) = self.settings.tau_bounds;
            start.tau = start.tau.clamp(lo, hi);
        }
        let n = self.len();

        let mut terms: [ParamTerm; 4] = Param::ALL.map(|p| {
            ParamTerm::pinned(self.family.link(p).link(start.get(p)))
        });
        for block in &self.blocks {
            let k = block.param.index();
            let eta0 = terms[k].eta(0.0);
            terms[k] = match &block.basis {
                None => ParamTerm::constant(eta0),
                Some(basis) => ParamTerm::smooth(basis.clone(), eta0),
            };
        }
        let eta: [Vec<f64>; 4] = std::array::from_fn(|k| vec![terms[k].eta(0.0); n]);

        let mut state = BackfitState {
            terms,
            eta,
            deviance: 0.0,
            penalized_deviance: 0.0,
            history: Vec::new(),
            cycles: 0,
            inner_cap_hits: 0,
        };
        state.deviance = self.deviance(&state.eta);
        state.penalized_deviance = state.deviance + self.penalty_total(&state);
        if !state.deviance.is_finite() {
            return Err(FitError::ConvergenceFailure {
                cycles: 0,
                reason: "deviance is not finite at the starting values".to_string(),
            });
        }
        Ok(state)
    }

    fn params_at(&self, eta: &[Vec<f64>; 4], i: usize) -> DistributionParams {
        let mut p = DistributionParams::new(0.0, 0.0, 0.0, 0.0);
        for param in Param::ALL {
            p.set(param, self.family.link(param).inverse(eta[param.index()][i]));
        }
        p
    }

    /// `true` when `params` satisfy the family constraints and the `tau` range.
    fn admissible(&self, params: &DistributionParams) -> bool {
        let (lo, hi) = self.settings.tau_bounds;
        // Slack for the exp/ln round trip of a tau clamped onto a bound.
        let in_range =
            params.tau >= lo * (1.0 - TAU_BOUND_SLACK) && params.tau <= hi * (1.0 + TAU_BOUND_SLACK);
        self.family.validate(params).is_ok() && (!self.family.is_active(Param::Tau) || in_range)
    }

    /// Log-likelihood of observation `i`; `-inf` for inadmissible parameters.
    fn log_lik(&self, i: usize, params: &DistributionParams) -> f64 {
        if !self.admissible(params) {
            return f64::NEG_INFINITY;
        }
        self.family.log_pdf_unchecked(self.values[i], params)
    }

    /// Global deviance `-2 Σ w_i l_i`; `+inf` if any term is not finite.
    fn deviance(&self, eta: &[Vec<f64>; 4]) -> f64 {
        let contributions: Vec<f64> = (0..self.len())
            .into_par_iter()
            .map(|i| self.weights[i] * self.log_lik(i, &self.params_at(eta, i)))
            .collect();

        let mut total = 0.0;
        for c in contributions {
            if !c.is_finite() {
                return f64::INFINITY;
            }
            total += c;
        }
        -2.0 * total
    }

    fn penalty_total(&self, state: &BackfitState) -> f64 {
        self.blocks
            .iter()
            .map(|b| {
                let term = &state.terms[b.param.index()];
                quadratic_penalty(&b.penalty, term.coefficients(), term.lambda())
            })
            .sum()
    }

    /// `(∂l/∂η, working weight)` for observation `i` and parameter `param`.
    fn working_derivatives(&self, eta: &[Vec<f64>; 4], i: usize, param: Param) -> (f64, f64) {
        let link = self.family.link(param);
        let base = self.params_at(eta, i);
        let l = |e: f64| self.log_lik(i, &base.with(param, link.inverse(e)));

        let e0 = eta[param.index()][i];
        let h = FD_STEP * (1.0 + e0.abs());
        let (lm, l0, lp) = (l(e0 - h), l(e0), l(e0 + h));
        if !l0.is_finite() {
            return (0.0, MIN_WORKING_WEIGHT);
        }
        // At the edge of the admissible region only one side is usable.
        let one_sided = match (lm.is_finite(), lp.is_finite()) {
            (true, true) => None,
            (true, false) => Some((l0 - lm) / h),
            (false, true) => Some((lp - l0) / h),
            (false, false) => Some(0.0),
        };
        if let Some(u) = one_sided {
            return (u, (u * u).clamp(MIN_WORKING_WEIGHT, MAX_WORKING_WEIGHT));
        }

        let u = (lp - lm) / (2.0 * h);
        if !u.is_finite() {
            return (0.0, MIN_WORKING_WEIGHT);
        }

        let curvature = (lp - 2.0 * l0 + lm) / (h * h);
        let mut w = -curvature;
        if !(w.is_finite() && w > MIN_WORKING_WEIGHT) {
            w = (u * u).max(MIN_WORKING_WEIGHT);
        }
        (u, w.min(MAX_WORKING_WEIGHT))
    }
}

fn quadratic_penalty(penalty: &DMatrix<f64>, coef: &[f64], lambda: f64) -> f64 {
    if lambda == 0.0 {
        return 0.0;
    }
    let beta = DVector::from_column_slice(coef);
    lambda * (beta.transpose() * penalty * &beta)[(0, 0)]
}

/// Mutable-by-replacement state of a backfitting run.
#[derive(Debug, Clone)]
pub struct BackfitState {
    /// One term per parameter, indexed by [`Param::index`].
    pub terms: [ParamTerm; 4],
    eta: [Vec<f64>; 4],
    pub deviance: f64,
    pub penalized_deviance: f64,
    /// Penalized deviance after each completed outer cycle.
    pub history: Vec<f64>,
    pub cycles: usize,
    /// Block updates that stopped at the inner iteration cap.
    pub inner_cap_hits: usize,
}

impl BackfitState {
    /// Linear predictor of `param` at every observation.
    pub fn eta(&self, param: Param) -> &[f64] {
        &self.eta[param.index()]
    }

    fn with_term(&self, param: Param, term: ParamTerm, eta: Vec<f64>) -> Self {
        let mut next = self.clone();
        next.terms[param.index()] = term;
        next.eta[param.index()] = eta;
        next
    }
}

/// Run the inner loop for block `block` and return the updated state.
pub fn update_block(problem: &BackfitProblem, state: &BackfitState, block: usize) -> Result<BackfitState> {
    let block = problem.blocks.get(block).ok_or_else(|| {
        FitError::InvalidInput(format!(
            "block {block} out of range ({} blocks)",
            problem.blocks.len()
        ))
    })?;
    let settings = &problem.settings;
    let param = block.param;
    let k = param.index();
    let mut current = state.clone();

    for iter in 1..=settings.max_inner_iter {
        let derivs: Vec<(f64, f64)> = (0..problem.len())
            .into_par_iter()
            .map(|i| problem.working_derivatives(&current.eta, i, param))
            .collect();

        let mut w = Vec::with_capacity(derivs.len());
        let mut z = Vec::with_capacity(derivs.len());
        for (i, (u, wi)) in derivs.into_iter().enumerate() {
            w.push(problem.weights[i] * wi);
            z.push(current.eta[k][i] + u / wi);
        }
        let gram = WeightedGram::from_design(&block.design, &w, &z);

        let (target, lambda, edf) = match block.kind {
            LinkKind::Constant => {
                let fit = solve_penalized(&gram, &block.penalty, 0.0).ok_or_else(|| {
                    FitError::NumericalNonConvergence(format!(
                        "{param}: working system is singular"
                    ))
                })?;
                (fit.beta, 0.0, fit.edf)
            }
            LinkKind::Smooth => {
                let choice = select_smoothing(
                    &gram,
                    &block.penalty,
                    &settings.lambda_grid,
                    SmoothingCriterion::Gaic {
                        penalty: settings.gaic_penalty,
                    },
                )?;
                (choice.fit.beta, choice.lambda, choice.fit.edf)
            }
        };

        // Reference: current coefficients penalized with the new λ.
        let old_coef = DVector::from_column_slice(current.terms[k].coefficients());
        let others = problem.penalty_total(&current)
            - quadratic_penalty(&block.penalty, current.terms[k].coefficients(), current.terms[k].lambda());
        let reference = current.deviance
            + others
            + quadratic_penalty(&block.penalty, current.terms[k].coefficients(), lambda);

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..=MAX_HALVINGS {
            let coef = &old_coef + (&target - &old_coef) * step;
            let eta_k: Vec<f64> = (&block.design * &coef).iter().copied().collect();
            let term = current.terms[k].with_coefficients(coef.iter().copied().collect(), lambda, edf);
            let mut candidate = current.with_term(param, term, eta_k);
            candidate.deviance = problem.deviance(&candidate.eta);
            candidate.penalized_deviance = candidate.deviance + problem.penalty_total(&candidate);

            if candidate.penalized_deviance.is_finite()
                && candidate.penalized_deviance <= reference + 1e-10 * (1.0 + reference.abs())
            {
                accepted = Some(candidate);
                break;
            }
            step *= 0.5;
        }

        let Some(next) = accepted else {
            debug!("{param}: no improving step after {MAX_HALVINGS} halvings; keeping block");
            return Ok(current);
        };

        let change = (current.penalized_deviance - next.penalized_deviance).abs();
        current = next;
        if change < settings.inner_tol {
            return Ok(current);
        }
        if iter == settings.max_inner_iter {
            if settings.strict_inner_cap {
                return Err(FitError::ConvergenceFailure {
                    cycles: current.cycles,
                    reason: format!(
                        "{param}: inner loop reached {} iterations (last change {change:.3e})",
                        settings.max_inner_iter
                    ),
                });
            }
            warn!(
                "{param}: inner loop stopped at the cap of {} iterations (last change {change:.3e})",
                settings.max_inner_iter
            );
            current.inner_cap_hits += 1;
        }
    }

    Ok(current)
}

/// Cycle over all blocks until the penalized deviance settles.
pub fn run(problem: &BackfitProblem, initial: BackfitState) -> Result<BackfitState> {
    let settings = &problem.settings;
    let started = Instant::now();
    let mut state = initial;

    for cycle in 1..=settings.max_cycles {
        let before = state.penalized_deviance;
        for b in 0..problem.num_blocks() {
            state = update_block(problem, &state, b)?;
        }
        state.cycles = cycle;
        state.history.push(state.penalized_deviance);

        let change = (before - state.penalized_deviance).abs();
        debug!(
            "cycle {cycle}: deviance {:.6} penalized {:.6} change {change:.3e}",
            state.deviance, state.penalized_deviance
        );
        if change < settings.outer_tol {
            return Ok(state);
        }

        if let Some(budget) = settings.time_budget {
            if started.elapsed() > budget {
                return Err(FitError::ConvergenceFailure {
                    cycles: cycle,
                    reason: format!("time budget of {:.1}s exhausted", budget.as_secs_f64()),
                });
            }
        }
    }

    Err(FitError::ConvergenceFailure {
        cycles: settings.max_cycles,
        reason: format!(
            "penalized deviance still changing after {} cycles",
            settings.max_cycles
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn settings(max_cycles: usize) -> BackfitSettings {
        BackfitSettings {
            outer_tol: 1e-6,
            inner_tol: 1e-6,
            max_cycles,
            max_inner_iter: 100,
            gaic_penalty: 3.84,
            lambda_grid: FitConfig {
                lambda_steps: 21,
                ..FitConfig::default()
            }
            .lambda_grid()
            .unwrap(),
            time_budget: None,
            strict_inner_cap: false,
            tau_bounds: (0.1, 50.0),
        }
    }

    fn normal_data(n: usize, mu: f64, sd: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(mu, sd).unwrap();
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    #[test]
    fn constant_normal_fit_matches_closed_form() {
        let values = normal_data(400, 3.0, 0.5, 11);
        let n = values.len();
        let problem = BackfitProblem::new(
            Family::No,
            vec![0.0; n],
            values.clone(),
            vec![1.0; n],
            [None, None, None, None],
            2,
            settings(50),
        )
        .unwrap();
        let start = DistributionParams::new(2.0, 1.0, 1.0, 2.0);
        let state = run(&problem, problem.initial_state(&start).unwrap()).unwrap();

        let mean = values.iter().sum::<f64>() / n as f64;
        let sd = (values.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        let mu_hat = state.terms[0].eta(0.0);
        let sigma_hat = state.terms[1].eta(0.0).exp();
        assert!((mu_hat - mean).abs() < 1e-3, "mu {mu_hat} vs {mean}");
        assert!((sigma_hat - sd).abs() < 1e-3, "sigma {sigma_hat} vs {sd}");
    }

    #[test]
    fn smooth_mean_trend_is_recovered() {
        let ages: Vec<f64> = (0..300).map(|i| 20.0 + (i % 60) as f64).collect();
        let mut rng = StdRng::seed_from_u64(5);
        let values: Vec<f64> = ages
            .iter()
            .map(|a| {
                let mu = 1.0 + 0.02 * (a - 20.0);
                Normal::new(mu, 0.1).unwrap().sample(&mut rng)
            })
            .collect();
        let n = values.len();
        let basis = PSplineBasis::new(20.0, 79.0, 6, 3).unwrap();
        let problem = BackfitProblem::new(
            Family::No,
            ages,
            values,
            vec![1.0; n],
            [Some(basis), None, None, None],
            2,
            settings(30),
        )
        .unwrap();
        let start = DistributionParams::new(1.6, 0.4, 1.0, 2.0);
        let state = run(&problem, problem.initial_state(&start).unwrap()).unwrap();

        let initial = problem.initial_state(&start).unwrap().penalized_deviance;
        assert!(state.penalized_deviance < initial);
        let h = &state.history;
        if h.len() >= 2 {
            assert!((h[h.len() - 1] - h[h.len() - 2]).abs() < 1e-6, "history {h:?}");
        }
        let mu = &state.terms[0];
        assert!((mu.eta(25.0) - 1.1).abs() < 0.05, "mu(25)={}", mu.eta(25.0));
        assert!((mu.eta(75.0) - 2.1).abs() < 0.05, "mu(75)={}", mu.eta(75.0));
    }

    #[test]
    fn outer_cap_is_reported_as_convergence_failure() {
        let values = normal_data(200, 1.0, 0.2, 3);
        let n = values.len();
        let mut s = settings(1);
        s.outer_tol = 1e-300;
        let problem = BackfitProblem::new(
            Family::No,
            vec![0.0; n],
            values,
            vec![1.0; n],
            [None, None, None, None],
            2,
            s,
        )
        .unwrap();
        let start = DistributionParams::new(5.0, 3.0, 1.0, 2.0);
        let err = run(&problem, problem.initial_state(&start).unwrap()).unwrap_err();
        assert!(matches!(err, FitError::ConvergenceFailure { cycles: 1, .. }));
    }

    #[test]
    fn strict_inner_cap_fails_the_run() {
        let values = normal_data(200, 1.0, 0.2, 3);
        let n = values.len();
        let mut s = settings(10);
        s.max_inner_iter = 1;
        s.inner_tol = 1e-300;
        s.strict_inner_cap = true;
        let problem = BackfitProblem::new(
            Family::No,
            vec![0.0; n],
            values,
            vec![1.0; n],
            [None, None, None, None],
            2,
            s,
        )
        .unwrap();
        let start = DistributionParams::new(5.0, 3.0, 1.0, 2.0);
        let err = run(&problem, problem.initial_state(&start).unwrap()).unwrap_err();
        assert!(matches!(err, FitError::ConvergenceFailure { .. }), "{err}");
    }

    #[test]
    fn overflowing_tau_predictor_has_infinite_deviance() {
        let values = vec![0.4, 0.5, 0.55, 0.6, 0.7];
        let n = values.len();
        let problem = BackfitProblem::new(
            Family::Bcpe,
            vec![0.0; n],
            values,
            vec![1.0; n],
            [None, None, None, None],
            2,
            settings(10),
        )
        .unwrap();
        let flat = |mu: f64, sigma: f64, nu: f64, log_tau: f64| -> [Vec<f64>; 4] {
            [vec![mu; n], vec![sigma; n], vec![nu; n], vec![log_tau; n]]
        };
        let (log_mu, log_sigma) = (0.5f64.ln(), 0.2f64.ln());
        assert!(problem.deviance(&flat(log_mu, log_sigma, 1.0, 2f64.ln())).is_finite());
        // exp(800) overflows to inf.
        assert_eq!(problem.deviance(&flat(log_mu, log_sigma, 1.0, 800.0)), f64::INFINITY);
        assert_eq!(problem.deviance(&flat(log_mu, log_sigma, 1.0, -800.0)), f64::INFINITY);
        // Finite but beyond the admissible range.
        assert_eq!(problem.deviance(&flat(log_mu, log_sigma, 1.0, 100f64.ln())), f64::INFINITY);

        let (u, w) = problem.working_derivatives(&flat(log_mu, log_sigma, 1.0, 800.0), 0, Param::Tau);
        assert_eq!((u, w), (0.0, MIN_WORKING_WEIGHT));
    }

    #[test]
    fn starting_tau_is_moved_into_range() {
        let values = vec![0.4, 0.5, 0.55, 0.6, 0.7];
        let n = values.len();
        let problem = BackfitProblem::new(
            Family::Bcpe,
            vec![0.0; n],
            values,
            vec![1.0; n],
            [None, None, None, None],
            2,
            settings(10),
        )
        .unwrap();
        let state = problem
            .initial_state(&DistributionParams::new(0.5, 0.2, 1.0, 1e4))
            .unwrap();
        assert!((state.terms[3].eta(0.0) - 50f64.ln()).abs() < 1e-12);
        assert!(state.deviance.is_finite());
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let err = BackfitProblem::new(
            Family::No,
            vec![0.0; 3],
            vec![1.0; 4],
            vec![1.0; 4],
            [None, None, None, None],
            2,
            settings(5),
        )
        .unwrap_err();
        assert!(matches!(err, FitError::InvalidInput(_)));
    }
}
