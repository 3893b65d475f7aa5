//! Fitted population model.

use serde::{Deserialize, Serialize};

use crate::domain::{DistributionParams, LinkKind, LinkSpec, Param};
use crate::error::Result;
use crate::family::Family;
use crate::fit::term::ParamTerm;

/// Convergence and complexity summary of a population fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub cycles: usize,
    /// Global deviance `-2 Σ w_i l_i` (prior weights included); zero for
    /// models that were not fitted to data.
    pub deviance: f64,
    pub penalized_deviance: f64,
    /// Effective degrees of freedom per parameter, indexed by [`Param::index`].
    pub edf: [f64; 4],
    pub total_edf: f64,
    pub history: Vec<f64>,
    pub inner_cap_hits: usize,
    pub n_observations: usize,
    pub n_subjects: usize,
}

/// One row of [`FittedModel::parameter_table`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub age: f64,
    pub mu: f64,
    pub sigma: f64,
    pub nu: f64,
    pub tau: f64,
}

/// Distribution parameters as functions of age.
///
/// Built once by the population fitter (or [`FittedModel::from_constant`])
/// and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    family: Family,
    links: LinkSpec,
    terms: [ParamTerm; 4],
    /// Training age range; `None` when no term depends on age.
    age_range: Option<(f64, f64)>,
    diagnostics: FitDiagnostics,
}

impl FittedModel {
    pub(crate) fn new(
        family: Family,
        links: LinkSpec,
        terms: [ParamTerm; 4],
        age_range: Option<(f64, f64)>,
        diagnostics: FitDiagnostics,
    ) -> Self {
        Self {
            family,
            links,
            terms,
            age_range,
            diagnostics,
        }
    }

    /// Age-independent model with the given parameters.
    pub fn from_constant(family: Family, params: DistributionParams) -> Result<Self> {
        let params = family.normalize(params);
        family.validate(&params)?;
        let terms = Param::ALL.map(|p| {
            let eta = family.link(p).link(params.get(p));
            if family.is_active(p) {
                ParamTerm::constant(eta)
            } else {
                ParamTerm::pinned(eta)
            }
        });
        let edf = Param::ALL.map(|p| terms[p.index()].edf());
        Ok(Self {
            family,
            links: LinkSpec::all_constant(),
            terms,
            age_range: None,
            diagnostics: FitDiagnostics {
                cycles: 0,
                deviance: 0.0,
                penalized_deviance: 0.0,
                edf,
                total_edf: edf.iter().sum(),
                history: Vec::new(),
                inner_cap_hits: 0,
                n_observations: 0,
                n_subjects: 0,
            },
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn links(&self) -> &LinkSpec {
        &self.links
    }

    pub fn term(&self, param: Param) -> &ParamTerm {
        &self.terms[param.index()]
    }

    pub fn age_range(&self) -> Option<(f64, f64)> {
        self.age_range
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        &self.diagnostics
    }

    /// `true` when `age` lies outside the training range of an age-dependent
    /// model.
    pub fn is_extrapolating(&self, age: f64) -> bool {
        match self.age_range {
            Some((lo, hi)) => age < lo || age > hi,
            None => false,
        }
    }

    /// Value of one parameter at `age`.
    pub fn eval(&self, param: Param, age: f64) -> f64 {
        self.family.link(param).inverse(self.terms[param.index()].eta(age))
    }

    pub fn params_at(&self, age: f64) -> DistributionParams {
        let mut p = DistributionParams::new(0.0, 0.0, 0.0, 0.0);
        for param in Param::ALL {
            p.set(param, self.eval(param, age));
        }
        self.family.normalize(p)
    }

    /// Parameter values on an age grid.
    pub fn parameter_table(&self, ages: &[f64]) -> Vec<ParameterRow> {
        ages.iter()
            .map(|&age| {
                let p = self.params_at(age);
                ParameterRow {
                    age,
                    mu: p.mu,
                    sigma: p.sigma,
                    nu: p.nu,
                    tau: p.tau,
                }
            })
            .collect()
    }

    /// Generalized AIC: `deviance + k * total edf`.
    pub fn gaic(&self, penalty: f64) -> f64 {
        self.diagnostics.deviance + penalty * self.diagnostics.total_edf
    }

    pub fn aic(&self) -> f64 {
        self.gaic(2.0)
    }

    /// Number of parameters modeled as smooth functions of age.
    pub fn smooth_count(&self) -> usize {
        Param::ALL
            .iter()
            .filter(|&&p| self.terms[p.index()].kind() == LinkKind::Smooth)
            .count()
    }
}
