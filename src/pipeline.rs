//! End-to-end reference run.
//!
//! subject fits -> exclusion of failed subjects -> age-effect screen ->
//! population fit -> centiles on an age grid -> z-scores and coverage
//!
//! Front-ends only need to present the returned [`ReferenceRun`].

use std::collections::HashSet;

use log::{info, warn};

use crate::centile::{CentileSet, age_grid, predict_centiles};
use crate::domain::{FitConfig, Sample};
use crate::error::{FitError, Result};
use crate::fit::{FittedModel, SubjectFit, fit_population, fit_subjects};
use crate::report::format::{
    format_centile_table, format_coverage, format_extremes, format_model_summary,
    format_screen_report, format_subject_fits,
};
use crate::report::{CoverageRow, ObservationScore, coverage, rank_extremes, z_scores};
use crate::screen::{ScreenReport, screen_effects};

/// Number of observations listed on each side in the summary.
const SUMMARY_EXTREMES: usize = 5;

/// All computed outputs of a reference run.
#[derive(Debug, Clone)]
pub struct ReferenceRun {
    pub subject_fits: Vec<SubjectFit>,
    pub screen: ScreenReport,
    pub model: FittedModel,
    pub centiles: CentileSet,
    pub scores: Vec<ObservationScore>,
    pub coverage: Vec<CoverageRow>,
}

impl ReferenceRun {
    /// Subjects left out of the population fit.
    pub fn excluded(&self) -> impl Iterator<Item = &SubjectFit> + '_ {
        self.subject_fits.iter().filter(|f| !f.is_ok())
    }

    /// Plain-text report of every stage.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format_subject_fits(&self.subject_fits));
        out.push('\n');
        out.push_str(&format_screen_report(&self.screen));
        out.push('\n');
        out.push_str(&format_model_summary(&self.model));
        out.push('\n');
        out.push_str(&format_centile_table(&self.centiles));
        out.push('\n');
        out.push_str(&format_coverage(&self.coverage));
        out.push('\n');
        out.push_str(&format_extremes(&rank_extremes(&self.scores, SUMMARY_EXTREMES)));
        out
    }
}

/// Execute the full reference pipeline on `samples`.
pub fn run_reference(samples: &[Sample], config: &FitConfig) -> Result<ReferenceRun> {
    config.validate()?;

    let subject_fits = fit_subjects(samples, config);
    let mut kept_ids = HashSet::new();
    for f in &subject_fits {
        match &f.outcome {
            Ok(_) => {
                kept_ids.insert(f.subject_id.as_str());
            }
            Err(e) => warn!("excluding subject {} (age {}): {e}", f.subject_id, f.age),
        }
    }
    let kept: Vec<Sample> = samples
        .iter()
        .filter(|s| kept_ids.contains(s.subject_id()))
        .cloned()
        .collect();
    if kept.is_empty() {
        return Err(FitError::InsufficientData(format!(
            "none of {} subjects could be fitted",
            samples.len()
        )));
    }

    let screen = screen_effects(&subject_fits, config)?;
    let model = fit_population(&kept, &screen.links(), config)?;

    let (lo, hi) = match model.age_range() {
        Some(range) => range,
        None => kept.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.age()), hi.max(s.age()))
        }),
    };
    let ages = age_grid(lo, hi, config.centile_grid_points)?;
    let centiles = predict_centiles(&model, &ages, &config.centile_levels, &config.root_options())?;

    let scores = z_scores(&model, &kept)?;
    let coverage_rows = coverage(&scores, &config.centile_levels);
    info!(
        "reference run: {} of {} subjects used, {} centile curves over [{lo:.2}, {hi:.2}]",
        kept.len(),
        samples.len(),
        centiles.curves.len()
    );

    Ok(ReferenceRun {
        subject_fits,
        screen,
        model,
        centiles,
        scores,
        coverage: coverage_rows,
    })
}
