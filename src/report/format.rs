//! Plain-text summaries of a reference run.
//!
//! Formatting lives here so the fitting code stays free of presentation.

use crate::centile::CentileSet;
use crate::fit::{FittedModel, SubjectFit};
use crate::report::{CoverageRow, Extremes, ObservationScore};
use crate::screen::ScreenReport;

/// Per-subject fit table (failures listed with their error).
pub fn format_subject_fits(fits: &[SubjectFit]) -> String {
    let mut out = String::new();
    out.push_str(&header(
        &format!(
            "{:<16} {:>8} {:>6} {:>10} {:>10} {:>10} {:>10}",
            "subject", "age", "n", "mu", "sigma", "nu", "tau"
        ),
        &[16, 8, 6, 10, 10, 10, 10],
    ));
    for f in fits {
        let line = match &f.outcome {
            Ok(fit) => format!(
                "{:<16} {:>8.2} {:>6} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
                truncate(&f.subject_id, 16),
                f.age,
                f.n,
                fit.params.mu,
                fit.params.sigma,
                fit.params.nu,
                fit.params.tau
            ),
            Err(e) => format!(
                "{:<16} {:>8.2} {:>6} excluded: {e}",
                truncate(&f.subject_id, 16),
                f.age,
                f.n
            ),
        };
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub fn format_screen_report(report: &ScreenReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Age-effect screen: {} subjects, threshold R2 >= {}\n",
        report.n_subjects, report.threshold
    ));
    for e in &report.entries {
        match &e.effect {
            Some(eff) => out.push_str(&format!(
                "- {:<6} R2={:.4} edf={:.2} p={} -> {:?}\n",
                e.param.name(),
                eff.r_squared,
                eff.edf,
                eff.p_value.map_or_else(|| "n/a".to_string(), |p| format!("{p:.3e}")),
                e.link
            )),
            None if e.excluded > 0 => out.push_str(&format!(
                "- {:<6} constant ({} estimates at the bound, too few left)\n",
                e.param.name(),
                e.excluded
            )),
            None => out.push_str(&format!("- {:<6} fixed by family\n", e.param.name())),
        }
    }
    out
}

pub fn format_model_summary(model: &FittedModel) -> String {
    let d = model.diagnostics();
    let mut out = String::new();
    out.push_str(&format!("Population model ({}):\n", model.family().display_name()));
    if let Some((lo, hi)) = model.age_range() {
        out.push_str(&format!("- age range: [{lo:.2}, {hi:.2}]\n"));
    }
    out.push_str(&format!(
        "- subjects={} observations={} cycles={} inner-cap hits={}\n",
        d.n_subjects, d.n_observations, d.cycles, d.inner_cap_hits
    ));
    out.push_str(&format!(
        "- deviance={:.4} penalized={:.4} edf={:.2} AIC={:.4}\n",
        d.deviance,
        d.penalized_deviance,
        d.total_edf,
        model.aic()
    ));
    for p in model.family().active_params() {
        let term = model.term(*p);
        out.push_str(&format!(
            "- {:<6} {:?} edf={:.2} lambda={}\n",
            p.name(),
            term.kind(),
            d.edf[p.index()],
            fmt_lambda(term.lambda())
        ));
    }
    out
}

/// Centile thresholds, one row per age.
pub fn format_centile_table(set: &CentileSet) -> String {
    let levels = set.levels();
    let mut widths = vec![8];
    widths.extend(levels.iter().map(|_| 12));

    let mut title = format!("{:>8}", "age");
    for level in &levels {
        title.push_str(&format!(" {:>12}", format!("p={level}")));
    }
    let mut out = header(&title, &widths);
    for row in set.rows() {
        let mut line = format!("{:>8.2}", row.age);
        for v in &row.thresholds {
            line.push_str(&format!(" {v:>12.5}"));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    if set.warning_count() > 0 {
        out.push_str(&format!("({} monotonicity warnings)\n", set.warning_count()));
    }
    out
}

pub fn format_coverage(rows: &[CoverageRow]) -> String {
    let mut out = String::from("Centile coverage (expected vs observed share below):\n");
    for r in rows {
        out.push_str(&format!(
            "- {:>8.5} {:>8.5} (n={})\n",
            r.level, r.observed, r.n
        ));
    }
    out
}

/// Most extreme observations on both sides.
pub fn format_extremes(extremes: &Extremes) -> String {
    let mut out = String::new();
    out.push_str("Highest z-scores:\n");
    out.push_str(&format_scores(&extremes.high));
    out.push('\n');
    out.push_str("Lowest z-scores:\n");
    out.push_str(&format_scores(&extremes.low));
    out
}

fn format_scores(rows: &[ObservationScore]) -> String {
    let mut out = header(
        &format!("{:<16} {:>8} {:>12} {:>8}", "subject", "age", "value", "z"),
        &[16, 8, 12, 8],
    );
    for s in rows {
        let line = format!(
            "{:<16} {:>8.2} {:>12.5} {:>8.3}",
            truncate(&s.subject_id, 16),
            s.age,
            s.value,
            s.z
        );
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn header(title: &str, widths: &[usize]) -> String {
    let mut out = String::new();
    out.push_str(title.trim_end());
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join(" "));
    out.push('\n');
    out
}

fn fmt_lambda(lambda: f64) -> String {
    if lambda == 0.0 { "-".to_string() } else { format!("{lambda:.3e}") }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}
