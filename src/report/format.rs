//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the calibration code stays clean and testable
//! - output changes are localized

use crate::calibration::{CalibrationReport, SpeciesOutcome};
use crate::domain::CalibrationConfig;
use crate::fit::{
    MultiStartSummary, ObjectiveBreakdown, OptimizationResult, OptimizationStatus, ParamLayout, Profile,
};
use crate::io::{IngestedData, RowError};
use crate::spectrum::SizeSpectrumState;

/// Format the full run summary (ingest stats + per-species outcome).
pub fn format_run_summary(ingest: &IngestedData, report: &CalibrationReport, config: &CalibrationConfig) -> String {
    let mut out = String::new();

    out.push_str("=== scal - size-spectrum calibration ===\n");
    out.push_str(&format!(
        "Tables: species={} gears={} catches={} ecopath={} diet={} kernels={}\n",
        ingest.input.species.len(),
        ingest.input.gears.len(),
        ingest.input.catches.len(),
        ingest.input.ecopath.len(),
        ingest.input.diet.len(),
        ingest.input.kernels.len(),
    ));
    out.push_str(&format!(
        "Rows: read={} skipped={}\n",
        ingest.rows_read,
        ingest.row_errors.len()
    ));
    out.push_str(&format!(
        "Grid: {} nodes | lambda yield={} production={} | restarts={} seed={}\n",
        config.grid_points, config.yield_lambda, config.production_lambda, config.restarts, config.seed,
    ));

    out.push_str("\nSpecies:\n");
    out.push_str(&format_species_table(report));

    let failures: Vec<&SpeciesOutcome> = report.failures().collect();
    if !failures.is_empty() {
        out.push_str("\nAborted:\n");
        for outcome in failures {
            if let Some(err) = outcome.error() {
                out.push_str(&format!("- {err}\n"));
            }
        }
    }

    let fits: Vec<_> = report
        .outcomes
        .iter()
        .filter_map(|o| o.record().catch_fit.as_ref().map(|fit| (o.record().species(), fit)))
        .collect();
    if !fits.is_empty() {
        out.push_str("\nCatch fits:\n");
        for (species, fit) in fits {
            out.push_str(&format!(
                "- {species}/{}: objective={:.6} status={} attempts={} iterations={}\n",
                fit.gear,
                fit.breakdown.total,
                fmt_status(fit.status),
                fit.attempts,
                fit.iterations,
            ));
            out.push_str(&format!("  {}\n", fmt_params(fit.layout, &fit.parameters)));
        }
    }

    if let Some(matrix) = &report.interactions {
        out.push_str("\nInteractions (predator x prey):\n");
        out.push_str(&format!("{:<12}", ""));
        for prey in &matrix.species {
            out.push_str(&format!(" {:>10}", truncate(prey, 10)));
        }
        out.push('\n');
        for (predator, row) in matrix.species.iter().zip(&matrix.values) {
            out.push_str(&format!("{:<12}", truncate(predator, 12)));
            for v in row {
                out.push_str(&format!(" {v:>10.4}"));
            }
            out.push('\n');
        }
    }
    out.push('\n');

    out
}

fn format_species_table(report: &CalibrationReport) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<16} {:<20} {:>12} {:>12} {:>12} {:>12} {:>8}\n",
            "species", "stage", "biomass", "yield", "production", "consumption", "mu_mat"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<16} {:-<20} {:-<12} {:-<12} {:-<12} {:-<12} {:-<8}\n",
            "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for outcome in &report.outcomes {
        let record = outcome.record();
        let cell = |f: fn(&SizeSpectrumState) -> f64| {
            record
                .state
                .as_ref()
                .map(|s| format!("{:.4e}", f(s)))
                .unwrap_or_else(|| "-".to_string())
        };
        let stage = match outcome {
            SpeciesOutcome::Calibrated(_) => record.stage.display_name().to_string(),
            SpeciesOutcome::Aborted { .. } => format!("{} (aborted)", record.stage.display_name()),
        };
        out.push_str(
            format!(
                "{:<16} {:<20} {:>12} {:>12} {:>12} {:>12} {:>8}\n",
                truncate(record.species(), 16),
                stage,
                cell(|s| s.biomass()),
                cell(|s| s.yield_rate()),
                cell(|s| s.production()),
                cell(|s| s.consumption()),
                record
                    .params
                    .mu_mat
                    .map(|m| format!("{m:.4}"))
                    .unwrap_or_else(|| "-".to_string()),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// Format skipped input rows (first `max` of them).
pub fn format_row_errors(errors: &[RowError], max: usize) -> String {
    let mut out = String::new();
    for e in errors.iter().take(max) {
        out.push_str(&format!("- {} line {}: {}\n", e.table, e.line, e.message));
    }
    if errors.len() > max {
        out.push_str(&format!("  ... and {} more\n", errors.len() - max));
    }
    out
}

/// Format one objective evaluation.
pub fn format_breakdown(species: &str, layout: ParamLayout, theta: &[f64], breakdown: &ObjectiveBreakdown) -> String {
    let mut out = String::new();
    out.push_str(&format!("Objective for {species}:\n"));
    out.push_str(&format!("- parameters: {}\n", fmt_params(layout, theta)));
    out.push_str(&format!("- total      : {:.6}\n", breakdown.total));
    out.push_str(&format!("- deviance   : {:.6}\n", breakdown.deviance));
    out.push_str(&format!(
        "- yield      : {:.6} (predicted {:.4e})\n",
        breakdown.yield_term, breakdown.predicted_yield
    ));
    out.push_str(&format!(
        "- production : {:.6} (predicted {:.4e})\n",
        breakdown.production_term, breakdown.predicted_production
    ));
    out
}

/// Format a single optimizer run.
pub fn format_optimization(species: &str, layout: ParamLayout, result: &OptimizationResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("Optimization for {species}:\n"));
    out.push_str(&format!("- status     : {}\n", fmt_status(result.status)));
    out.push_str(&format!("- objective  : {:.6}\n", result.objective));
    out.push_str(&format!(
        "- iterations : {} ({} evaluations)\n",
        result.iterations, result.evaluations
    ));
    out.push_str(&format!("- parameters : {}\n", fmt_params(layout, &result.parameters)));
    out
}

/// Format a multi-start robustness summary.
pub fn format_multistart(summary: &MultiStartSummary, layout: ParamLayout) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Multi-start for {}: {} runs, success rate {:.0}%\n",
        summary.species,
        summary.runs.len(),
        100.0 * summary.success_rate
    ));
    match summary.best_run() {
        Some(best) => {
            out.push_str(&format!("- best objective : {:.6} (run {})\n", summary.best_objective, best.index));
            out.push_str(&format!("- best parameters: {}\n", fmt_params(layout, &best.result.parameters)));
        }
        None => out.push_str("- no usable run\n"),
    }
    if let Some((q1, q3)) = summary.quartiles {
        out.push_str(&format!("- quartiles      : Q1={q1:.6} Q3={q3:.6}\n"));
    }
    out.push_str(&format!("- within band    : {}\n", summary.in_band));
    let outliers: Vec<String> = summary.outliers().map(|r| r.index.to_string()).collect();
    if !outliers.is_empty() {
        out.push_str(&format!("- outliers       : runs {}\n", outliers.join(", ")));
    }

    out.push_str("\nParameter spread of in-band runs:\n");
    for s in &summary.spread {
        out.push_str(&format!(
            "  {:<12} [{:.6}, {:.6}] rel={:.4}\n",
            s.name, s.min, s.max, s.relative_range
        ));
    }
    if summary.non_identifiable {
        out.push_str("Warning: distinct parameter sets reach equivalent objectives (flat ridge).\n");
    }
    out
}

/// Format a likelihood profile.
pub fn format_profile(profile: &Profile) -> String {
    let mut out = String::new();
    out.push_str(&format!("Profile of {} for {}:\n", profile.parameter, profile.species));
    out.push_str(&format!("{:>14} {:>14} {:<16}\n", "value", "objective", "status").trim_end());
    out.push('\n');
    let best = profile.best_point().map(|p| p.value);
    for point in &profile.points {
        let marker = if Some(point.value) == best { "*" } else { "" };
        out.push_str(
            format!(
                "{:>14.6} {:>14.6} {:<16} {marker}\n",
                point.value,
                point.result.objective,
                fmt_status(point.result.status)
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out.push_str(&format!("Objective range: {:.6}\n", profile.objective_range));
    if profile.flat {
        out.push_str("Warning: profile is flat; the parameter is not identified by the data.\n");
    }
    out
}

fn fmt_status(status: OptimizationStatus) -> String {
    match status {
        OptimizationStatus::Converged => "converged".to_string(),
        OptimizationStatus::IterationLimit => "iteration-limit".to_string(),
        OptimizationStatus::Stalled => "stalled".to_string(),
        OptimizationStatus::Failed(reason) => format!("failed ({reason})"),
    }
}

fn fmt_params(layout: ParamLayout, theta: &[f64]) -> String {
    let parts: Vec<String> = layout
        .names()
        .iter()
        .zip(theta)
        .map(|(name, v)| format!("{name}={v:.6}"))
        .collect();
    parts.join(" ")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{fixtures, SpeciesCalibration};
    use crate::error::CalibrationError;
    use crate::fit::FailureReason;

    #[test]
    fn species_table_marks_aborted_species() {
        let report = CalibrationReport {
            outcomes: vec![
                SpeciesOutcome::Calibrated(fixtures::biomass_matched(fixtures::gear())),
                SpeciesOutcome::Aborted {
                    record: SpeciesCalibration::new(fixtures::species(), &[]),
                    error: CalibrationError::structural("cod", "broken"),
                },
            ],
            interactions: None,
        };
        let table = format_species_table(&report);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("biomass-matched"));
        assert!(lines[2].contains("1.0000e3"));
        assert!(lines[3].contains("raw (aborted)"));
        assert!(lines[3].ends_with("0.3000"));
    }

    #[test]
    fn optimization_lists_named_parameters() {
        let result = OptimizationResult {
            parameters: vec![40.0, 0.85, 0.3, 0.2],
            objective: 1.5,
            iterations: 12,
            evaluations: 20,
            status: OptimizationStatus::Failed(FailureReason::NonConvergent),
        };
        let text = format_optimization("cod", ParamLayout::Sigmoid, &result);
        assert!(text.contains("failed (non-convergent)"));
        assert!(text.contains("l50=40.000000"));
        assert!(text.contains("12 (20 evaluations)"));
    }

    #[test]
    fn truncate_long_names() {
        assert_eq!(truncate("cod", 5), "cod");
        assert_eq!(truncate("haddock", 5), "hadd.");
    }
}
