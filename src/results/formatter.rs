// SPDX-License-Identifier: PMPL-1.0-or-later

//! Terminal summaries for the `qleval` binary

use crate::plan::Stratification;
use crate::results::{BatchReport, QueryOutcome, ResultSet};
use crate::store::FactStore;
use colored::*;

/// Rows printed per result before eliding the rest
const ROW_PREVIEW: usize = 20;

pub struct ResultFormatter {
    preview: usize,
}

impl ResultFormatter {
    pub fn new() -> Self {
        Self {
            preview: ROW_PREVIEW,
        }
    }

    pub fn with_preview(mut self, rows: usize) -> Self {
        self.preview = rows;
        self
    }

    pub fn print_batch(&self, report: &BatchReport, store: &FactStore) {
        println!("\n{}", "=== QLEVAL BATCH REPORT ===".bold().cyan());
        println!("  Store: {}", report.store_fingerprint.dimmed());
        println!("  Created: {}", report.created_at);
        println!();

        for outcome in &report.outcomes {
            println!("{}", self.outcome_line(outcome));
            if let Ok(result) = &outcome.result {
                self.print_rows(result, store);
            }
        }
        println!();

        let stats = &report.stats;
        println!("{}", "EVALUATION".bold().yellow());
        println!("  Strata evaluated: {}", stats.strata_evaluated);
        println!("  Predicates evaluated: {}", stats.predicates_evaluated);
        println!("  Fixpoint rounds: {}", stats.rounds);
        println!("  Tuples derived: {}", stats.tuples_derived);
        println!("  Joins: {}", stats.joins);
        if stats.cartesian_joins > 0 {
            println!(
                "  Cartesian joins: {}",
                stats.cartesian_joins.to_string().yellow().bold()
            );
        }
        println!();

        let summary = format!(
            "{} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        if report.failed() == 0 {
            println!("{}", summary.green().bold());
        } else {
            println!("{}", summary.red().bold());
        }
    }

    /// One status line per query
    pub fn outcome_line(&self, outcome: &QueryOutcome) -> String {
        match &outcome.result {
            Ok(result) => format!(
                "  {} {} ({} row(s), {} ms)",
                "OK".green(),
                outcome.query.bold(),
                result.len(),
                outcome.elapsed_ms
            ),
            Err(err) => format!(
                "  {} {} [{}] {}",
                "FAILED".red(),
                outcome.query.bold(),
                err.kind(),
                err.to_string().dimmed()
            ),
        }
    }

    pub fn print_rows(&self, result: &ResultSet, store: &FactStore) {
        if let Ok(diagnostics) = result.diagnostics() {
            for d in diagnostics.iter().take(self.preview) {
                let location = store
                    .entity(d.entity)
                    .and_then(|info| info.location.as_ref())
                    .map(|loc| loc.to_string())
                    .unwrap_or_else(|| d.entity.to_string());
                println!(
                    "    - [{}] {} {}",
                    d.severity.to_string().yellow(),
                    d.message,
                    location.dimmed()
                );
            }
        } else {
            let header: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
            println!("    {}", header.join(" | ").dimmed());
            for row in result.rows.iter().take(self.preview) {
                let cells: Vec<String> = row.iter().map(|v| store.render(v)).collect();
                println!("    {}", cells.join(" | "));
            }
        }
        if result.len() > self.preview {
            println!("    ... {} more", result.len() - self.preview);
        }
    }

    pub fn print_strata(&self, strata: &Stratification) {
        println!("{}", "STRATA".bold().yellow());
        for stratum in &strata.strata {
            let marker = if stratum.recursive { " (recursive)" } else { "" };
            println!(
                "  #{} level {}{}: {}",
                stratum.id,
                stratum.level,
                marker,
                stratum.predicates.join(", ")
            );
            for name in &stratum.predicates {
                if let Some(err) = strata.error_for(name) {
                    println!("    {} {}", "error:".red().bold(), err);
                }
            }
        }
    }

    pub fn print_store(&self, store: &FactStore) {
        println!("{}", "FACT STORE".bold().yellow());
        println!("  Fingerprint: {}", store.fingerprint().dimmed());
        println!("  Entities: {}", store.entity_count());
        println!("  Facts: {}", store.len());
        for name in store.relation_names() {
            if let Ok(rel) = store.get_relation(name) {
                let types: Vec<String> = rel
                    .schema()
                    .columns
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.ty))
                    .collect();
                println!("  {}({}) {}", name.bold(), types.join(", "), rel.len());
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new()
    }
}
