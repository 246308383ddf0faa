//! Text tables and JSON rendering for command output

use gremlin_core::{Action, AssertionResult, StoredRule};
use serde::Serialize;

/// Bordered, left-aligned text table
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub(crate) fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub(crate) fn row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cells: Vec<String> = cells.into_iter().map(Into::into).collect();
        cells.resize(self.headers.len(), String::new());
        self.rows.push(cells);
    }

    pub(crate) fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let border = widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+");
        let border = format!("+{border}+\n");
        let line = |cells: &[String]| {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, &w)| format!(" {cell:<w$} "))
                .collect();
            format!("|{}|\n", padded.join("|"))
        };

        let mut out = border.clone();
        out.push_str(&line(&self.headers));
        out.push_str(&border);
        for row in &self.rows {
            out.push_str(&line(row));
        }
        out.push_str(&border);
        out
    }
}

pub(crate) fn pass_or_fail(success: bool) -> &'static str {
    if success {
        "PASS"
    } else {
        "FAIL"
    }
}

pub(crate) fn results_table(results: &[AssertionResult]) -> Table {
    let mut table = Table::new(["AssertionName", "Source", "Destination", "Result", "ErrorMsg"]);
    for result in results {
        table.row([
            result.name.as_str(),
            result.source.as_str(),
            result.dest.as_str(),
            pass_or_fail(result.success),
            result.error_message.as_str(),
        ]);
    }
    table
}

pub(crate) fn rules_table(rules: &[StoredRule]) -> Table {
    let mut table = Table::new([
        "Source",
        "Destination",
        "Header",
        "Header Pattern",
        "Delay Probability",
        "Delay",
        "Abort Probability",
        "Abort Code",
        "Rule Id",
    ]);
    for stored in rules {
        let rule = &stored.rule;
        let (header, pattern) = rule
            .matcher
            .headers
            .iter()
            .next()
            .map_or((String::new(), String::new()), |(h, p)| (h.clone(), p.clone()));
        let mut delay = (String::new(), String::new());
        let mut abort = (String::new(), String::new());
        for action in &rule.actions {
            match action {
                Action::Delay {
                    probability,
                    duration,
                    ..
                } => delay = (probability.to_string(), format!("{duration}s")),
                Action::Abort {
                    probability,
                    return_code,
                    ..
                } => abort = (probability.to_string(), return_code.to_string()),
                Action::Trace { .. } => {}
            }
        }
        table.row([
            rule.source_name().unwrap_or("*").to_string(),
            rule.destination.clone(),
            header,
            pattern,
            delay.0,
            delay.1,
            abort.0,
            abort.1,
            stored.id.clone(),
        ]);
    }
    table
}

/// One `service-list` line: name plus `version(count)` entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ServiceSummary {
    pub(crate) service: String,
    pub(crate) instances: Vec<String>,
}

pub(crate) fn services_table(services: &[ServiceSummary]) -> Table {
    let mut table = Table::new(["Service", "Instances"]);
    for summary in services {
        table.row([summary.service.clone(), summary.instances.join(", ")]);
    }
    table
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
