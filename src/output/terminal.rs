// Rich terminal rendering of task results

use std::fmt::Write as _;

use colored::*;
use serde_json::Value;

use crate::executor::result::{AggregatedResult, TaskResult};

/// What [`print_result`] shows
#[derive(Debug, Clone)]
pub struct PrintOptions {
    /// Only this host
    pub host: Option<String>,
    /// Only hosts that failed
    pub failed_only: bool,
    /// Include results of sub-tasks
    pub show_sub_results: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        PrintOptions {
            host: None,
            failed_only: false,
            show_sub_results: true,
        }
    }
}

/// Print an aggregated result to stdout
pub fn print_result(result: &AggregatedResult, options: &PrintOptions) {
    // Respect NO_COLOR and avoid escape codes when piped
    if std::env::var("NO_COLOR").is_ok() || !console::Term::stdout().is_term() {
        colored::control::set_override(false);
    }

    print!("{}", format_result(result, options));
}

/// Render an aggregated result the way [`print_result`] prints it
pub fn format_result(result: &AggregatedResult, options: &PrintOptions) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} {} {}",
        "TASK".yellow().bold(),
        result.name().cyan(),
        "─".repeat(40).dimmed()
    );

    for host_result in result.iter() {
        if options.failed_only && !host_result.failed() {
            continue;
        }
        if let Some(ref host) = options.host {
            if &host_result.host != host {
                continue;
            }
        }

        let _ = writeln!(
            out,
            "{} {} {} {}",
            "*".blue(),
            host_result.host.white().bold(),
            "=>".dimmed(),
            status(host_result)
        );
        format_task(&mut out, host_result, 1, options.show_sub_results);
    }

    out
}

fn status(result: &TaskResult) -> ColoredString {
    if result.failed() {
        "FAILED".red().bold()
    } else if result.changed {
        "CHANGED".yellow()
    } else {
        "OK".green()
    }
}

fn format_task(out: &mut String, result: &TaskResult, depth: usize, show_sub_results: bool) {
    let indent = "  ".repeat(depth);
    let header = format!("---- {} ----", result.name);
    let header = if result.failed() {
        header.red()
    } else if result.changed {
        header.yellow()
    } else {
        header.green()
    };
    let _ = writeln!(out, "{}{}", indent, header);

    let body = match &result.result {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => serde_json::to_string_pretty(other).ok(),
    };
    if let Some(body) = body {
        for line in body.lines() {
            let _ = writeln!(out, "{}  {}", indent, line);
        }
    }

    if show_sub_results {
        for sub in &result.sub_results {
            format_task(out, sub, depth + 1, show_sub_results);
        }
    }
}
