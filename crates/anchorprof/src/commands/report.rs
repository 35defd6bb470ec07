use crate::cli::OutputFormat;
use crate::error::{Error, Result};
use crate::parser::LogReader;
use crate::stats::{Aggregator, GroupStats};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A log that could not be read to the end.
#[derive(Debug)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub error: Error,
}

/// Everything read from a set of logs.
pub struct Report {
    pub files: usize,
    pub blocks: usize,
    pub records: usize,
    pub groups: Vec<GroupStats>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn run(logs: &[PathBuf], format: OutputFormat, filter: Option<&str>) -> Result<()> {
    let mut report = load(logs);
    for diagnostic in &report.diagnostics {
        log::warn!("{}", diagnostic.error);
        eprintln!("warning: {}", diagnostic.error);
    }
    if let Some(filter) = filter {
        report.groups.retain(|group| group.function.contains(filter));
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    render(&mut out, &report, format)?;
    out.flush()?;
    Ok(())
}

/// Parse every log into one aggregate. A failing file contributes the blocks
/// read before the failure and a diagnostic.
pub fn load(logs: &[PathBuf]) -> Report {
    let mut aggregator = Aggregator::new();
    let mut diagnostics = Vec::new();

    for path in logs {
        if let Err(error) = load_file(path, &mut aggregator) {
            diagnostics.push(Diagnostic {
                path: path.clone(),
                error,
            });
        }
    }

    Report {
        files: logs.len(),
        blocks: aggregator.blocks(),
        records: aggregator.records(),
        groups: aggregator.finish(),
        diagnostics,
    }
}

fn load_file(path: &Path, aggregator: &mut Aggregator) -> Result<()> {
    let reader = LogReader::open(path).map_err(|err| match err {
        Error::Io(source) => Error::Io(io::Error::new(
            source.kind(),
            format!("{}: {source}", path.display()),
        )),
        other => other,
    })?;
    let before = aggregator.blocks();
    for block in reader {
        aggregator.add_block(&block?);
    }
    log::debug!(
        "{}: {} blocks",
        path.display(),
        aggregator.blocks() - before
    );
    Ok(())
}

pub fn render<W: Write>(out: &mut W, report: &Report, format: OutputFormat) -> io::Result<()> {
    match format {
        OutputFormat::Table => print_table(out, report),
        OutputFormat::Json => print_json(out, report),
        OutputFormat::Csv => print_csv(out, &report.groups),
    }
}

fn print_table<W: Write>(out: &mut W, report: &Report) -> io::Result<()> {
    writeln!(
        out,
        "# {} file(s) | {} blocks | {} records",
        report.files,
        format_count(report.blocks as u64),
        format_count(report.records as u64)
    )?;
    if !report.diagnostics.is_empty() {
        writeln!(out, "# {} file(s) incomplete", report.diagnostics.len())?;
    }
    writeln!(out)?;

    let width = report
        .groups
        .iter()
        .map(|g| g.function.len())
        .max()
        .unwrap_or(0)
        .max("FUNCTION".len());

    writeln!(
        out,
        "{:<width$}  {:<16} {:>10} {:>14} {:>14} {:>12} {:>12} {:>12} {:>12}",
        "FUNCTION", "KIND", "COUNT", "MEAN", "STDDEV", "MIN", "P50", "P99", "MAX"
    )?;
    writeln!(out, "{}", "-".repeat(width + 2 + 16 + 10 + 14 * 2 + 12 * 4 + 8))?;

    for group in &report.groups {
        let s = &group.summary;
        writeln!(
            out,
            "{:<width$}  {:<16} {:>10} {:>14.1} {:>14.1} {:>12} {:>12} {:>12} {:>12}",
            group.function,
            group.kind_label(),
            format_count(s.count as u64),
            s.mean,
            s.stddev,
            s.min,
            s.p50,
            s.p99,
            s.max
        )?;
    }
    Ok(())
}

fn print_json<W: Write>(out: &mut W, report: &Report) -> io::Result<()> {
    writeln!(out, "{{")?;
    writeln!(out, "  \"files\": {},", report.files)?;
    writeln!(out, "  \"blocks\": {},", report.blocks)?;
    writeln!(out, "  \"records\": {},", report.records)?;

    writeln!(out, "  \"diagnostics\": [")?;
    for (i, diagnostic) in report.diagnostics.iter().enumerate() {
        let comma = if i + 1 < report.diagnostics.len() { "," } else { "" };
        writeln!(
            out,
            "    {{ \"file\": \"{}\", \"error\": \"{}\" }}{}",
            escape_json(&diagnostic.path.display().to_string()),
            escape_json(&diagnostic.error.to_string()),
            comma
        )?;
    }
    writeln!(out, "  ],")?;

    writeln!(out, "  \"functions\": [")?;
    for (i, group) in report.groups.iter().enumerate() {
        let comma = if i + 1 < report.groups.len() { "," } else { "" };
        let s = &group.summary;
        writeln!(
            out,
            "    {{ \"function\": \"{}\", \"kind\": \"{}\", \"count\": {}, \"mean\": {:.3}, \"stddev\": {:.3}, \"min\": {}, \"p50\": {}, \"p99\": {}, \"max\": {} }}{}",
            escape_json(&group.function),
            escape_json(&group.kind_label()),
            s.count,
            s.mean,
            s.stddev,
            s.min,
            s.p50,
            s.p99,
            s.max,
            comma
        )?;
    }
    writeln!(out, "  ]")?;
    writeln!(out, "}}")
}

fn print_csv<W: Write>(out: &mut W, groups: &[GroupStats]) -> io::Result<()> {
    writeln!(out, "function,kind,count,mean,stddev,min,p50,p99,max")?;
    for group in groups {
        let s = &group.summary;
        writeln!(
            out,
            "\"{}\",{},{},{:.3},{:.3},{},{},{},{}",
            group.function.replace('"', "\"\""),
            group.kind_label(),
            s.count,
            s.mean,
            s.stddev,
            s.min,
            s.p50,
            s.p99,
            s.max
        )?;
    }
    Ok(())
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Format a number with commas for readability
fn format_count(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
