use crate::error::{Error, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "anchorprof")]
#[command(about = "Per-function statistics from anchorprof measurement logs")]
#[command(version)]
pub struct Cli {
    /// Measurement logs, merged into one report
    #[arg(required = true, value_name = "LOG")]
    pub logs: Vec<PathBuf>,

    /// Output as JSON
    #[arg(long, conflicts_with = "csv")]
    pub json: bool,

    /// Output as CSV
    #[arg(long)]
    pub csv: bool,

    /// Only report functions whose name contains this text
    #[arg(long, short = 'f')]
    pub filter: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl Cli {
    pub fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else if self.csv {
            OutputFormat::Csv
        } else {
            OutputFormat::Table
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.filter.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "--filter needs a non-empty pattern".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_logs_and_format() {
        let cli = Cli::try_parse_from(["anchorprof", "--csv", "a.bin", "b.bin"]).unwrap();
        assert_eq!(cli.logs.len(), 2);
        assert_eq!(cli.format(), OutputFormat::Csv);
        cli.validate().unwrap();
    }

    #[test]
    fn requires_a_log() {
        assert!(Cli::try_parse_from(["anchorprof"]).is_err());
    }

    #[test]
    fn json_and_csv_conflict() {
        assert!(Cli::try_parse_from(["anchorprof", "--json", "--csv", "a.bin"]).is_err());
    }

    #[test]
    fn blank_filter_is_rejected() {
        let cli = Cli::try_parse_from(["anchorprof", "-f", " ", "a.bin"]).unwrap();
        assert!(matches!(cli.validate(), Err(Error::InvalidArgument(_))));
    }
}
