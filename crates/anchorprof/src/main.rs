use anchorprof::cli::Cli;
use anchorprof::error::exit_code;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() {
                exit_code::INVALID_ARGUMENTS
            } else {
                // --help / --version
                exit_code::SUCCESS
            };
            return ExitCode::from(code as u8);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(anchorprof_err) = e.downcast_ref::<anchorprof::Error>() {
                ExitCode::from(anchorprof_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    use anyhow::Context;

    cli.validate().context("Invalid arguments")?;
    anchorprof::commands::report::run(&cli.logs, cli.format(), cli.filter.as_deref())
        .context("Failed to write report")?;
    Ok(())
}
