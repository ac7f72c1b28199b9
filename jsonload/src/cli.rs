use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;

/// Load gzipped JSON files into downstream sinks.
#[derive(Parser, Debug)]
#[command(name = "jsonload", version, about)]
pub struct Cli {
    /// Comma separated names of the datasets to run
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub dataset: Vec<String>,

    /// Path to the datasets file, overrides DATASETS_CONFIG_PATH
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// What to do after parsing the command line.
#[derive(Debug)]
pub enum Invocation {
    Run(Cli),
    /// Help or version was printed.
    Exit,
    /// The arguments were invalid and usage was printed.
    Invalid,
}

impl Cli {
    /// Dataset names with surrounding whitespace and empty entries removed.
    pub fn datasets(&self) -> Vec<String> {
        self.dataset
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

pub fn parse<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Invocation::Run(cli),
        Err(err) => {
            err.print().ok();
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Invocation::Exit,
                _ => Invocation::Invalid,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_list() {
        let Invocation::Run(cli) = parse(["jsonload", "--dataset", "logs, metrics,,"]) else {
            panic!("expected to run");
        };
        assert_eq!(cli.datasets(), vec!["logs", "metrics"]);
        assert!(cli.config.is_none());

        let Invocation::Run(cli) = parse(["jsonload", "-d", "logs", "-c", "/etc/jsonload.json"]) else {
            panic!("expected to run");
        };
        assert_eq!(cli.datasets(), vec!["logs"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/jsonload.json")));
    }

    #[test]
    fn test_help_and_errors() {
        assert!(matches!(parse(["jsonload", "--help"]), Invocation::Exit));
        assert!(matches!(parse(["jsonload", "--version"]), Invocation::Exit));
        assert!(matches!(parse(["jsonload"]), Invocation::Invalid));
        assert!(matches!(parse(["jsonload", "-d", "logs", "--bogus"]), Invocation::Invalid));
    }
}
