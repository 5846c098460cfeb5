use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub input_file: Option<String>,
    pub pipe_example: bool,
    pub initial_guess: Option<Vec<f64>>,
    pub friction_seed: Option<u64>,
    pub output_file: Option<String>,
    pub output_format: OutputFormat,
    pub verbose_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

pub fn build_cli() -> Command {
    Command::new("netsolve")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Solves resistor and pipe networks from loop and node topology")
        .arg(
            Arg::new("input")
                .help("Resistor network definition file")
                .required_unless_present("pipe-example")
                .index(1),
        )
        .arg(
            Arg::new("pipe-example")
                .long("pipe-example")
                .action(ArgAction::SetTrue)
                .conflicts_with("input")
                .help("Solve the built-in eight-node pipe network"),
        )
        .arg(
            Arg::new("guess")
                .short('g')
                .long("guess")
                .value_name("LIST")
                .help("Comma-separated initial guess, one value per unknown"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("N")
                .value_parser(clap::value_parser!(u64))
                .help("Seed for transitional friction sampling"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file for results"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .default_value("csv")
                .value_parser(["csv", "json"])
                .help("Output format"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase verbosity level"),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input_file = matches.get_one::<String>("input").cloned();
        let pipe_example = matches.get_flag("pipe-example");
        if input_file.is_none() && !pipe_example {
            return Err(anyhow!("An input file or --pipe-example is required"));
        }

        let initial_guess = matches
            .get_one::<String>("guess")
            .map(|list| parse_guess_list(list))
            .transpose()?;

        let output_format = match matches.get_one::<String>("format").map(String::as_str) {
            Some("json") => OutputFormat::Json,
            Some("csv") | None => OutputFormat::Csv,
            Some(other) => return Err(anyhow!("Invalid output format '{}'", other)),
        };

        Ok(CliArgs {
            input_file,
            pipe_example,
            initial_guess,
            friction_seed: matches.get_one::<u64>("seed").copied(),
            output_file: matches.get_one::<String>("output").cloned(),
            output_format,
            verbose_level: matches.get_count("verbose"),
        })
    }

    /// Log level filter for the requested verbosity
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose_level {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Parse a guess such as "10, 10, -5"
fn parse_guess_list(list: &str) -> Result<Vec<f64>> {
    list.split(',')
        .map(|v| {
            let v = v.trim();
            v.parse::<f64>()
                .map_err(|e| anyhow!("Invalid guess value '{}': {}", v, e))
        })
        .collect()
}
