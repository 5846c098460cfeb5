use colored::*;
use log::{error, info};
use std::path::Path;

use netsolve::cli::{build_cli, CliArgs};
use netsolve::pipe_network::PipeNetwork;
use netsolve::simulator::{Simulator, SimulatorConfig};

fn main() {
    let matches = build_cli().get_matches();

    let args = match CliArgs::from_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", format!("Error: {}", e).red());
            std::process::exit(2);
        }
    };

    env_logger::Builder::new()
        .filter_level(args.log_level())
        .parse_default_env()
        .init();

    if let Err(e) = run_application(args) {
        error!("{:#}", e);
        eprintln!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

fn run_application(args: CliArgs) -> anyhow::Result<()> {
    info!("{}", "Starting netsolve".green().bold());

    let config = SimulatorConfig {
        friction_seed: args.friction_seed,
        ..SimulatorConfig::default()
    };
    let mut simulator = Simulator::with_config(config);

    if args.pipe_example {
        info!("Solving the eight-node pipe network");
        let mut network = PipeNetwork::eight_node_example()?;
        simulator.run_pipe_analysis(&mut network, args.initial_guess.as_deref())?;
    } else if let Some(input_file) = &args.input_file {
        info!("Input file: {}", input_file.bright_blue());
        if !Path::new(input_file).exists() {
            return Err(anyhow::anyhow!("Input file '{}' not found", input_file));
        }
        simulator.load_network(input_file)?;
        simulator.run_resistor_analysis(args.initial_guess.as_deref())?;
    }

    if let Some(output_file) = args.output_file {
        simulator.export_results(&output_file, args.output_format)?;
        info!("Results exported to: {}", output_file.bright_green());
    } else {
        simulator.print_summary();
    }

    info!("{}", "Solve completed successfully!".green().bold());
    Ok(())
}
