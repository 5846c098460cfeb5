use anyhow::{anyhow, Context, Result};
use colored::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

use crate::circuit::ResistorNetwork;
use crate::cli::OutputFormat;
use crate::parser::{NetworkDescription, NetworkParser};
use crate::pipe_network::PipeNetwork;
use crate::solver::{SolverConfig, SolverStats};

/// Which kind of network a report describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    Resistor,
    Pipe,
}

/// Solved current or flow of one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementValue {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Residual of a node balance or loop equation at the solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceInfo {
    pub iterations: usize,
    pub function_evaluations: usize,
    pub residual_norm: f64,
    pub solve_time: f64,
    pub solver_method: String,
}

impl From<&SolverStats> for ConvergenceInfo {
    fn from(stats: &SolverStats) -> Self {
        ConvergenceInfo {
            iterations: stats.iterations,
            function_evaluations: stats.function_evaluations,
            residual_norm: stats.residual_norm,
            solve_time: stats.solve_time,
            solver_method: format!("{:?}", stats.method_used),
        }
    }
}

/// Results of one network solve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveReport {
    pub network: String,
    pub kind: NetworkKind,
    pub elements: Vec<ElementValue>,
    pub nodes: Vec<ResidualValue>,
    /// Loop residuals; pipe loops use friction redrawn from the seed start
    pub loops: Vec<ResidualValue>,
    pub convergence: ConvergenceInfo,
    pub success: bool,
}

impl SolveReport {
    pub fn element(&self, name: &str) -> Option<f64> {
        self.elements.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// Largest node or loop residual magnitude
    pub fn max_residual(&self) -> f64 {
        self.nodes
            .iter()
            .chain(&self.loops)
            .map(|r| r.value.abs())
            .fold(0.0, f64::max)
    }

    /// Plain-text listing of element values and residuals
    pub fn summary(&self) -> String {
        let (element_label, loop_label) = match self.kind {
            NetworkKind::Resistor => ("Resistor currents", "Loop voltages"),
            NetworkKind::Pipe => ("Pipe flow rates", "Loop head losses"),
        };
        let mut out = String::new();
        let _ = writeln!(out, "=== {} ===", self.network);
        let _ = writeln!(
            out,
            "Converged in {} iterations ({} evaluations), residual norm {:.2e}",
            self.convergence.iterations, self.convergence.function_evaluations, self.convergence.residual_norm
        );
        let _ = writeln!(out, "\n{}:", element_label);
        for e in &self.elements {
            let _ = writeln!(out, "  {:<8} {:>12.6} {}", e.name, e.value, e.unit);
        }
        let _ = writeln!(out, "\nNode balances:");
        for n in &self.nodes {
            let _ = writeln!(out, "  {:<8} {:>12.3e}", n.name, n.value);
        }
        let _ = writeln!(out, "\n{}:", loop_label);
        for l in &self.loops {
            let _ = writeln!(out, "  {:<8} {:>12.3e}", l.name, l.value);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub solver_config: SolverConfig,
    /// Seed for transitional friction sampling; `None` draws from entropy
    pub friction_seed: Option<u64>,
}

/// Loads networks, runs solves and reports the results
pub struct Simulator {
    network: Option<ResistorNetwork>,
    report: Option<SolveReport>,
    config: SimulatorConfig,
}

impl Simulator {
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Simulator {
            network: None,
            report: None,
            config,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Load a resistor network definition file
    pub fn load_network<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Loading network from: {}", path.display());
        let description = NetworkParser::new()
            .parse_file(path)
            .with_context(|| format!("Failed to load '{}'", path.display()))?;
        self.load_network_from_parsed(description)
    }

    pub fn load_network_from_parsed(&mut self, description: NetworkDescription) -> Result<()> {
        let network = ResistorNetwork::from_description(&description)
            .with_context(|| format!("Invalid network '{}'", description.title))?;
        info!(
            "Loaded network '{}': {} resistors, {} sources, {} loops",
            network.title,
            network.resistors().len(),
            network.sources().len(),
            network.loops().len()
        );
        self.network = Some(network);
        self.report = None;
        Ok(())
    }

    pub fn network(&self) -> Option<&ResistorNetwork> {
        self.network.as_ref()
    }

    /// Solve the loaded resistor network
    pub fn run_resistor_analysis(&mut self, initial_guess: Option<&[f64]>) -> Result<&SolveReport> {
        let network = self
            .network
            .as_mut()
            .ok_or_else(|| anyhow!("No network loaded"))?;

        let stats = network.analyze_circuit(initial_guess, &self.config.solver_config)?;

        let elements = network
            .resistors()
            .iter()
            .map(|r| -> Result<ElementValue> {
                Ok(ElementValue {
                    name: r.name.clone(),
                    value: network.resistor_current(&r.name)?,
                    unit: "A".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let nodes = network
            .junction_nodes()
            .into_iter()
            .map(|n| -> Result<ResidualValue> {
                let value = network.node_current(&n)?;
                Ok(ResidualValue { name: n, value })
            })
            .collect::<Result<Vec<_>>>()?;
        let loops = network
            .loops()
            .iter()
            .map(|l| -> Result<ResidualValue> {
                Ok(ResidualValue {
                    name: l.name.clone(),
                    value: network.loop_voltage(&l.name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let report = SolveReport {
            network: network.title.clone(),
            kind: NetworkKind::Resistor,
            elements,
            nodes,
            loops,
            convergence: ConvergenceInfo::from(&stats),
            success: stats.success,
        };
        Ok(self.store_report(report))
    }

    /// Solve a pipe network. Without a guess every pipe starts at the default flow.
    pub fn run_pipe_analysis(
        &mut self,
        network: &mut PipeNetwork,
        initial_guess: Option<&[f64]>,
    ) -> Result<&SolveReport> {
        if self.config.friction_seed.is_some() {
            network.set_friction_seed(self.config.friction_seed);
        }
        let guess = match initial_guess {
            Some(guess) => guess.to_vec(),
            None => network.default_initial_guess(),
        };
        let stats = network.find_flow_rates(&guess, &self.config.solver_config)?;

        let elements = network
            .pipes()
            .iter()
            .map(|p| -> Result<ElementValue> {
                let name = p.name();
                let value = network.pipe_flow(&name)?;
                Ok(ElementValue {
                    name,
                    value,
                    unit: "L/s".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let nodes = network
            .nodes()
            .iter()
            .map(|n| -> Result<ResidualValue> {
                Ok(ResidualValue {
                    name: n.name.clone(),
                    value: network.node_net_flow(&n.name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let loops = network
            .loops()
            .iter()
            .map(|l| -> Result<ResidualValue> {
                Ok(ResidualValue {
                    name: l.name.clone(),
                    value: network.loop_head_loss(&l.name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let report = SolveReport {
            network: network.name.clone(),
            kind: NetworkKind::Pipe,
            elements,
            nodes,
            loops,
            convergence: ConvergenceInfo::from(&stats),
            success: stats.success,
        };
        Ok(self.store_report(report))
    }

    fn store_report(&mut self, report: SolveReport) -> &SolveReport {
        if report.max_residual() > 1e-6 {
            warn!(
                "Solution of '{}' leaves a residual of {:.3e}",
                report.network,
                report.max_residual()
            );
        }
        self.report.insert(report)
    }

    pub fn get_report(&self) -> Option<&SolveReport> {
        self.report.as_ref()
    }

    /// Export the latest report to file
    pub fn export_results<P: AsRef<Path>>(&self, path: P, format: OutputFormat) -> Result<()> {
        let report = self
            .report
            .as_ref()
            .ok_or_else(|| anyhow!("No results available"))?;

        match format {
            OutputFormat::Csv => self.export_csv(report, path.as_ref()),
            OutputFormat::Json => self.export_json(report, path.as_ref()),
        }
    }

    fn export_csv(&self, report: &SolveReport, path: &Path) -> Result<()> {
        use csv::Writer;
        use std::fs::File;

        let file = File::create(path)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(["section", "name", "value", "unit"])?;
        for e in &report.elements {
            let value = e.value.to_string();
            writer.write_record(["element", e.name.as_str(), value.as_str(), e.unit.as_str()])?;
        }
        for (section, residuals) in [("node", &report.nodes), ("loop", &report.loops)] {
            for r in residuals {
                let value = r.value.to_string();
                writer.write_record([section, r.name.as_str(), value.as_str(), ""])?;
            }
        }
        writer.flush()?;
        info!("Results exported to CSV: {}", path.display());
        Ok(())
    }

    fn export_json(&self, report: &SolveReport, path: &Path) -> Result<()> {
        use std::fs::File;

        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, report)?;
        info!("Results exported to JSON: {}", path.display());
        Ok(())
    }

    pub fn print_summary(&self) {
        match &self.report {
            Some(report) => {
                let status = if report.success {
                    "converged".green()
                } else {
                    "not converged".red()
                };
                println!("\n{} ({})", report.network.bold(), status);
                print!("{}", report.summary());
            }
            None => println!("No results available"),
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::tempdir;

    const PARALLEL_NETWORK: &str = "\
title = Parallel Split
<Source>
name = ab
value = 12
</Source>
<Resistor>
name = bc
resistance = 2
</Resistor>
<Resistor>
name = ac
resistance = 2
</Resistor>
<Resistor>
name = cd
resistance = 2
</Resistor>
<Resistor>
name = ad
resistance = 2
</Resistor>
<Loop>
name = outer
nodes = a,b,c
</Loop>
<Loop>
name = inner
nodes = a,c,d
</Loop>
<Current>
name = direct
path = ca
guess = 1
</Current>
<Current>
name = around
path = cd,da
guess = 1
</Current>
<Balance>
node = c
derive = bc
</Balance>
";

    fn loaded_simulator() -> Simulator {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parallel.txt");
        fs::write(&path, PARALLEL_NETWORK).unwrap();
        let mut simulator = Simulator::new();
        simulator.load_network(&path).unwrap();
        simulator
    }

    #[test]
    fn test_resistor_analysis_from_file() {
        let mut simulator = loaded_simulator();
        let report = simulator.run_resistor_analysis(None).unwrap();

        assert!(report.success);
        assert_eq!(report.kind, NetworkKind::Resistor);
        assert_eq!(report.network, "Parallel Split");
        assert_relative_eq!(report.element("bc").unwrap(), 3.6, epsilon = 1e-8);
        // ac and ad are spelled against the flow
        assert_relative_eq!(report.element("ac").unwrap(), -2.4, epsilon = 1e-8);
        assert_relative_eq!(report.element("ad").unwrap(), -1.2, epsilon = 1e-8);
        assert!(report.max_residual() < 1e-9);
    }

    #[test]
    fn test_run_without_network_fails() {
        let mut simulator = Simulator::new();
        assert!(simulator.run_resistor_analysis(None).is_err());
        assert!(simulator.get_report().is_none());
    }

    #[test]
    fn test_truncated_file_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.txt");
        fs::write(&path, "<Resistor>\nname = ab\nresistance = 1\n").unwrap();
        let err = Simulator::new().load_network(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("never closed"));
    }

    #[test]
    fn test_pipe_analysis_report() {
        let mut simulator = Simulator::with_config(SimulatorConfig {
            friction_seed: Some(7),
            ..SimulatorConfig::default()
        });
        let mut network = PipeNetwork::eight_node_example().unwrap();
        let report = simulator.run_pipe_analysis(&mut network, None).unwrap();

        assert_eq!(report.kind, NetworkKind::Pipe);
        assert_eq!(report.elements.len(), 10);
        assert_eq!(report.nodes.len(), 8);
        assert_eq!(report.loops.len(), 3);
        assert!(report.max_residual() < 1e-6);
        assert_eq!(network.friction_seed(), Some(7));

        let inflow = report.element("a-b").unwrap() + report.element("a-c").unwrap();
        assert_relative_eq!(inflow, 60.0, epsilon = 1e-6);
    }

    #[test]
    fn test_export_csv_and_json() {
        let mut simulator = loaded_simulator();
        simulator.run_resistor_analysis(None).unwrap();
        let dir = tempdir().unwrap();

        let csv_path = dir.path().join("out.csv");
        simulator.export_results(&csv_path, OutputFormat::Csv).unwrap();
        let csv_text = fs::read_to_string(&csv_path).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(lines.next(), Some("section,name,value,unit"));
        assert!(lines.next().unwrap().starts_with("element,bc,"));
        assert_eq!(csv_text.lines().count(), 1 + 4 + 2 + 2);

        let json_path = dir.path().join("out.json");
        simulator.export_results(&json_path, OutputFormat::Json).unwrap();
        let parsed: SolveReport = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.elements.len(), 4);
        assert_eq!(parsed.kind, NetworkKind::Resistor);
    }

    #[test]
    fn test_summary_lists_every_element() {
        let mut simulator = loaded_simulator();
        let summary = simulator.run_resistor_analysis(None).unwrap().summary();
        for name in ["bc", "ac", "cd", "ad", "outer", "inner"] {
            assert!(summary.contains(name), "missing {name} in summary");
        }
        assert!(summary.contains("Loop voltages"));
    }
}
