use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{NetworkError, Result};
use crate::parser::NetworkDescription;
use crate::solver::{NonlinearSolver, SolverConfig, SolverStats};
use crate::topology::{split_element_name, NodePair};

/// Resistor between two nodes. Positive current flows from the first-named
/// node to the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resistor {
    pub name: String,
    from: String,
    to: String,
    pub resistance: f64,
}

impl Resistor {
    /// Resistor between the two nodes spelled by `name`, e.g. `ad`
    pub fn new(name: &str, resistance: f64) -> Result<Self> {
        let (from, to) = split_element_name(name)?;
        if from == to {
            return Err(NetworkError::Topology(format!("resistor {} shorts node {}", name, from)));
        }
        if !(resistance > 0.0) {
            return Err(NetworkError::invalid_parameter(
                name,
                "resistance",
                format!("must be positive, got {}", resistance),
            ));
        }
        Ok(Resistor {
            name: name.to_string(),
            from,
            to,
            resistance,
        })
    }

    pub fn from_node(&self) -> &str {
        &self.from
    }

    pub fn to_node(&self) -> &str {
        &self.to
    }

    pub fn pair(&self) -> NodePair {
        NodePair::new(&self.from, &self.to)
    }

    /// Ohm's law drop in the resistor's own direction
    pub fn voltage_drop(&self, current: f64) -> f64 {
        current * self.resistance
    }

    /// +1 if traversing `from -> to` follows this resistor's direction, else -1
    fn direction(&self, from: &str) -> f64 {
        if from == self.from {
            1.0
        } else {
            -1.0
        }
    }

    /// Current flowing into `node` through this resistor
    fn current_into(&self, node: &str, current: f64) -> f64 {
        if node == self.to {
            current
        } else if node == self.from {
            -current
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceType {
    #[default]
    Ideal,
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ideal" => Ok(SourceType::Ideal),
            other => Err(format!("unsupported source type '{}'", other)),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Ideal => write!(f, "ideal"),
        }
    }
}

/// Voltage source whose potential rises from the first-named node to the second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageSource {
    pub name: String,
    from: String,
    to: String,
    pub voltage: f64,
    pub source_type: SourceType,
}

impl VoltageSource {
    /// Source named by its two nodes, e.g. `ab`
    pub fn new(name: &str, voltage: f64, source_type: SourceType) -> Result<Self> {
        let (from, to) = split_element_name(name)?;
        if from == to {
            return Err(NetworkError::Topology(format!("source {} shorts node {}", name, from)));
        }
        Ok(VoltageSource {
            name: name.to_string(),
            from,
            to,
            voltage,
            source_type,
        })
    }

    pub fn from_node(&self) -> &str {
        &self.from
    }

    pub fn to_node(&self) -> &str {
        &self.to
    }

    pub fn pair(&self) -> NodePair {
        NodePair::new(&self.from, &self.to)
    }
}

/// Closed traversal through a sequence of nodes; the last node connects back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    pub name: String,
    pub nodes: Vec<String>,
}

impl Loop {
    pub fn new(name: &str, nodes: &[&str]) -> Self {
        Loop {
            name: name.to_string(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Consecutive node pairs, wrapping from the last node to the first
    pub fn segments(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        let n = self.nodes.len();
        (0..n).map(move |i| (self.nodes[i].as_str(), self.nodes[(i + 1) % n].as_str()))
    }
}

/// An unknown branch current, shared by every resistor on a directed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCurrent {
    pub name: String,
    /// Directed segments such as `bc` or `d-a`
    pub path: Vec<String>,
    /// Starting value for the solver
    pub guess: f64,
}

/// A resistor current fixed by Kirchhoff's current law at `node`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedCurrent {
    pub segment: String,
    pub node: String,
}

/// Which currents are solver unknowns, which follow from node balance, and
/// which node balances become equations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentLayout {
    pub unknowns: Vec<BranchCurrent>,
    pub derived: Vec<DerivedCurrent>,
    pub balance_nodes: Vec<String>,
}

impl CurrentLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unknown(mut self, name: &str, path: &[&str], guess: f64) -> Self {
        self.unknowns.push(BranchCurrent {
            name: name.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
            guess,
        });
        self
    }

    pub fn derive(mut self, segment: &str, node: &str) -> Self {
        self.derived.push(DerivedCurrent {
            segment: segment.to_string(),
            node: node.to_string(),
        });
        self
    }

    pub fn balance(mut self, node: &str) -> Self {
        self.balance_nodes.push(node.to_string());
        self
    }

    pub fn initial_guess(&self) -> Vec<f64> {
        self.unknowns.iter().map(|u| u.guess).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ElementRef {
    Resistor(usize),
    Source(usize),
}

/// Layout checked against the network, with names replaced by indices
#[derive(Debug, Clone)]
struct ResolvedLayout {
    /// Per unknown: (resistor index, sign) pairs
    members: Vec<Vec<(usize, f64)>>,
    /// In evaluation order: (resistor index, node)
    derived: Vec<(usize, String)>,
    balance_nodes: Vec<String>,
}

/// Resistor currents for one residual evaluation, indexed like the network's resistors
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentState {
    pub currents: Vec<f64>,
}

impl CurrentState {
    pub fn zeros(len: usize) -> Self {
        CurrentState {
            currents: vec![0.0; len],
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitSolution {
    state: CurrentState,
    branches: Vec<f64>,
}

/// Resistor network solved with Kirchhoff's laws
#[derive(Debug, Clone)]
pub struct ResistorNetwork {
    pub title: String,
    resistors: Vec<Resistor>,
    sources: Vec<VoltageSource>,
    loops: Vec<Loop>,
    elements: HashMap<NodePair, ElementRef>,
    layout: CurrentLayout,
    solution: Option<CircuitSolution>,
}

impl ResistorNetwork {
    /// Empty network with no elements or layout
    pub fn new(title: &str) -> Self {
        ResistorNetwork {
            title: title.to_string(),
            resistors: Vec::new(),
            sources: Vec::new(),
            loops: Vec::new(),
            elements: HashMap::new(),
            layout: CurrentLayout::default(),
            solution: None,
        }
    }

    /// Build a network from a parsed definition file
    pub fn from_description(description: &NetworkDescription) -> Result<Self> {
        let mut network = ResistorNetwork::new(&description.title);
        for r in &description.resistors {
            network.add_resistor(&r.name, r.resistance)?;
        }
        for s in &description.sources {
            network.add_source(&s.name, s.voltage, s.source_type)?;
        }
        for l in &description.loops {
            let nodes: Vec<&str> = l.nodes.iter().map(|n| n.as_str()).collect();
            network.add_loop(&l.name, &nodes)?;
        }
        let layout = description.layout();
        if !layout.unknowns.is_empty() {
            network.set_layout(layout)?;
        }
        Ok(network)
    }

    pub fn resistors(&self) -> &[Resistor] {
        &self.resistors
    }

    pub fn sources(&self) -> &[VoltageSource] {
        &self.sources
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn layout(&self) -> &CurrentLayout {
        &self.layout
    }

    fn insert_element(&mut self, pair: NodePair, element: ElementRef, name: &str) -> Result<()> {
        if self.elements.contains_key(&pair) {
            return Err(NetworkError::Topology(format!(
                "element {} duplicates an existing element between {}",
                name, pair
            )));
        }
        self.elements.insert(pair, element);
        self.solution = None;
        Ok(())
    }

    /// Add a resistor, returning its index
    pub fn add_resistor(&mut self, name: &str, resistance: f64) -> Result<usize> {
        let resistor = Resistor::new(name, resistance)?;
        let index = self.resistors.len();
        self.insert_element(resistor.pair(), ElementRef::Resistor(index), name)?;
        self.resistors.push(resistor);
        Ok(index)
    }

    /// Add a voltage source, returning its index
    pub fn add_source(&mut self, name: &str, voltage: f64, source_type: SourceType) -> Result<usize> {
        let source = VoltageSource::new(name, voltage, source_type)?;
        let index = self.sources.len();
        self.insert_element(source.pair(), ElementRef::Source(index), name)?;
        self.sources.push(source);
        Ok(index)
    }

    /// Add a loop; every segment must already have an element.
    pub fn add_loop(&mut self, name: &str, nodes: &[&str]) -> Result<()> {
        if nodes.len() < 2 {
            return Err(NetworkError::Topology(format!(
                "loop {} needs at least two nodes",
                name
            )));
        }
        let new_loop = Loop::new(name, nodes);
        for (from, to) in new_loop.segments() {
            self.element_between(from, to)?;
        }
        self.loops.push(new_loop);
        self.solution = None;
        Ok(())
    }

    fn element_between(&self, from: &str, to: &str) -> Result<ElementRef> {
        self.elements
            .get(&NodePair::new(from, to))
            .copied()
            .ok_or_else(|| NetworkError::lookup("element", format!("{}{}", from, to)))
    }

    /// Index of a resistor by either spelling of its name
    pub fn resistor_index(&self, name: &str) -> Result<usize> {
        let (a, b) = split_element_name(name).map_err(|_| NetworkError::lookup("resistor", name))?;
        match self.elements.get(&NodePair::new(&a, &b)) {
            Some(ElementRef::Resistor(index)) => Ok(*index),
            _ => Err(NetworkError::lookup("resistor", name)),
        }
    }

    pub fn resistor(&self, name: &str) -> Result<&Resistor> {
        Ok(&self.resistors[self.resistor_index(name)?])
    }

    fn touches_source(&self, node: &str) -> bool {
        self.sources
            .iter()
            .any(|s| s.from_node() == node || s.to_node() == node)
    }

    fn has_node(&self, node: &str) -> bool {
        self.resistors
            .iter()
            .any(|r| r.from_node() == node || r.to_node() == node)
            || self.touches_source(node)
    }

    /// Install the current layout, checking it against the network.
    pub fn set_layout(&mut self, layout: CurrentLayout) -> Result<()> {
        self.resolve_layout(&layout)?;
        self.layout = layout;
        self.solution = None;
        Ok(())
    }

    fn resolve_layout(&self, layout: &CurrentLayout) -> Result<ResolvedLayout> {
        let mut assigned = vec![false; self.resistors.len()];
        let mut members = Vec::with_capacity(layout.unknowns.len());

        for unknown in &layout.unknowns {
            let mut path = Vec::with_capacity(unknown.path.len());
            for segment in &unknown.path {
                let (from, to) = split_element_name(segment)?;
                let index = match self.element_between(&from, &to)? {
                    ElementRef::Resistor(index) => index,
                    ElementRef::Source(_) => {
                        return Err(NetworkError::Topology(format!(
                            "current {} path segment {} is a voltage source",
                            unknown.name, segment
                        )))
                    }
                };
                if assigned[index] {
                    return Err(NetworkError::Topology(format!(
                        "resistor {} is assigned more than one current",
                        self.resistors[index].name
                    )));
                }
                assigned[index] = true;
                path.push((index, self.resistors[index].direction(&from)));
            }
            members.push(path);
        }

        let mut derived = Vec::with_capacity(layout.derived.len());
        for d in &layout.derived {
            let index = self.resistor_index(&d.segment)?;
            let resistor = &self.resistors[index];
            if resistor.from_node() != d.node && resistor.to_node() != d.node {
                return Err(NetworkError::Topology(format!(
                    "derived current {} does not touch node {}",
                    d.segment, d.node
                )));
            }
            if assigned[index] {
                return Err(NetworkError::Topology(format!(
                    "resistor {} is assigned more than one current",
                    resistor.name
                )));
            }
            if self.touches_source(&d.node) {
                return Err(NetworkError::Topology(format!(
                    "node {} touches a voltage source, so its balance cannot derive {}",
                    d.node, d.segment
                )));
            }
            if let Some(pending) = self
                .resistors
                .iter()
                .enumerate()
                .find(|(j, r)| *j != index && !assigned[*j] && (r.from_node() == d.node || r.to_node() == d.node))
            {
                return Err(NetworkError::Topology(format!(
                    "derived current {} at node {} depends on unassigned resistor {}",
                    d.segment, d.node, pending.1.name
                )));
            }
            assigned[index] = true;
            derived.push((index, d.node.clone()));
        }

        if let Some(unassigned) = assigned.iter().position(|a| !a) {
            return Err(NetworkError::Topology(format!(
                "resistor {} has no current assigned",
                self.resistors[unassigned].name
            )));
        }

        for node in &layout.balance_nodes {
            if !self.has_node(node) {
                return Err(NetworkError::lookup("node", node.as_str()));
            }
            if self.touches_source(node) {
                return Err(NetworkError::Topology(format!(
                    "balance node {} touches a voltage source",
                    node
                )));
            }
        }

        Ok(ResolvedLayout {
            members,
            derived,
            balance_nodes: layout.balance_nodes.clone(),
        })
    }

    pub fn equation_count(&self) -> usize {
        self.loops.len() + self.layout.balance_nodes.len()
    }

    /// Net current into a node through its resistors
    pub fn node_current_in(&self, state: &CurrentState, node: &str) -> f64 {
        self.resistors
            .iter()
            .zip(&state.currents)
            .map(|(r, &i)| r.current_into(node, i))
            .sum()
    }

    /// Sum of voltage rises around a loop; zero when Kirchhoff's voltage law holds
    pub fn loop_voltage_in(&self, state: &CurrentState, l: &Loop) -> Result<f64> {
        let mut total = 0.0;
        for (from, to) in l.segments() {
            total += match self.element_between(from, to)? {
                ElementRef::Resistor(index) => {
                    let r = &self.resistors[index];
                    -r.direction(from) * r.voltage_drop(state.currents[index])
                }
                ElementRef::Source(index) => {
                    let s = &self.sources[index];
                    if from == s.from_node() {
                        s.voltage
                    } else {
                        -s.voltage
                    }
                }
            };
        }
        Ok(total)
    }

    /// Write a candidate unknown vector into `state`, including derived currents
    fn assign_currents(&self, layout: &ResolvedLayout, x: &[f64], state: &mut CurrentState) {
        for (value, members) in x.iter().zip(&layout.members) {
            for &(index, sign) in members {
                state.currents[index] = sign * value;
            }
        }
        for (index, node) in &layout.derived {
            state.currents[*index] = 0.0;
            let others = self.node_current_in(state, node);
            // solve others + into(I) = 0 for I
            let sign = self.resistors[*index].current_into(node, 1.0);
            state.currents[*index] = -others / sign;
        }
    }

    /// Residual vector: loop voltages, then balance-node currents
    fn residuals(&self, layout: &ResolvedLayout, state: &CurrentState) -> Result<DVector<f64>> {
        let mut residuals = Vec::with_capacity(self.equation_count());
        for l in &self.loops {
            residuals.push(self.loop_voltage_in(state, l)?);
        }
        for node in &layout.balance_nodes {
            residuals.push(self.node_current_in(state, node));
        }
        Ok(DVector::from_vec(residuals))
    }

    /// Solve for the branch currents. Without an explicit guess the layout's
    /// per-current guesses are used.
    pub fn analyze_circuit(
        &mut self,
        initial_guess: Option<&[f64]>,
        config: &SolverConfig,
    ) -> Result<SolverStats> {
        if self.layout.unknowns.is_empty() {
            return Err(NetworkError::Topology(format!(
                "network {} has no current layout",
                self.title
            )));
        }
        let layout = self.resolve_layout(&self.layout)?;
        let unknowns = layout.members.len();
        if self.equation_count() != unknowns {
            return Err(NetworkError::DimensionMismatch {
                unknowns,
                equations: self.equation_count(),
            });
        }

        let guess = match initial_guess {
            Some(guess) if guess.len() != unknowns => {
                return Err(NetworkError::guess_length(unknowns, guess.len()))
            }
            Some(guess) => guess.to_vec(),
            None => self.layout.initial_guess(),
        };

        info!(
            "Solving resistor network {}: {} resistors, {} sources, {} loops, {} unknowns",
            self.title,
            self.resistors.len(),
            self.sources.len(),
            self.loops.len(),
            unknowns
        );
        self.solution = None;

        let mut state = CurrentState::zeros(self.resistors.len());
        let solver = NonlinearSolver::with_config(config.clone());
        let network = &*self;
        let (x, stats) = solver.solve(
            |x| {
                network.assign_currents(&layout, x.as_slice(), &mut state);
                network.residuals(&layout, &state)
            },
            &guess,
        )?;

        let mut solved = CurrentState::zeros(self.resistors.len());
        self.assign_currents(&layout, x.as_slice(), &mut solved);
        debug!("Resistor currents: {:?}", solved.currents);
        info!(
            "Resistor network {} converged in {} iterations (|r| = {:.3e})",
            self.title, stats.iterations, stats.residual_norm
        );
        self.solution = Some(CircuitSolution {
            state: solved,
            branches: x.iter().copied().collect(),
        });
        Ok(stats)
    }

    pub fn is_solved(&self) -> bool {
        self.solution.is_some()
    }

    fn solution(&self) -> Result<&CircuitSolution> {
        self.solution
            .as_ref()
            .ok_or_else(|| NetworkError::NotSolved(self.title.clone()))
    }

    pub fn currents(&self) -> Result<&CurrentState> {
        Ok(&self.solution()?.state)
    }

    /// Solved current in the resistor's own direction
    pub fn resistor_current(&self, name: &str) -> Result<f64> {
        let index = self.resistor_index(name)?;
        Ok(self.solution()?.state.currents[index])
    }

    /// Solved current along a directed segment, e.g. `da` gives the flow from d to a
    pub fn current_along(&self, segment: &str) -> Result<f64> {
        let (from, _) = split_element_name(segment)?;
        let index = self.resistor_index(segment)?;
        let r = &self.resistors[index];
        Ok(r.direction(&from) * self.solution()?.state.currents[index])
    }

    /// Solved values of the layout's unknown branch currents, by name
    pub fn branch_currents(&self) -> Result<Vec<(String, f64)>> {
        let solution = self.solution()?;
        Ok(self
            .layout
            .unknowns
            .iter()
            .zip(&solution.branches)
            .map(|(u, &i)| (u.name.clone(), i))
            .collect())
    }

    /// Net loop voltage at the solved state
    pub fn loop_voltage(&self, name: &str) -> Result<f64> {
        let l = self
            .loops
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| NetworkError::lookup("loop", name))?;
        self.loop_voltage_in(&self.solution()?.state, l)
    }

    /// Net resistor current into a node at the solved state
    pub fn node_current(&self, node: &str) -> Result<f64> {
        if !self.has_node(node) {
            return Err(NetworkError::lookup("node", node));
        }
        Ok(self.node_current_in(&self.solution()?.state, node))
    }

    /// Nodes that only connect resistors, where the net current must vanish
    pub fn junction_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        for r in &self.resistors {
            for node in [r.from_node(), r.to_node()] {
                if !self.touches_source(node) && !nodes.iter().any(|n| n == node) {
                    nodes.push(node.to_string());
                }
            }
        }
        nodes.sort();
        nodes
    }
}
