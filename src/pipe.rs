use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{NetworkError, Result};
use crate::friction::{friction_factor, FrictionSampler};

/// Gravitational acceleration in m/s^2
pub const GRAVITY: f64 = 9.81;

/// Working fluid with constant properties
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fluid {
    /// Dynamic viscosity in Pa·s
    pub dynamic_viscosity: f64,
    /// Density in kg/m^3
    pub density: f64,
}

impl Fluid {
    pub fn new(dynamic_viscosity: f64, density: f64) -> Result<Self> {
        if !(dynamic_viscosity > 0.0) {
            return Err(NetworkError::invalid_parameter(
                "fluid",
                "dynamic_viscosity",
                format!("must be positive, got {}", dynamic_viscosity),
            ));
        }
        if !(density > 0.0) {
            return Err(NetworkError::invalid_parameter(
                "fluid",
                "density",
                format!("must be positive, got {}", density),
            ));
        }
        Ok(Fluid {
            dynamic_viscosity,
            density,
        })
    }

    /// Water near room temperature
    pub fn water() -> Self {
        Fluid {
            dynamic_viscosity: 0.00089,
            density: 1000.0,
        }
    }

    /// Kinematic viscosity in m^2/s
    pub fn kinematic_viscosity(&self) -> f64 {
        self.dynamic_viscosity / self.density
    }
}

impl Default for Fluid {
    fn default() -> Self {
        Fluid::water()
    }
}

/// A straight pipe segment between two nodes.
///
/// End nodes are stored in lexicographic order, so `start_node < end_node`
/// holds for every pipe. Flow rates are in L/s and positive from
/// `start_node` to `end_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipe {
    start_node: String,
    end_node: String,
    /// Length in m
    pub length: f64,
    /// Inner diameter in m
    pub diameter: f64,
    /// Absolute roughness in m
    pub roughness: f64,
    pub fluid: Fluid,
}

impl Pipe {
    pub fn new(
        start: &str,
        end: &str,
        length: f64,
        diameter: f64,
        roughness: f64,
        fluid: Fluid,
    ) -> Result<Self> {
        let name = format!("{}-{}", start, end);
        if start == end {
            return Err(NetworkError::Topology(format!(
                "pipe {} connects a node to itself",
                name
            )));
        }
        for (param, value) in [("length", length), ("diameter", diameter), ("roughness", roughness)] {
            if !(value > 0.0) {
                return Err(NetworkError::invalid_parameter(
                    name.as_str(),
                    param,
                    format!("must be positive, got {}", value),
                ));
            }
        }

        let (start_node, end_node) = if start < end { (start, end) } else { (end, start) };
        Ok(Pipe {
            start_node: start_node.to_string(),
            end_node: end_node.to_string(),
            length,
            diameter,
            roughness,
            fluid,
        })
    }

    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    pub fn end_node(&self) -> &str {
        &self.end_node
    }

    /// Pipe name, e.g. `a-b`
    pub fn name(&self) -> String {
        format!("{}-{}", self.start_node, self.end_node)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.start_node == node || self.end_node == node
    }

    /// The node at the other end from `node`
    pub fn far_node(&self, node: &str) -> &str {
        if node == self.start_node {
            &self.end_node
        } else {
            &self.start_node
        }
    }

    pub fn area(&self) -> f64 {
        PI / 4.0 * self.diameter * self.diameter
    }

    pub fn relative_roughness(&self) -> f64 {
        self.roughness / self.diameter
    }

    /// Average velocity in m/s for a flow rate in L/s
    pub fn velocity(&self, flow_rate: f64) -> f64 {
        flow_rate / 1000.0 / self.area()
    }

    /// Reynolds number; always non-negative
    pub fn reynolds(&self, flow_rate: f64) -> f64 {
        self.fluid.density * self.velocity(flow_rate).abs() * self.diameter
            / self.fluid.dynamic_viscosity
    }

    pub fn friction_factor(&self, flow_rate: f64, sampler: &mut FrictionSampler) -> Result<f64> {
        friction_factor(self.reynolds(flow_rate), self.relative_roughness(), sampler)
    }

    /// Darcy-Weisbach head loss in m of fluid, always non-negative
    pub fn friction_head_loss(&self, flow_rate: f64, sampler: &mut FrictionSampler) -> Result<f64> {
        if flow_rate == 0.0 {
            return Ok(0.0);
        }
        let f = self.friction_factor(flow_rate, sampler)?;
        let v = self.velocity(flow_rate);
        Ok(f * self.length * v * v / (2.0 * GRAVITY * self.diameter))
    }

    /// Head loss signed for a traversal that enters the pipe at `node`.
    pub fn head_loss_from_node(
        &self,
        node: &str,
        flow_rate: f64,
        sampler: &mut FrictionSampler,
    ) -> Result<f64> {
        let n_traverse = if node == self.start_node { 1.0 } else { -1.0 };
        let n_flow = if flow_rate >= 0.0 { 1.0 } else { -1.0 };
        Ok(n_traverse * n_flow * self.friction_head_loss(flow_rate, sampler)?)
    }

    /// Flow into `node` from this pipe: `-Q` at the start node, `+Q` otherwise
    pub fn flow_into_node(&self, node: &str, flow_rate: f64) -> f64 {
        if node == self.start_node {
            -flow_rate
        } else {
            flow_rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pipe(start: &str, end: &str) -> Pipe {
        Pipe::new(start, end, 100.0, 0.2, 0.00025, Fluid::water()).unwrap()
    }

    #[test]
    fn test_orientation_is_canonical() {
        let p = pipe("e", "b");
        assert_eq!(p.start_node(), "b");
        assert_eq!(p.end_node(), "e");
        assert_eq!(p.name(), "b-e");

        for (s, e) in [("a", "h"), ("h", "a"), ("node2", "node10")] {
            let p = pipe(s, e);
            assert!(p.start_node() < p.end_node());
        }
    }

    #[test]
    fn test_invalid_pipes_are_rejected() {
        assert!(Pipe::new("a", "a", 1.0, 0.1, 0.0001, Fluid::water()).is_err());
        assert!(Pipe::new("a", "b", 1.0, 0.0, 0.0001, Fluid::water()).is_err());
        assert!(Pipe::new("a", "b", -5.0, 0.1, 0.0001, Fluid::water()).is_err());
        assert!(Fluid::new(0.0, 1000.0).is_err());
    }

    #[test]
    fn test_fluid_kinematic_viscosity() {
        assert_relative_eq!(Fluid::water().kinematic_viscosity(), 8.9e-7, epsilon = 1e-15);
    }

    #[test]
    fn test_flow_into_node_sign() {
        let p = pipe("a", "b");
        assert_eq!(p.flow_into_node("a", 5.0), -5.0);
        assert_eq!(p.flow_into_node("b", 5.0), 5.0);
        assert_eq!(p.far_node("a"), "b");
        assert_eq!(p.far_node("b"), "a");
    }

    #[test]
    fn test_reynolds_uses_flow_magnitude() {
        let p = pipe("a", "b");
        assert_relative_eq!(p.reynolds(10.0), p.reynolds(-10.0));
        // 10 L/s through 200 mm: v = 0.318 m/s, Re ~ 71_500
        assert_relative_eq!(p.reynolds(10.0), 71_534.0, max_relative = 1e-3);
    }

    #[test]
    fn test_head_loss_sign_follows_traversal_and_flow() {
        let p = pipe("a", "b");
        let mut sampler = FrictionSampler::seeded(0);
        let hl = p.friction_head_loss(10.0, &mut sampler).unwrap();
        assert!(hl > 0.0);

        let forward = p.head_loss_from_node("a", 10.0, &mut sampler).unwrap();
        let backward = p.head_loss_from_node("b", 10.0, &mut sampler).unwrap();
        let reversed_flow = p.head_loss_from_node("a", -10.0, &mut sampler).unwrap();
        assert_relative_eq!(forward, hl);
        assert_relative_eq!(backward, -hl);
        assert_relative_eq!(reversed_flow, -hl);
    }

    #[test]
    fn test_darcy_weisbach_laminar() {
        // Viscous oil keeps the flow laminar so f = 64 / Re exactly
        let oil = Fluid::new(0.5, 900.0).unwrap();
        let p = Pipe::new("a", "b", 50.0, 0.1, 0.0001, oil).unwrap();
        let mut sampler = FrictionSampler::seeded(0);
        let q = 2.0;
        let re = p.reynolds(q);
        assert!(re < 2000.0);

        let v = p.velocity(q);
        let expected = 64.0 / re * 50.0 * v * v / (2.0 * GRAVITY * 0.1);
        assert_relative_eq!(p.friction_head_loss(q, &mut sampler).unwrap(), expected, max_relative = 1e-12);
    }

    #[test]
    fn test_zero_flow_has_no_head_loss() {
        let p = pipe("a", "b");
        let mut sampler = FrictionSampler::seeded(0);
        assert_eq!(p.friction_head_loss(0.0, &mut sampler).unwrap(), 0.0);
    }
}
