pub mod circuit;
pub mod cli;
pub mod error;
pub mod friction;
pub mod parser;
pub mod pipe;
pub mod pipe_network;
pub mod simulator;
pub mod solver;
pub mod topology;

// Re-export commonly used types
pub use circuit::{CurrentLayout, Loop, Resistor, ResistorNetwork, SourceType, VoltageSource};
pub use error::{NetworkError, Result};
pub use friction::FrictionSampler;
pub use parser::{NetworkDescription, NetworkParser};
pub use pipe::{Fluid, Pipe};
pub use pipe_network::PipeNetwork;
pub use simulator::{Simulator, SimulatorConfig, SolveReport};
pub use solver::{NonlinearSolver, SolverConfig, SolverStats};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
