use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use std::cell::Cell;
use std::time::Instant;

use crate::error::{NetworkError, Result};

/// Solver configuration
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Decomposition used for each Newton step
    pub method: SolverMethod,
    /// Converged once the largest residual magnitude drops below this
    pub tolerance: f64,
    /// Relative step size below which the iteration is considered stalled
    pub step_tolerance: f64,
    pub max_iterations: usize,
    /// Relative perturbation for the finite-difference Jacobian
    pub fd_step: f64,
    /// Maximum number of step halvings in the backtracking line search
    pub max_halvings: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            method: SolverMethod::Lu,
            tolerance: 1e-9,
            step_tolerance: 1e-14,
            max_iterations: 100,
            fd_step: 1e-7,
            max_halvings: 20,
        }
    }
}

/// Available decompositions for the linearised step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverMethod {
    /// Direct LU decomposition
    Lu,
    /// QR decomposition
    Qr,
}

/// Solver statistics
#[derive(Debug, Clone)]
pub struct SolverStats {
    pub method_used: SolverMethod,
    pub iterations: usize,
    pub function_evaluations: usize,
    pub residual_norm: f64,
    pub solve_time: f64,
    pub success: bool,
}

/// Dense linear system solver used for each Newton step
pub struct LinearSolver {
    method: SolverMethod,
}

impl LinearSolver {
    pub fn new() -> Self {
        LinearSolver {
            method: SolverMethod::Lu,
        }
    }

    pub fn with_method(method: SolverMethod) -> Self {
        LinearSolver { method }
    }

    /// Solve the linear system Ax = b, falling back to QR if LU breaks down
    pub fn solve_dense(&self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() != rhs.len() {
            return Err(NetworkError::DimensionMismatch {
                unknowns: matrix.ncols(),
                equations: matrix.nrows(),
            });
        }

        let solution = match self.method {
            SolverMethod::Lu => matrix
                .clone()
                .lu()
                .solve(rhs)
                .or_else(|| matrix.clone().qr().solve(rhs)),
            SolverMethod::Qr => matrix.clone().qr().solve(rhs),
        };

        match solution {
            Some(x) if x.iter().all(|v| v.is_finite()) => Ok(x),
            _ => Err(NetworkError::Singular(format!(
                "{:?} decomposition of a {}x{} system failed",
                self.method,
                matrix.nrows(),
                matrix.ncols()
            ))),
        }
    }
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Damped Newton iteration with a finite-difference Jacobian.
///
/// The residual closure is called for every trial point, including the
/// Jacobian perturbations and rejected line-search steps, so it must not
/// treat its input as a converged answer.
pub struct NonlinearSolver {
    config: SolverConfig,
    linear: LinearSolver,
}

impl NonlinearSolver {
    pub fn new() -> Self {
        Self::with_config(SolverConfig::default())
    }

    pub fn with_config(config: SolverConfig) -> Self {
        let linear = LinearSolver::with_method(config.method);
        NonlinearSolver { config, linear }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Drive `residual` to zero starting from `initial_guess`.
    ///
    /// On failure the error carries the smallest residual among the accepted iterates.
    pub fn solve<F>(&self, mut residual: F, initial_guess: &[f64]) -> Result<(DVector<f64>, SolverStats)>
    where
        F: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    {
        let start_time = Instant::now();
        let n = initial_guess.len();
        if n == 0 {
            return Err(NetworkError::Topology("no unknowns to solve for".to_string()));
        }

        let evaluations = Cell::new(0);
        let mut evaluate = |x: &DVector<f64>| -> Result<DVector<f64>> {
            evaluations.set(evaluations.get() + 1);
            let r = residual(x)?;
            if r.len() != x.len() {
                return Err(NetworkError::DimensionMismatch {
                    unknowns: x.len(),
                    equations: r.len(),
                });
            }
            Ok(r)
        };

        let mut x = DVector::from_column_slice(initial_guess);
        let mut r = evaluate(&x)?;
        let mut best_norm = r.amax();
        let mut best_r = r.clone();

        for iteration in 0..self.config.max_iterations {
            let norm = r.amax();
            if norm < self.config.tolerance {
                return Ok((x, self.stats(iteration, evaluations.get(), norm, start_time, true)));
            }

            let jacobian = self.jacobian(&mut evaluate, &x, &r)?;
            let step = self.linear.solve_dense(&jacobian, &(-&r))?;

            // Backtrack until the residual shrinks; the last halving is kept regardless.
            let base = r.norm();
            let mut alpha = 1.0;
            let mut trial_x = &x + &step;
            let mut trial_r = evaluate(&trial_x)?;
            for _ in 0..self.config.max_halvings {
                if trial_r.norm() < base {
                    break;
                }
                alpha *= 0.5;
                trial_x = &x + &step * alpha;
                trial_r = evaluate(&trial_x)?;
            }

            let step_size = step.amax() * alpha;
            x = trial_x;
            r = trial_r;
            if r.amax() < best_norm {
                best_norm = r.amax();
                best_r = r.clone();
            }
            debug!(
                "Newton iteration {}: |r|inf = {:.3e}, step = {:.3e}, alpha = {}",
                iteration + 1,
                r.amax(),
                step_size,
                alpha
            );

            if step_size < self.config.step_tolerance * (1.0 + x.amax())
                && r.amax() >= self.config.tolerance
            {
                warn!("Newton iteration stalled after {} iterations", iteration + 1);
                return Err(NetworkError::Convergence {
                    iterations: iteration + 1,
                    residual_norm: best_norm,
                    residual: best_r.iter().copied().collect(),
                });
            }
        }

        let norm = r.amax();
        if norm < self.config.tolerance {
            return Ok((
                x,
                self.stats(self.config.max_iterations, evaluations.get(), norm, start_time, true),
            ));
        }

        Err(NetworkError::Convergence {
            iterations: self.config.max_iterations,
            residual_norm: best_norm,
            residual: best_r.iter().copied().collect(),
        })
    }

    /// Forward-difference Jacobian around `x`
    fn jacobian<F>(&self, evaluate: &mut F, x: &DVector<f64>, r: &DVector<f64>) -> Result<DMatrix<f64>>
    where
        F: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    {
        let n = x.len();
        let mut jacobian = DMatrix::zeros(r.len(), n);
        for j in 0..n {
            let h = self.config.fd_step * x[j].abs().max(1.0);
            let mut perturbed = x.clone();
            perturbed[j] += h;
            let column = (evaluate(&perturbed)? - r) / h;
            jacobian.set_column(j, &column);
        }
        Ok(jacobian)
    }

    fn stats(
        &self,
        iterations: usize,
        function_evaluations: usize,
        residual_norm: f64,
        start_time: Instant,
        success: bool,
    ) -> SolverStats {
        SolverStats {
            method_used: self.config.method,
            iterations,
            function_evaluations,
            residual_norm,
            solve_time: start_time.elapsed().as_secs_f64(),
            success,
        }
    }
}

impl Default for NonlinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a root of a scalar function on x > 0 by Newton's method with a
/// central-difference derivative. Iterates that leave the domain are pulled
/// back to half the previous value.
pub fn find_positive_root<F>(mut f: F, x0: f64, tolerance: f64, max_iterations: usize) -> Result<f64>
where
    F: FnMut(f64) -> f64,
{
    if x0 <= 0.0 || !x0.is_finite() {
        return Err(NetworkError::invalid_parameter("root search", "x0", "initial guess must be positive"));
    }

    let mut x = x0;
    let mut fx = f(x);
    for _ in 0..max_iterations {
        if !fx.is_finite() {
            break;
        }
        if fx.abs() < tolerance {
            return Ok(x);
        }

        let h = 1e-7 * x;
        let slope = (f(x + h) - f(x - h)) / (2.0 * h);
        if slope == 0.0 || !slope.is_finite() {
            break;
        }

        let mut next = x - fx / slope;
        if !next.is_finite() || next <= 0.0 {
            next = 0.5 * x;
        }
        if (next - x).abs() < tolerance * x.max(1.0) {
            return Ok(next);
        }
        x = next;
        fx = f(x);
    }

    Err(NetworkError::Convergence {
        iterations: max_iterations,
        residual_norm: fx.abs(),
        residual: vec![fx],
    })
}
