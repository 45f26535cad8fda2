//! Sparse Levenberg-Marquardt over an explicit Jacobian sparsity pattern
//!
//! The caller declares the (row, col) entries of the Jacobian once; each
//! iteration only rewrites the values. The normal equations are formed as
//! J^T J with adaptive damping and factorized with sparse LDL, which is the
//! right shape for sliding-window problems whose Jacobians are block-sparse
//! along the trajectory.

use nalgebra::DVector;
use sprs::{CsMat, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;

/// Result of one optimization iteration
pub struct IterationResult {
    pub error: f64,
    pub step_norm: f64,
    pub lambda: f64,
    pub gradient_norm: f64,
    pub converged: bool,
}

/// Build a CSR Jacobian skeleton from (row, col) entries.
///
/// Entries must not contain duplicates; values start at zero.
fn build_jacobian(entries: &[(usize, usize)], n_rows: usize, n_cols: usize) -> CsMat<f64> {
    let mut tri = TriMat::new((n_rows, n_cols));
    for &(row, col) in entries {
        tri.add_triplet(row, col, 0.0);
    }
    tri.to_csr()
}

/// Sparse Levenberg-Marquardt solver
///
/// The Jacobian structure is fixed at construction; `solve` iterates a
/// damped Gauss-Newton step with step acceptance on the residual norm.
///
/// A set of parameter indices can be declared constant
/// ([`with_constant_params`](Self::with_constant_params)): their Jacobian
/// columns and gradient entries are zeroed every iteration, so the computed
/// step is exactly zero there and the parameters come back bit-identical.
pub struct SparseLevenbergMarquardt {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_scale_up: f64,
    pub lambda_scale_down: f64,
    pub verbose: bool,

    // CSR Jacobian (structure fixed, values rewritten each iteration)
    jacobian: CsMat<f64>,

    // Parameter indices held constant, and the positions of their entries
    // in the CSR data array
    constant_cols: Vec<usize>,
    constant_data_positions: Vec<usize>,

    // Dense workspace
    jtr: DVector<f64>,
    residuals: DVector<f64>,
    temp_residuals: DVector<f64>,
}

impl SparseLevenbergMarquardt {
    /// Create a new solver.
    ///
    /// # Arguments
    /// * `n_rows` - Number of residuals
    /// * `n_cols` - Number of parameters
    /// * `entries` - (row, col) pairs defining the sparsity structure, in
    ///   row-major order. The cost function must write Jacobian values in
    ///   exactly this order.
    pub fn new(n_rows: usize, n_cols: usize, entries: &[(usize, usize)]) -> Self {
        let jacobian = build_jacobian(entries, n_rows, n_cols);

        Self {
            tolerance: 1e-10,
            max_iterations: 50,
            initial_lambda: 1e-4,
            lambda_scale_up: 10.0,
            lambda_scale_down: 0.1,
            verbose: false,
            jacobian,
            constant_cols: Vec::new(),
            constant_data_positions: Vec::new(),
            jtr: DVector::zeros(n_cols),
            residuals: DVector::zeros(n_rows),
            temp_residuals: DVector::zeros(n_rows),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_lambda_params(mut self, initial: f64, scale_up: f64, scale_down: f64) -> Self {
        self.initial_lambda = initial;
        self.lambda_scale_up = scale_up;
        self.lambda_scale_down = scale_down;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Hold a subset of parameters exactly constant through the solve.
    pub fn with_constant_params(mut self, cols: &[usize]) -> Self {
        self.constant_cols = cols.to_vec();
        self.constant_cols.sort_unstable();
        self.constant_cols.dedup();

        // Positions in the CSR data array whose column is constant; the
        // structure never changes, so this is computed once.
        self.constant_data_positions = self
            .jacobian
            .indices()
            .iter()
            .enumerate()
            .filter(|(_, col)| self.constant_cols.binary_search(col).is_ok())
            .map(|(pos, _)| pos)
            .collect();
        self
    }

    /// Number of non-zero entries in the Jacobian
    pub fn nnz(&self) -> usize {
        self.jacobian.nnz()
    }

    /// Solve the optimization problem.
    ///
    /// # Arguments
    /// * `params` - Initial parameter guess
    /// * `cost_fn` - Computes residuals and Jacobian values. Receives
    ///   (params, residuals_slice, jacobian_data_slice); Jacobian values
    ///   must be written in the entry order given to the constructor.
    /// * `callback` - Called after each iteration with the running state.
    pub fn solve<F, C>(&mut self, mut params: DVector<f64>, mut cost_fn: F, mut callback: C) -> DVector<f64>
    where
        F: FnMut(&DVector<f64>, &mut [f64], &mut [f64]),
        C: FnMut(usize, &IterationResult, &DVector<f64>),
    {
        let mut lambda = self.initial_lambda;

        for iteration in 0..self.max_iterations {
            self.residuals.fill(0.0);
            cost_fn(
                &params,
                self.residuals.as_mut_slice(),
                self.jacobian.data_mut(),
            );
            let error = self.residuals.norm();

            // Constant parameters: kill their columns before forming the
            // normal equations; with the damped diagonal the step at those
            // indices is exactly zero.
            {
                let data = self.jacobian.data_mut();
                for &pos in &self.constant_data_positions {
                    data[pos] = 0.0;
                }
            }

            let jt: CsMat<f64> = self.jacobian.clone().transpose_into();
            let jtj: CsMat<f64> = &jt * &self.jacobian;

            // J^T * r: jt is CSC, so its outer iterator walks columns of J^T,
            // i.e. rows of J, each scaled by the matching residual.
            self.jtr.fill(0.0);
            for (col_j, col) in jt.outer_iterator().enumerate() {
                let r_j = self.residuals[col_j];
                for (row_i, &val) in col.iter() {
                    self.jtr[row_i] += val * r_j;
                }
            }
            for &c in &self.constant_cols {
                self.jtr[c] = 0.0;
            }

            let gradient_norm = self.jtr.norm();

            let jtj_damped = add_damping(&jtj, lambda);

            let ldl_result = Ldl::new()
                .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                .numeric(jtj_damped.view());

            let ldl = match ldl_result {
                Ok(ldl) => ldl,
                Err(e) => {
                    if self.verbose {
                        println!("LDL factorization failed: {:?}", e);
                    }
                    lambda *= self.lambda_scale_up;
                    continue;
                }
            };

            let jtr_vec: Vec<f64> = self.jtr.iter().cloned().collect();
            let step = DVector::from_vec(ldl.solve(&jtr_vec));

            let new_params = &params - &step;

            self.temp_residuals.fill(0.0);
            cost_fn(
                &new_params,
                self.temp_residuals.as_mut_slice(),
                self.jacobian.data_mut(),
            );
            let new_error = self.temp_residuals.norm();

            let step_norm = step.norm();
            let converged = step_norm < self.tolerance;

            if new_error < error {
                params = new_params;
                lambda *= self.lambda_scale_down;

                callback(
                    iteration,
                    &IterationResult {
                        error,
                        step_norm,
                        lambda,
                        gradient_norm,
                        converged,
                    },
                    &params,
                );

                if converged {
                    if self.verbose {
                        println!("Converged after {} iterations", iteration + 1);
                    }
                    break;
                }
            } else {
                lambda *= self.lambda_scale_up;

                if gradient_norm < 1e-6 {
                    if self.verbose {
                        println!(
                            "Local minimum at iteration {} (gradient={})",
                            iteration, gradient_norm
                        );
                    }
                    break;
                }

                if !lambda.is_finite() || lambda > 1e12 {
                    if self.verbose {
                        println!(
                            "Lambda diverged at iteration {} (lambda={}, gradient={})",
                            iteration, lambda, gradient_norm
                        );
                    }
                    break;
                }

                callback(
                    iteration,
                    &IterationResult {
                        error,
                        step_norm,
                        lambda,
                        gradient_norm,
                        converged: false,
                    },
                    &params,
                );
            }
        }

        params
    }
}

/// Add Levenberg-Marquardt damping to the diagonal:
/// JtJ[i,i] += lambda * max(JtJ[i,i], 1.0)
///
/// Diagonals missing from the sparsity pattern (parameters no residual
/// touches this iteration) are inserted so the factorization never sees a
/// structurally-zero pivot.
fn add_damping(jtj: &CsMat<f64>, lambda: f64) -> CsMat<f64> {
    let n = jtj.cols();
    let mut tri = TriMat::new((n, n));
    let mut diag_present = vec![false; n];

    let indptr_storage = jtj.indptr();
    let indptr: &[usize] = indptr_storage.as_slice().unwrap();
    for outer in 0..n {
        for idx in indptr[outer]..indptr[outer + 1] {
            let inner = jtj.indices()[idx];
            let mut val = jtj.data()[idx];
            if inner == outer {
                val += lambda * f64::max(val, 1.0);
                diag_present[outer] = true;
            }
            tri.add_triplet(inner, outer, val);
        }
    }
    for (i, present) in diag_present.iter().enumerate() {
        if !present {
            tri.add_triplet(i, i, lambda);
        }
    }

    tri.to_csc()
}
