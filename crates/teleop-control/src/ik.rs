//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::errors::{ControlError, Result};

/// Regularisation added to `J·Jᵀ`. Fixed; not exposed through configuration.
pub const DAMPING_LAMBDA: f64 = 1e-4;

/// Solve `dq = Jᵀ (J Jᵀ + λI)⁻¹ v` for a 3xN positional Jacobian.
pub fn damped_least_squares(
    jacobian: &DMatrix<f64>,
    velocity: &Vector3<f64>,
    lambda: f64,
) -> Result<DVector<f64>> {
    if jacobian.nrows() != 3 {
        return Err(ControlError::JacobianShape {
            rows: jacobian.nrows(),
            cols: jacobian.ncols(),
        });
    }
    if jacobian.iter().any(|v| !v.is_finite()) {
        return Err(ControlError::NonFiniteJacobian);
    }

    let jjt = jacobian * jacobian.transpose();
    let mut damped = Matrix3::<f64>::zeros();
    for row in 0..3 {
        for col in 0..3 {
            damped[(row, col)] = jjt[(row, col)];
        }
        damped[(row, row)] += lambda;
    }

    // J Jᵀ + λI is symmetric positive definite for λ > 0.
    let y = match damped.cholesky() {
        Some(chol) => chol.solve(velocity),
        None => damped
            .try_inverse()
            .map(|inv| inv * velocity)
            .ok_or(ControlError::NonFiniteJacobian)?,
    };
    let y = DVector::from_column_slice(y.as_slice());
    Ok(jacobian.transpose() * y)
}
