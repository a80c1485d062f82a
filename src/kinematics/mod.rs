//! Kinematic transforms from axis space to motor space.

pub mod cartesian;

pub use cartesian::CartesianKinematics;

use crate::{AXES, MOTORS};

/// Inverse kinematics: axis-space position to per-motor step counts.
///
/// Pure function of the target; called once per segment from the
/// execution interrupt.
pub trait Kinematics {
    fn inverse(&self, target: &[f64; AXES], steps: &mut [f64; MOTORS]);
}
