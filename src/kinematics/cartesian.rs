use super::Kinematics;
use crate::{AXES, MOTORS};

/// Kinematics for a Cartesian machine: each motor drives one axis.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CartesianKinematics {
    steps_per_mm: [f64; MOTORS],
}

impl CartesianKinematics {
    pub fn new(steps_per_mm: [f64; MOTORS]) -> Self {
        Self { steps_per_mm }
    }

    /// Uniform steps-per-mm on every motor.
    pub fn uniform(steps_per_mm: f64) -> Self {
        Self {
            steps_per_mm: [steps_per_mm; MOTORS],
        }
    }
}

impl Kinematics for CartesianKinematics {
    fn inverse(&self, target: &[f64; AXES], steps: &mut [f64; MOTORS]) {
        for (motor, out) in steps.iter_mut().enumerate() {
            // Motors beyond the axis count hold position.
            *out = if motor < AXES {
                target[motor] * self.steps_per_mm[motor]
            } else {
                0.0
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn inverse_scales_each_axis() {
        let kin = CartesianKinematics::new([80.0, 80.0, 400.0, 100.0, 100.0, 100.0]);
        let target = [1.0, -2.0, 0.5, 0.0, 0.0, 3.0];
        let mut steps = [0.0; MOTORS];
        kin.inverse(&target, &mut steps);
        assert_approx_eq!(f64, steps[0], 80.0);
        assert_approx_eq!(f64, steps[1], -160.0);
        assert_approx_eq!(f64, steps[2], 200.0);
        assert_approx_eq!(f64, steps[5], 300.0);
    }

    #[test]
    fn uniform_applies_same_scale() {
        let kin = CartesianKinematics::uniform(100.0);
        let mut steps = [0.0; MOTORS];
        kin.inverse(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &mut steps);
        assert!(steps.iter().all(|&s| s == 100.0));
    }
}
