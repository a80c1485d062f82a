//! Jerk-limited S-curve ramp mathematics.
//!
//! Velocity ramps follow a quintic smoothstep between two velocities: the
//! acceleration rises linearly to a peak and falls back to zero within the
//! ramp, so boundary acceleration and jerk are zero at both ends. Two laws
//! fall out of that profile and drive all planning decisions:
//!
//! * ramp distance   `L = (v0 + v1) * sqrt(|v1 - v0| / j)`
//! * ramp time       `T = 2 * L / (v0 + v1)`

use crate::block::Group;
use crate::move_buffer::Buffer;
use crate::utils::{cbrt, fabs, fp_zero, sqrt, EPSILON};

/// Distance needed to change velocity from `v0` to `v1` under jerk `j`
/// (passed as `sqrt(j)`, the cached form on the buffer).
pub fn target_length(v0: f64, v1: f64, sqrt_jerk: f64) -> f64 {
    if fp_zero(sqrt_jerk) {
        return 0.0;
    }
    (v0 + v1) * sqrt(fabs(v1 - v0)) / sqrt_jerk
}

/// Velocity reachable from `v0` over `length` under jerk `jerk`.
///
/// Inverse of [`target_length`]: solves `(v1 - v0) * (v1 + v0)^2 = L^2 * j`
/// for `v1 >= v0` by Newton iteration. The starting point is an upper bound
/// on the root, so the iteration descends monotonically.
pub fn target_velocity(v0: f64, length: f64, jerk: f64) -> f64 {
    if length <= 0.0 || fp_zero(jerk) {
        return v0;
    }
    let l2j = length * length * jerk;
    let mut v = v0 + cbrt(l2j);
    for _ in 0..32 {
        let f = (v - v0) * (v + v0) * (v + v0) - l2j;
        let df = (v + v0) * (3.0 * v - v0);
        if df <= 0.0 {
            break;
        }
        let step = f / df;
        v -= step;
        if fabs(step) < 1e-12 * (1.0 + v) {
            break;
        }
    }
    v.max(v0)
}

/// Ramp time between `v0` and `v1` over `length`.
pub fn ramp_time(length: f64, v0: f64, v1: f64) -> f64 {
    if fp_zero(length) || v0 + v1 <= 0.0 {
        return 0.0;
    }
    2.0 * length / (v0 + v1)
}

/// One canonical ramp curve: a quintic smoothstep from `v0` to `v1` over
/// `time` seconds, parameterised by normalized time `tau` in `[0, 1]`.
///
/// Groups keep one such curve per ramp section; buffer boundaries that land
/// mid-ramp are located on it and their kinematic state read off it.
#[derive(Debug, Clone, Copy)]
pub struct RampCurve {
    v0: f64,
    dv: f64,
    time: f64,
}

impl RampCurve {
    pub fn new(v0: f64, v1: f64, time: f64) -> Self {
        RampCurve {
            v0,
            dv: v1 - v0,
            time,
        }
    }

    /// Velocity at `tau`.
    pub fn velocity(&self, tau: f64) -> f64 {
        let t3 = tau * tau * tau;
        self.v0 + self.dv * t3 * ((6.0 * tau - 15.0) * tau + 10.0)
    }

    /// Acceleration at `tau` (per second, not per unit `tau`).
    pub fn acceleration(&self, tau: f64) -> f64 {
        if fp_zero(self.time) {
            return 0.0;
        }
        let r = 1.0 - tau;
        30.0 * self.dv * tau * tau * r * r / self.time
    }

    /// Jerk at `tau` (per second squared).
    pub fn jerk(&self, tau: f64) -> f64 {
        if fp_zero(self.time) {
            return 0.0;
        }
        60.0 * self.dv * tau * (2.0 * tau - 1.0) * (tau - 1.0) / (self.time * self.time)
    }

    /// Distance travelled from the ramp start to `tau`.
    pub fn length_at(&self, tau: f64) -> f64 {
        let t4 = tau * tau * tau * tau;
        self.time * (self.v0 * tau + self.dv * t4 * ((tau - 3.0) * tau + 2.5))
    }

    /// Normalized time at which `length` of the ramp has been travelled.
    ///
    /// `length_at` is monotone, so a fixed-count bisection is exact enough
    /// and, unlike Newton from a seed, cannot stall where the velocity
    /// starts from zero.
    pub fn invert_length(&self, length: f64) -> f64 {
        let total = self.length_at(1.0);
        if length <= 0.0 {
            return 0.0;
        }
        if length >= total - EPSILON {
            return 1.0;
        }
        let (mut lo, mut hi) = (0.0f64, 1.0f64);
        for _ in 0..64 {
            let mid = 0.5 * (lo + hi);
            if self.length_at(mid) < length {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

/// Design the ramp envelope for a group.
///
/// Given the entry velocity, the group head buffer's limits and the group
/// length, solves for head/body/tail lengths and times and the achieved
/// cruise velocity, writing the result into `group`. When the group is too
/// short to reach `cruise_vmax` the cruise velocity is reduced by bisection
/// until the two ramps exactly fill the length (the symmetric-triangle
/// case). Deterministic: identical inputs produce identical envelopes.
pub(crate) fn calculate_ramps(bf: &Buffer, group: &mut Group, entry_velocity: f64) {
    let length = bf.group_length;
    let exit_velocity = bf.exit_velocity;
    // Correct obvious producer violations rather than faulting.
    let mut cruise = bf.cruise_vmax.max(entry_velocity).max(exit_velocity);

    let mut head = target_length(entry_velocity, cruise, bf.sqrt_jerk);
    let mut tail = target_length(exit_velocity, cruise, bf.sqrt_jerk);
    let mut body = length - head - tail;

    if body < 0.0 {
        let v_floor = entry_velocity.max(exit_velocity);
        let need_floor = target_length(entry_velocity, v_floor, bf.sqrt_jerk)
            + target_length(exit_velocity, v_floor, bf.sqrt_jerk);
        if need_floor > length + EPSILON {
            // Even joining entry to exit does not fit. Scale the ramps into
            // the available length and let the encoders absorb the error.
            cruise = v_floor;
            let scale = if need_floor > 0.0 { length / need_floor } else { 0.0 };
            head = target_length(entry_velocity, v_floor, bf.sqrt_jerk) * scale;
            tail = target_length(exit_velocity, v_floor, bf.sqrt_jerk) * scale;
        } else {
            // Reduce cruise until head + tail == length.
            let (mut lo, mut hi) = (v_floor, cruise);
            for _ in 0..64 {
                let mid = 0.5 * (lo + hi);
                let need = target_length(entry_velocity, mid, bf.sqrt_jerk)
                    + target_length(exit_velocity, mid, bf.sqrt_jerk);
                if need < length {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            cruise = 0.5 * (lo + hi);
            head = target_length(entry_velocity, cruise, bf.sqrt_jerk);
            tail = target_length(exit_velocity, cruise, bf.sqrt_jerk);
        }
        body = (length - head - tail).max(0.0);
    }

    group.entry_velocity = entry_velocity;
    group.cruise_velocity = cruise;
    group.exit_velocity = exit_velocity;
    group.head_length = head;
    group.body_length = body;
    group.tail_length = tail;
    group.head_time = ramp_time(head, entry_velocity, cruise);
    group.body_time = if fp_zero(body) || fp_zero(cruise) {
        0.0
    } else {
        body / cruise
    };
    group.tail_time = ramp_time(tail, exit_velocity, cruise);
}
