//! Jerk-limited motion trajectory execution core for multi-axis stepper
//! machines.
//!
//! Takes a queue of pre-prepared linear moves (straight lines in axis
//! space with velocity limits and a jerk bound), plans each into an
//! S-curve of head/body/tail sections — grouping consecutive moves that
//! share a cruise phase — and dispatches the result as a stream of
//! fixed-duration step segments with closed-loop following-error
//! correction from encoders.
//!
//! The core is built for a two-priority interrupt system sharing one
//! address space:
//!
//! * the **executor** ([`MotionCore::exec_move`]) runs from the
//!   high-priority stepper context, emits one segment per call, and never
//!   allocates or blocks;
//! * the **planner** ([`MotionCore::plan_move`]) runs from a low-priority
//!   context, requested by the executor through the HAL after every
//!   segment, so planning always runs ahead of consumption;
//! * the **producer** fills free ring slots from task context via
//!   [`MotionCore::append_line`].
//!
//! All shared state lives in a fixed arena of move buffers
//! ([`move_buffer::MoveRing`]) linked by stable indices; no locks are
//! taken and nothing is heap-allocated.

#![cfg_attr(not(test), no_std)]

pub mod block;
pub mod exec;
pub mod kinematics;
pub mod move_buffer;
pub mod plan;
pub mod ramp;
pub mod stepper;
pub mod utils;

pub use block::{Block, Group, GroupState};
pub use exec::{Section, SectionState};
pub use kinematics::{CartesianKinematics, Kinematics};
pub use move_buffer::{
    AxisFlags, BufIdx, Buffer, BufferState, GcodeState, GroupJoin, LineSpec, MoveRing, RingError,
    POOL_SIZE,
};
pub use stepper::{ReportRequest, StepperHal};

/// Number of machine axes.
pub const AXES: usize = 6;
/// Number of motors. Kinematics maps axis space onto motor space, so the
/// two counts are independent.
pub const MOTORS: usize = 6;

/// Nominal segment duration in seconds. Section times are divided into
/// `ceil(time / NOM_SEGMENT_TIME)` equal segments.
pub const NOM_SEGMENT_TIME: f64 = 750e-6;
/// Minimum segment duration in seconds. Sections that cannot be sliced at
/// least this coarse are fused into a neighbouring section before
/// execution begins.
pub const MIN_SEGMENT_TIME: f64 = 250e-6;

/// Outcome of one planner or executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// The operation completed (a buffer finished, or a plan was made).
    Done,
    /// More work remains; call again.
    Again,
    /// Nothing to do.
    Idle,
}

/// Fatal conditions. Any of these stops motion; the caller decides how to
/// surface them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotionError {
    /// A planner or executor invariant was violated.
    Internal(&'static str),
    /// The stepper preparer rejected a segment; propagated verbatim.
    Stepper(&'static str),
}

/// Counters for the non-fatal exceptional conditions. Surfaced through
/// status reports rather than errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Diagnostics {
    /// Zero-length moves that reached the executor.
    pub zero_length_moves: u32,
    /// Sections dropped because they fell below [`MIN_SEGMENT_TIME`] with
    /// nothing to fuse into; the encoders absorb the position error.
    pub min_time_sections: u32,
}

/// The motion core: the buffer ring plus the executor/planner runtime.
///
/// One instance is shared by the producer, the planner context and the
/// executor context. The internal write discipline (who may touch which
/// states) makes that safe without locks; see the module docs of
/// [`plan`] and [`exec`].
pub struct MotionCore {
    pub ring: MoveRing,
    pub(crate) mr: exec::MotionRuntime,
    pub(crate) run_time_remaining: f64,
    pub(crate) diag: Diagnostics,
}

impl Default for MotionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionCore {
    pub fn new() -> Self {
        MotionCore {
            ring: MoveRing::new(),
            mr: exec::MotionRuntime::new(),
            run_time_remaining: 0.0,
            diag: Diagnostics::default(),
        }
    }

    /// Commit one prepared line, wiring it into the group structure.
    ///
    /// Beyond [`MoveRing::commit_line`], an `Extend` of a group the
    /// planner is already tracking also rolls the revision (grown
    /// `group_length`, new exit velocity) onto the group's current first
    /// block, which is what the planner watches for extension detection.
    pub fn append_line(&mut self, spec: &LineSpec, join: GroupJoin) -> Result<BufIdx, RingError> {
        let idx = self.ring.commit_line(spec, join)?;
        if join == GroupJoin::Extend {
            let prev = self.ring.buf(idx).pv;
            let committed_head = self.ring.buf(idx).pv_group;
            for gi in 0..2 {
                let g = self.mr.groups[gi];
                if g.state == GroupState::Off {
                    continue;
                }
                if self.ring.group_contains(g.first_block, prev) {
                    if g.first_block != committed_head {
                        // Dispersal moved the group's effective first block
                        // past the committed head; the revision has to land
                        // there as well.
                        self.ring.buf_mut(g.first_block).group_length += spec.length;
                        self.ring.buf_mut(g.first_block).exit_velocity = spec.exit_velocity;
                    }
                    break;
                }
            }
        }
        Ok(idx)
    }

    /// Set the current position (e.g. after homing). Only valid while no
    /// move is executing.
    pub fn set_position<K: Kinematics>(&mut self, position: [f64; AXES], kin: &K) {
        self.mr.position = position;
        let mut steps = [0.0; MOTORS];
        kin.inverse(&position, &mut steps);
        self.mr.target_steps = steps;
        self.mr.position_steps = steps;
        self.mr.commanded_steps = steps;
    }

    /// Current axis-space position of the executor.
    pub fn position(&self) -> &[f64; AXES] {
        &self.mr.position
    }

    /// Final target of the running move.
    pub fn move_target(&self) -> &[f64; AXES] {
        &self.mr.target
    }

    /// Per-motor following error measured at the last emitted segment.
    pub fn following_error(&self) -> &[f64; MOTORS] {
        &self.mr.following_error
    }

    /// Axes participating in the running move.
    pub fn active_axes(&self) -> AxisFlags {
        self.mr.axis_flags
    }

    /// Gcode snapshot of the running move.
    pub fn gcode_state(&self) -> GcodeState {
        self.mr.gm
    }

    /// Planned time left in the running move, seconds. Decremented per
    /// emitted segment, floored at zero.
    pub fn run_time_remaining(&self) -> f64 {
        self.run_time_remaining
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diag
    }
}
