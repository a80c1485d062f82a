//! The segment executor.
//!
//! Runs from the high-priority stepper context. Each call to
//! [`MotionCore::exec_move`] prepares exactly one fixed-duration segment
//! (or reports that nothing is runnable): it never blocks, never
//! allocates, and never calls into the planner directly — it raises the
//! plan-request line instead so planning stays ahead of consumption in
//! the lower-priority context.
//!
//! Ramp sections are generated by forward-differencing a quintic Bézier
//! velocity curve: six control points from the boundary velocity,
//! acceleration and jerk, collapsed to monomial coefficients, then five
//! running accumulators yield one velocity per segment with additions
//! only. The first segment samples the curve at the half-step midpoint,
//! which is why the first half of a section runs without an accumulator
//! update. Accumulated float drift is snapped out at the last segment of
//! each section by targeting the precomputed section waypoint.

use crate::block::{Block, Group, GroupState};
use crate::kinematics::Kinematics;
use crate::move_buffer::{AxisFlags, BufIdx, BufferState, GcodeState};
use crate::stepper::{ReportRequest, StepperHal};
use crate::utils::{ceil, fp_ne, fp_zero, EPSILON};
use crate::{MotionCore, MotionError, Progress, AXES, MIN_SEGMENT_TIME, MOTORS, NOM_SEGMENT_TIME};

/// Section of the move currently being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Section {
    /// No move is active.
    Off,
    Head,
    Body,
    Tail,
}

impl Section {
    fn waypoint_index(self) -> usize {
        match self {
            Section::Head => 0,
            Section::Body => 1,
            Section::Tail => 2,
            Section::Off => 0,
        }
    }
}

/// Progress within a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SectionState {
    Off,
    New,
    /// First segment of the section: the midpoint sample is already loaded.
    FirstHalf,
    /// Remaining segments: velocity advances by the difference accumulators.
    SecondHalf,
}

/// Forward-difference accumulators for the quintic velocity curve.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ForwardDiffs {
    pub d1: f64,
    pub d2: f64,
    pub d3: f64,
    pub d4: f64,
    pub d5: f64,
}

impl ForwardDiffs {
    /// One forward-difference step, applied after each emitted segment.
    fn advance(&mut self) {
        self.d5 += self.d4;
        self.d4 += self.d3;
        self.d3 += self.d2;
        self.d2 += self.d1;
    }
}

/// The executor singleton: all per-move runtime state.
///
/// The double-buffered block and group slots rotate by index toggle at
/// buffer and group hand-offs, so the planner always writes "the other"
/// slot from the one execution reads.
pub(crate) struct MotionRuntime {
    pub section: Section,
    pub section_state: SectionState,

    pub groups: [Group; 2],
    /// Index of the running group slot; the other is the planning slot.
    pub r_group_slot: usize,
    pub blocks: [Block; 2],
    /// Index of the running block slot; the other is the planning slot.
    pub r_block: usize,

    /// Entry kinematic state for the running block, fed from the previous
    /// block's exit state at hand-off.
    pub entry_velocity: f64,
    pub entry_acceleration: f64,
    pub entry_jerk: f64,

    pub unit: [f64; AXES],
    pub target: [f64; AXES],
    pub axis_flags: AxisFlags,
    pub gm: GcodeState,

    pub position: [f64; AXES],
    /// Exact end-of-section positions; the last segment of each section
    /// snaps to these to absorb forward-difference drift.
    pub waypoint: [[f64; AXES]; 3],
    pub segment_target: [f64; AXES],

    pub segments: f64,
    pub segment_time: f64,
    pub segment_velocity: f64,
    pub segment_count: u32,
    pub fd: ForwardDiffs,

    /// Body length/time already claimed by body sections of the running
    /// block; a revised (extended) plan shows up as a fresh remainder.
    pub executed_body_length: f64,
    pub executed_body_time: f64,

    // Step bookkeeping. `commanded_steps` trails `target_steps` by two
    // segments so it aligns in time with the encoder readings.
    pub target_steps: [f64; MOTORS],
    pub position_steps: [f64; MOTORS],
    pub commanded_steps: [f64; MOTORS],
    pub encoder_steps: [f64; MOTORS],
    pub following_error: [f64; MOTORS],
}

impl MotionRuntime {
    pub(crate) fn new() -> Self {
        MotionRuntime {
            section: Section::Off,
            section_state: SectionState::Off,
            groups: [Group::default(); 2],
            r_group_slot: 0,
            blocks: [Block::default(); 2],
            r_block: 0,
            entry_velocity: 0.0,
            entry_acceleration: 0.0,
            entry_jerk: 0.0,
            unit: [0.0; AXES],
            target: [0.0; AXES],
            axis_flags: AxisFlags::empty(),
            gm: GcodeState::default(),
            position: [0.0; AXES],
            waypoint: [[0.0; AXES]; 3],
            segment_target: [0.0; AXES],
            segments: 0.0,
            segment_time: 0.0,
            segment_velocity: 0.0,
            segment_count: 0,
            fd: ForwardDiffs::default(),
            executed_body_length: 0.0,
            executed_body_time: 0.0,
            target_steps: [0.0; MOTORS],
            position_steps: [0.0; MOTORS],
            commanded_steps: [0.0; MOTORS],
            encoder_steps: [0.0; MOTORS],
            following_error: [0.0; MOTORS],
        }
    }

    /// Seed the forward-difference accumulators for a ramp section.
    ///
    /// The quintic Bézier control points are built from the boundary
    /// velocities `v0`/`v1`, accelerations `a0`/`a1` and jerks `j0`/`j1`
    /// over section time `t`, expanded into monomial coefficients, then
    /// folded into the five accumulators for step size `h = 1/segments`.
    /// The initial segment velocity is the curve sampled at `h/2`.
    pub(crate) fn init_forward_diffs(
        &mut self,
        v0: f64,
        v1: f64,
        a0: f64,
        a1: f64,
        j0: f64,
        j1: f64,
        t: f64,
    ) {
        let fifth_t = 0.2 * t;
        let two_fifths_t = 0.4 * t;
        let twentieth_t2 = 0.05 * t * t;

        let p0 = v0;
        let p1 = v0 + fifth_t * a0;
        let p2 = v0 + two_fifths_t * a0 + twentieth_t2 * j0;
        let p3 = v1 - two_fifths_t * a1 + twentieth_t2 * j1;
        let p4 = v1 - fifth_t * a1;
        let p5 = v1;

        let a = 5.0 * (p1 - p4 + 2.0 * (p3 - p2)) + p5 - p0;
        let b = 5.0 * (p0 + p4 - 4.0 * (p3 + p1) + 6.0 * p2);
        let c = 10.0 * (p3 - p0 + 3.0 * (p1 - p2));
        let d = 10.0 * (p0 + p2 - 2.0 * p1);
        let e = 5.0 * (p1 - p0);

        let h = 1.0 / self.segments;
        let h2 = h * h;
        let h3 = h2 * h;
        let h4 = h3 * h;
        let h5 = h4 * h;

        let ah5 = a * h5;
        let bh4 = b * h4;
        let ch3 = c * h3;
        let dh2 = d * h2;
        let eh = e * h;

        self.fd.d5 = 7.5625 * ah5 + 5.0 * bh4 + 3.25 * ch3 + 2.0 * dh2 + eh;
        self.fd.d4 = 82.5 * ah5 + 29.0 * bh4 + 9.0 * ch3 + 2.0 * dh2;
        self.fd.d3 = 255.0 * ah5 + 48.0 * bh4 + 6.0 * ch3;
        self.fd.d2 = 300.0 * ah5 + 24.0 * bh4;
        self.fd.d1 = 120.0 * ah5;

        let hh = 0.5 * h;
        let hh2 = hh * hh;
        let hh3 = hh2 * hh;
        let hh4 = hh3 * hh;
        let hh5 = hh4 * hh;
        self.segment_velocity = a * hh5 + b * hh4 + c * hh3 + d * hh2 + e * hh + v0;
    }
}

impl MotionCore {
    /// Execute one tick from the high-priority context.
    ///
    /// Takes the run buffer to `Running` when its plan is ready, raises a
    /// plan request so planning keeps running ahead, and emits exactly one
    /// segment. Returns [`Progress::Again`] while the buffer has more
    /// segments, [`Progress::Done`] when it completed (and was freed), and
    /// [`Progress::Idle`] when nothing was runnable.
    pub fn exec_move<K: Kinematics, H: StepperHal>(
        &mut self,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        let Some(bf) = self.ring.get_run_buffer() else {
            hal.prep_null();
            return Ok(Progress::Idle);
        };
        if self.ring.buf(bf).state != BufferState::Running {
            if self.ring.buf(bf).state == BufferState::Prepped {
                // Not planned yet. Kick the planner and come back.
                hal.request_plan();
                return Ok(Progress::Idle);
            }
            self.ring.buf_mut(bf).state = BufferState::Running;
        }
        // Ask for forward planning of the next move. It cannot run before
        // this function returns, which also lets the block slots rotate
        // first on a new buffer.
        hal.request_plan();
        self.exec_line(bf, kin, hal)
    }

    fn exec_line<K: Kinematics, H: StepperHal>(
        &mut self,
        bf: BufIdx,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        if self.mr.section == Section::Off {
            self.begin_move(bf, hal);
        }

        let status = match self.mr.section {
            Section::Head => self.exec_head(bf, kin, hal),
            Section::Body => self.exec_body(bf, kin, hal),
            Section::Tail => self.exec_tail(bf, kin, hal),
            Section::Off => Err(MotionError::Internal("line executor without a section")),
        };

        // Lock the plan once the end is near: in the tail, or within the
        // last couple of body segments, the back-planner must keep out.
        if self.mr.section == Section::Tail
            || (self.mr.section == Section::Body && self.mr.segment_count < 3)
        {
            self.ring.buf_mut(bf).plannable = false;
        }

        match status {
            Ok(Progress::Again) => {
                hal.request_report(ReportRequest::Timed);
                Ok(Progress::Again)
            }
            Ok(done) => {
                self.finish_move();
                Ok(done)
            }
            Err(e) => {
                // Fatal errors end the move and free the buffer.
                self.finish_move();
                Err(e)
            }
        }
    }

    /// First-call initialisation for a new buffer.
    fn begin_move<H: StepperHal>(&mut self, bf: BufIdx, hal: &mut H) {
        if fp_zero(self.ring.buf(bf).length) {
            // Zero-length moves should have been culled upstream. Report,
            // then play the move out (it completes in one pass).
            self.diag.zero_length_moves += 1;
            hal.request_report(ReportRequest::Immediate);
        }

        self.mr.section = Section::Head;
        self.mr.section_state = SectionState::New;

        // Rotate the group slots before the block slots. A finished group
        // frees its slot for the planning group; inside a group, fold the
        // finished block's sections into the completed tallies so a later
        // re-plan knows where the group already is.
        let rg = self.mr.r_group_slot;
        if self.mr.groups[rg].state == GroupState::Off {
            self.mr.r_group_slot = rg ^ 1;
        } else {
            let rb = self.mr.r_block;
            let head = self.mr.blocks[rb].head_length;
            let body = self.mr.blocks[rb].body_length;
            self.mr.groups[rg].completed_head_length += head;
            self.mr.groups[rg].completed_body_length += body;
        }
        self.mr.r_block ^= 1;
        let pb = self.mr.r_block ^ 1;
        self.mr.blocks[pb].planned = false;

        // Maintain the group linkage around the new running buffer.
        let nx = self.ring.buf(bf).nx;
        let nxg = self.ring.buf(bf).nx_group;
        if nxg != nx {
            // Not the last block of its group: carry the group-shared data
            // onto the next buffer.
            let src = *self.ring.buf(bf);
            let dst = self.ring.buf_mut(nx);
            dst.nx_group = src.nx_group;
            dst.plannable = src.plannable;
            dst.group_length = src.group_length;
            dst.cruise_vmax = src.cruise_vmax;
            dst.cruise_velocity = src.cruise_velocity;
            dst.exit_vmax = src.exit_vmax;
            dst.exit_velocity = src.exit_velocity;
            if fp_ne(dst.jerk, src.jerk) {
                dst.jerk = src.jerk;
                dst.recip_jerk = src.recip_jerk;
                dst.sqrt_jerk = src.sqrt_jerk;
            }
        }
        let pv = self.ring.buf(bf).pv;
        self.ring.buf_mut(bf).pv_group = bf;
        let rg = self.mr.r_group_slot;
        if self.mr.groups[rg].state != GroupState::Off && self.mr.groups[rg].first_block == pv {
            self.mr.groups[rg].first_block = bf;
        }

        self.mr.executed_body_length = 0.0;
        self.mr.executed_body_time = 0.0;

        // Fuse sections shorter than a segment into their neighbours so no
        // section below MIN_SEGMENT_TIME reaches the generators.
        let rb = self.mr.r_block;
        let entry_velocity = self.mr.entry_velocity;
        let r = &mut self.mr.blocks[rb];
        if !fp_zero(r.head_length) && r.head_time < MIN_SEGMENT_TIME {
            r.body_time += r.head_length / r.cruise_velocity;
            r.head_time = 0.0;
            r.body_length += r.head_length;
            r.head_length = 0.0;
        }
        if !fp_zero(r.tail_length) && r.tail_time < MIN_SEGMENT_TIME {
            r.body_time += r.tail_length / r.cruise_velocity;
            r.tail_time = 0.0;
            r.body_length += r.tail_length;
            r.tail_length = 0.0;
        }
        if !fp_zero(r.body_length) && r.body_time < MIN_SEGMENT_TIME {
            if !fp_zero(r.cruise_jerk) {
                // The block carries a partial ramp; there is no clean
                // section to fold the sliver into. Drop it and let the
                // encoders pull the position back in.
                r.body_length = 0.0;
                r.body_time = 0.0;
            } else if r.tail_length > 0.0 {
                if r.head_length > 0.0 {
                    let split = 0.5 * r.body_length;
                    r.body_length = 0.0;
                    r.body_time = 0.0;
                    r.head_length += split;
                    r.tail_length += split;
                    r.head_time += 2.0 * split / (entry_velocity + r.cruise_velocity);
                    r.tail_time += 2.0 * split / (r.cruise_velocity + r.exit_velocity);
                } else {
                    r.tail_length += r.body_length;
                    r.tail_time += 2.0 * r.body_length / (r.cruise_velocity + r.exit_velocity);
                    r.body_length = 0.0;
                    r.body_time = 0.0;
                }
            } else if r.head_length > 0.0 {
                r.head_length += r.body_length;
                r.head_time += 2.0 * r.body_length / (entry_velocity + r.cruise_velocity);
                r.body_length = 0.0;
                r.body_time = 0.0;
            } else {
                // All body and still below the minimum: complete without
                // motion and let the encoders absorb the error.
                r.body_length = 0.0;
                r.body_time = 0.0;
                self.diag.min_time_sections += 1;
                hal.request_report(ReportRequest::Immediate);
            }
        }

        let b = *self.ring.buf(bf);
        self.mr.unit = b.unit;
        self.mr.target = b.target;
        self.mr.axis_flags = b.axis_flags;
        self.mr.gm = b.gm;

        // Waypoints for drift correction at each section end.
        let r = self.mr.blocks[rb];
        for axis in 0..AXES {
            let p = self.mr.position[axis];
            let u = self.mr.unit[axis];
            self.mr.waypoint[0][axis] = p + u * r.head_length;
            self.mr.waypoint[1][axis] = p + u * (r.head_length + r.body_length);
            self.mr.waypoint[2][axis] =
                p + u * (r.head_length + r.body_length + r.tail_length);
        }

        self.run_time_remaining = r.head_time + r.body_time + r.tail_time;
    }

    fn exec_head<K: Kinematics, H: StepperHal>(
        &mut self,
        bf: BufIdx,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        if self.mr.section_state == SectionState::New {
            let r = self.mr.blocks[self.mr.r_block];
            if fp_zero(r.head_length) {
                self.mr.section = Section::Body;
                return self.exec_body(bf, kin, hal);
            }
            self.mr.segments = ceil(r.head_time / NOM_SEGMENT_TIME).max(1.0);
            self.mr.segment_time = r.head_time / self.mr.segments;
            self.mr.segment_count = self.mr.segments as u32;
            if self.mr.segment_count == 1 {
                // One segment: run at the mean velocity, no differencing.
                self.mr.segment_velocity = 0.5 * (self.mr.entry_velocity + r.cruise_velocity);
                self.mr.fd.d5 = 0.0;
                self.mr.section_state = SectionState::SecondHalf;
            } else {
                let (v0, a0, j0) = (
                    self.mr.entry_velocity,
                    self.mr.entry_acceleration,
                    self.mr.entry_jerk,
                );
                self.mr.init_forward_diffs(
                    v0,
                    r.cruise_velocity,
                    a0,
                    r.cruise_acceleration,
                    j0,
                    r.cruise_jerk,
                    r.head_time,
                );
                self.mr.section_state = SectionState::FirstHalf;
            }
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                self.diag.min_time_sections += 1;
                hal.request_report(ReportRequest::Immediate);
                return Ok(Progress::Done); // done without advancing position
            }
            self.mr.section = Section::Head;
        }
        if self.mr.section_state == SectionState::FirstHalf {
            if self.exec_segment(kin, hal)? == Progress::Done {
                // Single remaining segment: the head is already complete.
                self.mr.section = Section::Body;
                self.mr.section_state = SectionState::New;
            } else {
                self.mr.section_state = SectionState::SecondHalf;
            }
            return Ok(Progress::Again);
        }
        if self.mr.section_state == SectionState::SecondHalf {
            self.mr.segment_velocity += self.mr.fd.d5;
            if self.exec_segment(kin, hal)? == Progress::Done {
                let r = self.mr.blocks[self.mr.r_block];
                if fp_zero(r.body_length) && fp_zero(r.tail_length) {
                    return Ok(Progress::Done); // ends the move
                }
                self.mr.section = Section::Body;
                self.mr.section_state = SectionState::New;
            } else {
                self.mr.fd.advance();
            }
        }
        Ok(Progress::Again)
    }

    /// The body is sliced into segments even though it is a straight run,
    /// so a revised plan can take effect between segments mid-line.
    fn exec_body<K: Kinematics, H: StepperHal>(
        &mut self,
        bf: BufIdx,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        if self.mr.segment_velocity < 0.0 {
            return Err(MotionError::Internal("negative segment velocity"));
        }
        if self.mr.section_state == SectionState::New {
            let r = self.mr.blocks[self.mr.r_block];
            let remaining_length = r.body_length - self.mr.executed_body_length;
            if remaining_length < EPSILON {
                self.mr.section = Section::Tail;
                return self.exec_tail(bf, kin, hal);
            }
            if !fp_zero(self.mr.executed_body_length) {
                // Extended mid-flight: rebuild the waypoints ahead of the
                // current position.
                for axis in 0..AXES {
                    let p = self.mr.position[axis];
                    let u = self.mr.unit[axis];
                    self.mr.waypoint[1][axis] = p + u * remaining_length;
                    self.mr.waypoint[2][axis] = p + u * (remaining_length + r.tail_length);
                }
            }
            let body_time = r.body_time - self.mr.executed_body_time;
            self.mr.segments = ceil(body_time / NOM_SEGMENT_TIME).max(1.0);
            self.mr.segment_time = body_time / self.mr.segments;
            self.mr.segment_velocity = r.cruise_velocity;
            self.mr.segment_count = self.mr.segments as u32;
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                self.diag.min_time_sections += 1;
                hal.request_report(ReportRequest::Immediate);
                return Ok(Progress::Done); // done without advancing position
            }
            self.mr.executed_body_length = r.body_length;
            self.mr.executed_body_time = r.body_time;
            self.mr.section = Section::Body;
            self.mr.section_state = SectionState::SecondHalf;
        }
        if self.mr.section_state == SectionState::SecondHalf
            && self.exec_segment(kin, hal)? == Progress::Done
        {
            // Re-enter as New next call: picks up a body extension, or
            // falls through to the tail.
            self.mr.section_state = SectionState::New;
        }
        Ok(Progress::Again)
    }

    fn exec_tail<K: Kinematics, H: StepperHal>(
        &mut self,
        bf: BufIdx,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        if self.mr.section_state == SectionState::New {
            // The tail math is locked in from here.
            self.ring.buf_mut(bf).plannable = false;

            // A fully dispersed group ends with this tail; free its slot so
            // the planner can ramp the next group while the tail runs.
            let rg = self.mr.r_group_slot;
            if self.mr.groups[rg].state == GroupState::Done {
                self.mr.groups[rg].state = GroupState::Off;
            }

            let r = self.mr.blocks[self.mr.r_block];
            if fp_zero(r.tail_length) {
                return Ok(Progress::Done); // ends the move
            }
            self.mr.segments = ceil(r.tail_time / NOM_SEGMENT_TIME).max(1.0);
            self.mr.segment_time = r.tail_time / self.mr.segments;
            self.mr.segment_count = self.mr.segments as u32;
            if self.mr.segment_count == 1 {
                self.mr.segment_velocity = 0.5 * (r.cruise_velocity + r.exit_velocity);
                self.mr.fd.d5 = 0.0;
                self.mr.section_state = SectionState::SecondHalf;
            } else {
                self.mr.init_forward_diffs(
                    r.cruise_velocity,
                    r.exit_velocity,
                    r.cruise_acceleration,
                    r.exit_acceleration,
                    r.cruise_jerk,
                    r.exit_jerk,
                    r.tail_time,
                );
                self.mr.section_state = SectionState::FirstHalf;
            }
            if self.mr.segment_time < MIN_SEGMENT_TIME {
                self.diag.min_time_sections += 1;
                hal.request_report(ReportRequest::Immediate);
                return Ok(Progress::Done); // done without advancing position
            }
            self.mr.section = Section::Tail;
        }
        if self.mr.section_state == SectionState::FirstHalf {
            if self.exec_segment(kin, hal)? == Progress::Done {
                // Only one segment was left in this section.
                self.mr.section_state = SectionState::SecondHalf;
                return Ok(Progress::Done);
            }
            self.mr.section_state = SectionState::SecondHalf;
            return Ok(Progress::Again);
        }
        if self.mr.section_state == SectionState::SecondHalf {
            self.mr.segment_velocity += self.mr.fd.d5;
            if self.exec_segment(kin, hal)? == Progress::Done {
                return Ok(Progress::Done);
            }
            self.mr.fd.advance();
        }
        Ok(Progress::Again)
    }

    /// Emit one segment: compute its target, run the step bookkeeping,
    /// and hand the travel to the stepper preparer.
    fn exec_segment<K: Kinematics, H: StepperHal>(
        &mut self,
        kin: &K,
        hal: &mut H,
    ) -> Result<Progress, MotionError> {
        let wp = self.mr.section.waypoint_index();
        self.mr.segment_count -= 1;

        // The last segment of a section's second half targets the exact
        // section waypoint, absorbing accumulated float drift. Every other
        // segment advances by velocity * time along the unit vector.
        if self.mr.segment_count == 0 && self.mr.section_state == SectionState::SecondHalf {
            self.mr.segment_target = self.mr.waypoint[wp];
        } else {
            let segment_length = self.mr.segment_velocity * self.mr.segment_time;
            for axis in 0..AXES {
                self.mr.segment_target[axis] =
                    self.mr.position[axis] + self.mr.unit[axis] * segment_length;
            }
        }

        // Bucket-brigade the step counts down the chain, delayed by one
        // segment so the encoder readings line up with commanded steps.
        for motor in 0..MOTORS {
            self.mr.commanded_steps[motor] = self.mr.position_steps[motor];
            self.mr.position_steps[motor] = self.mr.target_steps[motor];
            self.mr.encoder_steps[motor] = hal.read_encoder(motor) as f64;
            self.mr.following_error[motor] =
                self.mr.encoder_steps[motor] - self.mr.commanded_steps[motor];
        }
        kin.inverse(&self.mr.segment_target, &mut self.mr.target_steps);
        let mut travel_steps = [0.0; MOTORS];
        for motor in 0..MOTORS {
            travel_steps[motor] = self.mr.target_steps[motor] - self.mr.position_steps[motor];
        }

        self.run_time_remaining = (self.run_time_remaining - self.mr.segment_time).max(0.0);

        hal.prep_line(&travel_steps, &self.mr.following_error, self.mr.segment_time)
            .map_err(MotionError::Stepper)?;
        self.mr.position = self.mr.segment_target;

        Ok(if self.mr.segment_count == 0 {
            Progress::Done
        } else {
            Progress::Again
        })
    }

    /// Wrap up a finished (or failed) move: reset the runtime, hand the
    /// exit kinematic state to the next move's entry, free the buffer.
    fn finish_move(&mut self) {
        self.mr.section = Section::Off;
        self.mr.section_state = SectionState::Off;
        self.run_time_remaining = 0.0;

        let rg = self.mr.r_group_slot;
        if self.mr.groups[rg].state == GroupState::Done {
            self.mr.groups[rg].state = GroupState::Off;
        }

        let rb = self.mr.r_block;
        self.mr.entry_velocity = self.mr.blocks[rb].exit_velocity;
        self.mr.entry_acceleration = self.mr.blocks[rb].exit_acceleration;
        self.mr.entry_jerk = self.mr.blocks[rb].exit_jerk;

        self.ring.free_run_buffer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly_velocity(v0: f64, v1: f64, a0: f64, a1: f64, j0: f64, j1: f64, t: f64, tau: f64) -> f64 {
        let p0 = v0;
        let p1 = v0 + 0.2 * t * a0;
        let p2 = v0 + 0.4 * t * a0 + 0.05 * t * t * j0;
        let p3 = v1 - 0.4 * t * a1 + 0.05 * t * t * j1;
        let p4 = v1 - 0.2 * t * a1;
        let p5 = v1;
        let a = 5.0 * (p1 - p4 + 2.0 * (p3 - p2)) + p5 - p0;
        let b = 5.0 * (p0 + p4 - 4.0 * (p3 + p1) + 6.0 * p2);
        let c = 10.0 * (p3 - p0 + 3.0 * (p1 - p2));
        let d = 10.0 * (p0 + p2 - 2.0 * p1);
        let e = 5.0 * (p1 - p0);
        ((((a * tau + b) * tau + c) * tau + d) * tau + e) * tau + p0
    }

    #[test]
    fn forward_diffs_match_direct_evaluation() {
        let (v0, v1) = (5.0, 30.0);
        let (a0, a1) = (12.0, 0.0);
        let (j0, j1) = (150.0, 0.0);
        let t = 0.1;
        let n = 16u32;

        let mut mr = MotionRuntime::new();
        mr.segments = n as f64;
        mr.init_forward_diffs(v0, v1, a0, a1, j0, j1, t);

        let h = 1.0 / n as f64;
        // Segment k runs at the curve midpoint velocity V((k - 0.5) h).
        for k in 1..=n {
            if k > 1 {
                mr.segment_velocity += mr.fd.d5;
                mr.fd.advance();
            }
            let expect = poly_velocity(v0, v1, a0, a1, j0, j1, t, (k as f64 - 0.5) * h);
            assert!(
                (mr.segment_velocity - expect).abs() < 1e-9,
                "segment {}: {} vs {}",
                k,
                mr.segment_velocity,
                expect
            );
        }
    }

    #[test]
    fn forward_diffs_zero_boundary_head_is_monotone() {
        let mut mr = MotionRuntime::new();
        let n = 40u32;
        mr.segments = n as f64;
        mr.init_forward_diffs(0.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.08);
        let mut last = mr.segment_velocity;
        assert!(last >= 0.0);
        for _ in 2..=n {
            mr.segment_velocity += mr.fd.d5;
            mr.fd.advance();
            assert!(mr.segment_velocity >= last - 1e-12);
            last = mr.segment_velocity;
        }
        assert!(last <= 50.0 + 1e-9);
    }
}
