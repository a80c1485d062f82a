//! The group planner.
//!
//! Runs from the low-priority context, requested by the executor after
//! every segment so planning stays ahead of consumption. Each call does a
//! bounded amount of work: detect and apply group revisions (extension or
//! a raised exit velocity), ramp a new group, or plan one buffer's block.
//! At most one buffer is `Planned` ahead of the run cursor at a time; the
//! planning block slot only rotates when the executor takes a buffer, so
//! the planner and executor never write the same slot.

use crate::block::{calculate_block, GroupState, LENGTH_SLOP};
use crate::exec::Section;
use crate::move_buffer::BufferState;
use crate::ramp::{calculate_ramps, ramp_time, target_length};
use crate::stepper::StepperHal;
use crate::utils::{fp_ge, fp_ne, fp_zero, EPSILON};
use crate::{MotionCore, MotionError, Progress};

impl MotionCore {
    /// Run one planning pass.
    ///
    /// Returns [`Progress::Done`] when something was planned,
    /// [`Progress::Idle`] when there was nothing to do, or an error on a
    /// violated planner invariant (fatal; motion stops).
    pub fn plan_move<H: StepperHal>(&mut self, hal: &mut H) -> Result<Progress, MotionError> {
        let Some(run_idx) = self.ring.get_run_buffer() else {
            hal.prep_null();
            return Ok(Progress::Idle);
        };
        let mut bf = run_idx;

        let mut group_extended = false;
        let mut velocity_changed = false;
        let r_gi = self.mr.r_group_slot;
        let p_gi = r_gi ^ 1;

        // Working-group selection: stay on the running group while it is
        // dispersing or needs revision, otherwise move to the planning one.
        if self.mr.groups[r_gi].state != GroupState::Off {
            self.detect_group_change(r_gi, &mut group_extended, &mut velocity_changed);
            self.attempt_extension(r_gi, &mut group_extended, &mut velocity_changed)?;
        }
        let gi = if group_extended
            || velocity_changed
            || (self.mr.groups[r_gi].state != GroupState::Off
                && self.mr.groups[r_gi].state != GroupState::Done)
        {
            r_gi
        } else {
            if self.mr.groups[p_gi].state != GroupState::Off {
                self.detect_group_change(p_gi, &mut group_extended, &mut velocity_changed);
                self.attempt_extension(p_gi, &mut group_extended, &mut velocity_changed)?;
            }
            p_gi
        };

        // Choose the buffer to plan, the block slot to write, and the entry
        // kinematic state.
        let mut bi = self.mr.r_block ^ 1;
        let mut entry_velocity = self.mr.entry_velocity;
        let mut entry_acceleration = self.mr.entry_acceleration;
        let mut entry_jerk = self.mr.entry_jerk;

        if self.ring.buf(bf).state == BufferState::Running {
            if (group_extended || velocity_changed) && gi == r_gi {
                // Revising the running group: rewrite the running block in
                // place. Entry state stays the block's original entry.
                bi = self.mr.r_block;
            } else if gi == p_gi && self.mr.groups[p_gi].state == GroupState::Done {
                // Everything plannable is planned.
                return Ok(Progress::Idle);
            } else {
                bf = self.ring.buf(bf).nx;
                let rb = self.mr.r_block;
                entry_velocity = self.mr.blocks[rb].exit_velocity;
                entry_acceleration = self.mr.blocks[rb].exit_acceleration;
                entry_jerk = self.mr.blocks[rb].exit_jerk;
            }
        }

        if self.ring.buf(bf).state < BufferState::Prepped {
            return Ok(Progress::Idle);
        }

        // A fresh group: solve its ramp envelope.
        if self.ring.buf(bf).state == BufferState::Prepped
            && self.mr.groups[gi].state == GroupState::Off
        {
            let buf = *self.ring.buf(bf);
            calculate_ramps(&buf, &mut self.mr.groups[gi], entry_velocity);
            let g = &self.mr.groups[gi];
            if g.head_length < 0.0 || g.body_length < 0.0 || g.tail_length < 0.0 {
                return Err(MotionError::Internal("negative section length after ramping"));
            }
            if fp_zero(g.cruise_velocity) && !fp_zero(buf.group_length) {
                return Err(MotionError::Internal("ramped group with zero cruise velocity"));
            }
            #[cfg(feature = "defmt")]
            defmt::trace!(
                "group ramped: head {} body {} tail {} cruise {}",
                g.head_length,
                g.body_length,
                g.tail_length,
                g.cruise_velocity
            );
            let g = &mut self.mr.groups[gi];
            g.completed_head_length = 0.0;
            g.completed_body_length = 0.0;
            g.first_block = bf;
            g.length = buf.group_length;
            g.length_into_section = 0.0;
            g.t_into_section = 0.0;
            g.state = GroupState::Ramped;
        }

        if self.mr.groups[gi].state == GroupState::Ramped {
            self.start_dispersal(gi, bf);
        }

        let group_state = self.mr.groups[gi].state;
        if matches!(
            group_state,
            GroupState::Head | GroupState::Body | GroupState::Tail
        ) && self.ring.buf(bf).state != BufferState::Planned
        {
            {
                let g = &self.mr.groups[gi];
                if g.head_length < 0.0 || g.body_length < 0.0 || g.tail_length < 0.0 {
                    return Err(MotionError::Internal("negative section length at dispersal"));
                }
            }
            let buf = *self.ring.buf(bf);
            let status = calculate_block(
                &buf,
                &mut self.mr.groups[gi],
                &mut self.mr.blocks[bi],
                entry_velocity,
                entry_acceleration,
                entry_jerk,
            );

            let blk = self.mr.blocks[bi];
            if blk.exit_velocity > blk.cruise_velocity + EPSILON {
                return Err(MotionError::Internal("block exit above its cruise"));
            }
            if buf.length >= 0.001
                && blk.head_length < 0.001
                && blk.body_length < 0.001
                && blk.tail_length < 0.001
            {
                return Err(MotionError::Internal("planned an empty block"));
            }

            self.mr.blocks[bi].planned = true;
            if status == Progress::Done {
                self.mr.groups[gi].state = GroupState::Done;
            }
            // Re-planning the running buffer leaves it Running; everything
            // else becomes Planned.
            if self.ring.buf(bf).state != BufferState::Running {
                self.ring.buf_mut(bf).state = BufferState::Planned;
            }
            return Ok(Progress::Done);
        }

        Ok(Progress::Idle)
    }

    /// Compare a live group against its first block's current producer
    /// data: a grown `group_length` marks an extension, a raised exit
    /// velocity marks a revision. Corrects the producer-race case where
    /// `exit_velocity` momentarily exceeds `exit_vmax`.
    fn detect_group_change(&mut self, gi: usize, extended: &mut bool, velocity_changed: &mut bool) {
        let fb = self.mr.groups[gi].first_block;
        if !fp_ge(self.mr.groups[gi].length, self.ring.buf(fb).group_length) {
            *extended = true;
        }
        let exit_vmax = self.ring.buf(fb).exit_vmax;
        if self.ring.buf(fb).exit_velocity > exit_vmax {
            self.ring.buf_mut(fb).exit_velocity = exit_vmax;
        }
        if !fp_ge(
            self.mr.groups[gi].exit_velocity,
            self.ring.buf(fb).exit_velocity,
        ) {
            *velocity_changed = true;
        }
    }

    /// Try to apply a detected group revision. On failure both flags are
    /// cleared and the group plays out as already planned.
    fn attempt_extension(
        &mut self,
        gi: usize,
        extended: &mut bool,
        velocity_changed: &mut bool,
    ) -> Result<(), MotionError> {
        if !*extended && !*velocity_changed {
            return Ok(());
        }
        let is_running = gi == self.mr.r_group_slot;
        if is_running && self.mr.section == Section::Tail {
            // The tail math is locked in; play it out as planned.
            #[cfg(feature = "defmt")]
            defmt::warn!("group revision rejected: running group already in its tail");
            *extended = false;
            *velocity_changed = false;
            return Ok(());
        }

        let g = self.mr.groups[gi];
        let fb = g.first_block;
        let fb_exit = self.ring.buf(fb).exit_velocity;
        let new_length = if *extended {
            self.ring.buf(fb).group_length
        } else {
            g.length
        };

        if fp_ne(fb_exit, g.cruise_velocity) {
            // The group will end with a tail.
            let tail_length = target_length(fb_exit, g.cruise_velocity, self.ring.buf(fb).sqrt_jerk);

            // Reject a tail that would eat into body length the executor
            // has already dispatched.
            if is_running && self.mr.section == Section::Body {
                let new_body = new_length - g.head_length - tail_length;
                let dispatched = g.completed_body_length + self.mr.executed_body_length;
                if new_body + LENGTH_SLOP < dispatched {
                    *extended = false;
                    *velocity_changed = false;
                    return Ok(());
                }
            }

            if *extended || !is_running || tail_length < g.tail_length {
                let gm = &mut self.mr.groups[gi];
                gm.length = new_length;
                gm.exit_velocity = fb_exit;
                gm.tail_length = tail_length;
                gm.body_length = gm.length - (tail_length + gm.head_length);
                gm.body_time = if fp_zero(gm.cruise_velocity) {
                    0.0
                } else {
                    gm.body_length / gm.cruise_velocity
                };
                gm.tail_time = ramp_time(tail_length, gm.exit_velocity, gm.cruise_velocity);
            } else {
                // Inversion zone: the smaller velocity change needs a
                // *longer* braking distance here. Put the old exit velocity
                // back so we do not re-enter this attempt every pass.
                self.ring.buf_mut(fb).exit_velocity = g.exit_velocity;
                *velocity_changed = false;
            }
        } else {
            // Exit equals cruise: the group cruises to its end.
            let gm = &mut self.mr.groups[gi];
            gm.length = new_length;
            gm.exit_velocity = gm.cruise_velocity;
            gm.body_length = gm.length - gm.head_length;
            gm.body_time = if fp_zero(gm.cruise_velocity) {
                0.0
            } else {
                gm.body_length / gm.cruise_velocity
            };
            gm.tail_length = 0.0;
            gm.tail_time = 0.0;
        }

        if *extended || *velocity_changed {
            let gm = &mut self.mr.groups[gi];
            gm.state = GroupState::Ramped;
            gm.length_into_section = 0.0;
            gm.t_into_section = 0.0;
            if gm.head_length < 0.0 || gm.body_length < 0.0 || gm.tail_length < 0.0 {
                return Err(MotionError::Internal("negative section length after revision"));
            }
            // Stale plans must be re-planned. At most one buffer is ever
            // Planned ahead of the run cursor, so the candidates are the
            // run buffer itself (when execution has not taken it yet) and
            // its successor. A Running buffer keeps its state; only its
            // block plan is rewritten.
            if let Some(run) = self.ring.get_run_buffer() {
                if self.ring.buf(run).state == BufferState::Planned {
                    self.ring.buf_mut(run).state = BufferState::Prepped;
                }
                let nx = self.ring.buf(run).nx;
                if self.ring.buf(nx).state == BufferState::Planned {
                    self.ring.buf_mut(nx).state = BufferState::Prepped;
                    if is_running {
                        // That plan may belong to the planning group, whose
                        // dispersal is now inconsistent; force a re-ramp.
                        self.mr.groups[gi ^ 1].state = GroupState::Off;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move a ramped group into dispersal.
    ///
    /// Finds the first buffer that will contain any tail and makes it the
    /// group's first block as far as the back-planner is concerned: the
    /// head/body span in front of it is locked (its predecessor's exit is
    /// invalidated), and the group's cruise/exit constraints and length
    /// are pushed onto it. Also positions the dispersal cursor, starting
    /// after whatever the executor has already completed (which is how a
    /// mid-flight re-plan resumes in the right section).
    fn start_dispersal(&mut self, gi: usize, bf: crate::move_buffer::BufIdx) {
        let g = self.mr.groups[gi];
        let mut lock_left = (g.head_length - g.completed_head_length)
            + (g.body_length - g.completed_body_length);
        let mut la = bf;
        while (self.ring.buf(la).length + LENGTH_SLOP) < lock_left {
            lock_left -= self.ring.buf(la).length;
            la = self.ring.buf(la).nx;
        }

        let nxg = self.ring.buf(bf).nx_group;
        self.mr.groups[gi].first_block = la;
        self.ring.buf_mut(la).nx_group = nxg;

        // Back-planning must not touch anything in front of the tail: the
        // predecessor's exit is pinned at zero so any entry the
        // back-planner finds for `la` can only be higher.
        let la_pv = self.ring.buf(la).pv;
        self.ring.buf_mut(la_pv).exit_vmax = 0.0;
        self.ring.buf_mut(la_pv).exit_velocity = 0.0;

        let lab = self.ring.buf_mut(la);
        lab.cruise_vmax = g.cruise_velocity;
        lab.exit_vmax = g.cruise_velocity;
        lab.exit_velocity = g.exit_velocity;
        lab.cruise_velocity = g.cruise_velocity;
        lab.group_length = g.length;

        let gm = &mut self.mr.groups[gi];
        if gm.completed_head_length < gm.head_length - EPSILON {
            gm.state = GroupState::Head;
            gm.length_into_section = gm.completed_head_length;
        } else if gm.completed_body_length < gm.body_length - EPSILON {
            gm.state = GroupState::Body;
            gm.length_into_section = gm.completed_body_length;
        } else if !fp_zero(gm.tail_length) {
            gm.state = GroupState::Tail;
            gm.length_into_section = 0.0;
        } else {
            gm.state = GroupState::Body;
            gm.length_into_section = gm.completed_body_length;
        }
        gm.t_into_section = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_buffer::{GcodeState, GroupJoin, LineSpec};
    use crate::stepper::ReportRequest;
    use crate::{MotionCore, MOTORS};

    struct NullHal {
        plan_requests: u32,
        null_preps: u32,
    }

    impl NullHal {
        fn new() -> Self {
            NullHal {
                plan_requests: 0,
                null_preps: 0,
            }
        }
    }

    impl StepperHal for NullHal {
        fn prep_line(
            &mut self,
            _travel: &[f64; MOTORS],
            _ferror: &[f64; MOTORS],
            _time: f64,
        ) -> Result<(), &'static str> {
            Ok(())
        }
        fn prep_null(&mut self) {
            self.null_preps += 1;
        }
        fn read_encoder(&mut self, _motor: usize) -> i32 {
            0
        }
        fn request_plan(&mut self) {
            self.plan_requests += 1;
        }
        fn request_report(&mut self, _kind: ReportRequest) {}
    }

    fn line(length: f64, cruise_vmax: f64, exit: f64) -> LineSpec {
        LineSpec {
            target: [length, 0.0, 0.0, 0.0, 0.0, 0.0],
            unit: [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            length,
            jerk: 31250.0,
            cruise_vmax,
            exit_vmax: exit,
            exit_velocity: exit,
            gm: GcodeState::default(),
        }
    }

    #[test]
    fn empty_ring_is_a_noop() {
        let mut core = MotionCore::new();
        let mut hal = NullHal::new();
        assert_eq!(core.plan_move(&mut hal).unwrap(), Progress::Idle);
        assert_eq!(hal.null_preps, 1);
    }

    #[test]
    fn plans_one_buffer_then_idles() {
        let mut core = MotionCore::new();
        let mut hal = NullHal::new();
        let idx = core
            .append_line(&line(14.0, 50.0, 0.0), GroupJoin::Start)
            .unwrap();
        assert_eq!(core.plan_move(&mut hal).unwrap(), Progress::Done);
        assert_eq!(core.ring.buf(idx).state, BufferState::Planned);
        // One planned buffer ahead of the run cursor at a time.
        assert_eq!(core.plan_move(&mut hal).unwrap(), Progress::Idle);
    }

    #[test]
    fn race_overshoot_of_exit_velocity_is_clamped() {
        let mut core = MotionCore::new();
        let mut hal = NullHal::new();
        let idx = core
            .append_line(&line(14.0, 50.0, 10.0), GroupJoin::Start)
            .unwrap();
        core.plan_move(&mut hal).unwrap();

        // Simulate the back-planner racing in a too-high exit velocity.
        let fb = {
            let g = &core.mr.groups[core.mr.r_group_slot ^ 1];
            g.first_block
        };
        assert_eq!(fb, idx);
        core.ring.buf_mut(fb).exit_velocity = core.ring.buf(fb).exit_vmax + 25.0;
        core.plan_move(&mut hal).unwrap();
        assert_eq!(
            core.ring.buf(fb).exit_velocity,
            core.ring.buf(fb).exit_vmax
        );
    }

    #[test]
    fn extension_demotes_planned_buffer_for_replan() {
        let mut core = MotionCore::new();
        let mut hal = NullHal::new();
        // Two-buffer group, head buffer planned, second pending.
        let b0 = core
            .append_line(&line(6.0, 50.0, 0.0), GroupJoin::Start)
            .unwrap();
        let _b1 = core
            .append_line(&line(6.0, 50.0, 0.0), GroupJoin::Extend)
            .unwrap();
        assert_eq!(core.plan_move(&mut hal).unwrap(), Progress::Done);
        assert_eq!(core.ring.buf(b0).state, BufferState::Planned);

        // Producer appends a third buffer, growing the group.
        let b2 = core
            .append_line(&line(6.0, 50.0, 0.0), GroupJoin::Extend)
            .unwrap();
        // The next pass applies the extension: the group envelope grows,
        // the tail moves into the new last buffer, the stale plan is
        // demoted and b0 is re-planned against the new envelope.
        let status = core.plan_move(&mut hal).unwrap();
        assert_eq!(status, Progress::Done);
        let gi = core.mr.r_group_slot ^ 1;
        assert_eq!(core.mr.groups[gi].length, 18.0);
        assert_eq!(core.mr.groups[gi].first_block, b2);
        assert_eq!(core.ring.buf(b0).state, BufferState::Planned);
    }
}
