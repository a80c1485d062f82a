//! Block and group runtime state, and the dispersal of a group's planned
//! envelope across the buffers that make it up.

use crate::move_buffer::{BufIdx, Buffer};
use crate::ramp::RampCurve;
use crate::utils::fp_zero;
use crate::Progress;

/// Length slack when deciding whether a section remainder fits a buffer.
/// Section lengths are differences of summed buffer lengths, so exact
/// comparisons would split sections on rounding noise.
pub(crate) const LENGTH_SLOP: f64 = 1e-4;

/// Dispersal lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GroupState {
    /// Slot is free; nothing planned.
    #[default]
    Off,
    /// Ramp envelope solved, dispersal not yet started.
    Ramped,
    /// Dispersing the named section into buffers.
    Head,
    Body,
    Tail,
    /// Fully dispersed; kept around until the executor finishes it.
    Done,
}

/// One group's planned envelope: the shared S-curve of one or more
/// consecutive buffers cruising at a common velocity.
///
/// Two instances exist, the running and the planning group; they swap
/// roles as the executor crosses group boundaries. `first_block` is only
/// meaningful while `state != Off`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Group {
    pub state: GroupState,
    pub first_block: BufIdx,

    pub length: f64,
    pub entry_velocity: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub head_time: f64,
    pub body_time: f64,
    pub tail_time: f64,

    /// Head/body length already executed by finished buffers of this group.
    pub completed_head_length: f64,
    pub completed_body_length: f64,

    /// Dispersal cursor: distance and normalized time into the section
    /// currently being sliced into buffers.
    pub length_into_section: f64,
    pub t_into_section: f64,
}

impl Group {
    /// Canonical curve of the group's acceleration ramp.
    pub(crate) fn head_curve(&self) -> RampCurve {
        RampCurve::new(self.entry_velocity, self.cruise_velocity, self.head_time)
    }

    /// Canonical curve of the group's deceleration ramp.
    pub(crate) fn tail_curve(&self) -> RampCurve {
        RampCurve::new(self.cruise_velocity, self.exit_velocity, self.tail_time)
    }
}

/// One buffer's planned slice of its group: section lengths and times plus
/// the kinematic state at the top ("cruise") and end ("exit") of the block.
///
/// For a block that ends mid-ramp the cruise state is the ramp state at the
/// block boundary, so `cruise_jerk != 0` marks a partial ramp. Two
/// instances exist (running and planning) and swap at buffer hand-off.
#[derive(Debug, Clone, Copy, Default)]
pub struct Block {
    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub head_time: f64,
    pub body_time: f64,
    pub tail_time: f64,

    pub cruise_velocity: f64,
    pub cruise_acceleration: f64,
    pub cruise_jerk: f64,
    pub exit_velocity: f64,
    pub exit_acceleration: f64,
    pub exit_jerk: f64,

    pub planned: bool,
}

/// Slice the group's remaining head/body/tail into one buffer.
///
/// Writes a complete block plan for `bf`: as much of the remaining head,
/// then body, then tail as fits in `bf.length`. Buffer boundaries landing
/// mid-ramp are located on the group's canonical curve and the boundary
/// velocity/acceleration/jerk become the block's exit state (and the next
/// block's entry state). Returns [`Progress::Done`] when the group's
/// remainder fits entirely in this buffer, [`Progress::Again`] otherwise.
pub(crate) fn calculate_block(
    bf: &Buffer,
    group: &mut Group,
    block: &mut Block,
    entry_velocity: f64,
    entry_acceleration: f64,
    entry_jerk: f64,
) -> Progress {
    *block = Block {
        cruise_velocity: group.cruise_velocity,
        ..Block::default()
    };
    let mut avail = bf.length;

    if group.state == GroupState::Head {
        let rem = (group.head_length - group.length_into_section).max(0.0);
        if rem <= avail + LENGTH_SLOP {
            if rem > 0.0 {
                let curve = group.head_curve();
                let tau1 = curve.invert_length(group.length_into_section);
                block.head_length = rem;
                block.head_time = (1.0 - tau1) * group.head_time;
            }
            avail = (avail - rem).max(0.0);
            group.state = GroupState::Body;
            group.length_into_section = 0.0;
            group.t_into_section = 0.0;
        } else {
            // The buffer ends inside the acceleration ramp.
            let curve = group.head_curve();
            let l1 = group.length_into_section;
            let l2 = l1 + avail;
            let tau1 = curve.invert_length(l1);
            let tau2 = curve.invert_length(l2);
            block.head_length = avail;
            block.head_time = (tau2 - tau1) * group.head_time;
            block.cruise_velocity = curve.velocity(tau2);
            block.cruise_acceleration = curve.acceleration(tau2);
            block.cruise_jerk = curve.jerk(tau2);
            block.exit_velocity = block.cruise_velocity;
            block.exit_acceleration = block.cruise_acceleration;
            block.exit_jerk = block.cruise_jerk;
            group.length_into_section = l2;
            group.t_into_section = tau2;
            return Progress::Again;
        }
    }

    if group.state == GroupState::Body {
        let rem = (group.body_length - group.length_into_section).max(0.0);
        let cruise = group.cruise_velocity;
        if rem <= avail + LENGTH_SLOP {
            block.body_length = rem;
            block.body_time = if fp_zero(cruise) { 0.0 } else { rem / cruise };
            block.exit_velocity = cruise;
            block.exit_acceleration = 0.0;
            block.exit_jerk = 0.0;
            avail = (avail - rem).max(0.0);
            group.state = GroupState::Tail;
            group.length_into_section = 0.0;
            group.t_into_section = 0.0;
        } else {
            block.body_length = avail;
            block.body_time = if fp_zero(cruise) { 0.0 } else { avail / cruise };
            block.exit_velocity = cruise;
            block.exit_acceleration = 0.0;
            block.exit_jerk = 0.0;
            group.length_into_section += avail;
            return Progress::Again;
        }
    }

    if group.state == GroupState::Tail {
        // A block that begins inside the tail never cruises; its "cruise"
        // state is its entry state (a tail always runs cruise -> exit).
        if fp_zero(block.head_length) && fp_zero(block.body_length) {
            block.cruise_velocity = entry_velocity;
            block.cruise_acceleration = entry_acceleration;
            block.cruise_jerk = entry_jerk;
        }
        let rem = (group.tail_length - group.length_into_section).max(0.0);
        if rem <= LENGTH_SLOP {
            // Nothing left of the tail (or the group cruises to its end).
            block.exit_velocity = group.exit_velocity;
            block.exit_acceleration = 0.0;
            block.exit_jerk = 0.0;
            return Progress::Done;
        }
        if avail <= LENGTH_SLOP {
            // The body filled the buffer exactly; the tail starts in the
            // next one.
            return Progress::Again;
        }
        let curve = group.tail_curve();
        let l1 = group.length_into_section;
        let tau1 = curve.invert_length(l1);
        if rem <= avail + LENGTH_SLOP {
            block.tail_length = rem;
            block.tail_time = (1.0 - tau1) * group.tail_time;
            block.exit_velocity = group.exit_velocity;
            block.exit_acceleration = 0.0;
            block.exit_jerk = 0.0;
            group.length_into_section = 0.0;
            group.t_into_section = 0.0;
            return Progress::Done;
        }
        let l2 = l1 + avail;
        let tau2 = curve.invert_length(l2);
        block.tail_length = avail;
        block.tail_time = (tau2 - tau1) * group.tail_time;
        block.exit_velocity = curve.velocity(tau2);
        block.exit_acceleration = curve.acceleration(tau2);
        block.exit_jerk = curve.jerk(tau2);
        group.length_into_section = l2;
        group.t_into_section = tau2;
        return Progress::Again;
    }

    Progress::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_buffer::{GcodeState, GroupJoin, LineSpec, MoveRing};
    use crate::ramp::calculate_ramps;
    use float_cmp::assert_approx_eq;

    fn line(length: f64, jerk: f64, cruise_vmax: f64, exit_velocity: f64) -> LineSpec {
        LineSpec {
            target: [length, 0.0, 0.0, 0.0, 0.0, 0.0],
            unit: [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            length,
            jerk,
            cruise_vmax,
            exit_vmax: exit_velocity,
            exit_velocity,
            gm: GcodeState::default(),
        }
    }

    // Jerk chosen so that target_length(0, 50) == 2.0 exactly.
    const JERK_2MM_RAMP: f64 = 31250.0;

    #[test]
    fn single_buffer_group_is_one_block() {
        let mut ring = MoveRing::new();
        let idx = ring
            .commit_line(&line(14.0, JERK_2MM_RAMP, 50.0, 0.0), GroupJoin::Start)
            .unwrap();
        let mut group = Group::default();
        calculate_ramps(ring.buf(idx), &mut group, 0.0);
        group.state = GroupState::Head;

        let mut block = Block::default();
        let status = calculate_block(ring.buf(idx), &mut group, &mut block, 0.0, 0.0, 0.0);
        assert_eq!(status, Progress::Done);
        assert_approx_eq!(f64, block.head_length, 2.0, epsilon = 1e-6);
        assert_approx_eq!(f64, block.body_length, 10.0, epsilon = 1e-6);
        assert_approx_eq!(f64, block.tail_length, 2.0, epsilon = 1e-6);
        assert_approx_eq!(
            f64,
            block.head_length + block.body_length + block.tail_length,
            14.0,
            epsilon = 1e-9
        );
        assert_approx_eq!(f64, block.cruise_velocity, 50.0, epsilon = 1e-6);
        assert_approx_eq!(f64, block.exit_velocity, 0.0, epsilon = 1e-6);
        assert_eq!(block.cruise_jerk, 0.0);
    }

    #[test]
    fn three_buffer_group_disperses_head_body_tail() {
        let mut ring = MoveRing::new();
        let b0 = ring
            .commit_line(&line(2.0, JERK_2MM_RAMP, 50.0, 0.0), GroupJoin::Start)
            .unwrap();
        let b1 = ring
            .commit_line(&line(10.0, JERK_2MM_RAMP, 50.0, 0.0), GroupJoin::Extend)
            .unwrap();
        let b2 = ring
            .commit_line(&line(2.0, JERK_2MM_RAMP, 50.0, 0.0), GroupJoin::Extend)
            .unwrap();

        let mut group = Group::default();
        calculate_ramps(ring.buf(b0), &mut group, 0.0);
        group.state = GroupState::Head;
        assert_approx_eq!(f64, group.head_length, 2.0, epsilon = 1e-6);
        assert_approx_eq!(f64, group.body_length, 10.0, epsilon = 1e-6);
        assert_approx_eq!(f64, group.tail_length, 2.0, epsilon = 1e-6);

        let mut blocks = [Block::default(); 3];
        let s0 = calculate_block(ring.buf(b0), &mut group, &mut blocks[0], 0.0, 0.0, 0.0);
        assert_eq!(s0, Progress::Again);
        let (b0_exit_velocity, b0_exit_acceleration, b0_exit_jerk) = (
            blocks[0].exit_velocity,
            blocks[0].exit_acceleration,
            blocks[0].exit_jerk,
        );
        let s1 = calculate_block(
            ring.buf(b1),
            &mut group,
            &mut blocks[1],
            b0_exit_velocity,
            b0_exit_acceleration,
            b0_exit_jerk,
        );
        assert_eq!(s1, Progress::Again);
        let (b1_exit_velocity, b1_exit_acceleration, b1_exit_jerk) = (
            blocks[1].exit_velocity,
            blocks[1].exit_acceleration,
            blocks[1].exit_jerk,
        );
        let s2 = calculate_block(
            ring.buf(b2),
            &mut group,
            &mut blocks[2],
            b1_exit_velocity,
            b1_exit_acceleration,
            b1_exit_jerk,
        );
        assert_eq!(s2, Progress::Done);

        // Head in buffer 0, body in buffer 1, tail in buffer 2.
        assert_approx_eq!(f64, blocks[0].head_length, 2.0, epsilon = 1e-6);
        assert_approx_eq!(f64, blocks[0].exit_velocity, 50.0, epsilon = 1e-6);
        assert_approx_eq!(f64, blocks[1].body_length, 10.0, epsilon = 1e-4);
        assert_approx_eq!(f64, blocks[1].exit_velocity, 50.0, epsilon = 1e-6);
        assert_approx_eq!(f64, blocks[2].tail_length, 2.0, epsilon = 1e-4);
        assert_approx_eq!(f64, blocks[2].exit_velocity, 0.0, epsilon = 1e-6);
        // The tail-only block's cruise state is its entry state.
        assert_approx_eq!(f64, blocks[2].cruise_velocity, 50.0, epsilon = 1e-6);

        let total: f64 = blocks
            .iter()
            .map(|b| b.head_length + b.body_length + b.tail_length)
            .sum();
        assert_approx_eq!(f64, total, 14.0, epsilon = 1e-9);
    }

    #[test]
    fn head_split_across_two_buffers_is_continuous() {
        // A 4 mm acceleration ramp split across two 2 mm buffers.
        let jerk = 7812.5; // target_length(0, 50) == 4.0
        let mut ring = MoveRing::new();
        let b0 = ring
            .commit_line(&line(2.0, jerk, 50.0, 50.0), GroupJoin::Start)
            .unwrap();
        let b1 = ring
            .commit_line(&line(2.0, jerk, 50.0, 50.0), GroupJoin::Extend)
            .unwrap();

        let mut group = Group::default();
        calculate_ramps(ring.buf(b0), &mut group, 0.0);
        assert_approx_eq!(f64, group.head_length, 4.0, epsilon = 1e-6);
        group.state = GroupState::Head;

        let mut first = Block::default();
        let mut second = Block::default();
        let s0 = calculate_block(ring.buf(b0), &mut group, &mut first, 0.0, 0.0, 0.0);
        assert_eq!(s0, Progress::Again);
        // Mid-ramp boundary: below cruise, accelerating.
        assert!(first.cruise_velocity > 0.0 && first.cruise_velocity < 50.0);
        assert!(first.cruise_acceleration > 0.0);
        assert_approx_eq!(f64, first.head_length, 2.0, epsilon = 1e-9);

        let s1 = calculate_block(
            ring.buf(b1),
            &mut group,
            &mut second,
            first.exit_velocity,
            first.exit_acceleration,
            first.exit_jerk,
        );
        assert_eq!(s1, Progress::Done);
        assert_approx_eq!(f64, second.head_length, 2.0, epsilon = 1e-4);
        assert_approx_eq!(f64, second.cruise_velocity, 50.0, epsilon = 1e-6);
        assert_eq!(second.cruise_jerk, 0.0);
        // Slice times add up to the whole ramp time.
        assert_approx_eq!(
            f64,
            first.head_time + second.head_time,
            group.head_time,
            epsilon = 1e-9
        );
    }
}
