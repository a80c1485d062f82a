//! The shared ring of move buffers.
//!
//! A fixed arena of [`Buffer`] slots linked into a circular doubly-linked
//! list by stable indices. The producer fills `EMPTY` slots, the planner
//! advances them to `PLANNED`, the executor runs and frees them. All three
//! parties share the ring without locks: each writes only the states it
//! owns, and indices stay valid for the life of the arena.

use bitflags::bitflags;

use crate::utils::{fp_zero, sqrt};
use crate::AXES;

/// Number of buffer slots in the ring.
pub const POOL_SIZE: usize = 28;

/// Stable index of a buffer slot in the ring arena.
pub type BufIdx = u8;

bitflags! {
    /// Axes with a non-zero component in a move's unit vector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AxisFlags: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const A = 1 << 3;
        const B = 1 << 4;
        const C = 1 << 5;
    }
}

impl AxisFlags {
    /// Flags derived from a unit vector: one bit per non-zero axis.
    pub fn from_unit(unit: &[f64; AXES]) -> Self {
        let mut flags = AxisFlags::empty();
        for (axis, &u) in unit.iter().enumerate() {
            if !fp_zero(u) {
                flags |= AxisFlags::from_bits_truncate(1u8 << axis);
            }
        }
        flags
    }
}

/// Hand-off lifecycle of one buffer slot.
///
/// Transitions are monotonic (`Empty → Prepped → Planned → Running → Empty`)
/// with a single exception: a re-plan may demote `Planned` back to `Prepped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferState {
    Empty,
    Prepped,
    Planned,
    Running,
}

/// Gcode model snapshot carried along with a move for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GcodeState {
    pub line: u32,
    pub feed_rate: f64,
}

/// One prepared linear move.
///
/// The producer fills the immutable inputs (direction, length, jerk,
/// velocity limits); the back-planner revises the velocity fields while
/// `plannable` holds; the planner and executor own the state transitions.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    // Ring linkage. `nx`/`pv` are fixed at arena construction; the group
    // links are re-wired as groups form and shift.
    pub nx: BufIdx,
    pub pv: BufIdx,
    /// First buffer of the *next* group (equals `nx` on the last buffer of
    /// an open group, which is how "last of group" is detected).
    pub nx_group: BufIdx,
    /// First buffer of this buffer's own group.
    pub pv_group: BufIdx,

    pub state: BufferState,

    // Move geometry.
    pub length: f64,
    pub unit: [f64; AXES],
    pub target: [f64; AXES],
    pub axis_flags: AxisFlags,

    // Jerk bound and cached derivations.
    pub jerk: f64,
    pub recip_jerk: f64,
    pub sqrt_jerk: f64,

    // Velocity limits from the back-planner, and the planned velocities.
    pub cruise_vmax: f64,
    pub exit_vmax: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    /// Total length of the containing group, maintained on the group's
    /// first block (and pushed forward when the first block shifts).
    pub group_length: f64,

    /// While true the back-planner may still revise this buffer's
    /// velocities. The executor clears it once the plan is locked in.
    pub plannable: bool,

    pub gm: GcodeState,
}

impl Buffer {
    fn new(idx: usize) -> Self {
        let nx = ((idx + 1) % POOL_SIZE) as BufIdx;
        let pv = ((idx + POOL_SIZE - 1) % POOL_SIZE) as BufIdx;
        Buffer {
            nx,
            pv,
            nx_group: nx,
            pv_group: idx as BufIdx,
            state: BufferState::Empty,
            length: 0.0,
            unit: [0.0; AXES],
            target: [0.0; AXES],
            axis_flags: AxisFlags::empty(),
            jerk: 0.0,
            recip_jerk: 0.0,
            sqrt_jerk: 0.0,
            cruise_vmax: 0.0,
            exit_vmax: 0.0,
            cruise_velocity: 0.0,
            exit_velocity: 0.0,
            group_length: 0.0,
            plannable: false,
            gm: GcodeState::default(),
        }
    }

    /// Set the jerk bound and refresh its cached derivations.
    pub fn set_jerk(&mut self, jerk: f64) {
        self.jerk = jerk;
        self.recip_jerk = if fp_zero(jerk) { 0.0 } else { 1.0 / jerk };
        self.sqrt_jerk = sqrt(jerk);
    }

    /// Reset everything but the fixed ring linkage.
    fn clear(&mut self) {
        let (nx, pv) = (self.nx, self.pv);
        *self = Buffer::new(0);
        self.nx = nx;
        self.pv = pv;
        self.nx_group = nx;
    }
}

/// Producer inputs for one prepared line.
#[derive(Debug, Clone, Copy)]
pub struct LineSpec {
    pub target: [f64; AXES],
    pub unit: [f64; AXES],
    pub length: f64,
    pub jerk: f64,
    pub cruise_vmax: f64,
    pub exit_vmax: f64,
    /// The back-planner's current best exit velocity for the group end.
    pub exit_velocity: f64,
    pub gm: GcodeState,
}

/// How a committed line relates to the group structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupJoin {
    /// The line starts a new group.
    Start,
    /// The line extends the most recently committed group.
    Extend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingError {
    /// All slots are occupied.
    Full,
    /// `GroupJoin::Extend` with no committed group to extend.
    NoOpenGroup,
}

/// The circular arena of move buffers.
pub struct MoveRing {
    bufs: [Buffer; POOL_SIZE],
    /// Run cursor: the buffer currently executing (or next to execute).
    run: BufIdx,
    /// Write cursor: the next slot the producer may claim.
    write: BufIdx,
}

impl Default for MoveRing {
    fn default() -> Self {
        Self::new()
    }
}

impl MoveRing {
    pub fn new() -> Self {
        MoveRing {
            bufs: core::array::from_fn(Buffer::new),
            run: 0,
            write: 0,
        }
    }

    #[inline]
    pub fn buf(&self, idx: BufIdx) -> &Buffer {
        &self.bufs[idx as usize]
    }

    #[inline]
    pub fn buf_mut(&mut self, idx: BufIdx) -> &mut Buffer {
        &mut self.bufs[idx as usize]
    }

    /// Next buffer in ring order.
    #[inline]
    pub fn advance(&self, idx: BufIdx) -> BufIdx {
        self.bufs[idx as usize].nx
    }

    /// Previous buffer in ring order.
    #[inline]
    pub fn retreat(&self, idx: BufIdx) -> BufIdx {
        self.bufs[idx as usize].pv
    }

    /// The current run buffer, or `None` when the ring is drained.
    pub fn get_run_buffer(&self) -> Option<BufIdx> {
        if self.bufs[self.run as usize].state == BufferState::Empty {
            None
        } else {
            Some(self.run)
        }
    }

    /// Free the current run buffer and advance the run cursor.
    ///
    /// Returns true when the ring is empty afterwards.
    pub fn free_run_buffer(&mut self) -> bool {
        let run = self.run as usize;
        self.bufs[run].clear();
        self.run = self.bufs[run].nx;
        self.bufs[self.run as usize].state == BufferState::Empty
    }

    /// Commit one prepared line into the next free slot.
    ///
    /// Wires the group linkage: a `Start` closes the previous group (its
    /// members' `nx_group` now point at the new group head), an `Extend`
    /// adds the line to the open group and rolls its `group_length` and
    /// exit constraints forward onto the group's first buffer.
    pub fn commit_line(&mut self, spec: &LineSpec, join: GroupJoin) -> Result<BufIdx, RingError> {
        let w = self.write;
        if self.bufs[w as usize].state != BufferState::Empty {
            return Err(RingError::Full);
        }
        let prev = self.bufs[w as usize].pv;
        let prev_live = self.bufs[prev as usize].state != BufferState::Empty;
        if join == GroupJoin::Extend && !prev_live {
            return Err(RingError::NoOpenGroup);
        }

        {
            let buf = &mut self.bufs[w as usize];
            buf.state = BufferState::Prepped;
            buf.target = spec.target;
            buf.unit = spec.unit;
            buf.axis_flags = AxisFlags::from_unit(&spec.unit);
            buf.length = spec.length;
            buf.set_jerk(spec.jerk);
            buf.cruise_vmax = spec.cruise_vmax;
            buf.exit_vmax = spec.exit_vmax;
            buf.cruise_velocity = spec.cruise_vmax;
            buf.exit_velocity = spec.exit_velocity;
            buf.group_length = spec.length;
            buf.plannable = true;
            buf.gm = spec.gm;
        }

        let w_nx = self.bufs[w as usize].nx;
        match join {
            GroupJoin::Start => {
                self.bufs[w as usize].pv_group = w;
                self.bufs[w as usize].nx_group = w_nx;
                if prev_live {
                    // Close the previous group: its members now know their
                    // successor group's head.
                    let head = self.bufs[prev as usize].pv_group;
                    let mut i = head;
                    loop {
                        self.bufs[i as usize].nx_group = w;
                        if i == prev {
                            break;
                        }
                        i = self.bufs[i as usize].nx;
                    }
                }
            }
            GroupJoin::Extend => {
                let head = self.bufs[prev as usize].pv_group;
                self.bufs[w as usize].pv_group = head;
                let mut i = head;
                loop {
                    self.bufs[i as usize].nx_group = w_nx;
                    if i == prev {
                        break;
                    }
                    i = self.bufs[i as usize].nx;
                }
                self.bufs[w as usize].nx_group = w_nx;
                self.bufs[head as usize].group_length += spec.length;
                self.bufs[head as usize].exit_velocity = spec.exit_velocity;
                self.bufs[head as usize].exit_vmax = spec.exit_vmax;
            }
        }

        self.write = w_nx;
        Ok(w)
    }

    /// Whether `idx` belongs to the group whose first buffer is `first`.
    ///
    /// Walks the group forward from `first`, stopping at the open end
    /// (`nx_group == nx` marks the last member).
    pub(crate) fn group_contains(&self, first: BufIdx, idx: BufIdx) -> bool {
        let mut i = first;
        loop {
            if i == idx {
                return true;
            }
            let b = &self.bufs[i as usize];
            if b.nx_group == b.nx || b.state == BufferState::Empty {
                return false;
            }
            i = b.nx;
        }
    }
}
