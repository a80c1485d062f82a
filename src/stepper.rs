//! The seam between the motion core and the machine.
//!
//! The executor talks to the rest of the firmware through one trait: the
//! stepper preparer consuming fixed-duration segments, the encoders it
//! reads back, and the fire-and-forget request lines (plan pass, status
//! report). Implementations live with the board support code; tests use
//! recording fakes.

use crate::MOTORS;

/// Kind of status report being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReportRequest {
    /// Routine progress report; the reporter may rate-limit these.
    Timed,
    /// Exceptional condition; report as soon as possible.
    Immediate,
}

/// Services the executor consumes each segment.
///
/// All methods are called from the high-priority execution context and
/// must not block or allocate.
pub trait StepperHal {
    /// Queue one motion segment: per-motor step deltas to travel over
    /// `segment_time` seconds, with the current following error for
    /// closed-loop correction. An error fails the running move.
    fn prep_line(
        &mut self,
        travel_steps: &[f64; MOTORS],
        following_error: &[f64; MOTORS],
        segment_time: f64,
    ) -> Result<(), &'static str>;

    /// Signal that no motion is queued this tick.
    fn prep_null(&mut self);

    /// Current encoder count for one motor, time-aligned to the step
    /// output stream.
    fn read_encoder(&mut self, motor: usize) -> i32;

    /// Ask the lower-priority context to run a planning pass.
    fn request_plan(&mut self);

    /// Ask for a status report. Fire-and-forget.
    fn request_report(&mut self, kind: ReportRequest);
}
