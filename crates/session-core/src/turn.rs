//! Turn-taking (barge-in) decisions
//!
//! The controller is a set of pure transitions over [`SessionState`]; the
//! session applies the resulting [`FlushPlan`] to its queues and peers.
//! Keeping the decisions free of I/O lets them run under the state lock.
//!
//! Cycle: caller speech starts while agent audio is outbound, so the session
//! moves to `Interrupted`, bumps the generation (invalidating queued agent
//! audio) and asks the engine to cancel and clear. The engine's
//! `output_audio_buffer.cleared` acknowledgement returns the session to
//! `Active`. Speech stopping has no effect on a cycle in progress.

use tracing::{debug, warn};

use crate::session::state::SessionState;
use crate::types::CallState;

/// Instructions for one interruption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPlan {
    /// Send `response.cancel` before clearing
    pub cancel_response: bool,
    /// Generation now current; anything older is stale
    pub generation: u64,
}

/// Caller speech started
///
/// Returns a plan when the session must flush agent audio.
pub fn on_speech_started(state: &mut SessionState) -> Option<FlushPlan> {
    if state.state != CallState::Active {
        debug!(call_id = %state.call_id, state = %state.state, "speech start ignored outside ACTIVE");
        return None;
    }
    if !state.outbound_audio {
        return None;
    }
    state.transition(CallState::Interrupted)?;
    state.outbound_audio = false;
    state.pending_mark = None;
    state.generation += 1;
    state.interruptions += 1;
    let plan = FlushPlan {
        cancel_response: state.response_active,
        generation: state.generation,
    };
    state.response_active = false;
    debug!(call_id = %state.call_id, generation = plan.generation, "barge-in, flushing agent audio");
    Some(plan)
}

/// Caller speech stopped
///
/// An interruption in progress still waits for its acknowledgement.
pub fn on_speech_stopped(state: &SessionState) {
    if state.state == CallState::Interrupted {
        debug!(call_id = %state.call_id, "speech stopped while flush pending");
    }
}

/// The engine confirmed its output buffer is clear
pub fn on_flush_ack(state: &mut SessionState) -> bool {
    if state.state != CallState::Interrupted {
        return false;
    }
    state.outbound_audio = false;
    state.transition(CallState::Active).is_some()
}

/// Resume after the acknowledgement failed to arrive in time
///
/// No-op if the interruption for `generation` already completed or a newer
/// one started.
pub fn force_resume(state: &mut SessionState, generation: u64) -> bool {
    if state.state != CallState::Interrupted || state.generation != generation {
        return false;
    }
    warn!(call_id = %state.call_id, generation, "no flush acknowledgement from engine, resuming");
    on_flush_ack(state)
}

/// Whether agent audio from `generation` may still be queued or played
pub fn is_current(state: &SessionState, generation: u64) -> bool {
    state.state == CallState::Active && state.generation == generation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallId, CallerMetadata};

    fn active() -> SessionState {
        let mut s = SessionState::new(CallId::new("CA1"), CallerMetadata::default());
        s.transition(CallState::Negotiating);
        s.transition(CallState::Active);
        s
    }

    #[test]
    fn test_barge_in_cycle() {
        let mut s = active();
        s.outbound_audio = true;
        s.response_active = true;

        let plan = on_speech_started(&mut s).unwrap();
        assert_eq!(plan, FlushPlan { cancel_response: true, generation: 1 });
        assert_eq!(s.state, CallState::Interrupted);
        assert!(!s.outbound_audio);
        assert_eq!(s.interruptions, 1);

        assert!(on_flush_ack(&mut s));
        assert_eq!(s.state, CallState::Active);
        assert!(!s.outbound_audio);
    }

    #[test]
    fn test_no_flush_without_outbound_audio() {
        let mut s = active();
        assert_eq!(on_speech_started(&mut s), None);
        assert_eq!(s.state, CallState::Active);
        assert_eq!(s.generation, 0);
    }

    #[test]
    fn test_spurious_start_stop_completes_cycle() {
        let mut s = active();
        s.outbound_audio = true;
        let plan = on_speech_started(&mut s).unwrap();
        assert!(!plan.cancel_response);
        on_speech_stopped(&s);
        assert_eq!(s.state, CallState::Interrupted);
        // a second start during the flush does not restart it
        assert_eq!(on_speech_started(&mut s), None);
        assert_eq!(s.generation, 1);
        assert!(on_flush_ack(&mut s));
        assert_eq!(s.state, CallState::Active);
    }

    #[test]
    fn test_force_resume_checks_generation() {
        let mut s = active();
        s.outbound_audio = true;
        let plan = on_speech_started(&mut s).unwrap();
        assert!(!force_resume(&mut s, plan.generation + 1));
        assert!(force_resume(&mut s, plan.generation));
        assert_eq!(s.state, CallState::Active);
        assert!(!force_resume(&mut s, plan.generation));
    }

    #[test]
    fn test_stale_generation() {
        let mut s = active();
        assert!(is_current(&s, 0));
        s.outbound_audio = true;
        on_speech_started(&mut s);
        assert!(!is_current(&s, 0));
        on_flush_ack(&mut s);
        assert!(!is_current(&s, 0));
        assert!(is_current(&s, 1));
    }

    #[test]
    fn test_ack_outside_interruption_is_ignored() {
        let mut s = active();
        assert!(!on_flush_ack(&mut s));
        assert_eq!(s.state, CallState::Active);
    }
}
