//! Attendance session state machine.
//!
//! ```text
//! Idle ──name──▶ AwaitingInput ──start──▶ Running ──confirm──▶ Finalized(outcome)
//!                      │                     │
//!                      └──source error──▶ Stopped(reason) ◀──stop / source or detector error
//! ```
//!
//! Session state is an explicit [`SessionState`] value: every transition
//! takes it by value and hands back the next state.

use crate::clock::{Clock, SystemClock};
use crate::debounce::PresenceDebouncer;
use crate::store::AttendanceStore;
use crate::types::{AppendOutcome, AttendanceRecord};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("please enter your name")]
    EmptyName,
    #[error("cannot {action} a session that is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: &'static str,
    },
}

/// Why a session ended without reaching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop signal.
    Cancelled,
    /// The frame source could not be opened.
    SourceUnavailable(String),
    /// The frame source failed or ran dry mid-session.
    SourceFailed(String),
    /// The face detector failed on a frame.
    DetectorFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingInput,
    Running,
    Finalized(AppendOutcome),
    Stopped(StopReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finalized(_) | Phase::Stopped(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AwaitingInput => "awaiting input",
            Phase::Running => "running",
            Phase::Finalized(_) => "finalized",
            Phase::Stopped(_) => "stopped",
        }
    }
}

/// A validated, trimmed, non-empty subject name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectName(String);

impl SubjectName {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SessionError::EmptyName);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Transient per-session state.
#[derive(Debug, Clone)]
pub struct SessionState {
    subject: Option<SubjectName>,
    debouncer: PresenceDebouncer,
    phase: Phase,
    frames: u64,
    last_face_count: usize,
    record: Option<AttendanceRecord>,
}

impl SessionState {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_ref().map(SubjectName::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn consecutive_detections(&self) -> u32 {
        self.debouncer.consecutive()
    }

    pub fn is_confirmed(&self) -> bool {
        self.debouncer.is_confirmed()
    }

    /// Frames processed while running.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_face_count(&self) -> usize {
        self.last_face_count
    }

    /// The record submitted to the store, once presence was confirmed.
    pub fn record(&self) -> Option<&AttendanceRecord> {
        self.record.as_ref()
    }
}

/// Drives sessions against one attendance store.
pub struct SessionController<C = SystemClock> {
    store: AttendanceStore,
    clock: C,
    confirm_frames: u32,
}

impl SessionController<SystemClock> {
    pub fn new(store: AttendanceStore, confirm_frames: u32) -> Self {
        Self::with_clock(store, confirm_frames, SystemClock)
    }
}

impl<C: Clock> SessionController<C> {
    pub fn with_clock(store: AttendanceStore, confirm_frames: u32, clock: C) -> Self {
        Self {
            store,
            clock,
            confirm_frames,
        }
    }

    pub fn store(&self) -> &AttendanceStore {
        &self.store
    }

    /// Fresh idle session.
    pub fn begin(&self) -> SessionState {
        SessionState {
            subject: None,
            debouncer: PresenceDebouncer::new(self.confirm_frames),
            phase: Phase::Idle,
            frames: 0,
            last_face_count: 0,
            record: None,
        }
    }

    /// `Idle → AwaitingInput`. Re-entering a name while awaiting start
    /// replaces it.
    pub fn submit_name(
        &self,
        mut state: SessionState,
        name: SubjectName,
    ) -> Result<SessionState, SessionError> {
        if !matches!(state.phase, Phase::Idle | Phase::AwaitingInput) {
            return Err(SessionError::InvalidTransition {
                action: "name",
                phase: state.phase.name(),
            });
        }
        state.subject = Some(name);
        state.phase = Phase::AwaitingInput;
        Ok(state)
    }

    /// `AwaitingInput → Running`. Call once the frame source is open.
    pub fn start(&self, mut state: SessionState) -> Result<SessionState, SessionError> {
        if state.phase != Phase::AwaitingInput {
            return Err(SessionError::InvalidTransition {
                action: "start",
                phase: state.phase.name(),
            });
        }
        state.debouncer = PresenceDebouncer::new(self.confirm_frames);
        state.frames = 0;
        state.last_face_count = 0;
        state.phase = Phase::Running;
        tracing::info!(
            subject = state.subject().unwrap_or_default(),
            confirm_frames = state.debouncer.threshold(),
            "session started"
        );
        Ok(state)
    }

    /// Feed one frame's face count. Frames outside `Running` are ignored.
    ///
    /// On confirmation the record is submitted to the store and the session
    /// is finalized with whatever the store answered.
    pub fn on_frame(&self, mut state: SessionState, face_count: usize) -> SessionState {
        if state.phase != Phase::Running {
            return state;
        }
        state.frames += 1;
        state.last_face_count = face_count;

        if !state.debouncer.observe(face_count > 0) {
            return state;
        }

        let Some(subject) = state.subject.as_ref() else {
            // Running always carries a subject; treat a missing one as a failed append
            state.phase = Phase::Finalized(AppendOutcome::Failed("no subject name".into()));
            return state;
        };
        let record = AttendanceRecord::new(subject.as_str(), self.clock.now());
        let outcome = self.store.try_append_if_absent(&record);
        tracing::info!(
            subject = %record.name,
            frames = state.frames,
            outcome = ?outcome,
            "presence confirmed"
        );
        state.record = Some(record);
        state.phase = Phase::Finalized(outcome);
        state
    }

    /// End a non-terminal session with `reason`. Terminal sessions are
    /// returned unchanged.
    pub fn abort(&self, mut state: SessionState, reason: StopReason) -> SessionState {
        if state.phase.is_terminal() {
            return state;
        }
        tracing::info!(phase = state.phase.name(), reason = ?reason, "session stopped");
        state.phase = Phase::Stopped(reason);
        state
    }

    /// Explicit external stop.
    pub fn stop(&self, state: SessionState) -> SessionState {
        self.abort(state, StopReason::Cancelled)
    }
}
