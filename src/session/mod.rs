// src/session/mod.rs

//! Per-output session state and the session registry.
//!
//! A [`DisplaySession`] exists for every connector that was bound to a
//! CRTC: its two framebuffers, the saved pre-session CRTC configuration,
//! and a [`FlipCycle`] tracking the double-buffer flip protocol. The
//! [`SessionRegistry`] is owned by the session manager and is the only
//! collection of sessions in the process.

pub mod binder;
pub mod scheduler;

use drm::control::{connector, crtc, Mode};

use crate::kms::framebuffer::DumbFramebuffer;
use crate::pattern::PatternState;

/// Flip-protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    /// No commit outstanding; a new frame may be submitted.
    Idle,
    /// An asynchronous commit was issued and its completion is pending.
    FlipRequested,
    /// Shutdown was requested while a commit is outstanding; waiting for
    /// its completion before teardown.
    CleanupWait,
}

/// The double-buffer flip state machine.
///
/// Invariants: at most one commit outstanding (`submit` refuses while one
/// is pending); the front index toggles exactly once per accepted
/// submission; teardown is only legal once no commit is outstanding.
#[derive(Debug, Default)]
pub struct FlipCycle {
    front: usize,
    pending: bool,
    shutting_down: bool,
}

impl FlipCycle {
    pub fn new() -> Self {
        FlipCycle::default()
    }

    /// Index of the buffer currently scanned out.
    pub fn front(&self) -> usize {
        self.front
    }

    /// Index of the buffer to render the next frame into.
    pub fn back(&self) -> usize {
        self.front ^ 1
    }

    pub fn state(&self) -> FlipState {
        match (self.pending, self.shutting_down) {
            (true, true) => FlipState::CleanupWait,
            (true, false) => FlipState::FlipRequested,
            (false, _) => FlipState::Idle,
        }
    }

    /// Whether a new commit may be issued now.
    pub fn can_submit(&self) -> bool {
        !self.pending && !self.shutting_down
    }

    /// Records an accepted commit of the back buffer: the flip is now
    /// outstanding and the back buffer becomes the front. Returns false
    /// (and changes nothing) unless the cycle is idle and not shutting
    /// down; a session never has two commits in flight.
    pub fn submit(&mut self) -> bool {
        if !self.can_submit() {
            return false;
        }
        self.front ^= 1;
        self.pending = true;
        true
    }

    /// Records the completion event for the outstanding commit.
    pub fn complete(&mut self) {
        self.pending = false;
    }

    /// Adopts `index` as the front buffer without the flip protocol; used
    /// only for the initial synchronous commit.
    pub fn adopt_front(&mut self, index: usize) {
        debug_assert!(!self.pending, "initial commit with a flip outstanding");
        self.front = index & 1;
    }

    /// Stops new commits from being armed; an outstanding one must still
    /// complete before teardown.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Whether the session's resources may be torn down now.
    pub fn ready_for_teardown(&self) -> bool {
        !self.pending
    }
}

/// Everything owned by one bound output.
#[derive(Debug)]
pub struct DisplaySession {
    pub connector_id: u32,
    pub connector_name: String,
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    /// Exactly two buffers for the session's lifetime, never resized.
    pub bufs: [DumbFramebuffer; 2],
    pub cycle: FlipCycle,
    /// The CRTC configuration found at bind time, restored at shutdown.
    pub saved: crtc::Info,
    pub pattern: PatternState,
}

impl DisplaySession {
    pub fn crtc_id(&self) -> u32 {
        self.crtc.into()
    }
}

/// All active sessions, owned by the session manager.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<DisplaySession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn push(&mut self, session: DisplaySession) {
        self.sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DisplaySession> {
        self.sessions.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplaySession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DisplaySession> {
        self.sessions.iter_mut()
    }

    /// Index of the session bound to the given CRTC, if any.
    pub fn position_by_crtc(&self, crtc: crtc::Handle) -> Option<usize> {
        self.sessions.iter().position(|s| s.crtc == crtc)
    }

    /// CRTC ids claimed by active sessions.
    pub fn claimed_crtcs(&self) -> Vec<u32> {
        self.sessions.iter().map(|s| s.crtc_id()).collect()
    }

    /// Removes and returns all sessions, in registration order.
    pub fn take_all(&mut self) -> Vec<DisplaySession> {
        std::mem::take(&mut self.sessions)
    }
}
