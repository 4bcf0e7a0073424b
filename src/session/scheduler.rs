// src/session/scheduler.rs

//! The flip scheduler: session setup, the multiplexed event loop, and the
//! shutdown sequencer.
//!
//! Everything runs on one thread. The only suspension point is the epoll
//! wait over the display fd and stdin; page-flip completions are
//! dispatched from there and may synchronously render and submit the next
//! flip before control returns to the wait. That re-entrancy is bounded:
//! a session never has more than one commit outstanding, so a completion
//! can trigger at most one resubmission.

use anyhow::{Context, Result};
use drm::control::{Device as ControlDevice, Event, PageFlipFlags};
use log::{debug, error, info, trace, warn};
use std::time::{Duration, Instant};

use crate::config::CONFIG;
use crate::kms::framebuffer::DumbFramebuffer;
use crate::kms::Card;
use crate::os::epoll::{EventMonitor, ReadySource};
use crate::os::input::{InputCommand, InputSource};
use crate::pattern::{self, PatternState};
use crate::session::binder::{plan_outputs, BindError, OutputPlan};
use crate::session::{DisplaySession, FlipCycle, FlipState, SessionRegistry};

/// Why the render loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The user pressed a quit key (or stdin closed).
    UserQuit,
    /// The wall-clock session deadline elapsed.
    DeadlineElapsed,
}

/// Owns the device and every active session. There is no other session
/// collection in the process.
pub struct SessionManager {
    card: Card,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(card: Card) -> Self {
        SessionManager {
            card,
            registry: SessionRegistry::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Discovers usable outputs and creates a session for each. Every
    /// per-connector failure is reported and skipped; only a failure to
    /// enumerate resources at all is propagated. Returns the number of
    /// active sessions.
    pub fn bind_outputs(&mut self) -> Result<usize> {
        let topology = self.card.snapshot_topology()?;
        let claimed = self.registry.claimed_crtcs();

        for (connector_id, plan) in plan_outputs(&topology, &claimed) {
            let name = topology
                .connectors
                .iter()
                .find(|c| c.id == connector_id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| connector_id.to_string());
            match plan {
                Err(BindError::Disconnected) => {
                    info!("ignoring unused connector {}", name);
                }
                Err(e) => {
                    warn!("cannot bind connector {}: {}", name, e);
                }
                Ok(plan) => match self.create_session(&name, &plan) {
                    Ok(session) => {
                        info!(
                            "bound connector {} to CRTC {} at {}x{}",
                            name, plan.crtc, plan.mode.width, plan.mode.height
                        );
                        self.registry.push(session);
                    }
                    Err(e) => {
                        warn!("cannot set up connector {}: {:#}", name, e);
                    }
                },
            }
        }

        for session in self.registry.iter() {
            debug!(
                "active session: {} (connector {}, CRTC {})",
                session.connector_name,
                session.connector_id,
                session.crtc_id()
            );
        }

        Ok(self.registry.len())
    }

    fn create_session(&self, name: &str, plan: &OutputPlan) -> Result<DisplaySession> {
        let resources = self
            .card
            .resource_handles()
            .context("cannot retrieve DRM resources")?;
        let connector = resources
            .connectors()
            .iter()
            .copied()
            .find(|&h| u32::from(h) == plan.connector)
            .context("connector disappeared during setup")?;
        let crtc = resources
            .crtcs()
            .iter()
            .copied()
            .find(|&h| u32::from(h) == plan.crtc)
            .context("CRTC disappeared during setup")?;

        let info = self
            .card
            .get_connector(connector, false)
            .context("cannot query connector")?;
        let mode = info
            .modes()
            .first()
            .copied()
            .context("connector lost its modes during setup")?;
        let (width, height) = mode.size();

        // Saved before we touch the CRTC; replayed verbatim at shutdown.
        let saved = self
            .card
            .get_crtc(crtc)
            .context("cannot save current CRTC configuration")?;

        let mut first = DumbFramebuffer::allocate(&self.card, width.into(), height.into())
            .context("cannot create framebuffer")?;
        let second = match DumbFramebuffer::allocate(&self.card, width.into(), height.into()) {
            Ok(buffer) => buffer,
            Err(e) => {
                first.release(&self.card);
                return Err(e).context("cannot create second framebuffer");
            }
        };

        let pattern = PatternState::new(width.into(), height.into(), &CONFIG.pattern);

        Ok(DisplaySession {
            connector_id: plan.connector,
            connector_name: name.to_string(),
            connector,
            crtc,
            mode,
            bufs: [first, second],
            cycle: FlipCycle::new(),
            saved,
            pattern,
        })
    }

    /// Presents a first frame on every session with a synchronous CRTC
    /// set (no flip event involved), then arms the flip cycle. A failure
    /// leaves that output idle and dark; the session still shuts down
    /// normally.
    pub fn initial_commit(&mut self) {
        for index in 0..self.registry.len() {
            let committed = {
                let card = &self.card;
                let Some(session) = self.registry.get_mut(index) else {
                    break;
                };
                let back = session.cycle.back();
                render_frame(session, back);
                let fb = session.bufs[back].scanout_handle();
                match card.set_crtc(
                    session.crtc,
                    Some(fb),
                    (0, 0),
                    &[session.connector],
                    Some(session.mode),
                ) {
                    Ok(()) => {
                        session.cycle.adopt_front(back);
                        true
                    }
                    Err(e) => {
                        warn!(
                            "cannot set CRTC for connector {}: {}",
                            session.connector_name, e
                        );
                        false
                    }
                }
            };
            if committed {
                self.render_and_flip(index);
            }
        }
    }

    /// Runs the multiplexed wait loop until a quit command or the
    /// deadline. Direction commands update every session's generator
    /// state; display readiness dispatches completion events.
    pub fn run(&mut self, input: &mut InputSource, duration: Duration) -> Result<SessionOutcome> {
        let mut monitor = EventMonitor::new()?;
        monitor
            .watch(libc::STDIN_FILENO, ReadySource::Input)
            .context("cannot watch stdin")?;
        monitor
            .watch(self.card.raw_fd(), ReadySource::Display)
            .context("cannot watch DRM fd")?;

        let deadline = Instant::now() + duration;
        info!("running session for up to {}s", duration.as_secs());

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!("session deadline elapsed");
                return Ok(SessionOutcome::DeadlineElapsed);
            }
            for source in monitor.wait(deadline - now)? {
                match source {
                    ReadySource::Input => match input.poll_command()? {
                        Some(InputCommand::Quit) => {
                            info!("exit due to user input");
                            return Ok(SessionOutcome::UserQuit);
                        }
                        Some(InputCommand::Drift(direction)) => {
                            debug!("drift direction set to {:?}", direction);
                            for session in self.registry.iter_mut() {
                                session.pattern.set_drift(direction);
                            }
                        }
                        None => {}
                    },
                    ReadySource::Display => self.dispatch_display_events(),
                }
            }
        }
    }

    /// Reads and dispatches pending completion events. Read failures are
    /// reported and dropped; the loop simply waits for the next readiness.
    fn dispatch_display_events(&mut self) {
        let events = match self.card.receive_events() {
            Ok(events) => events,
            Err(e) => {
                warn!("cannot read display events: {}", e);
                return;
            }
        };
        for event in events {
            if let Event::PageFlip(flip) = event {
                match self.registry.position_by_crtc(flip.crtc) {
                    Some(index) => self.on_flip_complete(index),
                    None => debug!("page-flip completion for unknown CRTC {:?}", flip.crtc),
                }
            }
        }
    }

    /// Completion handler: the session returns to idle and, unless it is
    /// shutting down, immediately renders and submits the next frame. The
    /// cycle is self-pacing: completions arrive at the display's refresh
    /// rate, and re-entrancy stays at depth one.
    fn on_flip_complete(&mut self, index: usize) {
        let Some(session) = self.registry.get_mut(index) else {
            return;
        };
        session.cycle.complete();
        trace!("page flip completed for {}", session.connector_name);
        if !session.cycle.is_shutting_down() {
            self.render_and_flip(index);
        }
    }

    /// Renders into the back buffer and submits it asynchronously. A
    /// rejected submission skips this frame only: the cycle stays idle,
    /// buffers do not advance, and the error is reported.
    fn render_and_flip(&mut self, index: usize) {
        let card = &self.card;
        let Some(session) = self.registry.get_mut(index) else {
            return;
        };
        if !session.cycle.can_submit() {
            return;
        }

        let back = session.cycle.back();
        render_frame(session, back);
        let fb = session.bufs[back].scanout_handle();
        match card.page_flip(session.crtc, fb, PageFlipFlags::EVENT, None) {
            Ok(()) => {
                session.cycle.submit();
                let (width, height) = session.mode.size();
                session.pattern.advance_dots(width.into(), height.into());
                trace!("page flip submitted for {}", session.connector_name);
            }
            Err(e) => {
                warn!(
                    "cannot flip CRTC for connector {}: {}",
                    session.connector_name, e
                );
            }
        }
    }

    /// Drains, restores and releases every session in registry order. Each
    /// session's outstanding flip (if any) is awaited before its CRTC is
    /// restored to the configuration saved at bind time and its buffers
    /// are released in reverse-allocation order. Completions belonging to
    /// other sessions that arrive during a drain are routed to them; they
    /// are never waited on.
    pub fn shutdown(&mut self) {
        let mut sessions = self.registry.take_all();
        for index in 0..sessions.len() {
            sessions[index].cycle.begin_shutdown();
            if sessions[index].cycle.state() == FlipState::CleanupWait {
                debug!(
                    "waiting for pending page-flip on {} to complete...",
                    sessions[index].connector_name
                );
            }
            while sessions[index].cycle.state() == FlipState::CleanupWait {
                let events = match self.card.receive_events() {
                    Ok(events) => events,
                    Err(e) => {
                        error!("cannot drain display events: {}", e);
                        break;
                    }
                };
                for event in events {
                    if let Event::PageFlip(flip) = event {
                        if let Some(pos) = sessions.iter().position(|s| s.crtc == flip.crtc) {
                            sessions[pos].cycle.complete();
                        }
                    }
                }
            }

            let session = &mut sessions[index];
            if session.cycle.ready_for_teardown() {
                if let Err(e) = self.card.set_crtc(
                    session.crtc,
                    session.saved.framebuffer(),
                    session.saved.position(),
                    &[session.connector],
                    session.saved.mode(),
                ) {
                    warn!(
                        "cannot restore CRTC for connector {}: {}",
                        session.connector_name, e
                    );
                }
                let [first, second] = &mut session.bufs;
                second.release(&self.card);
                first.release(&self.card);
                info!("released output {}", session.connector_name);
            } else {
                // A buffer with an outstanding commit must never be
                // released; the kernel reclaims it when the device closes.
                error!(
                    "page-flip on {} never completed; leaving its buffers allocated",
                    session.connector_name
                );
            }
        }
    }
}

/// Renders the next frame of `session`'s pattern into buffer `index`,
/// honoring the buffer's driver-chosen pitch.
fn render_frame(session: &mut DisplaySession, index: usize) {
    let pitch = session.bufs[index].pitch() as usize;
    let width = session.bufs[index].width() as usize;
    let height = session.bufs[index].height() as usize;
    pattern::render(
        session.bufs[index].pixels_mut(),
        pitch,
        width,
        height,
        &mut session.pattern,
    );
}
