// src/main.rs

// Declare modules
pub mod config;
pub mod kms;
pub mod os;
pub mod pattern;
pub mod session;

use crate::{
    config::CONFIG,
    kms::Card,
    os::input::InputSource,
    session::scheduler::{SessionManager, SessionOutcome},
};

use anyhow::{bail, Context};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

/// Main entry point for `kmsdot`.
///
/// Exit code 0 on a clean run or user-initiated quit; non-zero when the
/// device cannot be opened, lacks dumb-buffer support, or no output could
/// be bound. Per-output and per-frame failures never abort the process.
fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    // One optional positional argument: the DRM device path.
    let card_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| CONFIG.device.path.clone());
    info!("using card '{}'", card_path.display());

    let card = Card::open(&card_path)?;

    let mut manager = SessionManager::new(card);
    let bound = manager
        .bind_outputs()
        .context("Failed to discover display outputs")?;
    if bound == 0 {
        bail!(
            "no usable display outputs on '{}'; nothing to drive",
            card_path.display()
        );
    }
    info!("driving {} output(s)", bound);

    // Raw mode starts only once the outputs are bound, and is restored by
    // the guard on every exit path below.
    let mut input = InputSource::new().context("Failed to initialize input source")?;

    manager.initial_commit();

    let duration = Duration::from_secs(CONFIG.session.duration_secs);
    let outcome = manager.run(&mut input, duration);

    // Restore the terminal before teardown chatter, then drain and restore
    // the displays regardless of how the loop ended.
    drop(input);
    manager.shutdown();

    match outcome? {
        SessionOutcome::UserQuit => info!("exiting on user request"),
        SessionOutcome::DeadlineElapsed => info!("exiting after session deadline"),
    }
    Ok(())
}
