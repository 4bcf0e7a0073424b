// src/os/input.rs

//! Raw-mode keyboard input for the session loop.
//!
//! [`InputSource`] switches stdin to non-canonical, non-echoing,
//! non-blocking mode and decodes single bytes into [`InputCommand`]s. The
//! original terminal attributes and fd flags are restored on drop, on
//! every exit path.

use anyhow::{Context, Result};
use libc::STDIN_FILENO;
use log::{debug, info, trace, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::io::{self, Read};
use termios::{tcsetattr, Termios, ECHO, ICANON, TCSANOW, VMIN, VTIME};

use crate::pattern::Direction;

/// A decoded user command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCommand {
    /// End the session and restore the display.
    Quit,
    /// Change the drift direction of the dot field.
    Drift(Direction),
}

/// Decodes one input byte. Unrecognized bytes are ignored.
pub fn decode_command(byte: u8) -> Option<InputCommand> {
    match byte {
        b'q' | 0x1b => Some(InputCommand::Quit),
        b'w' => Some(InputCommand::Drift(Direction::Up)),
        b's' => Some(InputCommand::Drift(Direction::Down)),
        b'a' => Some(InputCommand::Drift(Direction::Left)),
        b'd' => Some(InputCommand::Drift(Direction::Right)),
        _ => None,
    }
}

pub struct InputSource {
    original_termios: Option<Termios>,
    original_fd_flags: Option<OFlag>,
}

impl InputSource {
    /// Puts stdin into raw, non-blocking mode. A terminal is not required:
    /// if stdin has no termios (e.g. redirected), input is simply
    /// unavailable and only the deadline ends the session.
    pub fn new() -> Result<Self> {
        let original_termios = match Termios::from_fd(STDIN_FILENO) {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(
                    "Failed to get termios for stdin: {}. Proceeding without raw mode.",
                    e
                );
                None
            }
        };

        if let Some(ref original) = original_termios {
            let mut raw = *original;
            raw.c_lflag &= !(ECHO | ICANON);
            raw.c_cc[VMIN] = 0;
            raw.c_cc[VTIME] = 0;
            tcsetattr(STDIN_FILENO, TCSANOW, &raw)
                .context("Failed to set raw terminal attributes on stdin")?;
            debug!("InputSource: stdin set to raw mode.");
        }

        let original_fd_flags = match fcntl(io::stdin(), FcntlArg::F_GETFL) {
            Ok(flags) => {
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(io::stdin(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
                    .context("Failed to set O_NONBLOCK on stdin")?;
                Some(flags)
            }
            Err(e) => {
                warn!("Failed to read stdin fd flags: {}. Reads may block.", e);
                None
            }
        };

        Ok(InputSource {
            original_termios,
            original_fd_flags,
        })
    }

    /// Consumes at most one pending input byte and decodes it. Returns
    /// `Ok(None)` when no byte is pending or the byte is not a command.
    pub fn poll_command(&mut self) -> Result<Option<InputCommand>> {
        let mut byte = [0u8; 1];
        match io::stdin().read(&mut byte) {
            Ok(0) => {
                info!("InputSource: EOF on stdin; treating as quit.");
                Ok(Some(InputCommand::Quit))
            }
            Ok(_) => {
                let command = decode_command(byte[0]);
                match command {
                    Some(cmd) => debug!("InputSource: {:?} ({:#04x})", cmd, byte[0]),
                    None => trace!("InputSource: ignoring byte {:#04x}", byte[0]),
                }
                Ok(command)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e).context("Error reading from stdin"),
        }
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        if let Some(flags) = self.original_fd_flags.take() {
            if let Err(e) = fcntl(io::stdin(), FcntlArg::F_SETFL(flags)) {
                warn!("Failed to restore stdin fd flags: {}", e);
            }
        }
        if let Some(ref original) = self.original_termios {
            if let Err(e) = tcsetattr(STDIN_FILENO, TCSANOW, original) {
                warn!("Failed to restore terminal attributes: {}", e);
            } else {
                debug!("InputSource: restored original terminal attributes.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_decode_the_quit_keys() {
        assert_eq!(decode_command(b'q'), Some(InputCommand::Quit));
        assert_eq!(decode_command(0x1b), Some(InputCommand::Quit));
    }

    #[test]
    fn it_should_decode_the_direction_keys() {
        assert_eq!(
            decode_command(b'w'),
            Some(InputCommand::Drift(Direction::Up))
        );
        assert_eq!(
            decode_command(b's'),
            Some(InputCommand::Drift(Direction::Down))
        );
        assert_eq!(
            decode_command(b'a'),
            Some(InputCommand::Drift(Direction::Left))
        );
        assert_eq!(
            decode_command(b'd'),
            Some(InputCommand::Drift(Direction::Right))
        );
    }

    #[test]
    fn it_should_ignore_unrecognized_bytes() {
        assert_eq!(decode_command(b'x'), None);
        assert_eq!(decode_command(b'\n'), None);
        assert_eq!(decode_command(0x00), None);
    }
}
