// src/os/mod.rs

//! Thin OS-facing wrappers: the epoll readiness multiplexer and the
//! raw-mode keyboard input source.

pub mod epoll;
pub mod input;
