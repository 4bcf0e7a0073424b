// src/kms/framebuffer.rs

//! Dumb-buffer framebuffers: CPU-writable, scanout-capable pixel memory.
//!
//! Allocation is a three-step acquisition (dumb buffer, scanout
//! registration, persistent mapping); a failure at any step releases
//! everything acquired before it, in reverse order. Release is explicit
//! (`release`) because it needs the device; each buffer must be released
//! exactly once, which the owning session guarantees.

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{framebuffer, Device as ControlDevice};
use log::{trace, warn};
use std::fmt;
use std::io;
use std::slice;

use super::Card;

/// Pixel format: 32 bits per pixel, 24 bits of color, packed 0x00RRGGBB.
const BITS_PER_PIXEL: u32 = 32;
const COLOR_DEPTH: u32 = 24;

const DRM_IOCTL_BASE: u8 = b'd';

/// Request layout for DRM_IOCTL_MODE_MAP_DUMB (drm_mode_map_dumb in
/// drm_mode.h); must stay bit-exact.
#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeMapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

nix::ioctl_readwrite!(drm_mode_map_dumb, DRM_IOCTL_BASE, 0xb3, DrmModeMapDumb);

/// Typed allocation failures, one per acquisition step.
#[derive(Debug)]
pub enum FramebufferError {
    /// The dumb-buffer allocation itself failed.
    AllocationFailed(io::Error),
    /// The buffer could not be registered as a scanout framebuffer.
    RegistrationFailed(io::Error),
    /// The buffer could not be mapped into process memory.
    MappingFailed(io::Error),
}

impl fmt::Display for FramebufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramebufferError::AllocationFailed(e) => {
                write!(f, "cannot create dumb buffer: {}", e)
            }
            FramebufferError::RegistrationFailed(e) => {
                write!(f, "cannot register framebuffer: {}", e)
            }
            FramebufferError::MappingFailed(e) => write!(f, "cannot map dumb buffer: {}", e),
        }
    }
}

impl std::error::Error for FramebufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FramebufferError::AllocationFailed(e)
            | FramebufferError::RegistrationFailed(e)
            | FramebufferError::MappingFailed(e) => Some(e),
        }
    }
}

/// A mapped, scanout-registered dumb buffer.
///
/// The mapping stays valid from allocation until `release`; the pixel
/// slice may be handed out freely in between. Never shared between
/// outputs.
pub struct DumbFramebuffer {
    width: u32,
    height: u32,
    pitch: u32,
    len: usize,
    // Taken on release; drm's destroy call consumes the buffer.
    buffer: Option<DumbBuffer>,
    fb: framebuffer::Handle,
    map: *mut u8,
}

impl DumbFramebuffer {
    /// Allocates, registers and maps a `width` x `height` buffer at 32 bpp,
    /// zero-filled. The driver chooses the row pitch; callers must address
    /// pixels through [`DumbFramebuffer::pitch`], never assume
    /// `width * 4`.
    pub fn allocate(card: &Card, width: u32, height: u32) -> Result<Self, FramebufferError> {
        let buffer = card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, BITS_PER_PIXEL)
            .map_err(FramebufferError::AllocationFailed)?;
        let pitch = buffer.pitch();
        let len = pitch as usize * height as usize;

        let fb = match card.add_framebuffer(&buffer, COLOR_DEPTH, BITS_PER_PIXEL) {
            Ok(fb) => fb,
            Err(e) => {
                destroy_buffer(card, buffer);
                return Err(FramebufferError::RegistrationFailed(e));
            }
        };

        let mut request = DrmModeMapDumb {
            handle: buffer.handle().into(),
            ..Default::default()
        };
        if let Err(errno) = unsafe { drm_mode_map_dumb(card.raw_fd(), &mut request) } {
            let err = io::Error::from_raw_os_error(errno as i32);
            remove_framebuffer(card, fb);
            destroy_buffer(card, buffer);
            return Err(FramebufferError::MappingFailed(err));
        }

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                card.raw_fd(),
                request.offset as libc::off_t,
            )
        };
        if map == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            remove_framebuffer(card, fb);
            destroy_buffer(card, buffer);
            return Err(FramebufferError::MappingFailed(err));
        }
        let map = map as *mut u8;
        unsafe { std::ptr::write_bytes(map, 0, len) };

        trace!(
            "allocated {}x{} framebuffer, pitch {}, {} bytes",
            width,
            height,
            pitch,
            len
        );

        Ok(DumbFramebuffer {
            width,
            height,
            pitch,
            len,
            buffer: Some(buffer),
            fb,
            map,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, as chosen by the driver (>= width * 4).
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// The scanout identifier used in `set_crtc` and `page_flip`.
    pub fn scanout_handle(&self) -> framebuffer::Handle {
        self.fb
    }

    /// The mapped pixel region.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.buffer.is_some(), "framebuffer accessed after release");
        unsafe { slice::from_raw_parts_mut(self.map, self.len) }
    }

    /// Unmaps, deregisters and frees the buffer. Failures are reported but
    /// not propagated; there is no recovery at teardown.
    pub fn release(&mut self, card: &Card) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        if unsafe { libc::munmap(self.map as *mut libc::c_void, self.len) } == -1 {
            warn!(
                "cannot unmap dumb buffer: {}",
                io::Error::last_os_error()
            );
        }
        remove_framebuffer(card, self.fb);
        destroy_buffer(card, buffer);
    }
}

impl fmt::Debug for DumbFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbFramebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("fb", &self.fb)
            .field("released", &self.buffer.is_none())
            .finish()
    }
}

fn remove_framebuffer(card: &Card, fb: framebuffer::Handle) {
    if let Err(e) = card.destroy_framebuffer(fb) {
        warn!("cannot remove framebuffer {:?}: {}", fb, e);
    }
}

fn destroy_buffer(card: &Card, buffer: DumbBuffer) {
    if let Err(e) = card.destroy_dumb_buffer(buffer) {
        warn!("cannot destroy dumb buffer: {}", e);
    }
}
