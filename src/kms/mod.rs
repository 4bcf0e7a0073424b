// src/kms/mod.rs

//! Access to the kernel mode-setting device.
//!
//! [`Card`] wraps the opened DRM device node and implements the `drm`
//! crate's device traits, so connector/encoder/CRTC enumeration, dumb
//! buffer management, `set_crtc`, and `page_flip` all go through that
//! crate's bit-exact request structures. The only raw ioctl issued here is
//! MAP_DUMB (see [`framebuffer`]), which the persistent-mapping design
//! needs directly.

pub mod framebuffer;
pub mod topology;

use anyhow::{Context, Result};
use drm::control::Device as ControlDevice;
use drm::Device;
use log::{info, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use topology::{ConnectorDesc, EncoderDesc, Topology};

/// Fatal device-level failures; everything past open/capability-check is
/// per-output and non-fatal.
#[derive(Debug)]
pub enum KmsError {
    /// The device node could not be opened.
    DeviceUnavailable { path: PathBuf, source: io::Error },
    /// The device does not support dumb buffers, so there is nothing we
    /// can scan out.
    NoDumbBuffers { path: PathBuf },
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KmsError::DeviceUnavailable { path, source } => {
                write!(f, "cannot open DRM device '{}': {}", path.display(), source)
            }
            KmsError::NoDumbBuffers { path } => {
                write!(
                    f,
                    "DRM device '{}' does not support dumb buffers",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KmsError::DeviceUnavailable { source, .. } => Some(source),
            KmsError::NoDumbBuffers { .. } => None,
        }
    }
}

/// An opened DRM device node.
pub struct Card {
    file: File,
    path: PathBuf,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Opens the device node and verifies the dumb-buffer capability.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KmsError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|source| KmsError::DeviceUnavailable {
                path: path.clone(),
                source,
            })?;

        let card = Card { file, path };
        match card.get_driver_capability(drm::DriverCapability::DumbBuffer) {
            Ok(value) if value != 0 => {}
            Ok(_) | Err(_) => {
                return Err(KmsError::NoDumbBuffers { path: card.path });
            }
        }

        info!("Opened DRM device '{}'", card.path.display());
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Captures an id-level snapshot of the device's connectors, encoders
    /// and CRTCs for output planning. Resources that fail to probe are
    /// skipped with a diagnostic; they simply do not participate in
    /// binding.
    pub fn snapshot_topology(&self) -> Result<Topology> {
        let resources = self
            .resource_handles()
            .context("cannot retrieve DRM resources")?;

        let crtcs: Vec<u32> = resources.crtcs().iter().map(|&h| h.into()).collect();

        let mut encoders = Vec::new();
        for &handle in resources.encoders() {
            match self.get_encoder(handle) {
                Ok(info) => encoders.push(EncoderDesc {
                    id: handle.into(),
                    active_crtc: info.crtc().map(Into::into),
                    compatible_crtcs: resources
                        .filter_crtcs(info.possible_crtcs())
                        .into_iter()
                        .map(Into::into)
                        .collect(),
                }),
                Err(e) => {
                    warn!("cannot retrieve encoder {:?}: {}", handle, e);
                }
            }
        }

        let mut connectors = Vec::new();
        for &handle in resources.connectors() {
            match self.get_connector(handle, false) {
                Ok(info) => connectors.push(ConnectorDesc {
                    id: handle.into(),
                    name: format!("{:?}-{}", info.interface(), info.interface_id()),
                    connected: info.state() == drm::control::connector::State::Connected,
                    modes: info.modes().iter().map(topology::ModeDesc::from).collect(),
                    active_encoder: info.current_encoder().map(Into::into),
                    encoders: info.encoders().iter().map(|&h| h.into()).collect(),
                }),
                Err(e) => {
                    warn!("cannot retrieve connector {:?}: {}", handle, e);
                }
            }
        }

        info!(
            "DRM topology: {} connectors, {} encoders, {} CRTCs",
            connectors.len(),
            encoders.len(),
            crtcs.len()
        );

        Ok(Topology {
            connectors,
            encoders,
            crtcs,
        })
    }
}
