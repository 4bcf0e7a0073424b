// src/kms/topology.rs

//! Id-level description of the device's display topology.
//!
//! The output binder plans over these plain structs rather than over live
//! kernel resources, so planning is pure and can be exercised against
//! synthetic topologies. [`crate::kms::Card::snapshot_topology`] produces
//! the real one.

use drm::control::Mode;

/// One display mode (resolution and refresh) supported by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDesc {
    pub width: u16,
    pub height: u16,
    pub refresh_hz: u32,
}

impl From<&Mode> for ModeDesc {
    fn from(mode: &Mode) -> Self {
        let (width, height) = mode.size();
        ModeDesc {
            width,
            height,
            refresh_hz: mode.vrefresh(),
        }
    }
}

/// A physical output port. `modes` is in the kernel's preference order.
#[derive(Debug, Clone)]
pub struct ConnectorDesc {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub modes: Vec<ModeDesc>,
    /// Encoder currently routed to this connector, if any.
    pub active_encoder: Option<u32>,
    /// All encoders this connector can use.
    pub encoders: Vec<u32>,
}

/// A signal encoder. `compatible_crtcs` preserves the kernel's CRTC
/// resource order.
#[derive(Debug, Clone)]
pub struct EncoderDesc {
    pub id: u32,
    /// CRTC currently driving this encoder, if any.
    pub active_crtc: Option<u32>,
    pub compatible_crtcs: Vec<u32>,
}

/// A full snapshot of the device's mode-setting resources.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub connectors: Vec<ConnectorDesc>,
    pub encoders: Vec<EncoderDesc>,
    pub crtcs: Vec<u32>,
}

impl Topology {
    pub fn encoder(&self, id: u32) -> Option<&EncoderDesc> {
        self.encoders.iter().find(|e| e.id == id)
    }
}
