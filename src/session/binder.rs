// src/session/binder.rs

//! Output planning: match every usable connector to a free CRTC.
//!
//! Planning is pure: it consumes a [`Topology`] snapshot and the set of
//! CRTCs already claimed by live sessions, and produces one result per
//! connector. The session manager turns accepted plans into sessions; a
//! per-connector failure never affects the other connectors.

use std::fmt;

use crate::kms::topology::{ConnectorDesc, ModeDesc, Topology};

/// Why a single connector could not be bound. Always per-output and
/// non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// The connector has nothing plugged in.
    Disconnected,
    /// The connector is connected but reports no usable mode.
    NoModes,
    /// Every CRTC the connector could use is claimed by another session.
    NoAvailableController,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::Disconnected => write!(f, "connector is not connected"),
            BindError::NoModes => write!(f, "no valid mode for connector"),
            BindError::NoAvailableController => {
                write!(f, "no suitable CRTC available for connector")
            }
        }
    }
}

impl std::error::Error for BindError {}

/// An accepted binding: connector, the CRTC claimed for it, and the mode
/// it will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub connector: u32,
    pub crtc: u32,
    pub mode: ModeDesc,
}

/// Plans a binding for every connector in the topology.
///
/// `claimed_crtcs` holds CRTCs owned by already-registered sessions; CRTCs
/// claimed by earlier plans in the same call are equally off limits, so no
/// two results ever name the same CRTC.
///
/// Mode selection takes the first entry of the connector's mode list; the
/// kernel orders modes by preference and no further ranking is done.
pub fn plan_outputs(
    topology: &Topology,
    claimed_crtcs: &[u32],
) -> Vec<(u32, Result<OutputPlan, BindError>)> {
    let mut claimed: Vec<u32> = claimed_crtcs.to_vec();

    topology
        .connectors
        .iter()
        .map(|connector| {
            let plan = plan_connector(topology, connector, &claimed);
            if let Ok(ref plan) = plan {
                claimed.push(plan.crtc);
            }
            (connector.id, plan)
        })
        .collect()
}

fn plan_connector(
    topology: &Topology,
    connector: &ConnectorDesc,
    claimed: &[u32],
) -> Result<OutputPlan, BindError> {
    if !connector.connected {
        return Err(BindError::Disconnected);
    }
    let mode = *connector.modes.first().ok_or(BindError::NoModes)?;
    let crtc = find_crtc(topology, connector, claimed).ok_or(BindError::NoAvailableController)?;
    Ok(OutputPlan {
        connector: connector.id,
        crtc,
        mode,
    })
}

/// CRTC matching, in order of preference: the CRTC already driving the
/// connector's active encoder if it is free, otherwise the first free CRTC
/// compatible with any of the connector's encoders.
fn find_crtc(topology: &Topology, connector: &ConnectorDesc, claimed: &[u32]) -> Option<u32> {
    if let Some(encoder) = connector.active_encoder.and_then(|id| topology.encoder(id)) {
        if let Some(crtc) = encoder.active_crtc {
            if !claimed.contains(&crtc) {
                return Some(crtc);
            }
        }
    }

    for encoder in connector
        .encoders
        .iter()
        .filter_map(|&id| topology.encoder(id))
    {
        for &crtc in &encoder.compatible_crtcs {
            if !claimed.contains(&crtc) {
                return Some(crtc);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::topology::EncoderDesc;
    use test_log::test;

    fn mode(width: u16, height: u16) -> ModeDesc {
        ModeDesc {
            width,
            height,
            refresh_hz: 60,
        }
    }

    fn connector(id: u32, connected: bool, encoders: &[u32]) -> ConnectorDesc {
        ConnectorDesc {
            id,
            name: format!("HDMIA-{}", id),
            connected,
            modes: vec![mode(1920, 1080), mode(1280, 720)],
            active_encoder: None,
            encoders: encoders.to_vec(),
        }
    }

    fn encoder(id: u32, compatible: &[u32]) -> EncoderDesc {
        EncoderDesc {
            id,
            active_crtc: None,
            compatible_crtcs: compatible.to_vec(),
        }
    }

    fn plans_of(results: &[(u32, Result<OutputPlan, BindError>)]) -> Vec<&OutputPlan> {
        results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect()
    }

    #[test]
    fn it_should_bind_each_connector_to_a_distinct_crtc() {
        let topology = Topology {
            connectors: vec![
                connector(1, true, &[10]),
                connector(2, true, &[11]),
                connector(3, true, &[12]),
            ],
            encoders: vec![
                encoder(10, &[100, 101, 102]),
                encoder(11, &[100, 101, 102]),
                encoder(12, &[100, 101, 102]),
            ],
            crtcs: vec![100, 101, 102],
        };

        let results = plan_outputs(&topology, &[]);
        let plans = plans_of(&results);
        assert_eq!(plans.len(), 3);

        let mut crtcs: Vec<u32> = plans.iter().map(|p| p.crtc).collect();
        crtcs.sort_unstable();
        crtcs.dedup();
        assert_eq!(crtcs.len(), 3, "a CRTC was claimed twice");
    }

    #[test]
    fn it_should_prefer_the_active_encoders_current_crtc() {
        let mut conn = connector(1, true, &[10, 11]);
        conn.active_encoder = Some(11);
        let topology = Topology {
            connectors: vec![conn],
            encoders: vec![
                encoder(10, &[100, 101]),
                EncoderDesc {
                    id: 11,
                    active_crtc: Some(101),
                    compatible_crtcs: vec![100, 101],
                },
            ],
            crtcs: vec![100, 101],
        };

        let results = plan_outputs(&topology, &[]);
        assert_eq!(results[0].1.as_ref().unwrap().crtc, 101);
    }

    #[test]
    fn it_should_fall_back_to_scanning_when_the_active_crtc_is_claimed() {
        let mut conn = connector(1, true, &[11]);
        conn.active_encoder = Some(11);
        let topology = Topology {
            connectors: vec![conn],
            encoders: vec![EncoderDesc {
                id: 11,
                active_crtc: Some(101),
                compatible_crtcs: vec![100, 101],
            }],
            crtcs: vec![100, 101],
        };

        // 101 already belongs to a live session; the scan finds 100.
        let results = plan_outputs(&topology, &[101]);
        assert_eq!(results[0].1.as_ref().unwrap().crtc, 100);
    }

    #[test]
    fn it_should_skip_disconnected_connectors() {
        let topology = Topology {
            connectors: vec![connector(1, false, &[10]), connector(2, true, &[10])],
            encoders: vec![encoder(10, &[100])],
            crtcs: vec![100],
        };

        let results = plan_outputs(&topology, &[]);
        assert_eq!(results[0].1, Err(BindError::Disconnected));
        // The disconnected connector claims nothing; the second one binds.
        assert_eq!(results[1].1.as_ref().unwrap().crtc, 100);
    }

    #[test]
    fn it_should_skip_connectors_without_modes() {
        let mut conn = connector(1, true, &[10]);
        conn.modes.clear();
        let topology = Topology {
            connectors: vec![conn],
            encoders: vec![encoder(10, &[100])],
            crtcs: vec![100],
        };

        let results = plan_outputs(&topology, &[]);
        assert_eq!(results[0].1, Err(BindError::NoModes));
    }

    #[test]
    fn it_should_bind_only_one_of_two_connectors_sharing_a_single_crtc() {
        // Two connectors, one shared encoder, one CRTC: the first binds,
        // the second gets NoAvailableController.
        let topology = Topology {
            connectors: vec![connector(1, true, &[10]), connector(2, true, &[10])],
            encoders: vec![encoder(10, &[100])],
            crtcs: vec![100],
        };

        let results = plan_outputs(&topology, &[]);
        assert_eq!(results[0].1.as_ref().unwrap().crtc, 100);
        assert_eq!(results[1].1, Err(BindError::NoAvailableController));
    }

    #[test]
    fn it_should_select_the_first_mode_in_preference_order() {
        let topology = Topology {
            connectors: vec![connector(1, true, &[10])],
            encoders: vec![encoder(10, &[100])],
            crtcs: vec![100],
        };

        let results = plan_outputs(&topology, &[]);
        let plan = results[0].1.as_ref().unwrap();
        assert_eq!((plan.mode.width, plan.mode.height), (1920, 1080));
    }

    #[test]
    fn it_should_never_claim_a_crtc_held_by_an_existing_session() {
        let topology = Topology {
            connectors: vec![connector(1, true, &[10])],
            encoders: vec![encoder(10, &[100, 101])],
            crtcs: vec![100, 101],
        };

        let results = plan_outputs(&topology, &[100]);
        assert_eq!(results[0].1.as_ref().unwrap().crtc, 101);

        let results = plan_outputs(&topology, &[100, 101]);
        assert_eq!(results[0].1, Err(BindError::NoAvailableController));
    }

    #[test]
    fn it_should_keep_exclusivity_across_a_cyclic_encoder_mesh() {
        // Four connectors sharing overlapping encoders in a ring; three
        // CRTCs. Whatever the assignment, no CRTC may be claimed twice and
        // exactly one connector must fail.
        let topology = Topology {
            connectors: vec![
                connector(1, true, &[10, 11]),
                connector(2, true, &[11, 12]),
                connector(3, true, &[12, 13]),
                connector(4, true, &[13, 10]),
            ],
            encoders: vec![
                encoder(10, &[100, 101]),
                encoder(11, &[101, 102]),
                encoder(12, &[102, 100]),
                encoder(13, &[100, 102]),
            ],
            crtcs: vec![100, 101, 102],
        };

        let results = plan_outputs(&topology, &[]);
        let plans = plans_of(&results);
        assert_eq!(plans.len(), 3);

        let mut crtcs: Vec<u32> = plans.iter().map(|p| p.crtc).collect();
        crtcs.sort_unstable();
        crtcs.dedup();
        assert_eq!(crtcs.len(), 3, "a CRTC was claimed twice");

        let failures: Vec<_> = results
            .iter()
            .filter(|(_, r)| *r == Err(BindError::NoAvailableController))
            .collect();
        assert_eq!(failures.len(), 1);
    }
}
