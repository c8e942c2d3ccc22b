//! The hold state machine.

use crate::config::{ConfigView, MediaFlag};
use crate::env::MediaEvent;
use crate::{MediaHandle, MediaType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    Active,
    /// The peer put us on protocol hold (sendonly/inactive re-offer).
    ProtoHold,
    /// Protocol hold with music running towards the partner.
    HeldWithMoh,
}

pub fn hold_state(handle: &MediaHandle) -> HoldState {
    if handle.flags.test(MediaFlag::ProtoHold) {
        if handle.flags.test(MediaFlag::Hold) {
            HoldState::ProtoHold
        } else {
            HoldState::HeldWithMoh
        }
    } else {
        HoldState::Active
    }
}

/// Apply a peer-driven hold or unhold. Returns whether the state changed.
pub(crate) fn toggle_hold(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    sendonly: bool,
) -> bool {
    let mut changed = false;

    if sendonly && handle.flags.test(MediaFlag::Answered) {
        if !handle.flags.test(MediaFlag::ProtoHold) {
            let mut presence = "hold";

            if let Some(info) = cfg.get(crate::config::vars::PRESENCE_CALL_INFO) {
                if info.to_ascii_lowercase().contains("private") {
                    presence = "hold-private";
                }
            }

            handle.flags.set(MediaFlag::ProtoHold);
            handle.env.raise(MediaEvent::Presence { state: presence });
            changed = true;

            let hold_packets = handle.engine(MediaType::Audio).max_missed_hold_packets;
            if hold_packets != 0 {
                if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                    transport.set_max_missed_packets(hold_packets);
                }
            }

            let stream = cfg
                .get(crate::config::vars::HOLD_MUSIC)
                .unwrap_or_else(|| "local_stream://moh".to_string());

            if !stream.eq_ignore_ascii_case("silence") {
                if stream.eq_ignore_ascii_case("indicate_hold") {
                    handle.flags.set(MediaFlag::Hold);
                } else {
                    handle.env.raise(MediaEvent::MohStart { stream });
                    std::thread::yield_now();
                }
            }
        }
    } else {
        if handle.flags.test(MediaFlag::HoldLock) {
            handle.flags.set(MediaFlag::ProtoHold);
            changed = true;
        }

        handle.flags.clear(MediaFlag::HoldLock);

        if handle.flags.test(MediaFlag::ProtoHold) {
            std::thread::yield_now();

            let packets = handle.engine(MediaType::Audio).max_missed_packets;
            if packets != 0 {
                if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                    transport.reset_media_timer();
                    transport.set_max_missed_packets(packets);
                }
            }

            handle.env.raise(MediaEvent::MohStop);
            handle.flags.clear(MediaFlag::Hold);
            handle.flags.clear(MediaFlag::ProtoHold);
            handle.env.raise(MediaEvent::Presence { state: "unhold" });
            changed = true;
        }
    }

    changed
}
