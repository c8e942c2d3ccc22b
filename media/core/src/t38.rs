//! T.38 fax: option parsing from `m=image … udptl` sections and the
//! passthrough switchover.

use crate::config::{ConfigView, MediaFlag, vars};
use crate::env::MediaEvent;
use crate::error::HangupCause;
use crate::{MediaHandle, MediaType};

/// Negotiated T.38 parameters, ITU-T T.38 Annex D attribute set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct T38Options {
    pub fax_version: u16,
    pub max_bit_rate: u32,
    pub fill_bit_removal: bool,
    pub transcoding_mmr: bool,
    pub transcoding_jbig: bool,
    pub rate_management: String,
    pub max_buffer: u32,
    pub max_datagram: u32,
    pub udp_ec: String,
    pub vendor_info: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: u16,
    /// Origin username of the SDP that carried the image line.
    pub sdp_o_line: String,
}

impl Default for T38Options {
    fn default() -> Self {
        T38Options {
            fax_version: 0,
            max_bit_rate: 14_400,
            fill_bit_removal: false,
            transcoding_mmr: false,
            transcoding_jbig: false,
            rate_management: "transferredTCF".into(),
            max_buffer: 500,
            max_datagram: 500,
            udp_ec: "t38UDPRedundancy".into(),
            vendor_info: None,
            remote_ip: None,
            remote_port: 0,
            sdp_o_line: "unknown".into(),
        }
    }
}

fn parse_bool_option(value: Option<&str>) -> bool {
    match value {
        // a bare attribute means asserted
        None | Some("") => true,
        Some(v) => v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"),
    }
}

/// Parse the T.38 options of one `m=image` section.
///
/// Unknown attributes are ignored; missing ones keep their Annex-D
/// defaults.
pub(crate) fn process_udptl(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &sdp::SessionDescription,
    m: &sdp::MediaDescription,
) -> T38Options {
    let mut t38 = handle.t38_options.clone().unwrap_or_default();

    t38.remote_port = m.media_name.port.value as u16;
    t38.sdp_o_line = session.origin.username.clone();

    t38.remote_ip = m
        .connection_information
        .as_ref()
        .or(session.connection_information.as_ref())
        .and_then(|c| c.address.as_ref())
        .map(|a| a.address.clone());

    for attr in &m.attributes {
        let value = attr.value.as_deref();

        if attr.key.eq_ignore_ascii_case("T38FaxVersion") {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                t38.fax_version = v;
            }
        } else if attr.key.eq_ignore_ascii_case("T38MaxBitRate") {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                t38.max_bit_rate = v;
            }
        } else if attr.key.eq_ignore_ascii_case("T38FaxFillBitRemoval") {
            t38.fill_bit_removal = parse_bool_option(value);
        } else if attr.key.eq_ignore_ascii_case("T38FaxTranscodingMMR") {
            t38.transcoding_mmr = parse_bool_option(value);
        } else if attr.key.eq_ignore_ascii_case("T38FaxTranscodingJBIG") {
            t38.transcoding_jbig = parse_bool_option(value);
        } else if attr.key.eq_ignore_ascii_case("T38FaxRateManagement") {
            if let Some(v) = value {
                t38.rate_management = v.to_string();
            }
        } else if attr.key.eq_ignore_ascii_case("T38FaxMaxBuffer") {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                t38.max_buffer = v;
            }
        } else if attr.key.eq_ignore_ascii_case("T38FaxMaxDatagram") {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                t38.max_datagram = v;
            }
        } else if attr.key.eq_ignore_ascii_case("T38FaxUdpEC") {
            if let Some(v) = value {
                t38.udp_ec = v.to_string();
            }
        } else if attr.key.eq_ignore_ascii_case("T38VendorInfo") {
            t38.vendor_info = value.map(str::to_string);
        }
    }

    cfg.set(vars::HAS_T38, "true");
    handle.flags.set(MediaFlag::T38);
    handle.t38_options = Some(t38.clone());

    t38
}

/// Switch the audio engine over to the T.38 peer and hand the options to
/// the partner leg.
///
/// The caller verified that passthrough is allowed and the partner is
/// answered; the remote SDP text travels with the queued image-media
/// request so the partner can mirror the m-line.
pub(crate) fn process_t38_passthru(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    t38: &T38Options,
    remote_sdp: &str,
) {
    let engine = handle.engine_mut(MediaType::Audio);

    let current = engine
        .transport
        .as_ref()
        .map(|t| (t.remote_host().to_string(), t.remote_port()));

    let new_ip = t38.remote_ip.clone();
    let new_port = t38.remote_port;

    engine.codec_params.remote_ip = new_ip.clone();
    engine.codec_params.remote_port = new_port;

    match (&current, &new_ip) {
        (Some((cur_ip, cur_port)), Some(ip)) if cur_ip == ip && *cur_port == new_port => {
            log::debug!("audio params are unchanged");
        }
        (_, Some(ip)) => {
            log::debug!("audio params changed to {ip}:{new_port}");

            cfg.set(vars::REMOTE_MEDIA_IP, ip);
            cfg.set(vars::REMOTE_MEDIA_PORT, &new_port.to_string());

            if let Some(transport) = &mut engine.transport {
                transport.set_remote_address(ip, new_port, 0);
            } else {
                handle.env.raise(MediaEvent::Hangup {
                    cause: HangupCause::IncompatibleDestination,
                });
                return;
            }
        }
        (_, None) => {
            log::warn!("image media without a usable connection address");
            return;
        }
    }

    handle.flags.set(MediaFlag::T38Passthru);
    cfg.set(vars::T38_PASSTHRU, "true");

    log::debug!("passing T.38 request to the partner leg");
    handle.env.raise(MediaEvent::RequestImageMedia {
        sdp: remote_sdp.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_annex_d() {
        let t38 = T38Options::default();
        assert_eq!(t38.max_bit_rate, 14_400);
        assert_eq!(t38.rate_management, "transferredTCF");
        assert_eq!(t38.udp_ec, "t38UDPRedundancy");
        assert_eq!(t38.max_buffer, 500);
        assert_eq!(t38.max_datagram, 500);
    }

    #[test]
    fn bool_options_accept_bare_and_numeric_forms() {
        assert!(parse_bool_option(None));
        assert!(parse_bool_option(Some("1")));
        assert!(!parse_bool_option(Some("0")));
        assert!(parse_bool_option(Some("true")));
    }
}
