//! Session description generation: mirror the negotiated engine state back
//! to the peer.

use crate::codec::{CodecKind, PayloadAllocator};
use crate::config::{CallDirection, ConfigView, DtmfType, MediaFlag, vars};
use crate::engine::RtpEngine;
use crate::error::MediaError;
use crate::ice::{gen_ice, host_priority, srflx_priority};
use crate::secure::check_outgoing_crypto;
use crate::t38::T38Options;
use crate::{MediaHandle, MediaType};
use sdp::SessionDescription;
use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::media::{MediaDescription, MediaName, RangedPort};
use sdp::description::session::{Origin, TimeDescription, Timing};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

fn attr(key: &str) -> Attribute {
    Attribute::new(key.to_string(), None)
}

fn attr_val(key: &str, value: String) -> Attribute {
    Attribute::new(key.to_string(), Some(value))
}

/// Assign payload type numbers to the preference list, one value per codec,
/// static codes kept, dynamic ones drawn from the allocator.
pub(crate) fn assign_payload_types(handle: &mut MediaHandle) {
    if !handle.ianacodes.is_empty() || handle.codecs.is_empty() {
        return;
    }

    let mut alloc = PayloadAllocator::new(handle.te, handle.cng_pt);
    let mut codes = Vec::with_capacity(handle.codecs.len());

    for imp in &handle.codecs {
        match imp.ianacode {
            // anything above the static range is re-assigned dynamically
            Some(code) if code <= 64 => codes.push(code),
            _ => codes.push(alloc.take().unwrap_or(127)),
        }
    }

    handle.ianacodes = codes;
}

fn media_profile(handle: &MediaHandle, secure: bool) -> &'static str {
    if handle.flags.test(MediaFlag::Webrtc) {
        if handle.flags.test(MediaFlag::WebrtcMoz) {
            return "UDP/TLS/RTP/SAVPF";
        }
        return "RTP/SAVPF";
    }

    if secure {
        return "RTP/SAVP";
    }

    "RTP/AVP"
}

fn protos_of(profile: &str) -> Vec<String> {
    profile.split('/').map(str::to_string).collect()
}

fn family_of(ip: &str) -> &'static str {
    if ip.contains(':') { "IP6" } else { "IP4" }
}

/// `a=rtcp`/`a=rtcp-mux` attributes for one media block.
fn push_rtcp_attributes(desc: &mut MediaDescription, engine: &RtpEngine, port: u16, ip: &str) {
    let family = family_of(ip);

    if engine.rtcp_mux.enabled() {
        desc.attributes.push(attr("rtcp-mux"));
        desc.attributes
            .push(attr_val("rtcp", format!("{port} IN {family} {ip}")));
    } else {
        desc.attributes
            .push(attr_val("rtcp", format!("{} IN {family} {ip}", port + 1)));
    }
}

/// ssrc grouping, credentials and candidates for one media block.
#[allow(clippy::too_many_arguments)]
fn push_ice_attributes(
    desc: &mut MediaDescription,
    engine: &RtpEngine,
    msid: &str,
    cname: &str,
    label: &str,
    outbound: bool,
) {
    let Some(cand) = engine.ice_out.chosen_candidate(1) else {
        return;
    };

    if cand.ready == 0 {
        return;
    }

    let ssrc = engine.ssrc;

    desc.attributes
        .push(attr_val("ssrc", format!("{ssrc} cname:{cname}")));
    desc.attributes
        .push(attr_val("ssrc", format!("{ssrc} msid:{msid} {label}")));
    desc.attributes
        .push(attr_val("ssrc", format!("{ssrc} mslabel:{msid}")));
    desc.attributes
        .push(attr_val("ssrc", format!("{ssrc} label:{msid}{label}")));

    if let (Some(ufrag), Some(pwd)) = (&engine.ice_out.ufrag, &engine.ice_out.pwd) {
        desc.attributes.push(attr_val("ice-ufrag", ufrag.clone()));
        desc.attributes.push(attr_val("ice-pwd", pwd.clone()));
    }

    let foundation = &cand.foundation;
    let transport = &cand.transport;
    let con_addr = &cand.con_addr;
    let con_port = cand.con_port;

    desc.attributes.push(attr_val(
        "candidate",
        format!(
            "{foundation} 1 {transport} {} {con_addr} {con_port} typ host generation 0",
            host_priority(1)
        ),
    ));

    let local_ip = engine
        .codec_params
        .local_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let local_port = engine.codec_params.local_port;

    // advertise the bound address as server-reflexive when it differs from
    // the external one
    let reflexive = !local_ip.is_empty() && !con_addr.is_empty() && local_ip != *con_addr;

    if reflexive {
        desc.attributes.push(attr_val(
            "candidate",
            format!(
                "{foundation} 1 {transport} {} {con_addr} {con_port} typ srflx raddr {local_ip} rport {local_port} generation 0",
                srflx_priority(1)
            ),
        ));
    }

    let mux = engine.rtcp_mux.enabled();

    if !mux || outbound {
        let offset = if mux { 0 } else { 1 };

        desc.attributes.push(attr_val(
            "candidate",
            format!(
                "{foundation} 2 {transport} {} {con_addr} {} typ host generation 0",
                host_priority(2),
                con_port + offset
            ),
        ));

        if reflexive {
            desc.attributes.push(attr_val(
                "candidate",
                format!(
                    "{foundation} 2 {transport} {} {con_addr} {} typ srflx raddr {local_ip} rport {} generation 0",
                    srflx_priority(2),
                    con_port + offset,
                    local_port + offset
                ),
            ));
        }
    }
}

fn te_wanted(handle: &MediaHandle) -> bool {
    (handle.dtmf_type == DtmfType::Rfc2833 || handle.flags.test(MediaFlag::LiberalDtmf))
        && handle.te > 95
}

fn push_te_attributes(handle: &MediaHandle, desc: &mut MediaDescription) {
    if !te_wanted(handle) {
        return;
    }

    desc.attributes.push(attr_val(
        "rtpmap",
        format!("{} telephone-event/8000", handle.te),
    ));

    if !handle.flags.test(MediaFlag::Webrtc) {
        desc.attributes
            .push(attr_val("fmtp", format!("{} 0-16", handle.te)));
    }
}

/// The audio block for a call with a bound codec: exactly the negotiated
/// payload plus telephone-event and comfort noise.
#[allow(clippy::too_many_arguments)]
fn bound_audio_media(
    handle: &MediaHandle,
    cfg: &dyn ConfigView,
    port: u16,
    ip: &str,
    sr: &str,
    use_cng: bool,
    secure: bool,
    crypto_line: Option<&str>,
) -> MediaDescription {
    let engine = handle.engine(MediaType::Audio);
    let params = &engine.codec_params;

    let mut formats = vec![params.pt.to_string()];

    if te_wanted(handle) {
        formats.push(handle.te.to_string());
    }

    let cng_on = !handle.flags.test(MediaFlag::SuppressCng) && handle.cng_pt != 0 && use_cng;
    if cng_on {
        formats.push(handle.cng_pt.to_string());
    }

    let mut desc = MediaDescription {
        media_name: MediaName {
            media: "audio".to_string(),
            port: RangedPort {
                value: port as isize,
                range: None,
            },
            protos: protos_of(media_profile(handle, secure)),
            formats,
        },
        media_title: None,
        connection_information: None,
        bandwidth: vec![],
        encryption_key: None,
        attributes: vec![],
    };

    let encoding = params.encoding.as_deref().unwrap_or("");
    if params.adv_channels > 1 {
        desc.attributes.push(attr_val(
            "rtpmap",
            format!(
                "{} {}/{}/{}",
                params.agreed_pt, encoding, params.rate, params.adv_channels
            ),
        ));
    } else {
        desc.attributes.push(attr_val(
            "rtpmap",
            format!("{} {}/{}", params.agreed_pt, encoding, params.rate),
        ));
    }

    let fmtp_out = cfg
        .get(vars::RTP_FORCE_AUDIO_FMTP)
        .or_else(|| params.fmtp_out.clone());

    if let Some(fmtp) = fmtp_out {
        desc.attributes
            .push(attr_val("fmtp", format!("{} {fmtp}", params.agreed_pt)));
    }

    push_te_attributes(handle, &mut desc);

    if cng_on {
        desc.attributes
            .push(attr_val("rtpmap", format!("{} CN/8000", handle.cng_pt)));
    } else {
        desc.attributes
            .push(attr_val("silenceSupp", "off - - - -".to_string()));
    }

    if params.ptime != 0 {
        desc.attributes
            .push(attr_val("ptime", params.ptime.to_string()));
    }

    if let Some(hash) = &engine.local_zrtp_hash {
        log::debug!("adding audio zrtp-hash {hash}");
        desc.attributes.push(attr_val("zrtp-hash", hash.clone()));
    }

    desc.attributes.push(attr(sr));

    if let (Some(hash), Some(value)) = (
        &engine.local_dtls_fingerprint.hash,
        &engine.local_dtls_fingerprint.value,
    ) {
        desc.attributes
            .push(attr_val("fingerprint", format!("{hash} {value}")));
    }

    if cfg.get(vars::RTCP_AUDIO_INTERVAL_MSEC).is_some()
        || handle.params.rtcp_audio_interval_msec.is_some()
    {
        push_rtcp_attributes(&mut desc, engine, port, ip);
    }

    push_ice_attributes(
        &mut desc,
        engine,
        handle.msid.as_deref().unwrap_or(""),
        handle.cname.as_deref().unwrap_or(""),
        "a0",
        handle.direction == CallDirection::Outbound,
    );

    if secure && !handle.flags.test(MediaFlag::Dtls) {
        if let Some(line) = crypto_line {
            desc.attributes.push(attr_val("crypto", line.to_string()));
        }
    }

    desc
}

/// The audio block offering the full preference list, one block per call
/// for WebRTC, otherwise one per distinct ptime.
#[allow(clippy::too_many_arguments)]
fn prefs_audio_media(
    handle: &MediaHandle,
    cfg: &dyn ConfigView,
    port: u16,
    ip: &str,
    cur_ptime: u32,
    sr: &str,
    use_cng: bool,
    cng_type: u8,
    fmtp_map: &HashMap<String, String>,
    secure: bool,
    crypto_line: Option<&str>,
) -> MediaDescription {
    let engine = handle.engine(MediaType::Audio);
    let verbose = handle.flags.test(MediaFlag::VerboseSdp);

    let mut formats = Vec::new();
    let mut already_did = [false; 128];
    let mut ptime = 0u32;

    for (imp, &code) in handle.codecs.iter().zip(&handle.ianacodes) {
        if imp.kind != CodecKind::Audio {
            continue;
        }

        let mut this_ptime = imp.ptime;
        if imp.iananame.eq_ignore_ascii_case("ilbc") || imp.iananame.eq_ignore_ascii_case("isac") {
            this_ptime = 20;
        }

        if cur_ptime == 0 {
            if ptime == 0 {
                ptime = this_ptime;
            }
        } else if this_ptime != cur_ptime {
            continue;
        }

        if (code as usize) < 128 {
            if already_did[code as usize] {
                continue;
            }
            already_did[code as usize] = true;
        }

        formats.push(code.to_string());
    }

    if handle.dtmf_type == DtmfType::Rfc2833 && handle.te > 95 {
        formats.push(handle.te.to_string());
    }

    if !handle.flags.test(MediaFlag::SuppressCng) && cng_type != 0 && use_cng {
        formats.push(cng_type.to_string());
    }

    let mut desc = MediaDescription {
        media_name: MediaName {
            media: "audio".to_string(),
            port: RangedPort {
                value: port as isize,
                range: None,
            },
            protos: protos_of(media_profile(handle, secure)),
            formats,
        },
        media_title: None,
        connection_information: None,
        bandwidth: vec![],
        encryption_key: None,
        attributes: vec![],
    };

    let mut already_did = [false; 128];

    for (imp, &code) in handle.codecs.iter().zip(&handle.ianacodes) {
        if imp.kind != CodecKind::Audio {
            continue;
        }

        let mut this_ptime = imp.ptime;
        if imp.iananame.eq_ignore_ascii_case("ilbc") || imp.iananame.eq_ignore_ascii_case("isac") {
            this_ptime = 20;
        }

        if cur_ptime != 0 && this_ptime != cur_ptime {
            continue;
        }

        if (code as usize) < 128 {
            if already_did[code as usize] {
                continue;
            }
            already_did[code as usize] = true;
        }

        if code > 95 || verbose {
            if imp.channels > 1 {
                desc.attributes.push(attr_val(
                    "rtpmap",
                    format!("{code} {}/{}/{}", imp.iananame, imp.rate, imp.channels),
                ));
            } else {
                desc.attributes.push(attr_val(
                    "rtpmap",
                    format!("{code} {}/{}", imp.iananame, imp.rate),
                ));
            }
        }

        // fmtp from the implementation, overridable by the partner's map
        let fmtp = fmtp_map
            .get(&format!("{}:{}", imp.iananame, imp.bitrate))
            .or_else(|| fmtp_map.get(&imp.iananame))
            .cloned()
            .or_else(|| imp.fmtp.clone());

        if let Some(fmtp) = fmtp {
            desc.attributes
                .push(attr_val("fmtp", format!("{code} {fmtp}")));
        }
    }

    push_te_attributes(handle, &mut desc);

    if let (Some(hash), Some(value)) = (
        &engine.local_dtls_fingerprint.hash,
        &engine.local_dtls_fingerprint.value,
    ) {
        if secure {
            desc.attributes
                .push(attr_val("fingerprint", format!("{hash} {value}")));
        }
    }

    if cfg.get(vars::RTCP_AUDIO_INTERVAL_MSEC).is_some()
        || handle.params.rtcp_audio_interval_msec.is_some()
    {
        push_rtcp_attributes(&mut desc, engine, port, ip);
    }

    push_ice_attributes(
        &mut desc,
        engine,
        handle.msid.as_deref().unwrap_or(""),
        handle.cname.as_deref().unwrap_or(""),
        "a0",
        handle.direction == CallDirection::Outbound,
    );

    if secure && !handle.flags.test(MediaFlag::Dtls) {
        if let Some(line) = crypto_line {
            desc.attributes.push(attr_val("crypto", line.to_string()));
        }
    }

    if cng_type == 0 {
        desc.attributes
            .push(attr_val("silenceSupp", "off - - - -".to_string()));
    }

    let emit_ptime = if cur_ptime != 0 { cur_ptime } else { ptime };
    if emit_ptime != 0 {
        desc.attributes
            .push(attr_val("ptime", emit_ptime.to_string()));
    }

    if let Some(hash) = &engine.local_zrtp_hash {
        desc.attributes.push(attr_val("zrtp-hash", hash.clone()));
    }

    desc.attributes.push(attr(sr));

    desc
}

fn video_media(
    handle: &MediaHandle,
    cfg: &dyn ConfigView,
    v_port: u16,
    ip: &str,
    secure: bool,
    crypto_line: Option<&str>,
) -> MediaDescription {
    let engine = handle.engine(MediaType::Video);
    let params = &engine.codec_params;

    let mut vp8_pt = 0u8;
    let mut formats = Vec::new();
    let mut rtpmaps: Vec<Attribute> = Vec::new();

    let ov_fmtp = cfg.get(vars::RTP_FORCE_VIDEO_FMTP);

    if params.bound() {
        if params
            .encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("VP8"))
        {
            vp8_pt = params.pt;
        }

        formats.push(params.agreed_pt.to_string());
        rtpmaps.push(attr_val(
            "rtpmap",
            format!(
                "{} {}/{}",
                params.pt,
                params.encoding.as_deref().unwrap_or(""),
                params.rate
            ),
        ));

        let pass_fmtp = if handle.flags.test(MediaFlag::Recovering) {
            params.fmtp_in.clone()
        } else {
            ov_fmtp.clone().or_else(|| cfg.get(vars::RTP_VIDEO_FMTP))
        };

        if let Some(fmtp) = pass_fmtp {
            rtpmaps.push(attr_val("fmtp", format!("{} {fmtp}", params.pt)));
        }
    } else {
        let mut already_did = [false; 128];

        for (imp, &code) in handle.codecs.iter().zip(&handle.ianacodes) {
            if imp.kind != CodecKind::Video {
                continue;
            }

            if (code as usize) < 128 {
                if already_did[code as usize] {
                    continue;
                }
                already_did[code as usize] = true;
            }

            if imp.iananame.eq_ignore_ascii_case("VP8") {
                vp8_pt = code;
            }

            formats.push(code.to_string());
            rtpmaps.push(attr_val(
                "rtpmap",
                format!("{code} {}/{}", imp.iananame, imp.rate),
            ));

            let fmtp = ov_fmtp.clone().or_else(|| imp.fmtp.clone());
            if let Some(fmtp) = fmtp {
                if !fmtp.eq_ignore_ascii_case("_blank_") {
                    rtpmaps.push(attr_val("fmtp", format!("{code} {fmtp}")));
                }
            }
        }
    }

    let mut desc = MediaDescription {
        media_name: MediaName {
            media: "video".to_string(),
            port: RangedPort {
                value: v_port as isize,
                range: None,
            },
            protos: protos_of(media_profile(handle, secure)),
            formats,
        },
        media_title: None,
        connection_information: None,
        bandwidth: vec![],
        encryption_key: None,
        attributes: rtpmaps,
    };

    if let (Some(hash), Some(value)) = (
        &engine.local_dtls_fingerprint.hash,
        &engine.local_dtls_fingerprint.value,
    ) {
        desc.attributes
            .push(attr_val("fingerprint", format!("{hash} {value}")));
    }

    if cfg.get(vars::RTCP_VIDEO_INTERVAL_MSEC).is_some()
        || handle.params.rtcp_video_interval_msec.is_some()
    {
        push_rtcp_attributes(&mut desc, engine, v_port, ip);
    }

    let ice_ready = engine.ice_out.chosen_candidate(1).is_some_and(|c| c.ready > 0);

    if ice_ready {
        let bw = cfg
            .get(vars::RTP_VIDEO_MAX_BANDWIDTH)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(256);

        if bw > 0 {
            desc.bandwidth.push(sdp::description::common::Bandwidth {
                experimental: false,
                bandwidth_type: "AS".to_string(),
                bandwidth: bw as u64,
            });
        }

        if vp8_pt != 0 {
            desc.attributes
                .push(attr_val("rtcp-fb", format!("{vp8_pt} ccm fir")));
        }

        push_ice_attributes(
            &mut desc,
            engine,
            handle.msid.as_deref().unwrap_or(""),
            handle.cname.as_deref().unwrap_or(""),
            "v0",
            handle.direction == CallDirection::Outbound,
        );
    }

    if secure && !handle.flags.test(MediaFlag::Dtls) {
        if let Some(line) = crypto_line {
            desc.attributes.push(attr_val("crypto", line.to_string()));
        }
    }

    if let Some(hash) = &engine.local_zrtp_hash {
        log::debug!("adding video zrtp-hash {hash}");
        desc.attributes.push(attr_val("zrtp-hash", hash.clone()));
    }

    desc
}

/// Build the fmtp/pt override maps from the partner leg's SDP.
fn sdp_map(sdp_text: &str) -> HashMap<String, String> {
    let mut fmtp_map = HashMap::new();

    let Ok(session) = crate::parse_session_description(sdp_text) else {
        return fmtp_map;
    };

    for m in &session.media_descriptions {
        for map in crate::offer_answer::rtpmaps_of(m) {
            let Some(fmtp) = crate::offer_answer::fmtp_of(m, map.pt) else {
                continue;
            };

            let key = if let Some(bitrate) = fmtp
                .split(';')
                .find_map(|p| p.trim().strip_prefix("bitrate=").map(str::to_string))
            {
                format!("{}:{}", map.encoding, bitrate)
            } else {
                map.encoding.clone()
            };

            fmtp_map.insert(key, fmtp);
        }
    }

    fmtp_map
}

/// Generate the complete local session description and store it on the
/// handle.
pub(crate) fn gen_local_sdp(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    ip_override: Option<&str>,
    port_override: u16,
    sr_override: Option<&str>,
    force: bool,
) -> Result<(), MediaError> {
    if handle.flags.test(MediaFlag::DtlsOk) && cfg.is_false(vars::WEBRTC_ENABLE_DTLS) {
        handle.flags.clear(MediaFlag::DtlsOk);
        handle.flags.clear(MediaFlag::Dtls);
    }

    if cfg.is_true(vars::RTP_SECURE_MEDIA) {
        handle.flags.set(MediaFlag::Secure);
    }

    if handle.direction == CallDirection::Outbound {
        if !handle.flags.test(MediaFlag::Webrtc) && cfg.is_true(vars::MEDIA_WEBRTC) {
            handle.set_ice_mode();
            handle.params.rtcp_audio_interval_msec = Some("5000".to_string());
            handle.params.rtcp_video_interval_msec = Some("5000".to_string());
        }

        if handle.flags.test(MediaFlag::DtlsOk)
            && (handle.flags.test(MediaFlag::Webrtc) || cfg.is_true(vars::RTP_USE_DTLS))
        {
            handle.flags.set(MediaFlag::Dtls);
            handle.flags.set(MediaFlag::Secure);

            let fingerprint = handle.env.local_fingerprint_sha256();
            let engine = handle.engine_mut(MediaType::Audio);
            if !engine.local_dtls_fingerprint.is_set() {
                engine.local_dtls_fingerprint.hash = Some("sha-256".to_string());
                engine.local_dtls_fingerprint.value = Some(fingerprint);
            }
        }

        check_outgoing_crypto(handle, cfg, vars::RTP_SECURE_MEDIA);
    }

    let mut use_cng = true;
    if handle.flags.test(MediaFlag::SuppressCng)
        || cfg.is_true(vars::SUPPRESS_CNG)
        || cfg.is_true(vars::SUPRESS_CNG)
    {
        use_cng = false;
        handle.cng_pt = 0;
    }

    assign_payload_types(handle);

    if cfg.is_true(vars::VERBOSE_SDP) {
        handle.flags.set(MediaFlag::VerboseSdp);
    }

    if !force
        && ip_override.is_none()
        && sr_override.is_none()
        && (handle.flags.test(MediaFlag::ProxyMode) || handle.flags.test(MediaFlag::ProxyMedia))
    {
        return Ok(());
    }

    let audio_params = &handle.engine(MediaType::Audio).codec_params;

    let ip = match ip_override {
        Some(ip) => ip.to_string(),
        None => match audio_params.adv_ip.clone().or(audio_params.proxy_ip.clone()) {
            Some(ip) => ip,
            None => {
                log::error!("no local media ip to generate sdp with");
                return Err(MediaError::NotReady);
            }
        },
    };

    let port = if port_override != 0 {
        port_override
    } else if audio_params.adv_port != 0 {
        audio_params.adv_port
    } else if audio_params.proxy_port != 0 {
        audio_params.proxy_port
    } else {
        log::error!("no local media port to generate sdp with");
        return Err(MediaError::NotReady);
    };

    let sr = match sr_override {
        Some(sr) => sr.to_string(),
        None => cfg
            .get(vars::MEDIA_AUDIO_MODE)
            .unwrap_or_else(|| "sendrecv".to_string()),
    };

    if handle.owner_id == 0 {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        handle.owner_id = epoch.wrapping_sub(u32::from(port));
    }

    if handle.session_id == 0 {
        handle.session_id = handle.owner_id;
    }

    handle.session_id = handle.session_id.wrapping_add(1);

    let fmtp_map = if !handle.engine(MediaType::Audio).codec_params.bound() {
        cfg.get(vars::SWITCH_M_SDP)
            .map(|b_sdp| sdp_map(&b_sdp))
            .unwrap_or_default()
    } else {
        HashMap::new()
    };

    let mut session = SessionDescription {
        version: 0,
        origin: Origin {
            username: handle.params.sdp_username.clone(),
            session_id: u64::from(handle.owner_id),
            session_version: u64::from(handle.session_id),
            network_type: "IN".to_string(),
            address_type: family_of(&ip).to_string(),
            unicast_address: ip.clone(),
        },
        session_name: handle.params.sdp_username.clone(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: family_of(&ip).to_string(),
            address: Some(Address {
                address: ip.clone(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        time_zones: vec![],
        encryption_key: None,
        attributes: vec![],
        media_descriptions: vec![],
    };

    if handle.flags.test(MediaFlag::Ice) {
        gen_ice(handle, MediaType::Audio, Some(&ip), port);
        session.attributes.push(attr_val(
            "msid-semantic",
            format!(" WMS {}", handle.msid.as_deref().unwrap_or("")),
        ));
    }

    // local crypto is not emitted alongside DTLS on the inbound leg
    let mut local_audio_crypto = handle
        .engine(MediaType::Audio)
        .ssec
        .local_crypto_line
        .clone();

    if handle.direction == CallDirection::Inbound && handle.flags.test(MediaFlag::Dtls) {
        local_audio_crypto = None;
    }

    let secure = (local_audio_crypto.is_some() || handle.flags.test(MediaFlag::Dtls))
        && handle.flags.test(MediaFlag::Secure);

    if handle.engine(MediaType::Audio).codec_params.bound() {
        session.media_descriptions.push(bound_audio_media(
            handle,
            &*cfg,
            port,
            &ip,
            &sr,
            use_cng,
            secure,
            local_audio_crypto.as_deref(),
        ));
    } else if !handle.codecs.is_empty() {
        let cng_type = if use_cng { handle.cng_pt } else { 0 };

        let single_block = handle.flags.test(MediaFlag::Webrtc)
            || cfg.get(vars::SDP_M_PER_PTIME).is_some_and(|v| !crate::config::str_is_true(&v));

        let savp_only = cfg.is_true(vars::SDP_SECURE_SAVP_ONLY);

        let mut emit = |handle: &MediaHandle, session: &mut SessionDescription, cur_ptime: u32| {
            let mut both = !handle.flags.test(MediaFlag::Webrtc);

            if secure {
                session.media_descriptions.push(prefs_audio_media(
                    handle,
                    &*cfg,
                    port,
                    &ip,
                    cur_ptime,
                    &sr,
                    use_cng,
                    cng_type,
                    &fmtp_map,
                    true,
                    local_audio_crypto.as_deref(),
                ));

                if savp_only {
                    both = false;
                }
            } else {
                both = true;
            }

            if both {
                session.media_descriptions.push(prefs_audio_media(
                    handle,
                    &*cfg,
                    port,
                    &ip,
                    cur_ptime,
                    &sr,
                    use_cng,
                    cng_type,
                    &fmtp_map,
                    false,
                    None,
                ));
            }
        };

        if single_block {
            emit(handle, &mut session, 0);
        } else {
            // one audio block per distinct native ptime
            let mut cur_ptime = 0;
            let ptimes: Vec<u32> = handle
                .codecs
                .iter()
                .filter(|c| c.kind == CodecKind::Audio)
                .map(|c| {
                    if c.iananame.eq_ignore_ascii_case("ilbc")
                        || c.iananame.eq_ignore_ascii_case("isac")
                    {
                        20
                    } else {
                        c.ptime
                    }
                })
                .collect();

            for this_ptime in ptimes {
                if cur_ptime != this_ptime {
                    cur_ptime = this_ptime;
                    emit(handle, &mut session, cur_ptime);
                }
            }
        }
    }

    if handle.flags.test(MediaFlag::VideoPossible) {
        let mut local_video_crypto = handle
            .engine(MediaType::Video)
            .ssec
            .local_crypto_line
            .clone();

        if handle.direction == CallDirection::Inbound && handle.flags.test(MediaFlag::Dtls) {
            local_video_crypto = None;
        }

        if handle.engine(MediaType::Video).codec_params.local_port == 0 {
            crate::provision::choose_port(handle, cfg, MediaType::Video, false)?;
        }

        let v_port = handle.engine(MediaType::Video).codec_params.adv_port;

        if v_port != 0 {
            if handle.flags.test(MediaFlag::Ice) {
                gen_ice(handle, MediaType::Video, Some(&ip), v_port);
            }

            let video_secure = (local_video_crypto.is_some()
                || handle.flags.test(MediaFlag::Dtls))
                && handle.flags.test(MediaFlag::Secure);

            session.media_descriptions.push(video_media(
                handle,
                &*cfg,
                v_port,
                &ip,
                video_secure,
                local_video_crypto.as_deref(),
            ));
        }
    }

    let text = session.marshal();
    handle.set_local_sdp(cfg, &text);

    Ok(())
}

/// Generate a description answering a T.38 offer with an image m-line.
pub(crate) fn gen_udptl_image_sdp(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    t38: &T38Options,
) -> Result<(), MediaError> {
    let params = &handle.engine(MediaType::Audio).codec_params;

    let Some(ip) = params.adv_ip.clone() else {
        return Err(MediaError::NotReady);
    };
    let port = params.adv_port;

    if port == 0 {
        return Err(MediaError::NotReady);
    }

    if handle.owner_id == 0 {
        handle.owner_id = 0x5544_3322;
    }
    if handle.session_id == 0 {
        handle.session_id = handle.owner_id;
    }
    handle.session_id = handle.session_id.wrapping_add(1);

    let broken_boolean = cfg.is_true(vars::T38_BROKEN_BOOLEAN);

    let bool_value = |b: bool| -> String {
        if broken_boolean {
            if b { "1" } else { "0" }.to_string()
        } else {
            String::new()
        }
    };

    let mut attributes = vec![
        attr_val("T38FaxVersion", t38.fax_version.to_string()),
        attr_val("T38MaxBitRate", t38.max_bit_rate.to_string()),
    ];

    // broken peers want `:1`, sane ones a bare attribute when asserted
    for (name, on) in [
        ("T38FaxFillBitRemoval", t38.fill_bit_removal),
        ("T38FaxTranscodingMMR", t38.transcoding_mmr),
        ("T38FaxTranscodingJBIG", t38.transcoding_jbig),
    ] {
        if broken_boolean {
            attributes.push(attr_val(name, bool_value(on)));
        } else if on {
            attributes.push(attr(name));
        }
    }

    attributes.push(attr_val("T38FaxRateManagement", t38.rate_management.clone()));
    attributes.push(attr_val("T38FaxMaxBuffer", t38.max_buffer.to_string()));
    attributes.push(attr_val("T38FaxMaxDatagram", t38.max_datagram.to_string()));
    attributes.push(attr_val("T38FaxUdpEC", t38.udp_ec.clone()));

    if let Some(vendor) = &t38.vendor_info {
        attributes.push(attr_val("T38VendorInfo", vendor.clone()));
    }

    let session = SessionDescription {
        version: 0,
        origin: Origin {
            username: handle.params.sdp_username.clone(),
            session_id: u64::from(handle.owner_id),
            session_version: u64::from(handle.session_id),
            network_type: "IN".to_string(),
            address_type: family_of(&ip).to_string(),
            unicast_address: ip.clone(),
        },
        session_name: handle.params.sdp_username.clone(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: family_of(&ip).to_string(),
            address: Some(Address {
                address: ip.clone(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        time_zones: vec![],
        encryption_key: None,
        attributes: vec![],
        media_descriptions: vec![MediaDescription {
            media_name: MediaName {
                media: "image".to_string(),
                port: RangedPort {
                    value: port as isize,
                    range: None,
                },
                protos: vec!["udptl".to_string()],
                formats: vec!["t38".to_string()],
            },
            media_title: None,
            connection_information: None,
            bandwidth: vec![],
            encryption_key: None,
            attributes,
        }],
    };

    let text = session.marshal();
    handle.set_local_sdp(cfg, &text);

    Ok(())
}
