//! The offer/answer engine: consume a parsed session description, drive the
//! codec, security and ICE negotiators and commit the outcome into the
//! engines.

use crate::codec::{CodecImpl, CodecKind};
use crate::config::{
    CallDirection, CodecPolicy, ConfigView, DtmfType, MediaFlag, SdpKind, vars,
};
use crate::engine::RtpBugFlags;
use crate::ice::check_ice;
use crate::secure::{check_incoming_crypto, CRYPTO_KEY_80};
use crate::t38::{process_t38_passthru, process_udptl};
use crate::{MediaHandle, MediaType};
use sdp::SessionDescription;
use sdp::description::media::MediaDescription;

/// Outcome of one negotiation pass.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationResult {
    /// At least one media line was matched.
    pub matched: bool,
    /// Whether signaling should keep processing (T.38 re-offers clear it).
    pub proceed: bool,
}

/// One rtpmap entry, explicit or synthesized for a well-known static PT.
#[derive(Debug, Clone)]
pub(crate) struct Rtpmap {
    pub pt: u8,
    pub encoding: String,
    pub rate: u32,
    /// Channel count parameter when present (`opus/48000/2`).
    pub params: Option<String>,
}

/// Parse an `a=rtpmap` value: `<pt> <encoding>/<rate>[/<params>]`.
pub(crate) fn parse_rtpmap(value: &str) -> Option<Rtpmap> {
    let (pt, rest) = value.trim().split_once(' ')?;
    let pt: u8 = pt.trim().parse().ok()?;

    let mut parts = rest.trim().split('/');
    let encoding = parts.next()?.to_string();
    let rate: u32 = parts.next()?.trim().parse().ok()?;
    let params = parts.next().map(str::to_string);

    Some(Rtpmap {
        pt,
        encoding,
        rate,
        params,
    })
}

/// Well-known static payload types, used when the peer lists a format
/// without a matching rtpmap.
fn static_rtpmap(pt: u8) -> Option<Rtpmap> {
    let (encoding, rate) = match pt {
        0 => ("PCMU", 8000),
        3 => ("GSM", 8000),
        4 => ("G723", 8000),
        8 => ("PCMA", 8000),
        9 => ("G722", 8000),
        13 => ("CN", 8000),
        18 => ("G729", 8000),
        _ => return None,
    };

    Some(Rtpmap {
        pt,
        encoding: encoding.to_string(),
        rate,
        params: None,
    })
}

/// All rtpmaps of one media section, in format-list order, with synthesized
/// entries for bare static payload types.
pub(crate) fn rtpmaps_of(m: &MediaDescription) -> Vec<Rtpmap> {
    let explicit: Vec<Rtpmap> = m
        .attributes
        .iter()
        .filter(|a| a.key.eq_ignore_ascii_case("rtpmap"))
        .filter_map(|a| a.value.as_deref().and_then(parse_rtpmap))
        .collect();

    let mut maps = Vec::new();

    for format in &m.media_name.formats {
        let Ok(pt) = format.parse::<u8>() else {
            continue;
        };

        if let Some(map) = explicit.iter().find(|r| r.pt == pt) {
            maps.push(map.clone());
        } else if let Some(map) = static_rtpmap(pt) {
            maps.push(map);
        } else if pt < 96 {
            // match-by-number candidates with no known name
            maps.push(Rtpmap {
                pt,
                encoding: String::new(),
                rate: 0,
                params: None,
            });
        }
    }

    maps
}

pub(crate) fn fmtp_of(m: &MediaDescription, pt: u8) -> Option<String> {
    m.attributes
        .iter()
        .filter(|a| a.key.eq_ignore_ascii_case("fmtp"))
        .filter_map(|a| a.value.as_deref())
        .find_map(|v| {
            let (fmt, params) = v.trim().split_once(' ')?;
            (fmt.trim().parse::<u8>().ok()? == pt).then(|| params.to_string())
        })
}

fn effective_connection_address(
    session: &SessionDescription,
    m: Option<&MediaDescription>,
) -> Option<String> {
    m.and_then(|m| m.connection_information.as_ref())
        .or(session.connection_information.as_ref())
        .and_then(|c| c.address.as_ref())
        .map(|a| a.address.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaProto {
    Rtp,
    Srtp,
    /// RTP/SAVPF or UDP/TLS/RTP/SAVPF: WebRTC-style, forces ICE and DTLS.
    ExtendedSrtp,
    Udptl,
    Other,
}

fn classify_proto(m: &MediaDescription) -> MediaProto {
    let joined = m.media_name.protos.join("/");

    if joined.eq_ignore_ascii_case("RTP/SAVPF") || joined.eq_ignore_ascii_case("UDP/TLS/RTP/SAVPF")
    {
        MediaProto::ExtendedSrtp
    } else if joined.eq_ignore_ascii_case("RTP/SAVP")
        || joined.eq_ignore_ascii_case("UDP/TLS/RTP/SAVP")
    {
        MediaProto::Srtp
    } else if joined.eq_ignore_ascii_case("RTP/AVP") || joined.eq_ignore_ascii_case("RTP/AVPF") {
        MediaProto::Rtp
    } else if joined.eq_ignore_ascii_case("udptl") {
        MediaProto::Udptl
    } else {
        MediaProto::Other
    }
}

/// Bitrate conventionally implied by a static payload type.
fn known_bitrate(pt: u8) -> u32 {
    match pt {
        0 | 8 | 9 => 64_000,
        3 => 13_200,
        4 => 6_300,
        18 => 8_000,
        _ => 0,
    }
}

/// Conventional default packetization when the offer names none.
fn default_ptime(encoding: &str) -> u32 {
    if encoding.eq_ignore_ascii_case("g723")
        || encoding.eq_ignore_ascii_case("ilbc")
        || encoding.eq_ignore_ascii_case("isac")
    {
        30
    } else {
        20
    }
}

/// Interpret codec specific fmtp: returns (bitrate, ptime_ms) overrides.
fn parse_codec_fmtp(encoding: &str, fmtp: &str) -> (Option<u32>, Option<u32>) {
    let mut bitrate = None;
    let mut ptime = None;

    for param in fmtp.split(';') {
        let param = param.trim();
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();

        if key.eq_ignore_ascii_case("mode") && encoding.eq_ignore_ascii_case("ilbc") {
            match value.parse::<u32>() {
                Ok(20) => {
                    ptime = Some(20);
                    bitrate = Some(15_200);
                }
                Ok(30) => {
                    ptime = Some(30);
                    bitrate = Some(13_330);
                }
                _ => {}
            }
        } else if key.eq_ignore_ascii_case("bitrate") {
            bitrate = value.parse().ok();
        } else if key.eq_ignore_ascii_case("ptime") {
            ptime = value.parse().ok();
        }
    }

    (bitrate, ptime)
}

struct SessionLevel {
    sendonly: i32,
    recvonly: bool,
    dptime: u32,
    dmaxptime: u32,
}

fn scan_session_level(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &SessionDescription,
) -> SessionLevel {
    let mut out = SessionLevel {
        sendonly: 0,
        recvonly: false,
        dptime: 0,
        dmaxptime: 0,
    };

    // a sendonly/inactive first media line or a 0.0.0.0 connection wins
    // over everything at the media level
    if let Some(first) = session.media_descriptions.first() {
        let held_direction = first.has_attribute("sendonly") || first.has_attribute("inactive");
        let null_address = effective_connection_address(session, Some(first))
            .is_some_and(|a| a == "0.0.0.0");

        if held_direction || null_address {
            out.sendonly = 2;
        }
    }

    for attr in &session.attributes {
        if attr.key.eq_ignore_ascii_case("sendonly") {
            out.sendonly = out.sendonly.max(1);
            cfg.set(vars::MEDIA_AUDIO_MODE, "recvonly");
        } else if attr.key.eq_ignore_ascii_case("inactive") {
            out.sendonly = out.sendonly.max(1);
            cfg.set(vars::MEDIA_AUDIO_MODE, "inactive");
        } else if attr.key.eq_ignore_ascii_case("recvonly") {
            cfg.set(vars::MEDIA_AUDIO_MODE, "sendonly");
            out.recvonly = true;

            let engine = handle.engine_mut(MediaType::Audio);
            if let Some(transport) = &mut engine.transport {
                transport.set_max_missed_packets(0);
                engine.max_missed_packets = 0;
                engine.max_missed_hold_packets = 0;
            } else {
                cfg.set(vars::RTP_TIMEOUT_SEC, "0");
                cfg.set(vars::RTP_HOLD_TIMEOUT_SEC, "0");
            }
        } else if out.sendonly < 2 && attr.key.eq_ignore_ascii_case("sendrecv") {
            out.sendonly = 0;
        } else if attr.key.eq_ignore_ascii_case("ptime") {
            out.dptime = attr
                .value
                .as_deref()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
        } else if attr.key.eq_ignore_ascii_case("maxptime") {
            out.dmaxptime = attr
                .value
                .as_deref()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
        }
    }

    if out.sendonly != 1 && !out.recvonly {
        cfg.unset(vars::MEDIA_AUDIO_MODE);
    }

    out
}

fn scan_buggy_origin(handle: &mut MediaHandle, session: &SessionDescription) {
    let origin = session.origin.username.clone();
    handle.remote_origin = Some(origin.clone());

    let auto = handle.auto_rtp_bugs;
    let audio = handle.engine_mut(MediaType::Audio);

    if auto.contains(RtpBugFlags::CISCO_SKIP_MARK_BIT_2833)
        && origin.contains("CiscoSystemsSIP-GW-UserAgent")
    {
        audio.rtp_bugs.insert(RtpBugFlags::CISCO_SKIP_MARK_BIT_2833);
        log::debug!("activating buggy RFC2833 mode for cisco gateway");
    }

    if auto.contains(RtpBugFlags::SONUS_SEND_INVALID_TIMESTAMP_2833) && origin.contains("Sonus_UAC")
    {
        audio
            .rtp_bugs
            .insert(RtpBugFlags::SONUS_SEND_INVALID_TIMESTAMP_2833);
        log::warn!("peer is a Sonus, enabling invalid RFC2833 timestamp workaround");
    }
}

/// Record remote zrtp-hash attributes on the engines and publish them.
fn find_zrtp_hash(handle: &mut MediaHandle, cfg: &mut dyn ConfigView, session: &SessionDescription) {
    let scan = |attrs: &[sdp::description::common::Attribute]| {
        attrs
            .iter()
            .find(|a| a.key.eq_ignore_ascii_case("zrtp-hash"))
            .and_then(|a| a.value.clone())
    };

    for m in &session.media_descriptions {
        let media_type = match m.media_name.media.as_str() {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            _ => continue,
        };

        if let Some(hash) = scan(&m.attributes).or_else(|| scan(&session.attributes)) {
            let var = match media_type {
                MediaType::Audio => vars::R_SDP_AUDIO_ZRTP_HASH,
                MediaType::Video => vars::R_SDP_VIDEO_ZRTP_HASH,
            };
            cfg.set(var, &hash);
            handle.engine_mut(media_type).remote_zrtp_hash = Some(hash);
        }
    }
}

struct AudioMatchState {
    got_audio: bool,
    got_crypto: bool,
    best_te: Option<u8>,
    cng_pt: Option<u8>,
    matched: bool,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn negotiate_sdp(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &SessionDescription,
    sdp_kind: SdpKind,
) -> NegotiationResult {
    let mut matched = false;
    let mut proceed = true;

    if handle.flags.test(MediaFlag::DtlsOk) && cfg.is_false(vars::WEBRTC_ENABLE_DTLS) {
        handle.flags.clear(MediaFlag::DtlsOk);
        handle.flags.clear(MediaFlag::Dtls);
    }

    let mut policy = if handle.flags.test(MediaFlag::CodecScrooge) {
        CodecPolicy::Scrooge
    } else if handle.flags.test(MediaFlag::CodecGreedy) {
        CodecPolicy::Greedy
    } else {
        CodecPolicy::Generous
    };

    if let Some(val) = cfg.get(vars::RTP_CODEC_NEGOTIATION) {
        match CodecPolicy::parse(&val) {
            Some(p) => {
                log::debug!("rtp_codec_negotiation overriding profile codec policy: {val}");
                policy = p;
            }
            None => log::debug!("rtp_codec_negotiation ignored invalid value: {val:?}"),
        }
    }

    scan_buggy_origin(handle, session);

    if cfg.is_true(vars::RTP_LIBERAL_DTMF) {
        handle.flags.set(MediaFlag::LiberalDtmf);
    }

    // one hold evaluation per incoming description
    handle.hold_laps = 0;

    let level = scan_session_level(handle, cfg, session);
    let mut sendonly = level.sendonly;

    // hold detection and the conditional re-negotiation that goes with it
    let mut reneg = true;
    if handle.flags.test(MediaFlag::DisableHold) || cfg.is_true(vars::RTP_DISABLE_HOLD) {
        sendonly = 0;
    } else if handle.hold_laps == 0 {
        handle.hold_laps += 1;
        if crate::hold::toggle_hold(handle, cfg, sendonly != 0) {
            reneg = handle.flags.test(MediaFlag::RenegOnHold);
            if let Some(v) = cfg.bool_var(vars::RTP_RENEG_ON_HOLD) {
                reneg = v;
            }
        }
    }

    if reneg {
        reneg = handle.flags.test(MediaFlag::RenegOnReinvite);
        if let Some(v) = cfg.bool_var(vars::RTP_RENEG_ON_REINVITE) {
            reneg = v;
        }
    }

    let codec_array: Vec<CodecImpl> = if !reneg && !handle.negotiated_codecs.is_empty() {
        handle.negotiated_codecs.clone()
    } else {
        if reneg {
            handle.prepare_codecs(cfg, true);
        }
        handle.codecs.clone()
    };

    // quirk detection: peers that send T.38 booleans with explicit values
    let t38_broken = session.media_descriptions.iter().any(|m| {
        m.attributes.iter().any(|a| {
            matches!(
                a.key.as_str(),
                "T38FaxFillBitRemoval" | "T38FaxTranscodingMMR" | "T38FaxTranscodingJBIG"
            ) && a.value.as_deref().is_some_and(|v| !v.is_empty())
        })
    });
    if t38_broken {
        cfg.set(vars::T38_BROKEN_BOOLEAN, "true");
    }

    find_zrtp_hash(handle, cfg, session);

    check_ice(handle, cfg, MediaType::Audio, session, None);
    check_ice(handle, cfg, MediaType::Video, session, None);

    let mut got_audio = false;
    let mut got_avp = 0;
    let mut got_video_avp = 0;
    let mut got_webrtc = 0;

    for m in &session.media_descriptions {
        let proto = classify_proto(m);
        let port = m.media_name.port.value as u16;

        if proto == MediaProto::ExtendedSrtp {
            got_webrtc += 1;
            handle.set_ice_mode();
        }

        if m.media_name.protos.join("/").eq_ignore_ascii_case("UDP/TLS/RTP/SAVPF") {
            handle.flags.set(MediaFlag::WebrtcMoz);
        }

        let is_video = m.media_name.media == "video";
        match proto {
            MediaProto::Rtp if is_video => got_video_avp += 1,
            MediaProto::Rtp => got_avp += 1,
            _ => {}
        }

        if proto == MediaProto::Udptl && m.media_name.media == "image" && port != 0 {
            let t38 = process_udptl(handle, cfg, session, m);

            if handle.flags.test(MediaFlag::T38Negotiated) {
                matched = true;
                break;
            }

            if cfg.is_true(vars::REFUSE_T38) {
                handle.flags.clear(MediaFlag::T38);
                matched = false;
                break;
            }

            let mut pass = match cfg.get(vars::T38_PASSTHRU) {
                Some(v) if v.eq_ignore_ascii_case("once") => 2,
                Some(v) => i32::from(crate::config::str_is_true(&v)),
                None => i32::from(handle.flags.test(MediaFlag::T38Passthru)),
            };

            if handle.flags.test(MediaFlag::T38) {
                proceed = false;
            }

            if (pass == 2 && handle.flags.test(MediaFlag::T38Passthru))
                || !handle.flags.test(MediaFlag::Reinvite)
                || handle.flags.test(MediaFlag::ProxyMode)
                || handle.flags.test(MediaFlag::ProxyMedia)
                || !handle.engine(MediaType::Audio).transport_live()
            {
                pass = 0;
            }

            if pass != 0 {
                if !handle.partner_answered {
                    log::warn!("cannot pass T.38 to an unanswered partner leg");
                    matched = false;
                    break;
                }

                if cfg.is_true(vars::T38_BROKEN_BOOLEAN) && cfg.is_true(vars::T38_PASS_BROKEN_BOOLEAN)
                {
                    // the generator re-emits the boolean options the broken way
                    cfg.set(vars::T38_BROKEN_BOOLEAN, "true");
                }

                let remote_sdp = session.marshal();
                process_t38_passthru(handle, cfg, &t38, &remote_sdp);
            }

            // the fax application will trigger the response
            matched = true;
            break;
        } else if m.media_name.media == "audio" && port != 0 && !got_audio {
            let mut ptime = level.dptime;
            let mut maxptime = level.dmaxptime;

            for attr in &m.attributes {
                if attr.key.eq_ignore_ascii_case("ptime") {
                    ptime = attr
                        .value
                        .as_deref()
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(ptime);
                } else if attr.key.eq_ignore_ascii_case("maxptime") {
                    maxptime = attr
                        .value
                        .as_deref()
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(maxptime);
                }
            }

            let state = negotiate_audio_media(
                handle,
                cfg,
                session,
                m,
                proto,
                got_webrtc > 0,
                got_avp,
                sdp_kind,
                policy,
                &codec_array,
                ptime,
                maxptime,
            );

            let Some(state) = state else {
                matched = false;
                break;
            };

            got_audio = state.got_audio;
            matched = state.matched || matched;

            commit_dtmf(handle, cfg, state.best_te);

            // only a comfort noise payload the peer listed survives
            handle.cng_pt = if handle.flags.test(MediaFlag::SuppressCng) {
                0
            } else {
                state.cng_pt.unwrap_or(0)
            };
        } else if m.media_name.media == "video" && port != 0 {
            let vmatched = negotiate_video_media(
                handle,
                cfg,
                session,
                m,
                proto,
                got_webrtc > 0,
                got_video_avp,
                sdp_kind,
                &codec_array,
            );
            matched = matched || vmatched;
        }
    }

    if handle.flags.test(MediaFlag::SuppressCng) {
        handle.cng_pt = 0;
    }

    NegotiationResult { matched, proceed }
}

/// Negotiate one audio m-line. Returns `None` when the line is fatally
/// unacceptable (bad crypto placement, missing connection line).
#[allow(clippy::too_many_arguments)]
fn negotiate_audio_media(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &SessionDescription,
    m: &MediaDescription,
    proto: MediaProto,
    got_webrtc: bool,
    got_avp: i32,
    sdp_kind: SdpKind,
    policy: CodecPolicy,
    codec_array: &[CodecImpl],
    ptime: u32,
    maxptime: u32,
) -> Option<AudioMatchState> {
    let mut state = AudioMatchState {
        got_audio: false,
        got_crypto: false,
        best_te: None,
        cng_pt: None,
        matched: false,
    };

    let webrtc = handle.flags.test(MediaFlag::Webrtc);
    let dtls_ok = handle.flags.test(MediaFlag::DtlsOk);

    // a fingerprint satisfies the "got crypto" requirement when DTLS is available
    if dtls_ok {
        state.got_crypto = m.attributes.iter().any(|a| {
            a.key.eq_ignore_ascii_case("fingerprint")
                && a.value.as_deref().is_some_and(|v| !v.is_empty())
        });
    }

    for attr in &m.attributes {
        let value = attr.value.as_deref().unwrap_or("");

        if attr.key.eq_ignore_ascii_case("rtcp") && !value.is_empty() {
            if let Some(port) = value.split_whitespace().next().and_then(|p| p.parse().ok()) {
                cfg.set(vars::RTP_REMOTE_AUDIO_RTCP_PORT, value);
                handle.engine_mut(MediaType::Audio).remote_rtcp_port = port;
            }
        } else if !state.got_crypto
            && attr.key.eq_ignore_ascii_case("crypto")
            && !value.is_empty()
            && (!webrtc || value.contains(CRYPTO_KEY_80))
        {
            if !handle.flags.test(MediaFlag::AllowCryptoInAvp)
                && !cfg.is_true(vars::RTP_ALLOW_CRYPTO_IN_AVP)
                && proto == MediaProto::Rtp
                && !got_webrtc
            {
                log::error!("a=crypto in RTP/AVP, refer to rfc3711");
                return None;
            }

            let crypto_tag: u32 = value
                .split_whitespace()
                .next()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);

            let disable_auth = handle.flags.test(MediaFlag::DisableSrtpAuth);
            let engine = handle.engine_mut(MediaType::Audio);
            state.got_crypto = check_incoming_crypto(
                engine,
                cfg,
                vars::RTP_HAS_CRYPTO,
                value,
                crypto_tag,
                sdp_kind,
                disable_auth,
            );
        }
    }

    if state.got_crypto && got_avp == 0 {
        cfg.set(vars::RTP_CRYPTO_MANDATORY, "true");
        cfg.set(vars::RTP_SECURE_MEDIA, "true");
    }

    // a SAVP line without any usable key material cannot be answered
    if proto == MediaProto::Srtp
        && !state.got_crypto
        && handle
            .engine(MediaType::Audio)
            .ssec
            .remote_crypto_line
            .is_none()
    {
        log::error!("no usable crypto attribute in a SAVP media line");
        return None;
    }

    let Some(connection_addr) = effective_connection_address(session, Some(m)) else {
        log::error!("cannot find a c= line in the sdp at media or session level");
        return None;
    };

    let maps = rtpmaps_of(m);

    // stickiness: when the already bound codec and remote endpoint still
    // match the offer, keep everything as is
    let liberal =
        handle.flags.test(MediaFlag::LiberalDtmf) || cfg.is_true(vars::RTP_LIBERAL_DTMF);
    let allow_bad_name = handle.flags.test(MediaFlag::AllowBadIananame);

    {
        let engine = handle.engine(MediaType::Audio);

        if engine.codec_params.bound() && !liberal {
            let (remote_host, remote_port) = match &engine.transport {
                Some(t) => (Some(t.remote_host().to_string()), t.remote_port()),
                None => (
                    engine.codec_params.remote_ip.clone(),
                    engine.codec_params.remote_port,
                ),
            };

            let mut same = false;
            for map in &maps {
                let name_matches = if (map.encoding.is_empty() || allow_bad_name) && map.pt < 96 {
                    map.pt == engine.codec_params.pt
                } else {
                    engine
                        .codec_params
                        .iananame
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&map.encoding))
                };

                if name_matches
                    && remote_host.as_deref() == Some(connection_addr.as_str())
                    && m.media_name.port.value as u16 == remote_port
                {
                    same = true;
                } else {
                    same = false;
                    break;
                }
            }

            if same {
                log::debug!(
                    "our existing sdp is still good [{} {}:{}], keeping it",
                    engine.codec_params.encoding.as_deref().unwrap_or(""),
                    connection_addr,
                    remote_port
                );
                state.got_audio = true;
                state.matched = true;
            }
        }
    }

    // telephone-event / CN scan
    let engine_rate = handle.engine(MediaType::Audio).codec_params.rate;
    for map in &maps {
        if map.encoding.eq_ignore_ascii_case("telephone-event")
            && (state.best_te.is_none() || map.rate == engine_rate)
        {
            state.best_te = Some(map.pt);
        }

        if !handle.flags.test(MediaFlag::SuppressCng)
            && state.cng_pt.is_none()
            && map.encoding.eq_ignore_ascii_case("CN")
        {
            state.cng_pt = Some(map.pt);
            if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                log::debug!("set comfort noise payload to {}", map.pt);
                transport.set_cng_pt(map.pt);
            }
        }
    }

    if !state.got_audio {
        let env = handle.env.clone();
        if let Some(choice) = select_audio_codec(
            policy,
            codec_array,
            &maps,
            m,
            ptime,
            maxptime,
            allow_bad_name,
            &*cfg,
            &env,
        ) {
            commit_audio_codec(handle, cfg, m, &connection_addr, &choice);
            state.matched = true;
            state.got_audio = true;
            check_ice(handle, cfg, MediaType::Audio, session, Some(m));
        }
    } else {
        check_ice(handle, cfg, MediaType::Audio, session, Some(m));
    }

    // liberal DTMF asserts our configured payload even when absent
    if state.best_te.is_none() && liberal {
        log::debug!(
            "no 2833 in SDP, liberal DTMF mode adding {} as telephone-event",
            handle.te
        );
        state.best_te = Some(handle.te);
    }

    Some(state)
}

/// The codec selector outcome.
struct CodecChoice {
    imp: CodecImpl,
    map: Rtpmap,
    fmtp: Option<String>,
}

/// Intersect the remote rtpmaps with the local preference list.
#[allow(clippy::too_many_arguments)]
fn select_audio_codec(
    policy: CodecPolicy,
    codec_array: &[CodecImpl],
    maps: &[Rtpmap],
    m: &MediaDescription,
    ptime: u32,
    maxptime: u32,
    allow_bad_name: bool,
    cfg: &dyn ConfigView,
    env: &crate::env::MediaEnvironment,
) -> Option<CodecChoice> {
    let greedy = policy != CodecPolicy::Generous;
    let scrooge = policy == CodecPolicy::Scrooge;

    let audio_codecs: Vec<&CodecImpl> = codec_array
        .iter()
        .filter(|c| c.kind == CodecKind::Audio && !c.iananame.eq_ignore_ascii_case("telephone-event") && !c.iananame.eq_ignore_ascii_case("CN"))
        .collect();

    let mut near_match: Option<(&CodecImpl, Rtpmap, u32, u32)> = None;

    // `mine` walks the local list outermost in greedy mode; in generous mode
    // every local codec is compared per remote entry, peer order deciding
    let mut mine = 0;

    loop {
        let mut found: Option<CodecChoice> = None;

        for map in maps {
            if map.encoding.eq_ignore_ascii_case("telephone-event")
                || map.encoding.eq_ignore_ascii_case("CN")
            {
                continue;
            }

            let (first, last) = if greedy {
                (mine, mine + 1)
            } else {
                (0, audio_codecs.len())
            };

            let mut codec_ms = ptime;
            if maxptime != 0 && (codec_ms == 0 || codec_ms > maxptime) {
                codec_ms = maxptime;
            }
            if codec_ms == 0 {
                codec_ms = default_ptime(&map.encoding);
            }

            let mut map_bit_rate = known_bitrate(map.pt);

            if ptime == 0 && map.encoding.eq_ignore_ascii_case("g723") {
                codec_ms = 30;
            }

            let fmtp = fmtp_of(m, map.pt);
            match fmtp.as_deref() {
                None | Some("") => {
                    if map.encoding.eq_ignore_ascii_case("ilbc") {
                        codec_ms = 30;
                        map_bit_rate = 13_330;
                    } else if map.encoding.eq_ignore_ascii_case("isac") {
                        codec_ms = 30;
                        map_bit_rate = 32_000;
                    }
                }
                Some(fmtp_str) => {
                    let (bitrate, fmtp_ptime) = parse_codec_fmtp(&map.encoding, fmtp_str);
                    if let Some(bitrate) = bitrate {
                        map_bit_rate = bitrate;
                    }
                    if let Some(fmtp_ptime) = fmtp_ptime {
                        codec_ms = fmtp_ptime;
                    }
                }
            }

            for imp in audio_codecs.iter().take(last).skip(first) {
                let bit_rate = imp.bitrate;
                let codec_rate = imp.rate;

                log::debug!(
                    "audio codec compare [{}:{}:{}:{}:{}]/[{}:{}:{}:{}]",
                    map.encoding,
                    map.pt,
                    map.rate,
                    codec_ms,
                    map_bit_rate,
                    imp.iananame,
                    codec_rate,
                    imp.ptime,
                    bit_rate
                );

                let mut is_match = if (map.encoding.is_empty() || allow_bad_name) && map.pt < 96 {
                    Some(map.pt) == imp.ianacode
                } else {
                    map.encoding.eq_ignore_ascii_case(&imp.iananame) && map.rate == codec_rate
                };

                if is_match
                    && bit_rate != 0
                    && map_bit_rate != 0
                    && map_bit_rate != bit_rate
                    && !map.encoding.eq_ignore_ascii_case("ilbc")
                    && !map.encoding.eq_ignore_ascii_case("isac")
                {
                    // a specified, mismatched bitrate disqualifies (except
                    // iLBC/iSAC whose bitrate travels in fmtp)
                    is_match = false;
                }

                if is_match
                    && map.rate != 0
                    && map.rate != codec_rate
                    && (map.encoding.eq_ignore_ascii_case("pcma")
                        || map.encoding.eq_ignore_ascii_case("pcmu"))
                {
                    log::debug!("sampling rates have to match for G.711");
                    is_match = false;
                }

                if is_match {
                    if scrooge {
                        log::debug!(
                            "bah humbug! sticking with {}@{}h@{}i",
                            imp.iananame,
                            imp.rate,
                            imp.ptime
                        );
                    } else if near_match.is_none()
                        && ((ptime != 0 && codec_ms != 0 && codec_ms != imp.ptime)
                            || map.rate != codec_rate)
                    {
                        near_match = Some((*imp, map.clone(), map.rate, codec_ms));

                        if cfg.is_true(vars::RTP_NEGOTIATE_NEAR_MATCH) {
                            break;
                        }

                        continue;
                    }

                    found = Some(CodecChoice {
                        imp: (*imp).clone(),
                        map: map.clone(),
                        fmtp: fmtp.clone(),
                    });
                    break;
                }
            }

            if found.is_some() {
                break;
            }
        }

        if found.is_some() {
            return found;
        }

        // near-match salvage: probe the registry for a synthetic
        // implementation at the peer's ptime/rate
        if let Some((imp, map, near_rate, codec_ms)) = &near_match {
            let pref = crate::config::CodecPref {
                name: imp.iananame.clone(),
                rate: Some(if *near_rate != 0 { *near_rate } else { imp.rate }),
                ptime: Some(*codec_ms),
                bitrate: None,
            };

            let synthesized = env.resolve_codec(&pref, CodecKind::Audio);
            let chosen = synthesized.unwrap_or_else(|| (*imp).clone());

            if maxptime == 0 || chosen.ptime <= maxptime {
                log::debug!(
                    "substituting codec {}@{}i@{}h",
                    chosen.iananame,
                    chosen.ptime,
                    chosen.rate
                );

                return Some(CodecChoice {
                    imp: chosen,
                    map: map.clone(),
                    fmtp: fmtp_of(m, map.pt),
                });
            }
        }

        if greedy && mine + 1 < audio_codecs.len() {
            mine += 1;
            near_match = None;
            continue;
        }

        return None;
    }
}

/// Write the selected codec into the audio engine.
fn commit_audio_codec(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    m: &MediaDescription,
    connection_addr: &str,
    choice: &CodecChoice,
) {
    let mirror = cfg.is_true(vars::RTP_MIRROR_REMOTE_AUDIO_CODEC_PAYLOAD);
    let outbound = handle.direction == CallDirection::Outbound;
    let reinvite = handle.flags.test(MediaFlag::Reinvite);
    let reneg_on_reinvite = handle.flags.test(MediaFlag::RenegOnReinvite);
    let offered_pt = handle.get_offered_pt(&choice.imp.iananame);

    let engine = handle.engine_mut(MediaType::Audio);
    let params = &mut engine.codec_params;

    params.encoding = Some(choice.map.encoding.clone());
    params.iananame = Some(choice.imp.iananame.clone());
    params.pt = choice.map.pt;
    params.rate = choice.imp.rate;
    params.ptime = choice.imp.ptime;
    params.bitrate = choice.imp.bitrate;
    params.channels = choice
        .map
        .params
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);

    if choice.map.encoding.eq_ignore_ascii_case("opus") {
        // opus advertises two channels no matter what it actually decodes
        params.adv_channels = 2;
        params.channels = match &choice.fmtp {
            Some(fmtp) if fmtp.to_ascii_lowercase().contains("stereo=1") => 2,
            _ => 1,
        };
    } else {
        params.adv_channels = params.channels;
    }

    params.remote_ip = Some(connection_addr.to_string());
    params.remote_port = m.media_name.port.value as u16;
    params.fmtp_in = choice.fmtp.clone();
    params.agreed_pt = choice.map.pt;
    params.recv_pt = choice.map.pt;

    // asymmetric receive payload for outbound calls unless mirroring
    if !mirror && outbound && (!reinvite || reneg_on_reinvite) {
        if let Some(offered) = offered_pt {
            params.recv_pt = offered;
        }
    }

    cfg.set(vars::REMOTE_MEDIA_IP, connection_addr);
    cfg.set(vars::REMOTE_MEDIA_PORT, &params.remote_port.to_string());
    cfg.set(vars::RTP_AUDIO_RECV_PT, &params.recv_pt.to_string());

    handle.negotiated_codecs.clear();
    handle.negotiated_codecs.push(choice.imp.clone());
}

/// Bind the negotiated telephone-event payload (or fall back to INFO).
fn commit_dtmf(handle: &mut MediaHandle, cfg: &mut dyn ConfigView, best_te: Option<u8>) {
    match best_te {
        Some(te) => {
            if handle.direction == CallDirection::Outbound {
                handle.te = te;
                log::debug!("set 2833 dtmf send payload to {te}");
            } else {
                handle.te = te;
                handle.recv_te = te;
                log::debug!("set 2833 dtmf send/recv payload to {te}");
            }

            cfg.set(vars::DTMF_TYPE, "rfc2833");
            handle.dtmf_type = DtmfType::Rfc2833;

            let recv_te = handle.recv_te;
            let direction = handle.direction;
            if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                transport.set_telephony_event(te);
                cfg.set(vars::RTP_2833_SEND_PAYLOAD, &te.to_string());

                if direction == CallDirection::Inbound {
                    transport.set_telephony_recv_event(recv_te);
                    cfg.set(vars::RTP_2833_RECV_PAYLOAD, &recv_te.to_string());
                }
            }
        }
        None => {
            // by default fall back to SIP INFO when 2833 is absent
            if !cfg.is_false(vars::RTP_INFO_WHEN_NO_2833) {
                log::debug!("no 2833 in SDP, disabling 2833 dtmf and switching to INFO");
                cfg.set(vars::DTMF_TYPE, "info");
                handle.dtmf_type = DtmfType::Info;
            } else {
                cfg.set(vars::DTMF_TYPE, "none");
                handle.dtmf_type = DtmfType::None;
            }

            handle.te = 0;
            handle.recv_te = 0;
        }
    }
}

/// Negotiate one video m-line.
#[allow(clippy::too_many_arguments)]
fn negotiate_video_media(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &SessionDescription,
    m: &MediaDescription,
    proto: MediaProto,
    got_webrtc: bool,
    got_video_avp: i32,
    sdp_kind: SdpKind,
    codec_array: &[CodecImpl],
) -> bool {
    cfg.set(vars::VIDEO_POSSIBLE, "true");
    handle.flags.set(MediaFlag::VideoPossible);

    let Some(connection_addr) = effective_connection_address(session, Some(m)) else {
        log::error!("cannot find a c= line for the video media");
        return false;
    };

    let webrtc = handle.flags.test(MediaFlag::Webrtc);

    for attr in &m.attributes {
        let value = attr.value.as_deref().unwrap_or("");

        if attr.key.eq_ignore_ascii_case("rtcp") && !value.is_empty() {
            if let Some(port) = value.split_whitespace().next().and_then(|p| p.parse().ok()) {
                cfg.set(vars::RTP_REMOTE_VIDEO_RTCP_PORT, value);
                handle.engine_mut(MediaType::Video).remote_rtcp_port = port;
            }
        } else if attr.key.eq_ignore_ascii_case("crypto")
            && !value.is_empty()
            && (!webrtc || value.contains(CRYPTO_KEY_80))
        {
            if !handle.flags.test(MediaFlag::AllowCryptoInAvp)
                && !cfg.is_true(vars::RTP_ALLOW_CRYPTO_IN_AVP)
                && proto == MediaProto::Rtp
                && !got_webrtc
            {
                log::error!("a=crypto in RTP/AVP, refer to rfc3711");
                return false;
            }

            let crypto_tag: u32 = value
                .split_whitespace()
                .next()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);

            let disable_auth = handle.flags.test(MediaFlag::DisableSrtpAuth);
            let engine = handle.engine_mut(MediaType::Video);
            check_incoming_crypto(
                engine,
                cfg,
                vars::RTP_HAS_CRYPTO,
                value,
                crypto_tag,
                sdp_kind,
                disable_auth,
            );
        }
    }

    let allow_bad_name = handle.flags.test(MediaFlag::AllowBadIananame);
    let maps = rtpmaps_of(m);

    let video_codecs: Vec<&CodecImpl> = codec_array
        .iter()
        .filter(|c| c.kind == CodecKind::Video)
        .collect();

    for map in &maps {
        for imp in &video_codecs {
            let name_match = if (map.encoding.is_empty() || allow_bad_name) && map.pt < 96 {
                Some(map.pt) == imp.ianacode
            } else {
                map.encoding.eq_ignore_ascii_case(&imp.iananame) && map.rate == imp.rate
            };

            if !name_match {
                continue;
            }

            let imp = (*imp).clone();
            let engine = handle.engine_mut(MediaType::Video);
            let params = &mut engine.codec_params;

            params.encoding = Some(map.encoding.clone());
            params.iananame = Some(imp.iananame.clone());
            params.pt = map.pt;
            params.rate = map.rate;
            params.channels = 1;
            params.adv_channels = 1;
            params.remote_ip = Some(connection_addr.clone());
            params.remote_port = m.media_name.port.value as u16;
            params.fmtp_in = fmtp_of(m, map.pt);
            params.agreed_pt = map.pt;
            params.recv_pt = map.pt;

            cfg.set(vars::REMOTE_VIDEO_IP, &connection_addr);
            cfg.set(vars::REMOTE_VIDEO_PORT, &params.remote_port.to_string());
            cfg.set(vars::RTP_VIDEO_RECV_PT, &map.pt.to_string());

            check_ice(handle, cfg, MediaType::Video, session, Some(m));

            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtpmap_parsing() {
        let map = parse_rtpmap("0 PCMU/8000").unwrap();
        assert_eq!(map.pt, 0);
        assert_eq!(map.encoding, "PCMU");
        assert_eq!(map.rate, 8000);
        assert_eq!(map.params, None);

        let map = parse_rtpmap("111 opus/48000/2").unwrap();
        assert_eq!(map.pt, 111);
        assert_eq!(map.params.as_deref(), Some("2"));

        assert!(parse_rtpmap("garbage").is_none());
    }

    #[test]
    fn codec_fmtp_interpretation() {
        assert_eq!(parse_codec_fmtp("iLBC", "mode=30"), (Some(13_330), Some(30)));
        assert_eq!(parse_codec_fmtp("iLBC", "mode=20"), (Some(15_200), Some(20)));
        assert_eq!(parse_codec_fmtp("foo", "bitrate=32000"), (Some(32_000), None));
        assert_eq!(parse_codec_fmtp("foo", "junk"), (None, None));
    }

    #[test]
    fn known_static_bitrates() {
        assert_eq!(known_bitrate(0), 64_000);
        assert_eq!(known_bitrate(18), 8_000);
        assert_eq!(known_bitrate(96), 0);
    }
}
