//! Transport provisioning: local port choice (with NAT/STUN rewriting),
//! activation and reconfiguration of the live transports, teardown.

use crate::config::{CallDirection, ConfigView, MediaFlag, vars};
use crate::dtls::DtlsSetup;
use crate::engine::parse_rtp_bugs;
use crate::error::MediaError;
use crate::ice::{COMPONENT_RTCP, COMPONENT_RTP, gen_ice, ip_in_acl};
use crate::secure::apply_crypto;
use crate::transport::{
    Component, JitterBuffer, RtcpInterval, RtpTransport, TransportFlags,
};
use crate::video::VideoWorker;
use crate::{MediaHandle, MediaType};

/// NAT is in play when an external address is configured and the remote is
/// neither loopback nor inside our local network.
pub(crate) fn check_nat(handle: &MediaHandle, remote_ip: &str) -> bool {
    if handle.params.ext_sip_ip.is_none() {
        return false;
    }

    let local_nets = handle.env.local_nets();

    !ip_in_acl("loopback.auto", remote_ip, &[])
        && !ip_in_acl(&handle.params.local_network, remote_ip, &local_nets)
}

/// Resolve the advertised address from an `a.b.c.d`, `host:` or `stun:`
/// specification. Returns the external ip and (possibly rewritten) port.
pub(crate) fn ext_address_lookup(
    handle: &MediaHandle,
    port: u16,
    source: &str,
) -> Result<(String, u16), MediaError> {
    if let Some(host) = source.strip_prefix("host:") {
        let ip = handle
            .env
            .host_lookup(host)
            .map_err(|e| MediaError::ExtAddressLookup(e.to_string()))?;
        return Ok((ip.to_string(), port));
    }

    if let Some(stun) = source.strip_prefix("stun:") {
        let (server, server_port) = match stun.rsplit_once(':') {
            Some((server, p)) if p.parse::<u16>().is_ok() => (server, p.parse().unwrap()),
            _ => (stun, 3478),
        };

        if server.is_empty() {
            return Err(MediaError::ExtAddressLookup("no stun server".into()));
        }

        let (ip, mapped_port) = handle
            .env
            .stun_lookup(server, server_port, port)
            .map_err(|e| MediaError::ExtAddressLookup(e.to_string()))?;

        log::debug!("stun success [{ip}]:[{mapped_port}]");
        return Ok((ip.to_string(), mapped_port));
    }

    Ok((source.to_string(), port))
}

/// Release any previous local port, pick a new one, apply NAT mapping and
/// external-address lookup, and record the advertised endpoint.
pub(crate) fn choose_port(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    media_type: MediaType,
    force: bool,
) -> Result<(), MediaError> {
    if !force
        && (handle.flags.test(MediaFlag::ProxyMode)
            || handle.flags.test(MediaFlag::ProxyMedia)
            || handle.engine(media_type).codec_params.adv_port != 0)
    {
        return Ok(());
    }

    let rtp_ip = handle.params.rtp_ip;

    if handle.engine(media_type).codec_params.local_port != 0 {
        let old = handle.engine(media_type).codec_params.local_port;
        handle.env.release_port(rtp_ip, old);
    }

    let Some(local_port) = handle.env.request_port(rtp_ip) else {
        log::error!("no {media_type:?} RTP ports available");
        return Err(MediaError::PortsExhausted);
    };

    let mut sdp_port = local_port;
    let mut use_ip = rtp_ip.to_string();

    let nat_detected = handle
        .params
        .remote_ip
        .clone()
        .is_some_and(|remote| check_nat(handle, &remote));

    if nat_detected {
        if let Some(external) = handle.env.nat_add_mapping(local_port) {
            sdp_port = external;
        }

        let adv_var = match media_type {
            MediaType::Audio => vars::RTP_ADV_AUDIO_IP,
            MediaType::Video => vars::RTP_ADV_VIDEO_IP,
        };

        let source = cfg.get(adv_var).or_else(|| handle.params.ext_rtp_ip.clone());

        if let Some(source) = source {
            let (ip, port) = ext_address_lookup(handle, sdp_port, &source)?;
            use_ip = ip;
            sdp_port = port;
        }
    }

    let engine = handle.engine_mut(media_type);
    engine.codec_params.local_ip = Some(rtp_ip);
    engine.codec_params.local_port = local_port;
    engine.codec_params.adv_ip = Some(use_ip.clone());
    engine.codec_params.adv_port = sdp_port;

    match media_type {
        MediaType::Audio => {
            cfg.set(vars::LOCAL_MEDIA_IP, &rtp_ip.to_string());
            cfg.set(vars::LOCAL_MEDIA_PORT, &sdp_port.to_string());
            cfg.set(vars::ADVERTISED_MEDIA_IP, &use_ip);
        }
        MediaType::Video => {
            cfg.set(vars::LOCAL_VIDEO_IP, &use_ip);
            cfg.set(vars::LOCAL_VIDEO_PORT, &sdp_port.to_string());
        }
    }

    Ok(())
}

fn transport_flags(handle: &MediaHandle, cfg: &dyn ConfigView) -> TransportFlags {
    let mut flags = TransportFlags::default();

    if !handle.flags.test(MediaFlag::DisableRtpAutoAdjust)
        && !handle.flags.test(MediaFlag::Webrtc)
        && !cfg.is_true(vars::DISABLE_RTP_AUTO_ADJUST)
    {
        flags.auto_adjust = true;
    }

    if handle.flags.test(MediaFlag::Autoflush) || cfg.is_true(vars::RTP_AUTOFLUSH) {
        flags.autoflush = true;
    }

    if !(handle.flags.test(MediaFlag::RewriteTimestamps) || cfg.is_true(vars::RTP_REWRITE_TIMESTAMPS))
    {
        flags.raw_write = true;
    }

    if cfg!(target_endian = "little")
        && handle
            .engine(MediaType::Audio)
            .codec_params
            .iananame
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case("L16"))
        && !cfg.is_true(vars::RTP_DISABLE_BYTESWAP)
    {
        flags.byteswap = true;
    }

    if !handle.flags.test(MediaFlag::SuppressCng) && handle.cng_pt != 0 {
        flags.auto_cng = true;
    }

    let mut vad_in = handle.params.vad_in;
    let mut vad_out = handle.params.vad_out;
    if cfg.is_true(vars::RTP_ENABLE_VAD_IN) {
        vad_in = true;
    }
    if cfg.is_true(vars::RTP_ENABLE_VAD_OUT) {
        vad_out = true;
    }
    if cfg.is_true(vars::RTP_DISABLE_VAD_IN) {
        vad_in = false;
    }
    if cfg.is_true(vars::RTP_DISABLE_VAD_OUT) {
        vad_out = false;
    }

    let inbound = handle.direction == CallDirection::Inbound;
    flags.vad_in = vad_in && inbound;
    flags.vad_out = vad_out && !inbound;

    if handle.flags.test(MediaFlag::ProxyMedia) {
        flags.proxy_media = true;
    }

    flags
}

/// Derive the missed-packet thresholds from the timeout variables.
pub(crate) fn compute_missed_packet_limits(
    handle: &mut MediaHandle,
    cfg: &dyn ConfigView,
    media_type: MediaType,
) {
    let mut timeout_sec = handle.params.rtp_timeout_sec;
    let mut hold_timeout_sec = handle.params.rtp_hold_timeout_sec;

    if let Some(v) = cfg.uint_var(vars::RTP_TIMEOUT_SEC) {
        timeout_sec = v;
    }
    if let Some(v) = cfg.uint_var(vars::RTP_HOLD_TIMEOUT_SEC) {
        hold_timeout_sec = v;
    }

    if timeout_sec != 0 && hold_timeout_sec == 0 {
        hold_timeout_sec = timeout_sec * 10;
    }

    let engine = handle.engine_mut(media_type);
    let ptime = engine.codec_params.ptime.max(1);

    engine.max_missed_packets = timeout_sec * 1000 / ptime;
    engine.max_missed_hold_packets = hold_timeout_sec * 1000 / ptime;

    let max = engine.max_missed_packets;
    if max != 0 {
        if let Some(transport) = &mut engine.transport {
            transport.set_max_missed_packets(max);
        }
    }
}

/// Create or reconfigure the live transports from the negotiated state.
pub(crate) fn activate(handle: &mut MediaHandle, cfg: &mut dyn ConfigView) -> Result<(), MediaError> {
    if cfg.is_true(vars::RTP_SECURE_MEDIA) {
        handle.flags.set(MediaFlag::Secure);
    }

    if handle.flags.test(MediaFlag::ProxyMode) {
        return Ok(());
    }

    if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
        transport.reset_media_timer();
    }

    let reinvite = handle.flags.test(MediaFlag::Reinvite);

    if !reinvite && handle.engine(MediaType::Audio).transport_live() {
        if handle.flags.test(MediaFlag::VideoPossible)
            && !handle.engine(MediaType::Video).transport_live()
        {
            return activate_video(handle, cfg);
        }

        return Ok(());
    }

    if handle.flags.test(MediaFlag::PassRfc2833) || cfg.is_true(vars::PASS_RFC2833) {
        handle.flags.set(MediaFlag::PassRfc2833);
    }

    let flags = transport_flags(handle, &*cfg);

    // re-offer with a live transport: reconfigure instead of rebuilding
    if reinvite && handle.engine(MediaType::Audio).transport_live() {
        reconfigure_audio(handle, cfg)?;
        return activate_video(handle, cfg);
    }

    let engine = handle.engine(MediaType::Audio);
    let params = &engine.codec_params;

    let (Some(local_ip), Some(remote_ip)) = (params.local_ip, params.remote_ip.clone()) else {
        return Err(MediaError::NotReady);
    };

    log::debug!(
        "audio rtp {}:{} -> {}:{} codec {} ms {}",
        local_ip,
        params.local_port,
        remote_ip,
        params.remote_port,
        params.agreed_pt,
        params.ptime
    );

    let ssrc = cfg
        .get(vars::RTP_USE_SSRC)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(engine.ssrc);

    let mut transport = RtpTransport::new(
        MediaType::Audio,
        local_ip,
        params.local_port,
        remote_ip,
        params.remote_port,
        params.agreed_pt,
        ssrc,
        params.rate,
        params.ptime,
        flags,
    );

    cfg.set(vars::RTP_USE_PT, &params.agreed_pt.to_string());
    cfg.set(vars::RTP_USE_SSRC, &ssrc.to_string());

    // per-peer workarounds
    let mut bugs = engine.rtp_bugs;
    if let Some(val) = cfg.get(vars::RTP_MANUAL_RTP_BUGS) {
        parse_rtp_bugs(&mut bugs, &val);
    }
    transport.intentional_bugs(bugs);

    if params.recv_pt != params.agreed_pt {
        log::debug!("set audio receive payload to {}", params.recv_pt);
        transport.set_recv_pt(params.recv_pt);
    } else {
        transport.set_recv_pt(params.agreed_pt);
    }

    if handle.te != 0 {
        transport.set_telephony_event(handle.te);
        cfg.set(vars::RTP_2833_SEND_PAYLOAD, &handle.te.to_string());
    }

    if handle.recv_te != 0 {
        transport.set_telephony_recv_event(handle.recv_te);
        cfg.set(vars::RTP_2833_RECV_PAYLOAD, &handle.recv_te.to_string());
    }

    if handle.flags.test(MediaFlag::SuppressCng) || cfg.is_true(vars::SUPPRESS_CNG) || cfg.is_true(vars::SUPRESS_CNG)
    {
        handle.cng_pt = 0;
    } else if handle.cng_pt != 0 {
        transport.set_cng_pt(handle.cng_pt);
    }

    // publish the negotiated parameters for recovery
    let engine = handle.engine(MediaType::Audio);
    if let Some(name) = engine.codec_params.iananame.clone() {
        cfg.set(vars::RTP_USE_CODEC_NAME, &name);
        cfg.set(vars::RTP_USE_CODEC_RATE, &engine.codec_params.rate.to_string());
        cfg.set(vars::RTP_USE_CODEC_PTIME, &engine.codec_params.ptime.to_string());
        if let Some(fmtp) = engine.codec_params.fmtp_in.clone() {
            cfg.set(vars::RTP_USE_CODEC_FMTP, &fmtp);
        }
    }

    handle.engine_mut(MediaType::Audio).transport = Some(transport);
    attach_audio_ancillaries(handle, cfg)?;

    handle.flags.set(MediaFlag::Running);

    activate_video(handle, cfg)
}

/// Wire ICE, RTCP, DTLS, the jitter buffer, crypto and timeouts into a
/// freshly created audio transport.
fn attach_audio_ancillaries(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
) -> Result<(), MediaError> {
    let direction = handle.direction;

    // ICE
    if handle
        .engine(MediaType::Audio)
        .ice_in
        .component_ready(COMPONENT_RTP)
    {
        gen_ice(handle, MediaType::Audio, None, 0);

        log::info!("activating audio ICE");

        let controlling = direction == CallDirection::Outbound;
        let engine = handle.engine_mut(MediaType::Audio);
        let binding = engine.ice_binding(controlling);
        if let Some(transport) = &mut engine.transport {
            transport.activate_ice(Component::Rtp, binding);
        }
    }

    // RTCP
    let interval_var = cfg
        .get(vars::RTCP_AUDIO_INTERVAL_MSEC)
        .or_else(|| handle.params.rtcp_audio_interval_msec.clone());

    if let Some(val) = interval_var {
        let engine = handle.engine(MediaType::Audio);
        let mut remote_rtcp_port = engine.remote_rtcp_port;
        if remote_rtcp_port == 0 {
            if let Some(port) = cfg.uint_var(vars::RTP_REMOTE_AUDIO_RTCP_PORT) {
                remote_rtcp_port = port as u16;
            }
        }

        let interval = RtcpInterval::parse(&val);
        let mux = engine.rtcp_mux.enabled();

        log::info!("activating rtcp port {remote_rtcp_port}");
        let engine = handle.engine_mut(MediaType::Audio);
        if let Some(transport) = &mut engine.transport {
            transport.activate_rtcp(interval, remote_rtcp_port, mux);
        }

        // RTCP ICE, skipped when its endpoint coincides with RTP's
        let rtcp_ready = engine.ice_in.component_ready(COMPONENT_RTCP);
        if rtcp_ready {
            let same = match (
                engine.ice_in.chosen_candidate(COMPONENT_RTP),
                engine.ice_in.chosen_candidate(COMPONENT_RTCP),
            ) {
                (Some(rtp), Some(rtcp)) => {
                    rtp.con_addr == rtcp.con_addr && rtp.con_port == rtcp.con_port
                }
                _ => false,
            };

            if same {
                log::info!("skipping rtcp ICE (same as rtp)");
            } else {
                log::info!("activating rtcp ICE");
                let controlling = direction == CallDirection::Outbound;
                let binding = engine.ice_binding(controlling);
                if let Some(transport) = &mut engine.transport {
                    transport.activate_ice(Component::Rtcp, binding);
                }
            }
        }
    }

    // DTLS, one context for RTP and one for RTCP unless muxed
    let dtls_wanted = handle.engine(MediaType::Audio).local_dtls_fingerprint.is_set()
        && handle.flags.test(MediaFlag::DtlsOk);

    if dtls_wanted {
        let setup = match direction {
            CallDirection::Outbound => DtlsSetup::Connect,
            CallDirection::Inbound => DtlsSetup::Accept,
        };

        let env = handle.env.clone();
        let engine = handle.engine_mut(MediaType::Audio);
        let remote_fp = engine.remote_dtls_fingerprint.clone();
        let mux = engine.rtcp_mux.enabled();

        if let Some(transport) = &mut engine.transport {
            env.with_ssl_context(|ctx| {
                transport.add_dtls(ctx, &remote_fp, setup, Component::Rtp)?;

                if !mux {
                    transport.add_dtls(ctx, &remote_fp, setup, Component::Rtcp)?;
                }

                Ok::<_, std::io::Error>(())
            })?;
        }
    }

    // SDES keys negotiated earlier go live now
    let secure = handle.flags.test(MediaFlag::Secure);
    let recovering = handle.flags.test(MediaFlag::Recovering);
    if secure {
        let engine = handle.engine_mut(MediaType::Audio);
        apply_crypto(engine, cfg, recovering);
    }

    // jitter buffer
    let jb_spec = cfg
        .get(vars::JITTERBUFFER_MSEC)
        .or_else(|| handle.params.jb_msec.clone());

    if let Some(spec) = jb_spec {
        let frame_ms = handle.engine(MediaType::Audio).codec_params.ptime.max(1);
        if let Some(jb) = JitterBuffer::parse(&spec, frame_ms) {
            if let Some(transport) = &mut handle.engine_mut(MediaType::Audio).transport {
                transport.activate_jitter_buffer(jb);
            }
        }
    }

    compute_missed_packet_limits(handle, &*cfg, MediaType::Audio);

    Ok(())
}

/// Re-offer path with a live transport: only touch what changed.
fn reconfigure_audio(handle: &mut MediaHandle, cfg: &mut dyn ConfigView) -> Result<(), MediaError> {
    let auto_adjust = !handle.flags.test(MediaFlag::DisableRtpAutoAdjust)
        && !cfg.is_true(vars::DISABLE_RTP_AUTO_ADJUST)
        && !handle.flags.test(MediaFlag::Webrtc);

    let engine = handle.engine_mut(MediaType::Audio);
    let params = engine.codec_params.clone();

    let Some(transport) = &mut engine.transport else {
        return Ok(());
    };

    let unchanged = params.remote_ip.as_deref() == Some(transport.remote_host())
        && params.remote_port == transport.remote_port();

    if unchanged {
        log::debug!("audio params are unchanged");

        if params.recv_pt != params.agreed_pt {
            log::debug!(
                "set audio receive payload in re-invite for non-matching dynamic pt to {}",
                params.recv_pt
            );
            transport.set_recv_pt(params.recv_pt);
        } else {
            transport.set_recv_pt(params.agreed_pt);
        }

        return Ok(());
    }

    let remote_ip = params.remote_ip.clone().unwrap_or_default();

    log::debug!(
        "audio rtp changing dest to [{}:{}]",
        remote_ip,
        params.remote_port
    );

    cfg.set(vars::REMOTE_MEDIA_IP, &remote_ip);
    cfg.set(vars::REMOTE_MEDIA_PORT, &params.remote_port.to_string());

    let mut remote_rtcp_port = engine.remote_rtcp_port;
    if remote_rtcp_port == 0 {
        if let Some(port) = cfg.uint_var(vars::RTP_REMOTE_AUDIO_RTCP_PORT) {
            remote_rtcp_port = port as u16;
        }
    }

    let Some(transport) = &mut engine.transport else {
        return Ok(());
    };

    transport.set_remote_address(&remote_ip, params.remote_port, remote_rtcp_port);
    transport.set_default_payload(params.agreed_pt);

    if auto_adjust {
        // reactivate the NAT buster
        transport.set_auto_adjust(true);
    }

    engine.reset_autofix_timing();

    Ok(())
}

/// Bring up (or reconfigure) the video transport if video was negotiated.
fn activate_video(handle: &mut MediaHandle, cfg: &mut dyn ConfigView) -> Result<(), MediaError> {
    if !handle.flags.test(MediaFlag::VideoPossible) {
        return Ok(());
    }

    if !handle.engine(MediaType::Video).codec_params.bound()
        || handle.engine(MediaType::Video).codec_params.remote_port == 0
    {
        return Ok(());
    }

    if handle.engine(MediaType::Video).transport_live() {
        let engine = handle.engine_mut(MediaType::Video);
        let params = engine.codec_params.clone();
        if let Some(transport) = &mut engine.transport {
            if params.remote_ip.as_deref() != Some(transport.remote_host())
                || params.remote_port != transport.remote_port()
            {
                let remote_ip = params.remote_ip.clone().unwrap_or_default();
                transport.set_remote_address(&remote_ip, params.remote_port, 0);
                cfg.set(vars::REMOTE_VIDEO_IP, &remote_ip);
                cfg.set(vars::REMOTE_VIDEO_PORT, &params.remote_port.to_string());
            }
        }
        return Ok(());
    }

    if handle.engine(MediaType::Video).codec_params.local_port == 0 {
        choose_port(handle, cfg, MediaType::Video, false)?;
    }

    let flags = transport_flags(handle, &*cfg);
    let engine = handle.engine(MediaType::Video);
    let params = &engine.codec_params;

    let (Some(local_ip), Some(remote_ip)) = (params.local_ip, params.remote_ip.clone()) else {
        return Ok(());
    };

    log::debug!(
        "video rtp {}:{} -> {}:{} codec {}",
        local_ip,
        params.local_port,
        remote_ip,
        params.remote_port,
        params.agreed_pt
    );

    let mut transport = RtpTransport::new(
        MediaType::Video,
        local_ip,
        params.local_port,
        remote_ip,
        params.remote_port,
        params.agreed_pt,
        engine.ssrc,
        params.rate,
        params.ptime,
        flags,
    );

    let mut bugs = engine.rtp_bugs;
    if let Some(val) = cfg.get(vars::RTP_MANUAL_VIDEO_RTP_BUGS) {
        parse_rtp_bugs(&mut bugs, &val);
    }
    transport.intentional_bugs(bugs);
    transport.set_recv_pt(params.recv_pt);

    cfg.set(vars::RTP_USE_VIDEO_PT, &params.agreed_pt.to_string());
    if let Some(name) = params.iananame.clone() {
        cfg.set(vars::RTP_USE_VIDEO_CODEC_NAME, &name);
        cfg.set(vars::RTP_USE_VIDEO_CODEC_RATE, &params.rate.to_string());
        cfg.set(vars::RTP_USE_VIDEO_CODEC_PTIME, &params.ptime.to_string());
        if let Some(fmtp) = params.fmtp_in.clone() {
            cfg.set(vars::RTP_USE_VIDEO_CODEC_FMTP, &fmtp);
        }
    }

    handle.engine_mut(MediaType::Video).transport = Some(transport);

    // video RTCP
    let interval_var = cfg
        .get(vars::RTCP_VIDEO_INTERVAL_MSEC)
        .or_else(|| handle.params.rtcp_video_interval_msec.clone());

    if let Some(val) = interval_var {
        let engine = handle.engine_mut(MediaType::Video);
        let remote_rtcp_port = engine.remote_rtcp_port;
        let interval = RtcpInterval::parse(&val);
        let mux = engine.rtcp_mux.enabled();

        if let Some(transport) = &mut engine.transport {
            transport.activate_rtcp(interval, remote_rtcp_port, mux);
        }
    }

    // video ICE
    if handle
        .engine(MediaType::Video)
        .ice_in
        .component_ready(COMPONENT_RTP)
    {
        gen_ice(handle, MediaType::Video, None, 0);

        let controlling = handle.direction == CallDirection::Outbound;
        let engine = handle.engine_mut(MediaType::Video);
        let binding = engine.ice_binding(controlling);
        if let Some(transport) = &mut engine.transport {
            transport.activate_ice(Component::Rtp, binding);
        }
    }

    // crypto
    let secure = handle.flags.test(MediaFlag::Secure);
    let recovering = handle.flags.test(MediaFlag::Recovering);
    if secure {
        let engine = handle.engine_mut(MediaType::Video);
        apply_crypto(engine, cfg, recovering);
    }

    // echo worker, looping frames back until the leg gets bridged
    if handle.engine(MediaType::Video).video_worker.is_none() {
        let worker = VideoWorker::spawn(|_frame| {
            // frames are echoed through the transport by the host's write path
        });
        handle.engine_mut(MediaType::Video).video_worker = Some(worker);
        handle.flags.set(MediaFlag::VideoEcho);
    }

    Ok(())
}

/// Publish the transport counters into the variable store.
pub(crate) fn publish_stats(handle: &MediaHandle, cfg: &mut dyn ConfigView) {
    for (media_type, prefix) in [(MediaType::Audio, "audio"), (MediaType::Video, "video")] {
        let Some(transport) = &handle.engine(media_type).transport else {
            continue;
        };

        let stats = transport.stats();
        cfg.set(&format!("rtp_{prefix}_in_packet_count"), &stats.in_packets.to_string());
        cfg.set(&format!("rtp_{prefix}_in_media_bytes"), &stats.in_octets.to_string());
        cfg.set(&format!("rtp_{prefix}_out_packet_count"), &stats.out_packets.to_string());
        cfg.set(&format!("rtp_{prefix}_out_media_bytes"), &stats.out_octets.to_string());
    }
}

/// Tear down both transports: stop the video worker, destroy the RTP
/// sessions, release ports and drop NAT mappings.
pub(crate) fn deactivate(handle: &mut MediaHandle, cfg: &mut dyn ConfigView) {
    publish_stats(handle, cfg);

    handle.flags.clear(MediaFlag::VideoPassive);
    if let Some(mut worker) = handle.engine_mut(MediaType::Video).video_worker.take() {
        worker.stop();
    }

    let nat_active = handle
        .params
        .remote_ip
        .clone()
        .is_some_and(|remote| check_nat(handle, &remote));

    let rtp_ip = handle.params.rtp_ip;

    for media_type in [MediaType::Video, MediaType::Audio] {
        let engine = handle.engine_mut(media_type);
        let local_port = engine.codec_params.local_port;

        engine.transport = None;

        if local_port != 0 {
            handle.env.release_port(rtp_ip, local_port);

            if nat_active {
                handle.env.nat_del_mapping(local_port);
                handle.env.nat_del_mapping(local_port + 1);
            }
        }
    }

    handle.flags.clear(MediaFlag::Running);
}

/// Switch the audio stream into UDPTL framing for T.38.
pub(crate) fn udptl_mode(handle: &mut MediaHandle) -> Result<(), MediaError> {
    let engine = handle.engine_mut(MediaType::Audio);

    let Some(transport) = &mut engine.transport else {
        return Err(MediaError::NotReady);
    };

    log::debug!("switching audio stream to UDPTL mode");
    transport.set_udptl_mode();

    Ok(())
}

/// Update the remote endpoints from a proxied SDP without renegotiating.
///
/// When the audio endpoint is unchanged this returns early without looking
/// at video; the next pass will pick a video change up.
pub(crate) fn proxy_remote_addr(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
    session: &sdp::SessionDescription,
) -> Result<bool, MediaError> {
    let mut audio_target: Option<(String, u16)> = None;
    let mut video_target: Option<(String, u16)> = None;

    for m in &session.media_descriptions {
        let addr = m
            .connection_information
            .as_ref()
            .or(session.connection_information.as_ref())
            .and_then(|c| c.address.as_ref())
            .map(|a| a.address.clone());

        let Some(addr) = addr else { continue };
        let port = m.media_name.port.value as u16;

        match m.media_name.media.as_str() {
            "audio" if audio_target.is_none() => audio_target = Some((addr, port)),
            "image" if port != 0 => audio_target = Some((addr, port)),
            "video" if video_target.is_none() => video_target = Some((addr, port)),
            _ => {}
        }
    }

    let Some((audio_ip, audio_port)) = audio_target else {
        return Err(MediaError::RemoteAddress("no audio media in sdp".into()));
    };

    let engine = handle.engine_mut(MediaType::Audio);

    let unchanged = engine
        .transport
        .as_ref()
        .is_some_and(|t| t.remote_host() == audio_ip && t.remote_port() == audio_port);

    if unchanged {
        return Ok(false);
    }

    engine.codec_params.remote_ip = Some(audio_ip.clone());
    engine.codec_params.remote_port = audio_port;

    if let Some(transport) = &mut engine.transport {
        transport.set_remote_address(&audio_ip, audio_port, 0);
    }

    cfg.set(vars::REMOTE_MEDIA_IP, &audio_ip);
    cfg.set(vars::REMOTE_MEDIA_PORT, &audio_port.to_string());

    if let Some((video_ip, video_port)) = video_target {
        let engine = handle.engine_mut(MediaType::Video);

        engine.codec_params.remote_ip = Some(video_ip.clone());
        engine.codec_params.remote_port = video_port;

        if let Some(transport) = &mut engine.transport {
            transport.set_remote_address(&video_ip, video_port, 0);
        }

        cfg.set(vars::REMOTE_VIDEO_IP, &video_ip);
        cfg.set(vars::REMOTE_VIDEO_PORT, &video_port.to_string());
    }

    Ok(true)
}
