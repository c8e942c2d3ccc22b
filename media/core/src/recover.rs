//! Session recovery: rebuild engine state from the channel variables a
//! previous incarnation published, then re-provision.

use crate::config::{ConfigView, MediaFlag, vars};
use crate::error::MediaError;
use crate::{MediaHandle, MediaType};

/// Reconstruct the negotiated state of a recovered call leg.
pub(crate) fn recover_session(
    handle: &mut MediaHandle,
    cfg: &mut dyn ConfigView,
) -> Result<(), MediaError> {
    let (Some(ip), Some(port)) = (cfg.get(vars::LOCAL_MEDIA_IP), cfg.get(vars::LOCAL_MEDIA_PORT))
    else {
        return Err(MediaError::NotReady);
    };

    if handle.flags.test(MediaFlag::ProxyMode) {
        return Ok(());
    }

    handle.flags.set(MediaFlag::Recovering);

    let a_ip = cfg.get(vars::ADVERTISED_MEDIA_IP);
    let r_ip = cfg.get(vars::REMOTE_MEDIA_IP);
    let r_port = cfg.get(vars::REMOTE_MEDIA_PORT);

    {
        let engine = handle.engine_mut(MediaType::Audio);
        let params = &mut engine.codec_params;

        params.iananame = cfg.get(vars::RTP_USE_CODEC_NAME);
        params.encoding = params.iananame.clone();
        params.fmtp_in = cfg.get(vars::RTP_USE_CODEC_FMTP);

        if let Some(rate) = cfg.uint_var(vars::RTP_USE_CODEC_RATE) {
            params.rate = rate;
        }

        if let Some(ptime) = cfg.uint_var(vars::RTP_USE_CODEC_PTIME) {
            params.ptime = ptime;
        }

        if let Some(pt) = cfg.uint_var(vars::RTP_USE_PT) {
            params.pt = pt as u8;
            params.agreed_pt = pt as u8;
        }

        if let Some(pt) = cfg.uint_var(vars::RTP_AUDIO_RECV_PT) {
            params.recv_pt = pt as u8;
        }

        params.local_port = port.parse().unwrap_or(0);
        params.adv_port = params.local_port;
        params.local_ip = ip.parse().ok();
        params.adv_ip = a_ip.or_else(|| Some(ip.clone()));

        if let (Some(r_ip), Some(r_port)) = (r_ip, r_port) {
            params.remote_ip = Some(r_ip);
            params.remote_port = r_port.parse().unwrap_or(0);
        }
    }

    if let Some(te) = cfg.uint_var(vars::RTP_2833_SEND_PAYLOAD) {
        handle.te = te as u8;
    }

    if let Some(te) = cfg.uint_var(vars::RTP_2833_RECV_PAYLOAD) {
        handle.recv_te = te as u8;
    }

    // restore the last SRTP key and tag
    let (key_var, tag_var) = (
        vars::SRTP_REMOTE_AUDIO_CRYPTO_KEY,
        vars::SRTP_REMOTE_AUDIO_CRYPTO_TAG,
    );

    if let Some(key) = cfg.get(key_var) {
        let tag = cfg.uint_var(tag_var).unwrap_or(1);

        let engine = handle.engine_mut(MediaType::Audio);
        engine.ssec.remote_crypto_line = Some(key);
        engine.ssec.crypto_tag = tag;

        handle.flags.set(MediaFlag::Secure);
    }

    // the last local key travels as its full crypto line
    if let Some(line) = cfg.get(vars::RTP_LAST_AUDIO_LOCAL_CRYPTO_KEY) {
        let engine = handle.engine_mut(MediaType::Audio);
        if crate::secure::add_crypto(&mut engine.ssec, &line, crate::secure::CryptoDirection::Send) {
            engine.ssec.crypto_type = engine.ssec.crypto_send_type;
            engine.ssec.local_crypto_line = Some(line);
        }
    }

    // video side, when the call had it
    if cfg.get(vars::RTP_USE_VIDEO_CODEC_NAME).is_some() {
        handle.flags.set(MediaFlag::VideoPossible);

        let v_ip = cfg.get(vars::LOCAL_VIDEO_IP);
        let v_port = cfg.get(vars::LOCAL_VIDEO_PORT);
        let vr_ip = cfg.get(vars::REMOTE_VIDEO_IP);
        let vr_port = cfg.get(vars::REMOTE_VIDEO_PORT);

        let engine = handle.engine_mut(MediaType::Video);
        let params = &mut engine.codec_params;

        params.iananame = cfg.get(vars::RTP_USE_VIDEO_CODEC_NAME);
        params.encoding = params.iananame.clone();
        params.fmtp_in = cfg.get(vars::RTP_USE_VIDEO_CODEC_FMTP);

        if let Some(rate) = cfg.uint_var(vars::RTP_USE_VIDEO_CODEC_RATE) {
            params.rate = rate;
        }

        if let Some(pt) = cfg.uint_var(vars::RTP_USE_VIDEO_PT) {
            params.pt = pt as u8;
            params.agreed_pt = pt as u8;
        }

        if let Some(pt) = cfg.uint_var(vars::RTP_VIDEO_RECV_PT) {
            params.recv_pt = pt as u8;
        }

        if let (Some(v_ip), Some(v_port)) = (v_ip, v_port) {
            params.adv_ip = Some(v_ip);
            params.local_port = v_port.parse().unwrap_or(0);
            params.adv_port = params.local_port;
        }

        if let (Some(vr_ip), Some(vr_port)) = (vr_ip, vr_port) {
            params.remote_ip = Some(vr_ip);
            params.remote_port = vr_port.parse().unwrap_or(0);
        }
    }

    handle.generate_local_sdp(cfg, None, 0, None, true)?;
    crate::provision::activate(handle, cfg)?;

    handle.flags.clear(MediaFlag::Recovering);

    Ok(())
}
