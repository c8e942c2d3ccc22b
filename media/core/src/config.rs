//! Channel configuration: the flat variable store contract, media flags and
//! profile parameters.
//!
//! The signaling layer owns a string keyed variable store per channel. The
//! core reads and writes it exclusively through [`ConfigView`], and every key
//! it touches is a named constant in [`vars`] so no ad-hoc literals leak into
//! the negotiation code.

use std::collections::HashMap;

/// Variable keys used by the core.
pub mod vars {
    // Cryptography state exchange
    pub const RTP_SECURE_MEDIA: &str = "rtp_secure_media";
    pub const RTP_SECURE_AUDIO_CONFIRMED: &str = "rtp_secure_audio_confirmed";
    pub const RTP_SECURE_VIDEO_CONFIRMED: &str = "rtp_secure_video_confirmed";
    pub const SRTP_REMOTE_AUDIO_CRYPTO_KEY: &str = "srtp_remote_audio_crypto_key";
    pub const SRTP_REMOTE_AUDIO_CRYPTO_TAG: &str = "srtp_remote_audio_crypto_tag";
    pub const SRTP_REMOTE_VIDEO_CRYPTO_KEY: &str = "srtp_remote_video_crypto_key";
    pub const SRTP_REMOTE_VIDEO_CRYPTO_TAG: &str = "srtp_remote_video_crypto_tag";
    pub const RTP_HAS_CRYPTO: &str = "rtp_has_crypto";
    pub const RTP_CRYPTO_MANDATORY: &str = "rtp_crypto_mandatory";
    pub const RTP_ALLOW_CRYPTO_IN_AVP: &str = "rtp_allow_crypto_in_avp";
    pub const RTP_LAST_AUDIO_LOCAL_CRYPTO_KEY: &str = "rtp_last_audio_local_crypto_key";
    pub const RTP_LAST_VIDEO_LOCAL_CRYPTO_KEY: &str = "rtp_last_video_local_crypto_key";

    // Transport tuning
    pub const RTP_REMOTE_AUDIO_RTCP_PORT: &str = "rtp_remote_audio_rtcp_port";
    pub const RTP_REMOTE_VIDEO_RTCP_PORT: &str = "rtp_remote_video_rtcp_port";
    pub const RTP_TIMEOUT_SEC: &str = "rtp_timeout_sec";
    pub const RTP_HOLD_TIMEOUT_SEC: &str = "rtp_hold_timeout_sec";
    pub const RTCP_AUDIO_INTERVAL_MSEC: &str = "rtcp_audio_interval_msec";
    pub const RTCP_VIDEO_INTERVAL_MSEC: &str = "rtcp_video_interval_msec";

    // Behavior toggles
    pub const RTP_MANUAL_RTP_BUGS: &str = "rtp_manual_rtp_bugs";
    pub const RTP_MANUAL_VIDEO_RTP_BUGS: &str = "rtp_manual_video_rtp_bugs";
    pub const RTP_DISABLE_BYTESWAP: &str = "rtp_disable_byteswap";
    pub const RTP_AUTOFLUSH: &str = "rtp_autoflush";
    pub const RTP_REWRITE_TIMESTAMPS: &str = "rtp_rewrite_timestamps";
    pub const PASS_RFC2833: &str = "pass_rfc2833";
    pub const RTP_LIBERAL_DTMF: &str = "rtp_liberal_dtmf";
    pub const RTP_DISABLE_HOLD: &str = "rtp_disable_hold";
    pub const RTP_RENEG_ON_HOLD: &str = "rtp_renegotiate_codec_on_hold";
    pub const RTP_RENEG_ON_REINVITE: &str = "rtp_renegotiate_codec_on_reinvite";
    pub const RTP_MIRROR_REMOTE_AUDIO_CODEC_PAYLOAD: &str = "rtp_mirror_remote_audio_codec_payload";
    pub const RTP_NEGOTIATE_NEAR_MATCH: &str = "rtp_negotiate_near_match";
    pub const RTP_INFO_WHEN_NO_2833: &str = "rtp_info_when_no_2833";
    pub const DTMF_TYPE: &str = "dtmf_type";
    pub const JITTERBUFFER_MSEC: &str = "jitterbuffer_msec";
    pub const RTP_JITTER_BUFFER_PLC: &str = "rtp_jitter_buffer_plc";
    pub const DISABLE_RTP_AUTO_ADJUST: &str = "disable_rtp_auto_adjust";
    pub const RTP_ENABLE_VAD_IN: &str = "rtp_enable_vad_in";
    pub const RTP_ENABLE_VAD_OUT: &str = "rtp_enable_vad_out";
    pub const RTP_DISABLE_VAD_IN: &str = "rtp_disable_vad_in";
    pub const RTP_DISABLE_VAD_OUT: &str = "rtp_disable_vad_out";
    pub const RTP_USE_SSRC: &str = "rtp_use_ssrc";
    pub const SUPPRESS_CNG: &str = "suppress_cng";
    /// Historical misspelling, honored alongside [`SUPPRESS_CNG`].
    pub const SUPRESS_CNG: &str = "supress_cng";
    pub const VERBOSE_SDP: &str = "verbose_sdp";
    pub const SDP_SECURE_SAVP_ONLY: &str = "sdp_secure_savp_only";
    pub const SDP_M_PER_PTIME: &str = "sdp_m_per_ptime";
    pub const WEBRTC_ENABLE_DTLS: &str = "webrtc_enable_dtls";
    pub const MEDIA_WEBRTC: &str = "media_webrtc";
    pub const RTP_USE_DTLS: &str = "rtp_use_dtls";
    pub const HOLD_MUSIC: &str = "hold_music";
    pub const PRESENCE_CALL_INFO: &str = "presence_call_info";
    pub const EXECUTE_ON_MEDIA_TIMEOUT: &str = "execute_on_media_timeout";
    pub const VIDEO_POSSIBLE: &str = "video_possible";
    pub const RTP_VIDEO_MAX_BANDWIDTH: &str = "rtp_video_max_bandwidth";
    pub const RTP_JITTER_BUFFER_DURING_BRIDGE: &str = "rtp_jitter_buffer_during_bridge";
    pub const NDLB_ASTERISK_MISSING_SRTP_AUTH: &str = "NDLB_support_asterisk_missing_srtp_auth";

    // Codec selection policy
    pub const CODEC_STRING: &str = "codec_string";
    pub const ABSOLUTE_CODEC_STRING: &str = "absolute_codec_string";
    pub const RTP_CODEC_NEGOTIATION: &str = "rtp_codec_negotiation";
    pub const RTP_FORCE_AUDIO_FMTP: &str = "rtp_force_audio_fmtp";
    pub const RTP_FORCE_VIDEO_FMTP: &str = "rtp_force_video_fmtp";
    pub const RTP_VIDEO_FMTP: &str = "rtp_video_fmtp";
    /// The partner leg's SDP, used as an fmtp override source.
    pub const SWITCH_M_SDP: &str = "switch_m_sdp";

    // Negotiation results published to signaling
    pub const RTP_LOCAL_SDP_STR: &str = "rtp_local_sdp_str";
    pub const MEDIA_AUDIO_MODE: &str = "media_audio_mode";
    pub const L_SDP_AUDIO_ZRTP_HASH: &str = "l_sdp_audio_zrtp_hash";
    pub const L_SDP_VIDEO_ZRTP_HASH: &str = "l_sdp_video_zrtp_hash";
    pub const R_SDP_AUDIO_ZRTP_HASH: &str = "r_sdp_audio_zrtp_hash";
    pub const R_SDP_VIDEO_ZRTP_HASH: &str = "r_sdp_video_zrtp_hash";
    pub const HAS_T38: &str = "has_t38";
    pub const T38_PASSTHRU: &str = "t38_passthru";
    pub const REFUSE_T38: &str = "refuse_t38";
    pub const T38_BROKEN_BOOLEAN: &str = "t38_broken_boolean";
    pub const T38_PASS_BROKEN_BOOLEAN: &str = "t38_pass_broken_boolean";
    pub const BROKEN_PTIME_HEADER: &str = "rtp_h_X-Broken-PTIME";

    // Endpoint publication
    pub const LOCAL_MEDIA_IP: &str = "local_media_ip";
    pub const LOCAL_MEDIA_PORT: &str = "local_media_port";
    pub const REMOTE_MEDIA_IP: &str = "remote_media_ip";
    pub const REMOTE_MEDIA_PORT: &str = "remote_media_port";
    pub const ADVERTISED_MEDIA_IP: &str = "advertised_media_ip";
    pub const LOCAL_VIDEO_IP: &str = "local_video_ip";
    pub const LOCAL_VIDEO_PORT: &str = "local_video_port";
    pub const REMOTE_VIDEO_IP: &str = "remote_video_ip";
    pub const REMOTE_VIDEO_PORT: &str = "remote_video_port";
    pub const RTP_ADV_AUDIO_IP: &str = "rtp_adv_audio_ip";
    pub const RTP_ADV_VIDEO_IP: &str = "rtp_adv_video_ip";

    // Recovery
    pub const RTP_USE_CODEC_NAME: &str = "rtp_use_codec_name";
    pub const RTP_USE_CODEC_RATE: &str = "rtp_use_codec_rate";
    pub const RTP_USE_CODEC_PTIME: &str = "rtp_use_codec_ptime";
    pub const RTP_USE_CODEC_FMTP: &str = "rtp_use_codec_fmtp";
    pub const RTP_USE_PT: &str = "rtp_use_pt";
    pub const RTP_AUDIO_RECV_PT: &str = "rtp_audio_recv_pt";
    pub const RTP_2833_SEND_PAYLOAD: &str = "rtp_2833_send_payload";
    pub const RTP_2833_RECV_PAYLOAD: &str = "rtp_2833_recv_payload";
    pub const RTP_USE_VIDEO_CODEC_NAME: &str = "rtp_use_video_codec_name";
    pub const RTP_USE_VIDEO_CODEC_RATE: &str = "rtp_use_video_codec_rate";
    pub const RTP_USE_VIDEO_CODEC_PTIME: &str = "rtp_use_video_codec_ptime";
    pub const RTP_USE_VIDEO_CODEC_FMTP: &str = "rtp_use_video_codec_fmtp";
    pub const RTP_USE_VIDEO_PT: &str = "rtp_use_video_pt";
    pub const RTP_VIDEO_RECV_PT: &str = "rtp_video_recv_pt";
}

/// Truthiness of a bare string value, the way channel variables are read.
pub fn str_is_true(val: &str) -> bool {
    matches!(
        val.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "enabled" | "1" | "t"
    )
}

/// Read/write access to the owning channel's variable store.
pub trait ConfigView {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn unset(&mut self, key: &str);

    /// Truthiness of a variable, `None` when unset.
    fn bool_var(&self, key: &str) -> Option<bool> {
        self.get(key).map(|val| str_is_true(&val))
    }

    /// Variable is set and truthy.
    fn is_true(&self, key: &str) -> bool {
        self.bool_var(key) == Some(true)
    }

    /// Variable is set and explicitly falsy.
    fn is_false(&self, key: &str) -> bool {
        self.bool_var(key) == Some(false)
    }

    fn uint_var(&self, key: &str) -> Option<u32> {
        self.get(key)?.trim().parse().ok()
    }
}

/// In-memory variable store.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    vars: HashMap<String, String>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl ConfigView for MemoryConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.into(), value.into());
    }

    fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Which side of the offer/answer exchange the incoming description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// The peer sent an offer, we will answer.
    Offer,
    /// The peer answered our offer.
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtmfType {
    #[default]
    Rfc2833,
    Info,
    None,
}

/// Behavior flags carried on the media handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaFlag {
    Running,
    JitterBufferPaused,
    LiberalDtmf,
    DisableHold,
    RenegOnHold,
    RenegOnReinvite,
    AutofixTiming,
    SuppressCng,
    CodecGreedy,
    CodecScrooge,
    DisableRtpAutoAdjust,
    Autoflush,
    PassRfc2833,
    RewriteTimestamps,
    AllowBadIananame,
    AllowCryptoInAvp,
    DisableSrtpAuth,
    VerboseSdp,
    Reinvite,
    Answered,
    Secure,
    DtlsOk,
    Dtls,
    Ice,
    Webrtc,
    WebrtcMoz,
    ProxyMode,
    ProxyMedia,
    ProtoHold,
    Hold,
    HoldLock,
    T38,
    T38Negotiated,
    T38Passthru,
    VideoPossible,
    VideoEcho,
    VideoPassive,
    Recovering,
    SecureMediaConfirmed,
}

/// Small fixed bitset over [`MediaFlag`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MediaFlags {
    bits: u64,
}

impl MediaFlags {
    pub fn test(&self, flag: MediaFlag) -> bool {
        self.bits & (1 << flag as u64) != 0
    }

    pub fn set(&mut self, flag: MediaFlag) {
        self.bits |= 1 << flag as u64;
    }

    pub fn clear(&mut self, flag: MediaFlag) {
        self.bits &= !(1 << flag as u64);
    }

    pub fn put(&mut self, flag: MediaFlag, on: bool) {
        if on {
            self.set(flag);
        } else {
            self.clear(flag);
        }
    }
}

/// Codec negotiation policy, see the selector for the exact semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecPolicy {
    /// Peer-ordered first local match.
    #[default]
    Generous,
    /// Walk the local preference list outermost.
    Greedy,
    /// Greedy and never substitute near-matches.
    Scrooge,
}

impl CodecPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("generous") {
            Some(CodecPolicy::Generous)
        } else if s.eq_ignore_ascii_case("greedy") {
            Some(CodecPolicy::Greedy)
        } else if s.eq_ignore_ascii_case("scrooge") {
            Some(CodecPolicy::Scrooge)
        } else {
            None
        }
    }
}

/// One entry of a codec preference string.
///
/// The accepted syntax per entry is `NAME[@RATEh][@PTIMEi][@BITRATEb]`,
/// e.g. `PCMU@20i`, `opus@48000h@20i`, `iLBC@30i@13330b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPref {
    pub name: String,
    pub rate: Option<u32>,
    pub ptime: Option<u32>,
    pub bitrate: Option<u32>,
}

impl CodecPref {
    pub fn named(name: &str) -> Self {
        CodecPref {
            name: name.to_string(),
            rate: None,
            ptime: None,
            bitrate: None,
        }
    }
}

/// Parse a comma separated codec preference string.
///
/// Unparsable modifiers are skipped, empty entries are dropped.
pub fn parse_codec_string(s: &str) -> Vec<CodecPref> {
    let mut out = Vec::new();

    for entry in s.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.split('@');
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };

        let mut pref = CodecPref {
            name,
            rate: None,
            ptime: None,
            bitrate: None,
        };

        for modifier in parts {
            let Some(suffix) = modifier.chars().last() else {
                continue;
            };

            let Ok(num) = modifier[..modifier.len() - 1].parse::<u32>() else {
                log::debug!("ignoring unparsable codec modifier {modifier:?}");
                continue;
            };

            match suffix.to_ascii_lowercase() {
                'h' => pref.rate = Some(num),
                'i' => pref.ptime = Some(num),
                'b' => pref.bitrate = Some(num),
                _ => log::debug!("ignoring unknown codec modifier {modifier:?}"),
            }
        }

        out.push(pref);
    }

    out
}

/// Profile-level parameters the handle is created with.
#[derive(Debug, Clone)]
pub struct MediaParams {
    /// Local RTP bind address.
    pub rtp_ip: std::net::IpAddr,
    /// External RTP address, `a.b.c.d`, `host:<name>` or `stun:<host>[:port]`.
    pub ext_rtp_ip: Option<String>,
    /// External SIP address; presence of this enables NAT detection.
    pub ext_sip_ip: Option<String>,
    /// ACL describing the local network for NAT detection.
    pub local_network: String,
    /// Username for the SDP origin line.
    pub sdp_username: String,
    /// Remote signaling address, used for NAT detection.
    pub remote_ip: Option<String>,
    /// Telephone-event payload type.
    pub te: u8,
    /// Receive side telephone-event payload type.
    pub recv_te: u8,
    /// Comfort noise payload type, 0 disables.
    pub cng_pt: u8,
    pub dtmf_type: DtmfType,
    pub inbound_codec_string: String,
    pub outbound_codec_string: String,
    pub rtcp_audio_interval_msec: Option<String>,
    pub rtcp_video_interval_msec: Option<String>,
    pub jb_msec: Option<String>,
    pub rtp_timeout_sec: u32,
    pub rtp_hold_timeout_sec: u32,
    pub vad_in: bool,
    pub vad_out: bool,
}

impl Default for MediaParams {
    fn default() -> Self {
        MediaParams {
            rtp_ip: std::net::Ipv4Addr::LOCALHOST.into(),
            ext_rtp_ip: None,
            ext_sip_ip: None,
            local_network: "localnet.auto".into(),
            sdp_username: "tandem".into(),
            remote_ip: None,
            te: 101,
            recv_te: 101,
            cng_pt: 13,
            dtmf_type: DtmfType::Rfc2833,
            inbound_codec_string: "PCMU,PCMA".into(),
            outbound_codec_string: "PCMU,PCMA".into(),
            rtcp_audio_interval_msec: None,
            rtcp_video_interval_msec: None,
            jb_msec: None,
            rtp_timeout_sec: 0,
            rtp_hold_timeout_sec: 0,
            vad_in: false,
            vad_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_string_modifiers() {
        let prefs = parse_codec_string("PCMU@20i,opus@48000h@20i, iLBC@30i@13330b ,,G722");

        assert_eq!(prefs.len(), 4);
        assert_eq!(prefs[0].name, "PCMU");
        assert_eq!(prefs[0].ptime, Some(20));
        assert_eq!(prefs[1].rate, Some(48000));
        assert_eq!(prefs[2].bitrate, Some(13330));
        assert_eq!(prefs[3], CodecPref::named("G722"));
    }

    #[test]
    fn bool_vars() {
        let cfg = MemoryConfig::new()
            .with_var("a", "true")
            .with_var("b", "false")
            .with_var("c", "enabled");

        assert!(cfg.is_true("a"));
        assert!(cfg.is_false("b"));
        assert!(cfg.is_true("c"));
        assert!(!cfg.is_true("missing"));
        assert!(!cfg.is_false("missing"));
    }

    #[test]
    fn flag_bitset() {
        let mut flags = MediaFlags::default();
        flags.set(MediaFlag::SuppressCng);
        flags.set(MediaFlag::Ice);
        flags.clear(MediaFlag::Ice);

        assert!(flags.test(MediaFlag::SuppressCng));
        assert!(!flags.test(MediaFlag::Ice));
    }
}
