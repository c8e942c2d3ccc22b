//! SRTP key negotiation (`a=crypto`), DTLS fingerprint exchange and the
//! ZRTP hash passthrough record.

use crate::config::{ConfigView, MediaFlag, SdpKind, vars};
use crate::engine::RtpEngine;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use rand::RngCore;

pub const SRTP_KEY_LEN: usize = 30;

pub const CRYPTO_KEY_80: &str = "AES_CM_128_HMAC_SHA1_80";
pub const CRYPTO_KEY_32: &str = "AES_CM_128_HMAC_SHA1_32";

/// Length of the suite prefix compared when deciding whether a changed
/// remote key is acceptable on a re-offer.
const SUITE_PREFIX_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
    /// Encryption without authentication, only used to interoperate with
    /// endpoints that cannot do SRTP auth.
    AesCm128NullAuth,
}

impl SrtpProfile {
    pub fn sdp_name(&self) -> &'static str {
        match self {
            SrtpProfile::AesCm128HmacSha1_80 => CRYPTO_KEY_80,
            SrtpProfile::AesCm128HmacSha1_32 => CRYPTO_KEY_32,
            SrtpProfile::AesCm128NullAuth => "AES_CM_128_NULL_AUTH",
        }
    }

    fn from_suite_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case(CRYPTO_KEY_32) {
            Some(SrtpProfile::AesCm128HmacSha1_32)
        } else if token.eq_ignore_ascii_case(CRYPTO_KEY_80) {
            Some(SrtpProfile::AesCm128HmacSha1_80)
        } else {
            None
        }
    }
}

/// Per-engine SRTP state.
#[derive(Debug, Default, Clone)]
pub struct SecureSettings {
    pub crypto_tag: u32,
    /// Suite used when keying our send direction.
    pub crypto_type: Option<SrtpProfile>,
    pub crypto_send_type: Option<SrtpProfile>,
    pub crypto_recv_type: Option<SrtpProfile>,
    pub local_raw_key: Option<[u8; SRTP_KEY_LEN]>,
    pub remote_raw_key: Option<[u8; SRTP_KEY_LEN]>,
    /// `<tag> <suite> inline:<key>` form for SDP emission.
    pub local_crypto_line: Option<String>,
    /// The peer's crypto line exactly as received.
    pub remote_crypto_line: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum CryptoDirection {
    Send,
    Recv,
}

/// A successfully parsed `a=crypto` attribute value.
#[derive(Debug)]
pub struct ParsedCrypto {
    pub tag: u32,
    pub profile: SrtpProfile,
    pub key: [u8; SRTP_KEY_LEN],
}

/// Parse `<tag> <suite> inline:<base64-key>[|...]`.
///
/// Anything malformed yields `None`; the caller skips the attribute.
pub fn parse_crypto_line(line: &str) -> Option<ParsedCrypto> {
    let mut fields = line.split_whitespace();

    let tag: u32 = fields.next()?.parse().ok()?;
    let profile = SrtpProfile::from_suite_token(fields.next()?)?;

    let key_field = fields.next()?;
    let b64 = key_field.strip_prefix("inline:")?;
    // lifetime / MKI may follow the key material
    let b64 = b64.split('|').next()?;

    let decoded = BASE64_STANDARD
        .decode(b64)
        .or_else(|_| base64::prelude::BASE64_STANDARD_NO_PAD.decode(b64))
        .ok()?;

    if decoded.len() < SRTP_KEY_LEN {
        return None;
    }

    let mut key = [0u8; SRTP_KEY_LEN];
    key.copy_from_slice(&decoded[..SRTP_KEY_LEN]);

    Some(ParsedCrypto { tag, profile, key })
}

/// Record a remote crypto line in the given direction.
pub(crate) fn add_crypto(ssec: &mut SecureSettings, line: &str, direction: CryptoDirection) -> bool {
    let Some(parsed) = parse_crypto_line(line) else {
        log::error!("failed to parse crypto line near [{line}]");
        return false;
    };

    match direction {
        CryptoDirection::Send => {
            ssec.crypto_send_type = Some(parsed.profile);
            ssec.local_raw_key = Some(parsed.key);
        }
        CryptoDirection::Recv => {
            ssec.crypto_recv_type = Some(parsed.profile);
            ssec.remote_raw_key = Some(parsed.key);
        }
    }

    true
}

/// Build (or keep) the local key and crypto line for one engine.
///
/// Without `force` an existing local key is left untouched, so re-offers do
/// not rotate our own key behind the transport's back.
pub(crate) fn build_local_crypto(
    ssec: &mut SecureSettings,
    tag: u32,
    profile: SrtpProfile,
    force: bool,
    disable_auth: bool,
) {
    if !force && ssec.local_raw_key.is_some() {
        return;
    }

    let mut key = [0u8; SRTP_KEY_LEN];
    rand::rng().fill_bytes(&mut key);

    let mut b64 = BASE64_STANDARD.encode(key);
    while b64.ends_with('=') {
        b64.pop();
    }

    ssec.local_raw_key = Some(key);
    ssec.local_crypto_line = Some(format!("{tag} {} inline:{b64}", profile.sdp_name()));
    ssec.crypto_send_type = Some(profile);

    ssec.crypto_type = if disable_auth {
        Some(SrtpProfile::AesCm128NullAuth)
    } else {
        Some(profile)
    };

    log::debug!("set local crypto key [{}]", ssec.local_crypto_line.as_deref().unwrap_or(""));
}

fn suite_prefix(line: &str) -> Option<&str> {
    let pos = line.to_ascii_uppercase().find("AES")?;
    let rest = &line[pos..];
    Some(&rest[..rest.len().min(SUITE_PREFIX_LEN)])
}

fn profile_of_line(line: &str) -> Option<SrtpProfile> {
    if line.contains(CRYPTO_KEY_32) {
        Some(SrtpProfile::AesCm128HmacSha1_32)
    } else if line.contains(CRYPTO_KEY_80) {
        Some(SrtpProfile::AesCm128HmacSha1_80)
    } else {
        None
    }
}

/// Process an incoming `a=crypto` line for one engine.
///
/// Returns whether usable crypto was taken from the line. Follows the
/// re-key rules: a changed remote key is accepted only when its suite prefix
/// matches the previous one; on requests our own key is regenerated with the
/// peer's suite first.
pub(crate) fn check_incoming_crypto(
    engine: &mut RtpEngine,
    cfg: &mut dyn ConfigView,
    varname: &str,
    crypto_line: &str,
    crypto_tag: u32,
    sdp_kind: SdpKind,
    disable_auth: bool,
) -> bool {
    let mut got_crypto = false;

    // only the two AES_CM_128 auth suites are negotiable
    if profile_of_line(crypto_line).is_none() {
        log::debug!("ignoring crypto line with unsupported suite [{crypto_line}]");
        return false;
    }

    let transport_live = engine.transport.is_some();
    let (key_var, tag_var) = remote_crypto_vars(engine);

    if engine.ssec.remote_crypto_line.is_some() && transport_live {
        // Compare the whole line, the tag may stay the same while the key rolls
        if engine.ssec.remote_crypto_line.as_deref() == Some(crypto_line) {
            log::debug!("existing crypto key is still valid");
        } else {
            let old_prefix = engine
                .ssec
                .remote_crypto_line
                .as_deref()
                .and_then(suite_prefix)
                .map(str::to_ascii_uppercase);
            let new_prefix = suite_prefix(crypto_line).map(str::to_ascii_uppercase);

            if sdp_kind == SdpKind::Offer {
                // a suite change on a request regenerates our key; a plain
                // re-key with the same suite leaves it alone
                match profile_of_line(crypto_line) {
                    Some(profile) if engine.ssec.crypto_send_type != Some(profile) => {
                        cfg.set(varname, profile.sdp_name());
                        build_local_crypto(&mut engine.ssec, crypto_tag, profile, true, disable_auth);
                        publish_local_key(engine, cfg);
                        apply_local_key(engine);
                    }
                    Some(_) => {}
                    None => log::error!("crypto setup failed"),
                }
            }

            match (old_prefix, new_prefix) {
                (Some(a), Some(b)) if a == b => {
                    log::debug!("change remote key to [{crypto_line}]");
                    engine.ssec.remote_crypto_line = Some(crypto_line.to_string());
                    engine.ssec.crypto_tag = crypto_tag;
                    cfg.set(key_var, crypto_line);
                    cfg.set(tag_var, &crypto_tag.to_string());
                    apply_remote_key(engine);
                    got_crypto = true;
                }
                _ => {
                    log::debug!("ignoring unacceptable key");
                }
            }
        }
    } else if !transport_live {
        engine.ssec.remote_crypto_line = Some(crypto_line.to_string());
        engine.ssec.crypto_tag = crypto_tag;
        log::debug!("set remote crypto key [{crypto_line}]");
        cfg.set(key_var, crypto_line);
        got_crypto = true;

        if engine.ssec.local_crypto_line.is_none() {
            if let Some(profile) = profile_of_line(crypto_line) {
                cfg.set(varname, profile.sdp_name());
                build_local_crypto(&mut engine.ssec, crypto_tag, profile, false, disable_auth);
                publish_local_key(engine, cfg);
            } else {
                log::error!("crypto setup failed");
            }
        }
    }

    got_crypto
}

/// Keep the last local crypto line in the variable store for recovery.
fn publish_local_key(engine: &RtpEngine, cfg: &mut dyn ConfigView) {
    let Some(line) = engine.ssec.local_crypto_line.as_deref() else {
        return;
    };

    let var = match engine.media_type {
        crate::MediaType::Audio => vars::RTP_LAST_AUDIO_LOCAL_CRYPTO_KEY,
        crate::MediaType::Video => vars::RTP_LAST_VIDEO_LOCAL_CRYPTO_KEY,
    };
    cfg.set(var, line);
}

fn remote_crypto_vars(engine: &RtpEngine) -> (&'static str, &'static str) {
    match engine.media_type {
        crate::MediaType::Audio => (
            vars::SRTP_REMOTE_AUDIO_CRYPTO_KEY,
            vars::SRTP_REMOTE_AUDIO_CRYPTO_TAG,
        ),
        crate::MediaType::Video => (
            vars::SRTP_REMOTE_VIDEO_CRYPTO_KEY,
            vars::SRTP_REMOTE_VIDEO_CRYPTO_TAG,
        ),
    }
}

fn apply_local_key(engine: &mut RtpEngine) {
    let (Some(profile), Some(key)) = (engine.ssec.crypto_type, engine.ssec.local_raw_key) else {
        return;
    };

    if let Some(transport) = &mut engine.transport {
        transport.add_crypto_key(CryptoDirection::Send, 1, profile, &key);
    }
}

fn apply_remote_key(engine: &mut RtpEngine) {
    let Some(line) = engine.ssec.remote_crypto_line.clone() else {
        return;
    };

    if !add_crypto(&mut engine.ssec, &line, CryptoDirection::Recv) {
        return;
    }

    let (Some(profile), Some(key)) = (engine.ssec.crypto_type, engine.ssec.remote_raw_key) else {
        return;
    };

    let tag = engine.ssec.crypto_tag;
    if let Some(transport) = &mut engine.transport {
        transport.add_crypto_key(CryptoDirection::Recv, tag, profile, &key);
    }
}

/// Key a freshly provisioned transport from the negotiated settings.
pub(crate) fn apply_crypto(engine: &mut RtpEngine, cfg: &mut dyn ConfigView, recovering: bool) {
    if recovering {
        return;
    }

    if engine.ssec.remote_crypto_line.is_none() {
        return;
    }

    apply_remote_key(engine);
    apply_local_key(engine);

    let confirmed_var = match engine.media_type {
        crate::MediaType::Audio => vars::RTP_SECURE_AUDIO_CONFIRMED,
        crate::MediaType::Video => vars::RTP_SECURE_VIDEO_CONFIRMED,
    };
    cfg.set(confirmed_var, "true");
}

/// Pre-build local crypto for an outgoing offer when `rtp_secure_media`
/// (or the given variable) requests it.
pub(crate) fn check_outgoing_crypto(
    handle: &mut crate::MediaHandle,
    cfg: &mut dyn ConfigView,
    sec_var: &str,
) {
    let Some(var) = cfg.get(sec_var) else {
        return;
    };

    if var.is_empty() {
        return;
    }

    let profile = if var.eq_ignore_ascii_case(CRYPTO_KEY_32) {
        SrtpProfile::AesCm128HmacSha1_32
    } else if var.eq_ignore_ascii_case(CRYPTO_KEY_80) || cfg.is_true(sec_var) {
        SrtpProfile::AesCm128HmacSha1_80
    } else {
        return;
    };

    handle.flags.set(MediaFlag::Secure);

    let disable_auth = cfg.is_true(vars::NDLB_ASTERISK_MISSING_SRTP_AUTH);

    for media_type in [crate::MediaType::Audio, crate::MediaType::Video] {
        let engine = handle.engine_mut(media_type);
        build_local_crypto(&mut engine.ssec, 1, profile, false, disable_auth);
        publish_local_key(handle.engine(media_type), cfg);
    }
}

/// Remote DTLS fingerprint as received, local one as generated.
#[derive(Debug, Default, Clone)]
pub struct DtlsFingerprint {
    /// Hash function name, only `sha-256` is ever accepted.
    pub hash: Option<String>,
    /// Upper-case colon separated hex digest.
    pub value: Option<String>,
}

impl DtlsFingerprint {
    pub fn is_set(&self) -> bool {
        self.hash.is_some() && self.value.is_some()
    }

    pub fn clear(&mut self) {
        self.hash = None;
        self.value = None;
    }
}

/// Split an `a=fingerprint` attribute value into hash name and digest.
pub(crate) fn parse_fingerprint(value: &str) -> Option<(String, String)> {
    let (hash, digest) = value.trim().split_once(' ')?;
    if hash.is_empty() || digest.is_empty() {
        return None;
    }
    Some((hash.to_string(), digest.trim().to_string()))
}
