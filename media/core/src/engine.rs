//! Per-media RTP engine state and the ptime auto-fix machine.

use crate::MediaType;
use crate::codec::CodecParams;
use crate::ice::IceSide;
use crate::secure::{DtlsFingerprint, SecureSettings};
use crate::transport::{IceBinding, RtpTransport};
use crate::video::VideoWorker;

pub const MAX_CODEC_CHECK_FRAMES: u32 = 50;
pub const MAX_MISMATCH_FRAMES: u32 = 5;

/// rtcp-mux is tri-state: a media section that was parsed without the
/// attribute explicitly disables it, which is distinguishable from never
/// having seen the section at all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMux {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

impl RtcpMux {
    pub fn enabled(&self) -> bool {
        matches!(self, RtcpMux::Enabled)
    }
}

/// Workarounds for known-broken peers, OR-able.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpBugFlags(pub u32);

impl RtpBugFlags {
    pub const CISCO_SKIP_MARK_BIT_2833: RtpBugFlags = RtpBugFlags(1 << 0);
    pub const SONUS_SEND_INVALID_TIMESTAMP_2833: RtpBugFlags = RtpBugFlags(1 << 1);
    pub const IGNORE_MARK_BIT: RtpBugFlags = RtpBugFlags(1 << 2);
    pub const SEND_LINEAR_TIMESTAMPS: RtpBugFlags = RtpBugFlags(1 << 3);
    pub const START_SEQ_AT_ZERO: RtpBugFlags = RtpBugFlags(1 << 4);
    pub const NEVER_SEND_MARKER: RtpBugFlags = RtpBugFlags(1 << 5);
    pub const IGNORE_DTMF_DURATION: RtpBugFlags = RtpBugFlags(1 << 6);
    pub const ACCEPT_ANY_PACKETS: RtpBugFlags = RtpBugFlags(1 << 7);
    pub const GEN_ONE_GEN_ALL: RtpBugFlags = RtpBugFlags(1 << 8);
    pub const CHANGE_SSRC_ON_MARKER: RtpBugFlags = RtpBugFlags(1 << 9);
    pub const FLUSH_JB_ON_DTMF: RtpBugFlags = RtpBugFlags(1 << 10);

    pub fn contains(&self, other: RtpBugFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RtpBugFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RtpBugFlags) {
        self.0 &= !other.0;
    }

    fn by_name(name: &str) -> Option<RtpBugFlags> {
        let flag = match name.to_ascii_uppercase().as_str() {
            "CISCO_SKIP_MARK_BIT_2833" => Self::CISCO_SKIP_MARK_BIT_2833,
            "SONUS_SEND_INVALID_TIMESTAMP_2833" => Self::SONUS_SEND_INVALID_TIMESTAMP_2833,
            "IGNORE_MARK_BIT" => Self::IGNORE_MARK_BIT,
            "SEND_LINEAR_TIMESTAMPS" => Self::SEND_LINEAR_TIMESTAMPS,
            "START_SEQ_AT_ZERO" => Self::START_SEQ_AT_ZERO,
            "NEVER_SEND_MARKER" => Self::NEVER_SEND_MARKER,
            "IGNORE_DTMF_DURATION" => Self::IGNORE_DTMF_DURATION,
            "ACCEPT_ANY_PACKETS" => Self::ACCEPT_ANY_PACKETS,
            "GEN_ONE_GEN_ALL" => Self::GEN_ONE_GEN_ALL,
            "CHANGE_SSRC_ON_MARKER" => Self::CHANGE_SSRC_ON_MARKER,
            "FLUSH_JB_ON_DTMF" => Self::FLUSH_JB_ON_DTMF,
            _ => return None,
        };

        Some(flag)
    }
}

/// Parse a comma separated bug flag list; a `~` prefix clears the flag.
pub fn parse_rtp_bugs(pole: &mut RtpBugFlags, s: &str) {
    for entry in s.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (clear, name) = match entry.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, entry),
        };

        match RtpBugFlags::by_name(name) {
            Some(flag) if clear => pole.remove(flag),
            Some(flag) => pole.insert(flag),
            None => log::warn!("unknown rtp bug flag {name:?}"),
        }
    }
}

/// Outcome of one auto-fix observation, see [`RtpEngine::observe_read_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum AutofixAction {
    /// Re-initialize the codec at the observed packetization time.
    ReinitPtime(u32),
    /// The observed value was implausible (> 120 ms) and was dismissed.
    Clamped(u32),
}

/// Per-media aggregate: negotiated parameters, security, ICE, DTLS, the live
/// transport and the read-path bookkeeping.
#[derive(Default)]
pub struct RtpEngine {
    pub media_type: MediaType,

    pub codec_params: CodecParams,
    pub ssec: SecureSettings,

    pub ice_in: IceSide,
    pub ice_out: IceSide,
    pub cand_acl: Vec<String>,

    pub local_dtls_fingerprint: DtlsFingerprint,
    pub remote_dtls_fingerprint: DtlsFingerprint,

    pub ssrc: u32,
    pub remote_ssrc: u32,

    pub rtcp_mux: RtcpMux,
    pub remote_rtcp_port: u16,
    pub remote_rtp_ice_addr: Option<String>,
    pub remote_rtp_ice_port: u16,
    pub remote_rtcp_ice_addr: Option<String>,
    pub remote_rtcp_ice_port: u16,

    /// ZRTP hash we advertise / the peer advertised.
    pub local_zrtp_hash: Option<String>,
    pub remote_zrtp_hash: Option<String>,

    /// The live transport, absent until provisioning.
    pub transport: Option<RtpTransport>,

    pub rtp_bugs: RtpBugFlags,

    pub max_missed_packets: u32,
    pub max_missed_hold_packets: u32,

    // ptime auto-fix bookkeeping
    pub check_frames: u32,
    pub last_ts: u32,
    pub last_codec_ms: u32,
    pub mismatch_count: u32,

    /// Video worker thread, video engines only.
    pub video_worker: Option<VideoWorker>,
}

impl RtpEngine {
    pub fn new(media_type: MediaType) -> Self {
        RtpEngine {
            media_type,
            ssrc: rand::random::<u32>(),
            ..Default::default()
        }
    }

    pub fn transport_live(&self) -> bool {
        self.transport.is_some()
    }

    /// Credentials bundle handed to the transport when attaching ICE.
    pub fn ice_binding(&self, controlling: bool) -> IceBinding {
        IceBinding {
            remote_ufrag: self.ice_in.ufrag.clone().unwrap_or_default(),
            local_ufrag: self.ice_out.ufrag.clone().unwrap_or_default(),
            local_pwd: self.ice_out.pwd.clone().unwrap_or_default(),
            remote_pwd: self.ice_in.pwd.clone().unwrap_or_default(),
            controlling,
        }
    }

    pub fn reset_autofix_timing(&mut self) {
        self.check_frames = 0;
        self.last_ts = 0;
        self.last_codec_ms = 0;
        self.mismatch_count = 0;
    }

    /// Feed one received frame into the ptime auto-fix machine.
    ///
    /// Peers sometimes advertise one ptime and then send another; once the
    /// observed packetization disagrees with the negotiated one for more than
    /// [`MAX_MISMATCH_FRAMES`] consecutive frames, the codec is
    /// re-initialized at the observed value. Values above 120 ms are treated
    /// as nonsense and dismissed for good.
    pub fn observe_read_frame(&mut self, datalen: usize, timestamp: u32) -> Option<AutofixAction> {
        if datalen == 0 || datalen % 10 != 0 || self.check_frames >= MAX_CODEC_CHECK_FRAMES {
            return None;
        }

        self.check_frames += 1;

        let samples_per_ms = self.codec_params.samples_per_ms();
        if samples_per_ms == 0 {
            self.check_frames = MAX_CODEC_CHECK_FRAMES;
            return None;
        }

        if self.last_ts != 0 {
            let codec_ms = timestamp.wrapping_sub(self.last_ts) / samples_per_ms;

            if codec_ms % 10 != 0 {
                self.last_ts = 0;
                return None;
            }

            if self.last_codec_ms != 0 && self.last_codec_ms == codec_ms {
                self.mismatch_count += 1;
            }

            self.last_codec_ms = codec_ms;

            if self.mismatch_count > MAX_MISMATCH_FRAMES {
                self.last_ts = timestamp;

                if codec_ms != self.codec_params.ptime {
                    if codec_ms > 120 {
                        // yeah, right
                        log::warn!(
                            "peer is sending timestamps that suggest an increment of {codec_ms}ms per packet, ignoring"
                        );
                        self.check_frames = MAX_CODEC_CHECK_FRAMES;
                        return Some(AutofixAction::Clamped(codec_ms));
                    }

                    log::warn!(
                        "asynchronous ptime not supported, changing our end from {} to {}",
                        self.codec_params.ptime,
                        codec_ms
                    );

                    return Some(AutofixAction::ReinitPtime(codec_ms));
                }
            }
        }

        self.last_ts = timestamp;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_at(ptime: u32) -> RtpEngine {
        let mut engine = RtpEngine::new(MediaType::Audio);
        engine.codec_params.rate = 8000;
        engine.codec_params.ptime = ptime;
        engine
    }

    /// Feed `n` frames spaced `step_ms` apart, returning the first action.
    fn feed(engine: &mut RtpEngine, n: u32, step_ms: u32) -> Option<AutofixAction> {
        let mut ts = 1000u32;
        for _ in 0..n {
            ts = ts.wrapping_add(step_ms * 8);
            if let Some(action) = engine.observe_read_frame(160, ts) {
                return Some(action);
            }
        }
        None
    }

    #[test]
    fn autofix_switches_after_mismatch_run() {
        let mut engine = engine_at(20);

        // 30ms observations: first sets last_codec_ms, the following six
        // increment the mismatch counter past the threshold
        assert_eq!(feed(&mut engine, 6, 30), None);
        assert_eq!(feed(&mut engine, 2, 30), Some(AutofixAction::ReinitPtime(30)));
    }

    #[test]
    fn autofix_switches_only_once() {
        let mut engine = engine_at(20);

        assert_eq!(feed(&mut engine, 8, 30), Some(AutofixAction::ReinitPtime(30)));

        // once the codec is reinitialized at 30ms there is nothing to fix
        engine.codec_params.ptime = 30;
        engine.reset_autofix_timing();
        assert_eq!(feed(&mut engine, 40, 30), None);
    }

    #[test]
    fn autofix_ignores_implausible_ptime() {
        let mut engine = engine_at(20);

        let action = feed(&mut engine, 10, 130);
        assert_eq!(action, Some(AutofixAction::Clamped(130)));
        // machine is parked afterwards
        assert_eq!(feed(&mut engine, 10, 130), None);
    }

    #[test]
    fn autofix_requires_ten_byte_multiples() {
        let mut engine = engine_at(20);

        for i in 0..60u32 {
            assert!(engine.observe_read_frame(163, 1000 + i * 240).is_none());
        }
        assert_eq!(engine.check_frames, 0);
    }

    #[test]
    fn autofix_gives_up_after_check_window() {
        let mut engine = engine_at(20);

        // matching ptime never mismatches, counter just runs out
        assert_eq!(feed(&mut engine, 60, 20), None);
        assert_eq!(engine.check_frames, MAX_CODEC_CHECK_FRAMES);
    }

    #[test]
    fn bug_flag_parsing() {
        let mut pole = RtpBugFlags::default();
        parse_rtp_bugs(&mut pole, "IGNORE_MARK_BIT,NEVER_SEND_MARKER");
        assert!(pole.contains(RtpBugFlags::IGNORE_MARK_BIT));
        assert!(pole.contains(RtpBugFlags::NEVER_SEND_MARKER));

        parse_rtp_bugs(&mut pole, "~IGNORE_MARK_BIT,bogus");
        assert!(!pole.contains(RtpBugFlags::IGNORE_MARK_BIT));
        assert!(pole.contains(RtpBugFlags::NEVER_SEND_MARKER));
    }
}
