#![warn(unreachable_pub)]

//! Media-plane control core of the tandem soft-switch.
//!
//! Given a peer's parsed session description this crate negotiates codecs,
//! transport security and NAT traversal, provisions the resulting RTP/RTCP
//! transports, and generates the session description that mirrors the
//! negotiated state back to the peer. One [`MediaHandle`] exists per call
//! leg; the host serializes all access to it.

use bytes::Bytes;
use std::sync::Mutex;
use std::time::Instant;

mod codec;
mod config;
mod dtls;
mod engine;
mod env;
mod error;
mod hold;
mod ice;
mod messages;
mod offer_answer;
mod provision;
mod recover;
mod secure;
mod sdp_gen;
mod t38;
mod transport;
mod video;

pub use codec::{CodecImpl, CodecKind, CodecParams, CodecRegistry, DefaultCodecRegistry, PayloadAllocator};
pub use config::{
    CallDirection, CodecPolicy, CodecPref, ConfigView, DtmfType, MediaFlag, MediaFlags,
    MediaParams, MemoryConfig, SdpKind, parse_codec_string, str_is_true, vars,
};
pub use engine::{
    AutofixAction, MAX_CODEC_CHECK_FRAMES, MAX_MISMATCH_FRAMES, RtcpMux, RtpBugFlags, RtpEngine,
    parse_rtp_bugs,
};
pub use env::{
    AddressResolver, CollectingSink, EventSink, MediaEnvironment, MediaEvent, NatHelper, NatTable,
    NullSink, PortAllocator, PortPool, StaticResolver, SystemResolver,
};
pub use error::{HangupCause, MediaError};
pub use hold::{HoldState, hold_state};
pub use ice::{
    COMPONENT_RTCP, COMPONENT_RTP, IceCandidate, IceSide, LocalNet, MAX_CAND, host_priority,
    ip_in_acl, parse_candidate, srflx_priority,
};
pub use messages::MediaMessage;
pub use offer_answer::NegotiationResult;
pub use dtls::{CertificateStore, DtlsSetup, DtlsSrtpSession, DtlsState};
pub use secure::{
    CRYPTO_KEY_32, CRYPTO_KEY_80, CryptoDirection, DtlsFingerprint, ParsedCrypto, SRTP_KEY_LEN,
    SecureSettings, SrtpProfile, parse_crypto_line,
};
pub use t38::T38Options;
pub use video::VideoWorker;
pub use transport::{
    Component, IceBinding, JitterBuffer, ReceivedMedia, RtcpInterval, RtpTransport,
    TransportFlags, TransportStats,
};

// The external SDP parser/serializer this crate consumes and produces, and
// the RTP collaborator whose packet type flows through the transport.
pub use rtp;
pub use sdp::{self, SessionDescription};

/// Media type of an engine. One audio and one video engine exist per handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    #[default]
    Audio,
    Video,
}

/// Parse a session description from its text form.
pub fn parse_session_description(text: &str) -> Result<SessionDescription, sdp::Error> {
    let mut cursor = std::io::Cursor::new(text.as_bytes());
    SessionDescription::unmarshal(&mut cursor)
}

/// One call leg's media state: the two RTP engines, behavior flags, codec
/// preferences and session identity.
pub struct MediaHandle {
    pub flags: MediaFlags,
    pub params: MediaParams,
    pub direction: CallDirection,

    pub(crate) env: MediaEnvironment,

    engines: [RtpEngine; 2],

    /// Prepared codec preference list and the payload types assigned to it.
    pub(crate) codecs: Vec<CodecImpl>,
    pub(crate) ianacodes: Vec<u8>,

    /// Cache of the last negotiation outcome, avoids churn on re-offers.
    pub(crate) negotiated_codecs: Vec<CodecImpl>,

    /// The peer's SDP origin username.
    pub(crate) remote_origin: Option<String>,

    pub(crate) owner_id: u32,
    pub(crate) session_id: u32,
    pub(crate) msid: Option<String>,
    pub(crate) cname: Option<String>,

    local_sdp: Mutex<Option<Bytes>>,

    pub(crate) hold_laps: u32,

    /// Telephone-event payload types and comfort noise.
    pub te: u8,
    pub recv_te: u8,
    pub cng_pt: u8,
    pub dtmf_type: DtmfType,

    pub(crate) auto_rtp_bugs: RtpBugFlags,

    /// Whether the partner leg has answered; required for T.38 passthrough.
    pub(crate) partner_answered: bool,

    pub(crate) t38_options: Option<T38Options>,
}

impl MediaHandle {
    pub fn new(env: MediaEnvironment, params: MediaParams, direction: CallDirection) -> Self {
        let te = params.te;
        let recv_te = params.recv_te;
        let cng_pt = params.cng_pt;
        let dtmf_type = params.dtmf_type;

        MediaHandle {
            flags: MediaFlags::default(),
            params,
            direction,
            env,
            engines: [RtpEngine::new(MediaType::Audio), RtpEngine::new(MediaType::Video)],
            codecs: Vec::new(),
            ianacodes: Vec::new(),
            negotiated_codecs: Vec::new(),
            remote_origin: None,
            owner_id: 0,
            session_id: 0,
            msid: None,
            cname: None,
            local_sdp: Mutex::new(None),
            hold_laps: 0,
            te,
            recv_te,
            cng_pt,
            dtmf_type,
            auto_rtp_bugs: RtpBugFlags::default(),
            partner_answered: false,
            t38_options: None,
        }
    }

    pub fn engine(&self, media_type: MediaType) -> &RtpEngine {
        &self.engines[media_type as usize]
    }

    pub fn engine_mut(&mut self, media_type: MediaType) -> &mut RtpEngine {
        &mut self.engines[media_type as usize]
    }

    pub fn environment(&self) -> &MediaEnvironment {
        &self.env
    }

    pub fn remote_origin(&self) -> Option<&str> {
        self.remote_origin.as_deref()
    }

    pub fn t38_options(&self) -> Option<&T38Options> {
        self.t38_options.as_ref()
    }

    /// Enable the workarounds applied automatically for known-buggy peers.
    pub fn set_auto_rtp_bugs(&mut self, bugs: RtpBugFlags) {
        self.auto_rtp_bugs = bugs;
    }

    pub fn set_partner_answered(&mut self, answered: bool) {
        self.partner_answered = answered;
    }

    /// Add a candidate ACL for one engine. The first configured ACL wins.
    pub fn add_ice_acl(&mut self, media_type: MediaType, acl: &str) {
        let engine = self.engine_mut(media_type);
        if engine.cand_acl.len() < 3 {
            engine.cand_acl.push(acl.to_string());
        }
    }

    /// Put the handle into WebRTC mode: ICE, verbose SDP and short RTCP
    /// intervals.
    pub fn set_ice_mode(&mut self) {
        self.flags.set(MediaFlag::VerboseSdp);
        self.flags.set(MediaFlag::Webrtc);
        self.flags.set(MediaFlag::Ice);
        self.params.rtcp_audio_interval_msec = Some("10000".to_string());
        self.params.rtcp_video_interval_msec = Some("10000".to_string());
    }

    /// Resolve the codec preference list from the channel configuration.
    ///
    /// `absolute_codec_string` wins over `codec_string`, which wins over the
    /// profile defaults for the call direction.
    pub fn prepare_codecs(&mut self, cfg: &mut dyn ConfigView, force: bool) {
        if !force && !self.codecs.is_empty() {
            return;
        }

        self.codecs.clear();
        self.ianacodes.clear();

        let preferred = cfg
            .get(vars::ABSOLUTE_CODEC_STRING)
            .or_else(|| cfg.get(vars::CODEC_STRING))
            .unwrap_or_else(|| match self.direction {
                CallDirection::Outbound => self.params.outbound_codec_string.clone(),
                CallDirection::Inbound => self.params.inbound_codec_string.clone(),
            });

        for pref in parse_codec_string(&preferred) {
            let imp = self
                .env
                .resolve_codec(&pref, CodecKind::Audio)
                .or_else(|| self.env.resolve_codec(&pref, CodecKind::Video));

            match imp {
                Some(imp) => self.codecs.push(imp),
                None => log::warn!("codec {:?} is not installed, dropping it", pref.name),
            }
        }

        log::debug!("prepared {} codecs from [{preferred}]", self.codecs.len());
    }

    /// The payload type we offered for a codec, once SDP was generated.
    pub(crate) fn get_offered_pt(&self, iananame: &str) -> Option<u8> {
        self.codecs
            .iter()
            .zip(&self.ianacodes)
            .find(|(imp, _)| imp.iananame.eq_ignore_ascii_case(iananame))
            .map(|(_, &code)| code)
    }

    pub fn codec_chosen(&self, media_type: MediaType) -> bool {
        self.engine(media_type).codec_params.bound()
    }

    /// Negotiate an incoming session description against the local state.
    pub fn negotiate(
        &mut self,
        cfg: &mut dyn ConfigView,
        session: &SessionDescription,
        kind: SdpKind,
    ) -> NegotiationResult {
        self.prepare_codecs(cfg, false);
        offer_answer::negotiate_sdp(self, cfg, session, kind)
    }

    /// Generate the local session description from the current engine state
    /// and store it on the handle.
    pub fn generate_local_sdp(
        &mut self,
        cfg: &mut dyn ConfigView,
        ip: Option<&str>,
        port: u16,
        sr: Option<&str>,
        force: bool,
    ) -> Result<(), MediaError> {
        self.prepare_codecs(cfg, false);
        sdp_gen::gen_local_sdp(self, cfg, ip, port, sr, force)
    }

    /// Generate an image m-line description answering a T.38 request.
    pub fn generate_udptl_image_sdp(
        &mut self,
        cfg: &mut dyn ConfigView,
        t38: &T38Options,
    ) -> Result<(), MediaError> {
        sdp_gen::gen_udptl_image_sdp(self, cfg, t38)
    }

    pub(crate) fn set_local_sdp(&self, cfg: &mut dyn ConfigView, text: &str) {
        cfg.set(vars::RTP_LOCAL_SDP_STR, text);
        *self.local_sdp.lock().unwrap() = Some(Bytes::copy_from_slice(text.as_bytes()));
    }

    /// The generated session description, as last emitted.
    pub fn local_sdp(&self) -> Option<Bytes> {
        self.local_sdp.lock().unwrap().clone()
    }

    /// Allocate (or re-allocate) the local media port for one engine.
    pub fn choose_port(
        &mut self,
        cfg: &mut dyn ConfigView,
        media_type: MediaType,
        force: bool,
    ) -> Result<(), MediaError> {
        provision::choose_port(self, cfg, media_type, force)
    }

    /// Create or reconfigure the live transports.
    pub fn activate(&mut self, cfg: &mut dyn ConfigView) -> Result<(), MediaError> {
        provision::activate(self, cfg).inspect_err(|e| {
            self.env.raise(MediaEvent::Hangup {
                cause: e.hangup_cause(),
            });
        })
    }

    /// Tear everything down and release the resources.
    pub fn deactivate(&mut self, cfg: &mut dyn ConfigView) {
        provision::deactivate(self, cfg);
    }

    /// Update remote endpoints from a proxied SDP without renegotiating.
    pub fn proxy_remote_addr(
        &mut self,
        cfg: &mut dyn ConfigView,
        session: &SessionDescription,
    ) -> Result<bool, MediaError> {
        provision::proxy_remote_addr(self, cfg, session)
    }

    /// Handle one control-plane message.
    pub fn receive_message(
        &mut self,
        cfg: &mut dyn ConfigView,
        msg: MediaMessage,
    ) -> Result<(), MediaError> {
        messages::receive_message(self, cfg, msg)
    }

    /// Rebuild this handle from the recovery variables of a dead one.
    pub fn recover(&mut self, cfg: &mut dyn ConfigView) -> Result<(), MediaError> {
        recover::recover_session(self, cfg)
    }

    /// Peer-driven hold/unhold. Returns whether the state changed.
    pub fn toggle_hold(&mut self, cfg: &mut dyn ConfigView, sendonly: bool) -> bool {
        hold::toggle_hold(self, cfg, sendonly)
    }

    /// Turn the video echo loop on or off without touching passivity.
    pub fn set_video_echo(&mut self, on: bool) {
        self.flags.put(MediaFlag::VideoEcho, on);

        if let Some(worker) = &self.engine(MediaType::Video).video_worker {
            worker.set_echo(on);
            if on {
                worker.wake();
            }
        }
    }

    /// Feed one received datagram through the engine's transport.
    ///
    /// Runs the ptime auto-fix machine on the audio read path and feeds
    /// video frames to the echo worker.
    pub fn media_read(
        &mut self,
        cfg: &mut dyn ConfigView,
        media_type: MediaType,
        datagram: Vec<u8>,
        now: Instant,
    ) -> ReceivedMedia {
        let autofix = self.flags.test(MediaFlag::AutofixTiming);

        let received = {
            let engine = self.engine_mut(media_type);
            let Some(transport) = &mut engine.transport else {
                return ReceivedMedia::TransportSpecific;
            };

            transport.receive(datagram, now)
        };

        if let ReceivedMedia::Rtp(packet) = &received {
            match media_type {
                MediaType::Audio if autofix => {
                    let engine = self.engine_mut(MediaType::Audio);
                    let advertised = engine.codec_params.ptime;
                    let action =
                        engine.observe_read_frame(packet.payload.len(), packet.timestamp.0);

                    match action {
                        Some(AutofixAction::ReinitPtime(ms)) => {
                            let engine = self.engine_mut(MediaType::Audio);
                            engine.codec_params.ptime = ms;
                            engine.reset_autofix_timing();
                            if let Some(transport) = &mut engine.transport {
                                transport.set_ptime(ms);
                            }

                            cfg.set(vars::BROKEN_PTIME_HEADER, &format!("Adv={advertised};Sent={ms}"));
                            provision::compute_missed_packet_limits(self, &*cfg, MediaType::Audio);

                            self.env.raise(MediaEvent::BrokenPtime {
                                advertised,
                                sent: ms,
                            });
                        }
                        Some(AutofixAction::Clamped(observed_ms)) => {
                            self.env.raise(MediaEvent::PtimeClampTriggered { observed_ms });
                        }
                        None => {}
                    }
                }
                MediaType::Video => {
                    if let Some(worker) = &self.engine(MediaType::Video).video_worker {
                        worker.push_frame(packet.clone());
                    }
                }
                _ => {}
            }
        }

        received
    }

    /// Check both engines' inactivity timers; expiry hangs the channel up
    /// unless a timeout handler is configured.
    pub fn check_media_timeout(
        &mut self,
        cfg: &dyn ConfigView,
        now: Instant,
    ) -> Option<HangupCause> {
        for media_type in [MediaType::Audio, MediaType::Video] {
            let handler = cfg.get(vars::EXECUTE_ON_MEDIA_TIMEOUT);

            let engine = self.engine_mut(media_type);
            let Some(transport) = &mut engine.transport else {
                continue;
            };

            if !transport.media_timed_out(now) {
                continue;
            }

            if handler.is_some() {
                // the configured handler runs instead of a hangup
                transport.reset_media_timer();
                continue;
            }

            self.env.raise(MediaEvent::Hangup {
                cause: HangupCause::MediaTimeout,
            });

            return Some(HangupCause::MediaTimeout);
        }

        None
    }

    /// Cross-copy the ZRTP hashes between two bridged legs so the secure
    /// channel can pass through end to end.
    pub fn pass_zrtp_hash(a: &mut MediaHandle, b: &mut MediaHandle) {
        for media_type in [MediaType::Audio, MediaType::Video] {
            if let Some(hash) = a.engine(media_type).remote_zrtp_hash.clone() {
                log::debug!("passing {media_type:?} zrtp hash a -> b");
                b.engine_mut(media_type).local_zrtp_hash = Some(hash);
            }

            if let Some(hash) = b.engine(media_type).remote_zrtp_hash.clone() {
                log::debug!("passing {media_type:?} zrtp hash b -> a");
                a.engine_mut(media_type).local_zrtp_hash = Some(hash);
            }
        }
    }

    /// The local ZRTP hash we advertise for a media type.
    pub fn zrtp_hash(&self, media_type: MediaType, local: bool) -> Option<&str> {
        let engine = self.engine(media_type);
        if local {
            engine.local_zrtp_hash.as_deref()
        } else {
            engine.remote_zrtp_hash.as_deref()
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        if let Some(mut worker) = self.engine_mut(MediaType::Video).video_worker.take() {
            worker.stop();
        }
    }
}
