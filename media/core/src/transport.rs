//! The live RTP/RTCP transport for one engine.
//!
//! Sans-I/O: the host owns the sockets and feeds datagrams in through
//! [`RtpTransport::receive`]; everything to be sent is queued and drained
//! with [`RtpTransport::pop_to_send`]. RTP session state (sequence numbers,
//! jitter, reports) lives in the external RTP collaborator.

use crate::MediaType;
use crate::dtls::{DtlsSetup, DtlsSrtpSession, decode_fingerprint, digest_by_name};
use crate::engine::RtpBugFlags;
use crate::secure::{CryptoDirection, DtlsFingerprint, SrtpProfile};
use rtp::{RtpExtensionIds, RtpPacket, Ssrc};
use srtp::CryptoPolicy;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Stream component, RTCP only exists while rtcp-mux is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Rtp,
    Rtcp,
}

/// ICE credentials attached to a component of the live transport. The
/// connectivity-check machinery outside the core consumes these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceBinding {
    pub remote_ufrag: String,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_pwd: String,
    pub controlling: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransportFlags {
    /// Follow the peer when its source address changes (NAT buster).
    pub auto_adjust: bool,
    pub autoflush: bool,
    /// Do not rewrite timestamps on write.
    pub raw_write: bool,
    /// L16 on little-endian hosts.
    pub byteswap: bool,
    /// Generate comfort noise.
    pub auto_cng: bool,
    pub vad_in: bool,
    pub vad_out: bool,
    /// Pass packets through untouched.
    pub proxy_media: bool,
    /// T.38 switched the stream to UDPTL framing.
    pub udptl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpInterval {
    /// Forward RTCP unchanged, do not generate our own.
    Passthru,
    Millis(u32),
}

impl RtcpInterval {
    /// Parse the interval variable. Out-of-range numeric values are
    /// substituted with 10000 ms; the bound is 100..=500000.
    pub fn parse(val: &str) -> RtcpInterval {
        if val.eq_ignore_ascii_case("passthru") {
            return RtcpInterval::Passthru;
        }

        let interval: i64 = val.trim().parse().unwrap_or(0);

        if !(100..=500_000).contains(&interval) {
            log::error!("invalid rtcp interval spec [{interval}] must be between 100 and 500000");
            return RtcpInterval::Millis(10_000);
        }

        RtcpInterval::Millis(interval as u32)
    }
}

#[derive(Debug, Clone, Copy)]
struct RtcpConfig {
    interval: RtcpInterval,
    remote_port: u16,
    mux: bool,
}

/// Jitter buffer configuration derived from `<len>[:<max>[:<drift>]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBuffer {
    pub msec: u32,
    pub qlen: u32,
    pub maxqlen: u32,
    pub max_drift: u32,
    pub paused: bool,
}

impl JitterBuffer {
    /// Returns `None` (and logs) when the length is outside 20..=10000 ms.
    pub fn parse(spec: &str, frame_ms: u32) -> Option<JitterBuffer> {
        let mut parts = spec.split(':');

        let msec: u32 = parts.next()?.trim().parse().ok()?;
        let maxlen: u32 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0);
        let max_drift: u32 = parts
            .next()
            .and_then(|p| p.trim().parse::<i64>().ok())
            .map(|d| d.unsigned_abs() as u32)
            .unwrap_or(0);

        if !(20..=10_000).contains(&msec) {
            log::error!("invalid jitterbuffer spec [{msec}] must be between 20 and 10000");
            return None;
        }

        let frame_ms = frame_ms.max(1);
        let mut qlen = msec / frame_ms;
        if qlen < 1 {
            qlen = 3;
        }

        let mut maxqlen = if maxlen != 0 { maxlen / frame_ms } else { 50 };
        if maxqlen < qlen {
            maxqlen = qlen * 5;
        }

        Some(JitterBuffer {
            msec,
            qlen,
            maxqlen,
            max_drift,
            paused: false,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub in_packets: u64,
    pub in_octets: u64,
    pub out_packets: u64,
    pub out_octets: u64,
}

#[derive(Debug)]
enum PacketKind {
    Rtp,
    Rtcp,
    Stun,
    Dtls,
    Unknown,
}

impl PacketKind {
    fn identify(bytes: &[u8]) -> Self {
        if bytes.len() < 2 {
            return PacketKind::Unknown;
        }

        match bytes[0] {
            0 | 1 => PacketKind::Stun,
            20..=63 => PacketKind::Dtls,
            128..=191 => {
                let pt = bytes[1];

                if let 64..=95 = pt & 0x7F {
                    PacketKind::Rtcp
                } else {
                    PacketKind::Rtp
                }
            }
            _ => PacketKind::Unknown,
        }
    }
}

/// What one incoming datagram turned out to be.
#[derive(Debug)]
#[must_use]
pub enum ReceivedMedia {
    Rtp(RtpPacket),
    Rtcp(Vec<u8>),
    /// UDPTL payload while in T.38 mode.
    Udptl(Vec<u8>),
    /// Consumed by the transport itself (STUN, DTLS, discards).
    TransportSpecific,
}

pub struct RtpTransport {
    media_type: MediaType,

    local_ip: IpAddr,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    remote_rtcp_port: u16,

    default_pt: u8,
    recv_pt: u8,
    te_pt: Option<u8>,
    te_recv_pt: Option<u8>,
    cng_pt: Option<u8>,

    /// Packetization parameters the timers derive from.
    rate: u32,
    ptime_ms: u32,

    flags: TransportFlags,
    bugs: RtpBugFlags,

    ssrc: Ssrc,

    srtp_in: Option<srtp::Session>,
    srtp_out: Option<srtp::Session>,

    dtls_rtp: Option<DtlsSrtpSession>,
    dtls_rtcp: Option<DtlsSrtpSession>,

    ice_rtp: Option<IceBinding>,
    ice_rtcp: Option<IceBinding>,

    jitter: Option<JitterBuffer>,
    rtcp: Option<RtcpConfig>,

    max_missed_packets: u32,
    last_rx: Option<Instant>,

    stats: TransportStats,

    to_send: VecDeque<Vec<u8>>,
}

impl RtpTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media_type: MediaType,
        local_ip: IpAddr,
        local_port: u16,
        remote_ip: String,
        remote_port: u16,
        default_pt: u8,
        ssrc: u32,
        rate: u32,
        ptime_ms: u32,
        flags: TransportFlags,
    ) -> Self {
        RtpTransport {
            media_type,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            remote_rtcp_port: 0,
            default_pt,
            recv_pt: default_pt,
            te_pt: None,
            te_recv_pt: None,
            cng_pt: None,
            rate,
            ptime_ms,
            flags,
            bugs: RtpBugFlags::default(),
            ssrc: Ssrc(ssrc),
            srtp_in: None,
            srtp_out: None,
            dtls_rtp: None,
            dtls_rtcp: None,
            ice_rtp: None,
            ice_rtcp: None,
            jitter: None,
            rtcp: None,
            max_missed_packets: 0,
            last_rx: None,
            stats: TransportStats::default(),
            to_send: VecDeque::new(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.rate
    }

    pub fn local_addr(&self) -> (IpAddr, u16) {
        (self.local_ip, self.local_port)
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Point the transport at a new peer endpoint.
    pub fn set_remote_address(&mut self, ip: &str, port: u16, rtcp_port: u16) {
        self.remote_ip = ip.to_string();
        self.remote_port = port;
        if rtcp_port != 0 {
            self.remote_rtcp_port = rtcp_port;
        }
    }

    pub fn set_default_payload(&mut self, pt: u8) {
        self.default_pt = pt;
    }

    pub fn set_recv_pt(&mut self, pt: u8) {
        self.recv_pt = pt;
    }

    pub fn set_telephony_event(&mut self, pt: u8) {
        self.te_pt = Some(pt);
    }

    pub fn set_telephony_recv_event(&mut self, pt: u8) {
        self.te_recv_pt = Some(pt);
    }

    pub fn set_cng_pt(&mut self, pt: u8) {
        self.cng_pt = Some(pt);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.0
    }

    pub fn set_ptime(&mut self, ptime_ms: u32) {
        self.ptime_ms = ptime_ms;
    }

    pub fn intentional_bugs(&mut self, bugs: RtpBugFlags) {
        self.bugs = bugs;
    }

    pub fn set_auto_adjust(&mut self, on: bool) {
        self.flags.auto_adjust = on;
    }

    pub fn set_proxy_media(&mut self, on: bool) {
        self.flags.proxy_media = on;
    }

    pub fn set_udptl_mode(&mut self) {
        self.flags.udptl = true;
        self.srtp_in = None;
        self.srtp_out = None;
        self.jitter = None;
    }

    pub fn udptl_mode(&self) -> bool {
        self.flags.udptl
    }

    pub fn flags(&self) -> TransportFlags {
        self.flags
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn set_max_missed_packets(&mut self, max: u32) {
        self.max_missed_packets = max;
    }

    pub fn reset_media_timer(&mut self) {
        self.last_rx = Some(Instant::now());
    }

    /// Whether the inactivity timer has expired.
    pub fn media_timed_out(&self, now: Instant) -> bool {
        let (Some(last_rx), true) = (self.last_rx, self.max_missed_packets > 0) else {
            return false;
        };

        let limit =
            Duration::from_millis(u64::from(self.max_missed_packets) * u64::from(self.ptime_ms.max(1)));

        now.duration_since(last_rx) > limit
    }

    pub fn activate_rtcp(&mut self, interval: RtcpInterval, remote_port: u16, mux: bool) {
        self.rtcp = Some(RtcpConfig {
            interval,
            remote_port,
            mux,
        });
        if remote_port != 0 {
            self.remote_rtcp_port = remote_port;
        }
    }

    pub fn rtcp_interval(&self) -> Option<RtcpInterval> {
        self.rtcp.map(|r| r.interval)
    }

    pub fn activate_jitter_buffer(&mut self, jb: JitterBuffer) {
        log::debug!(
            "setting jitterbuffer to {}ms ({} frames)",
            jb.msec,
            jb.qlen
        );
        self.jitter = Some(jb);
    }

    pub fn deactivate_jitter_buffer(&mut self) {
        self.jitter = None;
    }

    pub fn pause_jitter_buffer(&mut self, paused: bool) {
        if let Some(jb) = &mut self.jitter {
            jb.paused = paused;
        }
    }

    pub fn jitter_buffer(&self) -> Option<JitterBuffer> {
        self.jitter
    }

    /// Key one SRTP direction from SDES material.
    pub fn add_crypto_key(
        &mut self,
        direction: CryptoDirection,
        tag: u32,
        profile: SrtpProfile,
        key: &[u8],
    ) {
        let _ = tag;

        let policy = match profile {
            SrtpProfile::AesCm128HmacSha1_80 => CryptoPolicy::aes_cm_128_hmac_sha1_80(),
            SrtpProfile::AesCm128HmacSha1_32 => CryptoPolicy::aes_cm_128_hmac_sha1_32(),
            SrtpProfile::AesCm128NullAuth => {
                log::warn!("null-auth srtp requested, leaving stream unauthenticated");
                return;
            }
        };

        let template = srtp::StreamPolicy {
            rtp: policy,
            rtcp: policy,
            key,
            ..Default::default()
        };

        let session = match direction {
            CryptoDirection::Send => srtp::Session::with_outbound_template(template),
            CryptoDirection::Recv => srtp::Session::with_inbound_template(template),
        };

        match (direction, session) {
            (CryptoDirection::Send, Ok(session)) => self.srtp_out = Some(session),
            (CryptoDirection::Recv, Ok(session)) => self.srtp_in = Some(session),
            (_, Err(e)) => log::error!("failed to create srtp session: {e:?}"),
        }
    }

    /// Attach a DTLS context to a component. The outbound leg acts as the
    /// DTLS client, the inbound leg as server.
    pub fn add_dtls(
        &mut self,
        ssl_context: &openssl::ssl::SslContext,
        remote_fingerprint: &DtlsFingerprint,
        setup: DtlsSetup,
        component: Component,
    ) -> std::io::Result<()> {
        let fingerprints = match (&remote_fingerprint.hash, &remote_fingerprint.value) {
            (Some(hash), Some(value)) => {
                match (digest_by_name(hash), decode_fingerprint(value)) {
                    (Some(digest), Some(raw)) => vec![(digest, raw)],
                    _ => vec![],
                }
            }
            _ => vec![],
        };

        let mut dtls = DtlsSrtpSession::new(ssl_context, fingerprints, setup)?;

        while let Some(data) = dtls.pop_to_send() {
            self.to_send.push_back(data);
        }

        match component {
            Component::Rtp => self.dtls_rtp = Some(dtls),
            Component::Rtcp => self.dtls_rtcp = Some(dtls),
        }

        Ok(())
    }

    pub fn dtls_active(&self) -> bool {
        self.dtls_rtp.is_some()
    }

    pub fn activate_ice(&mut self, component: Component, binding: IceBinding) {
        match component {
            Component::Rtp => self.ice_rtp = Some(binding),
            Component::Rtcp => self.ice_rtcp = Some(binding),
        }
    }

    pub fn ice_binding(&self, component: Component) -> Option<&IceBinding> {
        match component {
            Component::Rtp => self.ice_rtp.as_ref(),
            Component::Rtcp => self.ice_rtcp.as_ref(),
        }
    }

    /// Process one incoming datagram.
    pub fn receive(&mut self, mut data: Vec<u8>, now: Instant) -> ReceivedMedia {
        if self.flags.udptl {
            self.last_rx = Some(now);
            self.stats.in_packets += 1;
            self.stats.in_octets += data.len() as u64;
            return ReceivedMedia::Udptl(data);
        }

        match PacketKind::identify(&data) {
            PacketKind::Rtp => {
                if let Some(srtp_in) = &mut self.srtp_in {
                    if let Err(e) = srtp_in.unprotect(&mut data) {
                        log::warn!("srtp unprotect failed: {e:?}");
                        return ReceivedMedia::TransportSpecific;
                    }
                }

                let packet = match RtpPacket::parse(RtpExtensionIds::default(), data) {
                    Ok(packet) => packet,
                    Err(e) => {
                        log::warn!("failed to parse rtp packet, {e}");
                        return ReceivedMedia::TransportSpecific;
                    }
                };

                let accepted = packet.pt == self.recv_pt
                    || Some(packet.pt) == self.te_recv_pt
                    || Some(packet.pt) == self.te_pt
                    || Some(packet.pt) == self.cng_pt
                    || self.flags.proxy_media
                    || self.bugs.contains(RtpBugFlags::ACCEPT_ANY_PACKETS);

                if !accepted {
                    log::debug!("dropping rtp packet with unexpected pt {}", packet.pt);
                    return ReceivedMedia::TransportSpecific;
                }

                self.last_rx = Some(now);
                self.stats.in_packets += 1;
                self.stats.in_octets += packet.payload.len() as u64;

                ReceivedMedia::Rtp(packet)
            }
            PacketKind::Rtcp => {
                if let Some(srtp_in) = &mut self.srtp_in {
                    if let Err(e) = srtp_in.unprotect_rtcp(&mut data) {
                        log::warn!("srtcp unprotect failed: {e:?}");
                        return ReceivedMedia::TransportSpecific;
                    }
                }

                ReceivedMedia::Rtcp(data)
            }
            PacketKind::Stun => {
                // the connectivity check machine owns STUN
                ReceivedMedia::TransportSpecific
            }
            PacketKind::Dtls => {
                self.receive_dtls(data);
                ReceivedMedia::TransportSpecific
            }
            PacketKind::Unknown => ReceivedMedia::TransportSpecific,
        }
    }

    /// Process a datagram that arrived on the dedicated RTCP socket when
    /// rtcp-mux is off.
    pub fn receive_rtcp_socket(&mut self, mut data: Vec<u8>, now: Instant) -> ReceivedMedia {
        match PacketKind::identify(&data) {
            PacketKind::Rtcp => {
                if let Some(srtp_in) = &mut self.srtp_in {
                    if let Err(e) = srtp_in.unprotect_rtcp(&mut data) {
                        log::warn!("srtcp unprotect failed: {e:?}");
                        return ReceivedMedia::TransportSpecific;
                    }
                }

                self.last_rx = Some(now);
                ReceivedMedia::Rtcp(data)
            }
            PacketKind::Dtls => {
                if let Some(dtls) = self.dtls_rtcp.as_mut() {
                    dtls.receive(data);

                    if let Err(e) = dtls.drive() {
                        log::warn!("rtcp dtls handshake error: {e}");
                    }

                    while let Some(data) = dtls.pop_to_send() {
                        self.to_send.push_back(data);
                    }
                }

                ReceivedMedia::TransportSpecific
            }
            _ => ReceivedMedia::TransportSpecific,
        }
    }

    fn receive_dtls(&mut self, data: Vec<u8>) {
        let Some(dtls) = self.dtls_rtp.as_mut() else {
            return;
        };

        dtls.receive(data);

        if let Err(e) = dtls.drive() {
            log::warn!("dtls handshake error: {e}");
        }

        if let Some((inbound, outbound)) = dtls.take_srtp_pair() {
            log::info!("dtls handshake complete, srtp keys in place");
            self.srtp_in = Some(inbound);
            self.srtp_out = Some(outbound);
        }

        while let Some(data) = dtls.pop_to_send() {
            self.to_send.push_back(data);
        }
    }

    /// Queue one RTP packet for sending; the payload type and ssrc are
    /// stamped from the negotiated state.
    pub fn send_rtp(&mut self, mut packet: RtpPacket) {
        packet.pt = self.default_pt;
        packet.ssrc = self.ssrc;

        let mut data = packet.to_vec(RtpExtensionIds::default());

        if let Some(srtp_out) = &mut self.srtp_out {
            if let Err(e) = srtp_out.protect(&mut data) {
                log::error!("srtp protect failed: {e:?}");
                return;
            }
        }

        self.stats.out_packets += 1;
        self.stats.out_octets += data.len() as u64;
        self.to_send.push_back(data);
    }

    /// Send raw data (UDPTL / proxy mode).
    pub fn send_raw(&mut self, data: Vec<u8>) {
        self.stats.out_packets += 1;
        self.stats.out_octets += data.len() as u64;
        self.to_send.push_back(data);
    }

    pub fn pop_to_send(&mut self) -> Option<Vec<u8>> {
        self.to_send.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn transport() -> RtpTransport {
        RtpTransport::new(
            MediaType::Audio,
            Ipv4Addr::LOCALHOST.into(),
            5004,
            "127.0.0.1".into(),
            6004,
            8,
            0x5566,
            8000,
            20,
            TransportFlags::default(),
        )
    }

    fn rtp_datagram(pt: u8, seq: u16, ts: u32) -> Vec<u8> {
        let packet = RtpPacket {
            pt,
            sequence_number: rtp::SequenceNumber(seq),
            ssrc: Ssrc(0x1234),
            timestamp: rtp::RtpTimestamp(ts),
            extensions: Default::default(),
            payload: Bytes::from_static(&[0u8; 160]),
        };

        packet.to_vec(RtpExtensionIds::default())
    }

    #[test]
    fn rtcp_interval_bounds() {
        assert_eq!(RtcpInterval::parse("5000"), RtcpInterval::Millis(5000));
        assert_eq!(RtcpInterval::parse("passthru"), RtcpInterval::Passthru);
        // out of bounds values are substituted, not rejected
        assert_eq!(RtcpInterval::parse("99"), RtcpInterval::Millis(10_000));
        assert_eq!(RtcpInterval::parse("500001"), RtcpInterval::Millis(10_000));
    }

    #[test]
    fn jitter_buffer_spec() {
        let jb = JitterBuffer::parse("60:200:10", 20).unwrap();
        assert_eq!(jb.qlen, 3);
        assert_eq!(jb.maxqlen, 10);
        assert_eq!(jb.max_drift, 10);

        // maxqlen must stay >= 5 * qlen when unspecified or too small
        let jb = JitterBuffer::parse("2000", 20).unwrap();
        assert_eq!(jb.qlen, 100);
        assert_eq!(jb.maxqlen, 500);

        assert!(JitterBuffer::parse("19", 20).is_none());
        assert!(JitterBuffer::parse("10001", 20).is_none());
    }

    #[test]
    fn receive_filters_unexpected_payload_types() {
        let mut transport = transport();
        transport.set_recv_pt(8);

        let now = Instant::now();
        assert!(matches!(
            transport.receive(rtp_datagram(8, 1, 160), now),
            ReceivedMedia::Rtp(_)
        ));
        assert!(matches!(
            transport.receive(rtp_datagram(33, 2, 320), now),
            ReceivedMedia::TransportSpecific
        ));

        let mut bugs = RtpBugFlags::default();
        bugs.insert(RtpBugFlags::ACCEPT_ANY_PACKETS);
        transport.intentional_bugs(bugs);
        assert!(matches!(
            transport.receive(rtp_datagram(33, 3, 480), now),
            ReceivedMedia::Rtp(_)
        ));
    }

    #[test]
    fn udptl_mode_passes_data_through() {
        let mut transport = transport();
        transport.set_udptl_mode();

        let data = vec![0xff, 0xee, 0xdd];
        match transport.receive(data.clone(), Instant::now()) {
            ReceivedMedia::Udptl(out) => assert_eq!(out, data),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn media_timeout_tracking() {
        let mut transport = transport();
        transport.set_max_missed_packets(50); // 50 * 20ms = 1s

        let start = Instant::now();
        transport.reset_media_timer();

        assert!(!transport.media_timed_out(start + Duration::from_millis(900)));
        assert!(transport.media_timed_out(start + Duration::from_millis(1100)));
    }
}
