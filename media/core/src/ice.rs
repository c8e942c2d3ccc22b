//! ICE candidate negotiation: parsing candidate attributes, choosing a pair
//! per component via the candidate ACLs, and generating our own candidates.
//!
//! Connectivity checks and keepalives are the transport machinery's job; the
//! negotiator only decides which remote endpoints to talk to and what to put
//! in the SDP.

use crate::MediaType;
use crate::config::{CallDirection, ConfigView, MediaFlag, vars};
use crate::engine::{RtcpMux, RtpEngine};
use crate::secure::parse_fingerprint;
use rand::Rng;
use rand::distr::{Alphanumeric, SampleString};
use std::net::IpAddr;

/// Upper bound of candidates remembered per component.
pub const MAX_CAND: usize = 25;

/// RTP is component 1, RTCP component 2.
pub const COMPONENT_RTP: u8 = 1;
pub const COMPONENT_RTCP: u8 = 2;

#[derive(Debug, Default, Clone)]
pub struct IceCandidate {
    pub foundation: String,
    pub component_id: u8,
    pub transport: String,
    pub priority: u64,
    pub con_addr: String,
    pub con_port: u16,
    pub cand_type: Option<String>,
    pub raddr: Option<String>,
    pub rport: Option<u16>,
    pub generation: Option<String>,
    /// Incremented whenever the candidate survives a readiness transition.
    pub ready: u32,
}

/// One direction of ICE state (remote = in, local = out).
#[derive(Debug, Default, Clone)]
pub struct IceSide {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub options: Option<String>,
    /// Candidate table per component.
    pub cands: [Vec<IceCandidate>; 2],
    /// Chosen index into `cands` per component.
    pub chosen: [Option<usize>; 2],
}

impl IceSide {
    pub fn chosen_candidate(&self, component: u8) -> Option<&IceCandidate> {
        let idx = self.chosen[(component - 1) as usize]?;
        self.cands[(component - 1) as usize].get(idx)
    }

    fn chosen_candidate_mut(&mut self, component: u8) -> Option<&mut IceCandidate> {
        let idx = self.chosen[(component - 1) as usize]?;
        self.cands[(component - 1) as usize].get_mut(idx)
    }

    /// A component is usable only once its chosen candidate is ready, which
    /// requires ufrag and pwd to have been seen.
    pub fn component_ready(&self, component: u8) -> bool {
        self.ufrag.is_some()
            && self.pwd.is_some()
            && self
                .chosen_candidate(component)
                .is_some_and(|c| c.ready > 0)
    }

    pub fn clear_choices(&mut self) {
        self.chosen = [None, None];
        self.cands[0].clear();
        self.cands[1].clear();
    }
}

/// A local subnet used by the `localnet.auto` ACL.
#[derive(Debug, Clone, Copy)]
pub struct LocalNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl LocalNet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - self.prefix.min(32) as u32);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - self.prefix.min(128) as u32);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Match an address string against a named ACL.
///
/// The built-in names mirror the well known auto lists; anything else is
/// interpreted as a comma separated list of `addr/prefix` entries.
pub fn ip_in_acl(acl: &str, addr: &str, local_nets: &[LocalNet]) -> bool {
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return false;
    };

    match acl {
        "wan.auto" => !ip.is_loopback() && !is_private(&ip),
        "localnet.auto" => {
            ip.is_loopback() || is_private(&ip) || local_nets.iter().any(|n| n.contains(&ip))
        }
        "loopback.auto" => ip.is_loopback(),
        "rfc1918.auto" => is_private(&ip),
        list => list.split(',').any(|entry| {
            let entry = entry.trim();
            let (net, prefix) = match entry.split_once('/') {
                Some((net, prefix)) => (net, prefix),
                None => (entry, if entry.contains(':') { "128" } else { "32" }),
            };

            match (net.parse::<IpAddr>(), prefix.parse::<u8>()) {
                (Ok(net), Ok(prefix)) => LocalNet { addr: net, prefix }.contains(&ip),
                _ => false,
            }
        }),
    }
}

/// Parse one `a=candidate` attribute value.
///
/// `<foundation> <component> <transport> <priority> <addr> <port> [typ <t>]
/// [raddr <ip>] [rport <port>] [generation <n>]`. Lines with too few fields
/// or a non-numeric core are rejected and skipped by the caller.
pub fn parse_candidate(value: &str) -> Option<IceCandidate> {
    let fields: Vec<&str> = value.split_whitespace().collect();

    if fields.len() < 6 {
        return None;
    }

    let mut cand = IceCandidate {
        foundation: fields[0].to_string(),
        component_id: fields[1].parse().ok()?,
        transport: fields[2].to_string(),
        priority: fields[3].parse().ok()?,
        con_addr: fields[4].to_string(),
        con_port: fields[5].parse().ok()?,
        ..Default::default()
    };

    let mut j = 6;
    while j + 1 < fields.len() {
        match fields[j].to_ascii_lowercase().as_str() {
            "typ" => cand.cand_type = Some(fields[j + 1].to_string()),
            "raddr" => cand.raddr = Some(fields[j + 1].to_string()),
            "rport" => cand.rport = fields[j + 1].parse().ok(),
            "generation" => cand.generation = Some(fields[j + 1].to_string()),
            _ => {}
        }
        j += 2;
    }

    Some(cand)
}

/// RFC 5245 candidate priority for our host candidates.
pub fn host_priority(component: u8) -> u32 {
    (126 << 24) + (65535 << 8) + (256 - component as u32)
}

/// Priority for the server-reflexive candidate we advertise alongside.
pub fn srflx_priority(component: u8) -> u32 {
    (100 << 24) + (65535 << 8) + (256 - component as u32)
}

fn random_digits(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len).map(|_| char::from(b'0' + rng.random_range(0..10))).collect()
}

fn random_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

/// Scan one attribute list (session level when `m` is `None`, media level
/// otherwise) and negotiate the engine's incoming ICE state.
pub(crate) fn check_ice(
    handle: &mut crate::MediaHandle,
    cfg: &mut dyn ConfigView,
    media_type: MediaType,
    session: &sdp::SessionDescription,
    m: Option<&sdp::MediaDescription>,
) {
    let reinvite = handle.flags.test(MediaFlag::Reinvite);
    let dtls_available = handle.flags.test(MediaFlag::DtlsOk);
    let local_nets = handle.env.local_nets();

    let engine = handle.engine_mut(media_type);

    if engine.ice_in.chosen[0].is_some() && engine.ice_in.chosen[1].is_some() && !reinvite {
        return;
    }

    engine.ice_in.clear_choices();

    let mut got_rtcp_mux = false;
    let mut need_local_fingerprint = false;
    let mut saw_candidate = false;

    let attrs: &[sdp::description::common::Attribute] = match m {
        Some(m) => &m.attributes,
        None => &session.attributes,
    };

    for attr in attrs {
        let value = attr.value.as_deref().unwrap_or("");

        if attr.key.eq_ignore_ascii_case("ice-ufrag") {
            engine.ice_in.ufrag = Some(value.to_string());
        } else if attr.key.eq_ignore_ascii_case("ice-pwd") {
            engine.ice_in.pwd = Some(value.to_string());
        } else if attr.key.eq_ignore_ascii_case("ice-options") {
            engine.ice_in.options = Some(value.to_string());
        } else if dtls_available && attr.key.eq_ignore_ascii_case("fingerprint") && !value.is_empty() {
            match parse_fingerprint(value) {
                Some((hash, digest)) if hash.eq_ignore_ascii_case("sha-256") => {
                    engine.remote_dtls_fingerprint.hash = Some(hash);
                    engine.remote_dtls_fingerprint.value = Some(digest);
                    need_local_fingerprint = true;
                }
                Some((hash, _)) => {
                    log::warn!("unsupported fingerprint type {hash}");
                    engine.local_dtls_fingerprint.clear();
                    engine.remote_dtls_fingerprint.clear();
                }
                None => {}
            }
        } else if engine.remote_ssrc == 0 && attr.key.eq_ignore_ascii_case("ssrc") && !value.is_empty() {
            if let Some(ssrc) = value.split_whitespace().next().and_then(|v| v.parse().ok()) {
                engine.remote_ssrc = ssrc;
            }
        } else if attr.key.eq_ignore_ascii_case("rtcp-mux") {
            engine.rtcp_mux = RtcpMux::Enabled;
            engine.remote_rtcp_port = engine.codec_params.remote_port;
            got_rtcp_mux = true;
        } else if attr.key.eq_ignore_ascii_case("candidate") {
            saw_candidate = true;

            if engine.cand_acl.is_empty() {
                log::warn!("no candidate ACL defined, defaulting to wan.auto");
                engine.cand_acl.push("wan.auto".to_string());
            }

            let Some(cand) = parse_candidate(value) else {
                log::warn!("invalid candidate line [{value}]");
                continue;
            };

            if !cand.transport.eq_ignore_ascii_case("udp") {
                continue;
            }

            let cid = match cand.component_id {
                1 | 2 => (cand.component_id - 1) as usize,
                _ => continue,
            };

            if engine.ice_in.cands[cid].len() >= MAX_CAND {
                log::warn!("too many candidates, ignoring the rest");
                continue;
            }

            log::debug!(
                "checking {media_type:?} candidate cid: {} addr: {}:{}",
                cand.component_id,
                cand.con_addr,
                cand.con_port
            );

            engine.ice_in.cands[cid].push(cand);
            let idx = engine.ice_in.cands[cid].len() - 1;

            for acl in engine.cand_acl.clone() {
                let chooses = engine.ice_in.chosen[cid].is_none()
                    && ip_in_acl(&acl, &engine.ice_in.cands[cid][idx].con_addr, &local_nets);

                let cand = &mut engine.ice_in.cands[cid][idx];

                if chooses {
                    cand.ready += 1;
                    log::info!(
                        "choose {media_type:?} candidate cid: {} addr: {}:{}",
                        cand.component_id,
                        cand.con_addr,
                        cand.con_port
                    );
                    engine.ice_in.chosen[cid] = Some(idx);
                } else {
                    log::debug!(
                        "save {media_type:?} candidate cid: {} addr: {}:{}",
                        cand.component_id,
                        cand.con_addr,
                        cand.con_port
                    );
                }

                // only the first ACL is consulted per candidate
                break;
            }
        }
    }

    // No ACL-selected candidate, fall back to sane deduction:
    // same-network candidates first
    for cid in 0..2 {
        if engine.ice_in.chosen[cid].is_some() {
            continue;
        }

        let found = engine.ice_in.cands[cid].iter().position(|c| {
            c.component_id as usize == cid + 1
                && c.rport.is_none()
                && ip_in_acl("localnet.auto", &c.con_addr, &local_nets)
        });

        if let Some(idx) = found {
            engine.ice_in.chosen[cid] = Some(idx);
            engine.ice_in.cands[cid][idx].ready += 1;
            log::info!("no {media_type:?} component {} candidate matched, defaulting to the first local one", cid + 1);
        }
    }

    // then reflexive candidates
    for cid in 0..2 {
        if engine.ice_in.chosen[cid].is_some() {
            continue;
        }

        let found = engine.ice_in.cands[cid]
            .iter()
            .position(|c| c.component_id as usize == cid + 1 && c.rport.is_some());

        if let Some(idx) = found {
            engine.ice_in.chosen[cid] = Some(idx);
            engine.ice_in.cands[cid][idx].ready += 1;
            log::info!("no {media_type:?} component {} candidate matched, defaulting to the first srflx one", cid + 1);
        }
    }

    // then anything, hoping for auto-adjust
    for cid in 0..2 {
        if engine.ice_in.chosen[cid].is_some() {
            continue;
        }

        let found = engine.ice_in.cands[cid]
            .iter()
            .position(|c| c.component_id as usize == cid + 1);

        if let Some(idx) = found {
            engine.ice_in.chosen[cid] = Some(idx);
            engine.ice_in.cands[cid][idx].ready += 1;
            log::info!("no {media_type:?} component {} candidate matched, defaulting to the first one", cid + 1);
        }
    }

    // a candidate can only be ready once credentials are known
    if engine.ice_in.ufrag.is_none() || engine.ice_in.pwd.is_none() {
        for component in [COMPONENT_RTP, COMPONENT_RTCP] {
            if let Some(cand) = engine.ice_in.chosen_candidate_mut(component) {
                cand.ready = 0;
            }
        }
    }

    // mirror the chosen pair onto the engine's remote endpoints
    let rtp_choice = engine
        .ice_in
        .chosen_candidate(COMPONENT_RTP)
        .map(|c| (c.con_addr.clone(), c.con_port));

    if let Some((addr, port)) = rtp_choice {
        if !addr.is_empty() && port != 0 {
            log::info!("setting remote {media_type:?} addr to {addr}:{port} based on candidate");

            engine.remote_rtp_ice_addr = Some(addr.clone());
            engine.remote_rtp_ice_port = port;
            engine.codec_params.remote_ip = Some(addr.clone());
            engine.codec_params.remote_port = port;

            if let Some(cand) = engine.ice_in.chosen_candidate_mut(COMPONENT_RTP) {
                cand.ready += 1;
            }

            let (ip_var, port_var) = match media_type {
                MediaType::Audio => (vars::REMOTE_MEDIA_IP, vars::REMOTE_MEDIA_PORT),
                MediaType::Video => (vars::REMOTE_VIDEO_IP, vars::REMOTE_VIDEO_PORT),
            };
            cfg.set(ip_var, &addr);
            cfg.set(port_var, &port.to_string());
        }
    }

    let rtcp_choice = engine
        .ice_in
        .chosen_candidate(COMPONENT_RTCP)
        .map(|c| (c.con_addr.clone(), c.con_port));

    if let Some((addr, port)) = rtcp_choice {
        if port != 0 {
            log::info!("setting remote rtcp {media_type:?} addr to {addr}:{port} based on candidate");
            engine.remote_rtcp_ice_addr = Some(addr);
            engine.remote_rtcp_ice_port = port;
            engine.remote_rtcp_port = port;
        }
    }

    // media level parse without a mux attribute explicitly disables mux
    if m.is_some() && !got_rtcp_mux {
        engine.rtcp_mux = RtcpMux::Disabled;
    }

    if saw_candidate {
        handle.flags.set(MediaFlag::Ice);
    }

    if need_local_fingerprint {
        let fingerprint = handle.env.local_fingerprint_sha256();
        let engine = handle.engine_mut(media_type);
        if !engine.local_dtls_fingerprint.is_set() {
            engine.local_dtls_fingerprint.hash = Some("sha-256".to_string());
            engine.local_dtls_fingerprint.value = Some(fingerprint);
        }
        handle.flags.set(MediaFlag::Dtls);
    }

    if reinvite {
        reactivate_ice(handle, media_type);
    }
}

/// Re-apply ICE onto a live transport after a re-offer.
fn reactivate_ice(handle: &mut crate::MediaHandle, media_type: MediaType) {
    let direction = handle.direction;
    let engine = handle.engine_mut(media_type);

    if engine.transport.is_none() || !engine.ice_in.component_ready(COMPONENT_RTP) {
        return;
    }

    log::info!("re-activating {media_type:?} ICE");

    let controlling = direction == CallDirection::Outbound;
    let binding = engine.ice_binding(controlling);

    let rtcp_same = match (
        engine.ice_in.chosen_candidate(COMPONENT_RTP),
        engine.ice_in.chosen_candidate(COMPONENT_RTCP),
    ) {
        (Some(rtp), Some(rtcp)) => {
            rtp.con_addr == rtcp.con_addr && rtp.con_port == rtcp.con_port
        }
        _ => false,
    };

    let rtcp_ready = engine.ice_in.component_ready(COMPONENT_RTCP);

    if let Some(transport) = &mut engine.transport {
        transport.activate_ice(crate::transport::Component::Rtp, binding.clone());

        if rtcp_ready {
            if rtcp_same {
                log::info!("skipping {media_type:?} RTCP ICE (same as RTP)");
            } else {
                log::info!("activating {media_type:?} RTCP ICE");
                transport.activate_ice(crate::transport::Component::Rtcp, binding);
            }
        }
    }
}

/// Populate the engine's outgoing ICE state (and the session-wide msid and
/// cname) so local candidates can be emitted.
pub(crate) fn gen_ice(
    handle: &mut crate::MediaHandle,
    media_type: MediaType,
    ip: Option<&str>,
    port: u16,
) {
    if handle.msid.is_none() {
        handle.msid = Some(random_token(32));
    }

    if handle.cname.is_none() {
        handle.cname = Some(random_token(16));
    }

    let engine = handle.engine_mut(media_type);

    if matches!(engine.rtcp_mux, RtcpMux::Unknown) {
        engine.rtcp_mux = RtcpMux::Enabled;
    }

    if engine.ice_out.ufrag.is_none() {
        engine.ice_out.ufrag = Some(random_token(16));
    }

    if engine.ice_out.pwd.is_none() {
        engine.ice_out.pwd = Some(random_token(16));
    }

    if engine.ice_out.cands[0].is_empty() {
        engine.ice_out.cands[0].push(IceCandidate {
            foundation: random_digits(10),
            component_id: COMPONENT_RTP,
            transport: "udp".to_string(),
            priority: host_priority(COMPONENT_RTP) as u64,
            generation: Some("0".to_string()),
            ..Default::default()
        });
        engine.ice_out.chosen[0] = Some(0);
    }

    let cand = &mut engine.ice_out.cands[0][0];

    if let Some(ip) = ip {
        if !ip.is_empty() {
            cand.con_addr = ip.to_string();
        }
    }

    if port != 0 {
        cand.con_port = port;
    }

    cand.ready = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_parse_full() {
        let c = parse_candidate(
            "3309356776 1 udp 2113937151 192.168.1.5 5000 typ host generation 0",
        )
        .unwrap();
        assert_eq!(c.component_id, 1);
        assert_eq!(c.con_addr, "192.168.1.5");
        assert_eq!(c.con_port, 5000);
        assert_eq!(c.cand_type.as_deref(), Some("host"));
        assert_eq!(c.rport, None);
    }

    #[test]
    fn candidate_parse_srflx() {
        let c = parse_candidate(
            "842163049 1 udp 1677729535 203.0.113.7 5000 typ srflx raddr 192.168.1.5 rport 5000",
        )
        .unwrap();
        assert_eq!(c.cand_type.as_deref(), Some("srflx"));
        assert_eq!(c.raddr.as_deref(), Some("192.168.1.5"));
        assert_eq!(c.rport, Some(5000));
    }

    #[test]
    fn candidate_parse_too_short() {
        assert!(parse_candidate("12345 1 udp 2113937151").is_none());
    }

    #[test]
    fn candidate_parse_bad_numbers() {
        assert!(parse_candidate("f 1 udp notanumber 10.0.0.1 5000").is_none());
    }

    #[test]
    fn acl_auto_lists() {
        assert!(ip_in_acl("localnet.auto", "192.168.1.5", &[]));
        assert!(!ip_in_acl("localnet.auto", "203.0.113.7", &[]));
        assert!(ip_in_acl("wan.auto", "203.0.113.7", &[]));
        assert!(!ip_in_acl("wan.auto", "127.0.0.1", &[]));
        assert!(ip_in_acl("loopback.auto", "127.0.0.1", &[]));
    }

    #[test]
    fn acl_cidr_list() {
        assert!(ip_in_acl("10.0.0.0/8,172.16.0.0/12", "10.1.2.3", &[]));
        assert!(!ip_in_acl("10.0.0.0/8", "11.1.2.3", &[]));
    }

    #[test]
    fn component_priority_formula() {
        assert_eq!(host_priority(1), (1 << 24) * 126 + (1 << 8) * 65535 + 255);
        assert_eq!(host_priority(2), (1 << 24) * 126 + (1 << 8) * 65535 + 254);
        assert!(host_priority(1) > srflx_priority(1));
    }
}
