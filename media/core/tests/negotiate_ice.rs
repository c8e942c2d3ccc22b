use common::{make_leg, parse};
use media_core::{
    CallDirection, ConfigView, MediaFlag, MediaParams, MediaType, NatTable, RtcpMux, SdpKind, vars,
};

mod common;

const ICE_OFFER: &str = "v=0
o=peer 1 1 IN IP4 192.168.1.5
s=call
c=IN IP4 192.168.1.5
t=0 0
m=audio 5000 RTP/AVP 0
a=rtpmap:0 PCMU/8000
a=ice-ufrag:F7gI
a=ice-pwd:x9cml/YzichV2+XlhiMu8g
a=candidate:3309356776 1 udp 2113937151 192.168.1.5 5000 typ host generation 0
a=candidate:842163049 1 udp 1677729535 203.0.113.7 5000 typ srflx raddr 192.168.1.5 rport 5000 generation 0
";

#[test]
fn acl_selected_candidate_drives_the_remote_endpoint() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.add_ice_acl(MediaType::Audio, "localnet.auto");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(ICE_OFFER), SdpKind::Offer)
            .matched
    );

    let engine = leg.handle.engine(MediaType::Audio);

    // the host candidate on the local network wins
    let chosen = engine.ice_in.chosen_candidate(1).unwrap();
    assert_eq!(chosen.con_addr, "192.168.1.5");
    assert_eq!(chosen.cand_type.as_deref(), Some("host"));
    assert!(chosen.ready > 0);

    // the engine's remote endpoint mirrors the chosen candidate
    assert_eq!(engine.codec_params.remote_ip.as_deref(), Some("192.168.1.5"));
    assert_eq!(engine.codec_params.remote_port, 5000);
    assert_eq!(engine.remote_rtp_ice_port, 5000);

    assert!(leg.handle.flags.test(MediaFlag::Ice));
}

#[test]
fn wan_acl_prefers_the_reflexive_candidate() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.add_ice_acl(MediaType::Audio, "wan.auto");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(ICE_OFFER), SdpKind::Offer)
            .matched
    );

    let engine = leg.handle.engine(MediaType::Audio);
    let chosen = engine.ice_in.chosen_candidate(1).unwrap();
    assert_eq!(chosen.con_addr, "203.0.113.7");
    assert_eq!(chosen.cand_type.as_deref(), Some("srflx"));
}

#[test]
fn candidate_without_credentials_is_not_ready() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.add_ice_acl(MediaType::Audio, "localnet.auto");

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.5
s=call
c=IN IP4 192.168.1.5
t=0 0
m=audio 5000 RTP/AVP 0
a=rtpmap:0 PCMU/8000
a=candidate:3309356776 1 udp 2113937151 192.168.1.5 5000 typ host generation 0
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    let engine = leg.handle.engine(MediaType::Audio);
    assert!(!engine.ice_in.component_ready(1));
}

#[test]
fn media_level_mux_attribute_is_tristate() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.5
s=call
c=IN IP4 192.168.1.5
t=0 0
m=audio 5000 RTP/AVP 0
a=rtpmap:0 PCMU/8000
a=rtcp-mux
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    let engine = leg.handle.engine(MediaType::Audio);
    assert_eq!(engine.rtcp_mux, RtcpMux::Enabled);
    // muxed RTCP shares the media port
    assert_eq!(engine.remote_rtcp_port, 5000);

    // a media section without the attribute explicitly disables mux
    let mut leg = make_leg(CallDirection::Inbound);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(common::G711_OFFER), SdpKind::Offer)
            .matched
    );
    assert_eq!(
        leg.handle.engine(MediaType::Audio).rtcp_mux,
        RtcpMux::Disabled
    );
}

#[test]
fn rtcp_attribute_port_follows_the_mux_state() {
    // mux on: the rtcp attribute names the media port itself
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTCP_AUDIO_INTERVAL_MSEC, "5000");

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.5
s=call
c=IN IP4 192.168.1.5
t=0 0
m=audio 5000 RTP/AVP 0
a=rtpmap:0 PCMU/8000
a=rtcp-mux
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let answer = leg.handle.local_sdp().unwrap();
    let answer = parse(std::str::from_utf8(&answer).unwrap());
    let m = &answer.media_descriptions[0];

    assert!(m.has_attribute("rtcp-mux"));
    let rtcp = m.attribute("rtcp").unwrap().unwrap();
    let rtcp_port: u16 = rtcp.split_whitespace().next().unwrap().parse().unwrap();
    assert_eq!(i64::from(rtcp_port), m.media_name.port.value as i64);

    // mux off: media port + 1
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTCP_AUDIO_INTERVAL_MSEC, "5000");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(common::G711_OFFER), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let answer = leg.handle.local_sdp().unwrap();
    let answer = parse(std::str::from_utf8(&answer).unwrap());
    let m = &answer.media_descriptions[0];

    assert!(!m.has_attribute("rtcp-mux"));
    let rtcp = m.attribute("rtcp").unwrap().unwrap();
    let rtcp_port: i64 = rtcp.split_whitespace().next().unwrap().parse().unwrap();
    assert_eq!(rtcp_port, m.media_name.port.value as i64 + 1);
}

#[test]
fn nat_rewrites_the_advertised_candidates() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sink = media_core::CollectingSink::default();
    let env = media_core::MediaEnvironment::new()
        .with_ports(media_core::PortPool::new(30000, 31000))
        .with_nat(NatTable::with_offset(0))
        .with_events(sink);

    let params = MediaParams {
        rtp_ip: "192.168.1.20".parse().unwrap(),
        ext_rtp_ip: Some("203.0.113.99".into()),
        ext_sip_ip: Some("203.0.113.99".into()),
        remote_ip: Some("203.0.113.50".into()),
        inbound_codec_string: "PCMU".into(),
        outbound_codec_string: "PCMU".into(),
        ..Default::default()
    };

    let mut handle = media_core::MediaHandle::new(env, params, CallDirection::Inbound);
    let mut cfg = media_core::MemoryConfig::new();

    handle.add_ice_acl(MediaType::Audio, "localnet.auto");

    assert!(
        handle
            .negotiate(&mut cfg, &parse(ICE_OFFER), SdpKind::Offer)
            .matched
    );

    handle.choose_port(&mut cfg, MediaType::Audio, false).unwrap();

    // NAT detected: the advertised address differs from the bound one
    let params = &handle.engine(MediaType::Audio).codec_params;
    assert_eq!(params.adv_ip.as_deref(), Some("203.0.113.99"));
    assert_eq!(params.local_ip.unwrap().to_string(), "192.168.1.20");

    handle.generate_local_sdp(&mut cfg, None, 0, None, true).unwrap();

    let local = handle.local_sdp().unwrap();
    let local = parse(std::str::from_utf8(&local).unwrap());
    let m = &local.media_descriptions[0];

    let candidates: Vec<&str> = m
        .attributes
        .iter()
        .filter(|a| a.key == "candidate")
        .filter_map(|a| a.value.as_deref())
        .collect();

    assert!(!candidates.is_empty());
    assert!(candidates.iter().any(|c| c.contains("typ host")));
    assert!(
        candidates
            .iter()
            .any(|c| c.contains("typ srflx") && c.contains("raddr 192.168.1.20")),
        "expected a reflexive candidate advertising the bound address: {candidates:?}"
    );
}
