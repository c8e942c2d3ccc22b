use common::{G711_OFFER, make_leg, parse};
use media_core::{CallDirection, ConfigView, DtmfType, MediaFlag, MediaType, SdpKind, vars};

mod common;

#[test]
fn generous_policy_picks_peer_ordered_first_match() {
    let mut leg = make_leg(CallDirection::Inbound);

    let result = leg
        .handle
        .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer);
    assert!(result.matched);

    let params = &leg.handle.engine(MediaType::Audio).codec_params;
    assert_eq!(params.iananame.as_deref(), Some("PCMU"));
    assert_eq!(params.agreed_pt, 0);
    assert_eq!(params.recv_pt, 0);
    assert_eq!(params.remote_ip.as_deref(), Some("192.168.1.10"));
    assert_eq!(params.remote_port, 5004);

    assert_eq!(leg.handle.te, 101);
    assert_eq!(leg.handle.dtmf_type, DtmfType::Rfc2833);
}

#[test]
fn greedy_policy_walks_local_preferences_first() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_CODEC_NEGOTIATION, "greedy");

    let result = leg
        .handle
        .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer);
    assert!(result.matched);

    let params = &leg.handle.engine(MediaType::Audio).codec_params;
    assert_eq!(params.iananame.as_deref(), Some("PCMA"));
    assert_eq!(params.agreed_pt, 8);
}

#[test]
fn scrooge_policy_binds_its_own_codec() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_CODEC_NEGOTIATION, "scrooge");

    let result = leg
        .handle
        .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer);
    assert!(result.matched);

    assert_eq!(
        leg.handle
            .engine(MediaType::Audio)
            .codec_params
            .agreed_pt,
        8
    );
}

#[test]
fn answer_carries_exactly_the_negotiated_payloads() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_CODEC_NEGOTIATION, "greedy");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer)
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

    assert_eq!(answer.media_descriptions.len(), 1);
    let m = &answer.media_descriptions[0];

    assert_eq!(m.media_name.media, "audio");
    assert_eq!(m.media_name.protos, vec!["RTP", "AVP"]);
    assert_eq!(m.media_name.formats, vec!["8", "101"]);

    assert_eq!(m.attribute("ptime"), Some(Some("20")));
    assert!(m.attribute("crypto").is_none());
    assert_eq!(m.attribute("rtpmap"), Some(Some("8 PCMA/8000")));
    assert!(m.has_attribute("sendrecv"));
}

#[test]
fn near_match_salvages_at_the_peers_ptime() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0
a=rtpmap:0 PCMU/8000
a=ptime:30
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    let params = &leg.handle.engine(MediaType::Audio).codec_params;
    assert_eq!(params.iananame.as_deref(), Some("PCMU"));
    assert_eq!(params.ptime, 30);
}

#[test]
fn near_match_respects_maxptime() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::ABSOLUTE_CODEC_STRING, "GSM");

    // GSM cannot be packed into 10 ms, so the salvage has to give up
    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 3
a=rtpmap:3 GSM/8000
a=ptime:30
a=maxptime:10
";

    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );
}

#[test]
fn comfort_noise_payload_is_recorded() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0 13
a=rtpmap:0 PCMU/8000
a=rtpmap:13 CN/8000
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );
    assert_eq!(leg.handle.cng_pt, 13);
}

#[test]
fn suppressed_cng_never_surfaces() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::SuppressCng);

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0 13
a=rtpmap:0 PCMU/8000
a=rtpmap:13 CN/8000
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );
    assert_eq!(leg.handle.cng_pt, 0);

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let answer = leg.handle.local_sdp().unwrap();
    let answer = parse(std::str::from_utf8(&answer).unwrap());
    let m = &answer.media_descriptions[0];

    for attr in &m.attributes {
        if attr.key == "rtpmap" {
            assert!(
                !attr.value.as_deref().unwrap_or("").contains("CN/"),
                "CN rtpmap must not be emitted when CNG is suppressed"
            );
        }
    }
    assert!(m.has_attribute("silenceSupp"));
}

#[test]
fn unchanged_reoffer_keeps_the_bound_codec() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_CODEC_NEGOTIATION, "greedy");

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 8
a=rtpmap:8 PCMA/8000
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    let before = leg.handle.engine(MediaType::Audio).codec_params.clone();

    leg.handle.flags.set(MediaFlag::Reinvite);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    let after = &leg.handle.engine(MediaType::Audio).codec_params;
    assert_eq!(after.agreed_pt, before.agreed_pt);
    assert_eq!(after.recv_pt, before.recv_pt);
    assert_eq!(after.remote_ip, before.remote_ip);
    assert_eq!(after.remote_port, before.remote_port);
}

#[test]
fn missing_telephone_event_falls_back_to_info() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0
a=rtpmap:0 PCMU/8000
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    assert_eq!(leg.handle.te, 0);
    assert_eq!(leg.handle.dtmf_type, DtmfType::Info);
    assert_eq!(leg.cfg.get(vars::DTMF_TYPE).as_deref(), Some("info"));
}

#[test]
fn liberal_dtmf_asserts_the_configured_payload() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_LIBERAL_DTMF, "true");

    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0
a=rtpmap:0 PCMU/8000
";

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );

    assert_eq!(leg.handle.te, 101);
    assert_eq!(leg.handle.dtmf_type, DtmfType::Rfc2833);
}

#[test]
fn offered_payload_types_are_pairwise_distinct() {
    let mut leg = make_leg(CallDirection::Outbound);
    leg.cfg
        .set(vars::ABSOLUTE_CODEC_STRING, "PCMU,PCMA,opus,iLBC,G722");

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let offer = leg.handle.local_sdp().unwrap();
    let offer = parse(std::str::from_utf8(&offer).unwrap());

    let mut seen = std::collections::HashSet::new();
    for m in &offer.media_descriptions {
        for format in &m.media_name.formats {
            assert!(
                seen.insert(format.clone()),
                "payload type {format} appears twice"
            );
        }
        seen.clear();
    }
}

#[test]
fn g711_requires_matching_sample_rate() {
    let mut leg = make_leg(CallDirection::Inbound);

    // PCMA at a 16 kHz clock never matches our 8 kHz implementation
    let offer = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 96
a=rtpmap:96 PCMA/16000
";

    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(offer), SdpKind::Offer)
            .matched
    );
}
