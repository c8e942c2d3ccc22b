use common::{make_leg, parse};
use media_core::{
    CallDirection, ConfigView, MediaFlag, MediaType, SdpKind, parse_crypto_line, vars,
};

mod common;

fn srtp_offer(tag: u32, suite: &str, key: &str) -> String {
    format!(
        "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/SAVP 8
a=rtpmap:8 PCMA/8000
a=crypto:{tag} {suite} inline:{key}
"
    )
}

// 30 byte keys, base64 without padding
const K1: &str = "WVNKbU5tTXhZVFEwWW1ZM05qTXlOelEwWXpJMU1t";
const K2: &str = "TURJeU5HUTBaVFEwWW1ZM05qTXlOelEwWXpJMU1t";

#[test]
fn incoming_crypto_generates_a_local_key() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_80", K1);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );

    let ssec = &leg.handle.engine(MediaType::Audio).ssec;
    assert!(ssec.remote_crypto_line.as_deref().unwrap().contains(K1));
    assert_eq!(ssec.crypto_tag, 1);

    let local = ssec.local_crypto_line.as_deref().unwrap();
    let parsed = parse_crypto_line(local).unwrap();
    assert_eq!(parsed.tag, 1);
    assert_eq!(
        parsed.profile,
        media_core::SrtpProfile::AesCm128HmacSha1_80
    );

    // negotiation published the security outcome
    assert!(leg.cfg.is_true(vars::RTP_SECURE_MEDIA));
    assert_eq!(
        leg.cfg.get(vars::RTP_HAS_CRYPTO).as_deref(),
        Some("AES_CM_128_HMAC_SHA1_80")
    );
}

#[test]
fn rekey_with_same_suite_keeps_the_local_key() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_80", K1);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle.activate(&mut leg.cfg).unwrap();

    let local_before = leg
        .handle
        .engine(MediaType::Audio)
        .ssec
        .local_raw_key
        .unwrap();

    // peer rolls its key, same suite
    leg.handle.flags.set(MediaFlag::Reinvite);
    let reoffer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_80", K2);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&reoffer), SdpKind::Offer)
            .matched
    );

    let ssec = &leg.handle.engine(MediaType::Audio).ssec;
    assert!(ssec.remote_crypto_line.as_deref().unwrap().contains(K2));
    assert_eq!(ssec.local_raw_key.unwrap(), local_before);
}

#[test]
fn suite_change_on_request_regenerates_the_local_key() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_80", K1);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle.activate(&mut leg.cfg).unwrap();

    let local_before = leg
        .handle
        .engine(MediaType::Audio)
        .ssec
        .local_raw_key
        .unwrap();

    leg.handle.flags.set(MediaFlag::Reinvite);
    let reoffer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_32", K2);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&reoffer), SdpKind::Offer)
            .matched
    );

    let ssec = &leg.handle.engine(MediaType::Audio).ssec;

    // the suite prefix changed, so the remote key was not taken over...
    assert!(ssec.remote_crypto_line.as_deref().unwrap().contains(K1));
    // ...but our own key was regenerated with the requested suite
    assert_ne!(ssec.local_raw_key.unwrap(), local_before);
    assert!(
        ssec.local_crypto_line
            .as_deref()
            .unwrap()
            .contains("AES_CM_128_HMAC_SHA1_32")
    );
}

#[test]
fn crypto_in_plain_avp_fails_the_media_line() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = format!(
        "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 8
a=rtpmap:8 PCMA/8000
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:{K1}
"
    );

    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );
}

#[test]
fn crypto_in_avp_tolerated_with_the_quirk_variable() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.cfg.set(vars::RTP_ALLOW_CRYPTO_IN_AVP, "true");

    let offer = format!(
        "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 8
a=rtpmap:8 PCMA/8000
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:{K1}
"
    );

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );
}

#[test]
fn unknown_suite_fails_the_secure_media_line() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = srtp_offer(1, "F8_128_HMAC_SHA1_80", K1);
    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );

    // the attribute was skipped, no remote key was taken
    assert!(
        leg.handle
            .engine(MediaType::Audio)
            .ssec
            .remote_crypto_line
            .is_none()
    );

    // a valid alternative line still negotiates
    let offer = format!(
        "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/SAVP 8
a=rtpmap:8 PCMA/8000
a=crypto:1 F8_128_HMAC_SHA1_80 inline:{K1}
a=crypto:2 AES_CM_128_HMAC_SHA1_80 inline:{K1}
"
    );

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
            .matched
    );
    assert_eq!(leg.handle.engine(MediaType::Audio).ssec.crypto_tag, 2);
}

#[test]
fn savp_answer_carries_exactly_one_crypto_line() {
    let mut leg = make_leg(CallDirection::Inbound);

    let offer = srtp_offer(1, "AES_CM_128_HMAC_SHA1_80", K1);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(&offer), SdpKind::Offer)
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

    assert_eq!(m.media_name.protos, vec!["RTP", "SAVP"]);

    let crypto_lines: Vec<_> = m
        .attributes
        .iter()
        .filter(|a| a.key == "crypto")
        .collect();

    assert_eq!(crypto_lines.len(), 1);
    assert!(
        crypto_lines[0]
            .value
            .as_deref()
            .unwrap()
            .contains("AES_CM_128_HMAC_SHA1_80")
    );
}

#[test]
fn secure_offer_emits_savp_and_avp_blocks() {
    let mut leg = make_leg(CallDirection::Outbound);
    leg.cfg.set(vars::RTP_SECURE_MEDIA, "true");

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let offer = leg.handle.local_sdp().unwrap();
    let offer = parse(std::str::from_utf8(&offer).unwrap());

    assert_eq!(offer.media_descriptions.len(), 2);
    assert_eq!(offer.media_descriptions[0].media_name.protos, vec!["RTP", "SAVP"]);
    assert_eq!(offer.media_descriptions[1].media_name.protos, vec!["RTP", "AVP"]);

    // crypto goes with the secure block only
    assert!(offer.media_descriptions[0].attribute("crypto").is_some());
    assert!(offer.media_descriptions[1].attribute("crypto").is_none());
}

#[test]
fn savp_only_suppresses_the_plain_block() {
    let mut leg = make_leg(CallDirection::Outbound);
    leg.cfg.set(vars::RTP_SECURE_MEDIA, "true");
    leg.cfg.set(vars::SDP_SECURE_SAVP_ONLY, "true");

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle
        .generate_local_sdp(&mut leg.cfg, None, 0, None, true)
        .unwrap();

    let offer = leg.handle.local_sdp().unwrap();
    let offer = parse(std::str::from_utf8(&offer).unwrap());

    assert_eq!(offer.media_descriptions.len(), 1);
    assert_eq!(offer.media_descriptions[0].media_name.protos, vec!["RTP", "SAVP"]);
}
