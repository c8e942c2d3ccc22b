use common::{G711_OFFER, make_leg, parse};
use media_core::{CallDirection, ConfigView, MediaEvent, MediaFlag, MediaType, SdpKind, vars};

mod common;

const T38_REOFFER: &str = "v=0
o=peer 1 2 IN IP4 192.168.1.66
s=fax
c=IN IP4 192.168.1.66
t=0 0
m=image 5006 udptl t38
a=T38FaxVersion:0
a=T38MaxBitRate:14400
a=T38FaxRateManagement:transferredTCF
a=T38FaxMaxBuffer:1800
a=T38FaxMaxDatagram:400
a=T38FaxUdpEC:t38UDPRedundancy
";

fn answered_g711_leg() -> common::TestLeg {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::Answered);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle.activate(&mut leg.cfg).unwrap();

    leg
}

#[test]
fn image_reoffer_parses_the_t38_options() {
    let mut leg = answered_g711_leg();
    leg.handle.flags.set(MediaFlag::Reinvite);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(T38_REOFFER), SdpKind::Offer)
            .matched
    );

    let t38 = leg.handle.t38_options().unwrap();
    assert_eq!(t38.fax_version, 0);
    assert_eq!(t38.max_bit_rate, 14_400);
    assert_eq!(t38.rate_management, "transferredTCF");
    assert_eq!(t38.max_buffer, 1800);
    assert_eq!(t38.max_datagram, 400);
    assert_eq!(t38.remote_ip.as_deref(), Some("192.168.1.66"));
    assert_eq!(t38.remote_port, 5006);

    assert!(leg.cfg.is_true(vars::HAS_T38));
    assert!(leg.handle.flags.test(MediaFlag::T38));
}

#[test]
fn passthrough_retargets_audio_and_asks_the_partner_for_image_media() {
    let mut leg = answered_g711_leg();
    leg.handle.flags.set(MediaFlag::Reinvite);
    leg.handle.set_partner_answered(true);
    leg.cfg.set(vars::T38_PASSTHRU, "true");
    leg.sink.take();

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(T38_REOFFER), SdpKind::Offer)
            .matched
    );

    assert!(leg.handle.flags.test(MediaFlag::T38Passthru));
    assert!(leg.cfg.is_true(vars::T38_PASSTHRU));

    // the audio engine now points at the fax peer
    let engine = leg.handle.engine(MediaType::Audio);
    assert_eq!(engine.codec_params.remote_ip.as_deref(), Some("192.168.1.66"));
    assert_eq!(engine.codec_params.remote_port, 5006);
    assert_eq!(
        engine.transport.as_ref().unwrap().remote_host(),
        "192.168.1.66"
    );
    assert_eq!(engine.transport.as_ref().unwrap().remote_port(), 5006);

    // and the partner leg was asked to mirror the image m-line
    let events = leg.sink.take();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, MediaEvent::RequestImageMedia { sdp } if sdp.contains("m=image")))
    );
}

#[test]
fn passthrough_requires_an_answered_partner() {
    let mut leg = answered_g711_leg();
    leg.handle.flags.set(MediaFlag::Reinvite);
    leg.handle.set_partner_answered(false);
    leg.cfg.set(vars::T38_PASSTHRU, "true");
    leg.sink.take();

    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(T38_REOFFER), SdpKind::Offer)
            .matched
    );

    assert!(!leg.handle.flags.test(MediaFlag::T38Passthru));
    assert!(leg.sink.take().is_empty());
}

#[test]
fn refusing_t38_rejects_the_switchover() {
    let mut leg = answered_g711_leg();
    leg.handle.flags.set(MediaFlag::Reinvite);
    leg.cfg.set(vars::REFUSE_T38, "true");

    assert!(
        !leg.handle
            .negotiate(&mut leg.cfg, &parse(T38_REOFFER), SdpKind::Offer)
            .matched
    );
    assert!(!leg.handle.flags.test(MediaFlag::T38));
}

#[test]
fn udptl_mode_switches_the_audio_stream() {
    let mut leg = answered_g711_leg();

    leg.handle
        .receive_message(&mut leg.cfg, media_core::MediaMessage::UdptlMode)
        .unwrap();

    assert!(
        leg.handle
            .engine(MediaType::Audio)
            .transport
            .as_ref()
            .unwrap()
            .udptl_mode()
    );
}

#[test]
fn image_answer_mirrors_the_options() {
    let mut leg = answered_g711_leg();
    leg.handle.flags.set(MediaFlag::Reinvite);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(T38_REOFFER), SdpKind::Offer)
            .matched
    );

    let t38 = leg.handle.t38_options().unwrap().clone();
    leg.handle
        .generate_udptl_image_sdp(&mut leg.cfg, &t38)
        .unwrap();

    let answer = leg.handle.local_sdp().unwrap();
    let answer = parse(std::str::from_utf8(&answer).unwrap());

    assert_eq!(answer.media_descriptions.len(), 1);
    let m = &answer.media_descriptions[0];

    assert_eq!(m.media_name.media, "image");
    assert_eq!(m.media_name.protos, vec!["udptl"]);
    assert_eq!(m.media_name.formats, vec!["t38"]);
    assert_eq!(m.attribute("T38MaxBitRate"), Some(Some("14400")));
    assert_eq!(m.attribute("T38FaxUdpEC"), Some(Some("t38UDPRedundancy")));
}
