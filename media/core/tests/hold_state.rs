use common::{G711_OFFER, make_leg, parse};
use media_core::{
    CallDirection, ConfigView, HoldState, MediaEvent, MediaFlag, SdpKind, hold_state, vars,
};

mod common;

const HOLD_OFFER: &str = "v=0
o=peer 1 2 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
a=sendonly
m=audio 5004 RTP/AVP 0 8 101
a=rtpmap:0 PCMU/8000
a=rtpmap:8 PCMA/8000
a=rtpmap:101 telephone-event/8000
";

const UNHOLD_OFFER: &str = "v=0
o=peer 1 3 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
a=sendrecv
m=audio 5004 RTP/AVP 0 8 101
a=rtpmap:0 PCMU/8000
a=rtpmap:8 PCMA/8000
a=rtpmap:101 telephone-event/8000
";

#[test]
fn sendonly_reoffer_enters_protocol_hold() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::Answered);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer)
            .matched
    );
    assert_eq!(hold_state(&leg.handle), HoldState::Active);
    leg.sink.take();

    leg.handle.flags.set(MediaFlag::Reinvite);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(HOLD_OFFER), SdpKind::Offer)
            .matched
    );

    assert_eq!(hold_state(&leg.handle), HoldState::HeldWithMoh);
    assert_eq!(leg.cfg.get(vars::MEDIA_AUDIO_MODE).as_deref(), Some("recvonly"));

    let events = leg.sink.take();
    assert!(events.contains(&MediaEvent::Presence { state: "hold" }));
    assert!(events.contains(&MediaEvent::MohStart {
        stream: "local_stream://moh".into()
    }));
}

#[test]
fn sendrecv_reoffer_releases_the_hold() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::Answered);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer)
            .matched
    );

    leg.handle.flags.set(MediaFlag::Reinvite);
    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(HOLD_OFFER), SdpKind::Offer)
            .matched
    );
    assert_eq!(hold_state(&leg.handle), HoldState::HeldWithMoh);
    leg.sink.take();

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(UNHOLD_OFFER), SdpKind::Offer)
            .matched
    );

    assert_eq!(hold_state(&leg.handle), HoldState::Active);

    let events = leg.sink.take();
    assert!(events.contains(&MediaEvent::Presence { state: "unhold" }));
    assert!(events.contains(&MediaEvent::MohStop));
}

#[test]
fn disable_hold_ignores_sendonly() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::Answered);
    leg.cfg.set(vars::RTP_DISABLE_HOLD, "true");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(HOLD_OFFER), SdpKind::Offer)
            .matched
    );

    assert_eq!(hold_state(&leg.handle), HoldState::Active);
    assert!(leg.sink.take().is_empty());
}

#[test]
fn hold_music_silence_skips_moh() {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::Answered);
    leg.cfg.set("hold_music", "silence");

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(G711_OFFER), SdpKind::Offer)
            .matched
    );
    leg.handle.flags.set(MediaFlag::Reinvite);
    leg.sink.take();

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(HOLD_OFFER), SdpKind::Offer)
            .matched
    );

    let events = leg.sink.take();
    assert!(events.contains(&MediaEvent::Presence { state: "hold" }));
    assert!(!events.iter().any(|e| matches!(e, MediaEvent::MohStart { .. })));
}
