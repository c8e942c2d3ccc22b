use common::{make_leg, parse};
use media_core::rtp::{RtpExtensionIds, RtpPacket, RtpTimestamp, SequenceNumber, Ssrc};
use media_core::{
    CallDirection, ConfigView, MediaEvent, MediaFlag, MediaType, ReceivedMedia, SdpKind, vars,
};
use std::time::Instant;

mod common;

const PCMA_OFFER: &str = "v=0
o=peer 1 1 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 8
a=rtpmap:8 PCMA/8000
a=ptime:20
";

fn datagram(seq: u16, ts: u32, payload_len: usize) -> Vec<u8> {
    let packet = RtpPacket {
        pt: 8,
        sequence_number: SequenceNumber(seq),
        ssrc: Ssrc(0xabcd),
        timestamp: RtpTimestamp(ts),
        extensions: Default::default(),
        payload: bytes::Bytes::from(vec![0u8; payload_len]),
    };

    packet.to_vec(RtpExtensionIds::default())
}

fn live_leg() -> common::TestLeg {
    let mut leg = make_leg(CallDirection::Inbound);
    leg.handle.flags.set(MediaFlag::AutofixTiming);

    assert!(
        leg.handle
            .negotiate(&mut leg.cfg, &parse(PCMA_OFFER), SdpKind::Offer)
            .matched
    );

    leg.handle
        .choose_port(&mut leg.cfg, MediaType::Audio, false)
        .unwrap();
    leg.handle.activate(&mut leg.cfg).unwrap();

    leg
}

#[test]
fn mismatched_ptime_reinitializes_the_codec_once() {
    let mut leg = live_leg();
    let now = Instant::now();

    assert_eq!(leg.handle.engine(MediaType::Audio).codec_params.ptime, 20);

    // the peer advertises 20 ms but sends timestamps advancing 30 ms
    let mut ts = 8000u32;
    for seq in 0..10u16 {
        ts += 240;
        let received = leg
            .handle
            .media_read(&mut leg.cfg, MediaType::Audio, datagram(seq, ts, 240), now);
        assert!(matches!(received, ReceivedMedia::Rtp(_)));
    }

    assert_eq!(leg.handle.engine(MediaType::Audio).codec_params.ptime, 30);
    assert_eq!(
        leg.cfg.get(vars::BROKEN_PTIME_HEADER).as_deref(),
        Some("Adv=20;Sent=30")
    );

    let events = leg.sink.take();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, MediaEvent::BrokenPtime { .. }))
            .count(),
        1
    );
    assert!(events.contains(&MediaEvent::BrokenPtime {
        advertised: 20,
        sent: 30
    }));

    // after the switch the observed timing matches, nothing further fires
    for seq in 10..60u16 {
        ts += 240;
        let _ = leg
            .handle
            .media_read(&mut leg.cfg, MediaType::Audio, datagram(seq, ts, 240), now);
    }

    assert_eq!(leg.handle.engine(MediaType::Audio).codec_params.ptime, 30);
    assert!(
        !leg.sink
            .take()
            .iter()
            .any(|e| matches!(e, MediaEvent::BrokenPtime { .. }))
    );
}

#[test]
fn implausible_ptime_is_dismissed_with_an_event() {
    let mut leg = live_leg();
    let now = Instant::now();

    // 130 ms per packet, which no sane phone means
    let mut ts = 8000u32;
    for seq in 0..10u16 {
        ts += 1040;
        let _ = leg
            .handle
            .media_read(&mut leg.cfg, MediaType::Audio, datagram(seq, ts, 240), now);
    }

    // the negotiated ptime stays put
    assert_eq!(leg.handle.engine(MediaType::Audio).codec_params.ptime, 20);

    let events = leg.sink.take();
    assert!(events.contains(&MediaEvent::PtimeClampTriggered { observed_ms: 130 }));
    assert!(!events.iter().any(|e| matches!(e, MediaEvent::BrokenPtime { .. })));
}

#[test]
fn matching_ptime_never_triggers_the_autofix() {
    let mut leg = live_leg();
    let now = Instant::now();

    let mut ts = 8000u32;
    for seq in 0..60u16 {
        ts += 160;
        let _ = leg
            .handle
            .media_read(&mut leg.cfg, MediaType::Audio, datagram(seq, ts, 160), now);
    }

    assert_eq!(leg.handle.engine(MediaType::Audio).codec_params.ptime, 20);
    assert!(leg.sink.take().is_empty());
}
