use media_core::{
    CallDirection, CollectingSink, MediaEnvironment, MediaHandle, MediaParams, MemoryConfig,
    PortPool, SessionDescription,
};

pub struct TestLeg {
    pub handle: MediaHandle,
    pub cfg: MemoryConfig,
    pub sink: CollectingSink,
}

pub fn make_leg(direction: CallDirection) -> TestLeg {
    let _ = env_logger::builder().is_test(true).try_init();

    let sink = CollectingSink::default();

    let env = MediaEnvironment::new()
        .with_ports(PortPool::new(20000, 21000))
        .with_events(sink.clone());

    let params = MediaParams {
        rtp_ip: "127.0.0.1".parse().unwrap(),
        inbound_codec_string: "PCMA,PCMU".into(),
        outbound_codec_string: "PCMA,PCMU".into(),
        ..Default::default()
    };

    TestLeg {
        handle: MediaHandle::new(env, params, direction),
        cfg: MemoryConfig::new(),
        sink,
    }
}

pub fn parse(text: &str) -> SessionDescription {
    media_core::parse_session_description(text).expect("well-formed test sdp")
}

/// Plain G.711 offer with telephone-event, scenario material.
pub const G711_OFFER: &str = "v=0
o=peer 123456 654321 IN IP4 192.168.1.10
s=call
c=IN IP4 192.168.1.10
t=0 0
m=audio 5004 RTP/AVP 0 8 101
a=rtpmap:0 PCMU/8000
a=rtpmap:8 PCMA/8000
a=rtpmap:101 telephone-event/8000
a=fmtp:101 0-16
a=sendrecv
";
