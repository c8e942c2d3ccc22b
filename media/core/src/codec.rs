//! Codec descriptions, the negotiated per-stream parameter record and the
//! dynamic payload type allocator.

use crate::config::CodecPref;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Audio,
    Video,
}

/// One installed codec implementation as the registry describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecImpl {
    pub kind: CodecKind,
    /// IANA encoding name, case preserved for SDP emission.
    pub iananame: String,
    /// Static payload type when the codec has one (< 96).
    pub ianacode: Option<u8>,
    /// Sampling rate in Hz.
    pub rate: u32,
    /// Packetization time in milliseconds.
    pub ptime: u32,
    pub bitrate: u32,
    pub channels: u8,
    /// Default fmtp parameters advertised for this codec.
    pub fmtp: Option<String>,
}

/// Read-only codec registry the core resolves preference entries against.
pub trait CodecRegistry {
    /// Resolve a preference entry to an implementation, honoring requested
    /// rate/ptime/bitrate overrides when the codec supports them.
    fn resolve(&self, pref: &CodecPref, kind: CodecKind) -> Option<CodecImpl>;
}

struct BaseCodec {
    kind: CodecKind,
    iananame: &'static str,
    ianacode: Option<u8>,
    rate: u32,
    ptime: u32,
    /// Packing granularity; a requested ptime must be a multiple of this.
    frame_ms: u32,
    max_ptime: u32,
    bitrate: u32,
    channels: u8,
    fmtp: Option<&'static str>,
}

const BASE_CODECS: &[BaseCodec] = &[
    BaseCodec { kind: CodecKind::Audio, iananame: "PCMU", ianacode: Some(0), rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 120, bitrate: 64000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "PCMA", ianacode: Some(8), rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 120, bitrate: 64000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "G722", ianacode: Some(9), rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 120, bitrate: 64000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "G729", ianacode: Some(18), rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 100, bitrate: 8000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "GSM", ianacode: Some(3), rate: 8000, ptime: 20, frame_ms: 20, max_ptime: 120, bitrate: 13200, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "G723", ianacode: Some(4), rate: 8000, ptime: 30, frame_ms: 30, max_ptime: 90, bitrate: 6300, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "iLBC", ianacode: None, rate: 8000, ptime: 30, frame_ms: 10, max_ptime: 120, bitrate: 13330, channels: 1, fmtp: Some("mode=30") },
    BaseCodec { kind: CodecKind::Audio, iananame: "iSAC", ianacode: None, rate: 16000, ptime: 30, frame_ms: 30, max_ptime: 60, bitrate: 32000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "L16", ianacode: None, rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 20, bitrate: 128000, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "opus", ianacode: None, rate: 48000, ptime: 20, frame_ms: 10, max_ptime: 120, bitrate: 0, channels: 2, fmtp: Some("useinbandfec=1") },
    BaseCodec { kind: CodecKind::Audio, iananame: "CN", ianacode: Some(13), rate: 8000, ptime: 20, frame_ms: 10, max_ptime: 120, bitrate: 0, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Audio, iananame: "telephone-event", ianacode: None, rate: 8000, ptime: 0, frame_ms: 0, max_ptime: 0, bitrate: 0, channels: 1, fmtp: Some("0-16") },
    BaseCodec { kind: CodecKind::Video, iananame: "VP8", ianacode: None, rate: 90000, ptime: 0, frame_ms: 0, max_ptime: 0, bitrate: 0, channels: 1, fmtp: None },
    BaseCodec { kind: CodecKind::Video, iananame: "H264", ianacode: None, rate: 90000, ptime: 0, frame_ms: 0, max_ptime: 0, bitrate: 0, channels: 1, fmtp: None },
];

/// Registry backed by the static table above. Resolution can synthesize a
/// variant at a requested ptime as long as the codec can be packed that way
/// (multiple of its native frame duration, within its maximum).
#[derive(Debug, Default)]
pub struct DefaultCodecRegistry;

impl CodecRegistry for DefaultCodecRegistry {
    fn resolve(&self, pref: &CodecPref, kind: CodecKind) -> Option<CodecImpl> {
        let base = BASE_CODECS
            .iter()
            .find(|c| c.kind == kind && c.iananame.eq_ignore_ascii_case(&pref.name))?;

        if let Some(rate) = pref.rate {
            // Only opus and L16 have non-fixed rates in this table
            let rate_ok = rate == base.rate
                || (base.iananame == "L16" && matches!(rate, 8000 | 16000 | 32000 | 48000))
                || (base.iananame == "opus" && matches!(rate, 8000 | 12000 | 16000 | 24000 | 48000));

            if !rate_ok {
                return None;
            }
        }

        let ptime = match pref.ptime {
            Some(requested) if base.frame_ms != 0 => {
                if requested == 0 || requested % base.frame_ms != 0 || requested > base.max_ptime {
                    return None;
                }
                requested
            }
            _ => base.ptime,
        };

        Some(CodecImpl {
            kind: base.kind,
            iananame: base.iananame.to_string(),
            ianacode: base.ianacode,
            rate: pref.rate.unwrap_or(base.rate),
            ptime,
            bitrate: pref.bitrate.unwrap_or(base.bitrate),
            channels: base.channels,
            fmtp: base.fmtp.map(str::to_string),
        })
    }
}

/// Negotiated per-stream parameters, one per engine.
#[derive(Debug, Default, Clone)]
pub struct CodecParams {
    /// Encoding name exactly as the peer spelled it.
    pub encoding: Option<String>,
    /// Canonical IANA name from the matched implementation.
    pub iananame: Option<String>,
    pub rate: u32,
    /// Packetization time in milliseconds.
    pub ptime: u32,
    pub bitrate: u32,
    /// Decoded channel count (for opus this comes from `stereo=1`).
    pub channels: u8,
    /// Channel count advertised in SDP (opus always advertises 2).
    pub adv_channels: u8,
    /// fmtp received from the peer.
    pub fmtp_in: Option<String>,
    /// fmtp to emit in our SDP.
    pub fmtp_out: Option<String>,
    /// Payload type as the peer assigned it.
    pub pt: u8,
    /// Payload type used for outgoing packets.
    pub agreed_pt: u8,
    /// Payload type accepted on incoming packets.
    pub recv_pt: u8,

    /// Peer endpoint from their SDP.
    pub remote_ip: Option<String>,
    pub remote_port: u16,
    /// Locally bound endpoint.
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    /// Endpoint advertised in our SDP, differs from local under NAT.
    pub adv_ip: Option<String>,
    pub adv_port: u16,
    /// Proxy endpoint for media passthrough mode.
    pub proxy_ip: Option<String>,
    pub proxy_port: u16,
}

impl CodecParams {
    pub fn bound(&self) -> bool {
        self.encoding.is_some()
    }

    pub fn samples_per_ms(&self) -> u32 {
        self.rate / 1000
    }
}

/// Dynamic payload type allocator.
///
/// Numbers start at 98 and skip the reserved telephone-event and comfort
/// noise values so nothing collides within one handle.
#[derive(Debug, Clone)]
pub struct PayloadAllocator {
    next: u8,
    reserved: [u8; 2],
}

impl PayloadAllocator {
    pub fn new(te: u8, cng_pt: u8) -> Self {
        PayloadAllocator {
            next: 98,
            reserved: [te, cng_pt],
        }
    }

    /// Hand out the next free dynamic payload type.
    pub fn take(&mut self) -> Option<u8> {
        while self.next <= 127 {
            let pt = self.next;
            self.next += 1;

            if !self.reserved.contains(&pt) {
                return Some(pt);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DefaultCodecRegistry {
        DefaultCodecRegistry
    }

    #[test]
    fn resolve_plain() {
        let imp = registry()
            .resolve(&CodecPref::named("pcma"), CodecKind::Audio)
            .unwrap();
        assert_eq!(imp.ianacode, Some(8));
        assert_eq!(imp.ptime, 20);
    }

    #[test]
    fn resolve_with_ptime() {
        let pref = CodecPref {
            name: "PCMU".into(),
            rate: None,
            ptime: Some(30),
            bitrate: None,
        };
        let imp = registry().resolve(&pref, CodecKind::Audio).unwrap();
        assert_eq!(imp.ptime, 30);

        let bad = CodecPref {
            ptime: Some(130),
            ..pref
        };
        assert!(registry().resolve(&bad, CodecKind::Audio).is_none());
    }

    #[test]
    fn resolve_rejects_wrong_rate_for_fixed_rate_codec() {
        let pref = CodecPref {
            name: "PCMA".into(),
            rate: Some(16000),
            ptime: None,
            bitrate: None,
        };
        assert!(registry().resolve(&pref, CodecKind::Audio).is_none());
    }

    #[test]
    fn allocator_skips_reserved() {
        let mut alloc = PayloadAllocator::new(101, 98);
        assert_eq!(alloc.take(), Some(99));
        assert_eq!(alloc.take(), Some(100));
        // 101 is the telephone-event payload
        assert_eq!(alloc.take(), Some(102));
    }

    #[test]
    fn allocator_runs_out() {
        let mut alloc = PayloadAllocator::new(101, 13);
        let mut handed = 0;
        while alloc.take().is_some() {
            handed += 1;
        }
        // 98..=127 minus the reserved 101
        assert_eq!(handed, 29);
    }
}
