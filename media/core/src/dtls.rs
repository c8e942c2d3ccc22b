//! DTLS-SRTP: certificate identity, fingerprints and the sans-I/O
//! handshake driver used by the transport.
//!
//! Trust is pinned to the fingerprint exchanged in SDP rather than a CA
//! chain: the handshake runs with chain verification disabled and the peer
//! certificate is digested and compared once the handshake concludes. Only
//! a matching peer yields SRTP keys.

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    ssl::{ErrorCode, Ssl, SslContext, SslMethod, SslStream, SslVerifyMode},
    x509::{X509, X509NameBuilder},
};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::Duration,
};

/// Conservative payload ceiling for handshake flights.
const DTLS_MTU: u32 = 1200;

/// Which end of the handshake this context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsSetup {
    /// Wait for the peer's client hello (inbound call legs).
    Accept,
    /// Initiate the handshake (outbound call legs).
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    /// Still exchanging flights.
    Handshake,
    /// Handshake done, peer pinned, SRTP keys derived.
    Connected,
    Failed,
}

/// Process-wide certificate material shared by every handle of an
/// environment. Created lazily the first time a fingerprint is needed.
#[derive(Default)]
pub struct CertificateStore {
    ssl_context: Option<SslContext>,
}

impl CertificateStore {
    pub fn ssl_context(&mut self) -> &SslContext {
        self.ssl_context
            .get_or_insert_with(|| make_ssl_context().expect("dtls context setup"))
    }

    /// Upper-case colon separated SHA-256 digest of our certificate, the
    /// form `a=fingerprint` expects.
    pub fn fingerprint_sha256(&mut self) -> String {
        let digest = self
            .ssl_context()
            .certificate()
            .expect("context is built with a certificate")
            .digest(MessageDigest::sha256())
            .expect("sha-256 digest of own certificate");

        digest
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

pub(crate) fn digest_by_name(name: &str) -> Option<MessageDigest> {
    match name.to_ascii_lowercase().as_str() {
        "sha-1" => Some(MessageDigest::sha1()),
        "sha-224" => Some(MessageDigest::sha224()),
        "sha-256" => Some(MessageDigest::sha256()),
        "sha-384" => Some(MessageDigest::sha384()),
        "sha-512" => Some(MessageDigest::sha512()),
        "md5" => Some(MessageDigest::md5()),
        _ => None,
    }
}

/// Decode a colon separated hex digest.
pub(crate) fn decode_fingerprint(s: &str) -> Option<Vec<u8>> {
    s.split(':')
        .map(|b| u8::from_str_radix(b, 16).ok())
        .collect()
}

/// Datagram queues standing in for the socket the host owns. The DTLS
/// stack reads whole datagrams from the inbox and each flight fragment it
/// writes lands in the outbox.
#[derive(Default)]
struct PacketChute {
    inbox: VecDeque<Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
}

impl Read for PacketChute {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(datagram) = self.inbox.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let n = datagram.len().min(buf.len());
        if n < datagram.len() {
            log::warn!(
                "truncating a {} byte dtls datagram to fit a {} byte read",
                datagram.len(),
                buf.len()
            );
        }

        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }
}

impl Write for PacketChute {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbox.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One DTLS handshake rolling towards an SRTP session pair.
pub struct DtlsSrtpSession {
    stream: SslStream<PacketChute>,
    state: DtlsState,
    /// Digests the peer certificate must match, from the SDP fingerprint.
    expected_peer: Vec<(MessageDigest, Vec<u8>)>,
    srtp_pair: Option<(srtp::Session, srtp::Session)>,
}

impl DtlsSrtpSession {
    pub fn new(
        ssl_context: &SslContext,
        expected_peer: Vec<(MessageDigest, Vec<u8>)>,
        setup: DtlsSetup,
    ) -> io::Result<Self> {
        let mut ssl = Ssl::new(ssl_context)?;
        ssl.set_mtu(DTLS_MTU)?;

        // request the peer certificate but leave all verification to the
        // fingerprint pinning after the handshake
        ssl.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

        match setup {
            DtlsSetup::Accept => ssl.set_accept_state(),
            DtlsSetup::Connect => ssl.set_connect_state(),
        }

        let mut this = DtlsSrtpSession {
            stream: SslStream::new(ssl, PacketChute::default())?,
            state: DtlsState::Handshake,
            expected_peer,
            srtp_pair: None,
        };

        // the connect side emits its first flight right away
        this.drive()?;

        Ok(this)
    }

    pub fn state(&self) -> DtlsState {
        self.state
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.state {
            DtlsState::Handshake => Some(Duration::from_millis(100)),
            DtlsState::Connected | DtlsState::Failed => None,
        }
    }

    /// Queue one received datagram for the next [`drive`](Self::drive).
    pub fn receive(&mut self, datagram: Vec<u8>) {
        self.stream.get_mut().inbox.push_back(datagram);
    }

    /// Push the handshake as far as the queued datagrams allow.
    pub fn drive(&mut self) -> io::Result<()> {
        while self.state == DtlsState::Handshake {
            match self.stream.do_handshake() {
                Ok(()) => self.complete()?,
                Err(e) if e.code() == ErrorCode::WANT_READ => return Ok(()),
                Err(e) => {
                    self.state = DtlsState::Failed;
                    return Err(io::Error::other(e));
                }
            }
        }

        Ok(())
    }

    /// Pin the peer and derive the SRTP sessions.
    fn complete(&mut self) -> io::Result<()> {
        if !self.peer_matches_expected() {
            self.state = DtlsState::Failed;
            return Err(io::Error::other(
                "peer certificate does not match the offered fingerprint",
            ));
        }

        let pair = srtp::openssl::session_pair(self.stream.ssl(), srtp::openssl::Config::default());

        let (inbound, outbound) = match pair {
            Ok(pair) => pair,
            Err(e) => {
                self.state = DtlsState::Failed;
                return Err(io::Error::other(e));
            }
        };

        self.srtp_pair = Some((inbound.into_session(), outbound.into_session()));
        self.state = DtlsState::Connected;

        Ok(())
    }

    fn peer_matches_expected(&self) -> bool {
        let Some(cert) = self.stream.ssl().peer_certificate() else {
            return false;
        };

        self.expected_peer.iter().any(|(digest, want)| {
            cert.digest(*digest)
                .is_ok_and(|have| have.as_ref() == want.as_slice())
        })
    }

    /// The keyed SRTP sessions, once and only once after completion.
    pub fn take_srtp_pair(&mut self) -> Option<(srtp::Session, srtp::Session)> {
        self.srtp_pair.take()
    }

    pub fn pop_to_send(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().outbox.pop_front()
    }
}

fn make_ssl_context() -> Result<SslContext, ErrorStack> {
    openssl::init();

    let (cert, key) = self_signed_identity()?;

    let mut builder = SslContext::builder(SslMethod::dtls())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;
    builder.set_tlsext_use_srtp(srtp::openssl::SRTP_PROFILE_NAMES)?;

    Ok(builder.build())
}

/// A minimal self-signed P-256 leaf; media endpoints identify themselves by
/// fingerprint, so nothing beyond subject, validity and signature is needed.
fn self_signed_identity() -> Result<(X509, PKey<Private>), ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, "tandem-media")?;
    let name = name.build();

    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(64, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build(), key))
}
