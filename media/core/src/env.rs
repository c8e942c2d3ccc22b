//! The media environment: every process-wide collaborator the core drives
//! but does not implement. Handles receive a (cheaply clonable) environment
//! at construction; all components are shared.

use crate::codec::{CodecKind, CodecRegistry, DefaultCodecRegistry};
use crate::config::CodecPref;
use crate::dtls::CertificateStore;
use crate::error::HangupCause;
use crate::ice::LocalNet;
use crate::{MediaType, codec::CodecImpl};
use openssl::ssl::SslContext;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

/// Events the core raises towards the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Protocol hold state changed, presence should follow.
    Presence { state: &'static str },
    /// Start music on hold towards the partner leg.
    MohStart { stream: String },
    /// Stop music on hold on the partner leg.
    MohStop,
    /// Ask the partner leg to emit a mirroring image m-line.
    RequestImageMedia { sdp: String },
    /// The ptime auto-fix re-initialized a codec.
    BrokenPtime { advertised: u32, sent: u32 },
    /// An implausible observed ptime (> 120 ms) was dismissed.
    PtimeClampTriggered { observed_ms: u32 },
    /// The media layer wants the channel gone.
    Hangup { cause: HangupCause },
    /// A keyframe was requested for the video stream.
    VideoRefreshRequested,
    /// SRTP was confirmed for a media type.
    SecureMediaConfirmed { media_type: MediaType },
}

/// Process-wide RTP port pool, one per bind address family in practice.
pub trait PortAllocator: Send {
    fn request(&mut self, ip: IpAddr) -> Option<u16>;
    fn release(&mut self, ip: IpAddr, port: u16);
}

/// External NAT mapping table (UPnP/PMP or similar).
pub trait NatHelper: Send {
    /// Map an internal port, returning the external one.
    fn add_mapping(&mut self, internal: u16) -> u16;
    fn del_mapping(&mut self, internal: u16);
}

/// `host:` and `stun:` lookups for the advertised address.
pub trait AddressResolver: Send + Sync {
    fn host_lookup(&self, host: &str) -> io::Result<IpAddr>;
    /// Resolve the external address of `local_port` via a STUN server.
    fn stun_lookup(
        &self,
        server: &str,
        server_port: u16,
        local_port: u16,
    ) -> io::Result<(IpAddr, u16)>;
}

pub trait EventSink: Send {
    fn raise(&mut self, event: MediaEvent);
}

/// Simple even-port pool over a contiguous range.
pub struct PortPool {
    next: u16,
    end: u16,
    free: Vec<u16>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        PortPool {
            next: start & !1,
            end,
            free: Vec::new(),
        }
    }
}

impl Default for PortPool {
    fn default() -> Self {
        PortPool::new(16384, 32768)
    }
}

impl PortAllocator for PortPool {
    fn request(&mut self, _ip: IpAddr) -> Option<u16> {
        if let Some(port) = self.free.pop() {
            return Some(port);
        }

        if self.next >= self.end {
            return None;
        }

        let port = self.next;
        self.next += 2;
        Some(port)
    }

    fn release(&mut self, _ip: IpAddr, port: u16) {
        self.free.push(port);
    }
}

slotmap::new_key_type! {
    struct NatMappingId;
}

struct NatMapping {
    internal: u16,
    external: u16,
}

/// In-memory NAT mapping table; real deployments plug their own helper in.
#[derive(Default)]
pub struct NatTable {
    mappings: SlotMap<NatMappingId, NatMapping>,
    offset: u16,
}

impl NatTable {
    /// Map internal ports to `internal + offset` externally, handy in tests.
    pub fn with_offset(offset: u16) -> Self {
        NatTable {
            mappings: SlotMap::with_key(),
            offset,
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl NatHelper for NatTable {
    fn add_mapping(&mut self, internal: u16) -> u16 {
        let external = internal.wrapping_add(self.offset);
        self.mappings.insert(NatMapping { internal, external });
        external
    }

    fn del_mapping(&mut self, internal: u16) {
        self.mappings.retain(|_, m| m.internal != internal);
    }
}

/// Resolver backed by the system's name resolution; STUN is left to the
/// host's keepalive machinery and reports unsupported here.
#[derive(Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn host_lookup(&self, host: &str) -> io::Result<IpAddr> {
        (host, 0u16)
            .to_socket_addrs()?
            .map(|a| a.ip())
            .next()
            .ok_or_else(|| io::Error::other(format!("no address found for {host}")))
    }

    fn stun_lookup(&self, server: &str, _port: u16, _local_port: u16) -> io::Result<(IpAddr, u16)> {
        Err(io::Error::other(format!(
            "no stun resolver configured (server {server})"
        )))
    }
}

/// Fixed-table resolver for tests.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
    stun: Option<(IpAddr, u16)>,
}

impl StaticResolver {
    pub fn with_host(mut self, name: &str, ip: IpAddr) -> Self {
        self.hosts.insert(name.to_string(), ip);
        self
    }

    pub fn with_stun_result(mut self, ip: IpAddr, port: u16) -> Self {
        self.stun = Some((ip, port));
        self
    }
}

impl AddressResolver for StaticResolver {
    fn host_lookup(&self, host: &str) -> io::Result<IpAddr> {
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| io::Error::other(format!("unknown host {host}")))
    }

    fn stun_lookup(&self, server: &str, _port: u16, local_port: u16) -> io::Result<(IpAddr, u16)> {
        match self.stun {
            Some((ip, port)) => Ok((ip, if port == 0 { local_port } else { port })),
            None => Err(io::Error::other(format!("stun lookup failed for {server}"))),
        }
    }
}

/// Sink that only logs.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn raise(&mut self, event: MediaEvent) {
        log::debug!("media event: {event:?}");
    }
}

/// Sink collecting events for inspection, clonable so tests can keep a
/// reading end.
#[derive(Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<MediaEvent>>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl EventSink for CollectingSink {
    fn raise(&mut self, event: MediaEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// The collaborator bundle. Clones share all components.
#[derive(Clone)]
pub struct MediaEnvironment {
    ports: Arc<Mutex<dyn PortAllocator>>,
    nat: Option<Arc<Mutex<dyn NatHelper>>>,
    resolver: Arc<dyn AddressResolver>,
    registry: Arc<dyn CodecRegistry + Send + Sync>,
    events: Arc<Mutex<dyn EventSink>>,
    certificates: Arc<Mutex<CertificateStore>>,
    local_nets: Arc<Vec<LocalNet>>,
}

impl Default for MediaEnvironment {
    fn default() -> Self {
        MediaEnvironment::new()
    }
}

impl MediaEnvironment {
    pub fn new() -> Self {
        MediaEnvironment {
            ports: Arc::new(Mutex::new(PortPool::default())),
            nat: None,
            resolver: Arc::new(SystemResolver),
            registry: Arc::new(DefaultCodecRegistry),
            events: Arc::new(Mutex::new(NullSink)),
            certificates: Arc::new(Mutex::new(CertificateStore::default())),
            local_nets: Arc::new(detect_local_nets()),
        }
    }

    pub fn with_ports(mut self, ports: impl PortAllocator + 'static) -> Self {
        self.ports = Arc::new(Mutex::new(ports));
        self
    }

    pub fn with_nat(mut self, nat: impl NatHelper + 'static) -> Self {
        self.nat = Some(Arc::new(Mutex::new(nat)));
        self
    }

    pub fn with_resolver(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_registry(mut self, registry: impl CodecRegistry + Send + Sync + 'static) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_events(mut self, events: impl EventSink + 'static) -> Self {
        self.events = Arc::new(Mutex::new(events));
        self
    }

    pub fn with_local_nets(mut self, nets: Vec<LocalNet>) -> Self {
        self.local_nets = Arc::new(nets);
        self
    }

    pub fn request_port(&self, ip: IpAddr) -> Option<u16> {
        self.ports.lock().unwrap().request(ip)
    }

    pub fn release_port(&self, ip: IpAddr, port: u16) {
        self.ports.lock().unwrap().release(ip, port);
    }

    pub fn has_nat_helper(&self) -> bool {
        self.nat.is_some()
    }

    pub fn nat_add_mapping(&self, internal: u16) -> Option<u16> {
        self.nat
            .as_ref()
            .map(|nat| nat.lock().unwrap().add_mapping(internal))
    }

    pub fn nat_del_mapping(&self, internal: u16) {
        if let Some(nat) = &self.nat {
            nat.lock().unwrap().del_mapping(internal);
        }
    }

    pub fn host_lookup(&self, host: &str) -> io::Result<IpAddr> {
        self.resolver.host_lookup(host)
    }

    pub fn stun_lookup(
        &self,
        server: &str,
        server_port: u16,
        local_port: u16,
    ) -> io::Result<(IpAddr, u16)> {
        self.resolver.stun_lookup(server, server_port, local_port)
    }

    pub fn resolve_codec(&self, pref: &CodecPref, kind: CodecKind) -> Option<CodecImpl> {
        self.registry.resolve(pref, kind)
    }

    pub fn raise(&self, event: MediaEvent) {
        self.events.lock().unwrap().raise(event);
    }

    pub fn local_fingerprint_sha256(&self) -> String {
        self.certificates.lock().unwrap().fingerprint_sha256()
    }

    pub fn with_ssl_context<R>(&self, f: impl FnOnce(&SslContext) -> R) -> R {
        f(self.certificates.lock().unwrap().ssl_context())
    }

    pub fn local_nets(&self) -> Vec<LocalNet> {
        self.local_nets.as_ref().clone()
    }
}

fn detect_local_nets() -> Vec<LocalNet> {
    let mut nets = Vec::new();

    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => {
            for (_name, ip) in ifas {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                nets.push(LocalNet { addr: ip, prefix });
            }
        }
        Err(e) => log::warn!("failed to enumerate local interfaces: {e}"),
    }

    nets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn port_pool_reuses_released_ports() {
        let mut pool = PortPool::new(5000, 5008);
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();

        let a = pool.request(ip).unwrap();
        let b = pool.request(ip).unwrap();
        assert_ne!(a, b);

        pool.release(ip, a);
        assert_eq!(pool.request(ip), Some(a));
    }

    #[test]
    fn port_pool_exhausts() {
        let mut pool = PortPool::new(5000, 5004);
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();

        assert!(pool.request(ip).is_some());
        assert!(pool.request(ip).is_some());
        assert!(pool.request(ip).is_none());
    }

    #[test]
    fn nat_table_tracks_mappings() {
        let mut nat = NatTable::with_offset(1000);

        assert_eq!(nat.add_mapping(5000), 6000);
        assert_eq!(nat.mapping_count(), 1);
        nat.del_mapping(5000);
        assert_eq!(nat.mapping_count(), 0);
    }
}
