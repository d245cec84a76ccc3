//! Linkscout wire format — the discovery probe.
//!
//! A probe is an LLDP frame. The standard mandatory TLVs (Chassis ID,
//! Port ID, TTL) are followed by organisation-specific TLVs carrying the
//! sender's device id, the cluster fingerprint, the send timestamp and an
//! optional keyed signature.
//!
//! Two addressing conventions exist and the receiver classifies a frame
//! from its ether type alone:
//!   CONFINED: dst 01:80:c2:00:00:0e, ether type 0x88cc. Bridges never
//!              forward the nearest-bridge group, so only the directly
//!              attached peer sees it.
//!   FLOOD:    dst ff:ff:ff:ff:ff:ff, ether type 0x8942. Crosses learning
//!              switches that know nothing about discovery.
//!
//! Decoding never fails loudly. Anything that is not one of our probes is
//! reported as `None`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::model::{DeviceId, PortNumber};

// ── Ethernet Header ──────────────────────────────────────────────────────────

/// Ethernet II header preceding every probe.
///
/// Wire size: 14 bytes. The ether type is stored big-endian as raw bytes
/// so the struct has no alignment requirement.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: [u8; 2],
}

assert_eq_size!(EthernetHeader, [u8; 14]);

pub const ETHERNET_HEADER_LEN: usize = 14;

// ── Constants ─────────────────────────────────────────────────────────────────

/// IEEE 802.1AB LLDP ether type.
pub const ETHERTYPE_LLDP: u16 = 0x88cc;

/// Ether type used for flood-domain probes.
pub const ETHERTYPE_BDDP: u16 = 0x8942;

/// LLDP nearest-bridge group address.
pub const LLDP_NEAREST_BRIDGE: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e];

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Locally administered OUI that tags our organisation-specific TLVs.
pub const LINKSCOUT_OUI: [u8; 3] = [0x02, 0x4c, 0x53];

/// TTL advertised in every probe, in seconds.
pub const DEFAULT_TTL_SECS: u16 = 120;

const TLV_END: u8 = 0;
const TLV_CHASSIS_ID: u8 = 1;
const TLV_PORT_ID: u8 = 2;
const TLV_TTL: u8 = 3;
const TLV_ORG_SPECIFIC: u8 = 127;

/// Chassis/Port ID subtype "locally assigned".
const SUBTYPE_LOCAL: u8 = 7;

const ORG_DEVICE_ID: u8 = 1;
const ORG_FINGERPRINT: u8 = 2;
const ORG_TIMESTAMP: u8 = 3;
const ORG_SIGNATURE: u8 = 4;

/// TLV length is 9 bits.
const MAX_TLV_LEN: usize = 511;

/// OUI + subtype prefix inside an org-specific TLV.
const ORG_HEADER_LEN: usize = 4;

/// Longest device id that fits in one org-specific TLV.
pub const MAX_DEVICE_ID_LEN: usize = MAX_TLV_LEN - ORG_HEADER_LEN;

const SIGNATURE_CONTEXT: &str = "linkscout probe signature";

// ── Domain ────────────────────────────────────────────────────────────────────

/// Which addressing convention a probe uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeDomain {
    Confined,
    Flood,
}

impl ProbeDomain {
    pub fn ether_type(self) -> u16 {
        match self {
            ProbeDomain::Confined => ETHERTYPE_LLDP,
            ProbeDomain::Flood => ETHERTYPE_BDDP,
        }
    }

    pub fn dst_mac(self) -> [u8; 6] {
        match self {
            ProbeDomain::Confined => LLDP_NEAREST_BRIDGE,
            ProbeDomain::Flood => BROADCAST_MAC,
        }
    }

    pub fn from_ether_type(ether_type: u16) -> Option<Self> {
        match ether_type {
            ETHERTYPE_LLDP => Some(ProbeDomain::Confined),
            ETHERTYPE_BDDP => Some(ProbeDomain::Flood),
            _ => None,
        }
    }
}

// ── Fingerprint ───────────────────────────────────────────────────────────────

/// Cluster-unique fingerprint: BLAKE3 hash of the cluster name.
///
/// Every node of one cluster computes the same value, so a probe sent by
/// any node is recognised by all of them and rejected by other clusters
/// sharing the same wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn from_cluster(name: &str) -> Self {
        Self(*blake3::hash(name.as_bytes()).as_bytes())
    }

    /// Source MAC for outgoing probes: locally administered, unicast.
    pub fn source_mac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.0[..6]);
        mac[0] = (mac[0] | 0x02) & 0xfe;
        mac
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

// ── Probe ─────────────────────────────────────────────────────────────────────

/// Everything a probe carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFrame {
    pub device_id: DeviceId,
    pub chassis_id: u64,
    pub port: PortNumber,
    pub fingerprint: Fingerprint,
    pub domain: ProbeDomain,
    /// Milliseconds since the Unix epoch at encode time.
    pub timestamp_ms: u64,
    /// How long the receiver may consider the link valid without another
    /// probe. Zero withdraws it.
    pub ttl_secs: u16,
}

impl ProbeFrame {
    /// Build a probe stamped with the current wall-clock time.
    pub fn now(
        device_id: DeviceId,
        chassis_id: u64,
        port: PortNumber,
        fingerprint: Fingerprint,
        domain: ProbeDomain,
    ) -> Self {
        Self {
            device_id,
            chassis_id,
            port,
            fingerprint,
            domain,
            timestamp_ms: now_millis(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encodes and decodes probes.
///
/// With a cluster secret configured, outgoing probes are signed and
/// incoming probes without a valid signature are not recognised.
#[derive(Clone)]
pub struct ProbeCodec {
    signing_key: Option<[u8; 32]>,
}

impl Default for ProbeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeCodec {
    pub fn new() -> Self {
        Self { signing_key: None }
    }

    pub fn with_secret(secret: &str) -> Self {
        Self {
            signing_key: Some(blake3::derive_key(SIGNATURE_CONTEXT, secret.as_bytes())),
        }
    }

    pub fn is_signing(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn encode(&self, probe: &ProbeFrame) -> Result<Bytes, WireError> {
        let id = probe.device_id.as_str().as_bytes();
        if id.is_empty() {
            return Err(WireError::EmptyDeviceId);
        }
        if id.len() > MAX_DEVICE_ID_LEN {
            return Err(WireError::DeviceIdTooLong(id.len()));
        }

        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_LEN + 128 + id.len());

        let header = EthernetHeader {
            dst: probe.domain.dst_mac(),
            src: probe.fingerprint.source_mac(),
            ether_type: probe.domain.ether_type().to_be_bytes(),
        };
        buf.put_slice(header.as_bytes());

        let mut chassis = [0u8; 9];
        chassis[0] = SUBTYPE_LOCAL;
        chassis[1..].copy_from_slice(&probe.chassis_id.to_be_bytes());
        put_tlv(&mut buf, TLV_CHASSIS_ID, &chassis);

        let mut port = [0u8; 5];
        port[0] = SUBTYPE_LOCAL;
        port[1..].copy_from_slice(&probe.port.0.to_be_bytes());
        put_tlv(&mut buf, TLV_PORT_ID, &port);

        put_tlv(&mut buf, TLV_TTL, &probe.ttl_secs.to_be_bytes());

        put_org_tlv(&mut buf, ORG_DEVICE_ID, id);
        put_org_tlv(&mut buf, ORG_FINGERPRINT, &probe.fingerprint.0);
        put_org_tlv(&mut buf, ORG_TIMESTAMP, &probe.timestamp_ms.to_be_bytes());

        if let Some(key) = &self.signing_key {
            let sig = sign(key, probe);
            put_org_tlv(&mut buf, ORG_SIGNATURE, sig.as_bytes());
        }

        put_tlv(&mut buf, TLV_END, &[]);
        Ok(buf.freeze())
    }

    /// Decode a frame. `None` means "not one of our probes".
    pub fn decode(&self, bytes: &[u8]) -> Option<ProbeFrame> {
        let header = EthernetHeader::read_from_prefix(bytes)?;
        let domain = ProbeDomain::from_ether_type(u16::from_be_bytes(header.ether_type))?;

        let mut chassis_id = None;
        let mut port = None;
        let mut ttl = None;
        let mut device_id = None;
        let mut fingerprint = None;
        let mut timestamp_ms = None;
        let mut signature = None;

        let mut reader = TlvReader::new(&bytes[ETHERNET_HEADER_LEN..]);
        loop {
            let (kind, value) = reader.next_tlv()?;
            match kind {
                TLV_END => break,
                TLV_CHASSIS_ID => chassis_id = Some(local_u64(value)?),
                TLV_PORT_ID => port = Some(PortNumber(local_u32(value)?)),
                TLV_TTL => ttl = Some(u16::from_be_bytes(value.try_into().ok()?)),
                TLV_ORG_SPECIFIC => {
                    if value.len() < ORG_HEADER_LEN || value[..3] != LINKSCOUT_OUI {
                        continue;
                    }
                    let body = &value[ORG_HEADER_LEN..];
                    match value[3] {
                        ORG_DEVICE_ID => {
                            let id = std::str::from_utf8(body).ok()?;
                            if id.is_empty() {
                                return None;
                            }
                            device_id = Some(DeviceId::new(id));
                        }
                        ORG_FINGERPRINT => fingerprint = Some(Fingerprint(body.try_into().ok()?)),
                        ORG_TIMESTAMP => timestamp_ms = Some(u64::from_be_bytes(body.try_into().ok()?)),
                        ORG_SIGNATURE => signature = Some(<[u8; 32]>::try_from(body).ok()?),
                        _ => {}
                    }
                }
                // System name, management address and friends are legal
                // in LLDP but irrelevant to us.
                _ => {}
            }
        }

        let probe = ProbeFrame {
            device_id: device_id?,
            chassis_id: chassis_id?,
            port: port?,
            fingerprint: fingerprint?,
            domain,
            timestamp_ms: timestamp_ms?,
            ttl_secs: ttl?,
        };

        if let Some(key) = &self.signing_key {
            // blake3::Hash equality is constant-time.
            if blake3::Hash::from(signature?) != sign(key, &probe) {
                return None;
            }
        }

        Some(probe)
    }
}

fn sign(key: &[u8; 32], probe: &ProbeFrame) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(probe.device_id.as_str().as_bytes());
    hasher.update(&probe.chassis_id.to_be_bytes());
    hasher.update(&probe.port.0.to_be_bytes());
    hasher.update(&probe.fingerprint.0);
    hasher.update(&probe.timestamp_ms.to_be_bytes());
    hasher.update(&probe.ttl_secs.to_be_bytes());
    hasher.finalize()
}

fn put_tlv(buf: &mut BytesMut, kind: u8, value: &[u8]) {
    debug_assert!(value.len() <= MAX_TLV_LEN);
    let header = ((kind as u16) << 9) | (value.len() as u16 & 0x01ff);
    buf.put_u16(header);
    buf.put_slice(value);
}

fn put_org_tlv(buf: &mut BytesMut, subtype: u8, body: &[u8]) {
    let header = ((TLV_ORG_SPECIFIC as u16) << 9) | ((ORG_HEADER_LEN + body.len()) as u16 & 0x01ff);
    buf.put_u16(header);
    buf.put_slice(&LINKSCOUT_OUI);
    buf.put_u8(subtype);
    buf.put_slice(body);
}

fn local_u64(value: &[u8]) -> Option<u64> {
    match value.split_first() {
        Some((&SUBTYPE_LOCAL, rest)) => Some(u64::from_be_bytes(rest.try_into().ok()?)),
        _ => None,
    }
}

fn local_u32(value: &[u8]) -> Option<u32> {
    match value.split_first() {
        Some((&SUBTYPE_LOCAL, rest)) => Some(u32::from_be_bytes(rest.try_into().ok()?)),
        _ => None,
    }
}

/// Walks the TLV list after the Ethernet header.
struct TlvReader<'a> {
    rest: &'a [u8],
}

impl<'a> TlvReader<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    /// Next (type, value) pair. `None` on truncation.
    fn next_tlv(&mut self) -> Option<(u8, &'a [u8])> {
        if self.rest.len() < 2 {
            return None;
        }
        let raw = u16::from_be_bytes([self.rest[0], self.rest[1]]);
        let kind = (raw >> 9) as u8;
        let len = (raw & 0x01ff) as usize;
        let body = self.rest.get(2..2 + len)?;
        self.rest = &self.rest[2 + len..];
        Some((kind, body))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised when building a probe from invalid input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("device id is empty")]
    EmptyDeviceId,

    #[error("device id is {0} bytes, maximum is {}", MAX_DEVICE_ID_LEN)]
    DeviceIdTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
