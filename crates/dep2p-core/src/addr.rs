//! Multiaddr-style peer addresses.
//!
//! Addresses are `/`-separated protocol stacks, e.g.
//! `/ip4/192.168.1.4/udp/4001/quic-v1/p2p/<node>` or the relay-circuit form
//! `/ip4/10.0.0.9/tcp/4002/p2p/<relay>/p2p-circuit/p2p/<target>`. The engine
//! only ever inspects the stack (transport tag, circuit markers, embedded
//! node IDs); it never interprets the host parts itself.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddrError;
use crate::identity::NodeId;

/// One protocol component of an address stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    /// IPv4 host component.
    Ip4(Ipv4Addr),
    /// IPv6 host component.
    Ip6(Ipv6Addr),
    /// DNS name resolved to IPv4.
    Dns4(String),
    /// DNS name resolved to IPv6.
    Dns6(String),
    /// TCP port.
    Tcp(u16),
    /// UDP port.
    Udp(u16),
    /// Legacy QUIC (draft) marker.
    Quic,
    /// QUIC v1 marker.
    QuicV1,
    /// Embedded node identity.
    P2p(NodeId),
    /// Relay circuit marker; everything before it addresses the relay,
    /// everything after it addresses the target.
    P2pCircuit,
    /// In-process memory transport endpoint (tests and simulations).
    Memory(u64),
}

impl Segment {
    /// The protocol name as it appears on the wire.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Ip4(_) => "ip4",
            Self::Ip6(_) => "ip6",
            Self::Dns4(_) => "dns4",
            Self::Dns6(_) => "dns6",
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            Self::Quic => "quic",
            Self::QuicV1 => "quic-v1",
            Self::P2p(_) => "p2p",
            Self::P2pCircuit => "p2p-circuit",
            Self::Memory(_) => "memory",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Self::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Self::Dns4(host) => write!(f, "/dns4/{host}"),
            Self::Dns6(host) => write!(f, "/dns6/{host}"),
            Self::Tcp(port) => write!(f, "/tcp/{port}"),
            Self::Udp(port) => write!(f, "/udp/{port}"),
            Self::Quic => write!(f, "/quic"),
            Self::QuicV1 => write!(f, "/quic-v1"),
            Self::P2p(node) => write!(f, "/p2p/{node}"),
            Self::P2pCircuit => write!(f, "/p2p-circuit"),
            Self::Memory(id) => write!(f, "/memory/{id}"),
        }
    }
}

/// Ranking class of an address for dial ordering.
///
/// Lower ranks are tried first: private-network addresses beat QUIC, QUIC
/// beats TCP, anything else comes last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddrClass {
    /// Private, loopback, link-local, or in-process address.
    PrivateNet,
    /// Public QUIC address.
    Quic,
    /// Public TCP address.
    Tcp,
    /// Anything else.
    Other,
}

/// A parsed peer address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    segments: Vec<Segment>,
}

impl PeerAddr {
    /// Build an address from segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parse an address from its string form.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let s = s.trim();
        if s.is_empty() || !s.starts_with('/') {
            return Err(AddrError::Malformed(s.to_string()));
        }

        let mut parts = s.split('/').skip(1);
        let mut segments = Vec::new();

        while let Some(proto) = parts.next() {
            if proto.is_empty() {
                return Err(AddrError::Malformed(s.to_string()));
            }
            let mut value = || {
                parts
                    .next()
                    .ok_or_else(|| AddrError::MissingValue(proto.to_string()))
            };
            let segment = match proto {
                "ip4" => Segment::Ip4(parse_value(proto, value()?)?),
                "ip6" => Segment::Ip6(parse_value(proto, value()?)?),
                "dns4" => Segment::Dns4(value()?.to_string()),
                "dns6" => Segment::Dns6(value()?.to_string()),
                "tcp" => Segment::Tcp(parse_value(proto, value()?)?),
                "udp" => Segment::Udp(parse_value(proto, value()?)?),
                "quic" => Segment::Quic,
                "quic-v1" => Segment::QuicV1,
                "p2p" => {
                    let v = value()?;
                    let node = NodeId::from_hex(v).map_err(|_| AddrError::InvalidValue {
                        protocol: "p2p".to_string(),
                        value: v.to_string(),
                    })?;
                    Segment::P2p(node)
                }
                "p2p-circuit" => Segment::P2pCircuit,
                "memory" => Segment::Memory(parse_value(proto, value()?)?),
                other => return Err(AddrError::UnknownProtocol(other.to_string())),
            };
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(AddrError::Malformed(s.to_string()));
        }
        Ok(Self { segments })
    }

    /// The protocol stack.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether this address routes through a relay circuit.
    pub fn is_circuit(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::P2pCircuit)
    }

    /// Whether the host part is the unspecified address (`0.0.0.0` / `::`).
    pub fn is_unspecified(&self) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Ip4(ip) => ip.is_unspecified(),
            Segment::Ip6(ip) => ip.is_unspecified(),
            _ => false,
        })
    }

    /// Whether the address points into a private or in-process network.
    pub fn is_private(&self) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Ip4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            Segment::Ip6(ip) => ip.is_loopback(),
            Segment::Memory(_) => true,
            _ => false,
        })
    }

    /// The tag of the transport that should dial this address, if any.
    ///
    /// For layered stacks the outermost transport wins, so
    /// `/ip4/../udp/../quic-v1` yields `quic-v1` rather than `udp`.
    pub fn transport_tag(&self) -> Option<&'static str> {
        let mut tag = None;
        for segment in &self.segments {
            match segment {
                Segment::Tcp(_) => tag = Some("tcp"),
                Segment::Quic => tag = Some("quic"),
                Segment::QuicV1 => tag = Some("quic-v1"),
                Segment::Memory(_) => tag = Some("memory"),
                Segment::P2pCircuit => break,
                _ => {}
            }
        }
        tag
    }

    /// Ranking class for dial ordering.
    pub fn class(&self) -> AddrClass {
        if self.is_private() {
            return AddrClass::PrivateNet;
        }
        match self.transport_tag() {
            Some("quic") | Some("quic-v1") => AddrClass::Quic,
            Some("tcp") => AddrClass::Tcp,
            _ => AddrClass::Other,
        }
    }

    /// The destination node embedded in the address, if any.
    ///
    /// For circuit addresses this is the target behind the relay.
    pub fn node_id(&self) -> Option<NodeId> {
        self.segments.iter().rev().find_map(|s| match s {
            Segment::P2p(node) => Some(*node),
            _ => None,
        })
    }

    /// The relay server's node ID, for circuit addresses.
    pub fn relay_node(&self) -> Option<NodeId> {
        let circuit_pos = self
            .segments
            .iter()
            .position(|s| *s == Segment::P2pCircuit)?;
        self.segments[..circuit_pos].iter().rev().find_map(|s| match s {
            Segment::P2p(node) => Some(*node),
            _ => None,
        })
    }

    /// Append a `/p2p/<node>` component.
    pub fn with_p2p(mut self, node: NodeId) -> Self {
        self.segments.push(Segment::P2p(node));
        self
    }

    /// Build a relay-circuit address: `<relay>/p2p-circuit/p2p/<target>`.
    pub fn circuit_through(relay: PeerAddr, target: NodeId) -> Self {
        let mut segments = relay.segments;
        segments.push(Segment::P2pCircuit);
        segments.push(Segment::P2p(target));
        Self { segments }
    }

    /// The address prefix before the `/p2p-circuit` marker, if present.
    pub fn relay_addr(&self) -> Option<PeerAddr> {
        let circuit_pos = self
            .segments
            .iter()
            .position(|s| *s == Segment::P2pCircuit)?;
        Some(Self {
            segments: self.segments[..circuit_pos].to_vec(),
        })
    }
}

fn parse_value<T: FromStr>(proto: &str, raw: &str) -> Result<T, AddrError> {
    raw.parse().map_err(|_| AddrError::InvalidValue {
        protocol: proto.to_string(),
        value: raw.to_string(),
    })
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({self})")
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PeerAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
