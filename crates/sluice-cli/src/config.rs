//! Replay configuration file
//!
//! ```toml
//! [datapath]
//! rx_ring_size = 64
//!
//! [interface]
//! if_index = 7
//! max_fragments = 2
//!
//! [[rule]]
//! match = { type = "udp_dst", port = 53 }
//! action = "redirect"
//!
//! [[rule]]
//! match = { type = "all" }
//! action = "pass"
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sluice_datapath::DatapathConfig;
use sluice_datapath::program::{Ipv4Tuple, Ipv6Tuple, PortSet, QuicFlow};
use sluice_datapath::soft::SoftInterfaceConfig;
use sluice_datapath::{RedirectTarget, Rule, RuleAction, RuleMatch, Xsk};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::sync::Arc;

/// Whole replay configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Datapath policy
    pub datapath: DatapathConfig,
    /// Software interface shape
    pub interface: SoftInterfaceConfig,
    /// Rules, in evaluation order
    #[serde(rename = "rule")]
    pub rules: Vec<RuleSpec>,
}

impl ReplayConfig {
    /// Parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Parse configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: ReplayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the datapath policy and that the rules are usable
    pub fn validate(&self) -> Result<()> {
        self.datapath.validate()?;
        if self.rules.is_empty() {
            bail!("at least one [[rule]] is required");
        }
        if self.interface.queue_count == 0 {
            bail!("interface.queue_count must be at least 1");
        }
        Ok(())
    }

    /// Whether any rule redirects to the replay socket
    pub fn needs_socket(&self) -> bool {
        self.rules.iter().any(|rule| rule.action == ActionSpec::Redirect)
    }

    /// Build datapath rules; `socket` receives redirected frames
    pub fn build_rules(&self, socket: Option<&Arc<Xsk>>) -> Result<Vec<Rule>> {
        self.rules
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                spec.build(socket)
                    .with_context(|| format!("rule {index} is invalid"))
            })
            .collect()
    }
}

/// Action of a configured rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    /// Discard
    Drop,
    /// Deliver to the stack
    Pass,
    /// Bounce back out with swapped addresses
    L2fwd,
    /// Deliver to the replay socket
    Redirect,
}

/// Match predicate of a configured rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum MatchSpec {
    /// Every frame
    All,
    /// Any UDP frame
    Udp,
    /// Any TCP frame
    Tcp,
    /// UDP destination port
    UdpDst {
        /// Port
        port: u16,
    },
    /// TCP destination port
    TcpDst {
        /// Port
        port: u16,
    },
    /// TCP destination port with SYN, FIN or RST
    TcpControlDst {
        /// Port
        port: u16,
    },
    /// IPv4 destination prefix
    Ipv4DstMask {
        /// Prefix
        address: Ipv4Addr,
        /// Mask
        mask: Ipv4Addr,
    },
    /// IPv6 destination prefix
    Ipv6DstMask {
        /// Prefix
        address: Ipv6Addr,
        /// Mask
        mask: Ipv6Addr,
    },
    /// UDP destination port in a set
    UdpPortSet {
        /// Ports
        ports: Vec<u16>,
    },
    /// IPv4 destination and UDP port in a set
    Ipv4UdpPortSet {
        /// Destination address
        address: Ipv4Addr,
        /// Ports
        ports: Vec<u16>,
    },
    /// IPv6 destination and UDP port in a set
    Ipv6UdpPortSet {
        /// Destination address
        address: Ipv6Addr,
        /// Ports
        ports: Vec<u16>,
    },
    /// IPv4 destination and TCP port in a set
    Ipv4TcpPortSet {
        /// Destination address
        address: Ipv4Addr,
        /// Ports
        ports: Vec<u16>,
    },
    /// IPv6 destination and TCP port in a set
    Ipv6TcpPortSet {
        /// Destination address
        address: Ipv6Addr,
        /// Ports
        ports: Vec<u16>,
    },
    /// Exact UDP/IPv4 flow
    Ipv4UdpTuple {
        /// Source endpoint
        source: SocketAddrV4,
        /// Destination endpoint
        destination: SocketAddrV4,
    },
    /// Exact UDP/IPv6 flow
    Ipv6UdpTuple {
        /// Source endpoint
        source: SocketAddrV6,
        /// Destination endpoint
        destination: SocketAddrV6,
    },
    /// QUIC long-header source CID over UDP
    QuicFlowSrcCid(QuicSpec),
    /// QUIC short-header destination CID over UDP
    QuicFlowDstCid(QuicSpec),
    /// QUIC long-header source CID over TCP
    TcpQuicFlowSrcCid(QuicSpec),
    /// QUIC short-header destination CID over TCP
    TcpQuicFlowDstCid(QuicSpec),
}

/// QUIC flow selector
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuicSpec {
    /// Destination port
    pub port: u16,
    /// Offset of the compared window within the CID
    #[serde(default)]
    pub cid_offset: u8,
    /// Window bytes, hex encoded
    pub cid: String,
}

impl QuicSpec {
    fn build(&self) -> Result<QuicFlow> {
        let cid = hex::decode(&self.cid).context("cid must be hex")?;
        Ok(QuicFlow::new(self.port, self.cid_offset, &cid)?)
    }
}

/// One configured rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Predicate
    #[serde(rename = "match")]
    pub matcher: MatchSpec,
    /// Action
    pub action: ActionSpec,
}

impl RuleSpec {
    fn build(&self, socket: Option<&Arc<Xsk>>) -> Result<Rule> {
        let matcher = match &self.matcher {
            MatchSpec::All => RuleMatch::All,
            MatchSpec::Udp => RuleMatch::Udp,
            MatchSpec::Tcp => RuleMatch::Tcp,
            MatchSpec::UdpDst { port } => RuleMatch::UdpDst(*port),
            MatchSpec::TcpDst { port } => RuleMatch::TcpDst(*port),
            MatchSpec::TcpControlDst { port } => RuleMatch::TcpControlDst(*port),
            MatchSpec::Ipv4DstMask { address, mask } => RuleMatch::Ipv4DstMask {
                address: *address,
                mask: *mask,
            },
            MatchSpec::Ipv6DstMask { address, mask } => RuleMatch::Ipv6DstMask {
                address: *address,
                mask: *mask,
            },
            MatchSpec::UdpPortSet { ports } => RuleMatch::UdpPortSet(port_set(ports)),
            MatchSpec::Ipv4UdpPortSet { address, ports } => RuleMatch::Ipv4UdpPortSet {
                address: *address,
                ports: port_set(ports),
            },
            MatchSpec::Ipv6UdpPortSet { address, ports } => RuleMatch::Ipv6UdpPortSet {
                address: *address,
                ports: port_set(ports),
            },
            MatchSpec::Ipv4TcpPortSet { address, ports } => RuleMatch::Ipv4TcpPortSet {
                address: *address,
                ports: port_set(ports),
            },
            MatchSpec::Ipv6TcpPortSet { address, ports } => RuleMatch::Ipv6TcpPortSet {
                address: *address,
                ports: port_set(ports),
            },
            MatchSpec::Ipv4UdpTuple {
                source,
                destination,
            } => RuleMatch::Ipv4UdpTuple(Ipv4Tuple {
                source_address: *source.ip(),
                destination_address: *destination.ip(),
                source_port: source.port(),
                destination_port: destination.port(),
            }),
            MatchSpec::Ipv6UdpTuple {
                source,
                destination,
            } => RuleMatch::Ipv6UdpTuple(Ipv6Tuple {
                source_address: *source.ip(),
                destination_address: *destination.ip(),
                source_port: source.port(),
                destination_port: destination.port(),
            }),
            MatchSpec::QuicFlowSrcCid(spec) => RuleMatch::QuicFlowSrcCid(spec.build()?),
            MatchSpec::QuicFlowDstCid(spec) => RuleMatch::QuicFlowDstCid(spec.build()?),
            MatchSpec::TcpQuicFlowSrcCid(spec) => RuleMatch::TcpQuicFlowSrcCid(spec.build()?),
            MatchSpec::TcpQuicFlowDstCid(spec) => RuleMatch::TcpQuicFlowDstCid(spec.build()?),
        };

        let action = match self.action {
            ActionSpec::Drop => RuleAction::Drop,
            ActionSpec::Pass => RuleAction::Pass,
            ActionSpec::L2fwd => RuleAction::L2Fwd,
            ActionSpec::Redirect => match socket {
                Some(socket) => RuleAction::Redirect(RedirectTarget::Xsk(socket.clone())),
                None => bail!("redirect needs the replay socket"),
            },
        };
        Ok(Rule::new(matcher, action))
    }
}

fn port_set(ports: &[u16]) -> PortSet {
    PortSet::from_ports(ports.iter().copied())
}

/// Parse a frames file: one hex frame per line, `|` separating buffers of a
/// fragmented frame. Blank lines and `#` comments are skipped.
pub fn parse_frames(content: &str) -> Result<Vec<Vec<Vec<u8>>>> {
    let mut frames = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let buffers = line
            .split('|')
            .map(|part| {
                let hex: String = part.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(&hex)
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("line {}: invalid hex", number + 1))?;
        frames.push(buffers);
    }
    Ok(frames)
}
