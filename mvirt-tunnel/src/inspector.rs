//! Live interface state.
//!
//! Read-only. An absent interface is a normal answer, not an error.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

use crate::command::{CommandSurface, TunnelCommand};
use crate::executor::CommandExecutor;
use crate::tunnel::{TunnelKind, TunnelSpec};

/// Inspection errors.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("Interface query for '{0}' failed: {1}")]
    QueryFailed(String, String),

    #[error("Unexpected interface query output for '{0}': {1}")]
    Parse(String, String),
}

pub type Result<T> = std::result::Result<T, InspectError>;

/// Tunnel parameters of a live interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEndpoints {
    pub kind: TunnelKind,
    pub local: IpAddr,
    pub remote: IpAddr,
}

impl TunnelEndpoints {
    pub fn of(spec: &TunnelSpec) -> Self {
        Self {
            kind: spec.kind,
            local: spec.local_ip,
            remote: spec.remote_ip,
        }
    }
}

/// Observed state of one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub exists: bool,
    pub is_up: bool,
    pub addresses: BTreeSet<IpNet>,
    pub mtu: Option<u32>,
    /// `None` when the interface is not a tunnel of a known kind.
    pub tunnel: Option<TunnelEndpoints>,
}

impl InterfaceState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn has_address(&self, address: &IpNet) -> bool {
        self.addresses.contains(address)
    }

    /// Whether this interface already is the tunnel `spec` describes.
    ///
    /// Kind and endpoints must match, and the only routable address may be
    /// the assigned one. Kernel link-local addresses are ignored.
    pub fn carries(&self, spec: &TunnelSpec) -> bool {
        self.exists
            && self.tunnel == Some(TunnelEndpoints::of(spec))
            && self
                .addresses
                .iter()
                .all(|a| *a == spec.assigned_ip || is_link_local(a))
    }
}

fn is_link_local(net: &IpNet) -> bool {
    match net.addr() {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[async_trait]
pub trait InterfaceInspector: Send + Sync {
    async fn inspect(&self, interface: &str) -> Result<InterfaceState>;
}

/// Inspector backed by `ip -d -j addr show dev <name>`.
pub struct IpRoute2Inspector {
    executor: Arc<dyn CommandExecutor>,
    surface: Arc<dyn CommandSurface>,
}

impl IpRoute2Inspector {
    pub fn new(executor: Arc<dyn CommandExecutor>, surface: Arc<dyn CommandSurface>) -> Self {
        Self { executor, surface }
    }
}

#[async_trait]
impl InterfaceInspector for IpRoute2Inspector {
    async fn inspect(&self, interface: &str) -> Result<InterfaceState> {
        let argv = self.surface.render(&TunnelCommand::ShowInterface {
            interface: interface.to_string(),
        });
        let out = self.executor.execute(&argv).await;

        if !out.succeeded {
            if !out.timed_out && out.output.contains("does not exist") {
                return Ok(InterfaceState::absent());
            }
            return Err(InspectError::QueryFailed(
                interface.to_string(),
                out.output.trim().to_string(),
            ));
        }

        parse_addr_show(interface, &out.output)
    }
}

#[derive(Debug, Deserialize)]
struct LinkEntry {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    mtu: Option<u32>,
    #[serde(default)]
    addr_info: Vec<AddrEntry>,
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    local: Option<String>,
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    info_kind: Option<String>,
    info_data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TunnelInfo {
    proto: Option<String>,
    local: Option<String>,
    remote: Option<String>,
}

impl LinkInfo {
    fn endpoints(&self) -> Option<TunnelEndpoints> {
        let data: TunnelInfo = match &self.info_data {
            Some(value) => serde_json::from_value(value.clone()).ok()?,
            None => TunnelInfo::default(),
        };
        let kind = match (self.info_kind.as_deref()?, data.proto.as_deref()) {
            ("sit", _) => TunnelKind::SixToFour,
            ("ip6tnl", Some("ip6ip6")) => TunnelKind::Ipip6,
            ("ip6gre", _) => TunnelKind::Gre6,
            _ => return None,
        };
        // "any" and missing endpoints never match a configured tunnel
        Some(TunnelEndpoints {
            kind,
            local: data.local?.parse().ok()?,
            remote: data.remote?.parse().ok()?,
        })
    }
}

/// Parse the JSON output of `ip -d -j addr show dev <name>`.
pub fn parse_addr_show(interface: &str, output: &str) -> Result<InterfaceState> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(InterfaceState::absent());
    }

    let links: Vec<LinkEntry> = serde_json::from_str(trimmed)
        .map_err(|e| InspectError::Parse(interface.to_string(), e.to_string()))?;

    // Tunnel names can carry an "@NONE" style suffix in some iproute2 versions
    let Some(link) = links.into_iter().find(|l| {
        l.ifname == interface || l.ifname.split('@').next() == Some(interface)
    }) else {
        return Ok(InterfaceState::absent());
    };

    let addresses = link
        .addr_info
        .iter()
        .filter_map(|a| {
            let addr: IpAddr = a.local.as_deref()?.parse().ok()?;
            IpNet::new(addr, a.prefixlen?).ok()
        })
        .collect();

    Ok(InterfaceState {
        exists: true,
        is_up: link.flags.iter().any(|f| f == "UP"),
        addresses,
        mtu: link.mtu,
        tunnel: link.linkinfo.as_ref().and_then(LinkInfo::endpoints),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::IpRoute2;
    use crate::executor::CommandOutput;
    use crate::test_util::FakeHost;

    const SIT1_UP: &str = r#"[{"ifindex":7,"ifname":"sit1","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],"mtu":1480,"qdisc":"noqueue","operstate":"UNKNOWN","group":"default","txqlen":1000,"link_type":"sit","address":"192.0.2.10","broadcast":"198.51.100.1","linkinfo":{"info_kind":"sit","info_data":{"proto":"ip6ip","remote":"198.51.100.1","local":"192.0.2.10","ttl":64,"pmtudisc":true,"prefix":"2002::","prefixlen":16}},"addr_info":[{"family":"inet6","local":"2002:c000:20a::1","prefixlen":48,"scope":"global","valid_life_time":4294967295,"preferred_life_time":4294967295},{"family":"inet6","local":"fe80::c000:20a","prefixlen":64,"scope":"link","valid_life_time":4294967295,"preferred_life_time":4294967295}]}]"#;

    #[test]
    fn test_parse_up_interface() {
        let state = parse_addr_show("sit1", SIT1_UP).unwrap();
        assert!(state.exists);
        assert!(state.is_up);
        assert_eq!(state.mtu, Some(1480));
        assert!(state.has_address(&"2002:c000:20a::1/48".parse().unwrap()));
        assert_eq!(state.addresses.len(), 2);
        assert_eq!(
            state.tunnel,
            Some(TunnelEndpoints {
                kind: TunnelKind::SixToFour,
                local: "192.0.2.10".parse().unwrap(),
                remote: "198.51.100.1".parse().unwrap(),
            })
        );
    }

    #[test]
    fn test_parse_ip6_tunnel_kinds() {
        let ip6tnl = r#"[{"ifname":"ip6tnl1","flags":["POINTOPOINT","NOARP"],"mtu":1452,"linkinfo":{"info_kind":"ip6tnl","info_data":{"proto":"ip6ip6","remote":"2001:db8::2","local":"2001:db8::1","encap_limit":-1,"hoplimit":64}},"addr_info":[]}]"#;
        let state = parse_addr_show("ip6tnl1", ip6tnl).unwrap();
        assert_eq!(state.tunnel.map(|t| t.kind), Some(TunnelKind::Ipip6));

        let any = ip6tnl.replace("\"ip6ip6\"", "\"any\"");
        assert_eq!(parse_addr_show("ip6tnl1", &any).unwrap().tunnel, None);

        let gre = r#"[{"ifname":"gre1@NONE","flags":["POINTOPOINT","NOARP"],"mtu":1448,"linkinfo":{"info_kind":"ip6gre","info_data":{"remote":"2001:db8::2","local":"2001:db8::1"}},"addr_info":[]}]"#;
        let state = parse_addr_show("gre1", gre).unwrap();
        assert_eq!(state.tunnel.map(|t| t.kind), Some(TunnelKind::Gre6));
    }

    #[test]
    fn test_carries_needs_matching_endpoints_and_address() {
        let spec = TunnelSpec {
            name: "office".to_string(),
            kind: TunnelKind::SixToFour,
            local_ip: "192.0.2.10".parse().unwrap(),
            remote_ip: "198.51.100.1".parse().unwrap(),
            assigned_ip: "2002:c000:20a::1/48".parse().unwrap(),
            mtu: None,
            interface_name: "sit1".to_string(),
        };
        let mut state = parse_addr_show("sit1", SIT1_UP).unwrap();
        assert!(state.carries(&spec));

        let mut moved = spec.clone();
        moved.remote_ip = "198.51.100.99".parse().unwrap();
        assert!(!state.carries(&moved));

        let mut other_kind = state.clone();
        other_kind.tunnel = None;
        assert!(!other_kind.carries(&spec));

        state.addresses.insert("2002:c000:20a::2/48".parse().unwrap());
        assert!(!state.carries(&spec));
        assert!(!InterfaceState::absent().carries(&spec));
    }

    #[test]
    fn test_parse_down_interface_without_addresses() {
        let output = r#"[{"ifindex":9,"ifname":"gre1@NONE","flags":["POINTOPOINT","NOARP"],"mtu":1448,"addr_info":[]}]"#;
        let state = parse_addr_show("gre1", output).unwrap();
        assert!(state.exists);
        assert!(!state.is_up);
        assert!(state.addresses.is_empty());
    }

    #[test]
    fn test_parse_empty_output_is_absent() {
        assert_eq!(parse_addr_show("sit1", "").unwrap(), InterfaceState::absent());
        assert_eq!(parse_addr_show("sit1", "[]").unwrap(), InterfaceState::absent());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(parse_addr_show("sit1", "Device sit1 is fine").is_err());
    }

    #[tokio::test]
    async fn test_missing_device_is_absent() {
        let host = Arc::new(FakeHost::new());
        let inspector = IpRoute2Inspector::new(host.clone(), Arc::new(IpRoute2::default()));

        let state = inspector.inspect("sit9").await.unwrap();
        assert!(!state.exists);
        assert_eq!(host.command_lines(), ["ip -d -j addr show dev sit9"]);
    }

    #[tokio::test]
    async fn test_reads_state_back_from_host() {
        let host = Arc::new(FakeHost::new());
        let mut seeded = InterfaceState {
            exists: true,
            is_up: true,
            mtu: Some(1400),
            tunnel: Some(TunnelEndpoints {
                kind: TunnelKind::Gre6,
                local: "2001:db8::1".parse().unwrap(),
                remote: "2001:db8::2".parse().unwrap(),
            }),
            ..Default::default()
        };
        seeded.addresses.insert("fd03::1/126".parse().unwrap());
        host.set_interface("gre1", seeded.clone());
        let inspector = IpRoute2Inspector::new(host, Arc::new(IpRoute2::default()));

        assert_eq!(inspector.inspect("gre1").await.unwrap(), seeded);
    }

    #[tokio::test]
    async fn test_other_failures_are_errors() {
        let host = Arc::new(FakeHost::new());
        host.respond_when(
            |_| true,
            CommandOutput::failure(Some(255), "Cannot open netlink socket"),
        );
        let inspector = IpRoute2Inspector::new(host, Arc::new(IpRoute2::default()));

        assert!(matches!(
            inspector.inspect("sit1").await,
            Err(InspectError::QueryFailed(..))
        ));
    }
}
