//! Tunnel data model.
//!
//! `TunnelFields` is what a caller submits (raw, possibly partial form input),
//! `TunnelSpec` is a validated configuration and `TunnelDescriptor` is the
//! stored record including identity and derived status.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Encapsulation mode of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelKind {
    /// IPv6 over IPv4 (SIT), IPv4 endpoints.
    #[serde(rename = "6to4")]
    SixToFour,
    /// IPv6-in-IPv6, IPv6 endpoints.
    #[serde(rename = "ipip6", alias = "ipv6")]
    Ipip6,
    /// GRE over IPv6, IPv6 endpoints.
    #[serde(rename = "gre6")]
    Gre6,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::SixToFour => "6to4",
            TunnelKind::Ipip6 => "ipip6",
            TunnelKind::Gre6 => "gre6",
        }
    }

    /// Whether the endpoints of this kind are IPv6 addresses.
    pub fn ipv6_endpoints(&self) -> bool {
        !matches!(self, TunnelKind::SixToFour)
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "6to4" => Ok(TunnelKind::SixToFour),
            // "ipv6" is the pre-ipip6/gre6 schema name for the same mode
            "ipip6" | "ipv6" => Ok(TunnelKind::Ipip6),
            "gre6" => Ok(TunnelKind::Gre6),
            _ => Err(()),
        }
    }
}

/// Observable status of a tunnel. Only the engine sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Active,
    Inactive,
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Inactive => "inactive",
            TunnelStatus::Error => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TunnelStatus::Active),
            "inactive" => Ok(TunnelStatus::Inactive),
            "error" => Ok(TunnelStatus::Error),
            _ => Err(()),
        }
    }
}

/// Status a caller may request through a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Inactive,
}

impl TargetStatus {
    /// Whether the interface link should be up.
    pub fn link_up(&self) -> bool {
        matches!(self, TargetStatus::Active)
    }
}

impl From<TargetStatus> for TunnelStatus {
    fn from(target: TargetStatus) -> Self {
        match target {
            TargetStatus::Active => TunnelStatus::Active,
            TargetStatus::Inactive => TunnelStatus::Inactive,
        }
    }
}

/// Raw tunnel fields as submitted by a caller.
///
/// Every field is optional so the same type serves create (all required) and
/// update (omitted fields keep their stored value).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelFields {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub assigned_ip: Option<String>,
    /// Empty string means "no MTU".
    pub mtu: Option<String>,
    pub interface_name: Option<String>,
}

impl TunnelFields {
    /// Overlay these (partial) fields onto a stored descriptor.
    pub fn merged_onto(self, base: &TunnelDescriptor) -> TunnelFields {
        let base = TunnelFields::from(base);
        TunnelFields {
            name: self.name.or(base.name),
            kind: self.kind.or(base.kind),
            local_ip: self.local_ip.or(base.local_ip),
            remote_ip: self.remote_ip.or(base.remote_ip),
            assigned_ip: self.assigned_ip.or(base.assigned_ip),
            mtu: self.mtu.or(base.mtu),
            interface_name: self.interface_name.or(base.interface_name),
        }
    }
}

impl From<&TunnelDescriptor> for TunnelFields {
    fn from(t: &TunnelDescriptor) -> Self {
        Self {
            name: Some(t.name.clone()),
            kind: Some(t.kind.as_str().to_string()),
            local_ip: Some(t.local_ip.to_string()),
            remote_ip: Some(t.remote_ip.to_string()),
            assigned_ip: Some(t.assigned_ip.to_string()),
            mtu: Some(t.mtu.map(|m| m.to_string()).unwrap_or_default()),
            interface_name: Some(t.interface_name.clone()),
        }
    }
}

/// A validated tunnel configuration. Built by [`crate::validation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub kind: TunnelKind,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub assigned_ip: IpNet,
    pub mtu: Option<u16>,
    pub interface_name: String,
}

/// Stored tunnel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub assigned_ip: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    pub interface_name: String,
    pub status: TunnelStatus,
    /// Message of the last failed operation, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TunnelDescriptor {
    /// New descriptor for a freshly reserved spec.
    pub fn new(id: String, spec: TunnelSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            local_ip: spec.local_ip,
            remote_ip: spec.remote_ip,
            assigned_ip: spec.assigned_ip,
            mtu: spec.mtu,
            interface_name: spec.interface_name,
            status: TunnelStatus::Inactive,
            status_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn spec(&self) -> TunnelSpec {
        TunnelSpec {
            name: self.name.clone(),
            kind: self.kind,
            local_ip: self.local_ip,
            remote_ip: self.remote_ip,
            assigned_ip: self.assigned_ip,
            mtu: self.mtu,
            interface_name: self.interface_name.clone(),
        }
    }

    /// Copy of this descriptor with `spec` applied. Identity and status are kept.
    pub fn with_spec(&self, spec: TunnelSpec) -> Self {
        Self {
            name: spec.name,
            kind: spec.kind,
            local_ip: spec.local_ip,
            remote_ip: spec.remote_ip,
            assigned_ip: spec.assigned_ip,
            mtu: spec.mtu,
            interface_name: spec.interface_name,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}
