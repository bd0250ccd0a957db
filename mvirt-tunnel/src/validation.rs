//! Field validation for tunnel requests.
//!
//! Errors are collected per field instead of failing on the first problem, so
//! a caller can render every message next to the input it belongs to.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::tunnel::{TunnelFields, TunnelKind, TunnelSpec};

pub const FIELD_NAME: &str = "name";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_LOCAL_IP: &str = "localIp";
pub const FIELD_REMOTE_IP: &str = "remoteIp";
pub const FIELD_ASSIGNED_IP: &str = "assignedIp";
pub const FIELD_MTU: &str = "mtu";
pub const FIELD_INTERFACE_NAME: &str = "interfaceName";

pub const MIN_NAME_LEN: usize = 3;
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 65535;
/// IFNAMSIZ minus the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Field name to messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field error.
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Messages recorded for `field`, empty if none.
    pub fn field(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fields
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

pub type Result<T> = std::result::Result<T, ValidationErrors>;

/// Validate a complete field set into a [`TunnelSpec`].
///
/// Endpoint family is checked against the tunnel type before anything else
/// touches the addresses: 6to4 wants IPv4 endpoints, ipip6/gre6 want IPv6.
pub fn validate_tunnel(fields: &TunnelFields) -> Result<TunnelSpec> {
    let mut errors = ValidationErrors::new();

    let name = match required(&fields.name) {
        Some(name) if name.chars().count() >= MIN_NAME_LEN => Some(name.to_string()),
        Some(_) | None => {
            errors.add(
                FIELD_NAME,
                format!("Name must be at least {} characters long.", MIN_NAME_LEN),
            );
            None
        }
    };

    let kind = match required(&fields.kind) {
        None => {
            errors.add(FIELD_TYPE, "Tunnel type is required.");
            None
        }
        Some(raw) => match raw.trim().parse::<TunnelKind>() {
            Ok(kind) => Some(kind),
            Err(()) => {
                errors.add(FIELD_TYPE, "Tunnel type must be one of 6to4, ipip6, gre6.");
                None
            }
        },
    };

    let local_ip = endpoint(&fields.local_ip, FIELD_LOCAL_IP, "Local IP", kind, &mut errors);
    let remote_ip = endpoint(
        &fields.remote_ip,
        FIELD_REMOTE_IP,
        "Remote IP",
        kind,
        &mut errors,
    );

    let assigned_ip = match required(&fields.assigned_ip) {
        None => {
            errors.add(FIELD_ASSIGNED_IP, "Assigned IP is required.");
            None
        }
        Some(raw) => match raw.trim().parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                errors.add(
                    FIELD_ASSIGNED_IP,
                    "Invalid Assigned IP/CIDR format (e.g., 10.0.0.1/24 or fd00::1/64).",
                );
                None
            }
        },
    };

    let mtu = match fields.mtu.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_mtu(raw).map(Some),
    }
    .unwrap_or_else(|message| {
        errors.add(FIELD_MTU, message);
        None
    });

    let interface_name = match required(&fields.interface_name) {
        None => {
            errors.add(FIELD_INTERFACE_NAME, "Interface name is required.");
            None
        }
        Some(raw) => match check_interface_name(raw) {
            Ok(()) => Some(raw.to_string()),
            Err(message) => {
                errors.add(FIELD_INTERFACE_NAME, message);
                None
            }
        },
    };

    match (name, kind, local_ip, remote_ip, assigned_ip, interface_name) {
        (
            Some(name),
            Some(kind),
            Some(local_ip),
            Some(remote_ip),
            Some(assigned_ip),
            Some(interface_name),
        ) if errors.is_empty() => Ok(TunnelSpec {
            name,
            kind,
            local_ip,
            remote_ip,
            assigned_ip,
            mtu,
            interface_name,
        }),
        _ => Err(errors),
    }
}

/// Check an interface name against the charset the command builder accepts.
///
/// Names end up as argv elements of privileged commands, so anything beyond
/// `[A-Za-z0-9_-]` is rejected here.
pub fn check_interface_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("Interface name is required.");
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err("Interface name must be at most 15 characters long.");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Interface name can only contain letters, numbers, underscore, and hyphen.");
    }
    // ip(8) would read a leading '-' as an option
    if name.starts_with('-') {
        return Err("Interface name must not start with a hyphen.");
    }
    Ok(())
}

fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn parse_mtu(raw: &str) -> std::result::Result<u16, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| "MTU must be a whole number.".to_string())?;
    if !(MIN_MTU..=MAX_MTU).contains(&value) {
        return Err(format!("MTU must be between {} and {}.", MIN_MTU, MAX_MTU));
    }
    Ok(value as u16)
}

fn endpoint(
    value: &Option<String>,
    field: &str,
    label: &str,
    kind: Option<TunnelKind>,
    errors: &mut ValidationErrors,
) -> Option<IpAddr> {
    let Some(raw) = required(value) else {
        errors.add(field, format!("{} is required.", label));
        return None;
    };
    let parsed = raw.trim().parse::<IpAddr>().ok();

    match (kind, parsed) {
        (Some(TunnelKind::SixToFour), Some(addr @ IpAddr::V4(_))) => Some(addr),
        (Some(TunnelKind::SixToFour), _) => {
            errors.add(
                field,
                format!("{} must be a valid IPv4 address for 6to4 tunnels.", label),
            );
            None
        }
        (Some(_), Some(addr @ IpAddr::V6(_))) => Some(addr),
        (Some(_), _) => {
            errors.add(
                field,
                format!("{} must be a valid IPv6 address for ipip6/gre6 tunnels.", label),
            );
            None
        }
        // Type itself is invalid; only report unparsable addresses.
        (None, Some(addr)) => Some(addr),
        (None, None) => {
            errors.add(field, format!("{} must be a valid IP address.", label));
            None
        }
    }
}
