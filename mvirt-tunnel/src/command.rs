//! Typed host commands.
//!
//! The engine never builds command strings. It produces [`TunnelCommand`]s and a
//! [`CommandSurface`] renders them into an argument vector for the executor.
//! Values embedded in the argv are validated addresses and interface names, and
//! no shell is involved, so nothing a caller submits is ever interpreted.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::tunnel::TunnelKind;

/// TTL used for SIT tunnels.
pub const SIT_TTL: u8 = 64;

/// One operation against the host network stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCommand {
    /// Create a tunnel interface.
    AddTunnel {
        interface: String,
        kind: TunnelKind,
        local: IpAddr,
        remote: IpAddr,
    },
    /// Delete an interface of any kind.
    DeleteInterface { interface: String },
    /// Assign an address-with-prefix to an interface.
    AddAddress { interface: String, address: IpNet },
    /// Set the MTU of an interface.
    SetMtu { interface: String, mtu: u16 },
    /// Bring the link up or down.
    SetLink { interface: String, up: bool },
    /// Read-only query of interface state.
    ShowInterface { interface: String },
}

/// A program and its arguments, passed to `execve` as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argv {
    pub program: String,
    pub args: Vec<String>,
}

impl Argv {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `needle` appears as a whole argument.
    pub fn contains(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for Argv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Renders typed commands for a particular host tool set.
pub trait CommandSurface: Send + Sync {
    fn render(&self, command: &TunnelCommand) -> Argv;
}

/// iproute2 (`ip`) command surface.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: String,
}

impl IpRoute2 {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn argv<I, S>(&self, args: I) -> Argv
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Argv::new(self.binary.clone(), args)
    }
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl CommandSurface for IpRoute2 {
    fn render(&self, command: &TunnelCommand) -> Argv {
        match command {
            TunnelCommand::AddTunnel {
                interface,
                kind: TunnelKind::SixToFour,
                local,
                remote,
            } => self.argv([
                "tunnel".to_string(),
                "add".to_string(),
                interface.clone(),
                "mode".to_string(),
                "sit".to_string(),
                "local".to_string(),
                local.to_string(),
                "remote".to_string(),
                remote.to_string(),
                "ttl".to_string(),
                SIT_TTL.to_string(),
            ]),
            TunnelCommand::AddTunnel {
                interface,
                kind,
                local,
                remote,
            } => {
                let mode = match kind {
                    TunnelKind::Gre6 => "ip6gre",
                    _ => "ip6ip6",
                };
                self.argv([
                    "-6".to_string(),
                    "tunnel".to_string(),
                    "add".to_string(),
                    interface.clone(),
                    "mode".to_string(),
                    mode.to_string(),
                    "local".to_string(),
                    local.to_string(),
                    "remote".to_string(),
                    remote.to_string(),
                    "encaplimit".to_string(),
                    "none".to_string(),
                ])
            }
            TunnelCommand::DeleteInterface { interface } => {
                self.argv(["link", "delete", "dev", interface.as_str()])
            }
            TunnelCommand::AddAddress { interface, address } => self.argv([
                "addr".to_string(),
                "add".to_string(),
                address.to_string(),
                "dev".to_string(),
                interface.clone(),
            ]),
            TunnelCommand::SetMtu { interface, mtu } => self.argv([
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                interface.clone(),
                "mtu".to_string(),
                mtu.to_string(),
            ]),
            TunnelCommand::SetLink { interface, up } => self.argv([
                "link",
                "set",
                "dev",
                interface.as_str(),
                if *up { "up" } else { "down" },
            ]),
            TunnelCommand::ShowInterface { interface } => {
                self.argv(["-d", "-j", "addr", "show", "dev", interface.as_str()])
            }
        }
    }
}
