//! Test doubles for the host command surface.
//!
//! [`FakeHost`] plays the kernel: it records every argv it receives, applies
//! iproute2 commands to an in-memory interface table and answers inspection
//! from that table. Failures are injected with rules.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::command::Argv;
use crate::executor::{CommandExecutor, CommandOutput};
use crate::inspector::{self, InspectError, InterfaceInspector, InterfaceState, TunnelEndpoints};
use crate::tunnel::TunnelKind;

type Matcher = Box<dyn Fn(&Argv) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn(&Argv) + Send + Sync>;

struct Rule {
    matches: Matcher,
    output: CommandOutput,
    once: bool,
}

/// Start or end of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Started(Argv),
    Finished(Argv),
}

#[derive(Default)]
struct HostState {
    interfaces: BTreeMap<String, InterfaceState>,
    commands: Vec<Argv>,
    events: Vec<HostEvent>,
    rules: Vec<Rule>,
    hooks: Vec<Hook>,
    broken_inspection: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Simulated host network stack.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    delay: Duration,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command takes `delay` to run, so concurrent callers overlap.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            delay,
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every matching command with `output` instead of simulating it.
    pub fn respond_when(
        &self,
        matches: impl Fn(&Argv) -> bool + Send + Sync + 'static,
        output: CommandOutput,
    ) {
        self.state().rules.push(Rule {
            matches: Box::new(matches),
            output,
            once: false,
        });
    }

    /// Like [`respond_when`](Self::respond_when) but only for the first match.
    pub fn respond_once_when(
        &self,
        matches: impl Fn(&Argv) -> bool + Send + Sync + 'static,
        output: CommandOutput,
    ) {
        self.state().rules.push(Rule {
            matches: Box::new(matches),
            output,
            once: true,
        });
    }

    /// Fail every command whose arguments contain `arg` (e.g. `"addr"`).
    pub fn fail_on(&self, arg: &'static str, message: &str) {
        self.respond_when(
            move |argv| argv.contains(arg),
            CommandOutput::failure(Some(2), message),
        );
    }

    /// Run `hook` after each command completes.
    pub fn on_command(&self, hook: impl Fn(&Argv) + Send + Sync + 'static) {
        self.state().hooks.push(Arc::new(hook));
    }

    /// Make inspection of `interface` fail.
    pub fn break_inspection(&self, interface: &str) {
        self.state().broken_inspection.push(interface.to_string());
    }

    /// Seed or overwrite an interface.
    pub fn set_interface(&self, name: &str, state: InterfaceState) {
        self.state().interfaces.insert(name.to_string(), state);
    }

    pub fn interface(&self, name: &str) -> Option<InterfaceState> {
        self.state().interfaces.get(name).cloned()
    }

    pub fn commands(&self) -> Vec<Argv> {
        self.state().commands.clone()
    }

    /// Commands rendered as single strings, handy for assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state().events.clone()
    }

    /// Highest number of commands that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }
}

impl HostState {
    fn respond(&mut self, argv: &Argv) -> Option<CommandOutput> {
        let index = self.rules.iter().position(|r| (r.matches)(argv))?;
        let output = self.rules[index].output.clone();
        if self.rules[index].once {
            self.rules.remove(index);
        }
        Some(output)
    }

    fn apply(&mut self, argv: &Argv) -> CommandOutput {
        let args: Vec<&str> = argv.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["tunnel", "add", name, rest @ ..] | ["-6", "tunnel", "add", name, rest @ ..] => {
                if self.interfaces.contains_key(*name) {
                    return CommandOutput::failure(
                        Some(1),
                        format!("add tunnel \"{}\" failed: File exists", name),
                    );
                }
                self.interfaces.insert(
                    name.to_string(),
                    InterfaceState {
                        exists: true,
                        is_up: false,
                        addresses: Default::default(),
                        mtu: Some(1480),
                        tunnel: endpoints(rest),
                    },
                );
                CommandOutput::success("")
            }
            ["link", "delete", "dev", name] => match self.interfaces.remove(*name) {
                Some(_) => CommandOutput::success(""),
                None => CommandOutput::failure(
                    Some(1),
                    format!("Cannot find device \"{}\"", name),
                ),
            },
            ["addr", "add", cidr, "dev", name] => {
                let Ok(address) = cidr.parse::<IpNet>() else {
                    return CommandOutput::failure(Some(1), format!("Error: inet prefix is expected rather than \"{}\".", cidr));
                };
                match self.interfaces.get_mut(*name) {
                    None => missing(name),
                    Some(iface) if iface.addresses.contains(&address) => {
                        CommandOutput::failure(Some(2), "RTNETLINK answers: File exists")
                    }
                    Some(iface) => {
                        iface.addresses.insert(address);
                        CommandOutput::success("")
                    }
                }
            }
            ["link", "set", "dev", name, "mtu", mtu] => match self.interfaces.get_mut(*name) {
                None => missing(name),
                Some(iface) => {
                    iface.mtu = mtu.parse().ok();
                    CommandOutput::success("")
                }
            },
            ["link", "set", "dev", name, state @ ("up" | "down")] => {
                match self.interfaces.get_mut(*name) {
                    None => missing(name),
                    Some(iface) => {
                        iface.is_up = *state == "up";
                        CommandOutput::success("")
                    }
                }
            }
            ["-d", "-j", "addr", "show", "dev", name] => match self.interfaces.get(*name) {
                None => missing(name),
                Some(iface) => CommandOutput::success(render_addr_show(name, iface)),
            },
            _ => CommandOutput::failure(Some(255), format!("unsupported command: {}", argv)),
        }
    }
}

/// Tunnel parameters from the tail of a `tunnel add` command.
fn endpoints(args: &[&str]) -> Option<TunnelEndpoints> {
    let value = |key: &str| {
        args.windows(2)
            .find(|pair| pair[0] == key)
            .map(|pair| pair[1])
    };
    let kind = match value("mode")? {
        "sit" => TunnelKind::SixToFour,
        "ip6ip6" => TunnelKind::Ipip6,
        "ip6gre" => TunnelKind::Gre6,
        _ => return None,
    };
    Some(TunnelEndpoints {
        kind,
        local: value("local")?.parse().ok()?,
        remote: value("remote")?.parse().ok()?,
    })
}

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failure(Some(1), format!("Device \"{}\" does not exist.", name))
}

fn render_addr_show(name: &str, iface: &InterfaceState) -> String {
    let mut flags = vec!["POINTOPOINT", "NOARP"];
    if iface.is_up {
        flags.extend(["UP", "LOWER_UP"]);
    }
    let addr_info: Vec<serde_json::Value> = iface
        .addresses
        .iter()
        .map(|net| {
            let family = match net.addr() {
                IpAddr::V4(_) => "inet",
                IpAddr::V6(_) => "inet6",
            };
            serde_json::json!({
                "family": family,
                "local": net.addr().to_string(),
                "prefixlen": net.prefix_len(),
            })
        })
        .collect();
    let mut link = serde_json::json!({
        "ifname": name,
        "flags": flags,
        "mtu": iface.mtu,
        "addr_info": addr_info,
    });
    if let Some(tunnel) = iface.tunnel {
        let (kind, proto) = match tunnel.kind {
            TunnelKind::SixToFour => ("sit", "ip6ip"),
            TunnelKind::Ipip6 => ("ip6tnl", "ip6ip6"),
            TunnelKind::Gre6 => ("ip6gre", "gre"),
        };
        link["linkinfo"] = serde_json::json!({
            "info_kind": kind,
            "info_data": {
                "proto": proto,
                "local": tunnel.local.to_string(),
                "remote": tunnel.remote.to_string(),
            },
        });
    }
    serde_json::json!([link]).to_string()
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(&self, argv: &Argv) -> CommandOutput {
        {
            let mut state = self.state();
            state.commands.push(argv.clone());
            state.events.push(HostEvent::Started(argv.clone()));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let (output, hooks) = {
            let mut state = self.state();
            state.in_flight -= 1;
            state.events.push(HostEvent::Finished(argv.clone()));
            let output = match state.respond(argv) {
                Some(output) => output,
                None => state.apply(argv),
            };
            (output, state.hooks.clone())
        };

        for hook in hooks {
            hook(argv);
        }
        output
    }
}

#[async_trait]
impl InterfaceInspector for FakeHost {
    async fn inspect(&self, interface: &str) -> inspector::Result<InterfaceState> {
        let state = self.state();
        if state.broken_inspection.iter().any(|n| n == interface) {
            return Err(InspectError::QueryFailed(
                interface.to_string(),
                "Cannot open netlink socket: Permission denied".to_string(),
            ));
        }
        Ok(state
            .interfaces
            .get(interface)
            .cloned()
            .unwrap_or_else(InterfaceState::absent))
    }
}
