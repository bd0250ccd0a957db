//! Ordered command plans.

use std::fmt;

use crate::command::TunnelCommand;
use crate::inspector::InterfaceState;
use crate::tunnel::TunnelSpec;

/// One step of a reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    CreateInterface,
    AssignAddress,
    SetMtu,
    LinkUp,
    LinkDown,
    DeleteInterface,
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanStep::CreateInterface => "create interface",
            PlanStep::AssignAddress => "assign address",
            PlanStep::SetMtu => "set MTU",
            PlanStep::LinkUp => "bring link up",
            PlanStep::LinkDown => "bring link down",
            PlanStep::DeleteInterface => "delete interface",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub step: PlanStep,
    pub command: TunnelCommand,
}

/// Commands for one interface, executed strictly in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub interface: String,
    pub steps: Vec<PlannedCommand>,
    /// The interface was seen absent before planning, so a failed create
    /// step may still have left a device behind that is ours to delete.
    pub owns_interface: bool,
}

impl Plan {
    /// Create, address, MTU, link state.
    ///
    /// An interface that already carries the tunnel's kind, endpoints and
    /// address is reused, and steps it already satisfies are left out. Any
    /// other interface of that name gets the full plan. The link step is
    /// always present.
    pub fn provision(spec: &TunnelSpec, link_up: bool, live: Option<&InterfaceState>) -> Self {
        let interface = spec.interface_name.clone();
        let owns_interface = live.is_some_and(|l| !l.exists);
        let absent = InterfaceState::absent();
        let live = match live {
            Some(live) if live.carries(spec) => live,
            _ => &absent,
        };
        let mut steps = Vec::with_capacity(4);

        if !live.exists {
            steps.push(PlannedCommand {
                step: PlanStep::CreateInterface,
                command: TunnelCommand::AddTunnel {
                    interface: interface.clone(),
                    kind: spec.kind,
                    local: spec.local_ip,
                    remote: spec.remote_ip,
                },
            });
        }

        if !live.has_address(&spec.assigned_ip) {
            steps.push(PlannedCommand {
                step: PlanStep::AssignAddress,
                command: TunnelCommand::AddAddress {
                    interface: interface.clone(),
                    address: spec.assigned_ip,
                },
            });
        }

        if let Some(mtu) = spec.mtu {
            if live.mtu != Some(u32::from(mtu)) {
                steps.push(PlannedCommand {
                    step: PlanStep::SetMtu,
                    command: TunnelCommand::SetMtu {
                        interface: interface.clone(),
                        mtu,
                    },
                });
            }
        }

        let mut plan = Self {
            interface,
            steps,
            owns_interface,
        };
        let link = plan.link_step(link_up);
        plan.steps.push(link);
        plan
    }

    /// Delete the interface.
    pub fn teardown(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            steps: vec![PlannedCommand {
                step: PlanStep::DeleteInterface,
                command: TunnelCommand::DeleteInterface {
                    interface: interface.to_string(),
                },
            }],
            owns_interface: false,
        }
    }

    /// Bring the link up or down. Issued even if the link is already there.
    pub fn set_link(interface: &str, up: bool) -> Self {
        let mut plan = Self {
            interface: interface.to_string(),
            steps: Vec::with_capacity(1),
            owns_interface: false,
        };
        let link = plan.link_step(up);
        plan.steps.push(link);
        plan
    }

    fn link_step(&self, up: bool) -> PlannedCommand {
        PlannedCommand {
            step: if up {
                PlanStep::LinkUp
            } else {
                PlanStep::LinkDown
            },
            command: TunnelCommand::SetLink {
                interface: self.interface.clone(),
                up,
            },
        }
    }

    pub fn step_kinds(&self) -> Vec<PlanStep> {
        self.steps.iter().map(|s| s.step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::TunnelEndpoints;
    use crate::tunnel::TunnelKind;

    fn spec(mtu: Option<u16>) -> TunnelSpec {
        TunnelSpec {
            name: "lab".to_string(),
            kind: TunnelKind::Ipip6,
            local_ip: "2001:db8::1".parse().unwrap(),
            remote_ip: "2001:db8::2".parse().unwrap(),
            assigned_ip: "fd00:1::1/64".parse().unwrap(),
            mtu,
            interface_name: "ip6tnl1".to_string(),
        }
    }

    #[test]
    fn test_full_plan_order() {
        let plan = Plan::provision(&spec(Some(1400)), true, None);
        assert_eq!(
            plan.step_kinds(),
            vec![
                PlanStep::CreateInterface,
                PlanStep::AssignAddress,
                PlanStep::SetMtu,
                PlanStep::LinkUp
            ]
        );
    }

    #[test]
    fn test_mtu_step_only_when_set() {
        let plan = Plan::provision(&spec(None), false, None);
        assert_eq!(
            plan.step_kinds(),
            vec![
                PlanStep::CreateInterface,
                PlanStep::AssignAddress,
                PlanStep::LinkDown
            ]
        );
    }

    fn live(spec: &TunnelSpec) -> InterfaceState {
        let mut live = InterfaceState {
            exists: true,
            is_up: true,
            mtu: Some(1400),
            tunnel: Some(TunnelEndpoints::of(spec)),
            ..Default::default()
        };
        live.addresses.insert(spec.assigned_ip);
        live
    }

    #[test]
    fn test_satisfied_steps_are_skipped() {
        let mut live = live(&spec(Some(1400)));

        // Link step stays even though the link is already up.
        let plan = Plan::provision(&spec(Some(1400)), true, Some(&live));
        assert_eq!(plan.step_kinds(), vec![PlanStep::LinkUp]);

        live.mtu = Some(1480);
        let plan = Plan::provision(&spec(Some(1400)), true, Some(&live));
        assert_eq!(plan.step_kinds(), vec![PlanStep::SetMtu, PlanStep::LinkUp]);
        assert!(!plan.owns_interface);
    }

    #[test]
    fn test_foreign_interface_gets_full_plan() {
        let full = vec![
            PlanStep::CreateInterface,
            PlanStep::AssignAddress,
            PlanStep::LinkUp,
        ];

        let mut moved = live(&spec(None));
        moved.tunnel = Some(TunnelEndpoints {
            remote: "2001:db8::99".parse().unwrap(),
            ..TunnelEndpoints::of(&spec(None))
        });
        let plan = Plan::provision(&spec(None), true, Some(&moved));
        assert_eq!(plan.step_kinds(), full);
        assert!(!plan.owns_interface);

        let mut readdressed = live(&spec(None));
        readdressed.addresses.insert("fd00:2::1/64".parse().unwrap());
        let plan = Plan::provision(&spec(None), true, Some(&readdressed));
        assert_eq!(plan.step_kinds(), full);
    }

    #[test]
    fn test_owns_interface_only_when_seen_absent() {
        let absent = InterfaceState::absent();
        assert!(Plan::provision(&spec(None), true, Some(&absent)).owns_interface);
        assert!(!Plan::provision(&spec(None), true, None).owns_interface);
        assert!(!Plan::teardown("ip6tnl1").owns_interface);
    }

    #[test]
    fn test_set_link() {
        let plan = Plan::set_link("gre1", false);
        assert_eq!(
            plan.steps,
            vec![PlannedCommand {
                step: PlanStep::LinkDown,
                command: TunnelCommand::SetLink {
                    interface: "gre1".to_string(),
                    up: false
                }
            }]
        );
    }
}
