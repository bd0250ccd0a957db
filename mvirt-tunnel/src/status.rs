//! Status tracking.
//!
//! A tunnel's status only ever changes as the outcome of a reconciliation
//! operation. [`compare`] checks stored intent against live state for the
//! read-only drift report; it never changes a status.

use chrono::Utc;
use ipnet::IpNet;
use serde::Serialize;

use crate::inspector::InterfaceState;
use crate::tunnel::{TunnelDescriptor, TunnelStatus};

/// Record a successful operation.
pub fn record_success(tunnel: &mut TunnelDescriptor, status: TunnelStatus) {
    tunnel.status = status;
    tunnel.status_message = None;
    tunnel.updated_at = Utc::now();
}

/// Record a failed operation that left the tunnel in an unknown state.
pub fn record_failure(tunnel: &mut TunnelDescriptor, message: impl Into<String>) {
    tunnel.status = TunnelStatus::Error;
    tunnel.status_message = Some(message.into());
    tunnel.updated_at = Utc::now();
}

/// Status to restore after a recreate. `error` comes back as `inactive`.
pub fn restored(previous: TunnelStatus) -> TunnelStatus {
    match previous {
        TunnelStatus::Active => TunnelStatus::Active,
        TunnelStatus::Inactive | TunnelStatus::Error => TunnelStatus::Inactive,
    }
}

/// One divergence between a descriptor and its interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Drift {
    /// Interface does not exist.
    Missing,
    #[serde(rename_all = "camelCase")]
    LinkState { expected_up: bool, actual_up: bool },
    #[serde(rename_all = "camelCase")]
    AddressMissing { address: IpNet },
    #[serde(rename_all = "camelCase")]
    MtuMismatch { expected: u16, actual: Option<u32> },
    InspectFailed { message: String },
}

/// Drift found for one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub tunnel_id: String,
    pub interface_name: String,
    pub status: TunnelStatus,
    pub drift: Vec<Drift>,
}

/// Compare a descriptor against live state.
///
/// Tunnels in `error` state have no defined expectation and never drift.
pub fn compare(tunnel: &TunnelDescriptor, live: &InterfaceState) -> Vec<Drift> {
    let expected_up = match tunnel.status {
        TunnelStatus::Active => true,
        TunnelStatus::Inactive => false,
        TunnelStatus::Error => return Vec::new(),
    };

    if !live.exists {
        return vec![Drift::Missing];
    }

    let mut drift = Vec::new();
    if live.is_up != expected_up {
        drift.push(Drift::LinkState {
            expected_up,
            actual_up: live.is_up,
        });
    }
    if !live.has_address(&tunnel.assigned_ip) {
        drift.push(Drift::AddressMissing {
            address: tunnel.assigned_ip,
        });
    }
    if let Some(mtu) = tunnel.mtu {
        if live.mtu != Some(u32::from(mtu)) {
            drift.push(Drift::MtuMismatch {
                expected: mtu,
                actual: live.mtu,
            });
        }
    }
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelKind, TunnelSpec};

    fn tunnel(status: TunnelStatus) -> TunnelDescriptor {
        let mut t = TunnelDescriptor::new(
            "t-1".to_string(),
            TunnelSpec {
                name: "office".to_string(),
                kind: TunnelKind::Gre6,
                local_ip: "2001:db8::1".parse().unwrap(),
                remote_ip: "2001:db8::2".parse().unwrap(),
                assigned_ip: "fd03::1/126".parse().unwrap(),
                mtu: Some(1400),
                interface_name: "gre1".to_string(),
            },
        );
        t.status = status;
        t
    }

    fn live(up: bool) -> InterfaceState {
        let mut state = InterfaceState {
            exists: true,
            is_up: up,
            mtu: Some(1400),
            ..Default::default()
        };
        state.addresses.insert("fd03::1/126".parse().unwrap());
        state
    }

    #[test]
    fn test_success_clears_message() {
        let mut t = tunnel(TunnelStatus::Error);
        t.status_message = Some("boom".to_string());
        record_success(&mut t, TunnelStatus::Active);
        assert_eq!(t.status, TunnelStatus::Active);
        assert!(t.status_message.is_none());
    }

    #[test]
    fn test_failure_sets_error() {
        let mut t = tunnel(TunnelStatus::Active);
        record_failure(&mut t, "Failed to bring link up");
        assert_eq!(t.status, TunnelStatus::Error);
        assert_eq!(t.status_message.as_deref(), Some("Failed to bring link up"));
    }

    #[test]
    fn test_restored_status() {
        assert_eq!(restored(TunnelStatus::Active), TunnelStatus::Active);
        assert_eq!(restored(TunnelStatus::Inactive), TunnelStatus::Inactive);
        assert_eq!(restored(TunnelStatus::Error), TunnelStatus::Inactive);
    }

    #[test]
    fn test_in_sync() {
        assert!(compare(&tunnel(TunnelStatus::Active), &live(true)).is_empty());
        assert!(compare(&tunnel(TunnelStatus::Inactive), &live(false)).is_empty());
    }

    #[test]
    fn test_missing_interface() {
        assert_eq!(
            compare(&tunnel(TunnelStatus::Inactive), &InterfaceState::absent()),
            vec![Drift::Missing]
        );
    }

    #[test]
    fn test_every_mismatch_reported() {
        let mut state = live(false);
        state.addresses.clear();
        state.mtu = Some(1480);

        assert_eq!(
            compare(&tunnel(TunnelStatus::Active), &state),
            vec![
                Drift::LinkState {
                    expected_up: true,
                    actual_up: false
                },
                Drift::AddressMissing {
                    address: "fd03::1/126".parse().unwrap()
                },
                Drift::MtuMismatch {
                    expected: 1400,
                    actual: Some(1480)
                },
            ]
        );
    }

    #[test]
    fn test_error_status_never_drifts() {
        assert!(compare(&tunnel(TunnelStatus::Error), &InterfaceState::absent()).is_empty());
    }
}
