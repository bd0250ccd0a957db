//! Reconciliation engine.
//!
//! Turns caller intents into ordered command plans against the host, and
//! records the outcome in the store only after the host confirmed it. All
//! commands for one interface run under that interface's lock.

mod locks;
mod plan;

pub use locks::{InterfaceGuard, InterfaceLocks};
pub use plan::{Plan, PlanStep, PlannedCommand};

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{CommandSurface, TunnelCommand};
use crate::config::EngineConfig;
use crate::error::{CommandFailure, TunnelError};
use crate::executor::CommandExecutor;
use crate::inspector::{InterfaceInspector, InterfaceState};
use crate::status::{self, DriftReport};
use crate::store::TunnelStore;
use crate::tunnel::{TargetStatus, TunnelDescriptor, TunnelFields, TunnelStatus};
use crate::validation::validate_tunnel;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// How often an operation re-locks after the tunnel was renamed underneath it.
const MAX_LOCK_ATTEMPTS: usize = 3;

/// Result of a delete. Bookkeeping is always removed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub tunnel: TunnelDescriptor,
    /// The delete command failed; the interface may still exist.
    pub os_command_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub struct TunnelEngine {
    store: Arc<dyn TunnelStore>,
    executor: Arc<dyn CommandExecutor>,
    inspector: Arc<dyn InterfaceInspector>,
    surface: Arc<dyn CommandSurface>,
    locks: Arc<InterfaceLocks>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl TunnelEngine {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        executor: Arc<dyn CommandExecutor>,
        inspector: Arc<dyn InterfaceInspector>,
        surface: Arc<dyn CommandSurface>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            inspector,
            surface,
            locks: InterfaceLocks::new(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops running plans at the next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn list(&self) -> Result<Vec<TunnelDescriptor>> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: &str) -> Result<TunnelDescriptor> {
        Ok(self.store.get(id).await?)
    }

    /// Validate, reserve the interface name, provision and bring the link up.
    ///
    /// Nothing is stored unless every step succeeded.
    pub async fn create(&self, fields: TunnelFields) -> Result<TunnelDescriptor> {
        let spec = validate_tunnel(&fields)?;
        let tunnel = self.store.reserve(spec).await?;
        let id = tunnel.id.clone();

        let result = self.create_reserved(tunnel).await;
        if result.is_err() {
            self.release(&id).await;
        }
        result
    }

    async fn create_reserved(&self, mut tunnel: TunnelDescriptor) -> Result<TunnelDescriptor> {
        let _guard = self.lock(&[tunnel.interface_name.as_str()]).await?;

        let live = self.observe(&tunnel.interface_name).await;
        let plan = Plan::provision(&tunnel.spec(), true, live.as_ref());
        if let Err(e) = self.run_plan(&plan).await {
            error!(
                interface = %tunnel.interface_name,
                error = %e,
                "Failed to create tunnel"
            );
            return Err(e);
        }

        status::record_success(&mut tunnel, TunnelStatus::Active);
        if let Err(e) = self.store.commit(&tunnel).await {
            error!(
                interface = %tunnel.interface_name,
                error = %e,
                "Failed to store created tunnel, removing interface"
            );
            self.compensate(&tunnel.interface_name).await;
            return Err(e.into());
        }

        info!(
            id = %tunnel.id,
            interface = %tunnel.interface_name,
            kind = %tunnel.kind,
            "Tunnel created"
        );
        Ok(tunnel)
    }

    /// Merge `fields` onto the stored tunnel and recreate its interface.
    ///
    /// The old interface is always torn down, even if only the display name
    /// changed. The link is restored to its previous state. On failure the
    /// merged descriptor is stored with status `error`.
    pub async fn update(&self, id: &str, fields: TunnelFields) -> Result<TunnelDescriptor> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let current = self.store.get(id).await?;
            let spec = validate_tunnel(&fields.clone().merged_onto(&current))?;

            let _guard = self
                .lock(&[current.interface_name.as_str(), spec.interface_name.as_str()])
                .await?;

            // A concurrent rename may have moved the tunnel to a name we did not lock.
            let locked = self.store.get(id).await?;
            if locked.interface_name != current.interface_name {
                debug!(id = %id, "Tunnel renamed while waiting for lock, retrying");
                continue;
            }

            return self.update_locked(locked, fields).await;
        }

        Err(TunnelError::Busy(id.to_string()))
    }

    async fn update_locked(
        &self,
        current: TunnelDescriptor,
        fields: TunnelFields,
    ) -> Result<TunnelDescriptor> {
        let spec = validate_tunnel(&fields.merged_onto(&current))?;
        if spec.interface_name != current.interface_name {
            self.store.claim(&current.id, &spec.interface_name).await?;
        }

        let mut merged = current.with_spec(spec);
        let target = status::restored(current.status);

        match self.teardown(&current.interface_name).await {
            Ok(()) => {}
            Err(e @ TunnelError::Cancelled { .. }) => {
                self.release(&current.id).await;
                return Err(e);
            }
            Err(e) => warn!(
                id = %current.id,
                interface = %current.interface_name,
                error = %e,
                "Failed to remove old interface, continuing with update"
            ),
        }

        let live = self.observe(&merged.interface_name).await;
        let plan = Plan::provision(
            &merged.spec(),
            target == TunnelStatus::Active,
            live.as_ref(),
        );

        match self.run_plan(&plan).await {
            Ok(()) => {
                status::record_success(&mut merged, target);
                if let Err(e) = self.store.commit(&merged).await {
                    error!(
                        id = %merged.id,
                        interface = %merged.interface_name,
                        error = %e,
                        "Failed to store updated tunnel"
                    );
                    self.release(&merged.id).await;
                    return Err(e.into());
                }
                info!(
                    id = %merged.id,
                    interface = %merged.interface_name,
                    status = %merged.status,
                    "Tunnel updated"
                );
                Ok(merged)
            }
            Err(e) => {
                error!(
                    id = %merged.id,
                    interface = %merged.interface_name,
                    error = %e,
                    "Failed to update tunnel"
                );
                status::record_failure(&mut merged, e.public_message());
                if let Err(store_err) = self.store.commit(&merged).await {
                    error!(id = %merged.id, error = %store_err, "Failed to record update failure");
                    self.release(&merged.id).await;
                }
                Err(e)
            }
        }
    }

    /// Delete the interface and always remove the stored tunnel.
    ///
    /// A failed delete command is reported in the outcome, not as an error.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let (tunnel, _guard) = self.lock_tunnel(id).await?;

        let warning = match self.teardown(&tunnel.interface_name).await {
            Ok(()) => None,
            Err(e @ TunnelError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                warn!(
                    id = %tunnel.id,
                    interface = %tunnel.interface_name,
                    error = %e,
                    "Failed to delete tunnel interface, removing tunnel anyway"
                );
                Some(e.public_message())
            }
        };

        self.store.remove(&tunnel.id).await?;
        info!(id = %tunnel.id, interface = %tunnel.interface_name, "Tunnel deleted");

        Ok(DeleteOutcome {
            tunnel,
            os_command_failed: warning.is_some(),
            warning,
        })
    }

    /// Bring the link up or down.
    ///
    /// The command is issued even if the stored status already matches. On
    /// failure the stored status is left unchanged.
    pub async fn set_status(&self, id: &str, target: TargetStatus) -> Result<TunnelDescriptor> {
        let (mut tunnel, _guard) = self.lock_tunnel(id).await?;

        let plan = Plan::set_link(&tunnel.interface_name, target.link_up());
        if let Err(e) = self.run_plan(&plan).await {
            error!(
                id = %tunnel.id,
                interface = %tunnel.interface_name,
                error = %e,
                "Failed to set tunnel status"
            );
            return Err(e);
        }

        status::record_success(&mut tunnel, target.into());
        self.store.commit(&tunnel).await?;
        info!(
            id = %tunnel.id,
            interface = %tunnel.interface_name,
            status = %tunnel.status,
            "Tunnel status set"
        );
        Ok(tunnel)
    }

    /// Compare every stored tunnel against its live interface. Read-only.
    pub async fn detect_drift(&self) -> Result<Vec<DriftReport>> {
        let mut reports = Vec::new();

        for tunnel in self.store.list().await? {
            let drift = match self.inspector.inspect(&tunnel.interface_name).await {
                Ok(live) => status::compare(&tunnel, &live),
                Err(e) => vec![status::Drift::InspectFailed {
                    message: e.to_string(),
                }],
            };

            if !drift.is_empty() {
                warn!(
                    id = %tunnel.id,
                    interface = %tunnel.interface_name,
                    drift = ?drift,
                    "Tunnel drifted from live state"
                );
                reports.push(DriftReport {
                    tunnel_id: tunnel.id,
                    interface_name: tunnel.interface_name,
                    status: tunnel.status,
                    drift,
                });
            }
        }

        Ok(reports)
    }

    async fn lock(&self, names: &[&str]) -> Result<InterfaceGuard> {
        self.locks.acquire(names, self.config.lock_timeout).await
    }

    /// Look up a tunnel and lock its interface.
    async fn lock_tunnel(&self, id: &str) -> Result<(TunnelDescriptor, InterfaceGuard)> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let seen = self.store.get(id).await?;
            let guard = self.lock(&[seen.interface_name.as_str()]).await?;

            let tunnel = self.store.get(id).await?;
            if tunnel.interface_name == seen.interface_name {
                return Ok((tunnel, guard));
            }
        }

        Err(TunnelError::Busy(id.to_string()))
    }

    /// Live state of an interface, or `None` if it cannot be read.
    async fn observe(&self, interface: &str) -> Option<InterfaceState> {
        match self.inspector.inspect(interface).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(interface = %interface, error = %e, "Failed to inspect interface, planning every step");
                None
            }
        }
    }

    /// Delete an interface unless it is known to be absent.
    async fn teardown(&self, interface: &str) -> Result<()> {
        match self.inspector.inspect(interface).await {
            Ok(state) if !state.exists => {
                debug!(interface = %interface, "Interface already absent, nothing to delete");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(interface = %interface, error = %e, "Failed to inspect interface, deleting anyway");
            }
        }

        self.run_plan(&Plan::teardown(interface)).await
    }

    /// Run a plan step by step, rolling back if it fails halfway.
    ///
    /// A failing create step is rolled back only on an interface the plan
    /// owns. Cancellation is only honored between steps.
    async fn run_plan(&self, plan: &Plan) -> Result<()> {
        let mut completed = Vec::with_capacity(plan.steps.len());

        for planned in &plan.steps {
            if self.cancel.is_cancelled() {
                let compensated =
                    !completed.is_empty() && self.compensate(&plan.interface).await;
                warn!(
                    interface = %plan.interface,
                    step = %planned.step,
                    "Cancelled between plan steps"
                );
                return Err(TunnelError::Cancelled {
                    interface: plan.interface.clone(),
                    step: planned.step,
                    compensated,
                });
            }

            let argv = self.surface.render(&planned.command);
            debug!(interface = %plan.interface, step = %planned.step, command = %argv, "Running plan step");
            let output = self.executor.execute(&argv).await;

            if output.succeeded {
                completed.push(planned.step);
                continue;
            }

            let failure = CommandFailure {
                step: planned.step,
                command: argv,
                exit_code: output.exit_code,
                output: output.output.trim().to_string(),
                timed_out: output.timed_out,
            };

            // A timed-out or failed create may still have made the device.
            let may_have_created =
                planned.step == PlanStep::CreateInterface && plan.owns_interface;
            if completed.is_empty() && !may_have_created {
                return Err(TunnelError::Command(failure));
            }

            let compensated = self.compensate(&plan.interface).await;
            return Err(TunnelError::PartialFailure {
                failure,
                completed,
                compensated,
            });
        }

        Ok(())
    }

    /// Best-effort delete of a partially configured interface.
    ///
    /// A failed delete still counts as rolled back if the interface is gone.
    async fn compensate(&self, interface: &str) -> bool {
        let argv = self.surface.render(&TunnelCommand::DeleteInterface {
            interface: interface.to_string(),
        });
        let output = self.executor.execute(&argv).await;

        if output.succeeded {
            info!(interface = %interface, "Rolled back partially configured interface");
            return true;
        }

        if let Ok(state) = self.inspector.inspect(interface).await {
            if !state.exists {
                debug!(interface = %interface, "Nothing left to roll back");
                return true;
            }
        }

        warn!(
            interface = %interface,
            command = %argv,
            output = %output.output.trim(),
            "Rollback of partially configured interface failed"
        );
        false
    }

    /// Drop name claims of a tunnel that never made it into the store.
    async fn release(&self, id: &str) {
        if let Err(e) = self.store.release(id).await {
            warn!(id = %id, error = %e, "Failed to release interface name claim");
        }
    }
}
