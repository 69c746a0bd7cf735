//! Server lifecycle state machine
//!
//! ```text
//! Pending ──▶ Creating ──▶ Provisioning ──▶ Active
//!    │            │              │
//!    └────────────┴──────────────┴────▶ Error
//!
//! any state except Deleting ──▶ Deleting ──(local removal failed)──▶ Error
//! ```
//!
//! [`transition`] is pure: it never touches storage. The orchestrator
//! persists the new state and carries out the returned effects.

use crate::model::ServerStatus;
use serverforge_provision::ProvisioningStep;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub status: ServerStatus,
    pub step: ProvisioningStep,
}

impl LifecycleState {
    pub fn new(status: ServerStatus, step: ProvisioningStep) -> Self {
        Self { status, step }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The create-at-provider job picked the server up
    StartCreating,
    /// The vendor reports the instance active with a public IP
    InstanceReachable,
    /// A provisioning run begins (or begins again)
    ProvisioningStarted,
    /// The script announced it is entering a step
    StepReached(ProvisioningStep),
    Completed,
    Failed,
    DeleteRequested,
    /// Local removal failed during teardown
    DeletionFailed,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::StartCreating => "start_creating",
            LifecycleEvent::InstanceReachable => "instance_reachable",
            LifecycleEvent::ProvisioningStarted => "provisioning_started",
            LifecycleEvent::StepReached(_) => "step_reached",
            LifecycleEvent::Completed => "completed",
            LifecycleEvent::Failed => "failed",
            LifecycleEvent::DeleteRequested => "delete_requested",
            LifecycleEvent::DeletionFailed => "deletion_failed",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StatusChanged {
        previous: ServerStatus,
        current: ServerStatus,
    },
    StepChanged(ProvisioningStep),
    EnqueueInstallStack,
    EnqueueDelete,
    StampProvisioned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: LifecycleState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: LifecycleState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {event} to a server in status {status}")]
pub struct InvalidTransition {
    pub status: ServerStatus,
    pub event: &'static str,
}

/// Apply `event` to `state`
pub fn transition(
    state: LifecycleState,
    event: LifecycleEvent,
) -> Result<Transition, InvalidTransition> {
    use LifecycleEvent as E;
    use ServerStatus as S;

    let invalid = || InvalidTransition {
        status: state.status,
        event: event.name(),
    };

    let next = match (state.status, event) {
        (S::Pending, E::StartCreating) => move_to(state, S::Creating, state.step, &[]),
        (S::Creating, E::InstanceReachable) => move_to(
            state,
            S::Provisioning,
            ProvisioningStep::Pending,
            &[Effect::EnqueueInstallStack],
        ),
        (S::Provisioning, E::ProvisioningStarted) => {
            move_to(state, S::Provisioning, ProvisioningStep::WaitingForServer, &[])
        }
        (S::Provisioning, E::StepReached(step)) => {
            if step <= state.step {
                Transition::unchanged(state)
            } else {
                move_to(state, S::Provisioning, step, &[])
            }
        }
        (S::Provisioning, E::Completed) => move_to(
            state,
            S::Active,
            ProvisioningStep::Finished,
            &[Effect::StampProvisioned],
        ),
        (S::Pending | S::Creating | S::Provisioning, E::Failed) => {
            move_to(state, S::Error, state.step, &[])
        }
        (S::Deleting, E::DeleteRequested) => return Err(invalid()),
        (_, E::DeleteRequested) => {
            move_to(state, S::Deleting, state.step, &[Effect::EnqueueDelete])
        }
        (S::Deleting, E::DeletionFailed) => move_to(state, S::Error, state.step, &[]),
        _ => return Err(invalid()),
    };

    Ok(next)
}

fn move_to(
    from: LifecycleState,
    status: ServerStatus,
    step: ProvisioningStep,
    extra: &[Effect],
) -> Transition {
    let mut effects = Vec::new();
    if status != from.status {
        effects.push(Effect::StatusChanged {
            previous: from.status,
            current: status,
        });
    }
    if step != from.step {
        effects.push(Effect::StepChanged(step));
    }
    effects.extend_from_slice(extra);

    Transition {
        state: LifecycleState::new(status, step),
        effects,
    }
}
