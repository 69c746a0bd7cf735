//! Provisioning progress steps

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered progress of one provisioning run.
///
/// The numeric codes are part of the marker protocol (`###STEP:<code>###`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    #[default]
    Pending,
    WaitingForServer,
    PreparingServer,
    ConfiguringSwap,
    InstallingBaseDependencies,
    InstallingRuntime,
    InstallingWebServer,
    InstallingDatabase,
    InstallingCache,
    MakingFinalTouches,
    Finished,
}

impl ProvisioningStep {
    pub const ALL: [ProvisioningStep; 11] = [
        ProvisioningStep::Pending,
        ProvisioningStep::WaitingForServer,
        ProvisioningStep::PreparingServer,
        ProvisioningStep::ConfiguringSwap,
        ProvisioningStep::InstallingBaseDependencies,
        ProvisioningStep::InstallingRuntime,
        ProvisioningStep::InstallingWebServer,
        ProvisioningStep::InstallingDatabase,
        ProvisioningStep::InstallingCache,
        ProvisioningStep::MakingFinalTouches,
        ProvisioningStep::Finished,
    ];

    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProvisioningStep::Pending => "Pending",
            ProvisioningStep::WaitingForServer => "Waiting on your server to become ready",
            ProvisioningStep::PreparingServer => "Preparing your server",
            ProvisioningStep::ConfiguringSwap => "Configuring swap",
            ProvisioningStep::InstallingBaseDependencies => "Installing base dependencies",
            ProvisioningStep::InstallingRuntime => "Installing PHP",
            ProvisioningStep::InstallingWebServer => "Installing Nginx",
            ProvisioningStep::InstallingDatabase => "Installing database",
            ProvisioningStep::InstallingCache => "Installing Redis",
            ProvisioningStep::MakingFinalTouches => "Making final touches",
            ProvisioningStep::Finished => "Provisioning complete",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProvisioningStep::Pending => "Waiting to start provisioning.",
            ProvisioningStep::WaitingForServer => {
                "Waiting to hear from your server to confirm the provisioning process has started."
            }
            ProvisioningStep::PreparingServer => {
                "Creating the server user and configuring SSH access."
            }
            ProvisioningStep::ConfiguringSwap => {
                "Setting up swap space for better memory management."
            }
            ProvisioningStep::InstallingBaseDependencies => {
                "Installing the base packages and applying the latest Ubuntu updates."
            }
            ProvisioningStep::InstallingRuntime => {
                "Installing PHP with the extensions common web applications need."
            }
            ProvisioningStep::InstallingWebServer => "Installing and enabling Nginx.",
            ProvisioningStep::InstallingDatabase => {
                "Installing and configuring your selected database server."
            }
            ProvisioningStep::InstallingCache => "Installing Redis for caching and queues.",
            ProvisioningStep::MakingFinalTouches => {
                "Installing Composer, Node.js, Supervisor and Git, and configuring the firewall."
            }
            ProvisioningStep::Finished => "Your server has been provisioned and is ready to use.",
        }
    }

    /// Steps shown as a progress list
    pub fn displayable_steps() -> &'static [ProvisioningStep] {
        &Self::ALL[1..10]
    }

    pub fn is_completed(&self, current: ProvisioningStep) -> bool {
        *self < current
    }

    pub fn is_current(&self, current: ProvisioningStep) -> bool {
        *self == current
    }

    pub fn is_pending(&self, current: ProvisioningStep) -> bool {
        *self > current
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for (index, step) in ProvisioningStep::ALL.iter().enumerate() {
            assert_eq!(step.code(), index as u32);
            assert_eq!(ProvisioningStep::from_code(index as u32), Some(*step));
        }
        assert_eq!(ProvisioningStep::from_code(11), None);
    }

    #[test]
    fn test_ordering() {
        assert!(ProvisioningStep::Pending < ProvisioningStep::WaitingForServer);
        assert!(ProvisioningStep::MakingFinalTouches < ProvisioningStep::Finished);
    }

    #[test]
    fn test_displayable_steps() {
        let steps = ProvisioningStep::displayable_steps();
        assert_eq!(steps.first(), Some(&ProvisioningStep::WaitingForServer));
        assert_eq!(steps.last(), Some(&ProvisioningStep::MakingFinalTouches));
        assert_eq!(steps.len(), 9);
    }

    #[test]
    fn test_relative_state() {
        let current = ProvisioningStep::InstallingDatabase;
        assert!(ProvisioningStep::InstallingRuntime.is_completed(current));
        assert!(ProvisioningStep::InstallingDatabase.is_current(current));
        assert!(ProvisioningStep::InstallingCache.is_pending(current));
    }
}
