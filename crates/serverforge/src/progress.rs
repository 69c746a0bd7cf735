//! Terminal rendering of lifecycle events

use colored::Colorize;
use serverforge_controlplane::{ConnectionStatus, ServerEvent, ServerStatus, SiteStatus};
use serverforge_provision::ProvisioningStep;
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// Print events until `stop` fires, then flush what is already queued
pub async fn follow(
    mut events: broadcast::Receiver<ServerEvent>,
    names: HashMap<Uuid, String>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => println!("{}", render(&event, &names)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = &mut stop => {
                while let Ok(event) = events.try_recv() {
                    println!("{}", render(&event, &names));
                }
                return;
            }
        }
    }
}

pub fn render(event: &ServerEvent, names: &HashMap<Uuid, String>) -> String {
    let id = event.server_id();
    let name = names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| id.to_string()[..8].to_string());

    match event {
        ServerEvent::StatusChanged {
            previous, current, ..
        } => format!(
            "{} {} → {}",
            name.cyan().bold(),
            previous.label().dimmed(),
            status_colored(*current)
        ),
        ServerEvent::StepChanged { step, .. } => {
            let steps = ProvisioningStep::displayable_steps();
            match steps.iter().position(|s| s == step) {
                Some(index) => format!(
                    "{}   [{}/{}] {}",
                    name.cyan(),
                    index + 1,
                    steps.len(),
                    step.label()
                ),
                None => format!("{}   {}", name.cyan(), step.label()),
            }
        }
        ServerEvent::ConnectionChecked { status, .. } => {
            format!("{} SSH: {}", name.cyan(), connection_colored(*status))
        }
        ServerEvent::SiteStatusChanged { domain, status, .. } => {
            format!("{} {} → {}", name.cyan(), domain.bold(), site_status_colored(*status))
        }
    }
}

pub fn status_colored(status: ServerStatus) -> colored::ColoredString {
    match status {
        ServerStatus::Active => status.label().green().bold(),
        ServerStatus::Error => status.label().red().bold(),
        ServerStatus::Deleting => status.label().yellow(),
        _ => status.label().blue(),
    }
}

pub fn site_status_colored(status: SiteStatus) -> colored::ColoredString {
    match status {
        SiteStatus::Deployed => status.label().green().bold(),
        SiteStatus::Failed => status.label().red().bold(),
        _ => status.label().blue(),
    }
}

pub fn connection_colored(status: ConnectionStatus) -> colored::ColoredString {
    match status {
        ConnectionStatus::Successful => status.label().green(),
        ConnectionStatus::Failed => status.label().red(),
        ConnectionStatus::Unknown => status.label().dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_render_status_change() {
        plain();
        let id = Uuid::new_v4();
        let names = HashMap::from([(id, "web-1".to_string())]);
        let line = render(
            &ServerEvent::StatusChanged {
                server_id: id,
                previous: ServerStatus::Creating,
                current: ServerStatus::Provisioning,
            },
            &names,
        );
        assert_eq!(
            line,
            format!(
                "web-1 {} → {}",
                ServerStatus::Creating.label(),
                ServerStatus::Provisioning.label()
            )
        );
    }

    #[test]
    fn test_render_step_with_position() {
        plain();
        let id = Uuid::new_v4();
        let line = render(
            &ServerEvent::StepChanged {
                server_id: id,
                step: ProvisioningStep::WaitingForServer,
            },
            &HashMap::new(),
        );
        assert!(line.starts_with(&id.to_string()[..8]));
        assert!(line.contains("[1/9]"));
    }

    #[test]
    fn test_render_site_status() {
        plain();
        let id = Uuid::new_v4();
        let names = HashMap::from([(id, "web-1".to_string())]);
        let line = render(
            &ServerEvent::SiteStatusChanged {
                server_id: id,
                site_id: Uuid::new_v4(),
                domain: "example.com".to_string(),
                status: SiteStatus::Deployed,
            },
            &names,
        );
        assert_eq!(line, "web-1 example.com → Deployed");
    }

    #[test]
    fn test_render_finished_step_without_position() {
        plain();
        let id = Uuid::new_v4();
        let line = render(
            &ServerEvent::StepChanged {
                server_id: id,
                step: ProvisioningStep::Finished,
            },
            &HashMap::new(),
        );
        assert!(!line.contains('['));
        assert!(line.ends_with(ProvisioningStep::Finished.label()));
    }
}
