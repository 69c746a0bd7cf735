use crate::context::{AppContext, OWNER};
use crate::progress::{connection_colored, status_colored};
use anyhow::{Context as _, bail};
use colored::Colorize;
use serverforge_controlplane::{NewServer, ServerRecord, ServerStatus, ServerStore};
use serverforge_provision::{DatabaseKind, PhpVersion, ProvisioningStep, ServiceKind, StackSelection};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

pub struct CreateOptions {
    pub name: String,
    pub account: String,
    pub size: String,
    pub region: String,
    pub php: PhpVersion,
    pub database: DatabaseKind,
    pub ssh_port: Option<u16>,
}

pub async fn create(app: AppContext, options: CreateOptions) -> anyhow::Result<()> {
    let account = app.account(&options.account).await?;
    println!(
        "{}",
        format!(
            "Creating {} on {} ({}, {})...",
            options.name,
            account.vendor.display_name(),
            options.region,
            options.size
        )
        .blue()
    );

    let server = app
        .orchestrator
        .create_server(NewServer {
            owner_id: OWNER,
            account_id: account.id,
            name: options.name,
            size: options.size,
            region: options.region,
            stack: StackSelection {
                php_version: options.php,
                database: options.database,
            },
            ssh_port: options.ssh_port,
        })
        .await?;
    println!("  {} {}", "id:".dimmed(), server.id);

    let store = app.store.clone();
    let names = HashMap::from([(server.id, server.name.clone())]);
    app.run_until_idle(names).await;

    let server = store
        .get_server(server.id)
        .await?
        .with_context(|| format!("Server '{}' disappeared", server.name))?;

    println!();
    match server.status {
        ServerStatus::Active => {
            println!("{} {} is ready", "✓".green().bold(), server.name.cyan().bold());
            if let Some(ip) = &server.ip_address {
                println!(
                    "  ssh -p {} {}@{}",
                    server.ssh_port, server.server_user, ip
                );
            }
            Ok(())
        }
        status => bail!(
            "{} stopped at '{}' with status {}",
            server.name,
            server.provisioning_step.label(),
            status.label()
        ),
    }
}

pub async fn list(app: &AppContext) -> anyhow::Result<()> {
    let mut servers = app.store.list_servers().await?;
    if servers.is_empty() {
        println!("{}", "No servers yet. Create one with `serverforge server create`".dimmed());
        return Ok(());
    }
    servers.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!(
        "{}",
        format!(
            "{:<20} {:<14} {:<14} {:<10} {:<16} {}",
            "NAME", "STATUS", "VENDOR", "REGION", "IP", "CREATED"
        )
        .bold()
    );
    println!("{}", "─".repeat(100).dimmed());
    for server in &servers {
        println!(
            "{:<20} {:<14} {:<14} {:<10} {:<16} {}",
            server.name.cyan(),
            status_colored(server.status),
            server.vendor.display_name(),
            server.region,
            server.ip_address.as_deref().unwrap_or("-"),
            server.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn show(app: &AppContext, key: &str) -> anyhow::Result<()> {
    let server = app.server(key).await?;

    println!("{}", server.name.cyan().bold());
    field("id", server.id.to_string());
    field("status", status_colored(server.status).to_string());
    field("vendor", server.vendor.display_name().to_string());
    field("region", server.region.clone());
    field("size", server.size.clone());
    field(
        "stack",
        format!(
            "PHP {}, {}",
            server.stack.php_version,
            server.stack.database.label()
        ),
    );
    field("ip", server.ip_address.clone().unwrap_or_else(|| "-".to_string()));
    if let Some(private) = &server.private_ip_address {
        field("private ip", private.clone());
    }
    field("ssh", format!("{} (port {})", server.server_user, server.ssh_port));
    field("connection", connection_colored(server.connection_status).to_string());
    if let Some(os) = &server.os_version {
        field("os", format!("Ubuntu {}", os));
    }
    if !server.extension.services.is_empty() {
        let services: Vec<&str> = server.extension.services.iter().map(|s| s.label()).collect();
        field("services", services.join(", "));
    }
    field("created", server.created_at.to_rfc3339());
    if let Some(at) = server.provisioned_at {
        field("provisioned", at.to_rfc3339());
    }

    if server.status != ServerStatus::Active {
        println!();
        print_steps(&server);
    }
    Ok(())
}

pub async fn delete(app: AppContext, key: &str, yes: bool) -> anyhow::Result<()> {
    let server = app.server(key).await?;
    if !yes && !confirm(&format!("Delete {} and its provider resources?", server.name))? {
        println!("{}", "Aborted".dimmed());
        return Ok(());
    }

    app.orchestrator.request_delete(server.id).await?;
    let store = app.store.clone();
    let names = HashMap::from([(server.id, server.name.clone())]);
    app.run_until_idle(names).await;

    if store.get_server(server.id).await?.is_some() {
        bail!("{} could not be removed; run delete again to retry", server.name);
    }
    println!("{} {} deleted", "✓".green(), server.name.cyan());
    Ok(())
}

pub async fn restart(app: AppContext, key: &str, service: ServiceKind) -> anyhow::Result<()> {
    let server = app.server(key).await?;
    app.orchestrator.request_restart(server.id, service).await?;
    println!("Restarting {} on {}...", service.label(), server.name.cyan());

    finish(app, &server, &format!("{} restarted", service.label())).await
}

pub async fn test_connection(app: &AppContext, key: &str) -> anyhow::Result<()> {
    let server = app.server(key).await?;
    let status = app.orchestrator.test_connection(server.id).await?;
    println!(
        "{} as {}: {}",
        server.name.cyan(),
        server.server_user,
        connection_colored(status)
    );
    Ok(())
}

pub async fn authorize_key(app: AppContext, key: &str, key_file: &Path) -> anyhow::Result<()> {
    let server = app.server(key).await?;
    let public_key = read_key_file(key_file)?;
    app.orchestrator
        .request_authorize_key(server.id, &public_key)
        .await?;

    finish(app, &server, "Key authorized").await
}

pub async fn revoke_key(app: AppContext, key: &str, key_file: &Path) -> anyhow::Result<()> {
    let server = app.server(key).await?;
    let public_key = read_key_file(key_file)?;
    app.orchestrator
        .request_revoke_key(server.id, &public_key)
        .await?;

    finish(app, &server, "Key revoked").await
}

async fn finish(app: AppContext, server: &ServerRecord, done: &str) -> anyhow::Result<()> {
    let names = HashMap::from([(server.id, server.name.clone())]);
    if app.run_until_idle(names).await > 0 {
        bail!("Operation on {} failed; see the log above", server.name);
    }
    println!("{} {} on {}", "✓".green(), done, server.name.cyan());
    Ok(())
}

fn print_steps(server: &ServerRecord) {
    let current = server.provisioning_step;
    for step in ProvisioningStep::displayable_steps() {
        let line = if step.is_completed(current) {
            format!("  {} {}", "✓".green(), step.label().dimmed())
        } else if step.is_current(current) {
            let marker = if server.status == ServerStatus::Error {
                "✗".red()
            } else {
                "▸".yellow()
            };
            format!("  {} {}  {}", marker, step.label().bold(), step.description().dimmed())
        } else {
            format!("  {} {}", "·".dimmed(), step.label().dimmed())
        };
        println!("{}", line);
    }
}

pub(crate) fn field(name: &str, value: String) {
    println!("  {:<12} {}", format!("{}:", name).dimmed(), value);
}

fn read_key_file(path: &Path) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .with_context(|| format!("{} holds no public key", path.display()))?;
    Ok(line.to_string())
}

pub(crate) fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} [y/N]: ", prompt);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
