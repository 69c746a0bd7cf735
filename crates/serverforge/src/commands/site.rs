use crate::commands::server::{confirm, field};
use crate::context::AppContext;
use crate::progress::site_status_colored;
use anyhow::{Context as _, bail};
use colored::Colorize;
use serverforge_controlplane::{DeploymentStatus, NewSite, ServerStore, SiteRecord, SiteStatus};
use serverforge_provision::{ProjectType, RepositoryProvider};
use std::collections::HashMap;
use std::path::Path;

/// Who the CLI records as having started a deployment
const TRIGGERED_BY: &str = "cli";
const SHOWN_DEPLOYMENTS: usize = 5;

pub struct CreateOptions {
    pub server: String,
    pub domain: String,
    pub aliases: Vec<String>,
    pub project_type: ProjectType,
    pub repository: Option<String>,
    pub provider: RepositoryProvider,
    pub branch: String,
    pub directory: Option<String>,
}

pub async fn create(app: AppContext, options: CreateOptions) -> anyhow::Result<()> {
    let server = app.server(&options.server).await?;
    println!(
        "{}",
        format!(
            "Creating {} ({}) on {}...",
            options.domain,
            options.project_type.label(),
            server.name
        )
        .blue()
    );

    let site = app
        .orchestrator
        .create_site(NewSite {
            server_id: server.id,
            domain: options.domain,
            aliases: options.aliases,
            directory: options.directory,
            repository: options.repository,
            repository_provider: options.provider,
            branch: options.branch,
            project_type: options.project_type,
            php_version: None,
            deploy_script: None,
        })
        .await?;

    let store = app.store.clone();
    let names = HashMap::from([(server.id, server.name.clone())]);
    app.run_until_idle(names).await;

    let site = store
        .get_site(site.id)
        .await?
        .with_context(|| format!("Site '{}' disappeared", site.domain))?;
    match site.status {
        SiteStatus::Deployed => {
            println!("{} {} is live", "✓".green().bold(), site.domain.cyan().bold());
            Ok(())
        }
        status => bail!("{} ended up {}", site.domain, status.label()),
    }
}

pub async fn list(app: &AppContext, server: &str) -> anyhow::Result<()> {
    let server = app.server(server).await?;
    let sites = app.store.list_sites(server.id).await?;
    if sites.is_empty() {
        println!(
            "{}",
            format!("No sites on {}. Add one with `serverforge site create`", server.name).dimmed()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<32} {:<12} {:<12} {:<30} {}", "DOMAIN", "STATUS", "TYPE", "REPOSITORY", "BRANCH")
            .bold()
    );
    println!("{}", "─".repeat(100).dimmed());
    for site in &sites {
        println!(
            "{:<32} {:<12} {:<12} {:<30} {}",
            site.domain.cyan(),
            site_status_colored(site.status),
            site.project_type.label(),
            site.repository.as_deref().unwrap_or("-"),
            site.branch
        );
    }
    Ok(())
}

pub async fn show(app: &AppContext, key: &str, server: Option<&str>) -> anyhow::Result<()> {
    let site = app.site(key, server).await?;

    println!("{}", site.domain.cyan().bold());
    field("id", site.id.to_string());
    field("status", site_status_colored(site.status).to_string());
    if !site.aliases.is_empty() {
        field("aliases", site.aliases.join(", "));
    }
    field("type", site.project_type.label().to_string());
    field("php", site.php_version.to_string());
    field("directory", site.directory.clone());
    if let Some(repository) = &site.repository {
        field(
            "repository",
            format!(
                "{} ({})",
                site.repository_provider.web_url(repository),
                site.branch
            ),
        );
    }

    let environment = app.store.environment(site.id).await?;
    if !environment.is_empty() {
        let keys: Vec<&str> = environment.iter().map(|v| v.key.as_str()).collect();
        field("env", keys.join(", "));
    }

    let deployments = app.store.deployments(site.id).await?;
    if !deployments.is_empty() {
        println!();
        println!("{}", "Recent deployments".bold());
        for deployment in deployments.iter().take(SHOWN_DEPLOYMENTS) {
            let status = match deployment.status {
                DeploymentStatus::Finished => deployment.status.label().green(),
                DeploymentStatus::Failed => deployment.status.label().red(),
                _ => deployment.status.label().blue(),
            };
            println!(
                "  {} {:<10} {:<10} {}",
                deployment.created_at.format("%Y-%m-%d %H:%M"),
                status,
                deployment
                    .commit_hash
                    .as_deref()
                    .map(|hash| &hash[..hash.len().min(8)])
                    .unwrap_or("-"),
                deployment
                    .duration_seconds
                    .map(|s| format!("{}s", s))
                    .unwrap_or_default()
                    .dimmed()
            );
        }
    }
    Ok(())
}

pub async fn delete(app: AppContext, key: &str, server: Option<&str>, yes: bool) -> anyhow::Result<()> {
    let site = app.site(key, server).await?;
    if !yes && !confirm(&format!("Delete {} and its files?", site.domain))? {
        println!("{}", "Aborted".dimmed());
        return Ok(());
    }

    app.orchestrator.request_site_delete(site.id).await?;
    let store = app.store.clone();
    let names = server_names(&app, &site).await?;
    app.run_until_idle(names).await;

    if store.get_site(site.id).await?.is_some() {
        bail!("{} could not be removed; run delete again to retry", site.domain);
    }
    println!("{} {} deleted", "✓".green(), site.domain.cyan());
    Ok(())
}

pub async fn env(app: AppContext, key: &str, server: Option<&str>, file: &Path) -> anyhow::Result<()> {
    let site = app.site(key, server).await?;
    let variables = read_env_file(file)?;
    let count = variables.len();
    app.orchestrator.set_environment(site.id, variables).await?;

    let names = server_names(&app, &site).await?;
    if app.run_until_idle(names).await > 0 {
        bail!("Environment of {} was saved but not written to the server", site.domain);
    }
    println!("{} {} variables set on {}", "✓".green(), count, site.domain.cyan());
    Ok(())
}

pub async fn deploy(app: AppContext, key: &str, server: Option<&str>) -> anyhow::Result<()> {
    let site = app.site(key, server).await?;
    let deployment = app.orchestrator.request_deploy(site.id, TRIGGERED_BY).await?;
    println!("Deploying {} ({})...", site.domain.cyan(), site.branch);

    let store = app.store.clone();
    let names = server_names(&app, &site).await?;
    app.run_until_idle(names).await;

    let deployment = store
        .get_deployment(deployment.id)
        .await?
        .with_context(|| format!("Deployment of '{}' disappeared", site.domain))?;
    if deployment.status != DeploymentStatus::Finished {
        for line in deployment.output.iter().rev().take(20).rev() {
            println!("  {}", line.dimmed());
        }
        bail!("Deployment of {} {}", site.domain, deployment.status.label().to_lowercase());
    }
    println!(
        "{} {} deployed{}",
        "✓".green(),
        site.domain.cyan(),
        deployment
            .commit_hash
            .map(|hash| format!(" at {}", &hash[..hash.len().min(8)]))
            .unwrap_or_default()
    );
    Ok(())
}

async fn server_names(app: &AppContext, site: &SiteRecord) -> anyhow::Result<HashMap<uuid::Uuid, String>> {
    let server = app.server(&site.server_id.to_string()).await?;
    Ok(HashMap::from([(server.id, server.name)]))
}

/// Parse `KEY=value` lines; blank lines and `#` comments are skipped and
/// matching outer quotes are removed
fn read_env_file(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut variables = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            bail!("{}:{}: expected KEY=value", path.display(), number + 1);
        };
        variables.push((key.trim().to_string(), unquote(value.trim())));
    }
    Ok(variables)
}

fn unquote(value: &str) -> String {
    let quoted = |q: char| value.len() >= 2 && value.starts_with(q) && value.ends_with(q);
    if quoted('"') {
        let mut unescaped = String::with_capacity(value.len());
        let mut chars = value[1..value.len() - 1].chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => unescaped.extend(chars.next()),
                c => unescaped.push(c),
            }
        }
        unescaped
    } else if quoted('\'') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}
