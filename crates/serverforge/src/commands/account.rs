use crate::context::{AppContext, OWNER};
use colored::Colorize;
use serverforge_cloud::Vendor;
use serverforge_controlplane::{ProviderAccount, ServerStore};
use std::collections::HashMap;

pub async fn add(app: &AppContext, vendor: Vendor, name: &str, token: &str) -> anyhow::Result<()> {
    println!("{}", format!("Validating {} token...", vendor.display_name()).blue());
    let account = app.orchestrator.add_account(OWNER, vendor, name, token).await?;

    println!(
        "{} Account {} added ({})",
        "✓".green(),
        account.name.cyan().bold(),
        account.id.to_string().dimmed()
    );
    Ok(())
}

pub async fn list(app: &AppContext) -> anyhow::Result<()> {
    let accounts = app.store.list_accounts().await?;
    if accounts.is_empty() {
        println!("{}", "No accounts yet. Add one with `serverforge account add`".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<20} {:<14} {:<10} {:<22} {}", "NAME", "VENDOR", "TOKEN", "CHECKED", "ID").bold()
    );
    println!("{}", "─".repeat(105).dimmed());
    for account in &accounts {
        println!(
            "{:<20} {:<14} {:<10} {:<22} {}",
            account.name.cyan(),
            account.vendor.display_name(),
            validity(account),
            account
                .validated_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string()),
            account.id.to_string().dimmed()
        );
    }
    Ok(())
}

pub async fn validate(app: AppContext, key: &str) -> anyhow::Result<()> {
    let account = app.account(key).await?;
    app.orchestrator.request_account_validation(account.id).await?;

    let store = app.store.clone();
    if app.run_until_idle(HashMap::new()).await > 0 {
        anyhow::bail!("Validation of '{}' did not complete; see the log above", key);
    }

    let account = store
        .get_account(account.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Account '{}' disappeared", key))?;
    if account.is_valid {
        println!("{} {} token is valid", "✓".green(), account.name.cyan());
        Ok(())
    } else {
        anyhow::bail!(
            "{} rejected the token for '{}'",
            account.vendor.display_name(),
            account.name
        )
    }
}

fn validity(account: &ProviderAccount) -> colored::ColoredString {
    if account.is_valid {
        "valid".green()
    } else {
        "invalid".red()
    }
}
