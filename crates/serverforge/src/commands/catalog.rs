use crate::context::AppContext;
use colored::Colorize;

pub async fn regions(app: &AppContext, account: &str) -> anyhow::Result<()> {
    let account = app.account(account).await?;
    let provider = app.orchestrator.provider_for(account.id).await?;
    let regions = provider.list_regions().await?;

    println!(
        "{}",
        format!("{} regions ({})", account.vendor.display_name(), regions.len()).bold()
    );
    for region in &regions {
        println!("  {:<12} {}", region.slug.cyan(), region.name);
    }
    Ok(())
}

pub async fn sizes(app: &AppContext, account: &str) -> anyhow::Result<()> {
    let account = app.account(account).await?;
    let provider = app.orchestrator.provider_for(account.id).await?;
    let sizes = provider.list_sizes().await?;

    println!(
        "{}",
        format!("{} sizes ({})", account.vendor.display_name(), sizes.len()).bold()
    );
    for size in &sizes {
        println!("  {:<24} {}", size.slug.cyan(), size.description());
    }
    Ok(())
}
