mod commands;
mod context;
mod progress;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serverforge_cloud::Vendor;
use serverforge_provision::{DatabaseKind, PhpVersion, ProjectType, RepositoryProvider, ServiceKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "serverforge")]
#[command(about = "Provision PHP-ready servers on your cloud accounts", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage provider accounts
    #[command(subcommand)]
    Account(AccountCommands),
    /// Browse a vendor's regions and sizes
    #[command(subcommand)]
    Catalog(CatalogCommands),
    /// Create, inspect and operate servers
    #[command(subcommand)]
    Server(ServerCommands),
    /// Host, deploy and configure sites on active servers
    #[command(subcommand)]
    Site(SiteCommands),
    /// Generate an OpenSSH keypair
    Keygen {
        /// RSA-4096 instead of Ed25519
        #[arg(long)]
        rsa: bool,
        /// Key comment
        #[arg(short, long, default_value = "serverforge")]
        comment: String,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Validate a token and store the account
    Add {
        /// digitalocean, hetzner or vultr
        vendor: Vendor,
        /// Display name
        name: String,
        /// API token
        #[arg(long, env = "SERVERFORGE_API_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// List stored accounts
    List,
    /// Re-check an account's token
    Validate {
        /// Account id or name
        account: String,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Regions, sorted by slug
    Regions {
        /// Account id or name
        account: String,
    },
    /// Sizes, cheapest first
    Sizes {
        /// Account id or name
        account: String,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Create a server and provision it
    Create {
        /// Server name (lowercase letters, digits, '-')
        name: String,
        /// Account id or name
        #[arg(short, long)]
        account: String,
        /// Size slug
        #[arg(short, long)]
        size: String,
        /// Region slug
        #[arg(short, long)]
        region: String,
        /// PHP version (8.1 - 8.4)
        #[arg(long, default_value = "8.3")]
        php: PhpVersion,
        /// mysql, postgresql, mariadb or none
        #[arg(long, default_value = "mysql")]
        database: DatabaseKind,
        /// SSH port
        #[arg(long)]
        ssh_port: Option<u16>,
    },
    /// List servers
    List,
    /// Show one server
    Show {
        /// Server id or name
        server: String,
    },
    /// Delete a server and its provider resources
    Delete {
        /// Server id or name
        server: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Restart a service on an active server
    Restart {
        /// Server id or name
        server: String,
        /// nginx, php, mysql, postgresql, mariadb, redis or supervisor
        service: ServiceKind,
    },
    /// Check SSH access as the operational user
    TestConnection {
        /// Server id or name
        server: String,
    },
    /// Add a public key to the operational user's authorized_keys
    AuthorizeKey {
        /// Server id or name
        server: String,
        /// Public key file (e.g. ~/.ssh/id_ed25519.pub)
        key_file: std::path::PathBuf,
    },
    /// Remove a public key from the operational user's authorized_keys
    RevokeKey {
        /// Server id or name
        server: String,
        /// Public key file
        key_file: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    /// Add an nginx site, clone its repository and enable it
    Create {
        /// Server id or name
        server: String,
        /// Primary domain
        domain: String,
        /// Extra server names
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// laravel, php, html, symfony or wordpress
        #[arg(short = 't', long = "type", default_value = "laravel")]
        project_type: ProjectType,
        /// owner/name, or a clone URL with --provider custom
        #[arg(short, long)]
        repository: Option<String>,
        /// github, gitlab, bitbucket or custom
        #[arg(long, default_value = "github")]
        provider: RepositoryProvider,
        #[arg(short, long, default_value = "main")]
        branch: String,
        /// Public directory relative to the site root (default depends on the type)
        #[arg(long)]
        directory: Option<String>,
    },
    /// List the sites on a server
    List {
        /// Server id or name
        server: String,
    },
    /// Show one site with its recent deployments
    Show {
        /// Site id or domain
        site: String,
        /// Server id or name, when the domain is on several servers
        #[arg(long)]
        server: Option<String>,
    },
    /// Remove a site's nginx config and files
    Delete {
        /// Site id or domain
        site: String,
        #[arg(long)]
        server: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Replace the site's .env from a local file
    Env {
        /// Site id or domain
        site: String,
        /// KEY=value file
        file: std::path::PathBuf,
        #[arg(long)]
        server: Option<String>,
    },
    /// Run the site's deploy script
    Deploy {
        /// Site id or domain
        site: String,
        #[arg(long)]
        server: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // keygen needs neither settings nor state
    if let Commands::Keygen { rsa, comment } = &cli.command {
        return commands::keygen::handle(*rsa, comment);
    }

    let settings = serverforge_config::load_settings().context("Failed to load settings")?;
    let app = context::AppContext::open(&settings).await?;

    match cli.command {
        Commands::Account(cmd) => match cmd {
            AccountCommands::Add {
                vendor,
                name,
                token,
            } => commands::account::add(&app, vendor, &name, &token).await,
            AccountCommands::List => commands::account::list(&app).await,
            AccountCommands::Validate { account } => {
                commands::account::validate(app, &account).await
            }
        },
        Commands::Catalog(cmd) => match cmd {
            CatalogCommands::Regions { account } => {
                commands::catalog::regions(&app, &account).await
            }
            CatalogCommands::Sizes { account } => commands::catalog::sizes(&app, &account).await,
        },
        Commands::Server(cmd) => match cmd {
            ServerCommands::Create {
                name,
                account,
                size,
                region,
                php,
                database,
                ssh_port,
            } => {
                let options = commands::server::CreateOptions {
                    name,
                    account,
                    size,
                    region,
                    php,
                    database,
                    ssh_port,
                };
                commands::server::create(app, options).await
            }
            ServerCommands::List => commands::server::list(&app).await,
            ServerCommands::Show { server } => commands::server::show(&app, &server).await,
            ServerCommands::Delete { server, yes } => {
                commands::server::delete(app, &server, yes).await
            }
            ServerCommands::Restart { server, service } => {
                commands::server::restart(app, &server, service).await
            }
            ServerCommands::TestConnection { server } => {
                commands::server::test_connection(&app, &server).await
            }
            ServerCommands::AuthorizeKey { server, key_file } => {
                commands::server::authorize_key(app, &server, &key_file).await
            }
            ServerCommands::RevokeKey { server, key_file } => {
                commands::server::revoke_key(app, &server, &key_file).await
            }
        },
        Commands::Site(cmd) => match cmd {
            SiteCommands::Create {
                server,
                domain,
                aliases,
                project_type,
                repository,
                provider,
                branch,
                directory,
            } => {
                let options = commands::site::CreateOptions {
                    server,
                    domain,
                    aliases,
                    project_type,
                    repository,
                    provider,
                    branch,
                    directory,
                };
                commands::site::create(app, options).await
            }
            SiteCommands::List { server } => commands::site::list(&app, &server).await,
            SiteCommands::Show { site, server } => {
                commands::site::show(&app, &site, server.as_deref()).await
            }
            SiteCommands::Delete { site, server, yes } => {
                commands::site::delete(app, &site, server.as_deref(), yes).await
            }
            SiteCommands::Env { site, file, server } => {
                commands::site::env(app, &site, server.as_deref(), &file).await
            }
            SiteCommands::Deploy { site, server } => {
                commands::site::deploy(app, &site, server.as_deref()).await
            }
        },
        Commands::Keygen { .. } => Ok(()),
    }
}
