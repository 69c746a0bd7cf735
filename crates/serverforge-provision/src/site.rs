//! Site hosting on a provisioned server
//!
//! A site is one nginx virtual host under the operational user's home
//! directory. This module renders what gets written to the server: the vhost,
//! the deploy script and the `.env` file. Every value is checked before it
//! reaches a template or a shell command.

use crate::error::{Result, ScriptError};
use crate::stack::PhpVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tera::{Context, Tera};
use tracing::debug;

const NGINX_TEMPLATE_NAME: &str = "nginx-site.conf";
const NGINX_TEMPLATE: &str = include_str!("../templates/nginx-site.conf");
const DEPLOY_TEMPLATE_NAME: &str = "deploy.sh";
const DEPLOY_TEMPLATE: &str = include_str!("../templates/deploy.sh");

/// Page served until the first deployment replaces it
pub const PLACEHOLDER_PHP: &str = "<?php\necho '<h1>Site coming soon!</h1>';\necho '<p>This site is hosted by ServerForge.</p>';\n";
pub const PLACEHOLDER_HTML: &str = "<h1>Site coming soon!</h1>\n<p>This site is hosted by ServerForge.</p>\n";

const MAX_DOMAIN_LENGTH: usize = 255;
const MAX_ENV_VALUE_LENGTH: usize = 65535;

/// Application framework a site runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    #[default]
    Laravel,
    #[serde(rename = "php")]
    PhpGeneric,
    #[serde(rename = "html")]
    StaticHtml,
    Symfony,
    WordPress,
}

impl ProjectType {
    pub const ALL: [ProjectType; 5] = [
        ProjectType::Laravel,
        ProjectType::PhpGeneric,
        ProjectType::StaticHtml,
        ProjectType::Symfony,
        ProjectType::WordPress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Laravel => "laravel",
            ProjectType::PhpGeneric => "php",
            ProjectType::StaticHtml => "html",
            ProjectType::Symfony => "symfony",
            ProjectType::WordPress => "wordpress",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProjectType::Laravel => "Laravel",
            ProjectType::PhpGeneric => "PHP",
            ProjectType::StaticHtml => "Static HTML",
            ProjectType::Symfony => "Symfony",
            ProjectType::WordPress => "WordPress",
        }
    }

    /// Whether nginx hands requests to PHP-FPM
    pub fn uses_php(&self) -> bool {
        !matches!(self, ProjectType::StaticHtml)
    }

    /// Public directory relative to the site root
    pub fn default_directory(&self) -> &'static str {
        match self {
            ProjectType::Laravel | ProjectType::Symfony => "/public",
            ProjectType::PhpGeneric | ProjectType::StaticHtml | ProjectType::WordPress => "/",
        }
    }

    /// Deploy script body a new site starts with.
    ///
    /// Runs with `SITE_ROOT`, `BRANCH`, `PHP`, `PHP_FPM` and `COMPOSER` set.
    pub fn default_deploy_script(&self) -> &'static str {
        match self {
            ProjectType::Laravel => LARAVEL_DEPLOY,
            ProjectType::Symfony => SYMFONY_DEPLOY,
            ProjectType::PhpGeneric => PHP_DEPLOY,
            ProjectType::StaticHtml => HTML_DEPLOY,
            ProjectType::WordPress => WORDPRESS_DEPLOY,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = ScriptError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        ProjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(ScriptError::Unknown {
                kind: "project type",
                value: s,
            })
    }
}

const LARAVEL_DEPLOY: &str = "cd $SITE_ROOT

git pull origin $BRANCH

$COMPOSER install --no-dev --no-interaction --prefer-dist --optimize-autoloader

( flock -w 10 9 || exit 1
    echo 'Restarting FPM...'; sudo -S service $PHP_FPM reload ) 9>/tmp/fpmlock

if [ -f artisan ]; then
    $PHP artisan migrate --force
    $PHP artisan config:cache
    $PHP artisan route:cache
    $PHP artisan view:cache
    $PHP artisan event:cache
fi
";

const SYMFONY_DEPLOY: &str = "cd $SITE_ROOT

git pull origin $BRANCH

$COMPOSER install --no-dev --no-interaction --prefer-dist --optimize-autoloader

$PHP bin/console cache:clear --env=prod
$PHP bin/console cache:warmup --env=prod

( flock -w 10 9 || exit 1
    echo 'Restarting FPM...'; sudo -S service $PHP_FPM reload ) 9>/tmp/fpmlock
";

const PHP_DEPLOY: &str = "cd $SITE_ROOT

git pull origin $BRANCH

$COMPOSER install --no-dev --no-interaction --prefer-dist --optimize-autoloader

( flock -w 10 9 || exit 1
    echo 'Restarting FPM...'; sudo -S service $PHP_FPM reload ) 9>/tmp/fpmlock
";

const HTML_DEPLOY: &str = "cd $SITE_ROOT

git pull origin $BRANCH
";

const WORDPRESS_DEPLOY: &str = "cd $SITE_ROOT

git pull origin $BRANCH

( flock -w 10 9 || exit 1
    echo 'Restarting FPM...'; sudo -S service $PHP_FPM reload ) 9>/tmp/fpmlock
";

/// Where a site's code is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryProvider {
    #[default]
    Github,
    Gitlab,
    Bitbucket,
    Custom,
}

impl RepositoryProvider {
    pub const ALL: [RepositoryProvider; 4] = [
        RepositoryProvider::Github,
        RepositoryProvider::Gitlab,
        RepositoryProvider::Bitbucket,
        RepositoryProvider::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryProvider::Github => "github",
            RepositoryProvider::Gitlab => "gitlab",
            RepositoryProvider::Bitbucket => "bitbucket",
            RepositoryProvider::Custom => "custom",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RepositoryProvider::Github => "GitHub",
            RepositoryProvider::Gitlab => "GitLab",
            RepositoryProvider::Bitbucket => "Bitbucket",
            RepositoryProvider::Custom => "Custom Git",
        }
    }

    fn ssh_host(&self) -> Option<&'static str> {
        match self {
            RepositoryProvider::Github => Some("github.com"),
            RepositoryProvider::Gitlab => Some("gitlab.com"),
            RepositoryProvider::Bitbucket => Some("bitbucket.org"),
            RepositoryProvider::Custom => None,
        }
    }

    /// SSH clone URL, so the server's deploy key is used.
    /// Custom repositories are cloned from the URL as given.
    pub fn clone_url(&self, repository: &str) -> String {
        match self.ssh_host() {
            Some(host) => format!("git@{}:{}.git", host, repository),
            None => repository.to_string(),
        }
    }

    /// Browser URL of the repository
    pub fn web_url(&self, repository: &str) -> String {
        match self.ssh_host() {
            Some(host) => format!("https://{}/{}", host, repository),
            None => repository.to_string(),
        }
    }
}

impl fmt::Display for RepositoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryProvider {
    type Err = ScriptError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        RepositoryProvider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or(ScriptError::Unknown {
                kind: "repository provider",
                value: s,
            })
    }
}

/// Values for one nginx virtual host
#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub domain: String,
    pub aliases: Vec<String>,
    pub web_root: String,
    pub php_version: PhpVersion,
    pub project_type: ProjectType,
}

/// Values for one deployment run
#[derive(Debug, Clone)]
pub struct DeployParams {
    pub site_root: String,
    pub branch: String,
    pub php_version: PhpVersion,
    /// The site's deploy script
    pub body: String,
}

/// Renders the files a site needs on the server
pub struct SiteTemplates {
    tera: Tera,
}

impl SiteTemplates {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (NGINX_TEMPLATE_NAME, NGINX_TEMPLATE),
            (DEPLOY_TEMPLATE_NAME, DEPLOY_TEMPLATE),
        ])?;
        Ok(Self { tera })
    }

    pub fn virtual_host(&self, host: &VirtualHost) -> Result<String> {
        validate_domain(&host.domain)?;
        for alias in &host.aliases {
            validate_domain(alias)?;
        }
        check_path("web_root", &host.web_root)?;

        let mut names = vec![host.domain.as_str()];
        names.extend(host.aliases.iter().map(String::as_str));

        let mut context = Context::new();
        context.insert("server_names", &names.join(" "));
        context.insert("domain", &host.domain);
        context.insert("web_root", &host.web_root);
        context.insert("php", &host.project_type.uses_php());
        context.insert("php_version", host.php_version.as_str());

        let config = self.tera.render(NGINX_TEMPLATE_NAME, &context)?;
        debug!(domain = %host.domain, bytes = config.len(), "Rendered nginx virtual host");
        Ok(config)
    }

    pub fn deploy_script(&self, params: &DeployParams) -> Result<String> {
        check_path("site_root", &params.site_root)?;
        validate_branch(&params.branch)?;

        let mut context = Context::new();
        context.insert("site_root", &params.site_root);
        context.insert("branch", &params.branch);
        context.insert("php_version", params.php_version.as_str());
        context.insert("body", params.body.trim_end());
        Ok(self.tera.render(DEPLOY_TEMPLATE_NAME, &context)?)
    }
}

/// Render `KEY=value` lines for a `.env` file.
///
/// Values with whitespace, quotes, `#` or `=` are double-quoted with
/// backslash escapes.
pub fn env_file<'a, I>(variables: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut content = String::new();
    for (key, value) in variables {
        content.push_str(key);
        content.push('=');
        if needs_quoting(value) {
            content.push('"');
            for c in value.chars() {
                if matches!(c, '"' | '\'' | '\\') {
                    content.push('\\');
                }
                content.push(c);
            }
            content.push('"');
        } else {
            content.push_str(value);
        }
        content.push('\n');
    }
    content
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '='))
}

fn invalid(name: &'static str, value: &str) -> ScriptError {
    ScriptError::Invalid {
        name,
        value: value.to_string(),
    }
}

/// Host name with at least one dot and an alphabetic TLD
pub fn validate_domain(domain: &str) -> Result<()> {
    let labels: Vec<&str> = domain.split('.').collect();
    let label_ok = |label: &&str| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));

    if domain.len() <= MAX_DOMAIN_LENGTH && labels.len() >= 2 && labels.iter().all(label_ok) && tld_ok {
        Ok(())
    } else {
        Err(invalid("domain", domain))
    }
}

/// Web directory relative to the site root: `/` or `/public`, no `..`
pub fn validate_directory(directory: &str) -> Result<()> {
    let valid = directory.starts_with('/')
        && directory.len() <= 255
        && directory
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(invalid("directory", directory))
    }
}

/// `owner/name` for hosted providers
pub fn validate_repository(provider: RepositoryProvider, repository: &str) -> Result<()> {
    let name_ok = |part: &str, extra: &[char]| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || extra.contains(&c))
    };

    let valid = match provider {
        RepositoryProvider::Custom => {
            !repository.is_empty()
                && repository.len() <= 255
                && !repository
                    .chars()
                    .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '\'' | '"' | '`' | '$' | ';' | '&' | '|'))
        }
        _ => match repository.split_once('/') {
            Some((owner, name)) => {
                repository.len() <= 255 && name_ok(owner, &[]) && name_ok(name, &['.'])
            }
            None => false,
        },
    };
    if valid {
        Ok(())
    } else {
        Err(invalid("repository", repository))
    }
}

pub fn validate_branch(branch: &str) -> Result<()> {
    let valid = !branch.is_empty()
        && branch.len() <= 255
        && !branch.starts_with('-')
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));
    if valid {
        Ok(())
    } else {
        Err(invalid("branch", branch))
    }
}

/// Environment variable name; letters, digits and `_`, not starting with a digit
pub fn validate_env_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = key.len() <= 255
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(invalid("environment key", key))
    }
}

pub fn validate_env_value(key: &str, value: &str) -> Result<()> {
    if value.len() > MAX_ENV_VALUE_LENGTH || value.contains(['\n', '\r', '\0']) {
        return Err(invalid("environment value", key));
    }
    Ok(())
}

/// Absolute path made of safe characters, substituted into templates unquoted
fn check_path(name: &'static str, path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ScriptError::UnsafeValue { name })
    }
}
