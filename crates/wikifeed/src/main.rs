use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use wikifeed_core::config::{FeedConfig, load_config};
use wikifeed_core::notifications::{MARK_READ_BATCH_SIZE, Notification};
use wikifeed_core::{
    ClientError, HttpSession, NotificationClient, NotificationsEndpoint, RequestPriority,
    SummaryClient,
};

#[derive(Debug, Parser)]
#[command(
    name = "wikifeed",
    version,
    about = "Article summaries and Echo notification polling for MediaWiki sites"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = "wikifeed.toml")]
    config: PathBuf,
    #[arg(long, global = true, help = "Print resolved endpoints before running")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Fetch page summaries for one or more article URLs")]
    Summary(SummaryArgs),
    Notifications(NotificationsArgs),
    #[command(name = "auth-status", about = "Report whether the session cookies are valid")]
    AuthStatus,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    #[arg(required = true, value_name = "KEY")]
    keys: Vec<String>,
}

#[derive(Debug, Args)]
struct NotificationsArgs {
    #[command(subcommand)]
    command: NotificationsSubcommand,
}

#[derive(Debug, Subcommand)]
enum NotificationsSubcommand {
    #[command(about = "List unread notifications")]
    Unread(WikiArgs),
    #[command(name = "mark-read", about = "Mark unread notifications as read")]
    MarkRead(MarkReadArgs),
}

#[derive(Debug, Args)]
struct WikiArgs {
    #[arg(long = "wiki", value_name = "SUBDOMAIN", help = "Wiki subdomain, e.g. en or zh-min-nan")]
    wikis: Vec<String>,
}

#[derive(Debug, Args)]
struct MarkReadArgs {
    #[command(flatten)]
    wikis: WikiArgs,
    #[arg(long = "id", value_name = "ID", help = "Only mark these notification ids")]
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MarkReadReport {
    requested: usize,
    batches: usize,
    success: bool,
    errors: Vec<String>,
}

struct Runtime {
    config: FeedConfig,
    session: Arc<HttpSession>,
    diagnostics: bool,
}

impl Runtime {
    fn load(cli: &Cli) -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = load_config(&cli.config)?;
        let session = HttpSession::from_config(&config).context("failed to build HTTP session")?;
        Ok(Self {
            config,
            session: Arc::new(session),
            diagnostics: cli.diagnostics,
        })
    }

    fn notification_client(&self) -> Result<NotificationClient<HttpSession>> {
        let endpoint = NotificationsEndpoint::from_config(&self.config)
            .context("invalid notifications endpoint")?;
        if self.diagnostics {
            eprintln!("api_url: {}", endpoint.api_url);
            eprintln!("cookie_domain: {}", endpoint.cookie_domain);
        }
        Ok(NotificationClient::new(Arc::clone(&self.session), endpoint))
    }

    fn summary_client(&self) -> SummaryClient<HttpSession> {
        if self.diagnostics {
            eprintln!(
                "summary_host: {}",
                self.config
                    .summary_host()
                    .unwrap_or_else(|| "<article host>".to_string())
            );
        }
        SummaryClient::from_config(Arc::clone(&self.session), &self.config)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Summary(args)) => run_summary(&Runtime::load(&cli)?, args),
        Some(Commands::Notifications(NotificationsArgs { command })) => {
            let runtime = Runtime::load(&cli)?;
            match command {
                NotificationsSubcommand::Unread(args) => run_unread(&runtime, args),
                NotificationsSubcommand::MarkRead(args) => run_mark_read(&runtime, args),
            }
        }
        Some(Commands::AuthStatus) => run_auth_status(&Runtime::load(&cli)?),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_summary(runtime: &Runtime, args: &SummaryArgs) -> Result<()> {
    let client = runtime.summary_client();
    if let [key] = args.keys.as_slice() {
        let summary = client
            .fetch_summary(key, RequestPriority::High)
            .with_context(|| format!("failed to fetch summary for {key}"))?;
        return print_json(&summary);
    }
    let summaries = client.fetch_summaries(&args.keys);
    print_json(&summaries)
}

fn run_unread(runtime: &Runtime, args: &WikiArgs) -> Result<()> {
    let client = runtime.notification_client()?;
    let unread = client
        .list_unread(&args.wikis)
        .context("failed to list unread notifications")?;
    print_json(&unread)
}

fn run_mark_read(runtime: &Runtime, args: &MarkReadArgs) -> Result<()> {
    let client = runtime.notification_client()?;
    if !client.is_authenticated() {
        eprintln!("warning: no valid session cookies; the write token request will likely fail");
    }
    let unread = client
        .list_unread(&args.wikis.wikis)
        .context("failed to list unread notifications")?;
    let selected = select_notifications(unread, &args.ids);

    let outcome = client.mark_read(&selected);
    let report = MarkReadReport {
        requested: selected.len(),
        batches: selected.len().div_ceil(MARK_READ_BATCH_SIZE),
        success: outcome.is_ok(),
        errors: match &outcome {
            Ok(()) => Vec::new(),
            Err(ClientError::Aggregate { errors, .. }) => {
                errors.iter().map(ToString::to_string).collect()
            }
            Err(error) => vec![error.to_string()],
        },
    };
    print_json(&report)?;
    outcome.context("mark as read failed")
}

fn run_auth_status(runtime: &Runtime) -> Result<()> {
    let client = runtime.notification_client()?;
    println!("cookie_domain: {}", client.endpoint().cookie_domain);
    println!("authenticated: {}", format_flag(client.is_authenticated()));
    Ok(())
}

fn select_notifications(
    unread: BTreeSet<Notification>,
    ids: &[String],
) -> BTreeSet<Notification> {
    if ids.is_empty() {
        return unread;
    }
    unread
        .into_iter()
        .filter(|notification| ids.iter().any(|id| *id == notification.id))
        .collect()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use clap::Parser;
    use wikifeed_core::Notification;

    use super::{Cli, Commands, NotificationsSubcommand, select_notifications};

    fn notification(id: &str) -> Notification {
        Notification {
            wiki: Some("enwiki".to_string()),
            id: id.to_string(),
            kind: None,
            category: None,
            header: None,
            timestamp_iso8601: None,
            agent_name: None,
            affected_page_title: None,
        }
    }

    #[test]
    fn mark_read_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "wikifeed",
            "notifications",
            "mark-read",
            "--wiki",
            "en",
            "--wiki",
            "de",
            "--id",
            "7",
        ])
        .expect("parse");
        let Some(Commands::Notifications(args)) = cli.command else {
            panic!("expected notifications command");
        };
        let NotificationsSubcommand::MarkRead(args) = args.command else {
            panic!("expected mark-read");
        };
        assert_eq!(args.wikis.wikis, vec!["en".to_string(), "de".to_string()]);
        assert_eq!(args.ids, vec!["7".to_string()]);
    }

    #[test]
    fn summary_requires_a_key() {
        assert!(Cli::try_parse_from(["wikifeed", "summary"]).is_err());
    }

    #[test]
    fn selection_filters_by_id_or_keeps_everything() {
        let unread = ["1", "2", "3"]
            .into_iter()
            .map(notification)
            .collect::<BTreeSet<_>>();
        assert_eq!(select_notifications(unread.clone(), &[]).len(), 3);
        let picked = select_notifications(unread, &["2".to_string(), "9".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked.iter().next().map(|item| item.id.as_str()), Some("2"));
    }
}
