//! rewardboard - terminal front end for the reward dashboard session.
//!
//! Logs in against the dashboard backend, issues authenticated requests
//! through the renewing pipeline, and watches the auth gate or the presence
//! feed from a terminal.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rewardboard_core::api::ApiRequest;
use rewardboard_core::config::{Config, PresenceKind};
use rewardboard_core::gate::Navigator;
use rewardboard_core::utils::redact_token;
use rewardboard_core::AuthContext;

const USAGE: &str = "\
Usage: rewardboard <command>

Commands:
  login [email]       Log in and store the session
  logout              Log out and clear the stored session
  whoami              Show the stored profile and the backend's view of it
  get <path>          GET an API path through the authenticated pipeline
  gate <route>        Watch the auth gate for a dashboard route
  presence [--poll]   Watch who is online (STOMP push, or polling with --poll)";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). When `log_file` is
/// configured, the same events are also appended there.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_file {
        Some(ref path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path.file_name().unwrap_or(path.as_os_str());
            let appender = tracing_appender::rolling::never(dir.unwrap_or(std::path::Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Navigation for a terminal: report where the browser would have gone.
struct PrintNavigator;

impl Navigator for PrintNavigator {
    fn redirect(&self, to: &str, from: &str) {
        println!("redirect -> {}?from={}", to, from);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let _guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let ctx = AuthContext::from_config(&config)?;
    // The in-process cookie jar is usable from the start
    ctx.refresher().mark_cookies_ready();
    info!(command = %command, "rewardboard starting");

    match command.as_str() {
        "login" => login(&ctx, &config, args.get(1).cloned()).await,
        "logout" => {
            ctx.session().logout().await?;
            println!("Logged out.");
            Ok(())
        }
        "whoami" => whoami(&ctx).await,
        "get" => {
            let path = args.get(1).context("get needs an API path, e.g. /api/auth/me")?;
            get(&ctx, path).await
        }
        "gate" => {
            let route = args.get(1).context("gate needs a route, e.g. /admin")?;
            watch_gate(&ctx, &config, route).await
        }
        "presence" => {
            let poll = args.iter().any(|a| a == "--poll");
            watch_presence(&ctx, &config, poll).await
        }
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn prompt_email(default: Option<&str>) -> Result<String> {
    match default {
        Some(email) => print!("Email [{}]: ", email),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim();
    match (email.is_empty(), default) {
        (true, Some(default)) => Ok(default.to_string()),
        (true, None) => bail!("Email required"),
        (false, _) => Ok(email.to_string()),
    }
}

async fn login(ctx: &AuthContext, config: &Config, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password required");
    }

    let record = ctx
        .session()
        .login(&email, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.display_message()))?;

    // Persist without the environment overrides that `config` carries
    let mut stored = Config::load_file()?;
    stored.last_email = Some(email);
    if let Err(e) = stored.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!(
        "Logged in as {} ({}), token {}",
        record.profile.display_name(),
        record.profile.role,
        redact_token(&record.access_token)
    );
    Ok(())
}

async fn whoami(ctx: &AuthContext) -> Result<()> {
    let Some(profile) = ctx.session().current_user() else {
        println!("Not logged in.");
        return Ok(());
    };

    println!("{} <{}>", profile.display_name(), profile.email);
    println!("  role:        {}", profile.role);
    println!("  authorities: {}", profile.authorities.join(", "));
    println!(
        "  admin: {}  create challenges: {}  manage users: {}",
        profile.is_admin(),
        profile.can_create_challenge(),
        profile.can_manage_users()
    );

    match ctx.session().fetch_me().await {
        Ok(me) => println!("  backend id:  {} ({})", me.id, me.username),
        Err(e) => println!("  backend:     {}", e.display_message()),
    }
    Ok(())
}

async fn get(ctx: &AuthContext, path: &str) -> Result<()> {
    let response = ctx
        .client()
        .send(ApiRequest::get(path))
        .await
        .map_err(|e| match e.status() {
            Some(status) => anyhow::anyhow!("HTTP {}: {}", status, e.display_message()),
            None => anyhow::anyhow!(e.display_message()),
        })?;

    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

async fn watch_gate(ctx: &AuthContext, config: &Config, route: &str) -> Result<()> {
    let gate = ctx.gate(config.routes.clone(), Arc::new(PrintNavigator), config.gate_settings());
    let mut handle = gate.mount(route);
    println!("{}: {:?}", route, handle.state());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            state = handle.changed() => match state {
                Some(state) => println!("{}: {:?} ({:?})", route, state, state.view()),
                None => break,
            },
        }
    }
    handle.unmount();
    Ok(())
}

async fn watch_presence(ctx: &AuthContext, config: &Config, poll: bool) -> Result<()> {
    if !ctx.store().is_authenticated() {
        bail!("Not logged in. Run `rewardboard login` first.");
    }

    let mut config = config.clone();
    if poll {
        config.presence = PresenceKind::Polling;
    }
    let tracker = ctx.start_presence(config.presence_mode());
    println!("Watching presence ({}), Ctrl-C to stop", tracker.mode());

    let mut updates = tracker.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                let online: Vec<&str> = state.online.iter().map(String::as_str).collect();
                match state.error {
                    Some(ref error) if !state.connected => println!("offline: {}", error),
                    _ => println!("online ({}): {}", online.len(), online.join(", ")),
                }
            }
        }
    }

    tracker.stop().await;
    Ok(())
}
