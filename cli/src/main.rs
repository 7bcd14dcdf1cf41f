// driftguard: relay server and command-line client
//
// Runs the location relay, issues credentials, shares a position track and
// follows linked parties from a terminal.

mod api;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use driftguard_core::client::{
    JsonLinesSource, LinkedPositions, PositionProducer, PositionSource, ProducerConfig,
    ProducerEvent, RelayClient, RelayClientConfig, TransportError, TransportEvent,
};
use driftguard_core::identity::{issue_credential, IdentityVerifier, MemoryIdentityStore};
use driftguard_core::relay::{RelayMessage, RelayServer, RelayServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "driftguard")]
#[command(about = "DriftGuard: real-time location sharing for patients and caregivers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the location relay
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// JSON file of identity records
        #[arg(short, long)]
        users: Option<PathBuf>,
    },
    /// Issue a relay credential for a user
    Token {
        user_id: String,
        #[arg(long, default_value = "30")]
        ttl_days: u64,
    },
    /// Share positions read as JSON lines from stdin or a file
    Track {
        #[arg(short, long)]
        token: Option<String>,
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Replay the input with this many milliseconds between lines
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Follow the positions of linked parties
    Watch {
        #[arg(short, long)]
        token: Option<String>,
    },
    /// Show the patient linked to this guardian or doctor
    PatientInfo {
        #[arg(short, long)]
        token: Option<String>,
    },
    /// List the guardians and doctors linked to this patient
    Linked {
        #[arg(short, long)]
        token: Option<String>,
    },
    /// Show the profile behind a credential
    Whoami {
        #[arg(short, long)]
        token: Option<String>,
    },
    /// Check that the relay is up
    Status,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, users } => cmd_serve(port, users).await,
        Commands::Token { user_id, ttl_days } => cmd_token(user_id, ttl_days),
        Commands::Track {
            token,
            input,
            interval_ms,
        } => cmd_track(token, input, interval_ms).await,
        Commands::Watch { token } => cmd_watch(token).await,
        Commands::PatientInfo { token } => cmd_patient_info(token).await,
        Commands::Linked { token } => cmd_linked(token).await,
        Commands::Whoami { token } => cmd_whoami(token).await,
        Commands::Status => cmd_status().await,
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_serve(port: Option<u16>, users: Option<PathBuf>) -> Result<()> {
    let config = config::Config::load()?;

    let users_file = users.or_else(|| config.users_file.as_ref().map(PathBuf::from));
    let store = match &users_file {
        Some(path) => MemoryIdentityStore::load_json(path)?,
        None => {
            tracing::warn!("No users file configured; every connection will be rejected");
            MemoryIdentityStore::new()
        }
    };

    println!("{}", "Starting DriftGuard relay...".bold());
    println!("  {} {} identities loaded", "✓".green(), store.len());

    let verifier = IdentityVerifier::new(config.token_secret.clone(), Arc::new(store));
    let server = RelayServer::with_config(
        verifier,
        RelayServerConfig {
            probe_interval: Duration::from_secs(config.tracking.probe_interval_secs.max(1)),
        },
    );

    let ip: IpAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind_address: {}", config.bind_address))?;
    let addr = SocketAddr::new(ip, port.unwrap_or(config.listen_port));

    let (bound, serving) = server.bind(addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })?;

    println!("  {} Listening on {}", "✓".green(), bound.to_string().bright_cyan());
    println!("  {} ws://{}/ws?token=<credential>", "→".dimmed(), bound);
    println!();
    println!("{}", "Press Ctrl+C to stop".dimmed());

    serving.await;
    println!("{}", "Relay stopped".yellow());
    Ok(())
}

fn cmd_token(user_id: String, ttl_days: u64) -> Result<()> {
    if ttl_days == 0 {
        anyhow::bail!("--ttl-days must be at least 1");
    }
    let config = config::Config::load()?;
    let credential = issue_credential(&config.token_secret, &user_id, ttl_days * 24 * 3600);
    eprintln!(
        "{} Credential for {} (valid {} days)",
        "✓".green(),
        user_id.bright_cyan(),
        ttl_days
    );
    println!("{}", credential);
    Ok(())
}

async fn cmd_track(token: Option<String>, input: Option<PathBuf>, interval_ms: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let token = resolve_token(token, &config)?;

    let client = RelayClient::new(RelayClientConfig::new(config.relay_url.clone()));
    let events = client.subscribe();
    client.connect(token)?;

    let confirmed = Arc::new(AtomicU64::new(0));
    let reporter = tokio::spawn(report_transport(events, Arc::clone(&confirmed)));

    let mut producer = PositionProducer::new(ProducerConfig {
        min_interval: Duration::from_millis(config.tracking.min_interval_ms),
        max_consecutive_failures: config.tracking.max_consecutive_failures,
        ..ProducerConfig::default()
    });
    tokio::spawn(report_positions(producer.subscribe()));

    let mut source: Box<dyn PositionSource> = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            paced(JsonLinesSource::new(BufReader::new(file)), interval_ms)
        }
        None => paced(JsonLinesSource::new(BufReader::new(tokio::io::stdin())), interval_ms),
    };

    let outcome = tokio::select! {
        outcome = producer.run(source.as_mut(), Some(&client)) => outcome,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    // Give the relay a moment to confirm what is still in flight
    let emitted = producer.emitted();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while confirmed.load(Ordering::Relaxed) < emitted
        && tokio::time::Instant::now() < deadline
        && !reporter.is_finished()
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.disconnect()?;
    println!();
    println!(
        "{} {} sent, {} confirmed by relay",
        "Done:".bold(),
        emitted,
        confirmed.load(Ordering::Relaxed)
    );

    outcome.map_err(Into::into)
}

fn paced<R>(source: JsonLinesSource<R>, interval_ms: Option<u64>) -> Box<dyn PositionSource>
where
    R: tokio::io::AsyncBufRead + Unpin + Send + 'static,
{
    match interval_ms {
        Some(ms) => Box::new(source.paced(Duration::from_millis(ms))),
        None => Box::new(source),
    }
}

async fn report_transport(mut events: tokio::sync::broadcast::Receiver<TransportEvent>, confirmed: Arc<AtomicU64>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Opened) => println!("{} Connected to relay", "✓".green()),
            Ok(TransportEvent::Message(RelayMessage::Connected { user_id, role })) => {
                println!("  {} as {} ({})", "→".dimmed(), user_id.bright_cyan(), role);
            }
            Ok(TransportEvent::Message(RelayMessage::LocationConfirmation { .. })) => {
                confirmed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(TransportEvent::Message(_)) => {}
            Ok(TransportEvent::Closed { code }) => {
                println!("{} Relay connection closed ({:?})", "!".yellow(), code);
            }
            Ok(TransportEvent::ReconnectScheduled { attempt, delay }) => {
                println!(
                    "{} Reconnecting in {}ms (attempt {})",
                    "…".yellow(),
                    delay.as_millis(),
                    attempt
                );
            }
            Ok(TransportEvent::Error(e)) => {
                eprintln!("{} {}", "✗".red(), e);
                if matches!(e, TransportError::Rejected | TransportError::ReconnectExhausted(_)) {
                    return;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

async fn report_positions(mut events: tokio::sync::broadcast::Receiver<ProducerEvent>) {
    loop {
        match events.recv().await {
            Ok(ProducerEvent::Position(sample)) => {
                println!(
                    "  {} {:.6}, {:.6} (±{:.0}m)",
                    "↑".green(),
                    sample.latitude,
                    sample.longitude,
                    sample.accuracy
                );
            }
            Ok(ProducerEvent::Error(e)) => eprintln!("  {} {}", "!".yellow(), e),
            Ok(ProducerEvent::Stopped(e)) => {
                eprintln!("{} {}", "✗".red(), e);
                return;
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

async fn cmd_watch(token: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let token = resolve_token(token, &config)?;

    let client = RelayClient::new(RelayClientConfig::new(config.relay_url.clone()));
    let mut events = client.subscribe();
    client.connect(token)?;

    println!("{}", "Watching linked parties (Ctrl+C to stop)".bold());
    let mut view = LinkedPositions::new();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Watch output fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if view.apply_event(&event) {
            if let TransportEvent::Message(RelayMessage::LocationUpdate { user_id, .. }) = &event {
                if let Some(position) = view.get(user_id) {
                    println!(
                        "{} {:<16} {:<9} {:.6}, {:.6}  {}",
                        "●".green(),
                        position.user_name.bright_cyan(),
                        position.role.to_string(),
                        position.coordinates.latitude,
                        position.coordinates.longitude,
                        position.received_at.dimmed()
                    );
                }
            }
            continue;
        }

        match event {
            TransportEvent::Opened => println!("{} Connected to relay", "✓".green()),
            TransportEvent::Closed {
                code: Some(code @ (1000 | 1001)),
            } => {
                println!("{} Relay ended the session ({})", "!".yellow(), code);
                break;
            }
            TransportEvent::Closed { code } => {
                println!("{} Connection lost ({:?})", "!".yellow(), code);
            }
            TransportEvent::ReconnectScheduled { attempt, delay } => {
                println!(
                    "{} Reconnecting in {}ms (attempt {})",
                    "…".yellow(),
                    delay.as_millis(),
                    attempt
                );
            }
            TransportEvent::Error(e @ (TransportError::Rejected | TransportError::ReconnectExhausted(_))) => {
                client.disconnect()?;
                anyhow::bail!(e);
            }
            TransportEvent::Error(e) => eprintln!("{} {}", "✗".red(), e),
            TransportEvent::Message(_) => {}
        }
    }

    client.disconnect()?;

    println!();
    println!("{}", "Last known positions".bold());
    if view.is_empty() {
        println!("  {}", "(none received)".dimmed());
    }
    for position in view.all() {
        println!(
            "  {:<16} {:.6}, {:.6}  {}",
            position.user_name,
            position.coordinates.latitude,
            position.coordinates.longitude,
            position.received_at.dimmed()
        );
    }
    view.clear();
    Ok(())
}

async fn cmd_patient_info(token: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let token = resolve_token(token, &config)?;
    let patient = api::get_patient_info(&config.api_url, &token).await?;

    println!("{}", "Linked patient".bold());
    println!("  {:<12} {}", "ID:".bright_cyan(), patient.id);
    println!("  {:<12} {}", "Name:".bright_cyan(), patient.name);
    println!(
        "  {:<12} {}",
        "Email:".bright_cyan(),
        patient.email.as_deref().unwrap_or("-")
    );
    println!(
        "  {:<12} {}",
        "Patient key:".bright_cyan(),
        patient.patient_key.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn cmd_linked(token: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let token = resolve_token(token, &config)?;
    let linked = api::get_linked_guardians(&config.api_url, &token).await?;

    println!("{} ({})", "Linked guardians and doctors".bold(), linked.len());
    if linked.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for profile in linked {
        println!(
            "  {:<16} {:<9} {}",
            profile.name.bright_cyan(),
            profile.role.to_string(),
            profile.email.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_whoami(token: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let token = resolve_token(token, &config)?;
    let me = api::get_profile(&config.api_url, &token).await?;

    println!("{} ({})", me.name.bold(), me.role);
    println!("  {:<8} {}", "ID:".bright_cyan(), me.id);
    if let Some(patient) = &me.linked_patient_id {
        println!("  {:<8} {}", "Patient:".bright_cyan(), patient);
    }
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    let health = api::get_health(&config.api_url).await?;
    println!(
        "{} Relay at {} is {} ({} connections)",
        "✓".green(),
        config.api_url.bright_cyan(),
        health.status,
        health.connections
    );
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else if config.list().iter().any(|(k, _)| k == &key) {
                println!("{} = {}", key.bright_cyan(), "(none)".dimmed());
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }

            println!();
            println!("  {} {}", "File:".dimmed(), config::Config::config_file()?.display());
        }
    }

    Ok(())
}

fn resolve_token(flag: Option<String>, config: &config::Config) -> Result<String> {
    flag.or_else(|| config.token.clone())
        .context("No credential: pass --token or run `driftguard config set token <credential>`")
}
