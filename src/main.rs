use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use rover_session::{
    logging, loopback, Config, ConnectionStatus, ControlEvent, EventBus, HttpSignaling,
    RtcTransport, SessionManager, SilenceDevice,
};

#[derive(Parser)]
#[command(name = "rover-session", version, about = "Real-time voice session client")]
struct Cli {
    /// Default log filter, overridden by RUST_LOG.
    #[arg(long, default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session and exchange control events over stdin/stdout.
    Connect {
        /// Signaling endpoint, overrides the config file.
        #[arg(long)]
        url: Option<String>,

        /// JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bearer token for the signaling endpoint.
        #[arg(long, env = "ROVER_SESSION_TOKEN")]
        token: Option<String>,

        /// Events to send once connected, one JSON object each.
        #[arg(long = "event")]
        events: Vec<String>,
    },
    /// Run a loopback peer that answers offers and echoes control events.
    Serve {
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log);

    match cli.command {
        Commands::Serve { port } => {
            info!("Starting loopback peer...");
            loopback::serve(port).context("loopback peer")?;
        }
        Commands::Connect {
            url,
            config,
            token,
            events,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(url) = url {
                config.signaling.url = url;
            }
            if token.is_some() {
                config.signaling.bearer_token = token;
            }
            config.validate()?;

            connect(config, events)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn connect(config: Config, events: Vec<String>) -> anyhow::Result<()> {
    let session = SessionManager::spawn(
        config.recovery.clone(),
        RtcTransport::new(config.transport.clone()),
        HttpSignaling::new(&config.signaling),
        SilenceDevice,
        EventBus::new(),
    );

    let subscription = session.subscribe(|event| match event.to_wire() {
        Ok(wire) => println!("{wire}"),
        Err(e) => warn!("Unprintable event {}: {}", event.kind, e),
    });

    info!("Connecting to {}", config.signaling.url);
    session.connect().await?;

    let snapshot = session
        .wait_for(|s| s.status != ConnectionStatus::Connecting)
        .await?;
    if snapshot.status != ConnectionStatus::Connected {
        bail!(
            "session {} failed: {}",
            snapshot.id,
            snapshot.last_error.unwrap_or_default()
        );
    }
    info!("✅ Session {} connected", snapshot.id);

    for raw in &events {
        let event = ControlEvent::parse(raw).with_context(|| format!("--event {raw}"))?;
        session.send_event(event);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = session.watch();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match ControlEvent::parse(&line) {
                    Ok(event) => session.send_event(event),
                    Err(e) => warn!("Not a control event: {}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                match snapshot.status {
                    ConnectionStatus::Error => {
                        error!("Session lost: {}", snapshot.last_error.unwrap_or_default());
                        break;
                    }
                    ConnectionStatus::Connecting => {
                        info!("Reconnecting (attempt {})", snapshot.attempt_count);
                    }
                    _ => {}
                }
            }
        }
    }

    subscription.unsubscribe();
    session.shutdown().await;
    Ok(())
}
