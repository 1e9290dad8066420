//! Development tool for poking a Miniserver without running the bridge.
//!
//! Reads the same `LOXONE_*` variables (or `.env`) as the bridge.
//!
//! Usage:
//!   cargo run --bin lox-probe -- structure
//!   cargo run --bin lox-probe -- send jdev/sps/io/<uuid>/On
//!   cargo run --bin lox-probe -- watch

use clap::{Parser, Subcommand};
use loxone_mqtt_bridge::bridge::{Registry, sanitize};
use loxone_mqtt_bridge::config::{self, Config};
use loxone_mqtt_bridge::loxone::{EventValue, LoxoneClient};

#[derive(Parser)]
#[command(name = "lox-probe")]
#[command(about = "Inspect a Loxone Miniserver over its WebSocket API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every addressable state as room/control/state and identifier
    Structure,
    /// Send a raw command and print the reply
    Send {
        /// Command text, e.g. jdev/sps/io/<uuid>/On
        command: String,

        /// Substring of the reply's control field to wait for
        #[arg(long)]
        tag: Option<String>,
    },
    /// Enable status updates and print resolved events until Ctrl+C
    Watch,
}

/// Default reply tag: the command with its `jdev/` prefix and trailing value removed.
fn default_tag(command: &str) -> String {
    let trimmed = command
        .strip_prefix("jdev/")
        .or_else(|| command.strip_prefix("dev/"))
        .unwrap_or(command);
    match trimmed.rsplit_once('/') {
        Some((head, _)) if trimmed.starts_with("sps/io/") => head.to_string(),
        _ => trimmed.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    config::load_dotenv();
    let config = Config::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let client = LoxoneClient::new(config.loxone)?;
    println!("Connecting to {}...", client.host());
    client.connect().await?;

    let outcome = run(&client, cli.command).await;
    client.close().await;
    outcome
}

async fn run(client: &LoxoneClient, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Structure => {
            let topology = client.get_topology().await?;
            let registry = Registry::build(&topology);
            println!("Structure version {}", registry.version());

            let mut rows: Vec<(String, String)> = registry
                .states()
                .map(|state| {
                    let path = format!(
                        "{}/{}/{}",
                        sanitize(&state.room_name),
                        sanitize(&state.control.name),
                        sanitize(&state.name)
                    );
                    (path, state.id.to_string())
                })
                .collect();
            rows.sort();
            for (path, id) in rows {
                println!("{:<60} {}", path, id);
            }
        }
        Commands::Send { command, tag } => {
            let tag = tag.unwrap_or_else(|| default_tag(&command));
            let reply = client.request(&command, &tag).await?;
            println!("control: {}", reply.ll.control);
            println!("code:    {:?}", reply.code());
            println!("value:   {}", serde_json::to_string_pretty(&reply.ll.value)?);
        }
        Commands::Watch => {
            let topology = client.get_topology().await?;
            let registry = Registry::build(&topology);
            let mut events = client
                .take_events()
                .ok_or("event stream unavailable")?;
            client.enable_status_updates().await?;
            println!("Watching {} states, Ctrl+C to stop", registry.len());

            loop {
                let event = tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => {
                            eprintln!("Connection lost");
                            break;
                        }
                    },
                };

                let Some(state) = registry.lookup_by_id(&event.id) else {
                    continue;
                };
                let value = match &event.value {
                    EventValue::Value(v) => v.to_string(),
                    EventValue::Text(text) => format!("{:?}", text),
                };
                println!(
                    "{}/{}/{} = {}",
                    state.room_name, state.control.name, state.name, value
                );
            }
        }
    }
    Ok(())
}
