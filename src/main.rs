//! URNET CLI - host a hub or talk to one.
//!
//! This is the main binary entry point. See the `urnet` library for the
//! core functionality.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use urnet::socket::unix::{self, UnixSocketServer};
use urnet::{
    AddressAllocator, Bootstrap, Component, Config, Endpoint, MessageHandler, PhaseHook,
    PhaseMachine,
};

// CLI
#[derive(Parser)]
#[command(name = "urnet")]
#[command(version)]
#[command(about = "Addressable message endpoints over Unix sockets")]
struct Cli {
    /// Socket path (defaults to the configured one)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a hub until interrupted
    Serve {
        /// Address the hub claims (e.g. SRV001)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Call a message and print the result
    Call {
        /// Message name, e.g. SRV:ECHO
        msg: String,
        /// Payload (parsed as JSON, else sent as a string)
        data: Option<String>,
    },
    /// Deliver a message to every other handler
    Send {
        /// Message name
        msg: String,
        /// Payload (parsed as JSON, else sent as a string)
        data: Option<String>,
    },
    /// Broadcast a message to every handler
    Signal {
        /// Message name
        msg: String,
        /// Payload (parsed as JSON, else sent as a string)
        data: Option<String>,
    },
    /// List addresses that handle a message
    Ping {
        /// Message name
        msg: String,
    },
}

fn parse_data(data: Option<String>) -> Option<Value> {
    data.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
}

/// Where the hub listens and which address it claims.
#[derive(Debug, Clone)]
struct HubSettings {
    socket_path: PathBuf,
    server_addr: String,
}

/// The hub endpoint, its Unix socket, and the `SRV:` services it offers.
struct HubComponent {
    hub: Endpoint,
    settings: Mutex<Option<HubSettings>>,
    server: Arc<Mutex<Option<UnixSocketServer>>>,
}

impl HubComponent {
    fn new(hub: Endpoint) -> Self {
        Self {
            hub,
            settings: Mutex::new(None),
            server: Arc::new(Mutex::new(None)),
        }
    }

    fn shutdown(&self) {
        let started = self.server.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(server) = started {
            server.shutdown();
        }
    }
}

impl Component for HubComponent {
    fn name(&self) -> &str {
        "hub"
    }

    fn pre_config(&self, config: &Value) -> anyhow::Result<()> {
        let config: Config =
            serde_json::from_value(config.clone()).context("Invalid hub configuration")?;
        log::info!(
            "[Serve] socket {} timeout {}ms",
            config.socket_path.display(),
            config.call_timeout_ms
        );
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(HubSettings {
            socket_path: config.socket_path,
            server_addr: config.server_addr,
        });
        Ok(())
    }

    fn add_lifecycle_hooks(&self, machine: &PhaseMachine) {
        let settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let hub = self.hub.clone();
        let server = Arc::clone(&self.server);
        machine.hook_phase(
            "NET_CONNECT",
            PhaseHook::from_fn(move |_, _| {
                let Some(settings) = settings.as_ref() else {
                    anyhow::bail!("hub was not configured");
                };
                hub.config_as_server(Some(settings.server_addr.as_str()))?;
                let started = UnixSocketServer::start(settings.socket_path.clone(), hub.clone())?;
                *server.lock().unwrap_or_else(PoisonError::into_inner) = Some(started);
                Ok(())
            }),
        );

        let hub = self.hub.clone();
        machine.hook_phase(
            "APP_READY",
            PhaseHook::from_fn(move |_, _| {
                hub.add_message_handler(
                    "SRV:ECHO",
                    MessageHandler::from_fn(|payload| Ok(payload.unwrap_or_default())),
                )?;
                let roster = hub.clone();
                hub.add_message_handler(
                    "SRV:CLIENTS",
                    MessageHandler::from_fn(move |_| {
                        let clients: Vec<Value> = roster
                            .client_addresses()
                            .into_iter()
                            .map(|addr| json!({ "uaddr": addr, "name": roster.client_name(&addr) }))
                            .collect();
                        Ok(json!({ "clients": clients }))
                    }),
                )?;
                Ok(())
            }),
        );
    }
}

/// Run the hub through the standard lifecycle, then wait for ctrl-c.
async fn serve(mut config: Config, addr: Option<String>) -> Result<()> {
    if let Some(addr) = addr {
        config.server_addr = addr;
    }
    let allocator = Arc::new(AddressAllocator::with_digits(config.addr_digits));
    let hub = Endpoint::with_config("urnet-hub", allocator, config.endpoint_config());
    let component = Arc::new(HubComponent::new(hub.clone()));

    let boot = Bootstrap::lifecycle("URNET");
    boot.global_config(Some(serde_json::to_value(&config)?))?;
    boot.register_component(Arc::clone(&component) as Arc<dyn Component>)?;
    boot.hook(
        "APP_RUN",
        PhaseHook::from_fn(|_, meta| {
            log::info!("[Serve] {} running", meta.machine);
            Ok(())
        }),
    );
    boot.start().await?;

    let status = boot.status();
    log::info!("[Serve] {} ready at {:?}", hub.name(), hub.uaddr());
    log::debug!("[Serve] status {}", serde_json::to_string(&status)?);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    log::info!("[Serve] shutting down");
    component.shutdown();
    Ok(())
}

/// Connect a short-lived client endpoint.
async fn connect(config: &Config) -> Result<Endpoint> {
    let allocator = Arc::new(AddressAllocator::with_digits(config.addr_digits));
    let client = Endpoint::with_config("urnet-cli", allocator, config.endpoint_config());
    let token = config.token.clone().map(Value::String);
    unix::connect(&config.socket_path, &client, token)
        .await
        .with_context(|| format!("Failed to connect to {}", config.socket_path.display()))?;
    Ok(client)
}

/// Frames go out in order, so a ping round trip means earlier sends left.
async fn flush(client: &Endpoint, msg: &str) -> Result<()> {
    client.ping(msg).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match cli.command {
        Commands::Serve { addr } => serve(config, addr).await?,
        Commands::Call { msg, data } => {
            let client = connect(&config).await?;
            let result = client.call(&msg, parse_data(data)).await?;
            println!("{}", serde_json::to_string_pretty(&result.unwrap_or_default())?);
        }
        Commands::Send { msg, data } => {
            let client = connect(&config).await?;
            client.send(&msg, parse_data(data)).await?;
            flush(&client, &msg).await?;
        }
        Commands::Signal { msg, data } => {
            let client = connect(&config).await?;
            client.signal(&msg, parse_data(data)).await?;
            flush(&client, &msg).await?;
        }
        Commands::Ping { msg } => {
            let client = connect(&config).await?;
            for addr in client.ping(&msg).await? {
                println!("{addr}");
            }
        }
    }

    Ok(())
}
