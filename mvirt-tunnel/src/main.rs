use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use mvirt_tunnel::command::IpRoute2;
use mvirt_tunnel::config::{self, EngineConfig, ExecutorConfig};
use mvirt_tunnel::executor::ProcessExecutor;
use mvirt_tunnel::inspector::IpRoute2Inspector;
use mvirt_tunnel::store::SqliteStore;
use mvirt_tunnel::{TargetStatus, TunnelDescriptor, TunnelEngine, TunnelError, TunnelFields};

#[derive(Parser)]
#[command(name = "mvirt-tunnel")]
#[command(about = "Manage sit/ip6ip6/ip6gre tunnel interfaces", long_about = None)]
struct Cli {
    /// Tunnel database
    #[arg(long, default_value = config::DB_PATH)]
    db: PathBuf,

    /// iproute2 binary
    #[arg(long, default_value = config::IP_BINARY)]
    ip_binary: String,

    /// Run host commands through `sudo -n`
    #[arg(long)]
    sudo: bool,

    /// Timeout for a single host command, in seconds
    #[arg(long, default_value = "10")]
    command_timeout_secs: u64,

    /// How long to wait for another operation on the same interface, in seconds
    #[arg(long, default_value = "30")]
    lock_timeout_secs: u64,

    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all tunnels
    List,

    /// Show one tunnel
    Get {
        /// Tunnel ID
        id: String,
    },

    /// Create a tunnel and bring it up
    Create(TunnelArgs),

    /// Change a tunnel; omitted fields keep their value
    Update {
        /// Tunnel ID
        id: String,

        #[command(flatten)]
        fields: TunnelArgs,
    },

    /// Delete a tunnel
    Delete {
        /// Tunnel ID
        id: String,
    },

    /// Bring a tunnel up
    Up {
        /// Tunnel ID
        id: String,
    },

    /// Bring a tunnel down
    Down {
        /// Tunnel ID
        id: String,
    },

    /// Compare stored tunnels against live interfaces
    Drift,
}

#[derive(Args)]
struct TunnelArgs {
    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Tunnel type: 6to4, ipip6 or gre6
    #[arg(long = "type")]
    kind: Option<String>,

    /// Local endpoint address
    #[arg(long)]
    local_ip: Option<String>,

    /// Remote endpoint address
    #[arg(long)]
    remote_ip: Option<String>,

    /// Address with prefix assigned to the interface
    #[arg(long)]
    assigned_ip: Option<String>,

    /// Interface MTU (empty to unset)
    #[arg(long)]
    mtu: Option<String>,

    /// Interface name
    #[arg(long)]
    interface_name: Option<String>,
}

impl From<TunnelArgs> for TunnelFields {
    fn from(args: TunnelArgs) -> Self {
        Self {
            name: args.name,
            kind: args.kind,
            local_ip: args.local_ip,
            remote_ip: args.remote_ip,
            assigned_ip: args.assigned_ip,
            mtu: args.mtu,
            interface_name: args.interface_name,
        }
    }
}

#[derive(Tabled)]
struct TunnelRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "INTERFACE")]
    interface: String,
    #[tabled(rename = "LOCAL")]
    local: String,
    #[tabled(rename = "REMOTE")]
    remote: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "MTU")]
    mtu: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

impl From<&TunnelDescriptor> for TunnelRow {
    fn from(t: &TunnelDescriptor) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            kind: t.kind.to_string(),
            interface: t.interface_name.clone(),
            local: t.local_ip.to_string(),
            remote: t.remote_ip.to_string(),
            address: t.assigned_ip.to_string(),
            mtu: t.mtu.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
            status: t.status.to_string(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tunnel(tunnel: &TunnelDescriptor) {
    println!("ID:        {}", tunnel.id);
    println!("Name:      {}", tunnel.name);
    println!("Type:      {}", tunnel.kind);
    println!("Interface: {}", tunnel.interface_name);
    println!("Local:     {}", tunnel.local_ip);
    println!("Remote:    {}", tunnel.remote_ip);
    println!("Address:   {}", tunnel.assigned_ip);
    if let Some(mtu) = tunnel.mtu {
        println!("MTU:       {}", mtu);
    }
    println!("Status:    {}", tunnel.status);
    if let Some(message) = &tunnel.status_message {
        println!("Message:   {}", message);
    }
    println!("Created:   {}", tunnel.created_at.to_rfc3339());
    println!("Updated:   {}", tunnel.updated_at.to_rfc3339());
}

fn report(json: bool, tunnel: &TunnelDescriptor, verb: &str) -> anyhow::Result<()> {
    if json {
        print_json(tunnel)
    } else {
        println!("{} tunnel {} ({})", verb, tunnel.id, tunnel.interface_name);
        Ok(())
    }
}

/// Print a caller-facing error and exit.
fn fail(json: bool, err: TunnelError) -> ! {
    if err.is_client_error() {
        debug!(error = %err, "Request rejected");
    } else {
        error!(error = %err, "Operation failed");
    }

    if json {
        let body = match &err {
            TunnelError::Validation(errors) => serde_json::json!({ "errors": errors.fields() }),
            other => serde_json::json!({
                "error": other.public_message(),
                "step": other.failed_step().map(|s| s.to_string()),
            }),
        };
        eprintln!("{}", body);
    } else if let TunnelError::Validation(errors) = &err {
        eprintln!("Error: invalid tunnel");
        for (field, messages) in errors.fields() {
            for message in messages {
                eprintln!("  {}: {}", field, message);
            }
        }
    } else {
        eprintln!("Error: {}", err.public_message());
    }

    std::process::exit(1);
}

async fn run(cli: Cli, engine: &TunnelEngine) -> anyhow::Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::List => {
            let tunnels = engine.list().await?;
            if json {
                print_json(&tunnels)
            } else if tunnels.is_empty() {
                println!("No tunnels found");
                Ok(())
            } else {
                let rows: Vec<TunnelRow> = tunnels.iter().map(TunnelRow::from).collect();
                println!("{}", Table::new(rows));
                Ok(())
            }
        }
        Commands::Get { id } => {
            let tunnel = engine.get(&id).await?;
            if json {
                print_json(&tunnel)
            } else {
                print_tunnel(&tunnel);
                Ok(())
            }
        }
        Commands::Create(args) => {
            let tunnel = engine.create(args.into()).await?;
            report(json, &tunnel, "Created")
        }
        Commands::Update { id, fields } => {
            let tunnel = engine.update(&id, fields.into()).await?;
            report(json, &tunnel, "Updated")
        }
        Commands::Delete { id } => {
            let outcome = engine.delete(&id).await?;
            if json {
                print_json(&outcome)
            } else {
                println!("Deleted tunnel {}", outcome.tunnel.id);
                if let Some(warning) = &outcome.warning {
                    eprintln!("Warning: {}", warning);
                }
                Ok(())
            }
        }
        Commands::Up { id } => {
            let tunnel = engine.set_status(&id, TargetStatus::Active).await?;
            report(json, &tunnel, "Activated")
        }
        Commands::Down { id } => {
            let tunnel = engine.set_status(&id, TargetStatus::Inactive).await?;
            report(json, &tunnel, "Deactivated")
        }
        Commands::Drift => {
            let reports = engine.detect_drift().await?;
            if json {
                print_json(&reports)
            } else if reports.is_empty() {
                println!("All tunnels match their interfaces");
                Ok(())
            } else {
                for report in &reports {
                    println!("{} ({}, {}):", report.interface_name, report.tunnel_id, report.status);
                    for drift in &report.drift {
                        println!("  - {:?}", drift);
                    }
                }
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_tunnel=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let executor = Arc::new(ProcessExecutor::new(ExecutorConfig {
        timeout: Duration::from_secs(cli.command_timeout_secs),
        sudo: cli.sudo,
    }));
    let surface = Arc::new(IpRoute2::new(cli.ip_binary.clone()));
    let inspector = Arc::new(IpRoute2Inspector::new(executor.clone(), surface.clone()));
    info!(db = %cli.db.display(), ip = %cli.ip_binary, "Initializing mvirt-tunnel");

    let store = Arc::new(SqliteStore::new(&cli.db).await?);

    let engine = TunnelEngine::new(
        store,
        executor,
        inspector,
        surface,
        EngineConfig {
            lock_timeout: Duration::from_secs(cli.lock_timeout_secs),
        },
    );

    // Stop at the next step boundary on Ctrl-C; the running plan rolls back.
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let json = cli.json;
    match run(cli, &engine).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast::<TunnelError>() {
            Ok(err) => fail(json, err),
            Err(e) => Err(e),
        },
    }
}
