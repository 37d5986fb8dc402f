use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

use vm_console::config::{FileConfig, load_config};
use vm_console::{Batch, Connector, ConnectorConfig, InstanceRef, SocketBackend};

#[derive(Parser)]
#[command(name = "vmconsole")]
#[command(about = "Scripted access to virtual machine serial consoles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./vmconsole.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding <namespace>/<name>/console.sock
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until the console of an instance can be opened
    Wait(WaitArgs),

    /// Send input and wait for output patterns
    Expect(ExpectArgs),
}

#[derive(Parser)]
struct WaitArgs {
    /// Instance as namespace/name
    target: String,

    /// Connection timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[derive(Parser)]
struct ExpectArgs {
    /// Instance as namespace/name
    target: String,

    /// Pattern to wait for, in order (regular expression)
    #[arg(short, long = "pattern", required = true)]
    patterns: Vec<String>,

    /// Text to send before the first pattern (\n, \r, \t and \\ are unescaped)
    #[arg(short, long)]
    send: Option<String>,

    /// Do not send a newline to provoke a prompt
    #[arg(long)]
    no_newline: bool,

    /// Overall batch timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "vmconsole=debug,vm_console=debug,info"
    } else {
        "vmconsole=info,vm_console=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let run_dir = cli
        .run_dir
        .clone()
        .unwrap_or_else(|| file_config.socket.run_dir.clone());

    let backend = Arc::new(SocketBackend::new(run_dir));
    let connector = Connector::new(backend.clone(), backend)
        .with_config(ConnectorConfig::from_file(&file_config.connect));

    match cli.command {
        Commands::Wait(args) => wait_command(&connector, args).await,
        Commands::Expect(args) => expect_command(&connector, &file_config, args).await,
    }
}

fn parse_target(target: &str) -> Result<InstanceRef> {
    target
        .parse::<InstanceRef>()
        .with_context(|| format!("Invalid instance '{}'", target))
}

async fn wait_command(connector: &Connector, args: WaitArgs) -> Result<()> {
    let instance = parse_target(&args.target)?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(connector.config().connect_timeout);

    let (session, _errors) = connector
        .connect(&instance, timeout)
        .await
        .with_context(|| format!("Failed to open console of {}", instance))?;
    info!("Console of {} is available", instance);
    println!("{}: console ready", instance);
    session.close();
    Ok(())
}

async fn expect_command(
    connector: &Connector,
    config: &FileConfig,
    args: ExpectArgs,
) -> Result<()> {
    let instance = parse_target(&args.target)?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.batch.timeout());

    let mut batch = Batch::new(timeout);
    if !args.no_newline {
        batch = batch.send("\n");
    }
    if let Some(text) = &args.send {
        batch = batch.send(unescape(text));
    }
    for pattern in &args.patterns {
        batch = batch.expect(pattern.as_str());
    }

    let matches = connector
        .expect_batch(&instance, batch)
        .await
        .with_context(|| format!("Console script failed on {}", instance))?;
    for found in matches {
        println!("{}", found.matched);
    }
    Ok(())
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
