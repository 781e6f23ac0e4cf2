//! netbypass CLI - seccomp socket bypass daemon for rootless containers

use std::io;
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use clap::{Parser, Subcommand};
use netbypass::{BypassConfig, IgnoreSubnet, PortMapping, Server, nsagent};
use nix::sys::signal::{SigSet, Signal};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netbypass")]
#[command(author, version, about = "Accelerate rootless container networking by bypassing the user-mode stack")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Socket the container runtime sends seccomp fds to
    /// [default: $XDG_RUNTIME_DIR/netbypass.sock]
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Publish a port, HOST:CONTAINER (repeatable)
    #[arg(short, long = "publish", value_name = "HOST:CONTAINER")]
    publish: Vec<PortMapping>,

    /// Never bypass this subnet, or `auto` to learn the sandbox's own subnets
    /// (repeatable)
    #[arg(long = "ignore", value_name = "CIDR|auto")]
    ignore: Vec<IgnoreSubnet>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the interfaces of the current network namespace as JSON lines
    Nsagent,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "netbypass=debug" } else { "netbypass=info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Some(Commands::Nsagent) => run_nsagent(),
        None => serve(cli.serve),
    }
}

fn run_nsagent() -> anyhow::Result<()> {
    nsagent::agent_signals()
        .thread_block()
        .context("blocking agent signals")?;
    nsagent::run(io::stdout().lock()).context("nsagent")
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    match netbypass_sys::check() {
        Ok(info) => tracing::debug!(kernel = ?info.kernel_version, "system check passed"),
        Err(e) => tracing::warn!(error = %e, "system check failed, bypass may not work"),
    }

    let mut config = BypassConfig::new();
    for mapping in args.publish {
        config = config.publish(mapping)?;
    }
    for entry in args.ignore {
        config = config.ignore(entry);
    }
    tracing::info!(
        published = config.forwarding.len(),
        ignored = config.ignore.len(),
        auto = config.auto_ignore,
        "configuration"
    );

    let socket = args.socket.unwrap_or_else(default_socket);

    // Block before any thread exists so every thread inherits the mask.
    let mut hup = SigSet::empty();
    hup.add(Signal::SIGHUP);
    hup.thread_block().context("blocking SIGHUP")?;

    let server = Server::bind(&socket, config).with_context(|| format!("listening on {}", socket.display()))?;

    let refreshers = server.refreshers();
    thread::Builder::new()
        .name("sighup".into())
        .spawn(move || {
            loop {
                match hup.wait() {
                    Ok(_) => {
                        let n = refreshers.trigger_all();
                        tracing::info!(agents = n, "SIGHUP: refreshing sandbox subnets");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "sigwait failed");
                        return;
                    }
                }
            }
        })
        .context("spawning signal thread")?;

    server.serve().context("accept loop")
}

fn default_socket() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("netbypass.sock")
}
