use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowlogd::config::{self, Config};
use flowlogd::control::Monitor;
use flowlogd::daemon::{self, Daemon};

/// NetFlow collector daemon: receives v1/v5/v7 datagrams and appends the
/// decoded flows to a binary log.
#[derive(Parser, Debug)]
#[command(name = "flowlogd", version, about)]
struct Cli {
    /// Stay in the foreground and log verbosely.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Path to the configuration file.
    #[arg(
        short = 'f',
        long = "config-file",
        value_name = "PATH",
        default_value = config::DEFAULT_CONFIG_PATH
    )]
    config_file: PathBuf,

    /// Define a configuration macro, e.g. -D LOGDIR=/var/log/flows.
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    define: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "flowlogd=debug"
    } else {
        "flowlogd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // Log files and the control socket stay private to the daemon's user.
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o077));

    let defines = cli
        .define
        .iter()
        .map(|d| config::parse_define(d))
        .collect::<Result<Vec<_>, _>>()
        .context("could not parse macro definition")?;

    let conf = Config::load(&cli.config_file, &defines).context("config file has errors")?;

    // Bind early so address errors surface before the monitor detaches.
    let sockets = daemon::bind_listeners(&conf.listen_on).context("listener setup failed")?;

    let (control, _monitor) = Monitor::new(&cli.config_file, defines)
        .spawn()
        .context("could not start monitor")?;

    daemon::install_signal_handlers().context("could not install signal handlers")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config_file.display(),
        listeners = sockets.len(),
        "starting flowlogd"
    );

    Daemon::new(conf, sockets, control, cli.debug).run()
}
