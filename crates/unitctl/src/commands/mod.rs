//! CLI command dispatch and execution

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use unitctl_core::config::{
    BusKind, Config, ConfigOverrides, OutputFormat, SYSTEM_CONFIG_PATH, resolve_config,
};
use unitctl_core::{Context, ControlBus, UnitManager, logging};

mod lifecycle;
mod unit_file;
mod uptime;
mod watch;

/// unitctl - Drive systemd units over D-Bus
#[derive(Parser, Debug)]
#[command(
    name = "unitctl",
    version,
    about = "Drive systemd units over D-Bus",
    long_about = "Start, stop, restart, and watch systemd units through the D-Bus control API, \
                  waiting on job results instead of polling"
)]
pub struct Cli {
    /// Load this config file on top of the discovered ones
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Talk to the per-user service manager instead of the system one
    #[arg(long, global = true)]
    session: bool,

    /// Give up after this many seconds (0 waits forever)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a unit and wait for the job to finish
    Start(lifecycle::UnitArgs),

    /// Stop a unit and wait for the job to finish
    Stop(lifecycle::UnitArgs),

    /// Reload then restart a unit and wait for the job to finish
    Restart(lifecycle::UnitArgs),

    /// Show how long a unit's main process has been running
    Uptime(lifecycle::UnitArgs),

    /// Print status changes of a unit until interrupted
    Watch(lifecycle::UnitArgs),

    /// Link a service file as a runtime unit
    Link(unit_file::LinkArgs),

    /// Stop and unlink a runtime unit
    Unlink(lifecycle::UnitArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        if self.verbose {
            logging::init_with(Some("debug"));
        } else {
            logging::init();
        }

        let config = resolve_config(
            &self.overrides(),
            Path::new(SYSTEM_CONFIG_PATH),
            dirs::home_dir().as_deref(),
        )?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(run(self.command, config))
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            bus_kind: self.session.then_some(BusKind::Session),
            timeout_secs: self.timeout,
            format: self.json.then_some(OutputFormat::Json),
            ..Default::default()
        }
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    let root = Context::background();
    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let ctx = match config.cli.timeout_secs {
        0 => root.with_cancel(),
        secs => root.with_timeout(Duration::from_secs(secs)),
    };
    let format = config.cli.format;

    let manager = UnitManager::connect(&ctx, &config.bus).await?;
    let result = match command {
        Commands::Start(args) => lifecycle::start(&manager, &ctx, &args, format).await,
        Commands::Stop(args) => lifecycle::stop(&manager, &ctx, &args, format).await,
        Commands::Restart(args) => lifecycle::restart(&manager, &ctx, &args, format).await,
        Commands::Uptime(args) => uptime::execute(&manager, &ctx, &args, format).await,
        Commands::Watch(args) => watch::execute(&manager, &ctx, &args, format).await,
        Commands::Link(args) => unit_file::link(manager.bus(), &ctx, &args, format).await,
        Commands::Unlink(args) => unit_file::unlink(manager.bus(), &ctx, &args, format).await,
    };

    // The teardown task would close the bus too, but the runtime may be
    // gone before it gets scheduled.
    root.cancel();
    manager.bus().close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_become_overrides() {
        let cli = Cli::parse_from([
            "unitctl",
            "start",
            "dummy.service",
            "--session",
            "--timeout",
            "5",
            "--json",
        ]);
        let overrides = cli.overrides();

        assert_eq!(overrides.bus_kind, Some(BusKind::Session));
        assert_eq!(overrides.timeout_secs, Some(5));
        assert_eq!(overrides.format, Some(OutputFormat::Json));
        assert!(overrides.config_path.is_none());
    }

    #[test]
    fn test_absent_flags_leave_config_alone() {
        let cli = Cli::parse_from(["unitctl", "uptime", "dummy.service"]);
        let overrides = cli.overrides();

        assert!(overrides.bus_kind.is_none());
        assert!(overrides.timeout_secs.is_none());
        assert!(overrides.format.is_none());
    }
}
