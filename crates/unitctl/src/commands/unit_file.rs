//! link and unlink commands

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use unitctl_core::config::OutputFormat;
use unitctl_core::install::{install_unit, uninstall_unit};
use unitctl_core::{Context, SystemdBus};

use super::lifecycle::{UnitArgs, report};

/// Service file to link
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Path to the service file; `.service` is appended if missing
    pub path: PathBuf,
}

pub async fn link(
    bus: &SystemdBus,
    ctx: &Context,
    args: &LinkArgs,
    format: OutputFormat,
) -> Result<()> {
    let unit = install_unit(bus, ctx, &args.path).await?;
    report(&unit, "link", "Linked", format)
}

pub async fn unlink(
    bus: &SystemdBus,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    uninstall_unit(bus, ctx, &args.unit).await?;
    report(&args.unit, "unlink", "Unlinked", format)
}
