//! start, stop, and restart commands

use anyhow::Result;
use clap::Args;
use serde_json::json;
use unitctl_core::config::OutputFormat;
use unitctl_core::{Context, UnitManagerApi};

/// A single unit name
#[derive(Args, Debug)]
pub struct UnitArgs {
    /// Unit name, e.g. nginx.service
    pub unit: String,
}

pub async fn start(
    manager: &impl UnitManagerApi,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    manager.start(ctx, &args.unit).await?;
    report(&args.unit, "start", "Started", format)
}

pub async fn stop(
    manager: &impl UnitManagerApi,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    manager.stop(ctx, &args.unit).await?;
    report(&args.unit, "stop", "Stopped", format)
}

pub async fn restart(
    manager: &impl UnitManagerApi,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    manager.restart(ctx, &args.unit).await?;
    report(&args.unit, "restart", "Restarted", format)
}

pub(super) fn report(unit: &str, action: &str, done: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = json!({
                "unit": unit,
                "action": action,
                "result": "done",
            });
            println!("{}", serde_json::to_string(&output)?);
        }
        OutputFormat::Text => println!("{done} {unit}"),
    }
    Ok(())
}
