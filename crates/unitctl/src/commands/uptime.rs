//! Uptime command implementation

use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use unitctl_core::config::OutputFormat;
use unitctl_core::{Context, UnitManagerApi};

use super::lifecycle::UnitArgs;

/// Execute the uptime command
pub async fn execute(
    manager: &impl UnitManagerApi,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    let uptime = manager.uptime(ctx, &args.unit).await?;

    match format {
        OutputFormat::Json => {
            let output = json!({
                "unit": args.unit,
                "uptimeSecs": uptime.as_secs_f64(),
            });
            println!("{}", serde_json::to_string(&output)?);
        }
        OutputFormat::Text => println!("{}: up {}", args.unit, format_uptime(uptime)),
    }
    Ok(())
}

/// Render a duration as `1d 2h 3m 4s`, dropping leading zero units.
fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::ZERO), "0s");
        assert_eq!(format_uptime(Duration::from_millis(59_999)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(3_600)), "1h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }
}
