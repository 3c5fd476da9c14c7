//! Watch command implementation

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use unitctl_core::config::OutputFormat;
use unitctl_core::{Context, UnitError, UnitManagerApi, UnitUpdate};

use super::lifecycle::UnitArgs;

const UPDATE_BUFFER: usize = 16;

/// Execute the watch command
///
/// Runs until interrupted or the timeout passes; both count as success.
pub async fn execute(
    manager: &impl UnitManagerApi,
    ctx: &Context,
    args: &UnitArgs,
    format: OutputFormat,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);

    let watching = async move {
        let result = manager.watch(ctx, &args.unit, Some(&tx)).await;
        drop(tx);
        result
    };
    let printing = async {
        while let Some(update) = rx.recv().await {
            println!("{}", render_update(&args.unit, &update, format)?);
        }
        Ok::<(), anyhow::Error>(())
    };

    let (watched, printed) = tokio::join!(watching, printing);
    printed?;
    match watched {
        Err(UnitError::Cancelled | UnitError::DeadlineExceeded) | Ok(()) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn render_update(unit: &str, update: &UnitUpdate, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(&json!({
            "unit": unit,
            "status": update,
        }))?,
        OutputFormat::Text => match update {
            Some(status) if status.sub_state.is_empty() => {
                format!("{unit}: {}", status.active_state)
            }
            Some(status) => format!("{unit}: {} ({})", status.active_state, status.sub_state),
            None => format!("{unit}: unloaded"),
        },
    })
}
