//! Runtime unit-file installation
//!
//! Links a service file into `/run/systemd/system` so it can be driven by
//! name without touching the persistent unit search path, and removes it
//! again. Both directions stop the unit first, ignoring the outcome.

use crate::bus::{JobVerb, SystemdBus, UnitFileChange};
use crate::context::Context;
use crate::error::UnitError;
use crate::job::run_job;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory systemd places runtime unit links in.
pub const RUNTIME_UNIT_DIR: &str = "/run/systemd/system";

const SERVICE_SUFFIX: &str = ".service";

/// Append `.service` unless the name already ends with it.
pub fn service_unit_name(name: &str) -> String {
    if name.ends_with(SERVICE_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{SERVICE_SUFFIX}")
    }
}

/// Where a runtime link for `unit` ends up.
pub fn runtime_unit_path(unit: &str) -> PathBuf {
    Path::new(RUNTIME_UNIT_DIR).join(unit)
}

/// Link the service file at `path` as a runtime unit, replacing any
/// previous link of the same name. Returns the unit name.
///
/// A missing `.service` suffix on `path` is added before linking.
pub async fn install_unit(
    bus: &SystemdBus,
    ctx: &Context,
    path: &Path,
) -> Result<String, UnitError> {
    let path = with_suffix(path);
    let source = std::path::absolute(&path).map_err(|e| UnitError::UnitFile {
        action: "link",
        target: path.display().to_string(),
        message: format!("cannot resolve absolute path: {e}"),
        source: None,
    })?;
    let unit = unit_name_of(&source)?;
    let run_path = runtime_unit_path(&unit);

    if let Err(e) = uninstall_unit(bus, ctx, &unit).await {
        if e.is_context() {
            return Err(e);
        }
        debug!("Ignoring cleanup failure before linking {:?}: {}", unit, e);
    }
    remove_stale_link(&run_path);

    let target = source.display().to_string();
    let changes = until_done(ctx, bus.link_unit_files(&[target.as_str()], true, true))
        .await?
        .map_err(|e| UnitError::UnitFile {
            action: "link",
            target: target.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;
    verify_change("link", &target, &changes, &run_path)?;

    info!("Linked {:?} as runtime unit {:?}", target, unit);
    Ok(unit)
}

/// Stop the unit (outcome ignored) and remove its runtime link.
pub async fn uninstall_unit(bus: &SystemdBus, ctx: &Context, name: &str) -> Result<(), UnitError> {
    let unit = service_unit_name(name);

    if let Err(e) = run_job(bus, ctx, &unit, JobVerb::Stop).await {
        if e.is_context() {
            return Err(e);
        }
        debug!("Ignoring stop failure for {:?} before unlinking: {}", unit, e);
    }

    let changes = until_done(ctx, bus.disable_unit_files(&[unit.as_str()], true))
        .await?
        .map_err(|e| UnitError::UnitFile {
            action: "unlink",
            target: unit.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;
    let run_path = runtime_unit_path(&unit);
    verify_change("unlink", &unit, &changes, &run_path)?;
    remove_stale_link(&run_path);

    info!("Unlinked runtime unit {:?}", unit);
    Ok(())
}

async fn until_done<T>(ctx: &Context, fut: impl Future<Output = T>) -> Result<T, UnitError> {
    tokio::select! {
        biased;
        reason = ctx.done() => Err(reason.into()),
        value = fut => Ok(value),
    }
}

fn with_suffix(path: &Path) -> PathBuf {
    let raw = path.as_os_str().to_string_lossy();
    if raw.ends_with(SERVICE_SUFFIX) {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{raw}{SERVICE_SUFFIX}"))
    }
}

fn unit_name_of(path: &Path) -> Result<String, UnitError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| UnitError::UnitFile {
            action: "link",
            target: path.display().to_string(),
            message: "path has no usable file name".to_string(),
            source: None,
        })
}

/// The daemon must report the runtime link as its first change.
fn verify_change(
    action: &'static str,
    target: &str,
    changes: &[UnitFileChange],
    expected: &Path,
) -> Result<(), UnitError> {
    let Some(first) = changes.first() else {
        return Err(UnitError::UnitFile {
            action,
            target: target.to_string(),
            message: "expected one change, got none".to_string(),
            source: None,
        });
    };
    if Path::new(&first.filename) != expected {
        return Err(UnitError::UnitFile {
            action,
            target: target.to_string(),
            message: format!("expected {:?}, got {:?}", expected, first.filename),
            source: None,
        });
    }
    Ok(())
}

fn remove_stale_link(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale link {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(filename: &str) -> UnitFileChange {
        UnitFileChange {
            change_type: "symlink".to_string(),
            filename: filename.to_string(),
            destination: "/srv/units/dummy.service".to_string(),
        }
    }

    #[test]
    fn test_service_unit_name() {
        assert_eq!(service_unit_name("dummy"), "dummy.service");
        assert_eq!(service_unit_name("dummy.service"), "dummy.service");
        assert_eq!(service_unit_name("dummy.socket"), "dummy.socket.service");
    }

    #[test]
    fn test_runtime_unit_path() {
        assert_eq!(
            runtime_unit_path("dummy.service"),
            PathBuf::from("/run/systemd/system/dummy.service")
        );
    }

    #[test]
    fn test_with_suffix_keeps_directories() {
        assert_eq!(
            with_suffix(Path::new("fixtures/dummy")),
            PathBuf::from("fixtures/dummy.service")
        );
        assert_eq!(
            with_suffix(Path::new("/srv/units/dummy.service")),
            PathBuf::from("/srv/units/dummy.service")
        );
    }

    #[test]
    fn test_unit_name_of_path() {
        assert_eq!(
            unit_name_of(Path::new("/srv/units/dummy.service")).unwrap(),
            "dummy.service"
        );
        assert!(unit_name_of(Path::new("/")).is_err());
    }

    #[test]
    fn test_verify_change_accepts_runtime_link() {
        let expected = runtime_unit_path("dummy.service");
        let changes = vec![change("/run/systemd/system/dummy.service")];
        verify_change("link", "dummy.service", &changes, &expected).unwrap();
    }

    #[test]
    fn test_verify_change_rejects_empty_and_misplaced() {
        let expected = runtime_unit_path("dummy.service");

        let err = verify_change("link", "dummy.service", &[], &expected).unwrap_err();
        assert!(err.to_string().contains("got none"));

        let changes = vec![change("/etc/systemd/system/dummy.service")];
        let err = verify_change("unlink", "dummy.service", &changes, &expected).unwrap_err();
        assert!(matches!(err, UnitError::UnitFile { action: "unlink", .. }));
        assert!(err.to_string().contains("/etc/systemd/system/dummy.service"));
    }

    #[tokio::test]
    async fn test_until_done_prefers_cancelled_context() {
        let ctx = Context::background();
        ctx.cancel();
        let err = until_done(&ctx, async { 1 }).await.unwrap_err();
        assert!(matches!(err, UnitError::Cancelled));
    }
}
