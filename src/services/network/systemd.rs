use super::parse::{is_missing_unit, parse_unit_active};
use crate::{
    command::{CommandRunner, SystemCommand},
    error::{NetworkError, NetworkResult},
};
use log::debug;

const SYSTEMCTL: &str = "systemctl";

/// Start or restart a unit. A unit that is not installed is `ToolMissing`.
pub async fn start_unit<R>(runner: &R, action: &str, unit: &str) -> NetworkResult<()>
where
    R: CommandRunner,
{
    let command = SystemCommand::new(SYSTEMCTL).args([action, unit]);
    let output = runner.run(&command).await?;

    if !output.success() && is_missing_unit(&output.stderr) {
        return Err(NetworkError::tool_missing(unit));
    }

    output.checked(&command).map(|_| ())
}

/// Stop a unit. A unit that is not installed counts as stopped.
pub async fn stop_unit<R>(runner: &R, unit: &str) -> NetworkResult<()>
where
    R: CommandRunner,
{
    let command = SystemCommand::new(SYSTEMCTL).args(["stop", unit]);
    let output = runner.run(&command).await?;

    if !output.success() && is_missing_unit(&output.stderr) {
        debug!("{unit} not installed, nothing to stop");
        return Ok(());
    }

    output.checked(&command).map(|_| ())
}

pub async fn unit_active<R>(runner: &R, unit: &str) -> NetworkResult<bool>
where
    R: CommandRunner,
{
    // is-active exits non-zero for inactive units; only stdout matters
    let output = runner
        .run(&SystemCommand::new(SYSTEMCTL).args(["is-active", unit]))
        .await?;

    Ok(parse_unit_active(&output.stdout))
}
