//! Hardware volume control through the ALSA mixer CLI.
//!
//! The codec exposes an inverted attenuation register: raw 0 is loudest,
//! raw 1023 is mute. All percent math goes through `percent_to_raw` so
//! the inversion lives in one place.

use anyhow::{bail, Context};
use tokio::process::Command;

const CARD_INDEX: u32 = 1;
const CONTROL_SIMPLE: &str = "aw_dev_0_rx_volume";
const CONTROL_INDEXED: &str = "aw_dev_0_rx_volume,0";
/// Step applied by keyword-only commands ("调大一点").
pub const VOLUME_STEP_PERCENT: u32 = 5;
const RAW_MIN: u32 = 0;
const RAW_MAX: u32 = 1023;

/// Set the output volume to an absolute percentage.
pub async fn set_volume_percent(percent: u32) -> anyhow::Result<()> {
    let raw = percent_to_raw(percent.min(100));
    run_amixer(&["sset", CONTROL_INDEXED, &raw.to_string()]).await?;
    Ok(())
}

/// Nudge the volume by a percentage of full scale. The register is
/// inverted, so "up" subtracts raw counts.
pub async fn adjust_volume_by_percent(percent: u32, up: bool) -> anyhow::Result<()> {
    let current = current_raw_volume().await?;
    let step = raw_step_from_percent(percent.min(100));
    let target = if up {
        current.saturating_sub(step)
    } else {
        current.saturating_add(step)
    };
    run_amixer(&["sset", CONTROL_INDEXED, &clamp_raw(target).to_string()]).await?;
    Ok(())
}

/// Nudge the volume by the fixed keyword step.
pub async fn adjust_volume_step(up: bool) -> anyhow::Result<()> {
    adjust_volume_by_percent(VOLUME_STEP_PERCENT, up).await
}

async fn run_amixer(args: &[&str]) -> anyhow::Result<String> {
    let mut cmd = Command::new("amixer");
    cmd.args(["-c", &CARD_INDEX.to_string()]);
    cmd.args(args);
    let output = cmd.output().await.context("failed to run amixer")?;
    if !output.status.success() {
        bail!(
            "amixer {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read the current raw register value via `amixer cget`.
async fn current_raw_volume() -> anyhow::Result<u32> {
    let control = format!("name='{CONTROL_SIMPLE}'");
    let out = run_amixer(&["cget", &control]).await?;
    parse_cget_values(&out).context("could not parse current volume from amixer output")
}

/// Pull the first value out of an `amixer cget` dump
/// (`  : values=716` lines).
fn parse_cget_values(out: &str) -> Option<u32> {
    for line in out.lines() {
        let line = line.trim();
        if let Some(values) = line.strip_prefix(": values=") {
            let first = values.split(',').next()?.trim();
            return first.parse().ok().map(clamp_raw);
        }
    }
    None
}

/// Percent (0..=100) to raw register counts: 100% -> 0 (no attenuation),
/// 0% -> 1023 (mute).
pub fn percent_to_raw(percent: u32) -> u32 {
    let percent = percent.min(100);
    clamp_raw(RAW_MAX * (100 - percent) / 100)
}

fn raw_step_from_percent(step: u32) -> u32 {
    if step == 0 {
        return 0;
    }
    ((RAW_MAX - RAW_MIN) * step.min(100) / 100).max(1)
}

fn clamp_raw(raw: u32) -> u32 {
    raw.clamp(RAW_MIN, RAW_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_to_raw_mapping() {
        assert_eq!(percent_to_raw(0), 1023);
        assert_eq!(percent_to_raw(30), 716);
        assert_eq!(percent_to_raw(100), 0);
        // Out-of-range input clamps instead of wrapping.
        assert_eq!(percent_to_raw(250), 0);
    }

    #[test]
    fn test_raw_step() {
        assert_eq!(raw_step_from_percent(0), 0);
        assert_eq!(raw_step_from_percent(5), 51);
        assert_eq!(raw_step_from_percent(100), 1023);
        // A tiny step still moves the register.
        assert!(raw_step_from_percent(1) >= 1);
    }

    #[test]
    fn test_parse_cget_values() {
        let dump = "numid=5,iface=MIXER,name='aw_dev_0_rx_volume'\n\
                    \x20 ; type=INTEGER,access=rw------,values=1,min=0,max=1023,step=0\n\
                    \x20 : values=716\n";
        assert_eq!(parse_cget_values(dump), Some(716));
        assert_eq!(parse_cget_values("no values here"), None);
    }

    #[test]
    fn test_parse_cget_values_clamped() {
        assert_eq!(parse_cget_values(" : values=9999"), Some(1023));
    }
}
