//! Sanity checks applied to checks before they are queued.

use anyhow::{Result, anyhow};
use tracing::info;

use super::types::{Check, Input};

/// Validates a single check as served by the hub or an input file
pub fn validate_check(check: &Check) -> Result<()> {
    if check.uuid().trim().is_empty() {
        return Err(anyhow!("{} without checkUuid", check.kind()));
    }
    Ok(())
}

/// Flatten an input batch, dropping checks that can never be reported
pub fn valid_checks(input: Input) -> Vec<Check> {
    input
        .into_checks()
        .into_iter()
        .filter(|check| match validate_check(check) {
            Ok(()) => true,
            Err(e) => {
                info!("Dropping check: {}", e);
                false
            }
        })
        .collect()
}
