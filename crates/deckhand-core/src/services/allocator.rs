use std::sync::Arc;

use crate::error::{DeckhandError, Result};
use crate::models::{DeploymentStatus, ManagerConfig};
use crate::services::registry::{DeploymentFilter, Registry};

/// Smallest unused increment-aligned base port in `[range_start, range_end)`.
///
/// Single pass over the sorted bases, so allocation stays linear in the
/// number of deployments. Callers serialize invocations (see the
/// orchestrator's allocation lock) to keep concurrent creations from
/// picking the same slot.
pub fn allocate_port(
    existing_bases: &[u16],
    range_start: u16,
    range_end: u16,
    increment: u16,
) -> Result<u16> {
    let mut bases: Vec<u32> = existing_bases
        .iter()
        .map(|p| u32::from(*p))
        .filter(|p| *p >= u32::from(range_start) && *p < u32::from(range_end))
        .collect();
    bases.sort_unstable();
    bases.dedup();
    let increment = u32::from(increment);
    let start = u32::from(range_start);

    // Candidates stay on the range_start grid even when an existing base
    // is off it (increment reconfigured under live allocations).
    let align_up = |value: u32| -> u32 {
        match (value - start) % increment {
            0 => value,
            rem => value + (increment - rem),
        }
    };

    let mut candidate = start;
    for base in &bases {
        // A full free slot before this allocation?
        if candidate + increment <= *base {
            break;
        }
        candidate = align_up(base + increment);
    }

    if candidate + increment <= u32::from(range_end) {
        Ok(candidate as u16)
    } else {
        Err(DeckhandError::ResourceExhausted(format!(
            "no free slot in {range_start}..{range_end} (increment {increment}); \
             delete an unused deployment to free one"
        )))
    }
}

/// Subdomains are a pure function of the id, so uniqueness follows from the
/// registry's uniqueness on id.
pub fn subdomain_for(id: &str, base_domain: &str) -> String {
    format!("{id}.{base_domain}")
}

/// Count the owner's live (non-Deleting) deployments against the quota.
pub async fn check_quota(
    registry: &Arc<dyn Registry>,
    owner: &str,
    config: &ManagerConfig,
) -> Result<()> {
    let owned = registry
        .list(&DeploymentFilter {
            owner: Some(owner.to_string()),
            status: None,
        })
        .await?;
    let live = owned
        .iter()
        .filter(|d| d.status != DeploymentStatus::Deleting)
        .count();
    if live >= config.max_deployments_per_owner {
        return Err(DeckhandError::QuotaExceeded {
            owner: owner.to_string(),
            limit: config.max_deployments_per_owner,
        });
    }
    Ok(())
}
