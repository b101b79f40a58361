//! Deterministic replay & provenance helpers.
//!
//! The manifest hashes are computed from the plan's structural fingerprint, the
//! serialized assignment, and the job configuration together with the platform
//! line-up. Same plan, same configuration, same registry: same hashes.

use polyplan_core::config::JobConfig;
use polyplan_core::hash::{hash_serde, Hash256};
use polyplan_core::plan::Plan;
use polyplan_optimizer::ExecutionAssignment;
use polyplan_platform::PlatformRegistry;

use crate::error::{JobError, Result};

pub fn hash_plan(plan: &Plan) -> Result<Hash256> {
    plan.fingerprint().map_err(|e| JobError::Internal(e.to_string()))
}

pub fn hash_assignment(assignment: &ExecutionAssignment) -> Result<Hash256> {
    assignment
        .fingerprint()
        .map_err(|e| JobError::Internal(e.to_string()))
}

/// Hash the configuration snapshot and the registered platforms into one
/// digest; both decide what the optimizer may pick.
pub fn hash_config(config: &JobConfig, registry: &PlatformRegistry) -> Result<Hash256> {
    let a = hash_serde(config).map_err(|e| JobError::Internal(e.to_string()))?;
    let b = hash_serde(&registry.platform_ids()).map_err(|e| JobError::Internal(e.to_string()))?;
    Ok(xor_hashes(a, b))
}

fn xor_hashes(a: Hash256, b: Hash256) -> Hash256 {
    let mut out = [0u8; 32];
    for (i, o) in out.iter_mut().enumerate() {
        *o = a.0[i] ^ b.0[i];
    }
    Hash256(out)
}
