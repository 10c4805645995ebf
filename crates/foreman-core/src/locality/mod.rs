//! Region/locality scoring (C9): a small additive bonus that nudges
//! resource-aware scheduling toward agents in the build's requested region,
//! without ever letting locality alone override a real resource-capacity
//! gap (§4.9 caps the combined score, enforced by the caller in
//! [`crate::strategy`]).

/// Bonus added to an agent's score when its region matches the build's
/// requested region. Blank/missing regions never match each other, since
/// treating "unset" as a wildcard would make locality meaningless for the
/// common case of a mixed fleet where only some agents report a region.
pub const LOCALITY_BONUS: f64 = 0.3;

/// Compute the locality bonus for one candidate. Returns 0.0 unless both
/// sides name a non-empty region and they match exactly.
pub fn locality_bonus(agent_region: Option<&str>, requested_region: Option<&str>) -> f64 {
    match (agent_region, requested_region) {
        (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() && a == r => LOCALITY_BONUS,
        _ => 0.0,
    }
}
