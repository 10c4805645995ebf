//! Scheduling strategy: the policy that ranks candidate agents for a build
//! (§4.10). Expressed as an object-safe trait so the policy in force can be
//! swapped at runtime via config rather than compiled in, following the same
//! shape as the harness trait this crate already carries.

use async_trait::async_trait;
use foreman_db::SystemInfo;
use uuid::Uuid;

use crate::locality::locality_bonus;
use crate::registry::ResourceRequest;

/// A single agent as seen by a strategy: enough to rank it, nothing more.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: Uuid,
    pub current_builds: i32,
    pub max_builds: i32,
    pub system_info: Option<SystemInfo>,
    pub region: Option<String>,
}

impl Candidate {
    fn load(&self) -> f64 {
        if self.max_builds <= 0 {
            return 1.0;
        }
        self.current_builds as f64 / self.max_builds as f64
    }
}

/// Ranks candidate agents for a build and picks a winner. Implementations
/// must be deterministic for a fixed input so dispatch decisions are
/// reproducible in tests; ties are broken by candidate order, which is
/// otherwise unspecified (§9).
#[async_trait]
pub trait SchedulingStrategy: Send + Sync {
    /// Returns the id of the best candidate, or `None` if `candidates` is
    /// empty. `requested_region` optionally biases the score toward agents
    /// in a given region.
    fn select(&self, candidates: &[Candidate], resources: Option<ResourceRequest>) -> Option<Uuid> {
        self.select_with_region(candidates, resources, None)
    }

    /// Full form of [`select`](Self::select) taking an explicit requested
    /// region, used by callers that track locality separately from raw
    /// resource requirements.
    fn select_with_region(
        &self,
        candidates: &[Candidate],
        resources: Option<ResourceRequest>,
        requested_region: Option<&str>,
    ) -> Option<Uuid>;

    fn clone_box(&self) -> Box<dyn SchedulingStrategy>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn SchedulingStrategy) {}
};

/// Default strategy: rank purely by current load (ascending), ignoring
/// system info and region. Matches the teacher's "simplest thing that could
/// work" default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoadedStrategy;

#[async_trait]
impl SchedulingStrategy for LeastLoadedStrategy {
    fn select_with_region(
        &self,
        candidates: &[Candidate],
        _resources: Option<ResourceRequest>,
        _requested_region: Option<&str>,
    ) -> Option<Uuid> {
        candidates
            .iter()
            .min_by(|a, b| a.load().partial_cmp(&b.load()).unwrap_or(std::cmp::Ordering::Equal))
            .map(|c| c.id)
    }

    fn clone_box(&self) -> Box<dyn SchedulingStrategy> {
        Box::new(*self)
    }
}

/// Score weights from §4.1: 60% load, 20% CPU headroom, 20% memory headroom,
/// plus an additive locality bonus (§4.9) capped so it can never let a
/// hopelessly overloaded agent outrank an idle one by region alone.
const LOAD_WEIGHT: f64 = 0.6;
const CPU_WEIGHT: f64 = 0.2;
const MEM_WEIGHT: f64 = 0.2;
const CPU_REFERENCE: f64 = 16.0;
const MEM_REFERENCE_GB: f64 = 32.0;
const MAX_TOTAL_SCORE: f64 = 1.5;

/// Resource-aware strategy: scores candidates on load, CPU headroom, memory
/// headroom, and region locality. Gated behind the
/// `feature-flags.resource-aware-scheduling` config key (§6) rather than a
/// Cargo feature, since it is a runtime policy choice, not a build-time one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAwareStrategy;

impl ResourceAwareStrategy {
    fn score(&self, candidate: &Candidate, requested_region: Option<&str>) -> f64 {
        let load_score = (1.0 - candidate.load()).clamp(0.0, 1.0);

        let (cpu_score, mem_score) = match candidate.system_info {
            Some(info) => (
                (info.cpu_count as f64 / CPU_REFERENCE).min(1.0),
                (info.memory_gb / MEM_REFERENCE_GB).min(1.0),
            ),
            // No system info reported: treat as baseline capacity rather
            // than excluding the candidate outright.
            None => (0.5, 0.5),
        };

        let base = LOAD_WEIGHT * load_score + CPU_WEIGHT * cpu_score + MEM_WEIGHT * mem_score;
        let bonus = locality_bonus(candidate.region.as_deref(), requested_region);

        (base + bonus).min(MAX_TOTAL_SCORE)
    }
}

#[async_trait]
impl SchedulingStrategy for ResourceAwareStrategy {
    fn select_with_region(
        &self,
        candidates: &[Candidate],
        _resources: Option<ResourceRequest>,
        requested_region: Option<&str>,
    ) -> Option<Uuid> {
        candidates
            .iter()
            .max_by(|a, b| {
                self.score(a, requested_region)
                    .partial_cmp(&self.score(b, requested_region))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|c| c.id)
    }

    fn clone_box(&self) -> Box<dyn SchedulingStrategy> {
        Box::new(*self)
    }
}

/// Build the configured strategy. `resource_aware` mirrors the
/// `feature-flags.resource-aware-scheduling` config key.
pub fn strategy_for(resource_aware: bool) -> Box<dyn SchedulingStrategy> {
    if resource_aware {
        Box::new(ResourceAwareStrategy)
    } else {
        Box::new(LeastLoadedStrategy)
    }
}
