// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Soft placement preferences. Each weigher returns a score in `[-1, 1]`
//! which the scheduler scales by the weigher's configured multiplier.

use super::{FilterContext, HostCandidate};

pub trait HostWeigher: Send + Sync {
    fn name(&self) -> &'static str;

    fn weigh(&self, host: &HostCandidate, ctx: &FilterContext<'_>) -> f64;
}

/// Prefers hosts with the most room left after the request is placed,
/// averaged over vCPU, memory, and disk.
pub struct SpareCapacityWeigher;

fn spare_ratio(total: u64, used: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(used) as f64 / total as f64
}

impl HostWeigher for SpareCapacityWeigher {
    fn name(&self) -> &'static str {
        "spare_capacity"
    }

    fn weigh(&self, host: &HostCandidate, ctx: &FilterContext<'_>) -> f64 {
        let usage = &host.info.usage;
        let used = usage.in_use();
        let wanted = &ctx.spec.footprint;
        let ratios = [
            spare_ratio(
                usage.total.vcpus.into(),
                u64::from(used.vcpus) + u64::from(wanted.vcpus),
            ),
            spare_ratio(
                usage.total.memory_mib,
                used.memory_mib.saturating_add(wanted.memory_mib),
            ),
            spare_ratio(
                usage.total.disk_gib,
                used.disk_gib.saturating_add(wanted.disk_gib),
            ),
        ];
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }
}

/// Scores hosts by the soft affinity and anti-affinity hints: `1` for a host
/// running an instance the request wants to be near, `-1` for one running an
/// instance it wants to avoid.
pub struct AffinityWeigher;

impl HostWeigher for AffinityWeigher {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn weigh(&self, host: &HostCandidate, ctx: &FilterContext<'_>) -> f64 {
        let id = &host.info.id;
        let mut score = 0.0;
        if ctx.hints.soft_affinity.contains(id) {
            score += 1.0;
        }
        if ctx.hints.soft_anti_affinity.contains(id) {
            score -= 1.0;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_types::{Footprint, HostUuid, InstanceUuid};

    use crate::directory::Directory;
    use crate::inventory::{HostInfo, HostUsage};
    use crate::scheduler::{RequestSpec, SchedulerHints};

    fn candidate(committed: Footprint) -> HostCandidate {
        HostCandidate {
            info: HostInfo {
                id: HostUuid::new_v4(),
                name: "h".to_string(),
                cell: "root".parse().unwrap(),
                capabilities: Default::default(),
                enabled: true,
                disabled_reason: None,
                maintenance: false,
                forced_down: false,
                up: true,
                usage: HostUsage {
                    total: Footprint::new(4, 4000, 40),
                    committed,
                    reserved: Footprint::ZERO,
                },
            },
            metadata: Default::default(),
            availability_zone: "nova".to_string(),
        }
    }

    #[test]
    fn emptier_hosts_weigh_more() {
        let directory = Directory::new(
            "nova".to_string(),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        let spec = RequestSpec::new(
            InstanceUuid::new_v4(),
            Footprint::new(1, 1000, 10),
        );
        let hints = SchedulerHints::default();
        let ctx = FilterContext {
            spec: &spec,
            hints: &hints,
            directory: &directory,
        };

        let empty = candidate(Footprint::ZERO);
        let busy = candidate(Footprint::new(2, 2000, 20));
        let w = SpareCapacityWeigher;
        assert!((w.weigh(&empty, &ctx) - 0.75).abs() < f64::EPSILON);
        assert!((w.weigh(&busy, &ctx) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn affinity_hints_pull_and_push() {
        let directory = Directory::new(
            "nova".to_string(),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        let spec = RequestSpec::new(InstanceUuid::new_v4(), Footprint::ZERO);
        let near = candidate(Footprint::ZERO);
        let far = candidate(Footprint::ZERO);
        let mut hints = SchedulerHints::default();
        hints.soft_affinity.insert(near.info.id);
        hints.soft_anti_affinity.insert(far.info.id);
        let ctx = FilterContext {
            spec: &spec,
            hints: &hints,
            directory: &directory,
        };
        assert_eq!(AffinityWeigher.weigh(&near, &ctx), 1.0);
        assert_eq!(AffinityWeigher.weigh(&far, &ctx), -1.0);
    }
}
