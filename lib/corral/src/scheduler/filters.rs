// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hard placement constraints.
//!
//! Each filter answers one yes/no question about a candidate host. Filters are
//! looked up by name in a [`FilterRegistry`] when the scheduler is built, so a
//! deployment chooses its filter chain in configuration.

use std::collections::BTreeMap;

use super::{FilterContext, HostCandidate, SchedulerError};

/// Extra-spec scope matched against aggregate metadata.
pub const AGGREGATE_SCOPE: &str = "aggregate_instance_extra_specs";

/// Extra-spec scope matched against host capabilities.
pub const CAPABILITIES_SCOPE: &str = "capabilities";

pub trait HostFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn host_passes(&self, host: &HostCandidate, ctx: &FilterContext<'_>)
        -> bool;
}

type FilterCtor = fn() -> Box<dyn HostFilter>;

/// Maps filter names to constructors.
pub struct FilterRegistry {
    constructors: BTreeMap<&'static str, FilterCtor>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self { constructors: BTreeMap::new() }
    }

    /// Returns a registry holding every filter this crate provides.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("compute", || Box::new(ComputeFilter));
        registry.register("capacity", || Box::new(CapacityFilter));
        registry.register("availability_zone", || {
            Box::new(AvailabilityZoneFilter)
        });
        registry.register("aggregate_metadata", || {
            Box::new(AggregateMetadataFilter)
        });
        registry.register("capabilities", || Box::new(CapabilitiesFilter));
        registry.register("cell", || Box::new(CellFilter));
        registry.register("ignore_hosts", || Box::new(IgnoreHostsFilter));
        registry.register("same_host", || Box::new(SameHostFilter));
        registry.register("different_host", || Box::new(DifferentHostFilter));
        registry
    }

    pub fn register(&mut self, name: &'static str, ctor: FilterCtor) {
        self.constructors.insert(name, ctor);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Instantiates the named filters, in order.
    pub fn build(
        &self,
        names: &[String],
    ) -> Result<Vec<Box<dyn HostFilter>>, SchedulerError> {
        names
            .iter()
            .map(|name| {
                self.constructors
                    .get(name.as_str())
                    .map(|ctor| ctor())
                    .ok_or_else(|| SchedulerError::UnknownFilter(name.clone()))
            })
            .collect()
    }
}

/// Splits `scope:key` into its parts. Unscoped keys return `None` as scope.
fn split_scope(key: &str) -> (Option<&str>, &str) {
    match key.split_once(':') {
        Some((scope, rest)) => (Some(scope), rest),
        None => (None, key),
    }
}

/// Passes hosts whose service is enabled, up, and not in maintenance.
pub struct ComputeFilter;

impl HostFilter for ComputeFilter {
    fn name(&self) -> &'static str {
        "compute"
    }

    fn host_passes(&self, host: &HostCandidate, _: &FilterContext<'_>) -> bool {
        host.info.accepts_new_work()
    }
}

/// Passes hosts with enough free capacity in every dimension. The inventory
/// re-checks this under the host lock when the reservation is made.
pub struct CapacityFilter;

impl HostFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        host.info.usage.can_fit(&ctx.spec.footprint)
    }
}

pub struct AvailabilityZoneFilter;

impl HostFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "availability_zone"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        match &ctx.spec.availability_zone {
            Some(zone) => &host.availability_zone == zone,
            None => true,
        }
    }
}

/// Matches unscoped and `aggregate_instance_extra_specs:` extra specs against
/// the metadata of the host's aggregates.
pub struct AggregateMetadataFilter;

impl HostFilter for AggregateMetadataFilter {
    fn name(&self) -> &'static str {
        "aggregate_metadata"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        ctx.spec.extra_specs.iter().all(|(key, wanted)| {
            let key = match split_scope(key) {
                (None, key) => key,
                (Some(AGGREGATE_SCOPE), key) => key,
                (Some(_), _) => return true,
            };
            host.metadata.get(key).is_some_and(|values| values.contains(wanted))
        })
    }
}

/// Matches `capabilities:` extra specs against host capabilities, and the
/// image's `hypervisor_type` property against the host's.
pub struct CapabilitiesFilter;

impl HostFilter for CapabilitiesFilter {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        let caps = &host.info.capabilities;
        let specs_match = ctx.spec.extra_specs.iter().all(|(key, wanted)| {
            match split_scope(key) {
                (Some(CAPABILITIES_SCOPE), key) => {
                    caps.get(key) == Some(wanted)
                }
                _ => true,
            }
        });
        let image = &ctx.spec.image_properties;
        let image_matches = match image.get("hypervisor_type") {
            Some(wanted) => caps.get("hypervisor_type") == Some(wanted),
            None => true,
        };
        specs_match && image_matches
    }
}

/// Restricts placement to a cell and its children.
pub struct CellFilter;

impl HostFilter for CellFilter {
    fn name(&self) -> &'static str {
        "cell"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        match &ctx.spec.cell {
            Some(cell) => ctx.directory.cell_within(&host.info.cell, cell),
            None => true,
        }
    }
}

/// Applies the `ignore_hosts` and `force_hosts` hints.
pub struct IgnoreHostsFilter;

impl HostFilter for IgnoreHostsFilter {
    fn name(&self) -> &'static str {
        "ignore_hosts"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        let hints = ctx.hints;
        !hints.ignore_hosts.contains(&host.info.id)
            && (hints.force_hosts.is_empty()
                || hints.force_hosts.contains(&host.info.id))
    }
}

/// Requires the host to already run one of the hinted instances.
pub struct SameHostFilter;

impl HostFilter for SameHostFilter {
    fn name(&self) -> &'static str {
        "same_host"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        ctx.hints.same_host.is_empty()
            || ctx.hints.same_host.contains(&host.info.id)
    }
}

/// Requires the host to run none of the hinted instances.
pub struct DifferentHostFilter;

impl HostFilter for DifferentHostFilter {
    fn name(&self) -> &'static str {
        "different_host"
    }

    fn host_passes(
        &self,
        host: &HostCandidate,
        ctx: &FilterContext<'_>,
    ) -> bool {
        !ctx.hints.different_host.contains(&host.info.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use corral_types::{CellName, Footprint, HostUuid, InstanceUuid};

    use crate::directory::Directory;
    use crate::inventory::{HostInfo, HostUsage};
    use crate::scheduler::{RequestSpec, SchedulerHints};

    fn candidate() -> HostCandidate {
        HostCandidate {
            info: HostInfo {
                id: HostUuid::new_v4(),
                name: "h1".to_string(),
                cell: "root".parse().unwrap(),
                capabilities: [(
                    "hypervisor_type".to_string(),
                    "kvm".to_string(),
                )]
                .into(),
                enabled: true,
                disabled_reason: None,
                maintenance: false,
                forced_down: false,
                up: true,
                usage: HostUsage {
                    total: Footprint::new(4, 4096, 40),
                    committed: Footprint::new(2, 1024, 10),
                    reserved: Footprint::ZERO,
                },
            },
            metadata: [(
                "ssd".to_string(),
                BTreeSet::from(["true".to_string()]),
            )]
            .into(),
            availability_zone: "nova".to_string(),
        }
    }

    fn spec() -> RequestSpec {
        RequestSpec::new(InstanceUuid::new_v4(), Footprint::new(1, 512, 5))
    }

    fn passes(
        filter: &dyn HostFilter,
        host: &HostCandidate,
        spec: &RequestSpec,
        hints: &SchedulerHints,
    ) -> bool {
        let directory = Directory::new(
            "nova".to_string(),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        let root: CellName = "root".parse().unwrap();
        directory.create_cell(root.clone(), None).unwrap();
        directory
            .create_cell("child".parse().unwrap(), Some(root))
            .unwrap();
        filter.host_passes(
            host,
            &FilterContext { spec, hints, directory: &directory },
        )
    }

    #[test]
    fn unknown_filter_names_are_rejected() {
        let registry = FilterRegistry::builtin();
        assert_eq!(registry.names().count(), 9);
        assert!(matches!(
            registry.build(&["compute".to_string(), "bogus".to_string()]),
            Err(SchedulerError::UnknownFilter(name)) if name == "bogus"
        ));
    }

    #[test]
    fn compute_filter_skips_disabled_and_maintenance_hosts() {
        let hints = SchedulerHints::default();
        let mut host = candidate();
        assert!(passes(&ComputeFilter, &host, &spec(), &hints));
        host.info.enabled = false;
        assert!(!passes(&ComputeFilter, &host, &spec(), &hints));
        host.info.enabled = true;
        host.info.maintenance = true;
        assert!(!passes(&ComputeFilter, &host, &spec(), &hints));
        host.info.maintenance = false;
        host.info.up = false;
        assert!(!passes(&ComputeFilter, &host, &spec(), &hints));
    }

    #[test]
    fn capacity_filter_checks_every_dimension() {
        let hints = SchedulerHints::default();
        let host = candidate();
        let mut s = spec();
        assert!(passes(&CapacityFilter, &host, &s, &hints));
        s.footprint = Footprint::new(1, 1, 31);
        assert!(!passes(&CapacityFilter, &host, &s, &hints));
    }

    #[test]
    fn aggregate_metadata_filter_honours_scopes() {
        let hints = SchedulerHints::default();
        let host = candidate();
        let mut s = spec();
        s.extra_specs.insert("ssd".to_string(), "true".to_string());
        assert!(passes(&AggregateMetadataFilter, &host, &s, &hints));

        s.extra_specs.insert(
            "aggregate_instance_extra_specs:gpu".to_string(),
            "yes".to_string(),
        );
        assert!(!passes(&AggregateMetadataFilter, &host, &s, &hints));

        let mut s = spec();
        s.extra_specs.insert(
            "capabilities:hypervisor_type".to_string(),
            "xen".to_string(),
        );
        assert!(passes(&AggregateMetadataFilter, &host, &s, &hints));
        assert!(!passes(&CapabilitiesFilter, &host, &s, &hints));
    }

    #[test]
    fn capabilities_filter_matches_image_hypervisor() {
        let hints = SchedulerHints::default();
        let host = candidate();
        let mut s = spec();
        s.image_properties
            .insert("hypervisor_type".to_string(), "kvm".to_string());
        assert!(passes(&CapabilitiesFilter, &host, &s, &hints));
        s.image_properties
            .insert("hypervisor_type".to_string(), "qemu".to_string());
        assert!(!passes(&CapabilitiesFilter, &host, &s, &hints));
    }

    #[test]
    fn cell_filter_accepts_parent_cells() {
        let hints = SchedulerHints::default();
        let mut host = candidate();
        host.info.cell = "child".parse().unwrap();
        let mut s = spec();
        s.cell = Some("root".parse().unwrap());
        assert!(passes(&CellFilter, &host, &s, &hints));

        host.info.cell = "root".parse().unwrap();
        s.cell = Some("child".parse().unwrap());
        assert!(!passes(&CellFilter, &host, &s, &hints));
    }

    #[test]
    fn host_hints_include_and_exclude() {
        let host = candidate();
        let other = HostUuid::new_v4();
        let mut hints = SchedulerHints::default();
        assert!(passes(&SameHostFilter, &host, &spec(), &hints));

        hints.same_host.insert(other);
        assert!(!passes(&SameHostFilter, &host, &spec(), &hints));
        hints.different_host.insert(host.info.id);
        assert!(!passes(&DifferentHostFilter, &host, &spec(), &hints));

        hints.force_hosts.insert(other);
        assert!(!passes(&IgnoreHostsFilter, &host, &spec(), &hints));
        hints.force_hosts.insert(host.info.id);
        assert!(passes(&IgnoreHostsFilter, &host, &spec(), &hints));
        hints.ignore_hosts.insert(host.info.id);
        assert!(!passes(&IgnoreHostsFilter, &host, &spec(), &hints));
    }
}
