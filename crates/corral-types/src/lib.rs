// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by other Corral crates.
//!
//! This crate defines the identifiers, resource quantities, and lifecycle
//! vocabulary that the orchestration library, its configuration, and the
//! standalone binary all speak, so that each of them can use those types
//! without any layering oddities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod ids;

pub use ids::*;

/// The resources an instance consumes on (or a host offers to) the cluster.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Footprint {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl Footprint {
    pub const ZERO: Footprint =
        Footprint { vcpus: 0, memory_mib: 0, disk_gib: 0 };

    pub const fn new(vcpus: u32, memory_mib: u64, disk_gib: u64) -> Self {
        Self { vcpus, memory_mib, disk_gib }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns the sum of two footprints, or `None` if any dimension would
    /// overflow.
    pub fn checked_add(&self, other: &Footprint) -> Option<Footprint> {
        Some(Footprint {
            vcpus: self.vcpus.checked_add(other.vcpus)?,
            memory_mib: self.memory_mib.checked_add(other.memory_mib)?,
            disk_gib: self.disk_gib.checked_add(other.disk_gib)?,
        })
    }

    pub fn saturating_sub(&self, other: &Footprint) -> Footprint {
        Footprint {
            vcpus: self.vcpus.saturating_sub(other.vcpus),
            memory_mib: self.memory_mib.saturating_sub(other.memory_mib),
            disk_gib: self.disk_gib.saturating_sub(other.disk_gib),
        }
    }

    /// Returns true if every dimension of `self` is no larger than the
    /// corresponding dimension of `capacity`.
    pub fn fits_within(&self, capacity: &Footprint) -> bool {
        self.vcpus <= capacity.vcpus
            && self.memory_mib <= capacity.memory_mib
            && self.disk_gib <= capacity.disk_gib
    }

    /// Scales each dimension by an allocation ratio, rounding down.
    pub fn scaled(
        &self,
        cpu_ratio: f64,
        ram_ratio: f64,
        disk_ratio: f64,
    ) -> Self {
        Footprint {
            vcpus: (self.vcpus as f64 * cpu_ratio).floor() as u32,
            memory_mib: (self.memory_mib as f64 * ram_ratio).floor() as u64,
            disk_gib: (self.disk_gib as f64 * disk_ratio).floor() as u64,
        }
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vCPU/{} MiB/{} GiB",
            self.vcpus, self.memory_mib, self.disk_gib
        )
    }
}

/// The lifecycle state of a compute instance.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Building,
    Active,
    Rebooting,
    Rescued,
    Resizing,
    VerifyResize,
    Migrating,
    Paused,
    Suspended,
    Stopped,
    Deleting,
    SoftDeleted,
    Deleted,
    Error,
}

impl InstanceState {
    /// Returns true once the instance has been hard-deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(self, InstanceState::Deleted)
    }
}

/// The verb a lifecycle request asks the orchestrator to perform.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    Create,
    Reboot,
    Stop,
    Start,
    Rescue,
    Unrescue,
    Pause,
    Unpause,
    Suspend,
    Resume,
    Resize,
    ConfirmResize,
    RevertResize,
    Migrate,
    LiveMigrate,
    Evacuate,
    Backup,
    Lock,
    Unlock,
    Delete,
    Restore,
    ForceDelete,
    ResetState,
    AttachVolume,
    DetachVolume,
    AttachInterface,
    DetachInterface,
    AssociateFloatingIp,
    DisassociateFloatingIp,
}

/// How forcefully a reboot should be performed.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RebootKind {
    Soft,
    Hard,
}

/// Who placed a lock on an instance. Admin locks can only be removed by an
/// admin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedBy {
    Owner,
    Admin,
}

/// An opaque, client-supplied identifier for one lifecycle request. Requests
/// resubmitted with the same ID are answered from the action log rather than
/// executed twice.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

#[derive(Debug, Error)]
#[error("invalid request id {0:?}: {1}")]
pub struct RequestIdError(String, &'static str);

impl RequestId {
    const MAX_LEN: usize = 255;

    /// Generates a fresh request ID of the form `req-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the ID of a sub-request issued on behalf of this one.
    pub fn child(&self, suffix: impl fmt::Display) -> Self {
        let suffix = suffix.to_string();
        let keep = Self::MAX_LEN.saturating_sub(suffix.len() + 1);
        let mut prefix = self.0.clone();
        while prefix.len() > keep {
            prefix.pop();
        }
        Self(format!("{prefix}.{suffix}"))
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RequestIdError(s.to_owned(), "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(RequestIdError(s.to_owned(), "too long"));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RequestIdError(
                s.to_owned(),
                "must not contain whitespace",
            ));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for RequestId {
    type Error = RequestIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestId> for String {
    fn from(value: RequestId) -> Self {
        value.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The name of a cell. Cells are addressed by name; nesting is expressed by
/// each cell naming its parent.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct CellName(String);

#[derive(Debug, Error)]
#[error("invalid cell name {0:?}")]
pub struct CellNameError(String);

impl CellName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CellName {
    type Err = CellNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(CellNameError(s.to_owned()))
        }
    }
}

impl TryFrom<String> for CellName {
    type Error = CellNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellName> for String {
    fn from(value: CellName) -> Self {
        value.0
    }
}

impl fmt::Display for CellName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_arithmetic() {
        let a = Footprint::new(2, 2048, 20);
        let b = Footprint::new(1, 1024, 10);
        assert_eq!(a.checked_add(&b), Some(Footprint::new(3, 3072, 30)));
        assert_eq!(b.saturating_sub(&a), Footprint::ZERO);
        assert!(b.fits_within(&a));
        assert!(!a.fits_within(&b));
        assert!(Footprint::new(u32::MAX, 0, 0)
            .checked_add(&Footprint::new(1, 0, 0))
            .is_none());
    }

    #[test]
    fn footprint_scaling_rounds_down() {
        let f = Footprint::new(3, 1000, 10);
        assert_eq!(f.scaled(1.5, 1.0, 0.5), Footprint::new(4, 1000, 5));
    }

    #[test]
    fn instance_states_use_upper_snake_case() {
        assert_eq!(InstanceState::VerifyResize.to_string(), "VERIFY_RESIZE");
        assert_eq!(
            "SOFT_DELETED".parse::<InstanceState>().unwrap(),
            InstanceState::SoftDeleted
        );
        assert_eq!(
            serde_json::to_string(&InstanceState::Active).unwrap(),
            "\"ACTIVE\""
        );
    }

    #[test]
    fn request_ids_are_validated() {
        assert!("".parse::<RequestId>().is_err());
        assert!("req 1".parse::<RequestId>().is_err());
        let generated = RequestId::generate();
        assert!(generated.as_str().starts_with("req-"));
        let parsed: RequestId =
            serde_json::from_str("\"req-abc\"").expect("valid id");
        assert_eq!(parsed.as_str(), "req-abc");
        assert!(serde_json::from_str::<RequestId>("\"\"").is_err());
    }

    #[test]
    fn child_request_ids_stay_within_bounds() {
        let parent: RequestId = "req-abc".parse().unwrap();
        assert_eq!(parent.child(7).as_str(), "req-abc.7");

        let long: RequestId = "r".repeat(RequestId::MAX_LEN).parse().unwrap();
        let child = long.child("suffix");
        assert_eq!(child.as_str().len(), RequestId::MAX_LEN);
        assert!(child.as_str().parse::<RequestId>().is_ok());
    }

    #[test]
    fn cell_names_reject_separators() {
        assert!("cell-1".parse::<CellName>().is_ok());
        assert!("parent!child".parse::<CellName>().is_err());
        assert!("".parse::<CellName>().is_err());
    }
}
