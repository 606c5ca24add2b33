// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error type returned by every coordinator operation.

use serde::Serialize;
use thiserror::Error;

use crate::action_log::ActionLogError;
use crate::directory::DirectoryError;
use crate::instance::state_machine::DenyReason;
use crate::instance::store::StoreError;
use crate::inventory::InventoryError;
use crate::network::NetworkError;
use crate::scheduler::SchedulerError;
use crate::services::ServiceError;
use crate::volume_drivers::VolumeDriverError;

/// A typed failure that callers can distinguish without parsing messages.
///
/// Outcomes are recorded in the action log and replayed to clients that
/// resubmit a request ID, so this type is `Clone` and carries its detail as
/// text rather than as a chain of sources.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OrchestrationError {
    /// The request was malformed; nothing was changed.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Another task holds the instance, or the instance's state does not
    /// allow the request; nothing was changed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("No valid host was found: {0}")]
    NoValidHost(String),

    #[error("External service failed: {0}")]
    ExternalService(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The operation failed in a way that left the instance in `ERROR`.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl OrchestrationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

impl From<DenyReason> for OrchestrationError {
    fn from(value: DenyReason) -> Self {
        match value {
            DenyReason::AdminRequired(_) => Self::Validation(value.to_string()),
            _ => Self::Conflict(value.to_string()),
        }
    }
}

impl From<InventoryError> for OrchestrationError {
    fn from(value: InventoryError) -> Self {
        match value {
            InventoryError::HostNotFound(_)
            | InventoryError::ReservationNotFound(_) => {
                Self::NotFound(value.to_string())
            }
            InventoryError::InsufficientCapacity { .. } => {
                Self::InsufficientCapacity(value.to_string())
            }
            InventoryError::DuplicateHost(_)
            | InventoryError::HostInUse(_) => Self::Conflict(value.to_string()),
            InventoryError::ReservationExpired(_) => {
                Self::Fatal(value.to_string())
            }
        }
    }
}

impl From<DirectoryError> for OrchestrationError {
    fn from(value: DirectoryError) -> Self {
        match value {
            DirectoryError::CellNotFound(_)
            | DirectoryError::AggregateNotFound(_)
            | DirectoryError::HostNotFound(_) => {
                Self::NotFound(value.to_string())
            }
            DirectoryError::InvalidName(_) => {
                Self::Validation(value.to_string())
            }
            _ => Self::Conflict(value.to_string()),
        }
    }
}

impl From<SchedulerError> for OrchestrationError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::NoValidHost(_) => {
                Self::NoValidHost(value.to_string())
            }
            SchedulerError::UnknownFilter(_) => {
                Self::Validation(value.to_string())
            }
            SchedulerError::Inventory(e) => e.into(),
        }
    }
}

impl From<ServiceError> for OrchestrationError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NotFound(_) => Self::NotFound(value.to_string()),
            _ => Self::ExternalService(value.to_string()),
        }
    }
}

impl From<StoreError> for OrchestrationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::NotFound(value.to_string()),
            StoreError::Duplicate(_) => Self::Conflict(value.to_string()),
        }
    }
}

impl From<ActionLogError> for OrchestrationError {
    fn from(value: ActionLogError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<NetworkError> for OrchestrationError {
    fn from(value: NetworkError) -> Self {
        match value {
            NetworkError::AddressNotFound(_)
            | NetworkError::NotAssociated { .. } => {
                Self::NotFound(value.to_string())
            }
            NetworkError::InvalidRange(_) => {
                Self::Validation(value.to_string())
            }
            _ => Self::Conflict(value.to_string()),
        }
    }
}

impl From<VolumeDriverError> for OrchestrationError {
    fn from(value: VolumeDriverError) -> Self {
        Self::ExternalService(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_types::{ActionKind, InstanceState, InstanceUuid};

    #[test]
    fn deny_reasons_map_to_conflict_or_validation() {
        let err: OrchestrationError =
            DenyReason::TaskInProgress(ActionKind::Resize).into();
        assert!(matches!(err, OrchestrationError::Conflict(_)));

        let err: OrchestrationError = DenyReason::InvalidState {
            action: ActionKind::Start,
            state: InstanceState::Active,
        }
        .into();
        assert!(matches!(err, OrchestrationError::Conflict(_)));

        let err: OrchestrationError =
            DenyReason::AdminRequired(ActionKind::ResetState).into();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[test]
    fn transient_service_failures_are_external() {
        let err: OrchestrationError =
            ServiceError::Unavailable("agent".to_string()).into();
        assert!(matches!(err, OrchestrationError::ExternalService(_)));
        let err: OrchestrationError =
            ServiceError::NotFound("image".to_string()).into();
        assert!(matches!(err, OrchestrationError::NotFound(_)));
    }

    #[test]
    fn errors_serialize_with_their_kind() {
        let err: OrchestrationError =
            StoreError::NotFound(InstanceUuid::new_v4()).into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "not_found");
    }
}
