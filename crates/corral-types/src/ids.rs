// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed UUIDs for the objects Corral tracks.
//!
//! Every kind of object gets its own marker type so that, for example, a host
//! ID can never be passed where an instance ID is expected.

use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};

pub use newtype_uuid::GenericUuid;

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:literal as $alias:ident),* $(,)?) => {
        $(
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    const TAG: TypedUuidTag = TypedUuidTag::new($tag);
                    TAG
                }
            }

            pub type $alias = TypedUuid<$kind>;
        )*
    };
}

impl_typed_uuid_kind! {
    InstanceKind => "instance" as InstanceUuid,
    HostKind => "host" as HostUuid,
    AggregateKind => "aggregate" as AggregateUuid,
    ReservationKind => "reservation" as ReservationUuid,
    ActionKindTag => "action" as ActionUuid,
    ImageKind => "image" as ImageUuid,
    VolumeKind => "volume" as VolumeUuid,
    PortKind => "port" as PortUuid,
}
