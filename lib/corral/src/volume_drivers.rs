// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume connection drivers.
//!
//! When the volume service hands back connection info, its
//! `driver_volume_type` names the driver that knows how to interpret the rest
//! of it. The [`VolumeDriverRegistry`] is built once at startup from the
//! configured driver names and passed to whoever needs to resolve drivers.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::services::ConnectionInfo;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VolumeDriverError {
    #[error("No volume driver is registered for {0:?}")]
    UnknownDriver(String),

    #[error("Driver {driver} needs connection field {field:?}")]
    MissingField { driver: &'static str, field: &'static str },
}

/// Interprets one kind of volume connection.
pub trait VolumeDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fields that must be present in the connection data.
    fn required_fields(&self) -> &'static [&'static str];

    /// Checks the connection info and returns a description of the device the
    /// host will present to the guest.
    fn connect(
        &self,
        info: &ConnectionInfo,
    ) -> Result<String, VolumeDriverError> {
        for &field in self.required_fields() {
            if !info.data.contains_key(field) {
                return Err(VolumeDriverError::MissingField {
                    driver: self.name(),
                    field,
                });
            }
        }
        let target = self
            .required_fields()
            .iter()
            .filter_map(|f| info.data.get(*f))
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        Ok(format!("{}:{}", self.name(), target))
    }
}

macro_rules! simple_driver {
    ($ty:ident, $name:literal, [$($field:literal),*]) => {
        pub struct $ty;

        impl VolumeDriver for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn required_fields(&self) -> &'static [&'static str] {
                &[$($field),*]
            }
        }
    };
}

simple_driver!(IscsiDriver, "iscsi", ["target_portal", "target_iqn"]);
simple_driver!(NfsDriver, "nfs", ["export"]);
simple_driver!(RbdDriver, "rbd", ["name"]);
simple_driver!(LocalDriver, "local", ["device_path"]);

type DriverCtor = fn() -> Arc<dyn VolumeDriver>;

fn constructors() -> BTreeMap<&'static str, DriverCtor> {
    let mut map: BTreeMap<&'static str, DriverCtor> = BTreeMap::new();
    map.insert("iscsi", || Arc::new(IscsiDriver));
    map.insert("nfs", || Arc::new(NfsDriver));
    map.insert("rbd", || Arc::new(RbdDriver));
    map.insert("local", || Arc::new(LocalDriver));
    map
}

pub struct VolumeDriverRegistry {
    drivers: BTreeMap<String, Arc<dyn VolumeDriver>>,
}

impl VolumeDriverRegistry {
    /// Builds a registry containing the named drivers.
    pub fn new(names: &[String]) -> Result<Self, VolumeDriverError> {
        let ctors = constructors();
        let mut drivers = BTreeMap::new();
        for name in names {
            let ctor = ctors
                .get(name.as_str())
                .ok_or_else(|| VolumeDriverError::UnknownDriver(name.clone()))?;
            drivers.insert(name.clone(), ctor());
        }
        Ok(Self { drivers })
    }

    pub fn register(&mut self, driver: Arc<dyn VolumeDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(
        &self,
        driver_volume_type: &str,
    ) -> Result<&Arc<dyn VolumeDriver>, VolumeDriverError> {
        self.drivers.get(driver_volume_type).ok_or_else(|| {
            VolumeDriverError::UnknownDriver(driver_volume_type.to_string())
        })
    }

    /// Resolves the driver for `info` and connects through it.
    pub fn connect(
        &self,
        info: &ConnectionInfo,
    ) -> Result<String, VolumeDriverError> {
        self.get(&info.driver_volume_type)?.connect(info)
    }
}
