// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Floating IP bookkeeping.
//!
//! The network service performs the actual NAT plumbing; this table is the
//! coordinator's record of which instance, if any, owns each floating
//! address. Claiming an address is a compare-and-set under the table's lock,
//! so two instances racing for the same address cannot both win.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use corral_types::InstanceUuid;
use serde::Serialize;
use slog::{info, Logger};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Floating IP {0} already exists")]
    DuplicateAddress(IpAddr),

    #[error("Floating IP {0}")]
    AddressNotFound(IpAddr),

    #[error("Floating IP {address} is associated with instance {instance}")]
    AlreadyAssociated { address: IpAddr, instance: InstanceUuid },

    #[error("Floating IP {address} is not associated with instance {instance}")]
    NotAssociated { address: IpAddr, instance: InstanceUuid },

    #[error("Floating IP {0} is in use")]
    InUse(IpAddr),

    #[error("Invalid floating IP range: {0}")]
    InvalidRange(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FloatingIp {
    pub address: IpAddr,
    pub pool: String,
    pub instance: Option<InstanceUuid>,
}

pub struct FloatingIpTable {
    log: Logger,
    ips: Mutex<BTreeMap<IpAddr, FloatingIp>>,
}

impl FloatingIpTable {
    pub fn new(log: Logger) -> Self {
        Self { log, ips: Mutex::new(BTreeMap::new()) }
    }

    /// Adds `addresses` to `pool`. Either every address is added or none is.
    pub fn add_pool(
        &self,
        pool: &str,
        addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Result<usize, NetworkError> {
        if pool.is_empty() {
            return Err(NetworkError::InvalidRange(
                "pool name must not be empty".to_string(),
            ));
        }
        let addresses: Vec<IpAddr> = addresses.into_iter().collect();
        let mut ips = self.ips.lock().unwrap();
        for (i, address) in addresses.iter().enumerate() {
            if ips.contains_key(address) || addresses[..i].contains(address) {
                return Err(NetworkError::DuplicateAddress(*address));
            }
        }
        for address in &addresses {
            ips.insert(
                *address,
                FloatingIp {
                    address: *address,
                    pool: pool.to_string(),
                    instance: None,
                },
            );
        }
        info!(self.log, "added floating IPs";
              "pool" => pool,
              "count" => addresses.len());
        Ok(addresses.len())
    }

    /// Removes unassociated addresses. Fails without removing anything if
    /// any of them is unknown or in use.
    pub fn remove(&self, addresses: &[IpAddr]) -> Result<(), NetworkError> {
        let mut ips = self.ips.lock().unwrap();
        for address in addresses {
            match ips.get(address) {
                None => return Err(NetworkError::AddressNotFound(*address)),
                Some(ip) if ip.instance.is_some() => {
                    return Err(NetworkError::InUse(*address))
                }
                Some(_) => {}
            }
        }
        for address in addresses {
            ips.remove(address);
        }
        Ok(())
    }

    pub fn get(&self, address: IpAddr) -> Option<FloatingIp> {
        self.ips.lock().unwrap().get(&address).cloned()
    }

    pub fn list(&self, pool: Option<&str>) -> Vec<FloatingIp> {
        self.ips
            .lock()
            .unwrap()
            .values()
            .filter(|ip| pool.map_or(true, |p| ip.pool == p))
            .cloned()
            .collect()
    }

    /// Associates `address` with `instance`. Returns false if the instance
    /// already owned it.
    pub fn claim(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
    ) -> Result<bool, NetworkError> {
        let mut ips = self.ips.lock().unwrap();
        let ip = ips
            .get_mut(&address)
            .ok_or(NetworkError::AddressNotFound(address))?;
        match ip.instance {
            Some(owner) if owner == instance => Ok(false),
            Some(owner) => Err(NetworkError::AlreadyAssociated {
                address,
                instance: owner,
            }),
            None => {
                ip.instance = Some(instance);
                Ok(true)
            }
        }
    }

    /// Drops the association of `address` with `instance`.
    pub fn unclaim(
        &self,
        address: IpAddr,
        instance: InstanceUuid,
    ) -> Result<(), NetworkError> {
        let mut ips = self.ips.lock().unwrap();
        let ip = ips
            .get_mut(&address)
            .ok_or(NetworkError::AddressNotFound(address))?;
        if ip.instance != Some(instance) {
            return Err(NetworkError::NotAssociated { address, instance });
        }
        ip.instance = None;
        Ok(())
    }

    /// Drops every association held by `instance`.
    pub fn release_instance(&self, instance: InstanceUuid) -> Vec<IpAddr> {
        let mut ips = self.ips.lock().unwrap();
        ips.values_mut()
            .filter(|ip| ip.instance == Some(instance))
            .map(|ip| {
                ip.instance = None;
                ip.address
            })
            .collect()
    }

    pub fn associated_with(&self, instance: InstanceUuid) -> Vec<IpAddr> {
        self.ips
            .lock()
            .unwrap()
            .values()
            .filter(|ip| ip.instance == Some(instance))
            .map(|ip| ip.address)
            .collect()
    }
}
