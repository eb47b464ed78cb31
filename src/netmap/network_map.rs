use crate::netmap::host::Host;
use crate::netmap::mac::identity_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Hosts of one scan session, keyed by MAC address.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NetworkMap {
    pub hosts: BTreeMap<String, Host>,
}

impl NetworkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, mac: &str) -> Option<&Host> {
        self.hosts.get(&identity_key(mac))
    }

    pub fn get_mut(&mut self, mac: &str) -> Option<&mut Host> {
        self.hosts.get_mut(&identity_key(mac))
    }

    /// Returns the host for `mac`, creating an empty one if it was never seen.
    pub fn host_entry(&mut self, mac: &str) -> &mut Host {
        let key = identity_key(mac);
        self.hosts
            .entry(key.clone())
            .or_insert_with(|| Host::new(&key))
    }

    /// Folds a possibly partial host record into the session map.
    /// A record without MAC falls back to a synthetic `ip:<addr>` identity.
    /// Returns the identity the record was stored under.
    pub fn merge_observation(&mut self, mut observation: Host) -> Option<String> {
        let key = if !observation.mac_address.trim().is_empty() {
            identity_key(&observation.mac_address)
        } else if let Some(ip) = observation.primary_ip() {
            format!("ip:{}", ip)
        } else {
            warn!("Dropping host observation without MAC or IP address");
            return None;
        };
        observation.mac_address = key.clone();

        match self.hosts.get_mut(&key) {
            Some(existing) => {
                trace!("Merging observation into known host {}", key);
                existing.merge(observation);
            }
            None => {
                trace!("New host {}", key);
                self.hosts.insert(key.clone(), observation);
            }
        }
        Some(key)
    }

    pub fn merge(&mut self, other: NetworkMap) {
        for (_, host) in other.hosts {
            self.merge_observation(host);
        }
    }
}
