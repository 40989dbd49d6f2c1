//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Per-vehicle address book with a reverse `(medium, address)` index.

use std::collections::{BTreeMap, HashMap};

use flock_msg::{Address, Source};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};

/// Result of a successful [`AddressRegistry::record_or_verify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressUpdate {
    /// First address seen on this medium; stored and indexed.
    Recorded,
    /// Same address as already stored.
    Unchanged,
}

#[derive(Debug, Default)]
struct AddressTables {
    by_vehicle: HashMap<String, BTreeMap<String, Address>>,
    by_source: HashMap<Source, String>,
}

/// Tracks which address each vehicle uses on each medium.
///
/// Addresses are write-once per `(vehicle, medium)`. Forward and reverse maps
/// sit behind one lock so they never disagree.
#[derive(Debug)]
pub struct AddressRegistry {
    preferred_media: Vec<String>,
    tables: Mutex<AddressTables>,
}

impl AddressRegistry {
    /// Create a registry that prefers media in the given order for sends.
    pub fn new(preferred_media: Vec<String>) -> Self {
        Self {
            preferred_media,
            tables: Mutex::new(AddressTables::default()),
        }
    }

    /// Store the address on first sight, accept repeats, reject changes.
    pub fn record_or_verify(
        &self,
        vehicle: &str,
        medium: &str,
        address: &Address,
    ) -> Result<AddressUpdate> {
        let mut tables = self.tables.lock();

        if let Some(existing) = tables.by_vehicle.get(vehicle).and_then(|m| m.get(medium)) {
            if existing == address {
                return Ok(AddressUpdate::Unchanged);
            }
            warn!(vehicle, medium, existing = %existing, incoming = %address, "address conflict");
            return Err(DriverError::AddressConflict {
                vehicle: vehicle.to_owned(),
                medium: medium.to_owned(),
                existing: existing.clone(),
                incoming: address.clone(),
            });
        }

        let source = Source::new(medium, address.clone());
        if let Some(owner) = tables.by_source.get(&source) {
            if owner != vehicle {
                warn!(vehicle, medium, address = %address, owner = %owner, "address already claimed");
                return Err(DriverError::AddressInUse {
                    medium: medium.to_owned(),
                    address: address.clone(),
                    owner: owner.clone(),
                    claimant: vehicle.to_owned(),
                });
            }
        }

        tables
            .by_vehicle
            .entry(vehicle.to_owned())
            .or_default()
            .insert(medium.to_owned(), address.clone());
        tables.by_source.insert(source, vehicle.to_owned());
        info!(vehicle, medium, address = %address, "vehicle address recorded");
        Ok(AddressUpdate::Recorded)
    }

    /// Best medium and address for sending to the vehicle.
    pub fn preferred_address(&self, vehicle: &str) -> Result<Source> {
        let tables = self.tables.lock();
        let known = tables.by_vehicle.get(vehicle);
        for medium in &self.preferred_media {
            if let Some(address) = known.and_then(|m| m.get(medium)) {
                return Ok(Source::new(medium.clone(), address.clone()));
            }
        }
        Err(DriverError::NoKnownAddress(vehicle.to_owned()))
    }

    /// Vehicle currently bound to the source, if any.
    pub fn resolve_by_source(&self, source: &Source) -> Option<String> {
        self.tables.lock().by_source.get(source).cloned()
    }

    /// Snapshot of all addresses known for the vehicle, keyed by medium.
    pub fn addresses_of(&self, vehicle: &str) -> BTreeMap<String, Address> {
        self.tables
            .lock()
            .by_vehicle
            .get(vehicle)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every address of the vehicle from both maps.
    pub fn forget(&self, vehicle: &str) -> usize {
        let mut tables = self.tables.lock();
        let Some(media) = tables.by_vehicle.remove(vehicle) else {
            return 0;
        };
        for (medium, address) in &media {
            tables.by_source.remove(&Source::new(medium.clone(), address.clone()));
        }
        debug!(vehicle, removed = media.len(), "vehicle addresses forgotten");
        media.len()
    }
}
