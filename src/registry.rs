//! # Device-Id Registry
//!
//! Global device ids `1..=254` are handed out in contiguous ranges, one per
//! link, in discovery order. The registry is an ordered list of
//! `(range, owner)` entries; at most 254 ranges exist, so lookups scan
//! linearly. Links that reported no units are tracked without a range so they
//! can still be closed on shutdown.

use crate::constants::{FIRST_DEVICE_ID, MAX_DEVICE_ID};
use std::fmt;

/// Inclusive range of global device ids owned by one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRange {
    pub start: u8,
    pub end: u8,
}

impl DeviceRange {
    pub fn contains(&self, device_id: u8) -> bool {
        (self.start..=self.end).contains(&device_id)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Ranges always hold at least one id.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The unit id the device uses for a global id in this range.
    pub fn local_id(&self, device_id: u8) -> u8 {
        device_id - self.start + 1
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> {
        self.start..=self.end
    }
}

impl fmt::Display for DeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[derive(Debug)]
struct Entry<H> {
    range: Option<DeviceRange>,
    owner: H,
}

/// Maps global device ids to the link that owns them.
#[derive(Debug)]
pub struct DeviceRegistry<H> {
    entries: Vec<Entry<H>>,
    /// Kept wider than u8 so a full space reads as 255, not 0.
    next_device_id: u16,
}

impl<H> Default for DeviceRegistry<H> {
    fn default() -> Self {
        DeviceRegistry {
            entries: Vec::new(),
            next_device_id: FIRST_DEVICE_ID as u16,
        }
    }
}

impl<H: Clone> DeviceRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids still available.
    pub fn remaining(&self) -> usize {
        (MAX_DEVICE_ID as usize + 1).saturating_sub(self.next_device_id as usize)
    }

    /// Records a link with `units` devices, assigning the next contiguous range.
    ///
    /// Returns the range and how many units it covers, which is fewer than
    /// requested when the id space runs out. A link with no units (or no space
    /// left) is tracked without a range.
    pub fn register(&mut self, owner: H, units: usize) -> Option<DeviceRange> {
        let granted = units.min(self.remaining());
        let range = (granted > 0).then(|| {
            let start = self.next_device_id as u8;
            let end = (self.next_device_id as usize + granted - 1) as u8;
            DeviceRange { start, end }
        });
        if let Some(range) = range {
            self.next_device_id = range.end as u16 + 1;
        }
        self.entries.push(Entry { range, owner });
        range
    }

    /// Resolves a global id to the owning link and the device's local unit id.
    pub fn find(&self, device_id: u8) -> Option<(u8, H)> {
        self.entries.iter().find_map(|entry| {
            entry
                .range
                .filter(|range| range.contains(device_id))
                .map(|range| (range.local_id(device_id), entry.owner.clone()))
        })
    }

    /// Every assigned global id with its owner, in id order.
    pub fn all(&self) -> Vec<(u8, H)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.range.map(|range| (range, &entry.owner)))
            .flat_map(|(range, owner)| range.ids().map(move |id| (id, owner.clone())))
            .collect()
    }

    pub fn ranges(&self) -> Vec<DeviceRange> {
        self.entries.iter().filter_map(|entry| entry.range).collect()
    }

    pub fn total_device_count(&self) -> u8 {
        (self.next_device_id - FIRST_DEVICE_ID as u16) as u8
    }

    /// Links tracked, including those without devices.
    pub fn owner_count(&self) -> usize {
        self.entries.len()
    }

    /// Empties the registry and resets numbering, returning every owner.
    pub fn drain(&mut self) -> Vec<H> {
        self.next_device_id = FIRST_DEVICE_ID as u16;
        self.entries.drain(..).map(|entry| entry.owner).collect()
    }
}
