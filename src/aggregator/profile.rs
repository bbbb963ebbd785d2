// =============================================================================
// Market Profile — per-session price histogram in one-pip buckets
// =============================================================================
//
// Levels are fixed-width buckets keyed by an integer bucket index so the map
// stays sorted by price. A tick contributes to `volume` always and to
// buy/sell volume only when its direction is non-flat, so for every level
// `volume >= buy_volume + sell_volume` and `delta == buy_volume - sell_volume`.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::TickDirection;

/// One profile level in wire form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileLevel {
    pub price: f64,
    pub volume: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
    pub delta: i64,
}

/// A changed-bucket entry for incremental tick frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDeltaLevel {
    pub price: f64,
    pub volume: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LevelCounts {
    volume: u64,
    buy: u64,
    sell: u64,
}

#[derive(Debug)]
pub struct MarketProfile {
    /// Bucket width in price units (one pip).
    bucket_width: f64,
    levels: BTreeMap<i64, LevelCounts>,
    /// Buckets touched since the last `take_dirty`.
    dirty: BTreeSet<i64>,
}

impl MarketProfile {
    pub fn new(bucket_width: f64) -> Self {
        Self {
            bucket_width,
            levels: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    fn bucket_index(&self, price: f64) -> i64 {
        (price / self.bucket_width).round() as i64
    }

    fn bucket_center(&self, index: i64) -> f64 {
        index as f64 * self.bucket_width
    }

    /// Record one tick at `price` with the given direction.
    pub fn record(&mut self, price: f64, direction: TickDirection) {
        let index = self.bucket_index(price);
        let counts = self.levels.entry(index).or_default();
        counts.volume += 1;
        match direction {
            TickDirection::Up => counts.buy += 1,
            TickDirection::Down => counts.sell += 1,
            TickDirection::Flat => {}
        }
        self.dirty.insert(index);
    }

    /// Full snapshot, sorted by price ascending.
    pub fn levels(&self) -> Vec<ProfileLevel> {
        self.levels
            .iter()
            .map(|(&index, counts)| ProfileLevel {
                price: self.bucket_center(index),
                volume: counts.volume,
                buy_volume: counts.buy,
                sell_volume: counts.sell,
                delta: counts.buy as i64 - counts.sell as i64,
            })
            .collect()
    }

    /// Drain the buckets changed since the previous call, sorted by price.
    pub fn take_dirty(&mut self) -> Vec<ProfileDeltaLevel> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|index| {
                self.levels.get(&index).map(|counts| ProfileDeltaLevel {
                    price: self.bucket_center(index),
                    volume: counts.volume,
                    buy_volume: counts.buy,
                    sell_volume: counts.sell,
                })
            })
            .collect()
    }

    /// Wipe all levels at session rollover.
    pub fn clear(&mut self) {
        self.levels.clear();
        self.dirty.clear();
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
