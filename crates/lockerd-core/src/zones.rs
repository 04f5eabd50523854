//! Zone table: validation, range merging, and the extension hook.
//!
//! A zone maps a slice of locker ids onto an ordered list of 16-relay cards.
//! The rules enforced here:
//!
//! - ranges within a zone are ascending and disjoint,
//! - enabled zones never overlap in locker ids,
//! - enabled zones never share a relay card,
//! - covered lockers must equal 16 × relay cards.
//!
//! The extension hook runs after hardware config edits: it stretches the
//! last enabled zone to cover new lockers and pulls extra relay cards from
//! the hardware free pool, refusing when the pool runs dry.

use serde::{Deserialize, Serialize};

use crate::error::ZoneError;
use crate::frame::MAX_SLAVE;

/// Lockers served by one relay card.
pub const LOCKERS_PER_CARD: i64 = 16;

fn default_enabled() -> bool {
    true
}

/// A named slice of locker ids served by a fixed set of slaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Zone {
    pub id: String,
    /// Inclusive `[start, end]` intervals, ascending and disjoint.
    pub ranges: Vec<[i64; 2]>,
    /// Modbus slave addresses, in card order.
    pub relay_cards: Vec<u8>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Zone {
    /// Whether the zone covers a locker id.
    #[must_use]
    pub fn contains(&self, locker_id: i64) -> bool {
        self.ranges
            .iter()
            .any(|&[start, end]| (start..=end).contains(&locker_id))
    }

    /// Total lockers covered.
    #[must_use]
    pub fn locker_count(&self) -> i64 {
        self.ranges.iter().map(|&[start, end]| end - start + 1).sum()
    }

    /// 1-based position of a locker within the zone: widths of earlier
    /// ranges plus the offset inside the containing range.
    #[must_use]
    pub fn position_of(&self, locker_id: i64) -> Option<i64> {
        let mut before = 0i64;
        for &[start, end] in &self.ranges {
            if (start..=end).contains(&locker_id) {
                return Some(before + locker_id - start + 1);
            }
            before += end - start + 1;
        }
        None
    }

    /// Highest covered locker id (0 for an empty zone).
    #[must_use]
    pub fn max_locker(&self) -> i64 {
        self.ranges.iter().map(|&[_, end]| end).max().unwrap_or(0)
    }
}

/// Merge adjacent intervals `[a,b]`,`[b+1,c]` into `[a,c]`. Assumes the
/// list is ascending and disjoint.
pub fn merge_adjacent(ranges: &mut Vec<[i64; 2]>) {
    let mut merged: Vec<[i64; 2]> = Vec::with_capacity(ranges.len());
    for &[start, end] in ranges.iter() {
        match merged.last_mut() {
            Some(last) if last[1] + 1 == start => last[1] = end,
            _ => merged.push([start, end]),
        }
    }
    *ranges = merged;
}

fn validate_zone(zone: &Zone) -> Result<(), ZoneError> {
    let mut prev_end: i64 = 0;
    for &[start, end] in &zone.ranges {
        if start < 1 || end < start {
            return Err(ZoneError::BadRange {
                zone: zone.id.clone(),
                reason: format!("interval [{start},{end}] is not a valid locker range"),
            });
        }
        if start <= prev_end {
            return Err(ZoneError::BadRange {
                zone: zone.id.clone(),
                reason: format!("interval [{start},{end}] is not ascending and disjoint"),
            });
        }
        prev_end = end;
    }

    for (i, &slave) in zone.relay_cards.iter().enumerate() {
        if slave == 0 || slave > MAX_SLAVE {
            return Err(ZoneError::BadSlave {
                zone: zone.id.clone(),
                slave,
            });
        }
        if zone.relay_cards[..i].contains(&slave) {
            return Err(ZoneError::DuplicateSlave {
                a: zone.id.clone(),
                b: zone.id.clone(),
                slave,
            });
        }
    }

    let lockers = zone.locker_count();
    if lockers != LOCKERS_PER_CARD * zone.relay_cards.len() as i64 {
        return Err(ZoneError::CapacityMismatch {
            zone: zone.id.clone(),
            lockers,
            cards: zone.relay_cards.len(),
        });
    }

    Ok(())
}

/// Validate a full zone table: per-zone rules plus cross-zone exclusivity
/// of locker ids and slave addresses among enabled zones.
///
/// # Errors
///
/// Returns the first [`ZoneError`] found.
pub fn validate_zones(zones: &[Zone]) -> Result<(), ZoneError> {
    for zone in zones {
        validate_zone(zone)?;
    }

    let enabled: Vec<&Zone> = zones.iter().filter(|z| z.enabled).collect();
    for (i, a) in enabled.iter().enumerate() {
        for b in &enabled[i + 1..] {
            for &[a_start, a_end] in &a.ranges {
                for &[b_start, b_end] in &b.ranges {
                    if a_start <= b_end && b_start <= a_end {
                        return Err(ZoneError::Overlap {
                            a: a.id.clone(),
                            b: b.id.clone(),
                        });
                    }
                }
            }
            if let Some(&slave) = a.relay_cards.iter().find(|s| b.relay_cards.contains(s)) {
                return Err(ZoneError::DuplicateSlave {
                    a: a.id.clone(),
                    b: b.id.clone(),
                    slave,
                });
            }
        }
    }

    Ok(())
}

/// Outcome of the extension hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneExtension {
    /// Coverage was already sufficient (or zones are disabled).
    Unchanged,
    /// The last enabled zone grew.
    Extended {
        zone_id: String,
        added: [i64; 2],
        cards_added: Vec<u8>,
    },
}

/// Extend the last enabled zone to cover lockers up to `total_lockers`,
/// pulling relay cards from `free_cards` as needed.
///
/// Mutates `zones` and `free_cards` in place; the caller works on a copy of
/// the config document and discards it if this (or subsequent validation)
/// fails, which rolls the edit back.
///
/// # Errors
///
/// Returns [`ZoneError::CapacityExceeded`] when the free pool cannot supply
/// enough cards.
pub fn extend_zones(
    zones: &mut [Zone],
    zones_enabled: bool,
    total_lockers: i64,
    free_cards: &mut Vec<u8>,
) -> Result<ZoneExtension, ZoneError> {
    if !zones_enabled || total_lockers == 0 {
        return Ok(ZoneExtension::Unchanged);
    }

    let covered_max = zones
        .iter()
        .filter(|z| z.enabled)
        .map(Zone::max_locker)
        .max()
        .unwrap_or(0);
    if covered_max >= total_lockers {
        return Ok(ZoneExtension::Unchanged);
    }

    let Some(zone) = zones.iter_mut().filter(|z| z.enabled).next_back() else {
        // No enabled zone to stretch; the legacy fallback covers everything.
        return Ok(ZoneExtension::Unchanged);
    };

    let added = [covered_max + 1, total_lockers];
    zone.ranges.push(added);
    merge_adjacent(&mut zone.ranges);

    let needed_total = (zone.locker_count() + LOCKERS_PER_CARD - 1) / LOCKERS_PER_CARD;
    let needed = (needed_total as usize).saturating_sub(zone.relay_cards.len());
    if needed > free_cards.len() {
        return Err(ZoneError::CapacityExceeded {
            zone: zone.id.clone(),
            needed,
            available: free_cards.len(),
        });
    }

    let cards_added: Vec<u8> = free_cards.drain(..needed).collect();
    zone.relay_cards.extend_from_slice(&cards_added);

    Ok(ZoneExtension::Extended {
        zone_id: zone.id.clone(),
        added,
        cards_added,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mens() -> Zone {
        Zone {
            id: "mens".to_owned(),
            ranges: vec![[1, 32]],
            relay_cards: vec![1, 2],
            enabled: true,
        }
    }

    fn womens() -> Zone {
        Zone {
            id: "womens".to_owned(),
            ranges: vec![[33, 64]],
            relay_cards: vec![3, 4],
            enabled: true,
        }
    }

    #[test]
    fn valid_table_passes() {
        validate_zones(&[mens(), womens()]).unwrap();
    }

    #[test]
    fn overlapping_zones_are_rejected() {
        let mut w = womens();
        w.ranges = vec![[30, 61]];
        let err = validate_zones(&[mens(), w]).unwrap_err();
        assert!(matches!(err, ZoneError::Overlap { .. }));
    }

    #[test]
    fn shared_slave_is_rejected() {
        let mut w = womens();
        w.relay_cards = vec![2, 4];
        let err = validate_zones(&[mens(), w]).unwrap_err();
        assert!(matches!(err, ZoneError::DuplicateSlave { slave: 2, .. }));
    }

    #[test]
    fn capacity_must_match_cards() {
        let mut m = mens();
        m.relay_cards = vec![1];
        let err = validate_zones(&[m]).unwrap_err();
        assert!(matches!(
            err,
            ZoneError::CapacityMismatch { lockers: 32, cards: 1, .. }
        ));
    }

    #[test]
    fn disabled_zones_may_overlap() {
        let mut w = womens();
        w.ranges = vec![[1, 32]];
        w.relay_cards = vec![1, 2];
        w.enabled = false;
        validate_zones(&[mens(), w]).unwrap();
    }

    #[test]
    fn merge_joins_adjacent_intervals() {
        let mut ranges = vec![[1, 32], [33, 48], [60, 64]];
        merge_adjacent(&mut ranges);
        assert_eq!(ranges, vec![[1, 48], [60, 64]]);
    }

    #[test]
    fn position_sums_earlier_range_widths() {
        let zone = Zone {
            id: "split".to_owned(),
            ranges: vec![[1, 16], [33, 48]],
            relay_cards: vec![1, 2],
            enabled: true,
        };
        assert_eq!(zone.position_of(16), Some(16));
        assert_eq!(zone.position_of(33), Some(17));
        assert_eq!(zone.position_of(48), Some(32));
        assert_eq!(zone.position_of(20), None);
    }

    #[test]
    fn extension_grows_last_zone_and_merges() {
        let mut zones = vec![mens(), womens()];
        let mut free = vec![5, 6];

        let outcome = extend_zones(&mut zones, true, 80, &mut free).unwrap();
        assert_eq!(
            outcome,
            ZoneExtension::Extended {
                zone_id: "womens".to_owned(),
                added: [65, 80],
                cards_added: vec![5],
            }
        );
        assert_eq!(zones[1].ranges, vec![[33, 80]]);
        assert_eq!(zones[1].relay_cards, vec![3, 4, 5]);
        assert_eq!(free, vec![6]);
        validate_zones(&zones).unwrap();
    }

    #[test]
    fn extension_is_a_no_op_when_covered() {
        let mut zones = vec![mens(), womens()];
        let mut free = vec![5];
        assert_eq!(
            extend_zones(&mut zones, true, 64, &mut free).unwrap(),
            ZoneExtension::Unchanged
        );
        assert_eq!(extend_zones(&mut zones, false, 999, &mut free).unwrap(), ZoneExtension::Unchanged);
    }

    #[test]
    fn extension_refuses_without_enough_cards() {
        let mut zones = vec![mens()];
        let mut free = vec![];
        let err = extend_zones(&mut zones, true, 64, &mut free).unwrap_err();
        assert!(matches!(
            err,
            ZoneError::CapacityExceeded { needed: 2, available: 0, .. }
        ));
    }
}
