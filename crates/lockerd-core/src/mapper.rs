//! Locker id → (slave, coil) address resolution.
//!
//! Pure and deterministic. With zones enabled, the locker's 1-based position
//! within its zone picks the relay card and coil; without zones (or for ids
//! no zone covers) the legacy layout applies: card ⌈id/16⌉, coil
//! ((id−1) mod 16)+1.

use crate::config::ConfigDocument;
use crate::error::MapError;
use crate::frame::MAX_SLAVE;
use crate::zones::LOCKERS_PER_CARD;

/// A resolved relay address: Modbus slave plus 1-based coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilAddress {
    pub slave: u8,
    pub coil: u16,
}

/// Resolve a locker id against the current config.
///
/// # Errors
///
/// - [`MapError::UnknownLocker`] if the id is non-positive or beyond what
///   the legacy fallback can address.
/// - [`MapError::HardwareConfig`] if the containing zone's relay card list
///   is too short for the computed card index.
pub fn map_locker(locker_id: i64, doc: &ConfigDocument) -> Result<CoilAddress, MapError> {
    if locker_id < 1 {
        return Err(MapError::UnknownLocker { locker_id });
    }

    if doc.features.zones_enabled {
        if let Some(zone) = doc.zones.iter().find(|z| z.enabled && z.contains(locker_id)) {
            let position = zone
                .position_of(locker_id)
                .ok_or(MapError::UnknownLocker { locker_id })?;
            let card_index = usize::try_from((position - 1) / LOCKERS_PER_CARD)
                .map_err(|_| MapError::UnknownLocker { locker_id })?;
            let coil = ((position - 1) % LOCKERS_PER_CARD + 1) as u16;

            let slave = *zone.relay_cards.get(card_index).ok_or_else(|| {
                MapError::HardwareConfig {
                    locker_id,
                    reason: format!(
                        "zone '{}' needs relay card index {card_index} but has {}",
                        zone.id,
                        zone.relay_cards.len()
                    ),
                }
            })?;

            return Ok(CoilAddress { slave, coil });
        }
    }

    // Legacy layout: card N serves lockers (N-1)*16+1 ..= N*16.
    let slave = (locker_id - 1) / LOCKERS_PER_CARD + 1;
    if slave > i64::from(MAX_SLAVE) {
        return Err(MapError::UnknownLocker { locker_id });
    }
    Ok(CoilAddress {
        slave: slave as u8,
        coil: ((locker_id - 1) % LOCKERS_PER_CARD + 1) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::Zone;

    fn two_zone_doc() -> ConfigDocument {
        let mut doc = ConfigDocument::default();
        doc.features.zones_enabled = true;
        doc.zones = vec![
            Zone {
                id: "mens".to_owned(),
                ranges: vec![[1, 32]],
                relay_cards: vec![1, 2],
                enabled: true,
            },
            Zone {
                id: "womens".to_owned(),
                ranges: vec![[33, 64]],
                relay_cards: vec![3, 4],
                enabled: true,
            },
        ];
        doc
    }

    fn map(locker_id: i64, doc: &ConfigDocument) -> (u8, u16) {
        let addr = map_locker(locker_id, doc).unwrap();
        (addr.slave, addr.coil)
    }

    #[test]
    fn zone_boundaries_map_exactly() {
        let doc = two_zone_doc();
        assert_eq!(map(1, &doc), (1, 1));
        assert_eq!(map(16, &doc), (1, 16));
        assert_eq!(map(17, &doc), (2, 1));
        assert_eq!(map(32, &doc), (2, 16));
        assert_eq!(map(33, &doc), (3, 1));
        assert_eq!(map(49, &doc), (4, 1));
        assert_eq!(map(64, &doc), (4, 16));
    }

    #[test]
    fn mapping_is_deterministic() {
        let doc = two_zone_doc();
        assert_eq!(map_locker(49, &doc).unwrap(), map_locker(49, &doc).unwrap());
    }

    #[test]
    fn legacy_fallback_when_zones_disabled() {
        let doc = ConfigDocument::default();
        assert_eq!(map(1, &doc), (1, 1));
        assert_eq!(map(16, &doc), (1, 16));
        assert_eq!(map(17, &doc), (2, 1));
        assert_eq!(map(100, &doc), (7, 4));
    }

    #[test]
    fn uncovered_id_falls_back_even_with_zones_enabled() {
        let doc = two_zone_doc();
        // 65 is outside both zones; the legacy layout addresses card 5.
        assert_eq!(map(65, &doc), (5, 1));
    }

    #[test]
    fn nonsense_ids_are_unknown() {
        let doc = ConfigDocument::default();
        assert!(matches!(
            map_locker(0, &doc),
            Err(MapError::UnknownLocker { locker_id: 0 })
        ));
        assert!(matches!(
            map_locker(-3, &doc),
            Err(MapError::UnknownLocker { .. })
        ));
        assert!(map_locker(247 * 16 + 1, &doc).is_err());
    }

    #[test]
    fn short_relay_card_list_is_a_hardware_config_error() {
        let mut doc = two_zone_doc();
        doc.zones[1].relay_cards = vec![3];
        assert!(matches!(
            map_locker(49, &doc),
            Err(MapError::HardwareConfig { locker_id: 49, .. })
        ));
    }
}
