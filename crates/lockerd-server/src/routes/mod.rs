//! HTTP route modules.

pub mod admin;
pub mod health;
pub mod kiosk;
pub mod lockers;

use lockerd_core::config::ConfigDocument;
use lockerd_core::zones::Zone;

use crate::error::ApiError;

/// Resolve a zone query parameter against the active config.
///
/// Unknown or disabled zones come back as `UNKNOWN_ZONE` with the list of
/// zones that do exist, so a misconfigured kiosk can self-correct.
pub(crate) fn resolve_zone<'a>(doc: &'a ConfigDocument, zone_id: &str) -> Result<&'a Zone, ApiError> {
    doc.enabled_zone(zone_id).ok_or_else(|| ApiError::UnknownZone {
        zone: zone_id.to_owned(),
        available: doc.enabled_zone_ids(),
    })
}
