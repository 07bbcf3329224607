use std::collections::{BTreeMap, BTreeSet};

use tifda_cop::model::{EntityCop, InformationClassification, Location};

/// Comment attached to every unclassified view.
pub const APPROXIMATE_COMMENT: &str = "Location approximate";

/// Position of a level in the hierarchy; lower means more sensitive.
#[must_use]
pub const fn rank(level: InformationClassification) -> u8 {
    level.rank()
}

/// Whether a recipient cleared up to `clearance` may see `classification`.
#[must_use]
pub const fn clearance_satisfies(
    clearance: InformationClassification,
    classification: InformationClassification,
) -> bool {
    rank(classification) >= rank(clearance)
}

/// Entities a recipient cleared up to `clearance` may see, in input order.
pub fn filter<'a>(
    entities: impl IntoIterator<Item = &'a EntityCop>,
    clearance: InformationClassification,
) -> Vec<&'a EntityCop> {
    entities
        .into_iter()
        .filter(|entity| clearance_satisfies(clearance, entity.information_classification))
        .collect()
}

/// Outbound copy of `entity` relabelled to `target`.
///
/// Targets at or above the entity's own level return the entity unchanged apart
/// from per-sensor bookkeeping, which never leaves the store. Lower targets strip
/// detail in steps:
///
/// * leaving `TOP_SECRET`: sensor names become a count, speed snaps to 50 km/h,
///   heading to 10°;
/// * from `SECRET` or above to `CONFIDENTIAL` or below: coordinates rounded to
///   0.01°, altitude and track history dropped, confidence rounded to 0.1;
/// * to `RESTRICTED` or below: sensors, speed, heading and comment dropped;
/// * to `UNCLASSIFIED`: coordinates rounded to 0.1°, confidence fixed at 0.5.
#[must_use]
pub fn downgrade(entity: &EntityCop, target: InformationClassification) -> EntityCop {
    use InformationClassification as Level;

    let mut view = entity.clone();
    view.contributions.clear();
    let original = entity.information_classification;
    if target >= original {
        return view;
    }
    view.information_classification = target;

    if original == Level::TopSecret {
        if !view.source_sensors.is_empty() {
            view.source_sensors = BTreeSet::from([format!("{} sources", view.source_sensors.len())]);
        }
        view.speed_kmh = view.speed_kmh.map(|speed| round_to_step(speed, 50.0));
        view.heading = view.heading.map(|heading| round_to_step(heading, 10.0).rem_euclid(360.0));
    }
    if original >= Level::Secret && target <= Level::Confidential {
        view.location = coarse(view.location, 2);
        view.history.clear();
        view.confidence = round_decimals(view.confidence, 1);
    }
    if original >= Level::Confidential && target <= Level::Restricted {
        view.source_sensors.clear();
        view.speed_kmh = None;
        view.heading = None;
        view.comments = None;
        view.history.clear();
    }
    if target == Level::Unclassified {
        strip_to_public(&mut view);
    }
    view
}

/// Unclassified view regardless of the entity's own label; used for adversarial channels.
#[must_use]
pub fn public_view(entity: &EntityCop) -> EntityCop {
    let mut view = downgrade(entity, InformationClassification::Unclassified);
    strip_to_public(&mut view);
    view
}

fn strip_to_public(view: &mut EntityCop) {
    view.information_classification = InformationClassification::Unclassified;
    view.location = coarse(view.location, 1);
    view.confidence = 0.5;
    view.source_sensors.clear();
    view.speed_kmh = None;
    view.heading = None;
    view.history.clear();
    view.comments = Some(APPROXIMATE_COMMENT.to_string());
    view.needs_review = false;
}

/// Count of entities per level; every level is present.
pub fn classification_summary<'a>(
    entities: impl IntoIterator<Item = &'a EntityCop>,
) -> BTreeMap<InformationClassification, usize> {
    let mut summary: BTreeMap<_, _> = InformationClassification::DESCENDING
        .into_iter()
        .map(|level| (level, 0))
        .collect();
    for entity in entities {
        *summary.entry(entity.information_classification).or_default() += 1;
    }
    summary
}

fn round_to_step(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

fn round_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (value * scale).round() / scale
}

fn coarse(location: Location, decimals: i32) -> Location {
    Location {
        lat: round_decimals(location.lat, decimals),
        lon: round_decimals(location.lon, decimals),
        alt: None,
    }
}
