use super::observation::Observation;
use crate::{
    config::FusionConfig,
    geo::haversine_m,
    model::{type_specificity, types_compatible, EntityCop},
};

/// Correlation gate for a pair of types: the gate of the more specific label.
#[must_use]
pub fn gate_between(config: &FusionConfig, a: &str, b: &str) -> f64 {
    if type_specificity(a) >= type_specificity(b) {
        config.gate_for(a)
    } else {
        config.gate_for(b)
    }
}

/// Distance to `entity` if the observation may describe it, `None` otherwise.
///
/// Requires compatible types and IFF labels, a time delta inside the staleness
/// window, and a distance inside the type gate.
#[must_use]
pub fn correlate(entity: &EntityCop, observation: &Observation, config: &FusionConfig) -> Option<f64> {
    let report = &observation.report;
    if !types_compatible(&entity.entity_type, &report.entity_type) {
        return None;
    }
    if !entity.classification.compatible_with(report.iff) {
        return None;
    }
    let delta_ms = (report.timestamp - entity.timestamp).num_milliseconds().abs();
    if delta_ms > config.staleness_secs.saturating_mul(1000) {
        return None;
    }
    let distance = haversine_m(&entity.location, &report.location);
    (distance <= gate_between(config, &entity.entity_type, &report.entity_type)).then_some(distance)
}

/// Nearest correlating entity; ties go to the smallest id.
pub fn best_match<'a>(
    entities: impl IntoIterator<Item = &'a EntityCop>,
    observation: &Observation,
    config: &FusionConfig,
) -> Option<&'a EntityCop> {
    entities
        .into_iter()
        .filter_map(|entity| correlate(entity, observation, config).map(|d| (entity, d)))
        .min_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.entity_id.cmp(&b.entity_id)))
        .map(|(entity, _)| entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geo::destination,
        model::{IffClassification, InformationClassification, Location, SensorType},
    };
    use chrono::{Duration, Utc};

    fn observe(entity_type: &str, location: Location, iff: IffClassification) -> Observation {
        let mut entity = EntityCop::new("drone_alpha_T1", entity_type, location, Utc::now(), 0.8);
        entity.classification = iff;
        Observation::from_entity(
            &entity,
            "drone_alpha",
            SensorType::Drone,
            InformationClassification::Confidential,
        )
    }

    #[test]
    fn gates_scale_with_domain() {
        let config = FusionConfig::default();
        let origin = Location::new(40.0, -3.0);
        let far = destination(&origin, 45.0, 1_500.0);
        let aircraft = EntityCop::new("a", "aircraft", origin, Utc::now(), 0.9);
        let tank = EntityCop::new("t", "tank", origin, Utc::now(), 0.9);
        assert!(correlate(&aircraft, &observe("fighter", far, IffClassification::Unknown), &config).is_some());
        assert!(correlate(&tank, &observe("tank", far, IffClassification::Unknown), &config).is_none());
    }

    #[test]
    fn rejects_conflicting_identity_and_stale_tracks() {
        let config = FusionConfig::default();
        let origin = Location::new(40.0, -3.0);
        let mut hostile = EntityCop::new("h", "aircraft", origin, Utc::now(), 0.9);
        hostile.classification = IffClassification::Hostile;
        assert!(correlate(&hostile, &observe("aircraft", origin, IffClassification::Friendly), &config).is_none());
        assert!(correlate(&hostile, &observe("aircraft", origin, IffClassification::Unknown), &config).is_some());
        assert!(correlate(&hostile, &observe("ship", origin, IffClassification::Hostile), &config).is_none());
        hostile.timestamp = Utc::now() - Duration::seconds(600);
        assert!(correlate(&hostile, &observe("aircraft", origin, IffClassification::Hostile), &config).is_none());
    }

    #[test]
    fn nearest_candidate_wins() {
        let config = FusionConfig::default();
        let origin = Location::new(40.0, -3.0);
        let near = EntityCop::new("z_near", "aircraft", destination(&origin, 0.0, 100.0), Utc::now(), 0.9);
        let far = EntityCop::new("a_far", "aircraft", destination(&origin, 0.0, 900.0), Utc::now(), 0.9);
        let obs = observe("aircraft", origin, IffClassification::Unknown);
        assert_eq!(best_match([&far, &near], &obs, &config).unwrap().entity_id, "z_near");
    }
}
