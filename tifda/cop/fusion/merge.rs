use std::collections::{BTreeSet, VecDeque};

use super::observation::{supersedes, Observation};
use crate::{
    config::FusionConfig,
    geo::{bearing_deg, haversine_m},
    model::{type_specificity, Contribution, EntityCop, IffClassification, Location, TrackPoint},
};

const MIN_WEIGHT: f64 = 1e-3;
const MIN_MOTION_M: f64 = 1.0;

/// Summary of what a merge changed, used for audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEffect {
    /// The sensor's stored report was replaced.
    pub report_replaced: bool,
    /// Sensors disagree after the merge.
    pub conflict: bool,
}

/// Fuses one observation into an entity, returning the new canonical state.
///
/// The fused scalars are recomputed from the latest report of each sensor, so
/// the result does not depend on the order in which reports arrived.
#[must_use]
pub fn merge(existing: &EntityCop, incoming: &Observation, config: &FusionConfig) -> EntityCop {
    merge_with_effect(existing, incoming, config).0
}

/// Creates a fresh entity from a single observation.
#[must_use]
pub fn create(incoming: &Observation, config: &FusionConfig) -> EntityCop {
    let report = &incoming.report;
    let mut shell = EntityCop::new(
        report.track_id.clone(),
        report.entity_type.clone(),
        report.location,
        report.timestamp,
        report.confidence,
    );
    shell.information_classification = report.information_classification;
    merge(&shell, incoming, config)
}

pub(crate) fn merge_with_effect(
    existing: &EntityCop,
    incoming: &Observation,
    config: &FusionConfig,
) -> (EntityCop, MergeEffect) {
    let mut entity = existing.clone();
    let report = &incoming.report;
    let report_replaced = match entity.contributions.get(&incoming.sensor_id) {
        Some(current) => supersedes(report, current),
        None => true,
    };
    if report_replaced {
        entity
            .contributions
            .insert(incoming.sensor_id.clone(), report.clone());
    }
    entity.information_classification = entity
        .information_classification
        .max(report.information_classification);
    push_history(
        &mut entity.history,
        TrackPoint {
            timestamp: report.timestamp,
            location: report.location,
            sensor_id: Some(incoming.sensor_id.clone()),
        },
        config.history_len,
    );
    let conflict = recompute(&mut entity, config);
    (
        entity,
        MergeEffect {
            report_replaced,
            conflict,
        },
    )
}

/// Inserts a point keeping the ring sorted, deduplicated, and bounded to the newest `cap`.
fn push_history(history: &mut VecDeque<TrackPoint>, point: TrackPoint, cap: usize) {
    let position = history.partition_point(|existing| point_order(existing, &point).is_lt());
    if history
        .get(position)
        .is_some_and(|existing| point_order(existing, &point).is_eq())
    {
        return;
    }
    history.insert(position, point);
    while history.len() > cap.max(1) {
        history.pop_front();
    }
}

fn point_order(a: &TrackPoint, b: &TrackPoint) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.location.lat.total_cmp(&b.location.lat))
        .then_with(|| a.location.lon.total_cmp(&b.location.lon))
        .then_with(|| {
            a.location
                .alt
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&b.location.alt.unwrap_or(f64::NEG_INFINITY))
        })
        .then_with(|| a.sensor_id.cmp(&b.sensor_id))
}

/// Rebuilds every fused scalar from the per-sensor reports. Returns whether sensors conflict.
fn recompute(entity: &mut EntityCop, config: &FusionConfig) -> bool {
    let reports = &entity.contributions;
    let Some((_, newest)) = reports
        .iter()
        .max_by(|(sa, a), (sb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| sa.cmp(sb)))
    else {
        return false;
    };
    let newest_ts = newest.timestamp;
    let window_ms = config.staleness_secs.saturating_mul(1000);
    let active: Vec<(&String, &Contribution)> = reports
        .iter()
        .filter(|(_, report)| (newest_ts - report.timestamp).num_milliseconds() <= window_ms)
        .collect();

    let entity_type = active
        .iter()
        .max_by(|(sa, a), (sb, b)| {
            type_specificity(&a.entity_type)
                .cmp(&type_specificity(&b.entity_type))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| sa.cmp(sb))
        })
        .map(|(_, report)| report.entity_type.clone())
        .unwrap_or_else(|| entity.entity_type.clone());

    let location = weighted_location(&active);
    let divergence = config.divergence_for(&entity_type);
    let spread_conflict = active.iter().enumerate().any(|(i, (_, a))| {
        active[i + 1..]
            .iter()
            .any(|(_, b)| haversine_m(&a.location, &b.location) > divergence)
    });
    let known: BTreeSet<&str> = active
        .iter()
        .filter(|(_, report)| report.iff.is_known())
        .map(|(_, report)| report.iff.as_str())
        .collect();
    let conflict = spread_conflict || known.len() > 1;

    let confidences: Vec<f64> = active.iter().map(|(_, r)| r.confidence.clamp(0.0, 1.0)).collect();
    let max_c = confidences.iter().copied().fold(0.0_f64, f64::max);
    let confidence = if conflict {
        confidences
            .iter()
            .copied()
            .fold(entity.confidence.clamp(0.0, 1.0), f64::min)
    } else {
        let noisy_or = 1.0 - confidences.iter().map(|c| 1.0 - c).product::<f64>();
        config
            .corroboration_gain
            .mul_add(noisy_or - max_c, max_c)
    };

    let iff = active
        .iter()
        .filter(|(_, report)| report.iff.is_known())
        .max_by(|(sa, a), (sb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| sa.cmp(sb)))
        .map_or(IffClassification::Unknown, |(_, report)| report.iff);

    let latest_with = |pick: fn(&Contribution) -> bool| {
        active
            .iter()
            .filter(|(_, report)| pick(report))
            .max_by(|(sa, a), (sb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| sa.cmp(sb)))
            .map(|(_, report)| *report)
    };
    let reported_speed = latest_with(|r| r.speed_kmh.is_some()).and_then(|r| r.speed_kmh);
    let reported_heading = latest_with(|r| r.heading.is_some()).and_then(|r| r.heading);
    let comments = latest_with(|r| r.comments.is_some()).and_then(|r| r.comments.clone());
    let (speed_kmh, heading) = derived_motion(&entity.history)
        .map_or((reported_speed, reported_heading), |(speed, heading)| {
            (Some(speed), heading.or(reported_heading))
        });

    let classification_floor = reports
        .values()
        .map(|report| report.information_classification)
        .max()
        .unwrap_or_default();
    let source_sensors: BTreeSet<String> = reports.keys().cloned().collect();

    entity.entity_type = entity_type;
    entity.location = location;
    entity.timestamp = newest_ts;
    entity.classification = iff;
    entity.information_classification = entity.information_classification.max(classification_floor);
    entity.confidence = confidence.clamp(0.0, 1.0);
    entity.source_sensors = source_sensors;
    entity.speed_kmh = speed_kmh;
    entity.heading = heading;
    entity.comments = comments;
    entity.needs_review = conflict;
    conflict
}

/// Confidence-weighted mean: with two reports this is the single-gain blend
/// `x + K (z - x)` with `K = c_z / (c_x + c_z)`.
fn weighted_location(active: &[(&String, &Contribution)]) -> Location {
    let mut total = 0.0;
    let (mut lat, mut lon) = (0.0, 0.0);
    let (mut alt_total, mut alt) = (0.0, 0.0);
    for (_, report) in active {
        let weight = report.confidence.max(MIN_WEIGHT);
        total += weight;
        lat = report.location.lat.mul_add(weight, lat);
        lon = report.location.lon.mul_add(weight, lon);
        if let Some(a) = report.location.alt {
            alt_total += weight;
            alt = a.mul_add(weight, alt);
        }
    }
    if total <= 0.0 {
        return active
            .first()
            .map_or(Location::new(0.0, 0.0), |(_, report)| report.location);
    }
    Location {
        lat: lat / total,
        lon: lon / total,
        alt: (alt_total > 0.0).then(|| alt / alt_total),
    }
}

/// Speed (km/h) and heading from one sensor's own two newest points.
///
/// Points from different sensors are never paired, so a fixed position that two
/// sensors place apart does not read as movement. The sensor with the newest
/// usable pair wins.
fn derived_motion(history: &VecDeque<TrackPoint>) -> Option<(f64, Option<f64>)> {
    let sensors: BTreeSet<&str> = history.iter().filter_map(|p| p.sensor_id.as_deref()).collect();
    sensors
        .into_iter()
        .filter_map(|sensor| {
            let mut own = history
                .iter()
                .rev()
                .filter(|point| point.sensor_id.as_deref() == Some(sensor));
            let last = own.next()?;
            let previous = own.find(|point| point.timestamp < last.timestamp)?;
            Some((last, previous))
        })
        .max_by(|(a, _), (b, _)| a.timestamp.cmp(&b.timestamp).then_with(|| b.sensor_id.cmp(&a.sensor_id)))
        .and_then(|(last, previous)| {
            let seconds = (last.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
            if seconds <= 0.0 {
                return None;
            }
            let meters = haversine_m(&previous.location, &last.location);
            let heading = (meters >= MIN_MOTION_M).then(|| bearing_deg(&previous.location, &last.location));
            Some((meters / seconds * 3.6, heading))
        })
}

/// Reports grouped by sensor, newest first; handy for diagnostics.
#[must_use]
pub fn reports_by_recency(entity: &EntityCop) -> Vec<(&str, &Contribution)> {
    let mut reports: Vec<_> = entity
        .contributions
        .iter()
        .map(|(sensor, report)| (sensor.as_str(), report))
        .collect();
    reports.sort_by(|(sa, a), (sb, b)| b.timestamp.cmp(&a.timestamp).then_with(|| sa.cmp(sb)));
    reports
}
