use std::collections::HashSet;

use chrono::Duration;
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use tifda_cop::{
    geo::destination,
    model::{EntityCop, Location},
};

use crate::clearance::public_view;

const MAX_ID_ATTEMPTS: usize = 32;

/// Deterministic decoy factory for adversarial channels.
///
/// Decoys are modelled on the real entities they travel with: ids follow the
/// same naming scheme, types, IFF labels and report ages are drawn from the
/// real payload, and every decoy passes through the same public view. Only the
/// decision's `decoy_ids` tell them apart.
///
/// The same seed, recipient and snapshot version always yield the same decoys,
/// so a replayed dissemination round sends identical traffic.
#[derive(Debug, Clone, Copy)]
pub struct DecoyGenerator {
    count: usize,
    seed: u64,
}

impl DecoyGenerator {
    /// Creates a generator producing `count` decoys per call.
    #[must_use]
    pub const fn new(count: usize, seed: u64) -> Self {
        Self { count, seed }
    }

    /// Fabricated positions scattered 2 to 40 km around `around`, shaped like `real`.
    ///
    /// Returns nothing when `real` is empty. Ids never collide with `taken`.
    #[must_use]
    pub fn generate(
        &self,
        recipient_id: &str,
        snapshot_version: u64,
        around: Location,
        real: &[EntityCop],
        taken: &HashSet<&str>,
    ) -> Vec<EntityCop> {
        if real.is_empty() {
            return Vec::new();
        }
        let mut rng = SmallRng::seed_from_u64(
            self.seed ^ snapshot_version.rotate_left(29) ^ fnv1a(recipient_id.as_bytes()),
        );
        let mut used: HashSet<String> = taken.iter().map(|id| (*id).to_string()).collect();
        used.extend(real.iter().map(|e| e.entity_id.clone()));
        let mut decoys = Vec::with_capacity(self.count);
        for _ in 0..self.count {
            let Some(id) = fresh_id(real, &used, &mut rng) else {
                break;
            };
            used.insert(id.clone());
            let (Some(shape), Some(identity), Some(age)) = (
                real.choose(&mut rng),
                real.choose(&mut rng),
                real.choose(&mut rng),
            ) else {
                break;
            };
            let spot = destination(&around, rng.gen_range(0.0..360.0), rng.gen_range(2_000.0..40_000.0));
            let mut decoy = EntityCop::new(
                id,
                shape.entity_type.clone(),
                spot,
                age.timestamp - Duration::seconds(rng.gen_range(0..90)),
                age.confidence,
            );
            decoy.classification = identity.classification;
            decoys.push(public_view(&decoy));
        }
        decoys
    }
}

/// Id following the naming scheme of a randomly picked real entity.
fn fresh_id(real: &[EntityCop], used: &HashSet<String>, rng: &mut SmallRng) -> Option<String> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let template = real.choose(rng)?;
        let candidate = mimic_id(&template.entity_id, rng);
        if !used.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Replaces the digits of the last `_`-separated segment with random ones.
///
/// Templates without digits in that segment get a numeric segment appended.
fn mimic_id(template: &str, rng: &mut SmallRng) -> String {
    let (head, tail) = template.rsplit_once('_').unwrap_or(("", template));
    let separator = if head.is_empty() { "" } else { "_" };
    if tail.bytes().any(|b| b.is_ascii_digit()) {
        let tail: String = tail
            .chars()
            .map(|c| {
                if c.is_ascii_digit() {
                    char::from(b'0' + rng.gen_range(0..10_u8))
                } else {
                    c
                }
            })
            .collect();
        format!("{head}{separator}{tail}")
    } else {
        format!("{template}_{}", rng.gen_range(1..1000_u32))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tifda_cop::{
        geo::haversine_km,
        model::{IffClassification, InformationClassification},
    };

    fn real() -> Vec<EntityCop> {
        let now = Utc::now();
        let mut ship = EntityCop::new("ais_224100", "ship", Location::new(39.4, -0.3), now, 0.9);
        ship.classification = IffClassification::Neutral;
        let mut truck = EntityCop::new("obs_truck_1", "truck", Location::new(39.5, -0.4), now, 0.7);
        truck.classification = IffClassification::Friendly;
        vec![public_view(&ship), public_view(&truck)]
    }

    #[test]
    fn same_inputs_same_decoys() {
        let generator = DecoyGenerator::new(3, 42);
        let centre = Location::new(39.5, -0.4);
        let real = real();
        let a = generator.generate("red_team", 7, centre, &real, &HashSet::new());
        let b = generator.generate("red_team", 7, centre, &real, &HashSet::new());
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        let c = generator.generate("red_team", 8, centre, &real, &HashSet::new());
        assert_ne!(a, c);
    }

    #[test]
    fn decoys_mirror_the_real_payload() {
        let centre = Location::new(39.5, -0.4);
        let real = real();
        let taken: HashSet<&str> = ["ais_224101"].into_iter().collect();
        let decoys = DecoyGenerator::new(10, 1).generate("red_team", 1, centre, &real, &taken);
        assert_eq!(decoys.len(), 10);
        let ids: HashSet<&str> = decoys.iter().map(|d| d.entity_id.as_str()).collect();
        assert_eq!(ids.len(), 10);
        for decoy in &decoys {
            assert!(
                decoy.entity_id.starts_with("ais_") || decoy.entity_id.starts_with("obs_truck_"),
                "{}",
                decoy.entity_id
            );
            assert!(!taken.contains(decoy.entity_id.as_str()));
            assert!(real.iter().all(|r| r.entity_id != decoy.entity_id));
            assert!(real.iter().any(|r| r.entity_type == decoy.entity_type));
            assert!(real.iter().any(|r| r.classification == decoy.classification));
            assert_eq!(decoy.information_classification, InformationClassification::Unclassified);
            assert_eq!(decoy.comments, real[0].comments);
            assert!(decoy.source_sensors.is_empty());
            assert!(haversine_km(&centre, &decoy.location) < 50.0);
        }
    }

    #[test]
    fn no_real_entities_no_decoys() {
        let decoys = DecoyGenerator::new(3, 1).generate("red_team", 1, Location::new(0.0, 0.0), &[], &HashSet::new());
        assert!(decoys.is_empty());
    }

    #[test]
    fn mimicked_ids_keep_the_template_shape() {
        let mut rng = SmallRng::seed_from_u64(9);
        let id = mimic_id("radar_01_T001", &mut rng);
        assert!(id.starts_with("radar_01_T"));
        assert_eq!(id.len(), "radar_01_T001".len());
        assert!(mimic_id("tank", &mut rng).starts_with("tank_"));
    }
}
