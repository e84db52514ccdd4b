//! Property-based tests for routing, PSI and the bounded ring buffer.

use proptest::prelude::*;

use scoreplane_serving::drift::{ReferenceDistribution, psi};
use scoreplane_serving::routing::{RoutingConfig, Variant, assign_variant, bucket};
use scoreplane_serving::stats::RingBuffer;

proptest! {
    #[test]
    fn bucket_is_below_100(id in ".{0,64}") {
        prop_assert!(bucket(&id) < 100);
    }

    #[test]
    fn assignment_is_deterministic(id in "[a-z0-9-]{1,32}", champion in 0u32..=100) {
        let config = RoutingConfig::split(f64::from(champion), f64::from(100 - champion));
        let first = assign_variant(&id, &config);
        let second = assign_variant(&id, &config);
        prop_assert_eq!(first, second);
        prop_assert_ne!(first, Variant::None);
    }

    #[test]
    fn zero_challenger_always_champion(id in ".{0,64}") {
        let config = RoutingConfig::split(100.0, 0.0);
        prop_assert_eq!(assign_variant(&id, &config), Variant::Champion);
    }

    #[test]
    fn full_challenger_always_challenger(id in ".{0,64}") {
        let config = RoutingConfig::split(0.0, 100.0);
        prop_assert_eq!(assign_variant(&id, &config), Variant::Challenger);
    }

    #[test]
    fn disabled_routing_always_champion(id in ".{0,64}") {
        let mut config = RoutingConfig::split(0.0, 100.0);
        config.enabled = false;
        prop_assert_eq!(assign_variant(&id, &config), Variant::Champion);
    }

    #[test]
    fn complementary_split_validates(champion in 0.0f64..=100.0) {
        prop_assert!(RoutingConfig::split(champion, 100.0 - champion).validate().is_ok());
    }

    #[test]
    fn unbalanced_split_rejected(champion in 0.0f64..=100.0, excess in 0.01f64..50.0) {
        let challenger = (100.0 - champion + excess).min(100.0);
        prop_assume!((champion + challenger - 100.0).abs() > 1e-3);
        prop_assert!(RoutingConfig::split(champion, challenger).validate().is_err());
    }

    #[test]
    fn psi_is_non_negative(
        reference in prop::collection::vec(-1_000.0f64..1_000.0, 20..200),
        current in prop::collection::vec(-2_000.0f64..2_000.0, 1..200),
    ) {
        let dist = ReferenceDistribution::from_values(&reference, 10).unwrap();
        let value = dist.psi(&current);
        prop_assert!(value.is_finite());
        prop_assert!(value >= -1e-12);
    }

    #[test]
    fn psi_of_reference_against_itself_is_zero(
        reference in prop::collection::vec(0.0f64..1.0, 20..200),
    ) {
        let dist = ReferenceDistribution::from_values(&reference, 10).unwrap();
        prop_assert!(psi(&dist.proportions, &dist.proportions).abs() < 1e-12);
        prop_assert!(dist.psi(&reference) < 1e-9);
    }

    #[test]
    fn ring_buffer_never_exceeds_capacity(
        capacity in 1usize..64,
        values in prop::collection::vec(any::<i32>(), 0..256),
    ) {
        let mut ring = RingBuffer::new(capacity);
        for v in &values {
            ring.push(*v);
        }
        prop_assert!(ring.len() <= capacity);
        let kept: Vec<i32> = ring.iter().copied().collect();
        let start = values.len().saturating_sub(capacity);
        prop_assert_eq!(kept, values[start..].to_vec());
    }
}
