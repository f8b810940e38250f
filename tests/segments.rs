use eventpool::{hash_routing_key, Segment, TrackedEvent, TrackingToken};

fn sample_keys() -> Vec<String> {
    (0..256).map(|index| format!("routing-key-{index}")).collect()
}

#[test]
fn hash_is_stable_fnv1a() {
    // FNV-1a offset basis for empty input.
    assert_eq!(hash_routing_key(b""), 0xcbf29ce484222325);
    assert_eq!(hash_routing_key("order-42"), hash_routing_key("order-42"));
    assert_ne!(hash_routing_key("order-42"), hash_routing_key("order-43"));
}

#[test]
fn root_segment_matches_every_key() {
    for key in sample_keys() {
        assert!(Segment::ROOT.matches_hash(hash_routing_key(&key)));
    }
}

#[test]
fn split_halves_partition_the_parent() {
    let (lower, upper) = Segment::ROOT.split();
    for key in sample_keys() {
        let hash = hash_routing_key(&key);
        assert_ne!(lower.matches_hash(hash), upper.matches_hash(hash));
    }
}

#[test]
fn balanced_segments_cover_every_key_exactly_once() {
    for count in [1u32, 2, 3, 5, 8, 32] {
        let segments = Segment::compute_segments(count);
        assert_eq!(segments.len(), count as usize);
        for key in sample_keys() {
            let hash = hash_routing_key(&key);
            let matching = segments
                .iter()
                .filter(|segment| segment.matches_hash(hash))
                .count();
            assert_eq!(matching, 1, "key {key} under {count} segments");
        }
    }
}

#[test]
fn compute_recovers_the_balanced_masks() {
    for count in [1u32, 2, 3, 5, 8, 32] {
        let segments = Segment::compute_segments(count);
        let ids: Vec<u32> = segments.iter().map(Segment::segment_id).collect();
        for segment in &segments {
            assert_eq!(Segment::compute(segment.segment_id(), &ids), *segment);
        }
    }
}

#[test]
fn matches_uses_the_event_routing_key() {
    let segments = Segment::compute_segments(4);
    let event = TrackedEvent::new(TrackingToken::new(1), "event-1", "order-42", "payload");
    let matching: Vec<&Segment> = segments
        .iter()
        .filter(|segment| segment.matches(&event))
        .collect();
    assert_eq!(matching.len(), 1);
    assert!(matching[0].matches_hash(hash_routing_key("order-42")));
}
