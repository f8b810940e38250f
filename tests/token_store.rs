use std::thread;
use std::time::Duration;

use eventpool::{InMemoryTokenStore, TokenStore, TokenStoreError, TrackingToken};

const NAME: &str = "store-test";

fn initialized_store() -> InMemoryTokenStore {
    let store = InMemoryTokenStore::new();
    store
        .initialize_token_segments(NAME, 4, TrackingToken::new(0))
        .unwrap();
    store
}

#[test]
fn initialize_creates_the_requested_segments() {
    let store = initialized_store();
    assert_eq!(store.fetch_segments(NAME).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(store.fetch_segments("someone-else").unwrap(), Vec::<u32>::new());
}

#[test]
fn initialize_twice_is_rejected() {
    let store = initialized_store();
    let result = store.initialize_token_segments(NAME, 4, TrackingToken::new(0));
    assert!(matches!(result, Err(TokenStoreError::Store { .. })));
}

#[test]
fn fetch_token_claims_the_segment_exclusively() {
    let store = initialized_store();

    assert_eq!(store.fetch_token(NAME, 0).unwrap(), TrackingToken::new(0));
    assert_eq!(
        store.fetch_token(NAME, 0),
        Err(TokenStoreError::ClaimUnavailable {
            processor: NAME.to_string(),
            segment_id: 0,
        })
    );
}

#[test]
fn fetch_token_for_unknown_segment_fails() {
    let store = initialized_store();
    assert_eq!(
        store.fetch_token(NAME, 9),
        Err(TokenStoreError::UnknownSegment {
            processor: NAME.to_string(),
            segment_id: 9,
        })
    );
}

#[test]
fn expired_claim_can_be_taken_over() {
    let store = InMemoryTokenStore::with_claim_timeout(Duration::from_millis(50));
    store
        .initialize_token_segments(NAME, 1, TrackingToken::new(0))
        .unwrap();

    store.fetch_token(NAME, 0).unwrap();
    thread::sleep(Duration::from_millis(80));

    assert!(store.fetch_token(NAME, 0).is_ok());
}

#[test]
fn store_token_advances_and_renews_the_claim() {
    let store = InMemoryTokenStore::with_claim_timeout(Duration::from_millis(80));
    store
        .initialize_token_segments(NAME, 1, TrackingToken::new(0))
        .unwrap();
    store.fetch_token(NAME, 0).unwrap();

    for round in 1..=3 {
        store
            .store_token(TrackingToken::new(round), NAME, 0)
            .unwrap();
        thread::sleep(Duration::from_millis(40));
        // The claim stays live because every store renews it.
        store.extend_claim(NAME, 0).unwrap();
    }

    assert_eq!(
        store.fetch_token(NAME, 0),
        Err(TokenStoreError::ClaimUnavailable {
            processor: NAME.to_string(),
            segment_id: 0,
        })
    );
}

#[test]
fn extend_claim_without_a_live_claim_fails() {
    let store = initialized_store();
    assert_eq!(
        store.extend_claim(NAME, 0),
        Err(TokenStoreError::ClaimUnavailable {
            processor: NAME.to_string(),
            segment_id: 0,
        })
    );
}

#[test]
fn released_claim_is_immediately_reclaimable() {
    let store = initialized_store();
    store.fetch_token(NAME, 0).unwrap();
    store.store_token(TrackingToken::new(5), NAME, 0).unwrap();

    store.release_claim(NAME, 0).unwrap();

    assert_eq!(store.fetch_token(NAME, 0).unwrap(), TrackingToken::new(5));
}

#[test]
fn storage_identifiers_are_distinct_per_store() {
    let first = InMemoryTokenStore::new();
    let second = InMemoryTokenStore::new();
    let first_id = first.retrieve_storage_identifier().unwrap().unwrap();
    let second_id = second.retrieve_storage_identifier().unwrap().unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(
        first.retrieve_storage_identifier().unwrap().unwrap(),
        first_id
    );
}
