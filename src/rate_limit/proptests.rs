//! Property-based tests for the counter store and limiter
//!
//! ```bash
//! cargo test --lib rate_limit::proptests
//! ```

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::config::RateLimitSpec;
use super::limiter::RateLimiter;
use super::store::{InMemoryStore, RateLimitStore};

const WINDOW: Duration = Duration::from_secs(60);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// Sequences of increments spread over a handful of keys
fn arb_key_sequence() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("key-[0-4]", 1..60)
}

proptest! {
    #[test]
    fn prop_increments_are_isolated_per_key(keys in arb_key_sequence()) {
        let rt = runtime();
        let store = InMemoryStore::new();

        let mut expected: HashMap<String, u64> = HashMap::new();
        rt.block_on(async {
            for key in &keys {
                let count = store.increment(key, WINDOW).await.unwrap().count;
                let entry = expected.entry(key.clone()).or_default();
                *entry += 1;
                // Each key counts 1, 2, 3, ... regardless of other keys
                assert_eq!(count, *entry);
            }
        });

        for (key, count) in expected {
            let record = rt.block_on(store.get(&key)).unwrap().unwrap();
            prop_assert_eq!(record.count, count);
        }
    }

    #[test]
    fn prop_limiter_admits_exactly_limit(limit in 1u32..40, requests in 1usize..80) {
        let rt = runtime();
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryStore::new());
        let limiter = RateLimiter::new(RateLimitSpec::new(limit, 60_000), store);

        let allowed = rt.block_on(async {
            let mut allowed = 0usize;
            for _ in 0..requests {
                if limiter.check("caller").await.unwrap().allowed {
                    allowed += 1;
                }
            }
            allowed
        });

        prop_assert_eq!(allowed, requests.min(limit as usize));
    }
}
