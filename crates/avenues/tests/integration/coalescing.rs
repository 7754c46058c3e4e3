use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use avenues::{Avenue, Cache, MemoryCache, ProducerExt, ResourceState, TaskProducer};
use avenues_test::{ManualProducer, Recorder, setup};

type TestAvenue = Avenue<&'static str, u32, String>;

fn manual_avenue() -> (TestAvenue, Arc<ManualProducer<u32, String>>) {
    let producer = ManualProducer::shared();
    let avenue = Avenue::new(Arc::clone(&producer), MemoryCache::new());
    (avenue, producer)
}

#[test]
fn test_concurrent_registrations_start_once() {
    setup();

    const CLAIMERS: [&str; 8] = ["a", "b", "c", "d", "e", "f", "g", "h"];

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    std::thread::scope(|scope| {
        for claimer in CLAIMERS {
            let avenue = avenue.clone();
            let callback = recorder.callback(claimer);
            scope.spawn(move || avenue.register(claimer, 1, callback));
        }
    });

    assert_eq!(producer.starts(), vec![1]);
    assert_eq!(avenue.interest(&1), CLAIMERS.len());

    producer.succeed(&1, "X".into());

    for claimer in CLAIMERS {
        assert_eq!(
            recorder.states(claimer),
            vec![ResourceState::Processing, ResourceState::Arrived("X".into())]
        );
    }
    assert!(!avenue.is_pending(&1));
}

#[tokio::test(start_paused = true)]
async fn test_two_claimers_share_one_production() {
    setup();

    let starts = Arc::new(AtomicUsize::new(0));
    let producer = {
        let starts = Arc::clone(&starts);
        TaskProducer::new(tokio::runtime::Handle::current(), move |_key: u32| {
            starts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("X".to_owned())
            }
        })
    };
    let avenue: TestAvenue = Avenue::new(producer, MemoryCache::new());
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    avenue.register("B", 1, recorder.callback("B"));

    let expected = vec![ResourceState::Processing, ResourceState::Arrived("X".into())];
    assert_eq!(recorder.wait_for("A", 2).await, expected);
    assert_eq!(recorder.wait_for("B", 2).await, expected);

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(avenue.cache().get(&1).as_deref(), Some("X"));
}

#[test]
fn test_late_claims_receive_existing() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "X".into());

    avenue.register("C", 1, recorder.callback("C"));

    assert_eq!(
        recorder.states("C"),
        vec![ResourceState::Existing("X".into())]
    );
    assert_eq!(producer.start_count(&1), 1);
    assert_eq!(recorder.finals("A").len(), 1);
}

#[test]
fn test_cache_hit_bypasses_production() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let cache = Arc::new(MemoryCache::<u32, String>::new());
    cache.set("cached".to_owned(), 1);
    let avenue: TestAvenue = Avenue::new(Arc::clone(&producer), Arc::clone(&cache));
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));

    assert_eq!(
        recorder.states("A"),
        vec![ResourceState::Existing("cached".into())]
    );
    assert!(producer.starts().is_empty());
    assert_eq!(avenue.interest(&1), 0);
    assert!(!avenue.is_pending(&1));
}

#[test]
fn test_second_completion_is_discarded() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    // The first production is abandoned, but the producer keeps its completion around.
    avenue.register("A", 1, recorder.callback("A"));
    avenue.cancel(&1);
    avenue.register("B", 1, recorder.callback("B"));
    assert_eq!(producer.start_count(&1), 2);

    producer.succeed(&1, "first".into());
    producer.succeed(&1, "second".into());

    assert_eq!(recorder.finals("A"), vec![ResourceState::Arrived("first".into())]);
    assert_eq!(recorder.finals("B"), vec![ResourceState::Arrived("first".into())]);
    assert_eq!(avenue.value(&1).as_deref(), Some("first"));
}

#[test]
fn test_replacing_a_claim_moves_it() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    avenue.register("A", 2, recorder.callback("A"));
    assert_eq!(avenue.claimed_key(&"A"), Some(2));
    assert!(avenue.claimers(&1).is_empty());

    producer.succeed(&1, "one".into());
    producer.succeed(&2, "two".into());

    assert_eq!(recorder.finals("A"), vec![ResourceState::Arrived("two".into())]);
}

#[test]
fn test_force_load_refreshes_waiting_claims() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "old".into());

    avenue.register("B", 1, recorder.callback("B"));
    avenue.force_load(1);
    assert_eq!(producer.start_count(&1), 2);
    assert_eq!(avenue.value(&1).as_deref(), Some("old"));

    producer.succeed(&1, "new".into());

    assert_eq!(
        recorder.states("B"),
        vec![
            ResourceState::Existing("old".into()),
            ResourceState::Arrived("new".into())
        ]
    );
    // `A` has been notified of an arrival already.
    assert_eq!(recorder.finals("A"), vec![ResourceState::Arrived("old".into())]);
    assert_eq!(avenue.value(&1).as_deref(), Some("new"));
}

#[test]
fn test_preload_fills_the_cache() {
    setup();

    let (avenue, producer) = manual_avenue();

    avenue.preload(3);
    avenue.preload(3);
    assert_eq!(producer.starts(), vec![3]);

    producer.succeed(&3, "three".into());
    assert_eq!(avenue.value(&3).as_deref(), Some("three"));

    avenue.preload(3);
    assert_eq!(producer.starts(), vec![3]);
}

#[test]
fn test_invalidate_produces_again() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "X".into());

    assert_eq!(avenue.invalidate(&1).as_deref(), Some("X"));
    avenue.register("B", 1, recorder.callback("B"));

    assert_eq!(producer.start_count(&1), 2);
    assert_eq!(recorder.states("B"), vec![ResourceState::Processing]);
}

#[test]
fn test_keys_resolving_alike_share_one_production() {
    setup();

    let producer = ManualProducer::<String, String>::shared();
    let lowercased = Arc::clone(&producer).map_key(|key: &String| Some(key.to_lowercase()));
    let avenue: Avenue<&str, String, String> = Avenue::new(lowercased, MemoryCache::new());
    let recorder = Recorder::new();
    let lower = "a.png".to_owned();
    let upper = "A.PNG".to_owned();

    avenue.register("X", lower.clone(), recorder.callback("X"));
    avenue.register("Y", upper.clone(), recorder.callback("Y"));
    assert_eq!(producer.starts(), vec![lower.clone()]);
    assert!(avenue.is_pending(&upper));

    producer.succeed(&lower, "image".into());

    let expected = vec![
        ResourceState::Processing,
        ResourceState::Arrived("image".into()),
    ];
    assert_eq!(recorder.states("X"), expected);
    assert_eq!(recorder.states("Y"), expected);
    assert!(!avenue.is_pending(&lower));
    assert!(!avenue.is_pending(&upper));
    assert_eq!(avenue.value(&upper).as_deref(), Some("image"));

    avenue.invalidate(&upper);
    avenue.register("Z", upper.clone(), recorder.callback("Z"));
    assert_eq!(producer.start_count(&lower), 2);
    producer.succeed(&lower, "fresh".into());
    assert_eq!(recorder.finals("Z"), vec![ResourceState::Arrived("fresh".into())]);
}

#[test]
fn test_cancelling_one_of_two_keys_resolving_alike() {
    setup();

    let producer = ManualProducer::<String, String>::shared();
    let lowercased = Arc::clone(&producer).map_key(|key: &String| Some(key.to_lowercase()));
    let avenue: Avenue<&str, String, String> = Avenue::new(lowercased, MemoryCache::new());
    let recorder = Recorder::new();
    let lower = "a.png".to_owned();
    let upper = "A.PNG".to_owned();

    avenue.register("X", lower.clone(), recorder.callback("X"));
    avenue.register("Y", upper.clone(), recorder.callback("Y"));

    avenue.cancel(&lower);
    assert!(producer.cancels().is_empty());
    assert!(!avenue.is_pending(&lower));
    assert!(avenue.is_pending(&upper));

    producer.succeed(&lower, "image".into());
    assert!(recorder.finals("X").is_empty());
    assert_eq!(recorder.finals("Y"), vec![ResourceState::Arrived("image".into())]);
    assert!(!avenue.is_pending(&upper));
}

#[tokio::test(start_paused = true)]
async fn test_keys_resolving_alike_share_one_task() {
    setup();

    let starts = Arc::new(AtomicUsize::new(0));
    let producer = {
        let starts = Arc::clone(&starts);
        TaskProducer::new(tokio::runtime::Handle::current(), move |key: String| {
            starts.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(format!("contents of {key}"))
            }
        })
    };
    let lowercased = producer.map_key(|key: &String| Some(key.to_lowercase()));
    let avenue: Avenue<&str, String, String> = Avenue::new(lowercased, MemoryCache::new());
    let recorder = Recorder::new();

    avenue.register("X", "a.png".to_owned(), recorder.callback("X"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    avenue.register("Y", "A.PNG".to_owned(), recorder.callback("Y"));

    let expected = vec![
        ResourceState::Processing,
        ResourceState::Arrived("contents of a.png".into()),
    ];
    assert_eq!(recorder.wait_for("X", 2).await, expected);
    assert_eq!(recorder.wait_for("Y", 2).await, expected);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert!(!avenue.is_pending(&"A.PNG".to_owned()));
}
