use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use avenues::{Avenue, MemoryCache, ProcessingState, ResourceState, TaskProducer};
use avenues_test::{ManualProducer, Recorder, setup};

type TestAvenue = Avenue<&'static str, u32, String>;

fn manual_avenue() -> (TestAvenue, Arc<ManualProducer<u32, String>>) {
    let producer = ManualProducer::shared();
    let avenue = Avenue::new(Arc::clone(&producer), MemoryCache::new());
    (avenue, producer)
}

#[test]
fn test_cancel_only_after_last_interest() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    avenue.register("B", 1, recorder.callback("B"));

    avenue.cancel(&1);
    assert!(producer.cancels().is_empty());
    assert_eq!(avenue.interest(&1), 1);

    avenue.cancel(&1);
    assert_eq!(producer.cancels(), vec![1]);
    assert!(!avenue.is_pending(&1));
}

#[test]
fn test_single_claimer_cancels() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 2, recorder.callback("A"));
    avenue.cancel(&2);

    assert_eq!(producer.cancels(), vec![2]);
    assert_eq!(avenue.interest(&2), 0);
    assert!(!avenue.is_pending(&2));
    assert_eq!(avenue.status(&2), ProcessingState::None);

    // Nothing happens when cancelling what is not pending.
    avenue.cancel(&2);
    assert_eq!(producer.cancels(), vec![2]);
}

#[test]
fn test_cancelled_production_completes_into_the_void() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    avenue.cancel(&1);
    producer.succeed(&1, "late".into());

    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);
    assert_eq!(avenue.value(&1), None);
}

#[test]
fn test_cancel_all() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    avenue.register("B", 2, recorder.callback("B"));
    avenue.cancel_all();

    assert_eq!(producer.cancel_alls(), 1);
    assert!(!avenue.is_pending(&1));
    assert!(!avenue.is_pending(&2));

    producer.succeed(&1, "late".into());
    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);

    // Claims survive, a new production notifies them.
    avenue.force_load(2);
    producer.succeed(&2, "fresh".into());
    assert_eq!(recorder.finals("B"), vec![ResourceState::Arrived("fresh".into())]);
}

#[test]
fn test_unregister() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    assert!(avenue.unregister(&"A"));
    assert!(!avenue.unregister(&"A"));
    assert_eq!(avenue.claimed_key(&"A"), None);

    // Unregistering does not give up interest.
    assert!(producer.cancels().is_empty());
    producer.succeed(&1, "X".into());

    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);
    assert_eq!(avenue.value(&1).as_deref(), Some("X"));
}

#[test]
fn test_dropping_the_avenue() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    let clone = avenue.clone();
    drop(avenue);
    assert_eq!(producer.cancel_alls(), 0);

    drop(clone);
    assert_eq!(producer.cancel_alls(), 1);

    producer.succeed(&1, "X".into());
    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);
}

#[test]
fn test_dead_owners_lose_their_claims() {
    setup();

    let (avenue, producer) = manual_avenue();
    let received = Arc::new(AtomicUsize::new(0));

    let owner = Arc::new(Arc::clone(&received));
    avenue.register_weak("A", 1, &owner, |received, state| {
        if state.is_final() {
            received.fetch_add(1, Ordering::SeqCst);
        }
    });
    drop(owner);

    producer.succeed(&1, "X".into());

    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert_eq!(avenue.claimed_key(&"A"), None);
    assert!(avenue.claimers(&1).is_empty());
}

#[test]
fn test_liveness_is_checked_at_delivery() {
    setup();

    let (avenue, producer) = manual_avenue();
    let recorder = Recorder::new();
    let alive = Arc::new(AtomicBool::new(true));

    {
        let alive = Arc::clone(&alive);
        avenue.register_with(
            "A",
            1,
            move || alive.load(Ordering::SeqCst),
            recorder.callback("A"),
        );
    }
    avenue.register("B", 1, recorder.callback("B"));

    alive.store(false, Ordering::SeqCst);
    producer.succeed(&1, "X".into());

    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);
    assert_eq!(recorder.finals("B"), vec![ResourceState::Arrived("X".into())]);
    assert_eq!(avenue.claimers(&1), vec!["B"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_aborts_task() {
    setup();

    let finished = Arc::new(AtomicBool::new(false));
    let producer = {
        let finished = Arc::clone(&finished);
        TaskProducer::new(tokio::runtime::Handle::current(), move |key: u32| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(key.to_string())
            }
        })
    };
    let avenue: TestAvenue = Avenue::new(producer, MemoryCache::new());
    let recorder = Recorder::new();

    avenue.register("A", 2, recorder.callback("A"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(avenue.status(&2), ProcessingState::Running);

    avenue.cancel(&2);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(avenue.status(&2), ProcessingState::None);
    assert_eq!(recorder.states("A"), vec![ResourceState::Processing]);
    assert_eq!(avenue.value(&2), None);
}
