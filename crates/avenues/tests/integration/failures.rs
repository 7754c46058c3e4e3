use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use avenues::{
    Avenue, MemoryCache, ProcessingState, ProduceError, ProducerExt, ResourceState, TaskProducer,
};
use avenues_test::{ManualProducer, Recorder, setup};

type Errors<K> = Arc<Mutex<Vec<(K, ProduceError)>>>;

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    setup();

    let starts = Arc::new(AtomicUsize::new(0));
    let producer = {
        let starts = Arc::clone(&starts);
        TaskProducer::new(tokio::runtime::Handle::current(), move |_key: u32| {
            starts.fetch_add(1, Ordering::SeqCst);
            async { Err::<String, _>(ProduceError::other("E")) }
        })
    };

    let errors: Errors<u32> = Default::default();
    let avenue = {
        let errors = Arc::clone(&errors);
        Avenue::<&str, u32, String>::builder(producer)
            .on_error(move |key: &u32, error: &ProduceError| {
                errors.lock().unwrap().push((*key, error.clone()))
            })
            .build()
    };
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    assert_eq!(
        recorder.wait_for("A", 2).await,
        vec![
            ResourceState::Processing,
            ResourceState::Failed(ProduceError::other("E"))
        ]
    );
    assert_eq!(
        *errors.lock().unwrap(),
        vec![(1, ProduceError::other("E"))]
    );
    assert_eq!(avenue.value(&1), None);
    assert!(!avenue.is_pending(&1));

    avenue.register("A", 1, recorder.callback("A"));
    recorder.wait_for("A", 4).await;
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    assert_eq!(errors.lock().unwrap().len(), 2);
}

#[test]
fn test_failure_reaches_every_claim_once() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let avenue: Avenue<&str, u32, String> =
        Avenue::new(Arc::clone(&producer), MemoryCache::new());
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    avenue.register("B", 1, recorder.callback("B"));
    producer.fail(&1, ProduceError::NotFound);

    let failed = vec![ResourceState::Failed(ProduceError::NotFound)];
    assert_eq!(recorder.finals("A"), failed);
    assert_eq!(recorder.finals("B"), failed);

    // The failed production is released in the producer as well.
    assert_eq!(producer.cancels(), vec![1]);

    // A claimer registering again after the failure starts over.
    avenue.register("B", 1, recorder.callback("B"));
    producer.succeed(&1, "X".into());
    assert_eq!(recorder.finals("A"), failed);
    assert_eq!(
        recorder.finals("B"),
        vec![
            ResourceState::Failed(ProduceError::NotFound),
            ResourceState::Arrived("X".into())
        ]
    );
}

#[test]
fn test_unresolved_keys_never_reach_the_producer() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let mapped = Arc::clone(&producer).map_key(|key: &String| key.parse::<u32>().ok());
    let avenue: Avenue<&str, String, String> = Avenue::new(mapped, MemoryCache::new());
    let recorder = Recorder::new();

    assert_eq!(avenue.status(&"nope".to_owned()), ProcessingState::Undefined);

    avenue.register("A", "nope".to_owned(), recorder.callback("A"));
    let finals = recorder.finals("A");
    assert!(matches!(
        finals.as_slice(),
        [ResourceState::Failed(ProduceError::UnresolvedKey(_))]
    ));
    assert!(producer.starts().is_empty());
    assert!(!avenue.is_pending(&"nope".to_owned()));

    avenue.register("B", "7".to_owned(), recorder.callback("B"));
    assert_eq!(producer.starts(), vec![7]);
    assert_eq!(avenue.status(&"7".to_owned()), ProcessingState::Running);

    producer.succeed(&7, "seven".into());
    assert_eq!(avenue.value(&"7".to_owned()).as_deref(), Some("seven"));
}

#[test]
fn test_malformed_values() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let parsed = Arc::clone(&producer).map_value(|value: String| value.parse::<u64>());
    let avenue: Avenue<&str, u32, u64> = Avenue::new(parsed, MemoryCache::new());
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "not a number".into());

    let finals = recorder.finals("A");
    assert!(matches!(
        finals.as_slice(),
        [ResourceState::Failed(ProduceError::Malformed(_))]
    ));
    assert_eq!(avenue.value(&1), None);

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "42".into());
    assert_eq!(avenue.value(&1), Some(42));
}
