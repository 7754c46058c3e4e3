use std::sync::{Arc, Mutex};

use avenues::config::{CacheConfig, Config, DeliveryMode};
use avenues::{Avenue, Delivery, ProduceError, ResourceState};
use avenues_test::{ManualProducer, Recorder, setup};

type TestAvenue = Avenue<&'static str, u32, String>;

#[test]
fn test_queued_delivery() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let (delivery, mut queue) = Delivery::queue();
    let avenue = TestAvenue::builder(Arc::clone(&producer))
        .delivery(delivery)
        .build();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    assert!(recorder.states("A").is_empty());
    assert_eq!(queue.len(), 1);

    producer.succeed(&1, "X".into());
    assert_eq!(queue.drain(), 2);
    assert_eq!(
        recorder.states("A"),
        vec![ResourceState::Processing, ResourceState::Arrived("X".into())]
    );

    avenue.register("B", 1, recorder.callback("B"));
    assert!(recorder.states("B").is_empty());
    queue.drain();
    assert_eq!(
        recorder.states("B"),
        vec![ResourceState::Existing("X".into())]
    );
    assert!(queue.is_empty());
}

#[test]
fn test_error_sink_uses_delivery() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let (delivery, mut queue) = Delivery::queue();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let avenue = {
        let errors = Arc::clone(&errors);
        TestAvenue::builder(Arc::clone(&producer))
            .delivery(delivery)
            .on_error(move |key: &u32, error: &ProduceError| {
                errors.lock().unwrap().push((*key, error.clone()))
            })
            .build()
    };

    avenue.preload(1);
    producer.fail(&1, ProduceError::InternalError);
    assert!(errors.lock().unwrap().is_empty());

    queue.drain();
    assert_eq!(
        *errors.lock().unwrap(),
        vec![(1, ProduceError::InternalError)]
    );
}

#[tokio::test]
async fn test_runtime_delivery() {
    setup();

    let producer = ManualProducer::<u32, String>::shared();
    let avenue = TestAvenue::builder(Arc::clone(&producer))
        .delivery(Delivery::current_runtime())
        .build();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    producer.succeed(&1, "X".into());

    assert_eq!(
        recorder.wait_for("A", 2).await,
        vec![ResourceState::Processing, ResourceState::Arrived("X".into())]
    );
}

#[tokio::test]
async fn test_delivery_from_config() {
    setup();

    let config = Config {
        delivery: DeliveryMode::Runtime,
        cache: CacheConfig {
            capacity: Some(16),
        },
        ..Config::default()
    };

    let producer = ManualProducer::<u32, String>::shared();
    let avenue = TestAvenue::builder(Arc::clone(&producer))
        .name("configured")
        .with_config(&config)
        .build();
    let recorder = Recorder::new();

    avenue.register("A", 1, recorder.callback("A"));
    // Runtime delivery never runs callbacks on the registering thread.
    assert!(recorder.states("A").is_empty());

    producer.succeed(&1, "X".into());
    recorder.wait_for("A", 2).await;

    assert_eq!(avenue.name(), "configured");
    assert_eq!(avenue.value(&1).as_deref(), Some("X"));
}

#[test]
fn test_runtime_delivery_outside_runtime_is_inline() {
    assert!(matches!(Delivery::current_runtime(), Delivery::Inline));
}
