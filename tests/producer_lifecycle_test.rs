mod common;

use common::{lazy_options, producer};
use kafka_channels::config;
use kafka_channels::kafka::{HandlerRegistry, KafkaProducerFactory};
use kafka_channels::observe::Observers;
use kafka_channels::test_utils::MockFactory;
use kafka_channels::{CloseOutcome, Error, OutgoingRecord, ProducerManager};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_get_handle_constructs_once() {
    common::init_tracing();
    let factory = MockFactory::new().creation_delay(Duration::from_millis(50));
    let manager = Arc::new(producer("concurrent", &factory));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_handle().await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(factory.attempts(), 1);
    assert!(handles.windows(2).all(|pair| pair[0].ptr_eq(&pair[1])));
}

#[tokio::test]
async fn test_concurrent_get_handle_shares_failure() {
    let factory = MockFactory::new()
        .fail_creation(usize::MAX)
        .creation_delay(Duration::from_millis(20));
    let reported = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&reported);
    let manager = Arc::new(
        ProducerManager::new(
            lazy_options("broken"),
            factory.clone(),
            &HandlerRegistry::new(),
            Observers::default().with_failure(move |_| *counter.lock() += 1),
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_handle().await })
        })
        .collect();

    let mut causes = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Err(Error::ProducerInit { source, .. }) => causes.push(source),
            other => panic!("unexpected: {:?}", other),
        }
    }

    assert_eq!(factory.attempts(), 1);
    assert_eq!(*reported.lock(), 1);
    assert!(causes.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test]
async fn test_transaction_boundary_follows_send() {
    let factory = MockFactory::new();
    let manager = producer("tx", &factory);

    let begin = manager.begin_transaction();
    let sends: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| manager.send(OutgoingRecord::to("letters").payload(payload)))
        .collect();
    let commit = manager.commit_transaction();

    commit.await.unwrap();
    for send in sends {
        send.await.unwrap();
    }
    begin.await.unwrap();

    let producer = factory.producer();
    assert_eq!(
        producer.operations(),
        vec![
            "begin_transaction",
            "send:letters",
            "send:letters",
            "send:letters",
            "commit_transaction",
        ]
    );
    let values: Vec<_> = producer
        .records()
        .into_iter()
        .map(|r| r.value.unwrap())
        .collect();
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[tokio::test]
async fn test_operations_from_many_tasks_never_overlap() {
    let factory = MockFactory::new();
    let manager = Arc::new(producer("overlap", &factory));
    let running = Arc::new(Mutex::new(false));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let running = Arc::clone(&running);
            manager.run_on_sending_thread(move |_| {
                let was_running = std::mem::replace(&mut *running.lock(), true);
                thread::sleep(Duration::from_millis(1));
                *running.lock() = false;
                Ok(was_running)
            })
        })
        .collect();

    for task in tasks {
        assert!(!task.await.unwrap());
    }
}

#[test]
fn test_concurrent_close_closes_once() {
    let factory = MockFactory::new();
    let manager = Arc::new(producer("closing", &factory));
    let handle = futures::executor::block_on(manager.get_handle()).unwrap();
    assert!(handle.is_open());

    let closers: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.close())
        })
        .collect();
    let mut outcomes: Vec<_> = closers.into_iter().map(|t| t.join().unwrap()).collect();
    outcomes.sort_by_key(|o| *o == CloseOutcome::AlreadyClosed);

    assert_eq!(outcomes, vec![CloseOutcome::Closed, CloseOutcome::AlreadyClosed]);
    assert_eq!(factory.producer().close_calls(), 1);
    assert!(!handle.is_open());
    assert!(matches!(
        futures::executor::block_on(manager.flush()),
        Err(Error::Closed { .. })
    ));
}

#[test]
fn test_close_waits_for_queued_operations() {
    let factory = MockFactory::new();
    let manager = producer("draining", &factory);

    let slow = manager.run_on_sending_thread(|_| {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    assert_eq!(manager.close(), CloseOutcome::Closed);
    assert!(futures::executor::block_on(slow).is_ok());
}

#[test]
fn test_close_before_first_use() {
    let factory = MockFactory::new();
    let manager = producer("unused", &factory);
    assert_eq!(manager.close(), CloseOutcome::Closed);
    assert_eq!(factory.attempts(), 0);
}

#[tokio::test]
async fn test_eager_misconfiguration_fails_at_startup() {
    let options = lazy_options("eager")
        .lazy(false)
        .property(config::BOOTSTRAP_SERVERS, "localhost:9092")
        .property("no.such.property", "1");

    let result = ProducerManager::new(
        options,
        KafkaProducerFactory,
        &HandlerRegistry::new(),
        Observers::default(),
    );
    match result {
        Err(e) => assert!(e.kafka_error().is_some(), "unexpected error: {}", e),
        Ok(_) => panic!("producer should not start"),
    }
}

#[tokio::test]
#[ignore] // Requires a broker on localhost:9092
async fn test_round_trip_against_broker() {
    common::init_tracing();
    let options = lazy_options("round-trip")
        .property(config::BOOTSTRAP_SERVERS, "localhost:9092")
        .property(config::ACKS, "all");
    let manager = ProducerManager::new(
        options,
        KafkaProducerFactory,
        &HandlerRegistry::new(),
        Observers::default(),
    )
    .unwrap();

    let metadata = manager
        .send(OutgoingRecord::to("kafka-channels-round-trip").key("k").payload("v"))
        .await
        .unwrap();
    assert_eq!(metadata.topic, "kafka-channels-round-trip");
    assert!(metadata.offset >= 0);

    let partitions = manager.partitions_for("kafka-channels-round-trip").await.unwrap();
    assert!(partitions.iter().any(|p| p.partition == metadata.partition));

    assert_eq!(manager.close_async().await, CloseOutcome::Closed);
}
