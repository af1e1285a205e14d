mod common;

use common::{is_halted, letters, Pipeline, TOPIC};
use futures::StreamExt;
use kafka_channels::ack::ConsumedRecord;
use kafka_channels::test_utils::RecordingDeadLetterSink;
use kafka_channels::types::TopicPartition;
use kafka_channels::{CommitStrategy, Error, FailureStrategy};
use std::time::Duration;

fn partition() -> TopicPartition {
    TopicPartition::new(TOPIC, 0)
}

#[tokio::test]
async fn test_fail_stop_with_prefetched_messages() {
    common::init_tracing();
    let mut pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::Fail);

    // All ten records were delivered before "b" failed.
    let messages: Vec<_> = letters()
        .into_iter()
        .filter_map(|record| pipeline.engine().register(record))
        .collect();
    let mut halted = 0;
    for message in messages {
        if is_halted(&pipeline.handle(message).await) {
            halted += 1;
        }
    }

    assert_eq!(halted, 1);
    assert_eq!(pipeline.counters.acked(), 9);
    assert_eq!(pipeline.counters.nacked(), 1);
    assert_eq!(pipeline.sink.len(), 8);
    assert!(pipeline.engine().is_halted());

    // Only "a" was committed; nothing past the failed offset.
    assert_eq!(pipeline.committer.commits(), vec![(partition(), 1)]);
    assert_eq!(pipeline.failures.lock().len(), 1);
    assert!(pipeline.failures.lock()[0].contains("cannot process 'b'"));
}

#[tokio::test]
async fn test_fail_stop_halts_the_stream() {
    let mut pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::Fail);
    let mut messages = Box::pin(pipeline.channel.messages(futures::stream::iter(letters())));

    let mut delivered = 0;
    while let Some(message) = messages.next().await {
        delivered += 1;
        let _ = pipeline.handle(message).await;
    }

    assert_eq!(delivered, 2);
    assert_eq!(pipeline.counters.acked(), 1);
    assert_eq!(pipeline.counters.nacked(), 1);
    assert_eq!(pipeline.sink, vec!["A"]);
    assert_eq!(pipeline.engine().committed(&partition()), Some(1));
}

#[tokio::test]
async fn test_halt_ends_a_waiting_stream() {
    let pipeline = Pipeline::new(CommitStrategy::Latest, FailureStrategy::Fail);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ConsumedRecord>();
    let records = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
    let mut messages = Box::pin(pipeline.channel.messages(records));

    tx.send(ConsumedRecord::new(TOPIC, 0, 0).with_payload("b")).unwrap();
    let message = messages.next().await.unwrap();

    // The sender stays open, so this waits for a record that never comes.
    let waiting = tokio::spawn(async move { messages.next().await.is_none() });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(message.nack("rejected").await.is_err());

    let ended = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(ended);
    drop(tx);
}

#[tokio::test]
async fn test_ignore_reaches_every_message() {
    let mut pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::Ignore);
    let mut messages = Box::pin(pipeline.channel.messages(futures::stream::iter(letters())));

    let mut delivered = Vec::new();
    while let Some(message) = messages.next().await {
        delivered.push(message.record().offset);
        pipeline.handle(message).await.unwrap();
    }

    assert_eq!(delivered.len(), 10);
    assert_eq!(pipeline.counters.acked() + pipeline.counters.nacked(), 10);
    assert_eq!(*pipeline.counters.nacked_offsets.lock(), vec![1]);
    assert_eq!(pipeline.sink, vec!["A", "C", "D", "F", "G", "H", "I", "J"]);
    assert_eq!(pipeline.engine().committed(&partition()), Some(10));
    assert!(pipeline.failures.lock().is_empty());
    assert!(pipeline.dead_letter.forwarded().is_empty());
}

#[tokio::test]
async fn test_dead_letter_reaches_every_message() {
    let mut pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::DeadLetterQueue);
    let mut messages = Box::pin(pipeline.channel.messages(futures::stream::iter(letters())));

    while let Some(message) = messages.next().await {
        pipeline.handle(message).await.unwrap();
    }

    assert_eq!(pipeline.counters.acked(), 9);
    assert_eq!(pipeline.counters.nacked(), 1);
    assert_eq!(pipeline.sink, vec!["A", "C", "D", "F", "G", "H", "I", "J"]);
    assert_eq!(pipeline.engine().committed(&partition()), Some(10));

    let forwarded = pipeline.dead_letter.forwarded();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0.payload.as_deref(), Some(&b"b"[..]));
    assert_eq!(forwarded[0].1, "cannot process 'b'");
}

#[tokio::test]
async fn test_dead_letter_failure_stops_the_channel() {
    let mut pipeline = Pipeline::with_dead_letter(
        CommitStrategy::Throttled,
        FailureStrategy::DeadLetterQueue,
        RecordingDeadLetterSink::new().failing(),
    );
    let mut messages = Box::pin(pipeline.channel.messages(futures::stream::iter(letters())));

    let mut errors = Vec::new();
    while let Some(message) = messages.next().await {
        if let Err(e) = pipeline.handle(message).await {
            errors.push(e);
        }
    }

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::DeadLetter { .. }));
    assert!(pipeline.engine().is_halted());
    assert_eq!(pipeline.engine().committed(&partition()), Some(1));
    assert_eq!(pipeline.failures.lock().len(), 1);
}

#[tokio::test]
async fn test_out_of_order_acks_per_strategy() {
    // Ack order 3, 0, 4, 1, 2 over offsets 0..5.
    let order = [3usize, 0, 4, 1, 2];

    for strategy in [CommitStrategy::Throttled, CommitStrategy::Latest] {
        let pipeline = Pipeline::new(strategy, FailureStrategy::Fail);
        let messages: Vec<_> = (0..5)
            .map(|offset| ConsumedRecord::new(TOPIC, 0, offset))
            .filter_map(|record| pipeline.engine().register(record))
            .collect();

        let mut resolved = [false; 5];
        for &index in &order {
            messages[index].ack().await.unwrap();
            resolved[index] = true;

            let committed = pipeline.committer.position(&partition()).unwrap_or(0);
            let lowest_unresolved = resolved.iter().position(|r| !r).unwrap_or(5) as i64;
            match strategy {
                CommitStrategy::Throttled => assert!(committed <= lowest_unresolved),
                CommitStrategy::Latest => {
                    let highest = (0..5).filter(|&i| resolved[i]).max().unwrap() as i64;
                    assert_eq!(committed, highest + 1);
                }
            }
        }

        assert_eq!(pipeline.committer.position(&partition()), Some(5));
    }
}

#[tokio::test]
async fn test_partitions_commit_independently() {
    let pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::Fail);
    let p0 = TopicPartition::new(TOPIC, 0);
    let p1 = TopicPartition::new(TOPIC, 1);

    let first = pipeline.engine().register(ConsumedRecord::new(TOPIC, 0, 7)).unwrap();
    let second = pipeline.engine().register(ConsumedRecord::new(TOPIC, 0, 8)).unwrap();
    let other = pipeline.engine().register(ConsumedRecord::new(TOPIC, 1, 40)).unwrap();

    second.ack().await.unwrap();
    other.ack().await.unwrap();
    assert_eq!(pipeline.committer.position(&p0), None);
    assert_eq!(pipeline.committer.position(&p1), Some(41));

    first.ack().await.unwrap();
    assert_eq!(pipeline.committer.position(&p0), Some(9));
}

#[tokio::test]
async fn test_derived_message_shares_acknowledgment() {
    let pipeline = Pipeline::new(CommitStrategy::Throttled, FailureStrategy::Ignore);
    let message = pipeline
        .engine()
        .register(ConsumedRecord::new(TOPIC, 0, 0).with_payload("a"))
        .unwrap();

    let derived = message.with_payload(42u32);
    assert_eq!(*derived.payload(), 42);
    derived.ack().await.unwrap();
    derived.nack("again").await.unwrap();

    assert!(derived.is_resolved());
    assert_eq!(pipeline.counters.acked(), 1);
    assert_eq!(pipeline.counters.nacked(), 0);
    assert_eq!(pipeline.committer.commits().len(), 1);
}
