//! Integration tests for the processing pipeline.
//!
//! Tests: EventSource → StreamProcessor → EventProcessor → StateRepository,
//! and Event Horizon connection → queue → subscription processor.
//!
//! Verifies:
//! - Failed events are retried at their retry time and processing resumes
//! - Stored state is the resume point across restarts and reconnects
//! - A failing partition does not hold up the others
//! - Operator commands reach a running processor

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use streamline_core::{
        EventLogSequenceNumber, EventProcessorId, MicroserviceId, PartitionId, ProcessingPosition, ProcessorKey,
        ScopeId, StreamId, StreamPosition, StreamProcessorId, SubscriptionId, TenantId,
    };
    use streamline_events::{
        Cancellation, CommittedEvent, EventProcessor, ExecutionContext, ProcessingResult, StreamEvent,
        StreamProcessorState, UnpartitionedState,
    };

    use crate::clock::TokioClock;
    use crate::config::{EventHorizonConfig, StreamProcessorConfig};
    use crate::event_horizon::{
        ConnectionError, ConnectionFailure, EventHorizonConnection, EventHorizonConnectionFactory,
        EventQueueWriter, MicroserviceAddress, SubscriptionResponse, SubscriptionState, Subscriptions,
    };
    use crate::event_source::InMemoryEventSource;
    use crate::processing::StreamProcessor;
    use crate::resilience::RetryPolicy;
    use crate::state_store::{InMemoryStateRepository, RepositoryError, StreamProcessorStateRepository};

    // ---- test doubles ----

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Call {
        log: u64,
        partition: String,
        retry_count: Option<u32>,
    }

    fn call(log: u64, partition: &str, retry_count: Option<u32>) -> Call {
        Call {
            log,
            partition: partition.to_string(),
            retry_count,
        }
    }

    type Script = Box<dyn Fn(&Call) -> ProcessingResult + Send + Sync>;

    struct Recorder {
        id: EventProcessorId,
        calls: Mutex<Vec<Call>>,
        script: Script,
    }

    impl Recorder {
        fn new(script: impl Fn(&Call) -> ProcessingResult + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                id: EventProcessorId::new(),
                calls: Mutex::new(Vec::new()),
                script: Box::new(script),
            })
        }

        fn succeeding() -> Arc<Self> {
            Self::new(|_| ProcessingResult::Succeeded)
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> ProcessingResult {
            let result = (self.script)(&call);
            self.calls.lock().unwrap().push(call);
            result
        }
    }

    #[async_trait::async_trait]
    impl EventProcessor for Recorder {
        fn identifier(&self) -> EventProcessorId {
            self.id
        }

        async fn process(
            &self,
            event: &CommittedEvent,
            partition: &PartitionId,
            _context: &ExecutionContext,
            _cancellation: &Cancellation,
        ) -> ProcessingResult {
            self.record(call(event.event_log_sequence_number().value(), partition.as_str(), None))
        }

        async fn reprocess(
            &self,
            event: &CommittedEvent,
            partition: &PartitionId,
            _reason: &str,
            retry_count: u32,
            _context: &ExecutionContext,
            _cancellation: &Cancellation,
        ) -> ProcessingResult {
            self.record(call(
                event.event_log_sequence_number().value(),
                partition.as_str(),
                Some(retry_count),
            ))
        }
    }

    /// Repository whose first `failures` persists fail.
    struct FlakyRepository {
        inner: InMemoryStateRepository,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl StreamProcessorStateRepository for FlakyRepository {
        async fn try_get(&self, key: &ProcessorKey) -> Result<Option<StreamProcessorState>, RepositoryError> {
            self.inner.try_get(key).await
        }

        async fn persist(&self, key: &ProcessorKey, state: &StreamProcessorState) -> Result<(), RepositoryError> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(RepositoryError::Unavailable("database down".to_string()));
            }
            self.inner.persist(key, state).await
        }
    }

    #[derive(Default)]
    struct Producer {
        refuse_first: u32,
        events: Vec<StreamEvent>,
        /// The first session is lost after sending this many events.
        lose_first_session_after: Option<usize>,
        sessions: AtomicU32,
        creates: AtomicU32,
        connects: Mutex<Vec<StreamPosition>>,
        receiving_stopped: AtomicBool,
    }

    struct ProducerFactory(Arc<Producer>);

    impl EventHorizonConnectionFactory for ProducerFactory {
        fn create(&self, _address: &MicroserviceAddress) -> Box<dyn EventHorizonConnection> {
            self.0.creates.fetch_add(1, Ordering::SeqCst);
            Box::new(ProducerConnection {
                producer: self.0.clone(),
                from: StreamPosition::START,
            })
        }
    }

    struct ProducerConnection {
        producer: Arc<Producer>,
        from: StreamPosition,
    }

    #[async_trait::async_trait]
    impl EventHorizonConnection for ProducerConnection {
        async fn connect(
            &mut self,
            _subscription: &SubscriptionId,
            from: StreamPosition,
            _cancellation: &Cancellation,
        ) -> SubscriptionResponse {
            self.from = from;
            let attempt = {
                let mut connects = self.producer.connects.lock().unwrap();
                connects.push(from);
                connects.len() as u32
            };
            if attempt <= self.producer.refuse_first {
                SubscriptionResponse::Failure(ConnectionFailure::new("producer unavailable"))
            } else {
                SubscriptionResponse::Success {
                    consent_id: Uuid::now_v7(),
                }
            }
        }

        async fn start_receiving_events_into(
            &mut self,
            queue: EventQueueWriter,
            cancellation: Cancellation,
        ) -> Result<(), ConnectionError> {
            let session = self.producer.sessions.fetch_add(1, Ordering::SeqCst);
            let lose_after = self.producer.lose_first_session_after.filter(|_| session == 0);
            for (sent, event) in self.producer.events.iter().filter(|e| e.position() >= self.from).enumerate() {
                if lose_after == Some(sent) {
                    // Let the consumer work through what it has received.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return Err(ConnectionError::Lost("producer restarted".to_string()));
                }
                queue
                    .enqueue(event.clone(), &cancellation)
                    .await
                    .map_err(|_| ConnectionError::Cancelled)?;
            }
            cancellation.cancelled().await;
            self.producer.receiving_stopped.store(true, Ordering::SeqCst);
            Err(ConnectionError::Cancelled)
        }
    }

    // ---- helpers ----

    fn context() -> ExecutionContext {
        ExecutionContext::new(MicroserviceId::new(), TenantId::new())
    }

    fn processor_key() -> ProcessorKey {
        StreamProcessorId::new(ScopeId::DEFAULT, EventProcessorId::new(), StreamId::new()).into()
    }

    fn subscription_id() -> SubscriptionId {
        SubscriptionId {
            consumer_tenant_id: TenantId::new(),
            producer_microservice_id: MicroserviceId::new(),
            producer_tenant_id: TenantId::new(),
            scope_id: ScopeId::new(),
            stream_id: StreamId::new(),
            partition_id: PartitionId::not_set(),
        }
    }

    fn public_events(count: u64) -> Vec<StreamEvent> {
        let stream_id = StreamId::new();
        (0..count)
            .map(|n| public_event(stream_id, n, PartitionId::not_set(), false))
            .collect()
    }

    fn partitioned_public_events(partitions: &[&str]) -> Vec<StreamEvent> {
        let stream_id = StreamId::new();
        partitions
            .iter()
            .zip(0u64..)
            .map(|(partition, n)| public_event(stream_id, n, PartitionId::from(*partition), true))
            .collect()
    }

    fn public_event(stream_id: StreamId, n: u64, partition: PartitionId, partitioned: bool) -> StreamEvent {
        StreamEvent::new(
            CommittedEvent::new(
                EventLogSequenceNumber::new(n),
                Utc::now(),
                "producer",
                "public_event",
                true,
                serde_json::json!({ "n": n }),
            ),
            StreamPosition::new(n),
            stream_id,
            partition,
            partitioned,
        )
    }

    fn stream_processor(
        key: &ProcessorKey,
        partitioned: bool,
        source: &Arc<InMemoryEventSource>,
        processor: &Arc<Recorder>,
        repository: Arc<dyn StreamProcessorStateRepository>,
        config: StreamProcessorConfig,
    ) -> Arc<StreamProcessor> {
        streamline_observability::init_for_tests();
        Arc::new(
            StreamProcessor::new(key.clone(), partitioned, source.clone(), processor.clone(), repository, context())
                .with_config(config)
                .with_clock(Arc::new(TokioClock::new())),
        )
    }

    async fn stored_state_matching(
        repository: &dyn StreamProcessorStateRepository,
        key: &ProcessorKey,
        what: &str,
        matches: impl Fn(&StreamProcessorState) -> bool,
    ) -> StreamProcessorState {
        for _ in 0..10_000 {
            if let Some(state) = repository.try_get(key).await.unwrap() {
                if matches(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for stored state: {what}");
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn at_stream_position(position: u64) -> impl Fn(&StreamProcessorState) -> bool {
        move |state| state.position().stream_position == StreamPosition::new(position) && !state.is_failing()
    }

    // ---- linear processing ----

    #[tokio::test(start_paused = true)]
    async fn failed_event_is_retried_at_its_retry_time() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), false));
        for n in 0..3 {
            source.append("e", PartitionId::not_set(), serde_json::json!({ "n": n }));
        }
        let processor = Recorder::new(|call| {
            if call.log == 1 && call.retry_count.is_none() {
                ProcessingResult::retry("not yet", Duration::from_secs(5))
            } else {
                ProcessingResult::Succeeded
            }
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            false,
            &source,
            &processor,
            repository.clone(),
            StreamProcessorConfig::default(),
        );

        let started = tokio::time::Instant::now();
        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();

        let failing = stored_state_matching(repository.as_ref(), &key, "failing", |s| s.is_failing()).await;
        let StreamProcessorState::Unpartitioned(failing) = failing else {
            panic!("expected unpartitioned state");
        };
        assert_eq!(failing.position(), ProcessingPosition::new(1, 1));
        assert_eq!(failing.processing_attempts(), 1);
        assert_eq!(failing.failure_reason(), "not yet");

        stored_state_matching(repository.as_ref(), &key, "all processed", at_stream_position(3)).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        handle.shutdown().await.unwrap();

        assert_eq!(
            processor.calls(),
            vec![call(0, "", None), call(1, "", None), call(1, "", Some(1)), call(2, "", None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_from_stored_state() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), false));
        source.append("e", PartitionId::not_set(), serde_json::json!({}));
        source.append("e", PartitionId::not_set(), serde_json::json!({}));
        let processor = Recorder::succeeding();
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            false,
            &source,
            &processor,
            repository.clone(),
            StreamProcessorConfig::default(),
        );

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        stored_state_matching(repository.as_ref(), &key, "first run", at_stream_position(2)).await;
        handle.shutdown().await.unwrap();
        assert!(!stream_processor.is_running());

        source.append("e", PartitionId::not_set(), serde_json::json!({}));
        source.append("e", PartitionId::not_set(), serde_json::json!({}));

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        stored_state_matching(repository.as_ref(), &key, "second run", at_stream_position(4)).await;
        handle.shutdown().await.unwrap();

        let logs: Vec<u64> = processor.calls().iter().map(|c| c.log).collect();
        assert_eq!(logs, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_running() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), false));
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            false,
            &source,
            &Recorder::succeeding(),
            Arc::new(InMemoryStateRepository::new()),
            StreamProcessorConfig::default(),
        );

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        let err = stream_processor.start(&Cancellation::new()).await.unwrap_err();
        assert!(matches!(err, crate::processing::StreamProcessorError::AlreadyRunning(_)));

        handle.shutdown().await.unwrap();
        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unpersisted_transition_is_retried_not_skipped() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), false));
        source.append("e", PartitionId::not_set(), serde_json::json!({}));
        let processor = Recorder::succeeding();
        let repository = Arc::new(FlakyRepository {
            inner: InMemoryStateRepository::new(),
            failures: AtomicU32::new(2),
        });
        let key = processor_key();
        let config = StreamProcessorConfig::default()
            .with_persistence_policy(RetryPolicy::no_retry())
            .with_infrastructure_retry_delay(Duration::from_secs(1));
        let stream_processor = stream_processor(&key, false, &source, &processor, repository.clone(), config);

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        stored_state_matching(repository.as_ref(), &key, "persisted", at_stream_position(1)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(
            processor.calls(),
            vec![call(0, "", None), call(0, "", Some(1)), call(0, "", Some(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_reaches_a_running_processor() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), false));
        source.append("e", PartitionId::not_set(), serde_json::json!({ "poison": true }));
        source.append("e", PartitionId::not_set(), serde_json::json!({}));
        let processor = Recorder::new(|call| {
            if call.log == 0 {
                ProcessingResult::fatal("poison")
            } else {
                ProcessingResult::Succeeded
            }
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            false,
            &source,
            &processor,
            repository.clone(),
            StreamProcessorConfig::default(),
        );

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        stored_state_matching(repository.as_ref(), &key, "stuck", |s| s.is_failing()).await;

        let skipped = stream_processor
            .skip_events_before(EventLogSequenceNumber::new(1))
            .await
            .unwrap();
        assert!(!skipped.is_failing());

        stored_state_matching(repository.as_ref(), &key, "past the skip", at_stream_position(2)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(processor.calls(), vec![call(0, "", None), call(1, "", None)]);
    }

    // ---- partitioned processing ----

    #[tokio::test(start_paused = true)]
    async fn failing_partition_is_caught_up_without_blocking_others() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), true));
        for partition in ["A", "B", "A", "B"] {
            source.append("e", partition, serde_json::json!({}));
        }
        let processor = Recorder::new(|call| {
            if call.partition == "A" && call.retry_count.is_none() {
                ProcessingResult::failed("A is down", true, Duration::from_secs(10))
            } else {
                ProcessingResult::Succeeded
            }
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            true,
            &source,
            &processor,
            repository.clone(),
            StreamProcessorConfig::default(),
        );

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();

        let stalled = stored_state_matching(repository.as_ref(), &key, "B processed", |s| match s {
            StreamProcessorState::Partitioned(p) => p.head().stream_position == StreamPosition::new(4),
            _ => false,
        })
        .await;
        let StreamProcessorState::Partitioned(stalled) = stalled else {
            panic!("expected partitioned state");
        };
        assert_eq!(stalled.position(), ProcessingPosition::new(0, 0));
        assert!(stalled.is_partition_failing_at(&PartitionId::from("A"), ProcessingPosition::new(2, 2)));
        assert_eq!(
            processor.calls(),
            vec![call(0, "A", None), call(1, "B", None), call(3, "B", None)]
        );

        let caught_up = stored_state_matching(repository.as_ref(), &key, "A caught up", at_stream_position(4)).await;
        handle.shutdown().await.unwrap();

        let StreamProcessorState::Partitioned(caught_up) = caught_up else {
            panic!("expected partitioned state");
        };
        assert!(caught_up.failing_partitions().is_empty());
        assert_eq!(
            processor.calls()[3..].to_vec(),
            vec![call(0, "A", Some(1)), call(2, "A", Some(1))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_partition_can_be_removed_while_running() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), true));
        for partition in ["A", "B", "A"] {
            source.append("e", partition, serde_json::json!({}));
        }
        let processor = Recorder::new(|call| {
            if call.partition == "A" {
                ProcessingResult::fatal("A rejects everything")
            } else {
                ProcessingResult::Succeeded
            }
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let stream_processor = stream_processor(
            &key,
            true,
            &source,
            &processor,
            repository.clone(),
            StreamProcessorConfig::default(),
        );

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        stored_state_matching(repository.as_ref(), &key, "A stuck at head 3", |s| match s {
            StreamProcessorState::Partitioned(p) => {
                p.is_failing() && p.head().stream_position == StreamPosition::new(3)
            }
            _ => false,
        })
        .await;

        let removed = stream_processor
            .remove_failing_partition(PartitionId::from("A"))
            .await
            .unwrap();
        assert!(!removed.is_failing());
        assert_eq!(removed.position(), ProcessingPosition::new(3, 3));

        // Removing again is a no-op; the processor keeps running.
        let again = stream_processor
            .remove_failing_partition(PartitionId::from("A"))
            .await
            .unwrap();
        assert_eq!(again, removed);
        assert!(stream_processor.is_running());
        handle.shutdown().await.unwrap();

        assert_eq!(processor.calls(), vec![call(0, "A", None), call(1, "B", None)]);
        assert_eq!(repository.try_get(&key).await.unwrap(), Some(removed));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_stops_automatic_retries() {
        let source = Arc::new(InMemoryEventSource::new(StreamId::new(), true));
        source.append("e", "A", serde_json::json!({}));
        let processor = Recorder::new(|_| ProcessingResult::retry("still down", Duration::from_secs(1)));
        let repository = Arc::new(InMemoryStateRepository::new());
        let key = processor_key();
        let config = StreamProcessorConfig::default().with_max_processing_attempts(3);
        let stream_processor = stream_processor(&key, true, &source, &processor, repository.clone(), config);

        let handle = stream_processor.start(&Cancellation::new()).await.unwrap();
        let capped = stored_state_matching(repository.as_ref(), &key, "capped", |s| match s {
            StreamProcessorState::Partitioned(p) => p
                .failing_partition(&PartitionId::from("A"))
                .is_some_and(|entry| entry.retry_time().is_never()),
            _ => false,
        })
        .await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(processor.calls().len(), 3);
        assert_eq!(repository.try_get(&key).await.unwrap(), Some(capped));
    }

    // ---- Event Horizon ----

    fn subscriptions(producer: &Arc<Producer>, repository: Arc<dyn StreamProcessorStateRepository>) -> Subscriptions {
        streamline_observability::init_for_tests();
        Subscriptions::new(Arc::new(ProducerFactory(producer.clone())), repository)
            .with_config(
                EventHorizonConfig::default()
                    .with_reconnect_policy(RetryPolicy::forever(Duration::from_secs(1), Duration::from_secs(4))),
            )
            .with_clock(Arc::new(TokioClock::new()))
    }

    fn address() -> MicroserviceAddress {
        MicroserviceAddress::new("producer.local", 50052)
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_reconnects_until_the_producer_accepts() {
        let producer = Arc::new(Producer {
            refuse_first: 2,
            events: public_events(3),
            ..Default::default()
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let subscriptions = subscriptions(&producer, repository.clone());
        let processor = Recorder::succeeding();
        let id = subscription_id();

        let subscription = subscriptions.subscribe(id.clone(), address(), false, processor.clone(), context());
        let first = subscription.connection_response().await.unwrap();
        assert!(!first.is_success());

        eventually("connected", || subscription.state() == SubscriptionState::Connected).await;
        let key = ProcessorKey::Subscription(id.clone());
        stored_state_matching(repository.as_ref(), &key, "received events processed", at_stream_position(3)).await;

        assert!(producer.creates.load(Ordering::SeqCst) >= 3);
        assert_eq!(producer.connects.lock().unwrap().len(), 3);
        assert!(subscription.last_response().unwrap().is_success());
        assert_eq!(processor.calls().len(), 3);

        // Subscribing again while connected neither reconnects nor duplicates processing.
        let again = subscriptions.subscribe(id.clone(), address(), false, processor.clone(), context());
        assert!(Arc::ptr_eq(&subscription, &again));
        again.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(producer.connects.lock().unwrap().len(), 3);
        assert_eq!(processor.calls().len(), 3);

        assert!(subscriptions.unsubscribe(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_resumes_from_stored_position() {
        let producer = Arc::new(Producer {
            events: public_events(12),
            ..Default::default()
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let id = subscription_id();
        let key = ProcessorKey::Subscription(id.clone());
        repository
            .persist(&key, &UnpartitionedState::at(ProcessingPosition::new(10, 10)).into())
            .await
            .unwrap();

        let subscriptions = subscriptions(&producer, repository.clone());
        let processor = Recorder::succeeding();
        let subscription = subscriptions.subscribe(id.clone(), address(), false, processor.clone(), context());

        stored_state_matching(repository.as_ref(), &key, "remaining events processed", at_stream_position(12)).await;
        assert_eq!(*producer.connects.lock().unwrap(), vec![StreamPosition::new(10)]);
        let logs: Vec<u64> = processor.calls().iter().map(|c| c.log).collect();
        assert_eq!(logs, vec![10, 11]);

        subscription.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_resumes_from_the_stored_floor() {
        let producer = Arc::new(Producer {
            events: public_events(6),
            lose_first_session_after: Some(3),
            ..Default::default()
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let subscriptions = subscriptions(&producer, repository.clone());
        let id = subscription_id();
        let key = ProcessorKey::Subscription(id.clone());
        let processor = Recorder::succeeding();
        let subscription = subscriptions.subscribe(id.clone(), address(), false, processor.clone(), context());

        stored_state_matching(repository.as_ref(), &key, "all events processed", at_stream_position(6)).await;

        assert_eq!(
            *producer.connects.lock().unwrap(),
            vec![StreamPosition::START, StreamPosition::new(3)]
        );
        let logs: Vec<u64> = processor.calls().iter().map(|c| c.log).collect();
        assert_eq!(logs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(subscription.state(), SubscriptionState::Connected);

        subscriptions.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partitioned_subscription_catches_up_a_failing_partition() {
        let producer = Arc::new(Producer {
            events: partitioned_public_events(&["A", "B", "A", "B"]),
            ..Default::default()
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let subscriptions = subscriptions(&producer, repository.clone());
        let id = subscription_id();
        let key = ProcessorKey::Subscription(id.clone());
        let processor = Recorder::new(|call| {
            if call.partition == "A" && call.retry_count.is_none() {
                ProcessingResult::failed("A is down", true, Duration::from_secs(10))
            } else {
                ProcessingResult::Succeeded
            }
        });
        subscriptions.subscribe(id.clone(), address(), true, processor.clone(), context());

        let stalled = stored_state_matching(repository.as_ref(), &key, "B processed", |s| match s {
            StreamProcessorState::Partitioned(p) => p.head().stream_position == StreamPosition::new(4),
            _ => false,
        })
        .await;
        assert_eq!(stalled.position(), ProcessingPosition::new(0, 0));
        assert!(stalled.is_failing());
        assert_eq!(
            processor.calls(),
            vec![call(0, "A", None), call(1, "B", None), call(3, "B", None)]
        );

        stored_state_matching(repository.as_ref(), &key, "A caught up", at_stream_position(4)).await;
        assert_eq!(
            processor.calls()[3..].to_vec(),
            vec![call(0, "A", Some(1)), call(2, "A", Some(1))]
        );
        assert_eq!(producer.connects.lock().unwrap().len(), 1);

        subscriptions.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_subscription_starts_at_the_beginning() {
        let producer = Arc::new(Producer::default());
        let subscriptions = subscriptions(&producer, Arc::new(InMemoryStateRepository::new()));
        let subscription = subscriptions.subscribe(subscription_id(), address(), false, Recorder::succeeding(), context());

        assert!(subscription.connection_response().await.unwrap().is_success());
        assert_eq!(*producer.connects.lock().unwrap(), vec![StreamPosition::START]);

        subscriptions.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_releases_the_connection() {
        let producer = Arc::new(Producer {
            events: public_events(2),
            ..Default::default()
        });
        let subscriptions = subscriptions(&producer, Arc::new(InMemoryStateRepository::new()));
        let id = subscription_id();
        let subscription = subscriptions.subscribe(id.clone(), address(), false, Recorder::succeeding(), context());
        eventually("connected", || subscription.state() == SubscriptionState::Connected).await;

        assert!(subscriptions.unsubscribe(&id).await);
        assert!(!subscriptions.unsubscribe(&id).await);

        assert!(producer.receiving_stopped.load(Ordering::SeqCst));
        assert!(subscription.is_stopped());
        assert_eq!(subscription.state(), SubscriptionState::Disconnected);
        assert!(subscriptions.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_subscription_state_is_administered_while_disconnected() {
        let producer = Arc::new(Producer {
            refuse_first: u32::MAX,
            ..Default::default()
        });
        let repository = Arc::new(InMemoryStateRepository::new());
        let subscriptions = subscriptions(&producer, repository.clone());
        let id = subscription_id();
        let subscription = subscriptions.subscribe(id.clone(), address(), false, Recorder::succeeding(), context());
        subscription.connection_response().await;

        let state = subscription
            .skip_events_before(EventLogSequenceNumber::new(5))
            .await
            .unwrap();
        assert_eq!(state.position().event_log_position, EventLogSequenceNumber::new(5));
        assert_eq!(
            repository.try_get(&ProcessorKey::Subscription(id)).await.unwrap(),
            Some(state)
        );

        subscriptions.shutdown().await;
    }
}
