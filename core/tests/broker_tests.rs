use amqbroker::broker::core::DEAD_LETTER_QUEUE;
use amqbroker::broker::Consumer;
use amqbroker::protocol::{BasicProperties, FieldValue};
use amqbroker::store::StoreOp;
use amqbroker::{
    BrokerConfig, BrokerCore, InMemoryAdapter, Message, MessageData, Metadata, MetricsRegistry,
    StorageAdapter, StorageError, Xid,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct TestConsumer {
    tag: String,
    received: Mutex<Vec<Message>>,
}

impl TestConsumer {
    fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl Consumer for TestConsumer {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    fn channel_key(&self) -> u64 {
        1
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn no_ack(&self) -> bool {
        false
    }

    fn send(&self, _queue: &str, message: Message) {
        self.received.lock().push(message);
    }
}

fn in_memory_core(config: BrokerConfig) -> Arc<BrokerCore> {
    BrokerCore::with_adapter(
        config.with_ring_buffer_size(64),
        Arc::new(InMemoryAdapter::new()),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("Failed to create broker core")
}

fn persistent(exchange: &str, routing_key: &str, body: &'static [u8]) -> Arc<MessageData> {
    let properties = BasicProperties {
        delivery_mode: Some(2),
        ..Default::default()
    };
    Arc::new(MessageData::new(
        Metadata::new(exchange, routing_key, body.len() as u64).with_properties(properties),
        Bytes::from_static(body),
    ))
}

fn transient(exchange: &str, routing_key: &str, body: &'static [u8]) -> Arc<MessageData> {
    Arc::new(MessageData::new(
        Metadata::new(exchange, routing_key, body.len() as u64),
        Bytes::from_static(body),
    ))
}

fn contents(messages: &[Message]) -> Vec<Bytes> {
    messages
        .iter()
        .map(|m| m.content().cloned().expect("Delivered message without content"))
        .collect()
}

#[test]
fn test_durable_queue_repopulates_evicted_messages() {
    let core = in_memory_core(BrokerConfig::default().with_in_memory_limit(2));
    core.create_queue("orders", false, true, false)
        .expect("Failed to create queue");

    for body in [&b"first"[..], b"second", b"third"] {
        let data = Arc::new(MessageData::new(
            Metadata::new("", "orders", body.len() as u64).with_properties(BasicProperties {
                delivery_mode: Some(2),
                ..Default::default()
            }),
            Bytes::copy_from_slice(body),
        ));
        assert_eq!(core.publish(core.next_message_id(), data).unwrap(), 1);
    }

    let queue = core.get_queue("orders").unwrap();
    assert_eq!(queue.size(), 3);

    // The oldest message no longer fits in memory and is read back from the store
    let consumer = TestConsumer::new("c1");
    core.add_consumer("orders", consumer.clone(), false).unwrap();
    core.deliver("orders").unwrap();

    let delivered = consumer.take();
    assert_eq!(
        contents(&delivered),
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third"),
        ]
    );

    for message in &delivered {
        core.acknowledge("orders", message.id()).unwrap();
    }
    assert!(queue.is_empty());
}

#[test]
fn test_topic_exchange_routing() {
    let core = in_memory_core(BrokerConfig::default());
    core.create_queue("one_word", false, false, false).unwrap();
    core.create_queue("any_depth", false, false, false).unwrap();
    core.bind("one_word", "amq.topic", "stock.*").unwrap();
    core.bind("any_depth", "amq.topic", "stock.#").unwrap();

    let routed = core
        .publish(core.next_message_id(), transient("amq.topic", "stock.us.nyse", b"x"))
        .unwrap();
    assert_eq!(routed, 1);
    assert_eq!(core.get_queue("one_word").unwrap().size(), 0);
    assert_eq!(core.get_queue("any_depth").unwrap().size(), 1);

    let routed = core
        .publish(core.next_message_id(), transient("amq.topic", "stock.eu", b"y"))
        .unwrap();
    assert_eq!(routed, 2);

    core.unbind("any_depth", "amq.topic", "stock.#").unwrap();
    let routed = core
        .publish(core.next_message_id(), transient("amq.topic", "stock.eu", b"z"))
        .unwrap();
    assert_eq!(routed, 1);
}

#[test]
fn test_durable_messages_survive_restart() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = BrokerConfig::default()
        .with_ring_buffer_size(64)
        .with_data_dir(dir.path());

    let last_id = {
        let core = BrokerCore::open(config.clone(), Arc::new(MetricsRegistry::new()))
            .expect("Failed to open broker");
        core.create_queue("orders", false, true, false).unwrap();
        core.publish(core.next_message_id(), persistent("", "orders", b"kept-1"))
            .unwrap();
        core.publish(core.next_message_id(), persistent("", "orders", b"kept-2"))
            .unwrap();
        // non-persistent messages are not written to the journal
        core.publish(core.next_message_id(), transient("", "orders", b"lost"))
            .unwrap();
        let last_id = core.next_message_id();
        core.shutdown();
        last_id
    };

    let core = BrokerCore::open(config, Arc::new(MetricsRegistry::new()))
        .expect("Failed to reopen broker");
    assert!(core.next_message_id() > 2);
    assert!(core.next_message_id() <= last_id + 1);

    let queue = core.create_queue("orders", false, true, false).unwrap();
    assert_eq!(queue.size(), 2);

    let consumer = TestConsumer::new("c1");
    core.add_consumer("orders", consumer.clone(), false).unwrap();
    core.deliver("orders").unwrap();
    assert_eq!(
        contents(&consumer.take()),
        vec![Bytes::from_static(b"kept-1"), Bytes::from_static(b"kept-2")]
    );
    core.shutdown();
}

#[test]
fn test_acknowledged_ids_are_not_reused_after_restart() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = BrokerConfig::default()
        .with_ring_buffer_size(64)
        .with_data_dir(dir.path());

    let newest = {
        let core = BrokerCore::open(config.clone(), Arc::new(MetricsRegistry::new()))
            .expect("Failed to open broker");
        core.create_queue("orders", false, true, false).unwrap();
        core.publish(core.next_message_id(), persistent("", "orders", b"kept"))
            .unwrap();
        let newest = core.next_message_id();
        core.publish(newest, persistent("", "orders", b"acked"))
            .unwrap();
        core.acknowledge("orders", newest).unwrap();
        core.shutdown();
        newest
    };

    let core = BrokerCore::open(config, Arc::new(MetricsRegistry::new()))
        .expect("Failed to reopen broker");
    assert!(core.next_message_id() > newest);
    assert_eq!(core.create_queue("orders", false, true, false).unwrap().size(), 1);
    core.shutdown();
}

#[test]
fn test_dead_lettered_message_carries_origin() {
    let mut config = BrokerConfig::default();
    config.queue.max_redelivery_count = 0;
    let core = in_memory_core(config);
    core.create_queue("work", false, false, false).unwrap();

    let consumer = TestConsumer::new("worker");
    core.add_consumer("work", consumer.clone(), false).unwrap();
    core.publish(core.next_message_id(), transient("", "work", b"poison"))
        .unwrap();

    let message = consumer.take().remove(0);
    core.reject("work", message, true).unwrap();
    assert!(consumer.take().is_empty());

    let dead_letters = TestConsumer::new("dlq");
    core.add_consumer(DEAD_LETTER_QUEUE, dead_letters.clone(), false)
        .unwrap();
    core.deliver(DEAD_LETTER_QUEUE).unwrap();

    let dead = dead_letters.take();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].content(), Some(&Bytes::from_static(b"poison")));
    let headers = dead[0]
        .metadata()
        .and_then(|m| m.properties.headers.clone())
        .expect("Dead letter without headers");
    assert_eq!(
        headers.get("x-origin-queue"),
        Some(&FieldValue::LongString(Bytes::from_static(b"work")))
    );
}

#[test]
fn test_expired_messages_are_not_delivered() {
    let core = in_memory_core(BrokerConfig::default());
    core.create_queue("ttl", false, false, false).unwrap();

    let expired = Arc::new(MessageData::new(
        Metadata::new("", "ttl", 3).with_properties(BasicProperties {
            expiration: Some("1".to_string()),
            ..Default::default()
        }),
        Bytes::from_static(b"old"),
    ));
    core.publish(core.next_message_id(), expired).unwrap();
    core.publish(core.next_message_id(), transient("", "ttl", b"new"))
        .unwrap();

    let consumer = TestConsumer::new("c1");
    core.add_consumer("ttl", consumer.clone(), false).unwrap();
    core.deliver("ttl").unwrap();
    assert_eq!(contents(&consumer.take()), vec![Bytes::from_static(b"new")]);
}

fn expiring(routing_key: &str, body: &'static [u8]) -> Arc<MessageData> {
    Arc::new(MessageData::new(
        Metadata::new("", routing_key, body.len() as u64).with_properties(BasicProperties {
            expiration: Some("1".to_string()),
            ..Default::default()
        }),
        Bytes::from_static(body),
    ))
}

#[test]
fn test_idle_queue_expired_messages_reach_dead_letter_queue() {
    let core = in_memory_core(BrokerConfig::default());
    core.create_queue("idle", false, false, false).unwrap();
    core.publish(core.next_message_id(), expiring("idle", b"stale"))
        .unwrap();
    core.publish(core.next_message_id(), transient("", "idle", b"fresh"))
        .unwrap();

    assert_eq!(core.expire_messages().unwrap(), 1);
    assert_eq!(core.get_queue("idle").unwrap().size(), 1);
    // dead letters lose their expiration, so a second sweep finds nothing
    assert_eq!(core.expire_messages().unwrap(), 0);

    let dead_letters = TestConsumer::new("dlq");
    core.add_consumer(DEAD_LETTER_QUEUE, dead_letters.clone(), false)
        .unwrap();
    core.deliver(DEAD_LETTER_QUEUE).unwrap();
    let dead = dead_letters.take();
    assert_eq!(contents(&dead), vec![Bytes::from_static(b"stale")]);
    let metadata = dead[0].metadata().expect("Dead letter without metadata");
    assert!(metadata.properties.expiration.is_none());
    assert_eq!(
        metadata
            .properties
            .headers
            .as_ref()
            .and_then(|h| h.get("x-origin-queue")),
        Some(&FieldValue::LongString(Bytes::from_static(b"idle")))
    );
}

#[tokio::test]
async fn test_expiry_sweep_runs_periodically() {
    let mut config = BrokerConfig::default();
    config.queue.expiry_sweep_interval_ms = 10;
    let core = in_memory_core(config);
    core.create_queue("idle", false, false, false).unwrap();
    core.publish(core.next_message_id(), expiring("idle", b"stale"))
        .unwrap();

    let sweep = core.start_expiry_sweep();
    let dlq = core.get_queue(DEAD_LETTER_QUEUE).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while dlq.size() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Expired message never reached the dead letter queue");
    sweep.abort();

    assert!(core.get_queue("idle").unwrap().is_empty());
    core.shutdown();
}

#[test]
fn test_queue_lifecycle_validations() {
    let core = in_memory_core(BrokerConfig::default());
    core.create_queue("q", false, false, false).unwrap();

    // passive declare of an unknown queue
    let err = core.create_queue("missing", true, false, false).unwrap_err();
    assert_eq!(err.as_validation().unwrap().reply_code, 404);

    core.publish(core.next_message_id(), transient("", "q", b"a"))
        .unwrap();
    let err = core.delete_queue("q", false, true).unwrap_err();
    assert_eq!(err.as_validation().unwrap().reply_code, 406);

    assert_eq!(core.purge_queue("q").unwrap(), 1);
    assert_eq!(core.delete_queue("q", false, true).unwrap(), 0);
    assert!(core.get_queue("q").is_none());
}

/// In-memory storage whose batch writes wait until the gate is opened
#[derive(Default)]
struct GatedAdapter {
    inner: InMemoryAdapter,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedAdapter {
    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl StorageAdapter for GatedAdapter {
    fn persist_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        self.inner.persist_batch(ops)
    }

    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError> {
        self.inner.read(ids)
    }

    fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError> {
        self.inner.read_all(queue)
    }

    fn store_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.inner.store_prepared(xid, ops)
    }

    fn remove_prepared(&self, xid: &Xid) -> Result<(), StorageError> {
        self.inner.remove_prepared(xid)
    }

    fn prepared(&self) -> Result<Vec<(Xid, Vec<StoreOp>)>, StorageError> {
        self.inner.prepared()
    }

    fn max_message_id(&self) -> Result<u64, StorageError> {
        self.inner.max_message_id()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_full_persistence_ring_does_not_stall_other_tasks() {
    let adapter = Arc::new(GatedAdapter::default());
    let core = BrokerCore::with_adapter(
        BrokerConfig::default().with_ring_buffer_size(16),
        adapter.clone(),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("Failed to create broker core");
    core.create_queue("slow", false, true, false).unwrap();

    // more persistent publishes than the ring has slots
    let publisher = {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            for _ in 0..40 {
                core.publish(core.next_message_id(), persistent("", "slow", b"m"))
                    .unwrap();
            }
        })
    };

    // shares the only worker with the blocked publisher
    let ticker = {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            adapter.open();
        })
    };

    tokio::time::timeout(Duration::from_secs(5), ticker)
        .await
        .expect("Ticker stalled behind the publisher")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), publisher)
        .await
        .expect("Publisher never finished")
        .unwrap();
    assert_eq!(core.get_queue("slow").unwrap().size(), 40);
    core.shutdown();
}
