use super::{Broker, BrokerError, Delivery};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-process broker with per-queue FIFO delivery.
///
/// Each `MemoryBroker` value is one connection. Further connections onto the
/// same set of queues come from [`MemoryBroker::connection`], so a producer and
/// a consumer can each own their own connection while exchanging messages.
/// Messages polled but not acknowledged are put back at the head of their
/// queue when the connection closes.
pub struct MemoryBroker {
    store: Arc<Mutex<Store>>,
    faults: Arc<Faults>,
    connected: AtomicBool,
    unacked: Mutex<BTreeMap<u64, (String, Vec<u8>)>>,
}

#[derive(Default)]
struct Store {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    next_tag: u64,
}

struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

/// Switches shared by all connections of one broker, used to simulate outages.
#[derive(Default)]
struct Faults {
    fail_connect: AtomicBool,
    fail_declare: AtomicBool,
    reject_publish: AtomicBool,
    fail_poll: AtomicBool,
    connect_delay_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_store(Arc::default(), Arc::default())
    }

    fn with_store(store: Arc<Mutex<Store>>, faults: Arc<Faults>) -> Self {
        Self {
            store,
            faults,
            connected: AtomicBool::new(false),
            unacked: Mutex::new(BTreeMap::new()),
        }
    }

    /// A new, not yet connected, connection onto the same queues.
    pub fn connection(&self) -> Self {
        Self::with_store(self.store.clone(), self.faults.clone())
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.faults.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Makes every later `connect` take at least `delay`, like a slow network.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.faults
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_fail_declare(&self, fail: bool) {
        self.faults.fail_declare.store(fail, Ordering::Relaxed);
    }

    pub fn set_reject_publish(&self, reject: bool) {
        self.faults.reject_publish.store(reject, Ordering::Relaxed);
    }

    pub fn set_fail_poll(&self, fail: bool) {
        self.faults.fail_poll.store(fail, Ordering::Relaxed);
    }

    /// Number of ready (not in-flight) messages in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        lock(&self.store).queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Ready bodies of `queue`, head first.
    pub fn peek_all(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.store)
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages polled on this connection and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        lock(&self.unacked).len()
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let delay = self.faults.connect_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.faults.fail_connect.load(Ordering::Relaxed) {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        if self.faults.fail_declare.load(Ordering::Relaxed) {
            return Err(BrokerError::InvalidArgument(format!(
                "cannot declare queue '{queue}'"
            )));
        }
        lock(&self.store).queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        if self.faults.reject_publish.load(Ordering::Relaxed) {
            return Err(BrokerError::InvalidArgument("publish rejected".to_string()));
        }
        let mut store = lock(&self.store);
        let messages = store
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::InvalidArgument(format!("no queue '{queue}'")))?;
        messages.push_back(StoredMessage {
            body: body.to_vec(),
            redelivered: false,
        });
        Ok(())
    }

    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_connected()?;
        if self.faults.fail_poll.load(Ordering::Relaxed) {
            return Err(BrokerError::Transport("channel closed by broker".to_string()));
        }
        let mut store = lock(&self.store);
        let Some(message) = store.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        store.next_tag += 1;
        let delivery_tag = store.next_tag;
        lock(&self.unacked).insert(delivery_tag, (queue.to_string(), message.body.clone()));
        Ok(Some(Delivery {
            delivery_tag,
            body: message.body,
            redelivered: message.redelivered,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        lock(&self.unacked)
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown delivery tag {delivery_tag}")))
    }

    async fn purge(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_connected()?;
        let mut store = lock(&self.store);
        let purged = store.queues.get_mut(queue).map_or(0, |messages| {
            let count = messages.len();
            messages.clear();
            count
        });
        Ok(purged as u32)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let unacked = std::mem::take(&mut *lock(&self.unacked));
        let mut store = lock(&self.store);
        // Newest first, so the oldest in-flight message ends up at the head.
        for (_, (queue, body)) in unacked.into_iter().rev() {
            store.queues.entry(queue).or_default().push_front(StoredMessage {
                body,
                redelivered: true,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(broker: &MemoryBroker, queue: &str) {
        broker.connect().await.unwrap();
        broker.declare_queue(queue).await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_between_connections() {
        let producer = MemoryBroker::new();
        let consumer = producer.connection();
        connected(&producer, "q").await;
        connected(&consumer, "q").await;

        producer.publish("q", b"one", "text/plain").await.unwrap();
        producer.publish("q", b"two", "text/plain").await.unwrap();

        let first = consumer.poll("q").await.unwrap().unwrap();
        let second = consumer.poll("q").await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
        assert_eq!(second.body, b"two");
        assert!(consumer.poll("q").await.unwrap().is_none());
        assert_eq!(consumer.unacked(), 2);

        consumer.ack(first.delivery_tag).await.unwrap();
        consumer.ack(second.delivery_tag).await.unwrap();
        assert_eq!(consumer.unacked(), 0);
        assert!(consumer.ack(first.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_in_order() {
        let producer = MemoryBroker::new();
        let consumer = producer.connection();
        connected(&producer, "q").await;
        connected(&consumer, "q").await;
        for body in [b"a", b"b", b"c"] {
            producer.publish("q", body, "text/plain").await.unwrap();
        }

        consumer.poll("q").await.unwrap();
        consumer.poll("q").await.unwrap();
        consumer.close().await.unwrap();

        assert_eq!(producer.peek_all("q"), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let redelivery = producer.connection();
        connected(&redelivery, "q").await;
        assert!(redelivery.poll("q").await.unwrap().unwrap().redelivered);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("q", b"x", "text/plain").await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(broker.poll("q").await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        assert!(matches!(
            broker.publish("missing", b"x", "text/plain").await,
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_purge() {
        let broker = MemoryBroker::new();
        connected(&broker, "q").await;
        assert_eq!(broker.purge("q").await.unwrap(), 0);
        broker.publish("q", b"x", "text/plain").await.unwrap();
        broker.publish("q", b"y", "text/plain").await.unwrap();
        assert_eq!(broker.purge("q").await.unwrap(), 2);
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_faults_are_shared() {
        let broker = MemoryBroker::new();
        let other = broker.connection();
        broker.set_fail_connect(true);
        assert!(matches!(other.connect().await, Err(BrokerError::Unreachable(_))));
        broker.set_fail_connect(false);
        assert!(other.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_delay() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        broker.connect().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
