use crate::broker::Broker;
use crate::error::QueueError;
use crate::message::{CombinedRecord, Message, Reading};
use crate::queue_client::{ConnectionState, MessageHandler, QueueClient};
use crate::record_sink::RecordSink;
use crate::waveform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a body that is neither a reading nor the stop message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Log it, acknowledge it and carry on.
    #[default]
    Skip,
    /// End consumption with a `MalformedMessage` error, leaving it unacknowledged.
    Fail,
}

/// Counters shared between a handler and whoever watches it.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    written: AtomicU64,
    skipped: AtomicU64,
}

impl ConsumerStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Combines each incoming meter reading with a simulated photovoltaic value
/// and appends the result to a sink.
pub struct PvHandler<S: RecordSink, R: Rng + Send = StdRng> {
    sink: S,
    rng: R,
    policy: MalformedPolicy,
    stats: Arc<ConsumerStats>,
}

impl<S: RecordSink, R: Rng + Send> PvHandler<S, R> {
    pub fn new(sink: S, rng: R, policy: MalformedPolicy, stats: Arc<ConsumerStats>) -> Self {
        Self {
            sink,
            rng,
            policy,
            stats,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn combine(&mut self, reading: &Reading) -> CombinedRecord {
        let pv_power_watt = waveform::pv_power_watt(reading.timestamp, &mut self.rng);
        CombinedRecord::combine(reading, pv_power_watt)
    }
}

impl<S: RecordSink, R: Rng + Send> MessageHandler for PvHandler<S, R> {
    fn handle(&mut self, body: &[u8]) -> anyhow::Result<ControlFlow<()>> {
        let reading = match Message::parse(body) {
            Ok(Message::Reading(reading)) => reading,
            Ok(Message::Stop) => {
                info!("Received stop message");
                return Ok(ControlFlow::Break(()));
            }
            Err(e) => match self.policy {
                MalformedPolicy::Skip => {
                    warn!("Skipping message: {e}");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    return Ok(ControlFlow::Continue(()));
                }
                MalformedPolicy::Fail => return Err(e.into()),
            },
        };

        let record = self.combine(&reading);
        self.sink.append(&record)?;
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Combined: meter {}W + PV {}W = {}W @ {}",
            record.meter_power_watt,
            record.pv_power_watt,
            record.combined_power_watt,
            record.timestamp
        );
        Ok(ControlFlow::Continue(()))
    }
}

/// Consumes meter readings until the stop message arrives.
pub struct PvConsumer<B: Broker> {
    client: QueueClient<B>,
    policy: MalformedPolicy,
    stats: Arc<ConsumerStats>,
}

impl<B: Broker> PvConsumer<B> {
    pub fn new(client: QueueClient<B>) -> Self {
        Self {
            client,
            policy: MalformedPolicy::default(),
            stats: Arc::default(),
        }
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn client(&self) -> &QueueClient<B> {
        &self.client
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn handler<S: RecordSink>(&self, sink: S) -> PvHandler<S> {
        PvHandler::new(
            sink,
            StdRng::from_os_rng(),
            self.policy,
            self.stats.clone(),
        )
    }

    async fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.client.connection_state() == ConnectionState::Disconnected {
            self.client.connect().await?;
        }
        Ok(())
    }

    /// Consumes on the current task until the stop message arrives.
    pub async fn run<S: RecordSink>(&self, sink: S) -> Result<(), QueueError> {
        self.run_until(sink, &CancellationToken::new()).await
    }

    /// Consumes on the current task until the stop message arrives or `cancel`
    /// fires, whichever comes first. Cancelling while still connecting gives
    /// up on the connection and returns `Ok`.
    pub async fn run_until<S: RecordSink>(
        &self,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        tokio::select! {
            connected = self.ensure_connected() => connected?,
            _ = cancel.cancelled() => {
                info!("Cancelled before the PV simulator connected");
                return Ok(());
            }
        }
        self.client
            .start_consuming_blocking_until(self.handler(sink), cancel)
            .await?;
        info!(
            "PV simulation finished: {} records written, {} messages skipped",
            self.stats.written(),
            self.stats.skipped()
        );
        Ok(())
    }

    /// Starts consuming on a background worker. Pair with [`Self::wait`] or
    /// [`Self::stop`].
    pub async fn start<S: RecordSink + 'static>(&self, sink: S) -> Result<(), QueueError> {
        self.ensure_connected().await?;
        self.client.start_consuming_async(self.handler(sink))
    }

    /// Waits until the background worker saw the stop message.
    pub async fn wait(&self) -> Result<(), QueueError> {
        self.client.wait_for_worker().await
    }

    pub async fn stop(&self) -> Result<(), QueueError> {
        self.client.stop_consuming().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::message::SENTINEL;
    use std::time::Duration;

    fn handler(policy: MalformedPolicy) -> PvHandler<Vec<CombinedRecord>> {
        PvHandler::new(
            Vec::new(),
            StdRng::seed_from_u64(3),
            policy,
            Arc::default(),
        )
    }

    fn body(timestamp: i64, meter_power_watt: f64) -> Vec<u8> {
        Message::Reading(Reading {
            timestamp,
            meter_power_watt,
        })
        .encode()
        .unwrap()
        .into_bytes()
    }

    #[test]
    fn test_combines_reading_with_pv() {
        let mut pv = handler(MalformedPolicy::Skip);
        // 13:22, close to the PV peak
        let noon = 1_247_097_600 + 48_120;
        let flow = pv.handle(&body(noon, 1000.0)).unwrap();
        assert_eq!(flow, ControlFlow::Continue(()));

        let record = pv.sink()[0];
        assert_eq!(record.timestamp, noon);
        assert_eq!(record.meter_power_watt, 1000.0);
        assert!(
            (6400.0..=6550.0).contains(&record.pv_power_watt),
            "{}",
            record.pv_power_watt
        );
        assert_eq!(record.combined_power_watt, record.pv_power_watt + 1000.0);
    }

    #[test]
    fn test_sentinel_breaks_without_record() {
        let mut pv = handler(MalformedPolicy::Skip);
        let flow = pv.handle(SENTINEL.as_bytes()).unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
        assert!(pv.sink().is_empty());
    }

    #[test]
    fn test_malformed_skip_policy() {
        let mut pv = handler(MalformedPolicy::Skip);
        assert_eq!(
            pv.handle(b"{\"timestamp\": \"soon\"}").unwrap(),
            ControlFlow::Continue(())
        );
        assert!(pv.sink().is_empty());
        assert_eq!(pv.stats.skipped(), 1);
        assert_eq!(pv.stats.written(), 0);
    }

    #[test]
    fn test_malformed_fail_policy() {
        let mut pv = handler(MalformedPolicy::Fail);
        let err = pv.handle(b"garbage").unwrap_err();
        assert!(err.downcast_ref::<crate::message::MalformedMessage>().is_some());
    }

    #[tokio::test]
    async fn test_strict_consumer_stops_on_malformed_message() {
        let broker = MemoryBroker::new();
        let producer = QueueClient::for_queue("pv", broker.connection());
        producer.connect().await.unwrap();
        producer.publish("garbage").await.unwrap();

        let consumer = PvConsumer::new(
            QueueClient::for_queue("pv", broker.connection())
                .with_idle_interval(Duration::ZERO),
        )
        .with_policy(MalformedPolicy::Fail);
        let mut records = Vec::new();
        let result = consumer.run(&mut records).await;
        assert!(matches!(result, Err(QueueError::MalformedMessage(_))));
        assert_eq!(consumer.client().broker().unacked(), 1);
    }

    #[tokio::test]
    async fn test_background_consumer_until_sentinel() {
        let broker = MemoryBroker::new();
        let producer = QueueClient::for_queue("pv", broker.connection());
        producer.connect().await.unwrap();
        for t in 0..5 {
            producer.publish(body(t, 500.0)).await.unwrap();
        }
        producer.publish(SENTINEL).await.unwrap();

        let consumer = PvConsumer::new(
            QueueClient::for_queue("pv", broker.connection())
                .with_idle_interval(Duration::from_millis(1)),
        );
        consumer.start(Vec::new()).await.unwrap();
        consumer.wait().await.unwrap();
        assert_eq!(consumer.stats().written(), 5);
        assert_eq!(broker.depth("pv"), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_connecting() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(500));
        let consumer = PvConsumer::new(QueueClient::for_queue("pv", broker));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_millis(300), consumer.run_until(Vec::new(), &cancel))
            .await
            .expect("Consumer should give up connecting once cancelled")
            .unwrap();
        assert_eq!(consumer.client().connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            consumer.client().consumption_state(),
            crate::queue_client::ConsumptionState::Idle
        );
    }

    #[tokio::test]
    async fn test_cancel_while_consuming() {
        let broker = MemoryBroker::new();
        let producer = QueueClient::for_queue("pv", broker.connection());
        producer.connect().await.unwrap();
        producer.publish(body(0, 500.0)).await.unwrap();

        let consumer = PvConsumer::new(
            QueueClient::for_queue("pv", broker.connection())
                .with_idle_interval(Duration::from_millis(1)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut records = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), consumer.run_until(&mut records, &cancel))
            .await
            .expect("Consumer should stop once cancelled")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            consumer.client().consumption_state(),
            crate::queue_client::ConsumptionState::Idle
        );
    }

    #[tokio::test]
    async fn test_cancel_after_sentinel_is_harmless() {
        let broker = MemoryBroker::new();
        let producer = QueueClient::for_queue("pv", broker.connection());
        producer.connect().await.unwrap();
        producer.publish(body(0, 500.0)).await.unwrap();
        producer.publish(SENTINEL).await.unwrap();

        let consumer = PvConsumer::new(
            QueueClient::for_queue("pv", broker.connection()).with_idle_interval(Duration::ZERO),
        );
        let cancel = CancellationToken::new();
        consumer.run_until(Vec::new(), &cancel).await.unwrap();
        cancel.cancel();

        assert_eq!(consumer.stats().written(), 1);
        assert!(matches!(consumer.stop().await, Err(QueueError::NotConsuming)));
        consumer.client().close().await.unwrap();
    }
}
