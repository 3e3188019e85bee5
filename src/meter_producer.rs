use crate::broker::Broker;
use crate::message::{Message, Reading};
use crate::queue_client::{ConnectionState, QueueClient};
use crate::waveform::{self, SECONDS_PER_DAY};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start of the simulated day: Jul 9, 2009 00:00:00 UTC.
pub const ONE_DAY_START: i64 = 1_247_097_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SimulationMode {
    /// Walk through one fixed day as fast as possible, then stop.
    OneDay,
    /// Publish wall-clock readings until interrupted.
    Endless,
}

/// Publishes synthetic household meter readings onto the queue.
pub struct MeterProducer<B: Broker, R: Rng + Send = StdRng> {
    client: QueueClient<B>,
    timestep: Duration,
    rng: R,
}

impl<B: Broker> MeterProducer<B> {
    pub fn new(client: QueueClient<B>, timestep: Duration) -> Self {
        Self::with_rng(client, timestep, StdRng::from_os_rng())
    }
}

impl<B: Broker, R: Rng + Send> MeterProducer<B, R> {
    pub fn with_rng(client: QueueClient<B>, timestep: Duration, rng: R) -> Self {
        Self {
            client,
            timestep,
            rng,
        }
    }

    pub fn client(&self) -> &QueueClient<B> {
        &self.client
    }

    pub fn reading_at(&mut self, timestamp: i64) -> Reading {
        Reading {
            timestamp,
            meter_power_watt: waveform::meter_power_watt(timestamp, &mut self.rng),
        }
    }

    /// Connects if needed and empties the queue of leftovers from earlier runs.
    /// Returns `false` if `cancel` fired first.
    async fn prepare(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let prepare = async {
            if self.client.connection_state() == ConnectionState::Disconnected {
                self.client.connect().await?;
            }
            self.client.purge().await?;
            anyhow::Ok(())
        };
        tokio::select! {
            prepared = prepare => prepared.map(|()| true),
            _ = cancel.cancelled() => Ok(false),
        }
    }

    /// Publishes the stop message after a cancelled run, if there is anyone
    /// connected to send it to.
    async fn finish_cancelled(&self, published: u64) -> anyhow::Result<u64> {
        info!("Execution was cancelled after {published} readings");
        if self.client.connection_state() == ConnectionState::Connected {
            self.publish_sentinel().await?;
        } else {
            warn!("Never connected to the queue, no stop message sent");
        }
        Ok(published)
    }

    async fn publish_reading(&mut self, timestamp: i64) -> anyhow::Result<()> {
        let body = Message::Reading(self.reading_at(timestamp)).encode()?;
        self.client
            .publish(&body)
            .await
            .with_context(|| format!("Publishing reading for {timestamp}"))?;
        debug!("Published: {body}");
        Ok(())
    }

    /// Tells consumers that no more readings will follow.
    pub async fn publish_sentinel(&self) -> anyhow::Result<()> {
        self.client
            .publish(Message::Stop.encode()?)
            .await
            .context("Publishing stop message")?;
        info!("Published stop message");
        Ok(())
    }

    /// Publishes one reading per timestep over `[start, start + span)`, then
    /// the stop message. Returns the number of readings published.
    pub async fn run_span(&mut self, start: i64, span: i64) -> anyhow::Result<u64> {
        self.run_span_until(start, span, &CancellationToken::new())
            .await
    }

    /// Like [`Self::run_span`], but stops early once `cancel` fires. The stop
    /// message is still published exactly once when the queue was reached.
    pub async fn run_span_until(
        &mut self,
        start: i64,
        span: i64,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let step = self.timestep.as_secs();
        anyhow::ensure!(step > 0, "timestep must be at least one second");
        if !self.prepare(cancel).await? {
            return self.finish_cancelled(0).await;
        }

        info!("Simulating {span}s from {start} in steps of {step}s");
        let mut published = 0u64;
        for offset in (0..span).step_by(step as usize) {
            if cancel.is_cancelled() {
                return self.finish_cancelled(published).await;
            }
            self.publish_reading(start + offset).await?;
            published += 1;
        }
        self.publish_sentinel().await?;
        info!("Published {published} readings");
        Ok(published)
    }

    /// Simulates the fixed day starting at [`ONE_DAY_START`].
    pub async fn run_one_day(&mut self) -> anyhow::Result<u64> {
        self.run_span(ONE_DAY_START, SECONDS_PER_DAY).await
    }

    pub async fn run_one_day_until(&mut self, cancel: &CancellationToken) -> anyhow::Result<u64> {
        self.run_span_until(ONE_DAY_START, SECONDS_PER_DAY, cancel)
            .await
    }

    /// Publishes a reading for the current time every timestep until `cancel`
    /// fires, then publishes the stop message.
    pub async fn run_endless(&mut self, cancel: &CancellationToken) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.timestep.is_zero(), "timestep must not be zero");
        if !self.prepare(cancel).await? {
            return self.finish_cancelled(0).await;
        }

        info!("Publishing live readings every {:?}", self.timestep);
        let mut ticker = interval(self.timestep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs() as i64;
                    self.publish_reading(now).await?;
                    published += 1;
                }
            }
        }
        self.finish_cancelled(published).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::message::SENTINEL;

    const QUEUE: &str = "meter_test";

    fn producer(broker: MemoryBroker, timestep: Duration) -> MeterProducer<MemoryBroker> {
        MeterProducer::with_rng(
            QueueClient::for_queue(QUEUE, broker),
            timestep,
            StdRng::seed_from_u64(42),
        )
    }

    fn parsed(broker: &MemoryBroker) -> Vec<Message> {
        broker
            .peek_all(QUEUE)
            .iter()
            .map(|body| Message::parse(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_run_span_publishes_readings_then_sentinel() {
        let broker = MemoryBroker::new();
        let mut meter = producer(broker.connection(), Duration::from_secs(1));

        let published = meter.run_span(ONE_DAY_START, 10).await.unwrap();
        assert_eq!(published, 10);

        let messages = parsed(&broker);
        assert_eq!(messages.len(), 11);
        for (i, message) in messages[..10].iter().enumerate() {
            match message {
                Message::Reading(reading) => {
                    assert_eq!(reading.timestamp, ONE_DAY_START + i as i64);
                    assert!((1600.0..=1800.0).contains(&reading.meter_power_watt));
                }
                Message::Stop => panic!("unexpected stop at {i}"),
            }
        }
        assert_eq!(broker.peek_all(QUEUE)[10], SENTINEL.as_bytes());
    }

    #[tokio::test]
    async fn test_timestep_controls_stride() {
        let broker = MemoryBroker::new();
        let mut meter = producer(broker.connection(), Duration::from_secs(900));

        assert_eq!(meter.run_one_day().await.unwrap(), 96);
        let timestamps: Vec<i64> = parsed(&broker)
            .into_iter()
            .filter_map(|m| match m {
                Message::Reading(r) => Some(r.timestamp),
                Message::Stop => None,
            })
            .collect();
        assert_eq!(timestamps.first(), Some(&ONE_DAY_START));
        assert_eq!(timestamps.last(), Some(&(ONE_DAY_START + SECONDS_PER_DAY - 900)));
    }

    #[tokio::test]
    async fn test_purges_leftovers_before_publishing() {
        let broker = MemoryBroker::new();
        let stale = QueueClient::for_queue(QUEUE, broker.connection());
        stale.connect().await.unwrap();
        stale.publish("stale").await.unwrap();

        let mut meter = producer(broker.connection(), Duration::from_secs(3600));
        meter.run_span(ONE_DAY_START, 7200).await.unwrap();
        assert_eq!(parsed(&broker).len(), 3);
    }

    #[tokio::test]
    async fn test_zero_timestep_is_rejected() {
        let mut meter = producer(MemoryBroker::new(), Duration::ZERO);
        assert!(meter.run_one_day().await.is_err());
        assert!(meter.run_endless(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = MemoryBroker::new();
        broker.set_fail_connect(true);
        let mut meter = producer(broker, Duration::from_secs(1));
        assert!(meter.run_one_day().await.is_err());
    }

    #[tokio::test]
    async fn test_endless_publishes_sentinel_on_cancel() {
        let broker = MemoryBroker::new();
        let mut meter = producer(broker.connection(), Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            stopper.cancel();
        });

        let published = meter.run_endless(&cancel).await.unwrap();
        assert!(published >= 1);

        let messages = parsed(&broker);
        assert_eq!(messages.len() as u64, published + 1);
        assert_eq!(messages.last(), Some(&Message::Stop));
    }

    fn stop_count(broker: &MemoryBroker) -> usize {
        parsed(broker)
            .iter()
            .filter(|m| **m == Message::Stop)
            .count()
    }

    #[tokio::test]
    async fn test_cancel_while_connecting_sends_nothing() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(500));
        let mut meter = producer(broker.connection(), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let published = tokio::time::timeout(
            Duration::from_millis(300),
            meter.run_one_day_until(&cancel),
        )
        .await
        .expect("Meter should give up connecting once cancelled")
        .unwrap();
        assert_eq!(published, 0);
        assert_eq!(meter.client().connection_state(), ConnectionState::Disconnected);
        assert!(broker.peek_all(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_reading_sends_one_stop() {
        let broker = MemoryBroker::new();
        let mut meter = producer(broker.connection(), Duration::from_secs(1));
        meter.client().connect().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let published = meter.run_one_day_until(&cancel).await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(stop_count(&broker), 1);
        assert_eq!(parsed(&broker).last(), Some(&Message::Stop));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mid_day_sends_one_stop() {
        let broker = MemoryBroker::new();
        let mut meter = producer(broker.connection(), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let published = meter.run_one_day_until(&cancel).await.unwrap();
        let messages = parsed(&broker);
        assert_eq!(messages.len() as u64, published + 1);
        assert_eq!(stop_count(&broker), 1);
        assert_eq!(messages.last(), Some(&Message::Stop));
    }

    #[tokio::test]
    async fn test_endless_cancelled_while_connecting() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(500));
        let mut meter = producer(broker.connection(), Duration::from_millis(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(meter.run_endless(&cancel).await.unwrap(), 0);
        assert!(broker.peek_all(QUEUE).is_empty());
    }
}
