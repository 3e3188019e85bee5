use crate::broker::MemoryBroker;
use crate::configuration::SimulationConfig;
use crate::meter_producer::{MeterProducer, ONE_DAY_START};
use crate::pv_consumer::{MalformedPolicy, PvConsumer};
use crate::queue_client::{QueueClient, DEFAULT_IDLE_INTERVAL};
use crate::record_sink::RecordSink;
use crate::waveform::SECONDS_PER_DAY;
use anyhow::Context;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationSummary {
    pub published: u64,
    pub written: u64,
    pub skipped: u64,
}

/// Runs meter and PV simulator in one process over an in-memory broker.
///
/// Each side gets its own connection, so the same lifecycle applies as with
/// an external broker: the consumer runs on a background worker while the
/// meter publishes, and the pipeline finishes once the consumer has seen the
/// stop message.
pub struct LocalPipeline {
    queue_name: String,
    timestep: Duration,
    idle_interval: Duration,
    policy: MalformedPolicy,
}

impl LocalPipeline {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            timestep: Duration::from_secs(1),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            policy: MalformedPolicy::default(),
        }
    }

    pub fn with_timestep(mut self, timestep: Duration) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run_span<S: RecordSink + 'static>(
        &self,
        start: i64,
        span: i64,
        sink: S,
    ) -> anyhow::Result<SimulationSummary> {
        let broker = MemoryBroker::new();

        let consumer = PvConsumer::new(
            QueueClient::for_queue(&self.queue_name, broker.connection())
                .with_idle_interval(self.idle_interval),
        )
        .with_policy(self.policy);
        consumer
            .start(sink)
            .await
            .context("Starting PV simulator")?;

        let mut meter = MeterProducer::new(
            QueueClient::for_queue(&self.queue_name, broker.connection()),
            self.timestep,
        );
        let published = match meter.run_span(start, span).await {
            Ok(published) => published,
            Err(e) => {
                consumer.stop().await.ok();
                return Err(e.context("Running meter"));
            }
        };

        consumer.wait().await.context("Waiting for PV simulator")?;
        meter.client().close().await?;
        consumer.client().close().await?;

        let summary = SimulationSummary {
            published,
            written: consumer.stats().written(),
            skipped: consumer.stats().skipped(),
        };
        info!(
            "Local simulation done: {} published, {} written, {} skipped",
            summary.published, summary.written, summary.skipped
        );
        Ok(summary)
    }

    pub async fn run_one_day<S: RecordSink + 'static>(
        &self,
        sink: S,
    ) -> anyhow::Result<SimulationSummary> {
        self.run_span(ONE_DAY_START, SECONDS_PER_DAY, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_sink::CsvRecordSink;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_pipeline_writes_every_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.csv");

        let summary = LocalPipeline::new(&SimulationConfig::default())
            .with_timestep(Duration::from_secs(600))
            .with_idle_interval(Duration::ZERO)
            .run_one_day(CsvRecordSink::new(&path))
            .await
            .unwrap();

        assert_eq!(
            summary,
            SimulationSummary {
                published: 144,
                written: 144,
                skipped: 0
            }
        );
        let rows = std::fs::read_to_string(&path).unwrap();
        assert_eq!(rows.lines().count(), 144);
        assert!(rows.starts_with(&format!("{ONE_DAY_START},")));
    }
}
