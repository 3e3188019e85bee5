//! PV Simulator Library
//!
//! This library simulates a household energy pipeline: a meter publishes
//! synthetic consumption readings onto a message queue, and a PV simulator
//! consumes them, adds a synthetic photovoltaic output for the same instant
//! and appends the combined values to a CSV file.

pub mod broker;
pub mod configuration;
pub mod error;
pub mod message;
pub mod meter_producer;
pub mod pipeline;
pub mod pv_consumer;
pub mod queue_client;
pub mod record_sink;
pub mod waveform;

// Re-export commonly used types for easier access
pub use broker::{Broker, BrokerError, ManagementApiBroker, MemoryBroker, RabbitMqBroker};
pub use configuration::SimulationConfig;
pub use error::QueueError;
pub use message::{CombinedRecord, Message, Reading, SENTINEL};
pub use meter_producer::{MeterProducer, SimulationMode};
pub use pipeline::LocalPipeline;
pub use pv_consumer::{MalformedPolicy, PvConsumer};
pub use queue_client::{ConnectionState, ConsumptionState, MessageHandler, QueueClient};
pub use record_sink::{CsvRecordSink, RecordSink};
