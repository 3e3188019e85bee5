use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Body published by the meter once no more readings will follow.
pub const SENTINEL: &str = "STOP_SIMULATION";

/// One synthetic meter reading as it travels over the queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: i64,
    #[serde(rename = "meter_power_value_watt")]
    pub meter_power_watt: f64,
}

/// A meter reading paired with the photovoltaic output for the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedRecord {
    pub timestamp: i64,
    #[serde(rename = "meter_power_value_watt")]
    pub meter_power_watt: f64,
    #[serde(rename = "photovoltaic_power_value_watt")]
    pub pv_power_watt: f64,
    #[serde(rename = "combined_power_value_watt")]
    pub combined_power_watt: f64,
}

impl CombinedRecord {
    pub fn combine(reading: &Reading, pv_power_watt: f64) -> Self {
        Self {
            timestamp: reading.timestamp,
            meter_power_watt: reading.meter_power_watt,
            pv_power_watt,
            combined_power_watt: pv_power_watt + reading.meter_power_watt,
        }
    }
}

/// Everything the consumer can find on the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Reading(Reading),
    Stop,
}

#[derive(Debug, Error)]
#[error("malformed message body {body:?}: {source}")]
pub struct MalformedMessage {
    pub body: String,
    #[source]
    pub source: serde_json::Error,
}

impl Message {
    pub fn parse(body: &[u8]) -> Result<Self, MalformedMessage> {
        if body == SENTINEL.as_bytes() {
            return Ok(Message::Stop);
        }
        serde_json::from_slice(body)
            .map(Message::Reading)
            .map_err(|source| MalformedMessage {
                body: String::from_utf8_lossy(body).into_owned(),
                source,
            })
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        match self {
            Message::Reading(reading) => Ok(serde_json::to_string(reading)?),
            Message::Stop => Ok(SENTINEL.to_string()),
        }
    }
}
