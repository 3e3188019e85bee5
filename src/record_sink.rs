use crate::message::CombinedRecord;
use anyhow::Context;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Append-only destination for combined records.
pub trait RecordSink: Send {
    fn append(&mut self, record: &CombinedRecord) -> anyhow::Result<()>;
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn append(&mut self, record: &CombinedRecord) -> anyhow::Result<()> {
        (**self).append(record)
    }
}

/// Collects records in memory.
impl RecordSink for Vec<CombinedRecord> {
    fn append(&mut self, record: &CombinedRecord) -> anyhow::Result<()> {
        self.push(*record);
        Ok(())
    }
}

/// Writes one CSV row per record, without a header:
/// `timestamp, meter_power_value_watt, photovoltaic_power_value_watt, combined_power_value_watt`.
///
/// The file is opened in append mode for every row and created if missing,
/// so rows already written survive a crash of the consumer.
#[derive(Debug, Clone)]
pub struct CsvRecordSink {
    path: PathBuf,
}

impl CsvRecordSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for CsvRecordSink {
    fn append(&mut self, record: &CombinedRecord) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Cannot open output file {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }
}
