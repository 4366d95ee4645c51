//! JSONL journal of engine events, rotated daily.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::{EngineEvent, EventSink, TracingSink};

/// Appends one JSON object per line to `<logs_dir>/YYYY-MM-DD.jsonl`,
/// switching files when the local date changes.
pub struct JsonlLogger {
    logs_dir: PathBuf,
    open: Option<(NaiveDate, BufWriter<File>)>,
}

impl JsonlLogger {
    pub fn new(logs_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;
        Ok(Self { logs_dir, open: None })
    }

    /// Path of the journal file for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn writer_for(&mut self, date: NaiveDate) -> Result<&mut BufWriter<File>> {
        if !matches!(&self.open, Some((open_date, _)) if *open_date == date) {
            let path = self.path_for(date);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open journal file: {:?}", path))?;
            debug!("Journal file: {:?}", path);
            // Replacing flushes the previous day's writer on drop.
            self.open = Some((date, BufWriter::new(file)));
        }

        match &mut self.open {
            Some((_, writer)) => Ok(writer),
            None => anyhow::bail!("journal file not open"),
        }
    }

    /// Append `entry` to today's file and flush it.
    pub fn write_line<T: Serialize>(&mut self, entry: &T) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let writer = self.writer_for(Local::now().date_naive())?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink that logs through tracing and hands events to a writer thread, so
/// engine tasks never wait on file I/O.
pub struct JournalSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
    writer: Option<JoinHandle<()>>,
}

impl JournalSink {
    pub fn new(logs_dir: PathBuf) -> Result<Self> {
        let mut logger = JsonlLogger::new(logs_dir)?;
        let (tx, rx) = mpsc::channel::<EngineEvent>();

        let writer = thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || {
                for event in rx {
                    if let Err(e) = logger.write_line(&event) {
                        warn!("Failed to write journal entry: {}", e);
                    }
                }
                debug!("Journal writer thread exiting");
            })?;

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }
}

impl EventSink for JournalSink {
    fn record(&self, event: EngineEvent) {
        TracingSink.record(event.clone());
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl Drop for JournalSink {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
