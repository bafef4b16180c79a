//! Snapshot export of recorded heart rate readings.
//!
//! The collector persists every reading it receives into a SQLite table
//! `heart_rate(id, bpm, created_at)`. This module dumps a trailing window of that
//! table to a JSON array for charting tools.

use chrono::{DateTime, Utc};
use clap::Parser;
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Timestamp layout SQLite uses for `CURRENT_TIMESTAMP`.
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const READINGS_SINCE_QUERY: &str = "
    SELECT bpm, CAST(strftime('%s', created_at) AS INTEGER) AS time
    FROM heart_rate
    WHERE datetime(created_at) >= datetime(?1)
    ORDER BY created_at ASC";

/// Configuration for an export run.
#[derive(Parser, Debug, Clone)]
#[command(author, about = "Export recent heart rate readings to JSON", version)]
pub struct ExportOptions {
    /// SQLite database written by the collector.
    #[arg(long, default_value = "cache/data.sqlite")]
    pub database: PathBuf,

    /// Destination of the JSON snapshot.
    #[arg(long, default_value = "heart_rate_data.json")]
    pub output: PathBuf,

    /// How far back to export.
    /// Accepts duration with suffix: 30m, 5h.
    #[arg(long, default_value = "5h", value_parser = crate::duration::parse_duration)]
    pub window: Duration,
}

/// Errors returned by the export.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to write snapshot: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export window of {0:?} is out of range")]
    Window(Duration),
}

/// One exported reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reading {
    /// Unix timestamp in seconds
    pub time: i64,
    /// Beats per minute
    pub bpm: i64,
}

/// Start of the export window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>, ExportError> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or(ExportError::Window(window))
}

/// Query readings recorded at or after `since`, oldest first.
pub fn query_readings(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<Reading>, ExportError> {
    let since = since.format(SQLITE_DATETIME_FORMAT).to_string();

    let mut stmt = conn.prepare(READINGS_SINCE_QUERY)?;
    let readings = stmt
        .query_map(params![since], |row| {
            Ok(Reading {
                bpm: row.get(0)?,
                time: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(readings)
}

/// Write `readings` as a pretty-printed JSON array, replacing `path`.
pub fn write_snapshot(path: &Path, readings: &[Reading]) -> Result<(), ExportError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, readings)?;
    writer.flush()?;
    Ok(())
}

/// Export the readings of the window ending at `now`.
///
/// Returns the number of readings written.
pub fn run(options: &ExportOptions, now: DateTime<Utc>) -> Result<usize, ExportError> {
    let since = window_start(now, options.window)?;
    let conn = Connection::open_with_flags(&options.database, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let readings = query_readings(&conn, since)?;
    write_snapshot(&options.output, &readings)?;

    info!(
        "Exported {} readings since {} to {}",
        readings.len(),
        since.format(SQLITE_DATETIME_FORMAT),
        options.output.display()
    );
    Ok(readings.len())
}
