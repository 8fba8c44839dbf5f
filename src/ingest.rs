//! Ingest: stream raw CSV event files into typed [`Event`]s.
//!
//! Every column is decoded as text by the arrow CSV reader and coerced per
//! record, so one bad value only drops its own record.

use crate::config::EngineConfig;
use crate::error::{MalformedRecordError, Result};
use crate::event::{Event, EventType, LocalTime};
use arrow::array::{Array, AsArray, StringArray};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono_tz::Tz;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Counters produced by one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub files: usize,
    pub rows_read: u64,
    pub ingested: u64,
    pub dropped: u64,
    pub ingested_by_type: BTreeMap<EventType, u64>,
    /// First few malformed-record messages, `file:line: reason`.
    pub samples: Vec<String>,
}

impl IngestReport {
    fn record_dropped(&mut self, source: &str, line: usize, err: &MalformedRecordError, limit: usize) {
        self.dropped += 1;
        if self.samples.len() < limit {
            self.samples.push(format!("{}:{}: {}", source, line, err));
        }
    }
}

/// List the `*.csv` files of a directory, sorted by name.
pub fn discover_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Ingest every file in order, pushing each valid event into `sink`.
pub fn ingest_files<F>(files: &[PathBuf], config: &EngineConfig, mut sink: F) -> Result<IngestReport>
where
    F: FnMut(Event) -> Result<()>,
{
    let tz = config.tz()?;
    let mut report = IngestReport::default();
    for path in files {
        let start = Instant::now();
        let before = report.ingested;
        let file = File::open(path)?;
        let source = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        ingest_reader(&source, file, tz, config, &mut report, &mut sink)?;
        report.files += 1;
        info!(
            "Ingested {} events from {} in {:?}",
            report.ingested - before,
            source,
            start.elapsed()
        );
    }
    if report.dropped > 0 {
        warn!(
            "Dropped {} malformed records out of {}",
            report.dropped, report.rows_read
        );
    }
    Ok(report)
}

/// Ingest one CSV stream. Columns are matched by header name.
///
/// Records are one per line. Lines are decoded in chunks of `batch_size`;
/// when a chunk fails to decode as a whole, its lines are decoded one at a
/// time so only the broken ones are dropped.
pub fn ingest_reader<R, F>(
    source: &str,
    mut reader: R,
    tz: Tz,
    config: &EngineConfig,
    report: &mut IngestReport,
    sink: &mut F,
) -> Result<()>
where
    R: Read + Seek,
    F: FnMut(Event) -> Result<()>,
{
    let format = Format::default().with_header(true);
    let (header, _) = format.infer_schema(&mut reader, Some(0))?;
    reader.rewind()?;

    let text_fields: Vec<Field> = header
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(text_fields));
    debug!(
        "{}: columns {:?}",
        source,
        schema.fields().iter().map(|f| f.name()).collect::<Vec<_>>()
    );

    let mut input = BufReader::new(reader);
    let mut line_buf = Vec::new();
    input.read_until(b'\n', &mut line_buf)?;

    let mut chunk = LineChunk::new(schema, config.batch_size.max(1));
    let mut ctx = RecordSink {
        source,
        tz,
        sample_limit: config.malformed_sample_limit,
        report,
        sink,
    };
    // Line 1 is the header.
    let mut line = 1usize;
    loop {
        line_buf.clear();
        if input.read_until(b'\n', &mut line_buf)? == 0 {
            break;
        }
        line += 1;
        if line_buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        chunk.push(line, &line_buf);
        if chunk.is_full() {
            chunk.drain_into(&mut ctx)?;
        }
    }
    chunk.drain_into(&mut ctx)
}

/// Where decoded rows go: coerced, counted, and handed to the sink.
struct RecordSink<'a, F> {
    source: &'a str,
    tz: Tz,
    sample_limit: usize,
    report: &'a mut IngestReport,
    sink: &'a mut F,
}

impl<F> RecordSink<'_, F>
where
    F: FnMut(Event) -> Result<()>,
{
    fn accept(&mut self, columns: &RawColumns<'_>, row: usize, line: usize) -> Result<()> {
        self.report.rows_read += 1;
        match columns.coerce(row, self.tz) {
            Ok(event) => {
                *self.report.ingested_by_type.entry(event.event_type).or_default() += 1;
                self.report.ingested += 1;
                (self.sink)(event)
            }
            Err(err) => {
                self.reject(line, &err);
                Ok(())
            }
        }
    }

    fn reject(&mut self, line: usize, err: &MalformedRecordError) {
        self.report.record_dropped(self.source, line, err, self.sample_limit);
    }
}

/// Raw bytes of up to `capacity` records, with their line numbers.
struct LineChunk {
    schema: SchemaRef,
    capacity: usize,
    bytes: Vec<u8>,
    lines: Vec<(usize, Range<usize>)>,
}

impl LineChunk {
    fn new(schema: SchemaRef, capacity: usize) -> Self {
        Self {
            schema,
            capacity,
            bytes: Vec::new(),
            lines: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, line: usize, raw: &[u8]) {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(raw);
        if !raw.ends_with(b"\n") {
            self.bytes.push(b'\n');
        }
        self.lines.push((line, start..self.bytes.len()));
    }

    fn is_full(&self) -> bool {
        self.lines.len() >= self.capacity
    }

    fn drain_into<F>(&mut self, ctx: &mut RecordSink<'_, F>) -> Result<()>
    where
        F: FnMut(Event) -> Result<()>,
    {
        if self.lines.is_empty() {
            return Ok(());
        }
        match decode_records(&self.schema, &self.bytes, self.capacity) {
            Ok(Some(batch)) if batch.num_rows() == self.lines.len() => {
                let columns = RawColumns::new(&batch);
                for (row, (line, _)) in self.lines.iter().enumerate() {
                    ctx.accept(&columns, row, *line)?;
                }
            }
            outcome => {
                if let Err(e) = outcome {
                    debug!("{}: re-reading chunk line by line: {}", ctx.source, e);
                }
                for (line, range) in &self.lines {
                    match decode_records(&self.schema, &self.bytes[range.clone()], 1) {
                        Ok(Some(batch)) if batch.num_rows() == 1 => {
                            ctx.accept(&RawColumns::new(&batch), 0, *line)?;
                        }
                        Ok(_) => {
                            ctx.report.rows_read += 1;
                            let err = MalformedRecordError::Unparseable("no record".into());
                            ctx.reject(*line, &err);
                        }
                        Err(e) => {
                            ctx.report.rows_read += 1;
                            ctx.reject(*line, &MalformedRecordError::Unparseable(e.to_string()));
                        }
                    }
                }
            }
        }
        self.bytes.clear();
        self.lines.clear();
        Ok(())
    }
}

/// Decode headerless CSV bytes into one all-text batch.
fn decode_records(
    schema: &SchemaRef,
    bytes: &[u8],
    batch_size: usize,
) -> std::result::Result<Option<RecordBatch>, ArrowError> {
    let mut decoder = ReaderBuilder::new(schema.clone())
        .with_batch_size(batch_size)
        .with_truncated_rows(true)
        .build_decoder();
    let mut rest = bytes;
    loop {
        let consumed = decoder.decode(rest)?;
        if consumed == 0 {
            break;
        }
        rest = &rest[consumed..];
    }
    decoder.flush()
}

/// Text columns of one decoded CSV batch, looked up by name.
struct RawColumns<'a> {
    ts: Option<&'a StringArray>,
    event_type: Option<&'a StringArray>,
    auction_id: Option<&'a StringArray>,
    advertiser_id: Option<&'a StringArray>,
    publisher_id: Option<&'a StringArray>,
    bid_price: Option<&'a StringArray>,
    user_id: Option<&'a StringArray>,
    total_price: Option<&'a StringArray>,
    country: Option<&'a StringArray>,
}

impl<'a> RawColumns<'a> {
    fn new(batch: &'a RecordBatch) -> Self {
        let col = |name: &str| batch.column_by_name(name).map(|c| c.as_string::<i32>());
        Self {
            ts: col("ts"),
            event_type: col("type"),
            auction_id: col("auction_id"),
            advertiser_id: col("advertiser_id"),
            publisher_id: col("publisher_id"),
            bid_price: col("bid_price"),
            user_id: col("user_id"),
            total_price: col("total_price"),
            country: col("country"),
        }
    }

    fn coerce(&self, row: usize, tz: Tz) -> std::result::Result<Event, MalformedRecordError> {
        let ts_text = text(self.ts, row).ok_or(MalformedRecordError::Missing("ts"))?;
        let ts_ms = parse_epoch_millis(ts_text).ok_or_else(|| invalid("ts", ts_text))?;
        let local = LocalTime::derive(ts_ms, tz).ok_or_else(|| invalid("ts", ts_text))?;

        let type_text = text(self.event_type, row).ok_or(MalformedRecordError::Missing("type"))?;
        let event_type = type_text
            .parse::<EventType>()
            .map_err(|_| invalid("type", type_text))?;

        let country = text(self.country, row).ok_or(MalformedRecordError::Missing("country"))?;

        Ok(Event {
            ts_ms,
            event_type,
            auction_id: text(self.auction_id, row).map(str::to_string),
            advertiser_id: text(self.advertiser_id, row).and_then(|s| s.parse().ok()),
            publisher_id: text(self.publisher_id, row).and_then(|s| s.parse().ok()),
            bid_price: strict_f64(self.bid_price, row, "bid_price")?,
            user_id: text(self.user_id, row).and_then(|s| s.parse().ok()),
            total_price: strict_f64(self.total_price, row, "total_price")?,
            country: country.to_string(),
            local,
        })
    }
}

fn text(column: Option<&StringArray>, row: usize) -> Option<&str> {
    column
        .filter(|c| !c.is_null(row))
        .map(|c| c.value(row).trim())
        .filter(|s| !s.is_empty())
}

fn invalid(field: &'static str, value: &str) -> MalformedRecordError {
    MalformedRecordError::Invalid {
        field,
        value: value.to_string(),
    }
}

/// Empty is null; anything else must parse as a finite number.
fn strict_f64(
    column: Option<&StringArray>,
    row: usize,
    field: &'static str,
) -> std::result::Result<Option<f64>, MalformedRecordError> {
    match text(column, row) {
        None => Ok(None),
        Some(s) => s
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(field, s)),
    }
}

fn parse_epoch_millis(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    let ms = s.parse::<f64>().ok().filter(|v| v.is_finite())?;
    let floored = ms.floor();
    if floored < i64::MIN as f64 || floored > i64::MAX as f64 {
        return None;
    }
    Some(floored as i64)
}

/// Convenience used by tests and tooling: ingest CSV text held in memory.
pub fn ingest_text(source: &str, csv: &str, config: &EngineConfig) -> Result<(Vec<Event>, IngestReport)> {
    let tz = config.tz()?;
    let mut events = Vec::new();
    let mut report = IngestReport::default();
    let mut sink = |event: Event| -> Result<()> {
        events.push(event);
        Ok(())
    };
    ingest_reader(
        source,
        std::io::Cursor::new(csv.as_bytes()),
        tz,
        config,
        &mut report,
        &mut sink,
    )?;
    report.files = 1;
    Ok((events, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ts,type,auction_id,advertiser_id,publisher_id,bid_price,user_id,total_price,country";

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn missing_country_drops_only_that_record() {
        let mut csv = String::from(HEADER);
        csv.push('\n');
        for i in 0..10 {
            let country = if i == 4 { "" } else { "US" };
            csv.push_str(&format!(
                "{},impression,a{},7,3,1.5,99,,{}\n",
                1_717_200_000_000i64 + i,
                i,
                country
            ));
        }

        let (events, report) = ingest_text("impressions.csv", &csv, &config()).unwrap();
        assert_eq!(events.len(), 9);
        assert_eq!(report.ingested, 9);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.rows_read, 10);
        assert_eq!(report.ingested_by_type.get(&EventType::Impression), Some(&9));
        assert!(report.samples[0].contains("impressions.csv:6"));
        assert!(report.samples[0].contains("country"));
    }

    #[test]
    fn columns_are_matched_by_header_name() {
        let csv = "country,type,ts,total_price\nJP,purchase,1717200000000,25.5\n";
        let (events, report) = ingest_text("reordered.csv", csv, &config()).unwrap();
        assert_eq!(report.dropped, 0);
        assert_eq!(events[0].event_type, EventType::Purchase);
        assert_eq!(events[0].total_price, Some(25.5));
        assert_eq!(events[0].advertiser_id, None);
        assert_eq!(events[0].country, "JP");
    }

    #[test]
    fn ids_coerce_leniently_and_prices_strictly() {
        let csv = format!(
            "{}\n1717200000000,click,a1,abc,12,,5,,DE\n1717200000000,purchase,a2,1,2,,5,lots,DE\n1717200000000,bounce,a3,1,2,,5,,DE\n",
            HEADER
        );
        let (events, report) = ingest_text("mixed.csv", &csv, &config()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].advertiser_id, None);
        assert_eq!(events[0].publisher_id, Some(12));
        assert_eq!(report.dropped, 2);
    }

    #[test]
    fn structurally_broken_lines_are_dropped() {
        let csv = format!(
            "{}\n\
             1717200000000,impression,a1,7,3,1.5,99,,US\n\
             1717200000001,impression,a2,7,3,1.5,99,,US,extra\n\
             1717200000002,click,a3,7,3,,99,,JP\n",
            HEADER
        );
        let (events, report) = ingest_text("wide.csv", &csv, &config()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(report.ingested, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.rows_read, 3);
        assert!(report.samples[0].starts_with("wide.csv:3:"));
        assert_eq!(events[1].country, "JP");
    }

    #[test]
    fn bad_line_only_drops_itself_within_a_chunk() {
        let config = EngineConfig {
            batch_size: 4,
            ..config()
        };
        let mut csv = String::from(HEADER);
        csv.push('\n');
        for i in 0..10 {
            match i {
                2 => csv.push_str("1717200000000,impression,\"unterminated,7,3,1.5,99,,US\n"),
                5 => csv.push_str("1717200000000,serve,a5,7,3,1.5,99,,US,1,2\n"),
                7 => csv.push('\n'),
                _ => csv.push_str(&format!("{},serve,a{},7,3,0.5,99,,DE\n", 1_717_200_000_000i64 + i, i)),
            }
        }
        let mut bytes = csv.into_bytes();
        // Invalid UTF-8 in a trailing line.
        bytes.extend_from_slice(b"1717200000000,serve,a\xff,7,3,0.5,99,,DE\n");

        let tz = config.tz().unwrap();
        let mut report = IngestReport::default();
        let mut events = Vec::new();
        let mut sink = |event: Event| -> Result<()> {
            events.push(event);
            Ok(())
        };
        ingest_reader(
            "mixed.csv",
            std::io::Cursor::new(bytes),
            tz,
            &config,
            &mut report,
            &mut sink,
        )
        .unwrap();

        assert_eq!(report.ingested, 7);
        assert_eq!(report.dropped, 3);
        assert_eq!(report.rows_read, 10);
        assert_eq!(events.len(), 7);
        assert!(events.iter().all(|e| e.country == "DE"));
        assert!(report.samples.iter().any(|s| s.starts_with("mixed.csv:7:")));
        assert!(report.samples.iter().any(|s| s.starts_with("mixed.csv:12:")));
    }

    #[test]
    fn fractional_timestamps_are_floored_to_millis() {
        assert_eq!(parse_epoch_millis("1717200000000.9"), Some(1_717_200_000_000));
        assert_eq!(parse_epoch_millis("1717200000000"), Some(1_717_200_000_000));
        assert_eq!(parse_epoch_millis("NaN"), None);
        assert_eq!(parse_epoch_millis("soon"), None);
    }
}
