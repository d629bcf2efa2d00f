use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use rmaperf::{ClockRate, PingPongOutcome, SessionOutcome, SessionParams, SignalPolicy};

/// One measured request.
pub struct RequestRow {
    pub round: u32,
    pub index: u32,
    pub verb: String,
    pub mode: String,
    pub length: u64,
    pub start: u64,
    pub end: Option<u64>,
    pub latency_us: Option<f64>,
    pub signaled: bool,
}

fn latency(rate: ClockRate, start: u64, end: Option<u64>) -> Option<f64> {
    end.map(|end| rate.ticks_to_us(end.saturating_sub(start)))
}

/// Rows for every request after warmup, in every round.
pub fn rows_from_session(params: &SessionParams, outcome: &SessionOutcome) -> Vec<RequestRow> {
    let policy = SignalPolicy::for_mode(params.mode, params.signal_interval);
    let verb = params.verb.to_string();
    let mode = params.mode.to_string();
    outcome
        .rounds
        .iter()
        .flat_map(|round| {
            let count = round.records.len();
            round
                .records
                .iter()
                .enumerate()
                .skip(params.warmup_count)
                .map(|(i, r)| RequestRow {
                    round: round.round as u32,
                    index: i as u32,
                    verb: verb.clone(),
                    mode: mode.clone(),
                    length: r.length as u64,
                    start: r.start,
                    end: r.end,
                    latency_us: latency(outcome.clock_rate, r.start, r.end),
                    signaled: policy.is_signaled(i, count),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Rows for every round trip of a ping-pong run.
pub fn rows_from_pingpong(params: &SessionParams, outcome: &PingPongOutcome) -> Vec<RequestRow> {
    let interval = params.signal_interval.max(1);
    outcome
        .spans
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| RequestRow {
            round: 1,
            index: i as u32,
            verb: "write".to_string(),
            mode: "pingpong".to_string(),
            length: params.length as u64,
            start,
            end: Some(end),
            latency_us: latency(outcome.clock_rate, start, Some(end)),
            signaled: i.is_multiple_of(interval),
        })
        .collect()
}

pub fn write_parquet(path: &str, rows: &[RequestRow]) -> Result<(), Box<dyn std::error::Error>> {
    if rows.is_empty() {
        return Ok(());
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("round", DataType::UInt32, false),
        Field::new("index", DataType::UInt32, false),
        Field::new("verb", DataType::Utf8, false),
        Field::new("mode", DataType::Utf8, false),
        Field::new("length", DataType::UInt64, false),
        Field::new("start", DataType::UInt64, false),
        Field::new("end", DataType::UInt64, true),
        Field::new("latency_us", DataType::Float64, true),
        Field::new("signaled", DataType::Boolean, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.round).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.index).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.verb.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.mode.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.length).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.start).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.end).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.latency_us).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(BooleanArray::from(
                rows.iter().map(|r| r.signaled).collect::<Vec<_>>(),
            )) as ArrayRef,
        ],
    )?;

    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}
