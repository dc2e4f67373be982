//! Candle loading from CSV
//!
//! Expected columns: `datetime,open,high,low,close,volume`. Datetimes are
//! RFC 3339 or `YYYY-MM-DD HH:MM:SS` (assumed UTC).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;

use crate::Candle;

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

fn field(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f64> {
    record
        .get(idx)
        .with_context(|| format!("Missing {} column", name))?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", name))
}

/// Load candles from a CSV file, sorted oldest first
pub fn load_candles_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let datetime = parse_datetime(record.get(0).context("Missing datetime column")?.trim())?;

        let candle = Candle {
            datetime,
            open: field(&record, 1, "open")?,
            high: field(&record, 2, "high")?,
            low: field(&record, 3, "low")?,
            close: field(&record, 4, "close")?,
            volume: field(&record, 5, "volume")?,
        };
        candle
            .validate()
            .with_context(|| format!("Invalid candle at row {}", row_idx + 1))?;
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.datetime);
    tracing::debug!("Loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_and_sort() {
        let path = std::env::temp_dir().join(format!("candles-{}.csv", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "datetime,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-01-01 01:00:00,101,103,100,102,5").unwrap();
        writeln!(file, "2024-01-01T00:00:00Z,100,102,99,101,4").unwrap();
        drop(file);

        let candles = load_candles_csv(&path).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[1].close, 102.0);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_invalid_row_is_rejected() {
        let path = std::env::temp_dir().join(format!("candles-{}.csv", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "datetime,open,high,low,close,volume\n2024-01-01 00:00:00,100,98,99,100,1\n",
        )
        .unwrap();

        assert!(load_candles_csv(&path).is_err());
        std::fs::remove_file(path).ok();
    }
}
