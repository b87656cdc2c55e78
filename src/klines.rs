//! Historical candle fetching
//!
//! Two sources: the paginated REST endpoint for standard intervals, and
//! the daily ZIP archives for fine-grained intervals the REST API does
//! not serve. Both return chronological series, oldest first.

use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::types::Kline;

const ARCHIVE_BASE_URL: &str = "https://data.binance.vision/data/spot/daily/klines";
/// Upstream page size cap for the klines endpoint
const MAX_PAGE_SIZE: usize = 1000;

/// Timestamps above this are microseconds and get scaled back to millis
const MICROS_THRESHOLD: i64 = 1_000_000_000_000_000;

pub struct KlinesFetcher {
    client: reqwest::Client,
    archive_client: reqwest::Client,
    base_url: String,
}

impl KlinesFetcher {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        // Archive days can run to tens of megabytes
        let archive_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");

        KlinesFetcher {
            client,
            archive_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch OHLCV klines, paginating backwards when `limit` exceeds one page
    ///
    /// Pages walk into the past via `endTime = oldest.open_time - 1` until
    /// `limit` candles accumulate or the upstream runs out of history. The
    /// result is trimmed to the most recent `limit`.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let symbol = symbol.trim().to_uppercase();
        let url = format!("{}/api/v3/klines", self.base_url);

        let mut all: Vec<Kline> = Vec::new();
        let mut end_time: Option<i64> = None;
        let mut remaining = limit;

        while remaining > 0 {
            let batch_size = remaining.min(MAX_PAGE_SIZE);
            let mut query: Vec<(String, String)> = vec![
                ("symbol".to_string(), symbol.clone()),
                ("interval".to_string(), interval.to_string()),
                ("limit".to_string(), batch_size.to_string()),
            ];
            if let Some(end) = end_time {
                query.push(("endTime".to_string(), end.to_string()));
            }

            let rows: Vec<serde_json::Value> = self
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .context("failed to fetch klines")?
                .error_for_status()?
                .json()
                .await
                .context("failed to parse klines response")?;

            if rows.is_empty() {
                break;
            }

            let fetched = rows.len();
            let mut batch = parse_kline_rows(&rows);
            batch.extend(all);
            all = batch;
            remaining = remaining.saturating_sub(fetched);

            if fetched < batch_size {
                break;
            }
            // Next page ends just before the oldest candle seen so far
            end_time = all.first().map(|k| k.open_time - 1);
        }

        // Trim to the exact limit, keeping the most recent
        if all.len() > limit {
            all = all.split_off(all.len() - limit);
        }
        Ok(all)
    }

    /// Fetch klines from the daily archive files
    ///
    /// One ZIP per UTC day, walked oldest first. The archive publishes
    /// with about a day of lag, so the walk starts two days back. Days
    /// that 404 are skipped silently; malformed archives warn and skip.
    pub async fn fetch_klines_archive(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        on_progress: Option<&(dyn Fn(usize, usize, &str) + Send + Sync)>,
    ) -> Result<Vec<Kline>> {
        let symbol = symbol.trim().to_uppercase();
        let today = Utc::now().date_naive();
        let dates: Vec<NaiveDate> = (1..=days + 1)
            .rev()
            .map(|d| today - Duration::days(d as i64))
            .collect();

        let mut all: Vec<Kline> = Vec::new();

        for (i, date) in dates.iter().enumerate() {
            let date_str = date.format("%Y-%m-%d").to_string();
            let url = format!(
                "{}/{}/{}/{}-{}-{}.zip",
                ARCHIVE_BASE_URL, symbol, interval, symbol, interval, date_str
            );

            if let Some(progress) = on_progress {
                progress(i + 1, dates.len(), &date_str);
            }

            let response = match self.archive_client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("failed to fetch {} {}: {}", symbol, date_str, e);
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("no archive data for {} {} (404)", symbol, date_str);
                continue;
            }
            let bytes = match response.error_for_status() {
                Ok(resp) => match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("failed to read {} {}: {}", symbol, date_str, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("failed to fetch {} {}: {}", symbol, date_str, e);
                    continue;
                }
            };

            match parse_archive(&bytes) {
                Ok(mut klines) => all.append(&mut klines),
                Err(e) => warn!("error processing {} {}: {}", symbol, date_str, e),
            }
        }

        info!(
            "archive: fetched {} klines for {} ({}, {}d)",
            all.len(),
            symbol,
            interval,
            days
        );
        Ok(all)
    }
}

/// Parse the upstream kline array-of-arrays format
///
/// Rows look like `[openTime, "open", "high", "low", "close", "volume", …]`
/// with numbers serialized as strings. Malformed rows are dropped.
fn parse_kline_rows(rows: &[serde_json::Value]) -> Vec<Kline> {
    rows.iter().filter_map(parse_kline_row).collect()
}

fn parse_kline_row(row: &serde_json::Value) -> Option<Kline> {
    let fields = row.as_array()?;
    if fields.len() < 6 {
        return None;
    }
    Some(Kline {
        open_time: fields[0].as_i64()?,
        open: numeric(&fields[1])?,
        high: numeric(&fields[2])?,
        low: numeric(&fields[3])?,
        close: numeric(&fields[4])?,
        volume: numeric(&fields[5])?,
    })
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Extract and parse the CSV inside a daily archive ZIP
fn parse_archive(bytes: &[u8]) -> Result<Vec<Kline>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("archive is not a valid ZIP")?;
    if archive.len() == 0 {
        anyhow::bail!("archive contains no entries");
    }
    let mut entry = archive.by_index(0).context("failed to open archive entry")?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .context("failed to read archive entry")?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data.as_slice());

    let mut klines = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => continue,
        };
        if record.len() < 6 {
            continue;
        }
        // A non-numeric first column is the header row
        let mut open_time: i64 = match record[0].parse() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if open_time > MICROS_THRESHOLD {
            open_time /= 1000;
        }

        let parsed = (
            record[1].parse::<f64>(),
            record[2].parse::<f64>(),
            record[3].parse::<f64>(),
            record[4].parse::<f64>(),
            record[5].parse::<f64>(),
        );
        if let (Ok(open), Ok(high), Ok(low), Ok(close), Ok(volume)) = parsed {
            klines.push(Kline {
                open_time,
                open,
                high,
                low,
                close,
                volume,
            });
        }
    }
    Ok(klines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_kline_row_string_fields() {
        let row = json!([
            1700000000000i64,
            "42000.1",
            "42100.5",
            "41900.0",
            "42050.2",
            "12.5",
            1700000059999i64,
            "525000.0"
        ]);
        let kline = parse_kline_row(&row).unwrap();
        assert_eq!(kline.open_time, 1700000000000);
        assert_eq!(kline.open, 42000.1);
        assert_eq!(kline.close, 42050.2);
        assert_eq!(kline.volume, 12.5);
    }

    #[test]
    fn test_parse_kline_row_numeric_fields() {
        let row = json!([1700000000000i64, 1.0, 2.0, 0.5, 1.5, 100.0]);
        assert!(parse_kline_row(&row).is_some());
    }

    #[test]
    fn test_parse_kline_rows_drops_malformed() {
        let rows = vec![
            json!([1700000000000i64, "1", "2", "0.5", "1.5", "100"]),
            json!(["not-a-row"]),
            json!([1700000060000i64, "1", "2", "0.5", "1.6", "90"]),
        ];
        let klines = parse_kline_rows(&rows);
        assert_eq!(klines.len(), 2);
    }

    fn zip_with_csv(csv: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("day.csv", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(csv.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_parse_archive_rows() {
        let csv = "1700000000000,100.0,101.0,99.0,100.5,10.0,x,y\n\
                   1700000001000,100.5,102.0,100.0,101.5,11.0,x,y\n";
        let klines = parse_archive(&zip_with_csv(csv)).unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].open_time, 1700000000000);
        assert_eq!(klines[1].close, 101.5);
    }

    #[test]
    fn test_parse_archive_skips_header_and_short_rows() {
        let csv = "open_time,open,high,low,close,volume\n\
                   1700000000000,100.0,101.0,99.0,100.5,10.0\n\
                   123,4\n";
        let klines = parse_archive(&zip_with_csv(csv)).unwrap();
        assert_eq!(klines.len(), 1);
    }

    #[test]
    fn test_parse_archive_rescales_microseconds() {
        let csv = "1700000000000000,100.0,101.0,99.0,100.5,10.0\n";
        let klines = parse_archive(&zip_with_csv(csv)).unwrap();
        assert_eq!(klines[0].open_time, 1700000000000);
    }

    #[test]
    fn test_parse_archive_rejects_garbage() {
        assert!(parse_archive(b"definitely not a zip").is_err());
    }
}
