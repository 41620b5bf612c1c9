use crate::error::{AppError, Result};
use crate::models::RawChannelRecord;
use serde::Deserialize;
use tracing::warn;

/// Default failure threshold - fail if more than 10% of records fail to decode
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_records: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        self.failure_rate = if self.total_records > 0 {
            self.parse_failures as f64 / self.total_records as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    results: Vec<serde_json::Value>,
}

pub struct Parser;

impl Parser {
    /// Parse a PurpleAir JSON response body and return records with parse statistics
    pub fn parse_response(content: &str) -> Result<(Vec<RawChannelRecord>, ParseStats)> {
        Self::parse_response_with_threshold(content, DEFAULT_FAILURE_THRESHOLD)
    }

    /// Parse a PurpleAir JSON response body with a custom failure threshold
    pub fn parse_response_with_threshold(
        content: &str,
        failure_threshold: f64,
    ) -> Result<(Vec<RawChannelRecord>, ParseStats)> {
        let envelope: ResponseEnvelope = serde_json::from_str(content)?;

        let mut records = Vec::with_capacity(envelope.results.len());
        let mut stats = ParseStats::new();

        for (index, value) in envelope.results.into_iter().enumerate() {
            stats.total_records += 1;

            match serde_json::from_value::<RawChannelRecord>(value) {
                Ok(record) => {
                    records.push(record);
                    stats.parsed_successfully += 1;
                }
                Err(e) => {
                    stats.parse_failures += 1;
                    warn!(
                        "Failed to decode record {} (failure {}/{}): {}",
                        index + 1,
                        stats.parse_failures,
                        stats.total_records,
                        e
                    );
                }
            }
        }

        stats.finalize();

        // Validate parse success rate
        if stats.exceeds_threshold(failure_threshold) {
            return Err(AppError::Parse(format!(
                "Record failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} records",
                stats.failure_rate * 100.0,
                failure_threshold * 100.0,
                stats.parse_failures,
                stats.total_records
            )));
        }

        Ok((records, stats))
    }
}
