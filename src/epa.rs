use crate::aqi::{calculate_aqi, round_to, Pollutant};
use crate::models::{AqiReading, AqiStatus, StationId, StationReading};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Samples kept per station, one hour at the 5 minute upstream cadence.
pub const EPA_CACHE_CAPACITY: usize = 12;

/// Minutes between upstream samples, used for the readiness estimate.
pub const SAMPLE_INTERVAL_MINUTES: u32 = 5;

/// Samples older than this are evicted from the rolling window.
pub const EPA_SAMPLE_MAX_AGE_SECONDS: i64 = 3600;

/// PM2.5 CF=1 average above which the high-concentration fit applies.
pub const EPA_HIGH_CONCENTRATION_THRESHOLD: f64 = 343.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpaAvgValue {
    pub humidity: f64,
    pub pm25_cf1: f64,
    pub timestamp: DateTime<Utc>,
}

/// Rolling per-station window of (humidity, PM2.5 CF=1) samples.
#[derive(Debug, Default)]
pub struct EpaValueCache {
    queues: HashMap<StationId, VecDeque<EpaAvgValue>>,
}

impl EpaValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, dropping the oldest one once the station is at capacity.
    pub fn push(&mut self, station_id: &str, sample: EpaAvgValue) {
        let queue = self
            .queues
            .entry(station_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(EPA_CACHE_CAPACITY));

        if queue.len() >= EPA_CACHE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(sample);
    }

    /// Remove samples older than an hour relative to `now`, returning how many were dropped.
    pub fn evict_expired(&mut self, station_id: &str, now: DateTime<Utc>) -> usize {
        let Some(queue) = self.queues.get_mut(station_id) else {
            return 0;
        };

        let cutoff = now - Duration::seconds(EPA_SAMPLE_MAX_AGE_SECONDS);
        let before = queue.len();
        queue.retain(|sample| sample.timestamp >= cutoff);
        before - queue.len()
    }

    /// Mean humidity and PM2.5 CF=1 over the window, rounded to 5 decimals.
    pub fn averages(&self, station_id: &str) -> Option<(f64, f64)> {
        let queue = self.queues.get(station_id).filter(|q| !q.is_empty())?;
        let count = queue.len() as f64;

        let humidity = queue.iter().map(|s| s.humidity).sum::<f64>() / count;
        let pm25_cf1 = queue.iter().map(|s| s.pm25_cf1).sum::<f64>() / count;

        Some((round_to(humidity, 5), round_to(pm25_cf1, 5)))
    }

    pub fn len(&self, station_id: &str) -> usize {
        self.queues.get(station_id).map_or(0, VecDeque::len)
    }

    pub fn samples(&self, station_id: &str) -> Option<&VecDeque<EpaAvgValue>> {
        self.queues.get(station_id)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// EPA correction for PurpleAir PM2.5 CF=1 data under wildfire smoke.
///
/// See <https://www.epa.gov/sites/default/files/2021-05/documents/toolsresourceswebinar_purpleairsmoke_210519b.pdf>
pub fn epa_correction(pm25_cf1_avg: f64, humidity_avg: f64) -> f64 {
    let corrected = if pm25_cf1_avg > EPA_HIGH_CONCENTRATION_THRESHOLD {
        0.46 * pm25_cf1_avg + 3.93e-4 * pm25_cf1_avg * pm25_cf1_avg + 2.97
    } else {
        0.52 * pm25_cf1_avg - 0.086 * humidity_avg + 5.75
    };

    round_to(corrected.max(0.0), 1)
}

pub fn aqi_status(sample_count: usize) -> AqiStatus {
    if sample_count < EPA_CACHE_CAPACITY {
        let missing = (EPA_CACHE_CAPACITY - sample_count) as u32;
        AqiStatus::Calculating {
            minutes_left: missing * SAMPLE_INTERVAL_MINUTES,
        }
    } else {
        AqiStatus::Stable
    }
}

/// Populate the instant and EPA-corrected AQI fields of every reading.
pub fn add_aqi_calculations(
    readings: &mut HashMap<StationId, StationReading>,
    cache: &mut EpaValueCache,
    now: DateTime<Utc>,
) {
    for reading in readings.values_mut() {
        add_station_aqi(reading, cache, now);
    }
}

pub fn add_station_aqi(
    reading: &mut StationReading,
    cache: &mut EpaValueCache,
    now: DateTime<Utc>,
) {
    let confidence = reading.pm2_5_atm.confidence;

    if let Some(pm25) = reading.pm2_5_atm.value {
        reading.pm2_5_aqi_instant = Some(AqiReading {
            value: calculate_aqi(pm25, Pollutant::Pm2_5),
            confidence,
            status: None,
        });
    }

    // Unlike the instant AQI this is smoothed over the last hour of samples.
    let (Some(pm25_cf1), Some(humidity)) = (reading.pm2_5_cf_1.value, reading.humidity.value)
    else {
        return;
    };

    let station_id = reading.station_id.as_str();
    cache.push(
        station_id,
        EpaAvgValue {
            humidity,
            pm25_cf1,
            timestamp: now,
        },
    );

    let expired = cache.evict_expired(station_id, now);
    if expired > 0 {
        info!(
            "PurpleAir station \"{}\" ({}) EPA readings contained {} old entries in cache",
            reading.metadata.label.as_deref().unwrap_or("unknown"),
            station_id,
            expired
        );
    }

    let Some((humidity_avg, pm25_cf1_avg)) = cache.averages(station_id) else {
        return;
    };

    let pm25_corrected = epa_correction(pm25_cf1_avg, humidity_avg);
    let pm25_corrected_aqi = calculate_aqi(pm25_corrected, Pollutant::Pm2_5);

    debug!(
        "({}): EPA correction: (pm25: {}, hum: {}, corrected: {}, aqi: {:?})",
        station_id, pm25_cf1_avg, humidity_avg, pm25_corrected, pm25_corrected_aqi
    );

    reading.pm2_5_aqi_epa = Some(AqiReading {
        value: pm25_corrected_aqi,
        confidence,
        status: Some(aqi_status(cache.len(station_id))),
    });
}
