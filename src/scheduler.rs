use crate::config::Config;
use crate::error::Result;
use crate::fetcher::{build_request_batches, Fetcher, RequestBatch};
use crate::models::{AqiReading, StationReading};
use crate::pipeline::FusionPipeline;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    config: Config,
    fetcher: Fetcher,
    batches: Vec<RequestBatch>,
    pipeline: FusionPipeline,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<Self> {
        let fetcher = Fetcher::new(&config.source)?;
        let batches = build_request_batches(&config.stations);

        info!(
            "Polling {} station(s) in {} request batch(es)",
            config.stations.len(),
            batches.len()
        );

        Ok(Self {
            config,
            fetcher,
            batches,
            pipeline: FusionPipeline::new(),
            shutdown_rx,
        })
    }

    pub fn pipeline(&self) -> &FusionPipeline {
        &self.pipeline
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);
        let poll_interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.scheduler.initial_delay_seconds, self.config.scheduler.interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        // Run immediately, then on interval
        self.poll().await;

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Fetch one round of records and run them through the fusion pipeline.
    pub async fn poll(&mut self) -> usize {
        debug!("Starting poll");

        let records = self.fetcher.fetch_records(&self.batches).await;
        if records.is_empty() {
            warn!("Poll returned no records");
        }

        // an empty poll still replaces the previous readings
        let readings = self.pipeline.process(&records);

        for station in &self.config.stations {
            match readings.get(&station.id) {
                Some(reading) => log_reading(station.name.as_deref(), reading),
                None => warn!("No data returned for station {}", station.id),
            }
        }

        info!(
            "Poll completed: {} records, {} stations",
            records.len(),
            readings.len()
        );
        readings.len()
    }
}

fn log_reading(name: Option<&str>, reading: &StationReading) {
    let name = name
        .or(reading.metadata.label.as_deref())
        .unwrap_or("unknown");

    info!(
        "Station \"{}\" ({}): pm2.5={} [{}], AQI instant={}, AQI EPA={}",
        name,
        reading.station_id,
        reading
            .pm2_5_atm
            .value
            .map_or_else(|| "n/a".to_string(), |v| format!("{:.1}", v)),
        reading
            .pm2_5_atm
            .confidence
            .map_or("n/a", |c| c.as_str()),
        format_aqi(reading.pm2_5_aqi_instant.as_ref()),
        format_aqi(reading.pm2_5_aqi_epa.as_ref()),
    );

    match serde_json::to_string(reading) {
        Ok(json) => debug!("({}): {}", reading.station_id, json),
        Err(e) => error!("Failed to serialize reading for {}: {}", reading.station_id, e),
    }
}

fn format_aqi(aqi: Option<&AqiReading>) -> String {
    match aqi {
        None => "n/a".to_string(),
        Some(aqi) => {
            let value = aqi
                .value
                .map_or_else(|| "n/a".to_string(), |v| v.to_string());
            match aqi.status {
                Some(status) => format!("{} ({})", value, status),
                None => value,
            }
        }
    }
}
