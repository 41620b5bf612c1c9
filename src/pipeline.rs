use crate::corrections::apply_corrections;
use crate::epa::{add_aqi_calculations, EpaValueCache};
use crate::merge::{merge_metric, MergeContext, WarningTracker};
use crate::models::{Channel, Metric, RawChannelRecord, StationId, StationMetadata, StationReading};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// The channel records of one station for one poll.
#[derive(Debug, Clone, Copy)]
pub struct ChannelGroup<'a> {
    pub a: &'a RawChannelRecord,
    pub b: Option<&'a RawChannelRecord>,
}

/// Group a batch of raw records by station.
///
/// Channel A records establish stations; channel B records attach to the
/// station named by their `ParentID`. Records that cannot be placed are
/// skipped.
pub fn group_by_station(records: &[RawChannelRecord]) -> BTreeMap<StationId, ChannelGroup<'_>> {
    let mut groups: BTreeMap<StationId, ChannelGroup<'_>> = BTreeMap::new();

    for record in records.iter().filter(|r| r.channel() == Channel::A) {
        let Some(station_id) = record.station_id() else {
            debug!("Skipping record without ID or ParentID: {:?}", record);
            continue;
        };

        if groups.contains_key(station_id) {
            debug!("Duplicate channel A record for station {}, keeping first", station_id);
            continue;
        }

        groups.insert(
            station_id.to_string(),
            ChannelGroup {
                a: record,
                b: None,
            },
        );
    }

    for record in records.iter().filter(|r| r.channel() == Channel::B) {
        let Some(station_id) = record.station_id() else {
            continue;
        };

        match groups.get_mut(station_id) {
            Some(group) if group.b.is_none() => group.b = Some(record),
            Some(_) => {
                debug!("Duplicate channel B record for station {}, keeping first", station_id);
            }
            None => {
                debug!(
                    "Skipping channel B record for station {} without a channel A record",
                    station_id
                );
            }
        }
    }

    groups
}

/// Fuses dual-channel station records into per-station readings and keeps the
/// state that has to survive between polls.
#[derive(Debug, Default)]
pub struct FusionPipeline {
    cache: EpaValueCache,
    warnings: WarningTracker,
    latest: HashMap<StationId, StationReading>,
}

impl FusionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, records: &[RawChannelRecord]) -> HashMap<StationId, StationReading> {
        self.process_at(records, Utc::now())
    }

    /// Run one poll cycle with an explicit clock for the rolling EPA window.
    pub fn process_at(
        &mut self,
        records: &[RawChannelRecord],
        now: DateTime<Utc>,
    ) -> HashMap<StationId, StationReading> {
        let groups = group_by_station(records);
        let mut readings = HashMap::with_capacity(groups.len());

        for (station_id, group) in &groups {
            let mut reading = self.fuse_station(station_id, group);
            apply_corrections(&mut reading);
            readings.insert(station_id.clone(), reading);
        }

        add_aqi_calculations(&mut readings, &mut self.cache, now);

        for (station_id, reading) in &readings {
            debug!("({}): results: {:?}", station_id, reading);
        }

        self.latest = readings.clone();
        readings
    }

    fn fuse_station(&mut self, station_id: &str, group: &ChannelGroup<'_>) -> StationReading {
        let metadata = StationMetadata::from_record(group.a);
        let mut reading = StationReading::new(station_id, metadata);

        debug!(
            "({}): processing channels A: {:?}, B: {:?}",
            station_id, group.a, group.b
        );

        let mut ctx = MergeContext {
            station_id,
            label: group.a.label.as_deref(),
            warnings: &mut self.warnings,
        };

        for metric in Metric::ALL {
            let a = group.a.value(metric);
            let b = group.b.map(|record| record.value(metric));
            *reading.metric_mut(metric) = merge_metric(&mut ctx, metric, a, b);
        }

        reading
    }

    /// Latest reading for a station from the most recent poll.
    pub fn latest(&self, station_id: &str) -> Option<&StationReading> {
        self.latest.get(station_id)
    }

    pub fn readings(&self) -> &HashMap<StationId, StationReading> {
        &self.latest
    }

    pub fn cache(&self) -> &EpaValueCache {
        &self.cache
    }

    pub fn reset_cache(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output so tests can count emitted warnings.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn count(&self, needle: &str) -> usize {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf).matches(needle).count()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn record(json: &str) -> RawChannelRecord {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_group_by_station_pairs_channels() {
        let records = vec![
            record(r#"{"ID": 101, "ParentID": 100, "pm2_5_atm": 2.0}"#),
            record(r#"{"ID": 100, "pm2_5_atm": 1.0}"#),
            record(r#"{"ID": 200, "pm2_5_atm": 3.0}"#),
        ];

        let groups = group_by_station(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["100"].a.pm2_5_atm, Some(1.0));
        assert_eq!(groups["100"].b.and_then(|b| b.pm2_5_atm), Some(2.0));
        assert!(groups["200"].b.is_none());
    }

    #[test]
    fn test_group_skips_malformed_and_orphans() {
        let records = vec![
            record(r#"{"pm2_5_atm": 1.0}"#),
            record(r#"{"ID": 301, "ParentID": 300, "pm2_5_atm": 2.0}"#),
            record(r#"{"ID": 100, "pm2_5_atm": 1.0}"#),
        ];

        let groups = group_by_station(&records);
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key("100"));
    }

    #[test]
    fn test_duplicate_records_keep_first() {
        let records = vec![
            record(r#"{"ID": 100, "pm2_5_atm": 1.0}"#),
            record(r#"{"ID": 100, "pm2_5_atm": 9.0}"#),
            record(r#"{"ID": 101, "ParentID": 100, "pm2_5_atm": 2.0}"#),
            record(r#"{"ID": 102, "ParentID": 100, "pm2_5_atm": 8.0}"#),
        ];

        let groups = group_by_station(&records);
        assert_eq!(groups["100"].a.pm2_5_atm, Some(1.0));
        assert_eq!(groups["100"].b.and_then(|b| b.pm2_5_atm), Some(2.0));
    }

    #[test]
    fn test_latest_replaced_each_poll() {
        let mut pipeline = FusionPipeline::new();
        pipeline.process(&[record(r#"{"ID": 100, "pm2_5_atm": 1.0}"#)]);
        assert!(pipeline.latest("100").is_some());

        pipeline.process(&[record(r#"{"ID": 200, "pm2_5_atm": 1.0}"#)]);
        assert!(pipeline.latest("100").is_none());
        assert!(pipeline.latest("200").is_some());
        assert_eq!(pipeline.readings().len(), 1);
    }

    #[test]
    fn test_pipelines_do_not_share_state() {
        let records = vec![record(r#"{"ID": 100, "pm2_5_cf_1": 10.0, "humidity": 40}"#)];

        let mut first = FusionPipeline::new();
        first.process(&records);
        first.process(&records);

        let mut second = FusionPipeline::new();
        second.process(&records);

        assert_eq!(first.cache().len("100"), 2);
        assert_eq!(second.cache().len("100"), 1);
    }

    #[test]
    fn test_degraded_station_warns_once_across_polls() {
        let records = vec![
            record(r#"{"ID": 100, "Label": "Porch", "pm1_0_atm": 5.0, "pm2_5_atm": 10.0}"#),
            record(r#"{"ID": 101, "ParentID": 100, "pm1_0_atm": 5.0, "pm2_5_atm": 2000.0}"#),
        ];

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        let mut pipeline = FusionPipeline::new();
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..5 {
                pipeline.process(&records);
            }
        });

        assert_eq!(logs.count("is sending bad readings"), 1);
        let reading = pipeline.latest("100").unwrap();
        assert_eq!(reading.pm1_0_atm.confidence, Some(Confidence::Good));
        assert_eq!(
            reading.pm2_5_atm.confidence,
            Some(Confidence::SingleBChannelBad)
        );
    }
}
