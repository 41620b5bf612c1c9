use chrono::{DateTime, Duration, TimeZone, Utc};
use purpleair_fusion::aqi::{calculate_aqi, round_to, Pollutant};
use purpleair_fusion::merge::MAX_PM_READING;
use purpleair_fusion::models::{AqiStatus, Confidence, RawChannelRecord};
use purpleair_fusion::parser::Parser;
use purpleair_fusion::pipeline::FusionPipeline;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 10, 12, 0, 0).unwrap()
}

fn records(json: &str) -> Vec<RawChannelRecord> {
    let (records, _) = Parser::parse_response(json).expect("Parse failed");
    records
}

const TWO_CHANNEL_STATION: &str = r#"{"results": [
    {"ID": 100, "Label": "Backyard", "LastSeen": 1725969600, "LastUpdateCheck": 1725969500,
     "DEVICE_LOCATIONTYPE": "outside", "Version": "7.02", "Type": "PMS5003+PMS5003+BME280",
     "Lat": 37.77, "Lon": -122.42, "RSSI": "-62", "Adc": "0.02", "Uptime": "86400",
     "pm2_5_atm": "30.0", "pm1_0_atm": "10.0", "pm10_0_atm": "40.0", "humidity": "45", "temp_f": "70"},
    {"ID": 101, "ParentID": 100, "Label": "Backyard B",
     "pm2_5_atm": "32.0", "pm1_0_atm": "11.0", "pm10_0_atm": "41.0"}
]}"#;

/// Two channels for one station fused, corrected and scored end to end
#[test]
fn test_end_to_end_two_channel_station() {
    let mut pipeline = FusionPipeline::new();
    let readings = pipeline.process_at(&records(TWO_CHANNEL_STATION), t0());

    assert_eq!(readings.len(), 1);
    let reading = &readings["100"];

    assert_eq!(reading.pm2_5_atm.value, Some(31.0));
    assert_eq!(reading.pm2_5_atm.confidence, Some(Confidence::Good));
    assert_eq!(reading.pm1_0_atm.value, Some(10.5));
    assert_eq!(reading.pm10_0_atm.value, Some(40.5));
    assert_eq!(reading.humidity.value, Some(49.0));
    assert_eq!(reading.humidity.confidence, Some(Confidence::Good));
    assert_eq!(reading.temp_f.value, Some(62.0));
    assert_eq!(reading.pressure.value, None);
    assert_eq!(reading.pressure.confidence, None);

    let instant = reading.pm2_5_aqi_instant.expect("instant AQI missing");
    assert_eq!(instant.value, calculate_aqi(31.0, Pollutant::Pm2_5));
    assert_eq!(instant.value, Some(91));
    assert_eq!(instant.confidence, Some(Confidence::Good));

    // no CF=1 value, so no EPA AQI
    assert!(reading.pm2_5_aqi_epa.is_none());

    assert_eq!(reading.metadata.label.as_deref(), Some("Backyard"));
    assert_eq!(reading.metadata.device_location, "outside");
    assert_eq!(reading.metadata.uptime, 86400);
    assert_eq!(reading.metadata.rssi, -62.0);
    assert_eq!(reading.metadata.latitude, Some(37.77));
    assert_eq!(
        reading.metadata.last_update.map(|t| t.timestamp()),
        Some(1725969500)
    );

    assert_eq!(pipeline.latest("100"), Some(reading));
}

/// Station that only reports channel A
#[test]
fn test_single_channel_station() {
    let mut pipeline = FusionPipeline::new();
    let readings = pipeline.process_at(
        &records(
            r#"{"results": [
                {"ID": 200, "pm2_5_atm": "8.04", "humidity": "30", "pressure": "1013.25"}
            ]}"#,
        ),
        t0(),
    );

    let reading = &readings["200"];
    assert_eq!(reading.pm2_5_atm.value, Some(8.0));
    assert_eq!(reading.pm2_5_atm.confidence, Some(Confidence::Single));
    assert_eq!(reading.humidity.value, Some(34.0));
    assert_eq!(reading.pressure.value, Some(1013.3));
    assert_eq!(reading.pressure.confidence, Some(Confidence::Good));
}

/// A saturated channel is reported through the confidence label
#[test]
fn test_bad_channel_surfaces_as_confidence() {
    let json = format!(
        r#"{{"results": [
            {{"ID": 300, "pm2_5_atm": {}, "pm1_0_atm": {}}},
            {{"ID": 301, "ParentID": 300, "pm2_5_atm": 10.0, "pm1_0_atm": {}}}
        ]}}"#,
        MAX_PM_READING + 1.0,
        MAX_PM_READING + 1.0,
        MAX_PM_READING + 1.0
    );

    let mut pipeline = FusionPipeline::new();
    let readings = pipeline.process_at(&records(&json), t0());
    let reading = &readings["300"];

    assert_eq!(reading.pm2_5_atm.value, Some(10.0));
    assert_eq!(
        reading.pm2_5_atm.confidence,
        Some(Confidence::SingleAChannelBad)
    );
    assert_eq!(reading.pm1_0_atm.value, None);
    assert_eq!(reading.pm1_0_atm.confidence, Some(Confidence::Invalid));

    let instant = reading.pm2_5_aqi_instant.unwrap();
    assert_eq!(instant.confidence, Some(Confidence::SingleAChannelBad));
}

/// Malformed records are skipped without failing the batch
#[test]
fn test_malformed_records_skipped() {
    let json = r#"{"results": [
        {"Label": "no ids", "pm2_5_atm": "5.0"},
        {"ID": 401, "ParentID": 999, "pm2_5_atm": "5.0"},
        {"ID": 400, "pm2_5_atm": "5.0"}
    ]}"#;

    let mut pipeline = FusionPipeline::new();
    let readings = pipeline.process_at(&records(json), t0());

    assert_eq!(readings.len(), 1);
    assert!(readings.contains_key("400"));
}

/// EPA AQI builds up over an hour of polls and then stays stable
#[test]
fn test_epa_aqi_over_successive_polls() {
    let json = r#"{"results": [
        {"ID": 500, "pm2_5_atm": "20", "pm2_5_cf_1": "20", "humidity": "46"},
        {"ID": 501, "ParentID": 500, "pm2_5_atm": "20", "pm2_5_cf_1": "20"}
    ]}"#;
    let batch = records(json);
    let mut pipeline = FusionPipeline::new();

    let first = pipeline.process_at(&batch, t0());
    let epa = first["500"].pm2_5_aqi_epa.unwrap();
    assert_eq!(epa.status, Some(AqiStatus::Calculating { minutes_left: 55 }));

    for i in 1..12 {
        pipeline.process_at(&batch, t0() + Duration::minutes(5 * i));
    }

    let reading = pipeline.latest("500").unwrap();
    let epa = reading.pm2_5_aqi_epa.unwrap();

    // humidity 46 + 4 correction
    let corrected = round_to((0.52 * 20.0 - 0.086 * 50.0 + 5.75f64).max(0.0), 1);
    assert_eq!(epa.value, calculate_aqi(corrected, Pollutant::Pm2_5));
    assert_eq!(epa.status, Some(AqiStatus::Stable));
    assert_eq!(epa.confidence, Some(Confidence::Good));
    assert_eq!(pipeline.cache().len("500"), 12);
}

/// Samples older than an hour drop out of the average
#[test]
fn test_epa_cache_eviction_across_polls() {
    let high = records(r#"{"results": [{"ID": 600, "pm2_5_cf_1": "200", "humidity": "46"}]}"#);
    let low = records(r#"{"results": [{"ID": 600, "pm2_5_cf_1": "20", "humidity": "46"}]}"#);

    let mut pipeline = FusionPipeline::new();
    pipeline.process_at(&high, t0());
    pipeline.process_at(&low, t0() + Duration::seconds(3601));

    assert_eq!(pipeline.cache().len("600"), 1);
    let epa = pipeline.latest("600").unwrap().pm2_5_aqi_epa.unwrap();
    let corrected = round_to(0.52 * 20.0 - 0.086 * 50.0 + 5.75, 1);
    assert_eq!(epa.value, calculate_aqi(corrected, Pollutant::Pm2_5));
}

/// Same batch with a reset cache yields the same readings
#[test]
fn test_idempotent_with_reset_cache() {
    let mut pipeline = FusionPipeline::new();
    let batch = records(
        r#"{"results": [
        {"ID": 700, "pm2_5_atm": "12", "pm2_5_cf_1": "14", "humidity": "40"},
        {"ID": 701, "ParentID": 700, "pm2_5_atm": "13", "pm2_5_cf_1": "15"}
    ]}"#,
    );

    let first = pipeline.process_at(&batch, t0());
    assert_eq!(pipeline.cache().len("700"), 1);

    pipeline.reset_cache();
    assert_eq!(pipeline.cache().len("700"), 0);

    let second = pipeline.process_at(&batch, t0());
    assert_eq!(pipeline.cache().len("700"), 1);
    assert_eq!(first, second);

    for readings in [&first, &second] {
        let epa = readings["700"].pm2_5_aqi_epa.expect("EPA AQI missing");
        assert_eq!(
            epa.status.map(|s| s.to_string()).as_deref(),
            Some("calculating (55 mins left)")
        );
    }

    // without the reset the second sample would count towards the window
    let third = pipeline.process_at(&batch, t0());
    assert_eq!(
        third["700"].pm2_5_aqi_epa.and_then(|e| e.status),
        Some(AqiStatus::Calculating { minutes_left: 50 })
    );
}
