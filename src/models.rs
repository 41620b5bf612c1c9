use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Upstream station identifier, stable across polls.
pub type StationId = String;

/// Metrics tracked per station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    Pm1_0Atm,
    Pm2_5Atm,
    Pm10_0Atm,
    Pm2_5Cf1,
    Humidity,
    TempF,
    Pressure,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Pm1_0Atm,
        Metric::Pm2_5Atm,
        Metric::Pm10_0Atm,
        Metric::Pm2_5Cf1,
        Metric::Humidity,
        Metric::TempF,
        Metric::Pressure,
    ];

    /// Field name used by the upstream JSON records.
    pub fn key(self) -> &'static str {
        match self {
            Metric::Pm1_0Atm => "pm1_0_atm",
            Metric::Pm2_5Atm => "pm2_5_atm",
            Metric::Pm10_0Atm => "pm10_0_atm",
            Metric::Pm2_5Cf1 => "pm2_5_cf_1",
            Metric::Humidity => "humidity",
            Metric::TempF => "temp_f",
            Metric::Pressure => "pressure",
        }
    }

    /// Particulate metrics are measured by both laser counters; the rest only
    /// come from the channel A board.
    pub fn is_particulate(self) -> bool {
        matches!(
            self,
            Metric::Pm1_0Atm | Metric::Pm2_5Atm | Metric::Pm10_0Atm | Metric::Pm2_5Cf1
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => f.write_str("A"),
            Channel::B => f.write_str("B"),
        }
    }
}

/// How trustworthy a fused value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Confidence {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "questionable")]
    Questionable,
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "single - a channel bad")]
    SingleAChannelBad,
    #[serde(rename = "single - b channel bad")]
    SingleBChannelBad,
    #[serde(rename = "invalid")]
    Invalid,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Good => "good",
            Confidence::Questionable => "questionable",
            Confidence::Single => "single",
            Confidence::SingleAChannelBad => "single - a channel bad",
            Confidence::SingleBChannelBad => "single - b channel bad",
            Confidence::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fused metric value. `confidence` is `None` when no channel reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FusedValue {
    pub value: Option<f64>,
    pub confidence: Option<Confidence>,
}

impl FusedValue {
    pub fn new(value: Option<f64>, confidence: Confidence) -> Self {
        Self {
            value,
            confidence: Some(confidence),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

/// Readiness of the rolling EPA-corrected AQI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AqiStatus {
    Calculating { minutes_left: u32 },
    Stable,
}

impl fmt::Display for AqiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AqiStatus::Calculating { minutes_left } => {
                write!(f, "calculating ({} mins left)", minutes_left)
            }
            AqiStatus::Stable => f.write_str("stable"),
        }
    }
}

impl Serialize for AqiStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AqiReading {
    pub value: Option<u16>,
    pub confidence: Option<Confidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AqiStatus>,
}

/// One row from the upstream JSON feed. A record without `ParentID` is the
/// primary (A) channel of a station, a record with it is the secondary (B)
/// channel of the station named by `ParentID`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChannelRecord {
    #[serde(rename = "ID", default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(rename = "ParentID", default, deserialize_with = "deserialize_opt_id")]
    pub parent_id: Option<String>,
    #[serde(rename = "Label", default)]
    pub label: Option<String>,
    #[serde(rename = "LastSeen", default, deserialize_with = "deserialize_opt_timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(
        rename = "LastUpdateCheck",
        default,
        deserialize_with = "deserialize_opt_timestamp"
    )]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(rename = "DEVICE_LOCATIONTYPE", default)]
    pub device_location: Option<String>,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
    #[serde(rename = "Type", default)]
    pub sensor_type: Option<String>,
    #[serde(rename = "Lat", default, deserialize_with = "deserialize_opt_f64")]
    pub latitude: Option<f64>,
    #[serde(rename = "Lon", default, deserialize_with = "deserialize_opt_f64")]
    pub longitude: Option<f64>,
    #[serde(rename = "RSSI", default, deserialize_with = "deserialize_opt_f64")]
    pub rssi: Option<f64>,
    #[serde(rename = "Adc", default, deserialize_with = "deserialize_opt_f64")]
    pub adc: Option<f64>,
    #[serde(rename = "Uptime", default, deserialize_with = "deserialize_opt_f64")]
    pub uptime: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub pm1_0_atm: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub pm2_5_atm: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub pm10_0_atm: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub pm2_5_cf_1: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub humidity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub temp_f: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub pressure: Option<f64>,
}

impl RawChannelRecord {
    pub fn channel(&self) -> Channel {
        if self.parent_id.is_some() {
            Channel::B
        } else {
            Channel::A
        }
    }

    /// Station this record belongs to, `None` for malformed records.
    pub fn station_id(&self) -> Option<&str> {
        match self.channel() {
            Channel::A => self.id.as_deref(),
            Channel::B => self.parent_id.as_deref(),
        }
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Pm1_0Atm => self.pm1_0_atm,
            Metric::Pm2_5Atm => self.pm2_5_atm,
            Metric::Pm10_0Atm => self.pm10_0_atm,
            Metric::Pm2_5Cf1 => self.pm2_5_cf_1,
            Metric::Humidity => self.humidity,
            Metric::TempF => self.temp_f,
            Metric::Pressure => self.pressure,
        }
    }
}

/// Station metadata carried through from the channel A record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationMetadata {
    pub label: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub device_location: String,
    pub version: String,
    pub sensor_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rssi: f64,
    pub adc: f64,
    pub uptime: u64,
}

impl StationMetadata {
    pub fn from_record(record: &RawChannelRecord) -> Self {
        let or_unknown = |s: &Option<String>| s.clone().unwrap_or_else(|| "unknown".to_string());

        Self {
            label: record.label.clone(),
            last_seen: record.last_seen,
            last_update: record.last_update,
            device_location: or_unknown(&record.device_location),
            version: or_unknown(&record.version),
            sensor_type: or_unknown(&record.sensor_type),
            // 0,0 is what the feed reports for stations without a location
            latitude: record.latitude.filter(|v| *v != 0.0),
            longitude: record.longitude.filter(|v| *v != 0.0),
            rssi: record.rssi.unwrap_or(0.0),
            adc: record.adc.unwrap_or(0.0),
            uptime: record
                .uptime
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64)
                .unwrap_or(0),
        }
    }
}

/// Fused output for one station for one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationReading {
    pub station_id: StationId,
    pub metadata: StationMetadata,

    pub pm1_0_atm: FusedValue,
    pub pm2_5_atm: FusedValue,
    pub pm10_0_atm: FusedValue,
    pub pm2_5_cf_1: FusedValue,
    pub humidity: FusedValue,
    pub temp_f: FusedValue,
    pub pressure: FusedValue,

    pub pm2_5_aqi_instant: Option<AqiReading>,
    pub pm2_5_aqi_epa: Option<AqiReading>,
}

impl StationReading {
    pub fn new(station_id: impl Into<StationId>, metadata: StationMetadata) -> Self {
        Self {
            station_id: station_id.into(),
            metadata,
            pm1_0_atm: FusedValue::absent(),
            pm2_5_atm: FusedValue::absent(),
            pm10_0_atm: FusedValue::absent(),
            pm2_5_cf_1: FusedValue::absent(),
            humidity: FusedValue::absent(),
            temp_f: FusedValue::absent(),
            pressure: FusedValue::absent(),
            pm2_5_aqi_instant: None,
            pm2_5_aqi_epa: None,
        }
    }

    pub fn metric(&self, metric: Metric) -> &FusedValue {
        match metric {
            Metric::Pm1_0Atm => &self.pm1_0_atm,
            Metric::Pm2_5Atm => &self.pm2_5_atm,
            Metric::Pm10_0Atm => &self.pm10_0_atm,
            Metric::Pm2_5Cf1 => &self.pm2_5_cf_1,
            Metric::Humidity => &self.humidity,
            Metric::TempF => &self.temp_f,
            Metric::Pressure => &self.pressure,
        }
    }

    pub fn metric_mut(&mut self, metric: Metric) -> &mut FusedValue {
        match metric {
            Metric::Pm1_0Atm => &mut self.pm1_0_atm,
            Metric::Pm2_5Atm => &mut self.pm2_5_atm,
            Metric::Pm10_0Atm => &mut self.pm10_0_atm,
            Metric::Pm2_5Cf1 => &mut self.pm2_5_cf_1,
            Metric::Humidity => &mut self.humidity,
            Metric::TempF => &mut self.temp_f,
            Metric::Pressure => &mut self.pressure,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexValue {
    Number(f64),
    Text(String),
}

/// Custom deserializer for numeric fields
///
/// Accepts:
/// - `"pm2_5_atm": 12.3` (number)
/// - `"pm2_5_atm": "12.3"` (numeric string)
/// - `null`, `""` (absent)
fn deserialize_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<FlexValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(FlexValue::Number(n)) => Ok(Some(n)),
        Some(FlexValue::Text(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s)))
        }
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdValue {
        Int(i64),
        Text(String),
    }

    Ok(match Option::<IdValue>::deserialize(deserializer)? {
        None => None,
        Some(IdValue::Int(n)) => Some(n.to_string()),
        Some(IdValue::Text(s)) if s.trim().is_empty() => None,
        Some(IdValue::Text(s)) => Some(s.trim().to_string()),
    })
}

fn deserialize_opt_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match deserialize_opt_f64(deserializer)? {
        None => Ok(None),
        Some(secs) => DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("Timestamp out of range: {}", secs))),
    }
}
