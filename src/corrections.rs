use crate::models::StationReading;
use tracing::debug;

/// Housing-induced bias of the temperature sensor (°F above ambient).
pub const TEMPERATURE_BIAS_F: f64 = 8.0;

/// Housing-induced bias of the humidity sensor (% below ambient).
pub const HUMIDITY_BIAS_PCT: f64 = 4.0;

/// Apply the fixed manufacturer corrections to temperature and humidity.
///
/// The sensors sit inside the station housing, which on average reads 8°F
/// warmer and 4% drier than ambient air. Absent values are left untouched.
pub fn apply_corrections(reading: &mut StationReading) {
    if let Some(temperature) = reading.temp_f.value {
        let corrected = temperature - TEMPERATURE_BIAS_F;
        reading.temp_f.value = Some(corrected);
        debug!(
            "({}): applied temperature correction from {} to {}",
            reading.station_id, temperature, corrected
        );
    }

    if let Some(humidity) = reading.humidity.value {
        let corrected = humidity + HUMIDITY_BIAS_PCT;
        reading.humidity.value = Some(corrected);
        debug!(
            "({}): applied humidity correction from {} to {}",
            reading.station_id, humidity, corrected
        );
    }
}
