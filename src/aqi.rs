use std::fmt;
use tracing::debug;

/// One segment of the piecewise-linear concentration to index mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AqiBreakpoint {
    pub pm_low: f64,
    pub pm_high: f64,
    pub aqi_low: u16,
    pub aqi_high: u16,
}

impl AqiBreakpoint {
    const fn new(pm_low: f64, pm_high: f64, aqi_low: u16, aqi_high: u16) -> Self {
        Self {
            pm_low,
            pm_high,
            aqi_low,
            aqi_high,
        }
    }

    pub fn contains(&self, concentration: f64) -> bool {
        self.pm_low <= concentration && concentration <= self.pm_high
    }

    fn interpolate(&self, concentration: f64) -> f64 {
        let aqi_range = f64::from(self.aqi_high - self.aqi_low);
        let pm_range = self.pm_high - self.pm_low;
        (aqi_range / pm_range) * (concentration - self.pm_low) + f64::from(self.aqi_low)
    }
}

/// EPA PM2.5 breakpoints, highest concentration first.
pub const PM2_5_BREAKPOINTS: [AqiBreakpoint; 8] = [
    AqiBreakpoint::new(500.5, 999.9, 501, 999),
    AqiBreakpoint::new(350.5, 500.4, 401, 500),
    AqiBreakpoint::new(250.5, 350.4, 301, 400),
    AqiBreakpoint::new(150.5, 250.4, 201, 300),
    AqiBreakpoint::new(55.5, 150.4, 151, 200),
    AqiBreakpoint::new(35.5, 55.4, 101, 150),
    AqiBreakpoint::new(12.1, 35.4, 51, 100),
    AqiBreakpoint::new(0.0, 12.0, 0, 50),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pollutant {
    Pm2_5,
    Pm10,
}

impl Pollutant {
    /// Breakpoint table for this pollutant, if one is registered.
    pub fn breakpoints(self) -> Option<&'static [AqiBreakpoint]> {
        match self {
            Pollutant::Pm2_5 => Some(&PM2_5_BREAKPOINTS),
            Pollutant::Pm10 => None,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "pm2_5" => Some(Pollutant::Pm2_5),
            "pm10" => Some(Pollutant::Pm10),
            _ => None,
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pollutant::Pm2_5 => f.write_str("pm2_5"),
            Pollutant::Pm10 => f.write_str("pm10"),
        }
    }
}

/// Calculate the air quality index for a concentration.
///
/// Returns an AQI between 0 and 999, or `None` when the pollutant has no
/// breakpoint table or the concentration falls outside every segment.
pub fn calculate_aqi(concentration: f64, pollutant: Pollutant) -> Option<u16> {
    let Some(table) = pollutant.breakpoints() else {
        debug!("AQI requested for unsupported pollutant: {}", pollutant);
        return None;
    };

    let Some(breakpoint) = table.iter().find(|bp| bp.contains(concentration)) else {
        debug!(
            "Value {} did not fall in valid range for pollutant {}",
            concentration, pollutant
        );
        return None;
    };

    Some(breakpoint.interpolate(concentration).round() as u16)
}

/// Same as [`calculate_aqi`] but keyed by the pollutant name used in the feed.
pub fn calculate_aqi_for_key(concentration: f64, key: &str) -> Option<u16> {
    match Pollutant::from_key(key) {
        Some(pollutant) => calculate_aqi(concentration, pollutant),
        None => {
            debug!("AQI requested for unknown pollutant type: {}", key);
            None
        }
    }
}

/// Round to `places` decimals, halves away from zero.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
