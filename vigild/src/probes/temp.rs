//! Temperature sensor check.
//!
//! Sensors are lm-sensors style sysfs files reporting millidegrees
//! Celsius. A sensor that cannot be read at startup is marked not in
//! use and skipped from then on. The last three readings are kept, and
//! one warning fires per 90/95/98-percent band as the temperature
//! climbs towards the limit.

use std::fs;

use tracing::{error, info, warn};

use vigil_common::config::Config;
use vigil_common::descriptor::{Descriptor, Payload};
use vigil_common::errcode::{EDONTKNOW, ENOERR, ETOOHOT};

/// Warning bands as a percentage of the configured maximum.
const WARN_BANDS: [i32; 3] = [90, 95, 98];

fn read_sensor(path: &str) -> Result<i32, std::io::Error> {
    let content = fs::read_to_string(path)?;
    content.trim().parse::<i64>().map(|v| (v / 1000) as i32).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "not a millidegree value")
    })
}

/// Verify the sensor answers at all; otherwise mark it unusable.
pub fn open(d: &mut Descriptor) {
    let Payload::Temperature { in_use, .. } = &mut d.payload else {
        return;
    };
    match read_sensor(&d.name) {
        Ok(t) => {
            info!("temperature sensor {} reads {t}C", d.name);
            *in_use = true;
        }
        Err(e) => {
            warn!("cannot read temperature sensor {} ({e}), disabling it", d.name);
            *in_use = false;
        }
    }
}

/// Decide the band (0..=2) a temperature falls into, if any.
fn band(temperature: i32, max: i32) -> Option<usize> {
    WARN_BANDS
        .iter()
        .rposition(|pct| temperature >= max * pct / 100)
}

/// Read one sensor and compare against the configured maximum.
pub fn check(d: &mut Descriptor, cfg: &Config) -> i32 {
    let name = d.name.clone();
    let Payload::Temperature {
        in_use,
        recent,
        have,
        warned,
    } = &mut d.payload
    else {
        return EDONTKNOW;
    };
    if !*in_use {
        return EDONTKNOW;
    }

    let temperature = match read_sensor(&name) {
        Ok(t) => t,
        Err(e) => {
            error!("cannot read temperature sensor {name} ({e})");
            return EDONTKNOW;
        }
    };

    // Keep the last three readings, newest first.
    recent.rotate_right(1);
    recent[0] = temperature;
    *have = (*have + 1).min(3);

    if temperature >= cfg.max_temperature {
        error!(
            "it is too hot inside (temperature = {temperature}C >= {}C, sensor {name})",
            cfg.max_temperature
        );
        return ETOOHOT;
    }

    match band(temperature, cfg.max_temperature) {
        Some(idx) => {
            let bit = 1u8 << idx;
            if *warned & bit == 0 {
                *warned |= bit;
                warn!(
                    "temperature increases above {}% of the maximum ({temperature}C, sensor {name})",
                    WARN_BANDS[idx]
                );
            }
        }
        None => *warned = 0,
    }

    ENOERR
}

// ─── Tests ──────────────────────────────────────────────────────────
