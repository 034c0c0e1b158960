// Atmos - Environmental sensor readings as JSON or Cloud Monitoring metrics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::Reading;
use chrono::{DateTime, SecondsFormat};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of samples buffered before they are written as a batch.
pub const BATCH_SIZE: usize = 20;

/// Each value in a sensor reading, reported as its own metric.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Temperature,
    Pressure,
    Humidity,
    GasResistance,
    GasIndex,
    MeasIndex,
    HeatStable,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Temperature,
        Field::Pressure,
        Field::Humidity,
        Field::GasResistance,
        Field::GasIndex,
        Field::MeasIndex,
        Field::HeatStable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Pressure => "pressure",
            Field::Humidity => "humidity",
            Field::GasResistance => "gas_resistance",
            Field::GasIndex => "gas_index",
            Field::MeasIndex => "meas_index",
            Field::HeatStable => "heat_stable",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Field::Temperature => "air temperature",
            Field::Pressure => "barometric pressure",
            Field::Humidity => "air humidity",
            Field::GasResistance => "indicator of air quality",
            Field::GasIndex => "heater profile used for the gas measurement",
            Field::MeasIndex => "sequence number of the measurement",
            Field::HeatStable => "1 if the gas heater reached a stable temperature",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Reading {
    /// Value of a single field of this reading as a double.
    pub fn value(&self, field: Field) -> f64 {
        match field {
            Field::Temperature => self.temperature,
            Field::Pressure => self.pressure,
            Field::Humidity => self.humidity,
            Field::GasResistance => self.gas_resistance,
            Field::GasIndex => f64::from(self.gas_index),
            Field::MeasIndex => f64::from(self.meas_index),
            Field::HeatStable => {
                if self.heat_stable {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Seconds and nanoseconds since the UNIX epoch.
///
/// Serialized as an RFC 3339 UTC string with nanosecond precision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Split fractional seconds since the epoch into whole seconds and nanoseconds.
    pub fn from_secs_f64(secs: f64) -> Self {
        let seconds = secs.trunc();
        let nanos = ((secs - seconds) * 1_000_000_000.0) as u32;
        Timestamp {
            seconds: seconds as i64,
            nanos: nanos.min(999_999_999),
        }
    }

    pub fn to_rfc3339(&self) -> String {
        DateTime::from_timestamp(self.seconds, self.nanos)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        // Clocks set before the epoch are treated as the epoch
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

/// A value of a field at a point in time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point {
    pub value: f64,
    pub end_time: Timestamp,
}

/// All points of a single field, in the order they were captured.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    pub field: Field,
    pub points: Vec<Point>,
}

/// Readings buffered until there are enough of them to write in one go.
///
/// A batch never holds more than `BATCH_SIZE` readings: the push that fills it
/// drains it and returns its contents, one series per field.
#[derive(Debug, Default)]
pub struct Batch {
    samples: Vec<(Timestamp, Reading)>,
}

impl Batch {
    pub fn new() -> Self {
        Batch {
            samples: Vec::with_capacity(BATCH_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add a reading to the batch, returning the complete batch as one series per
    /// field if this reading filled it.
    pub fn push(&mut self, reading: Reading, at: Timestamp) -> Option<Vec<Series>> {
        self.samples.push((at, reading));
        if self.samples.len() >= BATCH_SIZE {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Points of a single field that are currently buffered.
    pub fn points(&self, field: Field) -> Vec<Point> {
        self.samples
            .iter()
            .map(|(at, reading)| Point {
                value: reading.value(field),
                end_time: *at,
            })
            .collect()
    }

    /// Remove everything buffered, returning one series per field.
    pub fn drain(&mut self) -> Vec<Series> {
        let series = Field::ALL
            .iter()
            .map(|&field| Series {
                field,
                points: self.points(field),
            })
            .collect();

        self.samples.clear();
        series
    }
}

#[cfg(test)]
mod test {
    use super::{Batch, Field, Timestamp, BATCH_SIZE};
    use crate::sensor::Reading;
    use std::time::{Duration, UNIX_EPOCH};

    fn reading(meas_index: u8) -> Reading {
        Reading {
            temperature: 22.5,
            pressure: 1013.2,
            humidity: 45.0,
            gas_resistance: 50000.0,
            gas_index: 0,
            meas_index,
            heat_stable: true,
        }
    }

    #[test]
    fn test_field_names_unique() {
        let mut names: Vec<&str> = Field::ALL.iter().map(|f| f.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(7, names.len());
    }

    #[test]
    fn test_reading_value() {
        let r = reading(3);
        assert_eq!(22.5, r.value(Field::Temperature));
        assert_eq!(50000.0, r.value(Field::GasResistance));
        assert_eq!(3.0, r.value(Field::MeasIndex));
        assert_eq!(1.0, r.value(Field::HeatStable));

        let r = Reading {
            heat_stable: false,
            ..reading(0)
        };
        assert_eq!(0.0, r.value(Field::HeatStable));
    }

    #[test]
    fn test_timestamp_from_secs_f64() {
        let ts = Timestamp::from_secs_f64(1700000000.25);
        assert_eq!(1700000000, ts.seconds);
        assert_eq!(250000000, ts.nanos);
    }

    #[test]
    fn test_timestamp_from_system_time() {
        let ts = Timestamp::from(UNIX_EPOCH + Duration::new(1700000000, 250000000));
        assert_eq!(Timestamp::from_secs_f64(1700000000.25), ts);
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = Timestamp::from_secs_f64(1700000000.25);
        assert_eq!("2023-11-14T22:13:20.250000000Z", ts.to_rfc3339());
        assert_eq!(
            "\"2023-11-14T22:13:20.250000000Z\"",
            serde_json::to_string(&ts).unwrap()
        );
    }

    #[test]
    fn test_batch_accumulates_until_full() {
        let mut batch = Batch::new();
        for i in 0..(BATCH_SIZE - 1) {
            let res = batch.push(reading(i as u8), Timestamp::from_secs_f64(1700000000.0 + i as f64));
            assert!(res.is_none());
        }

        assert_eq!(BATCH_SIZE - 1, batch.len());
        for field in Field::ALL {
            assert_eq!(BATCH_SIZE - 1, batch.points(field).len());
        }
    }

    #[test]
    fn test_batch_flushes_on_twentieth() {
        let mut batch = Batch::new();
        let mut flushed = None;
        for i in 0..BATCH_SIZE {
            flushed = batch.push(reading(i as u8), Timestamp::from_secs_f64(1700000000.0 + i as f64));
        }

        let series = flushed.unwrap();
        assert_eq!(Field::ALL.len(), series.len());
        for s in series.iter() {
            assert_eq!(BATCH_SIZE, s.points.len());
        }

        let meas = series.iter().find(|s| s.field == Field::MeasIndex).unwrap();
        assert_eq!(0.0, meas.points[0].value);
        assert_eq!(19.0, meas.points[19].value);
        assert_eq!(1700000019, meas.points[19].end_time.seconds);

        assert!(batch.is_empty());
        for field in Field::ALL {
            assert!(batch.points(field).is_empty());
        }
    }

    #[test]
    fn test_batch_restarts_after_flush() {
        let mut batch = Batch::new();
        for i in 0..BATCH_SIZE {
            batch.push(reading(i as u8), Timestamp::from_secs_f64(1700000000.0));
        }

        assert!(batch.push(reading(0), Timestamp::from_secs_f64(1700000100.0)).is_none());
        assert_eq!(1, batch.len());
    }
}
