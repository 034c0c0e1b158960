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

use std::error::Error;
use std::fmt::{self, Formatter};

use rppal::i2c::I2c;
use serde::{Deserialize, Serialize};

/// A single complete measurement from the sensor.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Degrees celsius
    pub temperature: f64,
    /// Barometric pressure in hectopascals
    pub pressure: f64,
    /// Relative humidity (from 0 to 100)
    pub humidity: f64,
    /// Resistance of the gas sensor in ohms, higher means cleaner air
    pub gas_resistance: f64,
    /// Index of the heater profile used for the measurement
    pub gas_index: u8,
    /// Sequence number of the measurement
    pub meas_index: u8,
    /// True if the gas heater reached a stable temperature
    pub heat_stable: bool,
}

/// Potential kinds of errors that can be encountered using the sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Bus,
    ChipId,
    Initialization,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Bus => "bus",
            SensorErrorKind::ChipId => "chip_id",
            SensorErrorKind::Initialization => "initialization",
        }
    }
}

/// Error initializing or reading the sensor via the I2C bus
#[derive(Debug)]
pub enum SensorError {
    ChipId(u8, u8),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::ChipId(_, _) => SensorErrorKind::ChipId,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ChipId(expected, got) => {
                write!(f, "unexpected chip id: expected {:#04x}, got {:#04x}", expected, got)
            }
            SensorError::KindMsg(_, msg) => f.write_str(msg),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Anything that can be polled for new readings.
pub trait Sensor {
    /// Return a new reading if the device has one, `None` if there is no new data
    /// yet, or an error if the device could not be reached.
    fn poll(&mut self) -> Result<Option<Reading>, SensorError>;
}

/// Create a new `I2c` handle for the given bus number, usually `1` on a Raspberry PI.
pub fn open_bus(bus: u8) -> Result<I2c, SensorError> {
    I2c::with_bus(bus).map_err(|e| {
        SensorError::KindMsgCause(SensorErrorKind::Initialization, "unable to open I2C bus", Box::new(e))
    })
}

/// Abstraction around an `rppal::i2c::I2c` to allow for easier testing.
pub trait RegisterBus {
    fn select(&mut self, address: u16) -> Result<(), SensorError>;
    fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError>;
    fn write(&mut self, register: u8, value: u8) -> Result<(), SensorError>;
}

impl RegisterBus for I2c {
    fn select(&mut self, address: u16) -> Result<(), SensorError> {
        self.set_slave_address(address)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to select I2C address", Box::new(e)))
    }

    fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.write_read(&[register], buf)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to read register", Box::new(e)))
    }

    fn write(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        I2c::write(self, &[register, value])
            .map(|_| ())
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Bus, "unable to write register", Box::new(e)))
    }
}
