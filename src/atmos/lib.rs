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

//! Report BME680 environmental sensor readings as JSON lines or Google Cloud Monitoring metrics.
//!
//! ## Features
//!
//! Atmos reads temperature, pressure, humidity, and gas resistance from a
//! [BME680 sensor](https://www.bosch-sensortec.com/products/environmental-sensors/gas-sensors/bme680/)
//! connected via I2C, once a second. It is best run on a Raspberry PI (3 or 4). Readings
//! can be reported in two ways:
//!
//! * `--output json`: each reading is printed to stdout as a single line JSON object.
//! * `--output monitoring`: each reading is buffered and written to Google Cloud Monitoring
//!   as custom metrics every 20 readings.
//!
//! The following fields are reported. In `monitoring` mode each is a `GAUGE` metric of type
//! `custom.googleapis.com/<field>` with a `hostname` label.
//!
//! * `temperature` - Degrees celsius measured by the sensor.
//! * `pressure` - Barometric pressure in hectopascals.
//! * `humidity` - Relative humidity (from 0 to 100).
//! * `gas_resistance` - Resistance of the gas sensor in ohms, higher indicates cleaner air.
//! * `gas_index` - Heater profile used for the gas measurement.
//! * `meas_index` - Sequence number of the measurement.
//! * `heat_stable` - `1` if the gas heater reached a stable temperature.
//!
//! ## Build
//!
//! `atmos` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/)
//! . Since it's meant to be run on a Raspberry PI, you will also likely need to cross-compile it.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! The sensor must be connected to the I2C bus of your Raspberry PI and I2C must be enabled
//! (`raspi-config`). Atmos looks for the sensor at address `0x76` and falls back to `0x77`.
//!
//! ```text
//! atmos --output json
//! ```
//!
//! To write metrics to Google Cloud Monitoring, set the project to write them to. Outside of
//! Google Cloud an access token must be provided, inside Google Cloud the token of the default
//! service account is used.
//!
//! ```text
//! export GOOGLE_CLOUD_PROJECT=my-project
//! export GOOGLE_OAUTH_ACCESS_TOKEN=$(gcloud auth print-access-token)
//! atmos --output monitoring
//! ```
//!
//! **NOTE**: Readings that haven't been written when atmos is stopped are discarded unless
//! `--flush-on-exit` is given.
//!

pub mod metrics;
pub mod monitoring;
pub mod report;
pub mod sensor;
