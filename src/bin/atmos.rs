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

use atmos::metrics::Field;
use atmos::monitoring::{Credentials, MetricClient, MonitoringError, DEFAULT_ENDPOINT};
use atmos::report::{self, CloudReporter, JsonReporter, Output, RunError, StartError, Startup};
use atmos::sensor::{open_bus, Bme680Sensor, SensorError};
use clap::Parser;
use futures_util::stream::{self, Stream};
use std::time::Duration;
use std::{io, process};
use sysinfo::System;
use tokio::signal::unix::{self, Signal, SignalKind};
use tokio::sync::watch;
use tracing::Level;

const DEFAULT_INTERVAL_SECS: u64 = 1;
const DEFAULT_I2C_BUS: u8 = 1;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// Report temperature, pressure, humidity, and air quality from a BME680 sensor
///
/// Read a BME680 sensor connected to the I2C bus of a local machine, usually a
/// Raspberry PI, once a second. Readings are either printed as JSON lines or
/// written to Google Cloud Monitoring as custom metrics in batches of 20.
///
/// Writing to Google Cloud Monitoring requires a project ID. An access token
/// is fetched from the metadata server unless one is provided.
#[derive(Debug, Parser)]
#[command(name = "atmos", version = clap::crate_version!())]
struct AtmosApplication {
    /// Where to report readings
    #[arg(long, value_enum, default_value_t = Output::Json)]
    output: Output,

    /// I2C bus number the sensor is connected to
    #[arg(long, default_value_t = DEFAULT_I2C_BUS)]
    i2c_bus: u8,

    /// Read the sensor at this interval, in seconds
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Include the hostname in each JSON line
    #[arg(long)]
    include_hostname: bool,

    /// Google Cloud project to write metrics to
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project_id: Option<String>,

    /// OAuth2 access token for Cloud Monitoring. If not set, a token for the default
    /// service account is fetched from the metadata server
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Cloud Monitoring API endpoint
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Write readings still buffered when stopped instead of discarding them
    #[arg(long)]
    flush_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = AtmosApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .with_writer(io::stderr)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_owned());
    let interval = Duration::from_secs(opts.interval_secs);
    let (tx, rx) = watch::channel(false);

    // Stop polling on the first SIGTERM or SIGINT, exit right away on the second
    let signals = stream::select(
        signal_stream(unix::signal(SignalKind::terminate())?),
        signal_stream(unix::signal(SignalKind::interrupt())?),
    );

    tokio::spawn(async move {
        if report::forward_signals(Box::pin(signals), tx).await {
            tracing::warn!(message = "received second shutdown signal, exiting");
            process::exit(1);
        }
    });

    let endpoint = opts.endpoint.clone();
    let access_token = opts.access_token.clone();
    let bus = opts.i2c_bus;

    let startup = report::start(
        opts.output,
        opts.project_id.clone(),
        || open_sensor(bus),
        |project| async move {
            let mut client = MetricClient::new(&endpoint, project, Credentials::new(access_token))?;
            client.register_all(&Field::ALL).await?;
            Ok::<_, MonitoringError>(client)
        },
    )
    .await
    .unwrap_or_else(|e| {
        log_start_error(&e, bus);
        process::exit(1)
    });

    let res = match startup {
        Startup::Json(sensor) => {
            let host = if opts.include_hostname { Some(hostname) } else { None };
            let mut reporter = JsonReporter::new(io::stdout(), host);
            report::run(sensor, &mut reporter, interval, rx).await
        }
        Startup::Monitoring(sensor, client) => {
            let mut reporter = CloudReporter::new(client, hostname, opts.flush_on_exit);
            report::run(sensor, &mut reporter, interval, rx).await
        }
    };

    match res {
        Err(RunError::Sensor(e)) => {
            tracing::error!(message = "stopped polling sensor", kind = e.kind().as_label(), error = %e);
            process::exit(1);
        }
        Err(e) => {
            tracing::error!(message = "stopped polling sensor", error = %e);
            process::exit(1);
        }
        Ok(()) => {}
    }

    tracing::info!("shutdown");
    Ok(())
}

/// Open the I2C bus and the sensor on it, applying the measurement settings.
fn open_sensor(bus: u8) -> Result<Bme680Sensor, SensorError> {
    let mut sensor = open_bus(bus).and_then(Bme680Sensor::open)?;
    sensor.configure()?;

    tracing::info!(message = "sensor ready", i2c_bus = bus, address = sensor.address());
    Ok(sensor)
}

fn log_start_error(e: &StartError, bus: u8) {
    match e {
        StartError::Config(e) => tracing::error!(message = "missing project id", error = %e),
        StartError::Sensor(e) => tracing::error!(
            message = "failed to initialize sensor",
            i2c_bus = bus,
            kind = e.kind().as_label(),
            error = %e,
        ),
        StartError::Monitoring(e) => tracing::error!(message = "failed to create metric descriptors", error = %e),
    }
}

/// Yield once for each time the given signal is received by this process
fn signal_stream(signal: Signal) -> impl Stream<Item = ()> {
    stream::unfold(signal, |mut signal| async move { signal.recv().await.map(|_| ((), signal)) })
}
