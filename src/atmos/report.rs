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

use crate::metrics::{Batch, Series, Timestamp};
use crate::monitoring::{ConfigError, MetricClient, MonitoringError, ProjectId, TimeSeries};
use crate::sensor::{Reading, Sensor, SensorError};
use clap::ValueEnum;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task;
use tracing::{Instrument, Level};

/// Where readings are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Output {
    /// Print each reading to stdout as a JSON object
    Json,
    /// Write readings to Google Cloud Monitoring in batches
    Monitoring,
}

/// Error that keeps polling from starting.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    Sensor(SensorError),
    Monitoring(MonitoringError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Config(e) => write!(f, "invalid configuration: {}", e),
            StartError::Sensor(e) => write!(f, "unable to initialize sensor: {}", e),
            StartError::Monitoring(e) => write!(f, "unable to set up monitoring: {}", e),
        }
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StartError::Config(e) => Some(e),
            StartError::Sensor(e) => Some(e),
            StartError::Monitoring(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartError {
    fn from(e: ConfigError) -> Self {
        StartError::Config(e)
    }
}

impl From<SensorError> for StartError {
    fn from(e: SensorError) -> Self {
        StartError::Sensor(e)
    }
}

impl From<MonitoringError> for StartError {
    fn from(e: MonitoringError) -> Self {
        StartError::Monitoring(e)
    }
}

/// An opened sensor and, in monitoring mode, a client whose metrics are registered.
#[derive(Debug)]
pub enum Startup<S> {
    Json(S),
    Monitoring(S, MetricClient),
}

/// Resolve the project, connect to Cloud Monitoring, then open the sensor.
///
/// In monitoring mode a missing or blank project ID is returned as an error before
/// `connect` or `open_sensor` are called. In JSON mode only the sensor is opened.
pub async fn start<S, O, C, F>(
    output: Output,
    project_id: Option<String>,
    open_sensor: O,
    connect: C,
) -> Result<Startup<S>, StartError>
where
    O: FnOnce() -> Result<S, SensorError>,
    C: FnOnce(ProjectId) -> F,
    F: Future<Output = Result<MetricClient, MonitoringError>>,
{
    match output {
        Output::Json => Ok(Startup::Json(open_sensor()?)),
        Output::Monitoring => {
            let project = ProjectId::new(project_id)?;
            let client = connect(project).await?;
            let sensor = open_sensor()?;
            Ok(Startup::Monitoring(sensor, client))
        }
    }
}

/// Set `shutdown` when the first signal arrives, then wait for another.
///
/// Returns `true` if a second signal arrives, meaning the process should exit
/// without waiting for polling to stop, or `false` if the signals end first.
pub async fn forward_signals<T>(mut signals: T, shutdown: watch::Sender<bool>) -> bool
where
    T: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }

    tracing::info!(message = "received shutdown signal");
    let _ = shutdown.send(true);
    signals.next().await.is_some()
}

/// Error delivering a reading to its destination.
#[derive(Debug)]
pub enum ReportError {
    Io(io::Error),
    Encoding(serde_json::Error),
    Monitoring(MonitoringError),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::Io(e) => write!(f, "unable to write reading: {}", e),
            ReportError::Encoding(e) => write!(f, "unable to encode reading: {}", e),
            ReportError::Monitoring(e) => write!(f, "unable to report to monitoring: {}", e),
        }
    }
}

impl Error for ReportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReportError::Io(e) => Some(e),
            ReportError::Encoding(e) => Some(e),
            ReportError::Monitoring(e) => Some(e),
        }
    }
}

impl From<io::Error> for ReportError {
    fn from(e: io::Error) -> Self {
        ReportError::Io(e)
    }
}

impl From<serde_json::Error> for ReportError {
    fn from(e: serde_json::Error) -> Self {
        ReportError::Encoding(e)
    }
}

impl From<MonitoringError> for ReportError {
    fn from(e: MonitoringError) -> Self {
        ReportError::Monitoring(e)
    }
}

/// Destination for sensor readings.
#[allow(async_fn_in_trait)]
pub trait Reporter {
    /// Handle a single reading taken at the given time.
    async fn report(&mut self, reading: &Reading, at: Timestamp) -> Result<(), ReportError>;

    /// Called once when polling stops.
    async fn finish(&mut self) -> Result<(), ReportError>;
}

#[derive(Serialize)]
struct JsonLine<'a> {
    #[serde(flatten)]
    reading: &'a Reading,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
}

/// Writes each reading as a single line JSON object, optionally including the
/// name of the host.
pub struct JsonReporter<W: Write> {
    out: W,
    hostname: Option<String>,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W, hostname: Option<String>) -> Self {
        JsonReporter { out, hostname }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    async fn report(&mut self, reading: &Reading, _at: Timestamp) -> Result<(), ReportError> {
        let line = JsonLine {
            reading,
            hostname: self.hostname.as_deref(),
        };

        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ReportError> {
        Ok(self.out.flush()?)
    }
}

/// Buffers readings and writes them to Cloud Monitoring as one time series per
/// field every time the batch fills.
pub struct CloudReporter {
    client: MetricClient,
    hostname: String,
    batch: Batch,
    flush_on_exit: bool,
}

impl CloudReporter {
    pub fn new(client: MetricClient, hostname: String, flush_on_exit: bool) -> Self {
        CloudReporter {
            client,
            hostname,
            batch: Batch::new(),
            flush_on_exit,
        }
    }

    async fn write(&mut self, series: Vec<Series>) -> Result<(), ReportError> {
        let project = self.client.project().clone();
        let time_series: Vec<TimeSeries> = series
            .iter()
            .map(|s| TimeSeries::new(&project, &self.hostname, s))
            .collect();

        self.client
            .write_series(&time_series)
            .instrument(tracing::span!(Level::DEBUG, "write_series"))
            .await?;

        tracing::info!(message = "flushed batch to monitoring", series = time_series.len());
        Ok(())
    }
}

impl Reporter for CloudReporter {
    async fn report(&mut self, reading: &Reading, at: Timestamp) -> Result<(), ReportError> {
        match self.batch.push(*reading, at) {
            Some(series) => self.write(series).await,
            None => Ok(()),
        }
    }

    async fn finish(&mut self) -> Result<(), ReportError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        if self.flush_on_exit {
            let series = self.batch.drain();
            self.write(series).await
        } else {
            tracing::warn!(message = "discarding partial batch", samples = self.batch.len());
            self.batch.drain();
            Ok(())
        }
    }
}

/// Error that stops the poll loop.
#[derive(Debug)]
pub enum RunError {
    Sensor(SensorError),
    Report(ReportError),
    Runtime(task::JoinError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Sensor(e) => write!(f, "unable to read sensor: {}", e),
            RunError::Report(e) => write!(f, "{}", e),
            RunError::Runtime(e) => write!(f, "sensor read task failed: {}", e),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunError::Sensor(e) => Some(e),
            RunError::Report(e) => Some(e),
            RunError::Runtime(e) => Some(e),
        }
    }
}

impl From<SensorError> for RunError {
    fn from(e: SensorError) -> Self {
        RunError::Sensor(e)
    }
}

impl From<ReportError> for RunError {
    fn from(e: ReportError) -> Self {
        RunError::Report(e)
    }
}

/// Poll the sensor every `interval` and hand each new reading to the reporter
/// until `shutdown` becomes `true`.
///
/// Shutdown is only checked between iterations: a read or write that is in
/// progress completes first. Any sensor or reporter error ends the loop.
pub async fn run<S, R>(
    sensor: S,
    reporter: &mut R,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RunError>
where
    S: Sensor + Send + 'static,
    R: Reporter,
{
    let mut sensor = sensor;

    while !*shutdown.borrow() {
        // The sensor is moved to the blocking pool for the read and handed back
        // so that the loop remains its only owner.
        let (returned, res) = task::spawn_blocking(move || {
            let mut s = sensor;
            let res = s.poll();
            (s, res)
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .map_err(RunError::Runtime)?;
        sensor = returned;

        match res? {
            Some(reading) => reporter.report(&reading, Timestamp::now()).await?,
            None => tracing::debug!(message = "no new data from sensor"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            Ok(_) = shutdown.changed() => {}
        }
    }

    tracing::info!(message = "stopping sensor polling");
    reporter.finish().await?;
    Ok(())
}
