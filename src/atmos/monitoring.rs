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

//! Client for the subset of the Google Cloud Monitoring v3 REST API needed to
//! declare custom metrics and write points to them.

use crate::metrics::{Field, Point, Series, Timestamp};
use futures_util::future;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com";
pub const PROJECT_ENV_VAR: &str = "GOOGLE_CLOUD_PROJECT";
pub const METRIC_DOMAIN: &str = "custom.googleapis.com";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const HOSTNAME_LABEL: &str = "hostname";

/// Error resolving configuration required to talk to Cloud Monitoring.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    MissingProjectId,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingProjectId => write!(
                f,
                "set the environment variable {} (or --project-id) to your Google Cloud project ID",
                PROJECT_ENV_VAR
            ),
        }
    }
}

impl Error for ConfigError {}

/// Google Cloud project that metrics are written to, never blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(raw: Option<String>) -> Result<Self, ConfigError> {
        match raw {
            Some(id) if !id.trim().is_empty() => Ok(ProjectId(id.trim().to_owned())),
            _ => Err(ConfigError::MissingProjectId),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custom metric type for a field, e.g. `custom.googleapis.com/temperature`.
pub fn metric_type(field: Field) -> String {
    format!("{}/{}", METRIC_DOMAIN, field.name())
}

/// Full resource name of the metric descriptor for a field.
pub fn resource_name(project: &ProjectId, field: Field) -> String {
    format!("projects/{}/metricDescriptors/{}", project, metric_type(field))
}

/// Error making requests to Cloud Monitoring or the metadata server.
#[derive(Debug)]
pub enum MonitoringError {
    Transport(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Status(&'static str, StatusCode, String),
}

impl fmt::Display for MonitoringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoringError::Transport(msg, ref e) => write!(f, "{}: {}", msg, e),
            MonitoringError::Status(msg, status, body) => write!(f, "{}: {}: {}", msg, status, body),
        }
    }
}

impl Error for MonitoringError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MonitoringError::Transport(_, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Double,
    String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    pub value_type: ValueType,
}

/// Shape of a custom metric. `name` is assigned by the server on creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<LabelDescriptor>,
}

impl MetricDescriptor {
    /// Double valued gauge for a field, labeled by the host reporting it.
    pub fn gauge(field: Field) -> Self {
        MetricDescriptor {
            name: None,
            metric_type: metric_type(field),
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            description: field.description().to_owned(),
            labels: vec![LabelDescriptor {
                key: HOSTNAME_LABEL.to_owned(),
                value_type: ValueType::String,
            }],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Metric {
    #[serde(rename = "type")]
    metric_type: String,
    labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct MonitoredResource {
    #[serde(rename = "type")]
    resource_type: String,
    labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    end_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct WirePoint {
    interval: TimeInterval,
    value: TypedValue,
}

impl From<&Point> for WirePoint {
    fn from(p: &Point) -> Self {
        WirePoint {
            interval: TimeInterval { end_time: p.end_time },
            value: TypedValue { double_value: p.value },
        }
    }
}

/// Points for one field from one host, in the form accepted by `timeSeries.create`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    metric: Metric,
    resource: MonitoredResource,
    metric_kind: MetricKind,
    value_type: ValueType,
    points: Vec<WirePoint>,
}

impl TimeSeries {
    pub fn new(project: &ProjectId, hostname: &str, series: &Series) -> Self {
        let mut metric_labels = BTreeMap::new();
        metric_labels.insert(HOSTNAME_LABEL.to_owned(), hostname.to_owned());

        let mut resource_labels = BTreeMap::new();
        resource_labels.insert("project_id".to_owned(), project.as_str().to_owned());

        TimeSeries {
            metric: Metric {
                metric_type: metric_type(series.field),
                labels: metric_labels,
            },
            resource: MonitoredResource {
                resource_type: "global".to_owned(),
                labels: resource_labels,
            },
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            points: series.points.iter().map(WirePoint::from).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest<'a> {
    time_series: &'a [TimeSeries],
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Source of OAuth2 bearer tokens for API requests.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A token obtained elsewhere, e.g. `gcloud auth print-access-token`.
    Static(String),
    /// Tokens for the default service account from the GCE metadata server,
    /// cached until shortly before they expire.
    MetadataServer { cached: Option<(String, Instant)> },
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        match token {
            Some(t) if !t.trim().is_empty() => Credentials::Static(t.trim().to_owned()),
            _ => Credentials::MetadataServer { cached: None },
        }
    }

    async fn bearer(&mut self, http: &Client) -> Result<String, MonitoringError> {
        match self {
            Credentials::Static(token) => Ok(token.clone()),
            Credentials::MetadataServer { cached } => {
                if let Some((token, expires)) = cached {
                    if Instant::now() < *expires {
                        return Ok(token.clone());
                    }
                }

                let res = http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| MonitoringError::Transport("unable to request token from metadata server", Box::new(e)))?;

                let res = check_status(res, "metadata server refused token request").await?;
                let token: TokenResponse = res
                    .json()
                    .await
                    .map_err(|e| MonitoringError::Transport("unable to decode metadata server token", Box::new(e)))?;

                let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
                tracing::debug!(message = "fetched access token from metadata server", expires_in = token.expires_in);
                *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
                Ok(token.access_token)
            }
        }
    }
}

async fn check_status(res: reqwest::Response, msg: &'static str) -> Result<reqwest::Response, MonitoringError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    Err(MonitoringError::Status(msg, status, body))
}

/// Creates metric descriptors and writes time series for a single project.
#[derive(Debug)]
pub struct MetricClient {
    http: Client,
    endpoint: String,
    project: ProjectId,
    credentials: Credentials,
}

impl MetricClient {
    pub fn new(endpoint: &str, project: ProjectId, credentials: Credentials) -> Result<Self, MonitoringError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MonitoringError::Transport("unable to build HTTP client", Box::new(e)))?;

        Ok(Self::with_client(http, endpoint, project, credentials))
    }

    /// Use an existing HTTP client, e.g. one with custom proxy or TLS settings.
    pub fn with_client(http: Client, endpoint: &str, project: ProjectId, credentials: Credentials) -> Self {
        MetricClient {
            http,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            project,
            credentials,
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/v3/projects/{}/{}", self.endpoint, self.project, collection)
    }

    pub async fn create_metric_descriptor(
        &mut self,
        descriptor: &MetricDescriptor,
    ) -> Result<MetricDescriptor, MonitoringError> {
        let token = self.credentials.bearer(&self.http).await?;
        let res = self
            .http
            .post(self.url("metricDescriptors"))
            .bearer_auth(token)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| MonitoringError::Transport("unable to create metric descriptor", Box::new(e)))?;

        check_status(res, "metric descriptor rejected")
            .await?
            .json()
            .await
            .map_err(|e| MonitoringError::Transport("unable to decode metric descriptor", Box::new(e)))
    }

    /// Declare a double valued gauge for each field, returning the descriptors
    /// created by the server. Creating a descriptor that already exists is fine.
    pub async fn register_all(&mut self, fields: &[Field]) -> Result<Vec<MetricDescriptor>, MonitoringError> {
        let mut created = Vec::with_capacity(fields.len());

        for &field in fields {
            let descriptor = self.create_metric_descriptor(&MetricDescriptor::gauge(field)).await?;
            let name = descriptor
                .name
                .clone()
                .unwrap_or_else(|| resource_name(&self.project, field));

            tracing::info!(message = "created metric descriptor", field = %field, name = %name);
            created.push(descriptor);
        }

        Ok(created)
    }

    async fn create_time_series(&self, token: &str, series: &TimeSeries) -> Result<(), MonitoringError> {
        let body = CreateTimeSeriesRequest {
            time_series: std::slice::from_ref(series),
        };

        let res = self
            .http
            .post(self.url("timeSeries"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| MonitoringError::Transport("unable to write time series", Box::new(e)))?;

        check_status(res, "time series rejected").await.map(|_| ())
    }

    /// Write each series with its own request, all requests in flight at once.
    /// The first failure is returned.
    pub async fn write_series(&mut self, series: &[TimeSeries]) -> Result<(), MonitoringError> {
        let token = self.credentials.bearer(&self.http).await?;
        let token = token.as_str();
        let this = &*self;

        future::try_join_all(series.iter().map(|s| this.create_time_series(token, s))).await?;
        tracing::debug!(message = "wrote time series", count = series.len());
        Ok(())
    }
}
