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

use atmos::metrics::{Field, Timestamp, BATCH_SIZE};
use atmos::monitoring::{Credentials, MetricClient, MonitoringError, ProjectId};
use atmos::report::{CloudReporter, ReportError, Reporter};
use atmos::sensor::Reading;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

const PROJECT: &str = "test-project";
const TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    authorization: Option<String>,
    body: Value,
}

/// Fake Cloud Monitoring backend that records every request and replies with the
/// given status. Descriptors are echoed back with a server assigned name.
async fn fake_backend(status: StatusCode) -> (String, Arc<Mutex<Vec<Recorded>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = requests.clone();

    let make_svc = make_service_fn(move |_| {
        let state = state.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();

                async move {
                    let path = req.uri().path().to_owned();
                    let authorization = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_owned());
                    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

                    let reply = if path.ends_with("/metricDescriptors") {
                        let mut descriptor = body.clone();
                        let name = format!(
                            "{}/{}",
                            path.trim_start_matches("/v3/"),
                            body["type"].as_str().unwrap_or_default()
                        );
                        descriptor["name"] = json!(name);
                        descriptor
                    } else {
                        json!({})
                    };

                    state.lock().unwrap().push(Recorded {
                        path,
                        authorization,
                        body,
                    });

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .header(CONTENT_TYPE, "application/json")
                            .body(Body::from(reply.to_string()))
                            .unwrap(),
                    )
                }
            }))
        }
    });

    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    (format!("http://{}", addr), requests)
}

fn client(endpoint: &str) -> MetricClient {
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    MetricClient::with_client(
        http,
        endpoint,
        ProjectId::new(Some(PROJECT.to_owned())).unwrap(),
        Credentials::new(Some(TOKEN.to_owned())),
    )
}

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

fn time_series_requests(requests: &Arc<Mutex<Vec<Recorded>>>) -> Vec<Recorded> {
    requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.path == "/v3/projects/test-project/timeSeries")
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_register_all_creates_one_descriptor_per_field() {
    let (endpoint, requests) = fake_backend(StatusCode::OK).await;
    let mut client = client(&endpoint);

    let created = client.register_all(&Field::ALL).await.unwrap();

    assert_eq!(Field::ALL.len(), created.len());
    assert_eq!(
        Some("projects/test-project/metricDescriptors/custom.googleapis.com/temperature"),
        created[0].name.as_deref()
    );

    let requests = requests.lock().unwrap();
    assert_eq!(Field::ALL.len(), requests.len());

    for (req, field) in requests.iter().zip(Field::ALL) {
        assert_eq!("/v3/projects/test-project/metricDescriptors", req.path);
        assert_eq!(Some("Bearer test-token"), req.authorization.as_deref());
        assert_eq!(format!("custom.googleapis.com/{}", field.name()), req.body["type"]);
        assert_eq!("GAUGE", req.body["metricKind"]);
        assert_eq!("DOUBLE", req.body["valueType"]);
    }
}

#[tokio::test]
async fn test_register_all_rejected() {
    let (endpoint, _requests) = fake_backend(StatusCode::FORBIDDEN).await;
    let mut client = client(&endpoint);

    match client.register_all(&Field::ALL).await.unwrap_err() {
        MonitoringError::Status(_, status, _) => assert_eq!(StatusCode::FORBIDDEN.as_u16(), status.as_u16()),
        e => panic!("unexpected error: {}", e),
    }
}

#[tokio::test]
async fn test_reporter_writes_full_batch() {
    let (endpoint, requests) = fake_backend(StatusCode::OK).await;
    let mut reporter = CloudReporter::new(client(&endpoint), "pi".to_owned(), false);

    for i in 0..(BATCH_SIZE - 1) {
        let at = Timestamp::from_secs_f64(1700000000.25 + i as f64);
        reporter.report(&reading(i as u8), at).await.unwrap();
    }
    assert!(time_series_requests(&requests).is_empty());

    let at = Timestamp::from_secs_f64(1700000000.25 + (BATCH_SIZE - 1) as f64);
    reporter.report(&reading((BATCH_SIZE - 1) as u8), at).await.unwrap();

    let written = time_series_requests(&requests);
    assert_eq!(Field::ALL.len(), written.len());

    for req in written.iter() {
        let series = &req.body["timeSeries"];
        assert_eq!(1, series.as_array().unwrap().len());
        assert_eq!("pi", series[0]["metric"]["labels"]["hostname"]);
        assert_eq!("global", series[0]["resource"]["type"]);
        assert_eq!(PROJECT, series[0]["resource"]["labels"]["project_id"]);

        let points = series[0]["points"].as_array().unwrap();
        assert_eq!(BATCH_SIZE, points.len());
        assert_eq!("2023-11-14T22:13:20.250000000Z", points[0]["interval"]["endTime"]);
    }

    let meas = written
        .iter()
        .find(|r| r.body["timeSeries"][0]["metric"]["type"] == "custom.googleapis.com/meas_index")
        .unwrap();
    assert_eq!(json!(19.0), meas.body["timeSeries"][0]["points"][19]["value"]["doubleValue"]);
}

#[tokio::test]
async fn test_reporter_discards_partial_batch() {
    let (endpoint, requests) = fake_backend(StatusCode::OK).await;
    let mut reporter = CloudReporter::new(client(&endpoint), "pi".to_owned(), false);

    for i in 0..3 {
        reporter.report(&reading(i), Timestamp::now()).await.unwrap();
    }
    reporter.finish().await.unwrap();

    assert!(time_series_requests(&requests).is_empty());
}

#[tokio::test]
async fn test_reporter_flushes_partial_batch_on_exit() {
    let (endpoint, requests) = fake_backend(StatusCode::OK).await;
    let mut reporter = CloudReporter::new(client(&endpoint), "pi".to_owned(), true);

    for i in 0..3 {
        reporter.report(&reading(i), Timestamp::now()).await.unwrap();
    }
    reporter.finish().await.unwrap();

    let written = time_series_requests(&requests);
    assert_eq!(Field::ALL.len(), written.len());
    for req in written.iter() {
        assert_eq!(3, req.body["timeSeries"][0]["points"].as_array().unwrap().len());
    }
}

#[tokio::test]
async fn test_reporter_write_rejected() {
    let (endpoint, _requests) = fake_backend(StatusCode::TOO_MANY_REQUESTS).await;
    let mut reporter = CloudReporter::new(client(&endpoint), "pi".to_owned(), false);

    let mut res = Ok(());
    for i in 0..BATCH_SIZE {
        res = reporter.report(&reading(i as u8), Timestamp::now()).await;
    }

    assert!(matches!(res, Err(ReportError::Monitoring(MonitoringError::Status(..)))));
}
