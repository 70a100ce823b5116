//! Diagnostic HTTP API: `GET /api/info` and `POST /api/test`.
//!
//! Request parsing and response payloads are plain functions so they can be
//! tested on the host; the ESP-IDF server wiring is in [`server`].

use core::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::config::{AppConfig, APP_NAME, APP_VERSION};

pub const TEST_NUMBER_KEY: &str = "test_number";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoPayload {
    pub app_name: String,
    pub app_version: String,
    pub device_name: String,
    pub firmware_version: String,
    pub library_version: String,
    pub chip_id: String,
    pub sdk_version: String,
}

impl InfoPayload {
    /// Chip id and SDK version come from the platform; the rest from config.
    pub fn new(cfg: &AppConfig, chip_id: impl Into<String>, sdk_version: impl Into<String>) -> Self {
        Self {
            app_name: APP_NAME.into(),
            app_version: APP_VERSION.into(),
            device_name: cfg.device_name.clone(),
            firmware_version: cfg.firmware_version(),
            library_version: APP_VERSION.into(),
            chip_id: chip_id.into(),
            sdk_version: sdk_version.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestAccepted {
    pub test_number: i64,
}

/// Extract `test_number` from a `POST /api/test` body.
pub fn parse_test_request(body: &[u8]) -> Result<i64, ApiError> {
    let json: Value =
        serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Json bad syntax"))?;
    let value = json.get(TEST_NUMBER_KEY).ok_or_else(|| {
        ApiError::bad_request(format!("Cannot find JSON string '{TEST_NUMBER_KEY}'"))
    })?;
    value.as_i64().ok_or_else(|| {
        ApiError::bad_request(format!(
            "JSON pair with string '{TEST_NUMBER_KEY}' does not have a INTEGER value type"
        ))
    })
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// JSON body sent with an [`ApiError`].
pub fn error_body(err: &ApiError) -> Vec<u8> {
    serde_json::to_vec(&ErrorBody {
        error: &err.message,
    })
    .unwrap_or_default()
}

#[cfg(target_os = "espidf")]
pub mod server {
    use anyhow::anyhow;
    use embedded_svc::http::{Headers, Method};
    use embedded_svc::io::{Read, Write};
    use esp_idf_svc::http::server::{
        Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request,
    };
    use log::{error, info};
    use serde::Serialize;

    use super::{error_body, parse_test_request, ApiError, InfoPayload, TestAccepted};
    use crate::bench::TestBench;

    const MAX_HTTP_BODY: usize = 1024;

    type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

    pub fn start(info: InfoPayload, bench: TestBench) -> anyhow::Result<EspHttpServer<'static>> {
        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        server.fn_handler("/api/info", Method::Get, move |req| write_json(req, &info))?;

        server.fn_handler::<anyhow::Error, _>("/api/test", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let number = match parse_test_request(&body) {
                Ok(number) => number,
                Err(err) => return write_error(req, &err),
            };
            write_json(req, &TestAccepted { test_number: number })?;
            info!("http: running test {number}");
            if let Err(err) = bench.run_test(number) {
                error!("http: test {number} failed to start: {err}");
            }
            Ok(())
        })?;

        info!("http: server listening on port {}", conf.http_port);
        Ok(server)
    }

    fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
        let len = req.content_len().unwrap_or(0) as usize;
        if len > MAX_HTTP_BODY {
            return Err(anyhow!("request body too large"));
        }
        let mut body = vec![0_u8; len];
        if len > 0 {
            req.read_exact(&mut body)?;
        }
        Ok(body)
    }

    fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
        let body = serde_json::to_vec(payload)?;
        req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
            .write_all(&body)?;
        Ok(())
    }

    fn write_error(req: HttpRequest<'_, '_>, err: &ApiError) -> anyhow::Result<()> {
        req.into_response(
            err.status,
            Some("Bad Request"),
            &[("Content-Type", "application/json")],
        )?
        .write_all(&error_body(err))?;
        Ok(())
    }
}
