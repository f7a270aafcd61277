//! Alpaca REST transport.
//!
//! Every device method is an HTTP endpoint at
//! `/api/v1/{device_type}/{device_number}/{method}`. Reads are `GET` with the
//! client id and a transaction counter in the query; writes are `PUT` with
//! form-encoded parameters. Both return the same JSON envelope.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Driver error number for "device not connected".
pub const NOT_CONNECTED: i32 = 0x407;

/// Driver error number for "invalid operation" (e.g. slew while parked).
pub const INVALID_OPERATION: i32 = 0x40B;

/// Default bound on a single HTTP round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlpacaError {
    /// Request could not be delivered
    #[error("connection error: {0}")]
    Connection(String),

    /// Request timed out
    #[error("request timed out")]
    Timeout,

    /// Transport-level failure not covered above
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server returned a non-2xx status
    #[error("server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Driver answered with a non-zero ErrorNumber
    #[error("driver error 0x{number:X}: {message}")]
    Device { number: i32, message: String },

    /// Response body was not the expected envelope
    #[error("parse error: {0}")]
    Parse(String),
}

impl AlpacaError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, AlpacaError::Device { number, .. } if *number == NOT_CONNECTED)
    }

    /// The request never produced a driver answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AlpacaError::Connection(_)
                | AlpacaError::Timeout
                | AlpacaError::Http(_)
                | AlpacaError::ServerError { .. }
        )
    }
}

impl From<reqwest::Error> for AlpacaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AlpacaError::Timeout
        } else if err.is_connect() {
            AlpacaError::Connection(err.to_string())
        } else if err.is_decode() {
            AlpacaError::Parse(err.to_string())
        } else {
            AlpacaError::Http(err.to_string())
        }
    }
}

pub type AlpacaResult<T> = Result<T, AlpacaError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T> {
    value: Option<T>,
    #[serde(default)]
    error_number: i32,
    #[serde(default)]
    error_message: String,
}

impl<T> Envelope<T> {
    fn check(self) -> AlpacaResult<Option<T>> {
        if self.error_number != 0 {
            return Err(AlpacaError::Device {
                number: self.error_number,
                message: self.error_message,
            });
        }
        Ok(self.value)
    }
}

/// Kind of device addressed on an Alpaca server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Telescope,
    Camera,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceType::Telescope => write!(f, "telescope"),
            DeviceType::Camera => write!(f, "camera"),
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    base_url: String,
    http: reqwest::Client,
    client_id: u32,
    transaction: AtomicU32,
}

/// Connection to one Alpaca server; cheap to clone.
#[derive(Debug, Clone)]
pub struct AlpacaClient {
    inner: Arc<ClientInner>,
}

impl AlpacaClient {
    /// Create a client for the server at `base_url` (e.g. `http://localhost:11111`).
    pub fn new(base_url: &str, request_timeout: Duration) -> AlpacaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AlpacaError::Http(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                client_id: std::process::id(),
                transaction: AtomicU32::new(1),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Address one device on this server.
    pub fn device(&self, device_type: DeviceType, device_number: u32) -> AlpacaDevice {
        AlpacaDevice {
            client: self.clone(),
            device_type,
            device_number,
        }
    }

    fn next_transaction(&self) -> u32 {
        self.inner.transaction.fetch_add(1, Ordering::Relaxed)
    }
}

/// One device endpoint on an Alpaca server.
#[derive(Debug, Clone)]
pub struct AlpacaDevice {
    client: AlpacaClient,
    device_type: DeviceType,
    device_number: u32,
}

impl AlpacaDevice {
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/api/v1/{}/{}/{}",
            self.client.base_url(),
            self.device_type,
            self.device_number,
            method
        )
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> AlpacaResult<Envelope<T>> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AlpacaError::ServerError {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| AlpacaError::Parse(e.to_string()))
    }

    /// Read a property.
    pub async fn get<T: DeserializeOwned>(&self, method: &str) -> AlpacaResult<T> {
        let transaction = self.client.next_transaction();
        trace!("GET {} {} (tx {})", self.device_type, method, transaction);

        let response = self
            .client
            .inner
            .http
            .get(self.url(method))
            .query(&[
                ("ClientID", self.client.inner.client_id),
                ("ClientTransactionID", transaction),
            ])
            .send()
            .await?;

        Self::read_envelope::<T>(response)
            .await?
            .check()?
            .ok_or_else(|| AlpacaError::Parse(format!("{method}: response has no Value")))
    }

    /// Invoke a method or set a property.
    pub async fn put(&self, method: &str, params: &[(&str, String)]) -> AlpacaResult<()> {
        let transaction = self.client.next_transaction();
        debug!(
            "PUT {} {} {:?} (tx {})",
            self.device_type, method, params, transaction
        );

        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("ClientID", self.client.inner.client_id.to_string()));
        form.push(("ClientTransactionID", transaction.to_string()));

        let response = self
            .client
            .inner
            .http
            .put(self.url(method))
            .form(&form)
            .send()
            .await?;

        Self::read_envelope::<serde_json::Value>(response)
            .await?
            .check()
            .map(|_| ())
    }

    pub async fn set_connected(&self, connected: bool) -> AlpacaResult<()> {
        self.put("connected", &[("Connected", bool_param(connected))])
            .await
    }

    pub async fn is_connected(&self) -> AlpacaResult<bool> {
        self.get("connected").await
    }

    pub async fn name(&self) -> AlpacaResult<String> {
        self.get("name").await
    }
}

/// Alpaca expects capitalized booleans in form bodies.
pub(crate) fn bool_param(value: bool) -> String {
    if value { "True" } else { "False" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn ok_body(value: &str) -> String {
        format!(r#"{{"Value":{value},"ClientTransactionID":1,"ServerTransactionID":1,"ErrorNumber":0,"ErrorMessage":""}}"#)
    }

    #[tokio::test]
    async fn test_get_sends_client_ids_and_decodes_value() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/telescope/0/declination")
            .match_query(Matcher::AllOf(vec![
                Matcher::Regex("ClientID=".into()),
                Matcher::Regex("ClientTransactionID=".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(ok_body("45.5"))
            .create_async()
            .await;

        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let device = client.device(DeviceType::Telescope, 0);
        let dec: f64 = device.get("declination").await.unwrap();
        assert_eq!(dec, 45.5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_driver_error_number_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/camera/1/imageready")
            .match_query(Matcher::Any)
            .with_body(r#"{"Value":false,"ErrorNumber":1031,"ErrorMessage":"Not connected"}"#)
            .create_async()
            .await;

        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let err = client
            .device(DeviceType::Camera, 1)
            .get::<bool>("imageready")
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_put_sends_form_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v1/telescope/0/tracking")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("Tracking".into(), "True".into()),
                Matcher::Regex("ClientTransactionID=".into()),
            ]))
            .with_body(r#"{"ErrorNumber":0,"ErrorMessage":""}"#)
            .create_async()
            .await;

        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        client
            .device(DeviceType::Telescope, 0)
            .put("tracking", &[("Tracking", bool_param(true))])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/telescope/0/slewing")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("driver crashed")
            .create_async()
            .await;

        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let err = client
            .device(DeviceType::Telescope, 0)
            .get::<bool>("slewing")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AlpacaError::ServerError {
                status: 500,
                message: "driver crashed".into()
            }
        );
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let client = AlpacaClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client
            .device(DeviceType::Telescope, 0)
            .get::<bool>("connected")
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
