//! Connection testing.
//!
//! The probe sends a single `SELECT 1` query through a [`QueryTransport`] and turns
//! the outcome into a [`ConnectionResult`] suitable for showing to a user who has
//! just clicked 'Save & Test'.
use std::fmt;

use grafana_plugin_sdk::backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::query::Format;

/// The message returned when the probe query succeeds.
pub const SUCCESS_MESSAGE: &str = "Database Connection OK";

/// The message returned when a failure carries no other information.
pub const FALLBACK_MESSAGE: &str = "Error connecting to Trino";

/// The SQL executed by the probe.
pub const PROBE_SQL: &str = "SELECT 1";

/// A reference to a data source instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DataSourceRef {
    /// The unique identifier of the data source instance.
    pub uid: String,
    /// The plugin id of the data source.
    #[serde(rename = "type")]
    pub type_: String,
}

impl DataSourceRef {
    /// Create a new reference.
    pub fn new(uid: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            type_: type_.into(),
        }
    }
}

/// A time range, expressed in Grafana's relative time syntax.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelativeRange {
    /// The start of the range, e.g. `now-5m`.
    pub from: String,
    /// The end of the range, e.g. `now`.
    pub to: String,
}

/// A single query within a [`QueryRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Identifies the query within its request.
    pub ref_id: String,
    /// The suggested interval between points, in milliseconds.
    pub interval_ms: u64,
    /// The maximum number of points to return.
    pub max_data_points: u64,
    /// The data source to run the query against.
    pub datasource: DataSourceRef,
    /// The SQL text to execute.
    #[serde(rename = "rawSQL")]
    pub raw_sql: String,
    /// The shape of the results.
    pub format: Format,
}

/// A request to execute one or more queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    /// The time range of the request.
    pub range: RelativeRange,
    /// The queries to run.
    pub queries: Vec<QuerySpec>,
}

/// A structured error body returned alongside a failed query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    /// A human readable description of the failure.
    #[serde(default)]
    pub message: Option<String>,
}

/// The error returned by a [`QueryTransport`].
///
/// Any of the fields may be missing; for example a network failure has no
/// status and no body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchError {
    /// The HTTP-style status code, if a response was received.
    pub status: Option<u16>,
    /// The HTTP-style status text, if a response was received.
    pub status_text: Option<String>,
    /// The structured error body, if any.
    pub data: Option<ErrorBody>,
    /// The underlying failure, for logs. Never shown to users.
    pub cause: Option<String>,
}

impl FetchError {
    /// An error with no response at all.
    pub fn no_response() -> Self {
        Self::default()
    }

    /// An error with only a status.
    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_text: Some(status_text.into()),
            ..Self::default()
        }
    }

    /// Record the underlying failure, including its chain of sources.
    #[must_use]
    pub fn with_cause(mut self, cause: &(dyn std::error::Error + 'static)) -> Self {
        let mut text = cause.to_string();
        let mut source = cause.source();
        while let Some(s) = source {
            text.push_str(": ");
            text.push_str(&s.to_string());
            source = s.source();
        }
        self.cause = Some(text);
        self
    }

    /// Attach a structured error body with the given message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.data = Some(ErrorBody {
            message: Some(message.into()),
        });
        self
    }

    /// The message to show to a user, following the usual precedence.
    ///
    /// An explicit body message wins, then the status text, then a generic
    /// fallback.
    pub fn user_message(&self) -> String {
        let body_message = self
            .data
            .as_ref()
            .and_then(|d| d.message.as_deref())
            .filter(|m| !m.is_empty());
        let status_text = self.status_text.as_deref().filter(|s| !s.is_empty());
        match (body_message, status_text) {
            (Some(m), _) => m.to_string(),
            (None, Some(s)) => format!("Query error: {s}"),
            (None, None) => FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.user_message()),
            None => f.write_str(&self.user_message()),
        }
    }
}

impl std::error::Error for FetchError {}

/// A transport capable of executing query requests.
#[backend::async_trait]
pub trait QueryTransport: Send + Sync {
    /// The payload returned by a successful request.
    type Response: Send;

    /// Execute the request.
    async fn fetch(&self, request: QueryRequest) -> Result<Self::Response, FetchError>;
}

/// The outcome of a connection test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The probe query succeeded.
    Success,
    /// The probe query failed.
    Error,
}

/// The result of a connection test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionResult {
    /// Whether the test succeeded.
    pub status: ConnectionStatus,
    /// A message describing the outcome.
    pub message: String,
}

impl ConnectionResult {
    /// A successful result.
    pub fn success() -> Self {
        Self {
            status: ConnectionStatus::Success,
            message: SUCCESS_MESSAGE.to_string(),
        }
    }

    /// A failed result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            message: message.into(),
        }
    }

    /// Whether the test succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ConnectionStatus::Success
    }
}

impl From<ConnectionResult> for backend::CheckHealthResponse {
    fn from(other: ConnectionResult) -> Self {
        match other.status {
            ConnectionStatus::Success => Self::ok(other.message),
            ConnectionStatus::Error => Self::error(other.message),
        }
    }
}

/// Build the request sent by [`test_connection`].
pub fn probe_request(datasource: DataSourceRef) -> QueryRequest {
    QueryRequest {
        range: RelativeRange {
            from: "now-5m".to_string(),
            to: "now".to_string(),
        },
        queries: vec![QuerySpec {
            ref_id: "A".to_string(),
            interval_ms: 1,
            max_data_points: 1,
            datasource,
            raw_sql: PROBE_SQL.to_string(),
            format: Format::TimeSeries,
        }],
    }
}

/// Test that `datasource` can execute a query end-to-end through `transport`.
///
/// Exactly one request is made. Failures are never returned as errors; they are
/// described by a [`ConnectionResult`] with status [`ConnectionStatus::Error`].
#[tracing::instrument(skip(transport), level = "debug")]
pub async fn test_connection<T>(transport: &T, datasource: DataSourceRef) -> ConnectionResult
where
    T: QueryTransport + ?Sized,
{
    match transport.fetch(probe_request(datasource)).await {
        Ok(_) => {
            debug!("Probe query succeeded");
            ConnectionResult::success()
        }
        Err(e) => {
            warn!(status = ?e.status, error = %e, cause = ?e.cause, "Probe query failed");
            ConnectionResult::error(e.user_message())
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    struct FakeTransport {
        outcome: Result<(), FetchError>,
        calls: AtomicUsize,
        last: Mutex<Option<QueryRequest>>,
    }

    impl FakeTransport {
        fn new(outcome: Result<(), FetchError>) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }
    }

    #[backend::async_trait]
    impl QueryTransport for FakeTransport {
        type Response = ();
        async fn fetch(&self, request: QueryRequest) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request);
            self.outcome.clone()
        }
    }

    fn ds() -> DataSourceRef {
        DataSourceRef::new("trino-uid", "trino-datasource")
    }

    #[tokio::test]
    async fn success() {
        let transport = FakeTransport::new(Ok(()));
        let result = test_connection(&transport, ds()).await;
        assert_eq!(
            result,
            ConnectionResult {
                status: ConnectionStatus::Success,
                message: "Database Connection OK".to_string(),
            }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sends_a_single_select_one() {
        let transport = FakeTransport::new(Ok(()));
        test_connection(&transport, ds()).await;
        let request = transport.last.lock().unwrap().take().unwrap();
        assert_eq!(request, probe_request(ds()));
        assert_eq!(request.range.from, "now-5m");
        assert_eq!(request.range.to, "now");
        let query = &request.queries[0];
        assert_eq!(query.raw_sql, "SELECT 1");
        assert_eq!(query.interval_ms, 1);
        assert_eq!(query.max_data_points, 1);
        assert_eq!(query.format, Format::TimeSeries);
        assert_eq!(query.datasource, ds());
    }

    #[tokio::test]
    async fn status_text_without_body() {
        let transport = FakeTransport::new(Err(FetchError::status(400, "Bad Request")));
        let result = test_connection(&transport, ds()).await;
        assert_eq!(result.status, ConnectionStatus::Error);
        assert_eq!(result.message, "Query error: Bad Request");
    }

    #[tokio::test]
    async fn body_message_wins() {
        let transport = FakeTransport::new(Err(
            FetchError::status(400, "Bad Request").with_message("db query error: aaaa")
        ));
        let result = test_connection(&transport, ds()).await;
        assert_eq!(result, ConnectionResult::error("db query error: aaaa"));
    }

    #[tokio::test]
    async fn fallback_without_anything() {
        let transport = FakeTransport::new(Err(FetchError::no_response()));
        let result = test_connection(&transport, ds()).await;
        assert_eq!(result, ConnectionResult::error("Error connecting to Trino"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn body_without_message_falls_through() {
        let mut err = FetchError::status(500, "Internal Server Error");
        err.data = Some(ErrorBody::default());
        assert_eq!(err.user_message(), "Query error: Internal Server Error");
    }

    #[test]
    fn serializes_result() {
        assert_eq!(
            serde_json::to_value(ConnectionResult::success()).unwrap(),
            serde_json::json!({"status": "success", "message": "Database Connection OK"})
        );
    }
}
