//! A minimal client for Trino's HTTP statement protocol.
//!
//! A query is submitted with `POST /v1/statement`. Each response contains a page
//! of results and, until the query has finished, a `nextUri` to fetch the next
//! page from. See <https://trino.io/docs/current/develop/client-protocol.html>.
use std::collections::BTreeMap;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, AUTHORIZATION},
    Certificate, Identity, StatusCode, Url,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    settings::{Auth, TrinoSettings},
    token::{TokenError, TokenSource},
};

/// The value of `X-Trino-Source` sent with every query.
pub const SOURCE: &str = "grafana";

/// Header carrying the Trino user.
pub const USER_HEADER: HeaderName = HeaderName::from_static("x-trino-user");
/// Header carrying the query source.
pub const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-trino-source");
/// Header carrying client tags.
pub const CLIENT_TAGS_HEADER: HeaderName = HeaderName::from_static("x-trino-client-tags");
/// Header carrying catalog roles.
pub const ROLE_HEADER: HeaderName = HeaderName::from_static("x-trino-role");

/// Errors returned by [`TrinoClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP client could not be built from the configured settings.
    #[error("failed to configure HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// The data source URL cannot be used as a base for the statement endpoint.
    #[error("data source URL {0} cannot be used as a base URL")]
    InvalidUrl(Url),

    /// A header value could not be encoded.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The request could not be sent, or the response could not be read.
    #[error("error communicating with Trino: {0}")]
    Http(#[from] reqwest::Error),

    /// Trino responded with a non-success status.
    #[error("Trino responded with status {status}: {body}")]
    Status {
        /// The response status.
        status: StatusCode,
        /// The response body, if it could be read.
        body: String,
    },

    /// The query failed inside Trino.
    #[error("{}", .0.message)]
    Query(TrinoError),

    /// A bearer token could not be obtained.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// An error reported by Trino for a failed query.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoError {
    /// A human readable message.
    pub message: String,
    /// The error name, e.g. `SYNTAX_ERROR`.
    #[serde(default)]
    pub error_name: Option<String>,
    /// The error type, e.g. `USER_ERROR`.
    #[serde(default)]
    pub error_type: Option<String>,
    /// The numeric error code.
    #[serde(default)]
    pub error_code: Option<i64>,
}

/// A result column.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Column {
    /// The column name.
    pub name: String,
    /// The Trino type, e.g. `varchar(10)` or `timestamp(3) with time zone`.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Column {
    /// Create a new column.
    pub fn new(name: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_: type_.into(),
        }
    }
}

/// The state of a statement, as reported in each page.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatementStats {
    /// E.g. `QUEUED`, `RUNNING` or `FINISHED`.
    #[serde(default)]
    pub state: String,
}

/// A single page returned by the statement protocol.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    /// The query id.
    pub id: String,
    /// Where to fetch the next page from, if the query has not finished.
    #[serde(default)]
    pub next_uri: Option<String>,
    /// The result columns, once known.
    #[serde(default)]
    pub columns: Option<Vec<Column>>,
    /// Rows in this page.
    #[serde(default)]
    pub data: Option<Vec<Vec<Value>>>,
    /// Set if the query failed.
    #[serde(default)]
    pub error: Option<TrinoError>,
    /// Execution statistics.
    #[serde(default)]
    pub stats: Option<StatementStats>,
}

/// All columns and rows returned by a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    /// The Trino query id.
    pub query_id: String,
    /// The result columns.
    pub columns: Vec<Column>,
    /// The result rows, in column order.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Add a page of results, returning the URI of the next page if any.
    pub fn push_page(&mut self, page: QueryResults) -> Result<Option<String>, ClientError> {
        if let Some(error) = page.error {
            return Err(ClientError::Query(error));
        }
        self.query_id = page.id;
        if let Some(columns) = page.columns {
            self.columns = columns;
        }
        if let Some(rows) = page.data {
            self.rows.extend(rows);
        }
        Ok(page.next_uri)
    }
}

/// Per-request values that are not part of the data source settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// The Grafana user to impersonate.
    pub user: Option<String>,
    /// A bearer token forwarded from the Grafana user's session.
    pub access_token: Option<String>,
    /// Client tags for this query.
    pub client_tags: Option<String>,
}

/// Format catalog roles for the `X-Trino-Role` header.
pub fn role_header(roles: &BTreeMap<String, String>) -> String {
    roles
        .iter()
        .map(|(catalog, role)| format!("{catalog}=ROLE{{{role:?}}}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the headers sent with every statement request.
///
/// The Trino user is, in order of preference, the OAuth impersonation user,
/// the impersonated Grafana user, and the configured user.
pub fn statement_headers(
    settings: &TrinoSettings,
    ctx: &RequestContext,
    oauth_token: Option<&str>,
) -> Result<HeaderMap, ClientError> {
    let oauth_user = match &settings.auth {
        Auth::ClientCredentials(c) => c.impersonation_user.as_deref(),
        _ => None,
    };
    let user = oauth_user
        .or(ctx.user.as_deref())
        .unwrap_or(&settings.user);

    let mut headers = HeaderMap::new();
    headers.insert(USER_HEADER, HeaderValue::from_str(user)?);
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(SOURCE));
    if let Some(tags) = ctx.client_tags.as_deref().or(settings.client_tags.as_deref()) {
        headers.insert(CLIENT_TAGS_HEADER, HeaderValue::from_str(tags)?);
    }
    if !settings.roles.is_empty() {
        headers.insert(ROLE_HEADER, HeaderValue::from_str(&role_header(&settings.roles))?);
    }
    let static_token = match &settings.auth {
        Auth::AccessToken(token) => Some(token.as_str()),
        _ => None,
    };
    if let Some(token) = oauth_token
        .or(ctx.access_token.as_deref())
        .or(static_token)
    {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// A client for a single Trino data source.
#[derive(Debug)]
pub struct TrinoClient {
    http: reqwest::Client,
    settings: TrinoSettings,
    tokens: Option<TokenSource>,
}

impl TrinoClient {
    /// Create a client for the given settings.
    pub fn new(settings: TrinoSettings) -> Result<Self, ClientError> {
        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(settings.tls.skip_verify);
        if let Some(ca) = &settings.tls.ca_cert {
            let ca = Certificate::from_pem(ca.as_bytes()).map_err(ClientError::Build)?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(identity) = &settings.tls.identity {
            builder = builder.identity(
                Identity::from_pkcs8_pem(identity.cert.as_bytes(), identity.key.as_bytes())
                    .map_err(ClientError::Build)?,
            );
        }
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ClientError::Build)?;
        let tokens = match &settings.auth {
            Auth::ClientCredentials(credentials) => {
                Some(TokenSource::new(http.clone(), credentials.clone()))
            }
            _ => None,
        };
        Ok(Self {
            http,
            settings,
            tokens,
        })
    }

    /// The settings this client was created with.
    pub fn settings(&self) -> &TrinoSettings {
        &self.settings
    }

    fn statement_url(&self) -> Result<Url, ClientError> {
        let mut url = self.settings.url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.settings.url.clone()))?
            .pop_if_empty()
            .extend(["v1", "statement"]);
        Ok(url)
    }

    async fn headers(&self, ctx: &RequestContext) -> Result<HeaderMap, ClientError> {
        let oauth_token = match &self.tokens {
            Some(tokens) => Some(tokens.access_token().await?),
            None => None,
        };
        statement_headers(&self.settings, ctx, oauth_token.as_deref())
    }

    /// Execute `sql` and collect all of its results.
    ///
    /// If fetching a page fails, or the returned future is dropped before the
    /// query has finished, the query is cancelled in Trino with a `DELETE` to
    /// its current `nextUri`.
    #[instrument(skip(self, ctx), fields(url = %self.settings.url))]
    pub async fn execute(&self, sql: &str, ctx: &RequestContext) -> Result<ResultSet, ClientError> {
        let headers = self.headers(ctx).await?;
        let mut request = self
            .http
            .post(self.statement_url()?)
            .headers(headers.clone())
            .body(sql.to_string());
        if let Some(password) = &self.settings.password {
            if !headers.contains_key(AUTHORIZATION) {
                request = request.basic_auth(&self.settings.user, Some(password));
            }
        }
        let mut page = read_page(request.send().await?).await?;
        let mut results = ResultSet::default();
        let mut cancel = CancelOnDrop::new(self.http.clone(), headers.clone());
        let mut pages = 1;
        loop {
            if let Some(stats) = &page.stats {
                debug!(query_id = %page.id, state = %stats.state, "Received page");
            }
            let next_uri = match results.push_page(page) {
                Ok(Some(next_uri)) => next_uri,
                Ok(None) => break,
                Err(e) => {
                    // Trino has already finished a query that reports an error.
                    cancel.disarm();
                    if let ClientError::Query(q) = &e {
                        warn!(
                            error_name = ?q.error_name,
                            error_type = ?q.error_type,
                            error_code = ?q.error_code,
                            "Query failed in Trino"
                        );
                    }
                    return Err(e);
                }
            };
            cancel.track(&next_uri);
            let response = self
                .http
                .get(next_uri.as_str())
                .headers(headers.clone())
                .send()
                .await?;
            page = read_page(response).await?;
            pages += 1;
        }
        cancel.disarm();
        debug!(
            query_id = %results.query_id,
            pages,
            rows = results.rows.len(),
            "Query finished"
        );
        Ok(results)
    }
}

/// Cancels a running query when dropped, unless disarmed first.
struct CancelOnDrop {
    http: reqwest::Client,
    headers: HeaderMap,
    next_uri: Option<String>,
}

impl CancelOnDrop {
    fn new(http: reqwest::Client, headers: HeaderMap) -> Self {
        Self {
            http,
            headers,
            next_uri: None,
        }
    }

    fn track(&mut self, next_uri: &str) {
        self.next_uri = Some(next_uri.to_string());
    }

    fn disarm(&mut self) {
        self.next_uri = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(uri) = self.next_uri.take() else {
            return;
        };
        // Without a runtime the request can't be sent; Trino abandons the
        // query once its client stops polling.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self
            .http
            .delete(uri.as_str())
            .headers(std::mem::take(&mut self.headers));
        handle.spawn(async move {
            match request.send().await {
                Ok(response) => debug!(uri, status = %response.status(), "Cancelled query"),
                Err(e) => warn!(uri, error = %e, "Failed to cancel query"),
            }
        });
    }
}

async fn read_page(response: reqwest::Response) -> Result<QueryResults, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }
    Ok(response.json().await?)
}
