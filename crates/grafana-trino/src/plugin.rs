//! The Grafana backend services for the Trino data source.
use std::{collections::HashMap, convert::Infallible, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::stream::FuturesOrdered;
use grafana_plugin_sdk::{
    backend::{self, DataQuery, DataQueryStatus, ErrorSource},
    data,
    prelude::*,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::{
    client::{ClientError, RequestContext, ResultSet, TrinoClient},
    convert::{self, ConvertError},
    datasource::TrinoDataSource,
    interpolate::InterpolateError,
    macros::{self, MacroError, QueryRange},
    probe::{DataSourceRef, FetchError, QueryRequest, QueryTransport},
    query::TrinoQuery,
    settings::{SettingsError, TrinoJsonData, TrinoSecureJsonData, TrinoSettings},
};

type InstanceSettings =
    backend::DataSourceInstanceSettings<TrinoJsonData, TrinoSecureJsonData>;

const BEARER_PREFIX: &str = "Bearer ";

/// Errors that can occur while handling a request.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The request did not target a data source instance.
    #[error("missing data source instance settings")]
    MissingInstanceSettings,

    /// The data source settings were invalid.
    #[error("error reading settings: {0}")]
    Settings(#[from] SettingsError),

    /// Impersonation is enabled but the request has no user.
    #[error("user can't be nil if impersonation is enabled")]
    MissingUser,

    /// A template variable could not be applied.
    #[error("invalid template variable: {0}")]
    Interpolate(#[from] InterpolateError),

    /// A macro could not be expanded.
    #[error("invalid macro: {0}")]
    Macro(#[from] MacroError),

    /// Communicating with Trino failed, or the query failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The results could not be converted.
    #[error("failed to convert results: {0}")]
    Convert(#[from] ConvertError),

    /// A converted frame was malformed.
    #[error("invalid frame: {0}")]
    Frame(#[from] data::Error),
}

/// An error for a single query.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct QueryError {
    ref_id: String,
    source: PluginError,
}

impl QueryError {
    /// The underlying error.
    pub fn inner(&self) -> &PluginError {
        &self.source
    }
}

impl backend::DataQueryError for QueryError {
    fn ref_id(self) -> String {
        self.ref_id
    }

    fn status(&self) -> DataQueryStatus {
        match &self.source {
            PluginError::MissingInstanceSettings | PluginError::Settings(_) => {
                DataQueryStatus::ValidationFailed
            }
            PluginError::MissingUser => DataQueryStatus::Unauthorized,
            PluginError::Interpolate(_) | PluginError::Macro(_) => DataQueryStatus::BadRequest,
            PluginError::Client(ClientError::Status { status, .. }) => match status.as_u16() {
                401 => DataQueryStatus::Unauthorized,
                403 => DataQueryStatus::Forbidden,
                429 => DataQueryStatus::TooManyRequests,
                504 => DataQueryStatus::Timeout,
                _ => DataQueryStatus::BadGateway,
            },
            PluginError::Client(ClientError::Http(e)) if e.is_timeout() => {
                DataQueryStatus::Timeout
            }
            PluginError::Client(ClientError::Http(_) | ClientError::Token(_)) => {
                DataQueryStatus::BadGateway
            }
            PluginError::Client(ClientError::Query(e)) => match e.error_type.as_deref() {
                Some("USER_ERROR") => DataQueryStatus::BadRequest,
                Some("INSUFFICIENT_RESOURCES") => DataQueryStatus::TooManyRequests,
                _ => DataQueryStatus::BadGateway,
            },
            PluginError::Client(_) | PluginError::Convert(_) | PluginError::Frame(_) => {
                DataQueryStatus::Internal
            }
        }
    }

    fn source(&self) -> ErrorSource {
        match &self.source {
            PluginError::Client(
                ClientError::Http(_)
                | ClientError::Status { .. }
                | ClientError::Query(_)
                | ClientError::Token(_),
            ) => ErrorSource::Downstream,
            _ => ErrorSource::Plugin,
        }
    }
}

/// A [`QueryTransport`] that executes requests with a [`TrinoClient`].
///
/// Each query's macros are expanded against the request's relative range
/// before it is executed. The response holds one result set per query.
#[derive(Clone, Debug)]
pub struct TrinoTransport {
    client: Arc<TrinoClient>,
    ctx: RequestContext,
}

impl TrinoTransport {
    /// Create a transport sending queries through `client` on behalf of `ctx`.
    pub fn new(client: Arc<TrinoClient>, ctx: RequestContext) -> Self {
        Self { client, ctx }
    }
}

impl From<ClientError> for FetchError {
    fn from(other: ClientError) -> Self {
        match other {
            ClientError::Status { status, body } => {
                let error = FetchError::status(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default(),
                );
                if body.is_empty() {
                    error
                } else {
                    error.with_message(body)
                }
            }
            ClientError::Query(e) => {
                FetchError::no_response().with_message(format!("db query error: {}", e.message))
            }
            ClientError::Http(e) => {
                warn!(error = %e, "Request to Trino failed");
                FetchError::no_response().with_cause(&e)
            }
            other => FetchError::no_response()
                .with_message(other.to_string())
                .with_cause(&other),
        }
    }
}

/// Resolve Grafana's relative time syntax: `now` or `now-<interval>`.
fn resolve_relative(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, MacroError> {
    match s.strip_prefix("now") {
        Some("") => Ok(now),
        Some(offset) => {
            let offset = offset
                .strip_prefix('-')
                .ok_or_else(|| MacroError::InvalidInterval(s.to_string()))?;
            let offset = chrono::Duration::from_std(macros::parse_interval(offset)?)
                .map_err(|_| MacroError::InvalidInterval(s.to_string()))?;
            Ok(now - offset)
        }
        None => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| MacroError::InvalidInterval(s.to_string())),
    }
}

#[backend::async_trait]
impl QueryTransport for TrinoTransport {
    type Response = Vec<ResultSet>;

    async fn fetch(&self, request: QueryRequest) -> Result<Self::Response, FetchError> {
        let now = Utc::now();
        let macro_error = |e: MacroError| FetchError::no_response().with_message(e.to_string());
        let range = QueryRange {
            from: resolve_relative(&request.range.from, now).map_err(macro_error)?,
            to: resolve_relative(&request.range.to, now).map_err(macro_error)?,
        };
        let mut results = Vec::with_capacity(request.queries.len());
        for query in request.queries {
            let sql = macros::expand(&query.raw_sql, &range).map_err(macro_error)?;
            results.push(self.client.execute(&sql, &self.ctx).await?);
        }
        Ok(results)
    }
}

#[derive(Debug)]
struct CachedClient {
    updated: DateTime<Utc>,
    client: Arc<TrinoClient>,
}

/// The Trino data source plugin.
///
/// Clients are created lazily for each data source instance and reused
/// until the instance's settings are updated.
#[derive(Clone, Debug, Default, GrafanaPlugin)]
#[grafana_plugin(
    plugin_type = "datasource",
    json_data = "TrinoJsonData",
    secure_json_data = "TrinoSecureJsonData"
)]
pub struct TrinoPlugin {
    clients: Arc<RwLock<HashMap<String, CachedClient>>>,
}

/// Values shared by every query in a request.
#[derive(Clone, Debug)]
struct RequestDetails {
    instance: Option<InstanceSettings>,
    user: Option<String>,
    access_token: Option<String>,
}

/// Extract a bearer token forwarded by Grafana, if any.
pub fn forwarded_token(headers: &HashMap<String, String>) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| {
            k.eq_ignore_ascii_case("Authorization") || k.eq_ignore_ascii_case("http_Authorization")
        })
        .and_then(|(_, v)| v.strip_prefix(BEARER_PREFIX))
        .map(str::to_string)
}

impl TrinoPlugin {
    async fn client(&self, instance: &InstanceSettings) -> Result<Arc<TrinoClient>, PluginError> {
        if let Some(cached) = self
            .clients
            .read()
            .await
            .get(&instance.uid)
            .filter(|c| c.updated == instance.updated)
        {
            return Ok(Arc::clone(&cached.client));
        }
        let settings = TrinoSettings::from_instance(instance)?;
        let client = Arc::new(TrinoClient::new(settings)?);
        info!(uid = %instance.uid, "Created Trino client");
        self.clients.write().await.insert(
            instance.uid.clone(),
            CachedClient {
                updated: instance.updated,
                client: Arc::clone(&client),
            },
        );
        Ok(client)
    }

    #[instrument(skip_all, fields(ref_id = %query.ref_id))]
    async fn run_query(
        &self,
        query: DataQuery<TrinoQuery>,
        details: &RequestDetails,
    ) -> Result<backend::DataResponse, PluginError> {
        let instance = details
            .instance
            .as_ref()
            .ok_or(PluginError::MissingInstanceSettings)?;
        let client = self.client(instance).await?;
        let user = if client.settings().enable_impersonation {
            Some(details.user.clone().ok_or(PluginError::MissingUser)?)
        } else {
            None
        };
        let mut trino_query = query.query;
        let ctx = RequestContext {
            user,
            access_token: details.access_token.clone(),
            client_tags: trino_query.client_tags.clone().filter(|t| !t.is_empty()),
        };

        let variables = std::mem::take(&mut trino_query.scoped_vars);
        let datasource = TrinoDataSource::new(
            TrinoTransport::new(Arc::clone(&client), ctx.clone()),
            DataSourceRef::new(&instance.uid, &instance.type_),
        );
        let trino_query = datasource.apply_template_variables(trino_query, &variables)?;
        let range = QueryRange {
            from: query.time_range.from,
            to: query.time_range.to,
        };
        let sql = macros::expand(&trino_query.raw_sql, &range)?;
        debug!(sql, format = %trino_query.format, "Executing query");

        let results = client.execute(&sql, &ctx).await?;
        let frames = convert::to_frames("", &results, trino_query.format, &sql)?;
        let checked = frames
            .iter()
            .map(data::Frame::check)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(backend::DataResponse::new(query.ref_id, checked))
    }
}

#[backend::async_trait]
impl backend::DataService for TrinoPlugin {
    type Query = TrinoQuery;
    type QueryError = QueryError;
    type Stream = backend::BoxDataResponseStream<Self::QueryError>;

    async fn query_data(
        &self,
        request: backend::QueryDataRequest<Self::Query, Self>,
    ) -> Self::Stream {
        let details = RequestDetails {
            instance: request.plugin_context.instance_settings,
            user: request.plugin_context.user.map(|u| u.login),
            access_token: forwarded_token(&request.headers),
        };
        let plugin = self.clone();
        Box::pin(
            request
                .queries
                .into_iter()
                .map(move |query| {
                    let plugin = plugin.clone();
                    let details = details.clone();
                    async move {
                        let ref_id = query.ref_id.clone();
                        plugin
                            .run_query(query, &details)
                            .await
                            .map_err(|source| {
                                warn!(ref_id, error = %source, "Query failed");
                                QueryError { ref_id, source }
                            })
                    }
                })
                .collect::<FuturesOrdered<_>>(),
        )
    }
}

#[backend::async_trait]
impl backend::DiagnosticsService for TrinoPlugin {
    type CheckHealthError = Infallible;

    async fn check_health(
        &self,
        request: backend::CheckHealthRequest<Self>,
    ) -> Result<backend::CheckHealthResponse, Self::CheckHealthError> {
        let Some(instance) = request.plugin_context.instance_settings else {
            return Ok(backend::CheckHealthResponse::error(
                PluginError::MissingInstanceSettings.to_string(),
            ));
        };
        let client = match self.client(&instance).await {
            Ok(client) => client,
            Err(e) => return Ok(backend::CheckHealthResponse::error(e.to_string())),
        };
        let user = request.plugin_context.user.map(|u| u.login);
        if client.settings().enable_impersonation && user.is_none() {
            return Ok(backend::CheckHealthResponse::error(
                PluginError::MissingUser.to_string(),
            ));
        }
        let ctx = RequestContext {
            user: user.filter(|_| client.settings().enable_impersonation),
            access_token: forwarded_token(&request.headers),
            client_tags: None,
        };
        let datasource = TrinoDataSource::new(
            TrinoTransport::new(client, ctx),
            DataSourceRef::new(instance.uid, instance.type_),
        );
        Ok(datasource.test_datasource().await.into())
    }

    type CollectMetricsError = Infallible;

    async fn collect_metrics(
        &self,
        _request: backend::CollectMetricsRequest<Self>,
    ) -> Result<backend::CollectMetricsResponse, Self::CollectMetricsError> {
        Ok(backend::CollectMetricsResponse::new(None))
    }
}
