use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use grafana_plugin_sdk::backend;
use pretty_assertions::assert_eq;

use grafana_trino::{
    client::{RequestContext, TrinoClient},
    datasource::TrinoDataSource,
    interpolate::{InterpolateError, VariableOptions},
    plugin::TrinoTransport,
    probe::{ConnectionStatus, DataSourceRef, FetchError, QueryRequest, QueryTransport},
    query::{Format, TrinoQuery},
    settings::{TrinoJsonData, TrinoSecureJsonData, TrinoSettings},
    template::{TemplateVariable, TemplateVariables},
};

struct CountingTransport {
    outcome: Result<(), FetchError>,
    calls: AtomicUsize,
}

#[backend::async_trait]
impl QueryTransport for CountingTransport {
    type Response = ();

    async fn fetch(&self, _request: QueryRequest) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

fn datasource(outcome: Result<(), FetchError>) -> TrinoDataSource<CountingTransport> {
    TrinoDataSource::new(
        CountingTransport {
            outcome,
            calls: AtomicUsize::new(0),
        },
        DataSourceRef::new("trino", "trino-datasource"),
    )
}

#[tokio::test]
async fn test_datasource_outcomes() {
    let cases = [
        (Ok(()), ConnectionStatus::Success, "Database Connection OK"),
        (
            Err(FetchError::status(500, "Internal Server Error").with_message("catalog missing")),
            ConnectionStatus::Error,
            "catalog missing",
        ),
        (
            Err(FetchError::status(401, "Unauthorized")),
            ConnectionStatus::Error,
            "Query error: Unauthorized",
        ),
        (
            Err(FetchError::no_response()),
            ConnectionStatus::Error,
            "Error connecting to Trino",
        ),
    ];
    for (outcome, status, message) in cases {
        let ds = datasource(outcome);
        let result = ds.test_datasource().await;
        assert_eq!(result.status, status);
        assert_eq!(result.message, message);
    }
}

#[tokio::test]
async fn each_test_makes_one_request() {
    let ds = datasource(Ok(()));
    ds.test_datasource().await;
    ds.test_datasource().await;
    assert_eq!(ds.transport().calls.load(Ordering::SeqCst), 2);
    assert_eq!(ds.reference().uid, "trino");
}

#[test]
fn applies_template_variables() {
    let ds = datasource(Ok(()));
    let variables = TemplateVariables::new()
        .with(
            "region",
            TemplateVariable::new(vec!["eu", "us"], VariableOptions::MULTI),
        )
        .with(
            "name",
            TemplateVariable::new("O'Brien", VariableOptions::SINGLE),
        );
    let query = TrinoQuery::new(
        "SELECT * FROM t WHERE region IN ($region) AND name = '${name}'",
        Format::Table,
    );
    let query = ds.apply_template_variables(query, &variables).unwrap();
    assert_eq!(
        query.raw_sql,
        "SELECT * FROM t WHERE region IN ('eu','us') AND name = 'O''Brien'"
    );
    assert_eq!(query.format, Format::Table);
}

#[test]
fn list_for_single_value_variable_is_rejected() {
    let ds = datasource(Ok(()));
    let variables = TemplateVariables::new().with(
        "region",
        TemplateVariable::new(vec!["eu", "us"], VariableOptions::SINGLE),
    );
    let err = ds
        .apply_template_variables(TrinoQuery::new("SELECT $region", Format::Table), &variables)
        .unwrap_err();
    assert_eq!(err, InterpolateError::UnexpectedList { len: 2 });
}

#[tokio::test]
async fn unreachable_server_reports_fallback_message() {
    let settings = TrinoSettings::from_parts(
        "http://127.0.0.1:1",
        None,
        &TrinoJsonData::default(),
        &TrinoSecureJsonData::default(),
    )
    .unwrap();
    let client = Arc::new(TrinoClient::new(settings).unwrap());
    let ds = TrinoDataSource::new(
        TrinoTransport::new(client, RequestContext::default()),
        DataSourceRef::new("trino", "trino-datasource"),
    );
    let result = ds.test_datasource().await;
    assert_eq!(result.status, ConnectionStatus::Error);
    assert_eq!(result.message, "Error connecting to Trino");
}
