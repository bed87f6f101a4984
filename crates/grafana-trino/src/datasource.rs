//! The data source adapter: connection testing and template variable handling
//! over an injected [`QueryTransport`].
use crate::{
    interpolate::{interpolate, InterpolateError},
    probe::{self, ConnectionResult, DataSourceRef, QueryTransport},
    query::TrinoQuery,
    template::TemplateSrv,
};

/// A Trino data source, backed by a transport that can execute queries.
#[derive(Debug, Clone)]
pub struct TrinoDataSource<T> {
    transport: T,
    reference: DataSourceRef,
}

impl<T: QueryTransport> TrinoDataSource<T> {
    /// Create a data source which sends queries for `reference` through `transport`.
    pub fn new(transport: T, reference: DataSourceRef) -> Self {
        Self {
            transport,
            reference,
        }
    }

    /// The reference identifying this data source.
    pub fn reference(&self) -> &DataSourceRef {
        &self.reference
    }

    /// The transport queries are sent through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check that the data source can run a query end-to-end.
    pub async fn test_datasource(&self) -> ConnectionResult {
        probe::test_connection(&self.transport, self.reference.clone()).await
    }

    /// Replace template variables in the query's SQL.
    ///
    /// Each variable occurrence is formatted with [`interpolate`].
    pub fn apply_template_variables<S>(
        &self,
        query: TrinoQuery,
        templates: &S,
    ) -> Result<TrinoQuery, InterpolateError>
    where
        S: TemplateSrv + ?Sized,
    {
        let raw_sql = templates.replace(&query.raw_sql, &interpolate)?;
        Ok(TrinoQuery { raw_sql, ..query })
    }
}
