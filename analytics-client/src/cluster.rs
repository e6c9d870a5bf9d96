//! User-facing cluster, database, and scope handles.

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ClusterOptions;
use crate::credentials::Credential;
use crate::error::{BoxError, Error, Result};
use crate::executor::QueryExecutor;
use crate::request::{QueryContext, QueryOptions};
use crate::result::{QueryMetadata, QueryResult};
use crate::row::Row;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Handle to one analytics cluster: owns the executor and the transport.
/// Cheap to clone; all clones share the same connection pool.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    executor: QueryExecutor,
    credential: Arc<ArcSwap<Credential>>,
    cancel: CancellationToken,
}

impl Cluster {
    /// Connect to the endpoint named by `connection_string` (an `https`
    /// URL, optionally with configuration query parameters).
    ///
    /// No I/O happens here; the first query opens the first connection.
    pub fn connect(
        connection_string: &str,
        credential: Credential,
        mut options: ClusterOptions,
    ) -> Result<Self> {
        let endpoint = crate::config::apply_connection_string(connection_string, &mut options)?;
        info!(endpoint = %endpoint, "configuring analytics cluster");
        let transport = Arc::new(ReqwestTransport::new(
            &endpoint,
            options.trust.clone(),
            &credential,
        )?);
        Ok(Self::from_parts(transport, credential, options))
    }

    /// Build a cluster over a caller-supplied transport. This is how tests
    /// and alternative HTTP stacks plug in.
    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        credential: Credential,
        options: ClusterOptions,
    ) -> Self {
        Self::from_parts(transport, credential, options)
    }

    fn from_parts(
        transport: Arc<dyn HttpTransport>,
        credential: Credential,
        options: ClusterOptions,
    ) -> Self {
        let credential = Arc::new(ArcSwap::from_pointee(credential));
        let cancel = CancellationToken::new();
        let executor = QueryExecutor::new(
            transport,
            credential.clone(),
            options.deserializer,
            options.timeout,
            cancel.clone(),
        );
        Cluster {
            inner: Arc::new(ClusterInner {
                executor,
                credential,
                cancel,
            }),
        }
    }

    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            cluster: self.clone(),
            name: name.into(),
        }
    }

    /// Execute a query and buffer every row.
    pub async fn execute_query(
        &self,
        statement: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        execute_buffered(&self.inner.executor, None, statement, options).await
    }

    /// Execute a query, delivering rows to `on_row` in wire order as they
    /// arrive. An error returned from the callback aborts the query and is
    /// handed back verbatim inside [`Error::RowCallback`].
    pub async fn execute_streaming_query<F>(
        &self,
        statement: &str,
        on_row: F,
        options: QueryOptions,
    ) -> Result<QueryMetadata>
    where
        F: FnMut(Row<'_>) -> std::result::Result<(), BoxError>,
    {
        self.inner
            .executor
            .execute(None, statement, &options, on_row)
            .await
    }

    /// Swap the active credential. The replacement must be the same kind of
    /// credential: TLS key material cannot be reconfigured on a live pool.
    pub fn rotate_credential(&self, credential: Credential) -> Result<()> {
        let current = self.inner.credential.load();
        if current.tag() != credential.tag() {
            return Err(Error::invalid_argument(format!(
                "credential rotation cannot change the credential kind \
                 (current {:?}, replacement {:?})",
                current.tag(),
                credential.tag()
            )));
        }
        self.inner.credential.store(Arc::new(credential));
        Ok(())
    }

    /// Terminate in-flight dispatch and release pooled connections. Queries
    /// observing the shutdown fail with [`Error::Cancelled`].
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.executor.transport().evict_pooled_connections();
    }
}

/// Handle to a database; only useful for reaching its scopes.
#[derive(Clone)]
pub struct Database {
    cluster: Cluster,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self, name: impl Into<String>) -> Scope {
        Scope {
            cluster: self.cluster.clone(),
            database: self.name.clone(),
            name: name.into(),
        }
    }
}

/// Handle to a scope. Queries run here carry a query context, so the
/// statement may use unqualified collection names.
#[derive(Clone)]
pub struct Scope {
    cluster: Cluster,
    database: String,
    name: String,
}

impl Scope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn execute_query(
        &self,
        statement: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let context = QueryContext::new(&self.database, &self.name)?;
        execute_buffered(
            &self.cluster.inner.executor,
            Some(&context),
            statement,
            options,
        )
        .await
    }

    pub async fn execute_streaming_query<F>(
        &self,
        statement: &str,
        on_row: F,
        options: QueryOptions,
    ) -> Result<QueryMetadata>
    where
        F: FnMut(Row<'_>) -> std::result::Result<(), BoxError>,
    {
        let context = QueryContext::new(&self.database, &self.name)?;
        self.cluster
            .inner
            .executor
            .execute(Some(&context), statement, &options, on_row)
            .await
    }
}

/// Buffered execution is the streaming form with an appending callback.
async fn execute_buffered(
    executor: &QueryExecutor,
    context: Option<&QueryContext>,
    statement: &str,
    options: QueryOptions,
) -> Result<QueryResult> {
    let deserializer = options
        .deserializer
        .clone()
        .unwrap_or_else(|| executor.default_deserializer());
    let mut rows: Vec<Bytes> = Vec::new();
    let metadata = executor
        .execute(context, statement, &options, |row| {
            rows.push(Bytes::copy_from_slice(row.bytes()));
            Ok(())
        })
        .await?;
    Ok(QueryResult::new(rows, metadata, deserializer))
}
