//! Client for the Couchbase Analytics SQL++ HTTP API.
//!
//! The crate is built around a single query execution engine: request
//! bodies are assembled per attempt, responses are stream-parsed so rows
//! reach the caller without buffering the document, retriable server
//! errors are retried with backoff under the caller's deadline, and
//! connections suspected of sitting on a degraded node are evicted from
//! the pool.
//!
//! ```no_run
//! use analytics_client::{Cluster, ClusterOptions, Credential, QueryOptions};
//!
//! # async fn example() -> analytics_client::Result<()> {
//! let cluster = Cluster::connect(
//!     "https://analytics.example.com:18095",
//!     Credential::basic("Administrator", "password"),
//!     ClusterOptions::default(),
//! )?;
//!
//! let result = cluster
//!     .execute_query("SELECT RAW 1", QueryOptions::new())
//!     .await?;
//! for row in result.rows() {
//!     println!("{}", row.as_type::<i64>()?);
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod cluster;
mod config;
mod credentials;
mod error;
mod executor;
mod parser;
mod request;
mod result;
mod row;
mod transport;

pub use cluster::{Cluster, Database, Scope};
pub use config::{ClusterOptions, TrustSource};
pub use credentials::Credential;
pub use error::{BoxError, Error, ErrorRecord, QueryError, Result};
pub use request::{QueryOptions, ScanConsistency};
pub use result::{QueryMetadata, QueryMetrics, QueryResult, QueryWarning};
pub use row::{Deserializer, JsonDeserializer, Row};
pub use transport::{
    BodyStream, HttpTransport, ReqwestTransport, TransportRequest, TransportResponse,
};
