//! The InfluxDB HTTP client.
//!
//! Two endpoints of the InfluxDB 1.x HTTP API are spoken here: `/query`, used
//! to create the target database, and `/write`, which accepts line protocol.
//! Server reported errors arrive as JSON text; this module is the only place
//! that text is inspected. Everything above it matches on [`Error`] variants.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests sent
//! `request_ok`: Successful requests, labelled by status code
//! `request_failure`: Failed requests
//!

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{
    Method, Request, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use hyper_util::{
    client::legacy::{Client as HyperClient, connect::HttpConnector},
    rt::TokioExecutor,
};
use influx_load_payload::Batch;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::Password, writer::Sink};

const DATABASE_EXISTS: &str = "database already exists";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Client`].
pub enum Error {
    /// The host is not a valid URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// Only plain HTTP is spoken.
    #[error("Unsupported scheme {0:?}, expected \"http\"")]
    UnsupportedScheme(String),
    /// The host carries no authority.
    #[error("Host URI {0} has no authority")]
    MissingAuthority(String),
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// Wrapper around [`hyper::Error`].
    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    /// Query string could not be encoded.
    #[error("Query string encoding failed: {0}")]
    QueryString(#[from] serde_qs::Error),
    /// Response body was not the expected JSON.
    #[error("Malformed response body: {0}")]
    Json(#[from] serde_json::Error),
    /// Error making HTTP request
    #[error("Failed to send HTTP request to {uri}: {source}")]
    RequestFailed {
        /// Target URI
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// The request did not complete in time.
    #[error("Request to {uri} timed out after {after:?}")]
    Timeout {
        /// Target URI
        uri: String,
        /// The configured deadline
        after: Duration,
    },
    /// The server answered with a non-success status.
    #[error("Server responded {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Error text from the server
        message: String,
    },
    /// The database named in `CREATE DATABASE` already exists.
    #[error("database already exists")]
    DatabaseExists,
    /// A statement failed on the server.
    #[error("Query failed: {0}")]
    Query(String),
}

/// Outcome of [`Client::ensure_database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Database {
    /// The database was created by this call
    Created,
    /// The database was already present
    Existing,
}

#[derive(Debug, Clone)]
/// Configuration of [`Client`].
pub struct Config {
    /// Base URI of the InfluxDB HTTP API, may include a path prefix
    pub host: String,
    /// Database writes are sent to
    pub database: String,
    /// User to authenticate as
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<Password>,
    /// Deadline for each request, including reading the response body
    pub request_timeout: Duration,
    /// Idle connections kept open to the host
    pub max_idle_connections: usize,
}

#[derive(Serialize)]
struct Credentials<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    u: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<&'a str>,
}

#[derive(Serialize)]
struct WriteParams<'a> {
    db: &'a str,
    precision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    u: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<&'a str>,
}

#[derive(Serialize)]
struct QueryForm<'a> {
    q: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StatementResult {
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the InfluxDB 1.x HTTP API.
///
/// Cheap to share behind an `Arc`; the underlying connection pool is safe for
/// concurrent use.
#[derive(Debug)]
pub struct Client {
    base: String,
    database: String,
    username: Option<String>,
    password: Option<Password>,
    timeout: Duration,
    http: HyperClient<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    metric_labels: Vec<(String, String)>,
}

impl Client {
    /// Create a new [`Client`] instance
    ///
    /// # Errors
    ///
    /// Function will return an error if `config.host` is not an `http` URI
    /// with an authority.
    pub fn new(config: Config) -> Result<Self, Error> {
        let uri: Uri = config.host.parse()?;
        match uri.scheme_str() {
            Some("http") => {}
            other => return Err(Error::UnsupportedScheme(other.unwrap_or("").to_string())),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| Error::MissingAuthority(config.host.clone()))?;
        let base = format!("http://{authority}{}", uri.path().trim_end_matches('/'));

        let http = HyperClient::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_connections)
            .retry_canceled_requests(false)
            .build_http();

        Ok(Self {
            base,
            database: config.database,
            username: config.username,
            password: config.password,
            timeout: config.request_timeout,
            http,
            metric_labels: vec![("component".to_string(), "client".to_string())],
        })
    }

    /// The database this client writes to.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            u: self.username.as_deref(),
            p: self.password.as_ref().map(Password::expose),
        }
    }

    fn endpoint(&self, path: &str, query: &str) -> Result<Uri, Error> {
        let uri = if query.is_empty() {
            format!("{}/{path}", self.base)
        } else {
            format!("{}/{path}?{query}", self.base)
        };
        Ok(uri.parse()?)
    }

    async fn send(
        &self,
        request: Request<BoxBody<Bytes, hyper::Error>>,
    ) -> Result<(StatusCode, Bytes), Error> {
        // The query string may carry credentials, keep it out of errors.
        let uri = match request.uri().authority() {
            Some(authority) => format!("http://{authority}{}", request.uri().path()),
            None => request.uri().path().to_string(),
        };
        counter!("requests_sent", &self.metric_labels).increment(1);

        let exchange = async {
            let response =
                self.http
                    .request(request)
                    .await
                    .map_err(|source| Error::RequestFailed {
                        uri: uri.clone(),
                        source: Box::new(source),
                    })?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, Error>((status, body))
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                uri,
                after: self.timeout,
            }),
        };
        match &result {
            Ok((status, _)) => {
                let mut labels = self.metric_labels.clone();
                labels.push(("status_code".to_string(), status.as_u16().to_string()));
                counter!("request_ok", &labels).increment(1);
            }
            Err(_) => counter!("request_failure", &self.metric_labels).increment(1),
        }
        result
    }

    /// Run `command` through the `/query` endpoint.
    ///
    /// # Errors
    ///
    /// Function will return [`Error::DatabaseExists`] or [`Error::Query`] if
    /// the server reports a statement error, [`Error::Status`] on a
    /// non-success status and a transport error if the request fails.
    pub async fn query(&self, command: &str) -> Result<(), Error> {
        let uri = self.endpoint("query", &serde_qs::to_string(&self.credentials())?)?;
        let form = serde_qs::to_string(&QueryForm { q: command })?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, form.len())
            .body(crate::full(form))?;

        debug!("Running query: {command}");
        let (status, body) = self.send(request).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let response: QueryResponse = serde_json::from_slice(&body)?;
        let message = response.error.or_else(|| {
            response
                .results
                .into_iter()
                .find_map(|statement| statement.error)
        });
        match message {
            Some(message) if message == DATABASE_EXISTS => Err(Error::DatabaseExists),
            Some(message) => Err(Error::Query(message)),
            None => Ok(()),
        }
    }

    /// Issue `CREATE DATABASE` for `name`.
    ///
    /// # Errors
    ///
    /// See [`Client::query`].
    pub async fn create_database(&self, name: &str) -> Result<(), Error> {
        self.query(&format!("CREATE DATABASE {}", quote_identifier(name)))
            .await
    }

    /// Create this client's database, accepting one that already exists.
    ///
    /// # Errors
    ///
    /// Function will return an error if creation fails for any reason other
    /// than the database already existing.
    pub async fn ensure_database(&self) -> Result<Database, Error> {
        match self.create_database(&self.database).await {
            Ok(()) => Ok(Database::Created),
            Err(Error::DatabaseExists) => Ok(Database::Existing),
            Err(err) => Err(err),
        }
    }

    /// Write a line protocol body through the `/write` endpoint.
    ///
    /// # Errors
    ///
    /// Function will return [`Error::Status`] if the server rejects the write
    /// and a transport error if the request fails.
    pub async fn write(&self, body: Bytes) -> Result<(), Error> {
        let credentials = self.credentials();
        let params = WriteParams {
            db: &self.database,
            precision: "ns",
            u: credentials.u,
            p: credentials.p,
        };
        let uri = self.endpoint("write", &serde_qs::to_string(&params)?)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(CONTENT_LENGTH, body.len())
            .body(crate::full(body))?;

        let (status, body) = self.send(request).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, &body))
        }
    }
}

#[async_trait]
impl Sink for Client {
    type Error = Error;

    async fn write(&self, batch: &Batch) -> Result<(), Self::Error> {
        Client::write(self, batch.bytes.clone()).await
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> Error {
    let message = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(body) => body.error,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    };
    Error::Status {
        status: status.as_u16(),
        message,
    }
}

/// Quote `name` as an InfluxQL identifier.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
