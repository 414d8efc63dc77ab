use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{DocRef, Document, RemoteError, RemoteStore, Write};
use crate::config::Remote as RemoteConfig;

/// JSON-over-HTTP client for the hosted inventory store.
#[derive(Clone)]
pub struct HttpRemoteStore {
    http: Client,
    base_url: Url,
    token: String,
    timeout: Duration,
    lookup_limit: usize,
    batch_limit: usize,
}

impl fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("lookup_limit", &self.lookup_limit)
            .field("batch_limit", &self.batch_limit)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    writes: &'a [Write],
}

impl HttpRemoteStore {
    pub fn from_config(cfg: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&cfg.base_url).map_err(|err| RemoteError::Rejected {
            status: 0,
            message: format!("invalid remote.base_url: {}", err),
        })?;
        let timeout = Duration::from_millis(cfg.request_timeout_ms);
        let http = Client::builder()
            .user_agent("depot-sync/0.1")
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Unavailable(format!("http client: {}", err)))?;
        Ok(Self {
            http,
            base_url,
            token: cfg.token.clone(),
            timeout,
            lookup_limit: cfg.lookup_limit,
            batch_limit: cfg.batch_limit,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Rejected {
                status: 0,
                message: format!("base url {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<reqwest::Request, RemoteError> {
        let mut builder = self
            .http
            .request(method, self.endpoint(segments)?)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .build()
            .map_err(|err| RemoteError::Rejected {
                status: 0,
                message: format!("failed to build request: {}", err),
            })
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Response, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "remote request");
        let res = self.http.execute(request).await.map_err(|err| {
            if err.is_timeout() {
                RemoteError::Timeout(self.timeout)
            } else {
                RemoteError::Unavailable(err.to_string())
            }
        })?;
        let status = res.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%status, body = %body, "remote store error");
        Err(classify_status(status, body))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        res: Response,
        what: &str,
    ) -> Result<T, RemoteError> {
        res.json::<T>().await.map_err(|err| RemoteError::Malformed {
            doc: what.to_string(),
            message: err.to_string(),
        })
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unavailable(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => RemoteError::Unavailable(format!("{}: {}", status, body)),
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message: body,
        },
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn max_lookup_keys(&self) -> usize {
        self.lookup_limit
    }

    fn max_batch_writes(&self) -> usize {
        self.batch_limit
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let req = self.build_request(Method::GET, &["v1", "health"], None)?;
        let res = self.execute(req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Unavailable("health endpoint missing".into()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(doc = %doc))]
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, RemoteError> {
        let req = self.build_request(
            Method::GET,
            &[
                "v1",
                "collections",
                doc.collection.as_str(),
                "documents",
                doc.id.as_str(),
            ],
            None,
        )?;
        let res = self.execute(req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_json(res, &doc.to_string()).await.map(Some)
    }

    #[instrument(skip_all, fields(collection = %collection, keys = ids.len()))]
    async fn lookup(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, RemoteError> {
        if ids.len() > self.lookup_limit {
            return Err(RemoteError::TooManyKeys {
                requested: ids.len(),
                limit: self.lookup_limit,
            });
        }
        let body = json!({ "ids": ids });
        let req = self.build_request(
            Method::POST,
            &["v1", "collections", collection, "lookup"],
            Some(&body),
        )?;
        let res = self.execute(req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: DocumentsResponse = Self::read_json(res, collection).await?;
        Ok(parsed.documents)
    }

    #[instrument(skip_all, fields(collection = %collection))]
    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError> {
        let req = self.build_request(
            Method::GET,
            &["v1", "collections", collection, "documents"],
            None,
        )?;
        let res = self.execute(req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: DocumentsResponse = Self::read_json(res, collection).await?;
        Ok(parsed.documents)
    }

    #[instrument(skip_all, fields(writes = writes.len()))]
    async fn commit(&self, writes: Vec<Write>) -> Result<(), RemoteError> {
        if writes.len() > self.batch_limit {
            return Err(RemoteError::BatchTooLarge {
                requested: writes.len(),
                limit: self.batch_limit,
            });
        }
        let body = serde_json::to_value(CommitRequest { writes: &writes }).map_err(|err| {
            RemoteError::Malformed {
                doc: "commit".into(),
                message: err.to_string(),
            }
        })?;
        let req = self.build_request(Method::POST, &["v1", "commit"], Some(&body))?;
        let res = self.execute(req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Rejected {
                status: 404,
                message: "commit endpoint not found".into(),
            });
        }
        Ok(())
    }
}
