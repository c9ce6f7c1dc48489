use crate::error::ApiError;
use crate::model::{
    RateRequest, RateResponse, RunConfig, RunId, StartRunRequest, StartRunResponse, TestCase,
    WireUpdate,
};
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

/// HTTP client for the benchmark server API.
#[derive(Clone)]
pub struct BenchClient {
    pub http: Client,
    base_url: Url,
    push_base: Option<Url>,
}

/// Append path segments to `base`, keeping any path prefix it already has.
fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl BenchClient {
    pub fn new(cfg: &RunConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&cfg.base_url)?;
        let push_base = cfg.push_url.as_deref().map(Url::parse).transpose()?;
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            push_base,
        })
    }

    /// Turn a server-relative URL (e.g. an image path) into an absolute one.
    pub fn resolve_url(&self, relative: &str) -> String {
        self.base_url
            .join(relative)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| relative.to_string())
    }

    /// WebSocket URL of the push channel for a run.
    pub fn push_url(&self, run_id: &RunId) -> Result<Url, ApiError> {
        let base = match &self.push_base {
            Some(base) => base.clone(),
            None => {
                let scheme = if self.base_url.scheme() == "https" {
                    "wss"
                } else {
                    "ws"
                };
                let rest = &self.base_url[url::Position::AfterScheme..];
                Url::parse(&format!("{scheme}{rest}"))?
            }
        };
        join_segments(&base, &["api", "run", run_id.as_str()])
    }

    async fn decode<T: DeserializeOwned>(
        endpoint: &str,
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = join_segments(&self.base_url, segments)?;
        debug!(url = %url, "GET");
        let resp = self.http.get(url.clone()).send().await?;
        Self::decode(url.path(), resp).await
    }

    pub async fn fetch_test_cases(&self) -> Result<Vec<TestCase>, ApiError> {
        self.get_json(&["api", "test-cases"]).await
    }

    pub async fn fetch_tools(&self) -> Result<Vec<String>, ApiError> {
        self.get_json(&["api", "tools"]).await
    }

    pub async fn start_run(
        &self,
        case_ids: &[String],
        tool_ids: &[String],
    ) -> Result<RunId, ApiError> {
        let url = join_segments(&self.base_url, &["api", "run"])?;
        let resp = self
            .http
            .post(url.clone())
            .json(&StartRunRequest { case_ids, tool_ids })
            .send()
            .await?;
        let started: StartRunResponse = Self::decode(url.path(), resp).await?;
        info!(run_id = %started.run_id, cases = case_ids.len(), tools = tool_ids.len(), "run started");
        Ok(started.run_id)
    }

    /// Full status listing for a run, one record per slot.
    pub async fn fetch_status(&self, run_id: &RunId) -> Result<Vec<WireUpdate>, ApiError> {
        self.get_json(&["api", "run", run_id.as_str(), "status"])
            .await
    }

    /// Submit a 1-5 star human rating for one run item.
    pub async fn rate(&self, run_item_id: i64, stars: u8) -> Result<(), ApiError> {
        let url = join_segments(&self.base_url, &["api", "rate"])?;
        let resp = self
            .http
            .post(url.clone())
            .json(&RateRequest { run_item_id, stars })
            .send()
            .await?;
        let body: RateResponse = Self::decode(url.path(), resp).await?;
        if body.status.as_deref() == Some("error") {
            return Err(ApiError::Rejected(
                body.message.unwrap_or_else(|| "rating rejected".into()),
            ));
        }
        Ok(())
    }

    /// Stream the generated report to `dest`. A directory gets the server's default file name.
    pub async fn download_report(&self, run_id: &RunId, dest: &Path) -> Result<PathBuf, ApiError> {
        let path = if dest.is_dir() {
            dest.join(format!("report_{run_id}.html"))
        } else {
            dest.to_path_buf()
        };

        let url = join_segments(&self.base_url, &["api", "report", run_id.as_str()])?;
        let resp = self.http.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status {
                endpoint: url.path().to_string(),
                status: resp.status(),
            });
        }

        // Stream into a sibling `.part` file; `path` only appears once the body is complete.
        let partial = partial_path(&path);
        if let Err(e) = write_body(resp, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &path).await?;
        info!(path = %path.display(), "report saved");
        Ok(path)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

async fn write_body(resp: reqwest::Response, dest: &Path) -> Result<(), ApiError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}
