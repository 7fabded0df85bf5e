use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::ClientError;
use crate::types::{
    CallRequest, CallResult, InitOp, InitRequest, InteractJudgeRequest, InteractReport,
    JudgeRequest, RunReport,
};

/// Headroom added on top of a run's own limits before the HTTP request gives up.
const REQUEST_SLACK: Duration = Duration::from_secs(30);
/// Upper bound on the executor's wall clock factor.
const WALL_TIME_FACTOR: u64 = 4;

/// Operations the judging core needs from the sandbox executor.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn call(&self, req: CallRequest) -> Result<CallResult, ClientError>;
    async fn judge(&self, req: JudgeRequest) -> Result<RunReport, ClientError>;
    async fn interact_judge(&self, req: InteractJudgeRequest)
    -> Result<InteractReport, ClientError>;
}

pub struct SandboxClient {
    http: Client,
    base_url: String,
    token: String,
}

impl SandboxClient {
    /// Establishes the shared token with the executor and returns a ready client.
    pub async fn connect(config: &SandboxConfig, token_path: &Path) -> Result<Self, ClientError> {
        let http = Client::new();
        let base_url = config.url.trim_end_matches('/').to_string();
        let token = init_token(
            &http,
            &base_url,
            token_path,
            config.token.as_deref(),
            Duration::from_secs(config.init_timeout_secs),
        )
        .await?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, ClientError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, route))
            .header("token", &self.token)
            .timeout(timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn run_timeout(&self, tl_ms: u64) -> Duration {
        Duration::from_millis(tl_ms.saturating_mul(WALL_TIME_FACTOR)) + REQUEST_SLACK
    }
}

#[async_trait]
impl Sandbox for SandboxClient {
    async fn call(&self, req: CallRequest) -> Result<CallResult, ClientError> {
        let timeout = match req.timeout {
            Some(secs) => Duration::from_secs_f64(secs.max(0.0)) + REQUEST_SLACK,
            None => Duration::from_secs(3600),
        };
        self.post("call", &req, timeout).await
    }

    async fn judge(&self, req: JudgeRequest) -> Result<RunReport, ClientError> {
        let timeout = self.run_timeout(req.tl);
        self.post("judge", &req, timeout).await
    }

    async fn interact_judge(
        &self,
        req: InteractJudgeRequest,
    ) -> Result<InteractReport, ClientError> {
        let timeout = self.run_timeout(req.tl);
        self.post("interact_judge", &req, timeout).await
    }
}

/// Binds a token with the executor, or proves possession of the previously bound one.
///
/// A fixed token from configuration is checked first and bound only when the executor
/// holds none. Otherwise a
/// fresh token is offered; if the executor already holds one, the token saved in
/// `token_path` from an earlier run is checked instead. The accepted token is written
/// back to `token_path`.
pub async fn init_token(
    http: &Client,
    base_url: &str,
    token_path: &Path,
    fixed: Option<&str>,
    timeout: Duration,
) -> Result<String, ClientError> {
    let url = format!("{}/init", base_url);

    let token = if let Some(fixed) = fixed {
        if !handshake(http, &url, fixed, InitOp::Check, timeout).await? {
            // A freshly started executor has nothing bound yet.
            if !handshake(http, &url, fixed, InitOp::Init, timeout).await? {
                return Err(ClientError::Handshake(
                    "configured token was rejected".to_string(),
                ));
            }
        }
        fixed.to_string()
    } else {
        let fresh = gen_token();
        if handshake(http, &url, &fresh, InitOp::Init, timeout).await? {
            fresh
        } else {
            let saved = match tokio::fs::read_to_string(token_path).await {
                Ok(saved) => saved.trim().to_string(),
                Err(e) => {
                    warn!(path = %token_path.display(), "no saved sandbox token: {}", e);
                    return Err(ClientError::Handshake(
                        "executor already initialised and no saved token".to_string(),
                    ));
                }
            };
            if !handshake(http, &url, &saved, InitOp::Check, timeout).await? {
                return Err(ClientError::Handshake(
                    "saved token was rejected".to_string(),
                ));
            }
            saved
        }
    };

    if let Some(parent) = token_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(token_path, &token).await?;
    info!("sandbox token established");
    Ok(token)
}

async fn handshake(
    http: &Client,
    url: &str,
    token: &str,
    op: InitOp,
    timeout: Duration,
) -> Result<bool, ClientError> {
    let reply: String = http
        .post(url)
        .timeout(timeout)
        .json(&InitRequest {
            token: token.to_string(),
            op,
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(reply == "OK")
}

fn gen_token() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(44)
        .collect()
}
