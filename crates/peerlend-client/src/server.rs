use std::time::Duration;

use async_trait::async_trait;
use peerlend_types::wire::{
    BindWalletRequest, CommitRequest, ErrorCode, ErrorResponse, NewLoanRequest, PrepareRequest,
    USER_HEADER,
};
use peerlend_types::{
    Address, Loan, LoanAction, LoanEvent, LoanId, TransactionEnvelope, TxHash, UserId,
    WalletBinding,
};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Per-request deadline and retry behavior.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
}

/// Retry behavior for idempotent server calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 500,
            jitter_ms: 20,
        }
    }
}

/// Loan server endpoint configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 3_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("request timed out")]
    Timeout,
    #[error("server unavailable: {0}")]
    Unavailable(String),
    #[error("transaction not confirmed yet: {0}")]
    NotConfirmed(String),
    #[error("request rejected: code={code:?}, message={message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
}

impl ServerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            Self::NotConfirmed(_) => Some(ErrorCode::NotConfirmed),
            _ => None,
        }
    }
}

/// Server-side record store and envelope authority, as seen by the coordinator.
#[async_trait]
pub trait LoanServer: Send + Sync {
    async fn prepare_transaction(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
    ) -> Result<TransactionEnvelope, ServerError>;

    /// Asks the server to verify `tx_hash` on chain and advance the loan.
    async fn commit_transition(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
        tx_hash: TxHash,
    ) -> Result<Loan, ServerError>;

    async fn bind_wallet_address(
        &self,
        user: &UserId,
        address: Address,
    ) -> Result<WalletBinding, ServerError>;

    async fn create_loan(
        &self,
        borrower: &UserId,
        request: &NewLoanRequest,
    ) -> Result<Loan, ServerError>;

    async fn get_loan(&self, actor: &UserId, loan_id: LoanId) -> Result<Loan, ServerError>;
}

/// Delivers lifecycle notices to the counterparty. Callers treat failures as non-fatal.
#[async_trait]
pub trait NotificationRelay: Send + Sync {
    async fn notify(&self, sender: &UserId, event: LoanEvent) -> Result<(), ServerError>;
}

/// REST client for the loan server. Implements both [`LoanServer`] and [`NotificationRelay`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ServerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ServerError::Unavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn meta(&self) -> RequestMeta {
        RequestMeta {
            timeout_ms: self.config.request_timeout_ms,
            retry_policy: self.config.retry_policy.clone(),
        }
    }

    async fn get<R: DeserializeOwned>(&self, actor: &UserId, path: &str) -> Result<R, ServerError> {
        let request = self
            .client
            .get(self.url(path))
            .header(USER_HEADER, actor.as_str());
        send_json(request).await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        actor: &UserId,
        path: &str,
        body: &B,
    ) -> Result<R, ServerError> {
        let request = self
            .client
            .post(self.url(path))
            .header(USER_HEADER, actor.as_str())
            .json(body);
        send_json(request).await
    }
}

#[async_trait]
impl LoanServer for HttpTransport {
    async fn prepare_transaction(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
    ) -> Result<TransactionEnvelope, ServerError> {
        let body = PrepareRequest {
            action: action.clone(),
        };
        let path = format!("/loans/{loan_id}/prepare");
        retry_with_backoff(self.meta(), || self.post(actor, &path, &body)).await
    }

    async fn commit_transition(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
        tx_hash: TxHash,
    ) -> Result<Loan, ServerError> {
        let body = CommitRequest {
            action: action.clone(),
            tx_hash,
        };
        self.post(actor, &format!("/loans/{loan_id}/commit"), &body)
            .await
    }

    async fn bind_wallet_address(
        &self,
        user: &UserId,
        address: Address,
    ) -> Result<WalletBinding, ServerError> {
        let body = BindWalletRequest { address };
        retry_with_backoff(self.meta(), || self.post(user, "/wallet/bind", &body)).await
    }

    async fn create_loan(
        &self,
        borrower: &UserId,
        request: &NewLoanRequest,
    ) -> Result<Loan, ServerError> {
        self.post(borrower, "/loans", request).await
    }

    async fn get_loan(&self, actor: &UserId, loan_id: LoanId) -> Result<Loan, ServerError> {
        let path = format!("/loans/{loan_id}");
        retry_with_backoff(self.meta(), || self.get(actor, &path)).await
    }
}

#[async_trait]
impl NotificationRelay for HttpTransport {
    async fn notify(&self, sender: &UserId, event: LoanEvent) -> Result<(), ServerError> {
        let _: serde_json::Value = self.post(sender, "/notifications", &event).await?;
        Ok(())
    }
}

async fn send_json<R: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<R, ServerError> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ServerError::InvalidResponse(e.to_string()));
    }

    let text = response.text().await.map_err(map_reqwest_error)?;
    debug!(status = status.as_u16(), body = %text, "server returned error");
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => Err(from_error_response(body)),
        Err(_) if status.is_server_error() => Err(ServerError::Unavailable(format!(
            "status {status}"
        ))),
        Err(_) => Err(ServerError::InvalidResponse(format!(
            "status {status}: {text}"
        ))),
    }
}

fn from_error_response(body: ErrorResponse) -> ServerError {
    match body.code {
        ErrorCode::NotConfirmed => ServerError::NotConfirmed(body.error),
        ErrorCode::Unavailable => ServerError::Unavailable(body.error),
        code => ServerError::Rejected {
            code,
            message: body.error,
        },
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ServerError {
    if err.is_timeout() {
        ServerError::Timeout
    } else {
        ServerError::Unavailable(err.to_string())
    }
}

pub async fn retry_with_backoff<T, F, Fut>(meta: RequestMeta, mut op: F) -> Result<T, ServerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ServerError>>,
{
    let deadline = Instant::now() + Duration::from_millis(meta.timeout_ms);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= meta.retry_policy.max_retries {
                    return Err(err);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(ServerError::Timeout);
                }

                let delay = backoff_delay_ms(attempt, &meta.retry_policy);
                attempt += 1;
                let remaining = deadline.saturating_duration_since(now).as_millis() as u64;
                if delay > remaining {
                    return Err(ServerError::Timeout);
                }
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

fn backoff_delay_ms(attempt: u32, policy: &RetryPolicy) -> u64 {
    let exp = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let capped = exp.min(policy.max_backoff_ms);
    let jitter = if policy.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    };
    capped.saturating_add(jitter)
}
