use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use peerlend_types::wire::{
    AddFriendRequest, BindWalletRequest, CommitRequest, ErrorCode, ErrorResponse, LoanListQuery,
    NewLoanRequest, Notification, PrepareRequest, RegisterUserRequest, UserProfile, USER_HEADER,
};
use peerlend_types::{
    LifecycleError, Loan, LoanEvent, LoanId, TransactionEnvelope, UserId, WalletBinding,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::ServiceError;
use crate::service::LoanService;

pub struct AppState {
    pub service: LoanService,
}

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/users", post(register_user))
        .route("/api/v1/users/{user_id}", get(get_user))
        .route("/api/v1/friends", post(add_friend).get(list_friends))
        .route("/api/v1/wallet", get(get_wallet))
        .route("/api/v1/wallet/bind", post(bind_wallet))
        .route("/api/v1/loans", post(create_loan).get(list_loans))
        .route("/api/v1/loans/{loan_id}", get(get_loan))
        .route("/api/v1/loans/{loan_id}/prepare", post(prepare_transaction))
        .route("/api/v1/loans/{loan_id}/commit", post(commit_transition))
        .route(
            "/api/v1/notifications",
            post(deliver_notification).get(list_notifications),
        )
        .route("/api/v1/notifications/{id}", delete(delete_notification))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// ---------------------------------------------------------------------------
// Errors and the acting user
// ---------------------------------------------------------------------------

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: ServiceError) -> ApiError {
    let status = match &err {
        ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Lifecycle(LifecycleError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        ServiceError::Lifecycle(LifecycleError::InvalidRenegotiationDate { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ServiceError::Lifecycle(_) => StatusCode::FORBIDDEN,
        ServiceError::NotConfirmed(_) => StatusCode::CONFLICT,
        ServiceError::VerificationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::Chain(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            code: err.code(),
            error: err.to_string(),
        }),
    )
}

/// The user named by the identity header. Authentication happens upstream.
pub struct Actor(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized = |msg: &str| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    code: ErrorCode::Forbidden,
                    error: msg.to_string(),
                }),
            )
        };
        let value = parts
            .headers
            .get(USER_HEADER)
            .ok_or_else(|| unauthorized("missing user header"))?
            .to_str()
            .map_err(|_| unauthorized("user header is not valid text"))?;
        UserId::new(value.trim())
            .map(Actor)
            .map_err(|_| unauthorized("user header is empty"))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn register_user(
    State(app): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    app.service
        .register_user(UserProfile {
            user_id: req.user_id,
            display_name: req.display_name,
        })
        .map(Json)
        .map_err(api_error)
}

async fn get_user(
    State(app): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    let user_id =
        UserId::new(user_id).map_err(|e| api_error(ServiceError::BadRequest(e.to_string())))?;
    app.service.user(&user_id).map(Json).map_err(api_error)
}

async fn add_friend(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<AddFriendRequest>,
) -> Result<Json<Vec<UserProfile>>, ApiError> {
    app.service
        .add_friend(&actor, &req.friend_id)
        .map(Json)
        .map_err(api_error)
}

async fn list_friends(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<Vec<UserProfile>>, ApiError> {
    app.service.friends(&actor).map(Json).map_err(api_error)
}

async fn bind_wallet(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<BindWalletRequest>,
) -> Result<Json<WalletBinding>, ApiError> {
    app.service
        .bind_wallet(&actor, req.address, Utc::now())
        .map(Json)
        .map_err(api_error)
}

async fn get_wallet(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<WalletBinding>, ApiError> {
    app.service.binding(&actor).map(Json).map_err(api_error)
}

async fn create_loan(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<NewLoanRequest>,
) -> Result<Json<Loan>, ApiError> {
    app.service
        .create_loan(&actor, &req, Utc::now())
        .map(Json)
        .map_err(api_error)
}

async fn list_loans(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Query(query): Query<LoanListQuery>,
) -> Json<Vec<Loan>> {
    Json(app.service.loans(&actor, query.role))
}

async fn get_loan(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(loan_id): Path<u64>,
) -> Result<Json<Loan>, ApiError> {
    app.service
        .loan_for(&actor, LoanId(loan_id))
        .map(Json)
        .map_err(api_error)
}

async fn prepare_transaction(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(loan_id): Path<u64>,
    Json(req): Json<PrepareRequest>,
) -> Result<Json<TransactionEnvelope>, ApiError> {
    app.service
        .prepare_transaction(&actor, LoanId(loan_id), &req.action, Utc::now())
        .map(Json)
        .map_err(api_error)
}

async fn commit_transition(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(loan_id): Path<u64>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<Loan>, ApiError> {
    app.service
        .commit_transition(&actor, LoanId(loan_id), &req.action, req.tx_hash, Utc::now())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn deliver_notification(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(event): Json<LoanEvent>,
) -> Result<Json<Notification>, ApiError> {
    app.service
        .deliver_notification(&actor, &event, Utc::now())
        .map(Json)
        .map_err(api_error)
}

async fn list_notifications(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Json<Vec<Notification>> {
    Json(app.service.notifications(&actor))
}

async fn delete_notification(
    State(app): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    app.service
        .delete_notification(&actor, id)
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(api_error)
}
