//! Simple REST API server example for the credit ledger.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /accounts` - Open an account (optionally with initial balance and operations)
//! - `GET /accounts` - List accounts visible to the session (`x-role`, `x-organization-id` headers)
//! - `GET /accounts/{id}` - Get an account with its operations
//! - `GET /accounts/{id}/summary` - Per-status totals
//! - `GET /accounts/{id}/history` - Operations, optionally bounded by `from`/`to`
//! - `DELETE /accounts/{id}` - Soft-delete an account
//! - `POST /operations` - Apply operations to a resolved account
//! - `POST /operations/remove` - Record removals
//! - `PATCH /operations/{id}` - Correct an operation
//! - `DELETE /operations/{id}?actor_id=` - Soft-delete an operation
//! - `POST /transfers` - Move credits between accounts
//!
//! ## Example Usage
//!
//! ```bash
//! # Open an account
//! curl -X POST http://localhost:3000/accounts \
//!   -H "Content-Type: application/json" \
//!   -d '{"managing_agency_id": "<uuid>", "client_organization_id": "<uuid>"}'
//!
//! # Buy credits, lazily creating the account if needed
//! curl -X POST http://localhost:3000/operations \
//!   -H "Content-Type: application/json" \
//!   -d '{"client_organization_id": "<uuid>", "managing_agency_id": "<uuid>",
//!        "operations": [{"actor_id": "<uuid>", "status": "purchased", "quantity": 100}]}'
//!
//! # List as the agency
//! curl http://localhost:3000/accounts -H "x-role: agency_owner" -H "x-organization-id: <uuid>"
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use credit_ledger::{
    AccountId, AccountLookup, AccountView, ActorId, ApplyOperationsRequest, BalanceSummary,
    CorrectOperationRequest, CreateAccountRequest, LedgerConfig, LedgerError, LedgerOperation,
    LedgerService, OperationId, OperationStatus, OrganizationId, Page, PaginationConfig,
    RemoveOperationsRequest, SessionContext, StorageError, TransferOutcome, TransferRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

// === Request/Response DTOs ===

/// Body of `PATCH /operations/{id}`.
#[derive(Debug, Deserialize)]
pub struct CorrectionBody {
    pub actor_id: ActorId,
    pub quantity: Option<i64>,
    pub status: Option<OperationStatus>,
    pub description: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub actor_id: ActorId,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the ledger service.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerService>,
}

// === Error Handling ===

/// Wrapper for converting `LedgerError` into HTTP responses.
pub struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LedgerError::InvalidBalance(_) => (StatusCode::BAD_REQUEST, "INVALID_BALANCE"),
            LedgerError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            LedgerError::OperationNotFound(_) => (StatusCode::NOT_FOUND, "OPERATION_NOT_FOUND"),
            LedgerError::AgencyIdRequired => (StatusCode::BAD_REQUEST, "AGENCY_ID_REQUIRED"),
            LedgerError::MissingAccountReference => {
                (StatusCode::BAD_REQUEST, "MISSING_ACCOUNT_REFERENCE")
            }
            LedgerError::InvalidOperation(_) => (StatusCode::BAD_REQUEST, "INVALID_OPERATION"),
            LedgerError::InsufficientBalance { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            LedgerError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            LedgerError::BalanceDrift { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "BALANCE_DRIFT"),
            LedgerError::Storage(StorageError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            LedgerError::Storage(StorageError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            LedgerError::Storage(StorageError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Reads the caller's role and organization from request headers.
fn session(headers: &HeaderMap) -> Result<SessionContext, AppError> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let role = header("x-role").unwrap_or_default();
    let organization_id = header("x-organization-id")
        .and_then(|value| value.parse::<OrganizationId>().ok())
        .ok_or_else(|| LedgerError::Forbidden("missing or invalid x-organization-id".to_string()))?;
    Ok(SessionContext::new(role, organization_id))
}

// === Handlers ===

/// POST /accounts - Open an account.
async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountView>), AppError> {
    let view = state.ledger.create_account(request)?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /accounts - List accounts visible to the session.
async fn list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pagination): Query<PaginationConfig>,
) -> Result<Json<Page<AccountView>>, AppError> {
    let session = session(&headers)?;
    Ok(Json(state.ledger.list(pagination, &session)?))
}

/// GET /accounts/{id} - Get an account with its operations.
async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<AccountId>,
) -> Result<Json<AccountView>, AppError> {
    Ok(Json(state.ledger.get(AccountLookup::Id(id))?))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<AccountId>,
) -> Result<Json<BalanceSummary>, AppError> {
    Ok(Json(state.ledger.get_summary(id)?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<AccountId>,
    Query(range): Query<HistoryQuery>,
) -> Result<Json<Vec<LedgerOperation>>, AppError> {
    Ok(Json(state.ledger.get_history(id, range.from, range.to)?))
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<AccountId>,
) -> Result<StatusCode, AppError> {
    state.ledger.delete_account(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /operations - Apply operations.
async fn apply_operations(
    State(state): State<AppState>,
    Json(request): Json<ApplyOperationsRequest>,
) -> Result<(StatusCode, Json<AccountView>), AppError> {
    let view = state.ledger.apply_operations(request)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn remove_operations(
    State(state): State<AppState>,
    Json(request): Json<RemoveOperationsRequest>,
) -> Result<(StatusCode, Json<AccountView>), AppError> {
    let view = state.ledger.remove_operations(request)?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// PATCH /operations/{id} - Correct an operation.
async fn correct_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Json(body): Json<CorrectionBody>,
) -> Result<Json<AccountView>, AppError> {
    let request = CorrectOperationRequest {
        operation_id: id,
        actor_id: body.actor_id,
        quantity: body.quantity,
        status: body.status,
        description: body.description,
        metadata: body.metadata,
    };
    Ok(Json(state.ledger.correct_operation(request)?))
}

async fn delete_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<AccountView>, AppError> {
    Ok(Json(state.ledger.delete_operation(id, query.actor_id)?))
}

/// POST /transfers - Move credits between two accounts.
async fn transfer_credits(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferOutcome>), AppError> {
    let outcome = state.ledger.transfer_credits(request)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/{id}", get(get_account).delete(delete_account))
        .route("/accounts/{id}/summary", get(get_summary))
        .route("/accounts/{id}/history", get(get_history))
        .route("/operations", post(apply_operations))
        .route("/operations/remove", post(remove_operations))
        .route("/operations/{id}", patch(correct_operation).delete(delete_operation))
        .route("/transfers", post(transfer_credits))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("credit_ledger=info")),
        )
        .init();

    let config = LedgerConfig::load(None)?;
    let state = AppState {
        ledger: Arc::new(LedgerService::with_config(config)),
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    info!(address = "http://127.0.0.1:3000", "credit ledger API listening");

    axum::serve(listener, app).await?;
    Ok(())
}
