use axum::Json;
use axum::extract::State;
use std::sync::Arc;

use pagefield_core::{
    Authorizer, ContributorStats, Credentials, HistoryFilter, HistoryStats, Principal,
    SqliteHistory,
};

use crate::error::ApiError;
use crate::models::{
    ContributorStatsResponse, ContributorsResponse, CredentialsBody, HistoryRequest,
    HistoryResponse,
};
use crate::state::AppState;

/// Run a blocking history query off the async runtime.
async fn query<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteHistory) -> Result<T, pagefield_core::HistoryError> + Send + 'static,
{
    let history = Arc::clone(&state.history);
    Ok(tokio::task::spawn_blocking(move || f(&history)).await??)
}

fn authenticate(state: &AppState, credentials: Credentials) -> Result<Principal, ApiError> {
    state
        .authorizer
        .authenticate(&credentials)
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".into()))
}

/// `GET /contributors`
pub async fn contributors(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ContributorsResponse>, ApiError> {
    let users = query(&state, |h| h.contributors()).await?;
    Ok(Json(ContributorsResponse { users }))
}

/// `POST /history`: admins may pick any contributor; everyone else gets
/// their own rows.
pub async fn history(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HistoryRequest>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let principal = authenticate(&state, req.credentials.into())?;
    let filter = HistoryFilter::for_principal(&principal, req.target_username.as_deref());
    tracing::debug!(user = %principal.username, ?filter, "history requested");
    let history = query(&state, move |h| h.summaries(&filter)).await?;
    Ok(Json(HistoryResponse { history }))
}

/// `GET /stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<HistoryStats>, ApiError> {
    Ok(Json(query(&state, |h| h.stats()).await?))
}

/// `POST /stats/contributors` (admin only)
pub async fn contributor_stats(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<ContributorStatsResponse>, ApiError> {
    let principal = state
        .authorizer
        .authenticate(&body.into())
        .filter(|p| p.admin)
        .ok_or_else(|| ApiError::Forbidden("Only admin can access user statistics".into()))?;
    tracing::debug!(user = %principal.username, "contributor stats requested");
    let user_statistics = query(&state, |h| h.contributor_stats()).await?;
    Ok(Json(ContributorStatsResponse { user_statistics }))
}

/// `POST /stats/self`
pub async fn self_stats(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<ContributorStats>, ApiError> {
    let principal = authenticate(&state, body.into())?;
    let stat = query(&state, move |h| h.contributor_stat(&principal.username)).await?;
    Ok(Json(stat))
}
