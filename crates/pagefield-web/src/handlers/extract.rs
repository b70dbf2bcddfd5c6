use axum::extract::{Multipart, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use pagefield_core::{JobEvent, JobStream};

use crate::error::ApiError;
use crate::models::sse_event;
use crate::state::AppState;
use crate::upload;

/// `POST /extract/stream`.
///
/// Validation and admission happen before the response starts, so a bad
/// request or bad credentials is a plain JSON error rather than a stream.
pub async fn extract_stream(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let request = upload::parse_multipart(multipart)
        .await
        .map_err(ApiError::BadRequest)?
        .into_request()?;

    let cancel = CancellationToken::new();
    let job = state.orchestrator.run(request, cancel.clone())?;

    // One slot: each event is handed to the client before the next is taken.
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(1);
    tokio::spawn(respond(job, tx, cancel, |event| Ok(sse_event(event))));

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Forward job events until the final message, or cancel the job when the
/// client goes away.
async fn respond<T>(
    mut job: JobStream,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    encode: impl Fn(&JobEvent) -> T,
) {
    loop {
        let event = tokio::select! {
            _ = tx.closed() => {
                tracing::info!("client disconnected, cancelling job");
                cancel.cancel();
                return;
            }
            event = job.next_event() => event,
        };
        let Some(event) = event else {
            return;
        };

        let is_final = event.is_final();
        if tx.send(encode(&event)).await.is_err() {
            tracing::info!("client disconnected, cancelling job");
            cancel.cancel();
            return;
        }
        if is_final {
            return;
        }
    }
}
