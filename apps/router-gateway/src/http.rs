use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use router_common::RouterError;
use router_engine::Dispatcher;
use router_provider::{
    ChatPayload, EmbeddingPayload, ImageGenPayload, ResponsesPayload, SpeechPayload,
    TextCompletionPayload, TypedRequest,
};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

/// The demonstration HTTP front end: classifies each inbound call into a
/// `TypedRequest` and hands it to the `Dispatcher`. Intentionally thin —
/// one route per unary op plus one streaming example, not a full REST
/// surface.
pub fn app(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/v1/chat", post(chat))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/text", post(text_completion))
        .route("/v1/responses", post(responses))
        .route("/v1/embedding", post(embedding))
        .route("/v1/speech", post(speech))
        .route("/v1/image", post(image_gen))
        .route("/v1/models", get(list_models))
        .with_state(dispatcher)
}

fn router_error_response(err: RouterError) -> Response {
    let status = err
        .status_code
        .and_then(|s| axum::http::StatusCode::from_u16(s).ok())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    let body = json!({
        "error": {
            "kind": err.kind,
            "message": err.message,
            "cause": err.cause,
            "provider": err.extra.provider,
            "model_requested": err.extra.model_requested,
        }
    });
    (status, Json(body)).into_response()
}

async fn chat(State(dispatcher): State<Arc<Dispatcher>>, Json(payload): Json<ChatPayload>) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::Chat(payload)).await
}

async fn text_completion(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<TextCompletionPayload>,
) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::TextCompletion(payload)).await
}

async fn responses(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<ResponsesPayload>,
) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::Responses(payload)).await
}

async fn embedding(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<EmbeddingPayload>,
) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::Embedding(payload)).await
}

async fn speech(State(dispatcher): State<Arc<Dispatcher>>, Json(payload): Json<SpeechPayload>) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::Speech(payload)).await
}

async fn image_gen(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<ImageGenPayload>,
) -> Response {
    dispatch_unary(&dispatcher, TypedRequest::ImageGen(payload)).await
}

async fn dispatch_unary(dispatcher: &Dispatcher, request: TypedRequest) -> Response {
    match dispatcher.dispatch_unary(None, request).await {
        Ok(resp) => Json(resp.payload).into_response(),
        Err(err) => router_error_response(err),
    }
}

/// The one streaming route: chat completions delivered as Server-Sent
/// Events, one `StreamEvent` per SSE event. A terminal error is sent as
/// a final `event: error` rather than ending the HTTP stream abruptly —
/// streams deliver an error as a terminal chunk, never a bare
/// disconnect.
async fn chat_stream(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<ChatPayload>,
) -> Response {
    let receiver = match dispatcher.dispatch_stream(None, TypedRequest::ChatStream(payload)).await {
        Ok(rx) => rx,
        Err(err) => return router_error_response(err),
    };

    let events = ReceiverStream::new(receiver).map(|chunk| {
        let event = if let Some(err) = chunk.error {
            Event::default().event("error").json_data(json!({
                "kind": err.kind,
                "message": err.message,
            }))
        } else {
            Event::default().json_data(json!({
                "index": chunk.index,
                "payload": chunk.payload,
                "finish_reason": chunk.finish_reason,
            }))
        };
        Ok::<_, std::convert::Infallible>(event.unwrap_or_else(|_| Event::default().data("encode error")))
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn list_models(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    let aggregated = dispatcher.list_all_models().await;
    Json(json!({
        "models": aggregated.models,
        "latency_ms": aggregated.latency.as_millis(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_falls_back_to_bad_gateway_without_a_status() {
        let err = RouterError::new(router_common::ErrorKind::ProviderNetworkError, "boom");
        let resp = router_error_response(err);
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_response_uses_the_carried_status_when_present() {
        let err = RouterError::new(router_common::ErrorKind::ProviderApiError, "boom").with_status(429);
        let resp = router_error_response(err);
        assert_eq!(resp.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }
}
