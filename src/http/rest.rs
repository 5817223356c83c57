//! `POST /api/v1/events`: a single batch per request.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::AppState;
use crate::codec::{Code, Codec, EventResponse};
use crate::collector::CollectRequest;
use crate::connection::ConnectionIdentity;
use crate::metrics::ReadFailure;

pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = Codec::from_content_type(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
    );
    let identity = ConnectionIdentity::from_headers(
        &headers,
        &state.server.conn_id_header,
        &state.server.conn_group_header,
    );

    if body.is_empty() {
        state.metrics.batch_failed(&identity.group, ReadFailure::EmptyBody);
        debug!(conn_group = %identity.group, "Rejected empty body");
        return respond(
            codec,
            StatusCode::BAD_REQUEST,
            EventResponse::error(Code::BadRequest, "no body present"),
        );
    }

    state.metrics.bytes_read(&identity.group, body.len());
    let request = match codec.decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            state.metrics.batch_failed(&identity.group, ReadFailure::Deserialize);
            debug!(conn_group = %identity.group, error = %e, "Rejected undecodable body");
            return respond(
                codec,
                StatusCode::BAD_REQUEST,
                EventResponse::error(Code::BadRequest, "deserialization failure"),
            );
        }
    };

    state
        .metrics
        .batch_received(&identity.group, request.events.len());
    debug!(
        conn_group = %identity.group,
        req_guid = %request.req_guid,
        events = request.events.len(),
        bytes = body.len(),
        "Batch received"
    );

    let req_guid = request.req_guid.clone();
    if let Err(e) = state
        .collector
        .collect(CollectRequest::new(identity, request))
        .await
    {
        warn!(req_guid = %req_guid, error = %e, "Batch not accepted");
        return respond(
            codec,
            StatusCode::INTERNAL_SERVER_ERROR,
            EventResponse::error(Code::InternalError, "server shutting down"),
        );
    }

    respond(codec, StatusCode::OK, EventResponse::success(&req_guid))
}

fn respond(codec: Codec, status: StatusCode, response: EventResponse) -> Response {
    match codec.encode_response(&response) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, codec.content_type())], bytes).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
