//! `GET /api/v1/events`: persistent WebSocket ingestion.
//!
//! Every data frame carries one batch. Binary frames use the protobuf form
//! and text frames the JSON form; each frame is answered on the same frame
//! type. A frame that does not decode gets `BAD_REQUEST` and the loop keeps
//! reading.

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::codec::{Code, Codec, CodecError, EventResponse};
use crate::collector::CollectRequest;
use crate::connection::{Connection, ConnectionIdentity, Inbound, ReadError, TransportError};
use crate::metrics::{ReadFailure, RejectReason};

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            state.metrics.connection_rejected(RejectReason::UpgradeFailure);
            warn!(error = %rejection, "Failed to upgrade connection");
            return rejection.into_response();
        }
    };

    if state.server.check_origin && !same_origin(&headers) {
        state.metrics.connection_rejected(RejectReason::UpgradeFailure);
        warn!("Rejected cross-origin upgrade");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let identity = state.upgrader.identify(&headers);
    let failed_state = state.clone();

    ws.write_buffer_size(state.server.write_buffer_size)
        .on_failed_upgrade(move |e| {
            failed_state
                .metrics
                .connection_rejected(RejectReason::UpgradeFailure);
            warn!(error = %e, "Handshake failed");
        })
        .on_upgrade(move |socket| serve(state, socket, identity))
}

/// An absent Origin is allowed; otherwise its host must equal the Host header.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let origin_host = origin
        .to_str()
        .ok()
        .and_then(|origin| origin.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().map(|a| a.as_str().to_string()));
    let host = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok());

    match (origin_host, host) {
        (Some(origin_host), Some(host)) => origin_host.eq_ignore_ascii_case(host),
        _ => false,
    }
}

async fn serve(state: Arc<AppState>, socket: WebSocket, identity: ConnectionIdentity) {
    let Ok(mut conn) = state.upgrader.accept(socket, identity).await else {
        return;
    };

    let code = loop {
        let inbound = tokio::select! {
            inbound = conn.next_message() => inbound,
            _ = state.shutdown.triggered() => break close_code::AWAY,
        };

        let (codec, frame) = match inbound {
            Ok(Inbound::Binary(bytes)) => (Codec::Proto, bytes),
            Ok(Inbound::Text(text)) => (Codec::Json, text.into_bytes()),
            Err(e) => {
                record_read_error(&state, &conn, &e);
                break close_code::NORMAL;
            }
        };

        let response = handle_frame(&state, &conn, codec, &frame).await;
        if let Err(e) = send_response(&conn, codec, &response).await {
            warn!(
                conn_id = %conn.identity().id,
                conn_group = %conn.identity().group,
                error = %e,
                "Failed to write response"
            );
            break close_code::ERROR;
        }
    };

    info!(
        conn_id = %conn.identity().id,
        conn_group = %conn.identity().group,
        session_secs = conn.session_duration().as_secs_f64(),
        "Peer disconnected"
    );
    conn.close(code, "").await;
}

async fn handle_frame(
    state: &AppState,
    conn: &Connection,
    codec: Codec,
    frame: &[u8],
) -> EventResponse {
    let group = &conn.identity().group;
    state.metrics.bytes_read(group, frame.len());
    let request = match codec.decode_request(frame) {
        Ok(request) => request,
        Err(e) => {
            state.metrics.batch_failed(group, ReadFailure::Deserialize);
            debug!(conn_id = %conn.identity().id, error = %e, "Undecodable frame");
            return EventResponse::error(
                Code::BadRequest,
                format!("cannot deserialize request: {}", e),
            );
        }
    };

    state.metrics.batch_received(group, request.events.len());
    let req_guid = request.req_guid.clone();

    match state
        .collector
        .collect(CollectRequest::new(conn.identity().clone(), request))
        .await
    {
        Ok(()) => EventResponse::success(&req_guid),
        Err(e) => {
            warn!(conn_id = %conn.identity().id, req_guid = %req_guid, error = %e, "Batch not accepted");
            EventResponse::error(Code::InternalError, "server shutting down")
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ResponseError {
    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

async fn send_response(
    conn: &Connection,
    codec: Codec,
    response: &EventResponse,
) -> Result<(), ResponseError> {
    let bytes = codec.encode_response(response)?;
    let message = match codec {
        Codec::Proto => Message::Binary(bytes),
        Codec::Json => Message::Text(String::from_utf8_lossy(&bytes).into_owned()),
    };
    conn.send(message).await?;
    Ok(())
}

fn record_read_error(state: &AppState, conn: &Connection, error: &ReadError) {
    let identity = conn.identity();
    match error {
        ReadError::Closed(None)
        | ReadError::Closed(Some(close_code::NORMAL))
        | ReadError::Closed(Some(close_code::AWAY)) => {
            debug!(conn_id = %identity.id, conn_group = %identity.group, "Peer closed");
        }
        ReadError::Closed(Some(_)) => {
            state.metrics.batch_failed(&identity.group, ReadFailure::CloseError);
            warn!(conn_id = %identity.id, conn_group = %identity.group, error = %error, "Unexpected close");
        }
        ReadError::DeadlineExceeded | ReadError::Transport(_) => {
            state.metrics.batch_failed(&identity.group, ReadFailure::ReadError);
            warn!(conn_id = %identity.id, conn_group = %identity.group, error = %error, "Read failed");
        }
    }
}
