//! Newline-delimited JSON command protocol.
//!
//! Each request line names the caller's external identity and one command:
//!
//! ```text
//! {"id": 1, "caller": "auth|bob", "request": "approve", "reservation_id": "01J..."}
//! ```
//!
//! Every request gets exactly one reply line carrying `ok` plus `data` or
//! `error`. After `listen`, the connection also receives
//! `{"notification": {...}}` lines for the caller.

use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, NewPhoto, NewReservation, NewReview};
use crate::limits::MAX_LINE_LEN;
use crate::model::{Notification, PhotoKind};
use crate::notify::NotifyHub;
use crate::observability::{request_label, REQUESTS_TOTAL};

#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Correlation id echoed back in the reply.
    #[serde(default)]
    pub id: Option<Value>,
    pub caller: String,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    CreateReservation {
        tool_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default)]
        note: Option<String>,
    },
    Reschedule {
        reservation_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    Approve {
        reservation_id: Ulid,
    },
    Decline {
        reservation_id: Ulid,
        reason: String,
    },
    Cancel {
        reservation_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    ConfirmPickup {
        reservation_id: Ulid,
    },
    ConfirmReturn {
        reservation_id: Ulid,
    },
    RecordPhoto {
        reservation_id: Ulid,
        kind: PhotoKind,
        url: String,
        #[serde(default)]
        notes: Option<String>,
    },
    CreateReview {
        reservation_id: Ulid,
        rating: f64,
        #[serde(default)]
        comment: Option<String>,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    ListToolReservations {
        tool_id: Ulid,
    },
    ListMyReservations,
    BookedRanges {
        tool_id: Ulid,
    },
    ListPhotos {
        reservation_id: Ulid,
        #[serde(default)]
        kind: Option<PhotoKind>,
    },
    ListReviews {
        user_id: Ulid,
    },
    Reputation {
        user_id: Ulid,
    },
    Notifications,
    MarkRead {
        notification_id: Ulid,
    },
    Listen,
    Unlisten,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub status: u16,
    pub message: String,
}

impl ErrorBody {
    fn bad_request(message: String) -> Self {
        Self {
            kind: "BadRequest".into(),
            status: 400,
            message,
        }
    }

    fn internal(message: String) -> Self {
        Self {
            kind: "Internal".into(),
            status: 500,
            message,
        }
    }
}

impl From<EngineError> for ErrorBody {
    fn from(e: EngineError) -> Self {
        Self {
            kind: e.kind().into(),
            status: e.status_code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn from_result(id: Option<Value>, result: Result<Value, ErrorBody>) -> Self {
        match result {
            Ok(data) => Self {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                id,
                ok: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Serialize)]
struct Push<'a> {
    notification: &'a Notification,
}

/// Live notification feed bound to one user.
struct Listener {
    user_id: Ulid,
    rx: broadcast::Receiver<Notification>,
}

enum Input {
    Line(Option<Result<String, LinesCodecError>>),
    Pushed(Result<Notification, broadcast::error::RecvError>),
}

async fn next_notification(
    listener: &mut Option<Listener>,
) -> Result<Notification, broadcast::error::RecvError> {
    match listener {
        Some(l) => l.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>, hub: Arc<NotifyHub>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut listener: Option<Listener> = None;

    loop {
        let input = tokio::select! {
            line = framed.next() => Input::Line(line),
            pushed = next_notification(&mut listener) => Input::Pushed(pushed),
        };

        match input {
            Input::Line(None) => break,
            Input::Line(Some(Err(LinesCodecError::Io(e)))) => return Err(e),
            Input::Line(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let reply = Reply::from_result(None, Err(ErrorBody::bad_request("request line too long".into())));
                framed.send(encode(&reply)?).await.map_err(codec_err)?;
            }
            Input::Line(Some(Ok(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&engine, &hub, &line, &mut listener).await;
                framed.send(encode(&reply)?).await.map_err(codec_err)?;
            }
            Input::Pushed(Ok(notification)) => {
                let push = Push {
                    notification: &notification,
                };
                framed.send(encode(&push)?).await.map_err(codec_err)?;
            }
            Input::Pushed(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!("listener lagged, {skipped} notifications skipped");
            }
            Input::Pushed(Err(broadcast::error::RecvError::Closed)) => {
                listener = None;
            }
        }
    }

    release_listener(&hub, &mut listener);
    Ok(())
}

/// Drop the connection's feed and the user's channel if it was the last one.
fn release_listener(hub: &NotifyHub, listener: &mut Option<Listener>) {
    if let Some(l) = listener.take() {
        let user_id = l.user_id;
        drop(l);
        hub.prune(&user_id);
    }
}

fn encode<T: Serialize>(value: &T) -> io::Result<String> {
    serde_json::to_string(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

/// Parse and execute one request line.
async fn handle_line(
    engine: &Engine,
    hub: &NotifyHub,
    line: &str,
    listener: &mut Option<Listener>,
) -> Reply {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Reply::from_result(None, Err(ErrorBody::bad_request(format!("malformed request: {e}"))));
        }
    };
    let label = request_label(&envelope.request);
    metrics::counter!(REQUESTS_TOTAL, "request" => label).increment(1);
    debug!("{label} from {}", envelope.caller);

    let result = execute(engine, hub, &envelope.caller, envelope.request, listener).await;
    Reply::from_result(envelope.id, result)
}

fn to_json<T: Serialize>(value: T) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| ErrorBody::internal(e.to_string()))
}

async fn execute(
    engine: &Engine,
    hub: &NotifyHub,
    caller: &str,
    request: Request,
    listener: &mut Option<Listener>,
) -> Result<Value, ErrorBody> {
    match request {
        Request::CreateReservation {
            tool_id,
            start_date,
            end_date,
            note,
        } => {
            let request = NewReservation {
                tool_id,
                start_date,
                end_date,
                note,
            };
            to_json(engine.create_reservation(caller, request).await?)
        }
        Request::Reschedule {
            reservation_id,
            start_date,
            end_date,
        } => to_json(
            engine
                .reschedule(caller, reservation_id, start_date, end_date)
                .await?,
        ),
        Request::Approve { reservation_id } => to_json(engine.approve(caller, reservation_id).await?),
        Request::Decline {
            reservation_id,
            reason,
        } => to_json(engine.decline(caller, reservation_id, reason).await?),
        Request::Cancel {
            reservation_id,
            reason,
        } => to_json(engine.cancel(caller, reservation_id, reason).await?),
        Request::ConfirmPickup { reservation_id } => {
            to_json(engine.confirm_pickup(caller, reservation_id).await?)
        }
        Request::ConfirmReturn { reservation_id } => {
            to_json(engine.confirm_return(caller, reservation_id).await?)
        }
        Request::RecordPhoto {
            reservation_id,
            kind,
            url,
            notes,
        } => {
            let photo = NewPhoto { kind, url, notes };
            to_json(engine.record_photo(caller, reservation_id, photo).await?)
        }
        Request::CreateReview {
            reservation_id,
            rating,
            comment,
        } => {
            let review = NewReview { rating, comment };
            to_json(engine.create_review(caller, reservation_id, review).await?)
        }
        Request::GetReservation { reservation_id } => {
            to_json(engine.get_reservation(caller, reservation_id).await?)
        }
        Request::ListToolReservations { tool_id } => {
            to_json(engine.list_reservations_for_tool(caller, tool_id).await?)
        }
        Request::ListMyReservations => to_json(engine.list_my_reservations(caller).await?),
        Request::BookedRanges { tool_id } => to_json(engine.booked_ranges(caller, tool_id).await?),
        Request::ListPhotos {
            reservation_id,
            kind,
        } => to_json(engine.list_photos(caller, reservation_id, kind).await?),
        Request::ListReviews { user_id } => to_json(engine.list_reviews_for(caller, user_id).await?),
        Request::Reputation { user_id } => to_json(engine.reputation_of(caller, user_id).await?),
        Request::Notifications => {
            let user = engine.resolve_caller(caller).await?;
            to_json(hub.inbox(&user.id))
        }
        Request::MarkRead { notification_id } => {
            let user = engine.resolve_caller(caller).await?;
            if !hub.mark_read(&user.id, &notification_id) {
                return Err(EngineError::NotFound(notification_id).into());
            }
            Ok(Value::Bool(true))
        }
        Request::Listen => {
            let user = engine.resolve_caller(caller).await?;
            release_listener(hub, listener);
            *listener = Some(Listener {
                user_id: user.id,
                rx: hub.subscribe(user.id),
            });
            Ok(Value::Bool(true))
        }
        Request::Unlisten => {
            release_listener(hub, listener);
            Ok(Value::Bool(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_envelope_with_flattened_request() {
        let rid = Ulid::new();
        let line = json!({
            "id": 7,
            "caller": "auth|owner",
            "request": "decline",
            "reservation_id": rid.to_string(),
            "reason": "Tool under maintenance",
        })
        .to_string();
        let env: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(env.id, Some(json!(7)));
        assert_eq!(env.caller, "auth|owner");
        assert_eq!(
            env.request,
            Request::Decline {
                reservation_id: rid,
                reason: "Tool under maintenance".into(),
            }
        );
    }

    #[test]
    fn parse_unit_and_optional_fields() {
        let env: Envelope =
            serde_json::from_str(r#"{"caller":"auth|a","request":"list_my_reservations"}"#).unwrap();
        assert_eq!(env.request, Request::ListMyReservations);

        let tid = Ulid::new();
        let env: Envelope = serde_json::from_str(&format!(
            r#"{{"caller":"auth|a","request":"create_reservation","tool_id":"{tid}","start_date":"2026-05-01","end_date":"2026-05-03"}}"#
        ))
        .unwrap();
        assert!(matches!(
            env.request,
            Request::CreateReservation { note: None, .. }
        ));
    }

    #[test]
    fn review_rating_accepts_integers_and_fractions() {
        let rid = Ulid::new();
        for (raw, expected) in [("4", 4.0), ("4.5", 4.5)] {
            let env: Envelope = serde_json::from_str(&format!(
                r#"{{"caller":"auth|a","request":"create_review","reservation_id":"{rid}","rating":{raw}}}"#
            ))
            .unwrap();
            match env.request {
                Request::CreateReview { rating, .. } => assert_eq!(rating, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_request_is_rejected() {
        let parsed = serde_json::from_str::<Envelope>(r#"{"caller":"a","request":"teleport"}"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn unknown_caller_gets_error_reply() {
        use crate::clock::SystemClock;
        use crate::store::{Collaborators, InMemoryStore};

        let hub = Arc::new(NotifyHub::new());
        let collab = Collaborators::in_memory(Arc::new(InMemoryStore::new()), hub.clone());
        let engine = Arc::new(Engine::new(collab, Arc::new(SystemClock)));

        let socket = tokio_test::io::Builder::new()
            .read(b"{\"id\":3,\"caller\":\"auth|ghost\",\"request\":\"notifications\"}\n")
            .write(
                b"{\"id\":3,\"ok\":false,\"error\":{\"kind\":\"NotAuthorized\",\"status\":403,\
                  \"message\":\"not authorized: unknown caller\"}}\n",
            )
            .build();
        process_connection(socket, engine, hub).await.unwrap();
    }

    #[tokio::test]
    async fn relisten_as_another_user_releases_previous_channel() {
        use crate::clock::SystemClock;
        use crate::model::UserProfile;
        use crate::store::{Collaborators, InMemoryStore};

        let store = Arc::new(InMemoryStore::new());
        let mut ids = Vec::new();
        for external_id in ["auth|ann", "auth|ben"] {
            let user = UserProfile {
                id: Ulid::new(),
                external_id: external_id.into(),
                display_name: None,
            };
            ids.push(user.id);
            store.upsert_user(user).await.unwrap();
        }
        let hub = Arc::new(NotifyHub::new());
        let engine = Engine::new(Collaborators::in_memory(store, hub.clone()), Arc::new(SystemClock));
        let mut listener = None;

        let reply = handle_line(&engine, &hub, r#"{"caller":"auth|ann","request":"listen"}"#, &mut listener).await;
        assert!(reply.ok);
        assert!(hub.has_channel(&ids[0]));

        let reply = handle_line(&engine, &hub, r#"{"caller":"auth|ben","request":"listen"}"#, &mut listener).await;
        assert!(reply.ok);
        assert!(!hub.has_channel(&ids[0]));
        assert!(hub.has_channel(&ids[1]));

        handle_line(&engine, &hub, r#"{"caller":"auth|ben","request":"unlisten"}"#, &mut listener).await;
        assert!(!hub.has_channel(&ids[1]));
        assert!(listener.is_none());
    }

    #[test]
    fn reply_shape() {
        let ok = Reply::from_result(Some(json!("x")), Ok(json!({"status": "pending"})));
        let text = serde_json::to_string(&ok).unwrap();
        assert_eq!(text, r#"{"id":"x","ok":true,"data":{"status":"pending"}}"#);

        let err = Reply::from_result(None, Err(EngineError::DuplicateReview.into()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["kind"], json!("DuplicateReview"));
        assert_eq!(value["error"]["status"], json!(409));
        assert!(value.get("data").is_none());
    }
}
