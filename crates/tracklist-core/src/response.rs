//! Outbound envelope. Success and failure share the same shape; callers tell
//! them apart by [`Status`].

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::backend::PlaylistMeta;
use crate::link::{EntityRef, Item};
use crate::request::{Field, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    NotImplemented,
    ServiceUnavailable,
    GatewayTimeout,
    Internal,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Internal => 500,
            Status::NotImplemented => 501,
            Status::ServiceUnavailable => 503,
            Status::GatewayTimeout => 504,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistView {
    pub uri: EntityRef,
    pub title: String,
    pub creator: String,
    pub collaborative: bool,
    pub items: Vec<Item>,
}

impl PlaylistView {
    pub fn new(meta: PlaylistMeta, items: Vec<Item>) -> Self {
        Self {
            uri: meta.uri,
            title: meta.title,
            creator: meta.creator,
            collaborative: meta.collaborative,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    Playlist(PlaylistView),
    Field(Map<String, Value>),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: Status,
    pub body: Body,
}

impl Response {
    pub fn playlist(view: PlaylistView) -> Self {
        Self {
            status: Status::Ok,
            body: Body::Playlist(view),
        }
    }

    pub fn field(field: Field, meta: &PlaylistMeta) -> Self {
        let value = match field {
            Field::Collaborative => Value::Bool(meta.collaborative),
            Field::Title => Value::String(meta.title.clone()),
            Field::Creator => Value::String(meta.creator.clone()),
        };
        let mut map = Map::new();
        map.insert(field.name().to_string(), value);
        Self {
            status: Status::Ok,
            body: Body::Field(map),
        }
    }

    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Body::Error {
                message: message.into(),
            },
        }
    }

    pub fn from_error(err: &RequestError) -> Self {
        Self::error(err.status(), err.to_string())
    }

    pub fn message(&self) -> Option<&str> {
        match &self.body {
            Body::Error { message } => Some(message),
            _ => None,
        }
    }

    pub fn view(&self) -> Option<&PlaylistView> {
        match &self.body {
            Body::Playlist(view) => Some(view),
            _ => None,
        }
    }
}

/// Answers exactly one request. Sending consumes the reply.
#[derive(Debug)]
pub struct Reply {
    tx: oneshot::Sender<Response>,
}

impl Reply {
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn send(self, response: Response) {
        if self.tx.send(response).is_err() {
            debug!("requester went away before the response was ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PlaylistMeta {
        PlaylistMeta {
            uri: EntityRef::parse("spotify:user:bob:playlist:road").unwrap(),
            title: "Road".into(),
            creator: "bob".into(),
            collaborative: true,
        }
    }

    #[test]
    fn playlist_body_serializes_flat() {
        let view = PlaylistView::new(meta(), vec![Item::parse("spotify:track:a1").unwrap()]);
        let json = serde_json::to_value(Response::playlist(view).body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "uri": "spotify:user:bob:playlist:road",
                "title": "Road",
                "creator": "bob",
                "collaborative": true,
                "items": ["spotify:track:a1"],
            })
        );
    }

    #[test]
    fn field_and_error_bodies() {
        let json =
            serde_json::to_string(&Response::field(Field::Collaborative, &meta()).body).unwrap();
        assert_eq!(json, r#"{"collaborative":true}"#);

        let response = Response::from_error(&RequestError::NoBody);
        assert_eq!(response.status.code(), 400);
        assert_eq!(
            serde_json::to_string(&response.body).unwrap(),
            r#"{"message":"No body"}"#
        );
    }

    #[test]
    fn reply_delivers_once() {
        let (reply, mut rx) = Reply::channel();
        reply.send(Response::error(Status::Internal, "boom"));
        let response = rx.try_recv().unwrap();
        assert_eq!(response.message(), Some("boom"));
    }

    #[test]
    fn dropped_reply_closes_the_channel() {
        let (reply, mut rx) = Reply::channel();
        drop(reply);
        assert!(rx.try_recv().is_err());
    }
}
