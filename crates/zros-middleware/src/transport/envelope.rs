//! Wire envelopes carried inside transport frames.
//!
//! | Envelope | Parts |
//! |---|---|
//! | message | `[topic, payload]` |
//! | request | `[correlation id (16 bytes), service, payload]` |
//! | reply | `[correlation id (16 bytes), status, payload]` |
//!
//! Reply status is `0` for success and `1` for a handler failure, in which
//! case the payload is a UTF-8 error message.  A message with an empty
//! payload is a heartbeat.

use uuid::Uuid;
use zros_types::Pattern;

use super::{Frame, LinkError};

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Message { topic: String, payload: Vec<u8> },
    Request { id: Uuid, service: String, payload: Vec<u8> },
    Reply { id: Uuid, outcome: Result<Vec<u8>, String> },
}

impl Envelope {
    pub fn heartbeat() -> Self {
        Envelope::Message { topic: String::new(), payload: Vec::new() }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Envelope::Message { payload, .. } if payload.is_empty())
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Envelope::Message { topic, payload } => vec![topic.into_bytes(), payload],
            Envelope::Request { id, service, payload } => {
                vec![id.as_bytes().to_vec(), service.into_bytes(), payload]
            }
            Envelope::Reply { id, outcome } => match outcome {
                Ok(payload) => vec![id.as_bytes().to_vec(), vec![STATUS_OK], payload],
                Err(reason) => vec![id.as_bytes().to_vec(), vec![STATUS_ERR], reason.into_bytes()],
            },
        }
    }

    /// Parse a frame received by an endpoint of `pattern`.
    pub fn from_frame(pattern: Pattern, frame: Frame) -> Result<Self, LinkError> {
        let mut parts = frame.into_iter();
        let mut next = |what: &str| {
            parts
                .next()
                .ok_or_else(|| LinkError::Protocol(format!("missing {what} part")))
        };
        let envelope = match pattern {
            Pattern::Sub | Pattern::Pull => Envelope::Message {
                topic: utf8(next("topic")?, "topic")?,
                payload: next("payload")?,
            },
            Pattern::Rep => Envelope::Request {
                id: correlation_id(next("correlation id")?)?,
                service: utf8(next("service")?, "service")?,
                payload: next("payload")?,
            },
            Pattern::Req => {
                let id = correlation_id(next("correlation id")?)?;
                let status = next("status")?;
                let payload = next("payload")?;
                let outcome = match status.as_slice() {
                    [STATUS_OK] => Ok(payload),
                    [STATUS_ERR] => Err(String::from_utf8_lossy(&payload).into_owned()),
                    _ => return Err(LinkError::Protocol("bad reply status".to_string())),
                };
                Envelope::Reply { id, outcome }
            }
            Pattern::Pub | Pattern::Push => {
                return Err(LinkError::Protocol(format!("{pattern} endpoints do not receive")));
            }
        };
        if parts.next().is_some() {
            return Err(LinkError::Protocol("trailing frame parts".to_string()));
        }
        Ok(envelope)
    }
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String, LinkError> {
    String::from_utf8(bytes).map_err(|_| LinkError::Protocol(format!("{what} is not UTF-8")))
}

fn correlation_id(bytes: Vec<u8>) -> Result<Uuid, LinkError> {
    Uuid::from_slice(&bytes).map_err(|_| LinkError::Protocol("correlation id must be 16 bytes".to_string()))
}
