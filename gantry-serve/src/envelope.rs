//! The JSON envelope exchanged with the evaluator and its validated,
//! decoded form.
//!
//! Request envelopes carry the call's header metadata plus either a single
//! `request` payload or a `stream` array (client-streaming batches).
//! Response envelopes carry optional `header`/`trailer` maps and exactly one
//! of `response`, `stream`, or a terminal `status`; a streaming method may
//! omit `stream` to send nothing. Payloads are serialized
//! with default-valued fields emitted, so scripts see every field the
//! descriptor declares.

use std::collections::BTreeMap;

use prost_reflect::{DynamicMessage, MethodDescriptor, SerializeOptions};
use serde::{Deserialize, Serialize};
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tonic::Status;

/// Metadata as seen by the evaluator: a map of key to values. Scripts may
/// write a single string instead of a one-element array.
pub type Metadata = BTreeMap<String, Vec<String>>;

pub(crate) enum InputPayload {
    Request(DynamicMessage),
    Stream(Vec<DynamicMessage>),
}

#[derive(Serialize)]
struct InputEnvelope<'a> {
    header: &'a Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<Vec<serde_json::Value>>,
}

pub(crate) fn make_input(header: &Metadata, payload: InputPayload) -> Result<String, Status> {
    let envelope = match payload {
        InputPayload::Request(msg) => InputEnvelope {
            header,
            request: Some(to_json(&msg)?),
            stream: None,
        },
        InputPayload::Stream(msgs) => InputEnvelope {
            header,
            request: None,
            stream: Some(msgs.iter().map(to_json).collect::<Result<_, _>>()?),
        },
    };
    serde_json::to_string(&envelope)
        .map_err(|err| Status::internal(format!("marshal request envelope: {err}")))
}

fn to_json(msg: &DynamicMessage) -> Result<serde_json::Value, Status> {
    let options = SerializeOptions::new().skip_default_fields(false);
    msg.serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|err| Status::internal(format!("marshal request message: {err}")))
}

#[derive(Deserialize)]
struct OutputEnvelope {
    #[serde(default, deserialize_with = "de_metadata")]
    header: Metadata,
    #[serde(default, deserialize_with = "de_metadata")]
    trailer: Metadata,
    #[serde(default)]
    response: Option<serde_json::Value>,
    #[serde(default)]
    stream: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    status: Option<ErrorStatus>,
}

/// A terminal status produced by the evaluator.
#[derive(Clone, Debug, Deserialize)]
pub struct ErrorStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<serde_json::Value>,
}

impl ErrorStatus {
    pub fn code(&self) -> tonic::Code {
        tonic::Code::from(self.code)
    }

    /// Builds the terminal `Status`, folding header and trailer metadata in
    /// so clients can still read custom metadata on a failed call.
    pub(crate) fn into_status(self, header: &Metadata, trailer: &Metadata) -> Status {
        let mut metadata = MetadataMap::new();
        apply_metadata(header, &mut metadata);
        apply_metadata(trailer, &mut metadata);
        Status::with_metadata(tonic::Code::from(self.code), self.message, metadata)
    }
}

/// The validated, decoded form of a response envelope.
#[derive(Debug)]
pub struct MethodReply {
    pub header: Metadata,
    pub trailer: Metadata,
    pub payload: ReplyPayload,
}

#[derive(Debug)]
pub enum ReplyPayload {
    Message(DynamicMessage),
    Stream(Vec<DynamicMessage>),
    Status(ErrorStatus),
}

/// Parses and validates an evaluator reply for `method`. Shape violations
/// fail the call rather than being papered over.
pub(crate) fn parse_output(method: &MethodDescriptor, json: &str) -> Result<MethodReply, Status> {
    let envelope: OutputEnvelope = serde_json::from_str(json)
        .map_err(|err| Status::internal(format!("invalid response envelope: {err}")))?;

    let payload = match (envelope.status, envelope.response, envelope.stream) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            return Err(Status::internal(
                "response envelope sets status alongside a payload",
            ))
        }
        (Some(status), None, None) => ReplyPayload::Status(status),
        (None, Some(_), Some(_)) => {
            return Err(Status::internal(
                "response envelope sets both response and stream",
            ))
        }
        (None, Some(value), None) => {
            if method.is_server_streaming() {
                return Err(Status::internal(
                    "server-streaming method must reply with stream, not response",
                ));
            }
            ReplyPayload::Message(from_json(method, value)?)
        }
        (None, None, Some(values)) => {
            if !method.is_server_streaming() {
                return Err(Status::internal(
                    "non-streaming method must reply with response, not stream",
                ));
            }
            ReplyPayload::Stream(
                values
                    .into_iter()
                    .map(|v| from_json(method, v))
                    .collect::<Result<_, _>>()?,
            )
        }
        (None, None, None) => {
            // A streaming reply may simply have nothing to say.
            if method.is_server_streaming() {
                ReplyPayload::Stream(Vec::new())
            } else {
                return Err(Status::internal(
                    "response envelope has no response, stream, or status",
                ));
            }
        }
    };

    Ok(MethodReply {
        header: envelope.header,
        trailer: envelope.trailer,
        payload,
    })
}

fn from_json(method: &MethodDescriptor, value: serde_json::Value) -> Result<DynamicMessage, Status> {
    DynamicMessage::deserialize(method.output(), value)
        .map_err(|err| Status::internal(format!("invalid response message: {err}")))
}

fn de_metadata<'de, D>(de: D) -> Result<Metadata, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    let raw = BTreeMap::<String, OneOrMany>::deserialize(de)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let values = match v {
                OneOrMany::One(s) => vec![s],
                OneOrMany::Many(vs) => vs,
            };
            (k, values)
        })
        .collect())
}

/// Request metadata as an envelope map. Binary (`-bin`) and non-ASCII
/// values have no JSON representation here and are skipped.
pub(crate) fn metadata_to_map(meta: &MetadataMap) -> Metadata {
    let mut out = Metadata::new();
    for kv in meta.iter() {
        match kv {
            KeyAndValueRef::Ascii(key, value) => match value.to_str() {
                Ok(v) => out
                    .entry(key.as_str().to_owned())
                    .or_default()
                    .push(v.to_owned()),
                Err(_) => {
                    tracing::debug!(key = key.as_str(), "skipping unreadable metadata value")
                }
            },
            KeyAndValueRef::Binary(key, _) => {
                tracing::debug!(key = key.as_str(), "skipping binary metadata")
            }
        }
    }
    out
}

/// Applies an envelope metadata map; entries that are not valid wire
/// metadata are skipped rather than failing the call.
pub(crate) fn apply_metadata(meta: &Metadata, out: &mut MetadataMap) {
    for (key, values) in meta {
        let Ok(key) = key.parse::<MetadataKey<Ascii>>() else {
            tracing::debug!(%key, "skipping invalid metadata key");
            continue;
        };
        for value in values {
            match value.parse::<MetadataValue<Ascii>>() {
                Ok(v) => {
                    out.append(key.clone(), v);
                }
                Err(_) => tracing::debug!(key = key.as_str(), "skipping invalid metadata value"),
            }
        }
    }
}
