//! HTTP transcoding: `google.api.http` rules matched against plain HTTP
//! requests, decoded into the method's input message, and served through
//! the same call path as gRPC, buffered to a single response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use prost::Message;
use prost_reflect::{
    DynamicMessage, ExtensionDescriptor, Kind, MethodDescriptor, ReflectMessage, Value,
};
use tonic::Status;

use crate::config::RuleTemplate;
use crate::envelope::{Metadata, MethodReply, ReplyPayload};
use crate::evaluator::Evaluator;
use crate::method::MethodCall;
use gantry_registry::Registry;

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const CONTENT_TYPE_BINARY: &str = "application/x-protobuf";

const MARSHAL_FAILED: &str = r#"{"code": 13, "message": "failed to marshal error message"}"#;

/// One (verb, path template, body selector) rule bound to a method.
#[derive(Clone, Debug)]
pub(crate) struct BoundRule {
    verb: String,
    template: String,
    /// Only `Some("*")` reads the request body; anything else ignores it.
    body: Option<String>,
    method: MethodDescriptor,
}

/// Gathers rules for every method in the registry: explicit
/// `google.api.http` annotations first, and for unannotated methods one
/// rule per configured template with `{package}`, `{service}` and
/// `{method}` substituted.
pub(crate) fn collect_rules(registry: &Registry, templates: &[RuleTemplate]) -> Vec<BoundRule> {
    let http_ext = registry.extension_by_name("google.api.http");
    let mut rules = Vec::new();
    for service in registry.services() {
        for method in service.methods() {
            if let Some(rule) = annotated_rule(http_ext.as_ref(), &method) {
                rules.push(rule);
                continue;
            }
            for t in templates {
                rules.push(BoundRule {
                    verb: t.verb.clone(),
                    template: substitute(&t.path, &method),
                    body: t.body.clone(),
                    method: method.clone(),
                });
            }
        }
    }
    rules
}

fn annotated_rule(ext: Option<&ExtensionDescriptor>, method: &MethodDescriptor) -> Option<BoundRule> {
    let ext = ext?;
    let options = method.options();
    if !options.has_extension(ext) {
        return None;
    }
    let value = options.get_extension(ext);
    let rule = value.as_message()?;
    let (verb, template) = extract_pattern(rule)?;
    let body = rule
        .get_field_by_name("body")
        .and_then(|v| v.as_str().map(str::to_owned))
        .filter(|b| !b.is_empty());
    Some(BoundRule { verb, template, body, method: method.clone() })
}

fn extract_pattern(rule: &DynamicMessage) -> Option<(String, String)> {
    for (verb, field) in [
        ("GET", "get"),
        ("PUT", "put"),
        ("POST", "post"),
        ("DELETE", "delete"),
        ("PATCH", "patch"),
    ] {
        if rule.has_field_by_name(field) {
            let value = rule.get_field_by_name(field)?;
            return Some((verb.to_owned(), value.as_str()?.to_owned()));
        }
    }
    if rule.has_field_by_name("custom") {
        let value = rule.get_field_by_name("custom")?;
        let custom = value.as_message()?;
        let kind = custom.get_field_by_name("kind")?.as_str()?.to_owned();
        let path = custom.get_field_by_name("path")?.as_str()?.to_owned();
        return Some((kind, path));
    }
    None
}

fn substitute(path: &str, method: &MethodDescriptor) -> String {
    let service = method.parent_service();
    path.replace("{package}", service.parent_file().package_name())
        .replace("{service}", service.name())
        .replace("{method}", method.name())
}

impl BoundRule {
    pub(crate) fn method_full_name(&self) -> &str {
        self.method.full_name()
    }

    fn matches(&self, verb: &http::Method, path: &str) -> Option<HashMap<String, String>> {
        if verb.as_str() != self.verb {
            return None;
        }
        match_path(&self.template, path)
    }

    fn decode_request(
        &self,
        vars: &HashMap<String, String>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<DynamicMessage, Status> {
        let desc = self.method.input();
        let mut msg = if self.body.as_deref() == Some("*") && !body.is_empty() {
            match request_media_type(headers)? {
                MediaType::Json => {
                    let mut de = serde_json::Deserializer::from_slice(body);
                    DynamicMessage::deserialize(desc, &mut de).map_err(|err| {
                        Status::invalid_argument(format!("decode request body: {err}"))
                    })?
                }
                MediaType::BinaryProto => DynamicMessage::decode(desc, body).map_err(|err| {
                    Status::invalid_argument(format!("decode request body: {err}"))
                })?,
            }
        } else {
            DynamicMessage::new(desc)
        };
        for (name, value) in vars {
            set_scalar(&mut msg, name, value)?;
        }
        Ok(msg)
    }

    async fn serve(
        &self,
        vars: HashMap<String, String>,
        headers: &HeaderMap,
        body: Body,
        evaluator: Arc<dyn Evaluator>,
    ) -> axum::response::Response {
        // Negotiate the reply encoding up front so errors can use it too.
        let accept = match accept_media_type(headers) {
            Ok(accept) => accept,
            Err(status) => return status_response(MediaType::Json, &status),
        };
        let result = async {
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|err| Status::invalid_argument(format!("read request body: {err}")))?;
            let msg = self.decode_request(&vars, headers, &bytes)?;
            let call = MethodCall::new(self.method.clone(), evaluator);
            call.call_buffered(Metadata::new(), msg).await
        }
        .await;
        match result {
            Ok(reply) => write_reply(accept, reply),
            Err(status) => {
                tracing::error!(
                    method = self.method_full_name(),
                    code = ?status.code(),
                    message = status.message(),
                    "transcoded call failed"
                );
                status_response(accept, &status)
            }
        }
    }
}

/// Serves one HTTP request against the rule table; requests matching no
/// rule get a structured not-found body.
pub(crate) async fn serve_http(
    rules: &[BoundRule],
    evaluator: &Arc<dyn Evaluator>,
    req: http::Request<Body>,
) -> axum::response::Response {
    let (parts, body) = req.into_parts();
    for rule in rules {
        if let Some(vars) = rule.matches(&parts.method, parts.uri.path()) {
            tracing::debug!(method = rule.method_full_name(), path = %parts.uri.path(), "transcoding");
            return rule.serve(vars, &parts.headers, body, evaluator.clone()).await;
        }
    }
    error_response(
        MediaType::Json,
        tonic::Code::NotFound as i32,
        &format!("no rule matches {} {}", parts.method, parts.uri.path()),
        &[],
    )
}

/// Tokenizes a path template: `/` separates tokens, but a `{...}` group is
/// one token even when the glob inside contains slashes.
fn template_tokens(template: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('/') {
            rest = tail;
            continue;
        }
        let end = if rest.starts_with('{') {
            rest.find('}').map_or(rest.len(), |i| i + 1)
        } else {
            rest.find('/').unwrap_or(rest.len())
        };
        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }
    tokens
}

/// Walks template tokens against the path's `/` segments pairwise.
/// `{name}` captures one segment; `{name=glob}` captures the rejoined
/// remainder when it matches the glob, ending the walk. The path must be
/// fully consumed.
fn match_path(template: &str, path: &str) -> Option<HashMap<String, String>> {
    let mut vars = HashMap::new();
    let pattern = template_tokens(template);
    let mut parts: std::collections::VecDeque<&str> =
        path.split('/').filter(|s| !s.is_empty()).collect();

    for pat in pattern {
        let part = parts.pop_front()?;
        if part == pat {
            continue;
        }
        let key = pat.strip_prefix('{')?.strip_suffix('}')?;
        if let Some((key, glob)) = key.split_once('=') {
            let mut remainder = part.to_owned();
            for rest in &parts {
                remainder.push('/');
                remainder.push_str(rest);
            }
            if !glob_match(glob, &remainder) {
                return None;
            }
            vars.insert(key.to_owned(), remainder);
            parts.clear();
            break;
        }
        vars.insert(key.to_owned(), part.to_owned());
    }
    if !parts.is_empty() {
        return None;
    }
    Some(vars)
}

/// Shell-style glob: `*` matches a run of non-separator characters, `?`
/// one non-separator character, everything else itself.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| {
            text[..i].iter().all(|c| *c != '/') && glob_match_at(rest, &text[i..])
        }),
        Some(('?', rest)) => {
            matches!(text.split_first(), Some((c, t)) if *c != '/' && glob_match_at(rest, t))
        }
        Some((c, rest)) => {
            matches!(text.split_first(), Some((t, tr)) if t == c && glob_match_at(rest, tr))
        }
    }
}

fn set_scalar(msg: &mut DynamicMessage, name: &str, raw: &str) -> Result<(), Status> {
    let desc = msg.descriptor();
    let field = desc.get_field_by_name(name).ok_or_else(|| {
        Status::invalid_argument(format!("{}: no such field {name}", desc.full_name()))
    })?;
    let value = parse_scalar(field.kind(), raw)
        .map_err(|err| Status::invalid_argument(format!("{}.{name}: {err}", desc.full_name())))?;
    if field.is_list() {
        let mut current = msg.get_field(&field).into_owned();
        if let Value::List(list) = &mut current {
            list.push(value);
        }
        msg.set_field(&field, current);
    } else {
        msg.set_field(&field, value);
    }
    Ok(())
}

fn parse_scalar(kind: Kind, raw: &str) -> Result<Value, String> {
    let value = match kind {
        Kind::Bool => Value::Bool(raw.parse().map_err(|e| format!("{e}"))?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(raw.parse().map_err(|e| format!("{e}"))?)
        }
        Kind::Uint32 | Kind::Fixed32 => Value::U32(raw.parse().map_err(|e| format!("{e}"))?),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(raw.parse().map_err(|e| format!("{e}"))?)
        }
        Kind::Uint64 | Kind::Fixed64 => Value::U64(raw.parse().map_err(|e| format!("{e}"))?),
        Kind::Float => Value::F32(raw.parse().map_err(|e| format!("{e}"))?),
        Kind::Double => Value::F64(raw.parse().map_err(|e| format!("{e}"))?),
        Kind::String => Value::String(raw.to_owned()),
        Kind::Bytes => Value::Bytes(Bytes::copy_from_slice(raw.as_bytes())),
        other => return Err(format!("unsupported path variable kind {other:?}")),
    };
    Ok(value)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MediaType {
    Json,
    BinaryProto,
}

impl MediaType {
    fn as_str(self) -> &'static str {
        match self {
            MediaType::Json => CONTENT_TYPE_JSON,
            MediaType::BinaryProto => CONTENT_TYPE_BINARY,
        }
    }
}

/// Request decoding follows `Content-Type`, then `Accept`, then JSON.
fn request_media_type(headers: &HeaderMap) -> Result<MediaType, Status> {
    let raw = headers
        .get(header::CONTENT_TYPE)
        .or_else(|| headers.get(header::ACCEPT));
    parse_media_type(raw, "content type")
}

fn accept_media_type(headers: &HeaderMap) -> Result<MediaType, Status> {
    parse_media_type(headers.get(header::ACCEPT), "accept type")
}

fn parse_media_type(raw: Option<&HeaderValue>, what: &str) -> Result<MediaType, Status> {
    let Some(raw) = raw else {
        return Ok(MediaType::Json);
    };
    let raw = raw
        .to_str()
        .map_err(|_| Status::invalid_argument(format!("unreadable {what} header")))?;
    let media = raw.split(';').next().unwrap_or("").trim();
    match media {
        "" | "*/*" | CONTENT_TYPE_JSON => Ok(MediaType::Json),
        CONTENT_TYPE_BINARY => Ok(MediaType::BinaryProto),
        other => Err(Status::invalid_argument(format!("invalid {what} {other}"))),
    }
}

fn write_reply(accept: MediaType, reply: MethodReply) -> axum::response::Response {
    let msg = match reply.payload {
        ReplyPayload::Message(msg) => msg,
        ReplyPayload::Stream(mut msgs) => {
            if msgs.len() != 1 {
                return status_response(
                    accept,
                    &Status::internal(format!(
                        "transcoding buffers exactly one response, evaluator sent {}",
                        msgs.len()
                    )),
                );
            }
            msgs.remove(0)
        }
        ReplyPayload::Status(status) => {
            return error_response(accept, status.code, &status.message, &status.details)
        }
    };
    if !reply.header.is_empty() || !reply.trailer.is_empty() {
        tracing::debug!("dropping reply metadata on transcoded call");
    }
    let body = match accept {
        MediaType::Json => serde_json::to_vec(&msg).map_err(|err| err.to_string()),
        MediaType::BinaryProto => Ok(msg.encode_to_vec()),
    };
    match body {
        Ok(body) => build_response(StatusCode::OK, accept.as_str(), body),
        Err(err) => status_response(
            accept,
            &Status::internal(format!("marshal response message: {err}")),
        ),
    }
}

fn status_response(media: MediaType, status: &Status) -> axum::response::Response {
    error_response(media, status.code() as i32, status.message(), &[])
}

/// Maps a terminal status onto the nearest HTTP status code with a
/// `google.rpc.Status` body in the negotiated encoding. Details are JSON
/// passthrough; the binary encoding drops them.
fn error_response(
    media: MediaType,
    code: i32,
    message: &str,
    details: &[serde_json::Value],
) -> axum::response::Response {
    let body = match media {
        MediaType::Json => {
            let mut obj = serde_json::Map::new();
            if code != 0 {
                obj.insert("code".to_owned(), code.into());
            }
            if !message.is_empty() {
                obj.insert("message".to_owned(), message.into());
            }
            if !details.is_empty() {
                obj.insert("details".to_owned(), details.to_vec().into());
            }
            serde_json::to_vec(&serde_json::Value::Object(obj)).ok()
        }
        MediaType::BinaryProto => {
            let pb = gantry_proto::rpc::Status {
                code,
                message: message.to_owned(),
                details: Vec::new(),
            };
            Some(pb.encode_to_vec())
        }
    };
    match body {
        Some(body) => build_response(
            http_status_from_code(tonic::Code::from(code)),
            media.as_str(),
            body,
        ),
        None => build_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            CONTENT_TYPE_JSON,
            MARSHAL_FAILED.into(),
        ),
    }
}

fn build_response(
    status: StatusCode,
    content_type: &str,
    body: Vec<u8>,
) -> axum::response::Response {
    match http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(%err, "cannot build HTTP response");
            let mut resp = axum::response::Response::new(Body::from(MARSHAL_FAILED));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

/// The conventional gRPC-to-HTTP status mapping.
fn http_status_from_code(code: tonic::Code) -> StatusCode {
    use tonic::Code;
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}
