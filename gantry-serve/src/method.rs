//! The call adapter: bridges one descriptor-described method onto the
//! evaluator, in whichever of the four streaming shapes the method
//! declares.
//!
//! Unary and client-streaming calls invoke the evaluator once (the latter
//! after draining the inbound stream into a batch). Server-streaming calls
//! invoke it once and replay the reply array in order. Bidirectional calls
//! invoke it once per inbound message, flushing that invocation's replies
//! before reading the next message; end-of-input ends the call without a
//! final invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::{Request, Response, Status, Streaming};

use crate::codec::DynamicCodec;
use crate::envelope::{
    apply_metadata, make_input, metadata_to_map, parse_output, InputPayload, Metadata, MethodReply,
    ReplyPayload,
};
use crate::evaluator::Evaluator;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<Response<T>, Status>> + Send>>;
type DynamicStream = Pin<Box<dyn futures_core::Stream<Item = Result<DynamicMessage, Status>> + Send>>;

#[derive(Clone)]
pub(crate) struct MethodCall {
    method: MethodDescriptor,
    evaluator: Arc<dyn Evaluator>,
}

impl MethodCall {
    pub(crate) fn new(method: MethodDescriptor, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { method, evaluator }
    }

    /// Serves one wire-level request in the shape the method declares.
    pub(crate) async fn call(
        self,
        req: http::Request<axum::body::Body>,
    ) -> http::Response<tonic::body::BoxBody> {
        let codec = DynamicCodec::new(self.method.clone());
        let mut grpc = tonic::server::Grpc::new(codec);
        match (
            self.method.is_client_streaming(),
            self.method.is_server_streaming(),
        ) {
            (false, false) => grpc.unary(Unary(self), req).await,
            (true, false) => grpc.client_streaming(ClientStream(self), req).await,
            (false, true) => grpc.server_streaming(ServerStream(self), req).await,
            (true, true) => grpc.streaming(Bidi(self), req).await,
        }
    }

    /// One evaluator round trip with the call buffered to a single request
    /// and a single reply; used by the HTTP transcoder. Client-streaming
    /// methods see a one-element batch.
    pub(crate) async fn call_buffered(
        &self,
        header: Metadata,
        msg: DynamicMessage,
    ) -> Result<MethodReply, Status> {
        let payload = if self.method.is_client_streaming() {
            InputPayload::Stream(vec![msg])
        } else {
            InputPayload::Request(msg)
        };
        let input = make_input(&header, payload)?;
        let output = self.eval(input).await?;
        parse_output(&self.method, &output)
    }

    async fn eval(&self, input: String) -> Result<String, Status> {
        self.evaluator
            .evaluate(&self.method, input)
            .await
            .map_err(|err| match err.downcast::<Status>() {
                Ok(status) => *status,
                Err(err) => Status::unknown(err.to_string()),
            })
    }

    async fn eval_message(
        &self,
        header: &Metadata,
        msg: DynamicMessage,
    ) -> Result<MethodReply, Status> {
        let input = make_input(header, InputPayload::Request(msg))?;
        let output = self.eval(input).await?;
        parse_output(&self.method, &output)
    }
}

async fn unary(
    call: MethodCall,
    request: Request<DynamicMessage>,
) -> Result<Response<DynamicMessage>, Status> {
    let header = metadata_to_map(request.metadata());
    let input = make_input(&header, InputPayload::Request(request.into_inner()))?;
    let output = call.eval(input).await?;
    single_response(parse_output(&call.method, &output)?)
}

async fn client_streaming(
    call: MethodCall,
    request: Request<Streaming<DynamicMessage>>,
) -> Result<Response<DynamicMessage>, Status> {
    let header = metadata_to_map(request.metadata());
    let mut inbound = request.into_inner();
    let mut msgs = Vec::new();
    while let Some(msg) = inbound.message().await? {
        msgs.push(msg);
    }
    let input = make_input(&header, InputPayload::Stream(msgs))?;
    let output = call.eval(input).await?;
    single_response(parse_output(&call.method, &output)?)
}

async fn server_streaming(
    call: MethodCall,
    request: Request<DynamicMessage>,
) -> Result<Response<DynamicStream>, Status> {
    let header = metadata_to_map(request.metadata());
    let input = make_input(&header, InputPayload::Request(request.into_inner()))?;
    let output = call.eval(input).await?;
    let reply = parse_output(&call.method, &output)?;
    match reply.payload {
        ReplyPayload::Stream(msgs) => {
            drop_trailer(&reply.trailer);
            let stream = tokio_stream::iter(msgs.into_iter().map(Ok));
            let mut response = Response::new(Box::pin(stream) as DynamicStream);
            apply_metadata(&reply.header, response.metadata_mut());
            Ok(response)
        }
        ReplyPayload::Status(status) => Err(status.into_status(&reply.header, &reply.trailer)),
        ReplyPayload::Message(_) => Err(Status::internal(
            "server-streaming method must reply with stream, not response",
        )),
    }
}

async fn streaming(
    call: MethodCall,
    request: Request<Streaming<DynamicMessage>>,
) -> Result<Response<DynamicStream>, Status> {
    let header = metadata_to_map(request.metadata());
    let mut inbound = request.into_inner();

    // A client that sends nothing gets an empty stream and no evaluation.
    let Some(first) = inbound.message().await? else {
        return Ok(Response::new(Box::pin(tokio_stream::empty()) as DynamicStream));
    };

    // The first inbound message is evaluated before the response goes out,
    // so its header metadata can still travel as response headers. Header
    // metadata on any later reply has nowhere to go and fails the call.
    let first_reply = call.eval_message(&header, first).await?;
    let primed = match first_reply.payload {
        ReplyPayload::Stream(msgs) => {
            drop_trailer(&first_reply.trailer);
            msgs
        }
        ReplyPayload::Status(status) => {
            return Err(status.into_status(&first_reply.header, &first_reply.trailer))
        }
        ReplyPayload::Message(_) => {
            return Err(Status::internal(
                "server-streaming method must reply with stream, not response",
            ))
        }
    };

    let stream = async_stream::try_stream! {
        for msg in primed {
            yield msg;
        }
        while let Some(msg) = inbound.message().await? {
            let reply = call.eval_message(&header, msg).await?;
            if !reply.header.is_empty() {
                Err(Status::internal("header metadata already sent"))?;
            }
            match reply.payload {
                ReplyPayload::Stream(msgs) => {
                    drop_trailer(&reply.trailer);
                    for m in msgs {
                        yield m;
                    }
                }
                ReplyPayload::Status(status) => {
                    Err(status.into_status(&Metadata::new(), &reply.trailer))?;
                }
                ReplyPayload::Message(_) => {
                    Err(Status::internal(
                        "server-streaming method must reply with stream, not response",
                    ))?;
                }
            }
        }
    };

    let mut response = Response::new(Box::pin(stream) as DynamicStream);
    apply_metadata(&first_reply.header, response.metadata_mut());
    Ok(response)
}

fn single_response(reply: MethodReply) -> Result<Response<DynamicMessage>, Status> {
    match reply.payload {
        ReplyPayload::Message(msg) => {
            drop_trailer(&reply.trailer);
            let mut response = Response::new(msg);
            apply_metadata(&reply.header, response.metadata_mut());
            Ok(response)
        }
        ReplyPayload::Status(status) => Err(status.into_status(&reply.header, &reply.trailer)),
        ReplyPayload::Stream(_) => Err(Status::internal(
            "non-streaming method must reply with response, not stream",
        )),
    }
}

// Trailers on a successful reply cannot be staged through the generic
// server surface; they are dropped, visibly.
fn drop_trailer(trailer: &Metadata) {
    if !trailer.is_empty() {
        tracing::debug!(keys = ?trailer.keys().collect::<Vec<_>>(), "dropping trailer metadata");
    }
}

fn log_error(method: &str, status: Status) -> Status {
    tracing::error!(method, code = ?status.code(), message = status.message(), "call failed");
    status
}

struct Unary(MethodCall);

impl tonic::server::UnaryService<DynamicMessage> for Unary {
    type Response = DynamicMessage;
    type Future = BoxFuture<DynamicMessage>;

    fn call(&mut self, request: Request<DynamicMessage>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let name = call.method.full_name().to_owned();
            unary(call, request).await.map_err(|s| log_error(&name, s))
        })
    }
}

struct ClientStream(MethodCall);

impl tonic::server::ClientStreamingService<DynamicMessage> for ClientStream {
    type Response = DynamicMessage;
    type Future = BoxFuture<DynamicMessage>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let name = call.method.full_name().to_owned();
            client_streaming(call, request)
                .await
                .map_err(|s| log_error(&name, s))
        })
    }
}

struct ServerStream(MethodCall);

impl tonic::server::ServerStreamingService<DynamicMessage> for ServerStream {
    type Response = DynamicMessage;
    type ResponseStream = DynamicStream;
    type Future = BoxFuture<Self::ResponseStream>;

    fn call(&mut self, request: Request<DynamicMessage>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let name = call.method.full_name().to_owned();
            server_streaming(call, request)
                .await
                .map_err(|s| log_error(&name, s))
        })
    }
}

struct Bidi(MethodCall);

impl tonic::server::StreamingService<DynamicMessage> for Bidi {
    type Response = DynamicMessage;
    type ResponseStream = DynamicStream;
    type Future = BoxFuture<Self::ResponseStream>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let call = self.0.clone();
        Box::pin(async move {
            let name = call.method.full_name().to_owned();
            streaming(call, request)
                .await
                .map_err(|s| log_error(&name, s))
        })
    }
}
