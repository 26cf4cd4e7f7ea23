//! Server reflection (`grpc.reflection.v1alpha`) answered from a
//! [`Registry`] instead of generated service descriptors, so every
//! dynamically served method is discoverable by grpcurl and friends.

use std::collections::HashSet;
use std::pin::Pin;

use prost::Message;
use tonic::{Request, Response, Status, Streaming};

use gantry_proto::reflection::server_reflection_request::MessageRequest;
use gantry_proto::reflection::server_reflection_response::MessageResponse;
use gantry_proto::reflection::{
    ErrorResponse, ExtensionNumberResponse, FileDescriptorResponse, ListServiceResponse,
    ServerReflectionRequest, ServerReflectionResponse, ServiceResponse,
};
use gantry_registry::Registry;

pub use gantry_proto::reflection::server_reflection_server::{
    ServerReflection, ServerReflectionServer,
};

/// One reflection service instance. Holds its own registry copy with the
/// reflection protocol's descriptors merged in, so the service can describe
/// itself like any other registered file.
#[derive(Clone, Debug)]
pub struct ReflectionService {
    registry: Registry,
}

impl ReflectionService {
    pub fn new(registry: &Registry) -> Self {
        let mut registry = registry.clone();
        if let Err(err) =
            registry.add_descriptor_set_bytes(gantry_proto::reflection::FILE_DESCRIPTOR_SET)
        {
            // Self-description degrades, everything else still works.
            tracing::error!(%err, "cannot register reflection descriptors");
        }
        Self { registry }
    }

    /// Wraps the service in its generated tonic server.
    pub fn into_server(self) -> ServerReflectionServer<Self> {
        ServerReflectionServer::new(self)
    }
}

#[tonic::async_trait]
impl ServerReflection for ReflectionService {
    type ServerReflectionInfoStream =
        Pin<Box<dyn futures_core::Stream<Item = Result<ServerReflectionResponse, Status>> + Send>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let mut inbound = request.into_inner();
        let registry = self.registry.clone();
        let output = async_stream::try_stream! {
            // Files already sent on this stream are not repeated.
            let mut sent = HashSet::new();
            while let Some(req) = inbound.message().await? {
                let resp = handle_request(&registry, &mut sent, &req);
                yield ServerReflectionResponse {
                    valid_host: req.host.clone(),
                    original_request: Some(req),
                    message_response: Some(resp),
                };
            }
        };
        Ok(Response::new(Box::pin(output)))
    }
}

fn handle_request(
    registry: &Registry,
    sent: &mut HashSet<String>,
    req: &ServerReflectionRequest,
) -> MessageResponse {
    match &req.message_request {
        Some(MessageRequest::FileByFilename(name)) => match registry.file_by_name(name) {
            Some(fd) => file_response(registry, sent, fd),
            None => not_found(format!("file not found: {name}")),
        },
        Some(MessageRequest::FileContainingSymbol(symbol)) => {
            match registry.file_containing_symbol(symbol) {
                Some(fd) => file_response(registry, sent, fd),
                None => not_found(format!("symbol not found: {symbol}")),
            }
        }
        Some(MessageRequest::FileContainingExtension(ext)) => {
            match registry.extension_by_number(&ext.containing_type, ext.extension_number) {
                Some(x) => file_response(registry, sent, x.parent_file()),
                None => not_found(format!(
                    "extension not found: {}({})",
                    ext.containing_type, ext.extension_number
                )),
            }
        }
        Some(MessageRequest::AllExtensionNumbersOfType(name)) => {
            // Unknown base types answer with an empty list, not an error.
            let extension_number = registry
                .extensions_of(name)
                .iter()
                .map(|x| x.number() as i32)
                .collect();
            MessageResponse::AllExtensionNumbersResponse(ExtensionNumberResponse {
                base_type_name: name.clone(),
                extension_number,
            })
        }
        Some(MessageRequest::ListServices(_)) => {
            let service = registry
                .services()
                .map(|s| ServiceResponse { name: s.full_name().to_owned() })
                .collect();
            MessageResponse::ListServicesResponse(ListServiceResponse { service })
        }
        None => MessageResponse::ErrorResponse(ErrorResponse {
            error_code: tonic::Code::InvalidArgument as i32,
            error_message: "no message request set".to_owned(),
        }),
    }
}

fn not_found(message: String) -> MessageResponse {
    MessageResponse::ErrorResponse(ErrorResponse {
        error_code: tonic::Code::NotFound as i32,
        error_message: message,
    })
}

/// Serializes a file and its transitive imports, dependency first, skipping
/// files already sent on this stream. The requested file is always part of
/// the answer, even when the whole closure was sent before.
fn file_response(
    registry: &Registry,
    sent: &mut HashSet<String>,
    fd: prost_reflect::FileDescriptor,
) -> MessageResponse {
    let mut file_descriptor_proto = Vec::new();
    collect_with_deps(registry, &fd, sent, &mut file_descriptor_proto);
    if file_descriptor_proto.is_empty() {
        file_descriptor_proto.push(fd.file_descriptor_proto().encode_to_vec());
    }
    MessageResponse::FileDescriptorResponse(FileDescriptorResponse { file_descriptor_proto })
}

fn collect_with_deps(
    registry: &Registry,
    fd: &prost_reflect::FileDescriptor,
    sent: &mut HashSet<String>,
    out: &mut Vec<Vec<u8>>,
) {
    if !sent.insert(fd.name().to_owned()) {
        return;
    }
    for dep in &fd.file_descriptor_proto().dependency {
        if let Some(dep_fd) = registry.file_by_name(dep) {
            collect_with_deps(registry, &dep_fd, sent, out);
        }
    }
    out.push(fd.file_descriptor_proto().encode_to_vec());
}
