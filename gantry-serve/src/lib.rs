//! Dynamic gRPC/HTTP gateway.
//!
//! Every method found in the configured descriptor sets is served without
//! generated stubs: requests are decoded into dynamic messages, marshaled
//! into a JSON envelope, handed to an [`Evaluator`], and the evaluator's
//! reply is re-encoded onto the wire. HTTP requests matching a
//! `google.api.http` rule are transcoded onto the same call path.

mod codec;
mod config;
mod envelope;
mod evaluator;
mod httprule;
mod method;
mod server;
mod vfs;

pub use config::{RuleTemplate, ServerConfig};
pub use envelope::{ErrorStatus, Metadata, MethodReply, ReplyPayload};
pub use evaluator::{EvalError, Evaluator, EvaluatorFn};
pub use server::Server;
pub use vfs::{StackedFs, VfsError};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Registry(#[from] gantry_registry::RegistryError),
    #[error(transparent)]
    Vfs(#[from] vfs::VfsError),
    #[error("{path}: {source}")]
    ReadDescriptorSet {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
