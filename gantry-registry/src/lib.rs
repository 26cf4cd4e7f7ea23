//! Descriptor registry: a merged view over any number of compiled
//! `FileDescriptorSet`s, with the lookups the serving and reflection layers
//! need (methods, files, symbols, extensions).

use prost::Message;
use prost_reflect::{
    DescriptorPool, ExtensionDescriptor, FileDescriptor, MessageDescriptor, MethodDescriptor,
    ServiceDescriptor,
};
use prost_types::FileDescriptorSet;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to decode file descriptor set: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to register descriptor: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),
}

/// A merged descriptor registry. Cloning is cheap enough for handing one
/// copy to each service; the pool is reference counted internally.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    pool: DescriptorPool,
}

impl Registry {
    pub fn new() -> Self {
        Self { pool: DescriptorPool::new() }
    }

    /// Decodes an encoded `FileDescriptorSet` and merges it in. Sets whose
    /// files are all present already (same paths) are skipped, so
    /// overlapping sets with shared imports can be loaded in any order.
    ///
    /// The decode goes through the pool itself: extension values inside
    /// options (custom options like `google.api.http`) are unknown fields
    /// to a plain prost decode and would be dropped.
    pub fn add_descriptor_set_bytes(&mut self, bytes: &[u8]) -> Result<(), RegistryError> {
        // Peek at the file names only; this decode never feeds the pool.
        let peek = FileDescriptorSet::decode(bytes)?;
        if peek
            .file
            .iter()
            .all(|fd| self.pool.get_file_by_name(fd.name()).is_some())
        {
            tracing::debug!("descriptor set already registered, skipping");
            return Ok(());
        }
        self.pool.decode_file_descriptor_set(bytes)?;
        Ok(())
    }

    pub fn files(&self) -> impl Iterator<Item = FileDescriptor> + '_ {
        self.pool.files()
    }

    pub fn services(&self) -> impl Iterator<Item = ServiceDescriptor> + '_ {
        self.pool.services()
    }

    pub fn file_by_name(&self, name: &str) -> Option<FileDescriptor> {
        self.pool.get_file_by_name(name)
    }

    pub fn message_by_name(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(name)
    }

    /// Looks up a method by its fully qualified name
    /// (`package.Service.Method`).
    pub fn method_by_full_name(&self, full_name: &str) -> Option<MethodDescriptor> {
        let (service, method) = full_name.rsplit_once('.')?;
        let service = self.pool.get_service_by_name(service)?;
        let found = service.methods().find(|m| m.name() == method);
        found
    }

    /// Finds the file declaring a fully qualified symbol. Messages, enums,
    /// services, and extensions resolve directly; method and field names
    /// resolve through their parent.
    pub fn file_containing_symbol(&self, symbol: &str) -> Option<FileDescriptor> {
        if let Some(m) = self.pool.get_message_by_name(symbol) {
            return Some(m.parent_file());
        }
        if let Some(e) = self.pool.get_enum_by_name(symbol) {
            return Some(e.parent_file());
        }
        if let Some(s) = self.pool.get_service_by_name(symbol) {
            return Some(s.parent_file());
        }
        if let Some(x) = self.pool.get_extension_by_name(symbol) {
            return Some(x.parent_file());
        }
        // package.Service.Method or package.Message.field
        let (parent, _) = symbol.rsplit_once('.')?;
        if let Some(s) = self.pool.get_service_by_name(parent) {
            return Some(s.parent_file());
        }
        if let Some(m) = self.pool.get_message_by_name(parent) {
            return Some(m.parent_file());
        }
        None
    }

    /// Finds the extension of `containing_type` with the given field number,
    /// searching every scope extensions can be declared in.
    pub fn extension_by_number(
        &self,
        containing_type: &str,
        number: i32,
    ) -> Option<ExtensionDescriptor> {
        let mut found = None;
        self.walk_extensions(&mut |full_name, extendee, num| {
            if extendee == containing_type && num == number {
                found = self.pool.get_extension_by_name(full_name);
                found.is_some()
            } else {
                false
            }
        });
        found
    }

    /// All known extensions of `containing_type`, in declaration order.
    pub fn extensions_of(&self, containing_type: &str) -> Vec<ExtensionDescriptor> {
        let mut out = Vec::new();
        self.walk_extensions(&mut |full_name, extendee, _| {
            if extendee == containing_type {
                if let Some(ext) = self.pool.get_extension_by_name(full_name) {
                    out.push(ext);
                }
            }
            false
        });
        out
    }

    /// Resolves an extension by its fully qualified name.
    pub fn extension_by_name(&self, full_name: &str) -> Option<ExtensionDescriptor> {
        self.pool.get_extension_by_name(full_name)
    }

    /// Walks every extension declaration in the registry, both file scoped
    /// and nested inside messages. The visitor receives the extension's full
    /// name, its extendee (without the leading dot protoc writes), and its
    /// field number; returning true stops the walk.
    fn walk_extensions(&self, visit: &mut dyn FnMut(&str, &str, i32) -> bool) {
        for file in self.pool.files() {
            let proto = file.file_descriptor_proto();
            let prefix = proto.package();
            if visit_extension_scope(prefix, &proto.extension, &proto.message_type, visit) {
                return;
            }
        }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

fn visit_extension_scope(
    prefix: &str,
    extensions: &[prost_types::FieldDescriptorProto],
    messages: &[prost_types::DescriptorProto],
    visit: &mut dyn FnMut(&str, &str, i32) -> bool,
) -> bool {
    for ext in extensions {
        let full_name = if prefix.is_empty() {
            ext.name().to_owned()
        } else {
            format!("{prefix}.{}", ext.name())
        };
        let extendee = ext.extendee().trim_start_matches('.');
        if visit(&full_name, extendee, ext.number()) {
            return true;
        }
    }
    for msg in messages {
        let nested_prefix = if prefix.is_empty() {
            msg.name().to_owned()
        } else {
            format!("{prefix}.{}", msg.name())
        };
        if visit_extension_scope(&nested_prefix, &msg.extension, &msg.nested_type, visit) {
            return true;
        }
    }
    false
}
