use std::path::PathBuf;

/// A fallback HTTP rule applied to methods without a `google.api.http`
/// annotation. `{package}`, `{service}` and `{method}` in the path are
/// replaced with the method's components.
#[derive(Clone, Debug)]
pub struct RuleTemplate {
    pub verb: String,
    pub path: String,
    /// Body selector; only `Some("*")` reads the request body.
    pub body: Option<String>,
}

impl RuleTemplate {
    pub fn new(verb: impl Into<String>, path: impl Into<String>, body: Option<&str>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            body: body.map(str::to_owned),
        }
    }
}

/// Server configuration. Plain fields, no builder; construct it literally
/// and override what you need from [`ServerConfig::default`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address for the combined gRPC/HTTP listener.
    pub listen: String,
    /// Explicit descriptor-set files, loaded before directory discovery.
    pub protosets: Vec<PathBuf>,
    /// Layered directories searched for `*.pb` descriptor sets and usable
    /// by evaluators for method scripts. Earlier entries shadow later ones.
    pub dirs: Vec<PathBuf>,
    /// Serve non-gRPC traffic through the HTTP transcoder.
    pub http: bool,
    /// Fallback rules for methods without explicit HTTP annotations.
    /// Only consulted when `http` is set.
    pub rule_templates: Vec<RuleTemplate>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:8080".to_owned(),
            protosets: Vec::new(),
            dirs: Vec::new(),
            http: false,
            rule_templates: Vec::new(),
        }
    }
}
