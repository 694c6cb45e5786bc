//! Registered RPC methods.

use std::fmt;
use std::sync::Arc;

use crate::protocol::request::Request;

/// Method implementation. Runs on a reactor thread: fill in the request's
/// return values (or an error), or detach it and answer later.
pub type MethodHandler = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// A named, typed method with its documentation and access requirements.
#[derive(Clone)]
pub struct Method {
    name: String,
    param_types: String,
    return_types: String,
    handler: MethodHandler,
    description: String,
    param_docs: Vec<(String, String)>,
    return_docs: Vec<(String, String)>,
    required_capabilities: Vec<String>,
}

impl Method {
    /// `params` and `returns` are type strings, e.g. `"is"` or `"i*"`.
    pub fn new<F>(
        name: impl Into<String>,
        params: impl Into<String>,
        returns: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            param_types: params.into(),
            return_types: returns.into(),
            handler: Arc::new(handler),
            description: String::new(),
            param_docs: Vec::new(),
            return_docs: Vec::new(),
            required_capabilities: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Document the next parameter.
    pub fn param_doc(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.param_docs.push((name.into(), description.into()));
        self
    }

    /// Document the next return value.
    pub fn return_doc(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.return_docs.push((name.into(), description.into()));
        self
    }

    /// Only peers holding `capability` may call this method.
    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_types(&self) -> &str {
        &self.param_types
    }

    pub fn return_types(&self) -> &str {
        &self.return_types
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn param_docs(&self) -> &[(String, String)] {
        &self.param_docs
    }

    pub fn return_docs(&self) -> &[(String, String)] {
        &self.return_docs
    }

    pub fn required_capabilities(&self) -> &[String] {
        &self.required_capabilities
    }

    pub(crate) fn invoke(&self, request: &mut Request) {
        (self.handler)(request)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.param_types)
            .field("returns", &self.return_types)
            .field("capabilities", &self.required_capabilities)
            .finish()
    }
}
