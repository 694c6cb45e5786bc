//! # Supervisor
//!
//! The application-facing entry point: owns a [`Transport`], a
//! [`MethodRegistry`] and the dispatch logic connecting them.
//!
//! For every inbound request the supervisor looks the method up, checks the
//! parameter types and the caller's capabilities, runs the handler and sends
//! back its answer. Failures along the way become RPC errors on the reply;
//! they never close the connection.
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use reactor_rpc::config::NetworkConfig;
//! use reactor_rpc::protocol::{Method, Request, Supervisor};
//! use reactor_rpc::transport::spec::Spec;
//!
//! # fn main() -> reactor_rpc::error::Result<()> {
//! let server = Supervisor::new(&NetworkConfig::default())?;
//! server.add_method(Method::new("echo", "*", "*", |req: &mut Request| {
//!     let params = req.params().clone();
//!     *req.returns_mut() = params;
//! }));
//! let acceptor = server.listen(&Spec::from_port(0))?;
//!
//! let client = Supervisor::new(&NetworkConfig::default())?;
//! let target = client.get_target(&Spec::from_port(acceptor.local_port()))?;
//! let mut req = Request::new("echo");
//! req.params_mut().add(42i32);
//! let req = target.invoke_sync(req, Duration::from_secs(5));
//! assert!(!req.is_error());
//! # Ok(())
//! # }
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::{instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::packet::{Packet, PacketBody};
use crate::core::value::{Value, Values};
use crate::crypto::engine_from_config;
use crate::error::Result;
use crate::protocol::method::Method;
use crate::protocol::registry::MethodRegistry;
use crate::protocol::request::{ErrorCode, Request};
use crate::protocol::target::Target;
use crate::transport::spec::Spec;
use crate::transport::{
    panic_message, Acceptor, ConnectionShared, RequestDispatcher, Transport, TransportBuilder,
};
use crate::utils::metrics::MetricsSnapshot;

/// Dispatches inbound requests to registered methods.
struct SupervisorCore {
    registry: Arc<MethodRegistry>,
}

impl SupervisorCore {
    fn handle(&self, request: &mut Request) {
        let Some(method) = self.registry.lookup(request.method_name()) else {
            trace!(method = request.method_name(), "No such method");
            request.set_error_code(ErrorCode::NO_SUCH_METHOD);
            return;
        };
        if !request.params().satisfies(method.param_types()) {
            request.set_error_code(ErrorCode::WRONG_PARAMS);
            return;
        }
        if !request
            .auth_context()
            .has_all(method.required_capabilities())
        {
            warn!(method = method.name(), "Caller lacks required capabilities");
            request.set_error_code(ErrorCode::PERMISSION_DENIED);
            return;
        }
        request.set_return_types(method.return_types());
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| method.invoke(request))) {
            let message = panic_message(panic.as_ref()).to_string();
            warn!(method = method.name(), panic = %message, "Method handler panicked");
            if !request.is_detached() {
                request.set_error(ErrorCode::METHOD_FAILED, message);
            }
        }
    }
}

impl RequestDispatcher for SupervisorCore {
    fn dispatch(&self, conn: &Arc<ConnectionShared>, packet: Packet) {
        let Packet {
            flags,
            request_id,
            body,
        } = packet;
        let PacketBody::Request { method, params } = body else {
            return;
        };
        let mut request = Request::inbound(conn.clone(), request_id, flags, method, params);
        self.handle(&mut request);
        if !request.is_detached() {
            request.send_reply();
        }
    }
}

/// Method registry plus transport.
pub struct Supervisor {
    registry: Arc<MethodRegistry>,
    transport: Transport,
}

impl Supervisor {
    /// Supervisor with crypto and transport settings from `config`.
    pub fn new(config: &NetworkConfig) -> Result<Supervisor> {
        let crypto = engine_from_config(&config.crypto)?;
        Self::with_builder(
            TransportBuilder::new()
                .config(config.transport.clone())
                .crypto_engine(crypto),
        )
    }

    /// Supervisor on top of a caller-configured transport builder.
    ///
    /// Any dispatcher already set on `builder` is replaced.
    pub fn with_builder(builder: TransportBuilder) -> Result<Supervisor> {
        let registry = Arc::new(MethodRegistry::new());
        register_builtins(&registry);
        let core = Arc::new(SupervisorCore {
            registry: registry.clone(),
        });
        let transport = builder.dispatcher(core).build()?;
        Ok(Supervisor {
            registry,
            transport,
        })
    }

    /// Register a method; returns the one it replaced.
    pub fn add_method(&self, method: Method) -> Option<Arc<Method>> {
        self.registry.register(method)
    }

    pub fn remove_method(&self, name: &str) -> Option<Arc<Method>> {
        self.registry.unregister(name)
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    #[instrument(skip(self), fields(spec = %spec))]
    pub fn listen(&self, spec: &Spec) -> Result<Acceptor> {
        self.transport.listen(spec)
    }

    /// Connect to `spec`. Returns at once; requests sent before the
    /// connection is up are queued.
    #[instrument(skip(self), fields(spec = %spec))]
    pub fn get_target(&self, spec: &Spec) -> Result<Target> {
        self.transport.connect(spec).map(Target::new)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.transport.metrics()
    }

    pub fn shutdown(&self, wait: bool) {
        self.transport.shutdown(wait);
    }
}

/// Reflection methods every supervisor answers.
fn register_builtins(registry: &Arc<MethodRegistry>) {
    registry.register(
        Method::new("frt.rpc.ping", "", "", |_req: &mut Request| {})
            .describe("Method that may be used to check if the server is online"),
    );

    let weak = Arc::downgrade(registry);
    registry.register(
        Method::new("frt.rpc.getMethodList", "", "SSS", move |req: &mut Request| {
            method_list(&weak, req)
        })
        .describe("Obtain a list of all available methods")
        .return_doc("names", "Method names")
        .return_doc("params", "Method parameter types")
        .return_doc("return", "Method return values"),
    );

    let weak = Arc::downgrade(registry);
    registry.register(
        Method::new("frt.rpc.getMethodInfo", "s", "sssSSSS", move |req: &mut Request| {
            method_info(&weak, req)
        })
        .describe("Obtain detailed information about a single method")
        .param_doc("methodName", "The method we want information about")
        .return_doc("desc", "Description of what the method does")
        .return_doc("params", "Method parameter types")
        .return_doc("return", "Method return values")
        .return_doc("paramNames", "Method parameter names")
        .return_doc("paramDesc", "Method parameter descriptions")
        .return_doc("returnNames", "Method return value names")
        .return_doc("returnDesc", "Method return value descriptions"),
    );
}

fn method_list(registry: &Weak<MethodRegistry>, req: &mut Request) {
    let Some(registry) = registry.upgrade() else {
        req.set_error_code(ErrorCode::METHOD_FAILED);
        return;
    };
    let methods = registry.snapshot();
    let column = |f: fn(&Method) -> &str| -> Value {
        Value::StringArray(methods.iter().map(|m| f(m).to_string()).collect())
    };
    let returns = req.returns_mut();
    returns.add(column(Method::name));
    returns.add(column(Method::param_types));
    returns.add(column(Method::return_types));
}

fn method_info(registry: &Weak<MethodRegistry>, req: &mut Request) {
    let Some(registry) = registry.upgrade() else {
        req.set_error_code(ErrorCode::METHOD_FAILED);
        return;
    };
    let name = req
        .params()
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(method) = registry.lookup(&name) else {
        req.set_error(ErrorCode::METHOD_FAILED, "No such method");
        return;
    };
    let names = |docs: &[(String, String)]| {
        Value::StringArray(docs.iter().map(|(n, _)| n.clone()).collect())
    };
    let descs = |docs: &[(String, String)]| {
        Value::StringArray(docs.iter().map(|(_, d)| d.clone()).collect())
    };
    let mut returns = Values::new();
    returns
        .add(method.description())
        .add(method.param_types())
        .add(method.return_types())
        .add(names(method.param_docs()))
        .add(descs(method.param_docs()))
        .add(names(method.return_docs()))
        .add(descs(method.return_docs()));
    *req.returns_mut() = returns;
}
