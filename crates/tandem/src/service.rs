//! Endpoints: named sets of methods, built once and then treated as data.
//!
//! An [`Endpoint`] is assembled with [`EndpointBuilder`]. Each method is
//! registered with a typed async handler; the builder turns it into a
//! [`MethodDescriptor`] whose invoker decodes the wire parameters, calls the
//! handler, and encodes the result. The router only ever sees descriptors.
//!
//! ```ignore
//! let math = Endpoint::builder("IMath", Arc::new(Math::default()))
//!     .rpc("Sum", |svc: Arc<Math>, _ctx, (a, b): (i32, i32)| async move {
//!         Ok(svc.sum(a, b))
//!     })
//!     .oneway("Log", |svc: Arc<Math>, _ctx, (line,): (String,)| async move {
//!         svc.log(line);
//!         Ok(())
//!     })
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tandem_core::{Body, BodySource, Encoding, Payload, fault};

use crate::context::CallContext;
use crate::error::ConfigError;
use crate::fault::Fault;
use crate::params::FromParams;
use crate::scheduler::Scheduler;

/// How a method uses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Request, then one response.
    TwoWay,
    /// Request only. Nothing is sent back, not even a failure.
    OneWay,
    /// Request followed by a raw body; one response.
    Upload,
    /// Request; the response is followed by a raw body.
    Download,
}

impl MethodKind {
    pub fn is_one_way(self) -> bool {
        self == MethodKind::OneWay
    }
}

/// Everything an invoker needs to run one call.
pub struct Invocation {
    pub ctx: CallContext,
    pub params: Vec<Payload>,
    /// The request's body, when it declared a `StreamLength`.
    pub body: Option<Body>,
}

/// What an invoker produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub data: Option<Payload>,
    pub body: Option<BodySource>,
}

type Invoker = Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<Outcome, Fault>> + Send + Sync>;

/// One method of an endpoint: its wire name, shape, and invoker.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: Arc<str>,
    kind: MethodKind,
    param_types: Vec<&'static str>,
    invoker: Invoker,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Rust types of the declared parameters, in wire order.
    pub fn param_types(&self) -> &[&'static str] {
        &self.param_types
    }

    pub fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Result<Outcome, Fault>> {
        (self.invoker)(invocation)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("param_types", &self.param_types)
            .finish_non_exhaustive()
    }
}

/// Supplies the instance that serves each call.
pub enum InstanceProvider<S> {
    /// One shared instance for every call.
    Singleton(Arc<S>),
    /// A fresh instance per call.
    Factory(Arc<dyn Fn() -> Arc<S> + Send + Sync>),
}

impl<S> InstanceProvider<S> {
    pub fn factory(make: impl Fn() -> S + Send + Sync + 'static) -> Self {
        InstanceProvider::Factory(Arc::new(move || Arc::new(make())))
    }

    fn resolve(&self) -> Arc<S> {
        match self {
            InstanceProvider::Singleton(instance) => instance.clone(),
            InstanceProvider::Factory(make) => make(),
        }
    }
}

impl<S> Clone for InstanceProvider<S> {
    fn clone(&self) -> Self {
        match self {
            InstanceProvider::Singleton(instance) => InstanceProvider::Singleton(instance.clone()),
            InstanceProvider::Factory(make) => InstanceProvider::Factory(make.clone()),
        }
    }
}

impl<S> From<Arc<S>> for InstanceProvider<S> {
    fn from(instance: Arc<S>) -> Self {
        InstanceProvider::Singleton(instance)
    }
}

/// A named, immutable table of methods.
#[derive(Clone)]
pub struct Endpoint {
    name: Arc<str>,
    methods: HashMap<String, MethodDescriptor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    default_timeout: Option<Duration>,
    callback_contract: Option<Arc<str>>,
}

impl Endpoint {
    /// An endpoint served by one shared instance.
    pub fn builder<S>(name: impl Into<String>, instance: Arc<S>) -> EndpointBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        Self::with_provider(name, InstanceProvider::Singleton(instance))
    }

    pub fn with_provider<S>(
        name: impl Into<String>,
        provider: InstanceProvider<S>,
    ) -> EndpointBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        EndpointBuilder {
            name: name.into(),
            provider,
            methods: Vec::new(),
            scheduler: None,
            default_timeout: None,
            callback_contract: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Method descriptors sorted by name.
    pub fn methods(&self) -> Vec<&MethodDescriptor> {
        let mut methods: Vec<_> = self.methods.values().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Upper bound on how long the router waits for any call to this endpoint.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// The endpoint name handlers reach through [`CallContext::callback`].
    pub fn callback_contract(&self) -> Option<&str> {
        self.callback_contract.as_deref()
    }

    pub(crate) fn shared_callback_contract(&self) -> Option<Arc<str>> {
        self.callback_contract.clone()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("methods", &self.methods())
            .field("default_timeout", &self.default_timeout)
            .field("callback_contract", &self.callback_contract)
            .finish_non_exhaustive()
    }
}

pub struct EndpointBuilder<S> {
    name: String,
    provider: InstanceProvider<S>,
    methods: Vec<MethodDescriptor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    default_timeout: Option<Duration>,
    callback_contract: Option<Arc<str>>,
}

impl<S> EndpointBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// A two-way method returning an encoded value.
    pub fn rpc<A, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: FromParams + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        let provider = self.provider.clone();
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |inv: Invocation| {
            let provider = provider.clone();
            let handler = handler.clone();
            async move {
                let encoding = inv.ctx.encoding();
                let args = A::from_params(&inv.params, encoding).map_err(Fault::invalid_arguments)?;
                let value = (*handler)(provider.resolve(), inv.ctx, args).await?;
                Ok(Outcome {
                    data: Some(encode_result(encoding, &value)?),
                    body: None,
                })
            }
            .boxed()
        });
        self.push(name, MethodKind::TwoWay, A::type_names(), invoker)
    }

    /// A one-way method. Its result, success or failure, is only logged.
    pub fn oneway<A, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: FromParams + Send + 'static,
        F: Fn(Arc<S>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Fault>> + Send + 'static,
    {
        let provider = self.provider.clone();
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |inv: Invocation| {
            let provider = provider.clone();
            let handler = handler.clone();
            async move {
                let args = A::from_params(&inv.params, inv.ctx.encoding())
                    .map_err(Fault::invalid_arguments)?;
                (*handler)(provider.resolve(), inv.ctx, args).await?;
                Ok(Outcome::default())
            }
            .boxed()
        });
        self.push(name, MethodKind::OneWay, A::type_names(), invoker)
    }

    /// A method that receives a raw body after its parameters.
    ///
    /// A request that arrives without a body gets an empty one.
    pub fn upload<A, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: FromParams + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, A, Body) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        let provider = self.provider.clone();
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |inv: Invocation| {
            let provider = provider.clone();
            let handler = handler.clone();
            async move {
                let encoding = inv.ctx.encoding();
                let args = A::from_params(&inv.params, encoding).map_err(Fault::invalid_arguments)?;
                let body = inv.body.unwrap_or_else(Body::empty);
                let value = (*handler)(provider.resolve(), inv.ctx, args, body).await?;
                Ok(Outcome {
                    data: Some(encode_result(encoding, &value)?),
                    body: None,
                })
            }
            .boxed()
        });
        self.push(name, MethodKind::Upload, A::type_names(), invoker)
    }

    /// A method whose response is followed by a raw body.
    pub fn download<A, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: FromParams + Send + 'static,
        F: Fn(Arc<S>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BodySource, Fault>> + Send + 'static,
    {
        let provider = self.provider.clone();
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |inv: Invocation| {
            let provider = provider.clone();
            let handler = handler.clone();
            async move {
                let args = A::from_params(&inv.params, inv.ctx.encoding())
                    .map_err(Fault::invalid_arguments)?;
                let body = (*handler)(provider.resolve(), inv.ctx, args).await?;
                Ok(Outcome {
                    data: None,
                    body: Some(body),
                })
            }
            .boxed()
        });
        self.push(name, MethodKind::Download, A::type_names(), invoker)
    }

    /// Run this endpoint's handlers on `scheduler` instead of the router's default.
    pub fn scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Declare the endpoint name the peer serves callbacks on.
    pub fn callback_contract(mut self, name: &str) -> Self {
        self.callback_contract = Some(Arc::from(name));
        self
    }

    pub fn build(self) -> Result<Endpoint, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyEndpointName);
        }
        let mut methods = HashMap::with_capacity(self.methods.len());
        for method in self.methods {
            let key = method.name.to_string();
            if methods.insert(key.clone(), method).is_some() {
                return Err(ConfigError::DuplicateMethod {
                    endpoint: self.name,
                    method: key,
                });
            }
        }
        Ok(Endpoint {
            name: Arc::from(self.name),
            methods,
            scheduler: self.scheduler,
            default_timeout: self.default_timeout,
            callback_contract: self.callback_contract,
        })
    }

    fn push(
        mut self,
        name: &str,
        kind: MethodKind,
        param_types: Vec<&'static str>,
        invoker: Invoker,
    ) -> Self {
        self.methods.push(MethodDescriptor {
            name: Arc::from(name),
            kind,
            param_types,
            invoker,
        });
        self
    }
}

fn encode_result<R: Serialize>(encoding: Encoding, value: &R) -> Result<Payload, Fault> {
    encoding
        .encode(value)
        .map(Payload::new)
        .map_err(|e| Fault::new(fault::ENCODE, e.to_string()))
}

#[cfg(test)]
mod tests {
    use tandem_core::{CancelToken, Connection, ConnectionConfig};

    use super::*;
    use crate::client::ClientOptions;

    struct Math;

    fn math() -> Endpoint {
        Endpoint::builder("IMath", Arc::new(Math))
            .rpc("Sum", |_svc: Arc<Math>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
            .oneway("Log", |_svc: Arc<Math>, _ctx, (_line,): (String,)| async move { Ok(()) })
            .upload("Count", |_svc: Arc<Math>, _ctx, (): (), body: Body| async move {
                let bytes = body.to_bytes().await.map_err(|e| Fault::msg(e.to_string()))?;
                Ok(bytes.len())
            })
            .build()
            .unwrap()
    }

    fn context(connection: &Connection, method: &str) -> CallContext {
        CallContext::new(
            0,
            Arc::from("IMath"),
            Arc::from(method),
            None,
            CancelToken::new(),
            connection.clone(),
            None,
            ClientOptions::default(),
        )
    }

    #[test]
    fn descriptors_are_precomputed() {
        let endpoint = math();
        let sum = endpoint.method("Sum").unwrap();
        assert_eq!(sum.kind(), MethodKind::TwoWay);
        assert_eq!(sum.param_types(), ["i32", "i32"]);
        assert!(endpoint.method("Log").unwrap().kind().is_one_way());
        assert!(endpoint.method("Nope").is_none());

        let names: Vec<_> = endpoint.methods().iter().map(|m| m.name()).collect();
        assert_eq!(names, ["Count", "Log", "Sum"]);
    }

    #[test]
    fn duplicate_methods_are_rejected() {
        let err = Endpoint::builder("IMath", Arc::new(Math))
            .rpc("Sum", |_: Arc<Math>, _ctx, (): ()| async move { Ok(1) })
            .rpc("Sum", |_: Arc<Math>, _ctx, (): ()| async move { Ok(2) })
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateMethod {
                endpoint: "IMath".into(),
                method: "Sum".into()
            }
        );

        let err = Endpoint::builder("", Arc::new(Math)).build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyEndpointName);
    }

    #[tokio::test]
    async fn invoker_decodes_and_encodes() {
        let (a, _b) = tokio::io::duplex(1024);
        let connection = Connection::start(a, "test", ConnectionConfig::default(), None);
        let endpoint = math();

        let outcome = endpoint
            .method("Sum")
            .unwrap()
            .invoke(Invocation {
                ctx: context(&connection, "Sum"),
                params: vec![Payload::from("1"), Payload::from("2")],
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.data, Some(Payload::from("3")));

        let fault = endpoint
            .method("Sum")
            .unwrap()
            .invoke(Invocation {
                ctx: context(&connection, "Sum"),
                params: vec![Payload::from("1")],
                body: None,
            })
            .await
            .unwrap_err();
        assert!(fault.info().is_type(fault::INVALID_ARGUMENTS));
    }

    #[tokio::test]
    async fn upload_without_body_sees_empty_body() {
        let (a, _b) = tokio::io::duplex(1024);
        let connection = Connection::start(a, "test", ConnectionConfig::default(), None);
        let outcome = math()
            .method("Count")
            .unwrap()
            .invoke(Invocation {
                ctx: context(&connection, "Count"),
                params: Vec::new(),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.data, Some(Payload::from("0")));
    }

    #[test]
    fn factory_provider_makes_fresh_instances() {
        let provider = InstanceProvider::factory(|| 5u8);
        assert!(!Arc::ptr_eq(&provider.resolve(), &provider.resolve()));

        let shared = InstanceProvider::from(Arc::new(5u8));
        assert!(Arc::ptr_eq(&shared.resolve(), &shared.resolve()));
    }
}
