//! Service catalog: named services exposing typed method handlers.
//!
//! A [`Service`] groups methods under one exported name; the pair
//! `"Service.Method"` is the dotted identifier requests select a handler by.
//! Registration wraps a typed async closure into a type-erased handler that
//! decodes the argument with the connection's codec, invokes the closure and
//! encodes the reply. Each method keeps an atomic count of dispatched
//! invocations.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wisprpc_common::{CodecKind, Result};

type BoxHandler =
    Box<dyn Fn(CodecKind, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// One registered method: a type-erased handler plus its call counter.
pub struct Method {
    name: String,
    handler: BoxHandler,
    calls: AtomicU64,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of dispatched invocations, successful or not.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Invokes the handler with an encoded argument, returning the encoded
    /// reply. The call counter is bumped exactly once per dispatch, before
    /// the handler runs, so failed invocations count too.
    pub async fn call(&self, kind: CodecKind, arg: Vec<u8>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, arg).await
    }
}

/// A named group of methods, dispatched as `"Name.Method"`.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Starts building a service. The name plays the role of the receiver
    /// type name and must start with an uppercase letter; [`Server::register`]
    /// enforces that.
    ///
    /// [`Server::register`]: crate::Server::register
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    /// Methods sorted by name, for the debug page.
    pub fn methods(&self) -> Vec<Arc<Method>> {
        let mut methods: Vec<_> = self.methods.values().cloned().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }
}

/// Builder collecting typed method handlers into a [`Service`].
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceBuilder {
    /// Registers a method with the canonical `arg -> Result<reply>` shape.
    ///
    /// The argument type is decoded from the request body with the
    /// connection's codec; the reply is encoded the same way. A handler error
    /// travels back to the caller as the response header's error text.
    /// Registering a name twice replaces the earlier handler.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let boxed: BoxHandler = Box::new(move |kind, body| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let arg: A = kind.decode(&body)?;
                let reply = handler(arg).await?;
                kind.encode(&reply)
            })
        });
        self.methods.insert(
            name.clone(),
            Arc::new(Method {
                name,
                handler: boxed,
                calls: AtomicU64::new(0),
            }),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}
