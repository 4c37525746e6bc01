//! Path → versioned handler variants, built once at startup.
//!
//! Services declare their routes in a table next to a factory closure. The
//! builder validates every route against the methods the handler exposes,
//! then freezes into a [`HandlerRegistry`] that is only ever read.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::call::Call;
use crate::error::RpcError;

/// Built-in liveness path.
pub const HEALTH_PATH: &str = "health";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {service}: method {method} has an empty path")]
    EmptyPath { service: String, method: String },

    #[error("service {service}: method {method} does not exist")]
    UnknownMethod { service: String, method: String },

    #[error("service {service}: path '{path}' is reserved")]
    ReservedPath { service: String, path: String },

    #[error("service name is empty")]
    EmptyServiceName,
}

/// A service implementation. A fresh instance serves each call.
#[async_trait]
pub trait Handler: Send {
    /// Method names [`Handler::invoke`] accepts.
    fn methods(&self) -> &'static [&'static str];

    /// Run `method` against the call context.
    async fn invoke(&mut self, method: &str, call: &mut Call) -> Result<(), RpcError>;
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// One declared route of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub version: String,
    pub sort: i32,
    pub signed: bool,
    pub login: bool,
}

impl Route {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            version: String::new(),
            sort: 0,
            signed: false,
            login: false,
        }
    }

    /// `""` matches any version, `"2"` exactly 2, `"2+"` 2 or newer.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Higher weights are tried first among variants of one path.
    pub fn sort(mut self, weight: i32) -> Self {
        self.sort = weight;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn login(mut self) -> Self {
        self.login = true;
        self
    }
}

/// A service's route table and handler factory.
pub struct ServiceDef {
    name: String,
    factory: HandlerFactory,
    routes: Vec<Route>,
}

impl ServiceDef {
    pub fn new<F, H>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Handler>),
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One registered implementation of a path.
#[derive(Clone)]
pub struct HandlerVariant {
    pub path: String,
    pub version: String,
    pub sort_weight: i32,
    pub requires_signature: bool,
    pub requires_login: bool,
    pub method: String,
    pub service: Arc<str>,
    factory: HandlerFactory,
}

impl HandlerVariant {
    /// Fresh handler instance with isolated state.
    pub fn instantiate(&self) -> Box<dyn Handler> {
        (self.factory)()
    }
}

impl fmt::Debug for HandlerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerVariant")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("sort_weight", &self.sort_weight)
            .field("requires_signature", &self.requires_signature)
            .field("requires_login", &self.requires_login)
            .field("method", &self.method)
            .field("service", &self.service)
            .finish()
    }
}

/// Accumulates validated service definitions.
#[derive(Default)]
pub struct RegistryBuilder {
    routes: HashMap<String, Vec<HandlerVariant>>,
    services: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add every route of `def`.
    pub fn add(&mut self, def: ServiceDef) -> Result<(), RegistryError> {
        if def.name.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }
        let methods = (def.factory)().methods();
        let service: Arc<str> = Arc::from(def.name.as_str());

        let mut staged = Vec::with_capacity(def.routes.len());
        for route in def.routes {
            if route.path.is_empty() {
                return Err(RegistryError::EmptyPath {
                    service: def.name.clone(),
                    method: route.method,
                });
            }
            if route.path == HEALTH_PATH {
                return Err(RegistryError::ReservedPath {
                    service: def.name.clone(),
                    path: route.path,
                });
            }
            if !methods.contains(&route.method.as_str()) {
                return Err(RegistryError::UnknownMethod {
                    service: def.name.clone(),
                    method: route.method,
                });
            }
            staged.push(HandlerVariant {
                path: route.path,
                version: route.version,
                sort_weight: route.sort,
                requires_signature: route.signed,
                requires_login: route.login,
                method: route.method,
                service: Arc::clone(&service),
                factory: Arc::clone(&def.factory),
            });
        }

        for variant in staged {
            self.routes
                .entry(variant.path.clone())
                .or_default()
                .push(variant);
        }
        self.services.push(def.name);
        Ok(())
    }

    /// Order variants and freeze.
    pub fn build(mut self) -> HandlerRegistry {
        let health: HandlerFactory = Arc::new(|| Box::new(HealthHandler) as Box<dyn Handler>);
        self.routes.insert(
            HEALTH_PATH.to_string(),
            vec![HandlerVariant {
                path: HEALTH_PATH.to_string(),
                version: String::new(),
                sort_weight: 0,
                requires_signature: false,
                requires_login: false,
                method: HEALTH_PATH.to_string(),
                service: Arc::from(HEALTH_PATH),
                factory: health,
            }],
        );

        // Stable: equal weights keep declaration order.
        for variants in self.routes.values_mut() {
            variants.sort_by(|a, b| b.sort_weight.cmp(&a.sort_weight));
        }

        tracing::debug!(
            paths = self.routes.len(),
            services = self.services.len(),
            "handler registry built"
        );
        HandlerRegistry {
            routes: self.routes,
            services: self.services,
        }
    }
}

/// Frozen path → ordered variants table.
#[derive(Debug)]
pub struct HandlerRegistry {
    routes: HashMap<String, Vec<HandlerVariant>>,
    services: Vec<String>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Validate and register all service definitions in one pass.
    pub fn register(defs: impl IntoIterator<Item = ServiceDef>) -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        for def in defs {
            builder.add(def)?;
        }
        Ok(builder.build())
    }

    /// Variants of `path`, highest sort weight first.
    pub fn variants(&self, path: &str) -> Option<&[HandlerVariant]> {
        self.routes.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Number of registered paths, `health` included.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

struct HealthHandler;

#[async_trait]
impl Handler for HealthHandler {
    fn methods(&self) -> &'static [&'static str] {
        &[HEALTH_PATH]
    }

    async fn invoke(&mut self, _method: &str, call: &mut Call) -> Result<(), RpcError> {
        call.write_string("ok");
        Ok(())
    }
}
