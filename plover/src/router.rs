use bytes::Bytes;
use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;

use crate::{
    Context, Payload,
    codec::CodecType,
    error::{Error, ErrorKind, Result},
};

/// Type-erased handler: decodes the argument with the connection's codec,
/// runs the user function and encodes its reply.
pub type Method =
    Box<dyn Fn(Context, CodecType, Payload) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Named group of methods, registered with a [`Router`] as a whole.
pub struct Service {
    name: String,
    methods: HashMap<String, Method, RandomState>,
}

impl Service {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: HashMap::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a typed handler under `method`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateService`] if the method already exists.
    pub fn add_method<Req, Rsp, F, Fut>(&mut self, method: &str, func: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        if self.methods.contains_key(method) {
            return Err(Error::new(
                ErrorKind::DuplicateService,
                format!("method already defined: {}.{method}", self.name),
            ));
        }
        self.methods.insert(method.to_string(), into_method(func));
        Ok(())
    }
}

fn into_method<Req, Rsp, F, Fut>(func: F) -> Method
where
    Req: DeserializeOwned + Send + 'static,
    Rsp: Serialize + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Rsp>> + Send + 'static,
{
    Box::new(
        move |ctx, codec, payload| -> BoxFuture<'static, Result<Bytes>> {
            match codec.decode::<Req>(&payload) {
                Ok(req) => {
                    let fut = func(ctx, req);
                    Box::pin(async move {
                        let rsp = fut.await?;
                        codec.encode(&rsp)
                    })
                }
                Err(err) => Box::pin(std::future::ready(Err(err))),
            }
        },
    )
}

/// Directory of services exposed by a server, resolved by `"Service.Method"`.
#[derive(Default)]
pub struct Router {
    services: HashMap<String, Service, RandomState>,
}

impl Router {
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateService`] if a service with the same
    /// name is already registered.
    pub fn add_service(&mut self, service: Service) -> Result<()> {
        if self.services.contains_key(&service.name) {
            return Err(Error::new(
                ErrorKind::DuplicateService,
                format!("service already defined: {}", service.name),
            ));
        }
        tracing::info!(
            "register service {} with {} methods",
            service.name,
            service.methods.len()
        );
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    /// Registers a single handler, creating its service on first use.
    ///
    /// # Errors
    pub fn add_method<Req, Rsp, F, Fut>(&mut self, service_method: &str, func: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let (service, method) = split_service_method(service_method)?;
        self.services
            .entry(service.to_string())
            .or_insert_with(|| Service::new(service))
            .add_method(method, func)
    }

    /// Finds the handler for `service_method`.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::ProtocolError`] if the name is not exactly `"Service.Method"`.
    /// - [`ErrorKind::UnregisteredService`] if the service is unknown.
    /// - [`ErrorKind::UnknownMethod`] if the service lacks the method.
    pub fn resolve(&self, service_method: &str) -> Result<&Method> {
        let (service, method) = split_service_method(service_method)?;
        let service = self.services.get(service).ok_or_else(|| {
            Error::new(
                ErrorKind::UnregisteredService,
                format!("can't find service {service}"),
            )
        })?;
        service.methods.get(method).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownMethod,
                format!("can't find method {service_method}"),
            )
        })
    }

    /// Sorted `"Service.Method"` names of every registered handler.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .services
            .values()
            .flat_map(|s| s.methods.keys().map(move |m| format!("{}.{m}", s.name)))
            .collect();
        names.sort_unstable();
        names
    }
}

fn split_service_method(service_method: &str) -> Result<(&str, &str)> {
    match service_method.split_once('.') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('.') =>
        {
            Ok((service, method))
        }
        _ => Err(Error::new(
            ErrorKind::ProtocolError,
            format!("service/method request ill-formed: {service_method}"),
        )),
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn double(_ctx: Context, req: i64) -> Result<i64> {
        Ok(req * 2)
    }

    fn router() -> Router {
        let mut service = Service::new("Foo");
        service.add_method("Double", double).unwrap();
        service
            .add_method("Fail", |_ctx, _req: ()| async {
                Err::<(), _>(Error::new(ErrorKind::InvalidArgument, "nope".into()))
            })
            .unwrap();
        let mut router = Router::default();
        router.add_service(service).unwrap();
        router
    }

    #[tokio::test]
    async fn test_resolve_and_invoke() {
        let router = router();
        assert_eq!(router.method_names(), ["Foo.Double", "Foo.Fail"]);

        for codec in [CodecType::MessagePack, CodecType::Json] {
            let method = router.resolve("Foo.Double").unwrap();
            let arg = Payload::from(codec.encode(&21i64).unwrap());
            let reply = method(Context::background(), codec, arg).await.unwrap();
            assert_eq!(codec.decode::<i64>(&reply).unwrap(), 42);
        }

        let method = router.resolve("Foo.Fail").unwrap();
        let err = method(Context::background(), CodecType::Json, Payload::Empty)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_bad_argument_is_reported() {
        let router = router();
        let method = router.resolve("Foo.Double").unwrap();
        let err = method(
            Context::background(),
            CodecType::Json,
            Payload::from(b"\"text\"".to_vec()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
    }

    #[test]
    fn test_resolve_errors() {
        let router = router();
        let kind = |name: &str| router.resolve(name).err().unwrap().kind;
        assert_eq!(kind("Foo.Triple"), ErrorKind::UnknownMethod);
        assert_eq!(kind("Bar.Double"), ErrorKind::UnregisteredService);
        assert_eq!(kind("FooDouble"), ErrorKind::ProtocolError);
        assert_eq!(kind("Foo.Double.Again"), ErrorKind::ProtocolError);
        assert_eq!(kind(".Double"), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut router = router();
        let err = router.add_service(Service::new("Foo")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateService);

        let err = router.add_method("Foo.Double", double).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateService);

        router.add_method("Bar.Double", double).unwrap();
        router.resolve("Bar.Double").unwrap();
    }
}
