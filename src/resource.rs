//! Endpoint tree.
//!
//! Components register their operations explicitly on a [`Site`]: a query
//! (`get`), a mutation (`put`), an optional change [`Notifier`] for
//! observers, and optionally a wildcard flag for families of endpoints
//! whose last path segments are data (channels, runs). The tree is
//! transport-neutral; a binding maps verbs and response classes onto its
//! protocol of choice.
//!
//! Mutation payloads are JSON and may be a single scalar, a positional
//! array, a keyword object, or a `[[positional], {keyword}]` pair.

use crate::error::{PiccoloError, Result};
use crate::notify::Notifier;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

/// Request verbs understood by the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Put,
}

/// Response classes, mirroring constrained-REST semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Content,
    Changed,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    ServerError,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub code: Code,
    pub payload: Value,
}

impl Response {
    fn ok(code: Code, payload: Value) -> Self {
        Self { code, payload }
    }

    fn error(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            payload: Value::String(message.into()),
        }
    }
}

/// Decoded invocation handed to a handler.
#[derive(Clone, Debug, Default)]
pub struct Call {
    /// Path remainder for wildcard resources.
    pub arg: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// The wildcard path argument; an error when the resource was invoked
    /// without one.
    pub fn path_arg(&self) -> Result<String> {
        self.arg
            .clone()
            .ok_or_else(|| PiccoloError::invalid("missing path argument"))
    }

    /// Look up a parameter by position, falling back to its keyword name.
    pub fn param<T: serde::de::DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>> {
        let value = self
            .args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .cloned();
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| PiccoloError::invalid(format!("bad value for {name}: {e}"))),
        }
    }

    /// Like [`Self::param`] but the parameter is mandatory.
    pub fn require<T: serde::de::DeserializeOwned>(&self, index: usize, name: &str) -> Result<T> {
        self.param(index, name)?
            .ok_or_else(|| PiccoloError::invalid(format!("missing parameter {name}")))
    }
}

/// Decode a mutation payload into positional and keyword parts.
fn decode_payload(data: &[u8]) -> Result<(Vec<Value>, Map<String, Value>)> {
    if data.is_empty() {
        return Ok((Vec::new(), Map::new()));
    }
    let value: Value = serde_json::from_slice(data)?;
    Ok(match value {
        Value::Array(items) => {
            let is_pair = items.len() == 2 && items[0].is_array() && items[1].is_object();
            if is_pair {
                let mut items = items;
                let Value::Object(kwargs) = items.pop().unwrap_or_default() else {
                    return Err(PiccoloError::invalid("malformed call pair"));
                };
                let Value::Array(args) = items.pop().unwrap_or_default() else {
                    return Err(PiccoloError::invalid("malformed call pair"));
                };
                (args, kwargs)
            } else {
                (items, Map::new())
            }
        }
        Value::Object(kwargs) => (Vec::new(), kwargs),
        scalar => (vec![scalar], Map::new()),
    })
}

type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone, Default)]
struct Resource {
    get: Option<Handler>,
    put: Option<Handler>,
    notifier: Option<Notifier>,
    wildcard: bool,
}

/// A tree of endpoints keyed by slash-separated paths.
#[derive(Clone, Default)]
pub struct Site {
    resources: BTreeMap<String, Resource>,
}

impl Site {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin registering the resource at `path`.
    pub fn at(&mut self, path: &str) -> ResourceBuilder<'_> {
        ResourceBuilder {
            site: self,
            path: path.trim_matches('/').to_string(),
            resource: Resource::default(),
        }
    }

    /// Graft another site below `prefix`.
    pub fn mount(&mut self, prefix: &str, site: Site) {
        let prefix = prefix.trim_matches('/');
        for (path, resource) in site.resources {
            let full = if path.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}/{path}")
            };
            self.resources.insert(full, resource);
        }
    }

    /// Registered paths, in order.
    pub fn paths(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    fn resolve(&self, path: &str) -> Option<(&Resource, Option<String>)> {
        let path = path.trim_matches('/');
        if let Some(r) = self.resources.get(path) {
            return Some((r, None));
        }
        // Longest registered prefix with a wildcard wins; the remainder
        // becomes the path argument.
        let mut prefix = path;
        while let Some(cut) = prefix.rfind('/') {
            prefix = &path[..cut];
            if let Some(r) = self.resources.get(prefix) {
                if r.wildcard {
                    return Some((r, Some(path[cut + 1..].to_string())));
                }
            }
        }
        None
    }

    pub fn is_observable(&self, path: &str) -> bool {
        self.resolve(path)
            .is_some_and(|(r, _)| r.notifier.is_some())
    }

    /// Subscribe to change ticks for an observable endpoint.
    pub fn observe(&self, path: &str) -> Option<tokio::sync::mpsc::UnboundedReceiver<()>> {
        self.resolve(path)
            .and_then(|(r, _)| r.notifier.as_ref())
            .map(Notifier::subscribe)
    }

    /// Serve one request against the tree.
    pub async fn dispatch(&self, verb: Verb, path: &str, payload: Option<&[u8]>) -> Response {
        let Some((resource, arg)) = self.resolve(path) else {
            return Response::error(Code::NotFound, format!("no such resource {path}"));
        };
        let handler = match verb {
            Verb::Get => resource.get.clone(),
            Verb::Put => resource.put.clone(),
        };
        let Some(handler) = handler else {
            return Response::error(Code::MethodNotAllowed, "unsupported method");
        };
        let call = match verb {
            Verb::Get => Call {
                arg,
                ..Call::default()
            },
            Verb::Put => match decode_payload(payload.unwrap_or_default()) {
                Ok((args, kwargs)) => Call { arg, args, kwargs },
                Err(e) => return Response::error(Code::BadRequest, e.to_string()),
            },
        };
        match handler(call).await {
            Ok(value) => Response::ok(
                if verb == Verb::Get {
                    Code::Content
                } else {
                    Code::Changed
                },
                value,
            ),
            Err(e) if e.is_domain() => Response::error(Code::BadRequest, e.to_string()),
            Err(e) => {
                error!(path, "{e}");
                Response::error(Code::ServerError, e.to_string())
            }
        }
    }

    /// CoRE link-format listing of the tree.
    pub fn link_format(&self) -> String {
        self.resources
            .iter()
            .map(|(path, r)| {
                if r.notifier.is_some() {
                    format!("</{path}>;obs")
                } else {
                    format!("</{path}>")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Builder returned by [`Site::at`]; call [`ResourceBuilder::register`] to
/// insert the finished resource.
#[must_use]
pub struct ResourceBuilder<'a> {
    site: &'a mut Site,
    path: String,
    resource: Resource,
}

impl ResourceBuilder<'_> {
    pub fn get<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.resource.get = Some(Arc::new(move |call| Box::pin(f(call))));
        self
    }

    pub fn put<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.resource.put = Some(Arc::new(move |call| Box::pin(f(call))));
        self
    }

    /// Attach the notifier observers subscribe to.
    pub fn observable(mut self, notifier: Notifier) -> Self {
        self.resource.notifier = Some(notifier);
        self
    }

    /// Accept a path remainder as argument (e.g. `current_time/{channel}`).
    pub fn wildcard(mut self) -> Self {
        self.resource.wildcard = true;
        self
    }

    pub fn register(self) {
        self.site.resources.insert(self.path, self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_site() -> Site {
        let mut site = Site::new();
        site.at("value")
            .get(|_| async { Ok(json!(42)) })
            .put(|call: Call| async move {
                let v: i64 = call.require(0, "v")?;
                if v < 0 {
                    return Err(PiccoloError::invalid("must be positive"));
                }
                Ok(json!(v))
            })
            .register();
        site.at("fails")
            .get(|_| async { Err(PiccoloError::Device("boom".into())) })
            .register();
        site.at("times")
            .wildcard()
            .get(|call: Call| async move { Ok(json!(call.path_arg()?)) })
            .register();
        site
    }

    #[tokio::test]
    async fn test_get_and_put() {
        let site = test_site();
        let r = site.dispatch(Verb::Get, "value", None).await;
        assert_eq!(r.code, Code::Content);
        assert_eq!(r.payload, json!(42));
        let r = site.dispatch(Verb::Put, "value", Some(b"7")).await;
        assert_eq!(r.code, Code::Changed);
        assert_eq!(r.payload, json!(7));
    }

    #[tokio::test]
    async fn test_payload_variants() {
        let site = test_site();
        // Positional list.
        let r = site.dispatch(Verb::Put, "value", Some(b"[7]")).await;
        assert_eq!(r.payload, json!(7));
        // Keyword map.
        let r = site.dispatch(Verb::Put, "value", Some(br#"{"v": 8}"#)).await;
        assert_eq!(r.payload, json!(8));
        // Pair form.
        let r = site
            .dispatch(Verb::Put, "value", Some(br#"[[9], {}]"#))
            .await;
        assert_eq!(r.payload, json!(9));
        // Keyword beats nothing, missing parameter is a bad request.
        let r = site.dispatch(Verb::Put, "value", Some(br#"{}"#)).await;
        assert_eq!(r.code, Code::BadRequest);
    }

    #[tokio::test]
    async fn test_error_classes() {
        let site = test_site();
        let r = site.dispatch(Verb::Put, "value", Some(b"-3")).await;
        assert_eq!(r.code, Code::BadRequest);
        let r = site.dispatch(Verb::Get, "fails", None).await;
        assert_eq!(r.code, Code::ServerError);
        let r = site.dispatch(Verb::Put, "fails", Some(b"1")).await;
        assert_eq!(r.code, Code::MethodNotAllowed);
        let r = site.dispatch(Verb::Get, "missing", None).await;
        assert_eq!(r.code, Code::NotFound);
        let r = site.dispatch(Verb::Put, "value", Some(b"not json")).await;
        assert_eq!(r.code, Code::BadRequest);
    }

    #[tokio::test]
    async fn test_wildcard_resolution() {
        let site = test_site();
        let r = site.dispatch(Verb::Get, "times/upwelling", None).await;
        assert_eq!(r.payload, json!("upwelling"));
        // Wildcards pass nested remainders through.
        let r = site.dispatch(Verb::Get, "times/a/b", None).await;
        assert_eq!(r.payload, json!("a/b"));
    }

    #[tokio::test]
    async fn test_mount_and_link_format() {
        let mut root = Site::new();
        let mut sub = test_site();
        sub.at("obs")
            .get(|_| async { Ok(json!(1)) })
            .observable(Notifier::new())
            .register();
        root.mount("component", sub);
        let r = root.dispatch(Verb::Get, "component/value", None).await;
        assert_eq!(r.code, Code::Content);
        assert!(root.is_observable("component/obs"));
        assert!(!root.is_observable("component/value"));
        let links = root.link_format();
        assert!(links.contains("</component/value>"));
        assert!(links.contains("</component/obs>;obs"));
    }
}
