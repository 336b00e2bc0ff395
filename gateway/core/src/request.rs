//! Resource addressing and the request/response shapes shared by both
//! transports.

use crate::{Error, Result};
use bytes::Bytes;
use http::{header, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// The group token that names the core (empty) API group.
pub const CORE_GROUP: &str = "_";

/// The server-side timeout requested for watches. Must be less than 295s or
/// the API server rejects the watch.
const WATCH_TIMEOUT_SECS: u32 = 290;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Names a collection of resources, e.g. `_/v1/pods` or `apps/v1/deployments`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType {
    /// The API group. Empty for the core group.
    group: String,
    version: String,
    resource: String,
}

/// The unvalidated coordinates of a resource operation, as received from a
/// caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRoute {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// A request against a cluster's API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,

    /// The request path, including any query string.
    pub path: String,

    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// A successful response from a cluster's API server.
///
/// Both transports produce this same shape so that callers never need to know
/// how a cluster is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

// === impl ResourceType ===

impl ResourceType {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Result<Self> {
        let mut group = group.into();
        if group == CORE_GROUP {
            group.clear();
        }
        let version = version.into();
        let resource = resource.into();

        if !group.is_empty() {
            validate_subdomain("group", &group)?;
        }
        if version.is_empty()
            || !version
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(Error::invalid("version", format!("{version:?}")));
        }
        validate_subdomain("resource", &resource)?;

        Ok(Self {
            group,
            version,
            resource,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_core(&self) -> bool {
        self.group.is_empty()
    }

    /// Returns the API path of this resource's collection, optionally scoped to
    /// a namespace.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        let mut path = if self.is_core() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if let Some(ns) = namespace {
            path.push_str("/namespaces/");
            path.push_str(ns);
        }
        path.push('/');
        path.push_str(&self.resource);
        path
    }

    /// Builds a watch request over all of this resource's objects, resuming from
    /// `resource_version` when one is known.
    pub fn watch_request(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> ApiRequest {
        let mut path = format!(
            "{}?watch=true&allowWatchBookmarks=true&timeoutSeconds={}",
            self.collection_path(namespace),
            WATCH_TIMEOUT_SECS
        );
        if let Some(rv) = resource_version {
            path.push_str("&resourceVersion=");
            path.push_str(&urlencoding::encode(rv));
        }
        ApiRequest::get(path)
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    /// Parses `group/version/resource`, or `version/resource` for the core group.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s.split('/').collect::<Vec<_>>();
        match parts.as_slice() {
            [group, version, resource] => Self::new(*group, *version, *resource),
            [version, resource] => Self::new("", *version, *resource),
            _ => Err(Error::invalid("resource type", format!("{s:?}"))),
        }
    }
}

impl TryFrom<String> for ResourceType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ResourceType> for String {
    fn from(rt: ResourceType) -> Self {
        rt.to_string()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.is_core() {
            CORE_GROUP
        } else {
            &self.group
        };
        write!(f, "{}/{}/{}", group, self.version, self.resource)
    }
}

// === impl ResourceRoute ===

impl ResourceRoute {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace: None,
            name: None,
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn resource_type(&self) -> Result<ResourceType> {
        ResourceType::new(&*self.group, &*self.version, &*self.resource)
    }

    /// Canonicalizes the route into an API path, rejecting malformed segments.
    ///
    /// An empty namespace or name is treated as absent.
    pub fn path(&self) -> Result<String> {
        let rt = self.resource_type()?;

        let namespace = match self.namespace.as_deref() {
            None | Some("") => None,
            Some(ns) => {
                validate_label("namespace", ns)?;
                Some(ns)
            }
        };

        let mut path = rt.collection_path(namespace);
        match self.name.as_deref() {
            None | Some("") => {}
            Some(name) => {
                validate_name(name)?;
                path.push('/');
                path.push_str(name);
            }
        }
        Ok(path)
    }
}

// === impl ApiRequest ===

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body. A JSON content type is assumed when none has been
    /// set; patches default to a merge patch.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        if !self.body.is_empty() && !self.headers.contains_key(header::CONTENT_TYPE.as_str()) {
            let content_type = if self.method == Method::PATCH {
                "application/merge-patch+json"
            } else {
                "application/json"
            };
            self.headers
                .insert(header::CONTENT_TYPE.to_string(), content_type.to_string());
        }
        self
    }

    pub fn into_http(self) -> Result<http::Request<Vec<u8>>> {
        let mut builder = http::Request::builder()
            .method(self.method)
            .uri(self.path);
        for (k, v) in self.headers.iter() {
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder
            .body(self.body.to_vec())
            .map_err(|e| Error::invalid("request", e))
    }
}

// === impl ApiResponse ===

impl ApiResponse {
    /// Surfaces an upstream status unchanged: successful statuses become a
    /// response and all others become [`Error::Upstream`].
    pub fn from_upstream(status: StatusCode, body: Bytes) -> Result<Self> {
        if status.is_success() {
            Ok(Self { status, body })
        } else {
            Err(Error::Upstream { status, body })
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Transport(format!("invalid response body: {e}")))
    }
}

fn validate_label(field: &'static str, s: &str) -> Result<()> {
    let valid = !s.is_empty()
        && s.len() <= MAX_LABEL_LEN
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(field, format!("{s:?}")))
    }
}

fn validate_subdomain(field: &'static str, s: &str) -> Result<()> {
    let valid = !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && !s.starts_with(['-', '.'])
        && !s.ends_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(field, format!("{s:?}")))
    }
}

// Object names are looser than DNS names: RBAC objects, for instance, commonly
// contain colons.
fn validate_name(s: &str) -> Result<()> {
    let valid = s.len() <= MAX_NAME_LEN
        && s != "."
        && s != ".."
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':' | b'@')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::invalid("name", format!("{s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_paths() {
        for (route, path) in [
            (
                ResourceRoute::new("_", "v1", "pods").namespace("default"),
                "/api/v1/namespaces/default/pods",
            ),
            (ResourceRoute::new("", "v1", "nodes"), "/api/v1/nodes"),
            (
                ResourceRoute::new("_", "v1", "pods")
                    .namespace("kube-system")
                    .name("coredns-5d78c9869d-abcde"),
                "/api/v1/namespaces/kube-system/pods/coredns-5d78c9869d-abcde",
            ),
            (
                ResourceRoute::new("apps", "v1", "deployments").namespace("web"),
                "/apis/apps/v1/namespaces/web/deployments",
            ),
            (
                ResourceRoute::new("rbac.authorization.k8s.io", "v1", "clusterroles")
                    .name("system:controller:job-controller"),
                "/apis/rbac.authorization.k8s.io/v1/clusterroles/system:controller:job-controller",
            ),
            (
                ResourceRoute::new("_", "v1", "namespaces").namespace("").name(""),
                "/api/v1/namespaces",
            ),
        ] {
            assert_eq!(route.path().unwrap(), path);
        }
    }

    #[test]
    fn rejects_malformed_segments() {
        for (route, field) in [
            (ResourceRoute::new("_", "", "pods"), "version"),
            (ResourceRoute::new("_", "v1", ""), "resource"),
            (ResourceRoute::new("_", "v1", "pods/log"), "resource"),
            (ResourceRoute::new("Apps", "v1", "deployments"), "group"),
            (
                ResourceRoute::new("_", "v1", "pods").namespace("../secrets"),
                "namespace",
            ),
            (
                ResourceRoute::new("_", "v1", "pods").namespace("-bad"),
                "namespace",
            ),
            (
                ResourceRoute::new("_", "v1", "pods")
                    .namespace("default")
                    .name(".."),
                "name",
            ),
            (
                ResourceRoute::new("_", "v1", "pods")
                    .namespace("default")
                    .name("a/b"),
                "name",
            ),
            (
                ResourceRoute::new("_", "v1", "pods")
                    .namespace("default")
                    .name("a?watch=true"),
                "name",
            ),
        ] {
            match route.path() {
                Err(Error::Validation { field: f, .. }) => assert_eq!(f, field, "{route:?}"),
                res => panic!("expected {field} validation error for {route:?}; got {res:?}"),
            }
        }
    }

    #[test]
    fn parses_resource_types() {
        let pods = "_/v1/pods".parse::<ResourceType>().unwrap();
        assert!(pods.is_core());
        assert_eq!(pods, "v1/pods".parse().unwrap());
        assert_eq!(pods.to_string(), "_/v1/pods");

        let deploys = "apps/v1/deployments".parse::<ResourceType>().unwrap();
        assert_eq!(deploys.group(), "apps");
        assert_eq!(deploys.collection_path(None), "/apis/apps/v1/deployments");

        assert!("pods".parse::<ResourceType>().is_err());
        assert!("a/b/c/d".parse::<ResourceType>().is_err());
    }

    #[test]
    fn watch_request_resumes_from_version() {
        let pods = ResourceType::new("_", "v1", "pods").unwrap();
        let req = pods.watch_request(None, Some("1234"));
        assert_eq!(req.method, Method::GET);
        assert_eq!(
            req.path,
            "/api/v1/pods?watch=true&allowWatchBookmarks=true&timeoutSeconds=290&resourceVersion=1234"
        );
    }

    #[test]
    fn watch_request_encodes_resource_versions() {
        let pods = ResourceType::new("_", "v1", "pods").unwrap();
        let req = pods.watch_request(Some("default"), Some("12&watch=false #x"));
        assert_eq!(
            req.path,
            "/api/v1/namespaces/default/pods?watch=true&allowWatchBookmarks=true&timeoutSeconds=290&resourceVersion=12%26watch%3Dfalse%20%23x"
        );
    }

    #[test]
    fn upstream_statuses_are_surfaced() {
        let rsp = ApiResponse::from_upstream(StatusCode::OK, Bytes::from_static(b"{}")).unwrap();
        assert_eq!(rsp.status, StatusCode::OK);

        match ApiResponse::from_upstream(StatusCode::NOT_FOUND, Bytes::from_static(b"nope")) {
            Err(Error::Upstream { status, body }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, Bytes::from_static(b"nope"));
            }
            res => panic!("unexpected {res:?}"),
        }
    }

    #[test]
    fn body_sets_content_type() {
        let req = ApiRequest::new(Method::PATCH, "/api/v1/namespaces/default/pods/p")
            .body(Bytes::from_static(b"{}"));
        assert_eq!(
            req.headers.get("content-type").map(String::as_str),
            Some("application/merge-patch+json")
        );

        let req = ApiRequest::new(Method::POST, "/api/v1/namespaces/default/pods")
            .header("content-type", "application/yaml")
            .body(Bytes::from_static(b"a: b"));
        assert_eq!(
            req.headers.get("content-type").map(String::as_str),
            Some("application/yaml")
        );
    }
}
