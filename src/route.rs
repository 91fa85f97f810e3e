//! Routes and the immutable route table
//!
//! A [`RouteTable`] is built in one go from a registry snapshot and never
//! modified afterwards. The locator swaps whole tables.

use crate::instance::{Instance, InstanceId};
use hyper::Uri;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Metadata key marking an instance's routes as sensitive
pub const SENSITIVE_METADATA_KEY: &str = "sensitive";

/// Maps one public path segment to an instance's management base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub instance_id: InstanceId,
    pub instance_name: String,
    pub target: Uri,
    pub health_url: Option<Uri>,
    pub sensitive: bool,
}

impl Route {
    /// Build the route for an instance.
    ///
    /// Returns `None` when the instance has no usable management URL (falls
    /// back to the service URL) or its id cannot be used as a path segment.
    pub fn from_instance(instance: &Instance) -> Option<Self> {
        let id = instance.id.as_str();
        if !is_path_segment(id) {
            debug!(instance_id = %instance.id, "Instance id is not a valid route segment");
            return None;
        }

        let registration = &instance.registration;
        let target = registration
            .management_url
            .as_deref()
            .or(registration.service_url.as_deref())
            .and_then(parse_base_url);

        let Some(target) = target else {
            debug!(instance_id = %instance.id, "Instance has no resolvable management URL");
            return None;
        };

        Some(Self {
            id: id.to_string(),
            instance_id: instance.id.clone(),
            instance_name: registration.name.clone(),
            target,
            health_url: registration.health_url.as_deref().and_then(parse_base_url),
            sensitive: registration
                .metadata
                .get(SENSITIVE_METADATA_KEY)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Target URL for `rest` (the path after the route id) below the base URL
    pub fn target_for(&self, rest: &str, query: Option<&str>) -> Option<Uri> {
        join_uri(&self.target, rest, query)
    }

    /// Target URL below the registered health URL, if any
    pub fn health_target_for(&self, rest: &str, query: Option<&str>) -> Option<Uri> {
        self.health_url
            .as_ref()
            .and_then(|base| join_uri(base, rest, query))
    }
}

/// Immutable set of routes keyed by route id
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    generation: u64,
    routes: BTreeMap<String, Arc<Route>>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(instances: &[Instance], generation: u64) -> Self {
        let routes = instances
            .iter()
            .filter_map(Route::from_instance)
            .map(|route| (route.id.clone(), Arc::new(route)))
            .collect();
        Self { generation, routes }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, route_id: &str) -> Option<&Arc<Route>> {
        self.routes.get(route_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    /// Route id -> target URL, for introspection
    pub fn targets(&self) -> BTreeMap<String, String> {
        self.routes
            .iter()
            .map(|(id, route)| (id.clone(), route.target.to_string()))
            .collect()
    }

    pub fn summary(&self) -> Vec<RouteSummary> {
        self.routes
            .values()
            .map(|route| RouteSummary {
                id: route.id.clone(),
                instance_id: route.instance_id.to_string(),
                name: route.instance_name.clone(),
                target: route.target.to_string(),
                health_url: route.health_url.as_ref().map(|u| u.to_string()),
                sensitive: route.sensitive,
            })
            .collect()
    }
}

/// Two tables are equal when they hold the same routes, whatever their generation.
impl PartialEq for RouteTable {
    fn eq(&self, other: &Self) -> bool {
        self.routes == other.routes
    }
}

impl Eq for RouteTable {}

/// Serializable view of a route
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    pub sensitive: bool,
}

fn is_path_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

fn parse_base_url(url: &str) -> Option<Uri> {
    let uri: Uri = url.trim().parse().ok()?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return None,
    }
    uri.authority()?;
    Some(uri)
}

fn join_uri(base: &Uri, rest: &str, query: Option<&str>) -> Option<Uri> {
    let base_path = base.path().trim_end_matches('/');
    let mut path = String::with_capacity(base_path.len() + rest.len() + 1);
    path.push_str(base_path);
    if !rest.is_empty() && !rest.starts_with('/') {
        path.push('/');
    }
    path.push_str(rest);
    if path.is_empty() {
        path.push('/');
    }

    let path_and_query = match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    Uri::builder()
        .scheme(base.scheme_str()?)
        .authority(base.authority()?.as_str())
        .path_and_query(path_and_query)
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Registration;

    fn instance(id: &str, registration: Registration) -> Instance {
        Instance::new(InstanceId::new(id), registration)
    }

    #[test]
    fn test_route_from_management_url() {
        let i = instance(
            "app1",
            Registration::new("billing")
                .with_management_url("http://10.0.0.5:8081")
                .with_health_url("http://10.0.0.5:8081/health"),
        );
        let route = Route::from_instance(&i).unwrap();
        assert_eq!(route.id, "app1");
        assert_eq!(route.instance_name, "billing");
        assert_eq!(route.target, "http://10.0.0.5:8081/".parse::<Uri>().unwrap());
        assert!(route.health_url.is_some());
        assert!(!route.sensitive);
    }

    #[test]
    fn test_route_falls_back_to_service_url() {
        let i = instance("app1", Registration::new("billing").with_service_url("https://svc:443/base"));
        let route = Route::from_instance(&i).unwrap();
        assert_eq!(route.target.to_string(), "https://svc:443/base");
    }

    #[test]
    fn test_unresolvable_instances_are_excluded() {
        let health_only = instance("a", Registration::new("x").with_health_url("http://h:1/health"));
        assert!(Route::from_instance(&health_only).is_none());

        let relative = instance("b", Registration::new("x").with_management_url("/actuator"));
        assert!(Route::from_instance(&relative).is_none());

        let ftp = instance("c", Registration::new("x").with_management_url("ftp://h/actuator"));
        assert!(Route::from_instance(&ftp).is_none());

        let bad_id = instance("a/b", Registration::new("x").with_management_url("http://h:1"));
        assert!(Route::from_instance(&bad_id).is_none());
    }

    #[test]
    fn test_sensitive_flag_from_metadata() {
        let i = instance(
            "app1",
            Registration::new("billing")
                .with_management_url("http://h:1")
                .with_metadata("sensitive", "TRUE"),
        );
        assert!(Route::from_instance(&i).unwrap().sensitive);
    }

    #[test]
    fn test_target_for_joins_paths() {
        let i = instance("app1", Registration::new("billing").with_management_url("http://10.0.0.5:8081"));
        let route = Route::from_instance(&i).unwrap();
        assert_eq!(
            route.target_for("/health", None).unwrap().to_string(),
            "http://10.0.0.5:8081/health"
        );
        assert_eq!(
            route.target_for("", None).unwrap().to_string(),
            "http://10.0.0.5:8081/"
        );
        assert_eq!(
            route.target_for("/metrics/jvm.memory.used", Some("tag=area:heap"))
                .unwrap()
                .to_string(),
            "http://10.0.0.5:8081/metrics/jvm.memory.used?tag=area:heap"
        );

        let nested = instance("app2", Registration::new("x").with_management_url("http://h:1/actuator/"));
        let route = Route::from_instance(&nested).unwrap();
        assert_eq!(
            route.target_for("/env", None).unwrap().to_string(),
            "http://h:1/actuator/env"
        );
    }

    #[test]
    fn test_table_build_is_idempotent() {
        let instances = vec![
            instance("a", Registration::new("x").with_management_url("http://h:1")),
            instance("b", Registration::new("y").with_management_url("http://h:2")),
            instance("c", Registration::new("z").with_health_url("http://h:3/health")),
        ];
        let first = RouteTable::build(&instances, 1);
        let second = RouteTable::build(&instances, 2);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.get("c").is_none());
        assert_eq!(second.generation(), 2);
        assert_eq!(first.targets().get("b").map(String::as_str), Some("http://h:2/"));
    }
}
