//! Graph builder: compiles a point-in-time [`EntityStore`] into a [`Dag`].
//!
//! Every pass starts from scratch. Roots are processed in namespace/name order
//! and delegation is followed depth-first with an explicit ancestor path, so a
//! delegate reachable through several non-overlapping paths is not mistaken
//! for a cycle. Validation failures are attached to the resource that owns the
//! offending entry; they never abort the pass.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::policy;
use super::source::{
    EntityStore, FullName, RouteSpec, RoutingResource, ServiceRef, TlsSpec,
    UpstreamValidationSpec, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY,
};
use super::status::{Status, StatusRecord};
use super::{
    Cluster, Dag, PeerValidationContext, Route, Secret, SecureVirtualHost, Service, TcpProxy,
    TimeoutSetting, TlsVersion, VirtualHost,
};

/// Static settings that shape every build pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Lowest TLS version any secure virtual host may negotiate.
    pub minimum_tls_version: TlsVersion,
    /// Certificate served to clients that send no SNI, for hosts that opt in.
    pub fallback_certificate: Option<FullName>,
    /// Namespaces allowed to hold root resources. Empty allows all.
    pub root_namespaces: Vec<String>,
    /// Ignore `permitInsecure` on routes.
    pub disable_permit_insecure: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            minimum_tls_version: TlsVersion::V1_1,
            fallback_certificate: None,
            root_namespaces: Vec::new(),
            disable_permit_insecure: false,
        }
    }
}

/// Result of one build pass.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub dag: Dag,
    pub statuses: BTreeMap<FullName, StatusRecord>,
}

impl BuildOutput {
    pub fn status(&self, name: &FullName) -> Option<&Status> {
        self.statuses.get(name).map(|record| &record.status)
    }

    /// Counts of (valid, invalid, orphaned) records.
    pub fn status_counts(&self) -> (usize, usize, usize) {
        self.statuses.values().fold((0, 0, 0), |(valid, invalid, orphaned), record| {
            match record.status {
                Status::Valid => (valid + 1, invalid, orphaned),
                Status::Invalid(_) => (valid, invalid + 1, orphaned),
                Status::Orphaned => (valid, invalid, orphaned + 1),
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: BuilderConfig,
}

impl Builder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Run one full build pass over `store`.
    pub fn build(&self, store: &dyn EntityStore) -> BuildOutput {
        let mut pass = BuildPass::new(&self.config, store);
        pass.run();
        let output = pass.finish();

        let (valid, invalid, orphaned) = output.status_counts();
        info!(
            phase = "build",
            virtual_hosts = output.dag.virtual_hosts.len(),
            secure_virtual_hosts = output.dag.secure_virtual_hosts.len(),
            valid,
            invalid,
            orphaned,
            "Built routing graph"
        );
        output
    }
}

struct BuildPass<'a> {
    config: &'a BuilderConfig,
    store: &'a dyn EntityStore,
    virtual_hosts: BTreeMap<String, VirtualHost>,
    secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
    statuses: BTreeMap<FullName, StatusRecord>,
    orphaned: BTreeSet<FullName>,
}

impl<'a> BuildPass<'a> {
    fn new(config: &'a BuilderConfig, store: &'a dyn EntityStore) -> Self {
        Self {
            config,
            store,
            virtual_hosts: BTreeMap::new(),
            secure_virtual_hosts: BTreeMap::new(),
            statuses: BTreeMap::new(),
            orphaned: BTreeSet::new(),
        }
    }

    fn run(&mut self) {
        let store = self.store;

        let mut roots: BTreeMap<String, Vec<&'a RoutingResource>> = BTreeMap::new();
        for resource in store.routing_resources() {
            match &resource.virtual_host {
                Some(vhost) => {
                    roots.entry(vhost.fqdn.trim().to_string()).or_default().push(resource)
                }
                None => {
                    self.orphaned.insert(resource.full_name());
                }
            }
        }

        let mut valid_roots = Vec::with_capacity(roots.len());
        for (fqdn, group) in roots {
            if let [root] = group.as_slice() {
                valid_roots.push(*root);
                continue;
            }

            let mut conflicting: Vec<String> =
                group.iter().map(|resource| resource.full_name().to_string()).collect();
            conflicting.sort();
            let reason = format!(
                "fqdn {:?} is used in multiple routing resources: {}",
                fqdn,
                conflicting.join(", ")
            );
            for resource in group {
                self.set_invalid(&resource.full_name(), Some(&fqdn), reason.clone());
            }
        }

        valid_roots.sort_by_key(|resource| resource.full_name());
        for root in valid_roots {
            self.compute_root(root);
        }

        for name in std::mem::take(&mut self.orphaned) {
            self.statuses.entry(name.clone()).or_insert(StatusRecord {
                object: name,
                status: Status::Orphaned,
                vhost: None,
            });
        }
    }

    fn finish(self) -> BuildOutput {
        let virtual_hosts =
            self.virtual_hosts.into_iter().filter(|(_, vhost)| vhost.is_valid()).collect();
        let secure_virtual_hosts = self
            .secure_virtual_hosts
            .into_iter()
            .filter(|(_, svhost)| svhost.is_valid())
            .collect();

        BuildOutput { dag: Dag { virtual_hosts, secure_virtual_hosts }, statuses: self.statuses }
    }

    fn compute_root(&mut self, resource: &'a RoutingResource) {
        let name = resource.full_name();
        let Some(vhost) = &resource.virtual_host else {
            return;
        };

        if !self.root_allowed(&resource.namespace) {
            self.set_invalid(
                &name,
                None,
                "root routing resource cannot be defined in this namespace",
            );
            return;
        }

        let host = vhost.fqdn.trim();
        if host.is_empty() {
            self.set_invalid(&name, None, "virtualHost.fqdn must be specified");
            return;
        }

        let mut enforce_tls = false;
        let mut passthrough = false;
        if let Some(tls) = &vhost.tls {
            passthrough = tls.secret_name.is_empty() && tls.passthrough;
            if !passthrough {
                if let Err(reason) = self.resolve_tls(resource, host, tls) {
                    self.set_invalid(&name, Some(host), reason);
                    return;
                }
                enforce_tls = true;
            }
        }

        if resource.tcp_proxy.is_some() && (passthrough || enforce_tls) {
            self.process_tcp_proxy(resource, &[], host);
        }

        let enforce_tls = resource.tcp_proxy.is_none() && enforce_tls;
        self.process_routes(resource, "", &[], host, enforce_tls);
    }

    /// Resolve the serving certificate and TLS settings for a root, creating
    /// its secure virtual host.
    fn resolve_tls(
        &mut self,
        resource: &RoutingResource,
        host: &str,
        tls: &TlsSpec,
    ) -> Result<(), String> {
        let store = self.store;
        let namespace = resource.namespace.as_str();

        let secret_name = FullName::parse(&tls.secret_name, namespace);
        let secret = self
            .lookup_tls_secret(&secret_name)
            .map_err(|e| format!("virtualHost.tls Secret {:?} is invalid: {}", tls.secret_name, e))?;

        if !store.delegation_permitted(&secret_name, namespace) {
            return Err(format!(
                "virtualHost.tls Secret {:?} certificate delegation not permitted",
                tls.secret_name
            ));
        }

        let min_tls_version = self
            .config
            .minimum_tls_version
            .max(TlsVersion::parse(&tls.minimum_protocol_version))
            .max(TlsVersion::V1_1);
        let max_tls_version = match TlsVersion::parse(&tls.maximum_protocol_version) {
            TlsVersion::Auto => TlsVersion::V1_3,
            version => version,
        };
        if min_tls_version > max_tls_version {
            return Err(format!(
                "virtualHost.tls minimum protocol version {} exceeds maximum protocol version {}",
                min_tls_version.as_str(),
                max_tls_version.as_str()
            ));
        }

        let downstream_validation = match &tls.client_validation {
            Some(validation) => {
                let ca_name = FullName::new(namespace, &validation.ca_secret);
                let ca_certificate = self
                    .lookup_ca_secret(&ca_name)
                    .map_err(|e| format!("virtualHost.tls client validation is invalid: {e}"))?;
                Some(PeerValidationContext { ca_certificate, subject_name: String::new() })
            }
            None => None,
        };

        let fallback_certificate = if tls.enable_fallback_certificate {
            if downstream_validation.is_some() {
                return Err("virtualHost.tls fallback & client validation are incompatible".into());
            }
            let Some(fallback_name) = &self.config.fallback_certificate else {
                return Err(
                    "virtualHost.tls enabled fallback but the fallback certificate is not configured"
                        .into(),
                );
            };
            if !store.delegation_permitted(fallback_name, namespace) {
                return Err(format!(
                    "virtualHost.tls fallback Secret {:?} is not configured for certificate delegation",
                    fallback_name.to_string()
                ));
            }
            let fallback = self.lookup_tls_secret(fallback_name).map_err(|e| {
                format!("virtualHost.tls fallback Secret {:?} is invalid: {}", fallback_name.to_string(), e)
            })?;
            Some(fallback)
        } else {
            None
        };

        let svhost = self.secure_virtual_host(host);
        svhost.secret = Some(secret);
        svhost.min_tls_version = min_tls_version;
        svhost.max_tls_version = max_tls_version;
        svhost.downstream_validation = downstream_validation;
        svhost.fallback_certificate = fallback_certificate;
        Ok(())
    }

    /// Walk a resource's route entries. `visited` holds the ancestors of
    /// `resource` on the current delegation path.
    fn process_routes(
        &mut self,
        resource: &'a RoutingResource,
        prefix_match: &str,
        visited: &[FullName],
        host: &str,
        enforce_tls: bool,
    ) {
        let store = self.store;
        let name = resource.full_name();
        let mut path = visited.to_vec();
        path.push(name.clone());

        for route in &resource.routes {
            if !route.services.is_empty() && route.delegate.is_some() {
                self.set_invalid(
                    &name,
                    Some(host),
                    format!(
                        "route {:?}: cannot specify services and delegate in the same route",
                        route.path_match
                    ),
                );
                continue;
            }

            if !route.services.is_empty() {
                match self.build_route(resource, route, prefix_match, enforce_tls) {
                    Ok(built) => {
                        if enforce_tls {
                            self.secure_virtual_host(host).virtual_host.add_route(built.clone());
                        }
                        self.virtual_host(host).add_route(built);
                    }
                    Err(reason) => self.set_invalid(&name, Some(host), reason),
                }
                continue;
            }

            let Some(delegate) = &route.delegate else {
                continue;
            };

            let namespace = delegate
                .namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .unwrap_or(&resource.namespace);
            let target_name = FullName::new(namespace, &delegate.name);
            let Some(target) = store.routing_resource(&target_name) else {
                debug!(resource = %name, delegate = %target_name, "Delegate routing resource not found");
                continue;
            };

            self.orphaned.remove(&target_name);

            if path.contains(&target_name) {
                self.set_invalid(
                    &name,
                    Some(host),
                    format!("route creates a delegation cycle: {}", cycle_path(&path, &target_name)),
                );
                continue;
            }

            self.process_routes(target, &route.path_match, &path, host, enforce_tls);
        }

        self.set_valid(&name, Some(host));
    }

    fn process_tcp_proxy(&mut self, resource: &'a RoutingResource, visited: &[FullName], host: &str) {
        let store = self.store;
        let name = resource.full_name();
        let Some(tcp_proxy) = &resource.tcp_proxy else {
            return;
        };
        let mut path = visited.to_vec();
        path.push(name.clone());

        if !tcp_proxy.services.is_empty() && tcp_proxy.delegate.is_some() {
            self.set_invalid(
                &name,
                Some(host),
                "tcpproxy: cannot specify services and delegate in the same tcpproxy",
            );
            return;
        }

        if !tcp_proxy.services.is_empty() {
            let mut clusters = Vec::with_capacity(tcp_proxy.services.len());
            for service in &tcp_proxy.services {
                let Some(upstream) = self.lookup_service(&resource.namespace, service) else {
                    self.set_invalid(
                        &name,
                        Some(host),
                        format!(
                            "tcpproxy: service {}/{}/{}: not found",
                            resource.namespace, service.name, service.port
                        ),
                    );
                    return;
                };
                clusters.push(Cluster {
                    protocol: upstream.protocol.clone(),
                    upstream,
                    load_balancer_policy: service.strategy.clone().unwrap_or_default(),
                    weight: service.weight,
                    health_check: None,
                    upstream_validation: None,
                    idle_timeout: None,
                });
            }
            if policy::total_weight(clusters.iter().map(|cluster| cluster.weight.max(1))).is_none() {
                self.set_invalid(
                    &name,
                    Some(host),
                    format!("tcpproxy: service weights must not sum to more than {}", u32::MAX),
                );
                return;
            }
            self.secure_virtual_host(host).tcp_proxy = Some(TcpProxy { clusters });
            self.set_valid(&name, Some(host));
            return;
        }

        let Some(delegate) = &tcp_proxy.delegate else {
            return;
        };

        let namespace =
            delegate.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(&resource.namespace);
        let target_name = FullName::new(namespace, &delegate.name);
        let Some(target) = store.routing_resource(&target_name) else {
            debug!(resource = %name, delegate = %target_name, "Delegate tcpproxy resource not found");
            return;
        };

        self.orphaned.remove(&target_name);

        if path.contains(&target_name) {
            self.set_invalid(
                &name,
                Some(host),
                format!("tcpproxy creates a delegation cycle: {}", cycle_path(&path, &target_name)),
            );
            return;
        }

        if target.tcp_proxy.is_none() {
            self.set_invalid(
                &name,
                Some(host),
                format!("tcpproxy: delegate {target_name} does not define a tcpproxy"),
            );
            return;
        }

        self.process_tcp_proxy(target, &path, host);
    }

    fn build_route(
        &self,
        resource: &RoutingResource,
        spec: &RouteSpec,
        prefix_match: &str,
        enforce_tls: bool,
    ) -> Result<Route, String> {
        let prefix = if spec.path_match.is_empty() { "/" } else { spec.path_match.as_str() };
        if !policy::matches_path_prefix(prefix, prefix_match) {
            return Err(format!(
                "the path prefix {:?} does not match the parent's path prefix {:?}",
                prefix, prefix_match
            ));
        }

        let permit_insecure = spec.permit_insecure && !self.config.disable_permit_insecure;
        let mut route = Route::new(prefix);
        route.websocket = spec.enable_websockets;
        route.https_upgrade = enforce_tls && !permit_insecure;
        route.prefix_rewrite = spec.prefix_rewrite.clone().filter(|rewrite| !rewrite.is_empty());
        route.retry_policy = policy::retry_policy(spec.retry_policy.as_ref());
        route.hash_policies = policy::hash_policies(&spec.hash_policy);

        if let Some(headers) = &spec.request_headers_policy {
            route.request_headers_policy = Some(policy::headers_policy(headers, true)?);
        }
        if let Some(headers) = &spec.response_headers_policy {
            route.response_headers_policy = Some(policy::headers_policy(headers, false)?);
        }

        if let Some(value) = &spec.idle_timeout {
            let timeout = policy::idle_timeout(value)
                .map_err(|e| format!("route {:?}: {}", spec.path_match, e))?;
            route.idle_timeout = Some(timeout);
        }

        route.timeout = policy::response_timeout(
            spec.timeout_policy.as_ref().and_then(|policy| policy.request.as_deref()),
        );
        if let Some(value) = &spec.timeout {
            let timeout = policy::route_timeout(value)
                .map_err(|e| format!("route {:?}: {}", spec.path_match, e))?;
            if route.timeout == TimeoutSetting::Default {
                route.timeout = timeout;
            }
        }

        route.tracing = policy::tracing_sampling(spec.tracing.as_ref())
            .map_err(|e| format!("route {:?}: {}", spec.path_match, e))?;

        if !spec.header_match.is_empty() {
            if !policy::header_conditions_valid(&spec.header_match) {
                return Err(
                    "cannot specify duplicate header 'exact match' conditions in the same route"
                        .to_string(),
                );
            }
            route.header_conditions = policy::header_conditions(&spec.header_match);
        }

        for service in &spec.services {
            route.clusters.push(self.build_cluster(resource, spec, service)?);
        }
        if policy::total_weight(route.clusters.iter().map(|cluster| cluster.weight)).is_none() {
            return Err(format!(
                "route {:?}: service weights must not sum to more than {}",
                spec.path_match,
                u32::MAX
            ));
        }

        Ok(route)
    }

    fn build_cluster(
        &self,
        resource: &RoutingResource,
        route: &RouteSpec,
        service: &ServiceRef,
    ) -> Result<Cluster, String> {
        if !(1..=65535).contains(&service.port) {
            return Err(format!(
                "route {:?}: service {:?}: port must be in the range 1-65535",
                route.path_match, service.name
            ));
        }

        let upstream = self.lookup_service(&resource.namespace, service).ok_or_else(|| {
            format!("Service [{}:{}] is invalid or missing", service.name, service.port)
        })?;

        let upstream_validation = if upstream.protocol == "tls" {
            self.lookup_upstream_validation(
                service.upstream_validation.as_ref(),
                &resource.namespace,
            )
            .map_err(|e| {
                format!(
                    "Service [{}:{}] TLS upstream validation policy error: {}",
                    service.name, service.port, e
                )
            })?
        } else {
            None
        };

        let idle_timeout = match &service.idle_timeout {
            Some(value) => Some(policy::idle_timeout(value).map_err(|e| {
                format!("route: {:?} service {:?}: {}", route.path_match, service.name, e)
            })?),
            None => None,
        };

        Ok(Cluster {
            protocol: upstream.protocol.clone(),
            upstream,
            load_balancer_policy: service.strategy.clone().unwrap_or_default(),
            weight: service.weight,
            health_check: policy::health_check_policy(service.health_check.as_ref()),
            upstream_validation,
            idle_timeout,
        })
    }

    fn lookup_service(&self, namespace: &str, service: &ServiceRef) -> Option<Service> {
        let port = i32::try_from(service.port).ok().filter(|port| (1..=65535).contains(port))?;
        let name = FullName::new(namespace, &service.name);
        let (_, service_port) = self.store.lookup_service(&name, port)?;
        Some(Service {
            name,
            port,
            port_name: service_port.name.clone(),
            protocol: service_port.upstream_protocol.clone(),
        })
    }

    fn lookup_tls_secret(&self, name: &FullName) -> Result<Secret, String> {
        let record = self.store.lookup_secret(name).ok_or_else(|| "Secret not found".to_string())?;
        for key in [TLS_CERT_KEY, TLS_KEY_KEY] {
            if record.data.get(key).map_or(true, String::is_empty) {
                return Err(format!("missing {key}"));
            }
        }
        Ok(Secret::from_record(record))
    }

    fn lookup_ca_secret(&self, name: &FullName) -> Result<Secret, String> {
        let record = self.store.lookup_secret(name).ok_or_else(|| "Secret not found".to_string())?;
        if record.data.get(CA_CERT_KEY).map_or(true, String::is_empty) {
            return Err(format!("missing {CA_CERT_KEY}"));
        }
        Ok(Secret::from_record(record))
    }

    fn lookup_upstream_validation(
        &self,
        spec: Option<&UpstreamValidationSpec>,
        namespace: &str,
    ) -> Result<Option<PeerValidationContext>, String> {
        let Some(spec) = spec else {
            return Ok(None);
        };

        let ca_certificate = self
            .lookup_ca_secret(&FullName::new(namespace, &spec.ca_secret))
            .map_err(|e| format!("invalid CA Secret {:?}: {}", spec.ca_secret, e))?;
        if spec.subject_name.is_empty() {
            return Err("missing subject alternative name".to_string());
        }

        Ok(Some(PeerValidationContext { ca_certificate, subject_name: spec.subject_name.clone() }))
    }

    fn root_allowed(&self, namespace: &str) -> bool {
        self.config.root_namespaces.is_empty()
            || self.config.root_namespaces.iter().any(|allowed| allowed == namespace)
    }

    fn virtual_host(&mut self, host: &str) -> &mut VirtualHost {
        self.virtual_hosts.entry(host.to_string()).or_insert_with(|| VirtualHost::new(host))
    }

    fn secure_virtual_host(&mut self, host: &str) -> &mut SecureVirtualHost {
        self.secure_virtual_hosts
            .entry(host.to_string())
            .or_insert_with(|| SecureVirtualHost::new(host))
    }

    /// Record an invalid status. The first reason recorded in a pass sticks.
    fn set_invalid(&mut self, object: &FullName, vhost: Option<&str>, reason: impl Into<String>) {
        if self.statuses.get(object).is_some_and(|record| record.status.is_invalid()) {
            return;
        }

        let reason = reason.into();
        debug!(resource = %object, vhost = vhost.unwrap_or_default(), %reason, "Routing resource invalid");
        self.statuses.insert(
            object.clone(),
            StatusRecord {
                object: object.clone(),
                status: Status::Invalid(reason),
                vhost: vhost.map(str::to_string),
            },
        );
    }

    /// Record a valid status unless the resource was already found invalid.
    fn set_valid(&mut self, object: &FullName, vhost: Option<&str>) {
        if self.statuses.get(object).is_some_and(|record| record.status.is_invalid()) {
            return;
        }

        self.statuses.insert(
            object.clone(),
            StatusRecord {
                object: object.clone(),
                status: Status::Valid,
                vhost: vhost.map(str::to_string),
            },
        );
    }
}

fn cycle_path(path: &[FullName], target: &FullName) -> String {
    path.iter().chain(std::iter::once(target)).map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}
