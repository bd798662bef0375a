use prometheus_client::registry::Registry;

/// Creates (or re-opens) a namespaced sub-registry so each subsystem's metrics collector can
/// register its own instruments without needing a reference to the top-level registry.
pub fn sub_registry<'a>(registry: &'a mut Registry, namespace: &'static str) -> &'a mut Registry {
	registry.sub_registry_with_prefix(namespace)
}
