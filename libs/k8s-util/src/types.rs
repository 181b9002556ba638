use kube::Resource;

/// Returns the last path segment of a resource's type name, e.g.
/// `proxmox_machine::ProxmoxMachine` -> `ProxmoxMachine`.
///
/// Useful for metric labels and log fields where the fully qualified path is noise.
#[must_use]
pub fn short_type_name<K: Resource>() -> &'static str {
    let name = std::any::type_name::<K>();
    name.rsplit("::").next().unwrap_or(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn short_type_name_strips_path() {
        assert_eq!(short_type_name::<Pod>(), "Pod");
    }
}
