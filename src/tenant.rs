//! Tenant-qualified database naming for the pre-consolidation layout.

/// Database holding one tenant's devices: `<base>-<tenant-id>`.
pub fn tenant_db_name(base: &str, tenant_id: &str) -> String {
    format!("{base}-{tenant_id}")
}

/// The tenant id encoded in a database name, if the name matches the
/// `<base>-<tenant-id>` pattern.
pub fn tenant_from_db_name<'a>(base: &str, db_name: &'a str) -> Option<&'a str> {
    db_name
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_roundtrip() {
        let name = tenant_db_name("inventory", "acme");
        assert_eq!(name, "inventory-acme");
        assert_eq!(tenant_from_db_name("inventory", &name), Some("acme"));
    }

    #[test]
    fn non_tenant_names_do_not_match() {
        assert_eq!(tenant_from_db_name("inventory", "inventory"), None);
        assert_eq!(tenant_from_db_name("inventory", "inventory-"), None);
        assert_eq!(tenant_from_db_name("inventory", "admin"), None);
        assert_eq!(tenant_from_db_name("inventory", "other-acme"), None);
    }
}
