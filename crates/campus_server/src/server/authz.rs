#![forbid(unsafe_code)]

use campus_domain::{Identity, Namespace, Role};

/// Static configuration for one chat surface.
///
/// The four namespaces share one controller; each is just a value of this.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceSpec {
	pub namespace: Namespace,
	pub allowed_roles: &'static [Role],
}

impl NamespaceSpec {
	pub fn of(namespace: Namespace) -> Self {
		Self {
			namespace,
			allowed_roles: namespace.allowed_roles(),
		}
	}
}

/// Role gate for namespace entry. Pure predicate; the caller disconnects on
/// `false` before any room is joined.
pub fn authorize(spec: &NamespaceSpec, identity: &Identity) -> bool {
	spec.allowed_roles.contains(&identity.role)
}
