use std::borrow::Cow;

use pip_core::Labels;
use rustc_hash::FxHashMap;

use crate::model::ResourceData;

/// Label added to every namespace so selectors can match on its name.
pub const NAMESPACE_NAME_LABEL: &str = "projectcalico.org/name";

/// Namespace and service account labels of one snapshot.
#[derive(Debug, Default)]
pub(crate) struct NamespaceHandler {
    namespaces: FxHashMap<String, Labels>,
    service_accounts: FxHashMap<(String, String), Labels>,
}

impl NamespaceHandler {
    pub(crate) fn new(data: &ResourceData) -> Self {
        let namespaces = data
            .namespaces
            .iter()
            .filter_map(|ns| {
                let name = ns.metadata.name.clone()?;
                let mut labels = ns.metadata.labels.clone().unwrap_or_default();
                labels.insert(NAMESPACE_NAME_LABEL.to_string(), name.clone());
                Some((name, labels))
            })
            .collect();
        let service_accounts = data
            .service_accounts
            .iter()
            .filter_map(|sa| {
                let name = sa.metadata.name.clone()?;
                let ns = sa.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
                Some(((ns, name), sa.metadata.labels.clone().unwrap_or_default()))
            })
            .collect();
        Self { namespaces, service_accounts }
    }

    /// Labels of `namespace`; a namespace missing from the snapshot only carries its name label.
    pub(crate) fn namespace_labels(&self, namespace: &str) -> Cow<'_, Labels> {
        match self.namespaces.get(namespace) {
            Some(l) => Cow::Borrowed(l),
            None => Cow::Owned([(NAMESPACE_NAME_LABEL.to_string(), namespace.to_string())].into()),
        }
    }

    pub(crate) fn service_account_labels(&self, namespace: &str, name: &str) -> Option<&Labels> {
        self.service_accounts.get(&(namespace.to_string(), name.to_string()))
    }
}
