use crate::model::Organization;
use crate::types::OrganizationId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Parent/child relation between organizations.
///
/// When disabled, [`Hierarchy::downstream`] is the identity function.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    enabled: bool,
    children: HashMap<OrganizationId, Vec<OrganizationId>>,
}

impl Hierarchy {
    /// A hierarchy that never expands.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Builds the child index from `(id, parent)` edges.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (OrganizationId, Option<OrganizationId>)>,
    {
        let mut children: HashMap<OrganizationId, Vec<OrganizationId>> = HashMap::new();
        for (id, parent) in edges {
            if let Some(parent) = parent {
                children.entry(parent).or_default().push(id);
            }
        }
        Self {
            enabled: true,
            children,
        }
    }

    /// Builds the child index from organization records.
    pub fn from_organizations<'a, I>(organizations: I) -> Self
    where
        I: IntoIterator<Item = &'a Organization>,
    {
        Self::from_edges(
            organizations
                .into_iter()
                .map(|org| (org.id.clone(), org.parent.clone())),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the input plus every organization transitively below it.
    ///
    /// Cycles and self-parenting terminate: each organization is visited once.
    pub fn downstream(&self, roots: &BTreeSet<OrganizationId>) -> BTreeSet<OrganizationId> {
        if !self.enabled {
            return roots.clone();
        }

        let mut visited: HashSet<&OrganizationId> = HashSet::new();
        let mut stack: Vec<&OrganizationId> = roots.iter().collect();
        let mut output = roots.clone();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(children) = self.children.get(current) else {
                continue;
            };
            for child in children {
                if visited.contains(child) {
                    continue;
                }
                output.insert(child.clone());
                stack.push(child);
            }
        }

        output
    }
}
