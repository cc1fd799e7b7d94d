//! Core reference-data model and display-name derivation for the CSRS reporting sync.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "csrs-core";

/// Joins ancestor names in a flattened organisation name.
pub const ORGANISATION_NAME_SEPARATOR: &str = " | ";

/// Id → display string payload handed to the fact-table updater, ordered by id.
pub type FormattedNames = BTreeMap<i64, String>;

/// Organisational unit as read from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationNode {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

impl OrganisationNode {
    pub fn new(id: i64, name: impl Into<String>, parent_id: Option<i64>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub id: i64,
    pub name: String,
}

impl GradeRecord {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("parent chain of organisation {id} revisits organisation {revisited}")]
    Cycle { id: i64, revisited: i64 },
    #[error("unknown organisation {0}")]
    UnknownOrganisation(i64),
}

/// A parent reference that points at no loaded organisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub organisation_id: i64,
    pub missing_parent_id: i64,
}

/// Snapshot of the organisation tree keyed by id.
#[derive(Debug, Clone, Default)]
pub struct OrganisationHierarchy {
    nodes: BTreeMap<i64, OrganisationNode>,
}

impl OrganisationHierarchy {
    /// Builds the lookup; a repeated id replaces the earlier node.
    pub fn from_nodes(nodes: impl IntoIterator<Item = OrganisationNode>) -> Self {
        let nodes = nodes.into_iter().map(|node| (node.id, node)).collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root-first, separator-joined name for a single organisation.
    ///
    /// The walk stops at a root or at a parent id missing from the snapshot,
    /// keeping whatever has been accumulated. Revisiting an id is reported as
    /// [`HierarchyError::Cycle`].
    pub fn formatted_name(&self, id: i64) -> Result<String, HierarchyError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(HierarchyError::UnknownOrganisation(id))?;

        let mut segments = vec![node.name.as_str()];
        let mut visited = BTreeSet::from([node.id]);
        let mut current_parent_id = node.parent_id;

        while let Some(parent_id) = current_parent_id {
            let Some(parent) = self.nodes.get(&parent_id) else {
                break;
            };
            if !visited.insert(parent.id) {
                return Err(HierarchyError::Cycle {
                    id,
                    revisited: parent.id,
                });
            }
            segments.push(parent.name.as_str());
            current_parent_id = parent.parent_id;
        }

        segments.reverse();
        Ok(segments.join(ORGANISATION_NAME_SEPARATOR))
    }

    /// Formatted names for every organisation in the snapshot.
    pub fn flatten(&self) -> Result<FormattedNames, HierarchyError> {
        self.nodes
            .keys()
            .map(|&id| self.formatted_name(id).map(|name| (id, name)))
            .collect()
    }

    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        self.nodes
            .values()
            .filter_map(|node| {
                let parent_id = node.parent_id?;
                (!self.nodes.contains_key(&parent_id)).then_some(DanglingReference {
                    organisation_id: node.id,
                    missing_parent_id: parent_id,
                })
            })
            .collect()
    }
}

/// Grade names pass through unchanged.
pub fn grade_names(records: impl IntoIterator<Item = GradeRecord>) -> FormattedNames {
    records
        .into_iter()
        .map(|record| (record.id, record.name))
        .collect()
}
