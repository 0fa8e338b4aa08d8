use std::collections::HashSet;

use fedlink_core::ObjectId;
use serde::{Deserialize, Serialize};

/// Shape of a deflated message: each node names one object and its children.
///
/// Shared objects (identical chunks) appear once per reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTree {
    pub object_id: ObjectId,
    pub children: Vec<ObjectTree>,
}

impl ObjectTree {
    pub fn leaf(object_id: ObjectId) -> Self {
        Self {
            object_id,
            children: Vec::new(),
        }
    }

    /// Distinct object ids in iteration order (root last).
    pub fn unique_ids(&self) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        iterate_object_tree(self)
            .into_iter()
            .map(|node| node.object_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Post-order walk: every node is yielded after its children, root last.
pub fn iterate_object_tree(tree: &ObjectTree) -> Vec<&ObjectTree> {
    let mut out = Vec::new();
    let mut stack = vec![(tree, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            out.push(node);
            continue;
        }
        stack.push((node, true));
        for child in node.children.iter().rev() {
            stack.push((child, false));
        }
    }
    out
}
