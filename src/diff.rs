//! Structural comparison of two parsed configuration trees.
//!
//! Object keys are walked in sorted order, so reordering keys in the source
//! text never shows up as a change. Arrays are compared position by position.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Remove,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// `a.b[2].c`; the empty string is the document root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl Change {
    /// The same change seen from the other direction.
    pub fn invert(&self) -> Change {
        let kind = match self.kind {
            ChangeKind::Add => ChangeKind::Remove,
            ChangeKind::Remove => ChangeKind::Add,
            ChangeKind::Modify => ChangeKind::Modify,
        };
        Change {
            path: self.path.clone(),
            kind,
            old_value: self.new_value.clone(),
            new_value: self.old_value.clone(),
        }
    }
}

/// Compare `old` against `new`, returning changes ordered by a depth-first
/// walk with sorted object keys.
pub fn diff_values(old: &Value, new: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    walk("", old, new, &mut changes);
    changes
}

fn walk(path: &str, old: &Value, new: &Value, out: &mut Vec<Change>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();

            for key in keys {
                let child = object_path(path, key);
                match (old_map.get(key), new_map.get(key)) {
                    (None, Some(added)) => out.push(Change {
                        path: child,
                        kind: ChangeKind::Add,
                        old_value: None,
                        new_value: Some(added.clone()),
                    }),
                    (Some(removed), None) => out.push(Change {
                        path: child,
                        kind: ChangeKind::Remove,
                        old_value: Some(removed.clone()),
                        new_value: None,
                    }),
                    (Some(o), Some(n)) => walk(&child, o, n, out),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let len = old_items.len().max(new_items.len());
            for i in 0..len {
                let child = format!("{}[{}]", path, i);
                match (old_items.get(i), new_items.get(i)) {
                    (None, Some(added)) => out.push(Change {
                        path: child,
                        kind: ChangeKind::Add,
                        old_value: None,
                        new_value: Some(added.clone()),
                    }),
                    (Some(removed), None) => out.push(Change {
                        path: child,
                        kind: ChangeKind::Remove,
                        old_value: Some(removed.clone()),
                        new_value: None,
                    }),
                    (Some(o), Some(n)) => walk(&child, o, n, out),
                    (None, None) => {}
                }
            }
        }
        // Scalars that differ, or a change of type at this path.
        _ => out.push(Change {
            path: path.to_string(),
            kind: ChangeKind::Modify,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }),
    }
}

fn object_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}
