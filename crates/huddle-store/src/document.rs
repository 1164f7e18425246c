//! The generic document-store interface the membership adapter is written
//! against.
//!
//! Documents are JSON objects carrying a numeric `id`. Filters and updates
//! mirror the small subset of document-database operators the adapter
//! needs: equality over dotted paths (traversing arrays), `$set`, `$push`,
//! `$addToSet`, `$pull`, and array-filtered pulls from nested arrays.

use serde_json::{Map, Value};

use crate::error::Result;

pub type Document = Value;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Some value at `path` equals the operand, or is an array containing it.
    Eq(String, Value),
    /// Negation of [`Filter::Eq`].
    Ne(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(path.into(), value.into())
    }

    pub fn by_id(id: i64) -> Self {
        Filter::eq("id", id)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, operand) => path_equals(doc, path, operand),
            Filter::Ne(path, operand) => !path_equals(doc, path, operand),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

fn path_equals(doc: &Value, path: &str, operand: &Value) -> bool {
    let mut found = Vec::new();
    collect_path(doc, path, &mut found);
    found.iter().any(|v| {
        *v == operand
            || matches!(v, Value::Array(items) if items.iter().any(|item| item == operand))
    })
}

/// Collect every value reachable at `path`, descending into arrays at any
/// level.
fn collect_path<'a>(doc: &'a Value, path: &str, out: &mut Vec<&'a Value>) {
    if path.is_empty() {
        out.push(doc);
        return;
    }
    match doc {
        Value::Array(items) => {
            for item in items {
                collect_path(item, path, out);
            }
        }
        Value::Object(map) => {
            let (head, rest) = path.split_once('.').unwrap_or((path, ""));
            if let Some(next) = map.get(head) {
                collect_path(next, rest, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the named fields.
    Set(Vec<(String, Value)>),
    /// Append to an array field.
    Push { field: String, value: Value },
    /// Append unless an equal element is already present.
    AddToSet { field: String, value: Value },
    /// Remove array elements matching the filter.
    Pull { field: String, matching: Filter },
    /// For every element of `array`, remove entries of each of its `fields`
    /// arrays that match the filter.
    PullNested {
        array: String,
        fields: Vec<String>,
        matching: Filter,
    },
    /// Several updates applied in order to the same document.
    Batch(Vec<Update>),
}

impl Update {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        Update::Set(vec![(field.into(), value)])
    }

    /// Apply to a document in place. Returns `true` if anything changed.
    pub fn apply(&self, doc: &mut Value) -> bool {
        match self {
            Update::Set(fields) => {
                let mut changed = false;
                for (path, value) in fields {
                    if let Some(slot) = field_mut(doc, path) {
                        if slot != value {
                            *slot = value.clone();
                            changed = true;
                        }
                    }
                }
                changed
            }
            Update::Push { field, value } => match array_mut(doc, field) {
                Some(items) => {
                    items.push(value.clone());
                    true
                }
                None => false,
            },
            Update::AddToSet { field, value } => match array_mut(doc, field) {
                Some(items) if !items.contains(value) => {
                    items.push(value.clone());
                    true
                }
                _ => false,
            },
            Update::Pull { field, matching } => match array_mut(doc, field) {
                Some(items) => retain_unmatched(items, matching),
                None => false,
            },
            Update::PullNested {
                array,
                fields,
                matching,
            } => {
                let Some(elements) = array_mut(doc, array) else {
                    return false;
                };
                let mut changed = false;
                for element in elements.iter_mut() {
                    for field in fields {
                        if let Some(items) = element.get_mut(field).and_then(Value::as_array_mut) {
                            changed |= retain_unmatched(items, matching);
                        }
                    }
                }
                changed
            }
            Update::Batch(updates) => {
                let mut changed = false;
                for update in updates {
                    changed |= update.apply(doc);
                }
                changed
            }
        }
    }
}

fn retain_unmatched(items: &mut Vec<Value>, matching: &Filter) -> bool {
    let before = items.len();
    items.retain(|item| !matching.matches(item));
    items.len() != before
}

/// Resolve a dotted path to a mutable slot, creating intermediate objects
/// and a `null` leaf when absent. Returns `None` if a non-object is in the
/// way.
fn field_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    Some(current)
}

fn array_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Vec<Value>> {
    let slot = field_mut(doc, path)?;
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// Outcome of an update call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

/// Collections of JSON documents. Implementations are synchronous; the
/// async adapter moves calls onto the blocking pool.
///
/// Documents come back in insertion order.
pub trait DocumentStore: Send + Sync {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.find(collection, filter)?.into_iter().next())
    }

    fn insert_one(&self, collection: &str, doc: Document) -> Result<()>;

    fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<()> {
        for doc in docs {
            self.insert_one(collection, doc)?;
        }
        Ok(())
    }

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult>;

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult>;

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64>;

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Highest numeric `id` in the collection, if any document has one.
    fn max_id(&self, collection: &str) -> Result<Option<i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group() -> Value {
        json!({
            "id": 1,
            "creator": { "id": 7, "username": "owner" },
            "admins": [{ "id": 7, "username": "owner" }],
            "members": [{ "id": 8, "username": "bob" }],
            "channels": [
                { "id": 3, "creator": { "id": 7 }, "admins": [{ "id": 7 }], "members": [{ "id": 8 }] },
                { "id": 4, "creator": { "id": 8 }, "admins": [{ "id": 8 }], "members": [] }
            ]
        })
    }

    #[test]
    fn eq_traverses_nested_arrays() {
        let doc = group();
        assert!(Filter::eq("creator.id", 7).matches(&doc));
        assert!(Filter::eq("members.username", "bob").matches(&doc));
        assert!(Filter::eq("channels.members.id", 8).matches(&doc));
        assert!(!Filter::eq("channels.members.id", 7).matches(&doc));
        assert!(Filter::ne("creator.id", 8).matches(&doc));
    }

    #[test]
    fn or_and_compose() {
        let doc = group();
        let f = Filter::Or(vec![Filter::eq("id", 99), Filter::eq("creator.username", "owner")]);
        assert!(f.matches(&doc));
        let f = Filter::And(vec![Filter::eq("id", 1), Filter::eq("creator.id", 8)]);
        assert!(!f.matches(&doc));
    }

    #[test]
    fn pull_removes_matching_elements() {
        let mut doc = group();
        let pulled = Update::Pull {
            field: "members".into(),
            matching: Filter::eq("id", 8),
        }
        .apply(&mut doc);
        assert!(pulled);
        assert_eq!(doc["members"], json!([]));

        let again = Update::Pull {
            field: "members".into(),
            matching: Filter::eq("id", 8),
        }
        .apply(&mut doc);
        assert!(!again);
    }

    #[test]
    fn pull_nested_reaches_every_element() {
        let mut doc = group();
        let changed = Update::PullNested {
            array: "channels".into(),
            fields: vec!["admins".into(), "members".into()],
            matching: Filter::eq("id", 8),
        }
        .apply(&mut doc);
        assert!(changed);
        assert_eq!(doc["channels"][0]["members"], json!([]));
        assert_eq!(doc["channels"][1]["admins"], json!([]));
        assert_eq!(doc["channels"][0]["admins"], json!([{ "id": 7 }]));
    }

    #[test]
    fn add_to_set_is_whole_value_unique() {
        let mut doc = json!({ "tags": [] });
        let add = Update::AddToSet { field: "tags".into(), value: json!("a") };
        assert!(add.apply(&mut doc));
        assert!(!add.apply(&mut doc));
        assert_eq!(doc["tags"], json!(["a"]));
    }

    #[test]
    fn set_creates_missing_fields_and_reports_no_op() {
        let mut doc = json!({ "id": 1 });
        assert!(Update::set("profile.name", json!("x")).apply(&mut doc));
        assert_eq!(doc["profile"]["name"], "x");
        assert!(!Update::set("profile.name", json!("x")).apply(&mut doc));
    }

    #[test]
    fn push_onto_missing_array() {
        let mut doc = json!({ "id": 1 });
        assert!(Update::Push { field: "channels".into(), value: json!({ "id": 1 }) }.apply(&mut doc));
        assert_eq!(doc["channels"].as_array().map(Vec::len), Some(1));
    }
}
