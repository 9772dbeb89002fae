//! Structural diff between two spec snapshots.
//!
//! Objects are walked key by key in sorted order and arrays index by index, so the
//! same pair of inputs always renders the same way.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value as Json;

use crate::ClassifyError;

/// Upper bound on nodes visited per side before giving up.
pub const DEFAULT_MAX_NODES: usize = 100_000;

/// One changed leaf or subtree. A missing side means the field was added or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub path: String,
    pub before: Option<Json>,
    pub after: Option<Json>,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.path, render(self.before.as_ref()), render(self.after.as_ref()))
    }
}

fn render(v: Option<&Json>) -> String {
    match v {
        None => "<none>".to_string(),
        Some(Json::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecDiff {
    pub changes: Vec<FieldChange>,
}

impl SpecDiff {
    pub fn is_empty(&self) -> bool { self.changes.is_empty() }

    pub fn find(&self, path: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.path == path)
    }
}

impl fmt::Display for SpecDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            return f.write_str("no spec changes");
        }
        for (i, c) in self.changes.iter().enumerate() {
            if i > 0 { f.write_str("; ")?; }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() { key.to_string() } else { format!("{}.{}", prefix, key) }
}

fn walk(path: &str, before: &Json, after: &Json, out: &mut Vec<FieldChange>) {
    match (before, after) {
        (Json::Object(bo), Json::Object(ao)) => {
            let keys: BTreeSet<&String> = bo.keys().chain(ao.keys()).collect();
            for k in keys {
                let p = join(path, k);
                match (bo.get(k), ao.get(k)) {
                    (Some(bv), Some(av)) => {
                        if bv != av { walk(&p, bv, av, out); }
                    }
                    (b, a) => out.push(FieldChange { path: p, before: b.cloned(), after: a.cloned() }),
                }
            }
        }
        (Json::Array(ba), Json::Array(aa)) => {
            for i in 0..ba.len().max(aa.len()) {
                let p = format!("{}[{}]", path, i);
                match (ba.get(i), aa.get(i)) {
                    (Some(bv), Some(av)) => {
                        if bv != av { walk(&p, bv, av, out); }
                    }
                    (b, a) => out.push(FieldChange { path: p, before: b.cloned(), after: a.cloned() }),
                }
            }
        }
        (b, a) => {
            if b != a {
                out.push(FieldChange { path: path.to_string(), before: Some(b.clone()), after: Some(a.clone()) });
            }
        }
    }
}

/// Diff `before` against `after` with the default node budget.
pub fn diff_specs(before: &Json, after: &Json) -> Result<SpecDiff, ClassifyError> {
    diff_specs_with_budget(before, after, DEFAULT_MAX_NODES)
}

pub fn diff_specs_with_budget(before: &Json, after: &Json, max_nodes: usize) -> Result<SpecDiff, ClassifyError> {
    for (side, v) in [("previous", before), ("current", after)] {
        if !v.is_object() {
            return Err(ClassifyError::MalformedSnapshot(format!("{} spec is not an object", side)));
        }
        if node_budget_exceeded(v, max_nodes) {
            return Err(ClassifyError::TooComplex(max_nodes));
        }
    }
    let mut changes = Vec::new();
    walk("", before, after, &mut changes);
    Ok(SpecDiff { changes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replica_change_names_field_and_both_values() {
        let d = diff_specs(&json!({ "replicas": 3, "paused": false }), &json!({ "replicas": 5, "paused": false })).unwrap();
        assert_eq!(d.changes.len(), 1);
        let c = d.find("replicas").unwrap();
        assert_eq!(c.before, Some(json!(3)));
        assert_eq!(c.after, Some(json!(5)));
        assert_eq!(d.to_string(), "replicas: 3 → 5");
    }

    #[test]
    fn nested_adds_removes_and_array_elements() {
        let before = json!({
            "template": { "spec": { "containers": [ { "name": "web", "image": "nginx:1.25" } ] } },
            "strategy": { "type": "Recreate" }
        });
        let after = json!({
            "template": { "spec": { "containers": [ { "name": "web", "image": "nginx:1.27" }, { "name": "sidecar" } ] } },
            "minReadySeconds": 10
        });
        let d = diff_specs(&before, &after).unwrap();
        let paths: Vec<_> = d.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "minReadySeconds",
                "strategy",
                "template.spec.containers[0].image",
                "template.spec.containers[1]",
            ]
        );
        assert_eq!(d.find("minReadySeconds").unwrap().before, None);
        assert_eq!(d.find("strategy").unwrap().after, None);
        assert!(d.to_string().contains("template.spec.containers[0].image: nginx:1.25 → nginx:1.27"));
    }

    #[test]
    fn identical_specs_produce_empty_diff() {
        let s = json!({ "replicas": 2, "selector": { "matchLabels": { "app": "x" } } });
        let d = diff_specs(&s, &s).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.to_string(), "no spec changes");
    }

    #[test]
    fn malformed_or_oversized_specs_fail() {
        assert!(matches!(diff_specs(&json!(null), &json!({})), Err(ClassifyError::MalformedSnapshot(_))));
        let big = json!({ "a": [1, 2, 3, 4, 5, 6, 7, 8] });
        assert_eq!(diff_specs_with_budget(&json!({}), &big, 4), Err(ClassifyError::TooComplex(4)));
    }
}
