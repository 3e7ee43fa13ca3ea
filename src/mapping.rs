use crate::error::Error;
use crate::naming::decamelize;
use crate::table::{Record, Table};
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of one rule applied to one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    NoMatch,
    /// Exclusive label; a different label for the same record is a conflict.
    Label(String),
    /// Non-exclusive labels or typed facts (`"feature: coupon"`), unioned.
    Labels(Vec<String>),
}

/// Data a rule may consult besides the record itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingContext<'a> {
    /// Table of the source named by `mapping_lookup`, when configured.
    pub lookup: Option<&'a Table>,
}

pub type RuleFn = fn(&Record, &MappingContext<'_>) -> Classification;

#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub apply: RuleFn,
}

/// A named set of rules. Each entry pairs a grouping path
/// (`["Vertical", "ShoppingVertical"]`) with a rule; the leaf grouping,
/// decamelized, is the type written to `<module>_type`.
pub struct RuleModule {
    pub name: &'static str,
    pub entries: &'static [(&'static [&'static str], Rule)],
}

impl RuleModule {
    /// Rules grouped by leaf type, in declaration order.
    pub fn types(&self) -> Result<IndexMap<String, Vec<Rule>>, Error> {
        let mut types: IndexMap<String, Vec<Rule>> = IndexMap::new();
        for (path, rule) in self.entries {
            let leaf = match path.last() {
                Some(s) => decamelize(s)?,
                None => String::new(),
            };
            types.entry(leaf).or_default().push(*rule);
        }
        Ok(types)
    }
}

struct Batch<'m> {
    module: &'m str,
    map_type: String,
    rules: Vec<Rule>,
}

/// Every combination of one type per module.
fn batches<'m>(modules: &[&'m RuleModule]) -> Result<Vec<Vec<Batch<'m>>>, Error> {
    let mut product: Vec<Vec<Batch<'m>>> = vec![Vec::new()];
    for module in modules {
        let types = module.types()?;
        let mut next = Vec::new();
        for combo in &product {
            for (map_type, rules) in &types {
                let mut extended: Vec<Batch<'m>> = combo
                    .iter()
                    .map(|b| Batch {
                        module: b.module,
                        map_type: b.map_type.clone(),
                        rules: b.rules.clone(),
                    })
                    .collect();
                extended.push(Batch {
                    module: module.name,
                    map_type: map_type.clone(),
                    rules: rules.clone(),
                });
                next.push(extended);
            }
        }
        product = next;
    }
    Ok(product)
}

fn label_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn assign_exclusive(
    row: &mut Record,
    column: &str,
    incoming: &str,
    mapping: &str,
    index: usize,
) -> Result<(), Error> {
    match row.get(column) {
        Some(Value::Null) | None => {}
        Some(Value::String(existing)) if existing == incoming => {}
        Some(existing) => {
            return Err(Error::MappingConflict {
                mapping: mapping.to_string(),
                record: index,
                existing: label_text(existing),
                incoming: incoming.to_string(),
            })
        }
    }
    row.insert(column.to_string(), Value::String(incoming.to_string()));
    Ok(())
}

fn union_labels(row: &mut Record, column: &str, labels: &[String], mapping: &str, index: usize) -> Result<(), Error> {
    let mut merged: Vec<Value> = match row.get(column) {
        Some(Value::Null) | None => Vec::new(),
        Some(Value::Array(existing)) => existing.clone(),
        Some(existing) => {
            return Err(Error::MappingConflict {
                mapping: mapping.to_string(),
                record: index,
                existing: label_text(existing),
                incoming: labels.join(", "),
            })
        }
    };
    for label in labels {
        let v = Value::String(label.clone());
        if !merged.contains(&v) {
            merged.push(v);
        }
    }
    row.insert(column.to_string(), Value::Array(merged));
    Ok(())
}

/// Set union of two label values; equal scalars stay scalar.
fn merge_union(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (x, y) if x == y => x.clone(),
        _ => {
            let mut merged: Vec<Value> = Vec::new();
            for v in [a, b] {
                let items = match v {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for item in items {
                    if !merged.contains(&item) {
                        merged.push(item);
                    }
                }
            }
            Value::Array(merged)
        }
    }
}

/// Labels `table` with every module in `modules`.
///
/// Each module x type combination is applied to its own copy of the
/// records. Matches fill `<module>_type` and `<module>_name`; copies of the
/// same record (identified by its position) are then collapsed with their
/// label columns unioned. Records no rule matched are dropped.
pub fn apply(table: &Table, modules: &[&RuleModule], ctx: &MappingContext<'_>) -> Result<Table, Error> {
    if modules.is_empty() {
        return Ok(table.clone());
    }

    let mut labelled: BTreeMap<usize, Record> = BTreeMap::new();
    for batch in batches(modules)? {
        let mut rows: Vec<Record> = table.rows().to_vec();
        let mut classified = vec![false; rows.len()];
        for step in &batch {
            let type_col = format!("{}_type", step.module);
            let name_col = format!("{}_name", step.module);
            for (index, row) in rows.iter_mut().enumerate() {
                row.entry(type_col.clone()).or_insert(Value::Null);
                row.entry(name_col.clone()).or_insert(Value::Null);
                for rule in &step.rules {
                    match (rule.apply)(row, ctx) {
                        Classification::NoMatch => continue,
                        Classification::Label(label) => {
                            assign_exclusive(row, &type_col, &step.map_type, step.module, index)?;
                            assign_exclusive(row, &name_col, &label, step.module, index)?;
                        }
                        Classification::Labels(labels) => {
                            row.insert(type_col.clone(), Value::String(step.map_type.clone()));
                            union_labels(row, &name_col, &labels, step.module, index)?;
                        }
                    }
                    classified[index] = true;
                }
            }
        }

        for (index, row) in rows.into_iter().enumerate() {
            if !classified[index] {
                continue;
            }
            match labelled.get_mut(&index) {
                None => {
                    labelled.insert(index, row);
                }
                Some(existing) => {
                    for step in &batch {
                        for column in [format!("{}_type", step.module), format!("{}_name", step.module)] {
                            let current = existing.get(&column).cloned().unwrap_or(Value::Null);
                            let incoming = row.get(&column).cloned().unwrap_or(Value::Null);
                            existing.insert(column, merge_union(&current, &incoming));
                        }
                    }
                }
            }
        }
    }

    let dropped = table.len() - labelled.len();
    if dropped > 0 {
        debug!("{} unclassified records dropped", dropped);
    }
    Ok(labelled.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn search(r: &Record, _: &MappingContext<'_>) -> Classification {
        if r["object"] == json!("search_bar") {
            Classification::Label("search".to_string())
        } else {
            Classification::NoMatch
        }
    }

    fn search_other(r: &Record, _: &MappingContext<'_>) -> Classification {
        if r["object"] == json!("search_bar") {
            Classification::Label("web_search".to_string())
        } else {
            Classification::NoMatch
        }
    }

    fn coupon(r: &Record, _: &MappingContext<'_>) -> Classification {
        if r["object"] == json!("coupon") {
            Classification::Labels(vec!["feature: coupon".to_string(), "partner: true".to_string()])
        } else {
            Classification::NoMatch
        }
    }

    fn coupon_source(r: &Record, _: &MappingContext<'_>) -> Classification {
        if r["object"] == json!("coupon") {
            Classification::Labels(vec!["source: web".to_string(), "partner: true".to_string()])
        } else {
            Classification::NoMatch
        }
    }

    fn organic(_: &Record, ctx: &MappingContext<'_>) -> Classification {
        match ctx.lookup {
            Some(t) if !t.is_empty() => Classification::Label("Organic".to_string()),
            _ => Classification::NoMatch,
        }
    }

    static FEATURE: RuleModule = RuleModule {
        name: "feature",
        entries: &[
            (&["Feature"], Rule { name: "search", apply: search }),
            (&["ShoppingVertical"], Rule { name: "coupon", apply: coupon }),
            (&["ShoppingVertical"], Rule { name: "coupon_source", apply: coupon_source }),
        ],
    };

    static CONFLICTING: RuleModule = RuleModule {
        name: "feature",
        entries: &[
            (&["Feature"], Rule { name: "search", apply: search }),
            (&["Feature"], Rule { name: "search_other", apply: search_other }),
        ],
    };

    static CHANNEL: RuleModule = RuleModule {
        name: "channel",
        entries: &[(&["Network"], Rule { name: "organic", apply: organic })],
    };

    fn events() -> Table {
        Table::new(vec![
            record(json!({"object": "search_bar"})),
            record(json!({"object": "coupon"})),
            record(json!({"object": "settings"})),
        ])
    }

    #[test]
    fn test_types_are_decamelized_leaves() {
        let types = FEATURE.types().unwrap();
        assert_eq!(types.keys().collect::<Vec<_>>(), vec!["feature", "shopping_vertical"]);
        assert_eq!(types["shopping_vertical"].len(), 2);
    }

    #[test]
    fn test_labels_and_drops_unclassified() {
        let out = apply(&events(), &[&FEATURE], &MappingContext::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.rows()[0]["feature_type"], json!("feature"));
        assert_eq!(out.rows()[0]["feature_name"], json!("search"));
        assert_eq!(out.rows()[1]["feature_type"], json!("shopping_vertical"));
        assert_eq!(
            out.rows()[1]["feature_name"],
            json!(["feature: coupon", "partner: true", "source: web"])
        );
    }

    #[test]
    fn test_conflicting_labels() {
        let err = apply(&events(), &[&CONFLICTING], &MappingContext::default()).unwrap_err();
        match err {
            Error::MappingConflict { mapping, record, existing, incoming } => {
                assert_eq!(mapping, "feature");
                assert_eq!(record, 0);
                assert_eq!(existing, "search");
                assert_eq!(incoming, "web_search");
            }
            other => panic!("Expected MappingConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_product_with_lookup_module() {
        let lookup = Table::new(vec![record(json!({"tracker_token": "abc"}))]);
        let ctx = MappingContext { lookup: Some(&lookup) };
        let out = apply(&events(), &[&FEATURE, &CHANNEL], &ctx).unwrap();
        // every record matches the channel rule, so none are dropped
        assert_eq!(out.len(), 3);
        assert_eq!(out.rows()[2]["channel_name"], json!("Organic"));
        assert_eq!(out.rows()[2]["feature_name"], Value::Null);
        assert_eq!(out.rows()[0]["feature_type"], json!("feature"));
        assert_eq!(out.rows()[0]["feature_name"], json!("search"));
        assert_eq!(out.rows()[1]["feature_type"], json!("shopping_vertical"));
        assert_eq!(out.rows()[1]["channel_type"], json!("network"));
    }

    #[test]
    fn test_no_modules_is_identity() {
        let out = apply(&events(), &[], &MappingContext::default()).unwrap();
        assert_eq!(out, events());
    }
}
