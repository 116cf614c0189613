//! Query handling shared by all API collections
//!
//! Every collection endpoint accepts `limit`, `sort=field:asc|desc`,
//! cursor pagination via `after`/`before` on item id, and arbitrary
//! equality filters. Filters compare both sides as strings, so callers
//! can match numeric and string fields alike.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{NodeError, NodeResult};

/// Query parameter names that are not equality filters
const RESERVED_PARAMS: [&str; 4] = ["after", "before", "limit", "sort"];

#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    pub max_filter_fields: usize,
}

/// Filter, sort, and paginate one collection
pub fn apply_query(
    items: Vec<Value>,
    params: &HashMap<String, String>,
    limits: &QueryLimits,
) -> NodeResult<Vec<Value>> {
    let limit = match params.get("limit") {
        None => limits.default_page_limit,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| NodeError::InvalidQuery(format!("limit {:?} is not an integer", raw)))?,
    };
    if limit > limits.max_page_limit {
        return Err(NodeError::InvalidQuery(format!(
            "limit {} exceeds the maximum of {}",
            limit, limits.max_page_limit
        )));
    }

    let filters: Vec<(&String, &String)> = params
        .iter()
        .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()))
        .collect();
    if filters.len() > limits.max_filter_fields {
        return Err(NodeError::InvalidQuery(format!(
            "{} filter fields exceed the maximum of {}",
            filters.len(),
            limits.max_filter_fields
        )));
    }

    let mut filtered: Vec<Value> = items
        .into_iter()
        .filter(|item| {
            filters
                .iter()
                .all(|(key, expected)| stringify(item.get(key.as_str())) == **expected)
        })
        .collect();

    if let Some(spec) = params.get("sort") {
        sort_items(&mut filtered, spec)?;
    }

    if let Some(after) = params.get("after") {
        let page = match filtered.iter().position(|item| item_id(item) == *after) {
            Some(position) => filtered.into_iter().skip(position + 1).take(limit).collect(),
            None => Vec::new(),
        };
        return Ok(page);
    }
    if let Some(before) = params.get("before") {
        let page = match filtered.iter().position(|item| item_id(item) == *before) {
            Some(position) => {
                let start = position.saturating_sub(limit);
                filtered[start..position].to_vec()
            }
            None => Vec::new(),
        };
        return Ok(page);
    }

    filtered.truncate(limit);
    Ok(filtered)
}

fn item_id(item: &Value) -> String {
    stringify(item.get("id"))
}

/// Render a field the way filters compare it
fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn sort_items(items: &mut [Value], spec: &str) -> NodeResult<()> {
    let (field, direction) = spec.split_once(':').unwrap_or((spec, "asc"));
    let descending = match direction {
        "asc" => false,
        "desc" => true,
        _ => {
            return Err(NodeError::InvalidQuery(format!(
                "sort direction {:?} is not asc or desc",
                direction
            )))
        }
    };

    items.sort_by(|a, b| {
        let left = a.get(field);
        let right = b.get(field);
        let ordering = match (left.and_then(Value::as_f64), right.and_then(Value::as_f64)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            _ => stringify(left).cmp(&stringify(right)),
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> QueryLimits {
        QueryLimits {
            default_page_limit: 2,
            max_page_limit: 5,
            max_filter_fields: 2,
        }
    }

    fn items() -> Vec<Value> {
        vec![
            json!({"id": "a", "price": 3, "side": "bid"}),
            json!({"id": "b", "price": 1, "side": "ask"}),
            json!({"id": "c", "price": 2, "side": "bid"}),
            json!({"id": "d", "price": 5, "side": "bid"}),
        ]
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_limit_applies() {
        let page = apply_query(items(), &params(&[]), &limits()).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(item_id(&page[0]), "a");
    }

    #[test]
    fn test_limit_cap_rejected() {
        let err = apply_query(items(), &params(&[("limit", "6")]), &limits()).unwrap_err();
        assert!(matches!(err, NodeError::InvalidQuery(_)));
        let err = apply_query(items(), &params(&[("limit", "many")]), &limits()).unwrap_err();
        assert!(matches!(err, NodeError::InvalidQuery(_)));
    }

    #[test]
    fn test_filters_compare_stringified() {
        let page = apply_query(
            items(),
            &params(&[("side", "bid"), ("price", "2"), ("limit", "5")]),
            &limits(),
        )
        .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(item_id(&page[0]), "c");
    }

    #[test]
    fn test_too_many_filter_fields_rejected() {
        let err = apply_query(
            items(),
            &params(&[("side", "bid"), ("price", "2"), ("id", "c")]),
            &limits(),
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::InvalidQuery(_)));
    }

    #[test]
    fn test_after_cursor() {
        let page = apply_query(items(), &params(&[("after", "b")]), &limits()).unwrap();
        let ids: Vec<String> = page.iter().map(item_id).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let missing = apply_query(items(), &params(&[("after", "zz")]), &limits()).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_before_cursor_takes_preceding_page() {
        let page = apply_query(items(), &params(&[("before", "d")]), &limits()).unwrap();
        let ids: Vec<String> = page.iter().map(item_id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_sort_numeric_desc() {
        let page = apply_query(
            items(),
            &params(&[("sort", "price:desc"), ("limit", "5")]),
            &limits(),
        )
        .unwrap();
        let ids: Vec<String> = page.iter().map(item_id).collect();
        assert_eq!(ids, vec!["d", "a", "c", "b"]);

        let err = apply_query(items(), &params(&[("sort", "price:sideways")]), &limits());
        assert!(err.is_err());
    }
}
