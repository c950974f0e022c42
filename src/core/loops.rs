//! KF-007: Loop expansion: `for_each` and `count` into loop items.
//!
//! Precedence: `for_each`, then `count`, then a single instance.

use super::error::{Error, Result};
use super::render::Renderer;
use super::types::{Attributes, LoopItem, Value};

/// Compute the loop items of a block. Returns whether the block loops
/// with `for_each` semantics (`each.key`/`each.value`) and the items.
/// A `count` above `max_count` is rejected before anything is allocated.
pub fn get_loop_items(
    renderer: &Renderer<'_>,
    attributes: &Attributes,
    max_count: usize,
) -> Result<(bool, Vec<LoopItem>)> {
    if let Some(for_each) = &attributes.for_each {
        let rendered = renderer.render(for_each.clone())?;
        return Ok((true, for_each_items(rendered)));
    }

    if let Some(count) = &attributes.count {
        let rendered = renderer.render(count.clone())?;
        let n = count_value(&rendered)?;
        if u64::try_from(n).map_or(true, |n| n > max_count as u64) {
            return Err(Error::TypeMismatch {
                attribute: "count".to_string(),
                expected: format!("count <= {}", max_count),
                actual: n.to_string(),
            });
        }
        let items = (0..n)
            .map(|i| LoopItem {
                key: Value::Int(i),
                value: Value::Int(i),
            })
            .collect();
        return Ok((false, items));
    }

    Ok((
        false,
        vec![LoopItem {
            key: Value::Int(0),
            value: Value::Null,
        }],
    ))
}

fn for_each_items(rendered: Value) -> Vec<LoopItem> {
    match rendered {
        Value::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, value)| LoopItem {
                key: Value::Int(i as i64),
                value,
            })
            .collect(),
        Value::Map(m) => m
            .into_iter()
            .map(|(k, value)| LoopItem {
                key: Value::String(k),
                value,
            })
            .collect(),
        scalar => vec![LoopItem {
            key: Value::Int(0),
            value: scalar,
        }],
    }
}

fn count_value(rendered: &Value) -> Result<i64> {
    let n = match rendered {
        Value::Int(n) => *n,
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| Error::TypeMismatch {
            attribute: "count".to_string(),
            expected: "integer string".to_string(),
            actual: format!("\"{}\"", s),
        })?,
        other => {
            return Err(Error::TypeMismatch {
                attribute: "count".to_string(),
                expected: "int or string".to_string(),
                actual: other.type_name().to_string(),
            })
        }
    };
    if n < 0 {
        return Err(Error::TypeMismatch {
            attribute: "count".to_string(),
            expected: "non-negative integer".to_string(),
            actual: n.to_string(),
        });
    }
    Ok(n)
}
