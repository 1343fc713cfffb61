//! 点分路径读写。
//!
//! 支持的语法：`a.b.c`、数组下标 `a[0].b`、源侧通配 `a[*].b` 与根路径 `$`。

use serde_json::{Map, Value};
use thiserror::Error;

/// 路径根标记。
pub const PATH_ROOT: &str = "$";

/// 写入时数组单次补齐的最大元素数。
pub const MAX_ARRAY_GROWTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    /// `[*]`：仅用于读取，展开数组全部元素。
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid path: {0}")]
    Invalid(String),
    #[error("missing intermediate at {path}")]
    MissingIntermediate { path: String },
    #[error("type mismatch at {path}")]
    TypeMismatch { path: String },
    #[error("wildcard not writable: {0}")]
    WildcardWrite(String),
}

/// 解析点分路径；`$` 与空串解析为空段列表（根）。
pub fn parse(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == PATH_ROOT {
        return Ok(Vec::new());
    }
    let body = trimmed.strip_prefix("$.").unwrap_or(trimmed);
    let mut segments = Vec::new();
    for part in body.split('.') {
        if part.is_empty() {
            return Err(PathError::Invalid(path.to_string()));
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(PathError::Invalid(path.to_string()));
        }
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| PathError::Invalid(path.to_string()))?;
            if !rest.starts_with('[') {
                return Err(PathError::Invalid(path.to_string()));
            }
            let inner = &rest[1..close];
            if inner == "*" {
                segments.push(PathSegment::Wildcard);
            } else {
                let index = inner
                    .parse::<usize>()
                    .map_err(|_| PathError::Invalid(path.to_string()))?;
                segments.push(PathSegment::Index(index));
            }
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

/// 读取路径值；包含 `[*]` 时返回展开后的数组。缺失返回 `None`。
pub fn select(doc: &Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    Ok(select_segments(doc, &segments))
}

fn select_segments(doc: &Value, segments: &[PathSegment]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(doc.clone());
    };
    match first {
        PathSegment::Key(key) => doc.get(key.as_str()).and_then(|v| select_segments(v, rest)),
        PathSegment::Index(index) => doc.get(*index).and_then(|v| select_segments(v, rest)),
        PathSegment::Wildcard => {
            let items = doc.as_array()?;
            let collected = items
                .iter()
                .filter_map(|item| select_segments(item, rest))
                .collect();
            Some(Value::Array(collected))
        }
    }
}

/// 按引用读取（不支持通配）。
pub fn get<'a>(doc: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    let segments = parse(path)?;
    let mut current = doc;
    for segment in &segments {
        let next = match segment {
            PathSegment::Key(key) => current.get(key.as_str()),
            PathSegment::Index(index) => current.get(*index),
            PathSegment::Wildcard => return Err(PathError::WildcardWrite(path.to_string())),
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

pub fn exists(doc: &Value, path: &str) -> bool {
    matches!(get(doc, path), Ok(Some(_)))
}

/// 写入路径值。
///
/// 父容器必须存在，除非 `create` 为真（按需创建中间对象并补齐数组）。
/// 根路径写入对象时合并键，否则整体替换。
pub fn write(doc: &mut Value, path: &str, value: Value, create: bool) -> Result<(), PathError> {
    let segments = parse(path)?;
    let Some((last, parents)) = segments.split_last() else {
        match value {
            Value::Object(source) if doc.is_object() => {
                if let Some(target) = doc.as_object_mut() {
                    target.extend(source);
                }
            }
            other => *doc = other,
        }
        return Ok(());
    };

    let mut current = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let lookahead = &segments[depth + 1];
        current = descend(current, segment, lookahead, create, path)?;
    }

    match last {
        PathSegment::Key(key) => {
            if create && current.is_null() {
                *current = Value::Object(Map::new());
            }
            let object = current
                .as_object_mut()
                .ok_or_else(|| PathError::TypeMismatch { path: path.to_string() })?;
            object.insert(key.clone(), value);
        }
        PathSegment::Index(index) => {
            if create && current.is_null() {
                *current = Value::Array(Vec::new());
            }
            let array = current
                .as_array_mut()
                .ok_or_else(|| PathError::TypeMismatch { path: path.to_string() })?;
            if *index > array.len() && !create {
                return Err(PathError::MissingIntermediate { path: path.to_string() });
            }
            grow(array, *index, path)?;
            array[*index] = value;
        }
        PathSegment::Wildcard => return Err(PathError::WildcardWrite(path.to_string())),
    }
    Ok(())
}

fn descend<'a>(
    current: &'a mut Value,
    segment: &PathSegment,
    lookahead: &PathSegment,
    create: bool,
    path: &str,
) -> Result<&'a mut Value, PathError> {
    let empty_container = || match lookahead {
        PathSegment::Index(_) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    };
    match segment {
        PathSegment::Key(key) => {
            if create && current.is_null() {
                *current = Value::Object(Map::new());
            }
            let object = current
                .as_object_mut()
                .ok_or_else(|| PathError::TypeMismatch { path: path.to_string() })?;
            if !object.contains_key(key) {
                if !create {
                    return Err(PathError::MissingIntermediate { path: path.to_string() });
                }
                object.insert(key.clone(), empty_container());
            }
            let child = object
                .get_mut(key)
                .ok_or_else(|| PathError::MissingIntermediate { path: path.to_string() })?;
            if create && child.is_null() {
                *child = empty_container();
            }
            Ok(child)
        }
        PathSegment::Index(index) => {
            if create && current.is_null() {
                *current = Value::Array(Vec::new());
            }
            let array = current
                .as_array_mut()
                .ok_or_else(|| PathError::TypeMismatch { path: path.to_string() })?;
            if *index >= array.len() && !create {
                return Err(PathError::MissingIntermediate { path: path.to_string() });
            }
            grow(array, *index, path)?;
            let child = &mut array[*index];
            if create && child.is_null() {
                *child = empty_container();
            }
            Ok(child)
        }
        PathSegment::Wildcard => Err(PathError::WildcardWrite(path.to_string())),
    }
}

/// 补齐数组使 `index` 可写；超出 [`MAX_ARRAY_GROWTH`] 视为非法路径。
fn grow(array: &mut Vec<Value>, index: usize, path: &str) -> Result<(), PathError> {
    if index < array.len() {
        return Ok(());
    }
    let len = index
        .checked_add(1)
        .filter(|len| len - array.len() <= MAX_ARRAY_GROWTH)
        .ok_or_else(|| PathError::Invalid(path.to_string()))?;
    array.resize(len, Value::Null);
    Ok(())
}

/// 删除路径值，返回被删除的值；路径不存在时返回 `None`。
pub fn remove(doc: &mut Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Ok(Some(std::mem::take(doc)));
    };
    let mut current = doc;
    for segment in parents {
        let next = match segment {
            PathSegment::Key(key) => current.get_mut(key.as_str()),
            PathSegment::Index(index) => current.get_mut(*index),
            PathSegment::Wildcard => return Err(PathError::WildcardWrite(path.to_string())),
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    match last {
        PathSegment::Key(key) => Ok(current.as_object_mut().and_then(|object| object.remove(key))),
        PathSegment::Index(index) => Ok(current
            .as_array_mut()
            .filter(|array| *index < array.len())
            .map(|array| array.remove(*index))),
        PathSegment::Wildcard => Err(PathError::WildcardWrite(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_mixed_segments() {
        let segments = parse("a.b[2].c[*]").expect("parse");
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(2),
                PathSegment::Key("c".into()),
                PathSegment::Wildcard,
            ]
        );
        assert!(parse("$").expect("root").is_empty());
        assert!(parse("a..b").is_err());
        assert!(parse("a[x]").is_err());
    }

    #[test]
    fn select_expands_wildcard() {
        let doc = json!({ "devices": [{ "id": "a" }, { "id": "b" }] });
        let selected = select(&doc, "devices[*].id").expect("select");
        assert_eq!(selected, Some(json!(["a", "b"])));
        assert_eq!(select(&doc, "devices[1].id").expect("select"), Some(json!("b")));
        assert_eq!(select(&doc, "missing.id").expect("select"), None);
    }

    #[test]
    fn write_requires_parent_without_create() {
        let mut doc = json!({ "source": {} });
        write(&mut doc, "source.id", json!("42"), false).expect("leaf insert");
        assert_eq!(doc["source"]["id"], json!("42"));

        let err = write(&mut doc, "c8y.T.value", json!(1), false).expect_err("missing");
        assert!(matches!(err, PathError::MissingIntermediate { .. }));

        write(&mut doc, "c8y.T.value", json!(1), true).expect("created");
        assert_eq!(doc["c8y"]["T"]["value"], json!(1));
    }

    #[test]
    fn write_pads_array_within_growth_limit() {
        let mut doc = json!({});
        write(&mut doc, "values[2]", json!("c"), true).expect("padded");
        assert_eq!(doc, json!({ "values": [null, null, "c"] }));

        let mut doc = json!({ "values": ["a"] });
        write(&mut doc, "values[1]", json!("b"), false).expect("append");
        let err = write(&mut doc, "values[5]", json!("x"), false).expect_err("gap");
        assert!(matches!(err, PathError::MissingIntermediate { .. }));
    }

    #[test]
    fn write_rejects_huge_array_index() {
        let mut doc = json!({});
        let err = write(&mut doc, "a[18446744073709551615]", json!(1), true).expect_err("overflow");
        assert_eq!(err, PathError::Invalid("a[18446744073709551615]".to_string()));

        let err = write(&mut doc, "a[4000000000]", json!(1), true).expect_err("too large");
        assert!(matches!(err, PathError::Invalid(_)));
        let err = write(&mut doc, "a[4000000000].b", json!(1), true).expect_err("intermediate");
        assert!(matches!(err, PathError::Invalid(_)));

        let limit = format!("b[{}]", MAX_ARRAY_GROWTH - 1);
        write(&mut doc, &limit, json!(1), true).expect("within limit");
        assert_eq!(doc["b"].as_array().map(Vec::len), Some(MAX_ARRAY_GROWTH));
    }

    #[test]
    fn write_root_merges_object() {
        let mut doc = json!({ "type": "t", "keep": true });
        write(&mut doc, "$", json!({ "type": "x", "added": 1 }), false).expect("merge");
        assert_eq!(doc, json!({ "type": "x", "keep": true, "added": 1 }));
    }

    #[test]
    fn remove_missing_is_none() {
        let mut doc = json!({ "a": { "b": 1 } });
        assert_eq!(remove(&mut doc, "a.b").expect("remove"), Some(json!(1)));
        assert_eq!(remove(&mut doc, "a.b").expect("remove"), None);
        assert_eq!(remove(&mut doc, "x.y").expect("remove"), None);
        assert_eq!(doc, json!({ "a": {} }));
    }
}
