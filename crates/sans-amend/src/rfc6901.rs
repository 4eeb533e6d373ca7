//! RFC6901 JSON Pointer support for `selector.path`, grounded on
//! `original_source/sans/sans/amendment/apply.py`'s `_decode_pointer_token` /
//! `_pointer_tokens` / `_resolve_pointer_parent` / `_set_pointer_value`.
//!
//! `path` is always relative to a step's `params` object; `/` denotes the
//! whole object (root replacement) rather than a key named `""`.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerError {
    /// Malformed pointer syntax: doesn't start with `/`, or a bad `~`
    /// escape.
    Invalid,
    /// A token names a key/index that isn't present.
    NotFound,
    /// A token walks into a scalar, or indexes an array with a non-digit.
    NotContainer,
}

fn decode_token(token: &str) -> Result<String, PointerError> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(PointerError::Invalid),
        }
    }
    Ok(out)
}

/// Splits `path` into its decoded tokens. `/` (the whole-document pointer)
/// yields an empty token list.
pub fn tokens(path: &str) -> Result<Vec<String>, PointerError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(PointerError::Invalid);
    }
    if path == "/" {
        return Ok(Vec::new());
    }
    path[1..].split('/').map(decode_token).collect()
}

fn index_of(token: &str, len: usize) -> Result<usize, PointerError> {
    let idx: usize = token.parse().map_err(|_| PointerError::NotContainer)?;
    if idx >= len {
        Err(PointerError::NotFound)
    } else {
        Ok(idx)
    }
}

/// Reads the value at `path` within `root`. Empty tokens (root pointer)
/// return `root` itself.
pub fn get<'a>(root: &'a Value, path: &str) -> Result<&'a Value, PointerError> {
    let toks = tokens(path)?;
    let mut current = root;
    for token in &toks {
        current = match current {
            Value::Object(map) => map.get(token).ok_or(PointerError::NotFound)?,
            Value::Array(items) => &items[index_of(token, items.len())?],
            _ => return Err(PointerError::NotContainer),
        };
    }
    Ok(current)
}

/// Replaces the value at `path` within `root` with `value`. A root pointer
/// (`path == "/"`) replaces `*root` wholesale; any other path requires the
/// parent container and final key to already exist, matching
/// `_resolve_pointer_parent`'s "the path names an existing location" rule —
/// `set_params`/`replace_expr`/`edit_expr` overwrite, they never extend the
/// tree.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PointerError> {
    let toks = tokens(path)?;
    let Some((last, init)) = toks.split_last() else {
        *root = value;
        return Ok(());
    };
    let parent = navigate_mut(root, init)?;
    match parent {
        Value::Object(map) => {
            if !map.contains_key(last) {
                return Err(PointerError::NotFound);
            }
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = index_of(last, items.len())?;
            items[idx] = value;
            Ok(())
        }
        _ => Err(PointerError::NotContainer),
    }
}

/// Resolves `path` to its containing node, mirroring `_resolve_pointer_parent`:
/// `None` means `path` pointed at the document root.
pub fn resolve_parent<'a>(
    root: &'a mut Value,
    path: &str,
) -> Result<(Option<&'a mut Value>, String), PointerError> {
    let toks = tokens(path)?;
    let Some((last, init)) = toks.split_last() else {
        return Ok((None, String::new()));
    };
    let parent = navigate_mut(root, init)?;
    match parent {
        Value::Object(map) => {
            if !map.contains_key(last) {
                return Err(PointerError::NotFound);
            }
        }
        Value::Array(items) => {
            index_of(last, items.len())?;
        }
        _ => return Err(PointerError::NotContainer),
    }
    Ok((Some(parent), last.clone()))
}

fn navigate_mut<'a>(current: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, PointerError> {
    let Some((head, rest)) = tokens.split_first() else {
        return Ok(current);
    };
    let next = match current {
        Value::Object(map) => map.get_mut(head).ok_or(PointerError::NotFound)?,
        Value::Array(items) => {
            let idx = index_of(head, items.len())?;
            &mut items[idx]
        }
        _ => return Err(PointerError::NotContainer),
    };
    navigate_mut(next, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_pointer_is_empty_tokens() {
        assert_eq!(tokens("/").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn tilde_escapes_decode() {
        assert_eq!(tokens("/a~0b/c~1d").unwrap(), vec!["a~b".to_string(), "c/d".to_string()]);
    }

    #[test]
    fn empty_or_relative_path_is_invalid() {
        assert_eq!(tokens(""), Err(PointerError::Invalid));
        assert_eq!(tokens("a/b"), Err(PointerError::Invalid));
    }

    #[test]
    fn get_reads_nested_value() {
        let v = json!({"predicate": {"type": "col", "name": "x"}});
        assert_eq!(get(&v, "/predicate/name").unwrap(), "x");
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let v = json!({"a": 1});
        assert_eq!(get(&v, "/b").unwrap_err(), PointerError::NotFound);
    }

    #[test]
    fn get_through_scalar_is_not_container() {
        let v = json!({"a": 1});
        assert_eq!(get(&v, "/a/b").unwrap_err(), PointerError::NotContainer);
    }

    #[test]
    fn set_replaces_whole_root() {
        let mut v = json!({"a": 1});
        set(&mut v, "/", json!({"b": 2})).unwrap();
        assert_eq!(v, json!({"b": 2}));
    }

    #[test]
    fn set_overwrites_existing_nested_key() {
        let mut v = json!({"predicate": {"type": "lit", "value": 1}});
        set(&mut v, "/predicate/value", json!(2)).unwrap();
        assert_eq!(v["predicate"]["value"], 2);
    }

    #[test]
    fn set_array_index_out_of_range_is_not_found() {
        let mut v = json!({"casts": [1, 2]});
        assert_eq!(
            set(&mut v, "/casts/5", json!(3)).unwrap_err(),
            PointerError::NotFound
        );
    }
}
