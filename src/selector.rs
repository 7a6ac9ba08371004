//! Dotted field selectors (`friends.name`) resolved against a tree of
//! [`Value`]s.
//!
//! Resolution is total: a malformed selector, a missing key or an attempt to
//! step into a scalar or sequence all yield `None`. Sequences are never
//! indexed by a selector part; elements are reached through the `Current`
//! binding of a context view.

use crate::value::Value;
use serde::Deserialize;
use std::collections::BTreeMap;

/// How selector parts are matched against mapping keys and root names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorCase {
    /// Keys must match exactly.
    #[default]
    Sensitive,
    /// An exact match is preferred; otherwise the first key in sorted order
    /// that is equal ignoring ASCII case is used.
    Insensitive,
}

/// Anything that exposes named roots to the resolver.
pub trait Scope {
    /// Looks up a root by name under the scope's case policy.
    fn root(&self, name: &str) -> Option<&Value>;

    fn selector_case(&self) -> SelectorCase;
}

/// Looks a key up in a mapping under the given case policy.
pub fn lookup<'a>(
    map: &'a BTreeMap<String, Value>,
    key: &str,
    case: SelectorCase,
) -> Option<&'a Value> {
    if let Some(value) = map.get(key) {
        return Some(value);
    }
    match case {
        SelectorCase::Sensitive => None,
        SelectorCase::Insensitive => map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v),
    }
}

/// Resolves `selector` against the roots of `scope`.
pub fn resolve<'a, S: Scope + ?Sized>(scope: &'a S, selector: &str) -> Option<&'a Value> {
    let (root, rest) = match selector.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (selector, None),
    };
    if root.is_empty() {
        return None;
    }
    let value = scope.root(root)?;
    match rest {
        Some(rest) => resolve_in(value, rest, scope.selector_case()),
        None => Some(value),
    }
}

/// Resolves `selector` starting from `value` itself, e.g. a field of the
/// `Current` element.
pub fn resolve_in<'a>(value: &'a Value, selector: &str, case: SelectorCase) -> Option<&'a Value> {
    let mut current = value;
    for part in selector.split('.') {
        if part.is_empty() {
            return None;
        }
        current = match current {
            Value::Mapping(map) => lookup(map, part, case)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns the length of the value at `selector` and whether it is a
/// collection. Only sequences are collections; mappings resolve but report
/// `(0, false)` so records are never iterated.
pub fn length_of<S: Scope + ?Sized>(scope: &S, selector: &str) -> (usize, bool) {
    match resolve(scope, selector).and_then(Value::as_sequence) {
        Some(items) => (items.len(), true),
        None => (0, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Roots {
        roots: BTreeMap<String, Value>,
        case: SelectorCase,
    }

    impl Roots {
        fn new(data: serde_json::Value, case: SelectorCase) -> Self {
            let roots = match Value::from(data) {
                Value::Mapping(map) => map,
                _ => BTreeMap::new(),
            };
            Self { roots, case }
        }
    }

    impl Scope for Roots {
        fn root(&self, name: &str) -> Option<&Value> {
            lookup(&self.roots, name, self.case)
        }

        fn selector_case(&self) -> SelectorCase {
            self.case
        }
    }

    fn sample(case: SelectorCase) -> Roots {
        Roots::new(
            json!({
                "Name": "Cargo",
                "site": {"title": "Docs", "Meta": {"lang": "en"}},
                "friends": [{"name": "Alice"}, {"name": "Bob"}],
                "tags": {"a": 1},
            }),
            case,
        )
    }

    #[test]
    fn test_resolve_nested_mapping() {
        let scope = sample(SelectorCase::Sensitive);
        assert_eq!(resolve(&scope, "site.title"), Some(&Value::from("Docs")));
        assert_eq!(resolve(&scope, "site.Meta.lang"), Some(&Value::from("en")));
    }

    #[test]
    fn test_resolve_never_panics_on_malformed_input() {
        let scope = sample(SelectorCase::Sensitive);
        for selector in ["", ".", "..", "site.", ".site", "site..title", "nope", "Name.x", "friends.0", "friends.name", "tags.a.b"] {
            assert!(resolve(&scope, selector).is_none(), "{selector:?} resolved");
        }
    }

    #[test]
    fn test_resolve_empty_scope() {
        let scope = Roots::new(json!({}), SelectorCase::Sensitive);
        assert!(resolve(&scope, "anything").is_none());
        assert_eq!(length_of(&scope, "anything"), (0, false));
    }

    #[test]
    fn test_case_sensitive_policy() {
        let scope = sample(SelectorCase::Sensitive);
        assert!(resolve(&scope, "name").is_none());
        assert!(resolve(&scope, "site.meta.lang").is_none());
        assert!(resolve(&scope, "SITE.title").is_none());
    }

    #[test]
    fn test_case_insensitive_policy() {
        let scope = sample(SelectorCase::Insensitive);
        assert_eq!(resolve(&scope, "name"), Some(&Value::from("Cargo")));
        assert_eq!(resolve(&scope, "SITE.meta.LANG"), Some(&Value::from("en")));
    }

    #[test]
    fn test_case_insensitive_prefers_exact_match() {
        let scope = Roots::new(json!({"key": "lower", "KEY": "upper", "Key": "title"}), SelectorCase::Insensitive);
        assert_eq!(resolve(&scope, "Key"), Some(&Value::from("title")));
        assert_eq!(resolve(&scope, "key"), Some(&Value::from("lower")));
        // "KEY" < "Key" < "key" in byte order
        assert_eq!(resolve(&scope, "kEy"), Some(&Value::from("upper")));
    }

    #[test]
    fn test_length_of() {
        let scope = sample(SelectorCase::Sensitive);
        assert_eq!(length_of(&scope, "friends"), (2, true));
        assert_eq!(length_of(&scope, "tags"), (0, false));
        assert_eq!(length_of(&scope, "Name"), (0, false));
        assert_eq!(length_of(&scope, "missing"), (0, false));
    }

    #[test]
    fn test_resolve_in_element() {
        let element = Value::from(json!({"name": "Alice", "address": {"city": "Oslo"}}));
        assert_eq!(
            resolve_in(&element, "address.city", SelectorCase::Sensitive),
            Some(&Value::from("Oslo"))
        );
        assert!(resolve_in(&element, "", SelectorCase::Sensitive).is_none());
        assert!(resolve_in(&Value::Null, "name", SelectorCase::Sensitive).is_none());
    }
}
