//! Expansion of one path template into concrete output paths.
//!
//! A template such as `{{ friends.name }}.txt` names the collection
//! `friends`; it expands to one path per element, each paired with a view
//! whose `Current` is that element. Every other placeholder is resolved
//! against the root context and is the same for every element.

use crate::classifier::PlaceholderPattern;
use crate::context::{Context, ContextView};
use crate::selector::{self, Scope};
use log::warn;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    #[error("multiple collections are not expected in {template:?}: first was {first:?}, then {second:?}")]
    AmbiguousCollection {
        template: String,
        first: String,
        second: String,
    },
}

/// Two indices of the same collection rendered to the same path; the later
/// one replaced the earlier one in [`Expansion::outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCollision {
    pub path: String,
    pub overwritten: usize,
    pub index: usize,
}

#[derive(Debug)]
pub struct Expansion<'a> {
    pub outputs: BTreeMap<String, ContextView<'a>>,
    pub collisions: Vec<PathCollision>,
}

impl<'a> Expansion<'a> {
    fn single(path: String, view: ContextView<'a>) -> Self {
        Self {
            outputs: BTreeMap::from([(path, view)]),
            collisions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Resolved against the context root.
    Plain,
    /// A field of each element of the collection.
    Element(String),
    /// The collection itself.
    Whole,
}

/// Finds the shortest leading prefix of `selector` that resolves to a
/// collection. Returns the collection selector and the remaining field
/// selector, which is empty when the whole selector names the collection.
pub fn find_collection_prefix<S: Scope + ?Sized>(
    scope: &S,
    selector: &str,
) -> Option<(String, String)> {
    let parts: Vec<&str> = selector.split('.').collect();
    (1..=parts.len()).find_map(|i| {
        let prefix = parts[..i].join(".");
        let (_, is_collection) = selector::length_of(scope, &prefix);
        is_collection.then(|| (prefix, parts[i..].join(".")))
    })
}

/// Expands `template` against `context`.
///
/// At most one collection may be referenced. The result holds one entry per
/// element, or exactly one entry when no collection is referenced, the
/// collection is empty, or the template names the collection itself.
///
/// A one-element collection still binds `Current` to that element; only an
/// empty collection falls back to the root view without `Current`.
pub fn expand<'a>(
    context: &'a Context,
    pattern: &PlaceholderPattern,
    template: &str,
) -> Result<Expansion<'a>, ExpandError> {
    let mut collection: Option<String> = None;
    let mut tokens: HashMap<&str, Token> = HashMap::new();

    for placeholder in pattern.placeholders(template) {
        if tokens.contains_key(placeholder.selector) {
            continue;
        }
        let token = match find_collection_prefix(context, placeholder.selector) {
            Some((found, rest)) => {
                match &collection {
                    Some(first) if *first != found => {
                        return Err(ExpandError::AmbiguousCollection {
                            template: template.to_string(),
                            first: first.clone(),
                            second: found,
                        });
                    }
                    Some(_) => {}
                    None => collection = Some(found),
                }
                if rest.is_empty() {
                    Token::Whole
                } else {
                    Token::Element(rest)
                }
            }
            None => Token::Plain,
        };
        tokens.insert(placeholder.selector, token);
    }

    let render = |view: &ContextView<'a>| {
        pattern.replace_all(template, |placeholder| {
            let resolved = match tokens.get(placeholder.selector) {
                Some(Token::Element(rest)) => view
                    .current()
                    .and_then(|current| selector::resolve_in(current, rest, context.selector_case())),
                Some(Token::Whole) => view.current(),
                Some(Token::Plain) | None => selector::resolve(context, placeholder.selector),
            };
            match resolved {
                Some(value) => value.to_string(),
                None => {
                    warn!(
                        "filename template field {:?} is not resolved in {:?}",
                        placeholder.selector, template
                    );
                    String::new()
                }
            }
        })
    };

    let collection = match collection {
        Some(collection) => collection,
        None => {
            let view = context.root_view();
            return Ok(Expansion::single(render(&view), view));
        }
    };

    if tokens.values().any(|t| *t == Token::Whole) {
        let view = context.view_of(&collection);
        return Ok(Expansion::single(render(&view), view));
    }

    let (len, _) = selector::length_of(context, &collection);
    if len == 0 {
        let view = context.root_view();
        return Ok(Expansion::single(render(&view), view));
    }

    let mut outputs = BTreeMap::new();
    let mut collisions = Vec::new();
    let mut rendered_by: HashMap<String, usize> = HashMap::new();
    for idx in 0..len {
        let view = context.view_at(&collection, idx);
        let path = render(&view);
        if let Some(previous) = rendered_by.insert(path.clone(), idx) {
            warn!(
                "{:?} renders to {:?} for both {}[{}] and {}[{}], keeping the later",
                template, path, collection, previous, collection, idx
            );
            collisions.push(PathCollision {
                path: path.clone(),
                overwritten: previous,
                index: idx,
            });
        }
        outputs.insert(path, view);
    }
    Ok(Expansion { outputs, collisions })
}
