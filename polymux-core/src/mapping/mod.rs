//! Path routing table.
//!
//! Registered paths live in one of two structures:
//!
//! - paths without parameters go into an exact-match hash table;
//! - templates go into a bucket keyed by segment count, kept sorted by the
//!   normalized template string.
//!
//! Lookups try the exact table first and then scan the bucket for the
//! request's segment count in order, so when several templates could match
//! the alphabetically first normalized template always wins. Because a
//! parameter normalizes to `{}` and `{` sorts after every literal path
//! character, literal segments beat parameters at the same position.
//!
//! Registration is expected to happen once at startup; the table is then
//! shared read-only (`Arc<PathMapping<T>>`) between loop threads.
use std::collections::{BTreeMap, HashMap};

mod template;

pub use template::{PathParams, UriTemplate, PARAM_MARKER};
use template::{canonical_path, split_segments};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("path {0} is already registered")]
    DuplicatePath(String),
    #[error("template {path} is structurally identical to {existing}")]
    DuplicateTemplate { path: String, existing: String },
    #[error("invalid path template {path}: {reason}")]
    InvalidTemplate { path: String, reason: &'static str },
    #[error("path mapping is frozen, routes must be registered before serving")]
    Frozen,
}

/// A resolved lookup.
#[derive(Debug)]
pub struct Mapping<'a, T> {
    pub target: &'a T,
    pub params: PathParams,
    /// The registered path that matched.
    pub template: &'a str,
}

#[derive(Debug)]
struct TemplateEntry<T> {
    template: UriTemplate,
    target: T,
}

#[derive(Debug)]
struct ExactEntry<T> {
    path: String,
    target: T,
}

#[derive(Debug)]
pub struct PathMapping<T> {
    exact: HashMap<String, ExactEntry<T>>,
    templates: BTreeMap<usize, Vec<TemplateEntry<T>>>,
}

impl<T> Default for PathMapping<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            templates: BTreeMap::new(),
        }
    }
}

impl<T> PathMapping<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.templates.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `target` under `path`. Fails fast on invalid syntax and on
    /// duplicates; a failed call leaves the table untouched.
    pub fn add(&mut self, path: &str, target: T) -> Result<(), MappingError> {
        let template = UriTemplate::parse(path)?;

        if !template.has_params() {
            let key = template.normalized().to_string();
            if let Some(existing) = self.exact.get(&key) {
                tracing::debug!("{path} collides with {}", existing.path);
                return Err(MappingError::DuplicatePath(path.to_string()));
            }
            self.exact.insert(
                key,
                ExactEntry {
                    path: path.to_string(),
                    target,
                },
            );
            return Ok(());
        }

        let bucket = self.templates.entry(template.segment_count()).or_default();
        match bucket.binary_search_by(|e| e.template.normalized().cmp(template.normalized())) {
            Ok(pos) => Err(MappingError::DuplicateTemplate {
                path: path.to_string(),
                existing: bucket[pos].template.as_str().to_string(),
            }),
            Err(pos) => {
                bucket.insert(pos, TemplateEntry { template, target });
                Ok(())
            }
        }
    }

    /// Resolves a concrete request path (no query string).
    pub fn find_mapping(&self, path: &str) -> Option<Mapping<'_, T>> {
        if let Some(entry) = self.exact.get(path) {
            return Some(Mapping {
                target: &entry.target,
                params: PathParams::default(),
                template: &entry.path,
            });
        }

        // asterisk-form and other non-path targets never match a route
        if !path.starts_with('/') {
            return None;
        }

        let segments: Vec<&str> = split_segments(path).collect();
        // retry in canonical spelling, e.g. with a trailing slash removed
        let canonical = canonical_path(segments.iter().copied());
        if canonical != path {
            if let Some(entry) = self.exact.get(&canonical) {
                return Some(Mapping {
                    target: &entry.target,
                    params: PathParams::default(),
                    template: &entry.path,
                });
            }
        }

        self.templates
            .get(&segments.len())?
            .iter()
            .find_map(|entry| {
                entry.template.matches(&segments).map(|params| Mapping {
                    target: &entry.target,
                    params,
                    template: entry.template.as_str(),
                })
            })
    }

    /// Registered paths, exact ones first, templates in lookup order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.exact.values().map(|e| e.path.as_str()).chain(
            self.templates
                .values()
                .flat_map(|bucket| bucket.iter().map(|e| e.template.as_str())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_exact_path_rejected() {
        let mut mapping = PathMapping::new();
        mapping.add("/service", 1).unwrap();
        assert_eq!(
            mapping.add("/service", 2),
            Err(MappingError::DuplicatePath("/service".to_string()))
        );
        // trailing slash is the same path
        assert!(matches!(
            mapping.add("/service/", 3),
            Err(MappingError::DuplicatePath(_))
        ));
        assert_eq!(mapping.len(), 1);
        assert_eq!(*mapping.find_mapping("/service").unwrap().target, 1);
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let mut mapping = PathMapping::new();
        mapping.add("/users/{id}", "a").unwrap();
        let err = mapping.add("/users/{name}", "b").unwrap_err();
        assert_eq!(
            err,
            MappingError::DuplicateTemplate {
                path: "/users/{name}".to_string(),
                existing: "/users/{id}".to_string(),
            }
        );
        let found = mapping.find_mapping("/users/7").unwrap();
        assert_eq!(*found.target, "a");
        assert_eq!(found.params.get("id"), Some("7"));
    }

    #[test]
    fn test_exact_match_precedes_templates() {
        let mut mapping = PathMapping::new();
        mapping.add("/users/{id}", "template").unwrap();
        mapping.add("/users/me", "exact").unwrap();
        assert_eq!(*mapping.find_mapping("/users/me").unwrap().target, "exact");
        assert_eq!(*mapping.find_mapping("/users/me/").unwrap().target, "exact");
        assert_eq!(*mapping.find_mapping("/users/you").unwrap().target, "template");
    }

    #[test]
    fn test_alphabetical_precedence_is_deterministic() {
        let templates = [
            "/{a}/{b}/{c}",
            "/shop/{item}/{variant}",
            "/shop/{item}/reviews",
            "/{area}/{item}/reviews",
            "/shop/books/{id}",
        ];
        // same outcome regardless of registration order
        for rotation in 0..templates.len() {
            let mut mapping = PathMapping::new();
            for i in 0..templates.len() {
                let path = templates[(i + rotation) % templates.len()];
                mapping.add(path, path).unwrap();
            }
            for _ in 0..3 {
                let hit = |p: &str| *mapping.find_mapping(p).unwrap().target;
                assert_eq!(hit("/shop/books/reviews"), "/shop/books/{id}");
                assert_eq!(hit("/shop/pens/reviews"), "/shop/{item}/reviews");
                assert_eq!(hit("/shop/pens/blue"), "/shop/{item}/{variant}");
                assert_eq!(hit("/mall/pens/reviews"), "/{area}/{item}/reviews");
                assert_eq!(hit("/mall/pens/blue"), "/{a}/{b}/{c}");
            }
        }
    }

    #[test]
    fn test_segment_count_separates_buckets() {
        let mut mapping = PathMapping::new();
        mapping.add("/{a}", 1).unwrap();
        mapping.add("/{a}/{b}", 2).unwrap();
        assert_eq!(*mapping.find_mapping("/x").unwrap().target, 1);
        assert_eq!(*mapping.find_mapping("/x/y").unwrap().target, 2);
        assert!(mapping.find_mapping("/x/y/z").is_none());
        assert!(mapping.find_mapping("/").is_none());
        assert_eq!(mapping.paths().count(), 2);
    }

    #[test]
    fn test_root_and_not_found() {
        let mut mapping = PathMapping::new();
        mapping.add("/", "root").unwrap();
        let found = mapping.find_mapping("/").unwrap();
        assert_eq!(*found.target, "root");
        assert_eq!(found.template, "/");
        assert!(found.params.is_empty());
        assert!(mapping.find_mapping("/missing").is_none());
    }

    #[test]
    fn test_asterisk_target_matches_nothing() {
        let mut mapping = PathMapping::new();
        mapping.add("/*", "literal").unwrap();
        mapping.add("/{any}", "template").unwrap();
        assert!(mapping.find_mapping("*").is_none());
        assert!(mapping.find_mapping("users").is_none());
        assert_eq!(*mapping.find_mapping("/*").unwrap().target, "literal");
        assert_eq!(*mapping.find_mapping("/users").unwrap().target, "template");
    }
}
