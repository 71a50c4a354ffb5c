use std::fmt;

use super::MappingError;

/// Placeholder a parameter segment is rendered as in the normalized form.
pub const PARAM_MARKER: &str = "{}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path template such as `/users/{id}/posts`.
///
/// Immutable once parsed. Two templates are structurally identical when their
/// normalized forms are equal, whatever their parameter names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    template: String,
    normalized: String,
    segments: Vec<Segment>,
}

/// Parameters captured by a successful match, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl UriTemplate {
    pub fn parse(path: &str) -> Result<Self, MappingError> {
        let invalid = |reason: &'static str| MappingError::InvalidTemplate {
            path: path.to_string(),
            reason,
        };
        if !path.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        for raw in split_segments(path) {
            if raw.is_empty() {
                return Err(invalid("empty segment"));
            }
            let segment = match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    if name.is_empty() {
                        return Err(invalid("empty parameter name"));
                    }
                    if !name
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
                    {
                        return Err(invalid("bad character in parameter name"));
                    }
                    if segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(n) if n == name))
                    {
                        return Err(invalid("duplicate parameter name"));
                    }
                    Segment::Param(name.to_string())
                }
                None => {
                    if raw.contains(&['{', '}'][..]) {
                        return Err(invalid("parameter must span a whole segment"));
                    }
                    Segment::Literal(raw.to_string())
                }
            };
            segments.push(segment);
        }

        let normalized = render(&segments);
        Ok(Self {
            template: path.to_string(),
            normalized,
            segments,
        })
    }

    /// The path as it was registered.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Canonical form with every parameter rendered as `{}`.
    #[inline]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has_params(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(_)))
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Matches concrete path segments against this template.
    pub fn matches(&self, segments: &[&str]) -> Option<PathParams> {
        if segments.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if actual.is_empty() => return None,
                Segment::Param(name) => params.push((name.clone(), (*actual).to_string())),
            }
        }
        Some(PathParams(params))
    }

    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        let segments: Vec<&str> = split_segments(path).collect();
        self.matches(&segments)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Splits a path into segments; the leading `/` and one trailing `/` are not
/// significant, so `/` yields nothing and `/a/` yields `["a"]`.
pub(crate) fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let mut parts = trimmed.split('/');
    if trimmed.is_empty() {
        // split("") yields one empty item
        parts.next();
    }
    parts
}

/// Canonical spelling of a concrete path, used as the exact-match key.
pub(crate) fn canonical_path<'a, I>(segments: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(s);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn render(segments: &[Segment]) -> String {
    canonical_path(segments.iter().map(|s| match s {
        Segment::Literal(lit) => lit.as_str(),
        Segment::Param(_) => PARAM_MARKER,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_and_params() {
        let t = UriTemplate::parse("/users/{id}/posts/{post_id}").unwrap();
        assert_eq!(t.segment_count(), 4);
        assert!(t.has_params());
        assert_eq!(t.normalized(), "/users/{}/posts/{}");
        assert_eq!(t.param_names().collect::<Vec<_>>(), vec!["id", "post_id"]);

        let root = UriTemplate::parse("/").unwrap();
        assert_eq!(root.segment_count(), 0);
        assert_eq!(root.normalized(), "/");

        let trailing = UriTemplate::parse("/service/").unwrap();
        assert_eq!(trailing.normalized(), "/service");
        assert!(!trailing.has_params());
    }

    #[test]
    fn test_parse_rejects_bad_templates() {
        for bad in [
            "service",
            "/a//b",
            "/{}",
            "/{a b}",
            "/x{id}",
            "/{id}x",
            "/{id}/{id}",
            "/a/}",
        ] {
            assert!(
                matches!(
                    UriTemplate::parse(bad),
                    Err(MappingError::InvalidTemplate { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_match_captures_params() {
        let t = UriTemplate::parse("/users/{id}/posts/{post}").unwrap();
        let params = t.match_path("/users/42/posts/hello-world").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("post"), Some("hello-world"));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.len(), 2);

        assert!(t.match_path("/users/42/comments/1").is_none());
        assert!(t.match_path("/users/42/posts").is_none());
        assert!(t.match_path("/users//posts/1").is_none());
    }

    #[test]
    fn test_split_segments() {
        assert_eq!(split_segments("/").count(), 0);
        assert_eq!(split_segments("").count(), 0);
        assert_eq!(split_segments("/a/b/").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(split_segments("/a//b").collect::<Vec<_>>(), vec!["a", "", "b"]);
        assert_eq!(canonical_path(split_segments("/a/b/")), "/a/b");
        assert_eq!(canonical_path(split_segments("/")), "/");
    }
}
