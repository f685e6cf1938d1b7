//! Route matching.
//!
//! Prefix matching is boundary-enforced: `/api` matches `/api` and
//! `/api/users` but never `/api.evil.com/x`. Matching is a linear scan
//! over a table sorted longest-prefix-first; route counts are small
//! enough that a trie would buy nothing.

use std::sync::Arc;

use crate::config::RouteConfig;

/// Boundary-enforced prefix match. True when the path equals the prefix,
/// the prefix ends with `/`, or the next path character after the prefix
/// is `/`. The empty prefix never matches.
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    if !path.starts_with(prefix) {
        return false;
    }
    if path.len() == prefix.len() {
        return true;
    }
    if prefix.ends_with('/') {
        return true;
    }
    path.as_bytes()[prefix.len()] == b'/'
}

/// Immutable route lookup table, sorted longest-prefix-first so the
/// first match is the longest. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Arc<[RouteConfig]>,
}

impl RouteTable {
    pub fn new(routes: &[RouteConfig]) -> Self {
        let mut sorted: Vec<RouteConfig> = routes.to_vec();
        sorted.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self {
            routes: sorted.into(),
        }
    }

    /// The longest route whose prefix matches with boundary, if any.
    pub fn match_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .find(|route| matches_prefix(path, &route.path_prefix))
    }

    /// Whether the matched route (if any) requires authentication.
    /// Unmatched paths return false; the router will 404 them anyway.
    pub fn requires_auth(&self, path: &str) -> bool {
        self.match_route(path).is_some_and(|r| r.auth_required)
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str) -> RouteConfig {
        RouteConfig {
            path_prefix: prefix.to_string(),
            backend: format!("http://backend{}", prefix.replace('/', "-")),
            ..Default::default()
        }
    }

    #[test]
    fn exact_match() {
        assert!(matches_prefix("/api", "/api"));
    }

    #[test]
    fn segment_boundary_match() {
        assert!(matches_prefix("/api/users", "/api"));
        assert!(matches_prefix("/api/", "/api"));
    }

    #[test]
    fn trailing_slash_prefix_matches_anything_under_it() {
        assert!(matches_prefix("/api/x", "/api/"));
        assert!(!matches_prefix("/apix", "/api/"));
    }

    #[test]
    fn rejects_non_boundary_continuation() {
        assert!(!matches_prefix("/api.evil.com/x", "/api"));
        assert!(!matches_prefix("/apiv2/users", "/api"));
    }

    #[test]
    fn empty_prefix_never_matches() {
        assert!(!matches_prefix("/anything", ""));
        assert!(!matches_prefix("", ""));
    }

    #[test]
    fn boundary_invariant_holds_for_sampled_pairs() {
        // For every accepted (path, prefix) pair, one of the three
        // boundary conditions must hold.
        let paths = [
            "/api", "/api/", "/api/users", "/api/users/42", "/apiv2", "/api.evil.com/x", "/",
            "/a/b/c", "/apia",
        ];
        let prefixes = ["/api", "/api/", "/api/users", "/", "/a"];
        for path in paths {
            for prefix in prefixes {
                if matches_prefix(path, prefix) {
                    let boundary = path == prefix
                        || prefix.ends_with('/')
                        || path.as_bytes()[prefix.len()] == b'/';
                    assert!(boundary, "non-boundary match: {path:?} vs {prefix:?}");
                }
            }
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new(&[route("/api"), route("/api/users")]);
        assert_eq!(
            table.match_route("/api/users/42").unwrap().path_prefix,
            "/api/users"
        );
        assert_eq!(table.match_route("/api/other").unwrap().path_prefix, "/api");
        assert!(table.match_route("/unknown").is_none());
    }

    #[test]
    fn spoofed_prefix_does_not_match() {
        let table = RouteTable::new(&[route("/api")]);
        assert!(table.match_route("/api.evil.com/x").is_none());
    }

    #[test]
    fn requires_auth_follows_matched_route() {
        let mut protected = route("/api/users");
        protected.auth_required = true;
        let table = RouteTable::new(&[route("/api"), protected]);

        assert!(table.requires_auth("/api/users/42"));
        assert!(!table.requires_auth("/api/other"));
        assert!(!table.requires_auth("/nope"));
    }
}
