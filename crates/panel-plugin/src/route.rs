//! Route matching for HTTP-style calls.
//!
//! Patterns are either an exact path or a prefix ending in `*`. There is no
//! parameter capture and no regex support: `/items/*` matches anything that
//! starts with `/items/`, and handlers read the remainder from the request
//! path themselves. This is a known limitation of the routing model.

/// Wildcard marker allowed as the final character of a pattern.
pub const WILDCARD: char = '*';

/// Method value that matches every request method.
pub const ANY_METHOD: &str = "*";

/// Check whether `path` matches `pattern`.
///
/// An exact match always wins. A pattern ending in [`WILDCARD`] matches any
/// path that starts with the pattern text before the marker.
pub fn match_path(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => path.len() >= prefix.len() && path.starts_with(prefix),
        None => false,
    }
}

/// Check whether a route's method accepts the request method.
pub fn match_method(route_method: &str, method: &str) -> bool {
    route_method == ANY_METHOD || route_method == method
}
