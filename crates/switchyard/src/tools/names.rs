use std::collections::HashSet;

pub const MAX_NAME_LEN: usize = 64;
const MAX_SERVER_SUFFIX_LEN: usize = 24;

/// Map an arbitrary string onto `^[A-Za-z0-9_-]{1,64}$`.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

/// `base` shortened so that `base + suffix` fits the length limit. Both are ASCII.
fn with_suffix(base: &str, suffix: &str) -> String {
    let room = MAX_NAME_LEN.saturating_sub(suffix.len());
    format!("{}{}", &base[..base.len().min(room)], suffix)
}

/// Hands out function names that are unique within one tool listing.
///
/// A clash is resolved by appending the sanitized server name, then a number.
#[derive(Debug, Default)]
pub struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, tool_name: &str, server_name: &str) -> String {
        let base = sanitize(tool_name);
        if self.used.insert(base.clone()) {
            return base;
        }

        let server = sanitize(server_name);
        let server_suffix = format!("_{}", &server[..server.len().min(MAX_SERVER_SUFFIX_LEN)]);
        let qualified = with_suffix(&base, &server_suffix);
        if self.used.insert(qualified.clone()) {
            return qualified;
        }

        let mut n = 2usize;
        loop {
            let candidate = with_suffix(&qualified, &format!("_{}", n));
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn is_valid(name: &str) -> bool {
        Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap().is_match(name)
    }

    #[test]
    fn test_sanitize_always_valid() {
        let long = "x".repeat(100);
        for input in ["search", "web.search", "", "日本語ツール", "a b/c:d", long.as_str(), "ok-name_1"] {
            let name = sanitize(input);
            assert!(is_valid(&name), "{:?} -> {:?}", input, name);
        }
        assert_eq!(sanitize("web.search"), "web_search");
        assert_eq!(sanitize(""), "tool");
    }

    #[test]
    fn test_collisions_are_disambiguated() {
        let mut names = NameAllocator::new();
        let first = names.allocate("search", "Web Search");
        let second = names.allocate("search", "docs");
        let third = names.allocate("search", "docs");
        assert_eq!(first, "search");
        assert_eq!(second, "search_docs");
        assert_eq!(third, "search_docs_2");
        assert_ne!(first, second);
    }

    #[test]
    fn test_disambiguated_names_stay_within_limit() {
        let mut names = NameAllocator::new();
        let tool = "t".repeat(64);
        let server = "s".repeat(64);
        let a = names.allocate(&tool, &server);
        let b = names.allocate(&tool, &server);
        let c = names.allocate(&tool, &server);
        for name in [&a, &b, &c] {
            assert!(is_valid(name), "{}", name);
        }
        assert_ne!(b, c);
    }
}
