// Source path substitution
//
// Maps paths recorded in debug info to the paths a client sees, for binaries built elsewhere.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstituteRule {
    pub from: String,
    pub to: String,
}

impl SubstituteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn with_separator(s: &str) -> String {
    if s.ends_with(is_separator) {
        s.to_string()
    } else {
        format!("{}/", s)
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with(is_separator) || path.as_bytes().get(1) == Some(&b':')
}

fn has_prefix(path: &str, prefix: &str, case_insensitive: bool) -> bool {
    match path.get(..prefix.len()) {
        Some(head) if case_insensitive => head.eq_ignore_ascii_case(prefix),
        Some(head) => head == prefix,
        None => false,
    }
}

/// Rewrite a debug-info path through `rules`.
///
/// When several rules match, the one with the longest `from` prefix wins. A rule with an
/// empty `from` applies to relative paths only.
pub fn substitute_path(path: &str, rules: &[SubstituteRule], case_insensitive: bool) -> String {
    let mut best: Option<&SubstituteRule> = None;
    let mut best_len = 0;

    for rule in rules {
        if rule.from.is_empty() {
            if !is_absolute(path) && best.is_none() {
                best = Some(rule);
            }
            continue;
        }
        let from = with_separator(&rule.from);
        if has_prefix(path, &from, case_insensitive) && (best.is_none() || from.len() > best_len) {
            best = Some(rule);
            best_len = from.len();
        }
    }

    match best {
        None => path.to_string(),
        Some(rule) if rule.from.is_empty() => format!("{}{}", with_separator(&rule.to), path),
        Some(rule) => {
            let rest = &path[with_separator(&rule.from).len()..];
            if rule.to.is_empty() {
                rest.to_string()
            } else {
                format!("{}{}", with_separator(&rule.to), rest)
            }
        }
    }
}

/// True when `query` names `candidate`: equal, or a suffix starting at a path component.
pub fn matches_path_suffix(candidate: &str, query: &str, case_insensitive: bool) -> bool {
    if query.is_empty() || candidate.len() < query.len() {
        return false;
    }
    let split = candidate.len() - query.len();
    let tail = match candidate.get(split..) {
        Some(tail) => tail,
        None => return false,
    };
    let same = if case_insensitive {
        tail.eq_ignore_ascii_case(query)
    } else {
        tail == query
    };
    if !same {
        return false;
    }
    split == 0 || query.starts_with(is_separator) || candidate[..split].ends_with(is_separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_normalizes_separators() {
        let rules = vec![SubstituteRule::new("/abs/fixtures/", "/abs/nonexistent")];
        assert_eq!(
            substitute_path("/abs/fixtures/prog.go", &rules, false),
            "/abs/nonexistent/prog.go"
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = vec![
            SubstituteRule::new("/src", "/a"),
            SubstituteRule::new("/src/pkg", "/b"),
            SubstituteRule::new("/s", "/c"),
        ];
        assert_eq!(substitute_path("/src/pkg/x.go", &rules, false), "/b/x.go");
        assert_eq!(substitute_path("/src/main.go", &rules, false), "/a/main.go");
        assert_eq!(substitute_path("/other/main.go", &rules, false), "/other/main.go");
    }

    #[test]
    fn test_empty_from_applies_to_relative_paths() {
        let rules = vec![SubstituteRule::new("", "/home/user/src")];
        assert_eq!(substitute_path("main.go", &rules, false), "/home/user/src/main.go");
        assert_eq!(substitute_path("/abs/main.go", &rules, false), "/abs/main.go");
    }

    #[test]
    fn test_case_sensitivity() {
        let rules = vec![SubstituteRule::new("/Src", "/dst")];
        assert_eq!(substitute_path("/src/a.go", &rules, false), "/src/a.go");
        assert_eq!(substitute_path("/src/a.go", &rules, true), "/dst/a.go");
    }

    #[test]
    fn test_suffix_match_respects_components() {
        assert!(matches_path_suffix("/abs/fixtures/prog.go", "prog.go", false));
        assert!(matches_path_suffix("/abs/fixtures/prog.go", "fixtures/prog.go", false));
        assert!(matches_path_suffix("/abs/fixtures/prog.go", "/abs/fixtures/prog.go", false));
        assert!(!matches_path_suffix("/abs/fixtures/prog.go", "rog.go", false));
        assert!(!matches_path_suffix("/abs/fixtures/prog.go", "Prog.go", false));
        assert!(matches_path_suffix("/abs/fixtures/prog.go", "Prog.go", true));
    }
}
