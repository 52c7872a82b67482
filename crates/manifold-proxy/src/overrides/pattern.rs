//! Override-rule patterns.
//!
//! A pattern is a tool name possibly containing `*`, each matching any run
//! of characters (including none). Patterns compile to literal segments so
//! matching never re-parses, ordering is by specificity, and pairwise
//! conflict detection decides symbolically whether two globs share any
//! matching name.

use std::cmp::Ordering;

/// A compiled override pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    /// Literal segments between wildcards; `N` segments imply `N-1` stars
    /// plus leading/trailing stars captured by the flags below.
    segments: Vec<String>,
    leading_star: bool,
    trailing_star: bool,
    wildcards: u32,
}

impl Pattern {
    /// Compile a pattern string.
    #[must_use]
    pub fn compile(raw: &str) -> Self {
        let wildcards = raw.matches('*').count() as u32;
        let leading_star = raw.starts_with('*');
        let trailing_star = raw.ends_with('*');
        let segments = raw.split('*').filter(|s| !s.is_empty()).map(str::to_string).collect();
        Self {
            raw: raw.to_string(),
            segments,
            leading_star,
            trailing_star,
            wildcards,
        }
    }

    /// The original pattern text.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern is a plain name with no wildcards.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.wildcards == 0
    }

    /// The literal prefix before the first wildcard.
    #[must_use]
    pub fn literal_prefix(&self) -> &str {
        if self.leading_star {
            ""
        } else {
            self.segments.first().map_or("", String::as_str)
        }
    }

    /// Whether `name` matches this pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if self.is_exact() {
            return self.raw == name;
        }

        let mut rest = name;

        // anchor the first segment when the pattern does not open with `*`
        let mut segments = self.segments.iter();
        if !self.leading_star {
            let Some(first) = segments.next() else {
                // pattern was nothing but stars
                return true;
            };
            let Some(stripped) = rest.strip_prefix(first.as_str()) else {
                return false;
            };
            rest = stripped;
        }

        let mut middle: Vec<&String> = segments.collect();

        // anchor the last segment when the pattern does not end with `*`
        if !self.trailing_star
            && let Some(last) = middle.pop()
        {
            let Some(stripped) = rest.strip_suffix(last.as_str()) else {
                return false;
            };
            rest = stripped;
        }

        // the remaining segments must appear in order
        for segment in middle {
            match rest.find(segment.as_str()) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
        true
    }

    /// Specificity ordering: exact before globbed, fewer wildcards before
    /// more, longer literal prefix before shorter. Raw text breaks ties so
    /// rule order is deterministic.
    #[must_use]
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        other
            .is_exact()
            .cmp(&self.is_exact())
            .then(self.wildcards.cmp(&other.wildcards))
            .then(other.literal_prefix().len().cmp(&self.literal_prefix().len()))
            .then(self.raw.cmp(&other.raw))
    }

    /// Whether some name can match both patterns, decided by reachability
    /// over the pair of glob token sequences.
    #[must_use]
    pub fn may_conflict(&self, other: &Self) -> bool {
        let a: Vec<Token> = tokenize(&self.raw);
        let b: Vec<Token> = tokenize(&other.raw);

        // breadth-first search over prefix positions (i, j)
        let mut seen = vec![false; (a.len() + 1) * (b.len() + 1)];
        let index = |i: usize, j: usize| i * (b.len() + 1) + j;
        let mut queue = vec![(0usize, 0usize)];
        seen[index(0, 0)] = true;

        while let Some((i, j)) = queue.pop() {
            if i == a.len() && j == b.len() {
                return true;
            }
            let mut push = |i: usize, j: usize, seen: &mut Vec<bool>, queue: &mut Vec<(usize, usize)>| {
                if !seen[index(i, j)] {
                    seen[index(i, j)] = true;
                    queue.push((i, j));
                }
            };

            // a star may match the empty run
            if matches!(a.get(i), Some(Token::Star)) {
                push(i + 1, j, &mut seen, &mut queue);
            }
            if matches!(b.get(j), Some(Token::Star)) {
                push(i, j + 1, &mut seen, &mut queue);
            }
            // consume one character on both sides
            match (a.get(i), b.get(j)) {
                (Some(Token::Char(x)), Some(Token::Char(y))) if x == y => {
                    push(i + 1, j + 1, &mut seen, &mut queue);
                }
                (Some(Token::Star), Some(Token::Char(_))) => {
                    push(i, j + 1, &mut seen, &mut queue);
                }
                (Some(Token::Char(_)), Some(Token::Star)) => {
                    push(i + 1, j, &mut seen, &mut queue);
                }
                _ => {}
            }
        }
        false
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Char(char),
    Star,
}

fn tokenize(raw: &str) -> Vec<Token> {
    raw.chars()
        .map(|c| if c == '*' { Token::Star } else { Token::Char(c) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let p = Pattern::compile("memory__check");
        assert!(p.is_exact());
        assert!(p.matches("memory__check"));
        assert!(!p.matches("memory__check_embedding_mode"));
    }

    #[test]
    fn test_prefix_glob() {
        let p = Pattern::compile("memory__*");
        assert!(p.matches("memory__check"));
        assert!(p.matches("memory__"));
        assert!(!p.matches("search__check"));
    }

    #[test]
    fn test_suffix_glob() {
        let p = Pattern::compile("*__delete");
        assert!(p.matches("memory__delete"));
        assert!(!p.matches("memory__delete_all"));
    }

    #[test]
    fn test_middle_glob() {
        let p = Pattern::compile("memory__*_mode");
        assert!(p.matches("memory__embedding_mode"));
        assert!(p.matches("memory___mode"));
        assert!(!p.matches("memory__embedding"));
    }

    #[test]
    fn test_multiple_globs() {
        let p = Pattern::compile("*__get_*");
        assert!(p.matches("fs__get_file"));
        assert!(!p.matches("fs__set_file"));
    }

    #[test]
    fn test_star_only_matches_everything() {
        let p = Pattern::compile("*");
        assert!(p.matches(""));
        assert!(p.matches("anything__at_all"));
    }

    #[test]
    fn test_specificity_order() {
        let mut patterns = vec![
            Pattern::compile("*"),
            Pattern::compile("memory__check"),
            Pattern::compile("memory__*"),
            Pattern::compile("mem*"),
            Pattern::compile("*__check"),
        ];
        patterns.sort_by(Pattern::specificity_cmp);
        let order: Vec<&str> = patterns.iter().map(Pattern::raw).collect();
        assert_eq!(order, vec!["memory__check", "memory__*", "mem*", "*__check", "*"]);
    }

    #[test]
    fn test_conflicts_exist() {
        let a = Pattern::compile("memory__*");
        let b = Pattern::compile("*__check");
        assert!(a.may_conflict(&b), "memory__check matches both");

        let c = Pattern::compile("memory__check");
        assert!(a.may_conflict(&c));
        assert!(b.may_conflict(&c));
    }

    #[test]
    fn test_disjoint_patterns_do_not_conflict() {
        let a = Pattern::compile("memory__*");
        let b = Pattern::compile("search__*");
        assert!(!a.may_conflict(&b));

        let c = Pattern::compile("alpha");
        let d = Pattern::compile("beta");
        assert!(!c.may_conflict(&d));
    }

    #[test]
    fn test_conflict_with_interleaved_stars() {
        let a = Pattern::compile("a*c");
        let b = Pattern::compile("*b*");
        assert!(a.may_conflict(&b), "abc matches both");

        let e = Pattern::compile("a*z");
        let f = Pattern::compile("b*");
        assert!(!e.may_conflict(&f), "one starts with a, the other with b");
    }
}
