//! Node identifier patterns.
//!
//! A `nodename_pattern` is a glob over node type identifiers: `*` matches any
//! run of characters (including none), `?` matches exactly one character, and
//! `\` escapes the following character. A pattern without wildcards is a
//! literal node name.
//!
//! Two patterns overlap when at least one identifier matches both. That is
//! decided exactly by searching the product of the two patterns' automata,
//! so the test is symmetric by construction.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyRun,
}

/// A validated node identifier pattern.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePattern {
    source: String,
    tokens: Vec<Token>,
    matcher: Regex,
}

impl NodePattern {
    /// Parse and validate a pattern.
    pub fn parse(source: &str) -> Result<Self, String> {
        if source.is_empty() {
            return Err("node pattern is empty".to_string());
        }

        let mut tokens = Vec::new();
        let mut chars = source.chars();
        while let Some(c) = chars.next() {
            if c.is_whitespace() || c.is_control() {
                return Err(format!(
                    "node pattern '{}' contains whitespace or control characters",
                    source.escape_debug()
                ));
            }
            let token = match c {
                '*' => Token::AnyRun,
                '?' => Token::AnyOne,
                '\\' => match chars.next() {
                    Some(escaped) if !escaped.is_whitespace() && !escaped.is_control() => {
                        Token::Literal(escaped)
                    }
                    _ => {
                        return Err(format!(
                            "node pattern '{}' ends with a dangling escape",
                            source
                        ))
                    }
                },
                other => Token::Literal(other),
            };
            // Runs of `*` are equivalent to one.
            if token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun) {
                continue;
            }
            tokens.push(token);
        }

        let matcher = Regex::new(&to_regex(&tokens))
            .map_err(|e| format!("node pattern '{}' is not compilable: {}", source, e))?;

        Ok(Self {
            source: source.to_string(),
            tokens,
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern contains no wildcards.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Does this pattern claim the given node type identifier?
    pub fn matches(&self, node_type: &str) -> bool {
        self.matcher.is_match(node_type)
    }

    /// Is there any identifier claimed by both patterns?
    pub fn overlaps(&self, other: &NodePattern) -> bool {
        let a = &self.tokens;
        let b = &other.tokens;

        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
        queue.push_back((0, 0));

        while let Some((i, j)) = queue.pop_front() {
            if !seen.insert((i, j)) {
                continue;
            }
            if i == a.len() && j == b.len() {
                return true;
            }

            // A run wildcard may match nothing.
            if a.get(i) == Some(&Token::AnyRun) {
                queue.push_back((i + 1, j));
            }
            if b.get(j) == Some(&Token::AnyRun) {
                queue.push_back((i, j + 1));
            }

            // Consume one character both sides accept.
            if let (Some(ta), Some(tb)) = (a.get(i), b.get(j)) {
                if *ta == Token::AnyRun && *tb == Token::AnyRun {
                    // Consuming on both runs loops in place; epsilon moves cover it.
                    continue;
                }
                let compatible = match (ta, tb) {
                    (Token::Literal(x), Token::Literal(y)) => x == y,
                    _ => true,
                };
                if compatible {
                    let ni = if *ta == Token::AnyRun { i } else { i + 1 };
                    let nj = if *tb == Token::AnyRun { j } else { j + 1 };
                    queue.push_back((ni, nj));
                }
            }
        }

        false
    }
}

fn to_regex(tokens: &[Token]) -> String {
    let mut out = String::from("^");
    for token in tokens {
        match token {
            Token::Literal(c) => out.push_str(&regex::escape(&c.to_string())),
            Token::AnyOne => out.push('.'),
            Token::AnyRun => out.push_str(".*"),
        }
    }
    out.push('$');
    out
}

impl PartialEq for NodePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for NodePattern {}

impl fmt::Debug for NodePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodePattern").field(&self.source).finish()
    }
}

impl fmt::Display for NodePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for NodePattern {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodePattern::parse(&value)
    }
}

impl From<NodePattern> for String {
    fn from(pattern: NodePattern) -> Self {
        pattern.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> NodePattern {
        NodePattern::parse(s).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(NodePattern::parse("").is_err());
        assert!(NodePattern::parse("foo bar").is_err());
        assert!(NodePattern::parse("foo\\").is_err());
        assert!(NodePattern::parse("tab\there").is_err());
    }

    #[test]
    fn test_literal_and_matching() {
        let literal = p("KSampler");
        assert!(literal.is_literal());
        assert!(literal.matches("KSampler"));
        assert!(!literal.matches("KSamplerAdvanced"));

        let glob = p("Impact*");
        assert!(!glob.is_literal());
        assert!(glob.matches("Impact"));
        assert!(glob.matches("ImpactWildcardProcessor"));
        assert!(!glob.matches("NotImpact"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = p("foo.bar");
        assert!(pattern.matches("foo.bar"));
        assert!(!pattern.matches("fooXbar"));
    }

    #[test]
    fn test_escape() {
        let pattern = p("weird\\*name");
        assert!(pattern.is_literal());
        assert!(pattern.matches("weird*name"));
        assert!(!pattern.matches("weirdXname"));
    }

    #[test]
    fn test_overlap_exact_and_superset() {
        assert!(p("foo.bar").overlaps(&p("foo.bar")));
        assert!(p("foo.*").overlaps(&p("foo.bar")));
        assert!(p("foo.bar").overlaps(&p("foo.*")));
        assert!(!p("foo.bar").overlaps(&p("foo.baz")));
    }

    #[test]
    fn test_overlap_two_wildcards() {
        assert!(p("foo*").overlaps(&p("*bar")));
        assert!(p("a?c").overlaps(&p("?b?")));
        assert!(!p("a*").overlaps(&p("b*")));
        assert!(!p("*x").overlaps(&p("*y")));
        assert!(!p("??").overlaps(&p("???")));
        assert!(p("*").overlaps(&p("anything")));
    }

    #[test]
    fn test_overlap_is_symmetric() {
        let patterns = ["foo.*", "foo.bar", "*bar", "a?c", "?b?", "x", "*", "f*o*o"];
        for a in patterns {
            for b in patterns {
                assert_eq!(
                    p(a).overlaps(&p(b)),
                    p(b).overlaps(&p(a)),
                    "asymmetric for {} / {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_serde_validates() {
        let ok: NodePattern = serde_json::from_str("\"Impact*\"").unwrap();
        assert_eq!(ok.as_str(), "Impact*");
        assert!(serde_json::from_str::<NodePattern>("\"\"").is_err());
    }
}
