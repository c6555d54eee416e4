//! AMQP topic-exchange pattern matching.
//!
//! Routing keys and patterns are split on `.`. In a pattern, `*` matches
//! exactly one segment, `#` matches zero or more segments and any other
//! segment matches literally.
//!
//! | pattern             | `orders.eu.created` | `orders.eu.west.created` | `orders` |
//! |---------------------|---------------------|--------------------------|----------|
//! | `orders.*.created`  | yes                 | no                       | no       |
//! | `orders.#`          | yes                 | yes                      | yes      |
//! | `orders.#.created`  | yes                 | yes                      | no       |

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const DELIMITER: char = '.';

/// Errors from parsing a [`TopicPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("topic pattern is empty")]
    Empty,

    /// A wildcard character shares a segment with other characters.
    #[error("segment '{segment}' of pattern '{pattern}' mixes a wildcard with literal text")]
    MixedWildcard { pattern: String, segment: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    One,
    Many,
}

impl Segment {
    fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }
}

/// A parsed topic pattern.
///
/// Two patterns compare equal when their textual form is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parses a pattern.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let segments = pattern
            .split(DELIMITER)
            .map(|segment| match segment {
                "*" => Ok(Segment::One),
                "#" => Ok(Segment::Many),
                s if s.contains(['*', '#']) => Err(PatternError::MixedWildcard {
                    pattern: pattern.to_string(),
                    segment: s.to_string(),
                }),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Returns the pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of `*` and `#` segments. Lower is more specific.
    pub fn wildcard_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_wildcard()).count()
    }

    /// Returns `true` if the pattern contains no wildcards.
    pub fn is_literal(&self) -> bool {
        self.wildcard_count() == 0
    }

    /// Tests whether `routing_key` matches this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        if self.is_literal() {
            return self.raw == routing_key;
        }

        let words: Vec<&str> = routing_key.split(DELIMITER).collect();
        let m = words.len();

        // reachable[j]: the first i pattern segments can consume the first j words
        let mut reachable = vec![false; m + 1];
        reachable[0] = true;

        for segment in &self.segments {
            let mut next = vec![false; m + 1];
            match segment {
                Segment::Many => {
                    let mut any = false;
                    for j in 0..=m {
                        any |= reachable[j];
                        next[j] = any;
                    }
                }
                Segment::One => {
                    for j in 1..=m {
                        next[j] = reachable[j - 1];
                    }
                }
                Segment::Literal(lit) => {
                    for j in 1..=m {
                        next[j] = reachable[j - 1] && words[j - 1] == lit.as_str();
                    }
                }
            }
            reachable = next;
        }

        reachable[m]
    }

    /// Returns `true` if some routing key matches both patterns.
    pub fn overlaps(&self, other: &TopicPattern) -> bool {
        let (a, b) = (&self.segments, &other.segments);
        let (n, m) = (a.len(), b.len());

        // both[i][j]: the suffixes a[i..] and b[j..] can match a common key
        let mut both = vec![vec![false; m + 1]; n + 1];
        both[n][m] = true;

        for i in (0..=n).rev() {
            for j in (0..=m).rev() {
                if i == n && j == m {
                    continue;
                }
                let mut ok = false;
                if i < n && a[i] == Segment::Many {
                    ok |= both[i + 1][j] || (j < m && both[i][j + 1]);
                }
                if j < m && b[j] == Segment::Many {
                    ok |= both[i][j + 1] || (i < n && both[i + 1][j]);
                }
                if i < n && j < m && a[i] != Segment::Many && b[j] != Segment::Many {
                    let compatible = match (&a[i], &b[j]) {
                        (Segment::Literal(x), Segment::Literal(y)) => x == y,
                        _ => true,
                    };
                    ok |= compatible && both[i + 1][j + 1];
                }
                both[i][j] = ok;
            }
        }

        both[0][0]
    }
}

impl FromStr for TopicPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
