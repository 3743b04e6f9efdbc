use glob::Pattern;
use thiserror::Error;

use crate::tags::TagSet;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("selector expression is empty")]
    Empty,

    #[error("negation without an operand")]
    BareNegation,

    #[error("empty alternative in term {0:?}")]
    EmptyAlternative(String),

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// A parsed boolean predicate over a tag set.
///
/// An expression is a whitespace separated list of terms that must all
/// match. A term may be negated with a leading `!` and may list
/// `|`-separated alternatives, each of which is a glob pattern over tag
/// names. The bare term `*` matches any target.
///
/// ```text
/// "k8s"            target is tagged k8s
/// "k8s !service"   tagged k8s and not tagged service
/// "pod|service"    tagged pod or service
/// "k8s-*"          any tag matching the glob
/// "*"              every target
/// ```
#[derive(Clone, Debug)]
pub struct Selector {
    terms: Vec<Term>,
}

#[derive(Clone, Debug)]
struct Term {
    negative: bool,
    alternatives: Vec<Alternative>,
}

#[derive(Clone, Debug)]
enum Alternative {
    Any,
    Literal(String),
    Pattern(Pattern),
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        let mut terms = Vec::new();

        for raw in expr.split_whitespace() {
            let (negative, rest) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };

            if rest.is_empty() {
                return Err(ParseError::BareNegation);
            }

            let mut alternatives = Vec::new();
            for alternative in rest.split('|') {
                if alternative.is_empty() {
                    return Err(ParseError::EmptyAlternative(raw.to_string()));
                }

                alternatives.push(Alternative::parse(alternative)?);
            }

            terms.push(Term {
                negative,
                alternatives,
            });
        }

        if terms.is_empty() {
            return Err(ParseError::Empty);
        }

        Ok(Selector { terms })
    }

    pub fn matches(&self, tags: &TagSet) -> bool {
        self.terms.iter().all(|term| term.matches(tags))
    }
}

impl Term {
    fn matches(&self, tags: &TagSet) -> bool {
        let hit = self.alternatives.iter().any(|alternative| match alternative {
            Alternative::Any => true,
            Alternative::Literal(tag) => tags.contains(tag),
            Alternative::Pattern(pattern) => tags.iter().any(|tag| pattern.matches(tag)),
        });

        hit != self.negative
    }
}

impl Alternative {
    fn parse(input: &str) -> Result<Self, ParseError> {
        if input == "*" {
            return Ok(Alternative::Any);
        }

        if input.contains(['*', '?', '[']) {
            let pattern = Pattern::new(input).map_err(|source| ParseError::InvalidPattern {
                pattern: input.to_string(),
                source,
            })?;

            return Ok(Alternative::Pattern(pattern));
        }

        Ok(Alternative::Literal(input.to_string()))
    }
}
