use serde::Deserialize;
use thiserror::Error;

use super::Tagger;
use crate::selector::{self, Selector};
use crate::tags::TagSet;
use crate::target::Target;
use crate::template::{self, Funcs, Template};

#[derive(Debug, Error)]
pub enum Error {
    #[error("tag rule list is empty")]
    NoRules,

    #[error("tag rule {index}: selector: {source}")]
    Selector {
        index: usize,
        source: selector::ParseError,
    },

    #[error("tag rule {index}: match list is empty")]
    NoMatches { index: usize },

    #[error("tag rule {index} match {sub}: selector: {source}")]
    MatchSelector {
        index: usize,
        sub: usize,
        source: selector::ParseError,
    },

    #[error("tag rule {index} match {sub}: expression: {source}")]
    Expr {
        index: usize,
        sub: usize,
        source: template::ParseError,
    },
}

/// One tag rule: a selector gating the rule, a tag set merged on any
/// match, and an ordered list of match sub-rules.
#[derive(Clone, Debug, Deserialize)]
pub struct TagRuleConfig {
    #[serde(default)]
    pub name: String,
    pub selector: String,
    pub tags: TagSet,
    #[serde(rename = "match")]
    pub matches: Vec<TagMatchConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TagMatchConfig {
    #[serde(default)]
    pub selector: Option<String>,
    pub tags: TagSet,
    /// Boolean expression: the match applies when the rendered, trimmed
    /// output is exactly `true`.
    pub expr: String,
}

struct TagRule {
    name: String,
    selector: Selector,
    tags: TagSet,
    matches: Vec<TagRuleMatch>,
}

struct TagRuleMatch {
    selector: Option<Selector>,
    tags: TagSet,
    expr: Template,
}

/// Ordered rule engine decorating targets with tags.
///
/// Rule order is caller controlled and visible: tags applied by earlier
/// rules gate the selectors of later ones.
pub struct TagEngine {
    rules: Vec<TagRule>,
}

impl TagEngine {
    pub fn new(configs: Vec<TagRuleConfig>, funcs: Funcs) -> Result<Self, Error> {
        if configs.is_empty() {
            return Err(Error::NoRules);
        }

        let mut rules = Vec::with_capacity(configs.len());
        for (index, config) in configs.into_iter().enumerate() {
            let selector = Selector::parse(&config.selector)
                .map_err(|source| Error::Selector { index, source })?;

            if config.matches.is_empty() {
                return Err(Error::NoMatches { index });
            }

            let mut matches = Vec::with_capacity(config.matches.len());
            for (sub, config) in config.matches.into_iter().enumerate() {
                let selector = match &config.selector {
                    Some(expr) => Some(Selector::parse(expr).map_err(|source| {
                        Error::MatchSelector { index, sub, source }
                    })?),
                    None => None,
                };

                let expr = Template::parse(&config.expr, &funcs)
                    .map_err(|source| Error::Expr { index, sub, source })?;

                matches.push(TagRuleMatch {
                    selector,
                    tags: config.tags,
                    expr,
                });
            }

            rules.push(TagRule {
                name: config.name,
                selector,
                tags: config.tags,
                matches,
            });
        }

        Ok(TagEngine { rules })
    }
}

impl Tagger for TagEngine {
    fn tag(&self, target: &mut dyn Target) {
        for rule in &self.rules {
            if !rule.selector.matches(target.tags()) {
                continue;
            }

            for sub in &rule.matches {
                if let Some(selector) = &sub.selector {
                    if !selector.matches(target.tags()) {
                        continue;
                    }
                }

                let rendered = match sub.expr.render(&*target) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        warn!(
                            message = "tag expression failed",
                            rule = %rule.name,
                            target = target.tuid(),
                            ?err,
                        );
                        continue;
                    }
                };

                if rendered.trim() != "true" {
                    continue;
                }

                target.tags_mut().merge(&rule.tags);
                target.tags_mut().merge(&sub.tags);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTarget;

    fn engine(yaml: &str) -> Result<TagEngine, Error> {
        let configs = serde_yaml::from_str::<Vec<TagRuleConfig>>(yaml).unwrap();
        TagEngine::new(configs, Funcs::default())
    }

    fn nginx_pod() -> MockTarget {
        MockTarget::new(
            "default_web_nginx_tcp_80",
            &[
                ("name", "web"),
                ("port", "80"),
                ("labels.app", "nginx"),
            ],
        )
        .with_tags("seed")
    }

    #[test]
    fn expression_match_merges_rule_and_match_tags() {
        let engine = engine(
            r#"
- selector: "seed"
  tags: "apps"
  match:
    - tags: "nginx"
      expr: '{{ eq labels.app "nginx" }}'
    - tags: "redis"
      expr: '{{ eq labels.app "redis" }}'
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);

        assert_eq!(target.tags(), &"apps nginx seed".parse().unwrap());
    }

    #[test]
    fn rule_order_is_visible_to_later_selectors() {
        let adds_a = r#"
- selector: "seed"
  tags: "a"
  match:
    - tags: "a"
      expr: "true"
"#;
        let needs_a = r#"
- selector: "a"
  tags: "b"
  match:
    - tags: "b"
      expr: "true"
"#;

        // [R1, R2]: R1 adds `a`, which R2 then sees
        let engine_r1_r2 = engine(&format!("{adds_a}{needs_a}")).unwrap();
        let mut target = nginx_pod();
        engine_r1_r2.tag(&mut target);
        assert_eq!(target.tags(), &"a b seed".parse().unwrap());

        // [R2, R1]: R2 runs before `a` exists and never fires
        let engine = engine(&format!("{needs_a}{adds_a}")).unwrap();
        let mut target = nginx_pod();
        engine.tag(&mut target);
        assert_eq!(target.tags(), &"a seed".parse().unwrap());
    }

    #[test]
    fn unmatched_rule_selector_leaves_target_alone() {
        let engine = engine(
            r#"
- selector: "service"
  tags: "extra"
  match:
    - tags: "extra"
      expr: "true"
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);

        assert_eq!(target.tags(), &"seed".parse().unwrap());
    }

    #[test]
    fn match_selector_gates_expression() {
        let engine = engine(
            r#"
- selector: "*"
  tags: "matched"
  match:
    - selector: "absent"
      tags: "matched"
      expr: "true"
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);

        assert_eq!(target.tags(), &"seed".parse().unwrap());
    }

    #[test]
    fn render_failure_skips_only_that_match() {
        let engine = engine(
            r#"
- selector: "seed"
  tags: "kept"
  match:
    - tags: "broken"
      expr: "{{ missing_field }}"
    - tags: "kept"
      expr: "true"
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);

        assert!(target.tags().contains("kept"));
        assert!(!target.tags().contains("broken"));
    }

    #[test]
    fn non_true_output_does_not_tag() {
        let engine = engine(
            r#"
- selector: "seed"
  tags: "matched"
  match:
    - tags: "matched"
      expr: "{{ name }}"
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);

        assert!(!target.tags().contains("matched"));
    }

    #[test]
    fn tagging_is_idempotent() {
        let engine = engine(
            r#"
- selector: "seed"
  tags: "apps nginx"
  match:
    - tags: "nginx"
      expr: '{{ glob labels.app "nginx*" }}'
"#,
        )
        .unwrap();

        let mut target = nginx_pod();
        engine.tag(&mut target);
        let first = target.tags().clone();

        engine.tag(&mut target);
        assert_eq!(target.tags(), &first);
    }

    #[test]
    fn construction_validation() {
        assert!(matches!(
            TagEngine::new(vec![], Funcs::default()),
            Err(Error::NoRules)
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "!"
  tags: "a"
  match:
    - tags: "a"
      expr: "true"
"#,
            ),
            Err(Error::Selector { index: 0, .. })
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "*"
  tags: "a"
  match: []
"#,
            ),
            Err(Error::NoMatches { index: 0 })
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "*"
  tags: "a"
  match:
    - tags: "a"
      expr: "{{ nosuch name }}"
"#,
            ),
            Err(Error::Expr { index: 0, sub: 0, .. })
        ));

        // mandatory fields are enforced at deserialization time
        assert!(serde_yaml::from_str::<Vec<TagRuleConfig>>(
            r#"
- selector: "*"
  match:
    - tags: "a"
      expr: "true"
"#,
        )
        .is_err());
    }
}
