use serde::Deserialize;
use thiserror::Error;

use super::{Builder, Conf};
use crate::selector::{self, Selector};
use crate::tags::TagSet;
use crate::target::Target;
use crate::template::{self, Funcs, Template};

#[derive(Debug, Error)]
pub enum Error {
    #[error("build rule list is empty")]
    NoRules,

    #[error("build rule {index}: selector: {source}")]
    Selector {
        index: usize,
        source: selector::ParseError,
    },

    #[error("build rule {index}: apply list is empty")]
    NoApplies { index: usize },

    #[error("build rule {index} apply {sub}: selector: {source}")]
    ApplySelector {
        index: usize,
        sub: usize,
        source: selector::ParseError,
    },

    #[error("build rule {index} apply {sub}: template: {source}")]
    Template {
        index: usize,
        sub: usize,
        source: template::ParseError,
    },
}

/// One build rule: a selector gating the rule, tags stamped onto every
/// produced config, and an ordered list of apply sub-rules whose templates
/// render the configuration text itself.
#[derive(Clone, Debug, Deserialize)]
pub struct BuildRuleConfig {
    #[serde(default)]
    pub name: String,
    pub selector: String,
    pub tags: TagSet,
    pub apply: Vec<ApplyConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApplyConfig {
    pub selector: String,
    #[serde(default)]
    pub tags: Option<TagSet>,
    pub template: String,
}

struct BuildRule {
    name: String,
    selector: Selector,
    tags: TagSet,
    applies: Vec<Apply>,
}

struct Apply {
    selector: Selector,
    tags: Option<TagSet>,
    template: Template,
}

/// Ordered rule engine rendering configuration records for targets.
pub struct BuildEngine {
    rules: Vec<BuildRule>,
}

impl BuildEngine {
    pub fn new(configs: Vec<BuildRuleConfig>, funcs: Funcs) -> Result<Self, Error> {
        if configs.is_empty() {
            return Err(Error::NoRules);
        }

        let mut rules = Vec::with_capacity(configs.len());
        for (index, config) in configs.into_iter().enumerate() {
            let selector = Selector::parse(&config.selector)
                .map_err(|source| Error::Selector { index, source })?;

            if config.apply.is_empty() {
                return Err(Error::NoApplies { index });
            }

            let mut applies = Vec::with_capacity(config.apply.len());
            for (sub, config) in config.apply.into_iter().enumerate() {
                let selector = Selector::parse(&config.selector)
                    .map_err(|source| Error::ApplySelector { index, sub, source })?;

                let template = Template::parse(&config.template, &funcs)
                    .map_err(|source| Error::Template { index, sub, source })?;

                applies.push(Apply {
                    selector,
                    tags: config.tags,
                    template,
                });
            }

            rules.push(BuildRule {
                name: config.name,
                selector,
                tags: config.tags,
                applies,
            });
        }

        Ok(BuildEngine { rules })
    }
}

impl Builder for BuildEngine {
    fn build(&self, target: &dyn Target) -> Vec<Conf> {
        let mut confs = Vec::new();

        for rule in &self.rules {
            if !rule.selector.matches(target.tags()) {
                continue;
            }

            for apply in &rule.applies {
                if !apply.selector.matches(target.tags()) {
                    continue;
                }

                let text = match apply.template.render(target) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(
                            message = "config template failed",
                            rule = %rule.name,
                            target = target.tuid(),
                            ?err,
                        );
                        continue;
                    }
                };

                let mut tags = rule.tags.clone();
                if let Some(extra) = &apply.tags {
                    tags.merge(extra);
                }

                confs.push(Conf {
                    tags,
                    text,
                    stale: false,
                });
            }
        }

        confs
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MockTarget;

    fn engine(yaml: &str) -> Result<BuildEngine, Error> {
        let configs = serde_yaml::from_str::<Vec<BuildRuleConfig>>(yaml).unwrap();
        BuildEngine::new(configs, Funcs::default())
    }

    fn nginx_pod() -> MockTarget {
        MockTarget::new(
            "default_web_nginx_tcp_80",
            &[
                ("name", "web"),
                ("address", "172.17.0.2:80"),
                ("port", "80"),
            ],
        )
        .with_tags("nginx pod")
    }

    #[test]
    fn renders_config_text() {
        let engine = engine(
            r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "pod"
      template: |-
        module: nginx
        name: {{ name }}
        url: http://{{ address }}/stub_status
"#,
        )
        .unwrap();

        let confs = engine.build(&nginx_pod());
        assert_eq!(confs.len(), 1);
        assert_eq!(
            confs[0].text,
            "module: nginx\nname: web\nurl: http://172.17.0.2:80/stub_status"
        );
        assert_eq!(confs[0].tags, "jobs".parse().unwrap());
        assert!(!confs[0].stale);
    }

    #[test]
    fn unmatched_rule_selector_contributes_nothing() {
        let engine = engine(
            r#"
- selector: "redis"
  tags: "jobs"
  apply:
    - selector: "*"
      template: "module: redis"
"#,
        )
        .unwrap();

        assert!(engine.build(&nginx_pod()).is_empty());
    }

    #[test]
    fn apply_selector_filters_within_a_rule() {
        let engine = engine(
            r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "service"
      template: "via-service"
    - selector: "pod"
      template: "via-pod"
"#,
        )
        .unwrap();

        let confs = engine.build(&nginx_pod());
        assert_eq!(confs.len(), 1);
        assert_eq!(confs[0].text, "via-pod");
    }

    #[test]
    fn configs_come_in_rule_then_apply_order() {
        let engine = engine(
            r#"
- selector: "pod"
  tags: "first"
  apply:
    - selector: "*"
      template: "one"
    - selector: "*"
      template: "two"
- selector: "nginx"
  tags: "second"
  apply:
    - selector: "*"
      template: "three"
"#,
        )
        .unwrap();

        let texts = engine
            .build(&nginx_pod())
            .into_iter()
            .map(|conf| conf.text)
            .collect::<Vec<_>>();

        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[test]
    fn apply_tags_are_merged_into_rule_tags() {
        let engine = engine(
            r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "pod"
      tags: "local"
      template: "module: nginx"
"#,
        )
        .unwrap();

        let confs = engine.build(&nginx_pod());
        assert_eq!(confs[0].tags, "jobs local".parse().unwrap());
    }

    #[test]
    fn render_failure_skips_only_that_apply() {
        let engine = engine(
            r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "*"
      template: "{{ cluster }}"
    - selector: "*"
      template: "name: {{ name }}"
"#,
        )
        .unwrap();

        let confs = engine.build(&nginx_pod());
        assert_eq!(confs.len(), 1);
        assert_eq!(confs[0].text, "name: web");
    }

    #[test]
    fn construction_validation() {
        assert!(matches!(
            BuildEngine::new(vec![], Funcs::default()),
            Err(Error::NoRules)
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "nginx"
  tags: "jobs"
  apply: []
"#,
            ),
            Err(Error::NoApplies { index: 0 })
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "!"
      template: "x"
"#,
            ),
            Err(Error::ApplySelector { index: 0, sub: 0, .. })
        ));

        assert!(matches!(
            engine(
                r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - selector: "*"
      template: "{{ nosuch name }}"
"#,
            ),
            Err(Error::Template { index: 0, sub: 0, .. })
        ));

        // apply selector and template are mandatory at deserialization time
        assert!(serde_yaml::from_str::<Vec<BuildRuleConfig>>(
            r#"
- selector: "nginx"
  tags: "jobs"
  apply:
    - template: "x"
"#,
        )
        .is_err());
    }
}
