use crate::config::{MatchMode, RulesConfig};
use crate::node::NodeRecord;
use crate::utils::error::{Result, SpeedtestError};
use regex::Regex;

struct CompiledRule {
    mode: MatchMode,
    patterns: Vec<Regex>,
    url: String,
}

/// Chooses the download URL for a node from the configured match rules.
pub struct TestFileSelector {
    default_url: String,
    rules: Vec<CompiledRule>,
}

impl TestFileSelector {
    pub fn new(default_url: &str, rules: &RulesConfig) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.match_rules.len());
        for rule in &rules.match_rules {
            let url = rules
                .test_files
                .iter()
                .find(|t| t.tag == rule.tag)
                .map(|t| t.url.clone())
                .ok_or_else(|| {
                    SpeedtestError::Config(format!("Unknown test file tag: {}", rule.tag))
                })?;
            let patterns = rule
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        SpeedtestError::Config(format!("Invalid match pattern '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            compiled.push(CompiledRule {
                mode: rule.mode,
                patterns,
                url,
            });
        }
        Ok(Self {
            default_url: default_url.to_string(),
            rules: compiled,
        })
    }

    /// First matching rule wins; otherwise the default test file.
    pub fn select(&self, node: &NodeRecord) -> &str {
        for rule in &self.rules {
            let field = match rule.mode {
                MatchMode::Group => node.group.as_str(),
                MatchMode::Remarks => node.remarks.as_str(),
                MatchMode::Server => node.server.as_str(),
                MatchMode::Protocol => node.link_type.as_str(),
            };
            if rule.patterns.iter().any(|re| re.is_match(field)) {
                return &rule.url;
            }
        }
        &self.default_url
    }
}
