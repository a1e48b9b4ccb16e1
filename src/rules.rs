use crate::config::{FieldType, LogFileConfig};
use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

/// One field mapping with its fallback extraction pattern compiled up front,
/// so nothing is re-compiled or re-dispatched per record.
#[derive(Debug)]
pub struct CompiledMapping {
    pub source_field: String,
    pub target_field: String,
    pub field_type: FieldType,
    /// Matches `<source_field>=<token>` in plain-text lines.
    pub extract: Regex,
}

#[derive(Debug)]
pub struct LogRule {
    pub pattern: Regex,
    pub table: String,
    pub mappings: Vec<CompiledMapping>,
}

/// All configured rules, in declaration order. Routing is first-match-wins on
/// the file's base name; a file matching no rule is ignored.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<LogRule>,
}

impl RuleSet {
    pub fn compile(configs: &[LogFileConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let pattern = Regex::new(&config.file_pattern).with_context(|| {
                format!("invalid file_pattern regex {:?}", config.file_pattern)
            })?;

            let mut mappings = Vec::with_capacity(config.field_mappings.len());
            for mapping in &config.field_mappings {
                let extract =
                    Regex::new(&format!(r"{}=([^\s]+)", regex::escape(&mapping.source_field)))
                        .with_context(|| {
                            format!(
                                "failed to build extraction pattern for source_field {:?}",
                                mapping.source_field
                            )
                        })?;
                mappings.push(CompiledMapping {
                    source_field: mapping.source_field.clone(),
                    target_field: mapping.target_field.clone(),
                    field_type: mapping.field_type,
                    extract,
                });
            }

            rules.push(LogRule {
                pattern,
                table: config.table.clone(),
                mappings,
            });
        }
        Ok(Self { rules })
    }

    /// Resolves the rule for a path by testing its base name against each
    /// pattern in declaration order.
    pub fn match_path(&self, path: &Path) -> Option<&LogRule> {
        let base_name = path.file_name()?.to_str()?;
        self.rules.iter().find(|rule| rule.pattern.is_match(base_name))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::FieldMappingConfig;

    /// Builds a single-rule set from (source, target, type) triples.
    pub(crate) fn rule_set(
        file_pattern: &str,
        table: &str,
        mappings: &[(&str, &str, FieldType)],
    ) -> RuleSet {
        let config = LogFileConfig {
            file_pattern: file_pattern.to_string(),
            table: table.to_string(),
            field_mappings: mappings
                .iter()
                .map(|(source, target, field_type)| FieldMappingConfig {
                    source_field: source.to_string(),
                    target_field: target.to_string(),
                    field_type: *field_type,
                })
                .collect(),
        };
        RuleSet::compile(&[config]).expect("test rule should compile")
    }
}
