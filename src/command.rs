//! Job command rendering.
//!
//! The external job's invocation (a long list of tool-specific flags) lives in
//! a template string; the loop only fills in the five interval placeholders.

use std::fmt;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CdmError, CdmResult};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[a-z][a-z0-9_]*>").unwrap_or_else(|e| panic!("placeholder pattern: {}", e))
});

pub const DEFAULT_COMMAND_TEMPLATE: &str = r#"./spark-3.5.3-bin-hadoop3-scala2.13/bin/spark-submit \
  --properties-file cdm-spark.properties \
  --conf spark.executor.extraJavaOptions='-Dlog4j.configurationFile=log4j2.properties' \
  --conf spark.driver.extraJavaOptions='-Dlog4j.configurationFile=log4j2.properties' \
  --driver-memory 25G \
  --executor-memory 25G \
  --num-executors 32 \
  --conf spark.cdm.filter.cassandra.partition.min='<start_token>' \
  --conf spark.cdm.filter.cassandra.partition.max='<end_token>' \
  --conf spark.cdm.perfops.numParts='<num_partitions>' \
  --conf spark.cdm.perfops.ratelimit.origin='<read_rate_limit>' \
  --conf spark.cdm.perfops.ratelimit.target='<write_rate_limit>' \
  --conf spark.cdm.perfops.consistency.read='LOCAL_ONE' \
  --master "local[*]" \
  --class com.datastax.cdm.job.Migrate cassandra-data-migrator.jar"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    StartToken,
    EndToken,
    NumPartitions,
    ReadRateLimit,
    WriteRateLimit,
}

impl Placeholder {
    pub const ALL: [Placeholder; 5] = [
        Placeholder::StartToken,
        Placeholder::EndToken,
        Placeholder::NumPartitions,
        Placeholder::ReadRateLimit,
        Placeholder::WriteRateLimit,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::StartToken => "<start_token>",
            Placeholder::EndToken => "<end_token>",
            Placeholder::NumPartitions => "<num_partitions>",
            Placeholder::ReadRateLimit => "<read_rate_limit>",
            Placeholder::WriteRateLimit => "<write_rate_limit>",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.token() == token)
    }
}

/// Values substituted into the template for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobArgs {
    pub start_token: i128,
    pub end_token: i128,
    pub num_partitions: i64,
    pub read_rate_limit: i64,
    pub write_rate_limit: i64,
}

impl JobArgs {
    fn value(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::StartToken => self.start_token.to_string(),
            Placeholder::EndToken => self.end_token.to_string(),
            Placeholder::NumPartitions => self.num_partitions.to_string(),
            Placeholder::ReadRateLimit => self.read_rate_limit.to_string(),
            Placeholder::WriteRateLimit => self.write_rate_limit.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
}

impl CommandTemplate {
    /// Accept a template, rejecting placeholder-shaped tokens the builder
    /// cannot fill. Known placeholders that are absent only produce a warning.
    pub fn parse(source: &str) -> CdmResult<Self> {
        let unknown = unknown_placeholders(source);
        if !unknown.is_empty() {
            return Err(CdmError::template("template has unknown placeholders", unknown));
        }
        for placeholder in Placeholder::ALL {
            if !source.contains(placeholder.token()) {
                warn!("Command template does not use {}", placeholder.token());
            }
        }
        Ok(Self { source: source.to_string() })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute every placeholder occurrence.
    pub fn build(&self, args: &JobArgs) -> CdmResult<String> {
        let mut command = self.source.clone();
        for placeholder in Placeholder::ALL {
            command = command.replace(placeholder.token(), &args.value(placeholder));
        }
        let leftover = unknown_placeholders(&command);
        if !leftover.is_empty() {
            return Err(CdmError::template("rendered command still has placeholders", leftover));
        }
        Ok(command)
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self { source: DEFAULT_COMMAND_TEMPLATE.to_string() }
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn unknown_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|token| Placeholder::from_token(token).is_none())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn args() -> JobArgs {
        JobArgs {
            start_token: -9223372036854775808,
            end_token: -9221527362447404853,
            num_partitions: 5000,
            read_rate_limit: 75000,
            write_rate_limit: 40000,
        }
    }

    #[test]
    fn test_default_template_renders_every_flag() {
        let command = CommandTemplate::default().build(&args()).unwrap();
        assert!(command.contains("partition.min='-9223372036854775808'"));
        assert!(command.contains("partition.max='-9221527362447404853'"));
        assert!(command.contains("numParts='5000'"));
        assert!(command.contains("ratelimit.origin='75000'"));
        assert!(command.contains("ratelimit.target='40000'"));
        assert!(!command.contains("<start_token>"));
    }

    #[test]
    fn test_repeated_placeholder_replaced_everywhere() {
        let template = CommandTemplate::parse("job <start_token> <end_token> # from <start_token>").unwrap();
        let command = template.build(&args()).unwrap();
        assert_eq!(
            command,
            "job -9223372036854775808 -9221527362447404853 # from -9223372036854775808"
        );
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = CommandTemplate::parse("job --min <start_token> --table <table_name>").unwrap_err();
        match err {
            CdmError::Template { placeholders, .. } => assert_eq!(placeholders, vec!["<table_name>".to_string()]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_shell_redirection_is_not_a_placeholder() {
        let template = CommandTemplate::parse("job <start_token> < input.txt 2>&1").unwrap();
        assert_eq!(template.build(&args()).unwrap(), "job -9223372036854775808 < input.txt 2>&1");
    }

    proptest! {
        #[test]
        fn prop_no_placeholder_survives(
            start in any::<i64>(),
            width in 1i64..i64::MAX,
            parts in 1i64..100_000,
            read in 0i64..1_000_000,
            write in 0i64..1_000_000,
            prefix in "[a-z ]{0,12}",
        ) {
            let template = CommandTemplate::parse(&format!(
                "{} <start_token> <end_token> <num_partitions> <read_rate_limit> <write_rate_limit>",
                prefix
            )).unwrap();
            let args = JobArgs {
                start_token: start as i128,
                end_token: start as i128 + width as i128,
                num_partitions: parts,
                read_rate_limit: read,
                write_rate_limit: write,
            };
            let command = template.build(&args).unwrap();
            prop_assert!(!command.contains('<'));
            let fields: Vec<&str> = command.split_whitespace().rev().take(5).collect();
            prop_assert_eq!(fields[4], args.start_token.to_string());
            prop_assert_eq!(fields[0], write.to_string());
        }
    }
}
