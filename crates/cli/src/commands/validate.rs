//! Validate Command
//!
//! Parses scenario files without sending any request.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use restament::{load_scenarios, Scenario};
use serde::Serialize;

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Directory containing scenario YAML files
    #[arg(short, long, default_value = "tests/scenarios")]
    pub specs: PathBuf,

    /// Only list scenarios with this tag
    #[arg(short, long)]
    pub tag: Option<String>,
}

/// Scenario summary for display
#[derive(Serialize, Clone)]
pub struct ScenarioSummary {
    pub name: String,
    pub title: String,
    pub tables: Vec<String>,
    pub tags: Vec<String>,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(scenario: &Scenario) -> Self {
        Self {
            name: scenario.display_name().to_string(),
            title: scenario.title(),
            tables: scenario.table_names().into_iter().map(String::from).collect(),
            tags: scenario.tags.clone(),
        }
    }
}

impl TableDisplay for ScenarioSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Title", "Tables", "Tags"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.title.clone(),
            self.tables.join(", "),
            self.tags.join(", "),
        ]
    }
}

pub fn execute(args: ValidateArgs, format: OutputFormat) -> Result<bool> {
    let scenarios = load_scenarios(&args.specs, args.tag.as_deref(), None)
        .with_context(|| format!("invalid scenarios under {}", args.specs.display()))?;

    let summaries: Vec<ScenarioSummary> = scenarios.iter().map(ScenarioSummary::from).collect();
    print_list(&summaries, format);

    if format == OutputFormat::Table {
        print_success(&format!("{} scenario(s) parsed", summaries.len()));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_tables_once() {
        let scenarios = Scenario::from_yaml(
            r#"
url: /users
method: POST
status: 201
tags: [users]
db:
  - tablename: users
    mock:
      data: { id: 1, name: Ann }
  - tablename: users
    result:
      data: [{ id: 1, name: Ann }]
"#,
        )
        .unwrap();

        let summary = ScenarioSummary::from(&scenarios[0]);
        assert_eq!(summary.name, "/users");
        assert_eq!(summary.tables, vec!["users".to_string()]);
        assert_eq!(
            summary.row()[1],
            "/users: should return 201 on POST access (posting in JSON format)"
        );
    }
}
