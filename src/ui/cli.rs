use crate::ui::io::Output;

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::{Table, Tabled, settings::Style};

/// Terminal output: `psql` style tables, or JSON when `json` is set
pub struct Cli {
    pub json: bool,
}

impl Cli {
    fn print_json(value: &impl Serialize) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

// Strings are shown bare, missing values as nothing, everything else as compact JSON
fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

impl Output for Cli {
    /// Prints a bolded title followed by a blank line. Suppressed in JSON mode
    fn show_title(&self, title: &str) {
        if !self.json {
            println!("\n{}\n", title.to_string().bold());
        }
    }

    /// Renders `rows` as a `psql` table, or as a JSON array
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be serialized
    fn show_table<T: Tabled + Serialize>(&self, rows: &[T]) -> Result<()> {
        if self.json {
            return Self::print_json(&rows);
        }
        let mut table = Table::new(rows);
        table.with(Style::psql());
        println!("{table}");
        Ok(())
    }

    /// Renders a single record as a two-column `psql` table of its top-level keys, or as
    /// a JSON object. Nested maps are flattened one level, so note fields get a row each.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized
    fn show_record<T: Serialize>(&self, record: &T) -> Result<()> {
        if self.json {
            return Self::print_json(record);
        }

        let mut builder = Builder::default();
        builder.push_record(["key".to_string(), "value".to_string()]);
        match serde_json::to_value(record)? {
            Value::Object(map) => {
                for (key, value) in map {
                    match value {
                        Value::Object(nested) => {
                            for (inner, value) in nested {
                                builder.push_record([format!("{key}.{inner}"), render_value(&value)]);
                            }
                        }
                        other => builder.push_record([key, render_value(&other)]),
                    }
                }
            }
            other => builder.push_record(["value".to_string(), render_value(&other)]),
        }

        let mut table = builder.build();
        table.with(Style::psql());
        println!("{table}");
        Ok(())
    }
}
