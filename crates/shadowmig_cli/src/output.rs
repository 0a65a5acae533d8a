//! Human and JSON output for CLI commands.

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use shadowmig::{AppliedEntry, MigrateReport, ShadowOutcome};

pub fn print_report(report: &MigrateReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", describe_shadow(&report.shadow));
    if report.applied.is_empty() {
        println!("All migrations are already applied.");
    } else {
        println!("Applied {} migration(s):", report.applied.len());
        for name in &report.applied {
            println!("  {}", name);
        }
    }
    Ok(())
}

pub fn print_status(entries: &[AppliedEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No migrations applied.");
        return Ok(());
    }

    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.name.clone(),
                e.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ]
        })
        .collect();
    print_table(&["MIGRATION", "APPLIED AT"], rows);
    Ok(())
}

pub fn print_pending(names: &[String], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(names)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("No pending migrations.");
    } else {
        println!("{} pending migration(s):", names.len());
        for name in names {
            println!("  {}", name);
        }
    }
    Ok(())
}

/// Print an error as `{"error": ..., "causes": [...]}` on stdout.
pub fn print_json_error(err: &anyhow::Error) {
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    let body = serde_json::json!({
        "error": err.to_string(),
        "causes": causes,
    });
    println!("{}", body);
}

fn describe_shadow(outcome: &ShadowOutcome) -> String {
    match outcome {
        ShadowOutcome::NotNeeded => "Shadow database test: not needed".to_string(),
        ShadowOutcome::Skipped { reason } => format!("Shadow database test: skipped ({})", reason),
        ShadowOutcome::Passed { tested } => {
            format!("Shadow database test: passed ({} migration(s))", tested)
        }
    }
}

fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        table.add_row(row);
    }

    println!("{}", table);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_shadow() {
        assert!(describe_shadow(&ShadowOutcome::NotNeeded).contains("not needed"));
        assert!(describe_shadow(&ShadowOutcome::Passed { tested: 3 }).contains("3 migration"));
        let skipped = ShadowOutcome::Skipped {
            reason: "no url".to_string(),
        };
        assert!(describe_shadow(&skipped).contains("skipped (no url)"));
    }

    #[test]
    fn test_report_json_shape() {
        let report = MigrateReport {
            applied: vec!["001_a.sql".to_string()],
            shadow: ShadowOutcome::Passed { tested: 1 },
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["applied"][0], "001_a.sql");
        assert_eq!(value["shadow"]["status"], "passed");
        assert_eq!(value["shadow"]["tested"], 1);
    }
}
