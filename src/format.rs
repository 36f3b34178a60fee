//! Output formatting for listings, load reports and cleanup results.

use crate::db::records::{get_i64, get_str, record_to_json};
use crate::report::{LoadReport, RootEntry};
use crate::service::{DumpListing, LISTED_COUNTS};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Json,
    #[default]
    Text,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "text" | "txt" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

/// Projects of a dump as a table, one line per project.
pub fn format_listing_text(listing: &DumpListing) -> String {
    let mut out = String::new();
    out.push_str(&format!("Projects in dump ({})\n", listing.roots.len()));

    let headers: Vec<&str> = LISTED_COUNTS.iter().map(|e| e.table()).collect();
    out.push_str(&format!(
        "  {:>8}  {:<30} {:<16} {}\n",
        "id",
        "name",
        "label",
        headers.join("  ")
    ));

    for root in &listing.roots {
        let id = get_i64(root, "id");
        let name = get_str(root, "name").unwrap_or("");
        let label = get_str(root, "label").unwrap_or("-");
        let deleted = get_str(root, "deleted_at").is_some();

        let counts: Vec<String> = headers
            .iter()
            .map(|table| {
                let count = id
                    .and_then(|id| listing.count(id, table))
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!("{:>width$}", count, width = table.len())
            })
            .collect();

        out.push_str(&format!(
            "  {:>8}  {:<30} {:<16} {}{}\n",
            id.map(|i| i.to_string()).unwrap_or_default(),
            name,
            label,
            counts.join("  "),
            if deleted { "  (deleted)" } else { "" }
        ));
    }
    out
}

pub fn format_listing_json(listing: &DumpListing) -> Value {
    let projects: Vec<Value> = listing
        .roots
        .iter()
        .map(|root| {
            let mut value = record_to_json(root);
            if let Some(id) = get_i64(root, "id") {
                value["descendants"] = json!(listing.counts.get(&id));
            }
            value
        })
        .collect();
    json!({ "projects": projects })
}

fn format_counts(counts: &BTreeMap<crate::entities::EntityType, usize>) -> String {
    counts
        .iter()
        .map(|(entity, count)| format!("{} {}", count, entity))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_root_text(entry: &RootEntry, dry_run: bool, out: &mut String) {
    let name = entry.name.as_deref().unwrap_or("?");
    let kind = if entry.is_replacement { "replace" } else { "new" };
    out.push_str(&format!(
        "- [{}] {} (dump id {}, {})",
        entry.status, name, entry.dump_id, kind
    ));
    if let Some(local_id) = entry.local_id {
        out.push_str(&format!(" -> local id {}", local_id));
    }
    out.push('\n');

    let (deleted_label, inserted_label) = if dry_run {
        ("would delete", "would insert")
    } else {
        ("deleted", "inserted")
    };
    if !entry.deleted.is_empty() {
        out.push_str(&format!("    {}: {}\n", deleted_label, format_counts(&entry.deleted)));
    }
    if !entry.inserted.is_empty() {
        out.push_str(&format!("    {}: {}\n", inserted_label, format_counts(&entry.inserted)));
    }
    if let Some(error) = &entry.error {
        out.push_str(&format!("    error: {}\n", error));
    }
    for warning in &entry.warnings {
        out.push_str(&format!("    warning: {}\n", warning));
    }
}

/// Human-readable load report.
pub fn format_report_text(report: &LoadReport) -> String {
    let mut out = String::new();
    if report.dry_run {
        out.push_str("Dry run (nothing was written)\n");
    } else {
        out.push_str("Load complete\n");
    }
    out.push_str(&format!(
        "  {} new, {} replaced, {} skipped, {} failed\n",
        report.new_count(),
        report.replacement_count(),
        report.skipped_count(),
        report.error_count()
    ));

    if !report.global_warnings().is_empty() {
        out.push_str("Schema warnings:\n");
        for warning in report.global_warnings() {
            out.push_str(&format!("  - {}\n", warning));
        }
    }

    out.push_str("Projects:\n");
    for entry in report.roots() {
        format_root_text(entry, report.dry_run, &mut out);
    }
    out
}

pub fn format_report_json(report: &LoadReport) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(report)?;
    value["summary"] = json!({
        "new": report.new_count(),
        "replaced": report.replacement_count(),
        "skipped": report.skipped_count(),
        "errors": report.error_count(),
    });
    Ok(value)
}

pub fn format_cleanup_text(removed: &BTreeMap<String, String>) -> String {
    if removed.is_empty() {
        return "No orphaned staging schemas\n".to_string();
    }
    let mut out = format!("Removed {} orphaned staging schema(s)\n", removed.len());
    for (schema, age) in removed {
        out.push_str(&format!("  {} ({})\n", schema, age));
    }
    out
}

pub fn format_cleanup_json(removed: &BTreeMap<String, String>) -> Value {
    json!({ "removed": removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityType;
    use crate::report::RootStatus;

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("text"), Some(OutputFormat::Text));
        assert_eq!(OutputFormat::from_str("yaml"), None);
    }

    #[test]
    fn test_report_text_lists_counts_and_warnings() {
        let mut report = LoadReport::new(false);
        report.init_root(500, Some("Alpha".to_string()));
        report.add_inserted(500, EntityType::Project, 1);
        report.add_inserted(500, EntityType::Field, 2);
        report.add_warning(500, "GEN:{{7}} unresolved");
        report.set_local_id(500, 3);
        report.set_status(500, RootStatus::Success);

        let text = format_report_text(&report);
        assert!(text.contains("1 new, 0 replaced"));
        assert!(text.contains("[success] Alpha (dump id 500, new) -> local id 3"));
        assert!(text.contains("inserted: 1 project, 2 field"));
        assert!(text.contains("warning: GEN:{{7}} unresolved"));
    }

    #[test]
    fn test_report_json_has_summary() {
        let mut report = LoadReport::new(true);
        report.init_root(1, None);
        report.set_status(1, RootStatus::DryRun);
        let value = format_report_json(&report).unwrap();
        assert_eq!(value["dry_run"], true);
        assert_eq!(value["summary"]["new"], 1);
        assert_eq!(value["roots"][0]["status"], "dry_run");
    }

    #[test]
    fn test_cleanup_text() {
        assert_eq!(format_cleanup_text(&BTreeMap::new()), "No orphaned staging schemas\n");
        let mut removed = BTreeMap::new();
        removed.insert("import_staging_1".to_string(), "empty".to_string());
        assert!(format_cleanup_text(&removed).contains("import_staging_1 (empty)"));
    }
}
