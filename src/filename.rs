use crate::model::ReportData;
use regex::Regex;
use std::sync::LazyLock;
use time::format_description::well_known::Rfc3339;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[^a-z0-9]").expect("valid regex")
});
static DATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})").expect("valid regex")
});

/// `report_<name>_<YYYY-MM-DD>.<ext>` for the given report.
pub fn derive_filename(report: &ReportData, extension: &str) -> String {
    format!(
        "report_{}_{}.{}",
        sanitize_name(&report.intersection.name),
        iso_date(&report.datetime),
        extension.trim_start_matches('.')
    )
}

pub fn sanitize_name(name: &str) -> String {
    let ascii: String = name
        .nfkd()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();
    let replaced = NON_ALNUM.replace_all(&ascii, "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        "report".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn iso_date(datetime: &str) -> String {
    let datetime = datetime.trim();
    if let Ok(dt) = time::OffsetDateTime::parse(datetime, &Rfc3339) {
        let date = dt.date();
        return format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        );
    }
    DATE_PREFIX
        .captures(datetime)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "undated".to_string())
}
