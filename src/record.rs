//! Practitioner records and detail page parsing
//!
//! A detail page carries a heading block (name, profession, registration
//! number, division badges) and a grid of labelled rows. The parser builds
//! a label-to-value map from the grid once, then resolves each output field
//! through its known label variants, falling back to page-level scans where
//! the original markup has proven unstable.

use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Errors from detail page parsing
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document contains no registration identifier")]
    MissingIdentifier,

    #[error("document is empty or not a detail page")]
    EmptyDocument,

    #[error("document structure not recognized: {0}")]
    Unrecognized(String),
}

/// One extracted register entry.
///
/// Field order here is the output column order. Every field except the
/// identifier is optional; a record is only emitted at all when the
/// identifier plus at least one substantive field parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PractitionerRecord {
    pub name: Option<String>,
    pub name_title: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub reg_id: String,
    pub profession: Option<String>,
    pub registration_status: Option<String>,
    pub first_reg_date: Option<String>,
    pub reg_expiry: Option<String>,
    pub endorsement: Option<String>,
    pub sex: Option<String>,
    pub suburb: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub divisions: Option<String>,
}

impl PractitionerRecord {
    fn empty(reg_id: String) -> Self {
        Self {
            name: None,
            name_title: None,
            first_name: None,
            middle_name: None,
            last_name: None,
            reg_id,
            profession: None,
            registration_status: None,
            first_reg_date: None,
            reg_expiry: None,
            endorsement: None,
            sex: None,
            suburb: None,
            state: None,
            postcode: None,
            divisions: None,
        }
    }

    /// True when anything beyond the identifier was recovered
    fn has_substance(&self) -> bool {
        self.name.is_some()
            || self.profession.is_some()
            || self.registration_status.is_some()
            || self.first_reg_date.is_some()
            || self.reg_expiry.is_some()
            || self.suburb.is_some()
            || self.state.is_some()
            || self.postcode.is_some()
            || self.divisions.is_some()
    }
}

const NAME_TITLES: &[&str] = &[
    "Associate Professor",
    "Professor",
    "Prof",
    "Miss",
    "Mrs",
    "Ms",
    "Mr",
    "Dr",
];

const STATUS_KEYWORDS: &[&str] = &["Registered", "Suspended", "Cancelled", "Non-practising"];

/// Parser for register detail pages, selectors compiled once.
pub struct RecordParser {
    name_sel: Selector,
    reg_number_sel: Selector,
    profession_sel: Selector,
    division_sel: Selector,
    row_sel: Selector,
    title_sel: Selector,
    entry_sel: Selector,
    reg_id_re: Regex,
    date_re: Regex,
}

impl RecordParser {
    pub fn new() -> Result<Self, ParseError> {
        let sel = |s: &str| {
            Selector::parse(s).map_err(|e| ParseError::Unrecognized(e.to_string()))
        };
        Ok(Self {
            name_sel: sel("h2.practitioner-name")?,
            reg_number_sel: sel("span.reg-number")?,
            profession_sel: sel("h3.practitioner-profession")?,
            division_sel: sel(".reg-types span[class^=\"reg-type\"]")?,
            row_sel: sel(".section-row")?,
            title_sel: sel(".field-title")?,
            entry_sel: sel(".field-entry")?,
            reg_id_re: Regex::new(r"[A-Z]{3}\d{10,}")
                .map_err(|e| ParseError::Unrecognized(e.to_string()))?,
            date_re: Regex::new(r"\d{1,2}/\d{1,2}/\d{4}")
                .map_err(|e| ParseError::Unrecognized(e.to_string()))?,
        })
    }

    /// Parse one detail page into a record.
    ///
    /// Complete-or-absent: returns an error rather than a hollow record
    /// when the identifier or every substantive field is missing.
    pub fn parse(&self, html: &str) -> Result<PractitionerRecord, ParseError> {
        if html.trim().is_empty() {
            return Err(ParseError::EmptyDocument);
        }

        let document = Html::parse_document(html);
        let fields = self.build_field_map(&document);

        let reg_id = self
            .extract_reg_id(&document, &fields)
            .ok_or(ParseError::MissingIdentifier)?;

        let mut record = PractitionerRecord::empty(reg_id);

        if let Some(full_name) = first_text(&document, &self.name_sel) {
            split_name(&full_name, &mut record);
            record.name = Some(full_name);
        }

        record.profession = first_text(&document, &self.profession_sel)
            .or_else(|| lookup(&fields, &["profession"]));

        let divisions: Vec<String> = document
            .select(&self.division_sel)
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        record.divisions = if divisions.is_empty() {
            lookup(&fields, &["division"])
        } else {
            Some(divisions.join("; "))
        };

        record.registration_status = lookup(&fields, &["registration status"])
            .or_else(|| self.status_from_page_text(&document));

        record.first_reg_date = lookup(&fields, &["date of first registration", "first registered"])
            .map(|d| normalize_date(&d));
        record.reg_expiry = lookup(&fields, &["registration expiry date", "expiry date"])
            .map(|d| self.clean_expiry(&d));

        record.endorsement =
            lookup(&fields, &["endorsement"]).filter(|v| !v.eq_ignore_ascii_case("none"));

        record.sex = lookup(&fields, &["sex", "gender"]).map(|v| capitalize(&v));

        record.suburb = lookup(&fields, &["suburb"]);
        record.state = lookup(&fields, &["state"]);
        record.postcode = lookup(&fields, &["postcode"]);

        if !record.has_substance() {
            return Err(ParseError::Unrecognized(
                "identifier present but no substantive fields parsed".to_string(),
            ));
        }

        debug!("Parsed record for {}", record.reg_id);
        Ok(record)
    }

    /// Collect all labelled rows into a lowercase label -> value map.
    fn build_field_map(&self, document: &Html) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for row in document.select(&self.row_sel) {
            let title = row.select(&self.title_sel).next().map(element_text);
            let entry = row.select(&self.entry_sel).next().map(element_text);
            if let (Some(title), Some(entry)) = (title, entry) {
                if !title.is_empty() && !entry.is_empty() {
                    map.insert(title.to_lowercase(), entry);
                }
            }
        }
        map
    }

    fn extract_reg_id(
        &self,
        document: &Html,
        fields: &HashMap<String, String>,
    ) -> Option<String> {
        if let Some(text) = first_text(document, &self.reg_number_sel) {
            if let Some(m) = self.reg_id_re.find(&text) {
                return Some(m.as_str().to_string());
            }
        }
        if let Some(value) = lookup(fields, &["registration number"]) {
            if let Some(m) = self.reg_id_re.find(&value) {
                return Some(m.as_str().to_string());
            }
        }
        // Last resort, scan the whole page text
        let page_text: String = document.root_element().text().collect();
        self.reg_id_re
            .find(&page_text)
            .map(|m| m.as_str().to_string())
    }

    fn status_from_page_text(&self, document: &Html) -> Option<String> {
        let page_text: String = document.root_element().text().collect();
        let lower = page_text.to_lowercase();
        STATUS_KEYWORDS
            .iter()
            .find(|s| lower.contains(&s.to_lowercase()))
            .map(|s| s.to_string())
    }

    /// Expiry entries sometimes carry trailing explanatory sentences;
    /// prefer an embedded D/M/Y date over normalizing the whole string.
    fn clean_expiry(&self, raw: &str) -> String {
        let head = raw.split('.').next().unwrap_or(raw);
        if let Some(m) = self.date_re.find(head) {
            normalize_date(m.as_str())
        } else {
            normalize_date(head)
        }
    }
}

fn element_text(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

/// Resolve a value by substring match against the label map.
fn lookup(fields: &HashMap<String, String>, label_variants: &[&str]) -> Option<String> {
    for variant in label_variants {
        for (label, value) in fields {
            if label.contains(variant) {
                return Some(value.clone());
            }
        }
    }
    None
}

/// Split a display name into title, first, middle and last parts.
fn split_name(full_name: &str, record: &mut PractitionerRecord) {
    let mut name = full_name.trim();

    for title in NAME_TITLES {
        let with_space = format!("{} ", title);
        let with_dot = format!("{}.", title);
        if name.starts_with(&with_space) || name.starts_with(&with_dot) {
            record.name_title = Some(title.to_string());
            name = name[title.len()..].trim_start_matches(['.', ' ']);
            break;
        }
    }

    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.len() {
        0 => {}
        1 => record.first_name = Some(parts[0].to_string()),
        2 => {
            record.first_name = Some(parts[0].to_string());
            record.last_name = Some(parts[1].to_string());
        }
        _ => {
            record.first_name = Some(parts[0].to_string());
            record.last_name = Some(parts[parts.len() - 1].to_string());
            record.middle_name = Some(parts[1..parts.len() - 1].join(" "));
        }
    }
}

/// Normalize the registry's assorted date renderings to DD/MM/YYYY.
/// Unparseable strings pass through unchanged rather than being dropped.
pub fn normalize_date(raw: &str) -> String {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    const FORMATS: &[&str] = &[
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%d %B %Y",
        "%d %b %Y",
        "%Y-%m-%d",
        "%m/%d/%Y",
    ];
    for fmt in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return date.format("%d/%m/%Y").to_string();
        }
    }
    cleaned
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail_page() -> String {
        r#"<html><body>
            <h2 class="practitioner-name">Dr Jane Marie Blackwood</h2>
            <h3 class="practitioner-profession">Nurse</h3>
            <span class="reg-number">Registration number: NMW0001943612</span>
            <div class="reg-types">
                <span class="reg-type-1">Registered Nurse (Division 1)</span>
                <span class="reg-type-2">Midwife</span>
            </div>
            <div class="section-row">
                <div class="field-title">Registration status</div>
                <div class="field-entry">Registered</div>
            </div>
            <div class="section-row">
                <div class="field-title">Date of first registration</div>
                <div class="field-entry">14 March 2005</div>
            </div>
            <div class="section-row">
                <div class="field-title">Registration expiry date</div>
                <div class="field-entry">31/05/2026. Renewal applications are due a month prior.</div>
            </div>
            <div class="section-row">
                <div class="field-title">Endorsements</div>
                <div class="field-entry">None</div>
            </div>
            <div class="section-row">
                <div class="field-title">Sex</div>
                <div class="field-entry">FEMALE</div>
            </div>
            <div class="section-row">
                <div class="field-title">Suburb</div>
                <div class="field-entry">Parkville</div>
            </div>
            <div class="section-row">
                <div class="field-title">State</div>
                <div class="field-entry">VIC</div>
            </div>
            <div class="section-row">
                <div class="field-title">Postcode</div>
                <div class="field-entry">3052</div>
            </div>
        </body></html>"#
            .to_string()
    }

    #[test]
    fn test_full_record() {
        let parser = RecordParser::new().unwrap();
        let record = parser.parse(&detail_page()).unwrap();

        assert_eq!(record.reg_id, "NMW0001943612");
        assert_eq!(record.name.as_deref(), Some("Dr Jane Marie Blackwood"));
        assert_eq!(record.name_title.as_deref(), Some("Dr"));
        assert_eq!(record.first_name.as_deref(), Some("Jane"));
        assert_eq!(record.middle_name.as_deref(), Some("Marie"));
        assert_eq!(record.last_name.as_deref(), Some("Blackwood"));
        assert_eq!(record.profession.as_deref(), Some("Nurse"));
        assert_eq!(record.registration_status.as_deref(), Some("Registered"));
        assert_eq!(record.first_reg_date.as_deref(), Some("14/03/2005"));
        assert_eq!(record.reg_expiry.as_deref(), Some("31/05/2026"));
        // "None" endorsement collapses to absent
        assert_eq!(record.endorsement, None);
        assert_eq!(record.sex.as_deref(), Some("Female"));
        assert_eq!(record.suburb.as_deref(), Some("Parkville"));
        assert_eq!(record.state.as_deref(), Some("VIC"));
        assert_eq!(record.postcode.as_deref(), Some("3052"));
        assert_eq!(
            record.divisions.as_deref(),
            Some("Registered Nurse (Division 1); Midwife")
        );
    }

    #[test]
    fn test_missing_identifier_is_error() {
        let parser = RecordParser::new().unwrap();
        let html = "<html><body><h2 class=\"practitioner-name\">Dr A B</h2></body></html>";
        assert!(matches!(
            parser.parse(html),
            Err(ParseError::MissingIdentifier)
        ));
    }

    #[test]
    fn test_identifier_alone_is_not_a_record() {
        let parser = RecordParser::new().unwrap();
        let html = "<html><body><span class=\"reg-number\">MED0001234567</span></body></html>";
        // The page-text status fallback must not fire here either
        assert!(parser.parse(html).is_err());
    }

    #[test]
    fn test_empty_document() {
        let parser = RecordParser::new().unwrap();
        assert!(matches!(parser.parse("  "), Err(ParseError::EmptyDocument)));
    }

    #[test]
    fn test_two_part_name() {
        let mut record = PractitionerRecord::empty("MED0001234567".to_string());
        split_name("Wei Chen", &mut record);
        assert_eq!(record.name_title, None);
        assert_eq!(record.first_name.as_deref(), Some("Wei"));
        assert_eq!(record.middle_name, None);
        assert_eq!(record.last_name.as_deref(), Some("Chen"));
    }

    #[test]
    fn test_title_with_dot() {
        let mut record = PractitionerRecord::empty("MED0001234567".to_string());
        split_name("Mr. John Smith", &mut record);
        assert_eq!(record.name_title.as_deref(), Some("Mr"));
        assert_eq!(record.first_name.as_deref(), Some("John"));
    }

    #[test]
    fn test_date_normalization() {
        assert_eq!(normalize_date("14 March 2005"), "14/03/2005");
        assert_eq!(normalize_date("2005-03-14"), "14/03/2005");
        assert_eq!(normalize_date("14-03-2005"), "14/03/2005");
        assert_eq!(normalize_date("14/3/2005"), "14/03/2005");
        // Unknown renderings pass through
        assert_eq!(normalize_date("circa 2005"), "circa 2005");
    }
}
