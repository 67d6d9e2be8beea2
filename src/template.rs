//! Message template rendering.
//!
//! Substitutes `{placeholder}` tokens with lead fields. Fallback syntax
//! `{placeholder|fallback}` uses the fallback when the field is empty.
//! Unresolved placeholders render as empty string — rendering never fails.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::model::Lead;

static FALLBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\|([^}]+)\}").expect("fallback placeholder regex"));
static PLAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("plain placeholder regex"));

/// Render a template against a lead's fields.
pub fn render(template: &str, lead: &Lead) -> String {
    let values = lead_values(lead);

    let pass1 = FALLBACK_RE.replace_all(template, |caps: &regex::Captures| {
        let value = values.get(&caps[1]).map(String::as_str).unwrap_or("");
        if value.is_empty() {
            caps[2].to_string()
        } else {
            value.to_string()
        }
    });

    PLAIN_RE
        .replace_all(&pass1, |caps: &regex::Captures| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Placeholder values for a lead. Both camelCase and snake_case spellings
/// are accepted, matching what campaign authors actually type.
fn lead_values(lead: &Lead) -> HashMap<String, String> {
    let first = lead.first_name.clone().unwrap_or_default();
    let last = lead.last_name.clone().unwrap_or_default();
    let company = lead.company.clone().unwrap_or_default();
    let full = lead.full_name();

    let mut values = HashMap::new();
    for key in ["firstName", "first_name"] {
        values.insert(key.to_string(), first.clone());
    }
    for key in ["lastName", "last_name"] {
        values.insert(key.to_string(), last.clone());
    }
    for key in ["fullName", "full_name"] {
        values.insert(key.to_string(), full.clone());
    }
    values.insert("email".to_string(), lead.email.clone());
    values.insert("company".to_string(), company);
    values
}
