//! Template variable resolution.
//!
//! Turns a template body with `{{name}}` / `{{1}}` placeholders plus a value
//! map into the ordered parameter list the transport expects.

use std::collections::BTreeMap;

use relaycast_core::types::{CampaignRecipient, TemplateParam, VariableValue};

/// Distinct placeholder identifiers in first-occurrence order.
pub fn extract_ordered(body: &str) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let ident = after[..end].trim();

        if is_identifier(ident) {
            if !ordered.iter().any(|seen| seen == ident) {
                ordered.push(ident.to_string());
            }
            rest = &after[end + 2..];
        } else {
            // Not a placeholder; rescan from the next brace ("{{{1}}}").
            rest = &rest[start + 1..];
        }
    }

    ordered
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn is_positional(ident: &str) -> bool {
    ident.chars().all(|c| c.is_ascii_digit())
}

/// Ordered parameters for `body`. Numeric identifiers are positional (no
/// `parameter_name`); missing values resolve to "".
pub fn map_to_ordered_params(body: &str, values: &BTreeMap<String, String>) -> Vec<TemplateParam> {
    extract_ordered(body)
        .into_iter()
        .map(|ident| {
            let value = values.get(&ident).cloned().unwrap_or_default();
            TemplateParam {
                value,
                parameter_name: (!is_positional(&ident)).then_some(ident),
            }
        })
        .collect()
}

/// `None` when there is nothing worth sending: an empty list, or every value
/// blank. Providers reject an all-blank body parameter block.
pub fn effective_params(params: Vec<TemplateParam>) -> Option<Vec<TemplateParam>> {
    if params.iter().all(|p| p.value.is_empty()) {
        None
    } else {
        Some(params)
    }
}

/// Campaign variables with the name sentinel resolved, overlaid with the
/// recipient's own overrides (recipient wins).
pub fn merge_variables(
    campaign_vars: &BTreeMap<String, VariableValue>,
    recipient: &CampaignRecipient,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = campaign_vars
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                VariableValue::Literal(s) => s.clone(),
                VariableValue::RecipientName => recipient.name.clone().unwrap_or_default(),
            };
            (key.clone(), resolved)
        })
        .collect();

    for (key, value) in &recipient.variables {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Full resolution for one recipient: merge, order, drop all-blank.
pub fn resolve_for_recipient(
    body: &str,
    campaign_vars: &BTreeMap<String, VariableValue>,
    recipient: &CampaignRecipient,
) -> Option<Vec<TemplateParam>> {
    let merged = merge_variables(campaign_vars, recipient);
    effective_params(map_to_ordered_params(body, &merged))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_extract_first_occurrence_order() {
        let body = "Hi {{name}}, order {{2}} ships {{1}}. Thanks {{name}}!";
        assert_eq!(extract_ordered(body), vec!["name", "2", "1"]);
    }

    #[test]
    fn test_extract_ignores_malformed() {
        assert!(extract_ordered("no vars here").is_empty());
        assert!(extract_ordered("{{}} and {{ }} and {{a b}}").is_empty());
        assert!(extract_ordered("dangling {{1").is_empty());
        assert_eq!(extract_ordered("{{{1}}}"), vec!["1"]);
        assert_eq!(extract_ordered("{{ code }}"), vec!["code"]);
    }

    #[test]
    fn test_named_vs_positional_tagging() {
        let params = map_to_ordered_params("{{1}} {{first_name}} {{10}}", &values(&[("1", "a")]));
        assert_eq!(params[0], TemplateParam::positional("a"));
        assert_eq!(params[1], TemplateParam::named("first_name", ""));
        assert_eq!(params[2], TemplateParam::positional(""));
    }

    #[test]
    fn test_all_blank_means_no_variables() {
        let params = map_to_ordered_params("Hello {{1}} {{2}}", &BTreeMap::new());
        assert_eq!(params.len(), 2);
        assert!(effective_params(params).is_none());
        assert!(effective_params(Vec::new()).is_none());
        assert!(effective_params(vec![TemplateParam::positional(""), TemplateParam::positional("x")]).is_some());
    }

    #[test]
    fn test_merge_recipient_overrides_win() {
        let mut campaign_vars = BTreeMap::new();
        campaign_vars.insert("name".to_string(), VariableValue::RecipientName);
        campaign_vars.insert("1".to_string(), VariableValue::from("0000"));
        campaign_vars.insert("promo".to_string(), VariableValue::from("SPRING"));

        let recipient = CampaignRecipient::new("c1", "628100", Some("Ana")).with_variable("1", "7788");
        let merged = merge_variables(&campaign_vars, &recipient);
        assert_eq!(merged["name"], "Ana");
        assert_eq!(merged["1"], "7788");
        assert_eq!(merged["promo"], "SPRING");

        let nameless = CampaignRecipient::new("c1", "628101", None);
        assert_eq!(merge_variables(&campaign_vars, &nameless)["name"], "");
    }

    #[test]
    fn test_resolve_ana_scenario() {
        let mut campaign_vars = BTreeMap::new();
        campaign_vars.insert("name".to_string(), VariableValue::RecipientName);
        let ana = CampaignRecipient::new("c1", "628100", Some("Ana")).with_variable("1", "7788");

        let params = resolve_for_recipient("Hello {{name}}, your code is {{1}}", &campaign_vars, &ana).unwrap();
        assert_eq!(params, vec![TemplateParam::named("name", "Ana"), TemplateParam::positional("7788")]);
    }
}
