use crate::error::{ParseError, Result};
use regex::Regex;
use std::sync::LazyLock;

pub const DEFAULT_DESCRIPTION: &str = "lnfeed payment";

const PAYMENT_KEYWORDS: [&str; 2] = ["PAY", "GETINVOICE"];
const AMOUNT_UNITS: [&str; 2] = ["sats", "sat"];

static BOLT11_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ln(?:bcrt|bc|tbs|tb|sb)[0-9]*[munp]?1[02-9ac-hj-np-z]{6,})\b")
        .expect("static bolt11 regex")
});

/// Amount and description requested by a PAY or GETINVOICE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    pub amount_sat: u64,
    pub description: String,
}

/// Reads `<keyword> [@mentions] <amount> <description...>`.
///
/// The amount is the first bare integer after the keyword (or anywhere, when no
/// keyword is present). Mentions are dropped from the description.
pub fn extract_payment(text: &str) -> Result<PaymentTerms> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let start = tokens
        .iter()
        .position(|t| {
            let word = t.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            PAYMENT_KEYWORDS
                .iter()
                .any(|k| word.eq_ignore_ascii_case(k))
        })
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut amount = None;
    let mut description = Vec::new();
    for token in &tokens[start..] {
        if token.starts_with('@') {
            continue;
        }
        if amount.is_none() {
            if let Some(parsed) = parse_amount_token(token) {
                amount = Some(parsed?);
            }
            continue;
        }
        if description.is_empty() && AMOUNT_UNITS.iter().any(|u| token.eq_ignore_ascii_case(u)) {
            continue;
        }
        description.push(*token);
    }

    let amount_sat = amount.ok_or(ParseError::MissingAmount)?;
    let description = if description.is_empty() {
        DEFAULT_DESCRIPTION.to_string()
    } else {
        description.join(" ")
    };
    Ok(PaymentTerms {
        amount_sat,
        description,
    })
}

/// First BOLT11 payment request in `text`, lowercased.
pub fn extract_payment_request(text: &str) -> Result<String> {
    BOLT11_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or(ParseError::MissingPaymentRequest)
}

/// `None` when the token is not numeric at all; `Some(Err)` when it is numeric but
/// unusable as an amount.
fn parse_amount_token(token: &str) -> Option<Result<u64>> {
    let lowered = token
        .trim_end_matches(|c: char| matches!(c, ',' | '.' | ';' | ':'))
        .to_ascii_lowercase();
    let digits = AMOUNT_UNITS
        .iter()
        .find_map(|u| lowered.strip_suffix(u))
        .unwrap_or(&lowered);
    let digits: String = digits.chars().filter(|c| !matches!(c, ',' | '_')).collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(match digits.parse::<u64>() {
        Ok(0) => Err(ParseError::InvalidAmount(token.to_string())),
        Ok(v) => Ok(v),
        Err(_) => Err(ParseError::InvalidAmount(token.to_string())),
    })
}
