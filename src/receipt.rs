//! Light-weight receipt parsing shared by both engine result paths.
//!
//! Input is recognised text in reading order (one line per entry); output is
//! a [`ParsedReceipt`] with the store name, line items and the summary
//! amounts. OCR noise typical of receipts is cleaned first.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub total_price: Option<f64>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    #[serde(default)]
    pub store_name: Option<String>,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default)]
    pub tax: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
}

const OCR_CORRECTIONS: &[(&str, &str)] = &[
    ("Subtotai", "Subtotal"),
    ("Totai", "Total"),
    ("ltems", "Items"),
    ("ltem", "Item"),
    ("QTy", "Qty"),
    ("QTY", "Qty"),
    ("Prlce", "Price"),
    ("Arnount", "Amount"),
    ("TAx", "Tax"),
    ("TaX", "Tax"),
];

/// Words that mark a priced line as a summary or payment line, not an item.
const NON_ITEM_KEYWORDS: &[&str] = &[
    "subtotal", "tax", "total", "change", "cash", "card", "credit", "debit",
];

static PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$?\d+\.\d{2}").unwrap());
static AMPERSAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w)&(\w)").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());
static SPACING_FIXES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)(\d)(items?)\b").unwrap(), "${1} ${2}"),
        (Regex::new(r"(?i)(\d)(units?)\b").unwrap(), "${1} ${2}"),
        (Regex::new(r"\)([A-Z][a-z]{2,})").unwrap(), ") ${1}"),
        // Capitalised summary word glued to a lowercase letter ("itemTotal")
        (
            Regex::new(r"([a-z])(Subtotal|SUBTOTAL|Total|TOTAL|Tax|TAX)\b").unwrap(),
            "${1} ${2}",
        ),
    ]
});

/// Fix common OCR misreads and spacing problems in one line of receipt text.
pub fn clean_ocr_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut cleaned = text.to_string();
    for (wrong, right) in OCR_CORRECTIONS {
        if cleaned.contains(wrong) {
            cleaned = cleaned.replace(wrong, right);
        }
    }

    for (pattern, replacement) in SPACING_FIXES.iter() {
        cleaned = pattern.replace_all(&cleaned, *replacement).into_owned();
    }

    cleaned = AMPERSAND.replace_all(&cleaned, "${1} & ${2}").into_owned();
    cleaned = MULTI_SPACE.replace_all(&cleaned, " ").into_owned();
    cleaned.trim().to_string()
}

/// First price-looking token (`$12.34`, `12.34`) in `text`.
pub fn extract_price(text: &str) -> Option<f64> {
    PRICE
        .find(text)
        .and_then(|m| m.as_str().trim_start_matches('$').parse().ok())
}

pub fn parse_receipt<S: AsRef<str>>(lines: &[S]) -> ParsedReceipt {
    let mut parsed = ParsedReceipt::default();

    parsed.store_name = lines
        .iter()
        .take(3)
        .map(|l| l.as_ref().trim())
        .find(|l| !l.is_empty() && !PRICE.is_match(l))
        .map(clean_ocr_text);

    for line in lines {
        let text = clean_ocr_text(line.as_ref());
        if text.is_empty() {
            continue;
        }
        let lower = text.to_lowercase();
        let Some(price) = extract_price(&text) else {
            continue;
        };

        if lower.contains("subtotal") {
            parsed.subtotal = Some(price);
        } else if lower.contains("tax") {
            parsed.tax = Some(price);
        } else if lower.contains("total") {
            parsed.total = Some(price);
        } else if !NON_ITEM_KEYWORDS.iter().any(|k| lower.contains(k)) {
            let name = PRICE.replace_all(&text, "").trim().to_string();
            if !name.is_empty() {
                parsed.items.push(ReceiptItem {
                    name,
                    quantity: 1,
                    unit_price: Some(price),
                    total_price: Some(price),
                });
            }
        }
    }

    parsed
}

/// Split recognised text into lines and parse them.
pub fn parse_text(text: &str) -> ParsedReceipt {
    let lines: Vec<&str> = text.lines().collect();
    parse_receipt(&lines)
}
