//! Text normalization used to build dedup keys.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_/&+]").expect("static pattern"));
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("static pattern"));

/// Trailing words that do not distinguish one roaster from another.
const BUSINESS_SUFFIXES: &[&str] = &[
    "coffee",
    "coffees",
    "roasters",
    "roaster",
    "roasting",
    "roastery",
    "roastworks",
    "co",
    "company",
    "inc",
    "llc",
    "ltd",
];

/// Lowercase, trim, and collapse runs of whitespace to one space.
#[must_use]
pub fn normalize_text(input: &str) -> String {
    WHITESPACE
        .replace_all(input.trim(), " ")
        .to_lowercase()
}

/// Drop punctuation; word separators such as `-` or `/` become spaces.
#[must_use]
pub fn strip_punctuation(input: &str) -> String {
    let spaced = SEPARATORS.replace_all(input, " ");
    let stripped = PUNCTUATION.replace_all(&spaced, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Normalized name with trailing business suffixes removed. At least one word
/// always survives, so "Coffee Co" stays "coffee".
#[must_use]
pub fn fuzzy_name(input: &str) -> String {
    let cleaned = strip_punctuation(&normalize_text(input));
    let mut words: Vec<&str> = cleaned.split(' ').filter(|w| !w.is_empty()).collect();
    while words.len() > 1 {
        match words.last() {
            Some(last) if BUSINESS_SUFFIXES.contains(last) => {
                words.pop();
            }
            _ => break,
        }
    }
    words.join(" ")
}

/// Registrable host of a website field, without `www.`. Accepts bare hosts.
#[must_use]
pub fn extract_domain(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{trimmed}"))
    }
    .ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.contains('.').then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_space() {
        assert_eq!(normalize_text("  Counter\tCulture   COFFEE "), "counter culture coffee");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn punctuation_is_removed() {
        assert_eq!(strip_punctuation("durham, nc"), "durham nc");
        assert_eq!(strip_punctuation("st. louis / mo"), "st louis mo");
        assert_eq!(strip_punctuation("Café-Bar!"), "Café Bar");
    }

    #[test]
    fn fuzzy_name_strips_business_suffixes() {
        assert_eq!(fuzzy_name("Counter Culture Coffee"), "counter culture");
        assert_eq!(fuzzy_name("Counter Culture"), "counter culture");
        assert_eq!(fuzzy_name("Alpha Roasters"), "alpha");
        assert_eq!(fuzzy_name("Heart Coffee Roasters, Inc."), "heart");
        assert_eq!(fuzzy_name("Coffee Co"), "coffee");
        assert_eq!(fuzzy_name("Alpha Beta"), "alpha beta");
    }

    #[test]
    fn domains_are_extracted_from_loose_input() {
        assert_eq!(
            extract_domain("https://www.CounterCulturecoffee.com/shop").as_deref(),
            Some("counterculturecoffee.com")
        );
        assert_eq!(extract_domain("onyxcoffeelab.com").as_deref(), Some("onyxcoffeelab.com"));
        assert_eq!(extract_domain("not a url"), None);
        assert_eq!(extract_domain("  "), None);
    }
}
