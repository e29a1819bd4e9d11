use std::sync::LazyLock;

use regex::Regex;

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*)\]").expect("valid bracket regex"));
static ENUMERATION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.、]\s*").expect("valid prefix regex"));

/// Turns one LLM reply into an ordered list of disease names.
///
/// Pure and deterministic; the marker strings are configurable so other
/// prompt languages can reuse it.
#[derive(Debug, Clone)]
pub struct DiseaseParser {
    /// Whole-reply sentinel meaning "no diseases".
    pub none_sentinel: String,
    /// Any reply containing this is treated as "no diseases".
    pub not_found_marker: String,
    /// Segments containing any of these are dropped in free-text replies.
    pub excluded_markers: Vec<String>,
    /// Separators for free-text replies.
    pub delimiters: Vec<char>,
    /// Separators inside a bracketed list.
    pub list_separators: Vec<char>,
}

impl Default for DiseaseParser {
    fn default() -> Self {
        Self {
            none_sentinel: "未识别到病种".to_string(),
            not_found_marker: "未识别到".to_string(),
            excluded_markers: vec!["未识别".to_string(), "无".to_string()],
            delimiters: vec![',', '，', '、', ';', '；'],
            list_separators: vec![',', '，'],
        }
    }
}

impl DiseaseParser {
    pub fn parse(&self, response: &str) -> Vec<String> {
        let cleaned = response.trim();

        if cleaned == self.none_sentinel || cleaned.contains(&self.not_found_marker) {
            return Vec::new();
        }

        if let Some(captures) = BRACKETED.captures(cleaned) {
            let interior = captures.get(1).map_or("", |m| m.as_str());
            return interior
                .split(self.list_separators.as_slice())
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(String::from)
                .collect();
        }

        let without_prefix = ENUMERATION_PREFIX.replace(cleaned, "");
        without_prefix
            .split(self.delimiters.as_slice())
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .filter(|segment| !self.excluded_markers.iter().any(|m| segment.contains(m.as_str())))
            .map(String::from)
            .collect()
    }
}
