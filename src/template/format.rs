//! Value formats for `${name:format}` tokens
//!
//! A format decides how a (possibly multi-valued) variable is joined and
//! quoted when it is written into a query.

use serde::Serialize;

/// Named formats accepted after the `:` in `${name:format}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// `a,b`
    Csv,
    /// `a|b`
    Pipe,
    /// Regex-escaped values, multiple wrapped as `(a|b)`
    Regex,
    /// `'a','b'`
    SingleQuote,
    /// `"a","b"`
    DoubleQuote,
    /// `'a','b'` with embedded quotes doubled
    SqlString,
    /// Values concatenated with commas, no quoting or escaping
    Raw,
    /// JSON array of strings
    Json,
    /// `{a,b}`
    Glob,
}

impl Format {
    /// Parse a format name; returns `None` for unknown names
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "pipe" => Some(Self::Pipe),
            "regex" => Some(Self::Regex),
            "singlequote" => Some(Self::SingleQuote),
            "doublequote" => Some(Self::DoubleQuote),
            "sqlstring" => Some(Self::SqlString),
            "raw" => Some(Self::Raw),
            "json" => Some(Self::Json),
            "glob" => Some(Self::Glob),
            _ => None,
        }
    }

    /// Render values in this format
    pub fn apply(&self, values: &[String]) -> String {
        match self {
            Self::Csv | Self::Raw => values.join(","),
            Self::Pipe => values.join("|"),
            Self::Regex => {
                let escaped: Vec<String> = values.iter().map(|v| regex::escape(v)).collect();
                if escaped.len() == 1 {
                    escaped[0].clone()
                } else {
                    format!("({})", escaped.join("|"))
                }
            }
            Self::SingleQuote | Self::SqlString => quote_each(values, '\''),
            Self::DoubleQuote => quote_each(values, '"'),
            Self::Json => serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string()),
            Self::Glob => {
                if values.len() == 1 {
                    values[0].clone()
                } else {
                    format!("{{{}}}", values.join(","))
                }
            }
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Csv => "csv",
            Self::Pipe => "pipe",
            Self::Regex => "regex",
            Self::SingleQuote => "singlequote",
            Self::DoubleQuote => "doublequote",
            Self::SqlString => "sqlstring",
            Self::Raw => "raw",
            Self::Json => "json",
            Self::Glob => "glob",
        };
        write!(f, "{}", name)
    }
}

/// Quote each value, doubling embedded quote characters, and comma-join
fn quote_each(values: &[String], quote: char) -> String {
    let doubled = format!("{}{}", quote, quote);
    values
        .iter()
        .map(|v| format!("{}{}{}", quote, v.replace(quote, &doubled), quote))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(Format::parse("sqlstring"), Some(Format::SqlString));
        assert_eq!(Format::parse("SingleQuote"), Some(Format::SingleQuote));
        assert_eq!(Format::parse("lucene"), None);
    }

    #[test]
    fn test_sqlstring_doubles_quotes() {
        let out = Format::SqlString.apply(&vals(&["a", "o'brien"]));
        assert_eq!(out, "'a','o''brien'");
    }

    #[test]
    fn test_doublequote() {
        let out = Format::DoubleQuote.apply(&vals(&["x", "say \"hi\""]));
        assert_eq!(out, "\"x\",\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_joiners() {
        let v = vals(&["a", "b", "c"]);
        assert_eq!(Format::Csv.apply(&v), "a,b,c");
        assert_eq!(Format::Pipe.apply(&v), "a|b|c");
        assert_eq!(Format::Raw.apply(&vals(&["it's"])), "it's");
        assert_eq!(Format::Glob.apply(&v), "{a,b,c}");
        assert_eq!(Format::Json.apply(&v), r#"["a","b","c"]"#);
    }

    #[test]
    fn test_regex_escapes() {
        assert_eq!(Format::Regex.apply(&vals(&["a.b"])), r"a\.b");
        assert_eq!(Format::Regex.apply(&vals(&["a.b", "c+"])), r"(a\.b|c\+)");
    }
}
