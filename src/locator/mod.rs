mod template;

pub use template::{find_template, load_template, TemplateMatch};

use regex::{Regex, RegexBuilder};
use std::fmt;
use std::path::PathBuf;

/// Structural selector, interpreted by the surface that receives it.
///
/// Browser surfaces accept every variant. The desktop surface maps `Id` to the
/// UI Automation id and `Name` to a partial match on the element name, and
/// rejects `Css` and `XPath`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
    Id(String),
    Name(String),
}

/// Reference image searched for on a screenshot of the surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTemplate {
    pub path: PathBuf,
    /// Minimum normalized correlation (0.0 - 1.0) to accept a match.
    pub threshold: f32,
}

/// Case-insensitive pattern matched against text visible on the surface.
#[derive(Debug, Clone)]
pub struct TextPattern {
    source: String,
    regex: Regex,
}

impl TextPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching `text` literally.
    pub fn literal(text: &str) -> Self {
        let source = regex::escape(text);
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .expect("escaped literal is a valid pattern");
        Self { source, regex }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn find<'t>(&self, haystack: &'t str) -> Option<&'t str> {
        self.regex.find(haystack).map(|m| m.as_str())
    }
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// How a UI element is found, whatever technology backs the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    Selector(Selector),
    Image(ImageTemplate),
    Text(TextPattern),
}

pub const DEFAULT_IMAGE_THRESHOLD: f32 = 0.9;

impl Locator {
    pub fn css(selector: &str) -> Self {
        Locator::Selector(Selector::Css(selector.to_string()))
    }

    pub fn xpath(expr: &str) -> Self {
        Locator::Selector(Selector::XPath(expr.to_string()))
    }

    pub fn id(id: &str) -> Self {
        Locator::Selector(Selector::Id(id.to_string()))
    }

    pub fn name(name: &str) -> Self {
        Locator::Selector(Selector::Name(name.to_string()))
    }

    pub fn image(path: impl Into<PathBuf>) -> Self {
        Locator::Image(ImageTemplate {
            path: path.into(),
            threshold: DEFAULT_IMAGE_THRESHOLD,
        })
    }

    pub fn text(literal: &str) -> Self {
        Locator::Text(TextPattern::literal(literal))
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Locator::Text(TextPattern::new(pattern)?))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Selector(Selector::Css(s)) => write!(f, "css:{}", s),
            Locator::Selector(Selector::XPath(s)) => write!(f, "xpath:{}", s),
            Locator::Selector(Selector::Id(s)) => write!(f, "id:{}", s),
            Locator::Selector(Selector::Name(s)) => write!(f, "name:{}", s),
            Locator::Image(t) => write!(f, "image:{}", t.path.display()),
            Locator::Text(p) => write!(f, "text:/{}/", p.source()),
        }
    }
}

/// Result of a successful probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hit {
    /// Screen or viewport coordinates of the element center, when known.
    pub point: Option<(i32, i32)>,
    /// Text or value carried by the element, when it has any.
    pub text: Option<String>,
}

impl Hit {
    pub fn at(x: i32, y: i32) -> Self {
        Self {
            point: Some((x, y)),
            text: None,
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            point: None,
            text: Some(text.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_display() {
        assert_eq!(Locator::css("#cnpj").to_string(), "css:#cnpj");
        assert_eq!(Locator::id("txtCnpj").to_string(), "id:txtCnpj");
        assert_eq!(
            Locator::image("assets/btn.png").to_string(),
            "image:assets/btn.png"
        );
        assert_eq!(Locator::text("a.b").to_string(), r"text:/a\.b/");
    }

    #[test]
    fn test_text_pattern_is_case_insensitive() {
        let pattern = TextPattern::literal("Situação no Simples Nacional");
        assert_eq!(
            pattern.find("... SITUAÇÃO NO SIMPLES NACIONAL: optante"),
            Some("SITUAÇÃO NO SIMPLES NACIONAL")
        );
        assert!(pattern.find("Situação cadastral").is_none());
    }

    #[test]
    fn test_literal_escapes_metacharacters() {
        let pattern = TextPattern::literal("(1/2)?");
        assert!(pattern.find("page (1/2)?").is_some());
        assert!(pattern.find("page 1").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(Locator::pattern("(unclosed").is_err());
        assert!(Locator::pattern(r"n[ãa]o encontrad[oa]").is_ok());
    }
}
