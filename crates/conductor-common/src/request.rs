//! Classified requests, the planner's input.
//!
//! Classification itself happens outside the engine; these types only carry
//! its result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Complexity tier assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplexityTier::Simple => write!(f, "simple"),
            ComplexityTier::Medium => write!(f, "medium"),
            ComplexityTier::Complex => write!(f, "complex"),
        }
    }
}

impl FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(ComplexityTier::Simple),
            "medium" => Ok(ComplexityTier::Medium),
            "complex" => Ok(ComplexityTier::Complex),
            _ => Err(format!(
                "Invalid complexity '{}'. Valid values: simple, medium, complex",
                s
            )),
        }
    }
}

/// Kind of change requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    #[default]
    Feature,
    Bugfix,
    Refactor,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Feature => write!(f, "feature"),
            RequestType::Bugfix => write!(f, "bugfix"),
            RequestType::Refactor => write!(f, "refactor"),
        }
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(RequestType::Feature),
            "bugfix" => Ok(RequestType::Bugfix),
            "refactor" => Ok(RequestType::Refactor),
            _ => Err(format!(
                "Invalid request type '{}'. Valid values: feature, bugfix, refactor",
                s
            )),
        }
    }
}

/// A request after external classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedRequest {
    /// Original free-form request text
    pub text: String,
    #[serde(default)]
    pub request_type: RequestType,
    pub complexity: ComplexityTier,
    /// Domain tags, normalized to lowercase
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
    /// Classifier confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl ClassifiedRequest {
    pub fn new(text: &str, complexity: ComplexityTier, tags: &[&str]) -> Self {
        Self {
            text: text.to_string(),
            request_type: RequestType::Feature,
            complexity,
            domain_tags: tags.iter().map(|t| t.to_lowercase()).collect(),
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.domain_tags.contains(&tag.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_normalized() {
        let req = ClassifiedRequest::new("add login", ComplexityTier::Simple, &["Backend"]);
        assert!(req.has_tag("backend"));
        assert!(req.has_tag("BACKEND"));
        assert!(!req.has_tag("frontend"));
    }

    #[test]
    fn test_confidence_defaults_to_one() {
        let req: ClassifiedRequest =
            serde_json::from_str(r#"{"text": "x", "complexity": "medium"}"#).unwrap();
        assert_eq!(req.confidence, 1.0);
        assert_eq!(req.request_type, RequestType::Feature);
        assert!(req.domain_tags.is_empty());
    }

    #[test]
    fn test_complexity_from_str() {
        assert_eq!("Complex".parse::<ComplexityTier>().unwrap(), ComplexityTier::Complex);
        assert!("huge".parse::<ComplexityTier>().is_err());
    }
}
