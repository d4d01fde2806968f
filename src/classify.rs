//! Output classification for child dev servers
//!
//! A child only tells us how it is doing through its text streams. Each line
//! is run through an ordered list of [`StatusRule`]s; the first rule that
//! matches decides the status transition for that line.

use crate::registry::InstanceStatus;
use serde::Deserialize;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// A single `(stream, pattern) -> status` rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusRule {
    /// Stream the rule applies to
    pub stream: OutputStream,
    /// Substring to look for; `None` matches any non-blank line
    #[serde(default)]
    pub contains: Option<String>,
    /// Status the instance moves to when the rule fires
    pub status: InstanceStatus,
}

impl StatusRule {
    pub fn contains(stream: OutputStream, pattern: &str, status: InstanceStatus) -> Self {
        Self {
            stream,
            contains: Some(pattern.to_string()),
            status,
        }
    }

    pub fn any(stream: OutputStream, status: InstanceStatus) -> Self {
        Self {
            stream,
            contains: None,
            status,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.contains.as_deref(), Some(p) if p.is_empty()) {
            return Err("'contains' must not be empty (omit it to match any line)".to_string());
        }
        if self.status == InstanceStatus::Starting {
            return Err("a rule cannot move an instance back to 'starting'".to_string());
        }
        Ok(())
    }

    fn matches(&self, stream: OutputStream, line: &str) -> bool {
        if self.stream != stream {
            return false;
        }
        match &self.contains {
            Some(pattern) => line.contains(pattern.as_str()),
            None => !line.trim().is_empty(),
        }
    }
}

/// Status change derived from one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The child is serving
    Running,
    /// The child reported a failure; carries the offending text
    Error(String),
}

/// Maps output lines to optional status transitions
#[derive(Debug, Clone, Default)]
pub struct OutputClassifier {
    rules: Vec<StatusRule>,
}

impl OutputClassifier {
    pub fn new(rules: Vec<StatusRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[StatusRule] {
        &self.rules
    }

    /// Classify a line; `None` means the line carries no lifecycle signal
    pub fn classify(&self, stream: OutputStream, line: &str) -> Option<Transition> {
        let rule = self.rules.iter().find(|r| r.matches(stream, line))?;
        match rule.status {
            InstanceStatus::Running => Some(Transition::Running),
            InstanceStatus::Error => Some(Transition::Error(line.trim_end().to_string())),
            InstanceStatus::Starting => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    fn default_classifier() -> OutputClassifier {
        OutputClassifier::new(RunnerConfig::default().rules)
    }

    #[test]
    fn test_readiness_marker_on_stdout() {
        let classifier = default_classifier();
        assert_eq!(
            classifier.classify(
                OutputStream::Stdout,
                "lib/main.dart is being served at http://127.0.0.1:8081"
            ),
            Some(Transition::Running)
        );
    }

    #[test]
    fn test_plain_stdout_is_ignored() {
        let classifier = default_classifier();
        assert_eq!(classifier.classify(OutputStream::Stdout, "Launching lib/main.dart..."), None);
        assert_eq!(classifier.classify(OutputStream::Stdout, ""), None);
    }

    #[test]
    fn test_any_stderr_is_error() {
        let classifier = default_classifier();
        assert_eq!(
            classifier.classify(OutputStream::Stderr, "Error: compilation failed\n"),
            Some(Transition::Error("Error: compilation failed".to_string()))
        );
        assert_eq!(classifier.classify(OutputStream::Stderr, "   "), None);
    }

    #[test]
    fn test_marker_on_wrong_stream_does_not_match() {
        let classifier = OutputClassifier::new(vec![StatusRule::contains(
            OutputStream::Stdout,
            "ready",
            InstanceStatus::Running,
        )]);
        assert_eq!(classifier.classify(OutputStream::Stderr, "ready"), None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let classifier = OutputClassifier::new(vec![
            StatusRule::contains(OutputStream::Stderr, "warning", InstanceStatus::Running),
            StatusRule::any(OutputStream::Stderr, InstanceStatus::Error),
        ]);
        assert_eq!(
            classifier.classify(OutputStream::Stderr, "warning: deprecated api"),
            Some(Transition::Running)
        );
        assert!(matches!(
            classifier.classify(OutputStream::Stderr, "fatal"),
            Some(Transition::Error(_))
        ));
    }

    #[test]
    fn test_rule_validation() {
        assert!(StatusRule::any(OutputStream::Stdout, InstanceStatus::Running).validate().is_ok());
        assert!(StatusRule::contains(OutputStream::Stdout, "", InstanceStatus::Running)
            .validate()
            .is_err());
        assert!(StatusRule::any(OutputStream::Stdout, InstanceStatus::Starting)
            .validate()
            .is_err());
    }
}
