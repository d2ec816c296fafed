use tracing_subscriber::EnvFilter;

use crate::RuntimeSettings;

/// Aggregated validation issues encountered while checking resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub messages: Vec<String>,
}

impl ValidationIssue {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.messages.is_empty() {
            write!(f, "no validation issues")
        } else {
            write!(f, "{}", self.messages.join("; "))
        }
    }
}

impl std::error::Error for ValidationIssue {}

/// Validate resolved runtime settings, reporting every problem at once.
pub fn validate_settings(settings: &RuntimeSettings) -> Result<(), ValidationIssue> {
    let mut errors = Vec::new();

    if settings.coalesce.max_key_depth == 0 {
        errors.push("coalesce.max_key_depth must be greater than zero".into());
    }

    if settings.coalesce.drain_capacity == 0 {
        errors.push("coalesce.drain_capacity must be greater than zero".into());
    }

    if settings.telemetry.filter.trim().is_empty() {
        errors.push("telemetry.filter must not be empty".into());
    } else if let Err(err) = EnvFilter::try_new(&settings.telemetry.filter) {
        errors.push(format!("telemetry.filter is not a valid filter: {err}"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationIssue::new(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_settings(&RuntimeSettings::default()).is_ok());
    }

    #[test]
    fn collects_every_problem() {
        let mut settings = RuntimeSettings::default();
        settings.coalesce.max_key_depth = 0;
        settings.coalesce.drain_capacity = 0;
        settings.telemetry.filter = "  ".into();

        let issue = validate_settings(&settings).unwrap_err();
        assert_eq!(issue.messages.len(), 3);
        assert!(issue.to_string().contains("drain_capacity"));
    }
}
