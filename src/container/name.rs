//! Structured container identity.
//!
//! The engine only stores a flat name; convoy encodes
//! `<project>_<service>_<ordinal>` into it (one-off runs get an extra `run`
//! segment: `<project>_<service>_run_<ordinal>`). That decorated string is
//! purely a serialization format at the API boundary; internally identity
//! is the structured `(project, service, ordinal, one_off)` key. External
//! tooling parses the decorated form, so it is preserved bit-for-bit.

use std::fmt;

/// Structured `(project, service, ordinal, one_off)` container key.
///
/// Project and service names must not contain underscores; the decorated
/// form is not parseable otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerName {
    pub project: String,
    pub service: String,
    /// 1-based replica ordinal.
    pub ordinal: usize,
    pub one_off: bool,
}

impl ContainerName {
    pub fn new(project: impl Into<String>, service: impl Into<String>, ordinal: usize) -> Self {
        Self {
            project: project.into(),
            service: service.into(),
            ordinal,
            one_off: false,
        }
    }

    pub fn one_off(project: impl Into<String>, service: impl Into<String>, ordinal: usize) -> Self {
        Self {
            one_off: true,
            ..Self::new(project, service, ordinal)
        }
    }

    /// Decode an engine name. Accepts an optional leading slash (the engine
    /// reports names as `/project_service_1`). Returns `None` for names that
    /// do not follow the convoy convention.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.strip_prefix('/').unwrap_or(raw);
        let parts: Vec<&str> = name.split('_').collect();
        let (project, service, one_off, ordinal) = match parts.as_slice() {
            [project, service, ordinal] => (project, service, false, ordinal),
            [project, service, "run", ordinal] => (project, service, true, ordinal),
            _ => return None,
        };
        if project.is_empty() || service.is_empty() {
            return None;
        }
        let ordinal: usize = ordinal.parse().ok()?;
        if ordinal == 0 {
            return None;
        }
        Some(Self {
            project: project.to_string(),
            service: service.to_string(),
            ordinal,
            one_off,
        })
    }

    /// Whether this name belongs to the given project/service pair.
    pub fn belongs_to(&self, project: &str, service: &str) -> bool {
        self.project == project && self.service == service
    }

    /// The name as the service sees it, project prefix stripped.
    pub fn without_project(&self) -> String {
        if self.one_off {
            format!("{}_run_{}", self.service, self.ordinal)
        } else {
            format!("{}_{}", self.service, self.ordinal)
        }
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.one_off {
            write!(f, "{}_{}_run_{}", self.project, self.service, self.ordinal)
        } else {
            write!(f, "{}_{}_{}", self.project, self.service, self.ordinal)
        }
    }
}
