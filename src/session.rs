//! Vocabulary shared by both kinds of interactive session.
//!
//! An exec session and a port-forward session both target a single pod and
//! move through the same coarse lifecycle. Only port-forward sessions are kept
//! in a registry (see [`crate::portforward`]); exec sessions live exactly as
//! long as the WebSocket that carries them.

use std::fmt;

use serde::Serialize;

/// Maximum length of a Kubernetes DNS subdomain name.
const MAX_NAME_LEN: usize = 253;

/// Validate a namespace or pod name.
///
/// Names must be 1-253 chars of lowercase alphanumerics, `-` or `.`, and must
/// start and end with an alphanumeric character.
pub fn validate_resource_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "{kind} too long ({} bytes, max {MAX_NAME_LEN})",
            name.len()
        ));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    if !name.chars().all(valid_char) {
        return Err(format!(
            "{kind} contains invalid characters: {}",
            name.chars().take(64).collect::<String>()
        ));
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return Err(format!("{kind} must start and end with an alphanumeric character: {name}"));
    }
    Ok(())
}

/// Cluster coordinates of the workload a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub pod: String,
}

impl PodRef {
    /// Build a validated pod reference.
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Result<Self, String> {
        let namespace = namespace.into();
        let pod = pod.into();
        validate_resource_name("namespace", &namespace)?;
        validate_resource_name("pod name", &pod)?;
        Ok(Self { namespace, pod })
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// Lifecycle of a session.
///
/// There is no `Terminated` variant: a terminated session is simply gone
/// from wherever it was tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Resources reserved, stream not yet confirmed usable.
    Starting,
    /// Stream open and pumping.
    Active,
    /// Stop requested or remote end closed; cleanup in progress.
    Stopping,
}

impl SessionState {
    /// Status string exposed to clients. `Starting` and `Active` are
    /// deliberately indistinguishable.
    pub fn public_status(self) -> &'static str {
        match self {
            SessionState::Starting | SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }

    /// Whether a session in this state still occupies its identity.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        assert!(validate_resource_name("pod name", "web-1").is_ok());
        assert!(validate_resource_name("pod name", "api.v2-7f9c").is_ok());
        assert!(validate_resource_name("namespace", "default").is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        let err = validate_resource_name("namespace", "").unwrap_err();
        assert!(err.contains("must not be empty"), "got: {err}");
    }

    #[test]
    fn rejects_uppercase_and_slashes() {
        assert!(validate_resource_name("pod name", "Web").is_err());
        assert!(validate_resource_name("pod name", "a/b").is_err());
        assert!(validate_resource_name("pod name", "a b").is_err());
    }

    #[test]
    fn rejects_bad_edges() {
        assert!(validate_resource_name("pod name", "-web").is_err());
        assert!(validate_resource_name("pod name", "web.").is_err());
    }

    #[test]
    fn rejects_overlong_name() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        let err = validate_resource_name("pod name", &name).unwrap_err();
        assert!(err.contains("too long"), "got: {err}");
    }

    #[test]
    fn rejects_multibyte_name_without_panicking() {
        let name = format!("{}é", "a".repeat(63));
        let err = validate_resource_name("pod name", &name).unwrap_err();
        assert!(err.contains("invalid characters"), "got: {err}");
        assert!(err.ends_with(&name), "got: {err}");

        let long = "é".repeat(100);
        let err = validate_resource_name("namespace", &long).unwrap_err();
        assert!(err.contains("invalid characters"), "got: {err}");
    }

    #[test]
    fn pod_ref_displays_as_path() {
        let pod = PodRef::new("default", "web-1").unwrap();
        assert_eq!(pod.to_string(), "default/web-1");
    }

    #[test]
    fn starting_and_active_look_the_same() {
        assert_eq!(SessionState::Starting.public_status(), "active");
        assert_eq!(SessionState::Active.public_status(), "active");
        assert_eq!(SessionState::Stopping.public_status(), "stopping");
        assert!(SessionState::Starting.is_live());
        assert!(!SessionState::Stopping.is_live());
    }
}
