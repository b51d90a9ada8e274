//! Interface Selector
//!
//! Picks the authoritative tunnel interface from one probe cycle's
//! candidates. Pure: same candidates in, same answer out.
//!
//! Order of preference:
//!
//! 1. A candidate fully matching the fingerprint (`Detected`). Ties go to the
//!    lexically first name and are logged as ambiguous.
//! 2. The interface literally named after the configured name (`Fallback`).
//! 3. The incumbent, i.e. the interface the gate is currently unlocked for,
//!    if it is still present (`Fallback`). This keeps a fingerprint change on
//!    the live tunnel visible as Degraded instead of a disappearance.
//! 4. Nothing (`Unresolved`).

use tracing::warn;
use tunlock_net::{Fingerprint, InterfaceCandidate};

/// Where a selection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    /// Fingerprint fully satisfied
    Detected,
    /// Chosen by name without verification
    Fallback,
    /// No interface at all
    Unresolved,
}

/// Outcome of one selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub interface: Option<InterfaceCandidate>,
    pub source: SelectionSource,
    /// More than one candidate fully matched
    pub ambiguous: bool,
}

impl SelectionResult {
    pub fn unresolved() -> Self {
        Self {
            interface: None,
            source: SelectionSource::Unresolved,
            ambiguous: false,
        }
    }

    fn fallback(candidate: &InterfaceCandidate) -> Self {
        Self {
            interface: Some(candidate.clone()),
            source: SelectionSource::Fallback,
            ambiguous: false,
        }
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.interface.as_ref().map(|c| c.name.as_str())
    }
}

/// Deterministic tunnel interface selection
#[derive(Debug, Clone)]
pub struct InterfaceSelector {
    fingerprint: Fingerprint,
    configured_name: String,
}

impl InterfaceSelector {
    pub fn new(fingerprint: Fingerprint, configured_name: impl Into<String>) -> Self {
        Self {
            fingerprint,
            configured_name: configured_name.into(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn configured_name(&self) -> &str {
        &self.configured_name
    }

    /// Select from `candidates`, without incumbent continuity
    pub fn select(&self, candidates: &[InterfaceCandidate]) -> SelectionResult {
        self.select_with_incumbent(candidates, None)
    }

    /// Select from `candidates`, preferring `incumbent` over nothing
    pub fn select_with_incumbent(
        &self,
        candidates: &[InterfaceCandidate],
        incumbent: Option<&str>,
    ) -> SelectionResult {
        let mut matching: Vec<&InterfaceCandidate> = candidates
            .iter()
            .filter(|c| c.matches(&self.fingerprint))
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(first) = matching.first() {
            let ambiguous = matching.len() > 1;
            if ambiguous {
                let names: Vec<&str> = matching.iter().map(|c| c.name.as_str()).collect();
                warn!(
                    "Ambiguous selection: {} interfaces match the fingerprint ({}), using {}",
                    matching.len(),
                    names.join(", "),
                    first.name
                );
            }
            return SelectionResult {
                interface: Some((*first).clone()),
                source: SelectionSource::Detected,
                ambiguous,
            };
        }

        if let Some(configured) = candidates.iter().find(|c| c.name == self.configured_name) {
            return SelectionResult::fallback(configured);
        }

        if let Some(name) = incumbent {
            if let Some(current) = candidates.iter().find(|c| c.name == name) {
                return SelectionResult::fallback(current);
            }
        }

        SelectionResult::unresolved()
    }
}
