//! KF-005: Diagnostic recorder shared by every vertex of a run.

use super::types::Diagnostic;
use std::sync::Mutex;

/// Ordered, mutex-protected list of diagnostics.
#[derive(Debug, Default)]
pub struct Recorder {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(diagnostic);
    }

    /// All diagnostics in recording order.
    pub fn get(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_error(&self) -> bool {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(Diagnostic::is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kf005_record_order() {
        let r = Recorder::new();
        r.record(Diagnostic::warning("a", "first"));
        r.record(Diagnostic::error("b", "second"));
        let all = r.get();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].detail, "first");
        assert_eq!(all[1].context, "b");
    }

    #[test]
    fn test_kf005_has_error() {
        let r = Recorder::new();
        assert!(!r.has_error());
        r.record(Diagnostic::warning("a", "meh"));
        assert!(!r.has_error());
        r.record(Diagnostic::error("a", "bad"));
        assert!(r.has_error());
    }
}
