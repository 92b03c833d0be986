//! WarningService: an in-memory, bounded log of operator-facing warnings.
//!
//! Warnings are side-channel diagnostics, never part of the routing
//! decision: nothing in the hot path blocks on this service, and nothing it
//! does can fail a message's delivery.

use std::sync::Arc;

use parking_lot::RwLock;
use rc_common::{Warning, WarningCategory, WarningSeverity};
use tracing::{debug, warn};

use crate::notification::NotificationService;

const MAX_RETAINED: usize = 500;

pub struct WarningService {
    warnings: RwLock<Vec<Warning>>,
    notifier: Option<Arc<dyn NotificationService>>,
    min_notify_severity: WarningSeverity,
}

impl WarningService {
    pub fn new() -> Self {
        Self { warnings: RwLock::new(Vec::new()), notifier: None, min_notify_severity: WarningSeverity::Warning }
    }

    pub fn with_notifier(notifier: Arc<dyn NotificationService>, min_notify_severity: WarningSeverity) -> Self {
        Self { warnings: RwLock::new(Vec::new()), notifier: Some(notifier), min_notify_severity }
    }

    pub fn add(&self, warning: Warning) {
        debug!(category = ?warning.category, severity = ?warning.severity, message = %warning.message, "warning raised");

        {
            let mut warnings = self.warnings.write();
            warnings.push(warning.clone());
            if warnings.len() > MAX_RETAINED {
                let overflow = warnings.len() - MAX_RETAINED;
                warnings.drain(0..overflow);
            }
        }

        if warning.severity >= self.min_notify_severity {
            if let Some(notifier) = self.notifier.clone() {
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify(&warning).await {
                        warn!(error = %e, "failed to deliver warning notification");
                    }
                });
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Warning> {
        let warnings = self.warnings.read();
        warnings.iter().rev().take(limit).cloned().collect()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings.read().iter().filter(|w| !w.acknowledged).count()
    }

    pub fn by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings.read().iter().filter(|w| w.category == category).cloned().collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(w) = warnings.iter_mut().find(|w| w.id == id) {
            w.acknowledged = true;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        self.warnings.write().clear();
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_most_recent_up_to_cap() {
        let service = WarningService::new();
        for i in 0..(MAX_RETAINED + 10) {
            service.add(Warning::new(WarningCategory::Routing, WarningSeverity::Info, format!("w{i}"), "test"));
        }
        assert_eq!(service.recent(usize::MAX).len(), MAX_RETAINED);
    }

    #[test]
    fn acknowledge_marks_matching_warning() {
        let service = WarningService::new();
        let w = Warning::new(WarningCategory::PoolHealth, WarningSeverity::Warning, "m", "test");
        let id = w.id.clone();
        service.add(w);
        assert!(service.acknowledge(&id));
        assert_eq!(service.unacknowledged_count(), 0);
    }

    #[test]
    fn filters_by_category() {
        let service = WarningService::new();
        service.add(Warning::new(WarningCategory::Routing, WarningSeverity::Info, "a", "test"));
        service.add(Warning::new(WarningCategory::PoolHealth, WarningSeverity::Info, "b", "test"));
        assert_eq!(service.by_category(WarningCategory::Routing).len(), 1);
    }
}
