use crate::api::{MaintWindow, MonitoringApi, NewMaintWindow};
use crate::error::AlarmError;

/// Create a maintenance window after validating the request: the window must
/// have positive duration and carry operator notes explaining it.
pub async fn create_window(
    monitor: &dyn MonitoringApi,
    account: &str,
    window: &NewMaintWindow,
) -> Result<MaintWindow, AlarmError> {
    if window.start >= window.end {
        return Err(AlarmError::WindowInvalid(format!(
            "start {} is not before end {}",
            window.start, window.end
        )));
    }
    if window.notes.trim().is_empty() {
        return Err(AlarmError::WindowInvalid("notes are required".to_string()));
    }
    monitor.create_maintenance_window(account, window).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MaintScope, MemoryMonitor};
    use chrono::{Duration, Utc};

    fn window(offset_start: i64, offset_end: i64, notes: &str) -> NewMaintWindow {
        let now = Utc::now();
        NewMaintWindow {
            start: now + Duration::minutes(offset_start),
            end: now + Duration::minutes(offset_end),
            notes: notes.to_string(),
            scope: MaintScope::All,
        }
    }

    #[tokio::test]
    async fn creates_a_valid_window() {
        let monitor = MemoryMonitor::new();
        let created = create_window(&monitor, "acct", &window(0, 60, "postgres upgrade"))
            .await
            .unwrap();
        assert!(created.id > 0);
        let listed = monitor.list_maintenance_windows("acct").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn rejects_inverted_window() {
        let monitor = MemoryMonitor::new();
        let err = create_window(&monitor, "acct", &window(60, 0, "oops"))
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::WindowInvalid(_)));
    }

    #[tokio::test]
    async fn rejects_missing_notes() {
        let monitor = MemoryMonitor::new();
        let err = create_window(&monitor, "acct", &window(0, 60, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, AlarmError::WindowInvalid(_)));
    }

    #[tokio::test]
    async fn delete_of_unknown_window_reports_not_found() {
        let monitor = MemoryMonitor::new();
        let err = monitor.delete_maintenance_window("acct", 42).await.unwrap_err();
        assert!(matches!(err, AlarmError::NotFound(42)));
    }
}
