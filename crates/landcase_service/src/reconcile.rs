use landcase_core::{CaseRecord, CaseWithTaskInfo, TaskView};

use crate::executor::TaskExecutor;

/// Compose a persisted record with the live status of its task handles.
/// Recomputed on every read; the executor is the sole source of truth for
/// in-flight status, so nothing here is ever cached or persisted.
pub async fn with_task_info(record: CaseRecord, executor: &dyn TaskExecutor) -> CaseWithTaskInfo {
    let create_task = match record.create_task_id.as_deref() {
        Some(task_id) => executor.poll(task_id).await,
        None => TaskView::empty(),
    };
    let run_task = match record.run_task_id.as_deref() {
        Some(task_id) => executor.poll(task_id).await,
        None => TaskView::empty(),
    };
    CaseWithTaskInfo {
        case: record,
        create_task,
        run_task,
    }
}

/// Short error summary for a failure trace: the last non-empty line. Full
/// traces are often multi-kilobyte and framework-internal; clients get the
/// line that names the actual failure.
pub fn error_excerpt(trace: &str) -> Option<String> {
    trace
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn excerpt_is_the_last_non_empty_line() {
        let trace = "Traceback (most recent call last):\n  File \"x\", line 1\n\nError: build exploded\n\n";
        assert_eq!(error_excerpt(trace), Some("Error: build exploded".to_owned()));
    }

    #[test]
    fn excerpt_of_blank_trace_is_none() {
        assert_eq!(error_excerpt("\n  \n"), None);
        assert_eq!(error_excerpt(""), None);
    }
}
