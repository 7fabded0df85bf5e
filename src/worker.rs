use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::judge::{JudgeContext, judge_submission};
use crate::queue::JudgeQueue;
use crate::store::{Store, blocking};

/// Starts `count` workers that drain `queue` until it is closed.
pub fn spawn_workers(ctx: JudgeContext, queue: JudgeQueue, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let ctx = ctx.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                info!(worker, "worker started");
                while let Some(id) = queue.pop().await {
                    process(&ctx, id).await;
                    let queue = queue.clone();
                    let released =
                        blocking(&ctx.store, move |store| queue.finish(store, id)).await;
                    if let Err(e) = released {
                        error!(submission_id = id, "failed to release submission: {}", e);
                    }
                }
                info!(worker, "worker stopped");
            })
        })
        .collect()
}

/// Grades one submission. Errors and panics end up on the submission as a
/// judge error and never reach the caller.
pub async fn process(ctx: &JudgeContext, id: u64) {
    let task_ctx = ctx.clone();
    let joined = tokio::spawn(async move { judge_submission(&task_ctx, id).await }).await;
    let trace = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:?}", anyhow::Error::new(e)),
        Err(e) => format!("grading task failed: {}", e),
    };
    error!(submission_id = id, "judge error: {}", trace);
    let recorded = blocking(&ctx.store, move |store| record_judge_error(store, id, &trace)).await;
    if let Err(e) = recorded {
        error!(submission_id = id, "failed to record judge error: {}", e);
    }
}

/// Stores `trace` under a fresh log id and marks the submission as JE.
pub fn record_judge_error(store: &dyn Store, id: u64, trace: &str) -> Result<String, StoreError> {
    let log_id = Uuid::new_v4().simple().to_string();
    let path = store.write_log(&log_id, trace)?;
    store.update_submission(id, &mut |s| s.mark_judge_error(&log_id))?;
    counter!("submissions_judged_total", "outcome" => "JE").increment(1);
    warn!(submission_id = id, log_id = %log_id, log = %path.display(), "judge error recorded");
    Ok(log_id)
}

/// Re-queues every submission left unfinished by a previous run, in id order.
pub fn recover(store: &dyn Store, queue: &JudgeQueue) -> Result<usize, StoreError> {
    let mut count = 0;
    for submission in store.submissions()? {
        if submission.completed {
            continue;
        }
        queue.enqueue(store, submission.id)?;
        count += 1;
    }
    if count > 0 {
        info!(count, "re-queued unfinished submissions");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsStore, NewSubmission};
    use crate::submission::SubmissionStatus;
    use chrono::Utc;

    fn create(store: &FsStore) -> u64 {
        store
            .create_submission(NewSubmission {
                user: "alice".to_string(),
                problem_id: "a001".to_string(),
                language: "C++17".to_string(),
                source_name: "a.cpp".to_string(),
                code: String::new(),
                contest_id: None,
                period_id: None,
                just_pretest: false,
                submitted_at: Utc::now(),
                stdin: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_judge_error_is_logged_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let id = create(&store);
        let log_id = record_judge_error(&store, id, "boom").unwrap();
        let s = store.load_submission(id).unwrap();
        assert!(s.completed);
        assert_eq!(s.status, SubmissionStatus::JudgeError);
        assert_eq!(s.result.je, Some(true));
        assert_eq!(s.result.log_uuid.as_deref(), Some(log_id.as_str()));
        let log = std::fs::read_to_string(dir.path().join("logs").join(format!("{}.log", log_id)));
        assert_eq!(log.unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_recover_requeues_unfinished_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let a = create(&store);
        let b = create(&store);
        let c = create(&store);
        store.update_submission(b, &mut |s| s.completed = true).unwrap();
        let queue = JudgeQueue::new();
        assert_eq!(recover(&store, &queue).unwrap(), 2);
        assert_eq!(queue.pop().await, Some(a));
        assert_eq!(queue.pop().await, Some(c));
        assert_eq!(store.load_submission(c).unwrap().queue_position, 2);
    }
}
