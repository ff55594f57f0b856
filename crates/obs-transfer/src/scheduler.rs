//! Bounded pool of part tasks
//!
//! Workers pull parts from one shared queue in ascending part order, so a
//! fast worker absorbs more parts than a slow one. A failing part is
//! reported as data and never stops its siblings; deciding what to do about
//! it is up to the caller.
//!
//! Two tokens steer a run. `dispatch` only stops new parts from being
//! handed out, so parts already in flight drain normally. `interrupt` also
//! stops in-flight parts, which then report [`TransferError::Cancelled`].

use crate::plan::PartSpec;
use crate::{Result, TransferError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Outcome of one part task: the part's ETag or the error that stopped it
#[derive(Debug)]
pub struct PartTaskResult {
    pub part: PartSpec,
    pub outcome: Result<PartReceipt>,
}

/// What a successful part task hands back
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartReceipt {
    pub etag: String,
    pub attempts: u32,
}

/// Runs part tasks with at most `task_num` in flight
#[derive(Clone, Copy, Debug)]
pub struct Scheduler {
    task_num: usize,
}

impl Scheduler {
    /// Scheduler with `task_num` workers, at least one
    pub fn new(task_num: usize) -> Self {
        Self {
            task_num: task_num.max(1),
        }
    }

    /// Worker count
    pub fn task_num(&self) -> usize {
        self.task_num
    }

    /// Dispatch `parts` to `part_fn` and stream results back as they finish.
    ///
    /// Cancelling `dispatch` stops handing out parts and lets in-flight ones
    /// finish. Cancelling `interrupt` also stops dispatch, and in-flight
    /// tasks race it, reporting [`TransferError::Cancelled`] if it fires
    /// first. The receiver ends once every worker has exited.
    pub fn run<F, Fut>(
        &self,
        parts: Vec<PartSpec>,
        dispatch: CancellationToken,
        interrupt: CancellationToken,
        part_fn: F,
    ) -> mpsc::Receiver<PartTaskResult>
    where
        F: Fn(PartSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PartReceipt>> + Send + 'static,
    {
        let workers = self.task_num.min(parts.len());
        let (tx, rx) = mpsc::channel(parts.len().max(1));
        let queue = Arc::new(Mutex::new(VecDeque::from(parts)));
        let part_fn = Arc::new(part_fn);

        debug!(workers, queued = queue.lock().len(), "starting part workers");

        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let part_fn = Arc::clone(&part_fn);
            let dispatch = dispatch.clone();
            let interrupt = interrupt.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                loop {
                    if dispatch.is_cancelled() || interrupt.is_cancelled() {
                        break;
                    }
                    let Some(part) = queue.lock().pop_front() else {
                        break;
                    };

                    trace!(worker, part_number = part.part_number, "part dispatched");
                    let outcome = tokio::select! {
                        biased;
                        _ = interrupt.cancelled() => Err(TransferError::Cancelled),
                        outcome = part_fn(part) => outcome,
                    };

                    if tx.send(PartTaskResult { part, outcome }).await.is_err() {
                        break;
                    }
                }
                trace!(worker, "worker exiting");
            });
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TransferPlan;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn receipt(part: &PartSpec) -> PartReceipt {
        PartReceipt {
            etag: format!("etag-{}", part.part_number),
            attempts: 1,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<PartTaskResult>) -> Vec<PartTaskResult> {
        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        results
    }

    #[tokio::test]
    async fn test_runs_every_part_once() {
        let plan = TransferPlan::new(100, 10).unwrap();
        let rx = Scheduler::new(3).run(plan.parts().to_vec(), CancellationToken::new(), CancellationToken::new(), |part| async move {
            Ok(receipt(&part))
        });

        let mut numbers: Vec<u32> = collect(rx)
            .await
            .into_iter()
            .map(|r| {
                assert_eq!(r.outcome.as_ref().unwrap().etag, format!("etag-{}", r.part.part_number));
                r.part.part_number
            })
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let plan = TransferPlan::new(200, 10).unwrap();

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let rx = Scheduler::new(4).run(plan.parts().to_vec(), CancellationToken::new(), CancellationToken::new(), move |part| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(receipt(&part))
            }
        });

        assert_eq!(collect(rx).await.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let plan = TransferPlan::new(50, 10).unwrap();
        let rx = Scheduler::new(2).run(plan.parts().to_vec(), CancellationToken::new(), CancellationToken::new(), |part| async move {
            if part.part_number == 2 {
                Err(TransferError::InvalidArgument("boom".into()))
            } else {
                Ok(receipt(&part))
            }
        });

        let results = collect(rx).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.outcome.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_stops_in_flight_parts() {
        let plan = TransferPlan::new(100, 10).unwrap();
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let (c, s) = (cancel.clone(), Arc::clone(&started));
        let rx = Scheduler::new(1).run(plan.parts().to_vec(), CancellationToken::new(), cancel.clone(), move |part| {
            let (c, s) = (c.clone(), Arc::clone(&s));
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                if part.part_number == 3 {
                    c.cancel();
                    std::future::pending::<()>().await;
                }
                Ok(receipt(&part))
            }
        });

        let results = collect(rx).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[2].outcome, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stopped_dispatch_drains_in_flight_parts() {
        let plan = TransferPlan::new(60, 10).unwrap();
        let dispatch = CancellationToken::new();

        let d = dispatch.clone();
        let rx = Scheduler::new(3).run(plan.parts().to_vec(), dispatch.clone(), CancellationToken::new(), move |part| {
            let d = d.clone();
            async move {
                if part.part_number == 2 {
                    d.cancel();
                    return Err(TransferError::InvalidArgument("boom".into()));
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(receipt(&part))
            }
        });

        let mut results = collect(rx).await;
        results.sort_by_key(|r| r.part.part_number);
        let numbers: Vec<u32> = results.iter().map(|r| r.part.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(results[0].outcome.is_ok());
        assert!(results[1].outcome.is_err());
        assert!(results[2].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_empty_part_list_closes_stream() {
        let rx = Scheduler::new(4).run(Vec::new(), CancellationToken::new(), CancellationToken::new(), |part| async move {
            Ok(receipt(&part))
        });
        assert!(collect(rx).await.is_empty());
    }

    #[test]
    fn test_task_num_clamped() {
        assert_eq!(Scheduler::new(0).task_num(), 1);
        assert_eq!(Scheduler::new(8).task_num(), 8);
    }
}
