use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ordered log of what a limiter did with one batch of jobs.
#[derive(Debug, Clone)]
pub struct Trace {
    pub run_id: String,
    pub concurrency: String,
    pub events: Vec<TraceEvent>,
    run_started_ms: u128,
    job_started_ms: HashMap<String, u128>,
}

#[derive(Debug, Clone)]
pub enum TraceEvent {
    JobSubmitted {
        ts_ms: u128,
        job_id: String,
        active: usize,
        pending: usize,
    },
    JobStarted {
        ts_ms: u128,
        job_id: String,
        active: usize,
    },
    JobFinished {
        ts_ms: u128,
        job_id: String,
        success: bool,
        elapsed_ms: u128,
    },
    QueueCleared {
        ts_ms: u128,
        dropped: usize,
    },
    RunFinished {
        ts_ms: u128,
        success: bool,
        elapsed_ms: u128,
    },
}

impl TraceEvent {
    pub fn summarize(&self) -> String {
        match self {
            TraceEvent::JobSubmitted {
                ts_ms,
                job_id,
                active,
                pending,
            } => format!("{ts_ms} JobSubmitted job={job_id} active={active} pending={pending}"),
            TraceEvent::JobStarted {
                ts_ms,
                job_id,
                active,
            } => format!("{ts_ms} JobStarted job={job_id} active={active}"),
            TraceEvent::JobFinished {
                ts_ms,
                job_id,
                success,
                elapsed_ms,
            } => {
                let elapsed = format_elapsed_ms(*elapsed_ms);
                format!(
                    "{ts_ms} JobFinished job={job_id} success={success} elapsed_ms={elapsed_ms} elapsed={elapsed}"
                )
            }
            TraceEvent::QueueCleared { ts_ms, dropped } => {
                format!("{ts_ms} QueueCleared dropped={dropped}")
            }
            TraceEvent::RunFinished {
                ts_ms,
                success,
                elapsed_ms,
            } => {
                let elapsed = format_elapsed_ms(*elapsed_ms);
                format!(
                    "{ts_ms} RunFinished success={success} elapsed_ms={elapsed_ms} elapsed={elapsed}"
                )
            }
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            TraceEvent::JobSubmitted { job_id, .. }
            | TraceEvent::JobStarted { job_id, .. }
            | TraceEvent::JobFinished { job_id, .. } => Some(job_id),
            TraceEvent::QueueCleared { .. } | TraceEvent::RunFinished { .. } => None,
        }
    }
}

impl Trace {
    pub fn new(run_id: impl Into<String>, concurrency: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            concurrency: concurrency.into(),
            events: Vec::new(),
            run_started_ms: Self::now_ms(),
            job_started_ms: HashMap::new(),
        }
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn job_submitted(&mut self, job_id: &str, active: usize, pending: usize) {
        self.events.push(TraceEvent::JobSubmitted {
            ts_ms: Self::now_ms(),
            job_id: job_id.to_string(),
            active,
            pending,
        });
    }

    pub fn job_started(&mut self, job_id: &str, active: usize) {
        let ts_ms = Self::now_ms();
        self.events.push(TraceEvent::JobStarted {
            ts_ms,
            job_id: job_id.to_string(),
            active,
        });
        self.job_started_ms.insert(job_id.to_string(), ts_ms);
    }

    pub fn job_finished(&mut self, job_id: &str, success: bool) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = self
            .job_started_ms
            .remove(job_id)
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        self.events.push(TraceEvent::JobFinished {
            ts_ms,
            job_id: job_id.to_string(),
            success,
            elapsed_ms,
        });
    }

    pub fn queue_cleared(&mut self, dropped: usize) {
        self.events.push(TraceEvent::QueueCleared {
            ts_ms: Self::now_ms(),
            dropped,
        });
    }

    pub fn run_finished(&mut self, success: bool) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = ts_ms.saturating_sub(self.run_started_ms);
        self.events.push(TraceEvent::RunFinished {
            ts_ms,
            success,
            elapsed_ms,
        });
    }

    /// Job ids in the order they started running.
    pub fn start_order(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|ev| matches!(ev, TraceEvent::JobStarted { .. }))
            .filter_map(TraceEvent::job_id)
            .collect()
    }
}

/// Print a human-readable trace to stdout (stable + diff-friendly).
pub fn print_trace(tr: &Trace) {
    println!("TRACE run_id={} concurrency={}", tr.run_id, tr.concurrency);
    for ev in &tr.events {
        println!("{}", ev.summarize());
    }
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_records_job_lifecycle_events_in_order() {
        let mut tr = Trace::new("run-1", "2");

        tr.job_submitted("job-1", 0, 0);
        tr.job_started("job-1", 1);
        tr.job_finished("job-1", true);

        assert_eq!(tr.events.len(), 3);

        match &tr.events[0] {
            TraceEvent::JobSubmitted { job_id, pending, .. } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(*pending, 0);
            }
            _ => panic!("expected JobSubmitted event"),
        }

        match &tr.events[1] {
            TraceEvent::JobStarted { active, .. } => assert_eq!(*active, 1),
            _ => panic!("expected JobStarted event"),
        }

        match &tr.events[2] {
            TraceEvent::JobFinished {
                success,
                elapsed_ms,
                ..
            } => {
                assert!(*success);
                assert!(*elapsed_ms <= 1_000);
            }
            _ => panic!("expected JobFinished event"),
        }
    }

    #[test]
    fn start_order_skips_other_events() {
        let mut tr = Trace::new("run-2", "1");

        tr.job_submitted("a", 0, 0);
        tr.job_submitted("b", 1, 1);
        tr.job_started("a", 1);
        tr.job_finished("a", false);
        tr.job_started("b", 1);
        tr.queue_cleared(0);
        tr.run_finished(false);

        assert_eq!(tr.start_order(), vec!["a", "b"]);
    }

    #[test]
    fn finishing_an_unknown_job_reports_zero_elapsed() {
        let mut tr = Trace::new("run-3", "unbounded");
        tr.job_finished("ghost", true);
        match &tr.events[0] {
            TraceEvent::JobFinished { elapsed_ms, .. } => assert_eq!(*elapsed_ms, 0),
            _ => panic!("expected JobFinished event"),
        }
    }

    #[test]
    fn summaries_are_line_oriented() {
        let mut tr = Trace::new("run-4", "3");
        tr.job_started("x", 2);
        let line = tr.events[0].summarize();
        assert!(line.ends_with("JobStarted job=x active=2"), "{line}");
        assert!(!line.contains('\n'));
    }
}
