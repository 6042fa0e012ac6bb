use std::any::Any;

/// Errors raised while configuring a limiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("invalid concurrency `{value}`: {reason}")]
    InvalidArgument { value: String, reason: &'static str },
}

impl LimitError {
    pub(crate) fn invalid(value: impl ToString, reason: &'static str) -> Self {
        LimitError::InvalidArgument {
            value: value.to_string(),
            reason,
        }
    }
}

/// Failure channel of a submitted task.
///
/// The limiter never interprets `E`; it is handed back exactly as the task
/// produced it.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    #[error("task failed: {0}")]
    Failed(E),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled before it started")]
    Cancelled,
}

impl<E> TaskError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }

    /// The task's own error, if that is what this is.
    pub fn into_failure(self) -> Option<E> {
        match self {
            TaskError::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<F, E2>(self, f: F) -> TaskError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            TaskError::Failed(e) => TaskError::Failed(f(e)),
            TaskError::Panicked(msg) => TaskError::Panicked(msg),
            TaskError::Cancelled => TaskError::Cancelled,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_names_value_and_reason() {
        let err = LimitError::invalid(0, "must be at least 1");
        assert_eq!(err.to_string(), "invalid concurrency `0`: must be at least 1");
    }

    #[test]
    fn task_error_map_keeps_non_failure_variants() {
        let err: TaskError<u8> = TaskError::Panicked("boom".into());
        match err.map(|e| e.to_string()) {
            TaskError::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("expected Panicked, got {other:?}"),
        }

        let err: TaskError<u8> = TaskError::Failed(7);
        assert_eq!(err.map(|e| e * 2).into_failure(), Some(14));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u32)), "<non-string panic payload>");
    }
}
