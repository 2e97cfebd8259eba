//! Ordered setup pipeline

use futures::future::BoxFuture;

use crate::error::Result;
use crate::service::logger::GitspaceLogger;

/// One named unit of container setup
pub struct Step<'a> {
    pub name: String,
    /// Abort the pipeline when the step fails
    pub stop_on_failure: bool,
    action: BoxFuture<'a, Result<()>>,
}

impl<'a> Step<'a> {
    pub fn new(
        name: impl Into<String>,
        stop_on_failure: bool,
        action: BoxFuture<'a, Result<()>>,
    ) -> Self {
        Self {
            name: name.into(),
            stop_on_failure,
            action,
        }
    }
}

/// Run `steps` in order.
///
/// A failing step with `stop_on_failure` ends the pipeline with its error;
/// any other failure is logged and the next step runs.
pub async fn execute_steps(steps: Vec<Step<'_>>, logger: &dyn GitspaceLogger) -> Result<()> {
    for step in steps {
        logger.debug(&format!("Executing step {}", step.name));
        if let Err(err) = step.action.await {
            if step.stop_on_failure {
                logger.error(&format!("Step {} failed", step.name), &err);
                return Err(err.context(format!(
                    "error executing step {} (stopping due to failure)",
                    step.name
                )));
            }
            logger.warn(&format!(
                "Error executing step {}: {} (continuing)",
                step.name, err
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::error::Error;
    use crate::service::logger::testing::RecordingLogger;

    fn failing(counter: &AtomicUsize) -> BoxFuture<'_, Result<()>> {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("boom".to_string()))
        }
        .boxed()
    }

    fn succeeding(counter: &AtomicUsize) -> BoxFuture<'_, Result<()>> {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_remaining_steps() {
        let a = AtomicUsize::new(0);
        let b = AtomicUsize::new(0);
        let logger = RecordingLogger::default();

        let err = execute_steps(
            vec![
                Step::new("A", true, failing(&a)),
                Step::new("B", false, succeeding(&b)),
            ],
            &logger,
        )
        .await
        .unwrap_err();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        assert!(err.to_string().contains("error executing step A"));
        assert!(matches!(err.root(), Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_non_fatal_failure_continues() {
        let a = AtomicUsize::new(0);
        let b = AtomicUsize::new(0);
        let logger = RecordingLogger::default();

        execute_steps(
            vec![
                Step::new("A", false, failing(&a)),
                Step::new("B", true, succeeding(&b)),
            ],
            &logger,
        )
        .await
        .unwrap();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert!(logger.contains("Error executing step A"));
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let order = std::sync::Mutex::new(Vec::new());
        let record = |name: &'static str| {
            let order = &order;
            async move {
                order.lock().unwrap().push(name);
                Ok(())
            }
            .boxed()
        };
        let logger = RecordingLogger::default();

        execute_steps(
            vec![
                Step::new("first", true, record("first")),
                Step::new("second", true, record("second")),
                Step::new("third", false, record("third")),
            ],
            &logger,
        )
        .await
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
