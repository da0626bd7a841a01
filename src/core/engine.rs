use crate::core::shutdown::Shutdown;
use crate::core::RequestProcessor;
use crate::utils::error::Result;

/// Drives a [`RequestProcessor`] until shutdown is requested.
pub struct AgentEngine<P: RequestProcessor> {
    processor: P,
}

impl<P: RequestProcessor> AgentEngine<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }

    /// Runs the loop and returns the number of completed iterations.
    ///
    /// The flag is only checked between iterations, so a shutdown that
    /// arrives mid-iteration lets that iteration finish and makes it the last.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> Result<u64> {
        let mut iterations = 0u64;
        while shutdown.is_running() {
            self.processor.check_and_process(shutdown).await?;
            iterations += 1;
        }
        tracing::debug!(target: "main", "request loop finished after {} iterations", iterations);
        Ok(iterations)
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn into_processor(self) -> P {
        self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown::{self, ShutdownTrigger};
    use async_trait::async_trait;

    struct StopAfter {
        calls: u64,
        stop_at: u64,
        trigger: ShutdownTrigger,
    }

    #[async_trait]
    impl RequestProcessor for StopAfter {
        async fn check_and_process(&mut self, _shutdown: &mut Shutdown) -> Result<()> {
            self.calls += 1;
            if self.calls == self.stop_at {
                self.trigger.trigger();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_iteration_that_sees_signal_is_the_last() {
        let (trigger, mut shutdown) = shutdown::channel();
        let mut engine = AgentEngine::new(StopAfter {
            calls: 0,
            stop_at: 3,
            trigger,
        });

        let iterations = engine.run(&mut shutdown).await.unwrap();
        assert_eq!(iterations, 3);
        assert_eq!(engine.processor().calls, 3);
    }

    #[tokio::test]
    async fn test_no_iteration_when_already_stopped() {
        let (trigger, mut shutdown) = shutdown::channel();
        trigger.trigger();
        let (other, _) = shutdown::channel();
        let mut engine = AgentEngine::new(StopAfter {
            calls: 0,
            stop_at: 1,
            trigger: other,
        });

        assert_eq!(engine.run(&mut shutdown).await.unwrap(), 0);
        assert_eq!(engine.into_processor().calls, 0);
    }
}
