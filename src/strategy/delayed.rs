use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Reporter, Strategy};

/// Starts its child after `delay`. Aborting before the timer fires cancels only the
/// timer; afterwards the abort reaches the child.
#[derive(Debug)]
pub struct DelayedStrategy {
    child: Box<Strategy>,
    delay: Duration,
}

impl DelayedStrategy {
    #[must_use]
    pub fn new(child: Strategy, delay: Duration) -> Self {
        Self {
            child: Box::new(child),
            delay,
        }
    }

    #[must_use]
    pub fn child(&self) -> &Strategy {
        &self.child
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.child.is_supported()
    }

    pub(crate) async fn run(&self, reporter: &Reporter, token: &CancellationToken) {
        let fired = tokio::select! {
            biased;
            () = token.cancelled() => false,
            () = tokio::time::sleep(self.delay) => true,
        };

        if fired {
            self.child.run(reporter, token).await;
        }
    }
}
