use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{Attempt, OpenTransport, Reporter};
use crate::transport::{
    TransportError, TransportEvent, TransportFactory, TransportOptions, TransportState,
};

/// Leaf strategy: creates one transport and reports it once it opens.
pub struct TransportStrategy {
    name: String,
    factory: Arc<dyn TransportFactory>,
    options: TransportOptions,
}

impl fmt::Debug for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStrategy")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TransportStrategy {
    #[must_use]
    pub fn new(name: &str, factory: Arc<dyn TransportFactory>, options: TransportOptions) -> Self {
        Self {
            name: name.to_owned(),
            factory,
            options,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        let environment = self.options.environment();
        !environment.is_disabled(&self.name) && self.factory.is_supported(&environment)
    }

    pub(crate) async fn run(&self, reporter: &Reporter, token: &CancellationToken) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            transport = %self.name,
            encrypted = self.options.encrypted,
            "Trying transport"
        );

        let (transport, mut events) = self.factory.create_connection(&self.options);
        transport.initialize();

        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => None,
                event = events.recv() => Some(event),
            };

            match event {
                None => {
                    // An open transport belongs to whoever received the handoff.
                    if transport.state() != TransportState::Open {
                        transport.close();
                    }
                    return;
                }
                Some(Some(TransportEvent::Initialized)) => {
                    transport.connect();
                }
                Some(Some(TransportEvent::Open)) => {
                    reporter.report(Attempt::Connected(OpenTransport { transport, events }));
                    return;
                }
                Some(Some(TransportEvent::Error(error))) => {
                    transport.close();
                    reporter.report(Attempt::Failed(error));
                    return;
                }
                Some(Some(TransportEvent::Closed(_)) | None) => {
                    reporter.report(Attempt::Failed(
                        TransportError::Closed {
                            transport: self.name.clone(),
                        }
                        .into(),
                    ));
                    return;
                }
                Some(Some(TransportEvent::Message(_))) => {}
            }
        }
    }
}
