use async_trait::async_trait;
use log::info;
use tgs_engine_backend::{CancellationToken, EngineError, EventConsumer, EventType};

/// Event consumer for the standalone host: every event becomes a log line.
#[derive(Debug, Default)]
pub struct LogEventConsumer;

fn describe(args: &[Option<String>]) -> String {
    args.iter()
        .map(|arg| arg.as_deref().unwrap_or("(none)"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl EventConsumer for LogEventConsumer {
    async fn handle_event(
        &self,
        event: EventType,
        args: Vec<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        info!("Event {event}: {}", describe(&args));
        Ok(())
    }
}
