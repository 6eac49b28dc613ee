use std::sync::Arc;

use lapin::BasicProperties;
use tracing::error;

/// Everything a reporter gets to see about a failed handler invocation.
pub struct HandlerFailure<'a> {
    pub consumer: &'a str,
    pub properties: &'a BasicProperties,
    pub payload: &'a [u8],
    pub error: &'a anyhow::Error,
}

/// Consulted for telemetry only: reporters never influence acknowledgement.
pub trait ErrorReporter: Send + Sync {
    fn handler_error(&self, failure: &HandlerFailure<'_>) -> Result<(), anyhow::Error>;

    /// Connection-level close frames reported by the adapter.
    fn connection_error(&self, _error: &lapin::Error) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Default reporter: structured error logs.
pub struct LoggingReporter;

impl ErrorReporter for LoggingReporter {
    fn handler_error(&self, failure: &HandlerFailure<'_>) -> Result<(), anyhow::Error> {
        error!(
            consumer = %failure.consumer,
            message_id = ?failure.properties.message_id(),
            payload_bytes = failure.payload.len(),
            error = ?failure.error,
            "handler failed"
        );
        Ok(())
    }

    fn connection_error(&self, error: &lapin::Error) -> Result<(), anyhow::Error> {
        match error {
            lapin::Error::ProtocolError(frame) => error!(
                reply_code = frame.get_id(),
                reply_text = %frame.get_message(),
                "broker closed the connection"
            ),
            other => error!(error = %other, "connection error"),
        }
        Ok(())
    }
}

/// Fans a handler failure out to every reporter.
///
/// A reporter failing is logged and ignored so it can never affect the
/// acknowledgement of the message it was told about.
pub fn report_handler_failure(reporters: &[Arc<dyn ErrorReporter>], failure: &HandlerFailure<'_>) {
    for reporter in reporters {
        if let Err(error) = reporter.handler_error(failure) {
            error!(?error, "error reporter failed");
        }
    }
}

/// Same containment rule for connection-level reports.
pub fn report_connection_error(reporters: &[Arc<dyn ErrorReporter>], connection_error: &lapin::Error) {
    for reporter in reporters {
        if let Err(error) = reporter.connection_error(connection_error) {
            error!(?error, "error reporter failed");
        }
    }
}
