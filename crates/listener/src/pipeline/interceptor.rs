use async_trait::async_trait;

use super::{BoxError, ListenerExecutionFailed};
use crate::message::Message;

/// Hooks around listener invocation
///
/// Before-processing hooks may transform messages or filter them out by
/// returning `None` (or an empty batch), which skips the listener and the
/// acknowledgement. An error fails the invocation like a listener error.
#[async_trait]
pub trait MessageInterceptor: Send + Sync {
    /// Intercept a single message before the listener
    async fn intercept(&self, message: Message) -> Result<Option<Message>, BoxError> {
        Ok(Some(message))
    }

    /// Intercept a batch before the listener
    ///
    /// Defaults to [`intercept`](Self::intercept) for each message, keeping
    /// the ones not filtered out.
    async fn intercept_batch(&self, messages: Vec<Message>) -> Result<Vec<Message>, BoxError> {
        let mut kept = Vec::with_capacity(messages.len());
        for message in messages {
            if let Some(message) = self.intercept(message).await? {
                kept.push(message);
            }
        }
        Ok(kept)
    }

    /// Called after the listener and the error handler
    async fn after_processing(
        &self,
        _messages: &[Message],
        _error: Option<&ListenerExecutionFailed>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropOdd;

    #[async_trait]
    impl MessageInterceptor for DropOdd {
        async fn intercept(&self, message: Message) -> Result<Option<Message>, BoxError> {
            let n: u32 = message.body.parse()?;
            Ok((n % 2 == 0).then_some(message))
        }
    }

    #[tokio::test]
    async fn test_batch_interception_defaults_to_single() {
        let batch = (1..=4)
            .map(|i| Message::new(format!("m{}", i), "q", i.to_string()))
            .collect();
        let kept = DropOdd.intercept_batch(batch).await.unwrap();
        let ids: Vec<&str> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m4"]);
    }

    #[tokio::test]
    async fn test_interceptor_error_propagates() {
        let result = DropOdd
            .intercept_batch(vec![Message::new("m1", "q", "not a number")])
            .await;
        assert!(result.is_err());
    }
}
