use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::trace;

use super::{MessageSink, SinkCompletion};
use crate::message::Message;
use crate::pipeline::ProcessingContext;

type GroupCompletion = Shared<BoxFuture<'static, ()>>;

/// Splits batches by message group and emits each group to the delegate
///
/// A group's sub-batch is emitted only after the previous sub-batch of the
/// same group completed, including sub-batches of earlier polls. Different
/// groups run in parallel.
pub struct MessageGroupingSinkAdapter {
    delegate: Arc<dyn MessageSink>,
    in_progress: Mutex<HashMap<String, GroupCompletion>>,
}

impl MessageGroupingSinkAdapter {
    pub fn new(delegate: Arc<dyn MessageSink>) -> Self {
        Self {
            delegate,
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    /// Groups with a sub-batch still being processed
    pub fn groups_in_progress(&self) -> usize {
        let mut in_progress = self.in_progress.lock();
        in_progress.retain(|_, completion| completion.peek().is_none());
        in_progress.len()
    }
}

fn partition(messages: Vec<Message>) -> Vec<(String, Vec<Message>)> {
    let mut groups: Vec<(String, Vec<Message>)> = Vec::new();
    for message in messages {
        let key = message.group_key().to_string();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(message),
            None => groups.push((key, vec![message])),
        }
    }
    groups
}

impl MessageSink for MessageGroupingSinkAdapter {
    fn emit(&self, messages: Vec<Message>, context: ProcessingContext) -> SinkCompletion {
        let groups = partition(messages);
        trace!(groups = groups.len(), "emitting message groups");

        let mut in_progress = self.in_progress.lock();
        in_progress.retain(|_, completion| completion.peek().is_none());

        let completions: Vec<GroupCompletion> = groups
            .into_iter()
            .map(|(key, group)| {
                let previous = in_progress.get(&key).cloned();
                let delegate = Arc::clone(&self.delegate);
                let context = context.clone();
                let completion = async move {
                    if let Some(previous) = previous {
                        previous.await;
                    }
                    delegate.emit(group, context).await;
                }
                .boxed()
                .shared();
                tokio::spawn(completion.clone());
                in_progress.insert(key, completion.clone());
                completion
            })
            .collect();

        async move {
            join_all(completions).await;
        }
        .boxed()
    }

    fn start(&self) {
        self.delegate.start();
    }

    fn stop(&self) {
        self.delegate.stop();
    }

    fn is_running(&self) -> bool {
        self.delegate.is_running()
    }
}
