use std::collections::BTreeSet;

use crate::models::message::Message;

/// The append-only conversation log of one agent session.
///
/// Index 0 always holds the system message. Messages are never removed or reordered,
/// so the parent of a message is simply the one stored right before it.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    /// Start a history from its system message
    pub fn new<S: Into<String>>(system: S) -> Self {
        Self {
            messages: vec![Message::system(system)],
        }
    }

    /// Start a history from its system message followed by seed messages
    pub fn with_messages<S, I>(system: S, messages: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Message>,
    {
        let mut history = Self::new(system);
        for message in messages {
            history.push(message);
        }
        history
    }

    /// Append a message and return its index
    pub fn push(&mut self, message: Message) -> usize {
        debug_assert!(
            !matches!(message, Message::System { .. }),
            "a history holds exactly one system message"
        );
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: the system message is present from construction
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn last(&self) -> &Message {
        // index 0 is populated in every constructor
        &self.messages[self.messages.len() - 1]
    }

    /// The message that preceded `index` when it was appended
    pub fn parent(&self, index: usize) -> Option<&Message> {
        if index == 0 || index >= self.messages.len() {
            return None;
        }
        self.messages.get(index - 1)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Indices of the messages sent to the completion service.
    ///
    /// Keeps the system message, the `keep_first` messages after it and the last `keep_last`
    /// messages. The result is ascending and free of duplicates.
    pub fn window(&self, keep_first: usize, keep_last: usize) -> Vec<usize> {
        select_window(self.messages.len(), keep_first, keep_last)
    }

    /// Clone out the messages selected by [`History::window`]
    pub fn windowed(&self, keep_first: usize, keep_last: usize) -> Vec<Message> {
        self.window(keep_first, keep_last)
            .into_iter()
            .map(|index| self.messages[index].clone())
            .collect()
    }
}

fn select_window(len: usize, keep_first: usize, keep_last: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut keep = BTreeSet::new();
    keep.insert(0);
    keep.extend(1..len.min(keep_first.saturating_add(1)));
    keep.extend(len.saturating_sub(keep_last)..len);
    keep.into_iter().collect()
}
