//! Channel-backed completion reporter.

use futures::channel::mpsc;

/// Forwards completed-transfer notifications to a channel.
#[derive(Clone)]
pub struct Reporter {
    sender: mpsc::UnboundedSender<u64>,
}

impl Reporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    /// A reporter whose notifications go nowhere.
    pub fn dummy() -> Self {
        let (sender, _) = mpsc::unbounded();
        Self { sender }
    }
}

impl crate::Reporter for Reporter {
    async fn transfer_complete(&mut self, checkpoint: u64) {
        let _ = self.sender.unbounded_send(checkpoint);
    }
}
