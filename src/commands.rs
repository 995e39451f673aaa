//! Command surface handed to the UI

use tokio::sync::{mpsc, watch};

use crate::controller::{Command, Input, Snapshot};
use crate::{Error, Result};

/// Cloneable handle for issuing commands and reading the session snapshot
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    pub fn new(
        inputs: mpsc::UnboundedSender<Input>,
        snapshots: watch::Receiver<Snapshot>,
    ) -> Self {
        Self { inputs, snapshots }
    }

    /// Join the match queue
    pub fn find_match(&self) -> Result<()> {
        self.command(Command::FindMatch)
    }

    /// Leave the current partner
    pub fn next(&self) -> Result<()> {
        self.command(Command::Next)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.command(Command::SendChat(text.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Waits until the snapshot satisfies `pred`
    pub async fn wait_for<F>(&self, pred: F) -> Result<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map_err(|_| Error::Channel("session controller stopped".to_string()))?;
        Ok(snapshot.clone())
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inputs
            .send(Input::Command(command))
            .map_err(|_| Error::Channel("session controller stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_are_queued_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_snap_tx, snap_rx) = watch::channel(Snapshot::default());
        let handle = SessionHandle::new(tx, snap_rx);

        handle.find_match().unwrap();
        handle.send_chat("hello").unwrap();
        handle.next().unwrap();

        let mut seen = Vec::new();
        while let Ok(Input::Command(cmd)) = rx.try_recv() {
            seen.push(cmd);
        }
        assert_eq!(
            seen,
            vec![
                Command::FindMatch,
                Command::SendChat("hello".into()),
                Command::Next
            ]
        );
    }

    #[tokio::test]
    async fn test_command_after_controller_stopped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_snap_tx, snap_rx) = watch::channel(Snapshot::default());
        drop(rx);
        let handle = SessionHandle::new(tx, snap_rx);
        assert!(matches!(handle.find_match(), Err(Error::Channel(_))));
    }
}
