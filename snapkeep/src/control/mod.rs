//! Remote control of the managed server.
//!
//! Before a snapshot is taken the server is told to stop writing
//! (`save-off`), flush (`save-all`), and afterwards to resume (`save-on`).
//! [`ControlClient`] is the seam for that conversation; [`RconClient`]
//! speaks it over the Source RCON protocol.

pub mod rcon;

use async_trait::async_trait;

use crate::error::ControlError;

pub use self::rcon::{RconClient, RconConfig};

/// A command channel to the managed server.
#[async_trait]
pub trait ControlClient: Send {
    /// Sends one command and returns the server's reply text.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] if the command cannot be delivered or no
    /// valid reply arrives.
    async fn send_command(&mut self, command: &str) -> Result<String, ControlError>;

    /// Drops the current connection and establishes a new one.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] if the server cannot be reached or rejects
    /// the credentials.
    async fn reconnect(&mut self) -> Result<(), ControlError>;
}

#[async_trait]
impl<C: ControlClient + ?Sized> ControlClient for Box<C> {
    async fn send_command(&mut self, command: &str) -> Result<String, ControlError> {
        (**self).send_command(command).await
    }

    async fn reconnect(&mut self) -> Result<(), ControlError> {
        (**self).reconnect().await
    }
}
