/*!
 # Transports

 A [`Transport`] delivers commands to one device. Both implementations are
 fire-and-forget: a successful `send` means the local stack accepted the
 write, not that the bulb applied it.
*/

use std::time::Duration;

use async_trait::async_trait;

use crate::command::Command;
use crate::device::Device;
use crate::mapping::ChannelMapping;
use crate::{Error, Result};

pub mod ble;
pub mod lan;

/// Connect, send and disconnect for a single device
#[async_trait]
pub trait Transport: Send {
    /// The device this transport talks to
    fn device(&self) -> &Device;

    /// Opens the session, failing with a [`crate::ConnectError`] once `timeout` elapses
    async fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Sends one command; color commands are passed through `mapping` first
    async fn send(&mut self, command: &Command, mapping: ChannelMapping) -> Result<()>;

    /// Sends an arbitrary opcode and payload, for probing unknown encodings
    async fn send_raw(&mut self, opcode: u8, _payload: &[u8]) -> Result<()> {
        Err(Error::NotSupported(format!(
            "raw opcode {opcode:#04x} on {}",
            self.device()
        )))
    }

    /// Closes the session; closing an already closed transport is a no-op
    async fn disconnect(&mut self) -> Result<()>;
}
