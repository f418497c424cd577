use super::ledger::{
    parse_amount, AmountError, Cube, Ledger, LedgerError, SnapshotFormat, TransactionKind,
};
use super::network::message::{ChatMessage, Payload};
use super::network::plugin::{Plugin, PluginContext};
use async_trait::async_trait;
use log::{error, info, warn};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ReceiveError {
    #[error("malformed amount: {0}")]
    Amount(#[from] AmountError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Applies a `receive` transition for every inbound chat message.
pub struct ChatPlugin {
    ledger: Ledger,
    format: SnapshotFormat,
}

impl ChatPlugin {
    pub fn new(ledger: Ledger, format: SnapshotFormat) -> Self {
        Self { ledger, format }
    }

    /// Credits the ledger with the amount carried by `message`. Nothing is
    /// appended if the text is not an amount.
    pub async fn receive(&self, message: &ChatMessage) -> Result<Cube, ReceiveError> {
        let amount = parse_amount(&message.message)?;
        Ok(self.ledger.apply(TransactionKind::Receive, amount).await?)
    }
}

#[async_trait]
impl Plugin for ChatPlugin {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn on_receive(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        let message = match ctx.message() {
            Payload::Chat(message) => message,
            _ => return Ok(()),
        };
        let from = match ctx.sender_address() {
            Some(address) => address.to_string(),
            None => ctx.sender().to_string(),
        };

        info!("<{}> Received: {}", from, message.message);
        if !ctx.is_signed() {
            warn!("<{}> message is not signed by the sender", from);
        }

        match self.receive(message).await {
            Ok(_) => self.format.print(&self.ledger).await,
            Err(ReceiveError::Amount(e)) => {
                warn!("<{}> ignoring message, {}", from, e);
            }
            Err(ReceiveError::Ledger(e)) => {
                error!("<{}> ledger rejected transaction: {}", from, e);
            }
        }
        Ok(())
    }
}
