use super::config::resolve_recipient;
use super::ledger::{
    parse_amount, AmountError, Cube, Ledger, LedgerError, SnapshotFormat, TransactionKind,
};
use super::network::message::ChatMessage;
use super::network::{NetworkHandle, SendContext};
use async_trait::async_trait;
use log::{error, info, warn};
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt};

/// One operator line: `<recipient> <amount>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommand {
    pub recipient: String,
    pub text: String,
    pub amount: u64,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("expected `<recipient> <amount>`, got only `{0}`")]
    MissingAmount(String),
    #[error("expected `<recipient> <amount>`, found extra `{0}`")]
    UnexpectedToken(String),
    #[error("malformed amount: {0}")]
    Amount(#[from] AmountError),
    #[error("message to {recipient} was not sent: {source:#}")]
    Send {
        recipient: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("message to {recipient} was delivered but not recorded: {source}")]
    Unrecorded {
        recipient: String,
        #[source]
        source: LedgerError,
    },
}

/// `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<SendCommand>, CommandError> {
    let mut tokens = line.split_whitespace();
    let recipient = match tokens.next() {
        Some(r) => r,
        None => return Ok(None),
    };
    let text = tokens
        .next()
        .ok_or_else(|| CommandError::MissingAmount(recipient.to_string()))?;
    if let Some(extra) = tokens.next() {
        return Err(CommandError::UnexpectedToken(extra.to_string()));
    }
    let amount = parse_amount(text)?;

    Ok(Some(SendCommand {
        recipient: recipient.to_string(),
        text: text.to_string(),
        amount,
    }))
}

/// Outbound side of the session.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// How this node names itself in logs
    fn local_name(&self) -> String;

    /// Resolves `recipient` and delivers a signed `message`.
    async fn send_chat(&self, recipient: &str, message: &ChatMessage) -> anyhow::Result<()>;
}

/// [`ChatTransport`] over the running network.
pub struct NetworkTransport {
    network: NetworkHandle,
    recipient_host: String,
}

impl NetworkTransport {
    pub fn new(network: NetworkHandle, recipient_host: impl Into<String>) -> Self {
        Self {
            network,
            recipient_host: recipient_host.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for NetworkTransport {
    fn local_name(&self) -> String {
        self.network.peer_id().to_string()
    }

    async fn send_chat(&self, recipient: &str, message: &ChatMessage) -> anyhow::Result<()> {
        let address = resolve_recipient(recipient, &self.recipient_host);
        let client = self.network.client(&address).await?;
        client.tell(SendContext::signed(), message).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Sent(Cube),
}

/// Drives sends from operator input against the node's ledger.
pub struct Session<T> {
    ledger: Ledger,
    transport: T,
    format: SnapshotFormat,
}

impl<T: ChatTransport> Session<T> {
    pub fn new(ledger: Ledger, transport: T, format: SnapshotFormat) -> Self {
        Self {
            ledger,
            transport,
            format,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn handle_line(&self, line: &str) -> Result<Outcome, CommandError> {
        let command = match parse_command(line)? {
            Some(command) => command,
            None => return Ok(Outcome::Skipped),
        };

        // refuse before sending anything the ledger could not record; a
        // concurrent send recorded while this one is in flight can still push
        // the balance out of range, which surfaces as `Unrecorded`
        self.ledger
            .last()
            .await
            .apply_transaction(TransactionKind::Send, command.amount)?;

        let message = ChatMessage {
            message: command.text.clone(),
        };
        self.transport
            .send_chat(&command.recipient, &message)
            .await
            .map_err(|source| CommandError::Send {
                recipient: command.recipient.clone(),
                source,
            })?;
        info!("<{}> Sent: {}", self.transport.local_name(), command.text);

        let cube = match self.ledger.apply(TransactionKind::Send, command.amount).await {
            Ok(cube) => cube,
            Err(source) => {
                error!(
                    "<{}> delivered {} but the ledger refused it: {}",
                    command.recipient, command.text, source
                );
                return Err(CommandError::Unrecorded {
                    recipient: command.recipient,
                    source,
                });
            }
        };
        self.format.print(&self.ledger).await;
        Ok(Outcome::Sent(cube))
    }

    /// Handles lines until `reader` hits EOF. Bad lines are reported and
    /// skipped.
    pub async fn run<R: AsyncBufRead + Unpin>(&self, reader: R) -> io::Result<()> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if let Err(e) = self.handle_line(&line).await {
                warn!("{}", e);
            }
        }
        Ok(())
    }
}
