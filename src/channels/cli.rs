//! CLI channel — stdin/stdout REPL for local use.

use std::io::Write;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;

/// The one chat the CLI channel serves.
pub const CLI_CHAT: &str = "local";

/// Reads prompts from stdin and writes replies to stdout.
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }

    fn write_stdout(&self, text: &str) -> Result<(), ChannelError> {
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|e| ChannelError::SendFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            eprint!("> ");
                            continue;
                        }
                        let msg = IncomingMessage::new("cli", CLI_CHAT, &line);
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        destination: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        if destination != CLI_CHAT {
            return Err(ChannelError::UnknownDestination {
                name: self.name().to_string(),
                destination: destination.to_string(),
            });
        }
        self.write_stdout(&format!("\n{}\n\n", response.content))?;
        eprint!("> ");
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn send_chunk(&self, _destination: &str, chunk: &str) -> Result<(), ChannelError> {
        self.write_stdout(chunk)
    }

    async fn finish_stream(
        &self,
        _destination: &str,
        streamed: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let tail = match response.content.strip_prefix(streamed) {
            Some(rest) => format!("{rest}\n\n"),
            None => format!("\n{}\n\n", response.content),
        };
        self.write_stdout(&tail)?;
        eprint!("> ");
        Ok(())
    }

    async fn send_typing(&self, _destination: &str) -> Result<(), ChannelError> {
        eprintln!("⏳ thinking...");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_foreign_destination() {
        let cli = CliChannel::new();
        let err = cli
            .send("12345", OutgoingResponse::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownDestination { .. }));
    }

    #[test]
    fn streams() {
        assert!(CliChannel::new().supports_streaming());
    }
}
