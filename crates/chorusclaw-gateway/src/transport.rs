//! Channel transports: where human messages come from and replies go to.

use chorusclaw_agent::{MessageBus, TransportSink};
use chorusclaw_core::{InboundEvent, OutboundMessage, TransportError};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Reader = Box<dyn AsyncBufRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// A chat channel the gateway is attached to.
#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Sink the bus posts replies through.
    fn sink(&self) -> Arc<dyn TransportSink>;

    /// Whether the channel delivers bot posts back as inbound events. When it
    /// does not, the bus loops replies back to the other bots itself.
    fn echoes_bot_messages(&self) -> bool {
        false
    }

    /// Feed inbound events into `bus` until the source ends or `cancel` fires.
    async fn run(&self, bus: Arc<MessageBus>, cancel: CancellationToken)
        -> Result<(), TransportError>;
}

/// Local channel: each input line is a message from one human, replies are
/// printed as `[bot] text`.
pub struct ConsoleTransport {
    channel_id: String,
    human_name: String,
    reader: Mutex<Option<Reader>>,
    sink: Arc<ConsoleSink>,
}

impl ConsoleTransport {
    pub fn new(
        channel_id: impl Into<String>,
        human_name: impl Into<String>,
        reader: Reader,
        writer: Writer,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            human_name: human_name.into(),
            reader: Mutex::new(Some(reader)),
            sink: Arc::new(ConsoleSink {
                writer: Mutex::new(writer),
            }),
        }
    }

    pub fn stdio(channel_id: impl Into<String>, human_name: impl Into<String>) -> Self {
        Self::new(
            channel_id,
            human_name,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }
}

#[async_trait::async_trait]
impl ChannelTransport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    fn sink(&self) -> Arc<dyn TransportSink> {
        self.sink.clone()
    }

    async fn run(
        &self,
        bus: Arc<MessageBus>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let reader = self.reader.lock().await.take().ok_or(TransportError::Closed)?;
        let mut lines = reader.lines();
        let sender_id = format!("console:{}", self.human_name);
        info!(channel = %self.channel_id, "console transport reading");

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("console input closed");
                break;
            };
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let event = InboundEvent::human(&self.channel_id, &sender_id, &self.human_name, text);
            let deliveries = bus.publish_inbound(event);
            debug!(deliveries, "console message published");
        }
        Ok(())
    }
}

struct ConsoleSink {
    writer: Mutex<Writer>,
}

#[async_trait::async_trait]
impl TransportSink for ConsoleSink {
    async fn send(&self, msg: &OutboundMessage) -> Result<(), TransportError> {
        let line = format!("[{}] {}\n", msg.bot_name, msg.text);
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn console_lines_become_human_messages() {
        let (writer, _out) = tokio::io::duplex(1024);
        let transport = ConsoleTransport::new(
            "desk",
            "Ann",
            Box::new(std::io::Cursor::new(b"hello\n\n  \nsecond\n".to_vec())),
            Box::new(writer),
        );
        let bus = Arc::new(MessageBus::new(transport.sink(), 8));
        let mailbox = bus.subscribe("a");

        transport.run(bus.clone(), CancellationToken::new()).await.unwrap();

        let first = mailbox.try_recv().unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(first.sender_display_name, "Ann");
        assert_eq!(first.source_channel_id, "desk");
        assert!(first.is_human());
        assert_eq!(mailbox.try_recv().unwrap().text, "second");
        assert!(mailbox.try_recv().is_none());

        // The reader is consumed by the first run.
        let again = transport.run(bus, CancellationToken::new()).await;
        assert_eq!(again, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn sink_prints_bot_name_and_text() {
        let (writer, mut out) = tokio::io::duplex(1024);
        let transport = ConsoleTransport::new(
            "desk",
            "Ann",
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(writer),
        );
        transport
            .sink()
            .send(&OutboundMessage::new("analyst", "desk", "numbers look fine"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = out.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"[analyst] numbers look fine\n");
    }
}
