//! Hands part bodies to an external consumer, one acknowledged chunk at a time.

use std::io;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{until_cancelled, PartPayload};
use crate::descriptor::PartDescriptor;
use crate::Part;

/// What a pass-through consumer observes for each part.
#[derive(Debug, Clone, PartialEq)]
pub enum PartEvent {
    /// A new part begins.
    Start(PartDescriptor),
    /// The next chunk of the current part's body.
    Data(Bytes),
    /// The current part reached its closing delimiter.
    End(PartDescriptor),
}

#[derive(Debug)]
enum Message {
    Start(PartDescriptor),
    Data(Bytes, oneshot::Sender<()>),
    End(PartDescriptor),
}

/// Creates a connected sender/receiver pair.
///
/// At most one chunk is in flight: the producing session waits until the receiver has taken
/// the previous one before reading further from the body.
pub fn channel() -> (PassthroughSender, PassthroughReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (PassthroughSender { tx }, PassthroughReceiver { rx })
}

/// The producing half, handed to the session through [`SinkKind::Passthrough`](super::SinkKind).
#[derive(Debug, Clone)]
pub struct PassthroughSender {
    tx: mpsc::Sender<Message>,
}

/// The consuming half.
#[derive(Debug)]
pub struct PassthroughReceiver {
    rx: mpsc::Receiver<Message>,
}

impl PassthroughReceiver {
    /// Waits for the next event. Receiving a [`PartEvent::Data`] acknowledges it.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<PartEvent> {
        let event = match self.rx.recv().await? {
            Message::Start(descriptor) => PartEvent::Start(descriptor),
            Message::Data(bytes, ack) => {
                let _ = ack.send(());
                PartEvent::Data(bytes)
            }
            Message::End(descriptor) => PartEvent::End(descriptor),
        };

        Some(event)
    }
}

/// Forwards a part to a [`PassthroughReceiver`].
#[derive(Debug)]
pub struct PassthroughSink {
    sender: Option<PassthroughSender>,
    cancellation: CancellationToken,
}

impl PassthroughSink {
    pub fn new(sender: PassthroughSender, cancellation: CancellationToken) -> Self {
        PassthroughSink {
            sender: Some(sender),
            cancellation,
        }
    }

    pub async fn accept(&mut self, part: &mut Part<'_>) -> crate::Result<PartPayload> {
        let tx = match self.sender.as_ref() {
            Some(sender) => sender.tx.clone(),
            None => return Err(consumer_gone(part.name())),
        };

        self.deliver(&tx, Message::Start(part.descriptor().clone()), part.name())
            .await?;

        let mut size = 0;
        while let Some(chunk) = part.chunk().await? {
            let len = chunk.len() as u64;
            let (ack_tx, ack_rx) = oneshot::channel();

            self.deliver(&tx, Message::Data(chunk, ack_tx), part.name()).await?;
            until_cancelled(&self.cancellation, ack_rx).await?.map_err(|_| consumer_gone(part.name()))?;

            size += len;
        }

        self.deliver(&tx, Message::End(part.descriptor().clone()), part.name())
            .await?;

        log::debug!("part '{}' passed through ({} bytes)", part.name(), size);

        Ok(PartPayload::Drained { size })
    }

    /// Detaches from the consumer. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.sender.take();
    }

    async fn deliver(&self, tx: &mpsc::Sender<Message>, message: Message, name: &str) -> crate::Result<()> {
        until_cancelled(&self.cancellation, tx.send(message))
            .await?
            .map_err(|_| consumer_gone(name))
    }
}

fn consumer_gone(name: &str) -> crate::Error {
    crate::Error::write_failure(
        Some(name),
        None,
        io::Error::new(io::ErrorKind::BrokenPipe, "pass-through consumer went away"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Multipart;
    use futures_util::stream;

    fn multipart(chunk_size: usize) -> Multipart<'static> {
        let data = "--X\r\nContent-Disposition: form-data; name=\"log\"\r\n\r\nline one\r\nline two\r\n--X--\r\n";
        let chunks: Vec<crate::Result<Bytes>> = data
            .as_bytes()
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Multipart::new(stream::iter(chunks), "X")
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let (tx, mut rx) = channel();
        let consumer = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let mut m = multipart(7);
        let mut part = m.next_part().await.unwrap().unwrap();
        let mut sink = PassthroughSink::new(tx, CancellationToken::new());

        match sink.accept(&mut part).await.unwrap() {
            PartPayload::Drained { size } => assert_eq!(size, 18),
            other => panic!("unexpected payload {:?}", other),
        }
        sink.close();
        sink.close();
        drop(part);
        drop(m);

        let events = consumer.await.unwrap();
        assert!(matches!(events.first(), Some(PartEvent::Start(d)) if d.name() == "log"));
        assert!(matches!(events.last(), Some(PartEvent::End(d)) if d.size() == 18));

        let body: Vec<u8> = events
            .iter()
            .filter_map(|event| match event {
                PartEvent::Data(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"line one\r\nline two");
    }

    #[tokio::test]
    async fn test_consumer_gone() {
        let (tx, rx) = channel();
        drop(rx);

        let mut m = multipart(64);
        let mut part = m.next_part().await.unwrap().unwrap();
        let mut sink = PassthroughSink::new(tx, CancellationToken::new());

        match sink.accept(&mut part).await {
            Err(crate::Error::WriteFailure { cause, .. }) => assert_eq!(cause.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_consumer() {
        let (tx, _rx) = channel();
        let token = CancellationToken::new();

        let mut m = multipart(64);
        let mut part = m.next_part().await.unwrap().unwrap();
        let mut sink = PassthroughSink::new(tx, token.clone());

        // The first event fills the channel, the next send waits on a consumer that never reads.
        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            token.cancel();
        });

        assert_eq!(sink.accept(&mut part).await.unwrap_err(), crate::Error::Cancelled);
        canceller.await.unwrap();
    }
}
