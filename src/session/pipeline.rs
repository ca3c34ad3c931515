//! Bidirectional packet interception.
//!
//! A pipeline owns one stream direction for one session. Components tap the
//! stream by message code (or a predicate over codes) and arbitrate each
//! matching message with a disposition: pass it through, drop it, or
//! replace it. Messages inside a packet keep their order; a tap that does
//! not answer within the timeout passes the message and is reported, so one
//! stuck subscriber cannot stall the stream.

use skirmish_proto::messages::MessageError;
use skirmish_proto::{messages, GamePacket, Message, MessageCode};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

const TAP_QUEUE_DEPTH: usize = 16;
const TAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::ClientToServer => "client -> server",
            Self::ServerToClient => "server -> client",
        }
    }
}

/// What a tap decided to do with a message.
#[derive(Debug)]
pub enum Disposition {
    Pass,
    Drop,
    Replace(Message),
}

/// A message suspended in the pipeline, waiting on its tap.
#[derive(Debug)]
pub struct InterceptedMessage {
    pub message: Message,
    pub channel: u8,
    responder: oneshot::Sender<Disposition>,
}

impl InterceptedMessage {
    /// Forward the message unchanged.
    pub fn pass(self) {
        let _ = self.responder.send(Disposition::Pass);
    }

    /// Swallow the message.
    pub fn discard(self) {
        let _ = self.responder.send(Disposition::Drop);
    }

    /// Forward a different message in its place.
    pub fn replace(self, message: Message) {
        let _ = self.responder.send(Disposition::Replace(message));
    }
}

type Predicate = Box<dyn Fn(MessageCode) -> bool + Send + Sync>;

enum Matcher {
    Codes(Vec<MessageCode>),
    Predicate(Predicate),
}

impl Matcher {
    fn matches(&self, code: MessageCode) -> bool {
        match self {
            Self::Codes(codes) => codes.contains(&code),
            Self::Predicate(predicate) => predicate(code),
        }
    }
}

struct Tap {
    matcher: Matcher,
    sender: mpsc::Sender<InterceptedMessage>,
}

/// One direction's interception pipeline.
pub struct Pipeline {
    direction: Direction,
    taps: StdMutex<Vec<Tap>>,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            taps: StdMutex::new(Vec::new()),
            timeout: TAP_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(direction: Direction, timeout: Duration) -> Self {
        Self {
            direction,
            taps: StdMutex::new(Vec::new()),
            timeout,
        }
    }

    /// Subscribe to a fixed set of message codes. The subscription ends
    /// when the receiver is dropped.
    pub fn intercept(&self, codes: &[MessageCode]) -> mpsc::Receiver<InterceptedMessage> {
        self.install(Matcher::Codes(codes.to_vec()))
    }

    /// Subscribe to every code matching a predicate.
    pub fn intercept_with<F>(&self, predicate: F) -> mpsc::Receiver<InterceptedMessage>
    where
        F: Fn(MessageCode) -> bool + Send + Sync + 'static,
    {
        self.install(Matcher::Predicate(Box::new(predicate)))
    }

    fn install(&self, matcher: Matcher) -> mpsc::Receiver<InterceptedMessage> {
        let (sender, receiver) = mpsc::channel(TAP_QUEUE_DEPTH);
        self.taps.lock().unwrap().push(Tap { matcher, sender });
        receiver
    }

    fn matching_sender(&self, code: MessageCode) -> Option<mpsc::Sender<InterceptedMessage>> {
        let mut taps = self.taps.lock().unwrap();
        taps.retain(|tap| !tap.sender.is_closed());
        taps.iter()
            .find(|tap| tap.matcher.matches(code))
            .map(|tap| tap.sender.clone())
    }

    /// Run one message through interception. `None` means it was dropped.
    pub async fn process(&self, channel: u8, message: Message) -> Option<Message> {
        let code = message.code();
        let sender = match self.matching_sender(code) {
            Some(sender) => sender,
            None => return Some(message),
        };

        let (responder, response) = oneshot::channel();
        let intercepted = InterceptedMessage {
            message: message.clone(),
            channel,
            responder,
        };

        let exchange = async {
            sender.send(intercepted).await.ok()?;
            response.await.ok()
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Some(Disposition::Pass)) => Some(message),
            Ok(Some(Disposition::Drop)) => None,
            Ok(Some(Disposition::Replace(replacement))) => Some(replacement),
            // Tap vanished mid-flight; the message goes through.
            Ok(None) => Some(message),
            Err(_) => {
                error!(
                    direction = self.direction.label(),
                    code = ?code,
                    "tap did not respond, passing message"
                );
                Some(message)
            }
        }
    }

    /// Decode a whole packet, intercept each message in order, and
    /// re-encode the survivors. `None` means every message was dropped.
    pub async fn process_packet(
        &self,
        packet: &GamePacket,
    ) -> Result<Option<GamePacket>, MessageError> {
        let decoded = messages::decode(&packet.data)?;
        let mut survivors = Vec::with_capacity(decoded.len());
        for message in decoded {
            if let Some(message) = self.process(packet.channel, message).await {
                survivors.push(message);
            }
        }
        if survivors.is_empty() {
            return Ok(None);
        }
        Ok(Some(GamePacket::new(
            packet.channel,
            messages::encode_all(&survivors),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(text: &str) -> Message {
        Message::Text { text: text.into() }
    }

    #[tokio::test]
    async fn untapped_messages_pass_unchanged() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let message = text("hello");
        assert_eq!(pipeline.process(1, message.clone()).await, Some(message));
    }

    #[tokio::test]
    async fn untapped_packet_is_byte_identical() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let batch = vec![
            Message::Welcome,
            text("hi"),
            Message::ClientPing { ping: 20 },
        ];
        let packet = GamePacket::new(1, messages::encode_all(&batch));
        let out = pipeline.process_packet(&packet).await.unwrap().unwrap();
        assert_eq!(out, packet);
    }

    #[tokio::test]
    async fn tap_can_drop_and_replace() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let mut tap = pipeline.intercept(&[MessageCode::Text]);

        tokio::spawn(async move {
            while let Some(intercepted) = tap.recv().await {
                match &intercepted.message {
                    Message::Text { text } if text.starts_with('#') => intercepted.discard(),
                    Message::Text { text } => {
                        let replacement = Message::Text {
                            text: text.to_uppercase(),
                        };
                        intercepted.replace(replacement);
                    }
                    _ => intercepted.pass(),
                }
            }
        });

        assert_eq!(pipeline.process(1, text("#join lobby")).await, None);
        assert_eq!(pipeline.process(1, text("gg")).await, Some(text("GG")));
        // Non-matching codes never reach the tap.
        assert_eq!(
            pipeline.process(1, Message::Welcome).await,
            Some(Message::Welcome)
        );
    }

    #[tokio::test]
    async fn predicate_taps_match_code_classes() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let mut tap = pipeline.intercept_with(|code| code.is_edit());
        tokio::spawn(async move {
            while let Some(intercepted) = tap.recv().await {
                intercepted.discard();
            }
        });

        assert_eq!(pipeline.process(1, Message::Remip).await, None);
        assert_eq!(
            pipeline.process(1, text("still here")).await,
            Some(text("still here"))
        );
    }

    #[tokio::test]
    async fn first_matching_tap_wins() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let mut first = pipeline.intercept(&[MessageCode::Text]);
        let mut second = pipeline.intercept(&[MessageCode::Text]);

        tokio::spawn(async move {
            while let Some(intercepted) = first.recv().await {
                intercepted.discard();
            }
        });

        assert_eq!(pipeline.process(1, text("eaten")).await, None);
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn unresponsive_tap_passes_after_timeout() {
        let pipeline =
            Pipeline::with_timeout(Direction::ServerToClient, Duration::from_millis(20));
        let mut tap = pipeline.intercept(&[MessageCode::Text]);
        // Receive but never respond.
        tokio::spawn(async move {
            let held = tap.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        assert_eq!(pipeline.process(1, text("slow")).await, Some(text("slow")));
    }

    #[tokio::test]
    async fn dropped_tap_stops_matching() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let tap = pipeline.intercept(&[MessageCode::Text]);
        drop(tap);
        assert_eq!(pipeline.process(1, text("ok")).await, Some(text("ok")));
    }

    #[tokio::test]
    async fn packet_counts_balance() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let mut tap = pipeline.intercept(&[MessageCode::Sound]);
        tokio::spawn(async move {
            while let Some(intercepted) = tap.recv().await {
                intercepted.discard();
            }
        });

        let batch = vec![
            text("a"),
            Message::Sound { sound: 1 },
            text("b"),
            Message::Sound { sound: 2 },
        ];
        let packet = GamePacket::new(1, messages::encode_all(&batch));
        let out = pipeline.process_packet(&packet).await.unwrap().unwrap();
        let decoded = messages::decode(&out.data).unwrap();
        // decoded(4) - dropped(2) = 2, order preserved
        assert_eq!(decoded, vec![text("a"), text("b")]);
    }

    #[tokio::test]
    async fn fully_dropped_packet_yields_nothing() {
        let pipeline = Pipeline::new(Direction::ClientToServer);
        let mut tap = pipeline.intercept(&[MessageCode::Text]);
        tokio::spawn(async move {
            while let Some(intercepted) = tap.recv().await {
                intercepted.discard();
            }
        });

        let packet = GamePacket::new(1, messages::encode_all(&[text("bye")]));
        assert_eq!(pipeline.process_packet(&packet).await.unwrap(), None);
    }
}
