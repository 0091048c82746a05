use crate::utils::RelayError;

/// A relayed message: an ordered, non-empty list of frames.
///
/// The first frame is the topic used for subscription matching. The relay
/// never looks past it; every frame is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Vec<u8>>,
}

impl Message {
    /// Build a message from its frames.
    ///
    /// # Errors
    ///
    /// `EmptyMessage` when `frames` is empty.
    pub fn new(frames: Vec<Vec<u8>>) -> Result<Self, RelayError> {
        if frames.is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        Ok(Self { frames })
    }

    /// Convenience constructor for a topic plus payload frames.
    pub fn with_topic(topic: impl Into<Vec<u8>>, body: Vec<Vec<u8>>) -> Self {
        let mut frames = Vec::with_capacity(body.len() + 1);
        frames.push(topic.into());
        frames.extend(body);
        Self { frames }
    }

    pub fn topic(&self) -> &[u8] {
        &self.frames[0]
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }
}

/// Leading byte of a subscribe control frame.
pub const SUBSCRIBE: u8 = 1;
/// Leading byte of an unsubscribe control frame.
pub const UNSUBSCRIBE: u8 = 0;

/// A subscription control frame travelling from subscribers towards
/// publishers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Subscribe(Vec<u8>),
    Unsubscribe(Vec<u8>),
}

impl Directive {
    /// Interpret a backend message as a control frame.
    ///
    /// # Errors
    ///
    /// `MalformedControl` unless the message is a single frame starting with
    /// `1` or `0`.
    pub fn parse(message: &Message) -> Result<Self, RelayError> {
        let [frame] = message.frames() else {
            return Err(RelayError::MalformedControl(format!(
                "expected 1 frame, got {}",
                message.frames().len()
            )));
        };
        match frame.split_first() {
            Some((&SUBSCRIBE, prefix)) => Ok(Directive::Subscribe(prefix.to_vec())),
            Some((&UNSUBSCRIBE, prefix)) => Ok(Directive::Unsubscribe(prefix.to_vec())),
            Some((flag, _)) => Err(RelayError::MalformedControl(format!(
                "unknown flag byte {flag:#04x}"
            ))),
            None => Err(RelayError::MalformedControl("empty frame".to_string())),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        match self {
            Directive::Subscribe(prefix) | Directive::Unsubscribe(prefix) => prefix,
        }
    }

    /// The single-frame message carrying this directive.
    pub fn to_message(&self) -> Message {
        let (flag, prefix) = match self {
            Directive::Subscribe(prefix) => (SUBSCRIBE, prefix),
            Directive::Unsubscribe(prefix) => (UNSUBSCRIBE, prefix),
        };
        let mut frame = Vec::with_capacity(prefix.len() + 1);
        frame.push(flag);
        frame.extend_from_slice(prefix);
        Message { frames: vec![frame] }
    }
}
