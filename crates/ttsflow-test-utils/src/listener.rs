use std::sync::{Arc, Mutex, PoisonError};
use ttsflow::{EventKind, SpeechEvent, TtsEngine};

/// Collects every event delivered to it
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<SpeechEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for all event kinds on `engine`
    pub fn attach(&self, engine: &mut TtsEngine) {
        let events = self.events.clone();
        engine.on_any(
            &[EventKind::Started, EventKind::Word, EventKind::Ended],
            move |event| {
                events
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.clone())
            },
        );
    }

    pub fn events(&self) -> Vec<SpeechEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(SpeechEvent::kind).collect()
    }

    /// Words in delivery order
    pub fn words(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SpeechEvent::Word { word, .. } => Some(word),
                _ => None,
            })
            .collect()
    }
}
