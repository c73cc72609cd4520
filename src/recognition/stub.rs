use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use super::RecognitionClient;
use crate::detection::{BoundingBox, Detection};
use crate::error::{DetectionError, RecognitionError};

/// Shared record of every image a [`ScriptedRecognizer`] received.
#[derive(Clone, Default)]
pub struct CallLog {
    images: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CallLog {
    fn record(&self, image: &[u8]) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image.to_vec());
    }

    pub fn len(&self) -> usize {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> Vec<Vec<u8>> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Offline recognizer that replays a fixed script of responses.
///
/// Once the script runs out it either cycles through `repeat` or answers with
/// no faces.
pub struct ScriptedRecognizer {
    script: VecDeque<Result<Vec<Detection>, RecognitionError>>,
    repeat: Vec<Vec<Detection>>,
    cursor: usize,
    calls: CallLog,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<Result<Vec<Detection>, RecognitionError>>) -> Self {
        Self {
            script: script.into(),
            repeat: Vec::new(),
            cursor: 0,
            calls: CallLog::default(),
        }
    }

    pub fn cycle(responses: Vec<Vec<Detection>>) -> Self {
        Self {
            repeat: responses,
            ..Self::new(Vec::new())
        }
    }

    /// Scripted responses for `stub://` runs: a recurring student, an
    /// unknown face, an empty frame, and a staff member seen with a student.
    pub fn demo() -> Result<Self, DetectionError> {
        let left = BoundingBox::new(80, 60, 240, 260)?;
        let right = BoundingBox::new(360, 80, 520, 280)?;
        Ok(Self::cycle(vec![
            vec![Detection::with_match(left, "Doe, Jane (000042) [7]", 0.93)?],
            vec![Detection::unmatched(right)],
            Vec::new(),
            vec![
                Detection::with_match(left, "Doe, Jane (000042) [7]", 0.88)?,
                Detection::with_match(right, "Smith, Alex (1207) [T]", 0.91)?,
            ],
        ]))
    }

    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }
}

impl RecognitionClient for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn recognize(&mut self, image: &[u8]) -> Result<Vec<Detection>, RecognitionError> {
        self.calls.record(image);
        if let Some(next) = self.script.pop_front() {
            return next;
        }
        if self.repeat.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.repeat[self.cursor % self.repeat.len()].clone();
        self.cursor += 1;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_script_then_goes_quiet() {
        let mut recognizer = ScriptedRecognizer::new(vec![
            Ok(vec![Detection::unmatched(BoundingBox::new(0, 0, 1, 1).unwrap())]),
            Err(RecognitionError::transport("down")),
        ]);
        let log = recognizer.call_log();
        assert_eq!(recognizer.recognize(b"a").unwrap().len(), 1);
        assert!(recognizer.recognize(b"b").unwrap_err().is_transport());
        assert!(recognizer.recognize(b"c").unwrap().is_empty());
        assert_eq!(log.images(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn demo_cycles() {
        let mut recognizer = ScriptedRecognizer::demo().unwrap();
        let first = recognizer.recognize(b"x").unwrap();
        for _ in 0..3 {
            recognizer.recognize(b"x").unwrap();
        }
        assert_eq!(recognizer.recognize(b"x").unwrap(), first);
    }
}
