//! Terminal stand-ins for the microphone and speaker.

use crate::runtime::ChatHandle;
use paco_core::voice::{AudioClip, AudioOutput, PlaybackError, RecognizerError, SpeechRecognizer};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes each clip to a directory instead of playing it, then reports the
/// clip as finished.
pub struct ClipFileOutput {
    dir: PathBuf,
    handle: ChatHandle,
    written: u64,
}

impl ClipFileOutput {
    pub fn new(dir: impl Into<PathBuf>, handle: ChatHandle) -> Self {
        Self {
            dir: dir.into(),
            handle,
            written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Picks a file extension from the clip's URL, falling back to sniffing the bytes.
fn extension(clip: &AudioClip) -> &'static str {
    let from_url = clip
        .source_url
        .as_deref()
        .and_then(|url| Path::new(url).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match from_url.as_deref() {
        Some("mp3") => return "mp3",
        Some("wav") => return "wav",
        Some("ogg") => return "ogg",
        _ => {}
    }
    match clip.bytes.as_slice() {
        [b'R', b'I', b'F', b'F', ..] => "wav",
        [b'O', b'g', b'g', b'S', ..] => "ogg",
        _ => "mp3",
    }
}

impl AudioOutput for ClipFileOutput {
    fn play(&mut self, clip: AudioClip) -> Result<(), PlaybackError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| PlaybackError::Unavailable(e.to_string()))?;
        let path = self
            .dir
            .join(format!("reply_{:04}.{}", self.written + 1, extension(&clip)));
        std::fs::write(&path, &clip.bytes).map_err(|e| PlaybackError::Unavailable(e.to_string()))?;
        self.written += 1;
        info!(path = %path.display(), bytes = clip.bytes.len(), "Saved assistant audio.");
        self.handle.playback_ended();
        Ok(())
    }

    fn stop(&mut self) {}
}

/// A recognizer for environments with no speech input. Calls fail fast.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedRecognizer;

impl SpeechRecognizer for UnsupportedRecognizer {
    fn is_supported(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<(), RecognizerError> {
        Err(RecognizerError::Failed(
            "no speech recognizer available".to_string(),
        ))
    }

    fn stop(&mut self) {}
}
