//! A scripted student driving the editor UI.

use serde::{Deserialize, Serialize};

use quill_core::FileMap;

use crate::rng::SimRng;

pub const MAIN_FILE: &str = "main.py";
pub const HELPER_FILE: &str = "util.py";

const ALPHABET: &[char] = &['a', 'b', 'c', 'x', ' ', '(', ')', ':', '\n', 'é'];

/// One UI interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UiAction {
    /// A single keystroke (or backspace) in `file`.
    Type {
        file: String,
        previous: String,
        next: String,
    },
    Paste { size: usize },
    Cursor { line: u32, column: u32 },
    SwitchFile { from: String, to: String },
    AiPrompt,
    AiResponse,
    Run,
    /// Wall-clock time passes.
    Wait { ms: u64 },
    /// The host fires due timers.
    Tick,
    TabHidden,
    Unload,
    StopLogging,
    StartLogging,
}

/// The student: owns the editor contents the recorder is observing.
#[derive(Debug, Clone)]
pub struct SimulatedStudent {
    files: FileMap,
    active_file: String,
    rng: SimRng,
}

impl SimulatedStudent {
    #[must_use]
    pub fn new(starter: &FileMap, rng: SimRng) -> Self {
        Self {
            files: starter.clone(),
            active_file: MAIN_FILE.to_string(),
            rng,
        }
    }

    /// Starter files every simulated attempt begins from.
    #[must_use]
    pub fn starter() -> FileMap {
        FileMap::from([
            (MAIN_FILE.to_string(), String::new()),
            (HELPER_FILE.to_string(), "# helpers\n".to_string()),
        ])
    }

    #[must_use]
    pub const fn files(&self) -> &FileMap {
        &self.files
    }

    #[must_use]
    pub fn active_file(&self) -> &str {
        &self.active_file
    }

    /// Pick the next action. Typing only happens while logging is active;
    /// a paused session has a read-only editor.
    pub fn next_action(&mut self, logging: bool) -> UiAction {
        if !logging {
            return match self.rng.below(4) {
                0 => UiAction::StartLogging,
                1 => UiAction::Tick,
                _ => self.wait(),
            };
        }

        match self.rng.below(100) {
            0..=44 => self.keystroke(),
            45..=59 => self.wait(),
            60..=69 => UiAction::Tick,
            70..=74 => UiAction::Paste {
                size: usize::try_from(self.rng.between(1, 400)).unwrap_or(1),
            },
            75..=79 => UiAction::Cursor {
                line: u32::try_from(self.rng.below(60)).unwrap_or(0),
                column: u32::try_from(self.rng.below(80)).unwrap_or(0),
            },
            80..=82 => self.switch_file(),
            83..=84 => UiAction::AiPrompt,
            85..=86 => UiAction::AiResponse,
            87..=91 => UiAction::Run,
            92..=94 => UiAction::TabHidden,
            95..=96 => UiAction::Unload,
            _ => UiAction::StopLogging,
        }
    }

    fn wait(&mut self) -> UiAction {
        // Mostly typing cadence, occasionally long enough to fire the
        // debounce and flush timers.
        let ms = if self.rng.chance(80) {
            self.rng.between(20, 400)
        } else {
            self.rng.between(800, 12_000)
        };
        UiAction::Wait { ms }
    }

    fn keystroke(&mut self) -> UiAction {
        let file = self.active_file.clone();
        let previous = self.files.get(&file).cloned().unwrap_or_default();
        let mut next = previous.clone();
        if !next.is_empty() && self.rng.chance(25) {
            next.pop();
        } else {
            next.push(ALPHABET[self.rng.index(ALPHABET.len())]);
        }
        self.files.insert(file.clone(), next.clone());
        UiAction::Type {
            file,
            previous,
            next,
        }
    }

    fn switch_file(&mut self) -> UiAction {
        let to = if self.active_file == MAIN_FILE {
            HELPER_FILE
        } else {
            MAIN_FILE
        };
        let from = std::mem::replace(&mut self.active_file, to.to_string());
        UiAction::SwitchFile {
            from,
            to: to.to_string(),
        }
    }
}
