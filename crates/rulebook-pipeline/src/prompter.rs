//! Prompter trait and built-in implementations for answering suspended
//! operations.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use rulebook_types::{Prompt, PromptKind, Result, RulebookError, UserInput};

#[async_trait]
pub trait Prompter: Send + Sync {
    async fn ask(&self, prompt: &Prompt) -> Result<UserInput>;
}

// ---------------------------------------------------------------------------
// AutoPrompter
// ---------------------------------------------------------------------------

/// Answers without asking: the first choice, the default (or minimum)
/// number, or an acknowledgement.
pub struct AutoPrompter;

impl AutoPrompter {
    fn answer(prompt: &Prompt) -> UserInput {
        match &prompt.kind {
            PromptKind::Select { choices } => match choices.first() {
                Some(first) => UserInput::Choice(first.value.clone()),
                None => UserInput::Dismiss,
            },
            PromptKind::Number { default, min, max } => {
                let mut n = default.or(*min).unwrap_or(0.0);
                if let Some(max) = max {
                    n = n.min(*max);
                }
                UserInput::Number(n)
            }
            PromptKind::Acknowledge => UserInput::Acknowledge,
        }
    }
}

#[async_trait]
impl Prompter for AutoPrompter {
    async fn ask(&self, prompt: &Prompt) -> Result<UserInput> {
        Ok(Self::answer(prompt))
    }
}

// ---------------------------------------------------------------------------
// ConsolePrompter
// ---------------------------------------------------------------------------

/// Reads answers from stdin. An empty line dismisses the prompt.
pub struct ConsolePrompter;

impl ConsolePrompter {
    fn parse(prompt: &Prompt, line: &str) -> UserInput {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return UserInput::Dismiss;
        }
        match &prompt.kind {
            PromptKind::Select { choices } => {
                let picked = trimmed
                    .parse::<usize>()
                    .ok()
                    .filter(|&i| i > 0 && i <= choices.len())
                    .map(|i| choices[i - 1].value.clone());
                UserInput::Choice(picked.unwrap_or_else(|| trimmed.to_string()))
            }
            PromptKind::Number { .. } => match trimmed.parse::<f64>() {
                Ok(n) => UserInput::Number(n),
                // Let the operation reject it.
                Err(_) => UserInput::Choice(trimmed.to_string()),
            },
            PromptKind::Acknowledge => UserInput::Acknowledge,
        }
    }
}

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn ask(&self, prompt: &Prompt) -> Result<UserInput> {
        println!("\n{}", prompt.title);
        match &prompt.kind {
            PromptKind::Select { choices } => {
                for (i, choice) in choices.iter().enumerate() {
                    println!("  [{}] {}", i + 1, choice.label);
                }
            }
            PromptKind::Number { default, min, max } => {
                let fmt = |n: &Option<f64>| {
                    n.map(rulebook_formula::format_number)
                        .unwrap_or_else(|| "-".into())
                };
                println!(
                    "  number (default {}, min {}, max {})",
                    fmt(default),
                    fmt(min),
                    fmt(max)
                );
            }
            PromptKind::Acknowledge => println!("  press enter when done"),
        }
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(RulebookError::Io)?;
        if matches!(prompt.kind, PromptKind::Acknowledge) {
            return Ok(UserInput::Acknowledge);
        }
        Ok(Self::parse(prompt, &input))
    }
}

// ---------------------------------------------------------------------------
// RecordingPrompter
// ---------------------------------------------------------------------------

/// Plays back preset answers in order and records every prompt. Falls back
/// to [`AutoPrompter`] once the presets run out.
pub struct RecordingPrompter {
    answers: Mutex<VecDeque<UserInput>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl RecordingPrompter {
    pub fn new(answers: Vec<UserInput>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Prompter for RecordingPrompter {
    async fn ask(&self, prompt: &Prompt) -> Result<UserInput> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        let preset = self
            .answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front());
        Ok(preset.unwrap_or_else(|| AutoPrompter::answer(prompt)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rulebook_types::Choice;

    fn pick() -> Prompt {
        Prompt::select(
            "Pick one",
            vec![Choice::new("a", "Alpha"), Choice::new("b", "Beta")],
        )
    }

    #[tokio::test]
    async fn auto_picks_first_choice() {
        let answer = AutoPrompter.ask(&pick()).await.unwrap();
        assert_eq!(answer, UserInput::Choice("a".into()));
    }

    #[tokio::test]
    async fn auto_number_uses_default_then_min() {
        let with_default = Prompt::number("How far?", Some(4.0), Some(1.0), Some(3.0));
        assert_eq!(
            AutoPrompter.ask(&with_default).await.unwrap(),
            UserInput::Number(3.0)
        );
        let with_min = Prompt::number("How far?", None, Some(2.0), None);
        assert_eq!(
            AutoPrompter.ask(&with_min).await.unwrap(),
            UserInput::Number(2.0)
        );
    }

    #[tokio::test]
    async fn auto_dismisses_empty_select() {
        let empty = Prompt::select("Nothing", vec![]);
        assert_eq!(AutoPrompter.ask(&empty).await.unwrap(), UserInput::Dismiss);
    }

    #[test]
    fn console_parses_index_label_and_blank() {
        let prompt = pick();
        assert_eq!(
            ConsolePrompter::parse(&prompt, "2\n"),
            UserInput::Choice("b".into())
        );
        assert_eq!(
            ConsolePrompter::parse(&prompt, "Beta"),
            UserInput::Choice("Beta".into())
        );
        assert_eq!(ConsolePrompter::parse(&prompt, "  \n"), UserInput::Dismiss);

        let number = Prompt::number("n", None, None, None);
        assert_eq!(
            ConsolePrompter::parse(&number, "2.5"),
            UserInput::Number(2.5)
        );
    }

    #[tokio::test]
    async fn recording_plays_back_then_falls_back() {
        let prompter = RecordingPrompter::new(vec![UserInput::Choice("b".into())]);

        assert_eq!(
            prompter.ask(&pick()).await.unwrap(),
            UserInput::Choice("b".into())
        );
        assert_eq!(
            prompter.ask(&Prompt::acknowledge("Wait")).await.unwrap(),
            UserInput::Acknowledge
        );

        let recorded = prompter.prompts();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].title, "Pick one");
        assert_eq!(recorded[1].title, "Wait");
    }
}
