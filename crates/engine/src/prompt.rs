//! Prompt assembly — turning (directive, history, new message) into the
//! token sequence the model consumes.
//!
//! The base model is trained on ChatML, so every turn is rendered as
//! `<|im_start|>{role}\n{content}<|im_end|>\n` and the sequence ends with an
//! open assistant header. History is capped to a bounded window of recent
//! turns before any tokenization happens, then truncated token-wise from the
//! oldest end until the prompt fits the budget. The system directive and the
//! new user message are never dropped.

use tokenizers::Tokenizer;

use kohai_core::{ConversationTurn, PromptError, Role};

/// Pure transformation from conversation state to prompt tokens.
pub struct PromptAssembler<'a> {
    tokenizer: &'a Tokenizer,
    max_prompt_tokens: usize,
    history_turns: usize,
}

impl<'a> PromptAssembler<'a> {
    pub fn new(tokenizer: &'a Tokenizer, max_prompt_tokens: usize, history_turns: usize) -> Self {
        Self {
            tokenizer,
            max_prompt_tokens,
            history_turns,
        }
    }

    /// Assemble the full chat-formatted prompt.
    ///
    /// With empty history the result is exactly `[system, user]` plus the
    /// generation header. Fails if the directive or message is empty, if the
    /// history shape is invalid, or if even the bare `[system, user]` prompt
    /// exceeds the token budget.
    pub fn assemble(
        &self,
        directive: &str,
        history: &[ConversationTurn],
        message: &str,
    ) -> Result<Vec<u32>, PromptError> {
        if directive.trim().is_empty() {
            return Err(PromptError::EmptyDirective);
        }
        if message.trim().is_empty() {
            return Err(PromptError::EmptyMessage);
        }
        validate_history(history)?;

        // bounded window before any tokenization
        let start = history.len().saturating_sub(self.history_turns);
        let mut window = &history[start..];

        loop {
            let text = render_chatml(directive, window, message);
            let ids = self.encode(&text)?;
            if ids.len() <= self.max_prompt_tokens {
                return Ok(ids);
            }
            match window.split_first() {
                Some((_, rest)) => window = rest,
                None => {
                    return Err(PromptError::ContextOverflow {
                        tokens: ids.len(),
                        budget: self.max_prompt_tokens,
                    });
                }
            }
        }
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, PromptError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| PromptError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// History must be alternating user/assistant pairs, oldest first, with no
/// system turns (the directive is chosen by the service, not the caller).
/// Applied to the full history; the window may then legally start on an
/// assistant turn when it cuts a pair.
fn validate_history(history: &[ConversationTurn]) -> Result<(), PromptError> {
    let mut expect = Role::User;
    for (i, turn) in history.iter().enumerate() {
        if turn.role == Role::System {
            return Err(PromptError::MalformedHistory(format!(
                "turn {i} is a system turn; the directive is selected by the service"
            )));
        }
        if turn.role != expect {
            return Err(PromptError::MalformedHistory(format!(
                "turn {i} should be a {expect} turn"
            )));
        }
        if turn.content.trim().is_empty() {
            return Err(PromptError::MalformedHistory(format!(
                "turn {i} has empty content"
            )));
        }
        expect = if expect == Role::User {
            Role::Assistant
        } else {
            Role::User
        };
    }
    Ok(())
}

pub(crate) fn render_chatml(
    directive: &str,
    history: &[ConversationTurn],
    message: &str,
) -> String {
    let mut prompt = String::new();
    push_turn(&mut prompt, "system", directive);
    for turn in history {
        let role = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        push_turn(&mut prompt, role, &turn.content);
    }
    push_turn(&mut prompt, "user", message);
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn push_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|im_start|>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str("<|im_end|>\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-level tokenizer: one id per whitespace-separated token, so
    /// truncation arithmetic in these tests is exact.
    fn test_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "[UNK]": 0,
                    "<|im_start|>system": 1,
                    "<|im_start|>user": 2,
                    "<|im_start|>assistant": 3,
                    "jawab": 4,
                    "singkat": 5
                },
                "unk_token": "[UNK]"
            }
        }"#;
        Tokenizer::from_bytes(json.as_bytes()).expect("test tokenizer json must parse")
    }

    fn turns(pairs: &[(&str, &str)]) -> Vec<ConversationTurn> {
        pairs
            .iter()
            .flat_map(|(u, a)| {
                [
                    ConversationTurn::user(*u),
                    ConversationTurn::assistant(*a),
                ]
            })
            .collect()
    }

    #[test]
    fn empty_history_is_system_then_user() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 1024, 16);
        let ids = assembler.assemble("jawab singkat", &[], "halo").unwrap();

        let expected = render_chatml("jawab singkat", &[], "halo");
        let expected_ids = tokenizer.encode(expected.as_str(), false).unwrap();
        assert_eq!(ids, expected_ids.get_ids().to_vec());
        assert_eq!(
            render_chatml("jawab singkat", &[], "halo").matches("<|im_start|>").count(),
            3 // system + user + the open assistant header
        );
    }

    #[test]
    fn empty_message_rejected() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 1024, 16);
        assert!(matches!(
            assembler.assemble("directive", &[], "   "),
            Err(PromptError::EmptyMessage)
        ));
    }

    #[test]
    fn empty_directive_rejected() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 1024, 16);
        assert!(matches!(
            assembler.assemble("", &[], "halo"),
            Err(PromptError::EmptyDirective)
        ));
    }

    #[test]
    fn system_turn_in_history_rejected() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 1024, 16);
        let history = vec![ConversationTurn::system("injected")];
        assert!(matches!(
            assembler.assemble("directive", &history, "halo"),
            Err(PromptError::MalformedHistory(_))
        ));
    }

    #[test]
    fn out_of_order_history_rejected() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 1024, 16);
        let history = vec![
            ConversationTurn::user("a"),
            ConversationTurn::user("b"),
        ];
        assert!(matches!(
            assembler.assemble("directive", &history, "halo"),
            Err(PromptError::MalformedHistory(_))
        ));
    }

    #[test]
    fn output_always_fits_the_budget() {
        let tokenizer = test_tokenizer();
        let history = turns(&[
            ("satu", "balasan satu"),
            ("dua", "balasan dua"),
            ("tiga", "balasan tiga"),
            ("empat", "balasan empat"),
        ]);

        for budget in [12usize, 16, 24, 48] {
            let assembler = PromptAssembler::new(&tokenizer, budget, 16);
            match assembler.assemble("jawab singkat", &history, "halo") {
                Ok(ids) => assert!(ids.len() <= budget, "budget {budget} exceeded"),
                Err(PromptError::ContextOverflow { .. }) => {
                    // legal outcome when even [system, user] cannot fit
                }
                Err(e) => panic!("unexpected error at budget {budget}: {e}"),
            }
        }
    }

    #[test]
    fn truncation_drops_oldest_turns_only() {
        let tokenizer = test_tokenizer();
        let history = turns(&[
            ("pertanyaan-lama", "jawaban-lama"),
            ("pertanyaan-baru", "jawaban-baru"),
        ]);

        // Pick a budget that fits the newest pair but not both pairs.
        let full = tokenizer
            .encode(render_chatml("jawab", &history, "halo").as_str(), false)
            .unwrap()
            .get_ids()
            .len();
        let tail = tokenizer
            .encode(render_chatml("jawab", &history[2..], "halo").as_str(), false)
            .unwrap()
            .get_ids()
            .len();
        assert!(tail < full);
        let budget = tail;

        let assembler = PromptAssembler::new(&tokenizer, budget, 16);
        let ids = assembler.assemble("jawab", &history, "halo").unwrap();

        // The result is exactly the render that kept only the newest turns:
        // the directive and the new message survive, the oldest pair is gone.
        let expected = tokenizer
            .encode(render_chatml("jawab", &history[2..], "halo").as_str(), false)
            .unwrap()
            .get_ids()
            .to_vec();
        assert_eq!(ids, expected);
    }

    #[test]
    fn window_caps_history_before_tokenizing() {
        let tokenizer = test_tokenizer();
        let history = turns(&[
            ("a1", "b1"),
            ("a2", "b2"),
            ("a3", "b3"),
        ]);

        // A window of 2 turns keeps only the final assistant/user pair tail.
        let assembler = PromptAssembler::new(&tokenizer, 1024, 2);
        let ids = assembler.assemble("jawab", &history, "halo").unwrap();
        let expected = tokenizer
            .encode(
                render_chatml("jawab", &history[history.len() - 2..], "halo").as_str(),
                false,
            )
            .unwrap()
            .get_ids()
            .to_vec();
        assert_eq!(ids, expected);
    }

    #[test]
    fn overflow_without_history_is_an_error() {
        let tokenizer = test_tokenizer();
        let assembler = PromptAssembler::new(&tokenizer, 3, 16);
        assert!(matches!(
            assembler.assemble("jawab singkat dan sopan", &[], "halo dunia"),
            Err(PromptError::ContextOverflow { .. })
        ));
    }
}
