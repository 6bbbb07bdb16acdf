//! Message classification.
//!
//! Every inbound line is matched against an ordered set of patterns:
//! proposal first, then vote, then (only when the message is addressed to
//! the bot) a shell-tokenized directed command. Anything else is noise.

use regex::Regex;
use rust_decimal::Decimal;

/// Character set for topic names, shared by the proposal and vote patterns.
const TOPIC_NAME: &str = "[-A-Za-z0-9_]+";

/// One classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Propose {
        topic: String,
        comment: Option<String>,
    },
    Vote {
        value: Decimal,
        topic: String,
        comment: Option<String>,
    },
    /// Message addressed to the bot, split into verb + arguments.
    Directed { verb: String, args: Vec<String> },
    /// Addressed to the bot but not tokenizable (unbalanced quotes, empty).
    DirectedSyntaxError,
    /// Vote-shaped message whose value is not a valid decimal. Logged and
    /// dropped by the caller; no reply.
    MalformedVote { raw: String },
    NoMatch,
}

/// Compiled grammar for one session. The directed-command prefix depends on
/// the bot's identity, so the grammar is built after the handshake.
pub struct Grammar {
    propose: Regex,
    vote: Regex,
    directed: Regex,
}

impl Grammar {
    pub fn new(bot_user_id: &str, bot_name: &str) -> Self {
        let propose = Regex::new(&format!("^propose ({TOPIC_NAME})(?:[:;,] *(.*))?"))
            .expect("proposal pattern");
        // Sign is mandatory; bare fractional forms like "-.5" are accepted.
        let vote = Regex::new(&format!(
            r"^ *([-+](?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)) on ({TOPIC_NAME})(?: *[;:,] *(.*))?"
        ))
        .expect("vote pattern");
        // Messages count as addressed to the bot when prefixed by an
        // explicit mention or by the bot's name plus a delimiter.
        let directed = Regex::new(&format!(
            "^(?:<@{0}>: |{1} |{1}: )(.*)",
            regex::escape(bot_user_id),
            regex::escape(bot_name),
        ))
        .expect("directed pattern");
        Self {
            propose,
            vote,
            directed,
        }
    }

    /// Classify one line of text. Matching order is significant and fixed.
    pub fn classify(&self, text: &str) -> Command {
        if let Some(caps) = self.propose.captures(text) {
            return Command::Propose {
                topic: caps[1].to_string(),
                comment: optional_group(&caps, 2),
            };
        }

        if let Some(caps) = self.vote.captures(text) {
            let raw = caps[1].to_string();
            return match raw.parse::<Decimal>() {
                Ok(value) => Command::Vote {
                    value,
                    topic: caps[2].to_string(),
                    comment: optional_group(&caps, 3),
                },
                Err(_) => Command::MalformedVote { raw },
            };
        }

        if let Some(caps) = self.directed.captures(text) {
            return match shlex::split(&caps[1]) {
                Some(words) if !words.is_empty() => {
                    let mut words = words.into_iter();
                    let verb = words.next().unwrap_or_default();
                    Command::Directed {
                        verb,
                        args: words.collect(),
                    }
                }
                _ => Command::DirectedSyntaxError,
            };
        }

        Command::NoMatch
    }
}

/// Empty capture groups are treated as absent, not as empty strings.
fn optional_group(caps: &regex::Captures<'_>, index: usize) -> Option<String> {
    caps.get(index)
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> Grammar {
        Grammar::new("U0BOT", "votebot")
    }

    #[test]
    fn proposal_with_comment() {
        assert_eq!(
            grammar().classify("propose mytopic: please vote"),
            Command::Propose {
                topic: "mytopic".to_string(),
                comment: Some("please vote".to_string()),
            }
        );
    }

    #[test]
    fn proposal_without_comment() {
        assert_eq!(
            grammar().classify("propose lunch-spot_2"),
            Command::Propose {
                topic: "lunch-spot_2".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn proposal_with_empty_comment_is_absent() {
        assert_eq!(
            grammar().classify("propose mytopic:"),
            Command::Propose {
                topic: "mytopic".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn trailing_junk_after_name_is_not_a_comment() {
        // No separator, so the extra words are ignored rather than captured.
        assert_eq!(
            grammar().classify("propose mytopic please vote"),
            Command::Propose {
                topic: "mytopic".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn simple_positive_vote() {
        assert_eq!(
            grammar().classify("+1 on mytopic"),
            Command::Vote {
                value: "1".parse().unwrap(),
                topic: "mytopic".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn negative_fractional_vote_with_comment() {
        assert_eq!(
            grammar().classify("-2.5 on mytopic: nope"),
            Command::Vote {
                value: "-2.5".parse().unwrap(),
                topic: "mytopic".to_string(),
                comment: Some("nope".to_string()),
            }
        );
    }

    #[test]
    fn leading_dot_vote() {
        assert_eq!(
            grammar().classify("+.25 on mytopic"),
            Command::Vote {
                value: "0.25".parse().unwrap(),
                topic: "mytopic".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn leading_zero_vote() {
        assert_eq!(
            grammar().classify("-0.10 on mytopic"),
            Command::Vote {
                value: "-0.10".parse().unwrap(),
                topic: "mytopic".to_string(),
                comment: None,
            }
        );
    }

    #[test]
    fn unsigned_vote_does_not_match() {
        assert_eq!(grammar().classify("1 on mytopic"), Command::NoMatch);
    }

    #[test]
    fn doubled_sign_does_not_match() {
        assert_eq!(grammar().classify("++1 on mytopic"), Command::NoMatch);
    }

    #[test]
    fn directed_by_mention() {
        assert_eq!(
            grammar().classify("<@U0BOT>: status"),
            Command::Directed {
                verb: "status".to_string(),
                args: vec![],
            }
        );
    }

    #[test]
    fn directed_by_name_with_quoted_argument() {
        assert_eq!(
            grammar().classify(r#"votebot: frobnicate "x y" z"#),
            Command::Directed {
                verb: "frobnicate".to_string(),
                args: vec!["x y".to_string(), "z".to_string()],
            }
        );
    }

    #[test]
    fn unbalanced_quote_is_a_syntax_error() {
        assert_eq!(
            grammar().classify(r#"<@U0BOT>: status "unterminated"#),
            Command::DirectedSyntaxError
        );
    }

    #[test]
    fn empty_directed_command_is_a_syntax_error() {
        assert_eq!(
            grammar().classify("<@U0BOT>: "),
            Command::DirectedSyntaxError
        );
    }

    #[test]
    fn undirected_chatter_is_no_match() {
        assert_eq!(grammar().classify("lunch anyone?"), Command::NoMatch);
    }

    #[test]
    fn proposal_wins_over_vote_ordering() {
        // "propose" is tried first even for text a later pattern could match.
        assert!(matches!(
            grammar().classify("propose mytopic"),
            Command::Propose { .. }
        ));
    }

    #[test]
    fn bot_name_is_escaped_in_the_prefix() {
        let g = Grammar::new("U1", "vote.bot");
        assert_eq!(grammar().classify("voteXbot status"), Command::NoMatch);
        assert_eq!(
            g.classify("vote.bot status"),
            Command::Directed {
                verb: "status".to_string(),
                args: vec![],
            }
        );
        // The dot must not act as a regex wildcard.
        assert_eq!(g.classify("voteXbot status"), Command::NoMatch);
    }
}
