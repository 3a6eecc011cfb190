//! Operator command parser
//!
//! Accepts the M-code subset the pick-and-place host sends (`M600 N3 F4`)
//! plus a few plain-word maintenance commands. Letters are case-insensitive
//! and anything after `;` is a comment.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::feeder::SettingsPatch;
use crate::types::NodeHandle;

/// Raw, unvalidated `M603` fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsArgs {
    pub full_advance_angle: Option<i64>,
    pub half_advance_angle: Option<i64>,
    pub retract_angle: Option<i64>,
    pub feed_length: Option<i64>,
    pub settle_time_ms: Option<i64>,
}

impl SettingsArgs {
    /// Range-check every present field
    pub fn validate(&self) -> Result<SettingsPatch> {
        use crate::feeder::{validate_angle, validate_feed_length, MAX_SETTLE_TIME_MS};

        let angle = |value: Option<i64>| value.map(validate_angle).transpose();
        let settle_time_ms = match self.settle_time_ms {
            Some(ms) if (0..=MAX_SETTLE_TIME_MS as i64).contains(&ms) => Some(ms as u64),
            Some(ms) => {
                return Err(Error::invalid(format!(
                    "settle time {} ms outside 0-{}",
                    ms, MAX_SETTLE_TIME_MS
                )))
            }
            None => None,
        };

        let patch = SettingsPatch {
            full_advance_angle: angle(self.full_advance_angle)?,
            half_advance_angle: angle(self.half_advance_angle)?,
            retract_angle: angle(self.retract_angle)?,
            feed_length: self.feed_length.map(validate_feed_length).transpose()?,
            settle_time_ms,
        };
        if patch.is_empty() {
            return Err(Error::invalid("M603 needs at least one of A B C F U"));
        }
        Ok(patch)
    }
}

/// Parsed command. Feeder numbers stay raw so the router owns validation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `M610 [Sx]`
    Enable { state: Option<i64> },
    /// `M620`
    Hands,
    /// `M602 Nf`
    FeederStatus { feeder: Option<i64> },
    /// `M603 Nf ...`
    Configure {
        feeder: Option<i64>,
        settings: SettingsArgs,
    },
    /// `M604 Nf`
    FeedbackStatus { feeder: Option<i64> },
    /// `M605 Nf Sx`
    SetFeedback {
        feeder: Option<i64>,
        state: Option<i64>,
    },
    /// `M600 Nf [Flen] [X1]`
    Feed {
        feeder: Option<i64>,
        length: Option<i64>,
        force: bool,
    },
    /// `M601 Nf`
    Retract { feeder: Option<i64> },
    /// `M606 Nf`
    ClearManualFeed { feeder: Option<i64> },
    /// `M607 Nf`
    AckManualFeed { feeder: Option<i64> },
    /// `M280 Nf Aang`
    SetAngle {
        feeder: Option<i64>,
        angle: Option<i64>,
    },
    Discovery,
    ClearRegistration,
    Status,
    Unassigned,
    Assign { node: NodeHandle, feeder: i64 },
}

impl Command {
    /// Motion commands are gated by system enablement
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::Feed { .. } | Command::Retract { .. } | Command::SetAngle { .. }
        )
    }
}

pub fn parse(line: &str) -> Result<Command> {
    let text = line.split(';').next().unwrap_or("").trim();
    let unknown = || Error::UnknownCommand {
        line: line.trim().to_string(),
    };

    let mut tokens = text.split_whitespace();
    let head = tokens.next().ok_or_else(unknown)?;

    match head.to_ascii_lowercase().as_str() {
        "discovery" => return Ok(Command::Discovery),
        "clear_registration" => return Ok(Command::ClearRegistration),
        "status" => return Ok(Command::Status),
        "unassigned" => return Ok(Command::Unassigned),
        "assign" => {
            let node = tokens
                .next()
                .ok_or_else(|| Error::invalid("usage: assign <AA:BB:CC:DD:EE:FF> <feeder>"))?
                .parse::<NodeHandle>()?;
            let feeder = tokens
                .next()
                .ok_or_else(|| Error::invalid("usage: assign <AA:BB:CC:DD:EE:FF> <feeder>"))?;
            let feeder = feeder
                .trim_start_matches(['N', 'n'])
                .parse::<i64>()
                .map_err(|_| Error::invalid(format!("feeder '{}' is not a number", feeder)))?;
            return Ok(Command::Assign { node, feeder });
        }
        _ => {}
    }

    let (letter, code) = split_word(head)?;
    if letter != 'M' {
        return Err(unknown());
    }

    let mut words = HashMap::new();
    for token in tokens {
        let (letter, value) = split_word(token)?;
        words.insert(letter, value);
    }
    let feeder = words.get(&'N').copied();

    let command = match code {
        610 => Command::Enable {
            state: words.get(&'S').copied(),
        },
        620 => Command::Hands,
        602 => Command::FeederStatus { feeder },
        603 => Command::Configure {
            feeder,
            settings: SettingsArgs {
                full_advance_angle: words.get(&'A').copied(),
                half_advance_angle: words.get(&'B').copied(),
                retract_angle: words.get(&'C').copied(),
                feed_length: words.get(&'F').copied(),
                settle_time_ms: words.get(&'U').copied(),
            },
        },
        604 => Command::FeedbackStatus { feeder },
        605 => Command::SetFeedback {
            feeder,
            state: words.get(&'S').copied(),
        },
        600 => Command::Feed {
            feeder,
            length: words.get(&'F').copied(),
            force: words.get(&'X').copied().unwrap_or(0) != 0,
        },
        601 => Command::Retract { feeder },
        606 => Command::ClearManualFeed { feeder },
        607 => Command::AckManualFeed { feeder },
        280 => Command::SetAngle {
            feeder,
            angle: words.get(&'A').copied(),
        },
        _ => return Err(unknown()),
    };
    Ok(command)
}

/// `F12` -> ('F', 12)
fn split_word(word: &str) -> Result<(char, i64)> {
    let mut chars = word.chars();
    let letter = chars
        .next()
        .filter(char::is_ascii_alphabetic)
        .ok_or_else(|| Error::invalid(format!("malformed word '{}'", word)))?
        .to_ascii_uppercase();
    let value = chars
        .as_str()
        .parse::<i64>()
        .map_err(|_| Error::invalid(format!("malformed word '{}'", word)))?;
    Ok((letter, value))
}
