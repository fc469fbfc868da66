//! Output parsers turning a wrapped program's output into progress messages.

use std::sync::LazyLock;

use dmgsmith_shared::progress::ProgressMessage;
use regex::Regex;

/// Severity used for forwarded output lines (syslog "info").
const OUTPUT_LOG_LEVEL: u8 = 6;

static INSTALLER_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+? installer\[[0-9a-f:]+\] (<(?P<level>[^>]+)>:)?(?P<message>.*)$")
        .expect("valid regex")
});

static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+").expect("valid regex"));

/// Turns chunks of child output into messages.
pub trait OutputParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressMessage>;

    /// Flush whatever is still buffered when the child exits.
    fn finish(&mut self) -> Vec<ProgressMessage> {
        Vec::new()
    }
}

fn log(message: String) -> ProgressMessage {
    ProgressMessage::LogMessage {
        log_level: OUTPUT_LOG_LEVEL,
        message,
    }
}

fn parse_percent(text: &str) -> Option<ProgressMessage> {
    match text.trim().parse::<f64>() {
        Ok(percent) => Some(ProgressMessage::UpdateProgress { percent }),
        Err(_) => {
            tracing::warn!("Progress parsing failed for {:?}", text);
            None
        }
    }
}

// ============================================================================
// LINE MODE (install script)
// ============================================================================

/// Line-oriented parser for the install script and the tools it runs.
#[derive(Debug, Default)]
pub struct LineParser {
    buffer: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one complete line.
    pub fn parse_line(line: &str) -> Option<ProgressMessage> {
        if let Some(rest) = line.strip_prefix("installer:") {
            return Self::parse_installer(rest);
        }
        if let Some(rest) = line.strip_prefix("IED:") {
            return Self::parse_ied(rest);
        }
        if let Some(message) = line.strip_prefix("MESSAGE:") {
            return Some(ProgressMessage::UpdateMessage {
                message: message.to_string(),
            });
        }
        if let Some(percent) = line.strip_prefix("PERCENT:") {
            return parse_percent(percent);
        }
        if let Some(caps) = INSTALLER_LOG.captures(line) {
            let level = caps.name("level").map_or("stderr", |m| m.as_str());
            let message = caps.name("message").map_or("", |m| m.as_str().trim_start());
            return Some(log(format!("installer.{}: {}", level, message)));
        }
        Some(log(line.to_string()))
    }

    fn parse_installer(rest: &str) -> Option<ProgressMessage> {
        if let Some(percent) = rest.strip_prefix('%') {
            parse_percent(percent)
        } else if let Some(message) = rest.strip_prefix("PHASE:") {
            Some(ProgressMessage::UpdateMessage {
                message: message.to_string(),
            })
        } else if let Some(status) = rest.strip_prefix("STATUS:") {
            Some(log(format!("installer: {}", status)))
        } else {
            Some(log(format!("installer: {}", rest)))
        }
    }

    fn parse_ied(rest: &str) -> Option<ProgressMessage> {
        if let Some(message) = rest.strip_prefix("MSG:") {
            Some(ProgressMessage::UpdateMessage {
                message: message.to_string(),
            })
        } else if let Some(phase) = rest.strip_prefix("PHASE:") {
            Some(ProgressMessage::SelectPhase {
                phase: phase.to_string(),
            })
        } else if let Some(message) = rest.strip_prefix("FAILURE:") {
            Some(ProgressMessage::NotifyFailure {
                message: message.to_string(),
            })
        } else if let Some(message) = rest.strip_prefix("SUCCESS:") {
            Some(ProgressMessage::NotifySuccess {
                message: message.to_string(),
            })
        } else if let Some(command) = rest.strip_prefix("WATCHLOG:") {
            tracing::debug!("Ignoring install log watch request {}", command);
            None
        } else {
            tracing::warn!("(Unknown IED progress {})", rest);
            None
        }
    }
}

impl OutputParser for LineParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            messages.extend(Self::parse_line(&line));
        }
        messages
    }

    fn finish(&mut self) -> Vec<ProgressMessage> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Self::parse_line(&line).into_iter().collect()
    }
}

// ============================================================================
// ASR MODE (imagescan)
// ============================================================================

/// Streaming parser for `asr imagescan`, which draws progress as
/// `Block checksum: ....10....20....` without newlines.
#[derive(Debug, Default)]
pub struct AsrParser {
    active: bool,
    phase: u32,
    percent: u32,
}

impl AsrParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputParser for AsrParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressMessage> {
        let decoded = String::from_utf8_lossy(chunk);
        let mut messages = Vec::new();

        let owned;
        let mut text: &str = &decoded;
        if !self.active
            && let Some((first, rest)) = text.split_once('\n')
        {
            messages.push(log(format!("asr output: {}", first.trim_end())));
            owned = format!("\n{}", rest);
            text = &owned;
        }

        while !text.is_empty() {
            if let Some(rest) = text.strip_prefix('\n') {
                text = rest;
                self.active = false;
            } else if let Some(rest) = text.strip_prefix("Block checksum: ") {
                text = rest;
                self.percent = 0;
                self.active = true;
                self.phase += 1;
                messages.push(ProgressMessage::SelectPhase {
                    phase: format!("asr{}", self.phase),
                });
            } else if self.active && text.starts_with('.') {
                text = &text[1..];
                self.percent += 2;
                messages.push(ProgressMessage::UpdateProgress {
                    percent: self.percent as f64,
                });
            } else if let Some(digits) = LEADING_NUMBER.find(text).filter(|_| self.active) {
                self.percent = digits.as_str().parse().unwrap_or(self.percent);
                text = &text[digits.end()..];
                messages.push(ProgressMessage::UpdateProgress {
                    percent: self.percent as f64,
                });
            } else {
                let rest = text.trim_end();
                if !rest.is_empty() {
                    messages.push(log(format!("asr output: {}", rest)));
                }
                break;
            }
        }

        messages
    }
}
