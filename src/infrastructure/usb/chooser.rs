//! Device Chooser
//!
//! The user-facing step of pairing: given the compatible devices on the bus,
//! let a person pick one.

use crate::domain::error::{ProvisionError, UsbError};
use std::io::{BufRead, IsTerminal, Write};
use tracing::info;

/// A compatible device presented to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub vendor_id: u16,
    pub product_id: u16,
    pub label: String,
}

pub trait DeviceChooser: Send + Sync {
    /// Index of the chosen candidate, or `None` if the user cancelled.
    fn choose(&self, candidates: &[Candidate]) -> Result<Option<usize>, ProvisionError>;
}

impl<C: DeviceChooser + ?Sized> DeviceChooser for Box<C> {
    fn choose(&self, candidates: &[Candidate]) -> Result<Option<usize>, ProvisionError> {
        (**self).choose(candidates)
    }
}

/// Prompts on the controlling terminal.
///
/// Refuses to run without an interactive stdin, so pairing never happens
/// without a person at the keyboard.
#[derive(Debug, Default)]
pub struct TerminalChooser;

impl DeviceChooser for TerminalChooser {
    fn choose(&self, candidates: &[Candidate]) -> Result<Option<usize>, ProvisionError> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Err(ProvisionError::Transport(UsbError::UserGestureRequired));
        }

        let mut stderr = std::io::stderr();
        let io = |e: std::io::Error| ProvisionError::Transport(UsbError::Io(e.to_string()));

        writeln!(stderr, "Select a device to pair:").map_err(io)?;
        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(stderr, "  [{}] {}", i + 1, candidate.label).map_err(io)?;
        }
        write!(stderr, "Device number (empty to cancel): ").map_err(io)?;
        stderr.flush().map_err(io)?;

        let mut line = String::new();
        stdin.lock().read_line(&mut line).map_err(io)?;
        Ok(parse_choice(&line, candidates.len()))
    }
}

/// Picks the first candidate. Used when the user opted in up front (`--yes`).
#[derive(Debug, Default)]
pub struct AutoChooser;

impl DeviceChooser for AutoChooser {
    fn choose(&self, candidates: &[Candidate]) -> Result<Option<usize>, ProvisionError> {
        if let Some(first) = candidates.first() {
            info!("Automatically selecting {}", first.label);
            Ok(Some(0))
        } else {
            Ok(None)
        }
    }
}

/// One-based answer to a zero-based index; anything else cancels.
fn parse_choice(line: &str, count: usize) -> Option<usize> {
    match line.trim().parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(vendor_id: u16) -> Candidate {
        Candidate {
            vendor_id,
            product_id: 0x0001,
            label: format!("{:04x}:0001", vendor_id),
        }
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1\n", 2), Some(0));
        assert_eq!(parse_choice(" 2 ", 2), Some(1));
        assert_eq!(parse_choice("3", 2), None);
        assert_eq!(parse_choice("0", 2), None);
        assert_eq!(parse_choice("\n", 2), None);
        assert_eq!(parse_choice("q", 2), None);
    }

    #[test]
    fn test_auto_chooser() {
        let chooser = AutoChooser;
        assert_eq!(chooser.choose(&[]).unwrap(), None);
        assert_eq!(
            chooser
                .choose(&[candidate(0x239a), candidate(0x303a)])
                .unwrap(),
            Some(0)
        );
    }
}
