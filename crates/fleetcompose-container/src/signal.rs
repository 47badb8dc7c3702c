//! シグナル名の正規化

use fleetcompose_core::error::{ComposeError, Result};
use nix::sys::signal::Signal;
use std::str::FromStr;

/// `TERM` / `SIGTERM` / `15` を `SIGTERM` に揃える
pub fn parse_signal(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let signal = if let Ok(number) = trimmed.parse::<i32>() {
        Signal::try_from(number).ok()
    } else {
        let upper = trimmed.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Signal::from_str(&name).ok()
    };

    signal
        .map(|s| s.as_str().to_string())
        .ok_or_else(|| ComposeError::invalid(format!("unknown signal '{}'", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("TERM").unwrap(), "SIGTERM");
        assert_eq!(parse_signal("sigkill").unwrap(), "SIGKILL");
        assert_eq!(parse_signal("9").unwrap(), "SIGKILL");
        assert_eq!(parse_signal("SIGHUP").unwrap(), "SIGHUP");
        assert!(parse_signal("BOGUS").is_err());
    }
}
