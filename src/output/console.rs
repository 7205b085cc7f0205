//! Console sink - human-readable tailing of many servers at once

use super::Sink;
use crate::error::{DriverError, DriverResult};
use anyhow::Result;
use std::io::Write;

const PLACEHOLDER: &str = "{}";

/// Writes lines to the driver's stdout, optionally through a template
#[derive(Debug, Clone, Default)]
pub struct Console {
    fmt: Option<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format every line through `fmt`, which must contain exactly one `{}`
    pub fn with_fmt(fmt: impl Into<String>) -> DriverResult<Self> {
        let fmt = fmt.into();
        let count = fmt.matches(PLACEHOLDER).count();
        if count != 1 {
            return Err(DriverError::Format(format!(
                "{:?} must contain exactly one {} placeholder, found {}",
                fmt, PLACEHOLDER, count
            )));
        }
        Ok(Self { fmt: Some(fmt) })
    }

    fn render(&self, line: &str) -> String {
        match &self.fmt {
            Some(fmt) => fmt.replacen(PLACEHOLDER, line, 1),
            None => line.to_string(),
        }
    }
}

impl Sink for Console {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", self.render(line))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_prefix() {
        let console = Console::with_fmt("node01: {}").unwrap();
        assert_eq!(console.render("hello"), "node01: hello");
    }

    #[test]
    fn test_line_containing_placeholder_is_literal() {
        let console = Console::with_fmt("[{}]").unwrap();
        assert_eq!(console.render("a {} b"), "[a {} b]");
    }

    #[test]
    fn test_plain_console_passes_through() {
        assert_eq!(Console::new().render("raw"), "raw");
    }

    #[test]
    fn test_template_needs_exactly_one_placeholder() {
        assert!(matches!(
            Console::with_fmt("no placeholder"),
            Err(DriverError::Format(_))
        ));
        assert!(matches!(
            Console::with_fmt("{} and {}"),
            Err(DriverError::Format(_))
        ));
    }
}
