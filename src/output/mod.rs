//! Output sinks - where remote stdout/stderr lines end up
//!
//! A sink consumes one line at a time (without its trailing newline).
//! Commands route each stream into an [`Output`], an ordered fan-out of
//! shared sinks, so the same sink can collect lines from several commands
//! and still be inspected by the experiment afterwards.

mod console;
mod csv;
mod factory;
mod file;

pub use self::console::Console;
pub use self::csv::{ColumnKind, ColumnSpec, CsvGenerator};
pub use self::factory::SinkFactory;
pub use self::file::FileSink;

use anyhow::Result;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

/// A consumer of output lines
pub trait Sink: Send {
    /// Consume one line
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Push buffered data to its destination
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A sink shared between commands and the experiment body
pub type Shared<S> = Arc<Mutex<S>>;

/// Type-erased shared sink
pub type SharedSink = Arc<Mutex<dyn Sink>>;

/// Wrap a sink so it can be handed to commands and read back later
pub fn shared<S: Sink + 'static>(sink: S) -> Shared<S> {
    Arc::new(Mutex::new(sink))
}

/// Lock a shared sink, recovering from a poisoned lock
pub fn lock<S: ?Sized>(sink: &Mutex<S>) -> MutexGuard<'_, S> {
    sink.lock().unwrap_or_else(|e| e.into_inner())
}

/// Routing target for one output stream: zero or more sinks, fed in order
#[derive(Clone, Default)]
pub struct Output {
    sinks: Vec<SharedSink>,
}

impl Output {
    /// Discard everything
    pub fn none() -> Self {
        Self::default()
    }

    /// Feed every line to all `sinks`, in list order
    pub fn fanout<I>(sinks: I) -> Self
    where
        I: IntoIterator<Item = Output>,
    {
        Self {
            sinks: sinks.into_iter().flat_map(|o| o.sinks).collect(),
        }
    }

    /// Append another destination
    pub fn and(mut self, other: impl Into<Output>) -> Self {
        self.sinks.extend(other.into().sinks);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver one line to every member; a failing or panicking member is
    /// logged and skipped
    pub fn deliver(&self, line: &str) {
        for (i, sink) in self.sinks.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| lock(sink).write_line(line))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Output sink #{} rejected a line: {:#}", i, e),
                Err(payload) => log::error!(
                    "Output sink #{} panicked on a line: {}",
                    i,
                    panic_message(&*payload)
                ),
            }
        }
    }

    /// Flush every member, logging failures
    pub fn flush(&self) {
        for (i, sink) in self.sinks.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| lock(sink).flush())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Output sink #{} failed to flush: {:#}", i, e),
                Err(payload) => log::error!(
                    "Output sink #{} panicked while flushing: {}",
                    i,
                    panic_message(&*payload)
                ),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

impl<S: Sink + 'static> From<S> for Output {
    fn from(sink: S) -> Self {
        Self {
            sinks: vec![Arc::new(Mutex::new(sink))],
        }
    }
}

impl<S: Sink + 'static> From<Shared<S>> for Output {
    fn from(sink: Shared<S>) -> Self {
        Self { sinks: vec![sink] }
    }
}

impl<S: Sink + 'static> From<&Shared<S>> for Output {
    fn from(sink: &Shared<S>) -> Self {
        Self {
            sinks: vec![sink.clone()],
        }
    }
}

impl From<Vec<Output>> for Output {
    fn from(outputs: Vec<Output>) -> Self {
        Self::fanout(outputs)
    }
}

/// Sink backed by a line-consuming closure
///
/// An `Err` from the closure rejects that line only; the fan-out logs it and
/// later lines still arrive.
pub struct Callable<F> {
    f: F,
}

impl<F> Callable<F>
where
    F: FnMut(&str) -> Result<()> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Sink for Callable<F>
where
    F: FnMut(&str) -> Result<()> + Send,
{
    fn write_line(&mut self, line: &str) -> Result<()> {
        (self.f)(line)
    }
}

/// Collects every line; handy for parsing whole outputs after `wait()`
#[derive(Debug, Default, Clone)]
pub struct Lines {
    lines: Vec<String>,
}

impl Lines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// All lines joined with newlines
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl Sink for Lines {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Forwards lines to the `log` facade; the default destination of a command
pub struct LogSink {
    prefix: String,
    level: log::Level,
}

impl LogSink {
    pub fn new(prefix: impl Into<String>, level: log::Level) -> Self {
        Self {
            prefix: prefix.into(),
            level,
        }
    }
}

impl Sink for LogSink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        log::log!(self.level, "{}: {}", self.prefix, line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Sink for Failing {
        fn write_line(&mut self, line: &str) -> Result<()> {
            anyhow::bail!("refusing {:?}", line)
        }
    }

    #[test]
    fn test_fanout_delivers_in_order_past_failures() {
        let first = shared(Lines::new());
        let last = shared(Lines::new());
        let out = Output::fanout([
            Output::from(&first),
            Output::from(Failing),
            Output::from(&last),
        ]);

        out.deliver("a");
        out.deliver("b");

        assert_eq!(out.len(), 3);
        assert_eq!(lock(&first).lines(), ["a", "b"]);
        assert_eq!(lock(&last).lines(), ["a", "b"]);
    }

    #[test]
    fn test_callable_sink_sees_every_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let out = Output::from(Callable::new(move |line: &str| {
            sink_seen.lock().unwrap().push(line.len());
            Ok(())
        }));

        out.deliver("gcc|4:9.3.0");
        out.deliver("cmake|3.16.3");

        assert_eq!(*seen.lock().unwrap(), vec![11, 12]);
    }

    #[test]
    fn test_callable_error_skips_only_that_line() {
        let parsed = Arc::new(Mutex::new(Vec::new()));
        let target = parsed.clone();
        let rest = shared(Lines::new());
        let out = Output::fanout([
            Output::from(Callable::new(move |line: &str| {
                let value = line.parse::<i64>()?;
                target.lock().unwrap().push(value);
                Ok(())
            })),
            Output::from(&rest),
        ]);

        for line in ["1", "two", "3"] {
            out.deliver(line);
        }

        assert_eq!(*parsed.lock().unwrap(), [1, 3]);
        assert_eq!(lock(&rest).lines(), ["1", "two", "3"]);
    }

    #[test]
    fn test_panicking_member_does_not_starve_the_rest() {
        let rest = shared(Lines::new());
        let out = Output::fanout([
            Output::from(Callable::new(|line: &str| {
                if line == "2" {
                    panic!("cannot handle {line}");
                }
                Ok(())
            })),
            Output::from(&rest),
        ]);

        for line in ["1", "2", "3"] {
            out.deliver(line);
        }
        out.flush();

        assert_eq!(lock(&rest).lines(), ["1", "2", "3"]);
    }

    #[test]
    fn test_shared_sink_in_two_outputs() {
        let both = shared(Lines::new());
        let stdout = Output::from(&both);
        let stderr = Output::from(&both);

        stdout.deliver("out");
        stderr.deliver("err");

        assert_eq!(lock(&both).text(), "out\nerr");
    }

    #[test]
    fn test_none_and_and() {
        let lines = shared(Lines::new());
        let out = Output::none().and(&lines);
        assert!(!out.is_empty());
        out.deliver("x");
        assert_eq!(lock(&lines).lines(), ["x"]);
        assert!(Output::none().is_empty());
    }
}
