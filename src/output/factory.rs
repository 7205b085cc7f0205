//! Sink factory - one fresh sink per command, all retrievable afterwards

use super::{shared, Shared, Sink};

/// Builds a new sink on every [`next_sink`](Self::next_sink) and remembers it.
///
/// Iterating the factory yields the produced sinks in creation order, so the
/// Nth sink handed to a command is the Nth one seen during post-processing.
pub struct SinkFactory<S> {
    make: Box<dyn FnMut() -> S + Send>,
    produced: Vec<Shared<S>>,
}

impl<S: Sink + 'static> SinkFactory<S> {
    pub fn new<F>(make: F) -> Self
    where
        F: FnMut() -> S + Send + 'static,
    {
        Self {
            make: Box::new(make),
            produced: Vec::new(),
        }
    }

    /// Build, record and return a fresh shared sink
    pub fn next_sink(&mut self) -> Shared<S> {
        let sink = shared((self.make)());
        self.produced.push(sink.clone());
        sink
    }

    pub fn len(&self) -> usize {
        self.produced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.produced.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Shared<S>> {
        self.produced.iter()
    }
}

impl<S: Sink + Default + 'static> Default for SinkFactory<S> {
    fn default() -> Self {
        Self::new(S::default)
    }
}

impl<'a, S> IntoIterator for &'a SinkFactory<S> {
    type Item = &'a Shared<S>;
    type IntoIter = std::slice::Iter<'a, Shared<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.produced.iter()
    }
}

impl<S> IntoIterator for SinkFactory<S> {
    type Item = Shared<S>;
    type IntoIter = std::vec::IntoIter<Shared<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.produced.into_iter()
    }
}
