//! Server selection - index, id, slice, predicate and unions thereof
//!
//! Every selector resolves to a list of positions into a server list. A
//! union resolves its members in listed order and keeps the first
//! occurrence of each server.

use super::server::Server;
use crate::error::{DriverError, DriverResult};
use std::fmt;
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};
use std::sync::Arc;

/// Predicate over servers
pub type Predicate = Arc<dyn Fn(&Server) -> bool + Send + Sync>;

/// Python-style slice bounds; negative positions count from the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl Slice {
    pub fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self { start, stop, step }
    }

    /// Positions selected from a sequence of `len` elements
    pub fn indices(&self, len: usize) -> DriverResult<Vec<usize>> {
        if self.step == 0 {
            return Err(DriverError::Selection("slice step cannot be zero".to_string()));
        }
        let len = len as isize;
        let step = self.step;

        let clamp = |bound: isize| -> isize {
            let bound = if bound < 0 { bound + len } else { bound };
            if step > 0 {
                bound.clamp(0, len)
            } else {
                bound.clamp(-1, len - 1)
            }
        };

        let (start, stop) = if step > 0 {
            (
                self.start.map(clamp).unwrap_or(0),
                self.stop.map(clamp).unwrap_or(len),
            )
        } else {
            (
                self.start.map(clamp).unwrap_or(len - 1),
                self.stop.map(clamp).unwrap_or(-1),
            )
        };

        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i = match i.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(out)
    }
}

/// How to pick servers out of a [`ServerList`](super::ServerList)
#[derive(Clone)]
pub enum Selector {
    ByIndex(isize),
    ById(String),
    BySlice(Slice),
    ByPredicate(Predicate),
    Union(Vec<Selector>),
}

impl Selector {
    pub fn index(index: isize) -> Self {
        Self::ByIndex(index)
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self::ById(id.into())
    }

    pub fn slice(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self::BySlice(Slice::new(start, stop, step))
    }

    /// Every server, last to first
    pub fn reversed() -> Self {
        Self::slice(None, None, -1)
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Server) -> bool + Send + Sync + 'static,
    {
        Self::ByPredicate(Arc::new(f))
    }

    pub fn union<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selector>,
    {
        Self::Union(members.into_iter().map(Into::into).collect())
    }

    /// Resolve to positions in `servers`, in selection order, without duplicates
    pub fn resolve(&self, servers: &[Server]) -> DriverResult<Vec<usize>> {
        match self {
            Self::ByIndex(index) => Ok(vec![resolve_index(*index, servers.len())?]),
            Self::ById(id) => servers
                .iter()
                .position(|s| s.id() == id)
                .map(|pos| vec![pos])
                .ok_or_else(|| DriverError::UnknownServer(id.clone())),
            Self::BySlice(slice) => slice.indices(servers.len()),
            Self::ByPredicate(pred) => Ok(servers
                .iter()
                .enumerate()
                .filter(|(_, s)| pred(s))
                .map(|(i, _)| i)
                .collect()),
            Self::Union(members) => {
                let mut out: Vec<usize> = Vec::new();
                for member in members {
                    for pos in member.resolve(servers)? {
                        if !out.contains(&pos) {
                            out.push(pos);
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Absolute position of `index`; negative indices count from the end
pub fn resolve_index(index: isize, len: usize) -> DriverResult<usize> {
    let absolute = if index < 0 { index + len as isize } else { index };
    if absolute < 0 || absolute >= len as isize {
        return Err(DriverError::IndexOutOfRange { index, len });
    }
    Ok(absolute as usize)
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByIndex(i) => f.debug_tuple("ByIndex").field(i).finish(),
            Self::ById(id) => f.debug_tuple("ById").field(id).finish(),
            Self::BySlice(s) => f.debug_tuple("BySlice").field(s).finish(),
            Self::ByPredicate(_) => f.write_str("ByPredicate(..)"),
            Self::Union(members) => f.debug_tuple("Union").field(members).finish(),
        }
    }
}

impl From<usize> for Selector {
    fn from(index: usize) -> Self {
        Self::ByIndex(index as isize)
    }
}

impl From<isize> for Selector {
    fn from(index: isize) -> Self {
        Self::ByIndex(index)
    }
}

impl From<&str> for Selector {
    fn from(id: &str) -> Self {
        Self::ById(id.to_string())
    }
}

impl From<String> for Selector {
    fn from(id: String) -> Self {
        Self::ById(id)
    }
}

impl From<Slice> for Selector {
    fn from(slice: Slice) -> Self {
        Self::BySlice(slice)
    }
}

impl From<Range<usize>> for Selector {
    fn from(r: Range<usize>) -> Self {
        Self::slice(Some(r.start as isize), Some(r.end as isize), 1)
    }
}

impl From<RangeFrom<usize>> for Selector {
    fn from(r: RangeFrom<usize>) -> Self {
        Self::slice(Some(r.start as isize), None, 1)
    }
}

impl From<RangeTo<usize>> for Selector {
    fn from(r: RangeTo<usize>) -> Self {
        Self::slice(None, Some(r.end as isize), 1)
    }
}

impl From<RangeFull> for Selector {
    fn from(_: RangeFull) -> Self {
        Self::slice(None, None, 1)
    }
}

impl From<Vec<Selector>> for Selector {
    fn from(members: Vec<Selector>) -> Self {
        Self::Union(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<Server> {
        (1..=n)
            .map(|i| Server::new(format!("node0{}", i), "127.0.0.1", 20000))
            .collect()
    }

    fn ids(servers: &[Server], positions: &[usize]) -> Vec<String> {
        positions.iter().map(|&p| servers[p].id().to_string()).collect()
    }

    #[test]
    fn test_slice_matches_python() {
        let s = |start, stop, step| Slice::new(start, stop, step).indices(5).unwrap();
        assert_eq!(s(Some(1), Some(3), 1), vec![1, 2]);
        assert_eq!(s(None, None, -1), vec![4, 3, 2, 1, 0]);
        assert_eq!(s(None, None, 2), vec![0, 2, 4]);
        assert_eq!(s(Some(-2), None, 1), vec![3, 4]);
        assert_eq!(s(None, Some(1), 1), vec![0]);
        assert_eq!(s(Some(3), Some(0), -1), vec![3, 2, 1]);
        assert_eq!(s(Some(10), None, -2), vec![4, 2, 0]);
        assert_eq!(s(Some(3), Some(1), 1), Vec::<usize>::new());
        assert_eq!(s(Some(-10), Some(10), 1), vec![0, 1, 2, 3, 4]);
        assert_eq!(s(Some(1), None, isize::MAX), vec![1]);
        assert_eq!(s(Some(3), None, isize::MIN), vec![3]);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(Slice::new(None, None, 0).indices(3).is_err());
    }

    #[test]
    fn test_index_and_negative_index() {
        let servers = nodes(3);
        assert_eq!(Selector::index(0).resolve(&servers).unwrap(), vec![0]);
        assert_eq!(Selector::index(-1).resolve(&servers).unwrap(), vec![2]);
        assert!(matches!(
            Selector::index(3).resolve(&servers),
            Err(DriverError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_unknown_id() {
        let servers = nodes(2);
        assert!(matches!(
            Selector::id("node09").resolve(&servers),
            Err(DriverError::UnknownServer(_))
        ));
    }

    #[test]
    fn test_predicate_keeps_list_order() {
        let servers = nodes(5);
        let sel = Selector::predicate(|s| s.id() >= "node03");
        assert_eq!(
            ids(&servers, &sel.resolve(&servers).unwrap()),
            ["node03", "node04", "node05"]
        );
    }

    #[test]
    fn test_union_in_listed_order_first_occurrence_wins() {
        let servers = nodes(5);
        let sel = Selector::union([
            Selector::id("node04"),
            Selector::index(2),
            Selector::predicate(|s| s.id() == "node01"),
            Selector::id("node03"),
            Selector::index(3),
        ]);
        assert_eq!(
            ids(&servers, &sel.resolve(&servers).unwrap()),
            ["node04", "node03", "node01"]
        );
    }

    #[test]
    fn test_union_propagates_member_errors() {
        let servers = nodes(2);
        let sel = Selector::union([Selector::index(0), Selector::id("missing")]);
        assert!(sel.resolve(&servers).is_err());
    }

    #[test]
    fn test_range_conversions() {
        let servers = nodes(4);
        assert_eq!(Selector::from(1usize..3).resolve(&servers).unwrap(), vec![1, 2]);
        assert_eq!(Selector::from(..2usize).resolve(&servers).unwrap(), vec![0, 1]);
        assert_eq!(Selector::from(2usize..).resolve(&servers).unwrap(), vec![2, 3]);
        assert_eq!(Selector::from(..).resolve(&servers).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            Selector::reversed().resolve(&servers).unwrap(),
            vec![3, 2, 1, 0]
        );
    }
}
