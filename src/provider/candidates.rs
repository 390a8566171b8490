//! Ordered candidate probing.

use std::future::Future;

use tracing::debug;

/// An ordered list of alternatives tried one after another.
///
/// Used where an agency serves the same thing from several possible
/// locations and the right one is only known by asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateList<T> {
    candidates: Vec<T>,
}

impl<T> CandidateList<T> {
    /// Creates a list tried in the given order.
    pub fn new(candidates: impl IntoIterator<Item = T>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
        }
    }

    /// The candidates in the order they are tried.
    #[must_use]
    pub fn candidates(&self) -> &[T] {
        &self.candidates
    }

    /// Tries each candidate in order and returns the first hit.
    ///
    /// `attempt` returns `Some` on a hit; later candidates are not tried.
    pub async fn first_match<F, Fut, R>(&self, mut attempt: F) -> Option<(&T, R)>
    where
        F: FnMut(&T) -> Fut,
        Fut: Future<Output = Option<R>>,
    {
        for (index, candidate) in self.candidates.iter().enumerate() {
            if let Some(hit) = attempt(candidate).await {
                debug!(index, "candidate matched");
                return Some((candidate, hit));
            }
        }
        debug!(tried = self.candidates.len(), "no candidate matched");
        None
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test]
    async fn test_first_match_stops_at_first_hit() {
        let list = CandidateList::new([1, 2, 3, 4]);
        let tried = Cell::new(0);
        let hit = list
            .first_match(|n| {
                tried.set(tried.get() + 1);
                let n = *n;
                async move { (n % 2 == 0).then_some(n * 10) }
            })
            .await;
        assert_eq!(hit, Some((&2, 20)));
        assert_eq!(tried.get(), 2);
    }

    #[tokio::test]
    async fn test_first_match_none() {
        let list = CandidateList::new(["a", "b"]);
        let hit = list.first_match(|_| async { None::<()> }).await;
        assert!(hit.is_none());
    }
}
