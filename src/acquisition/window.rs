//! Date windows and chunking policies.

use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate};

/// A closed date interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateWindow {
    /// First day (inclusive).
    pub start: NaiveDate,
    /// Last day (inclusive).
    pub end: NaiveDate,
}

impl DateWindow {
    /// Creates a window. `start` after `end` yields a window that contains nothing.
    #[must_use]
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Whether `date` falls inside the window.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Intersection with `other`, or `None` if they do not overlap.
    #[must_use]
    pub fn intersect(&self, other: &DateWindow) -> Option<DateWindow> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateWindow { start, end })
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// How a requested range is cut into request windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// One request for the whole range.
    None,
    /// Calendar years: the first window ends on 31 December of the start year.
    ByYear,
    /// Consecutive spans of `n` years counted from the start date.
    ByYears(u32),
    /// Calendar months.
    ByMonth,
    /// Consecutive spans of `n` days counted from the start date.
    WindowDays(u32),
    /// One window for the whole range, paged by the endpoint's cursor.
    Cursor {
        /// Upper bound on pages followed.
        max_pages: usize,
    },
}

impl ChunkPolicy {
    /// Splits `[start, end]` into ordered, non-overlapping, gap-free windows,
    /// after clipping the range to `extent` when one is known.
    ///
    /// Returns no windows when the (clipped) range is empty.
    #[must_use]
    pub fn split(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        extent: Option<DateWindow>,
    ) -> Vec<DateWindow> {
        let requested = DateWindow::new(start, end);
        let Some(range) = (match extent {
            Some(extent) => requested.intersect(&extent),
            None => (start <= end).then_some(requested),
        }) else {
            return Vec::new();
        };

        match *self {
            ChunkPolicy::None | ChunkPolicy::Cursor { .. } => vec![range],
            ChunkPolicy::ByYear => step(range, |d| NaiveDate::from_ymd_opt(d.year(), 12, 31)),
            ChunkPolicy::ByYears(n) => {
                let months = Months::new(n.max(1).saturating_mul(12));
                step(range, |d| d.checked_add_months(months)?.pred_opt())
            }
            ChunkPolicy::ByMonth => step(range, |d| {
                d.with_day(1)?
                    .checked_add_months(Months::new(1))?
                    .pred_opt()
            }),
            ChunkPolicy::WindowDays(n) => {
                let span = Days::new(u64::from(n.max(1) - 1));
                step(range, |d| d.checked_add_days(span))
            }
        }
    }

    /// Page cap for cursor policies; 1 otherwise.
    #[must_use]
    pub fn max_pages(&self) -> usize {
        match self {
            ChunkPolicy::Cursor { max_pages } => (*max_pages).max(1),
            _ => 1,
        }
    }
}

/// Walks `range`, ending each window at `last_day_from(window_start)` or the
/// range end, whichever comes first.
fn step(range: DateWindow, last_day_from: impl Fn(NaiveDate) -> Option<NaiveDate>) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    let mut cursor = range.start;
    loop {
        let window_end = last_day_from(cursor).map_or(range.end, |d| d.min(range.end));
        windows.push(DateWindow::new(cursor, window_end));
        match window_end.succ_opt() {
            Some(next) if window_end < range.end => cursor = next,
            _ => break,
        }
    }
    windows
}
